use core::fmt;

use crate::slot::BlockData;

/// Device number a block lives on.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct DeviceId(pub u32);

/// Block number within a device.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct BlockNo(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}", self.0)
    }
}

/// A transfer the device could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("i/o error on {dev}, {block}")]
pub struct DeviceError {
    pub dev: DeviceId,
    pub block: BlockNo,
}

/// Synchronous block transport under the cache.
///
/// Calls block the calling context until the transfer completes; the cache
/// guarantees it holds no spin lock across them (only the slot's sleep
/// lock). One implementation may serve several device numbers.
pub trait BlockDevice {
    /// Fill `data` with the named block.
    ///
    /// # Errors
    /// [`DeviceError`] if the transfer fails; the slot stays invalid.
    fn read(&self, dev: DeviceId, block: BlockNo, data: &mut BlockData) -> Result<(), DeviceError>;

    /// Persist `data` as the named block.
    ///
    /// # Errors
    /// [`DeviceError`] if the transfer fails.
    fn write(&self, dev: DeviceId, block: BlockNo, data: &BlockData) -> Result<(), DeviceError>;
}
