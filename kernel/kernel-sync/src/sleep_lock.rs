use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

/// A long mutual-exclusion lock that may be held across blocking I/O.
///
/// Unlike [`SpinLock`](crate::SpinLock), a contended caller *parks* (yields
/// its CPU) and is woken when the holder releases; the hosted condition
/// variable stands in for the scheduler's sleep/wakeup channel. Hold this
/// lock for as long as an operation needs the protected data — including
/// across a synchronous disk read — but never while holding a spin lock.
pub struct SleepLock<T> {
    name: &'static str,
    state: Mutex<SleepState>,
    wake: Condvar,
    cell: UnsafeCell<T>,
}

struct SleepState {
    locked: bool,
    /// Holder identity, for [`SleepLock::holding`] assertions.
    owner: Option<ThreadId>,
}

// Safety: mutual exclusion over `cell`; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    #[must_use]
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            state: Mutex::new(SleepState {
                locked: false,
                owner: None,
            }),
            wake: Condvar::new(),
            cell: UnsafeCell::new(value),
        }
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire, parking the calling context while the lock is held elsewhere.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut state = self.state.lock().expect("sleep lock state poisoned");
        while state.locked {
            state = self.wake.wait(state).expect("sleep lock state poisoned");
        }
        state.locked = true;
        state.owner = Some(thread::current().id());
        drop(state);
        SleepLockGuard { lock: self }
    }

    /// Does the calling context hold this lock?
    #[must_use]
    pub fn holding(&self) -> bool {
        let state = self.state.lock().expect("sleep lock state poisoned");
        state.locked && state.owner == Some(thread::current().id())
    }

    /// Raw pointer to the protected value.
    ///
    /// The buffer cache installs slot buffers directly into page tables, so
    /// the address must be observable without taking the lock. Dereferencing
    /// is only sound under this lock or under the owner's pin protocol.
    #[inline]
    #[must_use]
    pub const fn data_ptr(&self) -> *mut T {
        self.cell.get()
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.cell.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().expect("sleep lock state poisoned");
        state.locked = false;
        state.owner = None;
        drop(state);
        self.lock.wake.notify_one();
    }
}
