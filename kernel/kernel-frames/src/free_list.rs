use core::ptr;

/// Link node stored *inside* a free frame.
///
/// A frame on the free list is unused by definition, so its first bytes are
/// repurposed as the list link. No per-frame bookkeeping is allocated
/// anywhere else.
struct FreeNode {
    next: *mut FreeNode,
}

/// Singly-linked stack of free frames.
///
/// Pure pointer plumbing; all policy (fill patterns, share counts, which CPU
/// owns which list) lives in the allocator. The length is tracked alongside
/// the head so accounting never has to walk the list.
pub(crate) struct FreeList {
    head: *mut FreeNode,
    len: usize,
}

// Safety: every node points into a frame this list exclusively owns, and the
// allocator only touches a list under its spin lock.
unsafe impl Send for FreeList {}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Push a frame onto the front of the list.
    ///
    /// # Safety
    /// `frame` must point to page-sized memory the caller exclusively owns
    /// and hands over to this list; it must stay valid until popped.
    pub(crate) unsafe fn push(&mut self, frame: *mut u8) {
        let node = frame.cast::<FreeNode>();
        // Safety: per contract, the frame is ours and large enough.
        unsafe { node.write(FreeNode { next: self.head }) };
        self.head = node;
        self.len += 1;
    }

    /// Pop the most recently pushed frame, if any.
    pub(crate) fn pop(&mut self) -> Option<*mut u8> {
        if self.head.is_null() {
            return None;
        }
        let node = self.head;
        // Safety: `head` is a live node owned by this list.
        self.head = unsafe { (*node).next };
        self.len -= 1;
        Some(node.cast())
    }

    /// Detach the front half of the list (the larger half when `len` is odd)
    /// and return it as a new list.
    ///
    /// The midpoint is found with a fast/slow pointer pair so a single walk
    /// suffices. Used by the allocator to steal from a donor CPU in one
    /// critical section instead of popping frames one by one.
    pub(crate) fn take_front_half(&mut self) -> Self {
        if self.head.is_null() {
            return Self::new();
        }

        // Safety (whole block): every pointer chased below is either `head`
        // or a `next` field of a node still linked into this list.
        let mut slow = self.head;
        let mut fast = unsafe { (*slow).next };
        while !fast.is_null() {
            fast = unsafe { (*fast).next };
            if !fast.is_null() {
                slow = unsafe { (*slow).next };
                fast = unsafe { (*fast).next };
            }
        }

        // `slow` is the tail of the front half; cut the list there.
        let taken = Self {
            head: self.head,
            len: self.len.div_ceil(2),
        };
        self.head = unsafe { (*slow).next };
        unsafe { (*slow).next = ptr::null_mut() };
        self.len -= taken.len;
        taken
    }

    /// Prepend all of `other`'s frames to this list.
    pub(crate) fn prepend(&mut self, other: Self) {
        if other.head.is_null() {
            return;
        }
        if self.head.is_null() {
            *self = other;
            return;
        }

        // Walk to other's tail and splice.
        let mut tail = other.head;
        // Safety: `tail` stays within other's linked nodes.
        unsafe {
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
            (*tail).next = self.head;
        }
        self.head = other.head;
        self.len += other.len;
    }
}
