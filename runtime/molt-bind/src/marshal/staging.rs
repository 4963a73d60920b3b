use std::mem::{self, ManuallyDrop};
use std::ptr;

use super::StagingLayout;

type SlotDrop = unsafe fn(*mut u8);

unsafe fn drop_slot<T>(slot: *mut u8) {
    drop(unsafe { ptr::read_unaligned(slot.cast::<T>()) });
}

/// Scratch for one call's arguments, laid out by a [`StagingLayout`].
/// Slots still holding a value on drop are released in declared order.
pub struct StagingBuffer<'l> {
    layout: &'l StagingLayout,
    bytes: Vec<u8>,
    drops: Vec<Option<SlotDrop>>,
}

/// Puts a slot value back even if the closure borrowing it unwinds.
struct WriteBack<T> {
    slot: *mut T,
    value: ManuallyDrop<T>,
}

impl<T> Drop for WriteBack<T> {
    fn drop(&mut self) {
        unsafe { ptr::write_unaligned(self.slot, ManuallyDrop::take(&mut self.value)) };
    }
}

impl<'l> StagingBuffer<'l> {
    pub fn new(layout: &'l StagingLayout) -> Self {
        Self {
            layout,
            bytes: vec![0; layout.total()],
            drops: vec![None; layout.len()],
        }
    }

    pub fn layout(&self) -> &StagingLayout {
        self.layout
    }

    fn slot_ptr(&mut self, index: usize) -> *mut u8 {
        let offset = self.layout.offset(index);
        unsafe { self.bytes.as_mut_ptr().add(offset) }
    }

    pub fn is_occupied(&self, index: usize) -> bool {
        self.drops[index].is_some()
    }

    /// Moves `value` into slot `index`. With `release == false` the value is
    /// never dropped by the buffer.
    ///
    /// # Safety
    /// The slot must be `size_of::<T>()` bytes and must not hold a value
    /// that still needs dropping.
    pub unsafe fn write<T>(&mut self, index: usize, value: T, release: bool) {
        debug_assert_eq!(self.layout.size(index), size_of::<T>());
        let slot = self.slot_ptr(index);
        unsafe { ptr::write_unaligned(slot.cast::<T>(), value) };
        self.drops[index] = (release && mem::needs_drop::<T>()).then_some(drop_slot::<T> as SlotDrop);
    }

    /// Moves the value out of slot `index`.
    ///
    /// # Safety
    /// Slot `index` must hold an initialised `T` that was not read before.
    pub unsafe fn read<T>(&mut self, index: usize) -> T {
        debug_assert_eq!(self.layout.size(index), size_of::<T>());
        self.drops[index] = None;
        let slot = self.slot_ptr(index);
        unsafe { ptr::read_unaligned(slot.cast::<T>()) }
    }

    /// Runs `f` on the value in slot `index` in place.
    ///
    /// # Safety
    /// As for [`read`](Self::read).
    pub unsafe fn with_slot<T, R>(&mut self, index: usize, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = self.slot_ptr(index).cast::<T>();
        let mut guard = WriteBack {
            slot,
            value: ManuallyDrop::new(unsafe { ptr::read_unaligned(slot) }),
        };
        f(&mut guard.value)
    }
}

impl Drop for StagingBuffer<'_> {
    fn drop(&mut self) {
        for index in 0..self.drops.len() {
            if let Some(release) = self.drops[index].take() {
                let slot = self.slot_ptr(index);
                unsafe { release(slot) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Tracked(u8, Rc<RefCell<Vec<u8>>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.1.borrow_mut().push(self.0);
        }
    }

    #[test]
    fn test_unread_slots_drop_in_declared_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let size = size_of::<Tracked>();
        let layout = StagingLayout::compute(&[size, size, size]);
        {
            let mut buffer = StagingBuffer::new(&layout);
            unsafe {
                buffer.write(2, Tracked(2, log.clone()), true);
                buffer.write(0, Tracked(0, log.clone()), true);
                buffer.write(1, Tracked(1, log.clone()), true);
                let taken: Tracked = buffer.read(1);
                assert_eq!(taken.0, 1);
            }
        }
        assert_eq!(*log.borrow(), vec![1, 0, 2]);
    }

    #[test]
    fn test_unreleased_slots_are_skipped() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let layout = StagingLayout::compute(&[size_of::<Tracked>()]);
        let kept = {
            let mut buffer = StagingBuffer::new(&layout);
            unsafe { buffer.write(0, Tracked(9, log.clone()), false) };
            assert!(!buffer.is_occupied(0));
            unsafe { buffer.read::<Tracked>(0) }
        };
        assert!(log.borrow().is_empty());
        drop(kept);
        assert_eq!(*log.borrow(), vec![9]);
    }

    #[test]
    fn test_with_slot_mutates_in_place() {
        let layout = StagingLayout::compute(&[1, size_of::<String>()]);
        let mut buffer = StagingBuffer::new(&layout);
        unsafe {
            buffer.write(0, 7u8, true);
            buffer.write(1, String::from("ab"), true);
            let taken = buffer.with_slot(1, |text: &mut String| mem::take(text));
            assert_eq!(taken, "ab");
            assert_eq!(buffer.read::<String>(1), "");
            assert_eq!(buffer.read::<u8>(0), 7);
        }
    }
}
