use std::{
    any::Any,
    cell::UnsafeCell,
    mem::{needs_drop, MaybeUninit},
    sync::atomic::{AtomicU8, Ordering},
};

// -----------------------------------------------------------------------------
// Call on drop guard

// Runs the wrapped closure when dropped. Used to post a worker's exit status
// no matter how its main loop ends.
pub struct CallOnDrop<F: FnMut()>(pub F);

impl<F: FnMut()> Drop for CallOnDrop<F> {
    fn drop(&mut self) {
        (self.0)();
    }
}

// -----------------------------------------------------------------------------
// Slot

/// A write-once, take-once cell used to hand a task outcome from the worker
/// that produced it to the thread that waits on it.
///
/// A slot starts empty. `put` succeeds exactly once; later calls hand the
/// value back. `take` succeeds once after a successful `put`. Neither
/// operation blocks or spins, readers are expected to wait on a latch first.
pub struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    state: AtomicU8,
}

// Nothing has been written yet.
const EMPTY: u8 = 0;

// A `put` or `take` currently owns the cell.
const BUSY: u8 = 1;

// A value is present and may be taken.
const FULL: u8 = 2;

// The value was taken; the slot will never be filled again.
const SPENT: u8 = 3;

impl<T> Slot<T> {
    /// Creates an empty slot.
    pub const fn empty() -> Slot<T> {
        Slot {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            state: AtomicU8::new(EMPTY),
        }
    }

    /// Stores `value`. Fails, returning the value, if the slot was ever filled.
    pub fn put(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        // SAFETY: The `BUSY` state gives us exclusive access to the cell.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(FULL, Ordering::Release);
        Ok(())
    }

    /// Removes the stored value, if one is present.
    pub fn take(&self) -> Option<T> {
        self.state
            .compare_exchange(FULL, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        // SAFETY: The state was `FULL`, so the value is initialized, and the
        // `BUSY` state gives us exclusive access to it.
        let value = unsafe { (*self.value.get()).assume_init_read() };
        self.state.store(SPENT, Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if needs_drop::<T>() && *self.state.get_mut() == FULL {
            // SAFETY: `FULL` means the value was written and never read out.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

// SAFETY: The slot owns at most one `T`, so it can move between threads
// whenever `T` can.
unsafe impl<T: Send> Send for Slot<T> {}

// SAFETY: Shared access only ever moves a `T` in or out under the state
// machine above, so `&Slot<T>` is safe to share when `T` is `Send`.
unsafe impl<T: Send> Sync for Slot<T> {}

// -----------------------------------------------------------------------------
// Panic payloads

/// Renders the payload of a caught panic as text.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn slot_hands_over_once() {
        let slot = Slot::empty();
        assert!(slot.take().is_none());
        assert_eq!(slot.put(7), Ok(()));
        assert_eq!(slot.put(8), Err(8));
        assert_eq!(slot.take(), Some(7));
        assert_eq!(slot.take(), None);
        assert_eq!(slot.put(9), Err(9));
    }

    #[test]
    fn slot_drops_unread_value() {
        let value = Arc::new(());
        let slot = Slot::empty();
        assert!(slot.put(Arc::clone(&value)).is_ok());
        assert_eq!(Arc::strong_count(&value), 2);
        drop(slot);
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn call_on_drop_runs() {
        let mut hits = 0;
        {
            let _guard = CallOnDrop(|| hits += 1);
        }
        assert_eq!(hits, 1);
    }

    #[test]
    fn panic_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
