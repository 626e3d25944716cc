//! Single-slot blocking hand-off between the control loop and a PAM worker.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

/// A one-element mailbox. The receiver blocks in [`Handoff::take`] until a
/// value is put or the mailbox is closed.
#[derive(Debug)]
pub(crate) struct Handoff<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Handoff<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value` if the slot is empty and open; hands it back otherwise.
    pub(crate) fn put(&self, value: T) -> Result<(), T> {
        let mut slot = self.lock();
        if slot.closed || slot.value.is_some() {
            return Err(value);
        }
        slot.value = Some(value);
        self.ready.notify_one();
        Ok(())
    }

    /// Stores `value`, discarding anything not yet taken.
    pub(crate) fn replace(&self, value: T) {
        let mut slot = self.lock();
        if slot.closed {
            return;
        }
        slot.value = Some(value);
        self.ready.notify_one();
    }

    /// Blocks until a value arrives; `None` once closed.
    pub(crate) fn take(&self) -> Option<T> {
        let mut slot = self.lock();
        loop {
            if slot.closed {
                return None;
            }
            if let Some(value) = slot.value.take() {
                return Some(value);
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes every waiter; all later `take` calls return `None`.
    pub(crate) fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        slot.value = None;
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_put_then_take() {
        let handoff = Handoff::new();
        handoff.put(7).unwrap();
        assert_eq!(handoff.put(8), Err(8));
        assert_eq!(handoff.take(), Some(7));
    }

    #[test]
    fn test_take_blocks_until_put() {
        let handoff = Arc::new(Handoff::new());
        let worker = {
            let handoff = Arc::clone(&handoff);
            thread::spawn(move || handoff.take())
        };
        handoff.put("answer").unwrap();
        assert_eq!(worker.join().unwrap(), Some("answer"));
    }

    #[test]
    fn test_close_wakes_waiter() {
        let handoff: Arc<Handoff<u8>> = Arc::new(Handoff::new());
        let worker = {
            let handoff = Arc::clone(&handoff);
            thread::spawn(move || handoff.take())
        };
        handoff.close();
        assert_eq!(worker.join().unwrap(), None);
        assert_eq!(handoff.put(1), Err(1));
    }

    #[test]
    fn test_replace_overwrites() {
        let handoff = Handoff::new();
        handoff.put(1).unwrap();
        handoff.replace(2);
        assert_eq!(handoff.take(), Some(2));
    }
}
