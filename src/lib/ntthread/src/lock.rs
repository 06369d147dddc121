use std::cell::{Cell, Ref, RefCell, RefMut};
use std::mem::ManuallyDrop;

use nix::sys::signal::SigSet;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::sigmask;

/// The process lock: re-entrant, and held only with all signals blocked.
///
/// Signals are blocked *before* the lock is taken, so a signal handler running
/// on a thread that holds, or is about to hold, the lock never runs while it
/// does. The thread's original mask comes back when the outermost guard is
/// dropped.
///
/// Re-entrant acquisition is allowed, re-entrant *borrowing* is not: nested
/// holders must not keep a [`RefMut`] from an outer guard alive.
pub struct ProcessLock<T> {
    inner: ReentrantMutex<LockState<T>>,
}

struct LockState<T> {
    depth: Cell<u32>,
    /// The owner's mask from before its outermost acquisition.
    saved_mask: Cell<Option<SigSet>>,
    data: RefCell<T>,
}

impl<T> ProcessLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            inner: ReentrantMutex::new(LockState {
                depth: Cell::new(0),
                saved_mask: Cell::new(None),
                data: RefCell::new(data),
            }),
        }
    }

    pub fn lock(&self) -> ProcessLockGuard<'_, T> {
        let mask = sigmask::block_all();
        let inner = self.inner.lock();
        let depth = inner.depth.get();
        if depth == 0 {
            inner.saved_mask.set(Some(mask));
        }
        inner.depth.set(depth + 1);
        ProcessLockGuard {
            inner: ManuallyDrop::new(inner),
        }
    }
}

pub struct ProcessLockGuard<'a, T> {
    inner: ManuallyDrop<ReentrantMutexGuard<'a, LockState<T>>>,
}

impl<T> ProcessLockGuard<'_, T> {
    pub fn borrow(&self) -> Ref<'_, T> {
        self.inner.data.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.inner.data.borrow_mut()
    }
}

impl<T> Drop for ProcessLockGuard<'_, T> {
    fn drop(&mut self) {
        let depth = self.inner.depth.get() - 1;
        self.inner.depth.set(depth);
        let mask = if depth == 0 {
            self.inner.saved_mask.take()
        } else {
            None
        };
        // SAFETY: `inner` isn't used again.
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        // Unblock only once the lock is released.
        if let Some(mask) = mask {
            sigmask::restore(&mask);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use nix::sys::signal::Signal;

    use super::*;

    #[test]
    fn test_reentrant_mask_restore() {
        sigmask::unblock_all();
        let lock = ProcessLock::new(0u32);
        {
            let outer = lock.lock();
            *outer.borrow_mut() += 1;
            {
                let inner = lock.lock();
                *inner.borrow_mut() += 1;
                assert!(sigmask::current().contains(Signal::SIGUSR1));
            }
            // Inner release leaves signals blocked.
            assert!(sigmask::current().contains(Signal::SIGUSR1));
            assert_eq!(*outer.borrow(), 2);
        }
        assert!(!sigmask::current().contains(Signal::SIGUSR1));
    }

    #[test]
    fn test_preserves_blocked_signals() {
        let mut only_usr2 = SigSet::empty();
        only_usr2.add(Signal::SIGUSR2);
        sigmask::restore(&only_usr2);
        {
            let lock = ProcessLock::new(());
            let _guard = lock.lock();
            assert!(sigmask::current().contains(Signal::SIGUSR1));
        }
        let mask = sigmask::current();
        assert!(mask.contains(Signal::SIGUSR2));
        assert!(!mask.contains(Signal::SIGUSR1));
        sigmask::unblock_all();
    }

    #[test]
    fn test_mutual_exclusion() {
        let lock = Arc::new(ProcessLock::new(0u64));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let guard = lock.lock();
                        let v = *guard.borrow();
                        *guard.borrow_mut() = v + 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*lock.lock().borrow(), 4000);
    }
}
