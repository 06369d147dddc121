//! Per-thread signal masking.
//!
//! Changing the mask of the calling thread to a valid set can't fail, so the
//! results are unwrapped.

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

/// Blocks every signal and returns the previous mask.
pub fn block_all() -> SigSet {
    let mut old = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), Some(&mut old)).unwrap();
    old
}

pub fn restore(mask: &SigSet) {
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(mask), None).unwrap();
}

pub fn unblock_all() {
    restore(&SigSet::empty());
}

/// Blocks all signals until dropped, then restores the previous mask.
#[must_use]
pub struct SignalsBlocked {
    saved: SigSet,
}

impl SignalsBlocked {
    pub fn new() -> Self {
        Self { saved: block_all() }
    }
}

impl Drop for SignalsBlocked {
    fn drop(&mut self) {
        restore(&self.saved);
    }
}

/// The calling thread's current mask.
#[cfg(test)]
pub fn current() -> SigSet {
    SigSet::thread_get_mask().unwrap()
}

#[cfg(test)]
mod test {
    use nix::sys::signal::Signal;

    use super::*;

    #[test]
    fn test_nested_guards() {
        // Runs on its own thread; nothing else touches this mask.
        unblock_all();
        {
            let _outer = SignalsBlocked::new();
            assert!(current().contains(Signal::SIGUSR1));
            {
                let _inner = SignalsBlocked::new();
                assert!(current().contains(Signal::SIGUSR1));
            }
            // Still blocked: the inner guard restores the outer's mask.
            assert!(current().contains(Signal::SIGUSR1));
        }
        assert!(!current().contains(Signal::SIGUSR1));
    }
}
