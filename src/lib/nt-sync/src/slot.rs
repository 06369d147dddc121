use core::fmt::Display;
use core::mem::MaybeUninit;

use crate::sync::{self, AtomicU32, Ordering, UnsafeCell};

// Layout of the state word: low byte is the slot phase, plus the flag bits.
const PHASE_MASK: u32 = 0xff;
const WRITER_CLOSED: u32 = 1 << 8;
const HAS_SLEEPER: u32 = 1 << 9;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
enum Phase {
    Empty = 0,
    Writing = 1,
    Full = 2,
    Reading = 3,
}

impl Phase {
    fn of(word: u32) -> Phase {
        match word & PHASE_MASK {
            0 => Phase::Empty,
            1 => Phase::Writing,
            2 => Phase::Full,
            3 => Phase::Reading,
            other => panic!("corrupt slot phase {other}"),
        }
    }

    fn replace_in(self, word: u32) -> u32 {
        (word & !PHASE_MASK) | self as u32
    }
}

/// Returned by [`SlotChannel::receive`] once the writer has closed and no
/// message is left.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WriterClosed;

impl Display for WriterClosed {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("writer closed")
    }
}

impl core::error::Error for WriterClosed {}

/// A single-slot, single-producer single-consumer channel.
///
/// The whole channel is one atomic word plus the message storage, so it can
/// be embedded anywhere and used from signal handlers. Blocking uses raw
/// futex syscalls.
///
/// Contract, enforced by panics:
/// * at most one `send` and one `receive` in flight at a time;
/// * never `send` while a message is still pending.
///
/// A request/reply protocol over a pair of these satisfies both naturally.
pub struct SlotChannel<T> {
    message: UnsafeCell<MaybeUninit<T>>,
    state: AtomicU32,
}

impl<T> SlotChannel<T> {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            message: UnsafeCell::new(MaybeUninit::uninit()),
            state: AtomicU32::new(Phase::Empty as u32),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            message: UnsafeCell::new(MaybeUninit::uninit()),
            state: AtomicU32::new(Phase::Empty as u32),
        }
    }

    /// Moves the phase from `from` to `to`, preserving flag bits. Returns the
    /// previous word.
    fn transition(&self, from: Phase, to: Phase, order: Ordering) -> u32 {
        let prev = self
            .state
            .fetch_update(order, Ordering::Relaxed, |word| {
                assert_eq!(Phase::of(word), from, "slot channel misuse");
                Some(to.replace_in(word))
            });
        match prev {
            Ok(word) => word,
            // The closure never returns `None`.
            Err(word) => word,
        }
    }

    fn wake_if_sleeping(&self, prev: u32) {
        if prev & HAS_SLEEPER != 0 {
            // Waking can only fail for an invalid address.
            let _ = sync::futex_wake_all(&self.state);
        }
    }

    /// Places `message` in the slot and wakes the receiver.
    ///
    /// Panics if a message is already pending. Sending after
    /// [`close_writer`](Self::close_writer) is allowed; the message is still
    /// received.
    pub fn send(&self, message: T) {
        self.transition(Phase::Empty, Phase::Writing, Ordering::Acquire);
        self.message.with_mut(|slot| unsafe { (*slot).as_mut_ptr().write(message) });
        let prev = self.transition(Phase::Writing, Phase::Full, Ordering::Release);
        self.wake_if_sleeping(prev);
    }

    /// Blocks until a message arrives, or until the writer is closed with the
    /// slot empty.
    pub fn receive(&self) -> Result<T, WriterClosed> {
        let mut word = self.state.load(Ordering::Relaxed);
        loop {
            match Phase::of(word) {
                Phase::Full => break,
                Phase::Reading => panic!("concurrent receive on slot channel"),
                Phase::Empty | Phase::Writing => (),
            }
            if word & WRITER_CLOSED != 0 && Phase::of(word) == Phase::Empty {
                return Err(WriterClosed);
            }
            let sleeping = word | HAS_SLEEPER;
            if word != sleeping {
                if let Err(actual) = self.state.compare_exchange(
                    word,
                    sleeping,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    word = actual;
                    continue;
                }
            }
            match sync::futex_wait(&self.state, sleeping) {
                Ok(()) | Err(rustix::io::Errno::INTR) | Err(rustix::io::Errno::AGAIN) => (),
                Err(e) => panic!("unexpected futex error {e:?}"),
            }
            word = self.state.load(Ordering::Relaxed);
        }

        let prev = self
            .state
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |word| {
                assert_eq!(Phase::of(word), Phase::Full, "slot channel misuse");
                Some(Phase::Reading.replace_in(word) & !HAS_SLEEPER)
            });
        debug_assert!(prev.is_ok());
        let message = self.message.with(|slot| unsafe { (*slot).assume_init_read() });
        self.transition(Phase::Reading, Phase::Empty, Ordering::Release);
        Ok(message)
    }

    /// Marks the writer as gone. A receiver blocked on an empty slot returns
    /// [`WriterClosed`]; a pending message is still delivered first.
    pub fn close_writer(&self) {
        let prev = self.state.fetch_or(WRITER_CLOSED, Ordering::Release);
        self.wake_if_sleeping(prev);
    }

    pub fn is_writer_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & WRITER_CLOSED != 0
    }
}

// SAFETY: the message is only ever accessed by the side that currently owns the
// slot phase, and ownership is handed over with acquire/release transitions.
unsafe impl<T> Send for SlotChannel<T> where T: Send {}
unsafe impl<T> Sync for SlotChannel<T> where T: Send {}

impl<T> Drop for SlotChannel<T> {
    fn drop(&mut self) {
        if Phase::of(self.state.load(Ordering::Acquire)) == Phase::Full {
            self.message
                .with_mut(|slot| unsafe { (*slot).assume_init_drop() });
        }
    }
}

impl<T> Default for SlotChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}
