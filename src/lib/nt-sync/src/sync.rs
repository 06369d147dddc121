//! Atomics, cells and futex operations, swapped for their loom models under
//! `cfg(loom)`.

#[cfg(not(loom))]
pub use core::sync::atomic::{AtomicU32, Ordering};
#[cfg(loom)]
pub use loom::sync::atomic::{AtomicU32, Ordering};

#[cfg(loom)]
use loom::sync::{Arc, Condvar, Mutex};
#[cfg(loom)]
use std::collections::HashMap;

#[cfg(loom)]
loom::lazy_static! {
    // Keyed by the futex word's address. Only models futexes within a single
    // address space, which is all the session transport needs.
    static ref FUTEXES: Mutex<HashMap<usize, Arc<Condvar>>> = Mutex::new(HashMap::new());
}

/// Blocks while `*word == expected`. May return spuriously.
///
/// `Err(AGAIN)` means the word had already changed; `Err(INTR)` means a signal
/// handler ran. Callers re-check their condition in both cases.
pub fn futex_wait(word: &AtomicU32, expected: u32) -> rustix::io::Result<()> {
    #[cfg(not(loom))]
    {
        unsafe {
            rustix::thread::futex(
                word.as_ptr(),
                rustix::thread::FutexOperation::Wait,
                rustix::thread::FutexFlags::empty(),
                expected,
                core::ptr::null(),
                core::ptr::null_mut(),
                0u32,
            )
        }
        .map(|_| ())
    }
    #[cfg(loom)]
    {
        // Holding the table lock across the compare and the sleep models the
        // kernel's atomic check-and-sleep.
        let mut table = FUTEXES.lock().unwrap();
        if word.load(Ordering::Relaxed) != expected {
            return Err(rustix::io::Errno::AGAIN);
        }
        let condvar = table
            .entry(word as *const _ as usize)
            .or_insert_with(|| Arc::new(Condvar::new()))
            .clone();
        table = condvar.wait(table).unwrap();
        drop(table);
        Ok(())
    }
}

/// Wakes every waiter on `word`.
pub fn futex_wake_all(word: &AtomicU32) -> rustix::io::Result<()> {
    #[cfg(not(loom))]
    {
        unsafe {
            rustix::thread::futex(
                word.as_ptr(),
                rustix::thread::FutexOperation::Wake,
                rustix::thread::FutexFlags::empty(),
                i32::MAX as u32,
                core::ptr::null(),
                core::ptr::null_mut(),
                0u32,
            )
        }
        .map(|_| ())
    }
    #[cfg(loom)]
    {
        let table = FUTEXES.lock().unwrap();
        if let Some(condvar) = table.get(&(word as *const _ as usize)) {
            condvar.notify_all();
        }
        Ok(())
    }
}

/// Interior-mutable storage with loom's closure-based access API.
#[cfg(not(loom))]
#[derive(Debug)]
#[repr(transparent)]
pub struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

#[cfg(not(loom))]
impl<T> UnsafeCell<T> {
    pub const fn new(data: T) -> Self {
        Self(core::cell::UnsafeCell::new(data))
    }

    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
        f(self.0.get())
    }

    #[inline]
    pub fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
        f(self.0.get())
    }
}

#[cfg(loom)]
pub use loom::cell::UnsafeCell;

/// Clears modeled futex state between loom iterations.
#[cfg(loom)]
pub fn loom_reset() {
    FUTEXES.lock().unwrap().clear();
}
