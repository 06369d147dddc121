//! Helpers shared by the integration tests. Lives in a subdirectory so that it
//! isn't built as a test crate of its own.

// Not every test uses every helper.
#![allow(unused)]

#[cfg(loom)]
pub fn model<F>(f: F)
where
    F: Fn() + Sync + Send + 'static,
{
    loom::model(move || {
        f();
        nt_sync::sync::loom_reset();
    });
}

#[cfg(not(loom))]
pub fn model<F>(f: F)
where
    F: Fn() + Sync + Send + 'static,
{
    f()
}

#[cfg(not(loom))]
pub use std::sync::Arc;
#[cfg(not(loom))]
pub use std::thread;

#[cfg(loom)]
pub use loom::sync::Arc;
#[cfg(loom)]
pub use loom::thread;
