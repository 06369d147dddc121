//! Low-level synchronization for the session transport.
//!
//! Everything in here must be usable from a signal handler: no allocation, no
//! locks that a handler could find already held, and only raw futex syscalls
//! for blocking. The suspend handler in `ntthread` parks its thread by sending
//! and receiving over these channels.
//!
//! The primitives are modeled under [loom]. To run the integration tests under
//! loom, from the repository root:
//!
//! ```shell
//! LOOM_MAX_PREEMPTIONS=3 \
//! RUSTFLAGS="--cfg loom" \
//! cargo test \
//! -p nt-sync \
//! --target-dir=loomtarget \
//! -- --nocapture
//! ```
//!
//! [loom]: <https://docs.rs/loom/latest/loom/>

#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(all(not(test), not(loom)), no_std)]

pub mod slot;

/// Public for the loom integration tests in `tests/*`; not intended for use by
/// other crates.
pub mod sync;

pub use slot::{SlotChannel, WriterClosed};
