//! NT thread and process semantics on top of native host threads.
//!
//! A [`Process`] is set up once per emulated process with [`Process::init`],
//! which turns the calling thread into the process's initial thread. Every
//! thread that enters the runtime gets a [`Teb`] in a size-aligned region that
//! also holds its signal stack, and a private connection to the coordinating
//! server. Everything that must be visible across processes (handles, suspend
//! counts, canonical debug registers, exit accounting) goes through that
//! connection; register state of the calling thread is cached locally.
//!
//! The operations in [`lifecycle`], [`context`], [`info`] and [`tls`] act on
//! behalf of the calling thread and fail with `STATUS_INVALID_THREAD` on
//! threads that never entered the runtime.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod context;
pub mod info;
pub mod lifecycle;
mod lock;
pub mod logger;
mod process;
pub mod retry;
mod sigmask;
mod sigstack;
pub mod teb;
pub mod tls;

pub use config::RuntimeConfig;
pub use lifecycle::{ApcRoutine, CreateThreadParams, CreatedThread, ThreadEntry};
pub use process::{ExitHook, Process};
pub use teb::Teb;
