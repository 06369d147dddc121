//! Type definitions for the NT-shaped thread and process API.
//!
//! Everything here is plain data: status codes, the x64 `CONTEXT` prefix the
//! runtime emulates, information classes and their typed payloads, handles and
//! access masks. Layouts that are shared with emulated code are `repr(C)` and
//! have their offsets asserted at compile time.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod access;
pub mod context;
pub mod handle;
pub mod info;
pub mod status;
pub mod time;

pub use access::{ProcessAccess, ThreadAccess};
pub use context::{Context, ContextFlags, DebugRegisters};
pub use handle::{ClientId, Handle};
pub use status::{NtResult, NtStatus};
