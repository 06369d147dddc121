//! An in-process reference implementation of the session server.
//!
//! A [`Coordinator`] keeps the authoritative side of every emulated thread:
//! ids, handle tables, suspend counts, parked contexts, canonical debug
//! registers and termination state. Each connection is served by its own host
//! thread; all state lives under one mutex, and any state change is broadcast
//! on one condition variable that parked threads wait on.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
mod coordinator;
mod handles;
mod state;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
