//! The session channel between an emulated process and the coordinating server.
//!
//! Each thread owns one [`Connection`], a duplex request/reply pair. Each
//! process additionally has one [`ControlConnection`], over which the server
//! routes calls that must run *inside* the process, such as creating a thread
//! on behalf of another process.
//!
//! The transport is strictly request/reply and does not retry; retrying
//! `Pending` results is up to the caller.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod connection;
pub mod message;
pub mod server;

pub use connection::{Connection, ConnectionId, ControlConnection};
pub use message::{
    ApcCall, ApcRecord, ApcResult, CreateThreadRequest, NewThreadRequest, Reply, Request,
    ThreadInfoSnapshot, ThreadInfoUpdate, WaitRequest,
};
pub use server::{ProcessBootstrap, SessionServer, SUSPEND_SIGNAL};
