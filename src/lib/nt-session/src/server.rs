use std::sync::Arc;

use nt_api::NtResult;

use crate::connection::{Connection, ControlConnection};

/// What a process receives when it registers with the server.
pub struct ProcessBootstrap {
    pub pid: u32,
    /// Id of the thread that registered the process.
    pub tid: u32,
    /// Connection already bound to the initial thread.
    pub connection: Arc<Connection>,
    /// Control channel the process must serve.
    pub control: Arc<ControlConnection>,
}

/// The coordinating server, as seen by an emulated process.
pub trait SessionServer: Send + Sync {
    /// Registers a new process, with the calling thread as its first thread.
    fn new_process(&self) -> NtResult<ProcessBootstrap>;

    /// Opens a fresh, unbound connection for process `pid`. It is bound to a
    /// thread by naming it in a `NewThread` request; until then it acts for the
    /// process as a whole.
    ///
    /// Fails with `STATUS_TOO_MANY_OPENED_FILES` when no more connections can
    /// be set up.
    fn connect(&self, pid: u32) -> NtResult<Arc<Connection>>;
}

/// Signal the server sends to a thread whose suspend count goes from 0 to 1
/// while it isn't parked. The runtime's handler parks the thread with
/// [`Request::Park`](crate::Request::Park).
pub const SUSPEND_SIGNAL: libc::c_int = libc::SIGUSR1;
