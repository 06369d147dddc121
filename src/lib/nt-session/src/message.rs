use core::time::Duration;

use nt_api::info::ThreadBasicInformation;
use nt_api::time::FileTime;
use nt_api::{
    ClientId, Context, ContextFlags, DebugRegisters, Handle, NtStatus, ProcessAccess,
    ThreadAccess,
};

use crate::connection::ConnectionId;

/// A user APC: routine address and its three arguments.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct ApcRecord {
    /// Address of an `extern "C-unwind" fn(u64, u64, u64)` in the target's
    /// address space.
    pub routine: u64,
    pub args: [u64; 3],
}

/// Data for [`Request::NewThread`].
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct NewThreadRequest {
    pub access: ThreadAccess,
    pub suspended: bool,
    /// Connection the new thread will use; obtained from
    /// [`SessionServer::connect`](crate::SessionServer::connect).
    pub connection: ConnectionId,
    pub start_address: u64,
    /// Debug registers inherited from the creator.
    pub debug: DebugRegisters,
}

/// The parameters of a thread creation, as marshalled to a target process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct CreateThreadRequest {
    /// Address of an `extern "C-unwind" fn(usize) -> u32`.
    pub entry: u64,
    pub arg: u64,
    pub stack_reserve: u64,
    pub stack_commit: u64,
    pub suspended: bool,
    pub access: ThreadAccess,
}

/// Data for [`Request::Wait`]. The waiting thread is parked at a safe point
/// for the duration; `context` is its register state while parked.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct WaitRequest {
    pub context: Context,
    /// Relative; `None` waits forever.
    pub timeout: Option<Duration>,
    pub alertable: bool,
    /// A thread handle to wait for, or [`Handle::NULL`] for a plain delay.
    pub object: Handle,
}

/// Server-held thread metadata, as returned by [`Request::GetThreadInfo`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct ThreadInfoSnapshot {
    pub client_id: ClientId,
    /// `STILL_ACTIVE` until the thread exits.
    pub exit_code: NtStatus,
    pub creation_time: FileTime,
    pub exit_time: FileTime,
    pub affinity: u64,
    pub priority: i32,
    pub base_priority: i32,
    /// The thread is the only live thread of its process.
    pub is_last: bool,
    pub teb: u64,
    pub start_address: u64,
    pub impersonation_token: Handle,
    pub hide_from_debugger: bool,
    pub suspend_count: u32,
}

impl ThreadInfoSnapshot {
    pub fn basic(&self) -> ThreadBasicInformation {
        ThreadBasicInformation {
            exit_status: self.exit_code,
            teb_base: self.teb,
            client_id: self.client_id,
            affinity_mask: self.affinity,
            priority: self.priority,
            base_priority: self.base_priority,
        }
    }
}

/// Fields to change with [`Request::SetThreadInfo`]; `None` leaves a field as is.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct ThreadInfoUpdate {
    pub priority: Option<i32>,
    pub base_priority: Option<i32>,
    pub affinity: Option<u64>,
    pub impersonation_token: Option<Handle>,
    pub start_address: Option<u64>,
    pub hide_from_debugger: Option<bool>,
}

/// Calls the server routes to a process's control connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ApcCall {
    CreateThread(CreateThreadRequest),
}

/// Results of [`ApcCall`]s, sent back over the control connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ApcResult {
    /// `handle` is valid in the process that ran the call.
    CreateThread {
        status: NtStatus,
        handle: Handle,
        tid: u32,
    },
}

/// A message from a thread to the server.
#[derive(Copy, Clone, Debug)]
#[repr(u32)]
// Boxing large variants would put message bodies behind pointers, which the
// suspend handler can't allocate.
#[allow(clippy::large_enum_variant)]
pub enum Request {
    /// First message on a new thread's connection. Answered with
    /// [`Reply::Started`] once the thread may run, i.e. not before a thread
    /// created suspended is resumed. The thread counts as parked with
    /// `context` until then. `native_id` is the `pthread_t` the suspend signal
    /// is sent to, or 0 if the thread can't be signalled.
    InitThread {
        native_id: u64,
        teb: u64,
        context: Context,
    },
    NewThread(NewThreadRequest),
    OpenThread { tid: u32, access: ThreadAccess },
    OpenProcess { pid: u32, access: ProcessAccess },
    CloseHandle(Handle),
    GetThreadInfo(Handle),
    SetThreadInfo {
        handle: Handle,
        update: ThreadInfoUpdate,
    },
    SuspendThread(Handle),
    ResumeThread(Handle),
    GetThreadContext {
        handle: Handle,
        flags: ContextFlags,
    },
    /// The groups to write are taken from `context.context_flags`.
    SetThreadContext { handle: Handle, context: Context },
    /// `apc: None` alerts the thread instead of queuing a routine.
    QueueApc {
        handle: Handle,
        apc: Option<ApcRecord>,
    },
    TerminateThread { handle: Handle, exit_code: u32 },
    Wait(WaitRequest),
    /// Sent by the suspend handler: park until the suspend count drops to zero.
    Park { context: Context },
    TestAlert,
    QueueProcessApc { process: Handle, call: ApcCall },
}

impl Request {
    /// Short name for logging; `Debug` output includes whole contexts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitThread { .. } => "InitThread",
            Self::NewThread(_) => "NewThread",
            Self::OpenThread { .. } => "OpenThread",
            Self::OpenProcess { .. } => "OpenProcess",
            Self::CloseHandle(_) => "CloseHandle",
            Self::GetThreadInfo(_) => "GetThreadInfo",
            Self::SetThreadInfo { .. } => "SetThreadInfo",
            Self::SuspendThread(_) => "SuspendThread",
            Self::ResumeThread(_) => "ResumeThread",
            Self::GetThreadContext { .. } => "GetThreadContext",
            Self::SetThreadContext { .. } => "SetThreadContext",
            Self::QueueApc { .. } => "QueueApc",
            Self::TerminateThread { .. } => "TerminateThread",
            Self::Wait(_) => "Wait",
            Self::Park { .. } => "Park",
            Self::TestAlert => "TestAlert",
            Self::QueueProcessApc { .. } => "QueueProcessApc",
        }
    }
}

/// A message from the server to a thread.
#[derive(Copy, Clone, Debug)]
#[repr(u32)]
#[allow(clippy::large_enum_variant)]
pub enum Reply {
    /// Plain completion: success or the failure status.
    Status(NtStatus),
    Started { context: Context },
    ThreadCreated { handle: Handle, tid: u32 },
    Opened(Handle),
    ThreadInfo(ThreadInfoSnapshot),
    /// Previous suspend count.
    SuspendCount(u32),
    Context(Context),
    /// A context request named the calling thread itself. Only the debug
    /// registers are kept by the server; these are their canonical values,
    /// after applying a set.
    SelfTarget { debug: DebugRegisters },
    /// A thread other than the caller was terminated.
    TerminateAck { is_last: bool },
    /// End of a [`Request::Wait`]. `context` is the possibly updated register
    /// state to resume with; `apc` is set when `status` is `USER_APC`.
    Woken {
        status: NtStatus,
        context: Context,
        apc: Option<ApcRecord>,
    },
    /// End of a [`Request::Park`].
    Resumed { context: Context },
    /// Answer to [`Request::TestAlert`].
    Alert {
        status: NtStatus,
        apc: Option<ApcRecord>,
    },
    /// The calling thread itself has been terminated. Sent in place of any
    /// other reply once that has happened.
    Terminated { exit_code: u32, is_last: bool },
}

impl Reply {
    /// The status of a [`Reply::Status`] reply as a result; any other reply
    /// counts as success.
    pub fn into_result(self) -> Result<Reply, NtStatus> {
        match self {
            Self::Status(status) if status.is_error() => Err(status),
            other => Ok(other),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "Status",
            Self::Started { .. } => "Started",
            Self::ThreadCreated { .. } => "ThreadCreated",
            Self::Opened(_) => "Opened",
            Self::ThreadInfo(_) => "ThreadInfo",
            Self::SuspendCount(_) => "SuspendCount",
            Self::Context(_) => "Context",
            Self::SelfTarget { .. } => "SelfTarget",
            Self::TerminateAck { .. } => "TerminateAck",
            Self::Woken { .. } => "Woken",
            Self::Resumed { .. } => "Resumed",
            Self::Alert { .. } => "Alert",
            Self::Terminated { .. } => "Terminated",
        }
    }
}

static_assertions::assert_impl_all!(Request: Copy, Send);
static_assertions::assert_impl_all!(Reply: Copy, Send);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_into_result() {
        assert!(matches!(
            Reply::Status(NtStatus::SUCCESS).into_result(),
            Ok(Reply::Status(NtStatus::SUCCESS))
        ));
        assert!(matches!(
            Reply::Status(NtStatus::PENDING).into_result(),
            Ok(Reply::Status(NtStatus::PENDING))
        ));
        assert_eq!(
            Reply::Status(NtStatus::INVALID_HANDLE).into_result().err(),
            Some(NtStatus::INVALID_HANDLE)
        );
        assert!(Reply::SuspendCount(0).into_result().is_ok());
    }

    #[test]
    fn test_snapshot_basic_projection() {
        let snapshot = ThreadInfoSnapshot {
            client_id: ClientId::new(8, 12),
            exit_code: NtStatus::STILL_ACTIVE,
            affinity: 0b11,
            priority: 2,
            base_priority: 1,
            teb: 0x7000_0000,
            ..Default::default()
        };
        let basic = snapshot.basic();
        assert_eq!(basic.client_id.tid(), 12);
        assert_eq!(basic.exit_status, NtStatus::STILL_ACTIVE);
        assert_eq!(basic.teb_base, 0x7000_0000);
        assert_eq!(basic.affinity_mask, 0b11);
    }
}
