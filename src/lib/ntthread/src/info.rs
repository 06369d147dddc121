//! Thread information classes.

use std::time::Duration;

use log::debug;
use nix::sys::resource::{getrusage, UsageWho};
use nt_api::info::{KernelUserTimes, ThreadInfoClass, ThreadInformation};
use nt_api::time::duration_to_ticks;
use nt_api::{Handle, NtResult, NtStatus};
use nt_session::{Reply, Request, ThreadInfoSnapshot, ThreadInfoUpdate};

use crate::lifecycle::unexpected;
use crate::teb::{current, Teb};
use crate::tls;

fn snapshot(teb: &Teb, handle: Handle) -> NtResult<ThreadInfoSnapshot> {
    match teb.call(Request::GetThreadInfo(handle))? {
        Reply::ThreadInfo(info) => Ok(info),
        other => Err(unexpected(other)),
    }
}

/// CPU time used by the calling thread, as (kernel, user).
fn own_cpu_times() -> (Duration, Duration) {
    let as_duration = |tv: nix::sys::time::TimeVal| {
        Duration::new(tv.tv_sec() as u64, tv.tv_usec() as u32 * 1000)
    };
    match getrusage(UsageWho::RUSAGE_THREAD) {
        Ok(usage) => (
            as_duration(usage.system_time()),
            as_duration(usage.user_time()),
        ),
        Err(e) => {
            debug!("getrusage: {e}");
            (Duration::ZERO, Duration::ZERO)
        }
    }
}

fn times(teb: &Teb, info: &ThreadInfoSnapshot) -> KernelUserTimes {
    // Only the calling thread's usage is available from here.
    let (kernel, user) = if info.client_id.tid() == teb.thread_id() {
        own_cpu_times()
    } else {
        (Duration::ZERO, Duration::ZERO)
    };
    KernelUserTimes {
        create_time: info.creation_time,
        exit_time: info.exit_time,
        kernel_time: duration_to_ticks(kernel),
        user_time: duration_to_ticks(user),
    }
}

/// Queries one information class of the thread `handle` refers to.
///
/// Classes without a typed value here are `STATUS_NOT_IMPLEMENTED`.
pub fn query_information(handle: Handle, class: ThreadInfoClass) -> NtResult<ThreadInformation> {
    let teb = current()?;
    let info = || snapshot(teb, handle);
    match class {
        ThreadInfoClass::Basic => Ok(ThreadInformation::Basic(info()?.basic())),
        ThreadInfoClass::Times => Ok(ThreadInformation::Times(times(teb, &info()?))),
        ThreadInfoClass::AmILastThread => Ok(ThreadInformation::AmILastThread(info()?.is_last)),
        ThreadInfoClass::QuerySetWin32StartAddress => Ok(
            ThreadInformation::QuerySetWin32StartAddress(info()?.start_address),
        ),
        ThreadInfoClass::HideFromDebugger => {
            Ok(ThreadInformation::HideFromDebugger(info()?.hide_from_debugger))
        }
        other => {
            debug!("query of unsupported class {other:?}");
            Err(NtStatus::NOT_IMPLEMENTED)
        }
    }
}

/// [`query_information`] with a raw class number. Unknown numbers are
/// `STATUS_INVALID_INFO_CLASS`.
pub fn query_information_raw(handle: Handle, class: u32) -> NtResult<ThreadInformation> {
    query_information(handle, ThreadInfoClass::try_from(class)?)
}

/// Sets one information class of the thread `handle` refers to.
pub fn set_information(handle: Handle, info: ThreadInformation) -> NtResult<()> {
    let update = match info {
        ThreadInformation::ZeroTlsCell(index) => {
            if handle != Handle::CURRENT_THREAD {
                return Err(NtStatus::NOT_IMPLEMENTED);
            }
            return tls::zero_tls_cell(index);
        }
        ThreadInformation::Priority(priority) => ThreadInfoUpdate {
            priority: Some(priority),
            ..Default::default()
        },
        ThreadInformation::BasePriority(priority) => ThreadInfoUpdate {
            base_priority: Some(priority),
            ..Default::default()
        },
        ThreadInformation::AffinityMask(mask) => ThreadInfoUpdate {
            affinity: Some(mask),
            ..Default::default()
        },
        ThreadInformation::ImpersonationToken(token) => ThreadInfoUpdate {
            impersonation_token: Some(token),
            ..Default::default()
        },
        ThreadInformation::QuerySetWin32StartAddress(address) => ThreadInfoUpdate {
            start_address: Some(address),
            ..Default::default()
        },
        ThreadInformation::HideFromDebugger(hide) => ThreadInfoUpdate {
            hide_from_debugger: Some(hide),
            ..Default::default()
        },
        other => {
            debug!("set of unsupported class {:?}", other.class());
            return Err(NtStatus::NOT_IMPLEMENTED);
        }
    };
    current()?.call(Request::SetThreadInfo { handle, update })?;
    Ok(())
}
