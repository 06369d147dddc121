//! Reading and writing thread contexts.
//!
//! A thread's own context lives in its register cache, so accessing it is
//! local. The exception is the debug registers, which the server holds. Another
//! thread's context can only be accessed while that thread is parked, which
//! [`get_context`] and [`set_context`] bring about by suspending it.

use log::{debug, warn};
use nt_api::{Context, ContextFlags, Handle, NtResult, NtStatus};
use nt_session::{Reply, Request};

use crate::lifecycle::{self, unexpected};
use crate::retry::{retry_while_pending, RetryOutcome};
use crate::teb::{self, current, Teb};

/// Keeps a thread suspended for the duration of a context access.
struct SuspendGuard<'a> {
    teb: &'a Teb,
    handle: Handle,
}

impl<'a> SuspendGuard<'a> {
    fn new(teb: &'a Teb, handle: Handle) -> NtResult<Self> {
        match teb.call(Request::SuspendThread(handle))? {
            Reply::SuspendCount(_) => Ok(Self { teb, handle }),
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        // May run while unwinding out of a terminated thread, so no exit
        // handling here.
        if let Err(e) = teb::call_raw(
            &self.teb.runtime.connection,
            Request::ResumeThread(self.handle),
        ) {
            warn!("couldn't resume {:?} after context access: {e:?}", self.handle);
        }
    }
}

/// Sends `request` and, while the target isn't parked, suspends it and
/// retries. `interpret` maps a reply to a value, or `None` for pending.
fn access_parked<T>(
    teb: &Teb,
    handle: Handle,
    request: Request,
    mut interpret: impl FnMut(Reply) -> NtResult<Option<T>>,
) -> NtResult<T> {
    if let Some(value) = interpret(teb.call(request)?)? {
        return Ok(value);
    }

    let _suspended = SuspendGuard::new(teb, handle)?;
    let policy = teb.process().config().retry_policy();
    let sleep = |delay| {
        if let Err(e) = lifecycle::delay_execution(false, Some(delay)) {
            debug!("context retry delay failed: {e:?}");
        }
    };
    match retry_while_pending(policy, sleep, || interpret(teb.call(request)?))? {
        RetryOutcome::Ready { value, attempts } => {
            debug!("{} on {handle:?} done after {attempts} attempts", request.kind());
            Ok(value)
        }
        RetryOutcome::Exhausted { attempts } => {
            warn!(
                "{handle:?} didn't park within {attempts} attempts of {}",
                request.kind()
            );
            Err(NtStatus::ACCESS_DENIED)
        }
    }
}

/// The register groups `flags` selects of the thread `handle` refers to.
///
/// `flags` is a raw `CONTEXT_*` mask; invalid masks are
/// `STATUS_INVALID_PARAMETER`.
pub fn get_context(handle: Handle, flags: u32) -> NtResult<Context> {
    let flags = ContextFlags::validate(flags)?;
    let teb = current()?;
    if handle == Handle::CURRENT_THREAD && !flags.has_debug_registers() {
        return Ok(teb.cached_context().subset(flags));
    }

    let request = Request::GetThreadContext { handle, flags };
    access_parked(teb, handle, request, |reply| match reply {
        Reply::Context(context) => Ok(Some(context)),
        Reply::SelfTarget { debug } => {
            teb.update_cache(|cache| cache.set_debug_registers(&debug));
            Ok(Some(teb.cached_context().subset(flags)))
        }
        Reply::Status(NtStatus::PENDING) => Ok(None),
        other => Err(unexpected(other)),
    })
}

/// Writes the register groups named by `context.context_flags` into the
/// thread `handle` refers to.
pub fn set_context(handle: Handle, context: &Context) -> NtResult<()> {
    let flags = context.flags()?;
    let teb = current()?;
    if handle == Handle::CURRENT_THREAD && !flags.has_debug_registers() {
        teb.update_cache(|cache| cache.copy_groups_from(context, flags));
        return Ok(());
    }

    let request = Request::SetThreadContext {
        handle,
        context: *context,
    };
    access_parked(teb, handle, request, |reply| match reply {
        Reply::Status(NtStatus::PENDING) => Ok(None),
        Reply::Status(_) => Ok(Some(())),
        Reply::SelfTarget { debug } => {
            teb.update_cache(|cache| {
                cache.copy_groups_from(context, flags.without_debug_registers());
                cache.set_debug_registers(&debug);
            });
            Ok(Some(()))
        }
        other => Err(unexpected(other)),
    })
}
