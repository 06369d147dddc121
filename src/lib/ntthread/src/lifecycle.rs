//! Thread creation, startup, waits and exit.

use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use log::{debug, warn};
use nt_api::{
    ClientId, Context, DebugRegisters, Handle, NtResult, NtStatus, ProcessAccess, ThreadAccess,
};
use nt_session::{
    ApcCall, ApcRecord, Connection, CreateThreadRequest, NewThreadRequest, Reply, Request,
    WaitRequest,
};

use crate::process::Process;
use crate::sigmask::{self, SignalsBlocked};
use crate::sigstack::{self, StackRegion, ThreadStack};
use crate::teb::{self, current, StackBounds, Teb, TebInit, ThreadResources, ThreadState};

/// A thread's entry function; its return value is the thread's exit code.
pub type ThreadEntry = extern "C-unwind" fn(usize) -> u32;

/// A user APC routine, called with the three arguments it was queued with.
pub type ApcRoutine = extern "C-unwind" fn(u64, u64, u64);

#[derive(Copy, Clone, Debug)]
pub struct CreateThreadParams {
    pub entry: ThreadEntry,
    pub arg: usize,
    /// Native stack size; 0 for the configured default.
    pub stack_reserve: usize,
    /// Accepted for compatibility. Stacks are committed on demand.
    pub stack_commit: usize,
    /// Start with a suspend count of 1.
    pub suspended: bool,
    /// Access of the returned handle.
    pub access: ThreadAccess,
}

impl CreateThreadParams {
    pub fn new(entry: ThreadEntry, arg: usize) -> Self {
        Self {
            entry,
            arg,
            stack_reserve: 0,
            stack_commit: 0,
            suspended: false,
            access: ThreadAccess::ALL_ACCESS,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CreatedThread {
    pub handle: Handle,
    pub tid: u32,
}

/// Unwind payload that carries an exiting thread to its outermost frame.
#[derive(Debug)]
pub struct ThreadExit {
    pub exit_code: u32,
}

/// The server's view of a thread's termination.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExitNotice {
    pub exit_code: u32,
    /// No other thread of the process was alive.
    pub is_last: bool,
}

/// What a new thread's bootstrap needs from its creator. Written next to the
/// block before the native thread exists; read once by the thread.
#[repr(C)]
pub(crate) struct StartupBundle {
    pub entry: ThreadEntry,
    pub arg: usize,
}

/// A worker that left the runtime but may still be running natively. Dropping
/// it joins the thread and frees its stack and region.
struct ExitedThread {
    teb: NonNull<Teb>,
}

// SAFETY: the block is owned by whoever holds this.
unsafe impl Send for ExitedThread {}

/// The last worker to exit, in any process of this host, that nobody has
/// joined yet. Fits a word, so swapping it neither locks nor allocates.
static EXITED: AtomicCell<Option<ExitedThread>> = AtomicCell::new(None);
static_assertions::assert_eq_size!(Option<ExitedThread>, usize);

impl Drop for ExitedThread {
    fn drop(&mut self) {
        // SAFETY: the block stays mapped until `release_block` below.
        let teb = unsafe { self.teb.as_ref() };
        let tid = teb.thread_id();
        let native = teb.runtime.native_id.get() as libc::pthread_t;
        let rv = unsafe { libc::pthread_join(native, std::ptr::null_mut()) };
        if rv != 0 {
            // Freeing a stack that might be in use is worse than leaking it.
            warn!(
                "couldn't join thread {tid}: {}",
                std::io::Error::from_raw_os_error(rv)
            );
            return;
        }
        teb.set_state(ThreadState::Joined);
        // SAFETY: the thread has fully stopped.
        unsafe { teb::release_block(self.teb.as_ptr()) };
    }
}

/// Parks the calling worker's block in the slot, joining the worker parked
/// there before. The caller must not touch the block afterwards.
fn hand_off(teb: &Teb) {
    let exited = ExitedThread {
        teb: NonNull::from(teb),
    };
    drop(EXITED.swap(Some(exited)));
}

/// Joins the parked worker, if any.
pub(crate) fn reap() {
    drop(EXITED.take());
}

pub(crate) fn unexpected(reply: Reply) -> NtStatus {
    warn!("unexpected reply {}", reply.kind());
    NtStatus::UNSUCCESSFUL
}

/// Creates a thread in `process`, which is either [`Handle::CURRENT_PROCESS`]
/// or a process handle with `CREATE_THREAD` access.
///
/// A new thread in the calling process inherits the caller's debug registers.
/// Threads for other processes are created by that process, on the server's
/// request.
pub fn create_thread(process: Handle, params: &CreateThreadParams) -> NtResult<CreatedThread> {
    let teb = current()?;
    if process == Handle::CURRENT_PROCESS {
        let debug = teb.cached_context().debug_registers();
        return spawn_local(teb.process(), &|request| teb.call(request), debug, params);
    }

    let request = CreateThreadRequest {
        entry: params.entry as usize as u64,
        arg: params.arg as u64,
        stack_reserve: params.stack_reserve as u64,
        stack_commit: params.stack_commit as u64,
        suspended: params.suspended,
        access: params.access,
    };
    match teb.call(Request::QueueProcessApc {
        process,
        call: ApcCall::CreateThread(request),
    })? {
        Reply::ThreadCreated { handle, tid } => {
            debug!("thread {tid} created in another process");
            Ok(CreatedThread { handle, tid })
        }
        other => Err(unexpected(other)),
    }
}

/// Creates a thread of `process` on the calling host thread, registering it
/// through `call`.
///
/// Either the thread is fully set up and started, or everything acquired on
/// the way is released again and the server has forgotten it.
pub(crate) fn spawn_local(
    process: &Arc<Process>,
    call: &dyn Fn(Request) -> NtResult<Reply>,
    debug: DebugRegisters,
    params: &CreateThreadParams,
) -> NtResult<CreatedThread> {
    let connection = process.server.connect(process.pid())?;
    let start_address = params.entry as usize as u64;
    let registered = call(Request::NewThread(NewThreadRequest {
        access: params.access,
        suspended: params.suspended,
        connection: connection.id(),
        start_address,
        debug,
    }))
    .and_then(|reply| match reply {
        Reply::ThreadCreated { handle, tid } => Ok((handle, tid)),
        other => Err(unexpected(other)),
    });
    let (handle, tid) = match registered {
        Ok(registered) => registered,
        Err(status) => {
            connection.close();
            return Err(status);
        }
    };

    match start_native(process, &connection, tid, debug, params) {
        Ok(()) => {
            debug!(
                "created thread {tid} in process {} (suspended: {})",
                process.pid(),
                params.suspended
            );
            Ok(CreatedThread { handle, tid })
        }
        Err(status) => {
            warn!("rolling back creation of thread {tid}: {status:?}");
            if let Err(e) = call(Request::TerminateThread {
                handle,
                exit_code: status.to_u32(),
            }) {
                warn!("couldn't terminate thread record {tid}: {e:?}");
            }
            if let Err(e) = call(Request::CloseHandle(handle)) {
                warn!("couldn't close handle {handle:?}: {e:?}");
            }
            connection.close();
            Err(status)
        }
    }
}

fn start_native(
    process: &Arc<Process>,
    connection: &Arc<Connection>,
    tid: u32,
    debug: DebugRegisters,
    params: &CreateThreadParams,
) -> NtResult<()> {
    let reserve = match params.stack_reserve {
        0 => process.config.default_stack_reserve,
        reserve => reserve,
    };
    let region = StackRegion::allocate(&process.layout)?;
    let stack = ThreadStack::allocate(reserve)?;
    let bounds = StackBounds {
        base: stack.top() as usize,
        limit: stack.limit() as usize,
        deallocation: stack.allocation_base() as usize,
    };
    let (stack_low, stack_size) = (stack.limit(), stack.usable_size());

    let start_address = params.entry as usize as u64;
    let mut context = Context::initial(start_address, params.arg as u64, bounds.base as u64);
    context.set_debug_registers(&debug);

    // SAFETY: the region is fresh and ours.
    unsafe {
        region.bundle().write(StartupBundle {
            entry: params.entry,
            arg: params.arg,
        })
    };
    let block = region.teb();
    let block = unsafe {
        teb::initialize_block(
            block,
            TebInit {
                process: Arc::clone(process),
                connection: Arc::clone(connection),
                client_id: ClientId::new(process.pid(), tid),
                start_address,
                context,
                stack: bounds,
                resources: ThreadResources {
                    region,
                    stack: Some(stack),
                },
            },
        )
    }?;

    // Counted before it runs, so no other thread can wrongly think it's last.
    {
        let guard = process.state.lock();
        unsafe { guard.borrow_mut().threads.push(block) };
        process.thread_count.fetch_add(1, Ordering::SeqCst);
    }
    if let Err(status) = spawn_native(block, stack_low, stack_size) {
        {
            let guard = process.state.lock();
            unsafe { guard.borrow_mut().threads.unlink(block) };
            process.thread_count.fetch_sub(1, Ordering::SeqCst);
        }
        // SAFETY: never ran.
        unsafe { teb::release_block(block) };
        return Err(status);
    }
    Ok(())
}

fn spawn_native(block: *mut Teb, stack_low: *mut u8, stack_size: usize) -> NtResult<()> {
    // The new thread starts with everything blocked, and unblocks once it can
    // handle the suspend signal.
    let _blocked = SignalsBlocked::new();
    let rv = unsafe {
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
        assert_eq!(libc::pthread_attr_init(attr.as_mut_ptr()), 0);
        let mut attr = attr.assume_init();
        let mut rv = libc::pthread_attr_setstack(&mut attr, stack_low.cast(), stack_size);
        if rv == 0 {
            let mut native: libc::pthread_t = 0;
            rv = libc::pthread_create(&mut native, &attr, thread_start, block.cast());
        }
        libc::pthread_attr_destroy(&mut attr);
        rv
    };
    match rv {
        0 => Ok(()),
        libc::EAGAIN => Err(NtStatus::INSUFFICIENT_RESOURCES),
        e => {
            warn!("pthread_create: {}", std::io::Error::from_raw_os_error(e));
            Err(NtStatus::UNSUCCESSFUL)
        }
    }
}

/// Native entry point of every worker thread.
extern "C" fn thread_start(arg: *mut c_void) -> *mut c_void {
    let block: *mut Teb = arg.cast();
    // SAFETY: the creator handed the block over with `pthread_create`.
    let teb = unsafe { &*block };
    // Whoever joins this thread needs it, even if it never gets to run.
    teb.runtime
        .native_id
        .set(nix::sys::pthread::pthread_self() as u64);
    let layout = teb.process().layout;
    let bundle = unsafe {
        std::ptr::read(
            block
                .cast::<u8>()
                .add(layout.bundle_offset)
                .cast::<StartupBundle>(),
        )
    };

    let exit_code = match teb::set_current(block) {
        Ok(()) => {
            sigstack::install_sigaltstack(block.cast(), &layout);
            bootstrap(teb, bundle)
        }
        Err(status) => {
            warn!("thread {} can't enter the runtime", teb.thread_id());
            status.to_u32()
        }
    };
    finish_worker(teb, exit_code);
    std::ptr::null_mut()
}

/// Waits for the go-ahead from the server and runs the entry. Returns the
/// exit code.
fn bootstrap(teb: &Teb, bundle: StartupBundle) -> u32 {
    teb.set_state(ThreadState::Registered);
    let native_id = teb.runtime.native_id.get();
    let init = teb::call_raw(
        &teb.runtime.connection,
        Request::InitThread {
            native_id,
            teb: teb.address(),
            context: teb.cached_context(),
        },
    );
    match init {
        Ok(Reply::Started { context }) => {
            teb.update_cache(|cache| *cache = context);
            teb.set_state(ThreadState::Running);
        }
        Ok(Reply::Terminated { exit_code, is_last }) => {
            debug!("thread {} terminated before it started", teb.thread_id());
            teb.runtime
                .exit_ack
                .set(Some(ExitNotice { exit_code, is_last }));
            return exit_code;
        }
        other => {
            warn!("thread {} couldn't start: {other:?}", teb.thread_id());
            return other.err().unwrap_or(NtStatus::UNSUCCESSFUL).to_u32();
        }
    }
    debug!("thread {} running", teb.thread_id());

    sigmask::unblock_all();
    let entry = bundle.entry;
    let arg = bundle.arg;
    match std::panic::catch_unwind(move || entry(arg)) {
        Ok(exit_code) => exit_code,
        Err(payload) => match payload.downcast::<ThreadExit>() {
            Ok(exit) => exit.exit_code,
            Err(_) => {
                // The panic hook has already reported it.
                warn!("thread {} panicked", teb.thread_id());
                NtStatus::UNSUCCESSFUL.to_u32()
            }
        },
    }
}

/// Takes the calling thread out of its process. Signals must be blocked.
///
/// If this was the process's last thread, the exit hook runs first. Either
/// way the block ends up unlinked, with only memory left to release. The
/// caller still has to decrement the thread count.
pub(crate) fn retire(teb: &Teb, exit_code: u32) -> ExitNotice {
    let runtime = &teb.runtime;
    let notice = match runtime.exit_ack.take().or_else(|| runtime.pending_exit.take()) {
        Some(notice) => notice,
        None => notify_exit(teb, exit_code),
    };
    debug!(
        "thread {} exiting with {:#x}, last: {}",
        teb.thread_id(),
        notice.exit_code,
        notice.is_last
    );
    if notice.is_last {
        debug!(
            "last thread of process {} exited with {:#x}",
            teb.process_id(),
            notice.exit_code
        );
    }
    detach(teb, notice);
    sigstack::disable_sigaltstack();
    notice
}

/// The part of [`retire`] that is safe on the signal stack. Doesn't log.
fn detach(teb: &Teb, notice: ExitNotice) {
    let process = teb.process();
    teb.set_state(ThreadState::ExitRequested);
    if notice.is_last {
        // Process death. The hook normally ends the host process; if it
        // returns, the thread is cleaned up like any other.
        process.exit_process(notice);
    }
    let block = teb as *const Teb as *mut Teb;
    {
        let guard = process.state.lock();
        unsafe { guard.borrow_mut().threads.unlink(block) };
    }
    teb.runtime.connection.close();
}

fn notify_exit(teb: &Teb, exit_code: u32) -> ExitNotice {
    let reply = teb::call_raw(
        &teb.runtime.connection,
        Request::TerminateThread {
            handle: Handle::CURRENT_THREAD,
            exit_code,
        },
    );
    match reply {
        Ok(Reply::Terminated { exit_code, is_last }) => ExitNotice { exit_code, is_last },
        other => {
            warn!(
                "server didn't confirm the exit of thread {}: {other:?}",
                teb.thread_id()
            );
            ExitNotice {
                exit_code,
                is_last: teb.process().thread_count() == 1,
            }
        }
    }
}

fn finish_worker(teb: &Teb, exit_code: u32) {
    // For good: this thread never runs a handler again.
    sigmask::block_all();
    let process = Arc::clone(teb.process());
    retire(teb, exit_code);
    teb::clear_current();
    // Whoever exits next joins this thread and frees its stack; in turn, we
    // free our predecessor's.
    hand_off(teb);
    process.thread_count.fetch_sub(1, Ordering::SeqCst);
}

/// Ends a worker whose termination it learned of in the suspend handler.
/// Runs on the signal stack with all signals blocked, and joins and frees
/// the predecessor in the slot like any exiting worker.
///
/// The interrupted frames are abandoned without unwinding, and so are any
/// locks they hold. The kernel clears the thread id as the thread ends,
/// which is all a join waits for.
pub(crate) fn exit_interrupted(teb: &Teb, notice: ExitNotice) -> ! {
    let process = Arc::clone(teb.process());
    detach(teb, notice);
    teb::clear_current();
    hand_off(teb);
    process.thread_count.fetch_sub(1, Ordering::SeqCst);
    drop(process);
    // SAFETY: nothing on this thread is used again.
    unsafe { libc::syscall(libc::SYS_exit, 0) };
    unreachable!("SYS_exit returned")
}

/// Handle to thread `tid`. Unknown ids are `STATUS_INVALID_CID`.
pub fn open_thread(tid: u32, access: ThreadAccess) -> NtResult<Handle> {
    match current()?.call(Request::OpenThread { tid, access })? {
        Reply::Opened(handle) => Ok(handle),
        other => Err(unexpected(other)),
    }
}

/// Handle to process `pid`. Unknown ids are `STATUS_INVALID_CID`.
pub fn open_process(pid: u32, access: ProcessAccess) -> NtResult<Handle> {
    match current()?.call(Request::OpenProcess { pid, access })? {
        Reply::Opened(handle) => Ok(handle),
        other => Err(unexpected(other)),
    }
}

pub fn close_handle(handle: Handle) -> NtResult<()> {
    current()?.call(Request::CloseHandle(handle))?;
    Ok(())
}

/// Returns the previous suspend count. Suspending the calling thread takes
/// effect when this returns.
pub fn suspend_thread(handle: Handle) -> NtResult<u32> {
    match current()?.call(Request::SuspendThread(handle))? {
        Reply::SuspendCount(previous) => Ok(previous),
        other => Err(unexpected(other)),
    }
}

/// Returns the previous suspend count.
pub fn resume_thread(handle: Handle) -> NtResult<u32> {
    match current()?.call(Request::ResumeThread(handle))? {
        Reply::SuspendCount(previous) => Ok(previous),
        other => Err(unexpected(other)),
    }
}

/// Terminates the thread `handle` refers to. A worker stops right away,
/// wherever it is. An initial thread running user code exits at its next
/// entry into the runtime.
///
/// Doesn't return if `handle` is the calling thread.
pub fn terminate_thread(handle: Handle, exit_code: u32) -> NtResult<()> {
    match current()?.call(Request::TerminateThread { handle, exit_code })? {
        Reply::TerminateAck { is_last } => {
            if is_last {
                debug!("terminated the last thread of another process");
            }
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

/// Exits the calling thread.
///
/// # Panics
///
/// If the calling thread isn't in the runtime.
pub fn exit_thread(exit_code: u32) -> ! {
    let teb = match current() {
        Ok(teb) => teb,
        Err(_) => panic!("exit_thread called outside the runtime"),
    };
    match teb.call(Request::TerminateThread {
        handle: Handle::CURRENT_THREAD,
        exit_code,
    }) {
        // Only reached if the server didn't confirm; the exit path asks again.
        Ok(reply) => warn!("unexpected reply {} to thread exit", reply.kind()),
        Err(e) => warn!("couldn't report thread exit: {e:?}"),
    }
    std::panic::resume_unwind(Box::new(ThreadExit { exit_code }))
}

/// Queues `routine` to run on the thread `handle` refers to, the next time
/// it waits alertably. Without a routine, alerts the thread instead.
pub fn queue_apc(
    handle: Handle,
    routine: Option<ApcRoutine>,
    arg1: u64,
    arg2: u64,
    arg3: u64,
) -> NtResult<()> {
    let apc = routine.map(|routine| ApcRecord {
        routine: routine as usize as u64,
        args: [arg1, arg2, arg3],
    });
    current()?.call(Request::QueueApc { handle, apc })?;
    Ok(())
}

fn deliver(apc: ApcRecord) {
    if apc.routine == 0 {
        return;
    }
    // SAFETY: queued from an `ApcRoutine` in this address space.
    let routine = unsafe { std::mem::transmute::<usize, ApcRoutine>(apc.routine as usize) };
    routine(apc.args[0], apc.args[1], apc.args[2]);
}

/// A wait at a safe point. Runs a delivered APC, if any, once the wait is
/// over.
fn safe_point_wait(
    object: Handle,
    alertable: bool,
    timeout: Option<Duration>,
) -> NtResult<NtStatus> {
    let teb = current()?;
    let (status, apc) = {
        // The cache must not change between sending it and taking the reply.
        let _blocked = SignalsBlocked::new();
        let request = Request::Wait(WaitRequest {
            context: teb.cached_context(),
            timeout,
            alertable,
            object,
        });
        match teb.call(request)? {
            Reply::Woken {
                status,
                context,
                apc,
            } => {
                teb.update_cache(|cache| *cache = context);
                (status, apc)
            }
            other => return Err(unexpected(other)),
        }
    };
    if let Some(apc) = apc {
        deliver(apc);
    }
    Ok(status)
}

/// Sleeps for `timeout`, or forever.
///
/// Returns `STATUS_TIMEOUT` once the time is up, or `STATUS_SUCCESS` for a
/// zero timeout. An alertable sleep ends early with `STATUS_USER_APC` after
/// running a queued APC, or with `STATUS_ALERTED`.
pub fn delay_execution(alertable: bool, timeout: Option<Duration>) -> NtResult<NtStatus> {
    safe_point_wait(Handle::NULL, alertable, timeout)
}

/// Waits for the thread `handle` refers to to terminate: `STATUS_WAIT_0`, or
/// `STATUS_TIMEOUT`. Alertable waits end as for [`delay_execution`].
pub fn wait_for_thread(
    handle: Handle,
    alertable: bool,
    timeout: Option<Duration>,
) -> NtResult<NtStatus> {
    if handle.is_null() {
        return Err(NtStatus::INVALID_HANDLE);
    }
    safe_point_wait(handle, alertable, timeout)
}

/// Runs all queued APCs and consumes a pending alert. Returns
/// `STATUS_USER_APC` if an APC ran, `STATUS_ALERTED` if only an alert was
/// pending, or `STATUS_SUCCESS`.
pub fn test_alert() -> NtResult<NtStatus> {
    let teb = current()?;
    let mut delivered = false;
    loop {
        match teb.call(Request::TestAlert)? {
            Reply::Alert {
                status: NtStatus::USER_APC,
                apc: Some(apc),
            } => {
                deliver(apc);
                delivered = true;
            }
            Reply::Alert { status, .. } => {
                return Ok(if delivered { NtStatus::USER_APC } else { status });
            }
            other => return Err(unexpected(other)),
        }
    }
}

pub fn current_thread_id() -> NtResult<u32> {
    Ok(current()?.thread_id())
}

pub fn current_process_id() -> NtResult<u32> {
    Ok(current()?.process_id())
}
