use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal};
use nt_api::{ClientId, Context, DebugRegisters, Handle, NtResult, NtStatus};
use nt_session::{
    ApcCall, ApcResult, Connection, ControlConnection, Reply, Request, SessionServer,
    SUSPEND_SIGNAL,
};
use once_cell::sync::OnceCell;

use crate::config::RuntimeConfig;
use crate::lifecycle::{self, CreateThreadParams, ExitNotice, ThreadExit};
use crate::lock::ProcessLock;
use crate::sigmask::{self, SignalsBlocked};
use crate::sigstack::{self, RegionLayout, StackRegion};
use crate::teb::{self, StackBounds, Teb, TebInit, ThreadList, ThreadResources, ThreadState};
use crate::tls::TlsBitmap;

/// Called with the exit code once the last thread of a process has exited.
pub type ExitHook = Box<dyn Fn(i32) + Send + Sync>;

/// An emulated process.
///
/// Created on the thread that becomes its initial thread, which later hands
/// the process over with [`teardown`](Process::teardown). Several processes
/// may share one host process; that is what the coordinator's process
/// boundaries are for.
pub struct Process {
    pid: u32,
    pub(crate) server: Arc<dyn SessionServer>,
    pub(crate) config: RuntimeConfig,
    pub(crate) layout: RegionLayout,
    /// Threads in the process that haven't exited. Never decremented before
    /// the thread has left the list and told the server.
    pub(crate) thread_count: AtomicU32,
    pub(crate) state: ProcessLock<ProcessState>,
    initial_teb: AtomicPtr<Teb>,
    exit_hook: ExitHook,
    control: Arc<ControlConnection>,
}

pub(crate) struct ProcessState {
    pub threads: ThreadList,
    pub tls: TlsBitmap,
}

static SUSPEND_HANDLER: OnceCell<()> = OnceCell::new();

impl Process {
    /// Registers a new process with `server` and makes the calling thread its
    /// initial thread. When the last thread exits, the host process exits with
    /// its code.
    pub fn init(config: RuntimeConfig, server: Arc<dyn SessionServer>) -> NtResult<Arc<Self>> {
        Self::init_with_exit_hook(config, server, Box::new(|code| std::process::exit(code)))
    }

    /// As [`init`](Self::init), but the last thread calls `exit_hook` instead
    /// of exiting the host process.
    pub fn init_with_exit_hook(
        config: RuntimeConfig,
        server: Arc<dyn SessionServer>,
        exit_hook: ExitHook,
    ) -> NtResult<Arc<Self>> {
        if !teb::try_current_raw().is_null() {
            // Already the thread of some process.
            return Err(NtStatus::INVALID_PARAMETER);
        }
        install_suspend_handler()?;

        let layout = RegionLayout::new(config.signal_stack_min_size);
        let boot = server.new_process()?;
        let pid = boot.pid;
        let agent = match server.connect(pid) {
            Ok(agent) => agent,
            Err(e) => {
                boot.connection.close();
                return Err(e);
            }
        };
        let process = Arc::new(Process {
            pid,
            server,
            config,
            layout,
            thread_count: AtomicU32::new(0),
            state: ProcessLock::new(ProcessState {
                threads: ThreadList::new(),
                tls: TlsBitmap::new(),
            }),
            initial_teb: AtomicPtr::new(std::ptr::null_mut()),
            exit_hook,
            control: boot.control,
        });

        let teb = match process.enter_initial_thread(boot.tid, Arc::clone(&boot.connection)) {
            Ok(teb) => teb,
            Err(e) => {
                boot.connection.close();
                agent.close();
                return Err(e);
            }
        };
        if let Err(e) = process.start_control_thread(Arc::clone(&agent)) {
            agent.close();
            // Best effort: the server marks the thread, and so the process,
            // dead. The process was never usable, so no exit hook.
            let _ = teb::call_raw(
                &boot.connection,
                Request::TerminateThread {
                    handle: Handle::CURRENT_THREAD,
                    exit_code: e.to_u32(),
                },
            );
            process.abandon_initial_thread(teb);
            return Err(e);
        }
        debug!("process {pid} initialized, initial thread {}", boot.tid);
        Ok(process)
    }

    fn enter_initial_thread(
        self: &Arc<Self>,
        tid: u32,
        connection: Arc<Connection>,
    ) -> NtResult<&'static Teb> {
        let region = StackRegion::allocate(&self.layout)?;
        let block = region.teb();
        // Best guess at where the native stack is.
        let stack_guess = &tid as *const u32 as u64;
        let block = unsafe {
            teb::initialize_block(
                block,
                TebInit {
                    process: Arc::clone(self),
                    connection,
                    client_id: ClientId::new(self.pid, tid),
                    start_address: 0,
                    context: Context::initial(0, 0, stack_guess),
                    stack: StackBounds::default(),
                    resources: ThreadResources {
                        region,
                        stack: None,
                    },
                },
            )
        }?;
        let teb = unsafe { &*block };
        if let Err(e) = teb::set_current(block) {
            unsafe { teb::release_block(block) };
            return Err(e);
        }
        sigstack::install_sigaltstack(block.cast(), &self.layout);

        {
            let guard = self.state.lock();
            unsafe { guard.borrow_mut().threads.push(block) };
            self.thread_count.fetch_add(1, Ordering::SeqCst);
        }
        self.initial_teb.store(block, Ordering::Release);

        teb.set_state(ThreadState::Registered);
        let native_id = nix::sys::pthread::pthread_self() as u64;
        teb.runtime.native_id.set(native_id);
        let context = teb.cached_context();
        // A suspend signal must only arrive once the thread is Running.
        let _blocked = SignalsBlocked::new();
        match teb::call_raw(
            &teb.runtime.connection,
            Request::InitThread {
                native_id,
                teb: teb.address(),
                context,
            },
        ) {
            Ok(Reply::Started { context }) => {
                teb.update_cache(|cache| *cache = context);
                teb.set_state(ThreadState::Running);
                Ok(teb)
            }
            other => {
                warn!("initial thread couldn't start: {other:?}");
                self.abandon_initial_thread(teb);
                Err(other.err().unwrap_or(NtStatus::UNSUCCESSFUL))
            }
        }
    }

    /// Undoes [`enter_initial_thread`](Self::enter_initial_thread) locally,
    /// without telling the server.
    fn abandon_initial_thread(&self, teb: &'static Teb) {
        let block = teb as *const Teb as *mut Teb;
        {
            let guard = self.state.lock();
            unsafe { guard.borrow_mut().threads.unlink(block) };
            self.thread_count.fetch_sub(1, Ordering::SeqCst);
        }
        let _blocked = SignalsBlocked::new();
        sigstack::disable_sigaltstack();
        teb::clear_current();
        self.initial_teb.store(std::ptr::null_mut(), Ordering::Release);
        teb.runtime.connection.close();
        // SAFETY: unlinked, and no longer the thread's signal stack.
        unsafe { teb::release_block(block) };
    }

    fn start_control_thread(self: &Arc<Self>, agent: Arc<Connection>) -> NtResult<()> {
        let process = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("nt-control-{}", self.pid))
            .spawn(move || process.serve_control(agent))
            .map(|_| ())
            .map_err(|e| {
                warn!("couldn't start the control thread: {e}");
                NtStatus::INSUFFICIENT_RESOURCES
            })
    }

    /// Runs calls the server routes into this process until the process
    /// exits.
    fn serve_control(self: Arc<Self>, agent: Arc<Connection>) {
        let call = |request| teb::call_raw(&agent, request);
        while let Ok(apc) = self.control.next_call() {
            debug!("process {} serving {apc:?}", self.pid);
            let result = match apc {
                ApcCall::CreateThread(req) => {
                    let created = if req.entry == 0 {
                        Err(NtStatus::INVALID_PARAMETER)
                    } else {
                        // SAFETY: the address came from a `ThreadEntry` in this
                        // address space.
                        let entry = unsafe {
                            std::mem::transmute::<usize, lifecycle::ThreadEntry>(
                                req.entry as usize,
                            )
                        };
                        let params = CreateThreadParams {
                            entry,
                            arg: req.arg as usize,
                            stack_reserve: req.stack_reserve as usize,
                            stack_commit: req.stack_commit as usize,
                            suspended: req.suspended,
                            access: req.access,
                        };
                        lifecycle::spawn_local(&self, &call, DebugRegisters::default(), &params)
                    };
                    match created {
                        Ok(created) => ApcResult::CreateThread {
                            status: NtStatus::SUCCESS,
                            handle: created.handle,
                            tid: created.tid,
                        },
                        Err(status) => ApcResult::CreateThread {
                            status,
                            handle: Handle::NULL,
                            tid: 0,
                        },
                    }
                }
            };
            self.control.complete(result);
        }
        debug!("process {} control channel closed", self.pid);
        self.control.close();
        agent.close();
    }

    /// Runs `main` as the body of the initial thread, then tears the initial
    /// thread down with its result as exit code.
    ///
    /// If this leaves other threads running, returns the exit code; the process
    /// lives on until they're done. Otherwise the exit hook runs first.
    pub fn run(self: &Arc<Self>, main: impl FnOnce() -> u32) -> NtResult<u32> {
        let teb = self.check_initial()?;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(main));
        let exit_code = match result {
            Ok(code) => code,
            Err(payload) => match payload.downcast::<ThreadExit>() {
                Ok(exit) => exit.exit_code,
                Err(panic) => {
                    self.leave_initial_thread(teb, NtStatus::UNSUCCESSFUL.to_u32());
                    std::panic::resume_unwind(panic)
                }
            },
        };
        self.leave_initial_thread(teb, exit_code);
        Ok(exit_code)
    }

    /// Ends the initial thread's part in the process. The calling thread
    /// must be the initial thread and leaves the runtime.
    pub fn teardown(self: &Arc<Self>, exit_code: u32) -> NtResult<()> {
        let teb = self.check_initial()?;
        self.leave_initial_thread(teb, exit_code);
        Ok(())
    }

    fn check_initial(&self) -> NtResult<&'static Teb> {
        let teb = teb::current()?;
        if !self.is_initial(teb) {
            return Err(NtStatus::INVALID_THREAD);
        }
        Ok(teb)
    }

    fn leave_initial_thread(self: &Arc<Self>, teb: &'static Teb, exit_code: u32) {
        let saved = sigmask::block_all();
        let notice = lifecycle::retire(teb, exit_code);
        teb::clear_current();
        self.initial_teb.store(std::ptr::null_mut(), Ordering::Release);
        debug!(
            "initial thread {} of process {} left with {:#x}",
            teb.thread_id(),
            self.pid,
            notice.exit_code
        );
        // SAFETY: the initial thread runs on its own stack, not its region,
        // and has no alternate signal stack any more.
        unsafe { teb::release_block(teb as *const Teb as *mut Teb) };
        let remaining = self.thread_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            // Nothing of the process is left to exit, so the parked worker
            // would otherwise wait for another process.
            lifecycle::reap();
        }
        sigmask::restore(&saved);
    }

    /// Runs the exit hook. Doesn't log, since it may run on a signal stack.
    pub(crate) fn exit_process(&self, notice: ExitNotice) {
        (self.exit_hook)(notice.exit_code as i32)
    }

    fn is_initial(&self, block: *const Teb) -> bool {
        std::ptr::eq(block, self.initial_teb.load(Ordering::Acquire))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Threads that haven't exited yet, as counted locally.
    pub fn thread_count(&self) -> u32 {
        self.thread_count.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The process of the calling thread.
    pub fn current() -> NtResult<Arc<Process>> {
        Ok(Arc::clone(teb::current()?.process()))
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("thread_count", &self.thread_count())
            .finish_non_exhaustive()
    }
}

fn install_suspend_handler() -> NtResult<()> {
    SUSPEND_HANDLER
        .get_or_try_init(|| {
            let action = SigAction::new(
                SigHandler::SigAction(handle_suspend_signal),
                SaFlags::SA_ONSTACK | SaFlags::SA_RESTART,
                SigSet::all(),
            );
            let signal = Signal::try_from(SUSPEND_SIGNAL).map_err(|e| {
                warn!("bad suspend signal {SUSPEND_SIGNAL}: {e}");
                NtStatus::INSUFFICIENT_RESOURCES
            })?;
            unsafe { nix::sys::signal::sigaction(signal, &action) }
                .map(|_| ())
                .map_err(|e| {
                    warn!("couldn't install the suspend handler: {e}");
                    NtStatus::INSUFFICIENT_RESOURCES
                })
        })
        .copied()
}

/// Parks the interrupted thread with the server until it is resumed. A
/// worker terminated meanwhile exits from here; the initial thread exits at
/// its next entry into the runtime instead.
///
/// Runs on the thread's signal stack. Session calls and the process lock are
/// only used with signals blocked, so the interrupted code holds neither.
/// Must not log, allocate or unwind; an exiting worker only frees memory.
extern "C" fn handle_suspend_signal(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ucontext: *mut c_void,
) {
    let errno = unsafe { *libc::__errno_location() };
    let block = teb::try_current_raw();
    if !block.is_null() {
        // SAFETY: a thread's block outlives its time in the runtime.
        let teb = unsafe { &*block };
        debug_assert_eq!(
            teb::teb_from_stack_address(&errno as *const i32 as usize, teb.process().layout.size),
            block
        );
        if let Some(notice) = park_interrupted(teb) {
            if teb.process().is_initial(block) {
                teb.runtime.pending_exit.set(Some(notice));
            } else {
                lifecycle::exit_interrupted(teb, notice);
            }
        }
    }
    unsafe { *libc::__errno_location() = errno };
}

/// Returns the server's verdict if the thread was terminated while parked.
fn park_interrupted(teb: &Teb) -> Option<ExitNotice> {
    let runtime = &teb.runtime;
    if runtime.state.load() != ThreadState::Running
        || runtime.pending_exit.get().is_some()
        || runtime.exit_ack.get().is_some()
    {
        return None;
    }
    let context = runtime.cache.get();
    match runtime.connection.call(Request::Park { context }) {
        Ok(Reply::Resumed { context }) => {
            runtime.cache.set(context);
            None
        }
        Ok(Reply::Terminated { exit_code, is_last }) => Some(ExitNotice { exit_code, is_last }),
        // Nothing to do about it here; the next call sees the same failure.
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_suspend_handler_installed_once() {
        assert_eq!(install_suspend_handler(), Ok(()));
        assert_eq!(install_suspend_handler(), Ok(()));

        let mut action = std::mem::MaybeUninit::<libc::sigaction>::zeroed();
        let rv = unsafe { libc::sigaction(SUSPEND_SIGNAL, std::ptr::null(), action.as_mut_ptr()) };
        assert_eq!(rv, 0);
        let action = unsafe { action.assume_init() };
        assert_eq!(action.sa_sigaction, handle_suspend_signal as usize);
        assert_ne!(action.sa_flags & libc::SA_ONSTACK, 0);
        assert_ne!(action.sa_flags & libc::SA_SIGINFO, 0);
    }
}
