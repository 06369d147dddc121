use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use nt_api::{Context, ContextFlags, Handle, NtResult, NtStatus, ProcessAccess, ThreadAccess};
use nt_session::{
    ApcCall, ApcRecord, ApcResult, Connection, ConnectionId, ControlConnection, NewThreadRequest,
    ProcessBootstrap, Reply, Request, SessionServer, ThreadInfoUpdate, WaitRequest,
};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::CoordinatorConfig;
use crate::handles::Object;
use crate::state::{
    signal_thread, Binding, ProcessRecord, RunState, ServerState, ThreadRecord, MAX_SUSPEND_COUNT,
};

/// The reference session server. Cheap to share; all clones of the inner
/// state are held by the service threads.
pub struct Coordinator {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<ServerState>,
    /// Notified on every change a parked thread might be waiting for.
    changed: Condvar,
    config: CoordinatorConfig,
}

/// How a park at a safe point ended.
enum ParkEnd {
    Released(Context),
    Terminated { exit_code: u32, is_last: bool },
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState::new()),
                changed: Condvar::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Connections currently open, over all processes.
    pub fn open_connections(&self) -> u32 {
        self.shared.state.lock().open_connections
    }

    /// Live threads of `pid` as the server counts them.
    pub fn live_threads(&self, pid: u32) -> Option<u32> {
        self.shared
            .state
            .lock()
            .processes
            .get(&pid)
            .map(|p| p.live_threads)
    }

    /// Whether thread `tid` is stopped at a safe point or in its suspend
    /// handler, with its registers held by the server.
    pub fn is_parked(&self, tid: u32) -> Option<bool> {
        self.shared
            .state
            .lock()
            .threads
            .get(&tid)
            .map(|t| t.parked.is_some())
    }

    /// Entries in the handle table of `pid`.
    pub fn open_handles(&self, pid: u32) -> Option<usize> {
        self.shared
            .state
            .lock()
            .processes
            .get(&pid)
            .map(|p| p.handles.len())
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

impl SessionServer for Coordinator {
    fn new_process(&self) -> NtResult<ProcessBootstrap> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let pid = state.allocate_id();
        let tid = state.allocate_id();
        let affinity = shared.config.process_affinity();
        let control = Arc::new(ControlConnection::new());
        state
            .processes
            .insert(pid, ProcessRecord::new(affinity, Arc::clone(&control)));
        state
            .threads
            .insert(tid, ThreadRecord::new(tid, pid, affinity));

        let binding = Binding {
            pid,
            tid: Some(tid),
        };
        let connection = match shared.open_connection(&mut state, binding) {
            Ok(connection) => connection,
            Err(status) => {
                state.threads.remove(&tid);
                state.processes.remove(&pid);
                return Err(status);
            }
        };
        debug!("registered process {pid} with initial thread {tid}");

        Ok(ProcessBootstrap {
            pid,
            tid,
            connection,
            control,
        })
    }

    fn connect(&self, pid: u32) -> NtResult<Arc<Connection>> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let process = state.processes.get(&pid).ok_or(NtStatus::INVALID_CID)?;
        if process.exited {
            return Err(NtStatus::PROCESS_IS_TERMINATING);
        }
        shared.open_connection(&mut state, Binding { pid, tid: None })
    }
}

impl Shared {
    fn open_connection(
        self: &Arc<Self>,
        state: &mut ServerState,
        binding: Binding,
    ) -> NtResult<Arc<Connection>> {
        if state.open_connections >= self.config.max_connections {
            debug!(
                "refusing connection for process {}: {} open",
                binding.pid, state.open_connections
            );
            return Err(NtStatus::TOO_MANY_OPENED_FILES);
        }
        let id = state.allocate_connection();
        let connection = Arc::new(Connection::new(id));

        let shared = Arc::clone(self);
        let served = Arc::clone(&connection);
        std::thread::Builder::new()
            .name(format!("nt-session-{}", id.0))
            .spawn(move || shared.serve(served))
            .map_err(|e| {
                warn!("couldn't start a service thread: {e}");
                NtStatus::INSUFFICIENT_RESOURCES
            })?;

        // The service thread can't look up the binding before we unlock.
        state.open_connections += 1;
        state.bind(id, binding);
        Ok(connection)
    }

    fn serve(self: Arc<Self>, connection: Arc<Connection>) {
        let id = connection.id();
        while let Ok(request) = connection.next_request() {
            trace!("{id:?} <- {}", request.kind());
            let reply = self.dispatch(id, request);
            trace!("{id:?} -> {}", reply.kind());
            connection.reply(reply);
        }
        connection.disconnect();

        let mut state = self.state.lock();
        state.unbind(id);
        state.open_connections -= 1;
        trace!("{id:?} closed");
    }

    fn dispatch(&self, id: ConnectionId, request: Request) -> Reply {
        let mut state = self.state.lock();
        let Some(&caller) = state.bindings.get(&id) else {
            return Reply::Status(NtStatus::INVALID_HANDLE);
        };
        if let Some(thread) = caller.tid.and_then(|tid| state.threads.get(&tid)) {
            if thread.is_terminated() && !allowed_after_termination(&request) {
                return terminated_reply(thread);
            }
        }

        let result = match request {
            Request::InitThread {
                native_id,
                teb,
                context,
            } => self.init_thread(&mut state, caller, native_id, teb, context),
            Request::NewThread(req) => new_thread(&mut state, caller, req),
            Request::OpenThread { tid, access } => open_thread(&mut state, caller, tid, access),
            Request::OpenProcess { pid, access } => open_process(&mut state, caller, pid, access),
            Request::CloseHandle(handle) => close_handle(&mut state, caller, handle),
            Request::GetThreadInfo(handle) => state
                .resolve_thread(caller, handle, ThreadAccess::QUERY_INFORMATION)
                .and_then(|tid| state.snapshot(tid))
                .map(Reply::ThreadInfo),
            Request::SetThreadInfo { handle, update } => {
                set_thread_info(&mut state, caller, handle, update)
            }
            Request::SuspendThread(handle) => suspend_thread(&mut state, caller, handle),
            Request::ResumeThread(handle) => self.resume_thread(&mut state, caller, handle),
            Request::GetThreadContext { handle, flags } => {
                get_thread_context(&mut state, caller, handle, flags)
            }
            Request::SetThreadContext { handle, context } => {
                set_thread_context(&mut state, caller, handle, context)
            }
            Request::QueueApc { handle, apc } => self.queue_apc(&mut state, caller, handle, apc),
            Request::TerminateThread { handle, exit_code } => {
                self.terminate_thread(&mut state, caller, handle, exit_code)
            }
            Request::Wait(req) => self.wait(&mut state, caller, req),
            Request::Park { context } => {
                let tid = caller.tid.ok_or(NtStatus::INVALID_HANDLE);
                tid.and_then(|tid| {
                    state.thread_mut(tid)?.parked = Some(context);
                    Ok(match self.park(&mut state, tid, context)? {
                        ParkEnd::Released(context) => Reply::Resumed { context },
                        ParkEnd::Terminated { exit_code, is_last } => {
                            Reply::Terminated { exit_code, is_last }
                        }
                    })
                })
            }
            Request::TestAlert => test_alert(&mut state, caller),
            Request::QueueProcessApc { process, call } => {
                self.queue_process_apc(&mut state, caller, process, call)
            }
        };
        result.unwrap_or_else(Reply::Status)
    }

    /// Blocks until the thread's suspend count is zero or it is terminated.
    /// `tid` must already be parked.
    fn park(
        &self,
        state: &mut MutexGuard<'_, ServerState>,
        tid: u32,
        context: Context,
    ) -> NtResult<ParkEnd> {
        loop {
            let thread = state.thread_mut(tid)?;
            if thread.is_terminated() {
                thread.parked = None;
                return Ok(ParkEnd::Terminated {
                    exit_code: thread.exit_code.to_u32(),
                    is_last: thread.last_in_process,
                });
            }
            if thread.suspend_count == 0 {
                return Ok(ParkEnd::Released(thread.wake_context(context)));
            }
            self.changed.wait(state);
        }
    }

    fn init_thread(
        &self,
        state: &mut MutexGuard<'_, ServerState>,
        caller: Binding,
        native_id: u64,
        teb: u64,
        context: Context,
    ) -> NtResult<Reply> {
        let tid = caller.tid.ok_or(NtStatus::INVALID_HANDLE)?;
        let thread = state.thread_mut(tid)?;
        if thread.state != RunState::Created {
            return Err(NtStatus::INVALID_PARAMETER);
        }
        thread.state = RunState::Running;
        thread.native_id = native_id;
        thread.teb = teb;
        thread.parked = Some(context);
        debug!(
            "thread {tid} started, suspend count {}",
            thread.suspend_count
        );
        Ok(match self.park(state, tid, context)? {
            ParkEnd::Released(context) => Reply::Started { context },
            ParkEnd::Terminated { exit_code, is_last } => Reply::Terminated { exit_code, is_last },
        })
    }

    fn resume_thread(
        &self,
        state: &mut ServerState,
        caller: Binding,
        handle: Handle,
    ) -> NtResult<Reply> {
        let tid = state.resolve_thread(caller, handle, ThreadAccess::SUSPEND_RESUME)?;
        let thread = state.thread_mut(tid)?;
        let previous = thread.suspend_count;
        if previous > 0 {
            thread.suspend_count -= 1;
            if thread.suspend_count == 0 {
                self.changed.notify_all();
            }
        }
        Ok(Reply::SuspendCount(previous))
    }

    fn queue_apc(
        &self,
        state: &mut ServerState,
        caller: Binding,
        handle: Handle,
        apc: Option<ApcRecord>,
    ) -> NtResult<Reply> {
        let tid = state.resolve_thread(caller, handle, ThreadAccess::SET_CONTEXT)?;
        let thread = state.thread_mut(tid)?;
        if thread.is_terminated() {
            return Err(NtStatus::THREAD_IS_TERMINATING);
        }
        match apc {
            Some(apc) => thread.apcs.push_back(apc),
            None => thread.alerted = true,
        }
        self.changed.notify_all();
        Ok(Reply::Status(NtStatus::SUCCESS))
    }

    fn terminate_thread(
        &self,
        state: &mut ServerState,
        caller: Binding,
        handle: Handle,
        exit_code: u32,
    ) -> NtResult<Reply> {
        let tid = state.resolve_thread(caller, handle, ThreadAccess::TERMINATE)?;

        if Some(tid) == caller.tid {
            if !state.thread(tid)?.is_terminated() {
                state.terminate(tid, exit_code)?;
                self.changed.notify_all();
            }
            return Ok(terminated_reply(state.thread(tid)?));
        }

        let thread = state.thread(tid)?;
        let interrupt = thread.state == RunState::Running && thread.parked.is_none();
        let native_id = thread.native_id;
        let is_last = state.terminate(tid, exit_code)?;
        // A parked target is woken through the condvar; a running one is sent
        // to a safe point, where it observes the termination. The target can't
        // have exited natively yet since that needs this lock.
        if interrupt {
            signal_thread(native_id);
        }
        self.changed.notify_all();
        Ok(Reply::TerminateAck { is_last })
    }

    fn wait(
        &self,
        state: &mut MutexGuard<'_, ServerState>,
        caller: Binding,
        req: WaitRequest,
    ) -> NtResult<Reply> {
        let tid = caller.tid.ok_or(NtStatus::INVALID_HANDLE)?;
        let target = if req.object.is_null() {
            None
        } else {
            Some(state.resolve_thread(caller, req.object, ThreadAccess::SYNCHRONIZE)?)
        };
        // An unrepresentable deadline is as good as none.
        let deadline = req.timeout.and_then(|t| Instant::now().checked_add(t));
        state.thread_mut(tid)?.parked = Some(req.context);

        loop {
            let target_done = target.is_some_and(|t| {
                state
                    .threads
                    .get(&t)
                    .map_or(true, |thread| thread.is_terminated())
            });
            let expired = deadline.is_some_and(|d| Instant::now() >= d);

            let thread = state.thread_mut(tid)?;
            if thread.is_terminated() {
                thread.parked = None;
                return Ok(terminated_reply(thread));
            }
            let suspended = thread.suspend_count > 0;
            if !suspended {
                let mut woken = None;
                if req.alertable {
                    if let Some(apc) = thread.apcs.pop_front() {
                        woken = Some((NtStatus::USER_APC, Some(apc)));
                    } else if thread.alerted {
                        thread.alerted = false;
                        woken = Some((NtStatus::ALERTED, None));
                    }
                }
                if woken.is_none() && target_done {
                    woken = Some((NtStatus::WAIT_0, None));
                }
                if woken.is_none() && expired {
                    let status = if target.is_none() && req.timeout == Some(Duration::ZERO) {
                        NtStatus::SUCCESS
                    } else {
                        NtStatus::TIMEOUT
                    };
                    woken = Some((status, None));
                }
                if let Some((status, apc)) = woken {
                    return Ok(Reply::Woken {
                        status,
                        context: thread.wake_context(req.context),
                        apc,
                    });
                }
            }

            // A suspended thread stays parked past its deadline; the resume wakes it.
            match deadline {
                Some(deadline) if !suspended => {
                    self.changed.wait_until(state, deadline);
                }
                _ => self.changed.wait(state),
            }
        }
    }

    fn queue_process_apc(
        &self,
        state: &mut MutexGuard<'_, ServerState>,
        caller: Binding,
        process: Handle,
        call: ApcCall,
    ) -> NtResult<Reply> {
        let pid = state.resolve_process(caller, process, ProcessAccess::CREATE_THREAD)?;
        let target = state.process_mut(pid)?;
        if target.exited {
            return Err(NtStatus::PROCESS_IS_TERMINATING);
        }
        let control = Arc::clone(&target.control);
        let control_lock = Arc::clone(&target.control_lock);
        debug!("routing {call:?} to process {pid}");

        // The target process needs the server to run the call.
        let result = MutexGuard::unlocked(state, || {
            let _serial = control_lock.lock();
            control.request(call)
        })?;

        match result {
            ApcResult::CreateThread {
                status,
                handle,
                tid,
            } => {
                if status.is_error() {
                    return Err(status);
                }
                // Move the new handle from the target's table into the caller's.
                // It keeps referring to the same thread, so no counts change.
                let entry = state.process_mut(pid)?.handles.remove(handle)?;
                let handle = state
                    .process_mut(caller.pid)?
                    .handles
                    .insert(entry.object, entry.access);
                Ok(Reply::ThreadCreated { handle, tid })
            }
        }
    }
}

/// Requests a terminated thread may still make while it cleans up.
fn allowed_after_termination(request: &Request) -> bool {
    match request {
        Request::ResumeThread(_) | Request::CloseHandle(_) => true,
        Request::TerminateThread { handle, .. } => *handle != Handle::CURRENT_THREAD,
        _ => false,
    }
}

fn terminated_reply(thread: &ThreadRecord) -> Reply {
    Reply::Terminated {
        exit_code: thread.exit_code.to_u32(),
        is_last: thread.last_in_process,
    }
}

fn new_thread(state: &mut ServerState, caller: Binding, req: NewThreadRequest) -> NtResult<Reply> {
    let pid = caller.pid;
    let process = state.process_mut(pid)?;
    if process.exited {
        return Err(NtStatus::PROCESS_IS_TERMINATING);
    }
    let affinity = process.affinity;
    match state.bindings.get(&req.connection) {
        Some(binding) if binding.pid == pid && binding.tid.is_none() => (),
        _ => return Err(NtStatus::INVALID_PARAMETER),
    }

    let tid = state.allocate_id();
    let mut thread = ThreadRecord::new(tid, pid, affinity);
    thread.suspend_count = u32::from(req.suspended);
    thread.debug = req.debug;
    thread.start_address = req.start_address;
    state.threads.insert(tid, thread);
    state.bind_thread(req.connection, tid);
    state.process_mut(pid)?.live_threads += 1;
    let handle = state.add_handle(pid, Object::Thread(tid), req.access.bits())?;
    debug!(
        "registered thread {tid} in process {pid} (suspended: {})",
        req.suspended
    );
    Ok(Reply::ThreadCreated { handle, tid })
}

fn open_thread(
    state: &mut ServerState,
    caller: Binding,
    tid: u32,
    access: ThreadAccess,
) -> NtResult<Reply> {
    if !state.threads.contains_key(&tid) {
        return Err(NtStatus::INVALID_CID);
    }
    let handle = state.add_handle(caller.pid, Object::Thread(tid), access.bits())?;
    Ok(Reply::Opened(handle))
}

fn open_process(
    state: &mut ServerState,
    caller: Binding,
    pid: u32,
    access: ProcessAccess,
) -> NtResult<Reply> {
    if !state.processes.contains_key(&pid) {
        return Err(NtStatus::INVALID_CID);
    }
    let handle = state.add_handle(caller.pid, Object::Process(pid), access.bits())?;
    Ok(Reply::Opened(handle))
}

fn close_handle(state: &mut ServerState, caller: Binding, handle: Handle) -> NtResult<Reply> {
    if handle.is_pseudo() {
        return Ok(Reply::Status(NtStatus::SUCCESS));
    }
    state.remove_handle(caller.pid, handle)?;
    Ok(Reply::Status(NtStatus::SUCCESS))
}

fn set_thread_info(
    state: &mut ServerState,
    caller: Binding,
    handle: Handle,
    update: ThreadInfoUpdate,
) -> NtResult<Reply> {
    let tid = state.resolve_thread(caller, handle, ThreadAccess::SET_INFORMATION)?;
    let pid = state.thread(tid)?.pid;
    let process_affinity = state.process_mut(pid)?.affinity;

    let valid_priority = |p: Option<i32>| p.map_or(true, nt_api::info::is_valid_priority);
    if !valid_priority(update.priority) || !valid_priority(update.base_priority) {
        return Err(NtStatus::INVALID_PARAMETER);
    }
    if let Some(mask) = update.affinity {
        if mask == 0 || mask & !process_affinity != 0 {
            return Err(NtStatus::INVALID_PARAMETER);
        }
    }

    let thread = state.thread_mut(tid)?;
    if let Some(priority) = update.priority {
        thread.priority = priority;
    }
    if let Some(priority) = update.base_priority {
        thread.base_priority = priority;
    }
    if let Some(mask) = update.affinity {
        thread.affinity = mask;
    }
    if let Some(token) = update.impersonation_token {
        thread.impersonation_token = token;
    }
    if let Some(address) = update.start_address {
        thread.start_address = address;
    }
    if let Some(hide) = update.hide_from_debugger {
        thread.hide_from_debugger = hide;
    }
    Ok(Reply::Status(NtStatus::SUCCESS))
}

fn suspend_thread(state: &mut ServerState, caller: Binding, handle: Handle) -> NtResult<Reply> {
    let tid = state.resolve_thread(caller, handle, ThreadAccess::SUSPEND_RESUME)?;
    let thread = state.thread_mut(tid)?;
    if thread.is_terminated() {
        return Err(NtStatus::THREAD_IS_TERMINATING);
    }
    if thread.suspend_count >= MAX_SUSPEND_COUNT {
        return Err(NtStatus::SUSPEND_COUNT_EXCEEDED);
    }
    let previous = thread.suspend_count;
    thread.suspend_count += 1;
    if previous == 0 && thread.state == RunState::Running && thread.parked.is_none() {
        // For a self-suspend the signal stays pending until the call returns.
        signal_thread(thread.native_id);
    }
    Ok(Reply::SuspendCount(previous))
}

fn get_thread_context(
    state: &mut ServerState,
    caller: Binding,
    handle: Handle,
    flags: ContextFlags,
) -> NtResult<Reply> {
    let tid = state.resolve_thread(caller, handle, ThreadAccess::GET_CONTEXT)?;
    let thread = state.thread(tid)?;

    if Some(tid) == caller.tid {
        // Everything but the debug registers is the caller's own business.
        return Ok(Reply::SelfTarget {
            debug: thread.debug,
        });
    }
    if thread.is_terminated() {
        return Err(NtStatus::THREAD_IS_TERMINATING);
    }
    match thread.parked {
        Some(mut parked) => {
            parked.set_debug_registers(&thread.debug);
            Ok(Reply::Context(parked.subset(flags)))
        }
        None => Ok(Reply::Status(NtStatus::PENDING)),
    }
}

fn set_thread_context(
    state: &mut ServerState,
    caller: Binding,
    handle: Handle,
    context: Context,
) -> NtResult<Reply> {
    let tid = state.resolve_thread(caller, handle, ThreadAccess::SET_CONTEXT)?;
    let flags = context.flags()?;
    let thread = state.thread_mut(tid)?;

    if Some(tid) == caller.tid {
        if flags.has_debug_registers() {
            thread.debug = context.debug_registers();
        }
        return Ok(Reply::SelfTarget {
            debug: thread.debug,
        });
    }
    if thread.is_terminated() {
        return Err(NtStatus::THREAD_IS_TERMINATING);
    }
    let Some(parked) = thread.parked.as_mut() else {
        return Ok(Reply::Status(NtStatus::PENDING));
    };
    parked.copy_groups_from(&context, flags.without_debug_registers());
    if flags.has_debug_registers() {
        thread.debug = context.debug_registers();
    }
    Ok(Reply::Status(NtStatus::SUCCESS))
}

fn test_alert(state: &mut ServerState, caller: Binding) -> NtResult<Reply> {
    let tid = caller.tid.ok_or(NtStatus::INVALID_HANDLE)?;
    let thread = state.thread_mut(tid)?;
    let reply = if let Some(apc) = thread.apcs.pop_front() {
        Reply::Alert {
            status: NtStatus::USER_APC,
            apc: Some(apc),
        }
    } else if std::mem::take(&mut thread.alerted) {
        Reply::Alert {
            status: NtStatus::ALERTED,
            apc: None,
        }
    } else {
        Reply::Alert {
            status: NtStatus::SUCCESS,
            apc: None,
        }
    };
    Ok(reply)
}
