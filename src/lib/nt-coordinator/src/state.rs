use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, trace, warn};
use nt_api::time::FileTime;
use nt_api::{
    ClientId, Context, DebugRegisters, Handle, NtResult, NtStatus, ProcessAccess, ThreadAccess,
};
use nt_session::{ApcRecord, ConnectionId, ControlConnection, ThreadInfoSnapshot};
use parking_lot::Mutex;

use crate::handles::{HandleEntry, HandleTable, Object};

/// Suspend counts saturate here.
pub const MAX_SUSPEND_COUNT: u32 = 127;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunState {
    /// Registered, but the thread hasn't sent `InitThread` yet.
    Created,
    Running,
    Terminated,
}

#[derive(Debug)]
pub struct ThreadRecord {
    pub tid: u32,
    pub pid: u32,
    pub state: RunState,
    pub suspend_count: u32,
    /// Register state while the thread is blocked at a safe point.
    pub parked: Option<Context>,
    /// Canonical copy of the debug registers.
    pub debug: DebugRegisters,
    pub priority: i32,
    pub base_priority: i32,
    pub affinity: u64,
    pub exit_code: NtStatus,
    pub creation_time: FileTime,
    pub exit_time: FileTime,
    pub apcs: VecDeque<ApcRecord>,
    pub alerted: bool,
    /// `pthread_t` to signal; 0 if unknown.
    pub native_id: u64,
    pub teb: u64,
    pub start_address: u64,
    pub impersonation_token: Handle,
    pub hide_from_debugger: bool,
    /// Fixed when the thread terminates.
    pub last_in_process: bool,
    /// Handle entries naming this thread, over all tables.
    pub handle_refs: u32,
    /// A connection is bound to the thread.
    pub connected: bool,
}

impl ThreadRecord {
    pub fn new(tid: u32, pid: u32, affinity: u64) -> Self {
        Self {
            tid,
            pid,
            state: RunState::Created,
            suspend_count: 0,
            parked: None,
            debug: DebugRegisters::default(),
            priority: 0,
            base_priority: 0,
            affinity,
            exit_code: NtStatus::STILL_ACTIVE,
            creation_time: now(),
            exit_time: FileTime::ZERO,
            apcs: VecDeque::new(),
            alerted: false,
            native_id: 0,
            teb: 0,
            start_address: 0,
            impersonation_token: Handle::NULL,
            hide_from_debugger: false,
            last_in_process: false,
            handle_refs: 0,
            connected: false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == RunState::Terminated
    }

    /// Dead, and nothing can name it any more.
    fn is_unreferenced(&self) -> bool {
        self.is_terminated() && !self.connected && self.handle_refs == 0
    }

    /// The context a parked thread resumes with: its parked registers with the
    /// canonical debug registers merged in.
    pub fn wake_context(&mut self, fallback: Context) -> Context {
        let mut context = self.parked.take().unwrap_or(fallback);
        context.set_debug_registers(&self.debug);
        context
    }
}

pub struct ProcessRecord {
    pub handles: HandleTable,
    pub live_threads: u32,
    pub affinity: u64,
    pub control: Arc<ControlConnection>,
    /// Serializes calls on `control`; at most one may be in flight.
    pub control_lock: Arc<Mutex<()>>,
    pub exited: bool,
    /// Connections bound to the process or one of its threads.
    pub connections: u32,
    /// Handle entries naming this process, over all tables.
    pub handle_refs: u32,
}

impl ProcessRecord {
    pub fn new(affinity: u64, control: Arc<ControlConnection>) -> Self {
        Self {
            handles: HandleTable::new(),
            live_threads: 1,
            affinity,
            control,
            control_lock: Arc::new(Mutex::new(())),
            exited: false,
            connections: 0,
            handle_refs: 0,
        }
    }

    fn is_unreferenced(&self) -> bool {
        self.exited && self.connections == 0 && self.handle_refs == 0
    }
}

/// Who is on the other end of a connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Binding {
    pub pid: u32,
    /// `None` until a `NewThread` request names the connection. Unbound
    /// connections act for the process as a whole.
    pub tid: Option<u32>,
}

pub struct ServerState {
    next_id: u32,
    next_connection: u64,
    pub open_connections: u32,
    pub processes: HashMap<u32, ProcessRecord>,
    pub threads: HashMap<u32, ThreadRecord>,
    pub bindings: HashMap<ConnectionId, Binding>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            next_id: 4,
            next_connection: 1,
            open_connections: 0,
            processes: HashMap::new(),
            threads: HashMap::new(),
            bindings: HashMap::new(),
        }
    }

    /// Process and thread ids share one space.
    pub fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 4;
        id
    }

    pub fn allocate_connection(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        id
    }

    /// Binds a new connection. Its process must exist, and so must its thread
    /// if it names one.
    pub fn bind(&mut self, id: ConnectionId, binding: Binding) {
        if let Some(process) = self.processes.get_mut(&binding.pid) {
            process.connections += 1;
        }
        if let Some(thread) = binding.tid.and_then(|tid| self.threads.get_mut(&tid)) {
            thread.connected = true;
        }
        self.bindings.insert(id, binding);
    }

    /// Moves an unbound connection of a process over to its new thread `tid`.
    pub fn bind_thread(&mut self, id: ConnectionId, tid: u32) {
        if let Some(binding) = self.bindings.get_mut(&id) {
            binding.tid = Some(tid);
        }
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.connected = true;
        }
    }

    /// Forgets a closed connection, and with it whatever only it kept alive.
    pub fn unbind(&mut self, id: ConnectionId) {
        let Some(binding) = self.bindings.remove(&id) else {
            return;
        };
        if let Some(tid) = binding.tid {
            if let Some(thread) = self.threads.get_mut(&tid) {
                thread.connected = false;
            }
            self.collect(Object::Thread(tid));
        }
        if let Some(process) = self.processes.get_mut(&binding.pid) {
            process.connections -= 1;
        }
        self.collect(Object::Process(binding.pid));
    }

    /// Adds a handle to `object` to the table of `owner`.
    pub fn add_handle(&mut self, owner: u32, object: Object, access: u32) -> NtResult<Handle> {
        match object {
            Object::Thread(tid) => self.thread_mut(tid)?.handle_refs += 1,
            Object::Process(pid) => self.process_mut(pid)?.handle_refs += 1,
        }
        match self.processes.get_mut(&owner) {
            Some(process) => Ok(process.handles.insert(object, access)),
            None => {
                self.release(object);
                Err(NtStatus::INVALID_CID)
            }
        }
    }

    /// Closes a handle in the table of `owner`.
    pub fn remove_handle(&mut self, owner: u32, handle: Handle) -> NtResult<HandleEntry> {
        let entry = self.process_mut(owner)?.handles.remove(handle)?;
        self.release(entry.object);
        Ok(entry)
    }

    /// Drops one handle reference to `object`, forgetting it if that was the
    /// last thing naming it.
    fn release(&mut self, object: Object) {
        match object {
            Object::Thread(tid) => {
                if let Some(thread) = self.threads.get_mut(&tid) {
                    thread.handle_refs -= 1;
                }
            }
            Object::Process(pid) => {
                if let Some(process) = self.processes.get_mut(&pid) {
                    process.handle_refs -= 1;
                }
            }
        }
        self.collect(object);
    }

    fn collect(&mut self, object: Object) {
        let mut pending = vec![object];
        while let Some(object) = pending.pop() {
            match object {
                Object::Thread(tid) => {
                    if self.threads.get(&tid).is_some_and(ThreadRecord::is_unreferenced) {
                        self.threads.remove(&tid);
                        trace!("forgot thread {tid}");
                    }
                }
                Object::Process(pid) => {
                    if !self.processes.get(&pid).is_some_and(ProcessRecord::is_unreferenced) {
                        continue;
                    }
                    let Some(process) = self.processes.remove(&pid) else {
                        continue;
                    };
                    debug!("forgot process {pid}");
                    // The dead process's handles go with it.
                    for entry in process.handles.into_entries() {
                        match entry.object {
                            Object::Thread(tid) => {
                                if let Some(thread) = self.threads.get_mut(&tid) {
                                    thread.handle_refs -= 1;
                                }
                            }
                            Object::Process(other) => {
                                if let Some(process) = self.processes.get_mut(&other) {
                                    process.handle_refs -= 1;
                                }
                            }
                        }
                        pending.push(entry.object);
                    }
                }
            }
        }
    }

    pub fn process_mut(&mut self, pid: u32) -> NtResult<&mut ProcessRecord> {
        self.processes.get_mut(&pid).ok_or(NtStatus::INVALID_CID)
    }

    pub fn thread(&self, tid: u32) -> NtResult<&ThreadRecord> {
        self.threads.get(&tid).ok_or(NtStatus::INVALID_HANDLE)
    }

    pub fn thread_mut(&mut self, tid: u32) -> NtResult<&mut ThreadRecord> {
        self.threads.get_mut(&tid).ok_or(NtStatus::INVALID_HANDLE)
    }

    /// Looks up a thread handle in the caller's table and checks `needed`.
    pub fn resolve_thread(
        &self,
        caller: Binding,
        handle: Handle,
        needed: ThreadAccess,
    ) -> NtResult<u32> {
        if handle == Handle::CURRENT_THREAD {
            return caller.tid.ok_or(NtStatus::INVALID_HANDLE);
        }
        if handle == Handle::CURRENT_PROCESS {
            return Err(NtStatus::OBJECT_TYPE_MISMATCH);
        }
        let process = self
            .processes
            .get(&caller.pid)
            .ok_or(NtStatus::INVALID_HANDLE)?;
        let entry = process.handles.get(handle)?;
        let Object::Thread(tid) = entry.object else {
            return Err(NtStatus::OBJECT_TYPE_MISMATCH);
        };
        if !ThreadAccess::from_bits_retain(entry.access).contains(needed) {
            return Err(NtStatus::ACCESS_DENIED);
        }
        Ok(tid)
    }

    pub fn resolve_process(
        &self,
        caller: Binding,
        handle: Handle,
        needed: ProcessAccess,
    ) -> NtResult<u32> {
        if handle == Handle::CURRENT_PROCESS {
            return Ok(caller.pid);
        }
        if handle == Handle::CURRENT_THREAD {
            return Err(NtStatus::OBJECT_TYPE_MISMATCH);
        }
        let process = self
            .processes
            .get(&caller.pid)
            .ok_or(NtStatus::INVALID_HANDLE)?;
        let entry = process.handles.get(handle)?;
        let Object::Process(pid) = entry.object else {
            return Err(NtStatus::OBJECT_TYPE_MISMATCH);
        };
        if !ProcessAccess::from_bits_retain(entry.access).contains(needed) {
            return Err(NtStatus::ACCESS_DENIED);
        }
        Ok(pid)
    }

    /// Whether `tid` is the only live thread of its process.
    pub fn is_last(&self, tid: u32) -> bool {
        let Some(thread) = self.threads.get(&tid) else {
            return false;
        };
        if thread.is_terminated() {
            return thread.last_in_process;
        }
        self.processes
            .get(&thread.pid)
            .is_some_and(|p| p.live_threads == 1)
    }

    pub fn snapshot(&self, tid: u32) -> NtResult<ThreadInfoSnapshot> {
        let thread = self.thread(tid)?;
        Ok(ThreadInfoSnapshot {
            client_id: ClientId::new(thread.pid, thread.tid),
            exit_code: thread.exit_code,
            creation_time: thread.creation_time,
            exit_time: thread.exit_time,
            affinity: thread.affinity,
            priority: thread.priority,
            base_priority: thread.base_priority,
            is_last: self.is_last(tid),
            teb: thread.teb,
            start_address: thread.start_address,
            impersonation_token: thread.impersonation_token,
            hide_from_debugger: thread.hide_from_debugger,
            suspend_count: thread.suspend_count,
        })
    }

    /// Marks `tid` dead with `exit_code` and does the process accounting.
    /// Returns whether it was the last live thread. The caller must wake
    /// waiters afterwards.
    pub fn terminate(&mut self, tid: u32, exit_code: u32) -> NtResult<bool> {
        let thread = self.threads.get_mut(&tid).ok_or(NtStatus::INVALID_HANDLE)?;
        if thread.is_terminated() {
            return Err(NtStatus::INVALID_HANDLE);
        }
        thread.state = RunState::Terminated;
        thread.exit_code = NtStatus::from_u32(exit_code);
        thread.exit_time = now();
        thread.apcs.clear();
        thread.alerted = false;
        let pid = thread.pid;

        let process = self.processes.get_mut(&pid).ok_or(NtStatus::INVALID_CID)?;
        debug_assert!(process.live_threads > 0);
        process.live_threads -= 1;
        let last = process.live_threads == 0;
        if last {
            debug!("process {pid} has no live threads left");
            process.exited = true;
            process.control.shutdown();
        }
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.last_in_process = last;
        }
        debug!("thread {tid} of process {pid} terminated with {exit_code:#x}, last: {last}");
        Ok(last)
    }
}

pub fn now() -> FileTime {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(FileTime::from_unix)
        .unwrap_or(FileTime::ZERO)
}

/// Interrupts a running thread so that it parks itself at a safe point.
pub fn signal_thread(native_id: u64) {
    if native_id == 0 {
        return;
    }
    let signal = match nix::sys::signal::Signal::try_from(nt_session::SUSPEND_SIGNAL) {
        Ok(signal) => signal,
        Err(e) => {
            warn!("bad suspend signal: {e}");
            return;
        }
    };
    if let Err(e) = nix::sys::pthread::pthread_kill(native_id as libc::pthread_t, signal) {
        warn!("couldn't signal thread {native_id:#x}: {e}");
    }
}
