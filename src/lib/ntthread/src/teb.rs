//! The thread environment block.
//!
//! [`Teb`] starts with the public prefix emulated code expects at fixed
//! offsets; the runtime's own per-thread state follows in [`TebRuntime`]. A
//! block lives at the base of its thread's [`StackRegion`] and is reachable
//! from its thread through a pthread key.

use std::cell::Cell;
use std::ffi::c_void;
use std::sync::atomic::AtomicPtr;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use log::trace;
use memoffset::offset_of;
use nt_api::{ClientId, Context, NtResult, NtStatus};
use nt_session::{Connection, Reply, Request};
use once_cell::sync::OnceCell;
use static_assertions::const_assert_eq;

use crate::lifecycle::{ExitNotice, ThreadExit};
use crate::process::Process;
use crate::sigmask::SignalsBlocked;
use crate::sigstack::{StackRegion, ThreadStack};
use crate::tls::TLS_MINIMUM_AVAILABLE;

/// `exception_list` value of an empty SEH chain.
pub const EXCEPTION_CHAIN_END: usize = usize::MAX;

/// `NT_TIB`.
#[derive(Debug)]
#[repr(C)]
pub struct NtTib {
    pub exception_list: usize,
    pub stack_base: usize,
    pub stack_limit: usize,
    pub sub_system_tib: usize,
    pub fiber_data: usize,
    pub arbitrary_user_pointer: usize,
    /// Linear address of the block itself.
    pub self_: usize,
}

/// `LIST_ENTRY`.
#[derive(Debug)]
#[repr(C)]
pub struct ListEntry {
    pub flink: Cell<*mut ListEntry>,
    pub blink: Cell<*mut ListEntry>,
}

/// The x64 `TEB` up to `TlsExpansionSlots`, followed by runtime state.
///
/// Fields not listed here are reserved and stay zero.
#[repr(C)]
pub struct Teb {
    pub tib: NtTib,
    pub environment_pointer: usize,
    pub client_id: ClientId,
    pub active_rpc_handle: usize,
    pub thread_local_storage_pointer: usize,
    pub process_environment_block: usize,
    pub last_error_value: Cell<u32>,
    pub count_of_owned_critical_sections: u32,
    _reserved1: [u8; 0x1478 - 0x70],
    pub deallocation_stack: usize,
    pub tls_slots: [AtomicPtr<c_void>; TLS_MINIMUM_AVAILABLE],
    /// Links the block into its process's thread list.
    pub tls_links: ListEntry,
    _reserved2: [u8; 0x1780 - 0x1690],
    /// Lazily allocated [`TLS_EXPANSION_SLOTS`](crate::tls::TLS_EXPANSION_SLOTS)
    /// entries; null until the thread first stores into the range.
    pub tls_expansion_slots: AtomicPtr<AtomicPtr<c_void>>,
    pub(crate) runtime: TebRuntime,
}

const_assert_eq!(offset_of!(NtTib, self_), 0x30);
const_assert_eq!(offset_of!(Teb, environment_pointer), 0x38);
const_assert_eq!(offset_of!(Teb, client_id), 0x40);
const_assert_eq!(offset_of!(Teb, active_rpc_handle), 0x50);
const_assert_eq!(offset_of!(Teb, thread_local_storage_pointer), 0x58);
const_assert_eq!(offset_of!(Teb, process_environment_block), 0x60);
const_assert_eq!(offset_of!(Teb, last_error_value), 0x68);
const_assert_eq!(offset_of!(Teb, count_of_owned_critical_sections), 0x6c);
const_assert_eq!(offset_of!(Teb, deallocation_stack), 0x1478);
const_assert_eq!(offset_of!(Teb, tls_slots), 0x1480);
const_assert_eq!(offset_of!(Teb, tls_links), 0x1680);
const_assert_eq!(offset_of!(Teb, tls_expansion_slots), 0x1780);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Block written, native thread not started yet.
    Requested,
    /// Running its bootstrap; waiting for the server to let it start.
    Registered,
    Running,
    /// Past the point of no return; no more user code runs.
    ExitRequested,
    /// Natively joined; the block is about to be released.
    Joined,
}

/// Memory a thread's block is responsible for.
#[derive(Debug)]
pub(crate) struct ThreadResources {
    pub region: StackRegion,
    /// `None` for a thread that brought its own stack.
    pub stack: Option<ThreadStack>,
}

pub(crate) struct TebRuntime {
    pub process: Arc<Process>,
    pub connection: Arc<Connection>,
    /// The thread's register state as the runtime knows it. Written by the
    /// suspend handler, so only touched with signals blocked.
    pub cache: Cell<Context>,
    pub state: AtomicCell<ThreadState>,
    /// Set by the suspend handler when it learns the initial thread was
    /// terminated. Workers exit from the handler instead.
    pub pending_exit: Cell<Option<ExitNotice>>,
    /// Set once the server has confirmed the thread's termination.
    pub exit_ack: Cell<Option<ExitNotice>>,
    /// `pthread_t`, written by the thread itself before anything else.
    pub native_id: Cell<u64>,
    pub start_address: u64,
    pub resources: Cell<Option<ThreadResources>>,
}

static_assertions::assert_eq_size!(AtomicCell<ThreadState>, u8);

/// What [`initialize_block`] writes into the runtime area.
pub(crate) struct TebInit {
    pub process: Arc<Process>,
    pub connection: Arc<Connection>,
    pub client_id: ClientId,
    pub start_address: u64,
    pub context: Context,
    pub stack: StackBounds,
    pub resources: ThreadResources,
}

/// Native stack bounds recorded in the TIB; all zero if unknown.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct StackBounds {
    /// One past the highest usable address.
    pub base: usize,
    pub limit: usize,
    /// Start of the whole mapping, guard page included.
    pub deallocation: usize,
}

static TEB_KEY: OnceCell<libc::pthread_key_t> = OnceCell::new();

fn teb_key() -> NtResult<libc::pthread_key_t> {
    TEB_KEY
        .get_or_try_init(|| {
            let mut key = 0;
            match unsafe { libc::pthread_key_create(&mut key, None) } {
                0 => Ok(key),
                e => {
                    log::warn!("pthread_key_create: {}", std::io::Error::from_raw_os_error(e));
                    Err(NtStatus::INSUFFICIENT_RESOURCES)
                }
            }
        })
        .copied()
}

/// Sets up a block in place.
///
/// On failure nothing has been written and `init` is dropped.
///
/// # Safety
///
/// `block` must point to zeroed, writable memory for a `Teb` that nothing else
/// uses.
pub(crate) unsafe fn initialize_block(block: *mut Teb, init: TebInit) -> NtResult<*mut Teb> {
    teb_key()?;
    let TebInit {
        process,
        connection,
        client_id,
        start_address,
        context,
        stack,
        resources,
    } = init;
    // SAFETY: the caller guarantees `block` is ours to write. Everything not
    // written here is valid as zero.
    unsafe {
        std::ptr::addr_of_mut!((*block).tib.exception_list).write(EXCEPTION_CHAIN_END);
        std::ptr::addr_of_mut!((*block).tib.stack_base).write(stack.base);
        std::ptr::addr_of_mut!((*block).tib.stack_limit).write(stack.limit);
        std::ptr::addr_of_mut!((*block).tib.self_).write(block as usize);
        std::ptr::addr_of_mut!((*block).deallocation_stack).write(stack.deallocation);
        std::ptr::addr_of_mut!((*block).client_id).write(client_id);
        let links = std::ptr::addr_of_mut!((*block).tls_links);
        (*links).flink.set(links);
        (*links).blink.set(links);
        std::ptr::addr_of_mut!((*block).runtime).write(TebRuntime {
            process,
            connection,
            cache: Cell::new(context),
            state: AtomicCell::new(ThreadState::Requested),
            pending_exit: Cell::new(None),
            exit_ack: Cell::new(None),
            native_id: Cell::new(0),
            start_address,
            resources: Cell::new(Some(resources)),
        });
    }
    Ok(block)
}

/// Frees the block's TLS expansion array, then moves the runtime area out of
/// `block` and drops it. This releases the block's own memory.
///
/// # Safety
///
/// `block` must have been set up with [`initialize_block`], be unlinked, and
/// its thread must not run on the block's region any more.
pub(crate) unsafe fn release_block(block: *mut Teb) {
    crate::tls::release_expansion(unsafe { &*block });
    let runtime = unsafe { std::ptr::read(std::ptr::addr_of!((*block).runtime)) };
    drop(runtime);
}

/// Binds `teb` to the calling thread.
pub(crate) fn set_current(teb: *mut Teb) -> NtResult<()> {
    let key = teb_key()?;
    match unsafe { libc::pthread_setspecific(key, teb as *const c_void) } {
        0 => Ok(()),
        _ => Err(NtStatus::INSUFFICIENT_RESOURCES),
    }
}

pub(crate) fn clear_current() {
    if let Some(key) = TEB_KEY.get() {
        unsafe { libc::pthread_setspecific(*key, std::ptr::null()) };
    }
}

/// The calling thread's block, or null. Usable from signal handlers.
pub(crate) fn try_current_raw() -> *mut Teb {
    match TEB_KEY.get() {
        Some(key) => unsafe { libc::pthread_getspecific(*key) }.cast(),
        None => std::ptr::null_mut(),
    }
}

/// The calling thread's block. Valid for as long as the calling thread is in
/// the runtime.
pub fn current() -> NtResult<&'static Teb> {
    let teb = try_current_raw();
    if teb.is_null() {
        return Err(NtStatus::INVALID_THREAD);
    }
    Ok(unsafe { &*teb })
}

/// The block of the region containing `addr`.
///
/// Only meaningful for addresses within a live region, such as a stack
/// address inside a signal handler running on the signal stack.
pub fn teb_from_stack_address(addr: usize, region_size: usize) -> *mut Teb {
    debug_assert!(region_size.is_power_of_two());
    (addr & !(region_size - 1)) as *mut Teb
}

impl Teb {
    pub fn process(&self) -> &Arc<Process> {
        &self.runtime.process
    }

    pub fn thread_id(&self) -> u32 {
        self.client_id.tid()
    }

    pub fn process_id(&self) -> u32 {
        self.client_id.pid()
    }

    pub fn state(&self) -> ThreadState {
        self.runtime.state.load()
    }

    /// The host thread's `pthread_t`, as the reaper joins it.
    pub fn native_id(&self) -> u64 {
        self.runtime.native_id.get()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.runtime.state.store(state);
    }

    pub fn address(&self) -> u64 {
        self as *const Self as u64
    }

    pub(crate) fn cached_context(&self) -> Context {
        let _blocked = SignalsBlocked::new();
        self.runtime.cache.get()
    }

    pub(crate) fn update_cache(&self, f: impl FnOnce(&mut Context)) {
        let _blocked = SignalsBlocked::new();
        let mut context = self.runtime.cache.get();
        f(&mut context);
        self.runtime.cache.set(context);
    }

    /// A round trip on the thread's own connection.
    ///
    /// Error statuses come back as `Err`. If the thread turns out to have been
    /// terminated, this doesn't return: the thread exits.
    pub(crate) fn call(&self, request: Request) -> NtResult<Reply> {
        let blocked = SignalsBlocked::new();
        if let Some(notice) = self.runtime.pending_exit.take() {
            self.exit_now(notice);
        }
        let reply = call_raw(&self.runtime.connection, request)?;
        drop(blocked);
        match reply {
            Reply::Terminated { exit_code, is_last } => {
                self.exit_now(ExitNotice { exit_code, is_last })
            }
            reply => Ok(reply),
        }
    }

    /// Exits the calling thread, which must own this block.
    pub(crate) fn exit_now(&self, notice: ExitNotice) -> ! {
        {
            let _blocked = SignalsBlocked::new();
            self.runtime.exit_ack.set(Some(notice));
        }
        self.set_state(ThreadState::ExitRequested);
        std::panic::resume_unwind(Box::new(ThreadExit {
            exit_code: notice.exit_code,
        }))
    }
}

/// A round trip with signals blocked and nothing else: no exit handling.
pub(crate) fn call_raw(connection: &Connection, request: Request) -> NtResult<Reply> {
    let _blocked = SignalsBlocked::new();
    trace!("{:?} <- {}", connection.id(), request.kind());
    let reply = connection.call(request)?;
    trace!("{:?} -> {}", connection.id(), reply.kind());
    reply.into_result()
}

/// A process's thread list: an intrusive ring through [`Teb::tls_links`].
pub(crate) struct ThreadList {
    head: Box<ListEntry>,
}

// SAFETY: the list is only used under the process lock.
unsafe impl Send for ThreadList {}

impl ThreadList {
    pub fn new() -> Self {
        let head = Box::new(ListEntry {
            flink: Cell::new(std::ptr::null_mut()),
            blink: Cell::new(std::ptr::null_mut()),
        });
        let ptr = &*head as *const ListEntry as *mut ListEntry;
        head.flink.set(ptr);
        head.blink.set(ptr);
        Self { head }
    }

    fn head_ptr(&self) -> *mut ListEntry {
        &*self.head as *const ListEntry as *mut ListEntry
    }

    /// # Safety
    ///
    /// `teb` must be initialized and not on any list.
    pub unsafe fn push(&mut self, teb: *mut Teb) {
        let head = self.head_ptr();
        unsafe {
            let entry = std::ptr::addr_of_mut!((*teb).tls_links);
            let last = self.head.blink.get();
            (*entry).flink.set(head);
            (*entry).blink.set(last);
            (*last).flink.set(entry);
            self.head.blink.set(entry);
        }
    }

    /// # Safety
    ///
    /// `teb` must be on this list.
    pub unsafe fn unlink(&mut self, teb: *mut Teb) {
        unsafe {
            let entry = std::ptr::addr_of_mut!((*teb).tls_links);
            let prev = (*entry).blink.get();
            let next = (*entry).flink.get();
            (*prev).flink.set(next);
            (*next).blink.set(prev);
            (*entry).flink.set(entry);
            (*entry).blink.set(entry);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = *mut Teb> + '_ {
        let head = self.head_ptr();
        let mut next = self.head.flink.get();
        std::iter::from_fn(move || {
            if next == head {
                return None;
            }
            let entry = next;
            // SAFETY: every entry but the head is embedded in a live block.
            unsafe {
                next = (*entry).flink.get();
                Some(entry.cast::<u8>().sub(offset_of!(Teb, tls_links)).cast::<Teb>())
            }
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_teb_from_stack_address() {
        let size = 1 << 17;
        let base = 7 * size;
        assert_eq!(teb_from_stack_address(base, size) as usize, base);
        assert_eq!(teb_from_stack_address(base + size - 1, size) as usize, base);
        assert_eq!(teb_from_stack_address(base + size, size) as usize, base + size);
    }

    #[test]
    fn test_list_links() {
        // Only the links are touched, so zeroed blocks suffice.
        let layout = std::alloc::Layout::new::<Teb>();
        let blocks: Vec<*mut Teb> = (0..3)
            .map(|_| unsafe { std::alloc::alloc_zeroed(layout) }.cast())
            .collect();

        let mut list = ThreadList::new();
        assert_eq!(list.len(), 0);
        for block in &blocks {
            unsafe { list.push(*block) };
        }
        assert_eq!(list.iter().collect::<Vec<_>>(), blocks);

        unsafe { list.unlink(blocks[1]) };
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![blocks[0], blocks[2]]);
        unsafe { list.unlink(blocks[0]) };
        unsafe { list.unlink(blocks[2]) };
        assert_eq!(list.len(), 0);

        for block in blocks {
            unsafe { std::alloc::dealloc(block.cast(), layout) };
        }
    }
}
