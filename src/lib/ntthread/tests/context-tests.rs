//! Context access: the calling thread's register cache, and other threads at
//! safe points or stopped by the suspend signal.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nt_api::{Context, ContextFlags, Handle, NtStatus, ThreadAccess};
use nt_coordinator::CoordinatorConfig;
use ntthread::config::ContextRetryConfig;
use ntthread::{context, lifecycle, RuntimeConfig};

use common::{join, poll_until, spawn};

#[test_log::test]
fn test_own_context_roundtrip() {
    let test = common::start();

    let mut integer = Context::with_flags(ContextFlags::INTEGER);
    integer.rax = 0x1234;
    integer.r15 = 5;
    context::set_context(Handle::CURRENT_THREAD, &integer).unwrap();

    let read = context::get_context(Handle::CURRENT_THREAD, ContextFlags::FULL.bits()).unwrap();
    assert_eq!(read.rax, 0x1234);
    assert_eq!(read.r15, 5);
    assert_eq!(read.context_flags, ContextFlags::FULL.bits());
    // Groups that weren't written keep their initial values.
    assert_eq!(read.mx_csr, 0x1f80);
    assert_eq!(read.seg_cs, 0x33);
    // Groups that weren't asked for read as zero.
    assert_eq!(read.seg_ds, 0);

    test.process.teardown(0).unwrap();
}

static INHERITED_DR0: AtomicU64 = AtomicU64::new(0);

extern "C-unwind" fn read_dr0(_arg: usize) -> u32 {
    let own = context::get_context(
        Handle::CURRENT_THREAD,
        ContextFlags::DEBUG_REGISTERS.bits(),
    )
    .unwrap();
    INHERITED_DR0.store(own.dr0, Ordering::SeqCst);
    0
}

#[test_log::test]
fn test_debug_registers() {
    let test = common::start();

    let mut debug = Context::with_flags(ContextFlags::DEBUG_REGISTERS);
    debug.dr0 = 0x1000;
    debug.dr7 = 0x1;
    context::set_context(Handle::CURRENT_THREAD, &debug).unwrap();

    let read =
        context::get_context(Handle::CURRENT_THREAD, ContextFlags::DEBUG_REGISTERS.bits()).unwrap();
    assert_eq!((read.dr0, read.dr7), (0x1000, 0x1));

    // The same, through a real handle to the calling thread.
    let own = lifecycle::open_thread(
        lifecycle::current_thread_id().unwrap(),
        ThreadAccess::ALL_ACCESS,
    )
    .unwrap();
    let read = context::get_context(own, ContextFlags::ALL.bits()).unwrap();
    assert_eq!(read.dr0, 0x1000);
    lifecycle::close_handle(own).unwrap();

    // New threads start with their creator's debug registers.
    join(spawn(read_dr0, 0).handle);
    assert_eq!(INHERITED_DR0.load(Ordering::SeqCst), 0x1000);

    test.process.teardown(0).unwrap();
}

#[test_log::test]
fn test_invalid_flags() {
    let test = common::start();
    // No architecture tag.
    assert_eq!(
        context::get_context(Handle::CURRENT_THREAD, 0x1),
        Err(NtStatus::INVALID_PARAMETER)
    );
    assert_eq!(
        context::get_context(Handle::CURRENT_THREAD, u32::MAX),
        Err(NtStatus::INVALID_PARAMETER)
    );
    assert_eq!(
        context::set_context(Handle::CURRENT_THREAD, &Context::default()),
        Err(NtStatus::INVALID_PARAMETER)
    );
    test.process.teardown(0).unwrap();
}

static WAITER_READY: AtomicBool = AtomicBool::new(false);

/// Waits alertably, then exits with its own `rax`.
extern "C-unwind" fn exit_with_rax(_arg: usize) -> u32 {
    WAITER_READY.store(true, Ordering::SeqCst);
    let status = lifecycle::delay_execution(true, None).unwrap();
    assert_eq!(status, NtStatus::ALERTED);
    let own = context::get_context(Handle::CURRENT_THREAD, ContextFlags::INTEGER.bits()).unwrap();
    own.rax as u32
}

#[test_log::test]
fn test_remote_set_seen_after_wake() {
    let test = common::start();
    let created = spawn(exit_with_rax, 0);
    poll_until("the worker to start", || WAITER_READY.load(Ordering::SeqCst));

    let mut integer = Context::with_flags(ContextFlags::INTEGER);
    integer.rax = 42;
    context::set_context(created.handle, &integer).unwrap();
    let read = context::get_context(created.handle, ContextFlags::INTEGER.bits()).unwrap();
    assert_eq!(read.rax, 42);

    lifecycle::queue_apc(created.handle, None, 0, 0, 0).unwrap();
    assert_eq!(join(created.handle), NtStatus::from_u32(42));
    test.process.teardown(0).unwrap();
}

static SPIN_STOP: AtomicBool = AtomicBool::new(false);
static SPIN_STARTED: AtomicBool = AtomicBool::new(false);

/// Spins in user code without entering the runtime, then exits with `rax`.
extern "C-unwind" fn spin(_arg: usize) -> u32 {
    SPIN_STARTED.store(true, Ordering::SeqCst);
    while !SPIN_STOP.load(Ordering::SeqCst) {
        std::hint::spin_loop();
    }
    let own = context::get_context(Handle::CURRENT_THREAD, ContextFlags::INTEGER.bits()).unwrap();
    own.rax as u32
}

#[test_log::test]
fn test_context_of_running_thread() {
    let test = common::start();
    let created = spawn(spin, 0x77);
    poll_until("the worker to spin", || SPIN_STARTED.load(Ordering::SeqCst));

    // Only reachable by stopping it with the suspend signal.
    let read = context::get_context(created.handle, ContextFlags::FULL.bits()).unwrap();
    assert_eq!(read.rip, spin as usize as u64);
    assert_eq!(read.rcx, 0x77);
    assert_ne!(read.rsp, 0);

    let mut integer = Context::with_flags(ContextFlags::INTEGER);
    integer.rax = 99;
    context::set_context(created.handle, &integer).unwrap();

    // Every suspend was paired with a resume.
    assert_eq!(lifecycle::suspend_thread(created.handle), Ok(0));
    assert_eq!(lifecycle::resume_thread(created.handle), Ok(1));

    SPIN_STOP.store(true, Ordering::SeqCst);
    assert_eq!(join(created.handle), NtStatus::from_u32(99));
    test.process.teardown(0).unwrap();
}

static COUNT_STOP: AtomicBool = AtomicBool::new(false);
static COUNTED: AtomicU64 = AtomicU64::new(0);

extern "C-unwind" fn count_until_stopped(_arg: usize) -> u32 {
    while !COUNT_STOP.load(Ordering::SeqCst) {
        COUNTED.fetch_add(1, Ordering::Relaxed);
        std::hint::spin_loop();
    }
    0
}

#[test_log::test]
fn test_context_of_suspended_thread_without_retries() {
    let runtime = RuntimeConfig {
        context_retry: ContextRetryConfig {
            attempts: 1,
            delay_ms: 0,
        },
        ..Default::default()
    };
    let test = common::start_with(CoordinatorConfig::default(), runtime);
    let created = spawn(count_until_stopped, 0);
    poll_until("the worker to count", || COUNTED.load(Ordering::Relaxed) > 0);

    assert_eq!(lifecycle::suspend_thread(created.handle), Ok(0));
    poll_until("the worker to park", || {
        test.coordinator.is_parked(created.tid) == Some(true)
    });
    let stopped = COUNTED.load(Ordering::Relaxed);

    // A parked target answers the first request; the single attempt is
    // never needed.
    for _ in 0..3 {
        let read = context::get_context(created.handle, ContextFlags::FULL.bits()).unwrap();
        assert_eq!(read.rip, count_until_stopped as usize as u64);
    }
    let mut integer = Context::with_flags(ContextFlags::INTEGER);
    integer.rbx = 3;
    context::set_context(created.handle, &integer).unwrap();
    assert_eq!(COUNTED.load(Ordering::Relaxed), stopped);

    assert_eq!(lifecycle::resume_thread(created.handle), Ok(1));
    COUNT_STOP.store(true, Ordering::SeqCst);
    assert_eq!(join(created.handle), NtStatus::SUCCESS);
    test.process.teardown(0).unwrap();
}

#[test_log::test]
fn test_context_of_dead_thread() {
    let test = common::start();
    let created = spawn(common::sleep_forever, 0);
    lifecycle::terminate_thread(created.handle, 1).unwrap();
    lifecycle::wait_for_thread(created.handle, false, None).unwrap();
    assert_eq!(
        context::get_context(created.handle, ContextFlags::FULL.bits()),
        Err(NtStatus::THREAD_IS_TERMINATING)
    );
    lifecycle::close_handle(created.handle).unwrap();
    test.process.teardown(0).unwrap();
}
