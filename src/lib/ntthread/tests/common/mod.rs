#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use nt_api::info::{ThreadBasicInformation, ThreadInfoClass, ThreadInformation};
use nt_api::{Handle, NtStatus};
use nt_coordinator::{Coordinator, CoordinatorConfig};
use nt_session::SessionServer;
use ntthread::{
    info, lifecycle, CreateThreadParams, CreatedThread, Process, RuntimeConfig, ThreadEntry,
};

/// A process whose initial thread is the calling test thread.
pub struct TestProcess {
    pub coordinator: Arc<Coordinator>,
    pub process: Arc<Process>,
    /// Exit code passed to the exit hook, once the last thread is gone.
    pub exit: Arc<AtomicCell<Option<i32>>>,
}

pub fn start() -> TestProcess {
    start_with(CoordinatorConfig::default(), RuntimeConfig::default())
}

pub fn start_with(coordinator: CoordinatorConfig, runtime: RuntimeConfig) -> TestProcess {
    let coordinator = Arc::new(Coordinator::new(coordinator));
    join_process(&coordinator, runtime)
}

/// Another process on the calling thread, served by `coordinator`.
pub fn join_process(coordinator: &Arc<Coordinator>, runtime: RuntimeConfig) -> TestProcess {
    let exit = Arc::new(AtomicCell::new(None));
    let hook_exit = Arc::clone(&exit);
    let server: Arc<dyn SessionServer> = coordinator.clone();
    let process = Process::init_with_exit_hook(
        runtime,
        server,
        Box::new(move |code| hook_exit.store(Some(code))),
    )
    .unwrap();
    TestProcess {
        coordinator: Arc::clone(coordinator),
        process,
        exit,
    }
}

pub fn poll_until(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

pub fn spawn(entry: ThreadEntry, arg: usize) -> CreatedThread {
    lifecycle::create_thread(Handle::CURRENT_PROCESS, &CreateThreadParams::new(entry, arg))
        .unwrap()
}

pub fn basic(handle: Handle) -> ThreadBasicInformation {
    match info::query_information(handle, ThreadInfoClass::Basic).unwrap() {
        ThreadInformation::Basic(basic) => basic,
        other => panic!("unexpected {other:?}"),
    }
}

/// Waits for the thread to terminate, closes the handle, and returns the exit
/// status.
pub fn join(handle: Handle) -> NtStatus {
    assert_eq!(
        lifecycle::wait_for_thread(handle, false, Some(Duration::from_secs(10))),
        Ok(NtStatus::WAIT_0)
    );
    let status = basic(handle).exit_status;
    lifecycle::close_handle(handle).unwrap();
    status
}

/// Sleeps non-alertably in the runtime until terminated.
pub extern "C-unwind" fn sleep_forever(_arg: usize) -> u32 {
    loop {
        lifecycle::delay_execution(false, None).unwrap();
    }
}
