//! Two processes sharing one coordinator, each with its initial thread on
//! its own host thread.

mod common;

use std::sync::mpsc;

use nt_api::{NtStatus, ProcessAccess, ThreadAccess};
use ntthread::{lifecycle, CreateThreadParams, RuntimeConfig};

use common::{basic, join};

extern "C-unwind" fn report_pid(_arg: usize) -> u32 {
    lifecycle::current_process_id().unwrap()
}

#[test_log::test]
fn test_create_thread_in_other_process() {
    let a = common::start();

    let (pid_tx, pid_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let coordinator = a.coordinator.clone();
    let b_thread = std::thread::spawn(move || {
        let b = common::join_process(&coordinator, RuntimeConfig::default());
        pid_tx.send(b.process.pid()).unwrap();
        done_rx.recv().unwrap();
        b.process.teardown(0).unwrap();
        b.exit.load()
    });
    let pid_b = pid_rx.recv().unwrap();
    assert_ne!(pid_b, a.process.pid());

    // Without the right, the process handle can't create threads.
    let weak = lifecycle::open_process(pid_b, ProcessAccess::QUERY_INFORMATION).unwrap();
    assert_eq!(
        lifecycle::create_thread(weak, &CreateThreadParams::new(report_pid, 0)),
        Err(NtStatus::ACCESS_DENIED)
    );
    lifecycle::close_handle(weak).unwrap();

    let b_handle = lifecycle::open_process(pid_b, ProcessAccess::CREATE_THREAD).unwrap();
    let mut params = CreateThreadParams::new(report_pid, 0);
    params.access = ThreadAccess::ALL_ACCESS;
    let created = lifecycle::create_thread(b_handle, &params).unwrap();
    assert_ne!(created.tid, 0);

    let info = basic(created.handle);
    assert_eq!(info.client_id.pid(), pid_b);
    assert_eq!(info.client_id.tid(), created.tid);
    assert_eq!(join(created.handle), NtStatus::from_u32(pid_b));
    lifecycle::close_handle(b_handle).unwrap();

    // The worker is gone, so B's initial thread is its last.
    done_tx.send(()).unwrap();
    assert_eq!(b_thread.join().unwrap(), Some(0));
    assert_eq!(a.exit.load(), None);
    a.process.teardown(0).unwrap();
    assert_eq!(a.exit.load(), Some(0));
}
