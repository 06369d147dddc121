mod common;

use std::sync::atomic::{AtomicBool, Ordering};

use nt_api::info::{ThreadInfoClass, ThreadInformation};
use nt_api::time::FileTime;
use nt_api::{Handle, NtStatus};
use ntthread::{info, lifecycle, teb};

use common::{basic, join, poll_until, spawn};

#[test_log::test]
fn test_basic_of_self() {
    let test = common::start();
    let own = basic(Handle::CURRENT_THREAD);
    assert_eq!(own.exit_status, NtStatus::STILL_ACTIVE);
    assert_eq!(own.client_id.tid(), lifecycle::current_thread_id().unwrap());
    assert_eq!(own.client_id.pid(), test.process.pid());
    assert_eq!(own.teb_base, teb::current().unwrap().address());
    assert_ne!(own.affinity_mask, 0);
    test.process.teardown(0).unwrap();
}

#[test_log::test]
fn test_times() {
    let test = common::start();
    // Burn a little CPU so user time is unlikely to read as zero.
    let mut x = 0u64;
    for i in 0..1_000_000u64 {
        x = std::hint::black_box(x.wrapping_mul(31).wrapping_add(i));
    }
    let ThreadInformation::Times(times) =
        info::query_information(Handle::CURRENT_THREAD, ThreadInfoClass::Times).unwrap()
    else {
        panic!("not a Times value");
    };
    assert_ne!(times.create_time, FileTime::ZERO);
    assert_eq!(times.exit_time, FileTime::ZERO);
    assert!(times.kernel_time >= 0);
    assert!(times.user_time >= 0);

    let created = spawn(common::sleep_forever, 0);
    lifecycle::terminate_thread(created.handle, 0).unwrap();
    lifecycle::wait_for_thread(created.handle, false, None).unwrap();
    let ThreadInformation::Times(times) =
        info::query_information(created.handle, ThreadInfoClass::Times).unwrap()
    else {
        panic!("not a Times value");
    };
    assert!(times.exit_time >= times.create_time);
    assert_ne!(times.exit_time, FileTime::ZERO);
    lifecycle::close_handle(created.handle).unwrap();
    test.process.teardown(0).unwrap();
}

#[test_log::test]
fn test_priorities() {
    let test = common::start();
    let set = |info| info::set_information(Handle::CURRENT_THREAD, info);

    set(ThreadInformation::Priority(2)).unwrap();
    assert_eq!(basic(Handle::CURRENT_THREAD).priority, 2);
    assert_eq!(
        set(ThreadInformation::Priority(3)),
        Err(NtStatus::INVALID_PARAMETER)
    );
    assert_eq!(basic(Handle::CURRENT_THREAD).priority, 2);
    set(ThreadInformation::Priority(-15)).unwrap();
    assert_eq!(basic(Handle::CURRENT_THREAD).priority, -15);

    set(ThreadInformation::BasePriority(1)).unwrap();
    assert_eq!(basic(Handle::CURRENT_THREAD).base_priority, 1);
    assert_eq!(
        set(ThreadInformation::BasePriority(-7)),
        Err(NtStatus::INVALID_PARAMETER)
    );
    test.process.teardown(0).unwrap();
}

#[test_log::test]
fn test_affinity() {
    let test = common::start();
    info::set_information(Handle::CURRENT_THREAD, ThreadInformation::AffinityMask(1)).unwrap();
    assert_eq!(basic(Handle::CURRENT_THREAD).affinity_mask, 1);
    assert_eq!(
        info::set_information(Handle::CURRENT_THREAD, ThreadInformation::AffinityMask(0)),
        Err(NtStatus::INVALID_PARAMETER)
    );
    assert_eq!(basic(Handle::CURRENT_THREAD).affinity_mask, 1);
    test.process.teardown(0).unwrap();
}

#[test_log::test]
fn test_classes() {
    let test = common::start();
    assert_eq!(
        info::query_information_raw(Handle::CURRENT_THREAD, 99),
        Err(NtStatus::INVALID_INFO_CLASS)
    );
    assert_eq!(
        info::query_information_raw(Handle::CURRENT_THREAD, 12),
        Ok(ThreadInformation::AmILastThread(true))
    );
    assert_eq!(
        info::query_information(Handle::CURRENT_THREAD, ThreadInfoClass::Priority),
        Err(NtStatus::NOT_IMPLEMENTED)
    );
    let own = basic(Handle::CURRENT_THREAD);
    assert_eq!(
        info::set_information(Handle::CURRENT_THREAD, ThreadInformation::Basic(own)),
        Err(NtStatus::NOT_IMPLEMENTED)
    );
    test.process.teardown(0).unwrap();
}

static STARTED: AtomicBool = AtomicBool::new(false);

extern "C-unwind" fn wait_alertable(_arg: usize) -> u32 {
    STARTED.store(true, Ordering::SeqCst);
    lifecycle::delay_execution(true, None).unwrap();
    0
}

#[test_log::test]
fn test_worker_records() {
    let test = common::start();
    let created = spawn(wait_alertable, 0);
    poll_until("the worker to start", || STARTED.load(Ordering::SeqCst));

    let start = |handle| {
        info::query_information(handle, ThreadInfoClass::QuerySetWin32StartAddress).unwrap()
    };
    assert_eq!(
        start(created.handle),
        ThreadInformation::QuerySetWin32StartAddress(wait_alertable as usize as u64)
    );
    info::set_information(
        created.handle,
        ThreadInformation::QuerySetWin32StartAddress(0x1234),
    )
    .unwrap();
    assert_eq!(
        start(created.handle),
        ThreadInformation::QuerySetWin32StartAddress(0x1234)
    );

    let hidden = |handle| {
        info::query_information(handle, ThreadInfoClass::HideFromDebugger).unwrap()
    };
    assert_eq!(
        hidden(created.handle),
        ThreadInformation::HideFromDebugger(false)
    );
    info::set_information(created.handle, ThreadInformation::HideFromDebugger(true)).unwrap();
    assert_eq!(
        hidden(created.handle),
        ThreadInformation::HideFromDebugger(true)
    );
    // Per thread.
    assert_eq!(
        hidden(Handle::CURRENT_THREAD),
        ThreadInformation::HideFromDebugger(false)
    );

    info::set_information(
        created.handle,
        ThreadInformation::ImpersonationToken(Handle::NULL),
    )
    .unwrap();

    // Two threads: neither is last.
    assert_eq!(
        info::query_information(Handle::CURRENT_THREAD, ThreadInfoClass::AmILastThread),
        Ok(ThreadInformation::AmILastThread(false))
    );

    lifecycle::queue_apc(created.handle, None, 0, 0, 0).unwrap();
    assert_eq!(join(created.handle), NtStatus::SUCCESS);
    test.process.teardown(0).unwrap();
}
