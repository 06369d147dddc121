//! The workload: create workers, some of them suspended, rewrite their
//! registers from outside, then end half of them by APC and half by
//! termination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context as _};
use log::{debug, info};
use nt_api::{Context, ContextFlags, Handle, NtStatus};
use ntthread::{context, info as thread_info, lifecycle, CreateThreadParams, CreatedThread};

use crate::config::ScenarioOptions;

/// Exit code given to terminated workers.
const TERMINATED_CODE: u32 = 0xdead;

/// Sum of the arguments of all APCs that ran.
static APC_SUM: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default)]
pub struct Summary {
    pub created: u32,
    pub created_suspended: u32,
    pub exited: u32,
    pub terminated: u32,
    pub apcs: u64,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created {} threads ({} suspended), {} exited, {} terminated, APC sum {}",
            self.created, self.created_suspended, self.exited, self.terminated, self.apcs
        )
    }
}

extern "C-unwind" fn count_apc(arg1: u64, _arg2: u64, _arg3: u64) {
    APC_SUM.fetch_add(arg1, Ordering::SeqCst);
}

/// Waits alertably until an APC has run, then exits with its own `rax`.
extern "C-unwind" fn worker(_index: usize) -> u32 {
    loop {
        match lifecycle::delay_execution(true, None) {
            Ok(NtStatus::USER_APC) => break,
            Ok(_) => continue,
            Err(status) => return status.to_u32(),
        }
    }
    match context::get_context(Handle::CURRENT_THREAD, ContextFlags::INTEGER.bits()) {
        Ok(own) => own.rax as u32,
        Err(status) => status.to_u32(),
    }
}

fn expected_rax(index: u32) -> u64 {
    0x100 + u64::from(index)
}

/// Runs one iteration with `threads` workers.
fn run_once(threads: u32) -> anyhow::Result<Summary> {
    let mut summary = Summary::default();
    let mut workers: Vec<(u32, CreatedThread)> = Vec::new();

    for index in 0..threads {
        let mut params = CreateThreadParams::new(worker, index as usize);
        params.suspended = index % 2 == 1;
        let created = lifecycle::create_thread(Handle::CURRENT_PROCESS, &params)
            .with_context(|| format!("creating worker {index}"))?;
        debug!("worker {index} is thread {}", created.tid);
        summary.created += 1;
        summary.created_suspended += u32::from(params.suspended);
        workers.push((index, created));
    }

    for (index, created) in &workers {
        let mut integer = Context::with_flags(ContextFlags::INTEGER);
        integer.rax = expected_rax(*index);
        context::set_context(created.handle, &integer)
            .with_context(|| format!("setting the context of worker {index}"))?;
        let read = context::get_context(created.handle, ContextFlags::INTEGER.bits())
            .with_context(|| format!("reading the context of worker {index}"))?;
        if read.rax != integer.rax {
            bail!("worker {index} has rax {:#x} after setting it to {:#x}", read.rax, integer.rax);
        }
    }

    for (index, created) in &workers {
        if index % 2 == 1 {
            let previous = lifecycle::resume_thread(created.handle)?;
            if previous != 1 {
                bail!("worker {index} had suspend count {previous}");
            }
        }
    }

    // The first half leaves on its own after an APC, the rest is terminated.
    let exiting = threads / 2;
    for (index, created) in &workers {
        if *index < exiting {
            lifecycle::queue_apc(created.handle, Some(count_apc), u64::from(*index) + 1, 0, 0)?;
        } else {
            lifecycle::terminate_thread(created.handle, TERMINATED_CODE)?;
        }
    }

    for (index, created) in workers {
        let status =
            lifecycle::wait_for_thread(created.handle, false, Some(Duration::from_secs(30)))?;
        if status != NtStatus::WAIT_0 {
            bail!("worker {index} didn't finish: {status}");
        }
        let basic = match thread_info::query_information(
            created.handle,
            nt_api::info::ThreadInfoClass::Basic,
        )? {
            nt_api::info::ThreadInformation::Basic(basic) => basic,
            other => bail!("unexpected information {other:?}"),
        };
        lifecycle::close_handle(created.handle)?;

        let code = basic.exit_status.to_u32();
        if index < exiting {
            if u64::from(code) != expected_rax(index) {
                bail!("worker {index} exited with {code:#x}");
            }
            summary.exited += 1;
        } else {
            if code != TERMINATED_CODE {
                bail!("worker {index} was terminated with {code:#x}");
            }
            summary.terminated += 1;
        }
    }

    summary.apcs = APC_SUM.swap(0, Ordering::SeqCst);
    let expected_apcs = u64::from(exiting) * (u64::from(exiting) + 1) / 2;
    if summary.apcs != expected_apcs {
        bail!("APC sum is {}, expected {expected_apcs}", summary.apcs);
    }
    Ok(summary)
}

/// Runs all iterations on the calling thread, which must be in the runtime.
pub fn run(options: &ScenarioOptions) -> anyhow::Result<Summary> {
    let threads = options.threads.unwrap_or(4);
    let iterations = options.iterations.unwrap_or(1);
    let mut total = Summary::default();
    for iteration in 0..iterations {
        let summary =
            run_once(threads).with_context(|| format!("iteration {iteration} failed"))?;
        info!("iteration {iteration}: {summary}");
        total.created += summary.created;
        total.created_suspended += summary.created_suspended;
        total.exited += summary.exited;
        total.terminated += summary.terminated;
        total.apcs += summary.apcs;
    }
    Ok(total)
}
