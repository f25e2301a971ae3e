//! Moving a spawned child and all of its threads under trace.
//!
//! Attaching races against the child: tasks may be born or die between
//! reading the task list and seizing them. A seize that fails with EPERM
//! hits a task that is mid-exit and is retried under backoff; ESRCH means
//! the task is gone and is dropped. After everything is seized the task
//! list is read again: tasks that appeared in between were never brought
//! under trace and would escape, so that is a hard failure.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::unistd::Pid;

use warden_comms::CLIENT_DONE;
use warden_core::{Result, WardenError, proc};

use crate::executor::SandboxeeProcess;

const INITIAL_RETRY: Duration = Duration::from_millis(1);
const MAX_RETRY: Duration = Duration::from_millis(20);
const ATTACH_DEADLINE: Duration = Duration::from_secs(2);

fn trace_options() -> Options {
    Options::PTRACE_O_TRACESYSGOOD
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACEVFORKDONE
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEEXEC
        | Options::PTRACE_O_TRACEEXIT
        | Options::PTRACE_O_TRACESECCOMP
        | Options::PTRACE_O_EXITKILL
}

/// Seize the whole tracee group and release the child via the handshake.
pub(crate) fn attach_all(process: &mut SandboxeeProcess) -> Result<()> {
    let main_pid = process.main_pid;

    // The init helper of a pid namespace only needs kill-on-detach; it
    // never runs application code. It may already be gone.
    if let Some(init_pid) = process.init_pid {
        match ptrace::seize(init_pid, Options::PTRACE_O_EXITKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!("init task {} already exited before seize", init_pid);
            }
            Err(errno) => {
                return Err(WardenError::Attach(format!(
                    "seizing init task {} failed: {}",
                    init_pid, errno
                )));
            }
        }
    }

    let mut tasks = proc::list_tasks(main_pid)
        .map_err(|e| WardenError::Attach(format!("listing tasks of {}: {}", main_pid, e)))?;
    if !tasks.contains(&main_pid) {
        return Err(WardenError::Attach(format!(
            "PID {} not found in its own task list",
            main_pid
        )));
    }
    if tasks.len() > 1 {
        // Filters installed via TSYNC cover threads that already exist,
        // but threads spawned before this point start unfiltered work.
        warn!(
            "PID {} has {} threads at attach time; expect extra violations if they predate the filter",
            main_pid,
            tasks.len()
        );
    }

    let mut attached: HashSet<Pid> = HashSet::new();
    let deadline = Instant::now() + ATTACH_DEADLINE;
    let mut retries = 0u32;

    while !tasks.is_empty() {
        let mut tasks_left: HashSet<Pid> = HashSet::new();
        for &task in &tasks {
            match ptrace::seize(task, trace_options()) {
                Ok(()) => {
                    attached.insert(task);
                }
                Err(Errno::EPERM) => {
                    // A task on its way out of the kernel can refuse the
                    // seize; it either dies or becomes seizable shortly.
                    warn!("seizing task {} returned EPERM, will retry", task);
                    tasks_left.insert(task);
                }
                Err(Errno::ESRCH) => {
                    warn!("task {} exited before it could be seized, skipping", task);
                }
                Err(errno) => {
                    return Err(WardenError::Attach(format!(
                        "seizing task {} failed: {}",
                        task, errno
                    )));
                }
            }
        }
        if !tasks_left.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(WardenError::Attach(format!(
                    "attach timed out with {} unseized tasks",
                    tasks_left.len()
                )));
            }
            let backoff = INITIAL_RETRY * (1u32 << retries.min(10));
            std::thread::sleep(backoff.min(MAX_RETRY).min(deadline - now));
            retries += 1;
        }
        tasks = tasks_left;
    }

    let tasks_now = proc::list_tasks(main_pid)
        .map_err(|e| WardenError::Attach(format!("re-listing tasks of {}: {}", main_pid, e)))?;
    if attached != tasks_now {
        return Err(WardenError::Attach(format!(
            "PID {} spawned new threads while they were being seized",
            main_pid
        )));
    }

    info!("monitor attached to PID {} ({} tasks)", main_pid, attached.len());

    // The child may already be ptrace-stopped, but the socketpair is
    // kernel-buffered, so this send cannot block on the child's state.
    process.comms.send_u32(CLIENT_DONE)?;
    Ok(())
}
