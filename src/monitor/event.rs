//! Classification of raw tracee statuses into typed events.
//!
//! One status word from the waiter becomes exactly one [`TraceEvent`],
//! with the ptrace event message fetched where the event carries one.
//! A tracee that dies between the stop and the event-message read is a
//! routine race: the classification is dropped and the exit event that
//! follows carries the real story.

use log::{info, trace, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use warden_core::names::ptrace_event_name;

use crate::result::InternalFailure;

// Group-stop notification under PTRACE_SEIZE; not wrapped by nix.
pub(crate) const PTRACE_EVENT_STOP: i32 = 128;

/// A typed tracee event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// Normal termination with the given exit code.
    Exited(i32),
    /// Death from an unhandled signal.
    KilledBySignal(i32),
    /// Stopped at a syscall return.
    SyscallExitStop,
    /// The in-kernel filter fired; carries the raw architecture tag.
    SeccompStop(u64),
    /// fork/vfork/clone produced the given new task.
    NewTask(Pid),
    /// The vfork parent was unblocked.
    VforkDone,
    /// The task completed an exec; carries the pre-exec task id.
    Exec(Pid),
    /// The kernel is about to reap the task; carries the pending raw
    /// wait status. Last chance to read registers.
    ExitStop(i32),
    /// Job-control stop with the given signal.
    GroupStop(Signal),
    /// Plain signal delivery, no ptrace event.
    SignalDelivery(Signal),
}

/// Result of classifying one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    Event(TraceEvent),
    /// Transient race or an uninteresting status; nothing to do.
    Ignored,
    /// The event message could not be read from a live tracee.
    Broken(InternalFailure),
}

/// Classify one waited status for `pid`.
pub fn classify(pid: Pid, status: WaitStatus) -> Classified {
    match status {
        WaitStatus::Exited(_, code) => Classified::Event(TraceEvent::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => {
            Classified::Event(TraceEvent::KilledBySignal(signal as i32))
        }
        WaitStatus::PtraceSyscall(_) => Classified::Event(TraceEvent::SyscallExitStop),
        WaitStatus::PtraceEvent(_, signal, event) => classify_ptrace_event(pid, signal, event),
        WaitStatus::Stopped(_, signal) => {
            Classified::Event(TraceEvent::SignalDelivery(signal))
        }
        WaitStatus::Continued(_) => {
            trace!("PID {} is being continued", pid);
            Classified::Ignored
        }
        WaitStatus::StillAlive => Classified::Ignored,
    }
}

fn classify_ptrace_event(pid: Pid, signal: Signal, event: i32) -> Classified {
    trace!(
        "PID {} stopped with {} ({})",
        pid,
        ptrace_event_name(event),
        signal
    );

    // Group stops and vfork-done carry no interesting message.
    if event == PTRACE_EVENT_STOP {
        return Classified::Event(TraceEvent::GroupStop(signal));
    }
    if event == libc::PTRACE_EVENT_VFORK_DONE {
        return Classified::Event(TraceEvent::VforkDone);
    }

    let msg = match ptrace::getevent(pid) {
        Ok(msg) => msg,
        Err(Errno::ESRCH) => {
            // The kernel does not guarantee the message survives the
            // tracee; the exit event will follow.
            info!("PID {} died before its event message could be read", pid);
            return Classified::Ignored;
        }
        Err(errno) => {
            warn!("reading event message of PID {} failed: {}", pid, errno);
            return Classified::Broken(InternalFailure::GetEvent);
        }
    };

    match event {
        libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
            Classified::Event(TraceEvent::NewTask(Pid::from_raw(msg as i32)))
        }
        libc::PTRACE_EVENT_EXEC => Classified::Event(TraceEvent::Exec(Pid::from_raw(msg as i32))),
        libc::PTRACE_EVENT_EXIT => Classified::Event(TraceEvent::ExitStop(msg as i32)),
        libc::PTRACE_EVENT_SECCOMP => Classified::Event(TraceEvent::SeccompStop(msg as u64)),
        _ => {
            warn!(
                "unknown ptrace event {} for PID {} with message {:#x}",
                event, pid, msg
            );
            Classified::Ignored
        }
    }
}
