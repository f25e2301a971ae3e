//! Observer callbacks for supervised execution.

use nix::unistd::Pid;

use crate::result::{SandboxResult, ViolationKind};
use crate::syscall::Syscall;

/// Decision for a syscall the filter asked the monitor to arbitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceAction {
    /// Deny the syscall; this becomes a violation unless a permit-all
    /// override is configured.
    Deny,
    /// Let the syscall run.
    Allow,
    /// Let the syscall run and report its return value through
    /// [`Notify::event_syscall_return`].
    InspectAfterReturn,
}

/// Observer of supervised execution. All methods have no-op defaults, so
/// implementors override only what they care about.
pub trait Notify: Send {
    /// The child is about to be supervised. Returning `false` aborts
    /// setup.
    fn event_started(&mut self, pid: Pid) -> bool {
        let _ = pid;
        true
    }

    /// The run is over; `result` is the record the embedder will receive.
    fn event_finished(&mut self, result: &SandboxResult) {
        let _ = result;
    }

    /// The filter asked for arbitration of `syscall`.
    fn event_syscall_trace(&mut self, syscall: &Syscall) -> TraceAction {
        let _ = syscall;
        TraceAction::Deny
    }

    /// A syscall arbitrated as inspect-after-return completed. For the
    /// process-creation family the value is the new task id; for the exec
    /// family it is zero.
    fn event_syscall_return(&mut self, syscall: &Syscall, return_value: i64) {
        let _ = (syscall, return_value);
    }

    /// A violation was recorded for `syscall`.
    fn event_syscall_violation(&mut self, syscall: &Syscall, kind: ViolationKind) {
        let _ = (syscall, kind);
    }

    /// A plain signal was delivered to a tracee.
    fn event_signal(&mut self, pid: Pid, signo: i32) {
        let _ = (pid, signo);
    }
}

/// Observer that accepts the defaults wholesale.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNotify;

impl Notify for DefaultNotify {}
