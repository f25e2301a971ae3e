//! The monitor's view of a compiled policy.
//!
//! The seccomp program itself is compiled and installed by an external
//! collaborator before the monitor runs; the only gating the monitor ever
//! consults is whether stack traces may be collected for a given outcome.

use crate::result::FinalStatus;

/// Stack-trace collection predicates of a compiled policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub collect_stacktrace_on_violation: bool,
    pub collect_stacktrace_on_signal: bool,
    pub collect_stacktrace_on_timeout: bool,
    pub collect_stacktrace_on_kill: bool,
    pub collect_stacktrace_on_exit: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            collect_stacktrace_on_violation: true,
            collect_stacktrace_on_signal: true,
            collect_stacktrace_on_timeout: true,
            collect_stacktrace_on_kill: false,
            collect_stacktrace_on_exit: false,
        }
    }
}

impl Policy {
    /// No stack traces for any outcome.
    pub fn without_stack_traces() -> Policy {
        Policy {
            collect_stacktrace_on_violation: false,
            collect_stacktrace_on_signal: false,
            collect_stacktrace_on_timeout: false,
            collect_stacktrace_on_kill: false,
            collect_stacktrace_on_exit: false,
        }
    }

    /// Whether a stack trace should be collected for the given outcome.
    pub fn should_collect_stack_trace(&self, status: FinalStatus) -> bool {
        match status {
            FinalStatus::Violation => self.collect_stacktrace_on_violation,
            FinalStatus::Signaled => self.collect_stacktrace_on_signal,
            FinalStatus::Timeout => self.collect_stacktrace_on_timeout,
            FinalStatus::ExternalKill => self.collect_stacktrace_on_kill,
            FinalStatus::Ok => self.collect_stacktrace_on_exit,
            _ => false,
        }
    }
}
