//! The write-once result record published by the supervisor.

use std::fmt;

use log::info;

use warden_core::ResourceUsage;
use warden_core::names::signal_name;

use crate::regs::Regs;
use crate::syscall::Syscall;

/// Terminal status of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    /// No status has been recorded yet
    Unset,
    /// Sandboxee exited normally
    Ok,
    /// Sandboxee died from an unhandled signal
    Signaled,
    /// Sandboxee violated the policy
    Violation,
    /// Sandboxee hit the wall-clock limit
    Timeout,
    /// The embedder asked for the sandboxee to be killed
    ExternalKill,
    /// Supervision could not be established
    SetupError,
    /// The monitor broke one of its own invariants
    InternalError,
}

/// Which setup step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupFailure {
    /// Signal mask preparation failed
    Signals,
    /// Attaching to the tracee group failed
    Ptrace,
    /// The sandboxee vanished before monitoring was enabled
    Monitor,
}

/// Which monitor invariant broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalFailure {
    /// The main task could not be waited on
    Child,
    /// Delivering the kill signal failed
    Kill,
    /// Interrupting the main task failed
    Interrupt,
    /// Reading tracee registers failed
    Fetch,
    /// A syscall-exit stop arrived with no matching in-progress record
    Inspect,
    /// Reading the ptrace event message failed
    GetEvent,
}

/// What made a violation fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A denied syscall
    Syscall,
    /// A syscall from a different instruction-set architecture
    ArchitectureSwitch,
    /// A network-policy breach reported by the proxy
    Network,
}

/// Reason detail accompanying the final status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    None,
    /// Exit code of a normal exit
    ExitCode(i32),
    /// Signal that killed the sandboxee
    Signal(i32),
    /// Number of the violating syscall
    Syscall(u64),
    /// Network-policy violation
    Network,
    Setup(SetupFailure),
    Internal(InternalFailure),
}

/// Terminal state plus the diagnostic artifacts gathered on the way out.
///
/// Every field is write-once: the first recorded value wins and later
/// writes are ignored. Only the supervisor thread writes; readers obtain
/// the record after joining it.
pub struct SandboxResult {
    final_status: FinalStatus,
    reason: Reason,
    regs: Option<Regs>,
    prog_name: Option<String>,
    proc_maps: Option<String>,
    stack_trace: Option<Vec<String>>,
    violating_syscall: Option<Syscall>,
    network_violation: Option<String>,
    monitor_rusage: Option<ResourceUsage>,
}

impl SandboxResult {
    pub(crate) fn new() -> SandboxResult {
        SandboxResult {
            final_status: FinalStatus::Unset,
            reason: Reason::None,
            regs: None,
            prog_name: None,
            proc_maps: None,
            stack_trace: None,
            violating_syscall: None,
            network_violation: None,
            monitor_rusage: None,
        }
    }

    /// Record the terminal status. The first call wins; any later call is
    /// ignored so that a kill the monitor issued cannot overwrite the
    /// cause it was issued for.
    pub(crate) fn set_exit_status(&mut self, status: FinalStatus, reason: Reason) {
        if self.final_status != FinalStatus::Unset {
            info!(
                "final status already {:?}, ignoring {:?}/{:?}",
                self.final_status, status, reason
            );
            return;
        }
        self.final_status = status;
        self.reason = reason;
    }

    pub(crate) fn set_regs(&mut self, regs: Regs) {
        self.regs.get_or_insert(regs);
    }

    pub(crate) fn set_prog_name(&mut self, name: String) {
        self.prog_name.get_or_insert(name);
    }

    pub(crate) fn set_proc_maps(&mut self, maps: String) {
        self.proc_maps.get_or_insert(maps);
    }

    pub(crate) fn set_stack_trace(&mut self, trace: Vec<String>) {
        self.stack_trace.get_or_insert(trace);
    }

    pub(crate) fn set_violating_syscall(&mut self, syscall: Syscall) {
        self.violating_syscall.get_or_insert(syscall);
    }

    pub(crate) fn set_network_violation(&mut self, message: String) {
        self.network_violation.get_or_insert(message);
    }

    pub(crate) fn set_monitor_rusage(&mut self, rusage: ResourceUsage) {
        self.monitor_rusage.get_or_insert(rusage);
    }

    pub fn final_status(&self) -> FinalStatus {
        self.final_status
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// True for a normal exit with code zero.
    pub fn ok(&self) -> bool {
        self.final_status == FinalStatus::Ok && self.reason == Reason::ExitCode(0)
    }

    pub fn regs(&self) -> Option<&Regs> {
        self.regs.as_ref()
    }

    pub fn prog_name(&self) -> Option<&str> {
        self.prog_name.as_deref()
    }

    pub fn proc_maps(&self) -> Option<&str> {
        self.proc_maps.as_deref()
    }

    pub fn stack_trace(&self) -> Option<&[String]> {
        self.stack_trace.as_deref()
    }

    pub fn violating_syscall(&self) -> Option<&Syscall> {
        self.violating_syscall.as_ref()
    }

    pub fn network_violation(&self) -> Option<&str> {
        self.network_violation.as_deref()
    }

    pub fn monitor_rusage(&self) -> Option<&ResourceUsage> {
        self.monitor_rusage.as_ref()
    }
}

impl fmt::Display for SandboxResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.final_status, self.reason) {
            (FinalStatus::Ok, Reason::ExitCode(code)) => {
                write!(f, "OK (exit code {})", code)
            }
            (FinalStatus::Signaled, Reason::Signal(signo)) => {
                write!(f, "SIGNALED ({})", signal_name(signo))
            }
            (FinalStatus::Violation, Reason::Syscall(nr)) => {
                write!(f, "VIOLATION (syscall #{})", nr)
            }
            (FinalStatus::Violation, Reason::Network) => write!(f, "VIOLATION (network)"),
            (FinalStatus::Timeout, _) => write!(f, "TIMEOUT"),
            (FinalStatus::ExternalKill, _) => write!(f, "EXTERNAL_KILL"),
            (FinalStatus::SetupError, Reason::Setup(failure)) => {
                write!(f, "SETUP_ERROR ({:?})", failure)
            }
            (FinalStatus::InternalError, Reason::Internal(failure)) => {
                write!(f, "INTERNAL_ERROR ({:?})", failure)
            }
            (status, reason) => write!(f, "{:?} ({:?})", status, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_status_wins() {
        let mut result = SandboxResult::new();
        result.set_exit_status(FinalStatus::Timeout, Reason::None);
        result.set_exit_status(FinalStatus::Ok, Reason::ExitCode(0));
        assert_eq!(result.final_status(), FinalStatus::Timeout);
        assert_eq!(result.reason(), Reason::None);
    }

    #[test]
    fn ok_requires_zero_exit_code() {
        let mut result = SandboxResult::new();
        result.set_exit_status(FinalStatus::Ok, Reason::ExitCode(0));
        assert!(result.ok());

        let mut nonzero = SandboxResult::new();
        nonzero.set_exit_status(FinalStatus::Ok, Reason::ExitCode(3));
        assert!(!nonzero.ok());
    }

    #[test]
    fn artifact_fields_are_write_once() {
        let mut result = SandboxResult::new();
        result.set_prog_name("/bin/first".to_string());
        result.set_prog_name("/bin/second".to_string());
        assert_eq!(result.prog_name(), Some("/bin/first"));

        result.set_stack_trace(vec!["main(0x1)".to_string()]);
        result.set_stack_trace(vec![]);
        assert_eq!(result.stack_trace().unwrap().len(), 1);
    }

    #[test]
    fn display_summaries() {
        let mut ok = SandboxResult::new();
        ok.set_exit_status(FinalStatus::Ok, Reason::ExitCode(0));
        assert_eq!(ok.to_string(), "OK (exit code 0)");

        let mut signaled = SandboxResult::new();
        signaled.set_exit_status(FinalStatus::Signaled, Reason::Signal(libc::SIGABRT));
        assert_eq!(signaled.to_string(), "SIGNALED (SIGABRT)");

        let mut violation = SandboxResult::new();
        violation.set_exit_status(FinalStatus::Violation, Reason::Syscall(41));
        assert_eq!(violation.to_string(), "VIOLATION (syscall #41)");
    }
}
