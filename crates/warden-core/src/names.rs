//! Human-readable names for signals and ptrace events, used in log lines.

use nix::sys::signal::Signal;

/// Name of a signal number, or `SIG<n>` for unknown/realtime signals.
pub fn signal_name(signo: i32) -> String {
    match Signal::try_from(signo) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("SIG{}", signo),
    }
}

/// Name of a ptrace event code as reported in a stop status.
pub fn ptrace_event_name(event: i32) -> &'static str {
    match event {
        libc::PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK",
        libc::PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK",
        libc::PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE",
        libc::PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC",
        libc::PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE",
        libc::PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT",
        libc::PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP",
        128 => "PTRACE_EVENT_STOP",
        _ => "PTRACE_EVENT_UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_signal_names() {
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(libc::SIGCHLD), "SIGCHLD");
    }

    #[test]
    fn unknown_signal_number() {
        assert_eq!(signal_name(63), "SIG63");
    }

    #[test]
    fn event_names() {
        assert_eq!(
            ptrace_event_name(libc::PTRACE_EVENT_SECCOMP),
            "PTRACE_EVENT_SECCOMP"
        );
        assert_eq!(ptrace_event_name(128), "PTRACE_EVENT_STOP");
        assert_eq!(ptrace_event_name(77), "PTRACE_EVENT_UNKNOWN");
    }
}
