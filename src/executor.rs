//! Handle to an already-spawned sandboxee.
//!
//! Spawning (fork/clone, namespaces, the in-kernel filter) happens in
//! an external collaborator. The monitor receives the result: the main
//! task id, optionally the pre-exec init helper of a pid namespace, and
//! the comms channel connected to the child.

use std::time::Duration;

use nix::unistd::Pid;

use warden_comms::Comms;

/// Resource limits the supervisor enforces itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    /// Wall-clock limit for the whole run; zero means unbounded.
    pub wall_time_limit: Duration,
}

impl Limits {
    pub fn with_wall_time(limit: Duration) -> Limits {
        Limits {
            wall_time_limit: limit,
        }
    }
}

/// A spawned-but-not-yet-supervised child.
pub struct SandboxeeProcess {
    /// The main task of the sandboxee.
    pub main_pid: Pid,
    /// Init helper task of the pid namespace, when one exists.
    pub init_pid: Option<Pid>,
    /// Channel to the child; the attach handshake travels over it.
    pub comms: Comms,
    /// True when the child installs its filter before its own exec; the
    /// monitor then permits everything until the exec event arrives.
    pub sandboxed_before_exec: bool,
}

impl SandboxeeProcess {
    pub fn new(main_pid: Pid, comms: Comms) -> SandboxeeProcess {
        SandboxeeProcess {
            main_pid,
            init_pid: None,
            comms,
            sandboxed_before_exec: false,
        }
    }

    pub fn with_init(mut self, init_pid: Pid) -> SandboxeeProcess {
        self.init_pid = Some(init_pid);
        self
    }

    pub fn sandboxed_before_exec(mut self) -> SandboxeeProcess {
        self.sandboxed_before_exec = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_wall_time_means_unbounded() {
        let limits = Limits::default();
        assert!(limits.wall_time_limit.is_zero());
    }

    #[test]
    fn builder_style_setters() {
        let (comms, _peer) = Comms::pair().unwrap();
        let process = SandboxeeProcess::new(Pid::from_raw(100), comms)
            .with_init(Pid::from_raw(99))
            .sandboxed_before_exec();
        assert_eq!(process.main_pid, Pid::from_raw(100));
        assert_eq!(process.init_pid, Some(Pid::from_raw(99)));
        assert!(process.sandboxed_before_exec);
    }
}
