//! Fair draining of tracee status events.
//!
//! `waitpid` is biased towards recently active tasks; under load that can
//! starve older threads. The waiter counters this by draining every ready
//! status into a buffer in one pass and handing them out one at a time,
//! so every ready tracee is observed between any two refills.

use std::collections::VecDeque;

use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

/// Outcome of one [`TaskWaiter::wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A tracee needs attention.
    Ready(Pid, WaitStatus),
    /// Nothing is ready right now.
    Idle,
    /// The kernel reap call failed; reported once, then cleared.
    Failed(Errno),
}

/// Buffering waiter over one trace group.
pub struct TaskWaiter {
    priority_pid: Pid,
    statuses: VecDeque<(Pid, WaitStatus)>,
    deferred_errno: Option<Errno>,
}

impl TaskWaiter {
    /// The given pid is polled first on every refill.
    pub fn new(priority_pid: Pid) -> TaskWaiter {
        TaskWaiter {
            priority_pid,
            statuses: VecDeque::new(),
            deferred_errno: None,
        }
    }

    /// Next buffered status, refilling from the kernel when the buffer is
    /// empty and no error is pending.
    pub fn wait(&mut self) -> WaitOutcome {
        if self.statuses.is_empty() && self.deferred_errno.is_none() {
            self.refill();
        }
        if let Some((pid, status)) = self.statuses.pop_front() {
            return WaitOutcome::Ready(pid, status);
        }
        match self.deferred_errno.take() {
            Some(errno) => WaitOutcome::Failed(errno),
            None => WaitOutcome::Idle,
        }
    }

    fn refill(&mut self) {
        let flags =
            WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD;
        let mut target = Some(self.priority_pid);
        loop {
            match waitpid(target, Some(flags)) {
                Ok(WaitStatus::StillAlive) => {
                    if target.is_none() {
                        break;
                    }
                }
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        self.statuses.push_back((pid, status));
                    }
                }
                Err(errno) => {
                    self.deferred_errno = Some(errno);
                    break;
                }
            }
            target = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::{ForkResult, fork};
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    fn fork_exiting_child(code: i32) -> Pid {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => std::process::exit(code),
            ForkResult::Parent { child } => child,
        }
    }

    fn drain_until(waiter: &mut TaskWaiter, expected: usize) -> Vec<(Pid, WaitStatus)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while seen.len() < expected && Instant::now() < deadline {
            match waiter.wait() {
                WaitOutcome::Ready(pid, status) => seen.push((pid, status)),
                WaitOutcome::Idle => std::thread::sleep(Duration::from_millis(5)),
                WaitOutcome::Failed(errno) => panic!("waitpid failed: {}", errno),
            }
        }
        seen
    }

    #[test]
    fn observes_every_child_exactly_once() {
        let children: Vec<Pid> = (0..3).map(|i| fork_exiting_child(i)).collect();
        let mut waiter = TaskWaiter::new(children[0]);

        let seen = drain_until(&mut waiter, children.len());
        let seen_pids: HashSet<Pid> = seen.iter().map(|(pid, _)| *pid).collect();
        assert_eq!(seen_pids, children.iter().copied().collect());
        assert_eq!(seen.len(), children.len());
    }

    #[test]
    fn reports_exit_codes() {
        let child = fork_exiting_child(42);
        let mut waiter = TaskWaiter::new(child);
        let seen = drain_until(&mut waiter, 1);
        assert_eq!(seen[0].1, WaitStatus::Exited(child, 42));
    }

    #[test]
    fn reports_signaled_children() {
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                std::thread::sleep(Duration::from_secs(1));
            },
            ForkResult::Parent { child } => child,
        };
        kill(child, Signal::SIGKILL).unwrap();

        let mut waiter = TaskWaiter::new(child);
        let seen = drain_until(&mut waiter, 1);
        assert_eq!(seen[0].1, WaitStatus::Signaled(child, Signal::SIGKILL, false));
    }

    #[test]
    fn error_is_reported_once_then_cleared() {
        // This thread has no children, so the reap call fails with ECHILD.
        let mut waiter = TaskWaiter::new(Pid::from_raw(9_999_999));
        assert_eq!(waiter.wait(), WaitOutcome::Failed(Errno::ECHILD));
        // The error was consumed; the next call refills and defers again
        // rather than replaying a stale errno.
        assert_eq!(waiter.wait(), WaitOutcome::Failed(Errno::ECHILD));
    }
}
