//! Readers over /proc for supervised tasks
//!
//! Everything the monitor learns about a tracee outside of ptrace comes
//! from here: the thread list of the trace group, the program name, the
//! verbatim memory map, and the monitor's own resource usage at teardown.

use std::collections::HashSet;
use std::fs;
use std::mem;

use nix::unistd::Pid;

use crate::error::{Result, WardenError};

/// List every task (thread) of the given thread group.
///
/// Reads `/proc/<pid>/task`. A directory entry that is not numeric is
/// skipped; an unreadable directory means the whole group is gone.
pub fn list_tasks(pid: Pid) -> Result<HashSet<Pid>> {
    let path = format!("/proc/{}/task", pid.as_raw());
    let entries = fs::read_dir(&path)
        .map_err(|e| WardenError::Proc(format!("failed to read {}: {}", path, e)))?;

    let mut tasks = HashSet::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| WardenError::Proc(format!("failed to read {}: {}", path, e)))?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            tasks.insert(Pid::from_raw(tid));
        }
    }
    Ok(tasks)
}

/// Program name of a task, resolved from the `/proc/<pid>/exe` symlink.
///
/// Returns an empty string if the task is gone or the link is unreadable;
/// callers only use this for log lines and diagnostics.
pub fn prog_name(pid: Pid) -> String {
    fs::read_link(format!("/proc/{}/exe", pid.as_raw()))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Full content of `/proc/<pid>/maps`, verbatim.
pub fn read_maps(pid: Pid) -> Result<String> {
    let path = format!("/proc/{}/maps", pid.as_raw());
    fs::read_to_string(&path)
        .map_err(|e| WardenError::Proc(format!("failed to read {}: {}", path, e)))
}

/// Resource usage snapshot of the monitor thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// User CPU time in milliseconds
    pub user_time_ms: u64,
    /// System CPU time in milliseconds
    pub system_time_ms: u64,
    /// Peak resident set size in kilobytes
    pub max_rss_kb: u64,
    /// Voluntary context switches
    pub voluntary_ctx_switches: u64,
    /// Involuntary context switches
    pub involuntary_ctx_switches: u64,
}

/// Resource usage of the calling thread, via `getrusage(RUSAGE_THREAD)`.
pub fn thread_rusage() -> ResourceUsage {
    // SAFETY: getrusage writes a full rusage struct into the zeroed buffer.
    let ru = unsafe {
        let mut ru: libc::rusage = mem::zeroed();
        libc::getrusage(libc::RUSAGE_THREAD, &mut ru);
        ru
    };

    let to_ms = |tv: libc::timeval| tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
    ResourceUsage {
        user_time_ms: to_ms(ru.ru_utime),
        system_time_ms: to_ms(ru.ru_stime),
        max_rss_kb: ru.ru_maxrss as u64,
        voluntary_ctx_switches: ru.ru_nvcsw as u64,
        involuntary_ctx_switches: ru.ru_nivcsw as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_pid() -> Pid {
        Pid::from_raw(std::process::id() as i32)
    }

    #[test]
    fn list_tasks_contains_self() {
        let tasks = list_tasks(self_pid()).unwrap();
        assert!(tasks.contains(&self_pid()));
    }

    #[test]
    fn list_tasks_missing_process() {
        let result = list_tasks(Pid::from_raw(9_999_999));
        assert!(result.is_err());
    }

    #[test]
    fn prog_name_of_self_is_nonempty() {
        let name = prog_name(self_pid());
        assert!(!name.is_empty());
    }

    #[test]
    fn prog_name_of_missing_process_is_empty() {
        assert!(prog_name(Pid::from_raw(9_999_999)).is_empty());
    }

    #[test]
    fn read_maps_of_self() {
        let maps = read_maps(self_pid()).unwrap();
        assert!(maps.contains("r-xp") || maps.contains("rwxp"));
    }

    #[test]
    fn thread_rusage_reports_rss() {
        let ru = thread_rusage();
        assert!(ru.max_rss_kb > 0);
    }
}
