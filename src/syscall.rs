//! Syscall records captured at seccomp stops.
//!
//! A record is immutable once built from the registers and lives through
//! one arbitration cycle, plus one return-value inspection when the
//! observer asked for it.

use std::fmt;

use nix::unistd::Pid;

/// Maximum number of syscall arguments on Linux.
pub const MAX_ARGS: usize = 6;

/// Instruction-set architecture of an intercepted syscall.
///
/// The in-kernel filter encodes this tag in the low bits of the seccomp
/// event message; the numbering here is the wire contract with the
/// policy compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum CpuArch {
    Unknown = 0,
    X8664 = 1,
    X86 = 2,
    Arm64 = 3,
    Arm = 4,
    Ppc64Le = 5,
}

impl CpuArch {
    const MAX_TAG: u64 = CpuArch::Ppc64Le as u64;

    /// Architecture of the machine the monitor runs on.
    pub const fn host() -> CpuArch {
        if cfg!(target_arch = "x86_64") {
            CpuArch::X8664
        } else if cfg!(target_arch = "x86") {
            CpuArch::X86
        } else if cfg!(target_arch = "aarch64") {
            CpuArch::Arm64
        } else if cfg!(target_arch = "arm") {
            CpuArch::Arm
        } else if cfg!(target_arch = "powerpc64") {
            CpuArch::Ppc64Le
        } else {
            CpuArch::Unknown
        }
    }

    /// Decode an event-message tag. Out-of-range values yield `None`;
    /// a dying tracee can leave its exit status in the event message, so
    /// callers treat `None` as "ignore, the exit event follows".
    pub fn from_tag(tag: u64) -> Option<CpuArch> {
        match tag {
            0 => Some(CpuArch::Unknown),
            1 => Some(CpuArch::X8664),
            2 => Some(CpuArch::X86),
            3 => Some(CpuArch::Arm64),
            4 => Some(CpuArch::Arm),
            5 => Some(CpuArch::Ppc64Le),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            CpuArch::Unknown => "unknown",
            CpuArch::X8664 => "x86-64",
            CpuArch::X86 => "x86",
            CpuArch::Arm64 => "arm64",
            CpuArch::Arm => "arm",
            CpuArch::Ppc64Le => "ppc64le",
        }
    }
}

/// One intercepted syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syscall {
    arch: CpuArch,
    nr: u64,
    args: [u64; MAX_ARGS],
    pid: Pid,
    sp: u64,
    ip: u64,
}

impl Syscall {
    pub fn new(arch: CpuArch, nr: u64, args: [u64; MAX_ARGS], pid: Pid, sp: u64, ip: u64) -> Self {
        Syscall {
            arch,
            nr,
            args,
            pid,
            sp,
            ip,
        }
    }

    pub fn arch(&self) -> CpuArch {
        self.arch
    }

    pub fn nr(&self) -> u64 {
        self.nr
    }

    pub fn args(&self) -> &[u64; MAX_ARGS] {
        &self.args
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn stack_pointer(&self) -> u64 {
        self.sp
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.ip
    }

    /// Name of the syscall when it is one the host architecture knows,
    /// otherwise `syscall#<nr>`.
    pub fn name(&self) -> String {
        if self.arch == CpuArch::host() {
            if let Some(name) = host_syscall_name(self.nr) {
                return name.to_string();
            }
        }
        format!("syscall#{}", self.nr)
    }

    /// True for the process-creation family whose completion arrives as a
    /// new-task event instead of a syscall-exit stop.
    pub fn creates_process(&self) -> bool {
        creates_process(self.nr)
    }

    /// True for the exec family whose completion arrives as an exec event.
    pub fn is_exec(&self) -> bool {
        self.nr == libc::SYS_execve as u64 || self.nr == libc::SYS_execveat as u64
    }

    /// Extra context for a violation log line, for the cases with a
    /// well-known cause.
    pub fn violation_hint(&self) -> Option<&'static str> {
        if self.arch != CpuArch::host() {
            return Some("the syscall architecture differs from the monitor's");
        }
        if self.nr == libc::SYS_ptrace as u64 {
            return Some("ptrace is unsafe under supervision and is always blocked");
        }
        if self.nr == libc::SYS_bpf as u64 {
            return Some("bpf is risky under supervision and is always blocked");
        }
        if self.nr == libc::SYS_clone as u64 && self.args[0] & (libc::CLONE_UNTRACED as u64) != 0 {
            return Some("clone with CLONE_UNTRACED would escape supervision");
        }
        None
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}({:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x}) IP: {:#x}, STACK: {:#x}",
            self.arch.description(),
            self.name(),
            self.args[0],
            self.args[1],
            self.args[2],
            self.args[3],
            self.args[4],
            self.args[5],
            self.ip,
            self.sp,
        )
    }
}

pub(crate) fn creates_process(nr: u64) -> bool {
    if nr == libc::SYS_clone as u64 || nr == libc::SYS_clone3 as u64 {
        return true;
    }
    #[cfg(target_arch = "x86_64")]
    {
        if nr == libc::SYS_fork as u64 || nr == libc::SYS_vfork as u64 {
            return true;
        }
    }
    false
}

fn host_syscall_name(nr: u64) -> Option<&'static str> {
    let nr = nr as i64;
    let name = match nr {
        n if n == libc::SYS_read => "read",
        n if n == libc::SYS_write => "write",
        n if n == libc::SYS_close => "close",
        n if n == libc::SYS_mmap => "mmap",
        n if n == libc::SYS_mprotect => "mprotect",
        n if n == libc::SYS_munmap => "munmap",
        n if n == libc::SYS_brk => "brk",
        n if n == libc::SYS_ioctl => "ioctl",
        n if n == libc::SYS_openat => "openat",
        n if n == libc::SYS_clone => "clone",
        n if n == libc::SYS_clone3 => "clone3",
        n if n == libc::SYS_execve => "execve",
        n if n == libc::SYS_execveat => "execveat",
        n if n == libc::SYS_exit => "exit",
        n if n == libc::SYS_exit_group => "exit_group",
        n if n == libc::SYS_wait4 => "wait4",
        n if n == libc::SYS_kill => "kill",
        n if n == libc::SYS_ptrace => "ptrace",
        n if n == libc::SYS_bpf => "bpf",
        n if n == libc::SYS_socket => "socket",
        n if n == libc::SYS_connect => "connect",
        n if n == libc::SYS_sendto => "sendto",
        n if n == libc::SYS_recvfrom => "recvfrom",
        n if n == libc::SYS_futex => "futex",
        n if n == libc::SYS_nanosleep => "nanosleep",
        n if n == libc::SYS_clock_nanosleep => "clock_nanosleep",
        n if n == libc::SYS_getpid => "getpid",
        n if n == libc::SYS_gettid => "gettid",
        n if n == libc::SYS_seccomp => "seccomp",
        n if n == libc::SYS_prctl => "prctl",
        _ => return platform_syscall_name(nr),
    };
    Some(name)
}

#[cfg(target_arch = "x86_64")]
fn platform_syscall_name(nr: i64) -> Option<&'static str> {
    let name = match nr {
        n if n == libc::SYS_open => "open",
        n if n == libc::SYS_stat => "stat",
        n if n == libc::SYS_fork => "fork",
        n if n == libc::SYS_vfork => "vfork",
        _ => return None,
    };
    Some(name)
}

#[cfg(not(target_arch = "x86_64"))]
fn platform_syscall_name(_nr: i64) -> Option<&'static str> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(nr: u64, args: [u64; MAX_ARGS]) -> Syscall {
        Syscall::new(CpuArch::host(), nr, args, Pid::from_raw(100), 0x7fff0000, 0x401000)
    }

    #[test]
    fn host_arch_is_known() {
        assert_ne!(CpuArch::host(), CpuArch::Unknown);
    }

    #[test]
    fn tag_roundtrip() {
        for tag in 0..=CpuArch::MAX_TAG {
            let arch = CpuArch::from_tag(tag).unwrap();
            assert_eq!(arch as u64, tag);
        }
        assert_eq!(CpuArch::from_tag(CpuArch::MAX_TAG + 1), None);
        assert_eq!(CpuArch::from_tag(0x4100), None);
    }

    #[test]
    fn known_syscall_name() {
        let syscall = sample(libc::SYS_write as u64, [1, 0, 0, 0, 0, 0]);
        assert_eq!(syscall.name(), "write");
    }

    #[test]
    fn unknown_syscall_name() {
        let syscall = sample(98765, [0; MAX_ARGS]);
        assert_eq!(syscall.name(), "syscall#98765");
    }

    #[test]
    fn foreign_arch_uses_raw_number() {
        let syscall = Syscall::new(
            CpuArch::Unknown,
            libc::SYS_write as u64,
            [0; MAX_ARGS],
            Pid::from_raw(1),
            0,
            0,
        );
        assert!(syscall.name().starts_with("syscall#"));
    }

    #[test]
    fn process_creation_family() {
        assert!(sample(libc::SYS_clone as u64, [0; MAX_ARGS]).creates_process());
        assert!(sample(libc::SYS_clone3 as u64, [0; MAX_ARGS]).creates_process());
        assert!(!sample(libc::SYS_write as u64, [0; MAX_ARGS]).creates_process());
    }

    #[test]
    fn exec_family() {
        assert!(sample(libc::SYS_execve as u64, [0; MAX_ARGS]).is_exec());
        assert!(sample(libc::SYS_execveat as u64, [0; MAX_ARGS]).is_exec());
        assert!(!sample(libc::SYS_openat as u64, [0; MAX_ARGS]).is_exec());
    }

    #[test]
    fn violation_hints() {
        assert!(sample(libc::SYS_ptrace as u64, [0; MAX_ARGS])
            .violation_hint()
            .unwrap()
            .contains("ptrace"));
        let untraced = sample(
            libc::SYS_clone as u64,
            [libc::CLONE_UNTRACED as u64, 0, 0, 0, 0, 0],
        );
        assert!(untraced.violation_hint().unwrap().contains("CLONE_UNTRACED"));
        assert!(sample(libc::SYS_write as u64, [0; MAX_ARGS])
            .violation_hint()
            .is_none());
    }

    #[test]
    fn display_includes_name_and_registers() {
        let text = sample(libc::SYS_read as u64, [3, 0x1000, 64, 0, 0, 0]).to_string();
        assert!(text.contains("read"));
        assert!(text.contains("IP: 0x401000"));
    }
}
