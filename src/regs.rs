//! Register access for stopped tracees.
//!
//! A `Regs` value is a snapshot taken at a ptrace stop. Reads of a task
//! that died in the meantime surface as `TraceeGone` so callers can
//! swallow the race; every other failure is real.

use std::fmt;

use nix::errno::Errno;
use nix::unistd::Pid;

use warden_core::{Result, WardenError};

use crate::syscall::{CpuArch, MAX_ARGS, Syscall};

/// Register snapshot of one tracee.
#[derive(Clone, Copy)]
pub struct Regs {
    pid: Pid,
    user: libc::user_regs_struct,
}

impl Regs {
    /// Read the registers of a stopped tracee.
    pub fn fetch(pid: Pid) -> Result<Regs> {
        let user = fetch_user_regs(pid).map_err(|errno| match errno {
            Errno::ESRCH => WardenError::TraceeGone(pid.as_raw()),
            e => WardenError::Syscall(format!("reading registers of {} failed: {}", pid, e)),
        })?;
        Ok(Regs { pid, user })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Decode the syscall the tracee is stopped at.
    pub fn to_syscall(&self, arch: CpuArch) -> Syscall {
        let (nr, args) = decode_syscall(&self.user);
        Syscall::new(
            arch,
            nr,
            args,
            self.pid,
            self.stack_pointer(),
            self.instruction_pointer(),
        )
    }

    /// Overwrite the syscall return register, pushing the value back into
    /// the tracee. Used to force `-ENOSYS` into a denied syscall.
    pub fn set_return_value(&mut self, value: i64) -> Result<()> {
        write_return_value(&mut self.user, value);
        store_user_regs(self.pid, &self.user).map_err(|errno| match errno {
            Errno::ESRCH => WardenError::TraceeGone(self.pid.as_raw()),
            e => WardenError::Syscall(format!("writing registers of {} failed: {}", self.pid, e)),
        })
    }

    pub fn return_value(&self) -> i64 {
        read_return_value(&self.user)
    }

    pub fn instruction_pointer(&self) -> u64 {
        instruction_pointer(&self.user)
    }

    pub fn stack_pointer(&self) -> u64 {
        stack_pointer(&self.user)
    }

    pub fn frame_pointer(&self) -> u64 {
        frame_pointer(&self.user)
    }
}

impl fmt::Debug for Regs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Regs")
            .field("pid", &self.pid)
            .field("ip", &format_args!("{:#x}", self.instruction_pointer()))
            .field("sp", &format_args!("{:#x}", self.stack_pointer()))
            .finish()
    }
}

#[cfg(target_arch = "x86_64")]
fn fetch_user_regs(pid: Pid) -> std::result::Result<libc::user_regs_struct, Errno> {
    nix::sys::ptrace::getregs(pid)
}

#[cfg(target_arch = "x86_64")]
fn store_user_regs(pid: Pid, user: &libc::user_regs_struct) -> std::result::Result<(), Errno> {
    nix::sys::ptrace::setregs(pid, *user)
}

// nix only wraps PTRACE_GETREGS on x86; aarch64 goes through the
// iovec-based GETREGSET request.
#[cfg(target_arch = "aarch64")]
fn fetch_user_regs(pid: Pid) -> std::result::Result<libc::user_regs_struct, Errno> {
    let mut user: libc::user_regs_struct = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: &mut user as *mut _ as *mut libc::c_void,
        iov_len: std::mem::size_of::<libc::user_regs_struct>(),
    };
    // SAFETY: iov points at a properly sized register buffer.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            libc::NT_PRSTATUS,
            &mut iov as *mut libc::iovec,
        )
    };
    if rc == -1 {
        return Err(Errno::last());
    }
    Ok(user)
}

#[cfg(target_arch = "aarch64")]
fn store_user_regs(pid: Pid, user: &libc::user_regs_struct) -> std::result::Result<(), Errno> {
    let mut copy = *user;
    let mut iov = libc::iovec {
        iov_base: &mut copy as *mut _ as *mut libc::c_void,
        iov_len: std::mem::size_of::<libc::user_regs_struct>(),
    };
    // SAFETY: iov points at a properly sized register buffer.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            libc::NT_PRSTATUS,
            &mut iov as *mut libc::iovec,
        )
    };
    if rc == -1 {
        return Err(Errno::last());
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn decode_syscall(user: &libc::user_regs_struct) -> (u64, [u64; MAX_ARGS]) {
    (
        user.orig_rax,
        [user.rdi, user.rsi, user.rdx, user.r10, user.r8, user.r9],
    )
}

#[cfg(target_arch = "x86_64")]
fn read_return_value(user: &libc::user_regs_struct) -> i64 {
    user.rax as i64
}

#[cfg(target_arch = "x86_64")]
fn write_return_value(user: &mut libc::user_regs_struct, value: i64) {
    user.rax = value as u64;
}

#[cfg(target_arch = "x86_64")]
fn instruction_pointer(user: &libc::user_regs_struct) -> u64 {
    user.rip
}

#[cfg(target_arch = "x86_64")]
fn stack_pointer(user: &libc::user_regs_struct) -> u64 {
    user.rsp
}

#[cfg(target_arch = "x86_64")]
fn frame_pointer(user: &libc::user_regs_struct) -> u64 {
    user.rbp
}

#[cfg(target_arch = "aarch64")]
fn decode_syscall(user: &libc::user_regs_struct) -> (u64, [u64; MAX_ARGS]) {
    (
        user.regs[8],
        [
            user.regs[0],
            user.regs[1],
            user.regs[2],
            user.regs[3],
            user.regs[4],
            user.regs[5],
        ],
    )
}

#[cfg(target_arch = "aarch64")]
fn read_return_value(user: &libc::user_regs_struct) -> i64 {
    user.regs[0] as i64
}

#[cfg(target_arch = "aarch64")]
fn write_return_value(user: &mut libc::user_regs_struct, value: i64) {
    user.regs[0] = value as u64;
}

#[cfg(target_arch = "aarch64")]
fn instruction_pointer(user: &libc::user_regs_struct) -> u64 {
    user.pc
}

#[cfg(target_arch = "aarch64")]
fn stack_pointer(user: &libc::user_regs_struct) -> u64 {
    user.sp
}

#[cfg(target_arch = "aarch64")]
fn frame_pointer(user: &libc::user_regs_struct) -> u64 {
    user.regs[29]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_of_missing_task_is_tracee_gone() {
        let err = Regs::fetch(Pid::from_raw(9_999_999)).unwrap_err();
        assert!(err.is_tracee_gone());
    }

    #[test]
    fn syscall_decode_roundtrip() {
        let mut user: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        #[cfg(target_arch = "x86_64")]
        {
            user.orig_rax = libc::SYS_write as u64;
            user.rdi = 1;
            user.rsi = 0x1000;
            user.rdx = 64;
        }
        #[cfg(target_arch = "aarch64")]
        {
            user.regs[8] = libc::SYS_write as u64;
            user.regs[0] = 1;
            user.regs[1] = 0x1000;
            user.regs[2] = 64;
        }
        let regs = Regs {
            pid: Pid::from_raw(1),
            user,
        };
        let syscall = regs.to_syscall(CpuArch::host());
        assert_eq!(syscall.nr(), libc::SYS_write as u64);
        assert_eq!(syscall.args()[0], 1);
        assert_eq!(syscall.args()[2], 64);
    }

    #[test]
    fn return_value_rewrite_is_visible_locally() {
        let user: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        let mut regs = Regs {
            pid: Pid::from_raw(1),
            user,
        };
        write_return_value(&mut regs.user, -(libc::ENOSYS as i64));
        assert_eq!(regs.return_value(), -(libc::ENOSYS as i64));
    }
}
