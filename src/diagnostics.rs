//! Crash diagnostics: registers, program name, memory map, stack trace.
//!
//! The stack trace comes from a forked unwinder helper. The monitor hands
//! it the target task id, the captured registers and a read-only fd to
//! the target's memory over a comms pair; the helper replies with a
//! status and the symbolized frames. Diagnostic failures are logged and
//! never change the terminal status.

use std::fs::File;
use std::os::fd::AsFd;

use log::{debug, error, info, warn};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork};

use warden_comms::Comms;
use warden_core::{Result, WardenError, proc};
use warden_unwind::{DEFAULT_MAX_FRAMES, UnwindFrames, UnwindSetup, serve};
use warden_unwind::symbolize::compact_frames;

use crate::policy::Policy;
use crate::regs::Regs;
use crate::result::SandboxResult;

/// Fill the result with everything we can still read about the tracee:
/// registers, program name, the raw memory map, and a symbolized stack
/// trace when the policy permits one for the recorded status.
pub(crate) fn set_additional_info(result: &mut SandboxResult, regs: Regs, policy: &Policy) {
    let pid = regs.pid();
    result.set_regs(regs);
    result.set_prog_name(proc::prog_name(pid));
    match proc::read_maps(pid) {
        Ok(maps) => result.set_proc_maps(maps),
        Err(e) => warn!("could not snapshot memory map of {}: {}", pid, e),
    }

    if !policy.should_collect_stack_trace(result.final_status()) {
        debug!("stack trace collection disabled for this outcome");
        return;
    }
    match get_and_log_stack_trace(&regs) {
        Ok(trace) => result.set_stack_trace(trace),
        Err(e) => error!("could not obtain stack trace of {}: {}", pid, e),
    }
}

/// Collect the stack trace for already-captured registers.
pub fn collect_stack_trace(regs: &Regs) -> Result<Vec<String>> {
    collect_stack_trace_raw(
        regs.pid(),
        regs.instruction_pointer(),
        regs.stack_pointer(),
        regs.frame_pointer(),
    )
}

/// Collect and log the stack trace, compacting repeated frames for the
/// log only.
pub(crate) fn get_and_log_stack_trace(regs: &Regs) -> Result<Vec<String>> {
    let trace = collect_stack_trace(regs)?;
    info!("stack trace: [");
    for frame in compact_frames(&trace) {
        info!("  {}", frame);
    }
    info!("]");
    Ok(trace)
}

/// Fetch registers of a stopped tracee and log its stack. Used for the
/// every-thread logging pass during drain.
pub(crate) fn log_stack_trace_of(pid: Pid) {
    let regs = match Regs::fetch(pid) {
        Ok(regs) => regs,
        Err(e) => {
            error!("failed to read registers of {}: {}", pid, e);
            return;
        }
    };
    if let Err(e) = get_and_log_stack_trace(&regs) {
        error!("failed to get stack trace of {}: {}", pid, e);
    }
}

fn collect_stack_trace_raw(pid: Pid, ip: u64, sp: u64, fp: u64) -> Result<Vec<String>> {
    let mem = File::open(format!("/proc/{}/mem", pid.as_raw()))
        .map_err(|e| WardenError::Unwind(format!("opening memory of {} failed: {}", pid, e)))?;

    let (mut monitor_end, mut helper_end) = Comms::pair()?;

    // The helper holds no privilege over the target beyond the memory fd
    // it is handed; it never touches ptrace.
    let helper = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(monitor_end);
            let _ = serve(&mut helper_end);
            // SAFETY: plain process exit in the forked helper.
            unsafe { libc::_exit(0) }
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(errno) => {
            return Err(WardenError::Unwind(format!(
                "forking the unwinder helper failed: {}",
                errno
            )));
        }
    };
    // The parent must not keep the helper's end open, or it would never
    // observe the helper hanging up.
    drop(helper_end);

    let outcome = run_unwind_protocol(&mut monitor_end, pid, ip, sp, fp, &mem);
    if let Err(e) = waitpid(helper, None) {
        warn!("reaping the unwinder helper failed: {}", e);
    }
    outcome
}

fn run_unwind_protocol(
    comms: &mut Comms,
    pid: Pid,
    ip: u64,
    sp: u64,
    fp: u64,
    mem: &File,
) -> Result<Vec<String>> {
    comms.send_msg(&UnwindSetup {
        pid: pid.as_raw(),
        instruction_pointer: ip,
        stack_pointer: sp,
        frame_pointer: fp,
        max_frames: DEFAULT_MAX_FRAMES,
    })?;
    comms.send_fd(mem.as_fd())?;

    comms
        .recv_status()?
        .map_err(|msg| WardenError::Unwind(format!("unwinder reported: {}", msg)))?;
    let reply: UnwindFrames = comms.recv_msg()?;
    Ok(reply.frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_own_frames_through_helper() {
        let pid = Pid::from_raw(std::process::id() as i32);
        let ip = collects_own_frames_through_helper as usize as u64;
        let trace = collect_stack_trace_raw(pid, ip, 0, 0).unwrap();
        assert_eq!(trace.len(), 1);
        assert!(trace[0].contains(&format!("0x{:x}", ip)));
    }

    #[test]
    fn missing_target_reports_unwind_error() {
        let err = collect_stack_trace_raw(Pid::from_raw(9_999_999), 0x1000, 0, 0).unwrap_err();
        assert!(err.to_string().contains("memory"));
    }
}
