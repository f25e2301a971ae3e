//! The helper-process side of the stack trace pipeline.
//!
//! The monitor forks a helper which calls [`serve`] on its end of a comms
//! pair. The helper receives the setup message and the target's memory
//! fd, walks and symbolizes the stack, and replies with a status frame
//! followed by the frames on success.

use std::fs::File;

use serde::{Deserialize, Serialize};

use nix::unistd::Pid;
use warden_comms::Comms;
use warden_core::Result;

use crate::symbolize::{load_symbol_map, symbolize};
use crate::walk::walk_frames;

/// Setup message: target task plus the registers the walk starts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwindSetup {
    pub pid: i32,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub frame_pointer: u64,
    pub max_frames: usize,
}

/// Reply message carrying the symbolized frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwindFrames {
    pub frames: Vec<String>,
}

/// Walk and symbolize per the setup message, reading the target's memory
/// through `mem` only.
pub fn unwind_and_symbolize(setup: &UnwindSetup, mem: &File) -> Result<Vec<String>> {
    let ips = walk_frames(
        mem,
        setup.instruction_pointer,
        setup.frame_pointer,
        setup.max_frames,
    )?;
    let map = load_symbol_map(Pid::from_raw(setup.pid))?;
    Ok(symbolize(&map, &ips))
}

/// Serve exactly one unwind request on `comms`, then return.
///
/// Protocol errors (a peer that hangs up mid-request) surface as `Err`;
/// unwind failures are reported to the peer as an error status and are
/// not an error here.
pub fn serve(comms: &mut Comms) -> Result<()> {
    let setup: UnwindSetup = comms.recv_msg()?;
    let mem = File::from(comms.recv_fd()?);

    match unwind_and_symbolize(&setup, &mem) {
        Ok(frames) => {
            comms.send_status(Ok(()))?;
            comms.send_msg(&UnwindFrames { frames })
        }
        Err(e) => comms.send_status(Err(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn serve_replies_with_own_frames() {
        let (mut monitor_end, mut helper_end) = Comms::pair().unwrap();
        let handle = std::thread::spawn(move || serve(&mut helper_end));

        let mem = File::open("/proc/self/mem").unwrap();
        let setup = UnwindSetup {
            pid: std::process::id() as i32,
            instruction_pointer: serve_replies_with_own_frames as usize as u64,
            stack_pointer: 0,
            frame_pointer: 0,
            max_frames: 8,
        };
        monitor_end.send_msg(&setup).unwrap();
        monitor_end.send_fd(mem.as_fd()).unwrap();

        assert_eq!(monitor_end.recv_status().unwrap(), Ok(()));
        let reply: UnwindFrames = monitor_end.recv_msg().unwrap();
        assert_eq!(reply.frames.len(), 1);
        assert!(reply.frames[0].contains("0x"));

        handle.join().unwrap().unwrap();
    }

    #[test]
    fn serve_reports_failure_for_dead_target() {
        let (mut monitor_end, mut helper_end) = Comms::pair().unwrap();
        let handle = std::thread::spawn(move || serve(&mut helper_end));

        let mem = File::open("/proc/self/mem").unwrap();
        let setup = UnwindSetup {
            pid: 9_999_999,
            instruction_pointer: 0x1000,
            stack_pointer: 0,
            frame_pointer: 0,
            max_frames: 8,
        };
        monitor_end.send_msg(&setup).unwrap();
        monitor_end.send_fd(mem.as_fd()).unwrap();

        let status = monitor_end.recv_status().unwrap();
        assert!(status.is_err());

        handle.join().unwrap().unwrap();
    }
}
