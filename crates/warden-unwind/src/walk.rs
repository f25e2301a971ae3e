//! Frame-pointer walk over a task's memory fd.
//!
//! The frame record layout is the same on x86_64 and aarch64: the saved
//! frame pointer sits at `[fp]` and the return address one word above it.
//! The walk stops at a null frame pointer, an unreadable word, or the
//! frame budget.

use std::fs::File;
use std::os::unix::fs::FileExt;

use warden_core::{Result, WardenError};

const WORD: u64 = std::mem::size_of::<u64>() as u64;

/// Read one word of target memory through the mem fd.
fn read_word(mem: &File, addr: u64) -> Result<u64> {
    let mut buf = [0u8; WORD as usize];
    mem.read_exact_at(&mut buf, addr)
        .map_err(|e| WardenError::Unwind(format!("read of target 0x{:x} failed: {}", addr, e)))?;
    Ok(u64::from_le_bytes(buf))
}

/// Walk the frame-pointer chain starting from the captured registers.
///
/// The captured instruction pointer is always the first frame; a zero
/// frame pointer yields just that one frame.
pub fn walk_frames(mem: &File, ip: u64, mut fp: u64, max_frames: usize) -> Result<Vec<u64>> {
    let mut ips = Vec::with_capacity(16);
    if max_frames == 0 {
        return Ok(ips);
    }
    ips.push(ip);

    while fp != 0 && ips.len() < max_frames {
        let ret = match read_word(mem, fp + WORD) {
            Ok(ret) => ret,
            Err(_) => break,
        };
        if ret == 0 {
            break;
        }
        ips.push(ret);
        fp = match read_word(mem, fp) {
            Ok(next) => next,
            Err(_) => break,
        };
    }
    Ok(ips)
}
