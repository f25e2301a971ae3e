//! warden-unwind: stack walking and symbolization for supervised tasks
//!
//! This crate is the body of the unwinder helper process. The monitor
//! forks a helper, hands it the target task id, the captured registers
//! and a read-only fd to the target's memory over comms, and receives a
//! status followed by symbolized frames. Nothing here touches ptrace on
//! the target; all memory access goes through the passed fd.

pub mod elf;
pub mod maps;
pub mod symbolize;
pub mod walk;

mod service;

pub use service::{UnwindFrames, UnwindSetup, serve, unwind_and_symbolize};

/// Frame budget for a single walk.
pub const DEFAULT_MAX_FRAMES: usize = 200;
