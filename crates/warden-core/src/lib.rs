//! warden-core: shared types and /proc plumbing for the warden supervisor
//!
//! This crate provides the foundation used by every warden sub-crate:
//! - Error types and Result alias
//! - `/proc` readers (task lists, program name, memory maps)
//! - Resource-usage snapshots
//! - Signal and ptrace-event names for log lines

pub mod error;
pub mod names;
pub mod proc;

pub use error::{Result, WardenError};
pub use proc::ResourceUsage;
