//! warden: ptrace-based supervisor for Linux process sandboxes
//!
//! The monitor attaches to an already-spawned child, cooperates with the
//! in-kernel seccomp filter to receive trace notifications, arbitrates
//! every intercepted syscall against a policy, and reports the child's
//! terminal status together with crash diagnostics.
//!
//! Spawning the child, compiling the filter and proxying the network are
//! external collaborators; the supervisor receives their handles.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use warden::{DefaultNotify, Limits, Policy, SandboxeeProcess, Supervisor};
//!
//! // `process` comes from the spawner: main pid + connected comms pair.
//! let mut supervisor = Supervisor::new(
//!     process,
//!     Policy::default(),
//!     Box::new(DefaultNotify),
//!     Limits::with_wall_time(Duration::from_secs(30)),
//! );
//! supervisor.run_async()?;
//! let result = supervisor.await_result()?;
//! println!("sandboxee finished: {}", result);
//! ```

pub mod config;
pub mod diagnostics;
pub mod executor;
pub mod monitor;
pub mod notify;
pub mod policy;
pub mod regs;
pub mod result;
pub mod syscall;

// Re-export sub-crate types for convenience
pub use warden_comms::{CLIENT_DONE, Comms};
pub use warden_core::{ResourceUsage, Result, WardenError};

pub use config::MonitorConfig;
pub use executor::{Limits, SandboxeeProcess};
pub use monitor::event::TraceEvent;
pub use monitor::waiter::{TaskWaiter, WaitOutcome};
pub use monitor::{NetworkViolationFlag, Supervisor};
pub use notify::{DefaultNotify, Notify, TraceAction};
pub use policy::Policy;
pub use regs::Regs;
pub use result::{
    FinalStatus, InternalFailure, Reason, SandboxResult, SetupFailure, ViolationKind,
};
pub use syscall::{CpuArch, Syscall};
