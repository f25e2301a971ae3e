//! Monitor configuration.
//!
//! These were process-wide flags in earlier sandbox generations; here
//! they are injected at supervisor construction.

use std::path::PathBuf;
use std::time::Duration;

/// Knobs of one supervisor instance.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Permit every traced syscall instead of treating a deny as a
    /// violation. For debugging policies only.
    pub permit_all: bool,
    /// Like `permit_all`, but append a line per permitted syscall to the
    /// given file.
    pub permit_all_log: Option<PathBuf>,
    /// Log a stack trace for every thread that terminates with a signal,
    /// not just the main task.
    pub log_all_stack_traces: bool,
    /// Drain budget when `log_all_stack_traces` is set; the default
    /// drain budget of 200 ms applies otherwise.
    pub stack_collection_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            permit_all: false,
            permit_all_log: None,
            log_all_stack_traces: false,
            stack_collection_timeout: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_strict() {
        let config = MonitorConfig::default();
        assert!(!config.permit_all);
        assert!(config.permit_all_log.is_none());
        assert!(!config.log_all_stack_traces);
        assert_eq!(config.stack_collection_timeout, Duration::from_secs(1));
    }
}
