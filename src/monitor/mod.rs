//! The lifecycle supervisor.
//!
//! One background thread per sandboxee runs the event loop: check the
//! deadline and external request flags, pull the next tracee status from
//! the [`waiter::TaskWaiter`], classify it, react. Syscall arbitration,
//! terminal-state determination and the post-loop drain all live here.
//!
//! External threads never touch the loop directly. They flip atomic
//! request flags and wake the monitor thread with a SIGCHLD; the monitor
//! blocks only inside a bounded `sigtimedwait` and the non-blocking reap,
//! and never holds a lock across either.

pub mod attach;
pub mod event;
pub mod waiter;

use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill, pthread_sigmask};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use warden_core::names::signal_name;
use warden_core::{Result, WardenError, proc};

use crate::config::MonitorConfig;
use crate::diagnostics;
use crate::executor::{Limits, SandboxeeProcess};
use crate::notify::{Notify, TraceAction};
use crate::policy::Policy;
use crate::regs::Regs;
use crate::result::{
    FinalStatus, InternalFailure, Reason, SandboxResult, SetupFailure, ViolationKind,
};
use crate::syscall::{CpuArch, Syscall};

use self::event::{Classified, TraceEvent, classify};
use self::waiter::{TaskWaiter, WaitOutcome};

/// Bounded wait when no tracee events are pending.
const WAKE_UP_PERIOD: Duration = Duration::from_millis(500);

/// Drain budget after the terminal status is known.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_millis(200);

/// State shared between the supervisor handle and the monitor thread.
struct Shared {
    /// Absolute deadline in Unix millis; zero means unbounded.
    deadline_millis: AtomicI64,
    kill_requested: AtomicBool,
    dump_requested: AtomicBool,
    network_violation: AtomicBool,
    network_violation_msg: Mutex<Option<String>>,
    monitor_thread: Mutex<Option<libc::pthread_t>>,
}

impl Shared {
    fn new() -> Shared {
        Shared {
            deadline_millis: AtomicI64::new(0),
            kill_requested: AtomicBool::new(false),
            dump_requested: AtomicBool::new(false),
            network_violation: AtomicBool::new(false),
            network_violation_msg: Mutex::new(None),
            monitor_thread: Mutex::new(None),
        }
    }

    /// Kick the monitor thread out of its bounded signal wait.
    fn wake_monitor(&self) {
        let guard = self
            .monitor_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(thread) = *guard {
            // SAFETY: the thread id is cleared before the thread handle is
            // dropped, so it refers to a live thread here.
            unsafe {
                libc::pthread_kill(thread, libc::SIGCHLD);
            }
        }
    }
}

/// Handle given to the network proxy collaborator: raising it kills the
/// sandboxee and records a network violation.
#[derive(Clone)]
pub struct NetworkViolationFlag {
    shared: Arc<Shared>,
}

impl NetworkViolationFlag {
    pub fn raise(&self, message: impl Into<String>) {
        {
            let mut guard = self
                .shared
                .network_violation_msg
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.get_or_insert(message.into());
        }
        self.shared
            .network_violation
            .store(true, Ordering::Release);
        self.shared.wake_monitor();
    }
}

/// Everything the monitor thread takes ownership of at start.
struct StartState {
    process: SandboxeeProcess,
    policy: Policy,
    notify: Box<dyn Notify>,
    config: MonitorConfig,
}

/// Supervisor of one sandboxed child.
///
/// The embedder constructs it with a started child, a compiled policy, an
/// observer and resource limits, then calls [`Supervisor::run_async`]
/// followed by [`Supervisor::await_result`]. Kill and stack-dump requests
/// may be armed from any thread at any time; arming one repeatedly is
/// equivalent to arming it once.
pub struct Supervisor {
    shared: Arc<Shared>,
    main_pid: Pid,
    // Behind a mutex so the supervisor handle stays shareable across the
    // embedder's threads; taken exactly once by run_async.
    start_state: Mutex<Option<StartState>>,
    thread: Option<thread::JoinHandle<SandboxResult>>,
}

impl Supervisor {
    pub fn new(
        process: SandboxeeProcess,
        policy: Policy,
        notify: Box<dyn Notify>,
        limits: Limits,
    ) -> Supervisor {
        Supervisor::with_config(process, policy, notify, limits, MonitorConfig::default())
    }

    pub fn with_config(
        process: SandboxeeProcess,
        policy: Policy,
        notify: Box<dyn Notify>,
        limits: Limits,
        config: MonitorConfig,
    ) -> Supervisor {
        let shared = Arc::new(Shared::new());
        if !limits.wall_time_limit.is_zero() {
            shared.deadline_millis.store(
                unix_millis_now() + limits.wall_time_limit.as_millis() as i64,
                Ordering::Relaxed,
            );
        }
        Supervisor {
            shared,
            main_pid: process.main_pid,
            start_state: Mutex::new(Some(StartState {
                process,
                policy,
                notify,
                config,
            })),
            thread: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.main_pid
    }

    /// Arm or disarm the wall-clock deadline; zero disarms.
    pub fn set_wall_time_limit(&self, limit: Duration) {
        if limit.is_zero() {
            debug!("disarming walltime timer");
            self.shared.deadline_millis.store(0, Ordering::Relaxed);
        } else {
            debug!("setting walltime timer to {:?}", limit);
            self.shared.deadline_millis.store(
                unix_millis_now() + limit.as_millis() as i64,
                Ordering::Relaxed,
            );
        }
    }

    /// Request that the sandboxee be killed. Idempotent.
    pub fn kill(&self) {
        self.shared.kill_requested.store(true, Ordering::Relaxed);
        self.shared.wake_monitor();
    }

    /// Request a stack dump of the main task. Idempotent; arming it on a
    /// tracee that already died is a no-op.
    pub fn dump_stack_trace(&self) {
        self.shared.dump_requested.store(true, Ordering::Relaxed);
        self.shared.wake_monitor();
    }

    /// Handle for the external network proxy.
    pub fn network_violation_flag(&self) -> NetworkViolationFlag {
        NetworkViolationFlag {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start the monitor thread. Returns once the sandboxee is attached
    /// (or setup failed; the failure is reported by `await_result`).
    pub fn run_async(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Err(WardenError::AlreadyRunning);
        }
        let state = self
            .start_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(WardenError::AlreadyRunning)?;

        let log_file = match &state.config.permit_all_log {
            Some(path) => Some(
                File::options()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(WardenError::Io)?,
            ),
            None => None,
        };

        let monitor = Monitor::new(state, Arc::clone(&self.shared), log_file);
        let (setup_tx, setup_rx) = mpsc::channel::<()>();
        self.thread = Some(thread::spawn(move || monitor.run(setup_tx)));
        // Wait for attach to finish before returning control; a hung-up
        // sender means the thread is already done.
        let _ = setup_rx.recv();
        Ok(())
    }

    /// Block until the monitor thread finishes and hand out the result.
    pub fn await_result(&mut self) -> Result<SandboxResult> {
        let handle = self
            .thread
            .take()
            .ok_or_else(|| WardenError::Monitor("monitor is not running".to_string()))?;
        let result = handle
            .join()
            .map_err(|_| WardenError::Monitor("monitor thread panicked".to_string()))?;
        *self
            .shared
            .monitor_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        Ok(result)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.kill();
            let _ = handle.join();
        }
    }
}

fn unix_millis_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The monitor proper; lives entirely on the monitor thread.
struct Monitor {
    process: SandboxeeProcess,
    policy: Policy,
    notify: Box<dyn Notify>,
    config: MonitorConfig,
    shared: Arc<Shared>,
    result: SandboxResult,
    /// Syscalls whose return values the observer asked to inspect,
    /// keyed by task. An entry exists iff arbitration deferred the
    /// return-value inspection and the task has not yet exited.
    syscalls_in_progress: HashMap<Pid, Syscall>,
    /// True until the exec event enables active monitoring.
    wait_for_execve: bool,
    external_kill: bool,
    network_violation: bool,
    timed_out: bool,
    should_dump_stack: bool,
    sandboxee_exited: bool,
    log_file: Option<File>,
    sigset: SigSet,
}

impl Monitor {
    fn new(state: StartState, shared: Arc<Shared>, log_file: Option<File>) -> Monitor {
        let wait_for_execve = state.process.sandboxed_before_exec;
        Monitor {
            process: state.process,
            policy: state.policy,
            notify: state.notify,
            config: state.config,
            shared,
            result: SandboxResult::new(),
            syscalls_in_progress: HashMap::new(),
            wait_for_execve,
            external_kill: false,
            network_violation: false,
            timed_out: false,
            should_dump_stack: false,
            sandboxee_exited: false,
            log_file,
            sigset: SigSet::empty(),
        }
    }

    fn run(mut self, setup_tx: mpsc::Sender<()>) -> SandboxResult {
        *self
            .shared
            .monitor_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner()) =
            // SAFETY: identifies the current thread; no preconditions.
            Some(unsafe { libc::pthread_self() });

        let attached = self.init();
        // From here the embedder may use the comms channel freely.
        let _ = setup_tx.send(());

        if attached {
            let mut waiter = TaskWaiter::new(self.process.main_pid);
            self.event_loop(&mut waiter);
            self.drain(&mut waiter);
        }

        self.result.set_monitor_rusage(proc::thread_rusage());
        self.notify.event_finished(&self.result);
        self.result
    }

    fn init(&mut self) -> bool {
        if !self.notify.event_started(self.process.main_pid) {
            self.result
                .set_exit_status(FinalStatus::SetupError, Reason::Setup(SetupFailure::Monitor));
            return false;
        }
        if let Err(e) = self.init_signals() {
            error!("signal setup failed: {}", e);
            self.result
                .set_exit_status(FinalStatus::SetupError, Reason::Setup(SetupFailure::Signals));
            return false;
        }
        // Attaching must come last: it can leave the sandboxee in a
        // ptrace-stop, unable to speak over comms until the loop runs.
        if let Err(e) = attach::attach_all(&mut self.process) {
            error!("attaching to the sandboxee failed: {}", e);
            self.result
                .set_exit_status(FinalStatus::SetupError, Reason::Setup(SetupFailure::Ptrace));
            return false;
        }
        true
    }

    fn init_signals(&mut self) -> Result<()> {
        let mut set = SigSet::empty();
        set.add(Signal::SIGCHLD);
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None)
            .map_err(|e| WardenError::Syscall(format!("blocking SIGCHLD failed: {}", e)))?;
        self.sigset = set;
        Ok(())
    }

    fn actively_monitoring(&self) -> bool {
        !self.wait_for_execve
    }

    fn event_loop(&mut self, waiter: &mut TaskWaiter) {
        while self.result.final_status() == FinalStatus::Unset {
            self.poll_external_requests();
            if self.result.final_status() != FinalStatus::Unset {
                break;
            }

            match waiter.wait() {
                WaitOutcome::Idle => self.wait_for_signal(WAKE_UP_PERIOD),
                WaitOutcome::Failed(Errno::ECHILD) => {
                    error!("no children left, but the main task's exit was never seen");
                    self.result.set_exit_status(
                        FinalStatus::InternalError,
                        Reason::Internal(InternalFailure::Child),
                    );
                }
                WaitOutcome::Failed(errno) => error!("waitpid failed: {}", errno),
                WaitOutcome::Ready(pid, status) => {
                    debug!("PID {} reported status {:?}", pid, status);
                    self.handle_status(pid, status);
                }
            }
        }
    }

    fn poll_external_requests(&mut self) {
        let deadline = self.shared.deadline_millis.load(Ordering::Relaxed);
        if deadline != 0 && unix_millis_now() >= deadline {
            info!("sandboxee hit the walltime limit");
            self.timed_out = true;
            if !self.kill_sandboxee() {
                return;
            }
        }

        if self.shared.dump_requested.swap(false, Ordering::Relaxed) {
            self.should_dump_stack = true;
            if !self.interrupt_sandboxee() {
                return;
            }
        }

        if self.shared.kill_requested.swap(false, Ordering::Relaxed) {
            self.external_kill = true;
            if !self.kill_sandboxee() {
                return;
            }
        }

        if self.shared.network_violation.load(Ordering::Acquire) && !self.network_violation {
            self.network_violation = true;
            self.kill_sandboxee();
        }
    }

    fn wait_for_signal(&self, timeout: Duration) {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        // SAFETY: the sigset and timespec outlive the call; a null info
        // pointer is allowed.
        let signo = unsafe { libc::sigtimedwait(self.sigset.as_ref(), std::ptr::null_mut(), &ts) };
        if signo != -1 && signo != libc::SIGCHLD {
            error!("unexpected signal received: {}", signal_name(signo));
        }
    }

    fn handle_status(&mut self, pid: Pid, status: WaitStatus) {
        match classify(pid, status) {
            Classified::Ignored => {}
            Classified::Broken(failure) => {
                self.result
                    .set_exit_status(FinalStatus::InternalError, Reason::Internal(failure));
            }
            Classified::Event(event) => {
                if self.should_dump_stack
                    && pid == self.process.main_pid
                    && is_ptrace_stop(&event)
                {
                    self.dump_main_stack(pid);
                }
                self.handle_event(pid, event);
            }
        }
    }

    fn handle_event(&mut self, pid: Pid, event: TraceEvent) {
        match event {
            TraceEvent::Exited(code) => self.event_exited(pid, code),
            TraceEvent::KilledBySignal(signo) => self.event_signaled(pid, signo),
            TraceEvent::SyscallExitStop => self.event_syscall_exit(pid),
            TraceEvent::SeccompStop(tag) => self.event_seccomp(pid, tag),
            TraceEvent::NewTask(child) => self.event_new_task(pid, child),
            TraceEvent::VforkDone => self.continue_process(pid, None),
            TraceEvent::Exec(former) => self.event_exec(pid, former),
            TraceEvent::ExitStop(raw_status) => self.event_exit_stop(pid, raw_status),
            TraceEvent::GroupStop(signal) => self.event_group_stop(pid, signal),
            TraceEvent::SignalDelivery(signal) => {
                debug!("PID {} received {}", pid, signal.as_str());
                self.notify.event_signal(pid, signal as i32);
                self.continue_process(pid, Some(signal));
            }
        }
    }

    fn event_exited(&mut self, pid: Pid, code: i32) {
        info!("PID {} finished with code {}", pid, code);
        if pid != self.process.main_pid {
            return;
        }
        // Remaining tasks die with the tracer via the exit-kill option.
        if self.actively_monitoring() {
            self.result
                .set_exit_status(FinalStatus::Ok, Reason::ExitCode(code));
        } else {
            self.result
                .set_exit_status(FinalStatus::SetupError, Reason::Setup(SetupFailure::Monitor));
        }
        self.sandboxee_exited = true;
    }

    fn event_signaled(&mut self, pid: Pid, signo: i32) {
        info!("PID {} terminated with {}", pid, signal_name(signo));
        if pid != self.process.main_pid {
            return;
        }
        self.set_main_terminal_status(FinalStatus::Signaled, Reason::Signal(signo));
        self.sandboxee_exited = true;
    }

    /// A kill the monitor issued races against the child's natural death;
    /// the cause the kill was issued for must win.
    fn set_main_terminal_status(&mut self, natural_status: FinalStatus, natural_reason: Reason) {
        if self.network_violation {
            self.result
                .set_exit_status(FinalStatus::Violation, Reason::Network);
            let msg = self
                .shared
                .network_violation_msg
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(msg) = msg {
                self.result.set_network_violation(msg);
            }
        } else if self.external_kill {
            self.result
                .set_exit_status(FinalStatus::ExternalKill, Reason::None);
        } else if self.timed_out {
            self.result
                .set_exit_status(FinalStatus::Timeout, Reason::None);
        } else {
            self.result.set_exit_status(natural_status, natural_reason);
        }
    }

    fn event_seccomp(&mut self, pid: Pid, tag: u64) {
        let Some(arch) = CpuArch::from_tag(tag) else {
            // A dying tracee can leave its exit status in the event
            // message; the exit event follows.
            warn!(
                "seccomp event message {:#x} from PID {} is not an architecture tag",
                tag, pid
            );
            return;
        };

        let mut regs = match Regs::fetch(pid) {
            Ok(regs) => regs,
            Err(e) if e.is_tracee_gone() => {
                warn!("PID {} died before its registers could be read", pid);
                return;
            }
            Err(e) => {
                error!("failed to read registers of {}: {}", pid, e);
                self.result.set_exit_status(
                    FinalStatus::InternalError,
                    Reason::Internal(InternalFailure::Fetch),
                );
                return;
            }
        };

        let syscall = regs.to_syscall(arch);
        if arch != CpuArch::host() {
            self.process_syscall_violation(&mut regs, syscall, ViolationKind::ArchitectureSwitch);
            return;
        }
        self.process_syscall(&mut regs, syscall);
    }

    fn process_syscall(&mut self, regs: &mut Regs, syscall: Syscall) {
        let pid = regs.pid();

        // Before the child's own exec the filter is already live but the
        // sandbox is not considered enabled; the exec itself must pass.
        if !self.actively_monitoring() && syscall.nr() == libc::SYS_execveat as u64 {
            info!("[permitted before exec] PID {}: {}", pid, syscall);
            self.continue_process(pid, None);
            return;
        }

        match self.notify.event_syscall_trace(&syscall) {
            TraceAction::Allow => self.continue_process(pid, None),
            TraceAction::InspectAfterReturn => {
                // The tracee can die without a syscall-exit stop (a thread
                // calls execve and the leader dies); exit events drop the
                // record.
                self.syscalls_in_progress.insert(pid, syscall);
                self.complete_syscall(pid);
            }
            TraceAction::Deny => {
                if let Some(file) = self.log_file.as_mut() {
                    if let Err(e) = writeln!(file, "PID: {} {}", pid, syscall) {
                        error!("writing to the permit-all log failed: {}", e);
                    }
                    self.continue_process(pid, None);
                } else if self.config.permit_all {
                    self.continue_process(pid, None);
                } else {
                    self.process_syscall_violation(regs, syscall, ViolationKind::Syscall);
                }
            }
        }
    }

    fn process_syscall_violation(
        &mut self,
        regs: &mut Regs,
        syscall: Syscall,
        kind: ViolationKind,
    ) {
        self.log_syscall_violation(&syscall);
        self.notify.event_syscall_violation(&syscall, kind);
        self.result
            .set_exit_status(FinalStatus::Violation, Reason::Syscall(syscall.nr()));
        self.result.set_violating_syscall(syscall);
        diagnostics::set_additional_info(&mut self.result, *regs, &self.policy);
        // The tracee is not restarted after a violation; the rewritten
        // return value covers the window until it is killed.
        if let Err(e) = regs.set_return_value(-(libc::ENOSYS as i64)) {
            if !e.is_tracee_gone() {
                error!("rewriting the violating syscall's return failed: {}", e);
            }
        }
    }

    fn log_syscall_violation(&self, syscall: &Syscall) {
        error!(
            "SANDBOX VIOLATION: PID: {}, PROG: '{}': {}",
            syscall.pid(),
            proc::prog_name(syscall.pid()),
            syscall
        );
        if let Some(hint) = syscall.violation_hint() {
            error!("{}", hint);
        }
    }

    fn event_syscall_exit(&mut self, pid: Pid) {
        if !self.syscalls_in_progress.contains_key(&pid) {
            error!("syscall-exit stop for PID {} with no syscall in progress", pid);
            self.result.set_exit_status(
                FinalStatus::InternalError,
                Reason::Internal(InternalFailure::Inspect),
            );
            return;
        }
        let regs = match Regs::fetch(pid) {
            Ok(regs) => regs,
            Err(e) if e.is_tracee_gone() => {
                // The exit event will drop the in-progress record.
                warn!("PID {} died before its return value could be read", pid);
                return;
            }
            Err(e) => {
                error!("failed to read registers of {}: {}", pid, e);
                self.result.set_exit_status(
                    FinalStatus::InternalError,
                    Reason::Internal(InternalFailure::Fetch),
                );
                return;
            }
        };
        if let Some(syscall) = self.syscalls_in_progress.remove(&pid) {
            self.notify
                .event_syscall_return(&syscall, regs.return_value());
        }
        self.continue_process(pid, None);
    }

    /// fork/vfork/clone never produce a syscall-exit stop on success; the
    /// new-task event is where a deferred inspection completes, with the
    /// new task id as the return value.
    fn event_new_task(&mut self, pid: Pid, child: Pid) {
        debug!("PID {} spawned new task {}", pid, child);
        match self.syscalls_in_progress.remove(&pid) {
            Some(syscall) if syscall.creates_process() => {
                self.notify
                    .event_syscall_return(&syscall, child.as_raw() as i64);
            }
            Some(syscall) => {
                error!(
                    "expected fork/vfork/clone in progress in PID {}; actual: {}",
                    pid, syscall
                );
                self.result.set_exit_status(
                    FinalStatus::InternalError,
                    Reason::Internal(InternalFailure::Inspect),
                );
                return;
            }
            None => {}
        }
        self.continue_process(pid, None);
    }

    /// Successful exec reports through the exec event, not a syscall-exit
    /// stop. The first exec also flips the monitor to actively-monitoring.
    fn event_exec(&mut self, pid: Pid, former: Pid) {
        if !self.actively_monitoring() {
            info!("exec observed from former task {}; sandbox enabled", former);
            self.wait_for_execve = false;
        } else {
            match self.syscalls_in_progress.remove(&pid) {
                Some(syscall) if syscall.is_exec() => {
                    self.notify.event_syscall_return(&syscall, 0);
                }
                Some(syscall) => {
                    error!(
                        "expected execve/execveat in progress in PID {}; actual: {}",
                        pid, syscall
                    );
                    self.result.set_exit_status(
                        FinalStatus::InternalError,
                        Reason::Internal(InternalFailure::Inspect),
                    );
                    return;
                }
                None => {}
            }
        }
        self.continue_process(pid, None);
    }

    fn event_exit_stop(&mut self, pid: Pid, raw_status: i32) {
        // No return value will ever arrive for this task.
        self.syscalls_in_progress.remove(&pid);

        let exited = libc::WIFEXITED(raw_status);
        // Fast path: a plain exit nobody wants diagnostics for.
        if exited && (!self.policy.collect_stacktrace_on_exit || pid != self.process.main_pid) {
            self.continue_process(pid, None);
            return;
        }

        let seccomp_kill =
            libc::WIFSIGNALED(raw_status) && libc::WTERMSIG(raw_status) == libc::SIGSYS;
        let need_regs =
            seccomp_kill || pid == self.process.main_pid || self.config.log_all_stack_traces;

        if need_regs {
            let mut regs = match Regs::fetch(pid) {
                Ok(regs) => regs,
                Err(e) => {
                    error!("failed to read registers of {} at exit: {}", pid, e);
                    self.result.set_exit_status(
                        FinalStatus::InternalError,
                        Reason::Internal(InternalFailure::Fetch),
                    );
                    return;
                }
            };

            // The filter killed the thread directly; the violation is
            // uncovered here, at the last stop before the reap.
            if seccomp_kill {
                info!("PID {} violation uncovered via the exit event", pid);
                let syscall = regs.to_syscall(CpuArch::host());
                self.process_syscall_violation(&mut regs, syscall, ViolationKind::Syscall);
                return;
            }

            if pid == self.process.main_pid {
                if exited {
                    self.set_main_terminal_status(
                        FinalStatus::Ok,
                        Reason::ExitCode(libc::WEXITSTATUS(raw_status)),
                    );
                } else {
                    self.set_main_terminal_status(
                        FinalStatus::Signaled,
                        Reason::Signal(libc::WTERMSIG(raw_status)),
                    );
                }
                diagnostics::set_additional_info(&mut self.result, regs, &self.policy);
            } else if self.config.log_all_stack_traces {
                if let Err(e) = diagnostics::get_and_log_stack_trace(&regs) {
                    error!("failed to get stack trace of {}: {}", pid, e);
                }
            }
        }
        self.continue_process(pid, None);
    }

    fn event_group_stop(&mut self, pid: Pid, signal: Signal) {
        match signal {
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => {
                debug!("PID {} stopped by {}", pid, signal.as_str());
                self.listen_process(pid);
            }
            // Seize-time events manufacture group stops with other
            // signals; those tracees just keep running.
            _ => self.continue_process(pid, None),
        }
    }

    fn dump_main_stack(&mut self, pid: Pid) {
        match Regs::fetch(pid) {
            Ok(regs) => {
                if let Err(e) = diagnostics::get_and_log_stack_trace(&regs) {
                    warn!("failed to dump sandboxee stack: {}", e);
                }
            }
            Err(e) => warn!("failed to read registers for stack dump: {}", e),
        }
        self.should_dump_stack = false;
    }

    fn kill_sandboxee(&mut self) -> bool {
        info!("sending SIGKILL to PID {}", self.process.main_pid);
        if let Err(e) = kill(self.process.main_pid, Signal::SIGKILL) {
            error!("could not kill PID {}: {}", self.process.main_pid, e);
            self.result.set_exit_status(
                FinalStatus::InternalError,
                Reason::Internal(InternalFailure::Kill),
            );
            return false;
        }
        true
    }

    fn interrupt_sandboxee(&mut self) -> bool {
        if let Err(e) = ptrace::interrupt(self.process.main_pid) {
            error!("could not interrupt PID {}: {}", self.process.main_pid, e);
            self.result.set_exit_status(
                FinalStatus::InternalError,
                Reason::Internal(InternalFailure::Interrupt),
            );
            return false;
        }
        true
    }

    fn continue_process(&self, pid: Pid, signal: Option<Signal>) {
        match ptrace::cont(pid, signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => warn!("PID {} died while continuing it", pid),
            Err(e) => error!("continuing PID {} failed: {}", pid, e),
        }
    }

    fn complete_syscall(&self, pid: Pid) {
        match ptrace::syscall(pid, None) {
            Ok(()) => {}
            Err(Errno::ESRCH) => warn!("PID {} died while stepping it to syscall exit", pid),
            Err(e) => error!("stepping PID {} to syscall exit failed: {}", pid, e),
        }
    }

    fn listen_process(&self, pid: Pid) {
        // SAFETY: PTRACE_LISTEN takes no address or data argument.
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_LISTEN,
                pid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if rc == -1 {
            match Errno::last() {
                Errno::ESRCH => warn!("PID {} died while putting it on listen", pid),
                e => error!("putting PID {} on listen failed: {}", pid, e),
            }
        }
    }

    /// Reap residual tasks for a bounded time after the terminal status
    /// is known. With every-thread stack logging enabled the budget is
    /// the configured collection timeout, and dying threads get their
    /// stacks logged on the way out.
    fn drain(&mut self, waiter: &mut TaskWaiter) {
        if self.sandboxee_exited {
            return;
        }
        let main_pid = self.process.main_pid;
        let log_stacks =
            self.result.final_status() != FinalStatus::Ok && self.config.log_all_stack_traces;

        if !log_stacks {
            let _ = kill(main_pid, Signal::SIGKILL);
        }
        let budget = if log_stacks {
            self.config.stack_collection_timeout
        } else {
            GRACEFUL_EXIT_TIMEOUT
        };
        let deadline = Instant::now() + budget;

        loop {
            let now = Instant::now();
            if now >= deadline {
                info!("waiting for sandboxee exit timed out");
                break;
            }
            match waiter.wait() {
                WaitOutcome::Failed(errno) => {
                    if !(log_stacks && errno == Errno::ECHILD) {
                        error!("waitpid failed while draining: {}", errno);
                    }
                    break;
                }
                WaitOutcome::Idle => self.wait_for_signal(deadline - now),
                WaitOutcome::Ready(pid, status) => {
                    if !log_stacks
                        && pid == main_pid
                        && matches!(
                            status,
                            WaitStatus::Exited(..) | WaitStatus::Signaled(..)
                        )
                    {
                        break;
                    }

                    if let WaitStatus::PtraceEvent(_, _, event) = status {
                        if log_stacks {
                            diagnostics::log_stack_trace_of(pid);
                        }
                        if event == libc::PTRACE_EVENT_EXIT {
                            self.continue_process(pid, None);
                            continue;
                        }
                    } else if log_stacks
                        && matches!(
                            status,
                            WaitStatus::Stopped(..) | WaitStatus::PtraceSyscall(..)
                        )
                    {
                        diagnostics::log_stack_trace_of(pid);
                    }

                    if !log_stacks {
                        let _ = kill(main_pid, Signal::SIGKILL);
                    }
                }
            }
        }
    }
}

fn is_ptrace_stop(event: &TraceEvent) -> bool {
    !matches!(
        event,
        TraceEvent::Exited(_) | TraceEvent::KilledBySignal(_) | TraceEvent::SignalDelivery(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::DefaultNotify;
    use warden_comms::Comms;

    fn supervisor_for(pid: i32, limits: Limits) -> Supervisor {
        let (comms, _peer) = Comms::pair().unwrap();
        Supervisor::new(
            SandboxeeProcess::new(Pid::from_raw(pid), comms),
            Policy::default(),
            Box::new(DefaultNotify),
            limits,
        )
    }

    #[test]
    fn zero_limit_leaves_deadline_disarmed() {
        let supervisor = supervisor_for(1234, Limits::default());
        assert_eq!(supervisor.shared.deadline_millis.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn nonzero_limit_arms_deadline() {
        let supervisor = supervisor_for(1234, Limits::with_wall_time(Duration::from_secs(5)));
        let deadline = supervisor.shared.deadline_millis.load(Ordering::Relaxed);
        assert!(deadline >= unix_millis_now());
    }

    #[test]
    fn set_wall_time_limit_disarms_on_zero() {
        let supervisor = supervisor_for(1234, Limits::with_wall_time(Duration::from_secs(5)));
        supervisor.set_wall_time_limit(Duration::ZERO);
        assert_eq!(supervisor.shared.deadline_millis.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn kill_requests_are_idempotent() {
        let supervisor = supervisor_for(1234, Limits::default());
        supervisor.kill();
        supervisor.kill();
        assert!(supervisor.shared.kill_requested.load(Ordering::Relaxed));
        // One consume clears the flag, as the monitor loop would.
        assert!(supervisor.shared.kill_requested.swap(false, Ordering::Relaxed));
        assert!(!supervisor.shared.kill_requested.load(Ordering::Relaxed));
    }

    #[test]
    fn dump_request_on_dead_monitor_is_a_noop() {
        let supervisor = supervisor_for(1234, Limits::default());
        // No monitor thread is registered; arming must not signal anyone.
        supervisor.dump_stack_trace();
        assert!(supervisor.shared.dump_requested.load(Ordering::Relaxed));
    }

    #[test]
    fn network_flag_records_first_message() {
        let supervisor = supervisor_for(1234, Limits::default());
        let flag = supervisor.network_violation_flag();
        flag.raise("connect to 10.0.0.1:443 denied");
        flag.raise("second message is dropped");
        assert!(supervisor.shared.network_violation.load(Ordering::Acquire));
        let msg = supervisor
            .shared
            .network_violation_msg
            .lock()
            .unwrap()
            .clone();
        assert_eq!(msg.as_deref(), Some("connect to 10.0.0.1:443 denied"));
    }

    #[test]
    fn await_result_before_run_is_an_error() {
        let mut supervisor = supervisor_for(1234, Limits::default());
        assert!(supervisor.await_result().is_err());
    }

    #[test]
    fn ptrace_stop_classification_for_dump() {
        assert!(is_ptrace_stop(&TraceEvent::SeccompStop(1)));
        assert!(is_ptrace_stop(&TraceEvent::SyscallExitStop));
        assert!(is_ptrace_stop(&TraceEvent::ExitStop(0)));
        assert!(!is_ptrace_stop(&TraceEvent::Exited(0)));
        assert!(!is_ptrace_stop(&TraceEvent::SignalDelivery(Signal::SIGUSR1)));
    }
}
