//! End-to-end monitor scenarios against real children.
//!
//! The children are plain processes without an installed filter, so the
//! monitor sees signal deliveries, forks and exits, and these tests cover
//! attach, the event loop, external requests and terminal-status
//! precedence. Filter-driven arbitration is covered by unit tests.

use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::unistd::Pid;

use warden::{
    CLIENT_DONE, Comms, DefaultNotify, FinalStatus, Limits, Policy, Reason, SandboxeeProcess,
    Supervisor,
};

fn spawn_shell(script: &str) -> Child {
    let _ = env_logger::builder().is_test(true).try_init();
    Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn test child")
}

fn supervise(child: &Child, policy: Policy, limits: Limits) -> (Supervisor, Comms) {
    let (comms, peer) = Comms::pair().unwrap();
    let process = SandboxeeProcess::new(Pid::from_raw(child.id() as i32), comms);
    let supervisor = Supervisor::new(process, policy, Box::new(DefaultNotify), limits);
    (supervisor, peer)
}

#[test]
fn normal_exit_reports_ok_with_exit_code() {
    let child = spawn_shell("sleep 0.3; exit 7");
    let (mut supervisor, _peer) =
        supervise(&child, Policy::without_stack_traces(), Limits::default());

    supervisor.run_async().unwrap();
    let result = supervisor.await_result().unwrap();

    assert_eq!(result.final_status(), FinalStatus::Ok);
    assert_eq!(result.reason(), Reason::ExitCode(7));
    assert!(!result.ok());
    assert!(result.monitor_rusage().is_some());
}

#[test]
fn attach_sends_the_handshake_word() {
    let child = spawn_shell("sleep 0.3");
    let (mut supervisor, mut peer) =
        supervise(&child, Policy::without_stack_traces(), Limits::default());

    supervisor.run_async().unwrap();
    // run_async returns only after attach, so the word must be buffered.
    assert_eq!(peer.recv_u32().unwrap(), CLIENT_DONE);

    let result = supervisor.await_result().unwrap();
    assert_eq!(result.final_status(), FinalStatus::Ok);
}

#[test]
fn external_kill_wins_over_natural_death() {
    let child = spawn_shell("sleep 100");
    let (mut supervisor, _peer) = supervise(&child, Policy::default(), Limits::default());

    supervisor.run_async().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    supervisor.kill();

    let result = supervisor.await_result().unwrap();
    assert_eq!(result.final_status(), FinalStatus::ExternalKill);
    assert!(result.stack_trace().is_none());
}

#[test]
fn repeated_kill_requests_equal_one() {
    let child = spawn_shell("sleep 100");
    let (mut supervisor, _peer) =
        supervise(&child, Policy::without_stack_traces(), Limits::default());

    supervisor.run_async().unwrap();
    for _ in 0..5 {
        supervisor.kill();
    }

    let result = supervisor.await_result().unwrap();
    assert_eq!(result.final_status(), FinalStatus::ExternalKill);
}

#[test]
fn walltime_expiry_reports_timeout() {
    let child = spawn_shell("sleep 100");
    let (mut supervisor, _peer) = supervise(
        &child,
        Policy::without_stack_traces(),
        Limits::with_wall_time(Duration::from_millis(300)),
    );

    let started = Instant::now();
    supervisor.run_async().unwrap();
    let result = supervisor.await_result().unwrap();

    assert_eq!(result.final_status(), FinalStatus::Timeout);
    assert!(result.stack_trace().is_none());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn zero_deadline_means_no_deadline() {
    let child = spawn_shell("sleep 100");
    let (mut supervisor, _peer) =
        supervise(&child, Policy::without_stack_traces(), Limits::default());

    supervisor.run_async().unwrap();
    // Give the loop a few wake-up periods to prove no timeout fires.
    std::thread::sleep(Duration::from_millis(700));
    supervisor.kill();

    let result = supervisor.await_result().unwrap();
    assert_eq!(result.final_status(), FinalStatus::ExternalKill);
}

#[test]
fn deadline_extension_is_observed() {
    let child = spawn_shell("sleep 0.5; exit 0");
    let (mut supervisor, _peer) = supervise(
        &child,
        Policy::without_stack_traces(),
        Limits::with_wall_time(Duration::from_millis(100)),
    );
    // Extend before the monitor starts; the child then outlives the old
    // deadline and exits normally.
    supervisor.set_wall_time_limit(Duration::from_secs(30));

    supervisor.run_async().unwrap();
    let result = supervisor.await_result().unwrap();
    assert_eq!(result.final_status(), FinalStatus::Ok);
}

#[test]
fn unhandled_signal_reports_signaled() {
    let child = spawn_shell("kill -ABRT $$; sleep 1");
    let (mut supervisor, _peer) =
        supervise(&child, Policy::without_stack_traces(), Limits::default());

    supervisor.run_async().unwrap();
    let result = supervisor.await_result().unwrap();

    assert_eq!(result.final_status(), FinalStatus::Signaled);
    assert_eq!(result.reason(), Reason::Signal(libc::SIGABRT));
    assert!(result.stack_trace().is_none());
}

#[test]
fn forking_children_stay_supervised() {
    let child = spawn_shell("sleep 0.2 & sleep 0.2 & sleep 0.3; wait; exit 3");
    let (mut supervisor, _peer) =
        supervise(&child, Policy::without_stack_traces(), Limits::default());

    supervisor.run_async().unwrap();
    let result = supervisor.await_result().unwrap();

    assert_eq!(result.final_status(), FinalStatus::Ok);
    assert_eq!(result.reason(), Reason::ExitCode(3));
}

#[test]
fn attach_to_dead_child_is_a_setup_error() {
    let mut child = spawn_shell("exit 0");
    child.wait().unwrap();

    let (comms, _peer) = Comms::pair().unwrap();
    let process = SandboxeeProcess::new(Pid::from_raw(child.id() as i32), comms);
    let mut supervisor = Supervisor::new(
        process,
        Policy::without_stack_traces(),
        Box::new(DefaultNotify),
        Limits::default(),
    );

    supervisor.run_async().unwrap();
    let result = supervisor.await_result().unwrap();
    assert_eq!(result.final_status(), FinalStatus::SetupError);
}

#[test]
fn dump_request_after_death_is_a_noop() {
    let child = spawn_shell("sleep 0.2");
    let (mut supervisor, _peer) =
        supervise(&child, Policy::without_stack_traces(), Limits::default());

    supervisor.run_async().unwrap();
    let result = supervisor.await_result().unwrap();
    assert_eq!(result.final_status(), FinalStatus::Ok);

    // The monitor is gone; arming the flag must not panic or signal.
    supervisor.dump_stack_trace();
}
