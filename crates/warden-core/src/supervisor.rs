//! Fork, exec, and reap (spec §2 C5, §4.2 "On entering STARTING").
//!
//! Grounded in the teacher's `fork_child.rs`/`fork_parent.rs`: the fork
//! itself stays this close to the metal because almost nothing is
//! async-signal-safe between `fork()` and `execv()`. Unlike the teacher,
//! there is no notification-socket wait loop here — readiness is observed
//! later by the reactor's poll loop, not blocked on inline after fork
//! returns in the parent.

use crate::component::{Commandline, Component, ComponentIdx, SupervisionState};
use crate::errors::{ComponentOperationError, OperationErrorReason};
use crate::fd_passing::RESERVED_FD_ENV_VAR;
use crate::isolation;
use crate::logsink::LogSink;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, setsid, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::RawFd;

/// Descriptors the child should inherit past exec, beyond stdio: the
/// readiness-signal pipe write end (if `readiness = signal`) and the
/// handoff socket end (if this start is a hot-swap receiver).
#[derive(Debug, Clone, Default)]
pub struct InheritedFds {
    pub readiness_signal_write: Option<RawFd>,
    pub handoff_socket: Option<RawFd>,
}

/// Forks and execs `component`'s command. On success, returns the child's
/// pid; the caller is responsible for recording it on the component and
/// transitioning its state to STARTING.
///
/// # Safety
/// Must only run from the single-threaded reactor loop: the child branch
/// calls only async-signal-safe primitives (per `isolation::apply_in_child`
/// and `nix`'s fork-safety notes) until `execvp` replaces the image.
pub fn spawn(
    component: &Component,
    cgroup_path: Option<&std::path::Path>,
    log_sink: &LogSink,
    inherited: &InheritedFds,
) -> Result<Pid, ComponentOperationError> {
    let program = cstring(&component.command.program.to_string_lossy())
        .map_err(|e| operation_error(component, OperationErrorReason::ExecFailed(e)))?;
    let args = build_argv(&component.command)
        .map_err(|e| operation_error(component, OperationErrorReason::ExecFailed(e)))?;

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child, .. }) => Ok(child),
        Ok(ForkResult::Child) => {
            child_entrypoint(component, cgroup_path, log_sink, inherited, &program, &args);
            unreachable!("child_entrypoint always exits or execs");
        }
        Err(e) => Err(operation_error(component, OperationErrorReason::ForkFailed(e.to_string()))),
    }
}

/// Everything that happens between fork and exec in the child, mirroring
/// the teacher's `after_fork_child`: set up stdio, move into a new session,
/// apply isolation, exec. Never returns.
fn child_entrypoint(
    component: &Component,
    cgroup_path: Option<&std::path::Path>,
    log_sink: &LogSink,
    inherited: &InheritedFds,
    program: &CString,
    args: &[CString],
) -> ! {
    let log_fd = log_sink.as_raw_fd();
    dup_onto(log_fd, libc::STDOUT_FILENO);
    dup_onto(log_fd, libc::STDERR_FILENO);

    if unsafe { setsid() }.is_err() {
        die("setsid failed");
    }

    if let Err(e) = isolation::apply_in_child(&component.isolation, cgroup_path) {
        die_owned(format!("isolation setup failed: {e}"));
    }

    if let Some(fd) = inherited.readiness_signal_write {
        std::env::set_var("WARDEN_READY_FD", fd.to_string());
    }
    if let Some(fd) = inherited.handoff_socket {
        std::env::set_var(RESERVED_FD_ENV_VAR, fd.to_string());
    }
    for (key, value) in &component.env {
        std::env::set_var(key, value);
    }

    let argv: Vec<&std::ffi::CStr> = args.iter().map(|c| c.as_c_str()).collect();
    let _ = execvp(program.as_c_str(), &argv);
    // execvp only returns on failure.
    die("execvp failed");
}

fn dup_onto(old: RawFd, new: RawFd) {
    if unsafe { libc::dup2(old, new) } != new {
        die("dup2 failed");
    }
}

fn die(msg: &str) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
    }
    std::process::exit(1);
}

fn die_owned(msg: String) -> ! {
    die(&msg)
}

fn cstring(s: &str) -> Result<CString, String> {
    CString::new(s).map_err(|e| format!("embedded NUL in {s:?}: {e}"))
}

fn build_argv(command: &Commandline) -> Result<Vec<CString>, String> {
    let program_name = command
        .program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.program.to_string_lossy().into_owned());
    let mut argv = Vec::with_capacity(command.arguments.len() + 1);
    argv.push(cstring(&program_name)?);
    for arg in &command.arguments {
        argv.push(cstring(arg)?);
    }
    Ok(argv)
}

fn operation_error(component: &Component, reason: OperationErrorReason) -> ComponentOperationError {
    ComponentOperationError { component_name: component.name.clone(), reason }
}

/// The outcome the reactor should apply after a child's exit is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// A oneshot exited 0: promote straight to DONE, its capability (if any)
    /// stays available (spec §4.2: oneshot completion is terminal, not a
    /// failure).
    OneshotDone,
    /// A oneshot exited nonzero, or a service exited at all: treat as a
    /// failure subject to the restart-rate limiter.
    Failed(i32),
    /// Killed by a signal.
    Signaled(i32),
}

pub fn classify_exit(component: &Component, status: WaitStatus) -> Option<ReapOutcome> {
    match status {
        WaitStatus::Exited(_, code) => {
            if component.kind == crate::component::Kind::Oneshot && code == 0 {
                Some(ReapOutcome::OneshotDone)
            } else {
                Some(ReapOutcome::Failed(code))
            }
        }
        WaitStatus::Signaled(_, signal, _) => Some(ReapOutcome::Signaled(signal as i32)),
        _ => None,
    }
}

/// Non-blocking reap of any one exited child. Called by the reactor on
/// every `SIGCHLD` self-pipe wakeup, in a loop until it returns `None`
/// (mirrors the classic self-pipe reaper pattern; the teacher instead
/// blocks a dedicated `SIGCHLD` thread, which the single-threaded reactor
/// mandate here rules out).
pub fn try_reap_one() -> Option<(Pid, WaitStatus)> {
    match waitpid(Option::<Pid>::None, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => None,
        Ok(status) => status.pid().map(|pid| (pid, status)),
        Err(nix::Error::ECHILD) => None,
        Err(_) => None,
    }
}

/// Sends `SIGTERM` then, if the process is still alive after `grace`,
/// `SIGKILL` — the escalation the reactor's timer wheel drives for normal
/// stop and for fallback-to-restart during an upgrade (spec §4.4 "restart,
/// the guaranteed-success fallback").
pub fn request_stop(pid: Pid) -> nix::Result<()> {
    nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM)
}

pub fn force_kill(pid: Pid) -> nix::Result<()> {
    nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL)
}

/// Applies a successfully-observed transition after a fork (call sites:
/// reactor after `spawn` succeeds, or the runtime's fixed-point driver
/// after it applies a `ResolverRequest::Promote`).
pub fn mark_starting(component: &mut Component, pid: Pid, now: std::time::Instant) {
    component.state = SupervisionState::Starting;
    component.pid = Some(pid.as_raw());
    component.started_at = Some(now);
    component.restart.record_start(now);
}

pub fn mark_ready_wait(component: &mut Component) {
    if component.state == SupervisionState::Starting {
        component.state = SupervisionState::ReadyWait;
    }
}

pub fn mark_active(component: &mut Component, now: std::time::Instant) {
    component.state = SupervisionState::Active;
    component.restart.note_active(now);
}

pub fn mark_inactive(component: &mut Component) {
    component.state = SupervisionState::Inactive;
    component.pid = None;
    component.started_at = None;
}

pub fn mark_failed(component: &mut Component) {
    component.state = SupervisionState::Failed;
    component.pid = None;
}

pub fn mark_degraded(component: &mut Component) {
    component.state = SupervisionState::Degraded;
}

/// What the reactor should do about a component whose process just exited,
/// combining the exit classification with the restart-rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Promote(ComponentIdx),
    RestartAfter(ComponentIdx, std::time::Duration),
    GiveUp(ComponentIdx),
}

pub fn decide_after_exit(
    idx: ComponentIdx,
    component: &mut Component,
    outcome: ReapOutcome,
    now: std::time::Instant,
) -> RestartDecision {
    match outcome {
        ReapOutcome::OneshotDone => {
            component.state = SupervisionState::Done;
            component.pid = None;
            RestartDecision::Promote(idx)
        }
        ReapOutcome::Failed(_) | ReapOutcome::Signaled(_) => {
            mark_failed(component);
            component.restart_count += 1;
            let delay = component.restart.next_restart_delay(now);
            if delay > std::time::Duration::from_secs(300) {
                RestartDecision::GiveUp(idx)
            } else {
                RestartDecision::RestartAfter(idx, delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Kind, RestartAccounting};
    use std::path::PathBuf;
    use std::time::Duration;

    fn make_component(kind: Kind) -> Component {
        Component {
            name: "svc".to_owned(),
            kind,
            command: Commandline { program: PathBuf::from("/bin/true"), arguments: vec![] },
            env: Default::default(),
            requires_names: vec![],
            provides_names: vec![],
            requires: vec![],
            provides: vec![],
            state: SupervisionState::Starting,
            pid: Some(123),
            restart: RestartAccounting::new(Duration::from_secs(60), 5),
            readiness: Default::default(),
            health: None,
            isolation: Default::default(),
            upgrade_strategy: crate::component::UpgradeStrategy::Restart,
            restart_count: 0,
            started_at: None,
            health_fail_streak: 0,
        }
    }

    #[test]
    fn oneshot_success_promotes_to_done() {
        let mut c = make_component(Kind::Oneshot);
        let outcome = classify_exit(&c, WaitStatus::Exited(Pid::from_raw(1), 0)).unwrap();
        assert_eq!(outcome, ReapOutcome::OneshotDone);
        let decision = decide_after_exit(ComponentIdx(0), &mut c, outcome, std::time::Instant::now());
        assert_eq!(c.state, SupervisionState::Done);
        assert_eq!(decision, RestartDecision::Promote(ComponentIdx(0)));
    }

    #[test]
    fn service_exit_is_always_a_failure_even_on_code_zero() {
        let c = make_component(Kind::Service);
        let outcome = classify_exit(&c, WaitStatus::Exited(Pid::from_raw(1), 0)).unwrap();
        assert_eq!(outcome, ReapOutcome::Failed(0));
    }

    #[test]
    fn failure_schedules_restart_with_backoff_delay() {
        let mut c = make_component(Kind::Service);
        let now = std::time::Instant::now();
        c.restart.record_start(now);
        c.restart.record_start(now);
        c.restart.record_start(now);
        c.restart.record_start(now);
        c.restart.record_start(now);
        let decision = decide_after_exit(ComponentIdx(1), &mut c, ReapOutcome::Failed(1), now);
        assert_eq!(c.state, SupervisionState::Failed);
        match decision {
            RestartDecision::RestartAfter(idx, delay) => {
                assert_eq!(idx, ComponentIdx(1));
                assert!(delay > Duration::ZERO);
            }
            other => panic!("expected RestartAfter, got {other:?}"),
        }
    }
}
