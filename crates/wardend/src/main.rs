//! wardend — the primordial process (spec §4.8 "Event loop").
//!
//! Grounded in the teacher's `entrypoints/service_manager.rs`: CLI parsing,
//! PID-1-specific setup, then a loop that never returns. Unlike the
//! teacher, which spreads signal handling, notification reads, and
//! socket-activation across dedicated threads, spec §4.8 mandates a single
//! thread woken only by `poll(2)` — so every one of those concerns is
//! folded into one reactor loop here instead of spawned onto threads.

use clap::Parser;
use log::{error, info, trace, warn};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process::{Child, Command as StdCommand, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use warden_core::component::{ComponentIdx, ReadinessPolicy, SupervisionState};
use warden_core::config::Config;
use warden_core::control::{self, ControlContext};
use warden_core::logsink::{LogSink, DEFAULT_CAP_BYTES};
use warden_core::reactor::{poll_once, PollSource, SelfPipe, TimerKind, TimerWheel};
use warden_core::readiness::{self, ReadinessWatch};
use warden_core::runtime::System;
use warden_core::supervisor::{self, InheritedFds, RestartDecision};
use warden_core::{checkpoint, handoff, manifest};

#[derive(Parser, Debug)]
#[command(name = "wardend", about = "Capability-driven component supervisor", version)]
struct Cli {
    /// Overrides the default manifest directory (spec §6 "manifest directory override").
    #[arg(long)]
    manifest_dir: Option<PathBuf>,

    /// Overrides the default control-socket path (spec §6 "control-socket path override").
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Load manifests and report what would start, without forking anything.
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = warden_core::logging::setup_logging(&warden_core::config::LoggingConfig {
        level: log::LevelFilter::Info,
        log_to_stdout: true,
    }) {
        eprintln!("failed to initialize logging: {e}");
    }

    let mut config = Config::default();
    if let Some(dir) = cli.manifest_dir {
        config.manifest_dir = dir;
    }
    if let Some(sock) = cli.control_socket {
        config.control_socket_path = sock;
    }
    if let Some(dumps) = Config::dumps_path_from_kernel_cmdline() {
        info!("resuming after kernel replace; dumps at {}", dumps.display());
        config.persistent_checkpoint_dir = dumps;
    }

    if nix::unistd::getpid().as_raw() == 1 {
        pid1_specific_setup();
    }

    if cli.dry_run {
        let result = manifest::load_directory(&config.manifest_dir, config.restart_window, config.restart_max_in_window);
        println!("would load {} component(s)", result.components.len());
        for c in &result.components {
            println!("  {} ({:?})", c.name, c.kind);
        }
        for e in &result.errors {
            println!("  error: {e}");
        }
        return;
    }

    if let Err(e) = run(config) {
        unrecoverable_error(e);
    }
}

/// Reopens stdio onto the console, remounts `/` read-write, and marks the
/// process a child subreaper so that orphaned grandchildren are reparented
/// here instead of to the kernel's real init (there is none). Mirrors the
/// teacher's `pid1_specific_setup`.
fn pid1_specific_setup() {
    reopen_stdio();
    become_subreaper();
    remount_root_rw();
}

fn reopen_stdio() {
    let console = std::ffi::CString::new("/dev/console").unwrap();
    let devnull = std::ffi::CString::new("/dev/null").unwrap();
    unsafe {
        let fd = libc::open(console.as_ptr(), libc::O_RDWR);
        let fd = if fd >= 0 { fd } else { libc::open(devnull.as_ptr(), libc::O_RDWR) };
        if fd >= 0 {
            libc::dup2(fd, libc::STDIN_FILENO);
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::dup2(fd, libc::STDERR_FILENO);
            if fd > libc::STDERR_FILENO {
                libc::close(fd);
            }
        }
    }
}

fn become_subreaper() {
    unsafe {
        if libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) != 0 {
            warn!("prctl(PR_SET_CHILD_SUBREAPER) failed: {}", std::io::Error::last_os_error());
        }
    }
}

fn remount_root_rw() {
    let none: Option<&str> = None;
    if let Err(e) = nix::mount::mount(
        none,
        "/",
        none,
        nix::mount::MsFlags::MS_REMOUNT,
        none,
    ) {
        warn!("remounting / read-write failed: {e}");
    }
}

/// Spec §4.8 "Failsafe": the primordial process must never exit. If the
/// reactor itself cannot continue, exec an emergency shell so the kernel
/// doesn't panic on a dead init; anywhere else this is just a fatal error.
fn unrecoverable_error(reason: String) -> ! {
    error!("unrecoverable reactor error: {reason}");
    if nix::unistd::getpid().as_raw() == 1 {
        for shell in ["/bin/sh", "/sbin/sh", "/usr/bin/sh"] {
            let path = std::ffi::CString::new(shell).unwrap();
            let argv = [path.as_ptr(), std::ptr::null()];
            unsafe {
                libc::execv(path.as_ptr(), argv.as_ptr());
            }
        }
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }
    panic!("{reason}");
}

struct ProbeRun {
    child: Child,
    started_at: Instant,
    timeout: Duration,
}

struct Reactor {
    system: System,
    config: Config,
    self_pipe: SelfPipe,
    timers: TimerWheel,
    control_listener: UnixListener,
    manifest_watch: Option<Inotify>,
    shutdown: Arc<AtomicBool>,
    reload_requested: Arc<AtomicBool>,
    dump_requested: Arc<AtomicBool>,
    readiness_watches: HashMap<ComponentIdx, ReadinessWatch>,
    readiness_probes: HashMap<ComponentIdx, ProbeRun>,
    health_probes: HashMap<ComponentIdx, ProbeRun>,
    health_next_probe: HashMap<ComponentIdx, Instant>,
    log_sinks: HashMap<ComponentIdx, LogSink>,
    pid_to_idx: HashMap<i32, ComponentIdx>,
    /// Components demoted by capability withdrawal that already have a
    /// force-kill escalation timer pending, so a repeated resolve pass
    /// doesn't schedule a second one for the same still-dying process.
    demote_escalation_scheduled: std::collections::HashSet<ComponentIdx>,
}

fn run(config: Config) -> Result<(), String> {
    std::fs::create_dir_all(&config.runtime_dir).map_err(|e| format!("create runtime dir: {e}"))?;
    let _ = std::fs::remove_file(&config.control_socket_path);
    let control_listener = UnixListener::bind(&config.control_socket_path)
        .map_err(|e| format!("bind control socket {}: {e}", config.control_socket_path.display()))?;
    control_listener.set_nonblocking(true).map_err(|e| format!("set control socket nonblocking: {e}"))?;

    let mut self_pipe = SelfPipe::new().map_err(|e| format!("self-pipe setup: {e}"))?;
    self_pipe.register(libc::SIGCHLD).map_err(|e| format!("register SIGCHLD: {e}"))?;
    self_pipe.register(libc::SIGTERM).map_err(|e| format!("register SIGTERM: {e}"))?;
    self_pipe.register(libc::SIGINT).map_err(|e| format!("register SIGINT: {e}"))?;
    self_pipe.register(libc::SIGUSR1).map_err(|e| format!("register SIGUSR1: {e}"))?;
    self_pipe.register(libc::SIGUSR2).map_err(|e| format!("register SIGUSR2: {e}"))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload_requested = Arc::new(AtomicBool::new(false));
    let dump_requested = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(libc::SIGTERM, shutdown.clone()).map_err(|e| e.to_string())?;
    signal_hook::flag::register(libc::SIGINT, shutdown.clone()).map_err(|e| e.to_string())?;
    signal_hook::flag::register(libc::SIGUSR1, reload_requested.clone()).map_err(|e| e.to_string())?;
    signal_hook::flag::register(libc::SIGUSR2, dump_requested.clone()).map_err(|e| e.to_string())?;

    let manifest_watch = match Inotify::init(InitFlags::IN_NONBLOCK) {
        Ok(inotify) => {
            match inotify.add_watch(
                &config.manifest_dir,
                AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_MOVE,
            ) {
                Ok(_) => Some(inotify),
                Err(e) => {
                    warn!("could not watch manifest directory {}: {e}", config.manifest_dir.display());
                    None
                }
            }
        }
        Err(e) => {
            warn!("inotify init failed, manifest directory changes won't auto-reload: {e}");
            None
        }
    };

    let mut reactor = Reactor {
        system: System::new(),
        config,
        self_pipe,
        timers: TimerWheel::new(),
        control_listener,
        manifest_watch,
        shutdown,
        reload_requested,
        dump_requested,
        readiness_watches: HashMap::new(),
        readiness_probes: HashMap::new(),
        health_probes: HashMap::new(),
        health_next_probe: HashMap::new(),
        log_sinks: HashMap::new(),
        pid_to_idx: HashMap::new(),
        demote_escalation_scheduled: std::collections::HashSet::new(),
    };

    reactor.load_manifests();
    let now = Instant::now();
    reactor.resume_from_kernel_replace(now);
    reactor.promote_newly_eligible(now);

    loop {
        if reactor.shutdown.load(Ordering::Relaxed) {
            reactor.run_shutdown_sequence();
            return Ok(());
        }

        let now = Instant::now();
        reactor.drain_timers(now);
        reactor.check_probes(now);
        reactor.poll_readiness_watches(now);

        let mut sources: Vec<(RawFd, PollSource)> = vec![
            (reactor.self_pipe.as_raw_fd(), PollSource::SelfPipe),
            (reactor.control_listener.as_raw_fd(), PollSource::ControlSocket),
        ];
        if let Some(inotify) = &reactor.manifest_watch {
            sources.push((inotify.as_raw_fd(), PollSource::ManifestInotify));
        }
        for (idx, watch) in &reactor.readiness_watches {
            if let Some(fd) = readiness::fd_of(watch) {
                sources.push((fd, PollSource::ReadinessSignal(*idx)));
            }
        }

        let timeout = reactor
            .timers
            .next_timeout(now)
            .map(|d| d.min(Duration::from_millis(500)))
            .unwrap_or(Duration::from_millis(500));

        let ready = match poll_once(&sources, Some(timeout)) {
            Ok(ready) => ready,
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(format!("poll failed: {e}")),
        };

        for source in ready {
            match source {
                PollSource::SelfPipe => {
                    reactor.self_pipe.drain();
                    reactor.reap_children();
                }
                PollSource::ControlSocket => reactor.accept_control_connections(),
                PollSource::ManifestInotify => {
                    if let Some(inotify) = &reactor.manifest_watch {
                        let _ = inotify.read_events();
                    }
                    reactor.reload();
                }
                PollSource::ReadinessSignal(idx) => reactor.handle_readiness_signal(idx),
            }
        }

        if reactor.reload_requested.swap(false, Ordering::Relaxed) {
            reactor.reload();
        }
        if reactor.dump_requested.swap(false, Ordering::Relaxed) {
            reactor.dump_state_to_log();
        }
    }
}

impl Reactor {
    fn load_manifests(&mut self) {
        let result = manifest::load_directory(
            &self.config.manifest_dir,
            self.config.restart_window,
            self.config.restart_max_in_window,
        );
        for err in &result.errors {
            warn!("manifest error: {err}");
        }
        for component in result.components {
            self.system.load_component(component);
        }
    }

    /// Spec §4.4 "Live kernel replacement": if the previous instance left a
    /// manifest behind, this is the new primordial process resuming after
    /// kexec. Restores every dumped component straight to ACTIVE before the
    /// resolver ever runs, then removes the manifest so a crash-restart of
    /// wardend itself doesn't try to resume the same dumps twice.
    fn resume_from_kernel_replace(&mut self, now: Instant) {
        let manifest_path = self.config.kernel_replace_manifest.clone();
        if !manifest_path.exists() {
            return;
        }
        let manifest = match checkpoint::KernelReplaceManifest::read(&manifest_path) {
            Ok(m) => m,
            Err(e) => {
                error!("could not read kernel-replace manifest {}: {e}", manifest_path.display());
                return;
            }
        };
        info!("resuming {} component(s) persisted across a live kernel replace", manifest.dumps.len());

        for dump in &manifest.dumps {
            let Some(idx) = self.system.components.find(&dump.component_name) else {
                warn!("{}: dumped component no longer in the manifest, skipping", dump.component_name);
                continue;
            };
            let dump_dir = dump.dump_dir(&self.config.persistent_checkpoint_dir);
            let pid = match checkpoint::restore_process(&dump_dir, "criu") {
                Ok(pid) => pid,
                Err(e) => {
                    error!("{}: failed to restore from {}: {e}", dump.component_name, dump_dir.display());
                    continue;
                }
            };
            info!("{}: restored as pid {pid}", dump.component_name);
            self.pid_to_idx.insert(pid, idx);
            if let Ok(sink) = LogSink::open(&self.config.log_dir, &dump.component_name, DEFAULT_CAP_BYTES) {
                self.log_sinks.insert(idx, sink);
            }
            let health_interval = self.system.components.get(idx).health.as_ref().map(|h| h.interval);
            supervisor::mark_starting(self.system.components.get_mut(idx), Pid::from_raw(pid), now);
            supervisor::mark_active(self.system.components.get_mut(idx), now);
            self.system.publish_capabilities(idx);
            if let Some(interval) = health_interval {
                self.health_next_probe.insert(idx, now + interval);
            }
        }

        if let Err(e) = checkpoint::KernelReplaceManifest::remove(&manifest_path) {
            warn!("could not remove kernel-replace manifest {}: {e}", manifest_path.display());
        }
    }

    /// Resolves to a fixed point and spawns every component it surfaces as
    /// newly eligible, per spec §4.3/§4.2 "On entering STARTING".
    fn promote_newly_eligible(&mut self, now: Instant) {
        let promotable = self.system.resolve_to_fixed_point();
        self.schedule_demotion_escalation(now);
        for idx in promotable {
            self.spawn_component(idx, now);
        }
    }

    /// A component just demoted by capability withdrawal already got sent
    /// `SIGTERM` by the resolver itself (`runtime::System::apply_request`);
    /// this schedules the same force-kill escalation
    /// `handle_readiness_timeout` uses, in case it doesn't exit in time.
    /// Demoted components sit at INACTIVE with their pid still attached
    /// until the exit is reaped, which is what this scans for.
    fn schedule_demotion_escalation(&mut self, now: Instant) {
        let pending: Vec<ComponentIdx> = self
            .system
            .components
            .iter()
            .filter(|(idx, c)| {
                c.state == SupervisionState::Inactive
                    && c.pid.is_some()
                    && !self.demote_escalation_scheduled.contains(idx)
            })
            .map(|(idx, _)| idx)
            .collect();
        for idx in pending {
            self.demote_escalation_scheduled.insert(idx);
            self.timers.schedule(now + Duration::from_secs(5), TimerKind::StopGraceElapsed(idx));
        }
    }

    fn spawn_component(&mut self, idx: ComponentIdx, now: Instant) {
        let name = self.system.components.get(idx).name.clone();
        let sink = match LogSink::open(&self.config.log_dir, &name, DEFAULT_CAP_BYTES) {
            Ok(sink) => sink,
            Err(e) => {
                error!("{name}: could not open log sink: {e}");
                return;
            }
        };

        let mut inherited = InheritedFds::default();
        let mut signal_read_fd = None;
        if matches!(self.system.components.get(idx).readiness.policy, ReadinessPolicy::Signal) {
            match readiness::make_signal_pipe() {
                Ok((read_fd, write_fd)) => {
                    inherited.readiness_signal_write = Some(write_fd.as_raw_fd());
                    signal_read_fd = Some((read_fd, write_fd));
                }
                Err(e) => {
                    error!("{name}: could not create readiness pipe: {e}");
                    return;
                }
            }
        }

        let component = self.system.components.get(idx);
        let cgroup_path = self.cgroup_path_for(&name, component.isolation.is_trivial());
        let spawn_result = supervisor::spawn(component, cgroup_path.as_deref(), &sink, &inherited);

        // The write end only needs to live in the child; drop our copy now
        // that fork has happened (spawn() itself does the fork+exec).
        let read_fd = signal_read_fd.map(|(read_fd, _write_fd)| read_fd);

        match spawn_result {
            Ok(pid) => {
                info!("{name}: started as pid {pid}");
                self.pid_to_idx.insert(pid.as_raw(), idx);
                self.log_sinks.insert(idx, sink);

                // Pull out everything needed below before taking further
                // mutable borrows of the component, so the match arms are
                // free to call back into `self`.
                let policy = self.system.components.get(idx).readiness.policy.clone();
                let timeout = self.system.components.get(idx).readiness.timeout;
                let health_interval = self.system.components.get(idx).health.as_ref().map(|h| h.interval);

                supervisor::mark_starting(self.system.components.get_mut(idx), pid, now);

                match policy {
                    ReadinessPolicy::None => {
                        supervisor::mark_active(self.system.components.get_mut(idx), now);
                        self.system.publish_capabilities(idx);
                        self.promote_newly_eligible(now);
                    }
                    ReadinessPolicy::File { path } => {
                        supervisor::mark_ready_wait(self.system.components.get_mut(idx));
                        if readiness::file_ready_now(&path) {
                            self.finish_readiness(idx, now);
                        } else {
                            self.readiness_watches.insert(idx, ReadinessWatch::File { path });
                            self.timers.schedule(now + timeout, TimerKind::ReadinessTimeout(idx));
                        }
                    }
                    ReadinessPolicy::Signal => {
                        supervisor::mark_ready_wait(self.system.components.get_mut(idx));
                        if let Some(read_fd) = read_fd {
                            self.readiness_watches
                                .insert(idx, ReadinessWatch::Signal { read_fd, buffer: Vec::new() });
                        }
                        self.timers.schedule(now + timeout, TimerKind::ReadinessTimeout(idx));
                    }
                    ReadinessPolicy::Command { probe, interval } => {
                        supervisor::mark_ready_wait(self.system.components.get_mut(idx));
                        self.readiness_watches
                            .insert(idx, ReadinessWatch::Command { probe, interval, next_probe_at: now });
                        self.timers.schedule(now + timeout, TimerKind::ReadinessTimeout(idx));
                    }
                }

                if let Some(interval) = health_interval {
                    self.health_next_probe.insert(idx, now + interval);
                }
            }
            Err(e) => {
                error!("{e}");
            }
        }
    }

    #[cfg(feature = "cgroups")]
    fn cgroup_path_for(&self, name: &str, trivial: bool) -> Option<PathBuf> {
        if trivial {
            return None;
        }
        Some(self.config.runtime_dir.join("cgroup").join(name))
    }

    #[cfg(not(feature = "cgroups"))]
    fn cgroup_path_for(&self, _name: &str, _trivial: bool) -> Option<PathBuf> {
        None
    }

    fn finish_readiness(&mut self, idx: ComponentIdx, now: Instant) {
        self.readiness_watches.remove(&idx);
        let component = self.system.components.get_mut(idx);
        if component.state != SupervisionState::ReadyWait && component.state != SupervisionState::Starting {
            return;
        }
        supervisor::mark_active(component, now);
        info!("{}: reached ACTIVE", component.name);
        self.system.publish_capabilities(idx);
        self.promote_newly_eligible(now);
    }

    fn handle_readiness_signal(&mut self, idx: ComponentIdx) {
        let Some(ReadinessWatch::Signal { read_fd, .. }) = self.readiness_watches.get(&idx) else { return };
        let fd = read_fd.as_raw_fd();
        let Ok(bytes) = readiness::drain_nonblocking(fd) else { return };
        let became_ready = {
            let Some(ReadinessWatch::Signal { buffer, .. }) = self.readiness_watches.get_mut(&idx) else {
                return;
            };
            readiness::signal_sentinel_observed(buffer, &bytes)
        };
        if became_ready {
            self.finish_readiness(idx, Instant::now());
        }
    }

    /// Polls file- and command-based readiness watches every loop tick
    /// (inotify would be more efficient for `file`, but the reactor already
    /// has a sub-second tick from the timer-wheel poll timeout, and command
    /// watches need subprocess bookkeeping regardless).
    fn poll_readiness_watches(&mut self, now: Instant) {
        let idxs: Vec<ComponentIdx> = self.readiness_watches.keys().copied().collect();
        for idx in idxs {
            match self.readiness_watches.get(&idx) {
                Some(ReadinessWatch::File { path }) => {
                    if readiness::file_ready_now(path) {
                        self.finish_readiness(idx, now);
                    }
                }
                Some(ReadinessWatch::Command { probe, interval, next_probe_at }) => {
                    if now < *next_probe_at || self.readiness_probes.contains_key(&idx) {
                        continue;
                    }
                    let probe = probe.clone();
                    let interval = *interval;
                    if let Ok(child) = spawn_probe(&probe) {
                        self.readiness_probes.insert(idx, ProbeRun { child, started_at: now, timeout: interval });
                    }
                    if let Some(ReadinessWatch::Command { next_probe_at, .. }) = self.readiness_watches.get_mut(&idx) {
                        *next_probe_at = now + interval;
                    }
                }
                _ => {}
            }
        }
    }

    /// Advances outstanding readiness-command and health probes: reaps
    /// finished ones and applies their result, kills ones past their
    /// deadline (spec §4.8 "Cancellation").
    fn check_probes(&mut self, now: Instant) {
        let readiness_idxs: Vec<ComponentIdx> = self.readiness_probes.keys().copied().collect();
        for idx in readiness_idxs {
            let Some(run) = self.readiness_probes.get_mut(&idx) else { continue };
            match run.child.try_wait() {
                Ok(Some(status)) => {
                    self.readiness_probes.remove(&idx);
                    if status.success() {
                        self.finish_readiness(idx, now);
                    }
                }
                Ok(None) if now.duration_since(run.started_at) > run.timeout => {
                    let _ = run.child.kill();
                    self.readiness_probes.remove(&idx);
                }
                _ => {}
            }
        }

        let health_idxs: Vec<ComponentIdx> = self.health_probes.keys().copied().collect();
        for idx in health_idxs {
            let Some(run) = self.health_probes.get_mut(&idx) else { continue };
            let outcome = match run.child.try_wait() {
                Ok(Some(status)) => Some(status.success()),
                Ok(None) if now.duration_since(run.started_at) > run.timeout => {
                    let _ = run.child.kill();
                    Some(false)
                }
                _ => None,
            };
            let Some(success) = outcome else { continue };
            self.health_probes.remove(&idx);
            self.apply_health_result(idx, success, now);
        }

        let due: Vec<ComponentIdx> = self
            .health_next_probe
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(idx, _)| *idx)
            .collect();
        for idx in due {
            if self.health_probes.contains_key(&idx) {
                continue;
            }
            let Some(health) = self.system.components.get(idx).health.clone() else { continue };
            if !self.system.components.get(idx).state.is_live() {
                self.health_next_probe.remove(&idx);
                continue;
            }
            if let Ok(child) = spawn_probe(&health.probe) {
                self.health_probes.insert(idx, ProbeRun { child, started_at: now, timeout: health.probe_timeout });
            }
            self.health_next_probe.insert(idx, now + health.interval);
        }
    }

    fn apply_health_result(&mut self, idx: ComponentIdx, success: bool, now: Instant) {
        let Some(health) = self.system.components.get(idx).health.clone() else { return };
        let name = self.system.components.get(idx).name.clone();
        let pid = self.system.components.get(idx).pid;
        let currently_degraded = self.system.components.get(idx).state == SupervisionState::Degraded;
        let mut streak = self.system.components.get(idx).health_fail_streak;

        let outcome = warden_core::health::apply_probe_result(
            currently_degraded,
            &mut streak,
            health.degrade_after,
            health.fail_after,
            success,
        );
        self.system.components.get_mut(idx).health_fail_streak = streak;

        use warden_core::health::HealthOutcome;
        match outcome {
            HealthOutcome::NoChange => {}
            HealthOutcome::Degrade => {
                supervisor::mark_degraded(self.system.components.get_mut(idx));
                let provided = self.system.components.get(idx).provides.clone();
                for cap in provided {
                    self.system.capabilities.set_degraded(cap, true);
                }
                warn!("{name}: health degraded");
            }
            HealthOutcome::RecoverToActive => {
                supervisor::mark_active(self.system.components.get_mut(idx), now);
                let provided = self.system.components.get(idx).provides.clone();
                for cap in provided {
                    self.system.capabilities.set_degraded(cap, false);
                }
                info!("{name}: health recovered");
            }
            HealthOutcome::Fail => {
                warn!("{name}: health checks failed, restarting");
                if let Some(pid) = pid {
                    let _ = supervisor::force_kill(Pid::from_raw(pid));
                }
                self.system.withdraw_capabilities(idx);
                supervisor::mark_failed(self.system.components.get_mut(idx));
            }
        }
    }

    fn reap_children(&mut self) {
        while let Some((pid, status)) = supervisor::try_reap_one() {
            let Some(idx) = self.pid_to_idx.remove(&pid.as_raw()) else {
                trace!("reaped unknown process {pid} (inherited orphan)");
                continue;
            };
            self.handle_exit(idx, status, Instant::now());
        }
    }

    fn handle_exit(&mut self, idx: ComponentIdx, status: WaitStatus, now: Instant) {
        self.readiness_watches.remove(&idx);
        self.readiness_probes.remove(&idx);
        self.health_probes.remove(&idx);
        self.health_next_probe.remove(&idx);
        self.demote_escalation_scheduled.remove(&idx);

        let component = self.system.components.get(idx);
        if component.state == SupervisionState::Inactive {
            // Already demoted by capability withdrawal before this exit was
            // reaped (spec §4.10): settle the stale pid, no restart
            // decision to make — the resolver already decided INACTIVE.
            info!("{}: exited after capability-withdrawal demotion", component.name);
            self.system.components.get_mut(idx).pid = None;
            return;
        }
        let Some(outcome) = supervisor::classify_exit(component, status) else { return };
        let name = component.name.clone();

        self.system.withdraw_capabilities(idx);
        let decision = supervisor::decide_after_exit(idx, self.system.components.get_mut(idx), outcome, now);

        match decision {
            RestartDecision::Promote(_) => {
                info!("{name}: oneshot completed");
                // A completed oneshot keeps its provided capabilities live
                // (spec §4.2); re-publish since withdraw_capabilities above
                // cleared them before decide_after_exit ran.
                self.system.publish_capabilities(idx);
                self.promote_newly_eligible(now);
            }
            RestartDecision::RestartAfter(idx, delay) => {
                warn!("{name}: exited, restarting in {delay:?}");
                self.timers.schedule(now + delay, TimerKind::RestartDue(idx));
            }
            RestartDecision::GiveUp(idx) => {
                error!("{name}: exceeded restart rate limit, giving up");
                let _ = idx;
            }
        }
    }

    fn drain_timers(&mut self, now: Instant) {
        for entry in self.timers.drain_due(now) {
            match entry.kind {
                TimerKind::ReadinessTimeout(idx) => self.handle_readiness_timeout(idx),
                TimerKind::RestartDue(idx) => {
                    if self.system.components.get(idx).state == SupervisionState::Failed {
                        self.spawn_component(idx, now);
                    }
                }
                TimerKind::HealthProbeDue(_) => {} // driven by health_next_probe in check_probes
                TimerKind::StopGraceElapsed(idx) => self.escalate_stop(idx),
            }
        }
    }

    fn handle_readiness_timeout(&mut self, idx: ComponentIdx) {
        let component = self.system.components.get(idx);
        if component.state != SupervisionState::ReadyWait && component.state != SupervisionState::Starting {
            return;
        }
        warn!("{}: readiness timeout, terminating", component.name);
        if let Some(pid) = component.pid {
            let _ = supervisor::request_stop(Pid::from_raw(pid));
            self.timers.schedule(Instant::now() + Duration::from_secs(5), TimerKind::StopGraceElapsed(idx));
        }
        self.readiness_watches.remove(&idx);
    }

    fn escalate_stop(&mut self, idx: ComponentIdx) {
        if let Some(pid) = self.system.components.get(idx).pid {
            let _ = supervisor::force_kill(Pid::from_raw(pid));
        }
    }

    fn accept_control_connections(&mut self) {
        loop {
            match self.control_listener.accept() {
                Ok((stream, _)) => self.handle_control_connection(stream),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("control socket accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Handled synchronously: a trusted local control session, one request
    /// per connection. Spec §4.8's "write deadline" cancellation applies to
    /// long-lived sessions this simple connect-request-respond-close shape
    /// doesn't have.
    fn handle_control_connection(&mut self, stream: UnixStream) {
        use std::io::{BufRead, BufReader, Write};
        let _ = stream.set_nonblocking(false);
        let mut reader = BufReader::new(stream.try_clone().expect("stream clone"));
        let mut writer = stream;

        let call = match control::jsonrpc2::get_next_call(&mut reader) {
            Ok(Some(Ok(call))) => call,
            Ok(Some(Err(reason))) => {
                let response = control::jsonrpc2::make_error_response(
                    None,
                    control::jsonrpc2::make_error(control::jsonrpc2::INVALID_REQUEST_ERROR, reason, None),
                );
                let _ = control::jsonrpc2::write_response(&mut writer, &response);
                return;
            }
            _ => return,
        };

        let id = call.id.clone();
        let response = match control::parse_command(&call) {
            Ok(control::Command::Upgrade(name)) => self.perform_upgrade(&name, id),
            Ok(cmd) => {
                let mut ctx = ControlContext { system: &mut self.system, config: &self.config };
                let result = control::execute_command(cmd, &mut ctx);
                // `resolve`/`reload` can demote components straight from
                // here, bypassing `promote_newly_eligible`'s own call to
                // this — catch up on any pending force-kill escalations.
                self.schedule_demotion_escalation(Instant::now());
                match result {
                    Ok(result) => control::jsonrpc2::make_result_response(id, result),
                    Err(reason) => control::jsonrpc2::make_error_response(
                        id,
                        control::jsonrpc2::make_error(control::jsonrpc2::SERVER_ERROR, reason, None),
                    ),
                }
            }
            Err(control::ParseError::MethodNotFound(reason)) => control::jsonrpc2::make_error_response(
                id,
                control::jsonrpc2::make_error(control::jsonrpc2::METHOD_NOT_FOUND_ERROR, reason, None),
            ),
            Err(control::ParseError::ParamsInvalid(reason)) => control::jsonrpc2::make_error_response(
                id,
                control::jsonrpc2::make_error(control::jsonrpc2::INVALID_PARAMS_ERROR, reason, None),
            ),
        };
        let _ = control::jsonrpc2::write_response(&mut writer, &response);
    }

    /// Actually drives the upgrade ladder (spec §4.4), unlike
    /// `control::execute_command`'s `upgrade` handler which only reports
    /// it: this runs from inside the reactor, the only place allowed to
    /// fork/signal/wait.
    fn perform_upgrade(&mut self, name: &str, id: Option<serde_json::Value>) -> control::jsonrpc2::Response {
        let Some(idx) = self.system.components.find(name) else {
            return control::jsonrpc2::make_error_response(
                id,
                control::jsonrpc2::make_error(control::jsonrpc2::SERVER_ERROR, format!("no such component: {name}"), None),
            );
        };
        let component = self.system.components.get(idx);
        let Some(old_pid) = component.pid else {
            return control::jsonrpc2::make_error_response(
                id,
                control::jsonrpc2::make_error(control::jsonrpc2::SERVER_ERROR, format!("{name} has no live process"), None),
            );
        };
        let ladder = handoff::ladder_from(component.upgrade_strategy);
        let old_pid = Pid::from_raw(old_pid);

        for strategy in ladder {
            let attempted = match strategy {
                warden_core::component::UpgradeStrategy::CheckpointRestore => {
                    let dump_dir = self.config.checkpoint_dir.join(name).join("upgrade");
                    handoff::attempt_checkpoint_restore(old_pid, &dump_dir, "criu").ok()
                }
                warden_core::component::UpgradeStrategy::FdPassing => {
                    // Full fd-passing requires the new instance to run the
                    // handoff protocol cooperatively; driving that exchange
                    // from here would block the reactor, so this strategy
                    // falls through to restart in this control path (the
                    // protocol primitives in `handoff`/`fd_passing` remain
                    // available to a component that implements its own
                    // receiving side).
                    None
                }
                warden_core::component::UpgradeStrategy::Restart => {
                    let _ = supervisor::request_stop(old_pid);
                    let now = Instant::now();
                    self.system.components.get_mut(idx).pid = None;
                    self.spawn_component(idx, now);
                    self.system.components.get(idx).pid.map(|p| Pid::from_raw(p))
                }
            };

            if let Some(new_pid) = attempted {
                info!("{name}: upgraded via {strategy:?}, new pid {new_pid}");
                return control::jsonrpc2::make_result_response(
                    id,
                    serde_json::json!({ "upgraded": name, "strategy": format!("{strategy:?}"), "pid": new_pid.as_raw() }),
                );
            }
        }

        control::jsonrpc2::make_error_response(
            id,
            control::jsonrpc2::make_error(control::jsonrpc2::SERVER_ERROR, format!("{name}: upgrade ladder exhausted"), None),
        )
    }

    fn reload(&mut self) {
        let mut ctx = ControlContext { system: &mut self.system, config: &self.config };
        match control::execute_command(control::Command::Reload, &mut ctx) {
            Ok(result) => info!("manifest reload: {result}"),
            Err(e) => error!("manifest reload failed: {e}"),
        }
        self.promote_newly_eligible(Instant::now());
    }

    /// SIGUSR2 (spec §6 "Signals accepted: user-defined-2, dump state to log").
    fn dump_state_to_log(&self) {
        for (_, c) in self.system.components.iter() {
            info!("state dump: {} state={:?} pid={:?} restarts={}", c.name, c.state, c.pid, c.restart_count);
        }
    }

    fn run_shutdown_sequence(&mut self) {
        info!("shutdown requested, stopping components");
        let live: Vec<(ComponentIdx, i32)> = self
            .system
            .components
            .iter()
            .filter(|(_, c)| c.state.is_live())
            .filter_map(|(idx, c)| c.pid.map(|pid| (idx, pid)))
            .collect();

        for (_, pid) in &live {
            let _ = supervisor::request_stop(Pid::from_raw(*pid));
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let mut any_alive = false;
            for (_, pid) in &live {
                if nix::sys::signal::kill(Pid::from_raw(*pid), None).is_ok() {
                    any_alive = true;
                }
            }
            if !any_alive {
                break;
            }
            while supervisor::try_reap_one().is_some() {}
            std::thread::sleep(Duration::from_millis(100));
        }
        for (_, pid) in &live {
            let _ = supervisor::force_kill(Pid::from_raw(*pid));
        }
        while supervisor::try_reap_one().is_some() {}
        info!("shutdown complete");
    }
}

fn spawn_probe(probe: &warden_core::component::Commandline) -> std::io::Result<Child> {
    StdCommand::new(&probe.program)
        .args(&probe.arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}
