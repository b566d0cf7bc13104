//! The single-threaded event loop (spec §2 C10, §4.8).
//!
//! The teacher delivers signals via a dedicated blocking thread
//! (`signal_hook::iterator::Signals`, see `signal_handler.rs`) and reads
//! notifications on a per-service thread (`wait_for_service`). Both are
//! ruled out here: spec §4.8 mandates one thread, woken by `poll(2)`, with
//! no locks anywhere in its own code path. This module instead registers
//! each signal onto a self-pipe with `signal_hook::low_level::pipe`
//! (async-signal-safe: the handler only writes one byte) and polls that
//! pipe's read end alongside every other descriptor the loop cares about.

use crate::component::ComponentIdx;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe, read};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// One entry in the timer wheel: fires `kind` at `at`. Ordered so the
/// earliest deadline sorts first out of a max-heap via `Reverse`.
#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub at: Instant,
    pub kind: TimerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ReadinessTimeout(ComponentIdx),
    RestartDue(ComponentIdx),
    HealthProbeDue(ComponentIdx),
    StopGraceElapsed(ComponentIdx),
}

struct HeapEntry(Instant, TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse so BinaryHeap (a max-heap) pops the earliest deadline first.
        Reverse(self.0).cmp(&Reverse(other.0))
    }
}

/// Deadline-ordered set of pending timers (readiness timeouts, restart
/// backoff expiry, health probe cadence, stop-grace escalation).
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<HeapEntry>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Instant, kind: TimerKind) {
        self.heap.push(HeapEntry(at, TimerEntry { at, kind }));
    }

    /// Removes and returns every timer whose deadline has passed as of `now`.
    pub fn drain_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while let Some(HeapEntry(at, _)) = self.heap.peek() {
            if *at > now {
                break;
            }
            let HeapEntry(_, entry) = self.heap.pop().unwrap();
            due.push(entry);
        }
        due
    }

    /// How long `poll` should block for: time until the next deadline, or
    /// `None` if the wheel is empty (caller then blocks indefinitely or on
    /// whatever other cadence it needs, e.g. command-probe intervals).
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap.peek().map(|HeapEntry(at, _)| at.saturating_duration_since(now))
    }
}

/// Self-pipe signal delivery (spec §4.8 "self-pipe"). The write end is
/// registered with `signal_hook::low_level::pipe::register` for each
/// signal of interest; the handler installed there only performs the
/// async-signal-safe single byte write.
pub struct SelfPipe {
    read_fd: OwnedFd,
    _write_fd: OwnedFd,
    registrations: Vec<signal_hook::SigId>,
}

impl SelfPipe {
    pub fn new() -> nix::Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        set_nonblocking(read_fd.as_raw_fd())?;
        Ok(Self { read_fd, _write_fd: write_fd, registrations: Vec::new() })
    }

    /// Registers `signal` so that raising it writes a byte to the pipe.
    /// Typical set: `SIGCHLD`, `SIGTERM`, `SIGINT`, `SIGHUP` (manifest
    /// reload trigger), `SIGUSR1`/`SIGUSR2` (upgrade/kernel-replace
    /// triggers, per operator convention).
    pub fn register(&mut self, signal: i32) -> std::io::Result<()> {
        let id = unsafe { signal_hook::low_level::pipe::register(signal, self._write_fd.as_raw_fd()) }?;
        self.registrations.push(id);
        Ok(())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Drains and discards all pending bytes (the pipe is just a wakeup
    /// bell; each woken pass re-derives what actually needs doing by
    /// polling `waitpid`/checking which signal disposition fired).
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(self.read_fd.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(nix::Error::EAGAIN) => break,
                Err(_) => break,
            }
        }
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        for id in self.registrations.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// One descriptor source the loop is watching, tagged so a readiness event
/// can be routed back to what it means (spec §4.8 "per-component readiness
/// descriptors").
#[derive(Debug, Clone, Copy)]
pub enum PollSource {
    SelfPipe,
    ControlSocket,
    ManifestInotify,
    ReadinessSignal(ComponentIdx),
}

/// Builds the poll set and blocks until something is ready or the next
/// timer deadline, whichever comes first. Returns the sources that became
/// readable. This function does the syscall; the caller (the reactor's
/// owning `System`/loop driver, not yet wired up to a `main`) interprets
/// results and mutates state — keeping this function itself free of any
/// borrow on the component/capability tables.
pub fn poll_once(
    sources: &[(RawFd, PollSource)],
    timeout: Option<Duration>,
) -> nix::Result<Vec<PollSource>> {
    let mut fds: Vec<PollFd> = sources
        .iter()
        .map(|(fd, _)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
        .collect();

    let timeout = match timeout {
        Some(d) => PollTimeout::try_from(d).unwrap_or(PollTimeout::MAX),
        None => PollTimeout::NONE,
    };

    poll(&mut fds, timeout)?;

    let mut ready = Vec::new();
    for (pfd, (_, source)) in fds.iter().zip(sources.iter()) {
        if let Some(revents) = pfd.revents() {
            if revents.contains(PollFlags::POLLIN) || revents.contains(PollFlags::POLLHUP) {
                ready.push(*source);
            }
        }
    }
    Ok(ready)
}

/// Borrows `fd`'s lifetime from a value the caller owns, for use in the
/// `sources` slice passed to [`poll_once`].
pub fn borrow<'a>(fd: &'a impl AsFd) -> RawFd {
    fd.as_fd().as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_wheel_drains_only_due_entries_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let t0 = Instant::now();
        wheel.schedule(t0 + Duration::from_secs(5), TimerKind::RestartDue(ComponentIdx(0)));
        wheel.schedule(t0 + Duration::from_secs(1), TimerKind::RestartDue(ComponentIdx(1)));
        wheel.schedule(t0 + Duration::from_secs(10), TimerKind::RestartDue(ComponentIdx(2)));

        let due = wheel.drain_due(t0 + Duration::from_secs(2));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, TimerKind::RestartDue(ComponentIdx(1)));

        let due = wheel.drain_due(t0 + Duration::from_secs(6));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, TimerKind::RestartDue(ComponentIdx(0)));
    }

    #[test]
    fn next_timeout_reflects_earliest_pending_deadline() {
        let mut wheel = TimerWheel::new();
        let t0 = Instant::now();
        wheel.schedule(t0 + Duration::from_secs(3), TimerKind::RestartDue(ComponentIdx(0)));
        let remaining = wheel.next_timeout(t0).unwrap();
        assert!(remaining <= Duration::from_secs(3) && remaining > Duration::from_secs(2));
    }

    #[test]
    fn self_pipe_drain_is_idempotent_when_empty() {
        let pipe = SelfPipe::new().unwrap();
        pipe.drain();
        pipe.drain();
    }
}
