//! The upgrade engine (spec §2 C9, §4.4): three strategies in declared
//! preference order, each falling through to the next on any failure,
//! with restart as the guaranteed-success floor.

use crate::checkpoint;
use crate::component::UpgradeStrategy;
use crate::fd_passing::{self, SENTINEL};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

/// The full preference ladder, strategy 1 first. A component's configured
/// `upgrade.strategy` (spec §6) names where in this ladder it is *capable*
/// of starting; everything after that point is still available as
/// fallback, down to `Restart`, which never fails to make progress.
const LADDER: &[UpgradeStrategy] =
    &[UpgradeStrategy::CheckpointRestore, UpgradeStrategy::FdPassing, UpgradeStrategy::Restart];

/// Strategies to attempt, in order, starting from `preferred`.
pub fn ladder_from(preferred: UpgradeStrategy) -> Vec<UpgradeStrategy> {
    let start = LADDER.iter().position(|s| *s == preferred).unwrap_or(0);
    LADDER[start..].to_vec()
}

#[derive(Debug)]
pub enum UpgradeOutcome {
    Succeeded { strategy: UpgradeStrategy, new_pid: Pid },
    /// Every strategy through `Restart` was attempted (`Restart` itself
    /// failing indicates an unrelated spawn failure, not a handoff
    /// failure) — callers should treat this the same as any other failed
    /// restart attempt.
    Exhausted,
}

/// Strategy 1 (spec §4.4): suspend, dump, restore. `checkpoint_dir` must be
/// on storage that survives the intended replacement (ordinary upgrade:
/// any local path; live kernel replace: the configured persistent
/// checkpoint directory).
pub fn attempt_checkpoint_restore(
    old_pid: Pid,
    checkpoint_dir: &std::path::Path,
    tool: &str,
) -> Result<Pid, String> {
    checkpoint::checkpoint_process(old_pid.as_raw(), checkpoint_dir, tool)?;
    let new_pid = checkpoint::restore_process(checkpoint_dir, tool)?;
    Ok(Pid::from_raw(new_pid))
}

/// One end of the handoff socket pair, handed to the forked new instance at
/// the reserved descriptor (spec §4.4 strategy 2, step 1).
pub struct HandoffPair {
    pub parent_end: OwnedFd,
    pub child_end: OwnedFd,
}

pub fn create_handoff_pair() -> nix::Result<HandoffPair> {
    let (parent_end, child_end) =
        socketpair(AddressFamily::Unix, SockType::Datagram, None, SockFlag::empty())?;
    Ok(HandoffPair { parent_end, child_end })
}

/// Strategy 2, steps 4-5 (spec §4.4): the old instance sends its open
/// descriptors over `sock` and exits; called from the old instance after it
/// has stopped accepting new work and been signalled to begin handoff.
pub fn send_descriptors_and_exit(sock: &OwnedFd, descriptors: &[std::os::fd::RawFd]) -> ! {
    match fd_passing::send_descriptors(sock.as_raw_fd(), descriptors) {
        Ok(()) => std::process::exit(0),
        Err(_) => std::process::exit(1),
    }
}

/// Strategy 2, step 5: the new instance receives descriptors until the
/// sentinel, with a bounded wait so a hung sender eventually falls through
/// to strategy 3. Returns the adopted descriptors.
pub fn receive_descriptors_with_timeout(
    sock: &OwnedFd,
    timeout: Duration,
) -> Result<Vec<OwnedFd>, String> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::BorrowedFd;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err("timed out waiting for descriptor handoff".to_owned());
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(sock.as_raw_fd()) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let poll_timeout = PollTimeout::try_from(remaining).unwrap_or(PollTimeout::MAX);
        poll(&mut fds, poll_timeout).map_err(|e| format!("poll: {e}"))?;
        if fds[0].revents().map(|r| r.contains(PollFlags::POLLIN)).unwrap_or(false) {
            return fd_passing::receive_until_sentinel(sock.as_raw_fd())
                .map_err(|e| format!("receive_until_sentinel: {e}"));
        }
    }
}

/// Signals the old instance to stop accepting work and begin handing off
/// (spec §4.4 strategy 2, step 3). By convention a designated real-time
/// signal, distinct from the termination signals the reactor already
/// treats specially.
pub const HANDOFF_BEGIN_SIGNAL: nix::sys::signal::Signal = nix::sys::signal::Signal::SIGUSR1;

pub fn signal_begin_handoff(old_pid: Pid) -> nix::Result<()> {
    nix::sys::signal::kill(old_pid, HANDOFF_BEGIN_SIGNAL)
}

/// Strategy 2, step 7: forcibly terminate the old instance if it hasn't
/// exited within `grace` of being signalled.
pub fn reap_old_instance_with_grace(old_pid: Pid, grace: Duration) -> Result<(), String> {
    let deadline = Instant::now() + grace;
    loop {
        match waitpid(old_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    let _ = nix::sys::signal::kill(old_pid, nix::sys::signal::Signal::SIGKILL);
                    let _ = waitpid(old_pid, None);
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(_) => return Ok(()),
            Err(nix::Error::ECHILD) => return Ok(()),
            Err(e) => return Err(format!("waitpid: {e}")),
        }
    }
}

pub fn sentinel_bytes() -> &'static [u8] {
    SENTINEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_from_fd_passing_skips_checkpoint_restore() {
        let steps = ladder_from(UpgradeStrategy::FdPassing);
        assert_eq!(steps, vec![UpgradeStrategy::FdPassing, UpgradeStrategy::Restart]);
    }

    #[test]
    fn ladder_from_restart_is_just_restart() {
        let steps = ladder_from(UpgradeStrategy::Restart);
        assert_eq!(steps, vec![UpgradeStrategy::Restart]);
    }

    #[test]
    fn ladder_from_checkpoint_restore_is_the_full_ladder() {
        let steps = ladder_from(UpgradeStrategy::CheckpointRestore);
        assert_eq!(steps, LADDER.to_vec());
    }
}
