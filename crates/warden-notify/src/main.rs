//! warden-notify — tells the supervising warden daemon that the calling
//! process has finished starting up (spec §4.5 "signal" readiness policy).
//!
//! A component manifest with `readiness = "signal"` causes the supervisor
//! to hand the child the write end of a pipe at the descriptor named by the
//! `WARDEN_READY_FD` environment variable. This helper writes the sentinel
//! the reactor's readiness watch looks for and exits; it carries no other
//! state, mirroring the teacher's `systemd-notify --ready` as a one-shot
//! fire-and-forget call rather than a long-lived client.

use clap::Parser;
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd};
use std::process;

const READY_SENTINEL: &[u8] = b"READY\n";

#[derive(Parser, Debug)]
#[command(
    name = "warden-notify",
    about = "Tell warden that this component has finished starting up",
    version
)]
struct Cli {
    /// Report that startup has completed. Currently the only signal the
    /// reactor's readiness watch understands; accepted explicitly so
    /// invocations read the same as the teacher's `--ready` convention.
    #[arg(long)]
    ready: bool,
}

fn ready_fd() -> Result<OwnedFd, String> {
    let raw = std::env::var("WARDEN_READY_FD")
        .map_err(|_| "WARDEN_READY_FD is not set; not running under warden?".to_owned())?;
    let fd: i32 = raw.parse().map_err(|e| format!("invalid WARDEN_READY_FD {raw:?}: {e}"))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn main() {
    let cli = Cli::parse();
    if !cli.ready {
        // Nothing else is implemented yet; matches the teacher's
        // systemd-notify exiting quietly when there's nothing to send.
        return;
    }

    let fd = match ready_fd() {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };
    let mut file = std::fs::File::from(fd);
    if let Err(e) = file.write_all(READY_SENTINEL) {
        eprintln!("Error: failed to signal readiness: {e}");
        process::exit(1);
    }
}
