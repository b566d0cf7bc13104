//! Process-wide configuration, grounded in the teacher's `config.rs`: a
//! plain struct with well-known default paths, no config file of its own.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: log::LevelFilter,
    pub log_to_stdout: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub manifest_dir: PathBuf,
    pub control_socket_path: PathBuf,
    pub runtime_dir: PathBuf,
    pub log_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub persistent_checkpoint_dir: PathBuf,
    pub kernel_replace_manifest: PathBuf,
    /// Restart-rate-limit window (spec §4.2 `T`).
    pub restart_window: std::time::Duration,
    /// Restart-rate-limit burst size (spec §4.2 `W`).
    pub restart_max_in_window: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manifest_dir: PathBuf::from("/etc/warden/components"),
            control_socket_path: PathBuf::from("/run/warden/control.sock"),
            runtime_dir: PathBuf::from("/run/warden"),
            log_dir: PathBuf::from("/run/warden/log"),
            checkpoint_dir: PathBuf::from("/run/warden/checkpoints"),
            persistent_checkpoint_dir: PathBuf::from("/var/lib/warden/checkpoints"),
            kernel_replace_manifest: PathBuf::from("/var/lib/warden/kexec-manifest.json"),
            restart_window: std::time::Duration::from_secs(60),
            restart_max_in_window: 5,
        }
    }
}

impl Config {
    /// Reads the persisted-dumps location from a kernel-command-line style
    /// parameter on restart after a live kernel replace (spec §6 "Command-
    /// line surface"). Looks for `warden.dumps=<path>` in `/proc/cmdline`.
    pub fn dumps_path_from_kernel_cmdline() -> Option<PathBuf> {
        let cmdline = std::fs::read_to_string("/proc/cmdline").ok()?;
        cmdline.split_whitespace().find_map(|tok| {
            tok.strip_prefix("warden.dumps=").map(PathBuf::from)
        })
    }
}
