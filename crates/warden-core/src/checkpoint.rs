//! Checkpoint/restore dumps and the live-kernel-replacement manifest
//! (spec §4.4 "Strategy 1", "Live kernel replacement"; §6 "Persisted
//! state").

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata recorded alongside every checkpoint dump (spec §6: "component
/// name, original process identifier, timestamp, image size, capability
/// list, checkpoint-tool version").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpMetadata {
    pub component_name: String,
    pub original_pid: i32,
    pub timestamp_unix: u64,
    pub image_size_bytes: u64,
    pub capabilities: Vec<String>,
    pub checkpoint_tool_version: String,
    pub id: String,
}

impl DumpMetadata {
    pub fn dump_dir(&self, checkpoint_root: &Path) -> PathBuf {
        checkpoint_root.join(&self.component_name).join(&self.id)
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Invokes the external checkpoint utility to suspend and dump `pid`'s
/// process tree into `dump_dir`. This is an "external-tool error" source
/// per spec §7: absence or failure forces fallback through the upgrade
/// ladder, it is never treated as fatal to the supervisor.
pub fn checkpoint_process(pid: i32, dump_dir: &Path, tool: &str) -> Result<(), String> {
    std::fs::create_dir_all(dump_dir).map_err(|e| format!("create dump dir: {e}"))?;
    let status = std::process::Command::new(tool)
        .arg("dump")
        .arg("--tree")
        .arg(pid.to_string())
        .arg("--image-dir")
        .arg(dump_dir)
        .status()
        .map_err(|e| format!("spawn {tool}: {e}"))?;
    if !status.success() {
        return Err(format!("{tool} exited with {status}"));
    }
    Ok(())
}

/// Invokes the external checkpoint utility to restore a process tree from
/// `dump_dir`. Returns the new leader pid on success.
pub fn restore_process(dump_dir: &Path, tool: &str) -> Result<i32, String> {
    let output = std::process::Command::new(tool)
        .arg("restore")
        .arg("--image-dir")
        .arg(dump_dir)
        .arg("--detached")
        .output()
        .map_err(|e| format!("spawn {tool}: {e}"))?;
    if !output.status.success() {
        return Err(format!("{tool} exited with {}", output.status));
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<i32>()
        .map_err(|e| format!("could not parse restored pid: {e}"))
}

/// The manifest written before the point of no return during a live kernel
/// replacement, and removed after a successful restore (spec §4.4 "Live
/// kernel replacement").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelReplaceManifest {
    pub old_kernel_identity: String,
    pub dumps: Vec<DumpMetadata>,
    pub initiated_at_unix: u64,
}

impl KernelReplaceManifest {
    pub fn write(&self, path: &Path) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self).map_err(|e| format!("serialize: {e}"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("create dir: {e}"))?;
        }
        std::fs::write(path, json).map_err(|e| format!("write {}: {e}", path.display()))
    }

    pub fn read(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| format!("parse: {e}"))
    }

    pub fn remove(path: &Path) -> Result<(), String> {
        std::fs::remove_file(path).map_err(|e| format!("remove {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_replace_manifest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kexec-manifest.json");
        let manifest = KernelReplaceManifest {
            old_kernel_identity: "5.15.0-old".to_owned(),
            dumps: vec![DumpMetadata {
                component_name: "echo".to_owned(),
                original_pid: 123,
                timestamp_unix: now_unix(),
                image_size_bytes: 4096,
                capabilities: vec!["echo.listening".to_owned()],
                checkpoint_tool_version: "criu-4.0".to_owned(),
                id: "1".to_owned(),
            }],
            initiated_at_unix: now_unix(),
        };
        manifest.write(&path).unwrap();
        assert!(path.exists());
        let read_back = KernelReplaceManifest::read(&path).unwrap();
        assert_eq!(read_back.old_kernel_identity, manifest.old_kernel_identity);
        KernelReplaceManifest::remove(&path).unwrap();
        assert!(!path.exists());
    }
}
