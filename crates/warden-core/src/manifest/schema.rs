//! The on-disk manifest schema (spec §6 "Manifest schema"). One component
//! per TOML file; see `SPEC_FULL.md` §1 for why TOML was chosen over the
//! teacher's systemd-unit INI format.

use serde::Deserialize;
use std::collections::HashSet;

#[derive(Debug, Deserialize)]
pub struct ManifestFile {
    pub identity: Identity,
    pub command: CommandSection,
    #[serde(default)]
    pub requires: RequiresSection,
    #[serde(default)]
    pub provides: ProvidesSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub resources: ResourcesSection,
    #[serde(default)]
    pub isolation: IsolationSection,
    #[serde(default)]
    pub upgrade: UpgradeSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
}

#[derive(Debug, Deserialize)]
pub struct Identity {
    pub name: String,
    pub kind: KindField,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KindField {
    Service,
    Oneshot,
}

#[derive(Debug, Deserialize)]
pub struct CommandSection {
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RequiresSection {
    #[serde(default)]
    pub capabilities: HashSet<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ProvidesSection {
    #[serde(default)]
    pub capabilities: HashSet<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessField {
    None,
    File,
    Signal,
    Command,
}

impl Default for ReadinessField {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct LifecycleSection {
    #[serde(default)]
    pub readiness: ReadinessField,
    pub readiness_target: Option<String>,
    pub readiness_timeout: Option<u64>,
    pub readiness_interval: Option<u64>,
    pub health_probe: Option<String>,
    pub health_interval: Option<u64>,
    pub health_degrade_after: Option<u32>,
    pub health_fail_after: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ResourcesSection {
    pub memory_max: Option<u64>,
    pub memory_high: Option<u64>,
    pub cpu_weight: Option<u32>,
    pub cpu_max: Option<f64>,
    pub io_weight: Option<u32>,
    pub pids_max: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct IsolationSection {
    #[serde(default)]
    pub namespaces: Vec<String>,
    pub hostname: Option<String>,
    pub root: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeStrategyField {
    Restart,
    FdPassing,
    CheckpointRestore,
}

impl Default for UpgradeStrategyField {
    fn default() -> Self {
        Self::Restart
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct UpgradeSection {
    #[serde(default)]
    pub strategy: UpgradeStrategyField,
}

#[derive(Debug, Deserialize, Default)]
pub struct CheckpointSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub leave_running: bool,
    #[serde(default)]
    pub preserve_fds: bool,
    pub memory_estimate: Option<u64>,
    pub max_age: Option<u64>,
}
