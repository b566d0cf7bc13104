//! Manifest loader (spec §2 C1, §4.1).
//!
//! Scans a directory of TOML manifest files and yields component records.
//! Files that fail structural validation are logged and skipped — they
//! never abort the load of the rest of the directory.

use super::schema::{
    IsolationSection, KindField, ManifestFile, ReadinessField, UpgradeStrategyField,
};
use crate::component::{
    Commandline, Component, HealthConfig, IsolationProfile, Kind, Namespace, ReadinessConfig,
    ReadinessPolicy, ResourceLimits, RestartAccounting, SupervisionState, UpgradeStrategy,
};
use crate::errors::ManifestError;
use log::{trace, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct LoadResult {
    pub components: Vec<Component>,
    pub errors: Vec<ManifestError>,
}

/// Scans `dir` for `*.toml` manifest files. Non-manifest entries (anything
/// without a `.toml` extension, directories, dotfiles) are ignored per spec
/// §4.1. This does not resolve capability names to indices — that happens
/// once the caller has a `CapabilityRegistry` to intern them into.
pub fn load_directory(dir: &Path, restart_window: Duration, restart_max: u32) -> LoadResult {
    let mut components = Vec::new();
    let mut errors = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("could not read manifest directory {}: {e}", dir.display());
            return LoadResult { components, errors };
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("toml"))
        .collect();
    paths.sort();

    for path in paths {
        match load_one(&path, restart_window, restart_max) {
            Ok(component) => {
                trace!("loaded manifest {}: component {}", path.display(), component.name);
                components.push(component);
            }
            Err(reason) => {
                warn!("skipping malformed manifest {}: {reason}", path.display());
                errors.push(ManifestError { path, reason });
            }
        }
    }

    LoadResult { components, errors }
}

fn load_one(
    path: &Path,
    restart_window: Duration,
    restart_max: u32,
) -> Result<Component, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("read error: {e}"))?;
    let manifest: ManifestFile = toml::from_str(&text).map_err(|e| format!("parse error: {e}"))?;

    if manifest.identity.name.trim().is_empty() {
        return Err("identity.name must not be empty".to_owned());
    }
    if manifest.command.program.trim().is_empty() {
        return Err("command.program must not be empty".to_owned());
    }

    let kind = match manifest.identity.kind {
        KindField::Service => Kind::Service,
        KindField::Oneshot => Kind::Oneshot,
    };

    let readiness = build_readiness(&manifest.lifecycle)?;
    let health = build_health(&manifest.lifecycle);
    let isolation = build_isolation(&manifest.isolation, &manifest.resources)?;
    let upgrade_strategy = match manifest.upgrade.strategy {
        UpgradeStrategyField::Restart => UpgradeStrategy::Restart,
        UpgradeStrategyField::FdPassing => UpgradeStrategy::FdPassing,
        UpgradeStrategyField::CheckpointRestore => UpgradeStrategy::CheckpointRestore,
    };

    Ok(Component {
        name: manifest.identity.name,
        kind,
        command: Commandline {
            program: PathBuf::from(manifest.command.program),
            arguments: manifest.command.arguments,
        },
        env: manifest.command.environment,
        requires_names: manifest.requires.capabilities.into_iter().collect(),
        provides_names: manifest.provides.capabilities.into_iter().collect(),
        requires: Vec::new(),
        provides: Vec::new(),
        state: SupervisionState::Inactive,
        pid: None,
        restart: RestartAccounting::new(restart_window, restart_max),
        readiness,
        health,
        isolation,
        upgrade_strategy,
        restart_count: 0,
        started_at: None,
        health_fail_streak: 0,
    })
}

fn build_readiness(lifecycle: &super::schema::LifecycleSection) -> Result<ReadinessConfig, String> {
    let timeout = Duration::from_secs(lifecycle.readiness_timeout.unwrap_or(90));
    let policy = match lifecycle.readiness {
        ReadinessField::None => ReadinessPolicy::None,
        ReadinessField::File => {
            let target = lifecycle
                .readiness_target
                .clone()
                .ok_or("readiness = file requires readiness-target")?;
            ReadinessPolicy::File { path: PathBuf::from(target) }
        }
        ReadinessField::Signal => ReadinessPolicy::Signal,
        ReadinessField::Command => {
            let target = lifecycle
                .readiness_target
                .clone()
                .ok_or("readiness = command requires readiness-target")?;
            let interval = Duration::from_secs(lifecycle.readiness_interval.unwrap_or(1));
            ReadinessPolicy::Command {
                probe: parse_commandline(&target),
                interval,
            }
        }
    };
    Ok(ReadinessConfig { policy, timeout })
}

fn build_health(lifecycle: &super::schema::LifecycleSection) -> Option<HealthConfig> {
    let probe_cmd = lifecycle.health_probe.as_ref()?;
    Some(HealthConfig {
        probe: parse_commandline(probe_cmd),
        interval: Duration::from_secs(lifecycle.health_interval.unwrap_or(10)),
        probe_timeout: Duration::from_secs(5),
        degrade_after: lifecycle.health_degrade_after.unwrap_or(3),
        fail_after: lifecycle.health_fail_after.unwrap_or(3),
    })
}

fn build_isolation(
    isolation: &IsolationSection,
    resources: &super::schema::ResourcesSection,
) -> Result<IsolationProfile, String> {
    let mut namespaces = Vec::new();
    for raw in &isolation.namespaces {
        namespaces.push(match raw.as_str() {
            "mount" => Namespace::Mount,
            "pid" => Namespace::Pid,
            "net" => Namespace::Net,
            "uts" => Namespace::Uts,
            "ipc" => Namespace::Ipc,
            "user" => Namespace::User,
            other => return Err(format!("unknown namespace {other:?}")),
        });
    }
    Ok(IsolationProfile {
        resources: ResourceLimits {
            memory_max: resources.memory_max,
            memory_high: resources.memory_high,
            cpu_weight: resources.cpu_weight,
            cpu_max: resources.cpu_max,
            io_weight: resources.io_weight,
            pids_max: resources.pids_max,
        },
        namespaces,
        hostname: isolation.hostname.clone(),
        root: isolation.root.clone().map(PathBuf::from),
    })
}

/// Splits a shell-ish probe/readiness command string into program + args.
/// Matches the teacher's general approach of treating these as plain
/// argv vectors (no shell interpolation) rather than invoking `/bin/sh -c`.
fn parse_commandline(raw: &str) -> Commandline {
    let mut parts = raw.split_whitespace();
    let program = parts.next().unwrap_or_default().to_owned();
    let arguments = parts.map(str::to_owned).collect();
    Commandline { program: PathBuf::from(program), arguments }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(dir: &Path, filename: &str, contents: &str) {
        let path = dir.join(filename);
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_valid_manifest_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "a.toml",
            r#"
            [identity]
            name = "a"
            kind = "service"

            [command]
            program = "/bin/a"

            [provides]
            capabilities = ["cap-a"]
            "#,
        );
        let result = load_directory(dir.path(), Duration::from_secs(60), 5);
        assert!(result.errors.is_empty());
        assert_eq!(result.components.len(), 1);
        let c = &result.components[0];
        assert_eq!(c.name, "a");
        assert!(matches!(c.readiness.policy, ReadinessPolicy::None));
        assert!(c.health.is_none());
        assert!(c.isolation.is_trivial());
        assert_eq!(c.upgrade_strategy, UpgradeStrategy::Restart);
    }

    #[test]
    fn malformed_manifest_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "broken.toml", "not even toml {{{");
        write_manifest(
            dir.path(),
            "b.toml",
            r#"
            [identity]
            name = "b"
            kind = "oneshot"

            [command]
            program = "/bin/b"
            "#,
        );
        let result = load_directory(dir.path(), Duration::from_secs(60), 5);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.components.len(), 1);
        assert_eq!(result.components[0].name, "b");
    }

    #[test]
    fn non_manifest_entries_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "README.md", "not a manifest");
        let result = load_directory(dir.path(), Duration::from_secs(60), 5);
        assert!(result.errors.is_empty());
        assert!(result.components.is_empty());
    }
}
