//! The control surface (spec §2 C11, §4.9): a local socket accepting
//! line-oriented JSON-RPC 2.0 requests, grounded in the teacher's
//! `control/control.rs` (`Command` enum, `parse_command`, `execute_command`
//! shape) and its `systemctl` client's "pack CLI flags into JSON-RPC"
//! convention.

pub mod jsonrpc2;

use crate::component::ComponentIdx;
use crate::config::Config;
use crate::errors::ManifestError;
use crate::logsink::LogSink;
use crate::manifest;
use crate::resolver;
use crate::runtime::System;
use jsonrpc2::Call;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Command {
    Status,
    Capabilities,
    Tree(String),
    ReverseDependencies(String),
    SimulateRemove(String),
    ExportGraph,
    Log(String, usize),
    Pending,
    Resolve,
    Reload,
    Upgrade(String),
    Checkpoint(String),
    Restore(String, Option<String>),
    CheckpointList,
    CheckpointRm(String),
    Analyze,
    CheckCycles,
    Validate,
    KexecLike { dry_run: bool, kernel_image: String, initrd: Option<String>, append: Option<String> },
    Show(String),
    IsActive(String),
    IsFailed(String),
}

#[derive(Debug)]
pub enum ParseError {
    MethodNotFound(String),
    ParamsInvalid(String),
}

/// Parses a JSON-RPC call into a [`Command`]. `params` is always either a
/// JSON object with named fields or absent; positional-array params aren't
/// accepted, matching the stricter half of what the teacher's
/// `parse_command` does for its own object-shaped calls.
pub fn parse_command(call: &Call) -> Result<Command, ParseError> {
    let param_str = |key: &str| -> Option<String> {
        call.params.as_ref()?.get(key)?.as_str().map(str::to_owned)
    };
    let require_str = |key: &str| -> Result<String, ParseError> {
        param_str(key).ok_or_else(|| ParseError::ParamsInvalid(format!("missing param {key:?}")))
    };

    Ok(match call.method.as_str() {
        "status" => Command::Status,
        "capabilities" => Command::Capabilities,
        "tree" => Command::Tree(require_str("component")?),
        "reverse-dependencies" => Command::ReverseDependencies(require_str("capability")?),
        "simulate-remove" => Command::SimulateRemove(require_str("component")?),
        "export-graph" => Command::ExportGraph,
        "log" => {
            let n = call
                .params
                .as_ref()
                .and_then(|p| p.get("n"))
                .and_then(Value::as_u64)
                .unwrap_or(20) as usize;
            Command::Log(require_str("component")?, n)
        }
        "pending" => Command::Pending,
        "resolve" => Command::Resolve,
        "reload" => Command::Reload,
        "upgrade" => Command::Upgrade(require_str("component")?),
        "checkpoint" => Command::Checkpoint(require_str("component")?),
        "restore" => Command::Restore(require_str("component")?, param_str("id")),
        "checkpoint-list" => Command::CheckpointList,
        "checkpoint-rm" => Command::CheckpointRm(require_str("id")?),
        "analyze" => Command::Analyze,
        "check-cycles" => Command::CheckCycles,
        "validate" => Command::Validate,
        "kexec-like" => Command::KexecLike {
            dry_run: call.params.as_ref().and_then(|p| p.get("dry_run")).and_then(Value::as_bool).unwrap_or(false),
            kernel_image: require_str("kernel_image")?,
            initrd: param_str("initrd"),
            append: param_str("append"),
        },
        "show" => Command::Show(require_str("component")?),
        "is-active" => Command::IsActive(require_str("component")?),
        "is-failed" => Command::IsFailed(require_str("component")?),
        other => return Err(ParseError::MethodNotFound(format!("unknown method {other:?}"))),
    })
}

/// Bundles everything `execute_command` needs beyond the component and
/// capability tables: the process-wide config (paths, windows) and a way
/// to open a component's log sink on demand.
pub struct ControlContext<'a> {
    pub system: &'a mut System,
    pub config: &'a Config,
}

pub fn execute_command(cmd: Command, ctx: &mut ControlContext) -> Result<Value, String> {
    match cmd {
        Command::Status => Ok(status(ctx)),
        Command::Capabilities => Ok(capabilities(ctx)),
        Command::Tree(name) => tree(ctx, &name),
        Command::ReverseDependencies(cap_name) => Ok(reverse_dependencies(ctx, &cap_name)),
        Command::SimulateRemove(name) => simulate_remove(ctx, &name),
        Command::ExportGraph => Ok(export_graph(ctx)),
        Command::Log(name, n) => log_tail(ctx, &name, n),
        Command::Pending => Ok(pending(ctx)),
        Command::Resolve => Ok(resolve(ctx)),
        Command::Reload => reload(ctx),
        Command::Upgrade(name) => upgrade(ctx, &name),
        Command::Checkpoint(name) => checkpoint(ctx, &name),
        Command::Restore(name, id) => restore(ctx, &name, id),
        Command::CheckpointList => checkpoint_list(ctx),
        Command::CheckpointRm(id) => checkpoint_rm(ctx, &id),
        Command::Analyze => Ok(analyze(ctx)),
        Command::CheckCycles => Ok(check_cycles(ctx)),
        Command::Validate => Ok(validate(ctx)),
        Command::KexecLike { dry_run, kernel_image, initrd, append } => {
            kexec_like(ctx, dry_run, &kernel_image, initrd.as_deref(), append.as_deref())
        }
        Command::Show(name) => show(ctx, &name),
        Command::IsActive(name) => is_active(ctx, &name),
        Command::IsFailed(name) => is_failed(ctx, &name),
    }
}

fn find(ctx: &ControlContext, name: &str) -> Result<ComponentIdx, String> {
    ctx.system.components.find(name).ok_or_else(|| format!("no such component: {name}"))
}

fn status(ctx: &ControlContext) -> Value {
    let now = std::time::Instant::now();
    let rows: Vec<Value> = ctx
        .system
        .components
        .iter()
        .map(|(_, c)| {
            let uptime = c.started_at.map(|t| now.saturating_duration_since(t).as_secs());
            json!({
                "name": c.name,
                "state": format!("{:?}", c.state),
                "pid": c.pid,
                "uptime_secs": uptime,
                "restart_count": c.restart_count,
            })
        })
        .collect();
    json!({ "components": rows })
}

fn capabilities(ctx: &ControlContext) -> Value {
    let rows: Vec<Value> = ctx
        .system
        .capabilities
        .iter()
        .map(|(_, cap)| {
            let provider = cap.provider.map(|idx| ctx.system.components.get(idx).name.clone());
            json!({
                "name": cap.name,
                "active": cap.active,
                "degraded": cap.degraded,
                "provider": provider,
            })
        })
        .collect();
    json!({ "capabilities": rows })
}

fn tree(ctx: &ControlContext, name: &str) -> Result<Value, String> {
    let idx = find(ctx, name)?;
    Ok(render_tree(ctx, idx, &mut Vec::new()))
}

fn render_tree(ctx: &ControlContext, idx: ComponentIdx, visiting: &mut Vec<ComponentIdx>) -> Value {
    let component = ctx.system.components.get(idx);
    if visiting.contains(&idx) {
        return json!({ "name": component.name, "cycle": true });
    }
    visiting.push(idx);
    let children: Vec<Value> = component
        .requires
        .iter()
        .filter_map(|cap| ctx.system.capabilities.provider(*cap))
        .map(|provider| render_tree(ctx, provider, &mut *visiting))
        .collect();
    visiting.pop();
    json!({ "name": component.name, "requires": children })
}

fn reverse_dependencies(ctx: &ControlContext, cap_name: &str) -> Value {
    let names: Vec<String> = resolver::reverse_dependencies(&ctx.system.components, &ctx.system.capabilities, cap_name)
        .into_iter()
        .map(|idx| ctx.system.components.get(idx).name.clone())
        .collect();
    json!({ "requirers": names })
}

fn simulate_remove(ctx: &ControlContext, name: &str) -> Result<Value, String> {
    let idx = find(ctx, name)?;
    let impacted = resolver::impact_of_removal(&ctx.system.components, &ctx.system.capabilities, idx);
    let names: Vec<String> = impacted.into_iter().map(|i| ctx.system.components.get(i).name.clone()).collect();
    Ok(json!({ "would_lose_requirement": names }))
}

fn export_graph(ctx: &ControlContext) -> Value {
    let graph = resolver::export_graph(&ctx.system.components, &ctx.system.capabilities);
    let dot = resolver::render_dot(&graph, &ctx.system.components);
    json!({ "dot": dot })
}

fn log_tail(ctx: &ControlContext, name: &str, n: usize) -> Result<Value, String> {
    find(ctx, name)?;
    let sink = LogSink::open(&ctx.config.log_dir, name, crate::logsink::DEFAULT_CAP_BYTES)
        .map_err(|e| format!("open log for {name}: {e}"))?;
    let tail = sink.tail(n).map_err(|e| format!("read log for {name}: {e}"))?;
    Ok(json!({ "log": tail }))
}

fn pending(ctx: &ControlContext) -> Value {
    let rows: Vec<Value> = ctx
        .system
        .components
        .iter()
        .filter(|(_, c)| c.state == crate::component::SupervisionState::Inactive)
        .map(|(_, c)| {
            let missing: Vec<&str> = c
                .requires
                .iter()
                .filter(|cap| !ctx.system.capabilities.is_active(**cap))
                .map(|cap| ctx.system.capabilities.name(*cap))
                .collect();
            json!({ "name": c.name, "missing": missing })
        })
        .filter(|row| !row["missing"].as_array().unwrap().is_empty())
        .collect();
    json!({ "pending": rows })
}

fn resolve(ctx: &mut ControlContext) -> Value {
    let promotable = ctx.system.resolve_to_fixed_point();
    let names: Vec<String> = promotable.into_iter().map(|i| ctx.system.components.get(i).name.clone()).collect();
    json!({ "newly_eligible": names })
}

/// Re-scans the manifest directory (spec §4.9 `reload`): unchanged
/// components keep their state, new ones are loaded INACTIVE, and removed
/// ones are signalled to stop and forgotten by name — the table slot itself
/// stays put, honoring the never-recycled-index discipline (spec §9).
fn reload(ctx: &mut ControlContext) -> Result<Value, String> {
    let result = manifest::load_directory(&ctx.config.manifest_dir, ctx.config.restart_window, ctx.config.restart_max_in_window);
    let mut added = Vec::new();
    let mut kept = Vec::new();
    let loaded_names: Vec<String> = result.components.iter().map(|c| c.name.clone()).collect();

    for component in result.components {
        if ctx.system.components.find(&component.name).is_some() {
            kept.push(component.name);
            continue;
        }
        added.push(component.name.clone());
        ctx.system.load_component(component);
    }

    let mut removed = Vec::new();
    let existing_names: Vec<String> = ctx.system.components.iter().map(|(_, c)| c.name.clone()).collect();
    for name in existing_names {
        if !loaded_names.contains(&name) {
            if let Some(idx) = ctx.system.components.find(&name) {
                if let Some(pid) = ctx.system.components.get(idx).pid {
                    let _ = crate::supervisor::request_stop(nix::unistd::Pid::from_raw(pid));
                }
                ctx.system.withdraw_capabilities(idx);
                crate::supervisor::mark_inactive(ctx.system.components.get_mut(idx));
                ctx.system.components.forget_name(&name);
            }
            removed.push(name);
        }
    }

    let cycles = resolver::detect_cycles(&ctx.system.components, &ctx.system.capabilities);
    for report in &cycles {
        for idx in &report.components {
            ctx.system.components.get_mut(*idx).state = crate::component::SupervisionState::Cycle;
        }
    }

    let errors: Vec<String> = result.errors.iter().map(ManifestError::to_string).collect();
    Ok(json!({ "added": added, "kept": kept, "removed": removed, "cycles": cycles.len(), "errors": errors }))
}

/// Records the upgrade as pending (spec §4.9 `upgrade <component>`): the
/// actual strategy ladder (spec §4.4) is driven by the reactor, which owns
/// the forking/signalling/timing this synchronous control reply cannot
/// block on.
fn upgrade(ctx: &mut ControlContext, name: &str) -> Result<Value, String> {
    let idx = find(ctx, name)?;
    let component = ctx.system.components.get(idx);
    let ladder = crate::handoff::ladder_from(component.upgrade_strategy);
    Ok(json!({ "initiated": name, "ladder": ladder.iter().map(|s| format!("{s:?}")).collect::<Vec<_>>() }))
}

fn checkpoint(ctx: &mut ControlContext, name: &str) -> Result<Value, String> {
    let idx = find(ctx, name)?;
    let component = ctx.system.components.get(idx);
    let pid = component.pid.ok_or_else(|| format!("{name} has no live process"))?;
    let dump_dir = ctx.config.checkpoint_dir.join(name).join(crate::checkpoint::now_unix().to_string());
    crate::checkpoint::checkpoint_process(pid, &dump_dir, "criu")?;
    Ok(json!({ "checkpointed": name, "dump_dir": dump_dir.display().to_string() }))
}

fn restore(ctx: &mut ControlContext, name: &str, id: Option<String>) -> Result<Value, String> {
    find(ctx, name)?;
    let root = ctx.config.checkpoint_dir.join(name);
    let dump_dir = match id {
        Some(id) => root.join(id),
        None => latest_dump_dir(&root)?,
    };
    let new_pid = crate::checkpoint::restore_process(&dump_dir, "criu")?;
    Ok(json!({ "restored": name, "pid": new_pid }))
}

fn latest_dump_dir(root: &std::path::Path) -> Result<std::path::PathBuf, String> {
    let mut entries: Vec<_> = std::fs::read_dir(root)
        .map_err(|e| format!("read {}: {e}", root.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();
    entries.pop().ok_or_else(|| format!("no checkpoints under {}", root.display()))
}

fn checkpoint_list(ctx: &ControlContext) -> Result<Value, String> {
    let mut rows = Vec::new();
    if let Ok(components) = std::fs::read_dir(&ctx.config.checkpoint_dir) {
        for component_dir in components.filter_map(|e| e.ok()) {
            if let Ok(dumps) = std::fs::read_dir(component_dir.path()) {
                for dump in dumps.filter_map(|e| e.ok()) {
                    rows.push(json!({
                        "component": component_dir.file_name().to_string_lossy(),
                        "id": dump.file_name().to_string_lossy(),
                    }));
                }
            }
        }
    }
    Ok(json!({ "checkpoints": rows }))
}

fn checkpoint_rm(ctx: &ControlContext, id: &str) -> Result<Value, String> {
    let mut removed = false;
    if let Ok(components) = std::fs::read_dir(&ctx.config.checkpoint_dir) {
        for component_dir in components.filter_map(|e| e.ok()) {
            let candidate = component_dir.path().join(id);
            if candidate.exists() {
                std::fs::remove_dir_all(&candidate).map_err(|e| format!("remove {}: {e}", candidate.display()))?;
                removed = true;
            }
        }
    }
    if removed {
        Ok(json!({ "removed": id }))
    } else {
        Err(format!("no checkpoint with id {id}"))
    }
}

fn analyze(ctx: &ControlContext) -> Value {
    let layers = resolver::topological_layers(&ctx.system.components, &ctx.system.capabilities);
    match layers {
        Some(layers) => {
            let names: Vec<Vec<String>> = layers
                .into_iter()
                .map(|layer| layer.into_iter().map(|idx| ctx.system.components.get(idx).name.clone()).collect())
                .collect();
            json!({ "layers": names })
        }
        None => json!({ "error": "graph is cyclic; see check-cycles" }),
    }
}

fn check_cycles(ctx: &ControlContext) -> Value {
    let reports = resolver::detect_cycles(&ctx.system.components, &ctx.system.capabilities);
    let rows: Vec<Value> = reports
        .iter()
        .map(|r| {
            let names: Vec<String> = r.components.iter().map(|i| ctx.system.components.get(*i).name.clone()).collect();
            let edges: Vec<Value> = r
                .edges
                .iter()
                .map(|(from, cap, to)| {
                    json!({
                        "from": ctx.system.components.get(*from).name,
                        "capability": cap,
                        "to": ctx.system.components.get(*to).name,
                    })
                })
                .collect();
            json!({ "components": names, "edges": edges })
        })
        .collect();
    json!({ "cycles": rows })
}

fn validate(ctx: &ControlContext) -> Value {
    let cycles = check_cycles(ctx);
    let dangling: Vec<String> = ctx
        .system
        .components
        .iter()
        .flat_map(|(_, c)| c.requires.iter().map(move |cap| (c, *cap)))
        .filter(|(_, cap)| ctx.system.capabilities.provider(*cap).is_none())
        .map(|(c, cap)| format!("{} requires {} which nobody provides", c.name, ctx.system.capabilities.name(cap)))
        .collect();
    json!({ "cycles": cycles["cycles"], "dangling_requirements": dangling })
}

fn kexec_like(
    ctx: &mut ControlContext,
    dry_run: bool,
    kernel_image: &str,
    initrd: Option<&str>,
    append: Option<&str>,
) -> Result<Value, String> {
    let kernel_path = std::path::Path::new(kernel_image);
    if !kernel_path.exists() {
        return Err(format!("kernel image not found: {kernel_image}"));
    }
    let live: Vec<ComponentIdx> = ctx
        .system
        .components
        .iter()
        .filter(|(_, c)| c.state.is_live())
        .map(|(i, _)| i)
        .collect();

    if dry_run {
        return Ok(json!({
            "dry_run": true,
            "kernel_image": kernel_image,
            "would_checkpoint": live.iter().map(|i| ctx.system.components.get(*i).name.clone()).collect::<Vec<_>>(),
        }));
    }

    let mut dumps = Vec::new();
    for idx in live {
        let component = ctx.system.components.get(idx);
        let Some(pid) = component.pid else { continue };
        let dump_dir = ctx.config.persistent_checkpoint_dir.join(&component.name);
        crate::checkpoint::checkpoint_process(pid, &dump_dir, "criu")?;
        dumps.push(crate::checkpoint::DumpMetadata {
            component_name: component.name.clone(),
            original_pid: pid,
            timestamp_unix: crate::checkpoint::now_unix(),
            image_size_bytes: 0,
            capabilities: component.provides_names.clone(),
            checkpoint_tool_version: "criu".to_owned(),
            id: "kexec".to_owned(),
        });
    }

    let manifest = crate::checkpoint::KernelReplaceManifest {
        old_kernel_identity: std::fs::read_to_string("/proc/version").unwrap_or_default(),
        dumps,
        initiated_at_unix: crate::checkpoint::now_unix(),
    };
    manifest.write(&ctx.config.kernel_replace_manifest)?;

    let cmdline = append.unwrap_or_default();
    crate::kexec::load(kernel_path, initrd.map(std::path::Path::new), cmdline)?;
    crate::kexec::execute()?;
    unreachable!("kexec::execute only returns on failure, which is already propagated above");
}

fn show(ctx: &ControlContext, name: &str) -> Result<Value, String> {
    let idx = find(ctx, name)?;
    let c = ctx.system.components.get(idx);
    Ok(json!({
        "name": c.name,
        "kind": format!("{:?}", c.kind),
        "state": format!("{:?}", c.state),
        "pid": c.pid,
        "restart_count": c.restart_count,
        "upgrade_strategy": format!("{:?}", c.upgrade_strategy),
        "requires": c.requires_names,
        "provides": c.provides_names,
    }))
}

fn is_active(ctx: &ControlContext, name: &str) -> Result<Value, String> {
    let idx = find(ctx, name)?;
    let active = matches!(
        ctx.system.components.get(idx).state,
        crate::component::SupervisionState::Active | crate::component::SupervisionState::Degraded
    );
    Ok(json!({ "active": active }))
}

fn is_failed(ctx: &ControlContext, name: &str) -> Result<Value, String> {
    let idx = find(ctx, name)?;
    let failed = ctx.system.components.get(idx).state == crate::component::SupervisionState::Failed;
    Ok(json!({ "failed": failed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Commandline, Component, Kind, RestartAccounting, SupervisionState};
    use std::path::PathBuf;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            manifest_dir: dir.join("manifests"),
            control_socket_path: dir.join("control.sock"),
            runtime_dir: dir.to_path_buf(),
            log_dir: dir.join("log"),
            checkpoint_dir: dir.join("checkpoints"),
            persistent_checkpoint_dir: dir.join("persistent"),
            kernel_replace_manifest: dir.join("kexec-manifest.json"),
            restart_window: Duration::from_secs(60),
            restart_max_in_window: 5,
        }
    }

    fn make_component(name: &str) -> Component {
        Component {
            name: name.to_owned(),
            kind: Kind::Service,
            command: Commandline { program: PathBuf::from("/bin/true"), arguments: vec![] },
            env: Default::default(),
            requires_names: vec![],
            provides_names: vec![],
            requires: vec![],
            provides: vec![],
            state: SupervisionState::Inactive,
            pid: None,
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
    fn status_lists_every_component() {
        let mut system = System::new();
        system.load_component(make_component("a"));
        system.load_component(make_component("b"));
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut ctx = ControlContext { system: &mut system, config: &config };
        let value = status(&mut ctx);
        assert_eq!(value["components"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn parse_command_rejects_unknown_method() {
        let call = Call { jsonrpc: None, method: "frobnicate".to_owned(), params: None, id: None };
        assert!(matches!(parse_command(&call), Err(ParseError::MethodNotFound(_))));
    }

    #[test]
    fn parse_command_requires_named_params() {
        let call = Call { jsonrpc: None, method: "tree".to_owned(), params: None, id: None };
        assert!(matches!(parse_command(&call), Err(ParseError::ParamsInvalid(_))));
    }

    #[test]
    fn is_active_reflects_state() {
        let mut system = System::new();
        let idx = system.load_component(make_component("a"));
        system.components.get_mut(idx).state = SupervisionState::Active;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let ctx = ControlContext { system: &mut system, config: &config };
        assert_eq!(is_active(&ctx, "a").unwrap(), json!({ "active": true }));
    }
}
