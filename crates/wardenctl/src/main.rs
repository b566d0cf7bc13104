//! wardenctl — CLI control client for the warden process supervisor.
//!
//! Packs a subcommand into the JSON-RPC 2.0 envelope (spec §4.9) and sends
//! it over the control socket, grounded in the teacher's `systemctl`: same
//! "one call in, one response out, pretty-print the result" shape, same
//! special-cased exit codes for `is-active`/`is-failed`. Unlike systemctl's
//! hand-rolled flag stripping (inherited from decades of real systemd CLI
//! surface), warden's command set is small and fixed, so `clap::Parser`
//! drives it directly instead.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(name = "wardenctl", about = "Control client for the warden process supervisor", version)]
struct Cli {
    /// Control socket path. Defaults to warden's standard runtime location.
    #[arg(long, global = true, default_value = "/run/warden/control.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every component and its current state.
    Status,
    /// List every capability and its provider.
    Capabilities,
    /// Show a component's dependency tree.
    Tree { component: String },
    /// List components that directly require a capability.
    ReverseDependencies { capability: String },
    /// Show what would lose a requirement if a component were removed.
    SimulateRemove { component: String },
    /// Export the capability graph in DOT form.
    ExportGraph,
    /// Tail a component's captured stdout/stderr.
    Log {
        component: String,
        #[arg(default_value_t = 20)]
        lines: usize,
    },
    /// List components blocked on a missing requirement.
    Pending,
    /// Force one resolver pass and report newly-eligible components.
    Resolve,
    /// Re-scan the manifest directory.
    Reload,
    /// Attempt a zero-downtime upgrade of a component.
    Upgrade { component: String },
    /// Checkpoint a running component.
    Checkpoint { component: String },
    /// Restore a component from a checkpoint.
    Restore {
        component: String,
        #[arg(long)]
        id: Option<String>,
    },
    /// List available checkpoints.
    CheckpointList,
    /// Remove a checkpoint by id.
    CheckpointRm { id: String },
    /// Print the topological layering of the dependency graph.
    Analyze,
    /// Report any dependency cycles.
    CheckCycles,
    /// Report cycles and dangling requirements.
    Validate,
    /// Check whether a component is active (exit 0) or not (exit 3).
    IsActive { component: String },
    /// Check whether a component is in the failed state.
    IsFailed { component: String },
    /// Show a component's full record.
    Show { component: String },
}

fn main() {
    let cli = Cli::parse();
    let (method, params) = to_call(&cli.command);

    let call = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 1 });
    let payload = serde_json::to_string(&call).expect("Call always serializes");

    match send(&cli.socket, &payload) {
        Ok(response) => handle_response(method, &response),
        Err(e) => {
            eprintln!("Error communicating with warden: {e}");
            if method == "is-active" {
                println!("inactive");
                process::exit(3);
            }
            process::exit(1);
        }
    }
}

fn to_call(command: &Command) -> (&'static str, Option<Value>) {
    match command {
        Command::Status => ("status", None),
        Command::Capabilities => ("capabilities", None),
        Command::Tree { component } => ("tree", Some(json!({ "component": component }))),
        Command::ReverseDependencies { capability } => {
            ("reverse-dependencies", Some(json!({ "capability": capability })))
        }
        Command::SimulateRemove { component } => {
            ("simulate-remove", Some(json!({ "component": component })))
        }
        Command::ExportGraph => ("export-graph", None),
        Command::Log { component, lines } => {
            ("log", Some(json!({ "component": component, "n": lines })))
        }
        Command::Pending => ("pending", None),
        Command::Resolve => ("resolve", None),
        Command::Reload => ("reload", None),
        Command::Upgrade { component } => ("upgrade", Some(json!({ "component": component }))),
        Command::Checkpoint { component } => ("checkpoint", Some(json!({ "component": component }))),
        Command::Restore { component, id } => {
            ("restore", Some(json!({ "component": component, "id": id })))
        }
        Command::CheckpointList => ("checkpoint-list", None),
        Command::CheckpointRm { id } => ("checkpoint-rm", Some(json!({ "id": id }))),
        Command::Analyze => ("analyze", None),
        Command::CheckCycles => ("check-cycles", None),
        Command::Validate => ("validate", None),
        Command::IsActive { component } => ("is-active", Some(json!({ "component": component }))),
        Command::IsFailed { component } => ("is-failed", Some(json!({ "component": component }))),
        Command::Show { component } => ("show", Some(json!({ "component": component }))),
    }
}

fn send(socket: &std::path::Path, payload: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let mut stream = UnixStream::connect(socket)?;
    stream.write_all(payload.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.shutdown(std::net::Shutdown::Write)?;
    let response: Value = serde_json::from_reader(&mut stream)?;
    Ok(response)
}

fn handle_response(method: &str, response: &Value) {
    if let Some(error) = response.get("error") {
        let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        match method {
            "is-active" => {
                println!("inactive");
                process::exit(3);
            }
            "is-failed" => {
                println!("inactive");
                process::exit(1);
            }
            _ => {
                eprintln!("{message}");
                process::exit(1);
            }
        }
    }

    let Some(result) = response.get("result") else { return };

    match method {
        "is-active" => {
            let active = result.get("active").and_then(Value::as_bool).unwrap_or(false);
            println!("{}", if active { "active" } else { "inactive" });
            process::exit(if active { 0 } else { 3 });
        }
        "is-failed" => {
            let failed = result.get("failed").and_then(Value::as_bool).unwrap_or(false);
            println!("{}", if failed { "failed" } else { "inactive" });
            process::exit(if failed { 0 } else { 1 });
        }
        "log" => {
            if let Some(text) = result.get("log").and_then(Value::as_str) {
                println!("{text}");
            }
        }
        "export-graph" => {
            if let Some(dot) = result.get("dot").and_then(Value::as_str) {
                print!("{dot}");
            }
        }
        _ => println!("{}", serde_json::to_string_pretty(result).unwrap()),
    }
}
