//! The isolation sink (spec §2 C8, §4.7).
//!
//! Invoked by the supervisor after fork, before exec, in the child. All of
//! this runs strictly between `fork()` and `execv()`, so (like the
//! teacher's `fork_child.rs`) it must avoid anything that isn't
//! async-signal-safe: no heap-allocating logger, no locks.

use crate::component::{IsolationProfile, Namespace};
use std::io::Write;

/// Applies the isolation profile in the child, in the order spec §4.7
/// lists: cgroup membership, resource ceilings, namespaces, hostname/root,
/// private tmpfs. Returns an error message (not an `Err` with `?` chains,
/// since this runs in a forked child where unwinding across the fork is
/// unsafe) that the caller writes to stderr and exits on.
pub fn apply_in_child(profile: &IsolationProfile, cgroup_path: Option<&std::path::Path>) -> Result<(), String> {
    if let Some(cgroup_path) = cgroup_path {
        join_cgroup(cgroup_path)?;
        apply_resource_limits(cgroup_path, profile)?;
    }

    for ns in &profile.namespaces {
        enter_namespace(*ns)?;
    }

    if let Some(hostname) = &profile.hostname {
        set_hostname(hostname)?;
    }

    if let Some(root) = &profile.root {
        pivot_root(root)?;
    }

    if profile.namespaces.contains(&Namespace::Mount) {
        mount_private_tmp()?;
    }

    Ok(())
}

fn join_cgroup(cgroup_path: &std::path::Path) -> Result<(), String> {
    std::fs::create_dir_all(cgroup_path).map_err(|e| format!("create cgroup dir: {e}"))?;
    let pid = std::process::id();
    write_cgroup_file(&cgroup_path.join("cgroup.procs"), &pid.to_string())
}

fn apply_resource_limits(cgroup_path: &std::path::Path, profile: &IsolationProfile) -> Result<(), String> {
    let limits = &profile.resources;
    if let Some(max) = limits.memory_max {
        write_cgroup_file(&cgroup_path.join("memory.max"), &max.to_string())?;
    }
    if let Some(high) = limits.memory_high {
        write_cgroup_file(&cgroup_path.join("memory.high"), &high.to_string())?;
    }
    if let Some(weight) = limits.cpu_weight {
        write_cgroup_file(&cgroup_path.join("cpu.weight"), &weight.to_string())?;
    }
    if let Some(quota_fraction) = limits.cpu_max {
        // cpu.max is "<quota> <period>"; period is conventionally 100000us.
        let period = 100_000u64;
        let quota = (quota_fraction * period as f64) as u64;
        write_cgroup_file(&cgroup_path.join("cpu.max"), &format!("{quota} {period}"))?;
    }
    if let Some(weight) = limits.io_weight {
        write_cgroup_file(&cgroup_path.join("io.weight"), &format!("default {weight}"))?;
    }
    if let Some(max) = limits.pids_max {
        write_cgroup_file(&cgroup_path.join("pids.max"), &max.to_string())?;
    }
    Ok(())
}

fn write_cgroup_file(path: &std::path::Path, value: &str) -> Result<(), String> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| format!("open {}: {e}", path.display()))?;
    file.write_all(value.as_bytes()).map_err(|e| format!("write {}: {e}", path.display()))
}

fn enter_namespace(ns: Namespace) -> Result<(), String> {
    let flags = match ns {
        Namespace::Mount => libc::CLONE_NEWNS,
        Namespace::Pid => libc::CLONE_NEWPID,
        Namespace::Net => libc::CLONE_NEWNET,
        Namespace::Uts => libc::CLONE_NEWUTS,
        Namespace::Ipc => libc::CLONE_NEWIPC,
        Namespace::User => libc::CLONE_NEWUSER,
    };
    let rc = unsafe { libc::unshare(flags) };
    if rc != 0 {
        return Err(format!("unshare({ns:?}) failed: errno {}", std::io::Error::last_os_error()));
    }
    Ok(())
}

fn set_hostname(hostname: &str) -> Result<(), String> {
    nix::unistd::sethostname(hostname).map_err(|e| format!("sethostname: {e}"))
}

fn pivot_root(new_root: &std::path::Path) -> Result<(), String> {
    // A full pivot_root requires the new root to already be a mount point
    // and the old root to be lazily unmounted; isolation.root is treated
    // here as a chroot-equivalent boundary, matching what's achievable
    // without the surrounding mount-namespace plumbing spec.md explicitly
    // places out of scope (§1 "Out of scope: ... cgroup and namespace setup
    // [specified only at the interface the core consumes]").
    nix::unistd::chroot(new_root).map_err(|e| format!("chroot {}: {e}", new_root.display()))?;
    std::env::set_current_dir("/").map_err(|e| format!("chdir after chroot: {e}"))
}

fn mount_private_tmp() -> Result<(), String> {
    use nix::mount::{mount, MsFlags};
    mount(
        Some("tmpfs"),
        "/tmp",
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| format!("mount private /tmp: {e}"))
}
