//! Core library for the capability-driven process supervisor (spec §2).
//!
//! Binaries built on this crate: `wardend` (the primordial process),
//! `wardenctl` (the control client), and `warden-notify` (the readiness-
//! signaling helper a supervised process execs to report `signal`
//! readiness, mirroring the teacher's split between `libsystemd` and its
//! thin `sd-notify`-equivalent callers).

pub mod capability;
pub mod checkpoint;
pub mod component;
pub mod config;
pub mod control;
pub mod errors;
pub mod fd_passing;
pub mod handoff;
pub mod health;
pub mod isolation;
pub mod kexec;
pub mod logging;
pub mod logsink;
pub mod manifest;
pub mod reactor;
pub mod readiness;
pub mod resolver;
pub mod runtime;
pub mod supervisor;
