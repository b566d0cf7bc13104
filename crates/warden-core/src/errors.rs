//! Error types, grounded in the teacher's convention of small `enum`s with
//! `Display` impls rather than a single boxed error type (see
//! `UnitOperationError` in the teacher's `units/unit.rs`).

use std::fmt;

/// The reason a component operation (start/stop/restart) failed, attached
/// to the component and capability it affected.
#[derive(Debug, Clone)]
pub struct ComponentOperationError {
    pub component_name: String,
    pub reason: OperationErrorReason,
}

#[derive(Debug, Clone)]
pub enum OperationErrorReason {
    ExecFailed(String),
    ForkFailed(String),
    ReadinessTimeout,
    HealthProbeFailed(String),
    IsolationFailed(String),
    HandoffFailed(String),
    CheckpointFailed(String),
}

impl fmt::Display for OperationErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecFailed(e) => write!(f, "exec failed: {e}"),
            Self::ForkFailed(e) => write!(f, "fork failed: {e}"),
            Self::ReadinessTimeout => write!(f, "readiness timeout elapsed"),
            Self::HealthProbeFailed(e) => write!(f, "health probe failed: {e}"),
            Self::IsolationFailed(e) => write!(f, "isolation setup failed: {e}"),
            Self::HandoffFailed(e) => write!(f, "handoff failed: {e}"),
            Self::CheckpointFailed(e) => write!(f, "checkpoint/restore failed: {e}"),
        }
    }
}

impl fmt::Display for ComponentOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.component_name, self.reason)
    }
}

impl std::error::Error for ComponentOperationError {}

/// A manifest that failed structural validation. Collected by the loader
/// and logged, never fatal to the load of other manifests (spec §4.1).
#[derive(Debug, Clone)]
pub struct ManifestError {
    pub path: std::path::PathBuf,
    pub reason: String,
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}
