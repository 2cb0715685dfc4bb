//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Reconciliation error taxonomy."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::path::PathBuf;

use provisync_persistence::PersistenceError;
use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Every way a reconciliation task can stop.
///
/// `MalformedInstruction` is only ever logged and counted; stages recover from
/// it locally. Every other variant aborts the current task.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("configuration missing: {0}")]
    ConfigMissing(String),
    #[error("credential missing: {0}")]
    CredentialMissing(String),
    #[error("connection to {target} failed: {detail}")]
    ConnectionFailure { target: String, detail: String },
    #[error("device snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
    #[error("refusing to merge into {output}: {reason}")]
    UnsafeOverwrite { output: PathBuf, reason: String },
    #[error("malformed instruction at {location}: {reason}")]
    MalformedInstruction { location: String, reason: String },
    #[error("apply step '{step}' failed: {detail}")]
    ApplyFailure { step: String, detail: String },
    #[error("interrupted before {0}")]
    Interrupted(String),
    #[error("another run holds the lock at {0}")]
    AlreadyRunning(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history store error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl ReconcileError {
    /// Stable snake-case label logged as `error_kind` and stored in the run log.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::ConfigMissing(_) => "config_missing",
            ReconcileError::CredentialMissing(_) => "credential_missing",
            ReconcileError::ConnectionFailure { .. } => "connection_failure",
            ReconcileError::SnapshotUnavailable(_) => "snapshot_unavailable",
            ReconcileError::UnsafeOverwrite { .. } => "unsafe_overwrite",
            ReconcileError::MalformedInstruction { .. } => "malformed_instruction",
            ReconcileError::ApplyFailure { .. } => "apply_failure",
            ReconcileError::Interrupted(_) => "interrupted",
            ReconcileError::AlreadyRunning(_) => "already_running",
            ReconcileError::Io(_) => "io",
            ReconcileError::Persistence(_) => "persistence",
        }
    }

    pub(crate) fn connection(target: &str, detail: impl Into<String>) -> Self {
        ReconcileError::ConnectionFailure {
            target: target.to_owned(),
            detail: detail.into(),
        }
    }

    /// Re-label a collaborator failure raised while pushing a changeset.
    ///
    /// Missing configuration, credentials and interrupts keep their own kind.
    pub(crate) fn during_apply(self, step: &str) -> Self {
        match self {
            err @ (ReconcileError::ConfigMissing(_)
            | ReconcileError::CredentialMissing(_)
            | ReconcileError::Interrupted(_)
            | ReconcileError::ApplyFailure { .. }) => err,
            other => ReconcileError::ApplyFailure {
                step: step.to_owned(),
                detail: other.to_string(),
            },
        }
    }
}
