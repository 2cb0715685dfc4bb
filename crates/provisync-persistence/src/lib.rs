//! ---
//! ps_section: "03-persistence-logging"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "History store: run log, archived artifacts, shaper baseline."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
#![warn(missing_docs)]
//! Append-only audit history for provisioning runs.

use std::path::PathBuf;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing history files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A run was handed to the run log before it reached a definitive outcome.
    #[error("run {0} has no definitive outcome")]
    IncompleteRun(uuid::Uuid),
    /// No free archive name could be found for an artifact.
    #[error("no free archive slot for {0}")]
    ArchiveExhausted(PathBuf),
}

pub mod archive;
pub mod baseline;
pub mod run;
pub mod run_log;

pub use archive::{ArchivedArtifact, HistoryStore, ARCHIVE_STAMP_FORMAT};
pub use baseline::ShaperBaseline;
pub use run::{ChangeCounts, ProvisioningRun, RunOutcome, TaskKind};
pub use run_log::{RunLogEntry, RunLogReader, RunLogWriter};
