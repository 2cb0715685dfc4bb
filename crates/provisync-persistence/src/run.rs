//! ---
//! ps_section: "03-persistence-logging"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "History store: run log, archived artifacts, shaper baseline."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two reconciliation tasks the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Subscriber flow entries, reconciled by line diff.
    Subscriber,
    /// Traffic-manager shaping block, reconciled wholesale.
    Shaper,
}

impl TaskKind {
    /// Stable lowercase name used in paths, archive names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Subscriber => "subscriber",
            TaskKind::Shaper => "shaper",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definitive result of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Desired and deployed state already agreed.
    Skipped,
    /// A changeset was pushed to the device.
    Applied,
    /// The task aborted before completing.
    Failed,
}

/// Number of lines added to and removed from the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    /// Lines (or blocks) pushed.
    pub added: usize,
    /// Lines withdrawn.
    pub removed: usize,
}

/// One invocation of a reconciliation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningRun {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Which task ran.
    pub task: TaskKind,
    /// When the task started.
    pub started_at: DateTime<Utc>,
    /// When the task reached its outcome.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcome, unset while the task is still running.
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
    /// Archived artifacts in the order they were written.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// Size of the applied changeset.
    #[serde(default)]
    pub changes: ChangeCounts,
    /// Error taxonomy label for failed runs.
    #[serde(default)]
    pub error_kind: Option<String>,
    /// Human-readable failure description.
    #[serde(default)]
    pub error: Option<String>,
}

impl ProvisioningRun {
    /// Begin a new run for `task`.
    pub fn start(task: TaskKind) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            task,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            artifacts: Vec::new(),
            changes: ChangeCounts::default(),
            error_kind: None,
            error: None,
        }
    }

    /// Remember an archived artifact.
    pub fn add_artifact(&mut self, path: PathBuf) {
        self.artifacts.push(path);
    }

    /// Finalize with a non-failure outcome.
    pub fn finish(&mut self, outcome: RunOutcome) {
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }

    /// Finalize as failed.
    pub fn fail(&mut self, kind: &str, message: impl Into<String>) {
        self.error_kind = Some(kind.to_owned());
        self.error = Some(message.into());
        self.finish(RunOutcome::Failed);
    }

    /// Whether the run has a definitive outcome and may be persisted.
    pub fn is_final(&self) -> bool {
        self.outcome.is_some()
    }
}
