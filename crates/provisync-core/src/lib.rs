//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Primary orchestration and lifecycle management."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
//! Reconciliation engine: merge instruction data, render it in device syntax,
//! diff it against observed state and push the minimal change under a
//! single-instance lock.

pub mod apply;
pub mod cancel;
pub mod coordinator;
pub mod diff;
pub mod error;
pub mod instruction;
pub mod lock;
pub mod merge;
pub mod remote;
pub mod state;
pub mod transform;

pub use apply::ReconcileApplier;
pub use cancel::CancelToken;
pub use coordinator::{RunCoordinator, RunPhase, RunSummary, TaskPlan, TaskSelection};
pub use diff::{diff_lines, diff_shaper, Changeset, ShaperDecision};
pub use error::{ReconcileError, Result};
pub use instruction::{InstructionCategory, InstructionRecord};
pub use lock::RunLock;
pub use merge::{InstructionMerger, MergeReport};
pub use remote::{Collaborators, ConfigApplier, InstructionSource, RemoteExec, RemoteTransfer, TransferDirection};
pub use state::StateSnapshot;
pub use transform::{FormatTransformer, ShaperRenderer, ShaperSnapshot, TransformReport};
