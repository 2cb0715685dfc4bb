//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Cooperative cancellation shared between the CLI and the pipeline."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ReconcileError, Result};

/// Shared stop flag. The pipeline polls it between stages and before each
/// device mutation, so an interrupt lands on a step boundary and the failed
/// run still gets recorded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` once a stop was requested.
    pub fn checkpoint(&self, stage: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(ReconcileError::Interrupted(stage.to_owned()));
        }
        Ok(())
    }
}
