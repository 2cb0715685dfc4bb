//! ---
//! ps_section: "03-persistence-logging"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Structured logging adapters and sinks."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
#![warn(missing_docs)]
//! Run-scoped structured logging helpers layered on top of `tracing`.

pub mod macros;

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogContext<'a> {
    /// Device (target) identifier the event concerns.
    pub device: Option<&'a str>,
    /// Reconciliation task (`subscriber` or `shaper`).
    pub task: Option<&'a str>,
    /// Identifier of the provisioning run.
    pub run_id: Option<&'a str>,
    /// Pipeline stage (fetch, merge, transform, snapshot, diff, apply).
    pub stage: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device identifier.
    pub fn with_device(mut self, device: &'a str) -> Self {
        self.device = Some(device);
        self
    }

    /// Attach a task name.
    pub fn with_task(mut self, task: &'a str) -> Self {
        self.task = Some(task);
        self
    }

    /// Attach a run identifier.
    pub fn with_run_id(mut self, run_id: &'a str) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Attach a pipeline stage.
    pub fn with_stage(mut self, stage: &'a str) -> Self {
        self.stage = Some(stage);
        self
    }
}

/// Definitive outcome reported when a reconciliation task finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEventOutcome {
    /// Nothing needed to change on the device.
    Skipped,
    /// A changeset was applied.
    Applied,
    /// The task aborted; carries the error taxonomy label.
    Failed(&'static str),
}

impl RunEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RunEventOutcome::Skipped => "skipped",
            RunEventOutcome::Applied => "applied",
            RunEventOutcome::Failed(_) => "failed",
        }
    }
}

/// Emit a standardized end-of-task event.
///
/// Failures are logged at `ERROR` so they land in the error channel.
pub fn log_run_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: RunEventOutcome,
) {
    let ctx = context.copied().unwrap_or_default();
    match outcome {
        RunEventOutcome::Failed(kind) => tracing::error!(
            event,
            outcome = outcome.as_str(),
            error_kind = kind,
            device = ctx.device.unwrap_or(""),
            task = ctx.task.unwrap_or(""),
            run_id = ctx.run_id.unwrap_or(""),
            message = %message
        ),
        _ => tracing::info!(
            event,
            outcome = outcome.as_str(),
            device = ctx.device.unwrap_or(""),
            task = ctx.task.unwrap_or(""),
            run_id = ctx.run_id.unwrap_or(""),
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(body: impl FnOnce()) -> String {
        let sink = Captured::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, body);
        let bytes = sink.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn macros_stamp_context_fields() {
        let output = capture(|| {
            let ctx = LogContext::new()
                .with_device("edge-router-01")
                .with_task("shaper");
            ps_info!(context = ctx, "snapshot rendered");
            ps_debug!("debug message");
            ps_warn!(context = ctx.with_stage("transform"), "{} records skipped", 2);
            ps_error!(context = ctx, "apply failed: {}", "timeout");
        });
        assert!(output.contains("snapshot rendered"));
        assert!(output.contains("edge-router-01"));
        assert!(output.contains("2 records skipped"));
        assert!(output.contains("transform"));
        assert!(output.contains("apply failed: timeout"));
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(RunEventOutcome::Skipped.as_str(), "skipped");
        assert_eq!(RunEventOutcome::Applied.as_str(), "applied");
        assert_eq!(RunEventOutcome::Failed("apply_failure").as_str(), "failed");
    }

    #[test]
    fn failed_run_event_is_an_error_with_kind() {
        let output = capture(|| {
            let ctx = LogContext::new().with_task("subscriber").with_run_id("r-1");
            log_run_event(
                Some(&ctx),
                "task.finished",
                "changeset applied",
                RunEventOutcome::Applied,
            );
            log_run_event(
                None,
                "task.finished",
                "snapshot missing",
                RunEventOutcome::Failed("snapshot_unavailable"),
            );
        });
        let failed = output
            .lines()
            .find(|line| line.contains("snapshot missing"))
            .unwrap();
        assert!(failed.contains("ERROR"));
        assert!(failed.contains("snapshot_unavailable"));
        assert!(output.contains("r-1"));
    }
}
