//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Changeset application against the device."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use provisync_common::{render_command, ShaperTaskConfig, SubscriberTaskConfig, TargetConfig};
use provisync_logging::{ps_debug, ps_info, LogContext};
use provisync_persistence::{HistoryStore, ProvisioningRun, TaskKind};

use crate::cancel::CancelToken;
use crate::diff::Changeset;
use crate::error::Result;
use crate::remote::{Collaborators, TransferDirection};
use crate::transform::ShaperSnapshot;

/// Patch carrying the flow lines to withdraw.
pub const REMOVE_PATCH: &str = "remove_flows.txt";
/// Patch carrying the flow lines to push.
pub const ADD_PATCH: &str = "add_flows.txt";

/// Executes a changeset against one target, archiving what it sends.
///
/// Every step aborts the branch on failure. The shaper baseline only moves
/// once the commit has been acknowledged. A cancellation is honoured before
/// each device mutation, never between a commit and the baseline save.
pub struct ReconcileApplier<'a> {
    collaborators: &'a Collaborators,
    history: &'a HistoryStore,
    target_id: &'a str,
    target: &'a TargetConfig,
    task_dir: PathBuf,
    ctx: LogContext<'a>,
    cancel: CancelToken,
}

impl<'a> ReconcileApplier<'a> {
    pub fn new(
        collaborators: &'a Collaborators,
        history: &'a HistoryStore,
        target_id: &'a str,
        target: &'a TargetConfig,
        task_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            collaborators,
            history,
            target_id,
            target,
            task_dir: task_dir.into(),
            ctx: LogContext::new().with_device(target_id).with_stage("apply"),
            cancel: CancelToken::new(),
        }
    }

    /// Attach run context to the applier's log events.
    pub fn with_context(mut self, ctx: LogContext<'a>) -> Self {
        self.ctx = ctx.with_device(self.target_id).with_stage("apply");
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Removal branch first, then addition. No commit follows: flow entries
    /// take effect on the device as soon as the file is processed.
    pub fn apply_subscriber(
        &self,
        config: &SubscriberTaskConfig,
        changes: &Changeset,
        run: &mut ProvisioningRun,
    ) -> Result<()> {
        self.push_patch("remove", REMOVE_PATCH, &changes.to_remove, &config.remove_command, run)?;
        self.push_patch("add", ADD_PATCH, &changes.to_add, &config.add_command, run)?;
        run.changes = changes.counts();
        Ok(())
    }

    fn push_patch(
        &self,
        action: &str,
        file_name: &str,
        lines: &[String],
        command_template: &str,
        run: &mut ProvisioningRun,
    ) -> Result<()> {
        if lines.is_empty() {
            ps_debug!(context = self.ctx, "no lines to {}; branch skipped", action);
            return Ok(());
        }
        self.cancel.checkpoint(action)?;
        let patch = self.task_dir.join(file_name);
        write_lines(&patch, lines)?;
        self.upload(&patch)?;

        let command = render_command(command_template, &self.target.remote_path(file_name));
        let sink = self.sink(action);
        self.collaborators
            .exec
            .exec(self.target_id, &command, Some(&sink))
            .map_err(|err| err.during_apply(action))?;
        ps_info!(context = self.ctx, "{} {} line(s) via '{}'", action, lines.len(), command);

        self.archive(TaskKind::Subscriber, action, &patch, &sink, run)
    }

    /// Upload, apply, commit, then move the baseline.
    pub fn apply_shaper(
        &self,
        config: &ShaperTaskConfig,
        snapshot: &ShaperSnapshot,
        run: &mut ProvisioningRun,
    ) -> Result<()> {
        let rendered = self.task_dir.join(&config.file_name);
        if let Some(parent) = rendered.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&rendered, snapshot.text())?;
        self.cancel.checkpoint("upload")?;
        self.upload(&rendered)?;

        self.cancel.checkpoint("apply_config")?;
        self.collaborators
            .applier
            .apply_config(self.target_id, &rendered)
            .map_err(|err| err.during_apply("apply_config"))?;
        self.cancel.checkpoint("commit")?;
        let sink = self.sink("commit");
        self.collaborators
            .exec
            .exec(self.target_id, &config.commit_command, Some(&sink))
            .map_err(|err| err.during_apply("commit"))?;
        ps_info!(context = self.ctx, "shaper block committed with {} entries", snapshot.entries());

        self.history.baseline().save(snapshot.text())?;
        run.changes.added = snapshot.entries();
        self.archive(TaskKind::Shaper, "apply", &rendered, &sink, run)
    }

    fn upload(&self, path: &Path) -> Result<()> {
        self.collaborators
            .transfer
            .transfer(self.target_id, TransferDirection::Upload, path)
            .map_err(|err| err.during_apply("upload"))
    }

    fn sink(&self, action: &str) -> PathBuf {
        self.task_dir.join(format!("{action}.out"))
    }

    /// Archive what was sent together with the device output it produced,
    /// both under one stamp.
    fn archive(
        &self,
        task: TaskKind,
        action: &str,
        artifact: &Path,
        sink: &Path,
        run: &mut ProvisioningRun,
    ) -> Result<()> {
        let contents = fs::read(artifact)?;
        let ext = artifact
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("txt");
        let output = if sink.exists() { Some(fs::read(sink)?) } else { None };

        let mut members: Vec<(&str, &[u8])> = vec![(ext, contents.as_slice())];
        if let Some(output) = &output {
            members.push((if ext == "log" { "out" } else { "log" }, output.as_slice()));
        }
        for archived in self.history.archive_group(task, action, &members)? {
            ps_debug!(context = self.ctx, "archived {}", archived.path.display());
            run.add_artifact(archived.path);
        }
        Ok(())
    }
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(path, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::{DeviceCall, FailPoint, RecordingDevice};
    use crate::remote::LocalDirSource;
    use crate::transform::ShaperRenderer;
    use provisync_common::AppConfig;
    use provisync_persistence::RunOutcome;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        device: Arc<RecordingDevice>,
        collaborators: Collaborators,
        history: HistoryStore,
        target: TargetConfig,
    }

    fn fixture(device: RecordingDevice) -> Fixture {
        let dir = tempdir().unwrap();
        let device = Arc::new(device);
        let source = Arc::new(LocalDirSource::new(Arc::new(AppConfig::default())));
        let collaborators = Collaborators::with_device(source, device.clone());
        let history = HistoryStore::open(dir.path().join("history")).unwrap();
        Fixture {
            dir,
            device,
            collaborators,
            history,
            target: TargetConfig::new("10.0.0.1"),
        }
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn subscriber_removes_before_adding() {
        let fx = fixture(RecordingDevice::with_flows(["flow old"]));
        let applier = ReconcileApplier::new(
            &fx.collaborators,
            &fx.history,
            "edge",
            &fx.target,
            fx.dir.path().join("work/subscriber"),
        );
        let changes = Changeset {
            to_add: lines(&["flow new"]),
            to_remove: lines(&["flow old"]),
        };
        let mut run = ProvisioningRun::start(TaskKind::Subscriber);
        applier
            .apply_subscriber(&SubscriberTaskConfig::new("edge", "drop"), &changes, &mut run)
            .unwrap();

        assert_eq!(fx.device.flows(), lines(&["flow new"]));
        assert_eq!(
            fx.device.commands(),
            lines(&["flow delete file ./remove_flows.txt", "flow add file ./add_flows.txt"])
        );
        assert_eq!(run.changes.added, 1);
        assert_eq!(run.changes.removed, 1);
        // patch and command output for each branch
        assert_eq!(run.artifacts.len(), 4);
        let names: Vec<String> = run
            .artifacts
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names[0].starts_with("subscriber_remove_"));
        assert!(names[2].starts_with("subscriber_add_"));
        // each patch shares its stamp with the output it produced
        for pair in names.chunks(2) {
            let patch = pair[0].strip_suffix(".txt").unwrap();
            let log = pair[1].strip_suffix(".log").unwrap();
            assert_eq!(patch, log);
        }
        assert_ne!(names[0].trim_start_matches("subscriber_remove_"), names[2].trim_start_matches("subscriber_add_"));
    }

    #[test]
    fn empty_branch_is_not_executed() {
        let fx = fixture(RecordingDevice::new());
        let applier = ReconcileApplier::new(
            &fx.collaborators,
            &fx.history,
            "edge",
            &fx.target,
            fx.dir.path().join("work/subscriber"),
        );
        let changes = Changeset {
            to_add: lines(&["flow new"]),
            to_remove: Vec::new(),
        };
        let mut run = ProvisioningRun::start(TaskKind::Subscriber);
        applier
            .apply_subscriber(&SubscriberTaskConfig::new("edge", "drop"), &changes, &mut run)
            .unwrap();
        assert!(!fx.dir.path().join("work/subscriber/remove_flows.txt").exists());
        assert_eq!(fx.device.commands(), lines(&["flow add file ./add_flows.txt"]));
    }

    #[test]
    fn failed_commit_keeps_previous_baseline() {
        let fx = fixture(RecordingDevice::new());
        fx.history.baseline().save("traffic-manager\nend\n").unwrap();
        fx.device.fail_on(FailPoint::Exec("commit".into()));
        let applier = ReconcileApplier::new(
            &fx.collaborators,
            &fx.history,
            "edge",
            &fx.target,
            fx.dir.path().join("work/shaper"),
        );
        let config = ShaperTaskConfig::new("edge", "drop");
        let snapshot = ShaperRenderer::from_config(&config).render(&[]);
        let mut run = ProvisioningRun::start(TaskKind::Shaper);

        let err = applier.apply_shaper(&config, &snapshot, &mut run).unwrap_err();
        assert_eq!(err.kind(), "apply_failure");
        assert_eq!(
            fx.history.baseline().load().unwrap().as_deref(),
            Some("traffic-manager\nend\n")
        );
        assert!(run.artifacts.is_empty());
        run.fail(err.kind(), err.to_string());
        assert_eq!(run.outcome, Some(RunOutcome::Failed));
    }

    #[test]
    fn cancelled_applier_leaves_device_untouched() {
        let fx = fixture(RecordingDevice::new());
        fx.history.baseline().save("traffic-manager\nend\n").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let applier = ReconcileApplier::new(
            &fx.collaborators,
            &fx.history,
            "edge",
            &fx.target,
            fx.dir.path().join("work/shaper"),
        )
        .with_cancel(cancel);
        let config = ShaperTaskConfig::new("edge", "drop");
        let snapshot = ShaperRenderer::from_config(&config).render(&[]);
        let mut run = ProvisioningRun::start(TaskKind::Shaper);

        let err = applier.apply_shaper(&config, &snapshot, &mut run).unwrap_err();
        assert_eq!(err.kind(), "interrupted");
        assert!(fx.device.calls().is_empty());
        assert_eq!(
            fx.history.baseline().load().unwrap().as_deref(),
            Some("traffic-manager\nend\n")
        );
    }

    #[test]
    fn shaper_uploads_applies_commits_in_order() {
        let fx = fixture(RecordingDevice::new());
        let applier = ReconcileApplier::new(
            &fx.collaborators,
            &fx.history,
            "edge",
            &fx.target,
            fx.dir.path().join("work/shaper"),
        );
        let config = ShaperTaskConfig::new("edge", "drop");
        let snapshot = ShaperRenderer::from_config(&config).render(&[]);
        let mut run = ProvisioningRun::start(TaskKind::Shaper);
        applier.apply_shaper(&config, &snapshot, &mut run).unwrap();

        let calls = fx.device.calls();
        assert!(matches!(&calls[0], DeviceCall::Upload { file, .. } if file == "shaper.cfg"));
        assert!(matches!(&calls[1], DeviceCall::ApplyConfig { .. }));
        assert!(matches!(&calls[2], DeviceCall::Exec { command, .. } if command == "commit"));
        assert_eq!(fx.device.committed_config().as_deref(), Some(snapshot.text()));
        assert!(fx.history.baseline().matches(snapshot.text()).unwrap());
    }
}
