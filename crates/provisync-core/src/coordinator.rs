//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Primary orchestration and lifecycle management."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use provisync_common::{render_command, AppConfig, ResolvedPaths, ShaperTaskConfig, SubscriberTaskConfig, TargetConfig};
use provisync_logging::{log_run_event, ps_error, ps_info, ps_warn, LogContext, RunEventOutcome};
use provisync_persistence::{HistoryStore, ProvisioningRun, RunOutcome, ShaperBaseline, TaskKind};
use serde::Serialize;

use crate::apply::ReconcileApplier;
use crate::cancel::CancelToken;
use crate::diff::{diff_lines, diff_shaper, Changeset, ShaperDecision};
use crate::error::{ReconcileError, Result};
use crate::instruction::InstructionCategory;
use crate::lock::RunLock;
use crate::merge::InstructionMerger;
use crate::remote::Collaborators;
use crate::state::StateSnapshot;
use crate::transform::{FormatTransformer, ShaperRenderer};

/// Which tasks one invocation runs. `Both` runs subscriber, then shaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSelection {
    Subscriber,
    Shaper,
    Both,
}

impl TaskSelection {
    pub fn tasks(&self) -> &'static [TaskKind] {
        match self {
            TaskSelection::Subscriber => &[TaskKind::Subscriber],
            TaskSelection::Shaper => &[TaskKind::Shaper],
            TaskSelection::Both => &[TaskKind::Subscriber, TaskKind::Shaper],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSelection::Subscriber => "subscriber",
            TaskSelection::Shaper => "shaper",
            TaskSelection::Both => "both",
        }
    }
}

impl fmt::Display for TaskSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskSelection {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "subscriber" => Ok(TaskSelection::Subscriber),
            "shaper" => Ok(TaskSelection::Shaper),
            "both" => Ok(TaskSelection::Both),
            other => Err(format!("unknown task selection '{other}'")),
        }
    }
}

/// Coordinator lifecycle. A run walks
/// `Idle → LockAcquired → Running → Succeeded|Failed → LockReleased`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    LockAcquired,
    Running(TaskSelection),
    Succeeded,
    Failed,
    LockReleased,
}

/// What a dry run found for one task.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "task", rename_all = "lowercase")]
pub enum TaskPlan {
    Subscriber {
        target: String,
        changeset: Changeset,
        malformed: usize,
    },
    Shaper {
        target: String,
        decision: ShaperDecision,
        malformed: usize,
    },
}

impl TaskPlan {
    /// Whether applying the plan would leave the device untouched.
    pub fn is_noop(&self) -> bool {
        match self {
            TaskPlan::Subscriber { changeset, .. } => changeset.is_empty(),
            TaskPlan::Shaper { decision, .. } => decision.is_skipped(),
        }
    }
}

/// Records of the tasks a successful invocation ran.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub runs: Vec<ProvisioningRun>,
}

impl RunSummary {
    pub fn outcome_of(&self, task: TaskKind) -> Option<RunOutcome> {
        self.runs
            .iter()
            .find(|run| run.task == task)
            .and_then(|run| run.outcome)
    }
}

/// Wraps the pipeline in the run lock and records every definitive outcome.
#[derive(Debug)]
pub struct RunCoordinator {
    config: Arc<AppConfig>,
    paths: ResolvedPaths,
    collaborators: Collaborators,
    transformer: FormatTransformer,
    phases: Vec<RunPhase>,
    cancel: CancelToken,
}

impl RunCoordinator {
    pub fn new(config: Arc<AppConfig>, paths: ResolvedPaths, collaborators: Collaborators) -> Self {
        Self {
            config,
            paths,
            collaborators,
            transformer: FormatTransformer,
            phases: vec![RunPhase::Idle],
            cancel: CancelToken::new(),
        }
    }

    /// Share a stop flag with the caller. A cancelled task fails with
    /// `interrupted` at its next step boundary and is recorded as failed.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> RunPhase {
        self.phases.last().copied().unwrap_or(RunPhase::Idle)
    }

    /// Phases visited by the last invocation.
    pub fn phases(&self) -> &[RunPhase] {
        &self.phases
    }

    /// History store backing this installation.
    pub fn history(&self) -> Result<HistoryStore> {
        Ok(HistoryStore::open(&self.paths.history_dir)?)
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::debug!(?phase, "coordinator phase");
        self.phases.push(phase);
    }

    /// Reconcile the selected tasks. Stops at the first failed task; that
    /// task's failure is recorded before the error is returned.
    pub fn run(&mut self, selection: TaskSelection) -> Result<RunSummary> {
        self.phases = vec![RunPhase::Idle];
        let lock = RunLock::acquire(&self.paths.lock_file)?;
        self.enter(RunPhase::LockAcquired);
        self.enter(RunPhase::Running(selection));

        let result = self.run_tasks(selection);

        self.enter(if result.is_ok() {
            RunPhase::Succeeded
        } else {
            RunPhase::Failed
        });
        drop(lock);
        self.enter(RunPhase::LockReleased);
        result
    }

    /// Dry run: everything up to the diff, nothing pushed or recorded.
    pub fn plan(&mut self, selection: TaskSelection) -> Result<Vec<TaskPlan>> {
        self.phases = vec![RunPhase::Idle];
        let lock = RunLock::acquire(&self.paths.lock_file)?;
        self.enter(RunPhase::LockAcquired);
        self.enter(RunPhase::Running(selection));

        let result = self.plan_tasks(selection);

        self.enter(if result.is_ok() {
            RunPhase::Succeeded
        } else {
            RunPhase::Failed
        });
        drop(lock);
        self.enter(RunPhase::LockReleased);
        result
    }

    fn plan_tasks(&self, selection: TaskSelection) -> Result<Vec<TaskPlan>> {
        let mut plans = Vec::new();
        for task in selection.tasks() {
            let ctx = LogContext::new().with_task(task.as_str());
            let planned = match task {
                TaskKind::Subscriber => self.prepare_subscriber(ctx).map(|(target, changeset, malformed)| {
                    TaskPlan::Subscriber {
                        target,
                        changeset,
                        malformed,
                    }
                }),
                TaskKind::Shaper => self.prepare_shaper(ctx).map(|(target, decision, malformed)| {
                    TaskPlan::Shaper {
                        target,
                        decision,
                        malformed,
                    }
                }),
            };
            match planned {
                Ok(plan) => plans.push(plan),
                Err(err) => {
                    ps_error!(context = ctx, "plan failed: {}", err);
                    return Err(err);
                }
            }
        }
        Ok(plans)
    }

    fn run_tasks(&self, selection: TaskSelection) -> Result<RunSummary> {
        let history = self.history()?;
        let mut summary = RunSummary::default();
        for &task in selection.tasks() {
            let mut run = ProvisioningRun::start(task);
            let run_id = run.run_id.to_string();
            let ctx = LogContext::new().with_task(task.as_str()).with_run_id(&run_id);
            ps_info!(context = ctx, "task started");

            let result = match task {
                TaskKind::Subscriber => self.reconcile_subscriber(&history, &mut run, ctx),
                TaskKind::Shaper => self.reconcile_shaper(&history, &mut run, ctx),
            };
            match result {
                Ok(outcome) => {
                    run.finish(outcome);
                    history.record_run(&run)?;
                    let event = match outcome {
                        RunOutcome::Skipped => RunEventOutcome::Skipped,
                        _ => RunEventOutcome::Applied,
                    };
                    log_run_event(
                        Some(&ctx),
                        "task_finished",
                        &format!("+{} -{}", run.changes.added, run.changes.removed),
                        event,
                    );
                    summary.runs.push(run);
                }
                Err(err) => {
                    run.fail(err.kind(), err.to_string());
                    if let Err(record_err) = history.record_run(&run) {
                        ps_error!(context = ctx, "failed run could not be recorded: {}", record_err);
                    }
                    log_run_event(
                        Some(&ctx),
                        "task_finished",
                        &err.to_string(),
                        RunEventOutcome::Failed(err.kind()),
                    );
                    return Err(err);
                }
            }
        }
        Ok(summary)
    }

    fn subscriber_config(&self) -> Result<(&SubscriberTaskConfig, &TargetConfig)> {
        let task = self
            .config
            .subscriber
            .as_ref()
            .ok_or_else(|| ReconcileError::ConfigMissing("no [subscriber] section configured".into()))?;
        Ok((task, self.target(&task.target)?))
    }

    fn shaper_config(&self) -> Result<(&ShaperTaskConfig, &TargetConfig)> {
        let task = self
            .config
            .shaper
            .as_ref()
            .ok_or_else(|| ReconcileError::ConfigMissing("no [shaper] section configured".into()))?;
        Ok((task, self.target(&task.target)?))
    }

    fn target(&self, target_id: &str) -> Result<&TargetConfig> {
        self.config
            .target(target_id)
            .ok_or_else(|| ReconcileError::ConfigMissing(format!("unknown target '{target_id}'")))
    }

    /// fetch → merge → transform → snapshot → diff for the flow table.
    fn prepare_subscriber(&self, ctx: LogContext<'_>) -> Result<(String, Changeset, usize)> {
        let (task, target) = self.subscriber_config()?;
        let ctx = ctx.with_device(&task.target);
        let task_dir = self.paths.task_dir(TaskKind::Subscriber.as_str());
        let raw_dir = self.paths.raw_dir(TaskKind::Subscriber.as_str());

        self.cancel.checkpoint("fetch")?;
        ps_info!(context = ctx.with_stage("fetch"), "fetching from source '{}'", task.source);
        self.collaborators
            .source
            .fetch(&task.source, &raw_dir, task.fetch_mode, &task.fetch_pattern)?;
        self.cancel.checkpoint("merge")?;

        let merger = InstructionMerger::new(task.has_header, task.key_fields);
        let adds = merger.merge_matching(
            &raw_dir,
            &task.add_pattern,
            &task_dir.join("merged_add.txt"),
            InstructionCategory::Add,
        )?;
        let deletes = merger.merge_matching(
            &raw_dir,
            &task.delete_pattern,
            &task_dir.join("merged_delete.txt"),
            InstructionCategory::Delete,
        )?;
        let malformed = adds.malformed + deletes.malformed;
        if malformed > 0 {
            ps_warn!(context = ctx.with_stage("merge"), "{} malformed instruction(s) skipped", malformed);
        }

        let desired_add = self.transformer.subscriber_lines(&adds.records).lines;
        let desired_delete = self.transformer.subscriber_lines(&deletes.records).lines;

        self.cancel.checkpoint("snapshot")?;
        let save_command = render_command(&task.save_command, &target.remote_path(&task.state_file));
        let current = StateSnapshot::capture(
            self.collaborators.exec.as_ref(),
            self.collaborators.transfer.as_ref(),
            &task.target,
            &save_command,
            &task_dir.join(&task.state_file),
        )?;
        self.cancel.checkpoint("diff")?;

        let changeset = diff_lines(&desired_add, &desired_delete, &current);
        ps_info!(
            context = ctx.with_stage("diff"),
            "{} line(s) to add, {} to remove",
            changeset.to_add.len(),
            changeset.to_remove.len()
        );
        Ok((task.target.clone(), changeset, malformed))
    }

    /// fetch → merge → render → compare with the baseline for the shaper block.
    fn prepare_shaper(&self, ctx: LogContext<'_>) -> Result<(String, ShaperDecision, usize)> {
        let (task, _) = self.shaper_config()?;
        let ctx = ctx.with_device(&task.target);
        let task_dir = self.paths.task_dir(TaskKind::Shaper.as_str());
        let raw_dir = self.paths.raw_dir(TaskKind::Shaper.as_str());

        self.cancel.checkpoint("fetch")?;
        ps_info!(context = ctx.with_stage("fetch"), "fetching from source '{}'", task.source);
        self.collaborators
            .source
            .fetch(&task.source, &raw_dir, task.fetch_mode, &task.fetch_pattern)?;
        self.cancel.checkpoint("merge")?;

        let merged = InstructionMerger::new(task.has_header, task.key_fields).merge_matching(
            &raw_dir,
            &task.fetch_pattern,
            &task_dir.join("merged_shaper.txt"),
            InstructionCategory::Add,
        )?;
        let snapshot = ShaperRenderer::from_config(task).render(&merged.records);
        let malformed = merged.malformed + snapshot.skipped();
        self.cancel.checkpoint("diff")?;

        let baseline = ShaperBaseline::in_dir(&self.paths.history_dir).load()?;
        let decision = diff_shaper(snapshot, baseline.as_deref());
        ps_info!(
            context = ctx.with_stage("diff"),
            "shaper block {}",
            if decision.is_skipped() { "matches baseline" } else { "differs from baseline" }
        );
        Ok((task.target.clone(), decision, malformed))
    }

    fn reconcile_subscriber(
        &self,
        history: &HistoryStore,
        run: &mut ProvisioningRun,
        ctx: LogContext<'_>,
    ) -> Result<RunOutcome> {
        let (_, changeset, _) = self.prepare_subscriber(ctx)?;
        if changeset.is_empty() {
            ps_info!(context = ctx, "flow table already in sync");
            return Ok(RunOutcome::Skipped);
        }
        let (task, target) = self.subscriber_config()?;
        self.applier(history, &task.target, target, TaskKind::Subscriber, ctx)
            .apply_subscriber(task, &changeset, run)?;
        Ok(RunOutcome::Applied)
    }

    fn reconcile_shaper(
        &self,
        history: &HistoryStore,
        run: &mut ProvisioningRun,
        ctx: LogContext<'_>,
    ) -> Result<RunOutcome> {
        let (_, decision, _) = self.prepare_shaper(ctx)?;
        let ShaperDecision::Apply { snapshot } = decision else {
            ps_info!(context = ctx, "shaper block unchanged since last apply");
            return Ok(RunOutcome::Skipped);
        };
        let (task, target) = self.shaper_config()?;
        self.applier(history, &task.target, target, TaskKind::Shaper, ctx)
            .apply_shaper(task, &snapshot, run)?;
        Ok(RunOutcome::Applied)
    }

    fn applier<'a>(
        &'a self,
        history: &'a HistoryStore,
        target_id: &'a str,
        target: &'a TargetConfig,
        task: TaskKind,
        ctx: LogContext<'a>,
    ) -> ReconcileApplier<'a> {
        ReconcileApplier::new(
            &self.collaborators,
            history,
            target_id,
            target,
            self.paths.task_dir(task.as_str()),
        )
        .with_context(ctx)
        .with_cancel(self.cancel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_parses_and_orders_tasks() {
        assert_eq!("Both".parse::<TaskSelection>().unwrap(), TaskSelection::Both);
        assert_eq!(
            TaskSelection::Both.tasks(),
            &[TaskKind::Subscriber, TaskKind::Shaper]
        );
        assert!("all".parse::<TaskSelection>().is_err());
    }

    #[test]
    fn plan_serialises_with_task_tag() {
        let plan = TaskPlan::Subscriber {
            target: "edge".into(),
            changeset: Changeset {
                to_add: vec!["s1 100 gold".into()],
                to_remove: Vec::new(),
            },
            malformed: 2,
        };
        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["task"], "subscriber");
        assert_eq!(value["changeset"]["to_add"][0], "s1 100 gold");
        assert_eq!(value["malformed"], 2);
        assert!(!plan.is_noop());
    }
}
