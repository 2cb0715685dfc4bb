//! ---
//! ps_section: "03-persistence-logging"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "History store: run log, archived artifacts, shaper baseline."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fs;

use provisync_persistence::{HistoryStore, ProvisioningRun, RunLogReader, RunOutcome, TaskKind};
use tempfile::tempdir;

#[test]
fn archives_sort_in_creation_order() {
    let dir = tempdir().unwrap();
    let store = HistoryStore::open(dir.path().join("history")).unwrap();

    let mut written = Vec::new();
    for action in ["remove", "add", "remove", "add"] {
        let artifact = store
            .archive(TaskKind::Subscriber, action, "txt", action.as_bytes())
            .unwrap();
        written.push(artifact);
    }
    for pair in written.windows(2) {
        assert!(pair[0].stamp < pair[1].stamp);
    }

    let names: Vec<String> = fs::read_dir(store.root())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("subscriber_"))
        .collect();
    assert_eq!(names.len(), 4);
    assert_eq!(fs::read(&written[2].path).unwrap(), b"remove");
}

#[test]
fn run_log_survives_reopen() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let history = dir.path().join("history");
    {
        let store = HistoryStore::open(&history)?;
        let mut run = ProvisioningRun::start(TaskKind::Shaper);
        let artifact = store.archive(TaskKind::Shaper, "apply", "cfg", b"traffic-manager\n")?;
        run.add_artifact(artifact.path);
        run.changes.added = 1;
        run.finish(RunOutcome::Applied);
        store.record_run(&run)?;
    }

    let store = HistoryStore::open(&history)?;
    let mut run = ProvisioningRun::start(TaskKind::Subscriber);
    run.fail("connection_failure", "ssh exited with 255");
    assert_eq!(store.record_run(&run)?, 2);

    let entries: Vec<_> = RunLogReader::open(&store.run_log_path())?
        .collect::<Result<_, _>>()?;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].run.outcome, Some(RunOutcome::Applied));
    assert_eq!(entries[0].run.artifacts.len(), 1);
    assert_eq!(entries[1].run.error_kind.as_deref(), Some("connection_failure"));

    let recent = store.recent_runs(1)?;
    assert_eq!(recent[0].task, TaskKind::Subscriber);
    Ok(())
}

#[test]
fn baseline_lives_in_history_dir() {
    let dir = tempdir().unwrap();
    let store = HistoryStore::open(dir.path()).unwrap();
    let baseline = store.baseline();
    assert!(baseline.path().starts_with(dir.path()));

    baseline.save("traffic-manager\nexit\nend\n").unwrap();
    assert!(store
        .baseline()
        .matches("traffic-manager\nexit\nend\n")
        .unwrap());
}
