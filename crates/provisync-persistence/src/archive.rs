//! ---
//! ps_section: "03-persistence-logging"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "History store: run log, archived artifacts, shaper baseline."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Local, NaiveDateTime, Timelike};
use parking_lot::Mutex;
use tracing::debug;

use crate::baseline::ShaperBaseline;
use crate::run::{ProvisioningRun, TaskKind};
use crate::run_log::{RunLogReader, RunLogWriter};
use crate::{PersistenceError, Result};

/// `strftime` pattern of the stamp embedded in archive names.
pub const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const RUN_LOG_FILE: &str = "runs.log";
const MAX_STAMP_ADVANCE: i64 = 3600;

/// An artifact copied into the history directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedArtifact {
    /// Where the artifact now lives.
    pub path: PathBuf,
    /// Stamp embedded in the file name.
    pub stamp: NaiveDateTime,
}

/// Append-only history directory.
///
/// Archives are named `<task>_<action>_<YYYYMMDD_HHMMSS>.<ext>`, created with
/// `create_new`, and stamped strictly increasing per store: a stamp not later
/// than the previous one, or one naming an existing file, is advanced by one
/// second.
#[derive(Debug)]
pub struct HistoryStore {
    root: PathBuf,
    last_stamp: Mutex<Option<NaiveDateTime>>,
}

impl HistoryStore {
    /// Open (and create) the history directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            last_stamp: Mutex::new(None),
        })
    }

    /// Directory backing the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the run log.
    pub fn run_log_path(&self) -> PathBuf {
        self.root.join(RUN_LOG_FILE)
    }

    /// The shaper last-applied baseline kept in this store.
    pub fn baseline(&self) -> ShaperBaseline {
        ShaperBaseline::in_dir(&self.root)
    }

    /// Archive `contents` as `<task>_<action>_<stamp>.<ext>`.
    pub fn archive(
        &self,
        task: TaskKind,
        action: &str,
        ext: &str,
        contents: &[u8],
    ) -> Result<ArchivedArtifact> {
        self.archive_at(task, action, ext, contents, now_stamp())
    }

    /// Archive several renderings of one action under a single stamp, e.g. a
    /// patch and the device output it produced. Extensions must be distinct.
    /// A collision on any member moves the whole group to the next stamp.
    pub fn archive_group(
        &self,
        task: TaskKind,
        action: &str,
        members: &[(&str, &[u8])],
    ) -> Result<Vec<ArchivedArtifact>> {
        self.archive_group_at(task, action, members, now_stamp())
    }

    pub(crate) fn archive_at(
        &self,
        task: TaskKind,
        action: &str,
        ext: &str,
        contents: &[u8],
        now: NaiveDateTime,
    ) -> Result<ArchivedArtifact> {
        self.archive_group_at(task, action, &[(ext, contents)], now)?
            .pop()
            .ok_or_else(|| PersistenceError::ArchiveExhausted(self.root.clone()))
    }

    pub(crate) fn archive_group_at(
        &self,
        task: TaskKind,
        action: &str,
        members: &[(&str, &[u8])],
        now: NaiveDateTime,
    ) -> Result<Vec<ArchivedArtifact>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut last = self.last_stamp.lock();
        let mut stamp = match *last {
            Some(prev) if now <= prev => prev + Duration::seconds(1),
            _ => now,
        };
        for _ in 0..MAX_STAMP_ADVANCE {
            let mut created = Vec::with_capacity(members.len());
            let mut collided = false;
            for (ext, contents) in members {
                let path = self.root.join(format!(
                    "{}_{}_{}.{}",
                    task.as_str(),
                    action,
                    stamp.format(ARCHIVE_STAMP_FORMAT),
                    ext
                ));
                match write_new(&path, contents) {
                    Ok(()) => created.push(path),
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                        collided = true;
                        break;
                    }
                    Err(err) => {
                        discard(&created);
                        return Err(err.into());
                    }
                }
            }
            if collided {
                discard(&created);
                stamp += Duration::seconds(1);
                continue;
            }
            *last = Some(stamp);
            for path in &created {
                debug!(path = %path.display(), "artifact archived");
            }
            return Ok(created
                .into_iter()
                .map(|path| ArchivedArtifact { path, stamp })
                .collect());
        }
        Err(PersistenceError::ArchiveExhausted(self.root.clone()))
    }

    /// Append a finalized run to the run log.
    pub fn record_run(&self, run: &ProvisioningRun) -> Result<u64> {
        let mut writer = RunLogWriter::open(&self.run_log_path())?;
        writer.append(run)
    }

    /// The last `limit` recorded runs, oldest first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<ProvisioningRun>> {
        let path = self.run_log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in RunLogReader::open(&path)? {
            runs.push(entry?.run);
        }
        let skip = runs.len().saturating_sub(limit);
        Ok(runs.split_off(skip))
    }
}

fn write_new(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(contents)?;
    file.flush()
}

/// Roll back the members of a group attempt that did get created.
fn discard(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = fs::remove_file(path) {
            debug!(path = %path.display(), %err, "partial archive not removed");
        }
    }
}

fn now_stamp() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunOutcome;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn archive_name_follows_pattern() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();
        let artifact = store
            .archive_at(TaskKind::Subscriber, "add", "txt", b"a\n", at(9, 5, 7))
            .unwrap();
        assert_eq!(
            artifact.path.file_name().unwrap().to_str().unwrap(),
            "subscriber_add_20260314_090507.txt"
        );
        assert_eq!(fs::read(&artifact.path).unwrap(), b"a\n");
    }

    #[test]
    fn stamps_are_strictly_increasing_within_a_second() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();
        let first = store
            .archive_at(TaskKind::Subscriber, "remove", "txt", b"r\n", at(10, 0, 0))
            .unwrap();
        let second = store
            .archive_at(TaskKind::Subscriber, "add", "txt", b"a\n", at(10, 0, 0))
            .unwrap();
        assert!(first.stamp < second.stamp);
    }

    #[test]
    fn existing_archives_are_never_overwritten() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();
        let first = store
            .archive_at(TaskKind::Shaper, "apply", "cfg", b"one", at(11, 0, 0))
            .unwrap();

        // A fresh store has no memory of the earlier stamp.
        let store = HistoryStore::open(dir.path()).unwrap();
        let second = store
            .archive_at(TaskKind::Shaper, "apply", "cfg", b"two", at(11, 0, 0))
            .unwrap();
        assert_ne!(first.path, second.path);
        assert_eq!(fs::read(&first.path).unwrap(), b"one");
        assert_eq!(fs::read(&second.path).unwrap(), b"two");
    }

    #[test]
    fn group_members_share_one_stamp() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();
        // an unrelated log already holds the first candidate stamp
        fs::write(dir.path().join("subscriber_add_20260314_120000.log"), b"old").unwrap();

        let group = store
            .archive_group_at(
                TaskKind::Subscriber,
                "add",
                &[("txt", b"s1 10.0.0.1 permit\n".as_slice()), ("log", b"ok\n".as_slice())],
                at(12, 0, 0),
            )
            .unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].stamp, at(12, 0, 1));
        assert_eq!(group[0].stamp, group[1].stamp);
        assert_eq!(
            group[1].path.file_name().unwrap().to_str().unwrap(),
            "subscriber_add_20260314_120001.log"
        );
        // the half-written attempt at the colliding stamp was rolled back
        assert!(!dir.path().join("subscriber_add_20260314_120000.txt").exists());
        assert_eq!(
            fs::read(dir.path().join("subscriber_add_20260314_120000.log")).unwrap(),
            b"old"
        );
    }

    #[test]
    fn recent_runs_returns_tail() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();
        assert!(store.recent_runs(5).unwrap().is_empty());
        for task in [TaskKind::Subscriber, TaskKind::Shaper, TaskKind::Subscriber] {
            let mut run = ProvisioningRun::start(task);
            run.finish(RunOutcome::Skipped);
            store.record_run(&run).unwrap();
        }
        let recent = store.recent_runs(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].task, TaskKind::Shaper);
        assert_eq!(recent[1].task, TaskKind::Subscriber);
    }
}
