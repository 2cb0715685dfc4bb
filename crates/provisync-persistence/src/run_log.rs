//! ---
//! ps_section: "03-persistence-logging"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "History store: run log, archived artifacts, shaper baseline."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::ProvisioningRun;
use crate::{PersistenceError, Result};

/// Current run log format version.
pub const RUN_LOG_VERSION: u16 = 1;

/// Header stored as the first line of the run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunLogHeader {
    version: u16,
    created_at: DateTime<Utc>,
}

/// One persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    /// Sequential identifier assigned when appending.
    pub sequence: u64,
    /// When the entry was written.
    pub recorded_at: DateTime<Utc>,
    /// The finalized run.
    pub run: ProvisioningRun,
}

/// Append-only writer for the run log. Entries are never rewritten.
pub struct RunLogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
}

impl RunLogWriter {
    /// Open the run log for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        let next_sequence = if fresh {
            let header = RunLogHeader {
                version: RUN_LOG_VERSION,
                created_at: Utc::now(),
            };
            writer.write_all(serde_json::to_string(&header)?.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            0
        } else {
            last_sequence(path)?
        };

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            next_sequence,
        })
    }

    /// Append a finalized run and return its sequence number.
    pub fn append(&mut self, run: &ProvisioningRun) -> Result<u64> {
        if !run.is_final() {
            return Err(PersistenceError::IncompleteRun(run.run_id));
        }
        self.next_sequence += 1;
        let entry = RunLogEntry {
            sequence: self.next_sequence,
            recorded_at: Utc::now(),
            run: run.clone(),
        };
        self.writer
            .write_all(serde_json::to_string(&entry)?.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(entry.sequence)
    }

    /// Path of the log on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn last_sequence(path: &Path) -> Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut last = 0u64;
    for line in reader.lines().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<RunLogEntry>(&line) {
            last = entry.sequence;
        }
    }
    Ok(last)
}

/// Streaming iterator over the run log entries, oldest first.
pub struct RunLogReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl RunLogReader {
    /// Open the log for sequential reading.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header = String::new();
        reader.read_line(&mut header)?;
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl Iterator for RunLogReader {
    type Item = Result<RunLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    return Some(serde_json::from_str(&line).map_err(PersistenceError::from))
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunOutcome, TaskKind};
    use tempfile::tempdir;

    fn finished(task: TaskKind, outcome: RunOutcome) -> ProvisioningRun {
        let mut run = ProvisioningRun::start(task);
        run.finish(outcome);
        run
    }

    #[test]
    fn append_and_read_back_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs.log");
        let mut writer = RunLogWriter::open(&path).unwrap();
        writer
            .append(&finished(TaskKind::Subscriber, RunOutcome::Applied))
            .unwrap();
        writer
            .append(&finished(TaskKind::Shaper, RunOutcome::Skipped))
            .unwrap();

        let entries: Vec<_> = RunLogReader::open(&path)
            .unwrap()
            .map(|entry| entry.unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[0].run.task, TaskKind::Subscriber);
        assert_eq!(entries[1].run.outcome, Some(RunOutcome::Skipped));
    }

    #[test]
    fn reopening_continues_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs.log");
        {
            let mut writer = RunLogWriter::open(&path).unwrap();
            writer
                .append(&finished(TaskKind::Shaper, RunOutcome::Applied))
                .unwrap();
        }
        let mut writer = RunLogWriter::open(&path).unwrap();
        let seq = writer
            .append(&finished(TaskKind::Shaper, RunOutcome::Failed))
            .unwrap();
        assert_eq!(seq, 2);
    }

    #[test]
    fn unfinished_runs_are_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = RunLogWriter::open(&dir.path().join("runs.log")).unwrap();
        let run = ProvisioningRun::start(TaskKind::Subscriber);
        assert!(matches!(
            writer.append(&run),
            Err(PersistenceError::IncompleteRun(_))
        ));
    }
}
