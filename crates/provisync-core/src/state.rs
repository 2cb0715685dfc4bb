//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Observed device state captured for comparison."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::{ReconcileError, Result};
use crate::remote::{RemoteExec, RemoteTransfer, TransferDirection};

/// The device's deployed configuration as exact-match lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    lines: Vec<String>,
    #[serde(skip)]
    index: HashSet<String>,
}

impl StateSnapshot {
    /// Build from raw text; trailing `\r` and blank lines are dropped.
    pub fn from_text(text: &str) -> Self {
        Self::from_lines(
            text.lines()
                .map(|line| line.trim_end_matches('\r'))
                .filter(|line| !line.trim().is_empty())
                .map(str::to_owned),
        )
    }

    pub fn from_lines(lines: impl IntoIterator<Item = String>) -> Self {
        let lines: Vec<String> = lines.into_iter().collect();
        let index = lines.iter().cloned().collect();
        Self { lines, index }
    }

    /// Ask the device to export its state to `remote_file`, then download it
    /// to `local_path`. The two paths share a basename.
    pub fn capture(
        exec: &dyn RemoteExec,
        transfer: &dyn RemoteTransfer,
        target_id: &str,
        save_command: &str,
        local_path: &Path,
    ) -> Result<Self> {
        exec.exec(target_id, save_command, None)?;
        if local_path.exists() {
            fs::remove_file(local_path)?;
        }
        transfer
            .transfer(target_id, TransferDirection::Download, local_path)
            .map_err(|err| ReconcileError::SnapshotUnavailable(format!("download failed: {err}")))?;
        let text = fs::read_to_string(local_path).map_err(|err| {
            ReconcileError::SnapshotUnavailable(format!("{}: {err}", local_path.display()))
        })?;
        let snapshot = Self::from_text(&text);
        info!(device = target_id, lines = snapshot.len(), "device state captured");
        Ok(snapshot)
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn contains(&self, line: &str) -> bool {
        self.index.contains(line)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::{FailPoint, RecordingDevice};
    use tempfile::tempdir;

    #[test]
    fn text_parsing_drops_blanks_and_carriage_returns() {
        let snapshot = StateSnapshot::from_text("flow a\r\n\n  \nflow b\n");
        assert_eq!(snapshot.lines().to_vec(), vec!["flow a".to_owned(), "flow b".to_owned()]);
        assert!(snapshot.contains("flow a"));
        assert!(!snapshot.contains("flow c"));
    }

    #[test]
    fn capture_saves_then_downloads() {
        let dir = tempdir().unwrap();
        let device = RecordingDevice::with_flows(["flow a"]);
        let local = dir.path().join("current_flows.txt");
        let snapshot =
            StateSnapshot::capture(&device, &device, "edge", "flow save ./current_flows.txt", &local).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(device.commands(), vec!["flow save ./current_flows.txt".to_owned()]);
    }

    #[test]
    fn failed_download_is_snapshot_unavailable() {
        let dir = tempdir().unwrap();
        let device = RecordingDevice::new();
        device.fail_on(FailPoint::Download);
        let local = dir.path().join("current_flows.txt");
        fs::write(&local, "stale\n").unwrap();

        let err = StateSnapshot::capture(&device, &device, "edge", "flow save ./current_flows.txt", &local)
            .unwrap_err();
        assert_eq!(err.kind(), "snapshot_unavailable");
        assert!(!local.exists());
    }
}
