//! ---
//! ps_section: "05-networking-external-interfaces"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Collaborator interfaces for fetch, remote exec, and transfer."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
//! In-memory device used to exercise the pipeline without a network.
//!
//! It understands the default command set (`flow save|add file|delete file`,
//! `load config`, `commit`); anything else is journaled and succeeds.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use parking_lot::Mutex;

use super::{basename, ConfigApplier, RemoteExec, RemoteTransfer, TransferDirection};
use crate::error::{ReconcileError, Result};

/// One interaction with the device, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Exec { target: String, command: String },
    Upload { target: String, file: String },
    Download { target: String, file: String },
    ApplyConfig { target: String, file: String },
}

/// Where an injected failure fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailPoint {
    /// Any command containing the given text.
    Exec(String),
    Upload,
    Download,
    ApplyConfig,
}

#[derive(Debug, Default)]
struct DeviceState {
    files: BTreeMap<String, String>,
    flows: Vec<String>,
    pending_config: Option<String>,
    committed_config: Option<String>,
    calls: Vec<DeviceCall>,
    failures: Vec<FailPoint>,
}

impl DeviceState {
    fn check(&self, target: &str, point: &FailPoint, command: Option<&str>) -> Result<()> {
        let hit = self.failures.iter().any(|failure| match (failure, command) {
            (FailPoint::Exec(text), Some(command)) => command.contains(text.as_str()),
            (FailPoint::Exec(_), None) => false,
            (failure, _) => failure == point,
        });
        if hit {
            return Err(ReconcileError::connection(target, format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    fn file(&self, target: &str, path: &str) -> Result<&str> {
        let name = path.rsplit('/').next().unwrap_or(path);
        self.files
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ReconcileError::connection(target, format!("no such remote file {name}")))
    }

    fn run(&mut self, target: &str, command: &str) -> Result<String> {
        let words: Vec<&str> = command.split_whitespace().collect();
        match words.as_slice() {
            ["flow", "save", path] => {
                let name = path.rsplit('/').next().unwrap_or(path).to_owned();
                let mut body = self.flows.join("\n");
                if !body.is_empty() {
                    body.push('\n');
                }
                self.files.insert(name, body);
                Ok(format!("{} flows saved\n", self.flows.len()))
            }
            ["flow", "add", "file", path] => {
                let lines: Vec<String> = self.file(target, path)?.lines().map(str::to_owned).collect();
                let mut added = 0;
                for line in lines {
                    if !line.is_empty() && !self.flows.contains(&line) {
                        self.flows.push(line);
                        added += 1;
                    }
                }
                Ok(format!("{added} flows added\n"))
            }
            ["flow", "delete", "file", path] => {
                let lines: Vec<String> = self.file(target, path)?.lines().map(str::to_owned).collect();
                let before = self.flows.len();
                self.flows.retain(|flow| !lines.contains(flow));
                Ok(format!("{} flows deleted\n", before - self.flows.len()))
            }
            ["load", "config", path] => {
                self.pending_config = Some(self.file(target, path)?.to_owned());
                Ok("configuration loaded\n".to_owned())
            }
            ["commit"] => match self.pending_config.take() {
                Some(config) => {
                    self.committed_config = Some(config);
                    Ok("commit complete\n".to_owned())
                }
                None => Err(ReconcileError::connection(target, "nothing to commit")),
            },
            _ => Ok(String::new()),
        }
    }
}

/// Fake device serving the exec, transfer and apply roles.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    state: Mutex<DeviceState>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device whose flow table already holds `flows`.
    pub fn with_flows<I, S>(flows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let device = Self::new();
        device.state.lock().flows = flows.into_iter().map(Into::into).collect();
        device
    }

    pub fn fail_on(&self, point: FailPoint) {
        self.state.lock().failures.push(point);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn flows(&self) -> Vec<String> {
        self.state.lock().flows.clone()
    }

    pub fn committed_config(&self) -> Option<String> {
        self.state.lock().committed_config.clone()
    }

    /// Contents of a remote file by basename.
    pub fn file(&self, name: &str) -> Option<String> {
        self.state.lock().files.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    /// Commands executed, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DeviceCall::Exec { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Calls that could change device state (everything except downloads and
    /// `flow save`).
    pub fn mutating_calls(&self) -> Vec<DeviceCall> {
        self.calls()
            .into_iter()
            .filter(|call| match call {
                DeviceCall::Download { .. } => false,
                DeviceCall::Exec { command, .. } => !command.starts_with("flow save"),
                _ => true,
            })
            .collect()
    }
}

impl RemoteExec for RecordingDevice {
    fn exec(&self, target_id: &str, command: &str, output_sink: Option<&Path>) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::Exec {
            target: target_id.to_owned(),
            command: command.to_owned(),
        });
        state.check(target_id, &FailPoint::Exec(String::new()), Some(command))?;
        let output = state.run(target_id, command)?;
        drop(state);
        if let Some(sink) = output_sink {
            if let Some(parent) = sink.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(sink, output)?;
        }
        Ok(())
    }
}

impl RemoteTransfer for RecordingDevice {
    fn transfer(&self, target_id: &str, direction: TransferDirection, local_path: &Path) -> Result<()> {
        let name = basename(local_path)?.to_owned();
        let mut state = self.state.lock();
        match direction {
            TransferDirection::Upload => {
                state.calls.push(DeviceCall::Upload {
                    target: target_id.to_owned(),
                    file: name.clone(),
                });
                state.check(target_id, &FailPoint::Upload, None)?;
                let contents = fs::read_to_string(local_path)?;
                state.files.insert(name, contents);
            }
            TransferDirection::Download => {
                state.calls.push(DeviceCall::Download {
                    target: target_id.to_owned(),
                    file: name.clone(),
                });
                state.check(target_id, &FailPoint::Download, None)?;
                let contents = state.file(target_id, &name)?.to_owned();
                if let Some(parent) = local_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(local_path, contents)?;
            }
        }
        Ok(())
    }
}

impl ConfigApplier for RecordingDevice {
    fn apply_config(&self, target_id: &str, file_path: &Path) -> Result<()> {
        let name = basename(file_path)?.to_owned();
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::ApplyConfig {
            target: target_id.to_owned(),
            file: name.clone(),
        });
        state.check(target_id, &FailPoint::ApplyConfig, None)?;
        state.run(target_id, &format!("load config {name}"))?;
        Ok(())
    }
}
