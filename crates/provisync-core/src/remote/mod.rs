//! ---
//! ps_section: "05-networking-external-interfaces"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Collaborator interfaces for fetch, remote exec, and transfer."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
//! Narrow interfaces through which the engine touches the outside world.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use provisync_common::{AppConfig, FetchMode, SourceKind, TargetKind};

use crate::error::{ReconcileError, Result};

pub mod local;
pub mod mock;
pub mod rest;
pub mod runner;
pub mod ssh;

pub use local::LocalDirSource;
pub use rest::RestApiGateway;
pub use runner::{CommandRunner, MockRunner, ProcessRunner};
pub use ssh::SshGateway;

/// Direction of a file transfer relative to the local host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => f.write_str("upload"),
            TransferDirection::Download => f.write_str("download"),
        }
    }
}

/// Bulk retrieval of raw instruction files.
pub trait InstructionSource: Send + Sync {
    /// Populate `dest_dir` with the files of `source_id` matching `pattern`.
    /// `Sync` mirrors exactly, `Copy` only adds and updates.
    fn fetch(&self, source_id: &str, dest_dir: &Path, mode: FetchMode, pattern: &str) -> Result<()>;
}

/// Command execution on a named target.
pub trait RemoteExec: Send + Sync {
    /// Run `command`; when `output_sink` is given the captured output is
    /// written there.
    fn exec(&self, target_id: &str, command: &str, output_sink: Option<&Path>) -> Result<()>;
}

/// File transfer to or from a named target. The remote side always uses the
/// basename of `local_path` inside the target's remote directory.
pub trait RemoteTransfer: Send + Sync {
    fn transfer(&self, target_id: &str, direction: TransferDirection, local_path: &Path) -> Result<()>;
}

/// Pushes a full configuration file that already lives on the target.
pub trait ConfigApplier: Send + Sync {
    fn apply_config(&self, target_id: &str, file_path: &Path) -> Result<()>;
}

/// The collaborator set handed to the coordinator.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn InstructionSource>,
    pub exec: Arc<dyn RemoteExec>,
    pub transfer: Arc<dyn RemoteTransfer>,
    pub applier: Arc<dyn ConfigApplier>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Process-backed collaborators: ssh/scp/rsync for targets and rsync
    /// sources, plain file copies for local sources. Commands and
    /// configuration patches for `rest` targets go through the management API.
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        Self::with_runner(config, Arc::new(ProcessRunner))
    }

    pub fn with_runner(config: Arc<AppConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        let gateway = Arc::new(SshGateway::new(config.clone(), runner));
        let source = Arc::new(ConfiguredSource {
            config: config.clone(),
            gateway: gateway.clone(),
            local: LocalDirSource::new(config.clone()),
        });
        let device = Arc::new(DeviceRouter {
            rest: RestApiGateway::new(config.clone()),
            ssh: gateway.clone(),
            config,
        });
        Self {
            source,
            exec: device.clone(),
            transfer: gateway,
            applier: device,
        }
    }

    /// Device-facing roles served by one in-memory device.
    pub fn with_device<D>(source: Arc<dyn InstructionSource>, device: Arc<D>) -> Self
    where
        D: RemoteExec + RemoteTransfer + ConfigApplier + 'static,
    {
        Self {
            source,
            exec: device.clone(),
            transfer: device.clone(),
            applier: device,
        }
    }
}

/// Routes a fetch to the implementation matching the source's `kind`.
struct ConfiguredSource {
    config: Arc<AppConfig>,
    gateway: Arc<SshGateway>,
    local: LocalDirSource,
}

impl InstructionSource for ConfiguredSource {
    fn fetch(&self, source_id: &str, dest_dir: &Path, mode: FetchMode, pattern: &str) -> Result<()> {
        let source = self
            .config
            .source(source_id)
            .ok_or_else(|| ReconcileError::ConfigMissing(format!("unknown source '{source_id}'")))?;
        match source.kind {
            SourceKind::Rsync => self.gateway.fetch(source_id, dest_dir, mode, pattern),
            SourceKind::Local => self.local.fetch(source_id, dest_dir, mode, pattern),
        }
    }
}

/// Routes device commands and configuration patches by the target's `kind`.
struct DeviceRouter {
    config: Arc<AppConfig>,
    ssh: Arc<SshGateway>,
    rest: RestApiGateway,
}

impl DeviceRouter {
    fn uses_api(&self, target_id: &str) -> bool {
        self.config
            .target(target_id)
            .is_some_and(|target| target.kind == TargetKind::Rest)
    }
}

impl RemoteExec for DeviceRouter {
    fn exec(&self, target_id: &str, command: &str, output_sink: Option<&Path>) -> Result<()> {
        if self.uses_api(target_id) {
            self.rest.exec(target_id, command, output_sink)
        } else {
            self.ssh.exec(target_id, command, output_sink)
        }
    }
}

impl ConfigApplier for DeviceRouter {
    fn apply_config(&self, target_id: &str, file_path: &Path) -> Result<()> {
        if self.uses_api(target_id) {
            self.rest.apply_config(target_id, file_path)
        } else {
            self.ssh.apply_config(target_id, file_path)
        }
    }
}

/// Final path component as a string, used to name remote files.
pub(crate) fn basename(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            ReconcileError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no usable file name", path.display()),
            ))
        })
}
