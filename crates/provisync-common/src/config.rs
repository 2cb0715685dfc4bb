//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Configuration model, loading, and path resolution."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Placeholder substituted with a remote file path in command templates.
pub const FILE_PLACEHOLDER: &str = "{file}";

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("history")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("run/provisync.lock")
}

fn default_vault_dir() -> PathBuf {
    PathBuf::from("vault")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_api_port() -> u16 {
    50443
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_remote_dir() -> String {
    ".".to_owned()
}

fn default_fetch_pattern() -> String {
    "*".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_key_fields() -> usize {
    1
}

fn default_add_pattern() -> String {
    "*add*".to_owned()
}

fn default_delete_pattern() -> String {
    "*del*".to_owned()
}

fn default_save_command() -> String {
    "flow save {file}".to_owned()
}

fn default_state_file() -> String {
    "current_flows.txt".to_owned()
}

fn default_remove_command() -> String {
    "flow delete file {file}".to_owned()
}

fn default_add_command() -> String {
    "flow add file {file}".to_owned()
}

fn default_apply_command() -> String {
    "load config {file}".to_owned()
}

fn default_commit_command() -> String {
    "commit".to_owned()
}

fn default_shaper_header() -> Vec<String> {
    vec!["traffic-manager".to_owned()]
}

fn default_shaper_footer() -> Vec<String> {
    vec!["exit".to_owned(), "end".to_owned()]
}

fn default_shaper_file_name() -> String {
    "shaper.cfg".to_owned()
}

/// Primary configuration object for a provisync installation.
///
/// Built once at process start and handed to every component by reference.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Project root every relative path is resolved against.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub targets: IndexMap<String, TargetConfig>,
    #[serde(default)]
    pub sources: IndexMap<String, SourceConfig>,
    #[serde(default)]
    pub subscriber: Option<SubscriberTaskConfig>,
    #[serde(default)]
    pub shaper: Option<ShaperTaskConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "PROVISYNC_CONFIG";

    /// Load configuration from disk, respecting the `PROVISYNC_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let mut config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        let config_dir = path
            .absolutize()
            .with_context(|| format!("unable to resolve config path {}", path.display()))?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        config.root = Some(match config.root.take() {
            Some(root) => root
                .absolutize_from(&config_dir)
                .with_context(|| format!("unable to resolve root {}", root.display()))?
                .into_owned(),
            None => config_dir,
        });
        config.validate()?;
        Ok(config)
    }

    /// Replace the project root.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Resolve every configured directory against the project root.
    pub fn paths(&self) -> Result<ResolvedPaths> {
        let root = self
            .root
            .clone()
            .ok_or_else(|| anyhow!("configuration root is not set"))?;
        if !root.is_absolute() {
            return Err(anyhow!(
                "configuration root {} must be absolute",
                root.display()
            ));
        }
        Ok(ResolvedPaths {
            work_dir: resolve_against(&root, &self.paths.work_dir)?,
            history_dir: resolve_against(&root, &self.paths.history_dir)?,
            lock_file: resolve_against(&root, &self.paths.lock_file)?,
            vault_dir: resolve_against(&root, &self.paths.vault_dir)?,
            log_dir: resolve_against(&root, &self.logging.directory)?,
            root,
        })
    }

    /// Retrieve a target by identifier.
    pub fn target(&self, target_id: &str) -> Option<&TargetConfig> {
        self.targets.get(target_id)
    }

    /// Retrieve an instruction source by identifier.
    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.get(source_id)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        for (target_id, target) in &self.targets {
            target.validate(target_id, &self.targets)?;
        }
        for (source_id, source) in &self.sources {
            source.validate(source_id, &self.targets)?;
        }
        if let Some(task) = &self.subscriber {
            self.validate_task_refs("subscriber", &task.target, &task.source)?;
            validate_key_fields("subscriber", task.key_fields)?;
            for (name, template) in [
                ("save_command", &task.save_command),
                ("remove_command", &task.remove_command),
                ("add_command", &task.add_command),
            ] {
                validate_template("subscriber", name, template)?;
            }
        }
        if let Some(task) = &self.shaper {
            self.validate_task_refs("shaper", &task.target, &task.source)?;
            validate_key_fields("shaper", task.key_fields)?;
            validate_template("shaper", "apply_command", &task.apply_command)?;
            if task.commit_command.trim().is_empty() {
                return Err(anyhow!("shaper commit_command must not be empty"));
            }
        }
        Ok(())
    }

    fn validate_task_refs(&self, task: &str, target: &str, source: &str) -> Result<()> {
        if !self.targets.contains_key(target) {
            return Err(anyhow!("{} task references unknown target '{}'", task, target));
        }
        if !self.sources.contains_key(source) {
            return Err(anyhow!("{} task references unknown source '{}'", task, source));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn resolve_against(root: &Path, path: &Path) -> Result<PathBuf> {
    Ok(path
        .absolutize_from(root)
        .with_context(|| format!("unable to resolve {} against {}", path.display(), root.display()))?
        .into_owned())
}

fn validate_key_fields(task: &str, key_fields: usize) -> Result<()> {
    if key_fields == 0 {
        return Err(anyhow!("{} key_fields must be at least 1", task));
    }
    Ok(())
}

fn validate_template(task: &str, name: &str, template: &str) -> Result<()> {
    if !template.contains(FILE_PLACEHOLDER) {
        return Err(anyhow!(
            "{} {} '{}' must contain the {} placeholder",
            task,
            name,
            template,
            FILE_PLACEHOLDER
        ));
    }
    Ok(())
}

/// Substitute the remote file path into a command template.
pub fn render_command(template: &str, remote_file: &str) -> String {
    template.replace(FILE_PLACEHOLDER, remote_file)
}

/// Absolute directories derived from [`AppConfig`] and its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub root: PathBuf,
    pub work_dir: PathBuf,
    pub history_dir: PathBuf,
    pub lock_file: PathBuf,
    pub vault_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl ResolvedPaths {
    /// Password file of a REST target: `<vault_dir>/.pass_<target_id>`.
    pub fn password_file(&self, target_id: &str) -> PathBuf {
        self.vault_dir.join(format!(".pass_{target_id}"))
    }

    /// Per-task scratch directory below the work directory.
    pub fn task_dir(&self, task: &str) -> PathBuf {
        self.work_dir.join(task)
    }

    /// Directory the raw instruction files of a task are fetched into.
    pub fn raw_dir(&self, task: &str) -> PathBuf {
        self.task_dir(task).join("raw")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    /// Directory holding per-target password files.
    #[serde(default = "default_vault_dir")]
    pub vault_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            history_dir: default_history_dir(),
            lock_file: default_lock_file(),
            vault_dir: default_vault_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// How commands and configuration patches reach a target. File transfers
/// always use scp.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Ssh,
    /// HTTPS management API with basic auth (`POST /cli`, `PATCH /config`).
    Rest,
}

/// A host reachable over ssh: the managed device, a bastion, or a data source.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    #[serde(default)]
    pub kind: TargetKind,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Identifier of another target used as an ssh jump host.
    #[serde(default)]
    pub bastion: Option<String>,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    #[serde(default)]
    pub verify_checksum: bool,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Overrides `https://<host>:<api_port>/api/v1`.
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Devices commonly present self-signed certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_api_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub api_timeout: Duration,
}

impl TargetConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            kind: TargetKind::default(),
            port: default_ssh_port(),
            user: None,
            identity_file: None,
            bastion: None,
            remote_dir: default_remote_dir(),
            verify_checksum: false,
            connect_timeout: default_connect_timeout(),
            api_port: default_api_port(),
            api_base_url: None,
            accept_invalid_certs: false,
            api_timeout: default_api_timeout(),
        }
    }

    /// Management API root without a trailing slash.
    pub fn api_base_url(&self) -> String {
        match &self.api_base_url {
            Some(url) => url.trim_end_matches('/').to_owned(),
            None => format!("https://{}:{}/api/v1", self.host, self.api_port),
        }
    }

    /// `user@host` form understood by ssh, scp and rsync.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Remote path for a local file basename.
    pub fn remote_path(&self, basename: &str) -> String {
        format!("{}/{}", self.remote_dir.trim_end_matches('/'), basename)
    }

    fn validate(&self, target_id: &str, targets: &IndexMap<String, TargetConfig>) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("target '{}' must declare a host", target_id));
        }
        if self.kind == TargetKind::Rest && self.user.is_none() {
            return Err(anyhow!("rest target '{}' must declare a user", target_id));
        }
        if let Some(bastion) = &self.bastion {
            if bastion == target_id {
                return Err(anyhow!("target '{}' cannot be its own bastion", target_id));
            }
            if !targets.contains_key(bastion) {
                return Err(anyhow!(
                    "target '{}' references unknown bastion '{}'",
                    target_id,
                    bastion
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Rsync,
    Local,
}

/// Mirror semantics of an instruction fetch.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Destination becomes an exact mirror, deletions included.
    #[default]
    Sync,
    /// Only adds or updates files in the destination.
    Copy,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Sync => "sync",
            FetchMode::Copy => "copy",
        }
    }
}

/// Central location instruction files are pulled from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,
    /// Target used for the ssh connection of an `rsync` source.
    #[serde(default)]
    pub target: Option<String>,
    pub path: PathBuf,
    #[serde(default)]
    pub bandwidth_limit_kbps: Option<u32>,
}

impl SourceConfig {
    fn validate(&self, source_id: &str, targets: &IndexMap<String, TargetConfig>) -> Result<()> {
        match self.kind {
            SourceKind::Rsync => match &self.target {
                Some(target) if targets.contains_key(target) => Ok(()),
                Some(target) => Err(anyhow!(
                    "source '{}' references unknown target '{}'",
                    source_id,
                    target
                )),
                None => Err(anyhow!(
                    "rsync source '{}' must declare a target",
                    source_id
                )),
            },
            SourceKind::Local => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberTaskConfig {
    pub target: String,
    pub source: String,
    #[serde(default)]
    pub fetch_mode: FetchMode,
    #[serde(default = "default_fetch_pattern")]
    pub fetch_pattern: String,
    #[serde(default = "default_add_pattern")]
    pub add_pattern: String,
    #[serde(default = "default_delete_pattern")]
    pub delete_pattern: String,
    #[serde(default = "default_true")]
    pub has_header: bool,
    #[serde(default = "default_key_fields")]
    pub key_fields: usize,
    #[serde(default = "default_save_command")]
    pub save_command: String,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_remove_command")]
    pub remove_command: String,
    #[serde(default = "default_add_command")]
    pub add_command: String,
}

impl SubscriberTaskConfig {
    pub fn new(target: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: source.into(),
            fetch_mode: FetchMode::default(),
            fetch_pattern: default_fetch_pattern(),
            add_pattern: default_add_pattern(),
            delete_pattern: default_delete_pattern(),
            has_header: true,
            key_fields: default_key_fields(),
            save_command: default_save_command(),
            state_file: default_state_file(),
            remove_command: default_remove_command(),
            add_command: default_add_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShaperTaskConfig {
    pub target: String,
    pub source: String,
    #[serde(default)]
    pub fetch_mode: FetchMode,
    #[serde(default = "default_fetch_pattern")]
    pub fetch_pattern: String,
    #[serde(default = "default_true")]
    pub has_header: bool,
    #[serde(default = "default_key_fields")]
    pub key_fields: usize,
    #[serde(default = "default_apply_command")]
    pub apply_command: String,
    #[serde(default = "default_commit_command")]
    pub commit_command: String,
    #[serde(default = "default_shaper_header")]
    pub header: Vec<String>,
    #[serde(default = "default_shaper_footer")]
    pub footer: Vec<String>,
    #[serde(default = "default_shaper_file_name")]
    pub file_name: String,
}

impl ShaperTaskConfig {
    pub fn new(target: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: source.into(),
            fetch_mode: FetchMode::default(),
            fetch_pattern: default_fetch_pattern(),
            has_header: true,
            key_fields: default_key_fields(),
            apply_command: default_apply_command(),
            commit_command: default_commit_command(),
            header: default_shaper_header(),
            footer: default_shaper_footer(),
            file_name: default_shaper_file_name(),
        }
    }
}
