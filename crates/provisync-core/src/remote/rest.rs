//! ---
//! ps_section: "05-networking-external-interfaces"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Device management API client for REST targets."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::error::Error as _;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use provisync_common::{AppConfig, TargetConfig};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{ConfigApplier, RemoteExec};
use crate::error::{ReconcileError, Result};

/// Runs commands and pushes configuration patches through a device's HTTPS
/// management API.
///
/// * `POST <base>/cli` with `{"cmd": ...}` runs an operational command.
/// * `PATCH <base>/config` with a multipart `config` part merges a patch
///   without committing it.
///
/// Both authenticate with basic auth; the password is read from the vault
/// file of the target.
pub struct RestApiGateway {
    config: Arc<AppConfig>,
}

impl RestApiGateway {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    fn target(&self, target_id: &str) -> Result<&TargetConfig> {
        self.config
            .target(target_id)
            .ok_or_else(|| ReconcileError::ConfigMissing(format!("unknown target '{target_id}'")))
    }

    fn credentials(&self, target_id: &str, target: &TargetConfig) -> Result<(String, String)> {
        let user = target.user.clone().ok_or_else(|| {
            ReconcileError::ConfigMissing(format!("rest target '{target_id}' has no user"))
        })?;
        let paths = self
            .config
            .paths()
            .map_err(|err| ReconcileError::ConfigMissing(format!("{err:#}")))?;
        let pass_file = paths.password_file(target_id);
        let password = match fs::read_to_string(&pass_file) {
            Ok(contents) => contents.trim().to_owned(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ReconcileError::CredentialMissing(format!(
                    "password file {} not found",
                    pass_file.display()
                )))
            }
            Err(err) => return Err(err.into()),
        };
        if password.is_empty() {
            return Err(ReconcileError::CredentialMissing(format!(
                "password file {} is empty",
                pass_file.display()
            )));
        }
        Ok((user, password))
    }

    fn client(&self, target_id: &str, target: &TargetConfig) -> Result<Client> {
        Client::builder()
            .danger_accept_invalid_certs(target.accept_invalid_certs)
            .connect_timeout(target.connect_timeout)
            .timeout(target.api_timeout)
            .build()
            .map_err(|err| ReconcileError::connection(target_id, describe(&err)))
    }

    fn send(&self, target_id: &str, request: RequestBuilder) -> Result<Response> {
        request
            .send()
            .and_then(Response::error_for_status)
            .map_err(|err| ReconcileError::connection(target_id, describe(&err)))
    }
}

impl RemoteExec for RestApiGateway {
    fn exec(&self, target_id: &str, command: &str, output_sink: Option<&Path>) -> Result<()> {
        let target = self.target(target_id)?;
        let (user, password) = self.credentials(target_id, target)?;
        let url = format!("{}/cli", target.api_base_url());
        let request = self
            .client(target_id, target)?
            .post(&url)
            .basic_auth(user, Some(password))
            .json(&json!({ "cmd": command }));
        let body: Value = self
            .send(target_id, request)?
            .json()
            .map_err(|err| ReconcileError::connection(target_id, describe(&err)))?;

        if let Some(sink) = output_sink {
            let output = match body {
                Value::String(text) => text,
                other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
            };
            if let Some(parent) = sink.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(sink, output)?;
        }
        info!(device = target_id, command, "api command completed");
        Ok(())
    }
}

impl ConfigApplier for RestApiGateway {
    /// Sends the local copy of `file_path`. A blank file is skipped.
    fn apply_config(&self, target_id: &str, file_path: &Path) -> Result<()> {
        let target = self.target(target_id)?;
        let contents = fs::read(file_path)?;
        if contents.iter().all(u8::is_ascii_whitespace) {
            warn!(device = target_id, file = %file_path.display(), "configuration patch is empty; skipped");
            return Ok(());
        }
        let (user, password) = self.credentials(target_id, target)?;
        let part = Part::bytes(contents)
            .file_name("config.txt")
            .mime_str("text/plain")
            .map_err(|err| ReconcileError::connection(target_id, describe(&err)))?;
        let url = format!("{}/config", target.api_base_url());
        let request = self
            .client(target_id, target)?
            .patch(&url)
            .basic_auth(user, Some(password))
            .multipart(Form::new().part("config", part));
        self.send(target_id, request)?;
        info!(device = target_id, file = %file_path.display(), "configuration patched over api");
        Ok(())
    }
}

/// reqwest hides the interesting part (refused, timed out, tls) in the source chain.
fn describe(err: &reqwest::Error) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}
