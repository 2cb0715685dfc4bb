//! ---
//! ps_section: "05-networking-external-interfaces"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Collaborator interfaces for fetch, remote exec, and transfer."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use provisync_common::{AppConfig, FetchMode};
use tracing::{debug, info};

use super::InstructionSource;
use crate::error::{ReconcileError, Result};

/// Instruction source reading from a directory on the local filesystem.
pub struct LocalDirSource {
    config: Arc<AppConfig>,
}

impl LocalDirSource {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    fn source_dir(&self, source_id: &str) -> Result<PathBuf> {
        let source = self
            .config
            .source(source_id)
            .ok_or_else(|| ReconcileError::ConfigMissing(format!("unknown source '{source_id}'")))?;
        Ok(match (&self.config.root, source.path.is_relative()) {
            (Some(root), true) => root.join(&source.path),
            _ => source.path.clone(),
        })
    }
}

impl InstructionSource for LocalDirSource {
    fn fetch(&self, source_id: &str, dest_dir: &Path, mode: FetchMode, pattern: &str) -> Result<()> {
        let source_dir = self.source_dir(source_id)?;
        let matcher = glob::Pattern::new(pattern).map_err(|err| {
            ReconcileError::ConfigMissing(format!("invalid fetch pattern '{pattern}': {err}"))
        })?;
        if !source_dir.is_dir() {
            return Err(ReconcileError::connection(
                source_id,
                format!("source directory {} is not readable", source_dir.display()),
            ));
        }
        fs::create_dir_all(dest_dir)?;

        let mut copied: HashSet<OsString> = HashSet::new();
        for entry in fs::read_dir(&source_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if !entry.file_type()?.is_file() || !matcher.matches(&name.to_string_lossy()) {
                continue;
            }
            fs::copy(entry.path(), dest_dir.join(&name))?;
            copied.insert(name);
        }

        let mut removed = 0usize;
        if mode == FetchMode::Sync {
            for entry in fs::read_dir(dest_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() && !copied.contains(&entry.file_name()) {
                    debug!(path = %entry.path().display(), "removing file absent from source");
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        info!(
            source = source_id,
            mode = mode.as_str(),
            copied = copied.len(),
            removed,
            "instruction files fetched"
        );
        Ok(())
    }
}
