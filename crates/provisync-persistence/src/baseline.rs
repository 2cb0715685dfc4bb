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
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::Result;

/// File name of the last-applied shaper configuration inside the history directory.
pub const BASELINE_FILE: &str = "shaper_baseline.cfg";

/// The last successfully applied shaper snapshot.
///
/// Stored verbatim next to a `.sha256` sidecar. A baseline whose sidecar does
/// not verify is reported as absent so the next run re-applies instead of
/// skipping on corrupt data.
#[derive(Debug, Clone)]
pub struct ShaperBaseline {
    path: PathBuf,
}

impl ShaperBaseline {
    /// Baseline stored under `history_dir`.
    pub fn in_dir(history_dir: &Path) -> Self {
        Self {
            path: history_dir.join(BASELINE_FILE),
        }
    }

    /// Path of the baseline file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sidecar(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".sha256");
        PathBuf::from(name)
    }

    /// Load the baseline, `None` if absent or failing verification.
    pub fn load(&self) -> Result<Option<String>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let recorded = match fs::read_to_string(self.sidecar()) {
            Ok(hash) => hash,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "baseline has no checksum sidecar; ignoring it");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if !recorded.trim().eq_ignore_ascii_case(&digest(&contents)) {
            warn!(path = %self.path.display(), "baseline checksum mismatch; ignoring it");
            return Ok(None);
        }
        Ok(Some(contents))
    }

    /// Byte-for-byte comparison of `rendered` with the stored baseline.
    pub fn matches(&self, rendered: &str) -> Result<bool> {
        Ok(self.load()?.as_deref() == Some(rendered))
    }

    /// Replace the baseline with `rendered`.
    pub fn save(&self, rendered: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_replace(&self.path, rendered.as_bytes())?;
        write_replace(&self.sidecar(), format!("{}\n", digest(rendered)).as_bytes())?;
        Ok(())
    }
}

fn write_replace(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn digest(contents: &str) -> String {
    hex::encode(Sha256::digest(contents.as_bytes()))
}
