//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Instruction merging with key deduplication and overwrite protection."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use path_absolutize::Absolutize;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, Result};
use crate::instruction::{read_instruction_lines, InstructionCategory, InstructionRecord};

/// Outcome of one merge.
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub output: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub header: Option<String>,
    /// Deduplicated records in first-seen key order.
    pub records: Vec<InstructionRecord>,
    /// Records replaced by a later occurrence of the same key.
    pub duplicates: usize,
    /// Lines dropped as malformed.
    pub malformed: usize,
}

/// Consolidates partial instruction files into one canonical working set.
#[derive(Debug, Clone, Copy)]
pub struct InstructionMerger {
    has_header: bool,
    key_fields: usize,
}

impl InstructionMerger {
    pub fn new(has_header: bool, key_fields: usize) -> Self {
        Self {
            has_header,
            key_fields: key_fields.max(1),
        }
    }

    /// Merge the files in `dir` whose names match the glob `pattern`, in file
    /// name order.
    pub fn merge_matching(
        &self,
        dir: &Path,
        pattern: &str,
        output: &Path,
        category: InstructionCategory,
    ) -> Result<MergeReport> {
        let matcher = glob::Pattern::new(pattern).map_err(|err| {
            ReconcileError::ConfigMissing(format!("invalid file pattern '{pattern}': {err}"))
        })?;
        ensure_distinct_dirs(dir, output)?;

        let mut inputs = Vec::new();
        if dir.is_dir() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                if matcher.matches(&entry.file_name().to_string_lossy()) {
                    inputs.push(entry.path());
                }
            }
        }
        inputs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        debug!(dir = %dir.display(), pattern, matched = inputs.len(), "merge inputs discovered");
        self.merge(&inputs, output, category)
    }

    /// Merge `inputs` in order into `output`.
    ///
    /// A later record with an already-seen key replaces the earlier payload but
    /// keeps its position. Only the first header is written. The output is
    /// staged next to its final name and renamed into place.
    pub fn merge(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        category: InstructionCategory,
    ) -> Result<MergeReport> {
        ensure_safe_output(inputs, output)?;

        let mut header = None;
        let mut merged: IndexMap<String, InstructionRecord> = IndexMap::new();
        let mut duplicates = 0;
        let mut malformed = 0;

        for input in inputs {
            let mut lines = read_instruction_lines(input)?.into_iter();
            if self.has_header {
                match lines.next().map(|line| line.text) {
                    Some(Ok(first)) => {
                        header.get_or_insert(first);
                    }
                    Some(Err(err)) => {
                        malformed += 1;
                        warn!(error_kind = err.kind(), %err, "header line skipped");
                    }
                    None => {}
                }
            }
            for line in lines {
                let location = format!("{}:{}", input.display(), line.number);
                let parsed = line
                    .text
                    .and_then(|text| InstructionRecord::parse(&text, self.key_fields, category, &location));
                match parsed {
                    Ok(record) => {
                        if merged.insert(record.key().to_owned(), record).is_some() {
                            duplicates += 1;
                        }
                    }
                    Err(err) => {
                        malformed += 1;
                        warn!(error_kind = err.kind(), %err, "instruction skipped");
                    }
                }
            }
        }

        let records: Vec<InstructionRecord> = merged.into_values().collect();
        write_staged(output, header.as_deref(), &records)?;
        info!(
            output = %output.display(),
            category = category.as_str(),
            inputs = inputs.len(),
            records = records.len(),
            duplicates,
            malformed,
            "instructions merged"
        );
        Ok(MergeReport {
            output: output.to_path_buf(),
            inputs: inputs.to_vec(),
            header,
            records,
            duplicates,
            malformed,
        })
    }
}

fn write_staged(output: &Path, header: Option<&str>, records: &[InstructionRecord]) -> Result<()> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut staged = output.as_os_str().to_owned();
    staged.push(".partial");
    let staged = PathBuf::from(staged);
    {
        let mut file = fs::File::create(&staged)?;
        if let Some(header) = header {
            writeln!(file, "{header}")?;
        }
        for record in records {
            writeln!(file, "{}", record.canonical_line())?;
        }
        file.sync_all()?;
    }
    fs::rename(&staged, output)?;
    Ok(())
}

fn ensure_safe_output(inputs: &[PathBuf], output: &Path) -> Result<()> {
    let output_abs = resolve(output)?;
    for input in inputs {
        let input_abs = resolve(input)?;
        if input_abs == output_abs {
            return Err(unsafe_overwrite(output, format!("output is the input file {}", input.display())));
        }
        if input_abs.parent() == output_abs.parent() {
            return Err(unsafe_overwrite(
                output,
                format!("output shares a directory with input {}", input.display()),
            ));
        }
    }
    Ok(())
}

fn ensure_distinct_dirs(dir: &Path, output: &Path) -> Result<()> {
    let output_abs = resolve(output)?;
    if output_abs.parent() == Some(resolve(dir)?.as_path()) {
        return Err(unsafe_overwrite(
            output,
            format!("output lies inside the input directory {}", dir.display()),
        ));
    }
    Ok(())
}

/// Absolute form of `path` with symlinks in its parent resolved where the
/// parent exists.
fn resolve(path: &Path) -> Result<PathBuf> {
    let absolute = path.absolutize()?.into_owned();
    if let Ok(canonical) = fs::canonicalize(&absolute) {
        return Ok(canonical);
    }
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => match fs::canonicalize(parent) {
            Ok(parent) => Ok(parent.join(name)),
            Err(_) => Ok(absolute),
        },
        _ => Ok(absolute),
    }
}

fn unsafe_overwrite(output: &Path, reason: String) -> ReconcileError {
    ReconcileError::UnsafeOverwrite {
        output: output.to_path_buf(),
        reason,
    }
}
