//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Instruction records and instruction file decoding."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;

use flate2::read::MultiGzDecoder;
use serde::Serialize;

use crate::error::{ReconcileError, Result};

/// Separator between positional fields of an instruction line.
pub const FIELD_DELIMITER: char = '@';

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Which instruction set a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionCategory {
    Add,
    Delete,
}

impl InstructionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionCategory::Add => "add",
            InstructionCategory::Delete => "delete",
        }
    }
}

impl fmt::Display for InstructionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of desired policy, immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstructionRecord {
    key: String,
    fields: Vec<String>,
    category: InstructionCategory,
}

impl InstructionRecord {
    /// Parse a delimited line. The composite key is the first `key_fields`
    /// fields joined by the delimiter.
    pub fn parse(
        line: &str,
        key_fields: usize,
        category: InstructionCategory,
        location: &str,
    ) -> Result<Self> {
        let fields: Vec<String> = line
            .split(FIELD_DELIMITER)
            .map(|field| field.trim().to_owned())
            .collect();
        if fields.len() < key_fields {
            return Err(malformed(
                location,
                format!("expected at least {key_fields} key field(s), found {}", fields.len()),
            ));
        }
        let key = fields[..key_fields].join(&FIELD_DELIMITER.to_string());
        if key.trim_matches(FIELD_DELIMITER).is_empty() {
            return Err(malformed(location, "empty composite key"));
        }
        Ok(Self {
            key,
            fields,
            category,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn category(&self) -> InstructionCategory {
        self.category
    }

    /// The record in its canonical delimited form.
    pub fn canonical_line(&self) -> String {
        self.fields.join(&FIELD_DELIMITER.to_string())
    }

    /// Fields joined by single spaces.
    pub fn expanded(&self) -> String {
        self.fields.join(" ")
    }

    /// Whitespace-separated tokens across every field.
    pub fn tokens(&self) -> impl Iterator<Item = &str> + '_ {
        self.fields.iter().flat_map(|field| field.split_whitespace())
    }
}

pub(crate) fn malformed(location: &str, reason: impl Into<String>) -> ReconcileError {
    ReconcileError::MalformedInstruction {
        location: location.to_owned(),
        reason: reason.into(),
    }
}

/// One non-blank line of an instruction file.
#[derive(Debug)]
pub struct InstructionLine {
    /// 1-based line number within the (inflated) file.
    pub number: usize,
    /// Trimmed text, or `MalformedInstruction` when the bytes are not UTF-8.
    pub text: Result<String>,
}

/// Read an instruction file, transparently inflating gzip input.
///
/// Lines are decoded one at a time so a single undecodable record does not
/// take the rest of the file with it. Lines are trimmed and blank lines
/// dropped.
pub fn read_instruction_lines(path: &Path) -> Result<Vec<InstructionLine>> {
    let raw = fs::read(path)?;
    let bytes = if raw.starts_with(&GZIP_MAGIC) {
        let mut inflated = Vec::new();
        MultiGzDecoder::new(raw.as_slice()).read_to_end(&mut inflated)?;
        inflated
    } else {
        raw
    };

    let mut lines = Vec::new();
    for (idx, chunk) in bytes.split(|byte| *byte == b'\n').enumerate() {
        let number = idx + 1;
        let text = match std::str::from_utf8(chunk) {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                Ok(text.to_owned())
            }
            Err(err) => Err(malformed(
                &format!("{}:{}", path.display(), number),
                format!("line is not valid UTF-8: {err}"),
            )),
        };
        lines.push(InstructionLine { number, text });
    }
    Ok(lines)
}
