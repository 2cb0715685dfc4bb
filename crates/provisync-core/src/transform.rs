//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Conversion of instruction records into native device syntax."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use provisync_common::ShaperTaskConfig;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::instruction::{malformed, InstructionRecord};

const IDENTIFIER_SEGMENTS: usize = 4;
const UNLIMITED_RATE: &str = "0";

/// Native lines produced from a record set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformReport {
    pub lines: Vec<String>,
    pub skipped: usize,
}

/// Deterministic rules mapping canonical records onto device syntax.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatTransformer;

impl FormatTransformer {
    /// Subscriber flow lines: the record's fields joined by single spaces.
    pub fn subscriber_lines(&self, records: &[InstructionRecord]) -> TransformReport {
        TransformReport {
            lines: records.iter().map(InstructionRecord::expanded).collect(),
            skipped: 0,
        }
    }

    /// `subport <identifier> shaper pir <rate>` for one record.
    ///
    /// The identifier comes from the record's first token, the rate from the
    /// first `rate <value>` or `infinity` token.
    pub fn shaper_line(&self, record: &InstructionRecord) -> Result<String> {
        let mut tokens = record.tokens();
        let token = tokens
            .next()
            .ok_or_else(|| malformed(record.key(), "record has no tokens"))?;
        let identifier = reconstruct_identifier(token).ok_or_else(|| {
            malformed(
                record.key(),
                format!("identifier '{token}' has fewer than {IDENTIFIER_SEGMENTS} segments"),
            )
        })?;
        let rate = extract_rate(tokens)
            .ok_or_else(|| malformed(record.key(), "no usable rate or infinity token"))?;
        Ok(format!("subport {identifier} shaper pir {rate}"))
    }

    /// Shaper body lines; malformed records are skipped and counted.
    pub fn shaper_lines(&self, records: &[InstructionRecord]) -> TransformReport {
        let mut report = TransformReport::default();
        for record in records {
            match self.shaper_line(record) {
                Ok(line) => report.lines.push(line),
                Err(err) => {
                    report.skipped += 1;
                    warn!(error_kind = err.kind(), %err, "shaper record skipped");
                }
            }
        }
        report
    }
}

/// Re-join segments two through four of an underscore token with hyphens.
pub fn reconstruct_identifier(token: &str) -> Option<String> {
    let segments: Vec<&str> = token.split('_').collect();
    if segments.len() < IDENTIFIER_SEGMENTS {
        return None;
    }
    Some(segments[1..IDENTIFIER_SEGMENTS].join("-"))
}

/// Digits of the value after `rate`, or the unlimited sentinel for `infinity`.
pub fn extract_rate<'a>(tokens: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut tokens = tokens.into_iter();
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("infinity") {
            return Some(UNLIMITED_RATE.to_owned());
        }
        if token.eq_ignore_ascii_case("rate") {
            let digits: String = tokens
                .next()
                .unwrap_or_default()
                .chars()
                .filter(char::is_ascii_digit)
                .collect();
            return if digits.is_empty() { None } else { Some(digits) };
        }
    }
    None
}

/// The whole rendered shaping block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShaperSnapshot {
    text: String,
    entries: usize,
    skipped: usize,
}

impl ShaperSnapshot {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Body lines generated.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Records dropped as malformed.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Frames shaper body lines between the configured header and footer.
#[derive(Debug, Clone)]
pub struct ShaperRenderer {
    header: Vec<String>,
    footer: Vec<String>,
    transformer: FormatTransformer,
}

impl ShaperRenderer {
    pub fn new(header: Vec<String>, footer: Vec<String>) -> Self {
        Self {
            header,
            footer,
            transformer: FormatTransformer,
        }
    }

    pub fn from_config(config: &ShaperTaskConfig) -> Self {
        Self::new(config.header.clone(), config.footer.clone())
    }

    pub fn render(&self, records: &[InstructionRecord]) -> ShaperSnapshot {
        let body = self.transformer.shaper_lines(records);
        let mut text = String::new();
        for line in self.header.iter().chain(&body.lines).chain(&self.footer) {
            text.push_str(line);
            text.push('\n');
        }
        if body.lines.is_empty() {
            warn!(skipped = body.skipped, "shaper snapshot has no body entries");
        } else {
            info!(entries = body.lines.len(), skipped = body.skipped, "shaper snapshot rendered");
        }
        ShaperSnapshot {
            text,
            entries: body.lines.len(),
            skipped: body.skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::InstructionCategory;

    fn record(line: &str) -> InstructionRecord {
        InstructionRecord::parse(line, 1, InstructionCategory::Add, "test").unwrap()
    }

    #[test]
    fn identifier_uses_segments_two_to_four() {
        assert_eq!(reconstruct_identifier("Down_AA_BB_CC").as_deref(), Some("AA-BB-CC"));
        assert_eq!(reconstruct_identifier("Up_AA_BB_CC_DD").as_deref(), Some("AA-BB-CC"));
        assert_eq!(reconstruct_identifier("Down_AA_BB"), None);
    }

    #[test]
    fn rate_keeps_digits_and_maps_infinity() {
        assert_eq!(extract_rate(["rate", "100M"]).as_deref(), Some("100"));
        assert_eq!(extract_rate(["infinity"]).as_deref(), Some("0"));
        assert_eq!(extract_rate(["rate", "fast"]), None);
        assert_eq!(extract_rate(["burst", "5"]), None);
    }

    #[test]
    fn shaper_line_from_delimited_record() {
        let line = FormatTransformer
            .shaper_line(&record("Down_AA_BB_CC@rate 100M"))
            .unwrap();
        assert_eq!(line, "subport AA-BB-CC shaper pir 100");
    }

    #[test]
    fn short_identifiers_are_skipped() {
        let snapshot = ShaperRenderer::new(vec!["traffic-manager".into()], vec!["exit".into(), "end".into()])
            .render(&[record("Down_AA_BB@rate 5M"), record("Up_X_Y_Z@infinity")]);
        assert_eq!(snapshot.entries(), 1);
        assert_eq!(snapshot.skipped(), 1);
        assert_eq!(
            snapshot.text(),
            "traffic-manager\nsubport X-Y-Z shaper pir 0\nexit\nend\n"
        );
    }

    #[test]
    fn empty_body_still_framed() {
        let snapshot = ShaperRenderer::new(vec!["traffic-manager".into()], vec!["end".into()]).render(&[]);
        assert_eq!(snapshot.entries(), 0);
        assert_eq!(snapshot.text(), "traffic-manager\nend\n");
    }

    #[test]
    fn subscriber_lines_expand_delimiters() {
        let report = FormatTransformer.subscriber_lines(&[record("flow@10.0.0.1@permit")]);
        assert_eq!(report.lines, vec!["flow 10.0.0.1 permit".to_owned()]);
    }
}
