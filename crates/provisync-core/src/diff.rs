//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Minimal changeset computation between desired and deployed state."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::collections::HashSet;

use provisync_persistence::ChangeCounts;
use serde::Serialize;

use crate::state::StateSnapshot;
use crate::transform::ShaperSnapshot;

/// Lines to push to and withdraw from the device. Removals run first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Changeset {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            added: self.to_add.len(),
            removed: self.to_remove.len(),
        }
    }
}

/// Exact-line diff for the subscriber flow table.
///
/// `to_add` holds desired-add lines missing from `current`, `to_remove` holds
/// desired-delete lines present in it. Both keep desired order without
/// repeats, so identical inputs always give the identical changeset.
pub fn diff_lines(desired_add: &[String], desired_delete: &[String], current: &StateSnapshot) -> Changeset {
    let mut seen = HashSet::new();
    let to_add = desired_add
        .iter()
        .filter(|line| !current.contains(line) && seen.insert(line.as_str()))
        .cloned()
        .collect();
    let mut seen = HashSet::new();
    let to_remove = desired_delete
        .iter()
        .filter(|line| current.contains(line) && seen.insert(line.as_str()))
        .cloned()
        .collect();
    Changeset { to_add, to_remove }
}

/// What to do with a freshly rendered shaper block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum ShaperDecision {
    /// Byte-identical to the last applied baseline.
    Skipped,
    /// The whole block replaces the device's shaping configuration.
    Apply { snapshot: ShaperSnapshot },
}

impl ShaperDecision {
    pub fn is_skipped(&self) -> bool {
        matches!(self, ShaperDecision::Skipped)
    }
}

/// Whole-block comparison against the last applied baseline.
pub fn diff_shaper(rendered: ShaperSnapshot, baseline: Option<&str>) -> ShaperDecision {
    match baseline {
        Some(previous) if previous == rendered.text() => ShaperDecision::Skipped,
        _ => ShaperDecision::Apply { snapshot: rendered },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::ShaperRenderer;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn add_is_difference_remove_is_intersection() {
        let current = StateSnapshot::from_lines(lines(&["B", "C"]));
        let changes = diff_lines(&lines(&["A", "B"]), &lines(&["C", "D"]), &current);
        assert_eq!(changes.to_add, lines(&["A"]));
        assert_eq!(changes.to_remove, lines(&["C"]));
        assert_eq!(changes.counts(), ChangeCounts { added: 1, removed: 1 });
    }

    #[test]
    fn line_never_lands_in_both_sets() {
        let current = StateSnapshot::from_lines(lines(&["X"]));
        let changes = diff_lines(&lines(&["X", "Y"]), &lines(&["X", "Y"]), &current);
        for line in &changes.to_add {
            assert!(!changes.to_remove.contains(line));
        }
        assert_eq!(changes.to_add, lines(&["Y"]));
        assert_eq!(changes.to_remove, lines(&["X"]));
    }

    #[test]
    fn identical_inputs_are_reproducible() {
        let current = StateSnapshot::from_lines(lines(&["B"]));
        let add = lines(&["C", "A", "C", "B"]);
        let first = diff_lines(&add, &[], &current);
        let second = diff_lines(&add, &[], &current);
        assert_eq!(first, second);
        assert_eq!(first.to_add, lines(&["C", "A"]));
    }

    #[test]
    fn matching_baseline_skips_shaper() {
        let renderer = ShaperRenderer::new(vec!["traffic-manager".into()], vec!["end".into()]);
        let rendered = renderer.render(&[]);
        let text = rendered.text().to_owned();
        assert!(diff_shaper(rendered.clone(), Some(&text)).is_skipped());
        assert!(!diff_shaper(rendered.clone(), None).is_skipped());
        assert!(!diff_shaper(rendered, Some("traffic-manager\n")).is_skipped());
    }
}
