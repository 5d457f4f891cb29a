//! Collapse raw records that describe the same pick.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use reel_core::RawPick;
use serde::{Deserialize, Serialize};

use crate::report::{Category, ReportBuilder, ReportEntry, Stage};

/// Which record of a duplicate set survives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakPolicy {
    /// Longest review text; equal lengths keep the earliest record.
    #[default]
    LongestText,
    /// Latest `submitted_at`; records without a timestamp lose to any that have one.
    MostRecent,
    FirstSeen,
}

impl TieBreakPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TieBreakPolicy::LongestText => "longest_text",
            TieBreakPolicy::MostRecent => "most_recent",
            TieBreakPolicy::FirstSeen => "first_seen",
        }
    }

    fn prefers(&self, challenger: &RawPick, incumbent: &RawPick) -> bool {
        match self {
            TieBreakPolicy::LongestText => challenger.text_len() > incumbent.text_len(),
            TieBreakPolicy::MostRecent => challenger.submitted_at > incumbent.submitted_at,
            TieBreakPolicy::FirstSeen => false,
        }
    }
}

impl fmt::Display for TieBreakPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TieBreakPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "longest_text" | "longest" => Ok(TieBreakPolicy::LongestText),
            "most_recent" | "recent" => Ok(TieBreakPolicy::MostRecent),
            "first_seen" | "first" => Ok(TieBreakPolicy::FirstSeen),
            other => Err(format!("unknown dedup policy {other:?}")),
        }
    }
}

/// Case-insensitive composite identity of a raw record within its source.
pub fn dedup_key(record: &RawPick) -> String {
    let movie = if let Some(rank) = record.rank {
        format!("rank:{rank}")
    } else if let Some(id) = record.external_id.as_deref().filter(|id| !id.trim().is_empty()) {
        format!("id:{}", id.trim().to_lowercase())
    } else if let Some(title) = record.title.as_deref().filter(|t| !t.trim().is_empty()) {
        format!("title:{}", title.trim().to_lowercase())
    } else {
        // Nothing to compare on; such a record is never a duplicate.
        format!("line:{}", record.line)
    };
    format!(
        "{}|{}|{}|{}",
        record.source_id,
        movie,
        record.participant.trim().to_lowercase(),
        record.kind
    )
}

/// Keep one record per [`dedup_key`]. Survivors keep first-appearance order;
/// every dropped record is reported as `duplicate_collapsed`.
pub fn deduplicate(
    records: Vec<RawPick>,
    policy: TieBreakPolicy,
    report: &mut ReportBuilder,
) -> Vec<RawPick> {
    let mut slot_of: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<RawPick>> = Vec::new();
    for record in records {
        let key = dedup_key(&record);
        match slot_of.get(&key) {
            Some(slot) => groups[*slot].push(record),
            None => {
                slot_of.insert(key, groups.len());
                groups.push(vec![record]);
            }
        }
    }

    let mut survivors = Vec::with_capacity(groups.len());
    for mut group in groups {
        let mut winner = 0;
        for (idx, candidate) in group.iter().enumerate().skip(1) {
            if policy.prefers(candidate, &group[winner]) {
                winner = idx;
            }
        }
        let kept = group.remove(winner);
        for dropped in &group {
            report.record(
                Category::DuplicateCollapsed,
                ReportEntry::new(Stage::Dedup, dropped.record_ref())
                    .raw_name(dropped.participant.clone())
                    .detail(format!(
                        "kept {} ({} chars of text) over {} chars by {}",
                        kept.record_ref(),
                        kept.text_len(),
                        dropped.text_len(),
                        policy
                    )),
            );
        }
        survivors.push(kept);
    }
    survivors
}
