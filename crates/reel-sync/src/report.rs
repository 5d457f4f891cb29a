//! Run report: every classification decision of a run, grouped by category.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Matched,
    Ambiguous,
    NotFound,
    DuplicateCollapsed,
    CollisionDropped,
    Moved,
    SkippedPopulated,
    Updated,
    Created,
    Deleted,
    NoActionNeeded,
    Failed,
}

impl Category {
    pub const ALL: [Category; 12] = [
        Category::Matched,
        Category::Ambiguous,
        Category::NotFound,
        Category::DuplicateCollapsed,
        Category::CollisionDropped,
        Category::Moved,
        Category::SkippedPopulated,
        Category::Updated,
        Category::Created,
        Category::Deleted,
        Category::NoActionNeeded,
        Category::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Matched => "matched",
            Category::Ambiguous => "ambiguous",
            Category::NotFound => "not_found",
            Category::DuplicateCollapsed => "duplicate_collapsed",
            Category::CollisionDropped => "collision_dropped",
            Category::Moved => "moved",
            Category::SkippedPopulated => "skipped_populated",
            Category::Updated => "updated",
            Category::Created => "created",
            Category::Deleted => "deleted",
            Category::NoActionNeeded => "no_action_needed",
            Category::Failed => "failed",
        }
    }
}

/// Pipeline stage an entry was produced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    Dedup,
    Participant,
    Movie,
    Pick,
    Plan,
    Merge,
    Fill,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Dedup => "dedup",
            Stage::Participant => "participant",
            Stage::Movie => "movie",
            Stage::Pick => "pick",
            Stage::Plan => "plan",
            Stage::Merge => "merge",
            Stage::Fill => "fill",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub stage: Stage,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<Uuid>,
    #[serde(default)]
    pub detail: String,
}

impl ReportEntry {
    pub fn new(stage: Stage, key: impl Into<String>) -> Self {
        Self {
            stage,
            key: key.into(),
            raw_name: None,
            slug: None,
            candidates: Vec::new(),
            detail: String::new(),
        }
    }

    pub fn raw_name(mut self, raw_name: impl Into<String>) -> Self {
        self.raw_name = Some(raw_name.into());
        self
    }

    pub fn slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn candidates(mut self, candidates: impl IntoIterator<Item = Uuid>) -> Self {
        self.candidates = candidates.into_iter().collect();
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Accumulates entries across stages. Fragments built by concurrent units are
/// merged back in a fixed order so the final report does not depend on scheduling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportBuilder {
    entries: BTreeMap<Category, Vec<ReportEntry>>,
    invariant_violations: usize,
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, category: Category, entry: ReportEntry) {
        self.entries.entry(category).or_default().push(entry);
    }

    pub fn mark_invariant_violation(&mut self) {
        self.invariant_violations += 1;
    }

    pub fn count(&self, category: Category) -> usize {
        self.entries.get(&category).map_or(0, Vec::len)
    }

    pub fn entries(&self, category: Category) -> &[ReportEntry] {
        self.entries.get(&category).map_or(&[], Vec::as_slice)
    }

    pub fn merge(&mut self, other: ReportBuilder) {
        for (category, entries) in other.entries {
            self.entries.entry(category).or_default().extend(entries);
        }
        self.invariant_violations += other.invariant_violations;
    }

    pub fn finish(
        self,
        run_id: Uuid,
        operation: &str,
        mutation_applied: bool,
        started_at: DateTime<Utc>,
    ) -> RunReport {
        let counts = Category::ALL
            .iter()
            .map(|c| (*c, self.count(*c)))
            .collect();
        RunReport {
            run_id,
            operation: operation.to_string(),
            mutation_applied,
            started_at,
            finished_at: Utc::now(),
            counts,
            entries: self.entries,
            invariant_violations: self.invariant_violations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub operation: String,
    pub mutation_applied: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: BTreeMap<Category, usize>,
    pub entries: BTreeMap<Category, Vec<ReportEntry>>,
    pub invariant_violations: usize,
}

impl RunReport {
    pub fn count(&self, category: Category) -> usize {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    pub fn entries(&self, category: Category) -> &[ReportEntry] {
        self.entries.get(&category).map_or(&[], Vec::as_slice)
    }

    pub fn has_invariant_violations(&self) -> bool {
        self.invariant_violations > 0
    }

    /// True when both runs classified everything identically, regardless of
    /// whether mutations were applied.
    pub fn same_classification(&self, other: &RunReport) -> bool {
        self.operation == other.operation
            && self.counts == other.counts
            && self.entries == other.entries
            && self.invariant_violations == other.invariant_violations
    }

    pub fn summary_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Reel {} report\n", self.operation);
        let _ = writeln!(out, "- Run ID: `{}`", self.run_id);
        let _ = writeln!(out, "- Started: {}", self.started_at);
        let _ = writeln!(out, "- Finished: {}", self.finished_at);
        let _ = writeln!(out, "- Mutation applied: {}", self.mutation_applied);
        let _ = writeln!(out, "- Invariant violations: {}\n", self.invariant_violations);
        let _ = writeln!(out, "## Counts");
        for (category, count) in &self.counts {
            let _ = writeln!(out, "- {}: {}", category.as_str(), count);
        }

        for category in [Category::Ambiguous, Category::NotFound, Category::Failed] {
            let entries = self.entries(category);
            if entries.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n## {}", category.as_str());
            for entry in entries {
                let _ = writeln!(
                    out,
                    "- [{}] `{}` {}{}",
                    entry.stage.as_str(),
                    entry.key,
                    entry
                        .raw_name
                        .as_deref()
                        .map(|n| format!("{n:?} "))
                        .unwrap_or_default(),
                    entry.detail
                );
            }
        }
        out
    }
}
