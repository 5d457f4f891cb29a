//! Fill-if-empty updates of pick notes and scores.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use reel_core::{FieldValue, Pick, PickField};
use reel_storage::{with_store_retries, BackoffPolicy, CatalogStore, FieldFill, FillStatus};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::report::{Category, ReportBuilder, ReportEntry, Stage};
use crate::RunMode;

pub const DEFAULT_FILL_BATCH_SIZE: usize = 100;

/// One candidate value for one field of a pick.
#[derive(Debug, Clone, PartialEq)]
pub struct FillRequest {
    pub pick_id: Uuid,
    pub field: PickField,
    pub value: FieldValue,
    /// Record reference the value came from.
    pub origin: String,
    pub raw_name: Option<String>,
    /// The pick was created by the same run; its id is not reported.
    pub created_in_run: bool,
}

impl FillRequest {
    fn to_fill(&self) -> FieldFill {
        FieldFill {
            pick_id: self.pick_id,
            field: self.field,
            value: self.value.clone(),
        }
    }

    fn entry(&self) -> ReportEntry {
        let mut entry =
            ReportEntry::new(Stage::Fill, format!("{}/{}", self.origin, self.field.as_str()));
        if !self.created_in_run {
            entry = entry.candidates([self.pick_id]);
        }
        match &self.raw_name {
            Some(name) => entry.raw_name(name.clone()),
            None => entry,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillSummary {
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct FieldFillUpdater {
    store: Arc<dyn CatalogStore>,
    mode: RunMode,
    batch_size: usize,
    retry: BackoffPolicy,
    planned: HashMap<Uuid, Pick>,
}

impl FieldFillUpdater {
    pub fn new(store: Arc<dyn CatalogStore>, mode: RunMode) -> Self {
        Self {
            store,
            mode,
            batch_size: DEFAULT_FILL_BATCH_SIZE,
            retry: BackoffPolicy::default(),
            planned: HashMap::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Picks a dry run would have created. Simulated fills read them when the
    /// store has no such pick.
    pub fn with_planned_picks(mut self, planned: HashMap<Uuid, Pick>) -> Self {
        self.planned = planned;
        self
    }

    pub async fn apply(&self, requests: Vec<FillRequest>, report: &mut ReportBuilder) -> FillSummary {
        let mut summary = FillSummary::default();
        let (valid, invalid): (Vec<_>, Vec<_>) = requests
            .into_iter()
            .partition(|r| !r.value.is_blank() && r.value.matches_field(r.field));
        for request in invalid {
            self.record(
                &request,
                Err(format!("unusable candidate value for {}", request.field.as_str())),
                report,
                &mut summary,
            );
        }

        match self.mode {
            RunMode::DryRun => self.simulate(valid, report, &mut summary).await,
            RunMode::Apply => {
                for chunk in valid.chunks(self.batch_size) {
                    self.apply_chunk(chunk, report, &mut summary).await;
                }
            }
        }
        debug!(?summary, "field fill finished");
        summary
    }

    /// Classify against current state without writing. Earlier requests in the
    /// run count as filled, matching what the store would see.
    async fn simulate(
        &self,
        requests: Vec<FillRequest>,
        report: &mut ReportBuilder,
        summary: &mut FillSummary,
    ) {
        let mut filled: HashSet<(Uuid, PickField)> = HashSet::new();
        for request in requests {
            let current = with_store_retries(&self.retry, "find_pick_by_id", || {
                self.store.find_pick_by_id(request.pick_id)
            })
            .await;
            let current = current.map(|found| {
                found.or_else(|| self.planned.get(&request.pick_id).cloned())
            });
            let outcome = match current {
                Ok(None) => Ok(FillStatus::MissingPick),
                Ok(Some(pick)) => {
                    if filled.contains(&(pick.id, request.field)) || !pick.field_is_empty(request.field) {
                        Ok(FillStatus::AlreadyPopulated)
                    } else {
                        filled.insert((pick.id, request.field));
                        Ok(FillStatus::Applied)
                    }
                }
                Err(err) => Err(err.to_string()),
            };
            self.record(&request, outcome, report, summary);
        }
    }

    async fn apply_chunk(
        &self,
        chunk: &[FillRequest],
        report: &mut ReportBuilder,
        summary: &mut FillSummary,
    ) {
        let fills = chunk.iter().map(FillRequest::to_fill).collect::<Vec<_>>();
        match with_store_retries(&self.retry, "fill_empty_fields", || {
            self.store.fill_empty_fields(&fills)
        })
        .await
        {
            Ok(statuses) if statuses.len() == chunk.len() => {
                for (request, status) in chunk.iter().zip(statuses) {
                    self.record(request, Ok(status), report, summary);
                }
            }
            Ok(statuses) => {
                warn!(
                    expected = chunk.len(),
                    got = statuses.len(),
                    "fill batch returned a short status list; retrying items one by one"
                );
                self.apply_one_by_one(chunk, report, summary).await;
            }
            Err(err) => {
                warn!(size = chunk.len(), error = %err, "fill batch failed; retrying items one by one");
                self.apply_one_by_one(chunk, report, summary).await;
            }
        }
    }

    async fn apply_one_by_one(
        &self,
        chunk: &[FillRequest],
        report: &mut ReportBuilder,
        summary: &mut FillSummary,
    ) {
        for request in chunk {
            let single = [request.to_fill()];
            let outcome = with_store_retries(&self.retry, "fill_empty_fields", || {
                self.store.fill_empty_fields(&single)
            })
            .await;
            match outcome {
                Ok(statuses) => match statuses.first() {
                    Some(status) => self.record(request, Ok(*status), report, summary),
                    None => self.record(request, Err("store returned no status".into()), report, summary),
                },
                Err(err) => {
                    if err.is_invariant_violation() {
                        error!(pick = %request.pick_id, field = request.field.as_str(), error = %err, "store rejected fill");
                        report.mark_invariant_violation();
                    }
                    self.record(request, Err(err.to_string()), report, summary);
                }
            }
        }
    }

    fn record(
        &self,
        request: &FillRequest,
        outcome: Result<FillStatus, String>,
        report: &mut ReportBuilder,
        summary: &mut FillSummary,
    ) {
        let entry = request.entry();
        match outcome {
            Ok(FillStatus::Applied) => {
                summary.updated += 1;
                report.record(Category::Updated, entry);
            }
            Ok(FillStatus::AlreadyPopulated) => {
                summary.skipped += 1;
                report.record(
                    Category::SkippedPopulated,
                    entry.detail(format!("{} already populated", request.field.as_str())),
                );
            }
            Ok(FillStatus::MissingPick) => {
                summary.failed += 1;
                report.record(Category::Failed, entry.detail("pick no longer exists"));
            }
            Err(detail) => {
                summary.failed += 1;
                report.record(Category::Failed, entry.detail(detail));
            }
        }
    }
}
