//! Ingest and consolidation runs over a catalog store.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use reel_adapters::{load_rank_table, load_source, RejectedRow, SourceContext};
use reel_core::{
    strip_markers, FieldValue, NewParticipant, NewPick, NotFoundReason, Pick, PickField, PickKey,
    RawPick, ResolutionOutcome,
};
use reel_storage::{
    with_store_retries, BackoffPolicy, CatalogStore, ItemLookup, LookupError, StoreError,
};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{SourceConfig, SourceRegistry};
use crate::consolidate::{ConsolidationPlan, KeepPolicy, Planner};
use crate::dedup::{deduplicate, TieBreakPolicy};
use crate::fill::{FieldFillUpdater, FillRequest, DEFAULT_FILL_BATCH_SIZE};
use crate::merge::MergeExecutor;
use crate::overrides::OverrideTable;
use crate::report::{Category, ReportBuilder, ReportEntry, RunReport, Stage};
use crate::resolve::{
    IdentityPlanner, ItemIndex, MovieCandidate, MovieRef, MovieResolver, ParticipantIdentity,
    ParticipantIndex, ParticipantResolution, ParticipantResolver,
};
use crate::RunMode;

const HINT_LIMIT: usize = 3;

/// Parsed records of one source plus the rank table its ranks refer to.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub source_id: String,
    pub records: Vec<RawPick>,
    pub rejected: Vec<RejectedRow>,
    pub rank_table: BTreeMap<u32, String>,
}

impl SourceBatch {
    pub fn load(workspace_root: &Path, source: &SourceConfig) -> Result<Self> {
        let ctx = SourceContext {
            source_id: source.source_id.clone(),
            format: source.format,
            default_kind: source.default_kind,
        };
        let parsed = load_source(workspace_root.join(&source.path), &ctx)
            .with_context(|| format!("loading source {}", source.source_id))?;
        let rank_table = match &source.rank_table {
            Some(path) => load_rank_table(workspace_root.join(path))
                .with_context(|| format!("loading rank table for {}", source.source_id))?,
            None => BTreeMap::new(),
        };
        info!(
            source = %source.source_id,
            records = parsed.records.len(),
            rejected = parsed.rejected.len(),
            ranks = rank_table.len(),
            "loaded source"
        );
        Ok(Self {
            source_id: source.source_id.clone(),
            records: parsed.records,
            rejected: parsed.rejected,
            rank_table,
        })
    }
}

pub fn load_enabled_batches(workspace_root: &Path) -> Result<Vec<SourceBatch>> {
    let registry = SourceRegistry::load(workspace_root)?;
    registry
        .enabled()
        .map(|source| SourceBatch::load(workspace_root, source))
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub create_participants: bool,
    pub create_items: bool,
    pub create_picks: bool,
    pub dedup_policy: TieBreakPolicy,
    pub workers: usize,
    pub fill_batch_size: usize,
    pub retry: BackoffPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            create_participants: true,
            create_items: true,
            create_picks: true,
            dedup_policy: TieBreakPolicy::default(),
            workers: 4,
            fill_batch_size: DEFAULT_FILL_BATCH_SIZE,
            retry: BackoffPolicy::default(),
        }
    }
}

impl IngestOptions {
    /// Review backfill: only fill notes and scores on picks that already exist.
    pub fn reviews_only() -> Self {
        Self {
            create_participants: false,
            create_items: false,
            create_picks: false,
            ..Self::default()
        }
    }

    pub fn without_creation(mut self) -> Self {
        self.create_participants = false;
        self.create_items = false;
        self.create_picks = false;
        self
    }

    pub fn operation(&self) -> &'static str {
        if self.create_picks {
            "ingest"
        } else {
            "reviews"
        }
    }
}

/// Resolve every record's credited participants on blocking workers. Output
/// order matches input order.
pub async fn resolve_credits_parallel(
    resolver: &ParticipantResolver,
    names: Vec<String>,
    workers: usize,
) -> Result<Vec<Vec<ParticipantResolution>>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let chunk_size = names.len().div_ceil(workers.max(1));
    let mut tasks = JoinSet::new();
    for (idx, chunk) in names.chunks(chunk_size).enumerate() {
        let resolver = resolver.clone();
        let chunk = chunk.to_vec();
        tasks.spawn_blocking(move || {
            let resolved = chunk
                .iter()
                .map(|name| resolver.resolve_credited(name))
                .collect::<Vec<_>>();
            (idx, resolved)
        });
    }

    let mut parts = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        parts.push(joined.context("participant resolution worker failed")?);
    }
    parts.sort_by_key(|(idx, _)| *idx);
    Ok(parts.into_iter().flat_map(|(_, resolved)| resolved).collect())
}

pub struct IngestPipeline {
    store: Arc<dyn CatalogStore>,
    lookup: Arc<dyn ItemLookup>,
    overrides: Arc<OverrideTable>,
    options: IngestOptions,
    mode: RunMode,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        lookup: Arc<dyn ItemLookup>,
        overrides: Arc<OverrideTable>,
        mode: RunMode,
    ) -> Self {
        Self {
            store,
            lookup,
            overrides,
            options: IngestOptions::default(),
            mode,
        }
    }

    pub fn with_options(mut self, options: IngestOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn run(&self, batches: Vec<SourceBatch>) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let snapshot = with_store_retries(&self.options.retry, "load_snapshot", || {
            self.store.load_snapshot()
        })
        .await
        .context("loading catalog snapshot")?;
        info!(
            %run_id,
            participants = snapshot.participants.len(),
            items = snapshot.items.len(),
            picks = snapshot.picks.len(),
            applied = self.mode.applies(),
            "starting {}",
            self.options.operation()
        );

        let index = Arc::new(ParticipantIndex::new(&snapshot.participants));
        let mut run = IngestRun {
            pipeline: self,
            resolver: ParticipantResolver::new(Arc::clone(&index), Arc::clone(&self.overrides)),
            identities: IdentityPlanner::new(&index),
            new_participants: HashMap::new(),
            items: ItemIndex::new(&snapshot.items),
            lookup_failures: HashMap::new(),
            picks: snapshot
                .picks
                .iter()
                .map(|p| (p.key(), KnownPick::Existing(p.id)))
                .collect(),
            planned_picks: HashMap::new(),
            fills: Vec::new(),
            report: ReportBuilder::new(),
        };

        for batch in batches {
            let span = info_span!("ingest_source", source = %batch.source_id);
            run.ingest_batch(batch).instrument(span).await?;
        }

        let fills = std::mem::take(&mut run.fills);
        let planned_picks = std::mem::take(&mut run.planned_picks);
        let mut report = run.report;
        let summary = FieldFillUpdater::new(Arc::clone(&self.store), self.mode)
            .with_batch_size(self.options.fill_batch_size)
            .with_retry(self.options.retry)
            .with_planned_picks(planned_picks)
            .apply(fills, &mut report)
            .await;

        let report = report.finish(run_id, self.options.operation(), self.mode.applies(), started_at);
        info!(
            %run_id,
            matched = report.count(Category::Matched),
            created = report.count(Category::Created),
            not_found = report.count(Category::NotFound),
            ambiguous = report.count(Category::Ambiguous),
            updated = summary.updated,
            failed = report.count(Category::Failed),
            "{} finished",
            self.options.operation()
        );
        Ok(report)
    }
}

/// A pick the run knows about, keyed by its natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KnownPick {
    /// Present when the run started.
    Existing(Uuid),
    /// Created by this run; planned only, in a dry run.
    Created(Uuid),
}

/// Stand-in id for a pick a dry run would create. Stable for a natural key.
fn planned_pick_id(key: &PickKey) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("pick:{}:{}:{}", key.participant_id, key.item_id, key.kind).as_bytes(),
    )
}

enum UnitFailure {
    NotFound(NotFoundReason),
    Store(StoreError),
}

/// Mutable state of one ingest run. Every resolved unit ends in exactly one
/// terminal report entry (matched, created pick, ambiguous, not found or failed).
struct IngestRun<'a> {
    pipeline: &'a IngestPipeline,
    resolver: ParticipantResolver,
    identities: IdentityPlanner,
    /// Slug of a participant created (or planned, in a dry run) during this run.
    new_participants: HashMap<String, Uuid>,
    items: ItemIndex,
    lookup_failures: HashMap<String, NotFoundReason>,
    picks: HashMap<PickKey, KnownPick>,
    /// Picks a dry run would have created, so later fills see their fields.
    planned_picks: HashMap<Uuid, Pick>,
    fills: Vec<FillRequest>,
    report: ReportBuilder,
}

impl IngestRun<'_> {
    async fn ingest_batch(&mut self, batch: SourceBatch) -> Result<()> {
        for rejected in &batch.rejected {
            self.report.record(
                Category::NotFound,
                ReportEntry::new(Stage::Parse, rejected.record_ref()).detail(rejected.reason.clone()),
            );
        }

        let survivors = deduplicate(
            batch.records,
            self.pipeline.options.dedup_policy,
            &mut self.report,
        );
        let names = survivors.iter().map(|r| r.participant.clone()).collect();
        let resolutions =
            resolve_credits_parallel(&self.resolver, names, self.pipeline.options.workers).await?;

        for (record, credited) in survivors.iter().zip(resolutions) {
            let split = credited.len() > 1;
            for (n, resolution) in credited.iter().enumerate() {
                let unit_key = if split {
                    format!("{}#{}", record.record_ref(), n + 1)
                } else {
                    record.record_ref()
                };
                self.ingest_unit(record, &batch.rank_table, resolution, unit_key)
                    .await;
            }
        }
        Ok(())
    }

    fn entry(&self, stage: Stage, key: &str, resolution: &ParticipantResolution) -> ReportEntry {
        let entry = ReportEntry::new(stage, key).raw_name(resolution.raw.clone());
        if resolution.slug.is_empty() {
            entry
        } else {
            entry.slug(resolution.slug.clone())
        }
    }

    fn record_store_failure(&mut self, entry: ReportEntry, err: &StoreError) {
        if err.is_invariant_violation() {
            error!(key = %entry.key, stage = entry.stage.as_str(), error = %err, "store rejected ingest write");
            self.report.mark_invariant_violation();
        } else {
            warn!(key = %entry.key, error = %err, "ingest write failed");
        }
        self.report.record(Category::Failed, entry.detail(err.to_string()));
    }

    async fn ingest_unit(
        &mut self,
        record: &RawPick,
        rank_table: &BTreeMap<u32, String>,
        resolution: &ParticipantResolution,
        unit_key: String,
    ) {
        let Some(participant_id) = self.participant_for(resolution, &unit_key).await else {
            return;
        };
        let Some(item_id) = self.item_for(record, rank_table, resolution, &unit_key).await else {
            return;
        };

        let key = PickKey {
            participant_id,
            item_id,
            kind: record.kind,
        };
        let note = record
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        match self.picks.get(&key).copied() {
            Some(KnownPick::Existing(pick_id)) => {
                let entry = self
                    .entry(Stage::Pick, &unit_key, resolution)
                    .candidates([pick_id])
                    .detail(format!("existing {} pick", record.kind));
                self.report.record(Category::Matched, entry);
                self.queue_fills(pick_id, false, note, record.score, &unit_key, resolution);
            }
            Some(KnownPick::Created(pick_id)) => {
                // Store-assigned ids differ between runs; keep them out of the report.
                let entry = self
                    .entry(Stage::Pick, &unit_key, resolution)
                    .detail(format!("{} pick created earlier in this run", record.kind));
                self.report.record(Category::Matched, entry);
                self.queue_fills(pick_id, true, note, record.score, &unit_key, resolution);
            }
            None if !self.pipeline.options.create_picks => {
                let entry = self
                    .entry(Stage::Pick, &unit_key, resolution)
                    .detail("no existing pick to update");
                self.report.record(Category::NotFound, entry);
            }
            None => {
                let new = NewPick {
                    participant_id,
                    item_id,
                    kind: record.kind,
                    rank: record.rank,
                    score: record.score,
                    note,
                };
                let pick_id = if self.pipeline.mode.applies() {
                    let store = &self.pipeline.store;
                    let created = with_store_retries(&self.pipeline.options.retry, "create_pick", || {
                        store.create_pick(&new)
                    })
                    .await;
                    match created {
                        Ok(pick) => pick.id,
                        Err(err) => {
                            let entry = self.entry(Stage::Pick, &unit_key, resolution);
                            self.record_store_failure(entry, &err);
                            return;
                        }
                    }
                } else {
                    let id = planned_pick_id(&key);
                    self.planned_picks.insert(
                        id,
                        Pick {
                            id,
                            participant_id,
                            item_id,
                            kind: new.kind,
                            rank: new.rank,
                            score: new.score,
                            note: new.note,
                            created_at: Utc::now(),
                        },
                    );
                    id
                };
                self.picks.insert(key, KnownPick::Created(pick_id));
                let entry = self
                    .entry(Stage::Pick, &unit_key, resolution)
                    .detail(format!("{} pick", record.kind));
                self.report.record(Category::Created, entry);
            }
        }
    }

    /// Queue fill-if-empty updates for the note and score a record carries.
    fn queue_fills(
        &mut self,
        pick_id: Uuid,
        created_in_run: bool,
        note: Option<String>,
        score: Option<f64>,
        unit_key: &str,
        resolution: &ParticipantResolution,
    ) {
        let values = note
            .map(|note| (PickField::Note, FieldValue::Text(note)))
            .into_iter()
            .chain(score.map(|score| (PickField::Score, FieldValue::Number(score))));
        for (field, value) in values {
            self.fills.push(FillRequest {
                pick_id,
                field,
                value,
                origin: unit_key.to_string(),
                raw_name: Some(resolution.raw.clone()),
                created_in_run,
            });
        }
    }

    async fn participant_for(
        &mut self,
        resolution: &ParticipantResolution,
        unit_key: &str,
    ) -> Option<Uuid> {
        match &resolution.outcome {
            ResolutionOutcome::Resolved(id) => Some(*id),
            ResolutionOutcome::Ambiguous(candidates) => {
                let entry = self
                    .entry(Stage::Participant, unit_key, resolution)
                    .candidates(candidates.iter().copied())
                    .detail("name matches several participants");
                self.report.record(Category::Ambiguous, entry);
                None
            }
            ResolutionOutcome::NotFound(reason) => {
                let planned = if self.pipeline.options.create_participants {
                    self.identities.plan(resolution)
                } else {
                    None
                };
                match planned {
                    Some(ParticipantIdentity::Existing(id)) => Some(id),
                    Some(ParticipantIdentity::Planned(new)) => {
                        self.materialize_participant(new, resolution, unit_key).await
                    }
                    None => {
                        let mut detail = reason.to_string();
                        let hints = self
                            .resolver
                            .index()
                            .suggestions(&resolution.canonical_name, HINT_LIMIT);
                        if !hints.is_empty() {
                            let hints = hints
                                .iter()
                                .map(|(name, score)| format!("{name} ({score:.2})"))
                                .collect::<Vec<_>>()
                                .join(", ");
                            detail.push_str(&format!("; closest: {hints}"));
                        }
                        let entry = self
                            .entry(Stage::Participant, unit_key, resolution)
                            .detail(detail);
                        self.report.record(Category::NotFound, entry);
                        None
                    }
                }
            }
        }
    }

    async fn materialize_participant(
        &mut self,
        new: NewParticipant,
        resolution: &ParticipantResolution,
        unit_key: &str,
    ) -> Option<Uuid> {
        if let Some(id) = self.new_participants.get(&new.slug) {
            return Some(*id);
        }
        let id = if self.pipeline.mode.applies() {
            let store = &self.pipeline.store;
            match with_store_retries(&self.pipeline.options.retry, "create_participant", || {
                store.create_participant(&new)
            })
            .await
            {
                Ok(created) => created.id,
                Err(err) => {
                    let entry = self.entry(Stage::Participant, unit_key, resolution);
                    self.record_store_failure(entry, &err);
                    return None;
                }
            }
        } else {
            Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("participant:{}", new.slug).as_bytes())
        };
        self.new_participants.insert(new.slug.clone(), id);
        self.report.record(
            Category::Created,
            ReportEntry::new(Stage::Participant, new.slug.clone())
                .raw_name(resolution.raw.clone())
                .slug(new.slug.clone())
                .detail(new.display_name.clone()),
        );
        Some(id)
    }

    async fn item_for(
        &mut self,
        record: &RawPick,
        rank_table: &BTreeMap<u32, String>,
        resolution: &ParticipantResolution,
        unit_key: &str,
    ) -> Option<Uuid> {
        let candidate = {
            let reference = MovieRef {
                rank: record.rank,
                participant_names: vec![
                    strip_markers(&resolution.raw),
                    resolution.canonical_name.as_str(),
                ],
                external_id: record.external_id.as_deref(),
                title: record.title.as_deref(),
                text: record.text.as_deref(),
            };
            MovieResolver::new(&self.items, rank_table, &self.pipeline.overrides).resolve(&reference)
        };

        match candidate {
            MovieCandidate::Known { item_id, .. } => Some(item_id),
            MovieCandidate::Unknown {
                external_id,
                source,
            } => match self.materialize_item(&external_id).await {
                Ok(item_id) => Some(item_id),
                Err(UnitFailure::NotFound(reason)) => {
                    let entry = self
                        .entry(Stage::Movie, unit_key, resolution)
                        .detail(format!("{external_id} ({}): {reason}", source.as_str()));
                    self.report.record(Category::NotFound, entry);
                    None
                }
                Err(UnitFailure::Store(err)) => {
                    let entry = self
                        .entry(Stage::Movie, unit_key, resolution)
                        .detail(external_id.clone());
                    self.record_store_failure(entry, &err);
                    None
                }
            },
            MovieCandidate::Ambiguous {
                item_ids,
                external_ids,
            } => {
                let entry = self
                    .entry(Stage::Movie, unit_key, resolution)
                    .candidates(item_ids)
                    .detail(format!("several movie references: {}", external_ids.join(", ")));
                self.report.record(Category::Ambiguous, entry);
                None
            }
            MovieCandidate::Missing => {
                let entry = self
                    .entry(Stage::Movie, unit_key, resolution)
                    .detail(NotFoundReason::NoMovieReference.to_string());
                self.report.record(Category::NotFound, entry);
                None
            }
        }
    }

    async fn materialize_item(&mut self, external_id: &str) -> Result<Uuid, UnitFailure> {
        if let Some(reason) = self.lookup_failures.get(external_id) {
            return Err(UnitFailure::NotFound(reason.clone()));
        }
        if !self.pipeline.options.create_items {
            return Err(UnitFailure::NotFound(NotFoundReason::NoMatch));
        }

        let span = info_span!("item_lookup", external_id);
        let looked_up = self
            .pipeline
            .lookup
            .lookup_by_external_id(external_id)
            .instrument(span)
            .await;
        let summary = match looked_up {
            Ok(Some(summary)) => summary,
            Ok(None) => {
                return Err(self.remember_failure(
                    external_id,
                    NotFoundReason::LookupFailed("unknown external id".into()),
                ))
            }
            Err(LookupError::NotConfigured) => {
                return Err(self.remember_failure(external_id, NotFoundReason::LookupNotConfigured))
            }
            Err(err) => {
                warn!(external_id, error = %err, "item lookup failed");
                return Err(self.remember_failure(
                    external_id,
                    NotFoundReason::LookupFailed(err.to_string()),
                ));
            }
        };

        let item_id = if self.pipeline.mode.applies() {
            let store = &self.pipeline.store;
            with_store_retries(&self.pipeline.options.retry, "create_item", || {
                store.create_item(&summary)
            })
            .await
            .map_err(UnitFailure::Store)?
            .id
        } else {
            summary.planned_id()
        };
        let title = Some(summary.title.as_str());
        self.items.insert(item_id, external_id, title);
        self.items.insert(item_id, &summary.external_id, title);
        let detail = match summary.year {
            Some(year) => format!("{} ({year})", summary.title),
            None => summary.title.clone(),
        };
        self.report.record(
            Category::Created,
            ReportEntry::new(Stage::Movie, external_id).detail(detail),
        );
        Ok(item_id)
    }

    fn remember_failure(&mut self, external_id: &str, reason: NotFoundReason) -> UnitFailure {
        self.lookup_failures
            .insert(external_id.to_string(), reason.clone());
        UnitFailure::NotFound(reason)
    }
}

pub struct ConsolidationPipeline {
    store: Arc<dyn CatalogStore>,
    mode: RunMode,
    keep_policy: KeepPolicy,
    keep_names: Vec<String>,
    workers: usize,
    retry: BackoffPolicy,
}

impl ConsolidationPipeline {
    pub fn new(store: Arc<dyn CatalogStore>, mode: RunMode) -> Self {
        Self {
            store,
            mode,
            keep_policy: KeepPolicy::default(),
            keep_names: Vec::new(),
            workers: 4,
            retry: BackoffPolicy::default(),
        }
    }

    pub fn with_keep_policy(mut self, policy: KeepPolicy, keep_names: &[String]) -> Self {
        self.keep_policy = policy;
        self.keep_names = keep_names.to_vec();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn plan(&self) -> Result<(ConsolidationPlan, ReportBuilder)> {
        let snapshot = with_store_retries(&self.retry, "load_snapshot", || self.store.load_snapshot())
            .await
            .context("loading catalog snapshot")?;
        let mut report = ReportBuilder::new();
        let plan = Planner::new(self.keep_policy, &self.keep_names)
            .plan(&snapshot.participants, &mut report);
        info!(
            participants = snapshot.participants.len(),
            groups = plan.groups.len(),
            deletions = plan.delete_count(),
            "consolidation planned"
        );
        Ok((plan, report))
    }

    pub async fn run(&self) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let (plan, mut report) = self.plan().await?;
        MergeExecutor::new(Arc::clone(&self.store), self.mode)
            .with_workers(self.workers)
            .with_retry(self.retry)
            .execute(&plan, &mut report)
            .await?;
        Ok(report.finish(run_id, "consolidate", self.mode.applies(), started_at))
    }
}
