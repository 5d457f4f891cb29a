//! Picks consolidation engine: ingestion, duplicate-participant merges and
//! review backfill over a catalog store.

pub mod config;
pub mod consolidate;
pub mod dedup;
pub mod fill;
pub mod merge;
pub mod overrides;
pub mod pipeline;
pub mod report;
pub mod resolve;
pub mod sink;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use reel_storage::{
    CachedLookup, CatalogStore, DisabledLookup, ItemLookup, LookupCache, MemoryStore, PgStore,
    TmdbLookup,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub use config::{EngineConfig, SourceConfig, SourceRegistry};
pub use consolidate::{ConsolidationPlan, KeepPolicy, Planner};
pub use dedup::{deduplicate, TieBreakPolicy};
pub use fill::{FieldFillUpdater, FillRequest, FillSummary};
pub use merge::{MergeExecutor, MergeSummary};
pub use overrides::OverrideTable;
pub use pipeline::{
    load_enabled_batches, ConsolidationPipeline, IngestOptions, IngestPipeline, SourceBatch,
};
pub use report::{Category, ReportBuilder, ReportEntry, RunReport, Stage};
pub use resolve::{MovieResolver, ParticipantIndex, ParticipantResolver};
pub use sink::{ReportSink, WrittenReport};

pub const CRATE_NAME: &str = "reel-sync";

/// Whether a run writes to the store. Both modes classify identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Apply,
}

impl RunMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            RunMode::DryRun
        } else {
            RunMode::Apply
        }
    }

    pub fn applies(&self) -> bool {
        matches!(self, RunMode::Apply)
    }
}

type SharedLookup = Arc<CachedLookup<Box<dyn ItemLookup>>>;

/// Store, lookup and override table wired from one [`EngineConfig`].
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn CatalogStore>,
    lookup: SharedLookup,
    overrides: Arc<OverrideTable>,
}

impl Engine {
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn CatalogStore> = match &config.database_url {
            Some(url) => Arc::new(
                PgStore::connect(url)
                    .await
                    .context("connecting to DATABASE_URL")?,
            ),
            None => {
                warn!("DATABASE_URL not set; using an empty in-memory catalog");
                Arc::new(MemoryStore::new())
            }
        };

        let inner: Box<dyn ItemLookup> = match config.lookup_config() {
            Some(lookup_config) => Box::new(TmdbLookup::new(lookup_config)?),
            None => {
                warn!("TMDB_API_KEY not set; unknown movies will be reported as not found");
                Box::new(DisabledLookup)
            }
        };
        let lookup = CachedLookup::from_path(inner, config.lookup_cache_path.clone())
            .await
            .context("loading lookup cache")?;
        let overrides = OverrideTable::from_workspace_root(&config.workspace_root)?;

        Ok(Self {
            config,
            store,
            lookup: Arc::new(lookup),
            overrides: Arc::new(overrides),
        })
    }

    /// Assemble an engine from explicit parts. The lookup cache starts empty
    /// and is never persisted.
    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn CatalogStore>,
        lookup: Box<dyn ItemLookup>,
        overrides: OverrideTable,
    ) -> Self {
        Self {
            config,
            store,
            lookup: Arc::new(CachedLookup::new(lookup, LookupCache::default())),
            overrides: Arc::new(overrides),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn CatalogStore> {
        Arc::clone(&self.store)
    }

    /// Defaults for an ingest run drawn from the engine configuration.
    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            dedup_policy: self.config.dedup_policy,
            workers: self.config.workers,
            fill_batch_size: self.config.fill_batch_size,
            ..IngestOptions::default()
        }
    }

    /// Ingest every enabled source in `sources.yaml`.
    pub async fn ingest(&self, mode: RunMode, options: IngestOptions) -> Result<RunReport> {
        let batches = load_enabled_batches(&self.config.workspace_root)?;
        self.ingest_batches(mode, options, batches).await
    }

    pub async fn ingest_batches(
        &self,
        mode: RunMode,
        options: IngestOptions,
        batches: Vec<SourceBatch>,
    ) -> Result<RunReport> {
        let lookup: Arc<dyn ItemLookup> = self.lookup.clone();
        let report = IngestPipeline::new(
            Arc::clone(&self.store),
            lookup,
            Arc::clone(&self.overrides),
            mode,
        )
        .with_options(options)
        .run(batches)
        .await?;

        if let Err(err) = self.lookup.flush().await {
            warn!(error = %err, "failed to persist lookup cache");
        }
        Ok(report)
    }

    /// Fill empty notes and scores on existing picks; nothing is created.
    pub async fn backfill_reviews(&self, mode: RunMode) -> Result<RunReport> {
        let options = self.ingest_options().without_creation();
        self.ingest(mode, options).await
    }

    fn consolidation(&self, mode: RunMode) -> ConsolidationPipeline {
        ConsolidationPipeline::new(Arc::clone(&self.store), mode)
            .with_keep_policy(self.config.keep_policy, self.overrides.keep_names())
            .with_workers(self.config.workers)
    }

    /// Consolidation groups without executing them. The report holds the
    /// planning entries only.
    pub async fn plan(&self) -> Result<(ConsolidationPlan, RunReport)> {
        let started_at = Utc::now();
        let (plan, report) = self.consolidation(RunMode::DryRun).plan().await?;
        Ok((plan, report.finish(Uuid::new_v4(), "plan", false, started_at)))
    }

    pub async fn consolidate(&self, mode: RunMode) -> Result<RunReport> {
        self.consolidation(mode).run().await
    }

    pub fn write_report(&self, report: &RunReport) -> Result<WrittenReport> {
        ReportSink::new(self.config.reports_root()).write(report)
    }
}

/// Create the catalog tables. Requires `DATABASE_URL`.
pub async fn migrate(config: &EngineConfig) -> Result<()> {
    let Some(url) = &config.database_url else {
        bail!("DATABASE_URL must be set to run migrations");
    };
    let store = PgStore::connect(url)
        .await
        .context("connecting to DATABASE_URL")?;
    store.migrate().await?;
    info!("catalog migrations applied");
    Ok(())
}
