// End-to-end ingest of the fixture sources in sources.yaml against an in-memory catalog.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reel_core::{CatalogSnapshot, ItemSummary};
use reel_storage::{CatalogStore, ItemLookup, LookupError, MemoryStore};
use reel_sync::{
    load_enabled_batches, Category, Engine, EngineConfig, OverrideTable, RunMode, RunReport,
};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

struct FixtureLookup(HashMap<String, ItemSummary>);

impl FixtureLookup {
    fn new() -> Self {
        let known = [
            ("tt0111161", "The Shawshank Redemption", 1994),
            ("tt0113277", "Heat", 1995),
            ("tt0211915", "Amélie", 2001),
            ("tt0114369", "Se7en", 1995),
            ("tt0133093", "The Matrix", 1999),
        ];
        Self(
            known
                .into_iter()
                .map(|(id, title, year)| {
                    (
                        id.to_string(),
                        ItemSummary {
                            external_id: id.to_string(),
                            title: title.to_string(),
                            year: Some(year),
                            overview: None,
                            poster_path: None,
                        },
                    )
                })
                .collect(),
        )
    }
}

#[async_trait]
impl ItemLookup for FixtureLookup {
    async fn lookup_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ItemSummary>, LookupError> {
        Ok(self.0.get(external_id).cloned())
    }
}

fn engine(store: Arc<MemoryStore>) -> Engine {
    let root = workspace_root();
    let overrides = OverrideTable::from_workspace_root(&root).expect("overrides");
    Engine::with_parts(
        EngineConfig::default().with_workspace_root(root),
        store,
        Box::new(FixtureLookup::new()),
        overrides,
    )
}

async fn ingest(store: Arc<MemoryStore>, mode: RunMode) -> RunReport {
    let engine = engine(store);
    let options = engine.ingest_options();
    engine.ingest(mode, options).await.expect("ingest runs")
}

#[tokio::test]
async fn every_fixture_record_is_accounted_for() {
    let report = ingest(Arc::new(MemoryStore::new()), RunMode::Apply).await;

    let keys = report
        .entries
        .values()
        .flatten()
        .map(|entry| entry.key.clone())
        .collect::<HashSet<_>>();
    for batch in load_enabled_batches(&workspace_root()).expect("fixtures load") {
        let refs = batch
            .records
            .iter()
            .map(|r| r.record_ref())
            .chain(batch.rejected.iter().map(|r| r.record_ref()));
        for record_ref in refs {
            let credited = format!("{record_ref}#1");
            assert!(
                keys.contains(&record_ref) || keys.contains(&credited),
                "{record_ref} missing from report"
            );
        }
    }
    assert!(report.count(Category::DuplicateCollapsed) >= 1);
    assert!(report.count(Category::Created) > 0);
    assert!(!report.has_invariant_violations());
}

#[tokio::test]
async fn dry_run_classifies_like_apply_without_writing() {
    let dry_store = Arc::new(MemoryStore::new());
    let dry = ingest(dry_store.clone(), RunMode::DryRun).await;
    let real = ingest(Arc::new(MemoryStore::new()), RunMode::Apply).await;

    assert!(dry.same_classification(&real));
    assert_eq!(
        dry_store.load_snapshot().await.expect("snapshot"),
        CatalogSnapshot::default()
    );
}

#[tokio::test]
async fn second_ingest_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    ingest(store.clone(), RunMode::Apply).await;
    let after_first = store.load_snapshot().await.expect("snapshot");

    let second = ingest(store.clone(), RunMode::Apply).await;
    assert_eq!(second.count(Category::Created), 0);
    assert_eq!(second.count(Category::Updated), 0);
    assert_eq!(store.load_snapshot().await.expect("snapshot"), after_first);

    let slugs = after_first
        .participants
        .iter()
        .map(|p| p.slug.as_str())
        .collect::<HashSet<_>>();
    assert_eq!(slugs.len(), after_first.participants.len());
    let picks = after_first.picks.iter().map(|p| p.key()).collect::<HashSet<_>>();
    assert_eq!(picks.len(), after_first.picks.len());
}

#[tokio::test]
async fn consolidation_after_ingest_finds_nothing_to_merge() {
    let store = Arc::new(MemoryStore::new());
    ingest(store.clone(), RunMode::Apply).await;
    let engine = engine(store);
    let (plan, _) = engine.plan().await.expect("plan");
    assert!(plan.groups.is_empty());
}
