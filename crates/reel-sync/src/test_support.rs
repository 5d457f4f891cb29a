//! Fixtures and a fault-injecting store shared by the engine's unit tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reel_core::{
    CatalogSnapshot, Item, ItemSummary, NewParticipant, NewPick, Participant, Pick, PickKey,
    PickKind,
};
use reel_storage::{BackoffPolicy, CatalogStore, FieldFill, FillStatus, StoreError};
use uuid::Uuid;

pub fn catalog_participant(id: u128, name: &str, slug: &str, day: u32) -> Participant {
    Participant {
        id: Uuid::from_u128(id),
        display_name: name.to_string(),
        slug: slug.to_string(),
        linking_key: None,
        created_at: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
    }
}

pub fn catalog_pick(id: u128, participant: u128, item: u128, kind: PickKind) -> Pick {
    Pick {
        id: Uuid::from_u128(id),
        participant_id: Uuid::from_u128(participant),
        item_id: Uuid::from_u128(item),
        kind,
        rank: None,
        score: None,
        note: None,
        created_at: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
    }
}

pub fn fast_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
    }
}

/// Delegates to an inner store, failing selected writes.
pub struct FailingStore {
    inner: Arc<dyn CatalogStore>,
    panicking_reads: HashSet<Uuid>,
    failing_repoints: HashSet<Uuid>,
    rejected_repoints: HashSet<Uuid>,
    failing_fills: HashSet<Uuid>,
    reject_pick_creation: bool,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn CatalogStore>) -> Self {
        Self {
            inner,
            panicking_reads: HashSet::new(),
            failing_repoints: HashSet::new(),
            rejected_repoints: HashSet::new(),
            failing_fills: HashSet::new(),
            reject_pick_creation: false,
        }
    }

    /// Reading this participant's picks panics, like a bug in a store driver.
    pub fn panic_on_picks_of(mut self, participant_id: Uuid) -> Self {
        self.panicking_reads.insert(participant_id);
        self
    }

    pub fn fail_repoint_of(mut self, pick_id: Uuid) -> Self {
        self.failing_repoints.insert(pick_id);
        self
    }

    pub fn reject_repoint_of(mut self, pick_id: Uuid) -> Self {
        self.rejected_repoints.insert(pick_id);
        self
    }

    pub fn fail_fills_of(mut self, pick_id: Uuid) -> Self {
        self.failing_fills.insert(pick_id);
        self
    }

    pub fn reject_pick_creation(mut self) -> Self {
        self.reject_pick_creation = true;
        self
    }
}

#[async_trait]
impl CatalogStore for FailingStore {
    async fn load_snapshot(&self) -> Result<CatalogSnapshot, StoreError> {
        self.inner.load_snapshot().await
    }

    async fn find_participant(&self, id: Uuid) -> Result<Option<Participant>, StoreError> {
        self.inner.find_participant(id).await
    }

    async fn create_participant(&self, new: &NewParticipant) -> Result<Participant, StoreError> {
        self.inner.create_participant(new).await
    }

    async fn delete_participant(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete_participant(id).await
    }

    async fn find_item_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Item>, StoreError> {
        self.inner.find_item_by_external_id(external_id).await
    }

    async fn create_item(&self, summary: &ItemSummary) -> Result<Item, StoreError> {
        self.inner.create_item(summary).await
    }

    async fn picks_for_participant(&self, participant_id: Uuid) -> Result<Vec<Pick>, StoreError> {
        if self.panicking_reads.contains(&participant_id) {
            panic!("picks of {participant_id} are unreadable");
        }
        self.inner.picks_for_participant(participant_id).await
    }

    async fn find_pick(&self, key: &PickKey) -> Result<Option<Pick>, StoreError> {
        self.inner.find_pick(key).await
    }

    async fn find_pick_by_id(&self, pick_id: Uuid) -> Result<Option<Pick>, StoreError> {
        self.inner.find_pick_by_id(pick_id).await
    }

    async fn create_pick(&self, new: &NewPick) -> Result<Pick, StoreError> {
        if self.reject_pick_creation {
            return Err(StoreError::UniqueViolation {
                constraint: "picks_participant_item_kind_key".to_string(),
                key: format!("{}/{}/{}", new.participant_id, new.item_id, new.kind),
            });
        }
        self.inner.create_pick(new).await
    }

    async fn repoint_pick(&self, pick_id: Uuid, participant_id: Uuid) -> Result<(), StoreError> {
        if self.failing_repoints.contains(&pick_id) {
            return Err(StoreError::Transient(format!("connection reset moving {pick_id}")));
        }
        if self.rejected_repoints.contains(&pick_id) {
            return Err(StoreError::InvariantViolation(format!(
                "pick {pick_id} may not move"
            )));
        }
        self.inner.repoint_pick(pick_id, participant_id).await
    }

    async fn delete_pick(&self, pick_id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete_pick(pick_id).await
    }

    async fn fill_empty_fields(&self, batch: &[FieldFill]) -> Result<Vec<FillStatus>, StoreError> {
        if batch.iter().any(|f| self.failing_fills.contains(&f.pick_id)) {
            return Err(StoreError::Transient("fill batch timed out".into()));
        }
        self.inner.fill_empty_fields(batch).await
    }
}
