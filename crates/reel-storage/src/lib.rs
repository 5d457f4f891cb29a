//! Catalog persistence and external movie lookup for the reel engine.
//!
//! The engine talks to two capabilities only: a [`CatalogStore`] enforcing the
//! participant/item/pick uniqueness invariants, and an [`ItemLookup`] that turns
//! an external id into item metadata.

use async_trait::async_trait;
use reel_core::{
    CatalogSnapshot, FieldValue, Item, ItemSummary, NewParticipant, NewPick, Participant, Pick,
    PickField, PickKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod lookup;
pub mod memory;
pub mod postgres;
pub mod retry;

pub use lookup::{
    CachedLookup, DisabledLookup, ItemLookup, LookupCache, LookupConfig, LookupError, TmdbLookup,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use retry::{with_store_retries, BackoffPolicy, LookupSchedule, Pacer, RetryDisposition};

pub const CRATE_NAME: &str = "reel-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint {constraint} violated by {key}")]
    UniqueViolation { constraint: String, key: String },
    #[error("{entity} {id} does not exist")]
    MissingRow { entity: &'static str, id: Uuid },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// The store refused a write the engine believed safe.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            StoreError::UniqueViolation { .. }
                | StoreError::InvariantViolation(_)
                | StoreError::MissingRow { .. }
        )
    }
}

/// One fill-if-empty instruction against an existing pick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFill {
    pub pick_id: Uuid,
    pub field: PickField,
    pub value: FieldValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Applied,
    AlreadyPopulated,
    MissingPick,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load_snapshot(&self) -> Result<CatalogSnapshot, StoreError>;

    async fn find_participant(&self, id: Uuid) -> Result<Option<Participant>, StoreError>;

    async fn create_participant(&self, new: &NewParticipant) -> Result<Participant, StoreError>;

    /// Returns `false` when the row was already gone. Refuses while picks still reference it.
    async fn delete_participant(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn find_item_by_external_id(&self, external_id: &str)
        -> Result<Option<Item>, StoreError>;

    async fn create_item(&self, summary: &ItemSummary) -> Result<Item, StoreError>;

    async fn picks_for_participant(&self, participant_id: Uuid) -> Result<Vec<Pick>, StoreError>;

    async fn find_pick(&self, key: &PickKey) -> Result<Option<Pick>, StoreError>;

    async fn find_pick_by_id(&self, pick_id: Uuid) -> Result<Option<Pick>, StoreError>;

    async fn create_pick(&self, new: &NewPick) -> Result<Pick, StoreError>;

    async fn repoint_pick(&self, pick_id: Uuid, participant_id: Uuid) -> Result<(), StoreError>;

    /// Returns `false` when the row was already gone.
    async fn delete_pick(&self, pick_id: Uuid) -> Result<bool, StoreError>;

    /// Apply every fill whose target field is empty, all-or-nothing for the batch.
    async fn fill_empty_fields(&self, batch: &[FieldFill]) -> Result<Vec<FillStatus>, StoreError>;
}

pub(crate) fn check_fill_shape(fill: &FieldFill) -> Result<(), StoreError> {
    if !fill.value.matches_field(fill.field) {
        return Err(StoreError::InvariantViolation(format!(
            "value {:?} cannot fill pick field {}",
            fill.value,
            fill.field.as_str()
        )));
    }
    if fill.value.is_blank() {
        return Err(StoreError::InvariantViolation(format!(
            "blank value for pick {} field {}",
            fill.pick_id,
            fill.field.as_str()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_and_transient_classes_are_disjoint() {
        let unique = StoreError::UniqueViolation {
            constraint: "picks_participant_item_kind".to_string(),
            key: "x".into(),
        };
        assert!(unique.is_invariant_violation());
        assert!(!unique.is_transient());

        let transient = StoreError::Transient("reset".into());
        assert!(transient.is_transient());
        assert!(!transient.is_invariant_violation());

        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn fill_shape_rejects_mismatched_and_blank_values() {
        let pick_id = Uuid::from_u128(7);
        let ok = FieldFill {
            pick_id,
            field: PickField::Note,
            value: FieldValue::Text("amazing film".into()),
        };
        assert!(check_fill_shape(&ok).is_ok());

        let mismatched = FieldFill {
            field: PickField::Score,
            ..ok.clone()
        };
        assert!(check_fill_shape(&mismatched).is_err());

        let blank = FieldFill {
            value: FieldValue::Text("  ".into()),
            ..ok
        };
        assert!(check_fill_shape(&blank).is_err());
    }
}
