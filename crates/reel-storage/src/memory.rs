//! In-process catalog store with the same uniqueness enforcement as the Postgres schema.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use reel_core::{
    CatalogSnapshot, FieldValue, Item, ItemSummary, NewParticipant, NewPick, Participant, Pick,
    PickField, PickKey,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{check_fill_shape, CatalogStore, FieldFill, FillStatus, StoreError};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    participants: BTreeMap<Uuid, Participant>,
    items: BTreeMap<Uuid, Item>,
    picks: BTreeMap<Uuid, Pick>,
}

impl MemoryState {
    fn pick_by_key(&self, key: &PickKey) -> Option<&Pick> {
        self.picks.values().find(|p| p.key() == *key)
    }

    fn check_participant_unique(
        &self,
        slug: &str,
        linking_key: Option<&str>,
        except: Option<Uuid>,
    ) -> Result<(), StoreError> {
        for existing in self.participants.values() {
            if Some(existing.id) == except {
                continue;
            }
            if existing.slug == slug {
                return Err(StoreError::UniqueViolation {
                    constraint: "participants_slug_key".to_string(),
                    key: slug.to_string(),
                });
            }
            if let (Some(theirs), Some(ours)) = (existing.linking_key.as_deref(), linking_key) {
                if theirs == ours {
                    return Err(StoreError::UniqueViolation {
                        constraint: "participants_linking_key_key".to_string(),
                        key: ours.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn apply_fill(&mut self, fill: &FieldFill) -> Result<FillStatus, StoreError> {
        check_fill_shape(fill)?;
        let Some(pick) = self.picks.get_mut(&fill.pick_id) else {
            return Ok(FillStatus::MissingPick);
        };
        if !pick.field_is_empty(fill.field) {
            return Ok(FillStatus::AlreadyPopulated);
        }
        match (fill.field, &fill.value) {
            (PickField::Note, FieldValue::Text(text)) => pick.note = Some(text.clone()),
            (PickField::Score, FieldValue::Number(n)) => pick.score = Some(*n),
            _ => unreachable!("fill shape checked above"),
        }
        Ok(FillStatus::Applied)
    }
}

/// Catalog kept in memory; used for dry runs without a database and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: CatalogSnapshot) -> Self {
        let state = MemoryState {
            participants: snapshot
                .participants
                .into_iter()
                .map(|p| (p.id, p))
                .collect(),
            items: snapshot.items.into_iter().map(|i| (i.id, i)).collect(),
            picks: snapshot.picks.into_iter().map(|p| (p.id, p)).collect(),
        };
        Self {
            state: Mutex::new(state),
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn load_snapshot(&self) -> Result<CatalogSnapshot, StoreError> {
        let state = self.state.lock().await;
        Ok(CatalogSnapshot {
            participants: state.participants.values().cloned().collect(),
            items: state.items.values().cloned().collect(),
            picks: state.picks.values().cloned().collect(),
        })
    }

    async fn find_participant(&self, id: Uuid) -> Result<Option<Participant>, StoreError> {
        Ok(self.state.lock().await.participants.get(&id).cloned())
    }

    async fn create_participant(&self, new: &NewParticipant) -> Result<Participant, StoreError> {
        let mut state = self.state.lock().await;
        state.check_participant_unique(&new.slug, new.linking_key.as_deref(), None)?;
        let participant = Participant {
            id: Uuid::new_v4(),
            display_name: new.display_name.clone(),
            slug: new.slug.clone(),
            linking_key: new.linking_key.clone(),
            created_at: Utc::now(),
        };
        state.participants.insert(participant.id, participant.clone());
        Ok(participant)
    }

    async fn delete_participant(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.participants.contains_key(&id) {
            return Ok(false);
        }
        let remaining = state.picks.values().filter(|p| p.participant_id == id).count();
        if remaining > 0 {
            return Err(StoreError::InvariantViolation(format!(
                "participant {id} still owns {remaining} picks"
            )));
        }
        state.participants.remove(&id);
        Ok(true)
    }

    async fn find_item_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Item>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .find(|i| i.external_id == external_id)
            .cloned())
    }

    async fn create_item(&self, summary: &ItemSummary) -> Result<Item, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .items
            .values()
            .any(|i| i.external_id == summary.external_id)
        {
            return Err(StoreError::UniqueViolation {
                constraint: "items_external_id_key".to_string(),
                key: summary.external_id.clone(),
            });
        }
        let item = Item {
            id: Uuid::new_v4(),
            external_id: summary.external_id.clone(),
            title: summary.title.clone(),
            year: summary.year,
            overview: summary.overview.clone(),
            poster_path: summary.poster_path.clone(),
        };
        state.items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn picks_for_participant(&self, participant_id: Uuid) -> Result<Vec<Pick>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .picks
            .values()
            .filter(|p| p.participant_id == participant_id)
            .cloned()
            .collect())
    }

    async fn find_pick(&self, key: &PickKey) -> Result<Option<Pick>, StoreError> {
        Ok(self.state.lock().await.pick_by_key(key).cloned())
    }

    async fn find_pick_by_id(&self, pick_id: Uuid) -> Result<Option<Pick>, StoreError> {
        Ok(self.state.lock().await.picks.get(&pick_id).cloned())
    }

    async fn create_pick(&self, new: &NewPick) -> Result<Pick, StoreError> {
        let mut state = self.state.lock().await;
        if !state.participants.contains_key(&new.participant_id) {
            return Err(StoreError::MissingRow {
                entity: "participant",
                id: new.participant_id,
            });
        }
        if !state.items.contains_key(&new.item_id) {
            return Err(StoreError::MissingRow {
                entity: "item",
                id: new.item_id,
            });
        }
        if state.pick_by_key(&new.key()).is_some() {
            return Err(StoreError::UniqueViolation {
                constraint: "picks_participant_item_kind_key".to_string(),
                key: format!("{}/{}/{}", new.participant_id, new.item_id, new.kind),
            });
        }
        let pick = Pick {
            id: Uuid::new_v4(),
            participant_id: new.participant_id,
            item_id: new.item_id,
            kind: new.kind,
            rank: new.rank,
            score: new.score,
            note: new.note.clone(),
            created_at: Utc::now(),
        };
        state.picks.insert(pick.id, pick.clone());
        Ok(pick)
    }

    async fn repoint_pick(&self, pick_id: Uuid, participant_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.participants.contains_key(&participant_id) {
            return Err(StoreError::MissingRow {
                entity: "participant",
                id: participant_id,
            });
        }
        let Some(current) = state.picks.get(&pick_id).cloned() else {
            return Err(StoreError::MissingRow {
                entity: "pick",
                id: pick_id,
            });
        };
        let target = PickKey {
            participant_id,
            ..current.key()
        };
        if let Some(clash) = state.pick_by_key(&target) {
            if clash.id != pick_id {
                return Err(StoreError::UniqueViolation {
                    constraint: "picks_participant_item_kind_key".to_string(),
                    key: format!("{}/{}/{}", participant_id, current.item_id, current.kind),
                });
            }
        }
        if let Some(pick) = state.picks.get_mut(&pick_id) {
            pick.participant_id = participant_id;
        }
        Ok(())
    }

    async fn delete_pick(&self, pick_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.picks.remove(&pick_id).is_some())
    }

    async fn fill_empty_fields(&self, batch: &[FieldFill]) -> Result<Vec<FillStatus>, StoreError> {
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let statuses = batch
            .iter()
            .map(|fill| staged.apply_fill(fill))
            .collect::<Result<Vec<_>, _>>()?;
        *state = staged;
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_core::PickKind;

    fn summary(external_id: &str) -> ItemSummary {
        ItemSummary {
            external_id: external_id.to_string(),
            title: format!("Movie {external_id}"),
            year: Some(2001),
            overview: None,
            poster_path: None,
        }
    }

    fn new_participant(name: &str, slug: &str, linking_key: Option<&str>) -> NewParticipant {
        NewParticipant {
            display_name: name.to_string(),
            slug: slug.to_string(),
            linking_key: linking_key.map(ToString::to_string),
        }
    }

    #[tokio::test]
    async fn participant_slug_and_linking_key_are_unique() {
        let store = MemoryStore::new();
        store
            .create_participant(&new_participant("Ana", "ana", Some("acct-1")))
            .await
            .unwrap();

        let dup_slug = store
            .create_participant(&new_participant("ANA", "ana", None))
            .await;
        assert!(matches!(dup_slug, Err(StoreError::UniqueViolation { .. })));

        let dup_link = store
            .create_participant(&new_participant("Ana B", "ana-b", Some("acct-1")))
            .await;
        assert!(matches!(dup_link, Err(StoreError::UniqueViolation { .. })));

        store
            .create_participant(&new_participant("Luis", "luis", None))
            .await
            .unwrap();
        store
            .create_participant(&new_participant("Eva", "eva", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn repoint_refuses_to_break_pick_uniqueness() {
        let store = MemoryStore::new();
        let a = store.create_participant(&new_participant("A", "a", None)).await.unwrap();
        let b = store.create_participant(&new_participant("B", "b", None)).await.unwrap();
        let item = store.create_item(&summary("tt0000001")).await.unwrap();

        let mk = |participant_id| NewPick {
            participant_id,
            item_id: item.id,
            kind: PickKind::Ordinary,
            rank: None,
            score: None,
            note: None,
        };
        let pa = store.create_pick(&mk(a.id)).await.unwrap();
        store.create_pick(&mk(b.id)).await.unwrap();

        let err = store.repoint_pick(pa.id, b.id).await.unwrap_err();
        assert!(err.is_invariant_violation());

        let refused = store.delete_participant(a.id).await;
        assert!(matches!(refused, Err(StoreError::InvariantViolation(_))));

        assert!(store.delete_pick(pa.id).await.unwrap());
        assert!(!store.delete_pick(pa.id).await.unwrap());
        assert!(store.delete_participant(a.id).await.unwrap());
        assert!(!store.delete_participant(a.id).await.unwrap());
    }

    #[tokio::test]
    async fn fill_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        let a = store.create_participant(&new_participant("A", "a", None)).await.unwrap();
        let item = store.create_item(&summary("tt0000002")).await.unwrap();
        let pick = store
            .create_pick(&NewPick {
                participant_id: a.id,
                item_id: item.id,
                kind: PickKind::Ordinary,
                rank: Some(3),
                score: None,
                note: Some(String::new()),
            })
            .await
            .unwrap();

        let good = FieldFill {
            pick_id: pick.id,
            field: PickField::Note,
            value: FieldValue::Text("amazing film".into()),
        };
        let bad = FieldFill {
            pick_id: pick.id,
            field: PickField::Score,
            value: FieldValue::Text("not a number".into()),
        };
        assert!(store.fill_empty_fields(&[good.clone(), bad]).await.is_err());
        let untouched = store.find_pick_by_id(pick.id).await.unwrap().unwrap();
        assert_eq!(untouched.note.as_deref(), Some(""));

        let statuses = store
            .fill_empty_fields(&[good.clone(), good])
            .await
            .unwrap();
        assert_eq!(statuses, vec![FillStatus::Applied, FillStatus::AlreadyPopulated]);

        let missing = FieldFill {
            pick_id: Uuid::from_u128(99),
            field: PickField::Score,
            value: FieldValue::Number(8.0),
        };
        assert_eq!(
            store.fill_empty_fields(&[missing]).await.unwrap(),
            vec![FillStatus::MissingPick]
        );
    }
}
