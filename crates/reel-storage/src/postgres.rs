//! Postgres-backed catalog store (sqlx, runtime-checked queries).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reel_core::{
    CatalogSnapshot, FieldValue, Item, ItemSummary, NewParticipant, NewPick, Participant, Pick,
    PickField, PickKey, PickKind,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::{check_fill_shape, CatalogStore, FieldFill, FillStatus, StoreError};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

const PICK_COLUMNS: &str =
    "id, participant_id, item_id, kind, rank, score, note, created_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some(UNIQUE_VIOLATION) => return unique_violation(db.constraint(), db.message()),
            Some(FOREIGN_KEY_VIOLATION) => {
                return StoreError::InvariantViolation(db.message().to_string())
            }
            _ => {}
        }
    }
    StoreError::Database(err)
}

fn unique_violation(constraint: Option<&str>, message: &str) -> StoreError {
    StoreError::UniqueViolation {
        constraint: constraint.unwrap_or("unknown").to_string(),
        key: message.to_string(),
    }
}

fn kind_from_db(raw: &str) -> Result<PickKind, StoreError> {
    match raw {
        "ordinary" => Ok(PickKind::Ordinary),
        "special_mention" => Ok(PickKind::SpecialMention),
        other => Err(StoreError::InvariantViolation(format!(
            "unknown pick kind {other:?} in picks table"
        ))),
    }
}

fn participant_from_row(row: &PgRow) -> Result<Participant, StoreError> {
    Ok(Participant {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        slug: row.try_get("slug")?,
        linking_key: row.try_get("linking_key")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<Item, StoreError> {
    Ok(Item {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        year: row.try_get("year")?,
        overview: row.try_get("overview")?,
        poster_path: row.try_get("poster_path")?,
    })
}

fn pick_from_row(row: &PgRow) -> Result<Pick, StoreError> {
    let kind: String = row.try_get("kind")?;
    let rank: Option<i32> = row.try_get("rank")?;
    Ok(Pick {
        id: row.try_get("id")?,
        participant_id: row.try_get("participant_id")?,
        item_id: row.try_get("item_id")?,
        kind: kind_from_db(&kind)?,
        rank: rank.and_then(|r| u32::try_from(r).ok()),
        score: row.try_get("score")?,
        note: row.try_get("note")?,
        created_at: row.try_get("created_at")?,
    })
}

fn rank_to_db(rank: Option<u32>) -> Option<i32> {
    rank.and_then(|r| i32::try_from(r).ok())
}

async fn fill_one(
    tx: &mut Transaction<'_, Postgres>,
    fill: &FieldFill,
) -> Result<FillStatus, StoreError> {
    check_fill_shape(fill)?;
    let result = match (fill.field, &fill.value) {
        (PickField::Note, FieldValue::Text(text)) => {
            sqlx::query(
                r#"
                UPDATE picks
                   SET note = $2
                 WHERE id = $1
                   AND (note IS NULL OR btrim(note) = '')
                "#,
            )
            .bind(fill.pick_id)
            .bind(text)
            .execute(&mut **tx)
            .await
        }
        (PickField::Score, FieldValue::Number(n)) => {
            sqlx::query("UPDATE picks SET score = $2 WHERE id = $1 AND score IS NULL")
                .bind(fill.pick_id)
                .bind(*n)
                .execute(&mut **tx)
                .await
        }
        _ => unreachable!("fill shape checked above"),
    }
    .map_err(map_sqlx_error)?;

    if result.rows_affected() == 1 {
        return Ok(FillStatus::Applied);
    }
    let exists = sqlx::query("SELECT 1 FROM picks WHERE id = $1")
        .bind(fill.pick_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;
    Ok(if exists.is_some() {
        FillStatus::AlreadyPopulated
    } else {
        FillStatus::MissingPick
    })
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn load_snapshot(&self) -> Result<CatalogSnapshot, StoreError> {
        let participants = sqlx::query(
            "SELECT id, display_name, slug, linking_key, created_at FROM participants ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .iter()
        .map(participant_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let items = sqlx::query(
            "SELECT id, external_id, title, year, overview, poster_path FROM items ORDER BY external_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .iter()
        .map(item_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let picks = sqlx::query(&format!(
            "SELECT {PICK_COLUMNS} FROM picks ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .iter()
        .map(pick_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        debug!(
            participants = participants.len(),
            items = items.len(),
            picks = picks.len(),
            "loaded catalog snapshot"
        );
        Ok(CatalogSnapshot {
            participants,
            items,
            picks,
        })
    }

    async fn find_participant(&self, id: Uuid) -> Result<Option<Participant>, StoreError> {
        sqlx::query(
            "SELECT id, display_name, slug, linking_key, created_at FROM participants WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .as_ref()
        .map(participant_from_row)
        .transpose()
    }

    async fn create_participant(&self, new: &NewParticipant) -> Result<Participant, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO participants (id, display_name, slug, linking_key, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING id, display_name, slug, linking_key, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.display_name)
        .bind(&new.slug)
        .bind(&new.linking_key)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        participant_from_row(&row)
    }

    async fn delete_participant(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let remaining: i64 = sqlx::query("SELECT COUNT(*) AS n FROM picks WHERE participant_id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .try_get("n")?;
        if remaining > 0 {
            return Err(StoreError::InvariantViolation(format!(
                "participant {id} still owns {remaining} picks"
            )));
        }
        let deleted = sqlx::query("DELETE FROM participants WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(deleted == 1)
    }

    async fn find_item_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Item>, StoreError> {
        sqlx::query(
            "SELECT id, external_id, title, year, overview, poster_path FROM items WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .as_ref()
        .map(item_from_row)
        .transpose()
    }

    async fn create_item(&self, summary: &ItemSummary) -> Result<Item, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO items (id, external_id, title, year, overview, poster_path)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, external_id, title, year, overview, poster_path
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&summary.external_id)
        .bind(&summary.title)
        .bind(summary.year)
        .bind(&summary.overview)
        .bind(&summary.poster_path)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        item_from_row(&row)
    }

    async fn picks_for_participant(&self, participant_id: Uuid) -> Result<Vec<Pick>, StoreError> {
        sqlx::query(&format!(
            "SELECT {PICK_COLUMNS} FROM picks WHERE participant_id = $1 ORDER BY created_at, id"
        ))
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .iter()
        .map(pick_from_row)
        .collect()
    }

    async fn find_pick(&self, key: &PickKey) -> Result<Option<Pick>, StoreError> {
        sqlx::query(&format!(
            "SELECT {PICK_COLUMNS} FROM picks WHERE participant_id = $1 AND item_id = $2 AND kind = $3"
        ))
        .bind(key.participant_id)
        .bind(key.item_id)
        .bind(key.kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .as_ref()
        .map(pick_from_row)
        .transpose()
    }

    async fn find_pick_by_id(&self, pick_id: Uuid) -> Result<Option<Pick>, StoreError> {
        sqlx::query(&format!("SELECT {PICK_COLUMNS} FROM picks WHERE id = $1"))
            .bind(pick_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .as_ref()
            .map(pick_from_row)
            .transpose()
    }

    async fn create_pick(&self, new: &NewPick) -> Result<Pick, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO picks (id, participant_id, item_id, kind, rank, score, note, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING {PICK_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.participant_id)
        .bind(new.item_id)
        .bind(new.kind.as_str())
        .bind(rank_to_db(new.rank))
        .bind(new.score)
        .bind(&new.note)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        pick_from_row(&row)
    }

    async fn repoint_pick(&self, pick_id: Uuid, participant_id: Uuid) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE picks SET participant_id = $2 WHERE id = $1")
            .bind(pick_id)
            .bind(participant_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::MissingRow {
                entity: "pick",
                id: pick_id,
            });
        }
        Ok(())
    }

    async fn delete_pick(&self, pick_id: Uuid) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM picks WHERE id = $1")
            .bind(pick_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
        Ok(deleted == 1)
    }

    async fn fill_empty_fields(&self, batch: &[FieldFill]) -> Result<Vec<FillStatus>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut statuses = Vec::with_capacity(batch.len());
        for fill in batch {
            statuses.push(fill_one(&mut tx, fill).await?);
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(statuses)
    }
}
