//! Core domain model for the reel picks consolidation engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod normalize;

pub use normalize::{compact_key, slugify, split_credits, strip_markers, unique_slug};

pub const CRATE_NAME: &str = "reel-core";

/// Canonical community member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub display_name: String,
    pub slug: String,
    pub linking_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Creation instruction for a participant that does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewParticipant {
    pub display_name: String,
    pub slug: String,
    pub linking_key: Option<String>,
}

/// Canonical movie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub external_id: String,
    pub title: String,
    pub year: Option<i32>,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
}

/// Metadata returned by the external lookup service; the only way an [`Item`] comes to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub external_id: String,
    pub title: String,
    pub year: Option<i32>,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
}

impl ItemSummary {
    /// Stable placeholder id used when a dry run plans an item it will not create.
    pub fn planned_id(&self) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("item:{}", self.external_id).as_bytes())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickKind {
    #[default]
    Ordinary,
    SpecialMention,
}

impl PickKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickKind::Ordinary => "ordinary",
            PickKind::SpecialMention => "special_mention",
        }
    }

    /// Lenient parse for source columns ("mention", "Special Mention", "hm", ...).
    pub fn parse_loose(input: &str) -> Option<Self> {
        let key = compact_key(input);
        match key.as_str() {
            "" | "ordinary" | "pick" | "regular" | "normal" => Some(PickKind::Ordinary),
            "specialmention" | "mention" | "special" | "hm" | "honorablemention" => {
                Some(PickKind::SpecialMention)
            }
            _ => None,
        }
    }
}

impl fmt::Display for PickKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant's selection of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pick {
    pub id: Uuid,
    pub participant_id: Uuid,
    pub item_id: Uuid,
    pub kind: PickKind,
    pub rank: Option<u32>,
    pub score: Option<f64>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Pick {
    pub fn key(&self) -> PickKey {
        PickKey {
            participant_id: self.participant_id,
            item_id: self.item_id,
            kind: self.kind,
        }
    }

    pub fn field_is_empty(&self, field: PickField) -> bool {
        match field {
            PickField::Note => self.note.as_deref().map_or(true, |n| n.trim().is_empty()),
            PickField::Score => self.score.is_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPick {
    pub participant_id: Uuid,
    pub item_id: Uuid,
    pub kind: PickKind,
    pub rank: Option<u32>,
    pub score: Option<f64>,
    pub note: Option<String>,
}

impl NewPick {
    pub fn key(&self) -> PickKey {
        PickKey {
            participant_id: self.participant_id,
            item_id: self.item_id,
            kind: self.kind,
        }
    }
}

/// The uniqueness tuple of a pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PickKey {
    pub participant_id: Uuid,
    pub item_id: Uuid,
    pub kind: PickKind,
}

/// Fields the fill-missing updater may populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickField {
    Note,
    Score,
}

impl PickField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickField::Note => "note",
            PickField::Score => "score",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
}

impl FieldValue {
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Text(text) => text.trim().is_empty(),
            FieldValue::Number(n) => !n.is_finite(),
        }
    }

    pub fn matches_field(&self, field: PickField) -> bool {
        matches!(
            (self, field),
            (FieldValue::Text(_), PickField::Note) | (FieldValue::Number(_), PickField::Score)
        )
    }
}

/// Everything the engine reads at the start of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub participants: Vec<Participant>,
    pub items: Vec<Item>,
    pub picks: Vec<Pick>,
}

impl CatalogSnapshot {
    pub fn participant(&self, id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn picks_of(&self, participant_id: Uuid) -> impl Iterator<Item = &Pick> {
        self.picks
            .iter()
            .filter(move |p| p.participant_id == participant_id)
    }
}

/// Linking signal a consolidation group was formed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum GroupKey {
    LinkingKey(String),
    NameSlug(String),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::LinkingKey(key) => write!(f, "linked:{key}"),
            GroupKey::NameSlug(slug) => write!(f, "name:{slug}"),
        }
    }
}

/// Participants sharing a linking signal, with the chosen survivor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationGroup {
    pub key: GroupKey,
    pub keep_id: Uuid,
    pub delete_ids: Vec<Uuid>,
    pub members: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum NotFoundReason {
    EmptyName,
    NoMatch,
    NoMovieReference,
    LookupFailed(String),
    LookupNotConfigured,
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundReason::EmptyName => f.write_str("empty name"),
            NotFoundReason::NoMatch => f.write_str("no match"),
            NotFoundReason::NoMovieReference => f.write_str("no movie reference"),
            NotFoundReason::LookupFailed(detail) => write!(f, "lookup failed: {detail}"),
            NotFoundReason::LookupNotConfigured => f.write_str("lookup not configured"),
        }
    }
}

/// Result of resolving a raw reference to a canonical record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Resolved(Uuid),
    Ambiguous(Vec<Uuid>),
    NotFound(NotFoundReason),
}

impl ResolutionOutcome {
    pub fn resolved_id(&self) -> Option<Uuid> {
        match self {
            ResolutionOutcome::Resolved(id) => Some(*id),
            _ => None,
        }
    }

    pub fn candidates(&self) -> &[Uuid] {
        match self {
            ResolutionOutcome::Ambiguous(ids) => ids,
            _ => &[],
        }
    }
}

/// Parsed handoff contract from source adapters into the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPick {
    pub source_id: String,
    pub line: usize,
    pub participant: String,
    pub rank: Option<u32>,
    pub title: Option<String>,
    pub external_id: Option<String>,
    pub text: Option<String>,
    pub score: Option<f64>,
    pub kind: PickKind,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl RawPick {
    pub fn record_ref(&self) -> String {
        format!("{}:{}", self.source_id, self.line)
    }

    pub fn text_len(&self) -> usize {
        self.text.as_deref().map_or(0, |t| t.trim().chars().count())
    }
}
