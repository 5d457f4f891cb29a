//! Participant and movie resolution against an immutable catalog snapshot.
//!
//! Resolvers are pure: they read indexes built from the snapshot plus the
//! override table and return a [`ResolutionOutcome`] or a movie candidate.
//! They never create records; creation is planned by [`IdentityPlanner`] and
//! performed by the ingest pipeline.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use reel_core::{
    compact_key, slugify, split_credits, strip_markers, unique_slug, Item, NewParticipant,
    NotFoundReason, Participant, ResolutionOutcome,
};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use uuid::Uuid;

use crate::overrides::OverrideTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Slug,
    AlternateSlug,
    CompactKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantResolution {
    pub raw: String,
    /// Override target when one applied, otherwise the marker-stripped raw name.
    pub canonical_name: String,
    pub slug: String,
    pub method: Option<MatchMethod>,
    pub outcome: ResolutionOutcome,
}

/// Lookup tables over the participants of a snapshot.
#[derive(Debug, Clone, Default)]
pub struct ParticipantIndex {
    by_slug: HashMap<String, Uuid>,
    by_compact: HashMap<String, Vec<Uuid>>,
    names: Vec<(Uuid, String)>,
}

impl ParticipantIndex {
    pub fn new(participants: &[Participant]) -> Self {
        let mut index = Self::default();
        for participant in participants {
            index.by_slug.insert(participant.slug.clone(), participant.id);
            let owners = index
                .by_compact
                .entry(compact_key(&participant.display_name))
                .or_default();
            if !owners.contains(&participant.id) {
                owners.push(participant.id);
            }
            index
                .names
                .push((participant.id, participant.display_name.clone()));
        }
        for owners in index.by_compact.values_mut() {
            owners.sort();
        }
        index
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn slug_taken(&self, slug: &str) -> bool {
        self.by_slug.contains_key(slug)
    }

    fn by_slug(&self, slug: &str) -> Option<Uuid> {
        self.by_slug.get(slug).copied()
    }

    fn by_compact(&self, key: &str) -> &[Uuid] {
        if key.is_empty() {
            return &[];
        }
        self.by_compact.get(key).map_or(&[], Vec::as_slice)
    }

    /// Closest known display names by Jaro-Winkler on compact keys. Operator hint only.
    pub fn suggestions(&self, name: &str, limit: usize) -> Vec<(String, f64)> {
        let wanted = compact_key(name);
        if wanted.is_empty() {
            return Vec::new();
        }
        let mut scored = self
            .names
            .iter()
            .map(|(_, display)| (display.clone(), jaro_winkler(&wanted, &compact_key(display))))
            .filter(|(_, score)| *score >= 0.7)
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(limit);
        scored
    }
}

/// Read-only participant resolver. Cheap to clone across blocking workers.
#[derive(Debug, Clone)]
pub struct ParticipantResolver {
    index: Arc<ParticipantIndex>,
    overrides: Arc<OverrideTable>,
}

impl ParticipantResolver {
    pub fn new(index: Arc<ParticipantIndex>, overrides: Arc<OverrideTable>) -> Self {
        Self { index, overrides }
    }

    pub fn index(&self) -> &ParticipantIndex {
        &self.index
    }

    pub fn resolve(&self, raw: &str) -> ParticipantResolution {
        let stripped = strip_markers(raw);
        if stripped.is_empty() {
            return ParticipantResolution {
                raw: raw.to_string(),
                canonical_name: String::new(),
                slug: String::new(),
                method: None,
                outcome: ResolutionOutcome::NotFound(NotFoundReason::EmptyName),
            };
        }

        let canonical = self
            .overrides
            .canonical_name(stripped)
            .unwrap_or(stripped)
            .to_string();
        let slug = slugify(&canonical);
        let resolved = |method, outcome| ParticipantResolution {
            raw: raw.to_string(),
            canonical_name: canonical.clone(),
            slug: slug.clone(),
            method,
            outcome,
        };

        if let Some(id) = self.index.by_slug(&slug) {
            return resolved(Some(MatchMethod::Slug), ResolutionOutcome::Resolved(id));
        }

        let alternate = slugify(stripped);
        if alternate != slug {
            if let Some(id) = self.index.by_slug(&alternate) {
                return resolved(
                    Some(MatchMethod::AlternateSlug),
                    ResolutionOutcome::Resolved(id),
                );
            }
        }

        for key in [compact_key(&canonical), compact_key(stripped)] {
            match self.index.by_compact(&key) {
                [] => continue,
                [id] => {
                    return resolved(
                        Some(MatchMethod::CompactKey),
                        ResolutionOutcome::Resolved(*id),
                    )
                }
                owners => {
                    return resolved(
                        Some(MatchMethod::CompactKey),
                        ResolutionOutcome::Ambiguous(owners.to_vec()),
                    )
                }
            }
        }

        resolved(None, ResolutionOutcome::NotFound(NotFoundReason::NoMatch))
    }

    /// Resolve every participant credited by `raw`, in credit order.
    pub fn resolve_credited(&self, raw: &str) -> Vec<ParticipantResolution> {
        let parts = split_credits(raw);
        if parts.len() <= 1 {
            return vec![self.resolve(raw)];
        }
        parts.into_iter().map(|part| self.resolve(part)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantIdentity {
    Existing(Uuid),
    Planned(NewParticipant),
}

/// Create-if-absent planning for ingestion. Records naming the same new
/// identity share one creation instruction.
#[derive(Debug, Clone, Default)]
pub struct IdentityPlanner {
    taken: HashSet<String>,
    planned: HashMap<String, NewParticipant>,
}

impl IdentityPlanner {
    pub fn new(index: &ParticipantIndex) -> Self {
        Self {
            taken: index.by_slug.keys().cloned().collect(),
            planned: HashMap::new(),
        }
    }

    /// `None` for ambiguous or empty names, which are never turned into creations.
    pub fn plan(&mut self, resolution: &ParticipantResolution) -> Option<ParticipantIdentity> {
        match &resolution.outcome {
            ResolutionOutcome::Resolved(id) => Some(ParticipantIdentity::Existing(*id)),
            ResolutionOutcome::Ambiguous(_) => None,
            ResolutionOutcome::NotFound(NotFoundReason::EmptyName) => None,
            ResolutionOutcome::NotFound(_) => {
                // Names with no ASCII residue all slug to "", so they plan by name instead.
                let planning_key = if resolution.slug.is_empty() {
                    format!("name:{}", resolution.canonical_name.to_lowercase())
                } else {
                    resolution.slug.clone()
                };
                if let Some(new) = self.planned.get(&planning_key) {
                    return Some(ParticipantIdentity::Planned(new.clone()));
                }
                let taken = &self.taken;
                let slug = unique_slug(&resolution.slug, |candidate| taken.contains(candidate));
                self.taken.insert(slug.clone());
                let new = NewParticipant {
                    display_name: resolution.canonical_name.clone(),
                    slug,
                    linking_key: None,
                };
                self.planned.insert(planning_key, new.clone());
                Some(ParticipantIdentity::Planned(new))
            }
        }
    }

    pub fn planned_count(&self) -> usize {
        self.planned.len()
    }
}

/// Where a movie candidate's external id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSource {
    Override,
    Explicit,
    RankTable,
    FreeText,
    Title,
}

impl IdSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdSource::Override => "override",
            IdSource::Explicit => "explicit",
            IdSource::RankTable => "rank_table",
            IdSource::FreeText => "free_text",
            IdSource::Title => "title",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovieCandidate {
    Known {
        item_id: Uuid,
        external_id: String,
        source: IdSource,
    },
    /// An external id with no item yet; needs a lookup before it can be used.
    Unknown { external_id: String, source: IdSource },
    Ambiguous {
        item_ids: Vec<Uuid>,
        external_ids: Vec<String>,
    },
    Missing,
}

/// Loose movie reference carried by one raw record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovieRef<'a> {
    pub rank: Option<u32>,
    /// Marker-stripped names the override key may use (raw, then canonical).
    pub participant_names: Vec<&'a str>,
    pub external_id: Option<&'a str>,
    pub title: Option<&'a str>,
    pub text: Option<&'a str>,
}

/// Known items by external id and by compact title.
#[derive(Debug, Clone, Default)]
pub struct ItemIndex {
    by_external: HashMap<String, Uuid>,
    by_title: HashMap<String, Vec<Uuid>>,
    external_of: HashMap<Uuid, String>,
}

impl ItemIndex {
    pub fn new(items: &[Item]) -> Self {
        let mut index = Self::default();
        for item in items {
            index.insert(item.id, &item.external_id, Some(&item.title));
        }
        index
    }

    pub fn insert(&mut self, id: Uuid, external_id: &str, title: Option<&str>) {
        let external_id = normalize_external_id(external_id);
        self.by_external.insert(external_id.clone(), id);
        self.external_of.insert(id, external_id);
        if let Some(title) = title {
            let owners = self.by_title.entry(compact_key(title)).or_default();
            if !owners.contains(&id) {
                owners.push(id);
                owners.sort();
            }
        }
    }

    pub fn get(&self, external_id: &str) -> Option<Uuid> {
        self.by_external
            .get(&normalize_external_id(external_id))
            .copied()
    }

    pub fn external_id_of(&self, item_id: Uuid) -> Option<&str> {
        self.external_of.get(&item_id).map(String::as_str)
    }

    fn by_title(&self, title: &str) -> &[Uuid] {
        let key = compact_key(title);
        if key.is_empty() {
            return &[];
        }
        self.by_title.get(&key).map_or(&[], Vec::as_slice)
    }
}

pub fn normalize_external_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

fn imdb_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\btt\d{7,10}\b").expect("static imdb id pattern"))
}

/// IMDb-shaped ids embedded in free text, lowercased, first occurrence order.
pub fn extract_external_ids(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for m in imdb_id_pattern().find_iter(text) {
        let id = m.as_str().to_ascii_lowercase();
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

/// Pure movie resolver over one source's rank table.
pub struct MovieResolver<'a> {
    items: &'a ItemIndex,
    rank_table: &'a BTreeMap<u32, String>,
    overrides: &'a OverrideTable,
}

impl<'a> MovieResolver<'a> {
    pub fn new(
        items: &'a ItemIndex,
        rank_table: &'a BTreeMap<u32, String>,
        overrides: &'a OverrideTable,
    ) -> Self {
        Self {
            items,
            rank_table,
            overrides,
        }
    }

    fn candidate(&self, external_id: String, source: IdSource) -> MovieCandidate {
        match self.items.get(&external_id) {
            Some(item_id) => MovieCandidate::Known {
                item_id,
                external_id,
                source,
            },
            None => MovieCandidate::Unknown {
                external_id,
                source,
            },
        }
    }

    pub fn resolve(&self, reference: &MovieRef<'_>) -> MovieCandidate {
        if let Some(rank) = reference.rank {
            for name in &reference.participant_names {
                if let Some(external_id) = self.overrides.movie_for(rank, name) {
                    return self.candidate(external_id.to_string(), IdSource::Override);
                }
            }
        }

        let base = reference
            .external_id
            .map(normalize_external_id)
            .filter(|id| !id.is_empty())
            .map(|id| (id, IdSource::Explicit))
            .or_else(|| {
                reference
                    .rank
                    .and_then(|rank| self.rank_table.get(&rank))
                    .map(|id| (normalize_external_id(id), IdSource::RankTable))
            });

        let embedded = reference
            .text
            .map(extract_external_ids)
            .unwrap_or_default();
        let known_embedded = embedded
            .iter()
            .filter_map(|id| self.items.get(id).map(|item_id| (id.clone(), item_id)))
            .collect::<Vec<_>>();

        match (&base, known_embedded.as_slice()) {
            // Explicit ids are authoritative; text only corrects rank tables.
            (Some((id, IdSource::Explicit)), _) => {
                return self.candidate(id.clone(), IdSource::Explicit)
            }
            (Some((base_id, source)), [(id, _)]) => {
                let source = if base_id == id { *source } else { IdSource::FreeText };
                return self.candidate(id.clone(), source);
            }
            (Some((id, source)), _) => return self.candidate(id.clone(), *source),
            (None, [(id, _)]) => return self.candidate(id.clone(), IdSource::FreeText),
            (None, [_, _, ..]) => {
                return MovieCandidate::Ambiguous {
                    item_ids: known_embedded.iter().map(|(_, item)| *item).collect(),
                    external_ids: known_embedded.into_iter().map(|(id, _)| id).collect(),
                }
            }
            (None, []) => {}
        }

        match embedded.as_slice() {
            [only] => return self.candidate(only.clone(), IdSource::FreeText),
            [_, _, ..] => {
                return MovieCandidate::Ambiguous {
                    item_ids: Vec::new(),
                    external_ids: embedded,
                }
            }
            [] => {}
        }

        if let Some(title) = reference.title {
            match self.items.by_title(title) {
                [] => {}
                [item_id] => {
                    let external_id = self
                        .items
                        .external_id_of(*item_id)
                        .unwrap_or_default()
                        .to_string();
                    return MovieCandidate::Known {
                        item_id: *item_id,
                        external_id,
                        source: IdSource::Title,
                    };
                }
                owners => {
                    return MovieCandidate::Ambiguous {
                        item_ids: owners.to_vec(),
                        external_ids: owners
                            .iter()
                            .filter_map(|id| self.items.external_id_of(*id))
                            .map(str::to_string)
                            .collect(),
                    }
                }
            }
        }

        MovieCandidate::Missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn participant(id: u128, name: &str, slug: &str) -> Participant {
        Participant {
            id: Uuid::from_u128(id),
            display_name: name.to_string(),
            slug: slug.to_string(),
            linking_key: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn item(id: u128, external_id: &str, title: &str) -> Item {
        Item {
            id: Uuid::from_u128(id),
            external_id: external_id.to_string(),
            title: title.to_string(),
            year: None,
            overview: None,
            poster_path: None,
        }
    }

    fn resolver(participants: &[Participant], overrides: OverrideTable) -> ParticipantResolver {
        ParticipantResolver::new(
            Arc::new(ParticipantIndex::new(participants)),
            Arc::new(overrides),
        )
    }

    #[test]
    fn exact_slug_then_compact_key() {
        let r = resolver(
            &[participant(1, "Juan Pérez", "juan-perez"), participant(2, "Ana", "ana")],
            OverrideTable::empty(),
        );

        let by_slug = r.resolve("@Juan Perez");
        assert_eq!(by_slug.outcome, ResolutionOutcome::Resolved(Uuid::from_u128(1)));
        assert_eq!(by_slug.method, Some(MatchMethod::Slug));

        let by_compact = r.resolve("JuanPérez");
        assert_eq!(by_compact.outcome, ResolutionOutcome::Resolved(Uuid::from_u128(1)));
        assert_eq!(by_compact.method, Some(MatchMethod::CompactKey));
    }

    #[test]
    fn compact_match_does_not_fire_for_distinct_collapses() {
        let r = resolver(
            &[
                participant(1, "Juan Pérez", "juan-perez"),
                participant(2, "Juan P", "juan-p"),
            ],
            OverrideTable::empty(),
        );
        let resolution = r.resolve("@juan");
        assert_eq!(
            resolution.outcome,
            ResolutionOutcome::NotFound(NotFoundReason::NoMatch)
        );
        assert_eq!(resolution.canonical_name, "juan");
    }

    #[test]
    fn shared_compact_key_is_ambiguous_not_guessed() {
        let r = resolver(
            &[
                participant(2, "Ana-Luisa", "ana-luisa-1"),
                participant(1, "Ana Luisa", "ana-luisa-2"),
            ],
            OverrideTable::empty(),
        );
        let resolution = r.resolve("analuisa");
        assert_eq!(
            resolution.outcome,
            ResolutionOutcome::Ambiguous(vec![Uuid::from_u128(1), Uuid::from_u128(2)])
        );
    }

    #[test]
    fn override_target_is_resolved_and_raw_slug_is_the_fallback() {
        let r = resolver(
            &[participant(1, "Juan Pérez", "juan-perez"), participant(3, "Juanito", "juanito")],
            OverrideTable::empty().with_name("juanito", "Juan Pérez"),
        );
        let resolution = r.resolve("#JUANITO");
        assert_eq!(resolution.canonical_name, "Juan Pérez");
        assert_eq!(resolution.outcome, ResolutionOutcome::Resolved(Uuid::from_u128(1)));

        let r = resolver(
            &[participant(3, "Juanito", "juanito")],
            OverrideTable::empty().with_name("juanito", "Juan Pérez"),
        );
        let resolution = r.resolve("juanito");
        assert_eq!(resolution.method, Some(MatchMethod::AlternateSlug));
        assert_eq!(resolution.outcome, ResolutionOutcome::Resolved(Uuid::from_u128(3)));
    }

    #[test]
    fn empty_names_and_credit_splits() {
        let r = resolver(&[participant(1, "Ana", "ana")], OverrideTable::empty());
        assert_eq!(
            r.resolve(" @ ").outcome,
            ResolutionOutcome::NotFound(NotFoundReason::EmptyName)
        );

        let credited = r.resolve_credited("Ana - Luis");
        assert_eq!(credited.len(), 2);
        assert_eq!(credited[0].outcome, ResolutionOutcome::Resolved(Uuid::from_u128(1)));
        assert_eq!(credited[1].canonical_name, "Luis");
    }

    #[test]
    fn planner_reuses_new_identities_and_avoids_taken_slugs() {
        let index = ParticipantIndex::new(&[participant(1, "Participant", "participant")]);
        let r = ParticipantResolver::new(Arc::new(index.clone()), Arc::new(OverrideTable::empty()));
        let mut planner = IdentityPlanner::new(&index);

        let first = planner.plan(&r.resolve("Zoë")).unwrap();
        let again = planner.plan(&r.resolve("zoe")).unwrap();
        match (&first, &again) {
            (ParticipantIdentity::Planned(a), ParticipantIdentity::Planned(b)) => {
                assert_eq!(a, b);
                assert_eq!(a.slug, "zoe");
                assert_eq!(a.display_name, "Zoë");
            }
            other => panic!("unexpected plans {other:?}"),
        }

        let slugs = ["日本", "中国", "日本"]
            .iter()
            .map(|name| match planner.plan(&r.resolve(name)).unwrap() {
                ParticipantIdentity::Planned(new) => new.slug,
                other => panic!("unexpected plan {other:?}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(slugs, vec!["participant-1", "participant-2", "participant-1"]);
        assert_eq!(planner.planned_count(), 3);
    }

    #[test]
    fn planner_never_creates_from_ambiguity() {
        let index = ParticipantIndex::new(&[
            participant(1, "Ana Luisa", "ana-luisa-a"),
            participant(2, "AnaLuisa", "ana-luisa-b"),
        ]);
        let r = ParticipantResolver::new(Arc::new(index.clone()), Arc::new(OverrideTable::empty()));
        let mut planner = IdentityPlanner::new(&index);
        assert_eq!(planner.plan(&r.resolve("ana.luisa")), None);
        assert_eq!(planner.plan(&r.resolve("")), None);
    }

    #[test]
    fn suggestions_rank_closest_names() {
        let index = ParticipantIndex::new(&[
            participant(1, "Juan Pérez", "juan-perez"),
            participant(2, "Juana", "juana"),
            participant(3, "Kim", "kim"),
        ]);
        let hints = index.suggestions("juan", 3);
        assert_eq!(hints.first().map(|(n, _)| n.as_str()), Some("Juana"));
        assert!(hints.iter().all(|(n, _)| n != "Kim"));
    }

    #[test]
    fn movie_override_wins_over_everything() {
        let items = ItemIndex::new(&[item(10, "tt0111161", "The Shawshank Redemption")]);
        let ranks = BTreeMap::from([(4, "tt9999999".to_string())]);
        let overrides = OverrideTable::empty().with_movie(4, "Luis", "tt0114369");
        let resolver = MovieResolver::new(&items, &ranks, &overrides);

        let candidate = resolver.resolve(&MovieRef {
            rank: Some(4),
            participant_names: vec!["luis"],
            text: Some("see tt0111161"),
            ..MovieRef::default()
        });
        assert_eq!(
            candidate,
            MovieCandidate::Unknown {
                external_id: "tt0114369".into(),
                source: IdSource::Override
            }
        );
    }

    #[test]
    fn known_id_in_text_corrects_a_stale_rank_table() {
        let items = ItemIndex::new(&[
            item(10, "tt0111161", "The Shawshank Redemption"),
            item(11, "tt0113277", "Heat"),
        ]);
        let ranks = BTreeMap::from([(2, "tt0111161".to_string())]);
        let overrides = OverrideTable::empty();
        let resolver = MovieResolver::new(&items, &ranks, &overrides);

        let candidate = resolver.resolve(&MovieRef {
            rank: Some(2),
            text: Some("Heat (tt0113277) still holds up"),
            ..MovieRef::default()
        });
        assert_eq!(
            candidate,
            MovieCandidate::Known {
                item_id: Uuid::from_u128(11),
                external_id: "tt0113277".into(),
                source: IdSource::FreeText
            }
        );

        let unrelated = resolver.resolve(&MovieRef {
            rank: Some(2),
            text: Some("unlike tt7654321"),
            ..MovieRef::default()
        });
        assert!(matches!(
            unrelated,
            MovieCandidate::Known { source: IdSource::RankTable, .. }
        ));
    }

    #[test]
    fn lone_text_id_and_title_fallbacks() {
        let items = ItemIndex::new(&[item(11, "tt0113277", "Heat")]);
        let ranks = BTreeMap::new();
        let overrides = OverrideTable::empty();
        let resolver = MovieResolver::new(&items, &ranks, &overrides);

        assert_eq!(
            resolver.resolve(&MovieRef {
                text: Some("TT0133093!"),
                ..MovieRef::default()
            }),
            MovieCandidate::Unknown {
                external_id: "tt0133093".into(),
                source: IdSource::FreeText
            }
        );
        assert!(matches!(
            resolver.resolve(&MovieRef {
                text: Some("tt0133093 or tt0234215"),
                ..MovieRef::default()
            }),
            MovieCandidate::Ambiguous { .. }
        ));
        assert!(matches!(
            resolver.resolve(&MovieRef {
                title: Some("HEAT"),
                ..MovieRef::default()
            }),
            MovieCandidate::Known { source: IdSource::Title, .. }
        ));
        assert_eq!(
            resolver.resolve(&MovieRef {
                title: Some("Unknown Film"),
                ..MovieRef::default()
            }),
            MovieCandidate::Missing
        );
    }

    #[test]
    fn extraction_requires_word_boundaries() {
        assert_eq!(
            extract_external_ids("tt0111161, xtt0113277, tt12345, tt0111161"),
            vec!["tt0111161".to_string()]
        );
    }
}
