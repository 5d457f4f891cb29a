//! Source adapters: turn CSV exports, legacy JSON dumps and rank tables into
//! [`RawPick`] handoff records. Parsing only; no resolution happens here.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reel_core::{compact_key, PickKind, RawPick};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "reel-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    CsvExport,
    LegacyJson,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_id}: no column for {column} (headers: {headers})")]
    MissingColumn {
        source_id: String,
        column: &'static str,
        headers: String,
    },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceContext {
    pub source_id: String,
    pub format: SourceFormat,
    pub default_kind: PickKind,
}

/// A source row that could not become a [`RawPick`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub source_id: String,
    pub line: usize,
    pub reason: String,
}

impl RejectedRow {
    pub fn record_ref(&self) -> String {
        format!("{}:{}", self.source_id, self.line)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedSource {
    pub records: Vec<RawPick>,
    pub rejected: Vec<RejectedRow>,
}

pub trait RecordSource: Send + Sync {
    fn format(&self) -> SourceFormat;

    fn parse(&self, ctx: &SourceContext, text: &str) -> Result<ParsedSource, AdapterError>;
}

pub fn adapter_for_format(format: SourceFormat) -> Box<dyn RecordSource> {
    match format {
        SourceFormat::CsvExport => Box::new(CsvExportSource),
        SourceFormat::LegacyJson => Box::new(LegacyJsonSource),
    }
}

pub fn load_source(path: impl AsRef<Path>, ctx: &SourceContext) -> Result<ParsedSource> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    adapter_for_format(ctx.format)
        .parse(ctx, &text)
        .with_context(|| format!("parsing {}", path.display()))
}

fn parse_rank(raw: &str) -> Option<u32> {
    raw.trim()
        .trim_start_matches('#')
        .trim_end_matches('.')
        .trim()
        .parse()
        .ok()
}

fn parse_score(raw: &str) -> Option<f64> {
    raw.trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn parse_kind(raw: Option<&str>, default: PickKind) -> Result<PickKind, String> {
    match raw.map(str::trim).filter(|k| !k.is_empty()) {
        None => Ok(default),
        Some(label) => {
            PickKind::parse_loose(label).ok_or_else(|| format!("unknown pick kind {label:?}"))
        }
    }
}

const PARTICIPANT_ALIASES: &[&str] = &["participant", "user", "username", "name", "pickedby", "member"];
const RANK_ALIASES: &[&str] = &["rank", "position", "index", "no"];
const TITLE_ALIASES: &[&str] = &["title", "movie", "film"];
const EXTERNAL_ID_ALIASES: &[&str] = &["imdbid", "imdb", "externalid"];
const TEXT_ALIASES: &[&str] = &["review", "note", "comment", "text"];
const SCORE_ALIASES: &[&str] = &["score", "rating"];
const KIND_ALIASES: &[&str] = &["kind", "type"];
const SUBMITTED_ALIASES: &[&str] = &["submittedat", "timestamp", "createdat", "date"];

#[derive(Debug, Clone, Copy, Default)]
struct CsvColumns {
    participant: usize,
    rank: Option<usize>,
    title: Option<usize>,
    external_id: Option<usize>,
    text: Option<usize>,
    score: Option<usize>,
    kind: Option<usize>,
    submitted_at: Option<usize>,
}

impl CsvColumns {
    fn from_headers(source_id: &str, headers: &csv::StringRecord) -> Result<Self, AdapterError> {
        let keys = headers.iter().map(compact_key).collect::<Vec<_>>();
        let find = |aliases: &[&str]| keys.iter().position(|k| aliases.contains(&k.as_str()));

        let participant = find(PARTICIPANT_ALIASES).ok_or_else(|| AdapterError::MissingColumn {
            source_id: source_id.to_string(),
            column: "participant",
            headers: headers.iter().collect::<Vec<_>>().join(","),
        })?;
        let columns = Self {
            participant,
            rank: find(RANK_ALIASES),
            title: find(TITLE_ALIASES),
            external_id: find(EXTERNAL_ID_ALIASES),
            text: find(TEXT_ALIASES),
            score: find(SCORE_ALIASES),
            kind: find(KIND_ALIASES),
            submitted_at: find(SUBMITTED_ALIASES),
        };
        if columns.rank.is_none() && columns.title.is_none() && columns.external_id.is_none() {
            return Err(AdapterError::MissingColumn {
                source_id: source_id.to_string(),
                column: "rank, title or external id",
                headers: headers.iter().collect::<Vec<_>>().join(","),
            });
        }
        Ok(columns)
    }
}

/// Spreadsheet exports: header-driven, tolerant of column naming.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvExportSource;

impl RecordSource for CsvExportSource {
    fn format(&self) -> SourceFormat {
        SourceFormat::CsvExport
    }

    fn parse(&self, ctx: &SourceContext, text: &str) -> Result<ParsedSource, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        let headers = reader.headers()?.clone();
        let columns = CsvColumns::from_headers(&ctx.source_id, &headers)?;

        let mut parsed = ParsedSource::default();
        for result in reader.records() {
            let record = result?;
            let line = record.position().map_or(0, |p| p.line() as usize);
            let cell = |idx: Option<usize>| idx.and_then(|i| record.get(i));

            let Some(participant) = non_empty(record.get(columns.participant)) else {
                parsed.rejected.push(RejectedRow {
                    source_id: ctx.source_id.clone(),
                    line,
                    reason: "missing participant".to_string(),
                });
                continue;
            };
            let kind = match parse_kind(cell(columns.kind), ctx.default_kind) {
                Ok(kind) => kind,
                Err(reason) => {
                    parsed.rejected.push(RejectedRow {
                        source_id: ctx.source_id.clone(),
                        line,
                        reason,
                    });
                    continue;
                }
            };

            parsed.records.push(RawPick {
                source_id: ctx.source_id.clone(),
                line,
                participant,
                rank: cell(columns.rank).and_then(parse_rank),
                title: non_empty(cell(columns.title)),
                external_id: non_empty(cell(columns.external_id)),
                text: non_empty(cell(columns.text)),
                score: cell(columns.score).and_then(parse_score),
                kind,
                submitted_at: cell(columns.submitted_at).and_then(parse_timestamp),
            });
        }
        Ok(parsed)
    }
}

/// Numbers that old dumps store either as JSON numbers or as strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Loose {
    Int(u64),
    Float(f64),
    Text(String),
}

impl Loose {
    fn as_rank(&self) -> Option<u32> {
        match self {
            Loose::Int(n) => u32::try_from(*n).ok(),
            Loose::Float(f) if f.fract() == 0.0 && *f >= 0.0 => u32::try_from(*f as u64).ok(),
            Loose::Float(_) => None,
            Loose::Text(s) => parse_rank(s),
        }
    }

    fn as_score(&self) -> Option<f64> {
        match self {
            Loose::Int(n) => Some(*n as f64),
            Loose::Float(f) => Some(*f).filter(|f| f.is_finite()),
            Loose::Text(s) => parse_score(s),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LegacyEntry {
    #[serde(default, alias = "user", alias = "username", alias = "picked_by", alias = "name")]
    participant: Option<String>,
    #[serde(default, alias = "position")]
    rank: Option<Loose>,
    #[serde(default, alias = "movie", alias = "film")]
    title: Option<String>,
    #[serde(default, alias = "imdb", alias = "imdb_id", alias = "externalId")]
    external_id: Option<String>,
    #[serde(default, alias = "review", alias = "note", alias = "comment")]
    text: Option<String>,
    #[serde(default, alias = "rating")]
    score: Option<Loose>,
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default, alias = "timestamp", alias = "created_at")]
    submitted_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyWrapper {
    #[serde(alias = "movies", alias = "entries")]
    picks: Vec<LegacyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyRoot {
    Wrapped(LegacyWrapper),
    Bare(Vec<LegacyEntry>),
}

/// JSON dumps from the previous site: a bare array or `{ "picks": [...] }`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyJsonSource;

impl RecordSource for LegacyJsonSource {
    fn format(&self) -> SourceFormat {
        SourceFormat::LegacyJson
    }

    fn parse(&self, ctx: &SourceContext, text: &str) -> Result<ParsedSource, AdapterError> {
        let entries = match serde_json::from_str::<LegacyRoot>(text)? {
            LegacyRoot::Wrapped(wrapper) => wrapper.picks,
            LegacyRoot::Bare(entries) => entries,
        };

        let mut parsed = ParsedSource::default();
        for (idx, entry) in entries.into_iter().enumerate() {
            let line = idx + 1;
            let Some(participant) = non_empty(entry.participant.as_deref()) else {
                parsed.rejected.push(RejectedRow {
                    source_id: ctx.source_id.clone(),
                    line,
                    reason: "missing participant".to_string(),
                });
                continue;
            };
            let kind = match parse_kind(entry.kind.as_deref(), ctx.default_kind) {
                Ok(kind) => kind,
                Err(reason) => {
                    parsed.rejected.push(RejectedRow {
                        source_id: ctx.source_id.clone(),
                        line,
                        reason,
                    });
                    continue;
                }
            };

            parsed.records.push(RawPick {
                source_id: ctx.source_id.clone(),
                line,
                participant,
                rank: entry.rank.as_ref().and_then(Loose::as_rank),
                title: non_empty(entry.title.as_deref()),
                external_id: non_empty(entry.external_id.as_deref()),
                text: non_empty(entry.text.as_deref()),
                score: entry.score.as_ref().and_then(Loose::as_score),
                kind,
                submitted_at: entry.submitted_at.as_deref().and_then(parse_timestamp),
            });
        }
        Ok(parsed)
    }
}

#[derive(Debug, Deserialize)]
struct RankRow {
    #[serde(alias = "position")]
    rank: Loose,
    #[serde(alias = "imdb_id", alias = "imdb")]
    external_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RankTableFile {
    Map(BTreeMap<String, String>),
    Rows(Vec<RankRow>),
}

/// Parse a precomputed rank -> external id table (`{"1": "tt..."}` or `[{"rank": 1, "imdb_id": "tt..."}]`).
pub fn parse_rank_table(text: &str) -> Result<BTreeMap<u32, String>, AdapterError> {
    let pairs = match serde_json::from_str::<RankTableFile>(text)? {
        RankTableFile::Map(map) => map
            .into_iter()
            .map(|(rank, id)| {
                parse_rank(&rank)
                    .map(|r| (r, id))
                    .ok_or_else(|| AdapterError::Message(format!("invalid rank key {rank:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?,
        RankTableFile::Rows(rows) => rows
            .into_iter()
            .map(|row| {
                row.rank
                    .as_rank()
                    .map(|r| (r, row.external_id))
                    .ok_or_else(|| AdapterError::Message(format!("invalid rank {:?}", row.rank)))
            })
            .collect::<Result<Vec<_>, _>>()?,
    };

    let mut table = BTreeMap::new();
    for (rank, external_id) in pairs {
        let external_id = external_id.trim().to_string();
        if external_id.is_empty() {
            continue;
        }
        if let Some(previous) = table.insert(rank, external_id.clone()) {
            if previous != external_id {
                return Err(AdapterError::Message(format!(
                    "rank {rank} maps to both {previous} and {external_id}"
                )));
            }
        }
    }
    Ok(table)
}

pub fn load_rank_table(path: impl AsRef<Path>) -> Result<BTreeMap<u32, String>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_rank_table(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn ctx(source_id: &str, format: SourceFormat) -> SourceContext {
        SourceContext {
            source_id: source_id.to_string(),
            format,
            default_kind: PickKind::Ordinary,
        }
    }

    #[test]
    fn csv_fixture_parses_records_and_rejects_orphans() {
        let path = workspace_root().join("fixtures/csv-export/sample/picks.csv");
        let parsed = load_source(&path, &ctx("csv-export", SourceFormat::CsvExport)).unwrap();

        assert_eq!(parsed.records.len(), 5);
        assert_eq!(parsed.rejected.len(), 1);
        assert_eq!(parsed.rejected[0].line, 6);
        assert_eq!(parsed.rejected[0].reason, "missing participant");

        let first = &parsed.records[0];
        assert_eq!(first.line, 2);
        assert_eq!(first.participant, "@juan");
        assert_eq!(first.rank, Some(1));
        assert_eq!(first.external_id.as_deref(), Some("tt0111161"));
        assert_eq!(first.score, Some(9.5));
        assert_eq!(
            first.submitted_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).single()
        );
        assert_eq!(
            first.text.as_deref(),
            Some("Hope is a good thing, maybe the best of things.")
        );

        let shared = &parsed.records[1];
        assert_eq!(shared.participant, "Ana - Luis");
        assert_eq!(shared.text, None);
        assert_eq!(
            shared.submitted_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 30, 0).single()
        );

        assert_eq!(parsed.records[3].kind, PickKind::SpecialMention);
        assert_eq!(parsed.records[4].rank, Some(4));
        assert_eq!(parsed.records[4].line, 7);
    }

    #[test]
    fn legacy_json_fixture_accepts_loose_field_names() {
        let path = workspace_root().join("fixtures/legacy-json/sample/dump.json");
        let parsed = load_source(&path, &ctx("legacy-json", SourceFormat::LegacyJson)).unwrap();

        assert!(parsed.rejected.is_empty());
        assert_eq!(parsed.records.len(), 4);
        assert_eq!(parsed.records[0].rank, Some(1));
        assert_eq!(parsed.records[1].rank, Some(1));
        assert_eq!(parsed.records[0].participant, "Juan Pérez");
        assert_eq!(parsed.records[2].external_id.as_deref(), Some("tt0113277"));
        assert_eq!(parsed.records[2].score, Some(7.5));
        assert_eq!(parsed.records[3].kind, PickKind::SpecialMention);
        assert_eq!(
            parsed.records[3].text.as_deref(),
            Some("I think this was tt0133093 or tt0234215")
        );
    }

    #[test]
    fn bare_json_arrays_are_accepted() {
        let text = r#"[{"user": "Eva", "rank": 2.0}, {"rank": 3}]"#;
        let parsed = LegacyJsonSource
            .parse(&ctx("bare", SourceFormat::LegacyJson), text)
            .unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].rank, Some(2));
        assert_eq!(parsed.rejected[0].record_ref(), "bare:2");
    }

    #[test]
    fn csv_without_participant_column_is_an_error() {
        let err = CsvExportSource
            .parse(&ctx("bad", SourceFormat::CsvExport), "rank,title\n1,Heat\n")
            .unwrap_err();
        assert!(matches!(err, AdapterError::MissingColumn { column: "participant", .. }));
    }

    #[test]
    fn contradictory_rank_tables_are_adapter_errors() {
        let err = parse_rank_table(r#"[{"rank": 1, "imdb_id": "tt1"}, {"rank": "1", "imdb_id": "tt2"}]"#)
            .unwrap_err();
        assert!(matches!(err, AdapterError::Message(_)));
        assert_eq!(err.to_string(), "rank 1 maps to both tt1 and tt2");

        let err = parse_rank_table("{not json").unwrap_err();
        assert!(matches!(err, AdapterError::Json(_)));
    }

    #[test]
    fn unknown_kind_is_rejected_not_guessed() {
        let text = "user,movie,type\nEva,Heat,veto\n";
        let parsed = CsvExportSource
            .parse(&ctx("kinds", SourceFormat::CsvExport), text)
            .unwrap();
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.rejected[0].reason, "unknown pick kind \"veto\"");
    }

    #[test]
    fn rank_tables_accept_maps_and_rows() {
        let path = workspace_root().join("fixtures/legacy-json/sample/rank_table.json");
        let table = load_rank_table(&path).unwrap();
        assert_eq!(table.get(&1).map(String::as_str), Some("tt0111161"));
        assert_eq!(table.len(), 6);

        let rows = parse_rank_table(r#"[{"position": "7.", "imdb": "tt0000007"}]"#).unwrap();
        assert_eq!(rows.get(&7).map(String::as_str), Some("tt0000007"));

        let conflicting = parse_rank_table(r#"[{"rank": 1, "imdb": "tt1"}, {"rank": 1, "imdb": "tt2"}]"#);
        assert!(conflicting.is_err());
    }

    #[test]
    fn loose_rank_and_score_parsing() {
        assert_eq!(parse_rank("#12"), Some(12));
        assert_eq!(parse_rank(" 3. "), Some(3));
        assert_eq!(parse_rank("three"), None);
        assert_eq!(parse_score("7,5"), Some(7.5));
        assert_eq!(parse_score("NaN"), None);
    }
}
