//! External movie metadata lookup: TMDB client, pacing, retries and a persistent cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reel_core::ItemSummary;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::retry::{
    classify_reqwest_error, classify_status, BackoffPolicy, LookupSchedule, Pacer,
    RetryDisposition,
};

pub const DEFAULT_TMDB_BASE_URL: &str = "https://api.themoviedb.org/3";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("external lookup not configured")]
    NotConfigured,
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} looking up {external_id}")]
    HttpStatus { status: u16, external_id: String },
    #[error("malformed lookup response for {external_id}: {detail}")]
    Decode { external_id: String, detail: String },
}

/// `Ok(None)` means the service answered and knows no such id.
#[async_trait]
pub trait ItemLookup: Send + Sync {
    async fn lookup_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ItemSummary>, LookupError>;
}

/// Stand-in used when no API key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledLookup;

#[async_trait]
impl ItemLookup for DisabledLookup {
    async fn lookup_by_external_id(
        &self,
        _external_id: &str,
    ) -> Result<Option<ItemSummary>, LookupError> {
        Err(LookupError::NotConfigured)
    }
}

#[async_trait]
impl<L: ItemLookup + ?Sized> ItemLookup for Box<L> {
    async fn lookup_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ItemSummary>, LookupError> {
        (**self).lookup_by_external_id(external_id).await
    }
}

#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub schedule: LookupSchedule,
}

impl LookupConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_TMDB_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            schedule: LookupSchedule::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    movie_results: Vec<TmdbMovie>,
}

#[derive(Debug, Deserialize)]
struct TmdbMovie {
    title: String,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    overview: Option<String>,
    #[serde(default)]
    poster_path: Option<String>,
}

fn parse_find_response(external_id: &str, body: &[u8]) -> Result<Option<ItemSummary>, LookupError> {
    let parsed: FindResponse =
        serde_json::from_slice(body).map_err(|err| LookupError::Decode {
            external_id: external_id.to_string(),
            detail: err.to_string(),
        })?;
    Ok(parsed.movie_results.into_iter().next().map(|movie| {
        let year = movie
            .release_date
            .as_deref()
            .and_then(|d| d.get(..4))
            .and_then(|y| y.parse().ok());
        ItemSummary {
            external_id: external_id.to_string(),
            title: movie.title,
            year,
            overview: movie.overview.filter(|o| !o.trim().is_empty()),
            poster_path: movie.poster_path,
        }
    }))
}

/// TMDB `find` client keyed by IMDb id.
#[derive(Debug)]
pub struct TmdbLookup {
    client: reqwest::Client,
    config: LookupConfig,
    pacer: Pacer,
}

impl TmdbLookup {
    pub fn new(config: LookupConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let pacer = Pacer::new(config.schedule);
        Ok(Self {
            client,
            config,
            pacer,
        })
    }

    pub fn find_url(&self, external_id: &str) -> String {
        format!(
            "{}/find/{}",
            self.config.base_url.trim_end_matches('/'),
            external_id
        )
    }

    async fn fetch(&self, external_id: &str) -> Result<Option<ItemSummary>, LookupError> {
        let url = self.find_url(external_id);
        let backoff = self.config.backoff;

        for attempt in 0..=backoff.max_retries {
            self.pacer.wait_turn().await;
            let resp_result = self
                .client
                .get(&url)
                .query(&[
                    ("external_source", "imdb_id"),
                    ("api_key", self.config.api_key.as_str()),
                ])
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return parse_find_response(external_id, &body);
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable lookup status");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(LookupError::HttpStatus {
                        status: status.as_u16(),
                        external_id: external_id.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable lookup request error");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(LookupError::Request(err));
                }
            }
        }

        unreachable!("final attempt always returns")
    }
}

#[async_trait]
impl ItemLookup for TmdbLookup {
    async fn lookup_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ItemSummary>, LookupError> {
        let span = info_span!("tmdb_lookup", external_id, request_id = %Uuid::new_v4());
        self.fetch(external_id).instrument(span).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CachedEntry {
    Found { summary: ItemSummary },
    Missing,
}

/// Lookup results keyed by external id. Loaded once at the start of a run and
/// flushed once at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupCache {
    entries: BTreeMap<String, CachedEntry>,
}

impl LookupCache {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking lookup cache {}", path.display()))?
        {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading lookup cache {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing lookup cache {}", path.display()))
    }

    pub fn get(&self, external_id: &str) -> Option<&CachedEntry> {
        self.entries.get(external_id)
    }

    pub fn insert(&mut self, external_id: impl Into<String>, entry: CachedEntry) {
        self.entries.insert(external_id.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write via a temp file and rename so an interrupted flush never truncates the cache.
    pub async fn flush(&self, path: &Path) -> anyhow::Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating cache directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(self).context("serializing lookup cache")?;
        let temp_path = parent.join(format!(".{}.lookup-cache.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp cache {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

/// Wraps a lookup with a [`LookupCache`]. Transient failures are never cached.
pub struct CachedLookup<L> {
    inner: L,
    cache: Mutex<LookupCache>,
    path: Option<PathBuf>,
}

impl<L: ItemLookup> CachedLookup<L> {
    pub fn new(inner: L, cache: LookupCache) -> Self {
        Self {
            inner,
            cache: Mutex::new(cache),
            path: None,
        }
    }

    pub async fn from_path(inner: L, path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let cache = LookupCache::load(&path).await?;
        debug!(entries = cache.len(), path = %path.display(), "loaded lookup cache");
        Ok(Self {
            inner,
            cache: Mutex::new(cache),
            path: Some(path),
        })
    }

    pub async fn snapshot(&self) -> LookupCache {
        self.cache.lock().await.clone()
    }

    pub async fn flush(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        self.cache.lock().await.flush(path).await
    }
}

#[async_trait]
impl<L: ItemLookup> ItemLookup for CachedLookup<L> {
    async fn lookup_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ItemSummary>, LookupError> {
        if let Some(entry) = self.cache.lock().await.get(external_id) {
            return Ok(match entry {
                CachedEntry::Found { summary } => Some(summary.clone()),
                CachedEntry::Missing => None,
            });
        }

        let result = self.inner.lookup_by_external_id(external_id).await?;
        let entry = match &result {
            Some(summary) => CachedEntry::Found {
                summary: summary.clone(),
            },
            None => CachedEntry::Missing,
        };
        self.cache.lock().await.insert(external_id, entry);
        Ok(result)
    }
}
