//! Environment configuration and the `sources.yaml` registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reel_adapters::SourceFormat;
use reel_core::PickKind;
use reel_storage::{BackoffPolicy, LookupConfig, LookupSchedule};
use serde::Deserialize;
use tracing::warn;

use crate::consolidate::KeepPolicy;
use crate::dedup::TieBreakPolicy;
use crate::fill::DEFAULT_FILL_BATCH_SIZE;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub format: SourceFormat,
    pub path: PathBuf,
    #[serde(default)]
    pub rank_table: Option<PathBuf>,
    #[serde(default)]
    pub default_kind: PickKind,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub tmdb_api_key: Option<String>,
    pub tmdb_base_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub lookup_schedule: LookupSchedule,
    pub lookup_max_retries: usize,
    pub lookup_cache_path: PathBuf,
    pub fill_batch_size: usize,
    pub workers: usize,
    pub keep_policy: KeepPolicy,
    pub dedup_policy: TieBreakPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str| get(key).and_then(|v| v.parse::<u64>().ok());
        let defaults = LookupSchedule::default();
        let workspace_root = get("REEL_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            database_url: get("DATABASE_URL"),
            tmdb_api_key: get("TMDB_API_KEY"),
            tmdb_base_url: get("TMDB_BASE_URL"),
            user_agent: get("REEL_USER_AGENT").unwrap_or_else(|| "reel-bot/0.1".to_string()),
            http_timeout_secs: number("REEL_HTTP_TIMEOUT_SECS").unwrap_or(20),
            lookup_schedule: LookupSchedule {
                min_delay: number("REEL_LOOKUP_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.min_delay),
                burst_size: number("REEL_LOOKUP_BURST")
                    .map(|n| n as usize)
                    .unwrap_or(defaults.burst_size),
                burst_pause: number("REEL_LOOKUP_PAUSE_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.burst_pause),
            },
            lookup_max_retries: number("REEL_LOOKUP_MAX_RETRIES")
                .map(|n| n as usize)
                .unwrap_or(BackoffPolicy::default().max_retries),
            lookup_cache_path: get("REEL_LOOKUP_CACHE")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("cache").join("lookup.json")),
            fill_batch_size: number("REEL_FILL_BATCH_SIZE")
                .map(|n| n as usize)
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_FILL_BATCH_SIZE),
            workers: number("REEL_WORKERS")
                .map(|n| n as usize)
                .filter(|n| *n > 0)
                .unwrap_or(4),
            keep_policy: parse_policy(get("REEL_KEEP_POLICY"), "REEL_KEEP_POLICY"),
            dedup_policy: parse_policy(get("REEL_DEDUP_POLICY"), "REEL_DEDUP_POLICY"),
            workspace_root,
        }
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if let Ok(rest) = self.lookup_cache_path.strip_prefix(&self.workspace_root) {
            self.lookup_cache_path = root.join(rest);
        }
        self.workspace_root = root;
        self
    }

    /// `None` when no API key is configured.
    pub fn lookup_config(&self) -> Option<LookupConfig> {
        let api_key = self.tmdb_api_key.clone()?;
        let mut config = LookupConfig::new(api_key);
        if let Some(base_url) = &self.tmdb_base_url {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        config.user_agent = Some(self.user_agent.clone());
        config.schedule = self.lookup_schedule;
        config.backoff.max_retries = self.lookup_max_retries;
        Some(config)
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

fn parse_policy<P>(raw: Option<String>, key: &str) -> P
where
    P: std::str::FromStr<Err = String> + Default,
{
    match raw.map(|v| v.parse::<P>()) {
        Some(Ok(policy)) => policy,
        Some(Err(err)) => {
            warn!(key, error = %err, "ignoring invalid policy; using default");
            P::default()
        }
        None => P::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> EngineConfig {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config(&[]);
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.fill_batch_size, 100);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.keep_policy, KeepPolicy::MostRecent);
        assert_eq!(cfg.dedup_policy, TieBreakPolicy::LongestText);
        assert_eq!(cfg.lookup_schedule, LookupSchedule::default());
        assert_eq!(cfg.lookup_cache_path, PathBuf::from("./cache/lookup.json"));
        assert!(cfg.lookup_config().is_none());
    }

    #[test]
    fn environment_overrides_apply() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://reel@localhost/reel"),
            ("TMDB_API_KEY", "k"),
            ("TMDB_BASE_URL", "http://127.0.0.1:9/3/"),
            ("REEL_LOOKUP_DELAY_MS", "10"),
            ("REEL_LOOKUP_BURST", "5"),
            ("REEL_LOOKUP_PAUSE_SECS", "1"),
            ("REEL_FILL_BATCH_SIZE", "0"),
            ("REEL_KEEP_POLICY", "oldest"),
            ("REEL_DEDUP_POLICY", "nonsense"),
            ("REEL_WORKSPACE_ROOT", "/srv/reel"),
        ]);
        assert_eq!(cfg.fill_batch_size, 100);
        assert_eq!(cfg.keep_policy, KeepPolicy::Oldest);
        assert_eq!(cfg.dedup_policy, TieBreakPolicy::LongestText);
        assert_eq!(cfg.lookup_cache_path, PathBuf::from("/srv/reel/cache/lookup.json"));

        let lookup = cfg.lookup_config().unwrap();
        assert_eq!(lookup.base_url, "http://127.0.0.1:9/3");
        assert_eq!(lookup.schedule.burst_size, 5);
        assert_eq!(lookup.schedule.min_delay, Duration::from_millis(10));
    }

    #[test]
    fn workspace_override_moves_the_default_cache() {
        let cfg = config(&[]).with_workspace_root("/tmp/ws");
        assert_eq!(cfg.lookup_cache_path, PathBuf::from("/tmp/ws/cache/lookup.json"));
        assert_eq!(cfg.reports_root(), PathBuf::from("/tmp/ws/reports"));
    }

    #[test]
    fn workspace_registry_parses() {
        let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let registry = SourceRegistry::load(&root).unwrap();
        let ids = registry
            .enabled()
            .map(|s| s.source_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["csv-export", "legacy-json"]);
        assert_eq!(registry.sources[1].format, SourceFormat::LegacyJson);
        assert!(registry.sources[0].rank_table.is_some());
    }
}
