//! Operator-curated overrides loaded from `rules/overrides.yaml`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use reel_core::strip_markers;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
struct OverridesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    names: Vec<NameOverride>,
    #[serde(default)]
    movies: Vec<MovieOverride>,
    #[serde(default)]
    keep_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct NameOverride {
    from: String,
    to: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MovieOverride {
    rank: u32,
    participant: String,
    external_id: String,
}

/// Name, movie and survivor overrides. Keys compare case-insensitively on
/// marker-stripped names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideTable {
    names: HashMap<String, String>,
    movies: HashMap<(u32, String), String>,
    keep_names: Vec<String>,
}

fn override_key(name: &str) -> String {
    strip_markers(name).to_lowercase()
}

impl OverrideTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: OverridesFile = serde_yaml::from_str(text).context("parsing overrides")?;
        let mut table = Self::empty();
        for entry in file.names {
            table = table.try_with_name(&entry.from, &entry.to)?;
        }
        for entry in file.movies {
            table = table.try_with_movie(entry.rank, &entry.participant, &entry.external_id)?;
        }
        table.keep_names = file
            .keep_names
            .into_iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        Ok(table)
    }

    /// Reads `rules/overrides.yaml`; a workspace without the file has no overrides.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("overrides.yaml");
        if !path.exists() {
            debug!(path = %path.display(), "no overrides file; continuing without overrides");
            return Ok(Self::empty());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn try_with_name(mut self, from: &str, to: &str) -> Result<Self> {
        let key = override_key(from);
        let to = to.trim().to_string();
        if key.is_empty() || to.is_empty() {
            bail!("name override {from:?} -> {to:?} has an empty side");
        }
        match self.names.get(&key) {
            Some(existing) if *existing != to => {
                bail!("conflicting name overrides for {from:?}: {existing:?} and {to:?}")
            }
            _ => {
                self.names.insert(key, to);
            }
        }
        Ok(self)
    }

    fn try_with_movie(mut self, rank: u32, participant: &str, external_id: &str) -> Result<Self> {
        let key = (rank, override_key(participant));
        let external_id = external_id.trim().to_ascii_lowercase();
        if external_id.is_empty() {
            bail!("movie override for rank {rank} / {participant:?} has no external id");
        }
        match self.movies.get(&key) {
            Some(existing) if *existing != external_id => bail!(
                "conflicting movie overrides for rank {rank} / {participant:?}: {existing} and {external_id}"
            ),
            _ => {
                self.movies.insert(key, external_id);
            }
        }
        Ok(self)
    }

    /// Builder used by tests and embedding callers; later entries replace earlier ones.
    pub fn with_name(mut self, from: &str, to: &str) -> Self {
        self.names.insert(override_key(from), to.trim().to_string());
        self
    }

    pub fn with_movie(mut self, rank: u32, participant: &str, external_id: &str) -> Self {
        self.movies.insert(
            (rank, override_key(participant)),
            external_id.trim().to_ascii_lowercase(),
        );
        self
    }

    pub fn canonical_name(&self, raw: &str) -> Option<&str> {
        self.names.get(&override_key(raw)).map(String::as_str)
    }

    pub fn movie_for(&self, rank: u32, participant: &str) -> Option<&str> {
        self.movies
            .get(&(rank, override_key(participant)))
            .map(String::as_str)
    }

    pub fn keep_names(&self) -> &[String] {
        &self.keep_names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.movies.is_empty() && self.keep_names.is_empty()
    }
}
