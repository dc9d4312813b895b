//! Named presets: stored tag queries resolved by name at session attach.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::TagError;
use crate::expr::TagExpression;
use crate::query::TagQuery;

/// How the preset's query was authored. Informational; resolution always
/// goes through the stored `tag_query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetStrategy {
    Or,
    And,
    Advanced,
}

/// A named, persisted tag filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub strategy: PresetStrategy,
    #[serde(rename = "tagQuery")]
    pub tag_query: TagQuery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "lastUsed", skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PresetFile {
    presets: Vec<Preset>,
}

/// On-disk preset store (`presets.json` beside the config file).
///
/// Reads happen once at construction; writes rewrite the whole file. The
/// store is small and contention is rare, so the simple approach holds.
pub struct PresetStore {
    path: PathBuf,
    presets: RwLock<HashMap<String, Preset>>,
}

impl PresetStore {
    /// Load the store from `path`. A missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, TagError> {
        let path = path.into();
        let presets = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| TagError::Store(format!("read {}: {e}", path.display())))?;
            let file: PresetFile = serde_json::from_str(&raw)
                .map_err(|e| TagError::Store(format!("parse {}: {e}", path.display())))?;
            file.presets
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            presets: RwLock::new(presets),
        })
    }

    /// Path this store persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a preset by name.
    pub fn get(&self, name: &str) -> Option<Preset> {
        self.presets.read().get(name).cloned()
    }

    /// All preset names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.presets.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a preset to its expression tree, bumping `lastUsed`.
    pub fn resolve(&self, name: &str) -> Result<TagExpression, TagError> {
        let expr = {
            let mut presets = self.presets.write();
            let preset = presets
                .get_mut(name)
                .ok_or_else(|| TagError::UnknownPreset(name.to_string()))?;
            preset.last_used = Some(Utc::now());
            preset.tag_query.to_expression()?
        };
        if let Err(e) = self.persist() {
            // lastUsed is advisory; resolution still succeeds.
            tracing::warn!(preset = name, error = %e, "failed to persist preset usage");
        }
        Ok(expr)
    }

    /// Insert or replace a preset and persist.
    pub fn upsert(&self, preset: Preset) -> Result<(), TagError> {
        self.presets.write().insert(preset.name.clone(), preset);
        self.persist()
    }

    fn persist(&self) -> Result<(), TagError> {
        let file = {
            let presets = self.presets.read();
            let mut list: Vec<Preset> = presets.values().cloned().collect();
            list.sort_by(|a, b| a.name.cmp(&b.name));
            PresetFile { presets: list }
        };
        let raw = serde_json::to_string_pretty(&file)
            .map_err(|e| TagError::Store(format!("serialize presets: {e}")))?;
        std::fs::write(&self.path, raw)
            .map_err(|e| TagError::Store(format!("write {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> Preset {
        Preset {
            name: name.to_string(),
            strategy: PresetStrategy::Advanced,
            tag_query: TagQuery {
                advanced: Some("web+!db".to_string()),
                ..Default::default()
            },
            description: Some("web minus db".to_string()),
            last_used: None,
        }
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = PresetStore::load(dir.path().join("presets.json")).unwrap();
        assert!(store.names().is_empty());
        assert!(matches!(
            store.resolve("nope"),
            Err(TagError::UnknownPreset(_))
        ));
    }

    #[test]
    fn upsert_resolve_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");

        let store = PresetStore::load(&path).unwrap();
        store.upsert(sample("webby")).unwrap();

        let expr = store.resolve("webby").unwrap();
        let mut tags = std::collections::HashSet::new();
        tags.insert("web".to_string());
        assert!(expr.evaluate(&tags));

        // lastUsed was persisted.
        let reloaded = PresetStore::load(&path).unwrap();
        assert!(reloaded.get("webby").unwrap().last_used.is_some());
    }
}
