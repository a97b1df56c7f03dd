use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::models::ModelInfo;

/// Name → local directory mapping, persisted as JSON.
///
/// A registry built with `Default` lives only in memory and never writes.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelInfo>,
    #[serde(skip)]
    registry_path: Option<PathBuf>,
}

impl ModelRegistry {
    pub fn load() -> Result<Self> {
        let base_dir = Config::base_dir()?;
        fs::create_dir_all(&base_dir)?;

        Self::load_from(&Config::registry_path()?)
    }

    pub fn load_from(registry_path: &Path) -> Result<Self> {
        let mut registry = if registry_path.exists() {
            let content = fs::read_to_string(registry_path)?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", registry_path.display()))?
        } else {
            ModelRegistry::default()
        };

        registry.registry_path = Some(registry_path.to_path_buf());
        Ok(registry)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn add(&mut self, model: ModelInfo) -> Result<()> {
        self.models.insert(model.name.clone(), model);
        self.save()?;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Option<ModelInfo>> {
        let removed = self.models.remove(name);
        self.save()?;
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<&ModelInfo> {
        self.models.get(name)
    }

    pub fn list(&self) -> Vec<&ModelInfo> {
        self.models.values().collect()
    }
}
