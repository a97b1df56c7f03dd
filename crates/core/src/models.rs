use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk weight format of a local model folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Safetensors,
    Gguf,
    Unknown,
}

impl ModelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Safetensors => "safetensors",
            ModelFormat::Gguf => "gguf",
            ModelFormat::Unknown => "unknown",
        }
    }

    /// Guess the format from the files in a model directory.
    pub fn detect(dir: &Path) -> Self {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return ModelFormat::Unknown;
        };

        let mut format = ModelFormat::Unknown;
        for entry in entries.flatten() {
            match entry.path().extension().and_then(|e| e.to_str()) {
                Some("safetensors") => return ModelFormat::Safetensors,
                Some("gguf") => format = ModelFormat::Gguf,
                _ => {}
            }
        }
        format
    }
}

/// A model registered with kiln.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Identifier clients use, e.g. "Qwen/Qwen2.5-0.5B-Instruct"
    pub name: String,
    /// Directory holding config.json, tokenizer.json and the weights
    pub path: PathBuf,
    pub format: ModelFormat,
    #[serde(default)]
    pub size_bytes: u64,
    pub added_at: DateTime<Utc>,
}

impl ModelInfo {
    pub fn from_dir(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: name.into(),
            format: ModelFormat::detect(&path),
            size_bytes: dir_size(&path),
            path,
            added_at: Utc::now(),
        }
    }
}

fn dir_size(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}
