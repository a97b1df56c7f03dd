use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::keep_alive::KeepAlive;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Model settings
    #[serde(default)]
    pub models: ModelsConfig,

    /// Inference settings
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Resident model cache settings
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Directory holding local model folders (default: ~/.config/kiln/models/)
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    Config::base_dir()
        .map(|p| p.join("models"))
        .unwrap_or_else(|_| PathBuf::from("~/.config/kiln/models"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Default max tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Default top-p
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Penalty applied to recently generated tokens
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    /// How many trailing tokens the repetition penalty looks at
    #[serde(default = "default_repetition_context_size")]
    pub repetition_context_size: usize,

    /// Use GPU acceleration (Metal on macOS, CUDA on Linux)
    #[serde(default = "default_use_gpu")]
    pub use_gpu: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Keep-alive applied when a request does not carry one
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,

    /// Seconds between eviction sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_port() -> u16 {
    11434
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_repetition_penalty() -> f32 {
    1.1
}

fn default_repetition_context_size() -> usize {
    20
}

fn default_use_gpu() -> bool {
    true
}

fn default_keep_alive() -> String {
    "5m".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    10
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
            repetition_context_size: default_repetition_context_size(),
            use_gpu: default_use_gpu(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keep_alive: default_keep_alive(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn default_keep_alive(&self) -> Result<KeepAlive> {
        KeepAlive::parse(&self.keep_alive).context("cache.keep_alive")
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Config {
    /// Get the base directory: ~/.config/kiln/
    pub fn base_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("USERPROFILE").map(PathBuf::from))
            .map_err(|_| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(home.join(".config").join("kiln"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that would only fail later, mid-request.
    pub fn validate(&self) -> Result<()> {
        self.cache.default_keep_alive()?;
        if self.inference.max_tokens == 0 {
            anyhow::bail!("inference.max_tokens must be greater than zero");
        }
        Ok(())
    }

    /// Get the config file path: ~/.config/kiln/config.toml
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    /// Get the registry file path: ~/.config/kiln/registry.json
    pub fn registry_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("registry.json"))
    }

    /// Get the models directory from config
    pub fn models_dir(&self) -> PathBuf {
        self.models.storage_path.clone()
    }
}
