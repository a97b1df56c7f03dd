use anyhow::Result;
use kiln_core::{Config, KeepAlive, ModelRegistry};
use kiln_runtime_api::{ModelLoader, SamplingParams};
use kiln_runtime_candle::CandleLoader;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::cache::ModelCache;

pub struct AppState {
    pub config: Config,
    pub registry: Arc<RwLock<ModelRegistry>>,
    pub cache: Arc<ModelCache>,
    /// Applied when a request carries no keep-alive of its own
    pub keep_alive: KeepAlive,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(RwLock::new(ModelRegistry::load()?));
        let loader = Arc::new(CandleLoader::new(
            registry.clone(),
            config.inference.use_gpu,
        ));
        Self::with_loader(config, registry, loader)
    }

    /// State around an arbitrary engine.
    pub fn with_loader(
        config: Config,
        registry: Arc<RwLock<ModelRegistry>>,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self> {
        let keep_alive = config.cache.default_keep_alive()?;
        Ok(Self {
            config,
            registry,
            cache: Arc::new(ModelCache::new(loader)),
            keep_alive,
        })
    }

    /// TTL for surfaces that have no keep-alive parameter. A configured `0`
    /// keeps models only while a generation holds them.
    pub fn default_ttl(&self) -> Duration {
        self.keep_alive.ttl().unwrap_or(Duration::ZERO)
    }

    pub fn max_tokens(&self, requested: Option<u32>) -> usize {
        requested.unwrap_or(self.config.inference.max_tokens) as usize
    }

    pub fn sampling(
        &self,
        temperature: Option<f32>,
        top_p: Option<f32>,
        repetition_penalty: Option<f32>,
        seed: Option<u64>,
    ) -> SamplingParams {
        let inference = &self.config.inference;
        SamplingParams {
            temperature: temperature.unwrap_or(inference.temperature),
            top_p: Some(top_p.unwrap_or(inference.top_p)),
            repetition_penalty: repetition_penalty.unwrap_or(inference.repetition_penalty),
            repetition_context_size: inference.repetition_context_size,
            seed,
        }
    }
}
