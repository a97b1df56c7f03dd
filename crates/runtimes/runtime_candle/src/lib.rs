//! kiln_runtime_candle - Candle-based inference engine
//!
//! This crate provides LLM inference using HuggingFace's candle library.
//! Supports Metal (macOS) and CUDA (Linux/Windows) acceleration.

mod model;
mod sampling;

use async_trait::async_trait;
use kiln_core::ModelRegistry;
use kiln_runtime_api::{
    ChatMessage, ChunkReceiver, GeneratedChunk, GenerationConstraints, LoadedModel, ModelLoader,
    RuntimeError, StopReason,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use model::CandleModel;

/// Buffered chunks between the decode thread and the consumer.
const CHUNK_BUFFER: usize = 16;

const CHATML_END: &str = "<|im_end|>";

/// Resolves model ids through the local registry, then the HuggingFace cache.
pub struct CandleLoader {
    registry: Arc<RwLock<ModelRegistry>>,
    use_gpu: bool,
}

impl CandleLoader {
    pub fn new(registry: Arc<RwLock<ModelRegistry>>, use_gpu: bool) -> Self {
        Self { registry, use_gpu }
    }

    async fn resolve(&self, id: &str) -> Option<PathBuf> {
        if let Some(info) = self.registry.read().await.get(id) {
            return Some(info.path.clone());
        }

        let cache = hf_hub::Cache::default();
        cache
            .model(id.to_string())
            .get("config.json")
            .and_then(|config| config.parent().map(PathBuf::from))
    }

    fn get_device(use_gpu: bool) -> anyhow::Result<candle_core::Device> {
        if !use_gpu {
            tracing::info!("Using CPU device");
            return Ok(candle_core::Device::Cpu);
        }
        #[cfg(feature = "metal")]
        {
            tracing::info!("Using Metal device");
            Ok(candle_core::Device::new_metal(0)?)
        }
        #[cfg(all(feature = "cuda", not(feature = "metal")))]
        {
            tracing::info!("Using CUDA device");
            Ok(candle_core::Device::new_cuda(0)?)
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            tracing::info!("Using CPU device (no GPU features enabled)");
            Ok(candle_core::Device::Cpu)
        }
    }
}

#[async_trait]
impl ModelLoader for CandleLoader {
    async fn load(&self, id: &str) -> Result<Arc<dyn LoadedModel>, RuntimeError> {
        let path = self
            .resolve(id)
            .await
            .ok_or_else(|| RuntimeError::ModelNotFound(id.to_string()))?;

        tracing::info!("Loading {} from {:?}", id, path);

        let use_gpu = self.use_gpu;
        let load_err = |reason: String| RuntimeError::Load {
            id: id.to_string(),
            reason,
        };
        let model = tokio::task::spawn_blocking(move || {
            let device = Self::get_device(use_gpu)?;
            CandleModel::load(&path, &device)
        })
        .await
        .map_err(|e| load_err(e.to_string()))?
        .map_err(|e| load_err(format!("{:#}", e)))?;

        let stop_strings = default_stop_strings(id, model.eos_token());
        tracing::info!("Model {} loaded (stop strings: {:?})", id, stop_strings);

        Ok(Arc::new(CandleHandle {
            model: Arc::new(model),
            stop_strings,
        }))
    }
}

struct CandleHandle {
    model: Arc<CandleModel>,
    stop_strings: Vec<String>,
}

impl LoadedModel for CandleHandle {
    fn stop_strings(&self) -> Vec<String> {
        self.stop_strings.clone()
    }

    fn render_prompt(&self, messages: &[ChatMessage]) -> Result<String, RuntimeError> {
        Ok(render_chatml(messages))
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, RuntimeError> {
        self.model
            .encode(text)
            .map_err(|e| RuntimeError::Tokenization(e.to_string()))
    }

    fn create_generator(
        &self,
        tokens: Vec<u32>,
        constraints: GenerationConstraints,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, RuntimeError> {
        if constraints.json_schema.is_some() {
            tracing::warn!("Candle engine does not enforce JSON schemas; output is unconstrained");
        }

        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let model = self.model.clone();

        tokio::task::spawn_blocking(move || {
            if let Err(e) = model.generate(tokens, &constraints, &cancel, &tx) {
                tracing::error!("Generation error: {:#}", e);
                let reason = StopReason::Error(e.to_string());
                let _ = tx.blocking_send(GeneratedChunk::stop("", reason));
            }
        });

        Ok(rx)
    }
}

fn render_chatml(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        prompt.push_str(&format!(
            "<|im_start|>{}\n{}{}\n",
            msg.role, msg.content, CHATML_END
        ));
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

fn default_stop_strings(id: &str, eos_token: Option<&str>) -> Vec<String> {
    if id.starts_with("mlx-community/llama3.3") || id.starts_with("Qwen/") {
        return vec![CHATML_END.to_string()];
    }
    vec![eos_token.unwrap_or(CHATML_END).to_string()]
}
