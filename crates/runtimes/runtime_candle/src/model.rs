//! Model loading and token generation for the supported architectures

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama as llama_model;
use candle_transformers::models::phi as phi_model;
use kiln_runtime_api::{GeneratedChunk, GenerationConstraints, StopReason};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokenizers::Tokenizer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::sampling::Sampler;

pub struct CandleModel {
    arch: Architecture,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    eos_token_id: Option<u32>,
    eos_token: Option<String>,
}

enum Architecture {
    Llama {
        model: llama_model::Llama,
        config: llama_model::Config,
    },
    Phi(Mutex<phi_model::Model>),
}

/// Per-generation forward state.
enum Session<'a> {
    Llama {
        model: &'a llama_model::Llama,
        cache: llama_model::Cache,
    },
    Phi(MutexGuard<'a, phi_model::Model>),
}

impl Session<'_> {
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> Result<Tensor> {
        let logits = match self {
            Session::Llama { model, cache } => model.forward(input, index_pos, cache)?,
            Session::Phi(model) => model.forward(input)?,
        };
        Ok(logits.squeeze(0)?)
    }
}

impl CandleModel {
    pub fn load(model_path: &Path, device: &Device) -> Result<Self> {
        tracing::info!("Loading model from {:?}", model_path);

        let dtype = if device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };

        let config_path = find_file(model_path, "config.json")?;
        let tokenizer_path = find_file(model_path, "tokenizer.json")?;
        let weights = find_weights(model_path)?;

        tracing::debug!("Config: {:?}", config_path);
        tracing::debug!("Tokenizer: {:?}", tokenizer_path);
        tracing::debug!("Weights: {:?}", weights);

        let config_str = std::fs::read_to_string(&config_path)?;
        let config_json: serde_json::Value = serde_json::from_str(&config_str)?;

        let model_type = config_json
            .get("model_type")
            .and_then(|v| v.as_str())
            .unwrap_or("llama");

        tracing::info!("Model type: {}", model_type);

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let (eos_token, eos_token_id) = find_eos_token(&tokenizer);
        tracing::debug!("EOS token: {:?} ({:?})", eos_token, eos_token_id);

        // SAFETY: the weight files are not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, device)? };

        let arch = match model_type {
            "phi" | "phi-msft" | "phi2" => {
                let config: phi_model::Config = serde_json::from_str(&config_str)?;
                let model = phi_model::Model::new(&config, vb)?;
                Architecture::Phi(Mutex::new(model))
            }
            _ => {
                // Llama, Mistral, Qwen and friends share the Llama layout
                let config: llama_model::LlamaConfig = serde_json::from_str(&config_str)?;
                let config = config.into_config(false);
                let model = llama_model::Llama::load(vb, &config)?;
                Architecture::Llama { model, config }
            }
        };

        Ok(Self {
            arch,
            tokenizer,
            device: device.clone(),
            dtype,
            eos_token_id,
            eos_token,
        })
    }

    pub fn eos_token(&self) -> Option<&str> {
        self.eos_token.as_deref()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow::anyhow!("Decode error: {}", e))
    }

    fn session(&self) -> Result<Session<'_>> {
        match &self.arch {
            Architecture::Llama { model, config } => Ok(Session::Llama {
                model,
                cache: llama_model::Cache::new(true, self.dtype, config, &self.device)?,
            }),
            Architecture::Phi(model) => {
                let mut guard = model
                    .lock()
                    .map_err(|_| anyhow::anyhow!("model lock poisoned"))?;
                guard.clear_kv_cache();
                Ok(Session::Phi(guard))
            }
        }
    }

    /// Generate until a stop condition, sending text increments to `tx`.
    ///
    /// Runs on a blocking thread. Returns early, without a final chunk, when
    /// the receiver goes away or `cancel` fires.
    pub fn generate(
        &self,
        prompt: Vec<u32>,
        constraints: &GenerationConstraints,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<GeneratedChunk>,
    ) -> Result<()> {
        if prompt.is_empty() {
            anyhow::bail!("cannot generate from an empty prompt");
        }

        let mut session = self.session()?;
        let mut sampler = Sampler::new(&constraints.sampling);
        let prompt_len = prompt.len();
        let mut all_tokens = prompt;
        let mut emitted = 0;

        for step in 0..constraints.max_tokens {
            if cancel.is_cancelled() || tx.is_closed() {
                tracing::debug!("Generation cancelled after {} tokens", step);
                return Ok(());
            }

            let (context, index_pos) = if step == 0 {
                (&all_tokens[..], 0)
            } else {
                let last = all_tokens.len() - 1;
                (&all_tokens[last..], last)
            };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = session.forward(&input, index_pos)?;
            let next_token = sampler.sample(&logits, &all_tokens[prompt_len..])?;

            if Some(next_token) == self.eos_token_id {
                let text = self.decode(&all_tokens[prompt_len..])?;
                let rest = text.get(emitted..).unwrap_or_default();
                let _ = tx.blocking_send(GeneratedChunk::stop(rest, StopReason::End));
                return Ok(());
            }

            all_tokens.push(next_token);

            let text = self.decode(&all_tokens[prompt_len..])?;
            if let Some(end) = find_stop(&text, emitted, &constraints.stop_strings) {
                let rest = text.get(emitted..end).unwrap_or_default();
                let _ = tx.blocking_send(GeneratedChunk::stop(rest, StopReason::End));
                return Ok(());
            }

            // Hold back anything that might still grow into a stop string.
            let safe = text.len() - held_back(&text, &constraints.stop_strings);
            if safe > emitted {
                if let Some(delta) = text.get(emitted..safe) {
                    if tx.blocking_send(GeneratedChunk::text(delta)).is_err() {
                        return Ok(());
                    }
                    emitted = safe;
                }
            }
        }

        let text = self.decode(&all_tokens[prompt_len..])?;
        let rest = text.get(emitted..).unwrap_or_default();
        let _ = tx.blocking_send(GeneratedChunk::stop(rest, StopReason::MaxTokens));
        Ok(())
    }
}

/// Byte offset where the earliest stop string starts, searching from `from`.
fn find_stop(text: &str, from: usize, stop_strings: &[String]) -> Option<usize> {
    // A stop string may straddle the previous emit boundary only if part of it
    // was held back, so searching from the boundary is enough.
    let haystack = text.get(from..)?;
    stop_strings
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| haystack.find(s.as_str()))
        .min()
        .map(|pos| from + pos)
}

/// Length of the longest suffix of `text` that is a proper prefix of a stop
/// string.
fn held_back(text: &str, stop_strings: &[String]) -> usize {
    stop_strings
        .iter()
        .flat_map(|stop| {
            stop.char_indices()
                .skip(1)
                .map(|(i, _)| &stop[..i])
                .filter(|prefix| text.ends_with(prefix))
                .map(str::len)
        })
        .max()
        .unwrap_or(0)
}

fn find_eos_token(tokenizer: &Tokenizer) -> (Option<String>, Option<u32>) {
    let vocab = tokenizer.get_vocab(true);
    ["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>", "<eos>", "<|end|>"]
        .iter()
        .find_map(|token| vocab.get(*token).map(|id| (Some(token.to_string()), Some(*id))))
        .unwrap_or((None, None))
}

fn find_file(model_path: &Path, filename: &str) -> Result<PathBuf> {
    let direct = model_path.join(filename);
    if direct.exists() {
        return Ok(direct);
    }

    // Search in subdirectories
    for entry in std::fs::read_dir(model_path)
        .with_context(|| format!("reading {}", model_path.display()))?
    {
        let path = entry?.path().join(filename);
        if path.is_file() {
            return Ok(path);
        }
    }

    anyhow::bail!("Could not find {} in {:?}", filename, model_path)
}

/// Every safetensors shard in the directory, in name order.
fn find_weights(model_path: &Path) -> Result<Vec<PathBuf>> {
    let mut shards: Vec<PathBuf> = std::fs::read_dir(model_path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map(|e| e == "safetensors").unwrap_or(false))
        .collect();
    shards.sort();

    if shards.is_empty() {
        anyhow::bail!(
            "Could not find model weights (safetensors) in {:?}",
            model_path
        );
    }
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops() -> Vec<String> {
        vec!["<|im_end|>".to_string()]
    }

    #[test]
    fn finds_stop_string_after_boundary() {
        assert_eq!(find_stop("hello<|im_end|>", 3, &stops()), Some(5));
        assert_eq!(find_stop("hello", 0, &stops()), None);
    }

    #[test]
    fn holds_back_partial_stop_strings() {
        assert_eq!(held_back("hello<|im", &stops()), 4);
        assert_eq!(held_back("hello<", &stops()), 1);
        assert_eq!(held_back("hello", &stops()), 0);
    }
}
