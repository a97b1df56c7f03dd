//! kiln_runtime_api - Engine traits and types
//!
//! This crate defines the contract between the daemon and an inference
//! engine. An engine resolves model identifiers into loaded models
//! ([`ModelLoader`]); a loaded model tokenizes prompts, produces a lazy
//! stream of text increments ([`LoadedModel::create_generator`]) and hands out
//! incremental JSON-schema parsers ([`LoadedModel::schema_parser`]).

mod error;
pub mod schema_parser;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use error::{ParseError, RuntimeError};
pub use schema_parser::{HookKind, HookSpec, JsonPathParser, ParseEvent, SchemaParser};

/// Chat message for prompt rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Sampler settings forwarded to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub repetition_penalty: f32,
    pub repetition_context_size: usize,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: None,
            repetition_penalty: 1.1,
            repetition_context_size: 20,
            seed: None,
        }
    }
}

/// Everything that bounds one generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConstraints {
    /// Schema the output must conform to, when the engine can enforce one
    pub json_schema: Option<serde_json::Value>,
    pub max_tokens: usize,
    pub stop_strings: Vec<String>,
    pub sampling: SamplingParams,
}

/// Why the engine stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// End of sequence or a matched stop string
    End,
    MaxTokens,
    Cancelled,
    Error(String),
}

impl StopReason {
    pub fn as_str(&self) -> &str {
        match self {
            StopReason::End => "end",
            StopReason::MaxTokens => "max_tokens",
            StopReason::Cancelled => "cancelled",
            StopReason::Error(detail) => detail,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One increment of generated text. The last chunk carries the stop reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedChunk {
    pub text: String,
    pub stop: Option<StopReason>,
}

impl GeneratedChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stop: None,
        }
    }

    pub fn stop(text: impl Into<String>, reason: StopReason) -> Self {
        Self {
            text: text.into(),
            stop: Some(reason),
        }
    }
}

/// Receiving end of a running generation. Dropping it tells the engine to
/// stop producing tokens.
pub type ChunkReceiver = mpsc::Receiver<GeneratedChunk>;

/// Resolves model identifiers into loaded, ready-to-infer models.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Load a model. Expensive; may take seconds.
    ///
    /// Unknown identifiers fail with [`RuntimeError::ModelNotFound`].
    async fn load(&self, id: &str) -> Result<Arc<dyn LoadedModel>, RuntimeError>;
}

/// A model resident in memory together with its tokenizer.
pub trait LoadedModel: Send + Sync {
    /// Stop strings derived from the tokenizer configuration
    fn stop_strings(&self) -> Vec<String>;

    /// Render a conversation into a prompt ending with the assistant turn
    fn render_prompt(&self, messages: &[ChatMessage]) -> Result<String, RuntimeError>;

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, RuntimeError>;

    /// Start generating from `tokens`.
    ///
    /// The engine checks `cancel` (and whether the receiver is still alive)
    /// between token steps and stops as soon as either says so.
    fn create_generator(
        &self,
        tokens: Vec<u32>,
        constraints: GenerationConstraints,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, RuntimeError>;

    /// Incremental parser for output constrained by `schema`, reporting the
    /// structural events named in `hooks`.
    fn schema_parser(
        &self,
        schema: &serde_json::Value,
        hooks: Vec<HookSpec>,
    ) -> Result<Box<dyn SchemaParser>, RuntimeError> {
        let parser = JsonPathParser::for_schema(schema, hooks)?;
        Ok(Box::new(parser))
    }
}
