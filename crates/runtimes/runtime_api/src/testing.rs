//! A deterministic in-memory engine for tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    ChatMessage, ChunkReceiver, GeneratedChunk, GenerationConstraints, LoadedModel, ModelLoader,
    RuntimeError, StopReason,
};

#[derive(Debug, Clone)]
struct Script {
    chunks: Vec<String>,
    stop: StopReason,
    chunk_delay: Duration,
    fail_tokenize: bool,
}

/// Loads [`ScriptedModel`]s that replay a fixed list of text chunks.
pub struct ScriptedLoader {
    known: Option<HashSet<String>>,
    script: Script,
    load_delay: Duration,
    loads: AtomicUsize,
    produced: Arc<AtomicUsize>,
    last_constraints: Arc<std::sync::Mutex<Option<GenerationConstraints>>>,
}

impl ScriptedLoader {
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: None,
            script: Script {
                chunks: chunks.into_iter().map(Into::into).collect(),
                stop: StopReason::End,
                chunk_delay: Duration::ZERO,
                fail_tokenize: false,
            },
            load_delay: Duration::ZERO,
            loads: AtomicUsize::new(0),
            produced: Arc::new(AtomicUsize::new(0)),
            last_constraints: Arc::default(),
        }
    }

    /// Only these ids resolve; everything else is `ModelNotFound`.
    pub fn only<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_stop(mut self, stop: StopReason) -> Self {
        self.script.stop = stop;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.script.chunk_delay = delay;
        self
    }

    pub fn failing_tokenizer(mut self) -> Self {
        self.script.fail_tokenize = true;
        self
    }

    /// How many models were constructed.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// How many chunks were handed to consumers across all generations.
    pub fn produced_count(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    /// Constraints of the most recent generation.
    pub fn last_constraints(&self) -> Option<GenerationConstraints> {
        self.last_constraints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ModelLoader for ScriptedLoader {
    async fn load(&self, id: &str) -> Result<Arc<dyn LoadedModel>, RuntimeError> {
        if let Some(known) = &self.known {
            if !known.contains(id) {
                return Err(RuntimeError::ModelNotFound(id.to_string()));
            }
        }
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        self.loads.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(ScriptedModel {
            script: self.script.clone(),
            produced: self.produced.clone(),
            last_constraints: self.last_constraints.clone(),
        }))
    }
}

pub struct ScriptedModel {
    script: Script,
    produced: Arc<AtomicUsize>,
    last_constraints: Arc<std::sync::Mutex<Option<GenerationConstraints>>>,
}

impl LoadedModel for ScriptedModel {
    fn stop_strings(&self) -> Vec<String> {
        vec!["<|im_end|>".to_string()]
    }

    fn render_prompt(&self, messages: &[ChatMessage]) -> Result<String, RuntimeError> {
        Ok(messages
            .iter()
            .map(|m| format!("{}: {}\n", m.role, m.content))
            .collect())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, RuntimeError> {
        if self.script.fail_tokenize {
            return Err(RuntimeError::Tokenization("scripted failure".to_string()));
        }
        Ok((0..text.split_whitespace().count() as u32).collect())
    }

    fn create_generator(
        &self,
        _tokens: Vec<u32>,
        constraints: GenerationConstraints,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, RuntimeError> {
        *self
            .last_constraints
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(constraints);

        let (tx, rx) = mpsc::channel(1);
        let script = self.script.clone();
        let produced = self.produced.clone();

        tokio::spawn(async move {
            if script.chunks.is_empty() {
                let _ = tx.send(GeneratedChunk::stop("", script.stop)).await;
                return;
            }
            let last = script.chunks.len() - 1;
            for (i, text) in script.chunks.into_iter().enumerate() {
                if !script.chunk_delay.is_zero() {
                    tokio::time::sleep(script.chunk_delay).await;
                }
                if cancel.is_cancelled() {
                    return;
                }
                let chunk = if i == last {
                    GeneratedChunk::stop(text, script.stop.clone())
                } else {
                    GeneratedChunk::text(text)
                };
                if tx.send(chunk).await.is_err() {
                    return;
                }
                produced.fetch_add(1, Ordering::SeqCst);
            }
        });

        Ok(rx)
    }
}
