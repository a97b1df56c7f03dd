//! Generation event pipeline.
//!
//! Turns one request into a lazy, ordered sequence of [`GenerationEvent`]s:
//! `[Chunk*, End]` for a generation, or a single `Load` / `Unload`.

use futures_util::stream::BoxStream;
use kiln_core::KeepAlive;
use kiln_runtime_api::{GenerationConstraints, RuntimeError, SamplingParams, StopReason};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{ModelCache, ModelHandle};

pub type EventStream = BoxStream<'static, GenerationEvent>;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    /// `None` only loads (or refreshes) the model
    pub prompt: Option<String>,
    pub keep_alive: KeepAlive,
    pub json_schema: Option<Value>,
    pub max_tokens: usize,
    /// Added to the model's own stop strings
    pub stop_strings: Vec<String>,
    pub sampling: SamplingParams,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: Option<String>, keep_alive: KeepAlive) -> Self {
        Self {
            model: model.into(),
            prompt,
            keep_alive,
            json_schema: None,
            max_tokens: 1024,
            stop_strings: Vec::new(),
            sampling: SamplingParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Load,
    Unload,
    Chunk(ChunkEvent),
    End(EndEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEvent {
    pub text: String,
    pub prompt_tokens: usize,
    /// Ordinal of this chunk within the generation
    pub completion_tokens: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndEvent {
    pub done_reason: StopReason,
    pub full_response: String,
    pub prompt_token_count: usize,
    pub completion_token_count: usize,
    pub durations: Durations,
}

/// Wall-clock phases of a generation, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Durations {
    pub total: u64,
    pub load: u64,
    pub prompt_eval: u64,
    pub eval: u64,
}

/// When the request arrived and when its model became ready.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub started: Instant,
    pub loaded: Instant,
}

/// Resolve the model for `request` and start its event sequence.
///
/// Resolution failures (unknown model, failed load) are returned here, before
/// any event is produced.
pub async fn start(
    cache: &ModelCache,
    request: GenerationRequest,
    cancel: CancellationToken,
) -> Result<EventStream, RuntimeError> {
    let started = Instant::now();

    let ttl = match request.keep_alive.ttl() {
        Some(ttl) => ttl,
        None => {
            cache.unload(&request.model);
            return Ok(Box::pin(futures_util::stream::once(async {
                GenerationEvent::Unload
            })));
        }
    };

    let handle = cache.acquire(&request.model, ttl).await?;
    let timing = Timing {
        started,
        loaded: Instant::now(),
    };

    Ok(run(handle, request, timing, cancel))
}

/// Drive one generation on an already resident model.
pub fn run(
    handle: Arc<ModelHandle>,
    request: GenerationRequest,
    timing: Timing,
    cancel: CancellationToken,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let Some(prompt) = request.prompt else {
            yield GenerationEvent::Load;
            return;
        };

        let lease = handle.lease();
        let mut guard = GenerationGuard::new(handle.id(), cancel.clone());
        tracing::debug!("Prompt for {}: {}", handle.id(), prompt);

        let tokens = match lease.model().tokenize(&prompt) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!("Tokenization failed for {}: {}", handle.id(), e);
                guard.finish();
                yield GenerationEvent::End(EndEvent::failed(e, timing, 0));
                return;
            }
        };
        let tokenized = Instant::now();
        let prompt_tokens = tokens.len();

        let mut stop_strings = lease.stop_strings().to_vec();
        for stop in request.stop_strings {
            if !stop.is_empty() && !stop_strings.contains(&stop) {
                stop_strings.push(stop);
            }
        }
        if let Some(schema) = &request.json_schema {
            tracing::debug!("Using schema: {}", schema);
        }
        let constraints = GenerationConstraints {
            json_schema: request.json_schema,
            max_tokens: request.max_tokens,
            stop_strings,
            sampling: request.sampling,
        };

        let mut chunks = match lease.model().create_generator(tokens, constraints, cancel.clone()) {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::error!("Could not start generation for {}: {}", handle.id(), e);
                guard.finish();
                yield GenerationEvent::End(EndEvent::failed(e, timing, prompt_tokens));
                return;
            }
        };

        let mut full_response = String::new();
        let mut completion_tokens = 0;
        let mut first_chunk: Option<Instant> = None;

        let done_reason = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = chunks.recv() => Some(chunk),
            };
            let Some(next) = next else {
                // Cancelled from outside; nobody is left to read an End event.
                return;
            };
            let Some(chunk) = next else {
                break StopReason::Error("generator closed without a stop condition".to_string());
            };

            if !chunk.text.is_empty() {
                first_chunk.get_or_insert_with(Instant::now);
                completion_tokens += 1;
                full_response.push_str(&chunk.text);
                yield GenerationEvent::Chunk(ChunkEvent {
                    text: chunk.text,
                    prompt_tokens,
                    completion_tokens,
                });
            }
            if let Some(stop) = chunk.stop {
                break stop;
            }
        };

        let ended = Instant::now();
        let prompt_done = first_chunk.unwrap_or(tokenized);
        guard.finish();
        tracing::debug!(
            "Generation for {} stopped ({}) after {} chunks",
            handle.id(),
            done_reason,
            completion_tokens
        );

        yield GenerationEvent::End(EndEvent {
            done_reason,
            full_response,
            prompt_token_count: prompt_tokens,
            completion_token_count: completion_tokens,
            durations: Durations {
                total: nanos_between(timing.started, ended),
                load: nanos_between(timing.started, timing.loaded),
                prompt_eval: nanos_between(timing.loaded, prompt_done),
                eval: first_chunk.map(|first| nanos_between(first, ended)).unwrap_or(0),
            },
        });
    })
}

impl EndEvent {
    fn failed(error: RuntimeError, timing: Timing, prompt_tokens: usize) -> Self {
        let ended = Instant::now();
        Self {
            done_reason: StopReason::Error(error.to_string()),
            full_response: String::new(),
            prompt_token_count: prompt_tokens,
            completion_token_count: 0,
            durations: Durations {
                total: nanos_between(timing.started, ended),
                load: nanos_between(timing.started, timing.loaded),
                prompt_eval: nanos_between(timing.loaded, ended),
                eval: 0,
            },
        }
    }
}

fn nanos_between(from: Instant, to: Instant) -> u64 {
    u64::try_from(to.saturating_duration_since(from).as_nanos()).unwrap_or(u64::MAX)
}

/// Cancels the engine when the event stream goes away before its End event.
struct GenerationGuard {
    model: String,
    cancel: CancellationToken,
    finished: bool,
}

impl GenerationGuard {
    fn new(model: &str, cancel: CancellationToken) -> Self {
        Self {
            model: model.to_string(),
            cancel,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Generation for {} aborted", self.model);
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use kiln_runtime_api::testing::ScriptedLoader;
    use std::time::Duration;

    fn five_minutes() -> KeepAlive {
        KeepAlive::For(Duration::from_secs(300))
    }

    fn request(prompt: Option<&str>) -> GenerationRequest {
        GenerationRequest::new("m", prompt.map(String::from), five_minutes())
    }

    async fn collect(cache: &ModelCache, request: GenerationRequest) -> Vec<GenerationEvent> {
        start(cache, request, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await
    }

    fn end_of(events: &[GenerationEvent]) -> &EndEvent {
        match events.last() {
            Some(GenerationEvent::End(end)) => end,
            other => panic!("expected End last, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunks_then_exactly_one_end() {
        let loader = Arc::new(ScriptedLoader::new(["Hel", "", "lo", " world"]));
        let cache = ModelCache::new(loader);

        let events = collect(&cache, request(Some("say hello please"))).await;

        let texts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Chunk(c) => Some(c.text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["Hel", "lo", " world"]);
        assert_eq!(events.len(), 4);

        let end = end_of(&events);
        assert_eq!(end.done_reason, StopReason::End);
        assert_eq!(end.full_response, texts.concat());
        assert_eq!(end.prompt_token_count, 3);
        assert_eq!(end.completion_token_count, 3);
        assert!(end.durations.total >= end.durations.load);
    }

    #[tokio::test]
    async fn silent_generation_reports_no_eval_time() {
        let cache = ModelCache::new(Arc::new(ScriptedLoader::new(Vec::<String>::new())));
        let events = collect(&cache, request(Some("anything at all"))).await;

        assert_eq!(events.len(), 1);
        let end = end_of(&events);
        assert_eq!(end.done_reason, StopReason::End);
        assert_eq!(end.completion_token_count, 0);
        assert_eq!(end.full_response, "");
        assert_eq!(end.durations.eval, 0);
        assert!(end.durations.total >= end.durations.load + end.durations.prompt_eval);
    }

    #[tokio::test]
    async fn chunks_carry_running_counts() {
        let cache = ModelCache::new(Arc::new(ScriptedLoader::new(["a", "b"])));
        let events = collect(&cache, request(Some("one two"))).await;

        let counts: Vec<(usize, usize)> = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Chunk(c) => Some((c.prompt_tokens, c.completion_tokens)),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![(2, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn missing_prompt_only_loads() {
        let loader = Arc::new(ScriptedLoader::new(["x"]));
        let cache = ModelCache::new(loader.clone());

        let events = collect(&cache, request(None)).await;

        assert_eq!(events, vec![GenerationEvent::Load]);
        assert_eq!(loader.load_count(), 1);
        assert_eq!(cache.resident().len(), 1);
    }

    #[tokio::test]
    async fn zero_keep_alive_unloads_without_loading() {
        let loader = Arc::new(ScriptedLoader::new(["x"]));
        let cache = ModelCache::new(loader.clone());
        collect(&cache, request(None)).await;

        let unload = GenerationRequest::new("m", Some("ignored".into()), KeepAlive::Unload);
        let events = collect(&cache, unload).await;

        assert_eq!(events, vec![GenerationEvent::Unload]);
        assert!(cache.resident().is_empty());
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn tokenizer_failure_still_ends() {
        let cache = ModelCache::new(Arc::new(ScriptedLoader::new(["x"]).failing_tokenizer()));

        let events = collect(&cache, request(Some("hi"))).await;

        assert_eq!(events.len(), 1);
        let end = end_of(&events);
        assert!(matches!(&end.done_reason, StopReason::Error(detail) if detail.contains("scripted failure")));
        assert_eq!(end.durations.eval, 0);
    }

    #[tokio::test]
    async fn stop_reason_is_copied_from_the_engine() {
        let cache = ModelCache::new(Arc::new(
            ScriptedLoader::new(["a"]).with_stop(StopReason::MaxTokens),
        ));
        let events = collect(&cache, request(Some("hi"))).await;
        assert_eq!(end_of(&events).done_reason, StopReason::MaxTokens);
    }

    #[tokio::test]
    async fn request_stop_strings_extend_the_models() {
        let loader = Arc::new(ScriptedLoader::new(["a"]));
        let cache = ModelCache::new(loader.clone());
        let mut req = request(Some("hi"));
        req.stop_strings = vec!["END".into(), "<|im_end|>".into()];
        req.max_tokens = 7;

        collect(&cache, req).await;

        let constraints = loader.last_constraints().unwrap();
        assert_eq!(constraints.stop_strings, vec!["<|im_end|>", "END"]);
        assert_eq!(constraints.max_tokens, 7);
    }

    #[tokio::test]
    async fn unknown_model_fails_before_streaming() {
        let cache = ModelCache::new(Arc::new(ScriptedLoader::new(["x"]).only(["other"])));
        let result = start(&cache, request(Some("hi")), CancellationToken::new()).await;
        assert!(matches!(result, Err(RuntimeError::ModelNotFound(_))));
    }

    #[tokio::test]
    async fn load_time_is_measured() {
        let cache = ModelCache::new(Arc::new(
            ScriptedLoader::new(["a"]).with_load_delay(Duration::from_millis(20)),
        ));
        let events = collect(&cache, request(Some("hi"))).await;
        assert!(end_of(&events).durations.load >= 20_000_000);
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_the_engine() {
        let chunks: Vec<String> = (0..50).map(|i| format!("t{i} ")).collect();
        let loader = Arc::new(
            ScriptedLoader::new(chunks).with_chunk_delay(Duration::from_millis(5)),
        );
        let cache = ModelCache::new(loader.clone());
        let cancel = CancellationToken::new();

        let mut events = start(&cache, request(Some("go")), cancel.clone())
            .await
            .unwrap();
        events.next().await;
        events.next().await;
        drop(events);

        assert!(cancel.is_cancelled());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let produced = loader.produced_count();
        assert!(produced <= 4, "engine kept going: {produced} chunks");
        assert_eq!(cache.resident()[0].active_leases, 0);
    }

    #[tokio::test]
    async fn external_cancellation_ends_the_stream() {
        let chunks: Vec<String> = (0..50).map(|i| format!("t{i} ")).collect();
        let cache = ModelCache::new(Arc::new(
            ScriptedLoader::new(chunks).with_chunk_delay(Duration::from_millis(5)),
        ));
        let cancel = CancellationToken::new();
        let mut events = start(&cache, request(Some("go")), cancel.clone())
            .await
            .unwrap();

        events.next().await;
        cancel.cancel();
        let rest: Vec<GenerationEvent> = events.collect().await;

        assert!(rest.len() < 49);
        assert!(!rest.iter().any(|e| matches!(e, GenerationEvent::End(_))));
    }
}
