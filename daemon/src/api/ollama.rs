//! Ollama-compatible endpoints, so existing Ollama clients can talk to kiln.
//!
//! Ollama API docs: https://github.com/ollama/ollama/blob/main/docs/api.md

use axum::{
    body::Body,
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use kiln_core::keep_alive::KeepAliveInput;
use kiln_core::KeepAlive;
use kiln_runtime_api::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{convert::Infallible, sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, OllamaError};
use crate::pipeline::{self, EventStream, GenerationEvent, GenerationRequest, Timing};
use crate::responder::finish_reason;
use crate::state::AppState;

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: Option<String>,
    pub stream: Option<bool>,
    pub keep_alive: Option<KeepAliveInput>,
    pub format: Option<Value>,
    pub options: Option<Options>,
    // Accepted so they can be refused explicitly.
    pub system: Option<String>,
    pub suffix: Option<String>,
    pub images: Option<Vec<String>>,
    pub template: Option<String>,
    pub raw: Option<bool>,
    pub context: Option<Vec<u32>>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub stream: Option<bool>,
    pub keep_alive: Option<KeepAliveInput>,
    pub format: Option<Value>,
    pub options: Option<Options>,
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Options {
    pub num_predict: Option<u32>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<u64>,
    pub repeat_penalty: Option<f32>,
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ShowRequest {
    pub model: Option<String>,
    /// Older clients send `name`
    pub name: Option<String>,
}

/// `"json"` means any object; an object is taken as the schema itself.
fn format_schema(format: Option<&Value>) -> Result<Option<Value>, ApiError> {
    match format {
        None => Ok(None),
        Some(Value::String(s)) if s == "json" => {
            Ok(Some(json!({"type": "object", "additionalProperties": true})))
        }
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(schema @ Value::Object(_)) => Ok(Some(schema.clone())),
        Some(other) => Err(ApiError::InvalidConfiguration(format!(
            "unsupported format {other}"
        ))),
    }
}

fn resolve_keep_alive(
    state: &AppState,
    input: Option<&KeepAliveInput>,
) -> Result<KeepAlive, ApiError> {
    match input {
        Some(input) => Ok(input.resolve()?),
        None => Ok(state.keep_alive),
    }
}

fn generation_request(
    state: &AppState,
    model: &str,
    prompt: Option<String>,
    keep_alive: KeepAlive,
    format: Option<&Value>,
    options: Option<Options>,
) -> Result<GenerationRequest, ApiError> {
    let options = options.unwrap_or_default();
    let mut request = GenerationRequest::new(model, prompt, keep_alive);
    request.json_schema = format_schema(format)?;
    request.max_tokens = state.max_tokens(options.num_predict.or(options.max_tokens));
    request.stop_strings = options.stop.unwrap_or_default();
    request.sampling = state.sampling(
        options.temperature,
        options.top_p,
        options.repeat_penalty,
        options.seed,
    );
    Ok(request)
}

// ============================================================================
// POST /api/generate
// ============================================================================

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, OllamaError> {
    let unsupported = [
        ("system", request.system.is_some()),
        ("suffix", request.suffix.is_some()),
        ("images", request.images.is_some()),
        ("template", request.template.is_some()),
        ("raw", request.raw.is_some()),
        ("context", request.context.is_some()),
    ];
    if let Some((field, _)) = unsupported.iter().find(|(_, present)| *present) {
        return Err(ApiError::NotImplemented(field.to_string()).into());
    }

    let keep_alive = resolve_keep_alive(&state, request.keep_alive.as_ref())?;
    let generation = generation_request(
        &state,
        &request.model,
        request.prompt,
        keep_alive,
        request.format.as_ref(),
        request.options,
    )?;

    tracing::info!("Starting generation with {}", request.model);
    let events = pipeline::start(&state.cache, generation, CancellationToken::new()).await?;
    let responder = OllamaResponder {
        model: request.model,
        surface: Surface::Generate,
        streaming: request.stream.unwrap_or(true),
    };
    respond(events, responder).await
}

// ============================================================================
// POST /api/chat
// ============================================================================

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, OllamaError> {
    if request.tools.as_ref().is_some_and(|t| !t.is_empty()) {
        return Err(ApiError::NotImplemented("tools".to_string()).into());
    }

    let keep_alive = resolve_keep_alive(&state, request.keep_alive.as_ref())?;
    // Validated before the model is loaded; the prompt is filled in afterwards.
    let mut generation = generation_request(
        &state,
        &request.model,
        None,
        keep_alive,
        request.format.as_ref(),
        request.options,
    )?;
    let responder = OllamaResponder {
        model: request.model.clone(),
        surface: Surface::Chat,
        streaming: request.stream.unwrap_or(true),
    };

    let Some(ttl) = keep_alive.ttl() else {
        let events = pipeline::start(&state.cache, generation, CancellationToken::new()).await?;
        return respond(events, responder).await;
    };

    let started = Instant::now();
    let handle = state.cache.acquire(&request.model, ttl).await?;
    let timing = Timing {
        started,
        loaded: Instant::now(),
    };

    if !request.messages.is_empty() {
        generation.prompt = Some(handle.model().render_prompt(&request.messages)?);
    }

    tracing::info!("Starting chat with {}", request.model);
    let events = pipeline::run(handle, generation, timing, CancellationToken::new());
    respond(events, responder).await
}

// ============================================================================
// Response assembly
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Surface {
    Generate,
    Chat,
}

/// One object of an Ollama response. `/api/generate` fills `response`,
/// `/api/chat` fills `message`; statistics ride on the final object only.
#[derive(Debug, Serialize)]
struct OllamaResponse {
    model: String,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<OllamaMessage>,
    done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    done_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    load_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_eval_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_eval_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eval_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eval_duration: Option<u64>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
}

/// Renders pipeline events as Ollama response objects.
struct OllamaResponder {
    model: String,
    surface: Surface,
    streaming: bool,
}

impl OllamaResponder {
    fn on_event(&self, event: &GenerationEvent) -> Option<OllamaResponse> {
        match event {
            GenerationEvent::Chunk(chunk) if self.streaming => {
                Some(self.message(chunk.text.clone(), false))
            }
            GenerationEvent::Chunk(_) => None,
            GenerationEvent::End(end) => {
                let content = if self.streaming {
                    String::new()
                } else {
                    end.full_response.clone()
                };
                Some(OllamaResponse {
                    done_reason: Some(finish_reason(&end.done_reason)),
                    total_duration: Some(end.durations.total),
                    load_duration: Some(end.durations.load),
                    prompt_eval_count: Some(end.prompt_token_count),
                    prompt_eval_duration: Some(end.durations.prompt_eval),
                    eval_count: Some(end.completion_token_count),
                    eval_duration: Some(end.durations.eval),
                    ..self.message(content, true)
                })
            }
            GenerationEvent::Load => Some(self.residency("load")),
            GenerationEvent::Unload => Some(self.residency("unload")),
        }
    }

    fn residency(&self, reason: &str) -> OllamaResponse {
        OllamaResponse {
            done_reason: Some(reason.to_string()),
            ..self.message(String::new(), true)
        }
    }

    fn message(&self, content: String, done: bool) -> OllamaResponse {
        let (response, message) = match self.surface {
            Surface::Generate => (Some(content), None),
            Surface::Chat => (
                None,
                Some(OllamaMessage {
                    role: "assistant",
                    content,
                }),
            ),
        };
        OllamaResponse {
            model: self.model.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            response,
            message,
            done,
            done_reason: None,
            total_duration: None,
            load_duration: None,
            prompt_eval_count: None,
            prompt_eval_duration: None,
            eval_count: None,
            eval_duration: None,
        }
    }
}

async fn respond(
    mut events: EventStream,
    responder: OllamaResponder,
) -> Result<Response, OllamaError> {
    if !responder.streaming {
        while let Some(event) = events.next().await {
            if let Some(message) = responder.on_event(&event) {
                return Ok(Json(message).into_response());
            }
        }
        return Err(ApiError::GenerationAborted.into());
    }

    let lines = events.filter_map(move |event| {
        let line = responder.on_event(&event).and_then(|message| {
            match serde_json::to_string(&message) {
                Ok(json) => Some(Ok::<_, Infallible>(json + "\n")),
                Err(e) => {
                    tracing::error!("Failed to encode response line: {}", e);
                    None
                }
            }
        });
        async move { line }
    });
    Ok((
        [(CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

// ============================================================================
// Housekeeping
// ============================================================================

/// GET /api/tags
pub async fn tags(State(state): State<Arc<AppState>>) -> Json<Value> {
    let registry = state.registry.read().await;
    let models: Vec<Value> = registry
        .list()
        .iter()
        .map(|m| {
            json!({
                "name": m.name,
                "model": m.name,
                "modified_at": m.added_at.to_rfc3339(),
                "size": m.size_bytes,
                "digest": "",
                "details": {"format": m.format.as_str()},
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

/// GET /api/version
pub async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

/// POST /api/show
pub async fn show(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ShowRequest>,
) -> Result<Json<Value>, OllamaError> {
    let name = request.model.or(request.name).ok_or_else(|| {
        ApiError::InvalidConfiguration("'model' is required".to_string())
    })?;

    let format = {
        let registry = state.registry.read().await;
        registry.get(&name).map(|m| m.format.as_str())
    };
    let resident = state.cache.resident().into_iter().any(|m| m.id == name);
    let format = match (format, resident) {
        (Some(format), _) => format,
        (None, true) => "safetensors",
        (None, false) => return Err(ApiError::ModelNotFound(name).into()),
    };

    Ok(Json(json!({
        "modelfile": "",
        "parameters": "",
        "template": "",
        "details": {"format": format},
        "model_info": {},
    })))
}

/// GET /api/ps
pub async fn ps(State(state): State<Arc<AppState>>) -> Json<Value> {
    let models: Vec<Value> = state
        .cache
        .resident()
        .into_iter()
        .map(|m| {
            json!({
                "name": m.id,
                "model": m.id,
                "size": 0,
                "loaded_at": m.loaded_at.to_rfc3339(),
                "expires_at": m.expires_at.to_rfc3339(),
                "active_requests": m.active_leases,
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Durations, EndEvent};
    use kiln_runtime_api::StopReason;

    fn render(responder: &OllamaResponder, event: &GenerationEvent) -> Option<Value> {
        responder
            .on_event(event)
            .map(|m| serde_json::to_value(m).unwrap())
    }

    fn end() -> GenerationEvent {
        GenerationEvent::End(EndEvent {
            done_reason: StopReason::MaxTokens,
            full_response: "Hello world".into(),
            prompt_token_count: 3,
            completion_token_count: 2,
            durations: Durations {
                total: 40,
                load: 10,
                prompt_eval: 5,
                eval: 25,
            },
        })
    }

    #[test]
    fn json_format_allows_any_object() {
        let schema = format_schema(Some(&json!("json"))).unwrap().unwrap();
        assert_eq!(schema["additionalProperties"], true);
        assert!(format_schema(Some(&json!(7))).is_err());
        assert_eq!(format_schema(None).unwrap(), None);
    }

    #[test]
    fn streamed_terminal_object_has_no_text() {
        let responder = OllamaResponder {
            model: "m".into(),
            surface: Surface::Generate,
            streaming: true,
        };
        let last = render(&responder, &end()).unwrap();
        assert_eq!(last["response"], "");
        assert_eq!(last["done"], true);
        assert_eq!(last["done_reason"], "length");
        assert_eq!(last["load_duration"], 10);
        assert_eq!(last["eval_count"], 2);
    }

    #[test]
    fn single_chat_object_carries_full_response() {
        let responder = OllamaResponder {
            model: "m".into(),
            surface: Surface::Chat,
            streaming: false,
        };
        let chunk = GenerationEvent::Chunk(crate::pipeline::ChunkEvent {
            text: "Hello".into(),
            prompt_tokens: 3,
            completion_tokens: 1,
        });
        assert!(responder.on_event(&chunk).is_none());

        let last = render(&responder, &end()).unwrap();
        assert_eq!(last["message"]["content"], "Hello world");
        assert_eq!(last["message"]["role"], "assistant");
        assert_eq!(last["prompt_eval_count"], 3);
    }

    #[test]
    fn residency_events_answer_done() {
        let responder = OllamaResponder {
            model: "m".into(),
            surface: Surface::Generate,
            streaming: true,
        };
        let load = render(&responder, &GenerationEvent::Load).unwrap();
        assert_eq!(load["done_reason"], "load");
        let unload = render(&responder, &GenerationEvent::Unload).unwrap();
        assert_eq!(unload["done_reason"], "unload");
        assert_eq!(unload["done"], true);
        assert!(unload.get("eval_count").is_none());
        assert!(unload.get("message").is_none());
    }

    #[test]
    fn streamed_chunks_carry_no_statistics() {
        let responder = OllamaResponder {
            model: "m".into(),
            surface: Surface::Chat,
            streaming: true,
        };
        let chunk = GenerationEvent::Chunk(crate::pipeline::ChunkEvent {
            text: "Hel".into(),
            prompt_tokens: 3,
            completion_tokens: 1,
        });
        let line = render(&responder, &chunk).unwrap();
        assert_eq!(line["message"], json!({"role": "assistant", "content": "Hel"}));
        assert_eq!(line["done"], false);
        for field in ["response", "done_reason", "total_duration", "eval_count"] {
            assert!(line.get(field).is_none(), "{field}");
        }
    }
}
