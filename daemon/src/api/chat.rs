//! OpenAI-compatible `/v1/chat/completions`.

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use kiln_runtime_api::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{convert::Infallible, sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::pipeline::{self, EventStream, GenerationRequest, Timing};
use crate::responder::{ChatResponder, ContentMode, Delivery, FunctionSpec, ToolSet};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessageInput>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<u64>,
    #[serde(default)]
    pub stream: bool,
    pub stop: Option<StopInput>,
    pub tools: Option<Vec<ToolInput>>,
    pub tool_choice: Option<ToolChoice>,
    /// Deprecated by OpenAI in favour of `tools`
    pub functions: Option<Vec<FunctionSpec>>,
    pub function_call: Option<ToolChoice>,
    pub tool_options: Option<ToolOptions>,
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageInput {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StopInput {
    One(String),
    Many(Vec<String>),
}

impl StopInput {
    fn into_vec(self) -> Vec<String> {
        match self {
            StopInput::One(stop) => vec![stop],
            StopInput::Many(stops) => stops,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ToolInput {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

/// `"none"`, `"auto"`, or a specific function.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Keyword(String),
    Named(NamedChoice),
}

/// Accepts both `{"name": ..}` and `{"type": "function", "function": {"name": ..}}`.
#[derive(Debug, Deserialize)]
pub struct NamedChoice {
    pub name: Option<String>,
    pub function: Option<NamedFunction>,
}

#[derive(Debug, Deserialize)]
pub struct NamedFunction {
    pub name: String,
}

impl NamedChoice {
    fn name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or_else(|| self.function.as_ref().map(|f| f.name.as_str()))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolOptions {
    /// Skip the system message describing the tools
    #[serde(default)]
    pub no_prompt_steering: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
    /// Non-standard: a schema (object or JSON text) for `json_object`
    pub schema: Option<Value>,
    pub json_schema: Option<JsonSchemaFormat>,
}

#[derive(Debug, Deserialize)]
pub struct JsonSchemaFormat {
    pub schema: Value,
}

impl ChatCompletionRequest {
    /// Functions offered to the model, and whether to answer in the legacy
    /// `function_call` form.
    fn tool_set(&self) -> Result<Option<ToolSet>, ApiError> {
        let tools: Vec<FunctionSpec> = self
            .tools
            .iter()
            .flatten()
            .filter(|t| t.kind == "function")
            .map(|t| t.function.clone())
            .collect();

        if !tools.is_empty() || self.tool_choice.is_some() {
            return match select(&self.tool_choice, tools)? {
                Some(functions) => ToolSet::new(functions, false).map(Some),
                None => Ok(None),
            };
        }

        let functions = self.functions.clone().unwrap_or_default();
        if functions.is_empty() {
            return Ok(None);
        }
        match select(&self.function_call, functions)? {
            Some(functions) => ToolSet::new(functions, true).map(Some),
            None => Ok(None),
        }
    }

    fn schema(&self) -> Result<Option<Value>, ApiError> {
        let Some(format) = &self.response_format else {
            return Ok(None);
        };
        match format.kind.as_str() {
            "text" => Ok(None),
            "json_object" => match &format.schema {
                None => Ok(Some(serde_json::json!({"type": "object"}))),
                Some(Value::String(text)) => serde_json::from_str(text).map(Some).map_err(|e| {
                    ApiError::InvalidConfiguration(format!("response_format.schema: {e}"))
                }),
                Some(schema) => Ok(Some(schema.clone())),
            },
            "json_schema" => format
                .json_schema
                .as_ref()
                .map(|s| Some(s.schema.clone()))
                .ok_or_else(|| {
                    ApiError::InvalidConfiguration(
                        "response_format.json_schema is required".to_string(),
                    )
                }),
            other => Err(ApiError::InvalidConfiguration(format!(
                "unsupported response_format type '{other}'"
            ))),
        }
    }
}

/// Apply a choice to the offered functions. A missing choice means "auto".
fn select(
    choice: &Option<ToolChoice>,
    offered: Vec<FunctionSpec>,
) -> Result<Option<Vec<FunctionSpec>>, ApiError> {
    match choice {
        Some(ToolChoice::Keyword(k)) if k == "none" => Ok(None),
        None => Ok(Some(offered).filter(|f| !f.is_empty())),
        Some(ToolChoice::Keyword(k)) if k == "auto" || k == "required" => {
            Ok(Some(offered).filter(|f| !f.is_empty()))
        }
        Some(ToolChoice::Keyword(other)) => Err(ApiError::InvalidConfiguration(format!(
            "unsupported tool choice '{other}'"
        ))),
        Some(ToolChoice::Named(named)) => {
            let name = named.name().ok_or_else(|| {
                ApiError::InvalidConfiguration("tool choice without a function name".to_string())
            })?;
            offered
                .into_iter()
                .find(|f| f.name == name)
                .map(|f| Some(vec![f]))
                .ok_or_else(|| {
                    ApiError::InvalidConfiguration(format!("no function named '{name}' offered"))
                })
        }
    }
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let tools = request.tool_set()?;
    let schema = match &tools {
        Some(tools) => Some(tools.schema()),
        None => request.schema()?,
    };

    let started = Instant::now();
    let handle = state.cache.acquire(&request.model, state.default_ttl()).await?;
    let timing = Timing {
        started,
        loaded: Instant::now(),
    };

    let mut messages: Vec<ChatMessage> = request
        .messages
        .iter()
        .map(|m| ChatMessage::new(m.role.clone(), m.content.clone().unwrap_or_default()))
        .collect();
    let steer = !request
        .tool_options
        .as_ref()
        .is_some_and(|o| o.no_prompt_steering);
    if let (Some(tools), true) = (&tools, steer) {
        messages.insert(0, ChatMessage::new("system", tools.prompt()));
    }
    let prompt = handle.model().render_prompt(&messages)?;

    let delivery = if request.stream {
        Delivery::Streaming
    } else {
        Delivery::Single
    };
    let content = match tools {
        Some(tools) => {
            let parser = match delivery {
                Delivery::Streaming => Some(
                    handle
                        .model()
                        .schema_parser(&tools.schema(), tools.hooks())?,
                ),
                Delivery::Single => None,
            };
            ContentMode::Tools { tools, parser }
        }
        None => {
            let values = match (&schema, delivery) {
                (Some(schema), Delivery::Streaming) => {
                    Some(handle.model().schema_parser(schema, Vec::new())?)
                }
                _ => None,
            };
            ContentMode::Text { values }
        }
    };

    let generation = GenerationRequest {
        model: request.model.clone(),
        prompt: Some(prompt),
        keep_alive: state.keep_alive,
        json_schema: schema,
        max_tokens: state.max_tokens(request.max_tokens),
        stop_strings: request.stop.map(StopInput::into_vec).unwrap_or_default(),
        sampling: state.sampling(request.temperature, request.top_p, None, request.seed),
    };

    tracing::info!("Starting generation with {}", request.model);
    let events = pipeline::run(handle, generation, timing, CancellationToken::new());
    let responder = ChatResponder::new(request.model, delivery, content);

    match delivery {
        Delivery::Streaming => Ok(stream_response(events, responder)),
        Delivery::Single => single_response(events, responder).await,
    }
}

async fn single_response(
    mut events: EventStream,
    mut responder: ChatResponder,
) -> Result<Response, ApiError> {
    while let Some(event) = events.next().await {
        if let Some(message) = responder.on_event(&event)? {
            return Ok(Json(message).into_response());
        }
    }
    Err(ApiError::GenerationAborted)
}

fn stream_response(mut events: EventStream, mut responder: ChatResponder) -> Response {
    let stream = async_stream::stream! {
        while let Some(event) = events.next().await {
            match responder.on_event(&event) {
                Ok(Some(message)) => yield Ok::<_, Infallible>(sse_event(&message)),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Streaming response failed: {}", e);
                    yield Ok(sse_event(&responder.error_chunk(&e)));
                    break;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn sse_event<T: Serialize>(message: &T) -> Event {
    Event::default().json_data(message).unwrap_or_else(|e| {
        tracing::error!("Failed to encode stream message: {}", e);
        Event::default().comment("encoding failed")
    })
}
