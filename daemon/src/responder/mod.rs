//! Response assembly for the OpenAI chat surface.
//!
//! A [`ChatResponder`] consumes the generation events of one request and
//! produces `chat.completion` / `chat.completion.chunk` objects. The variant is
//! fixed at construction: streaming or single-shot delivery, plain text or
//! tool-call content.

mod tools;
mod wire;

use kiln_runtime_api::{SchemaParser, StopReason};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::ApiError;
use crate::pipeline::{ChunkEvent, EndEvent, GenerationEvent};

pub use tools::{FunctionCall, FunctionSpec, ToolCursor, ToolSet};
pub use wire::{
    AssistantMessage, ChatChoice, ChatChoiceDelta, ChatCompletionChunk, ChatCompletionResponse,
    ChatObject, Delta, FunctionCallPayload, ToolCallPayload, Usage,
};

/// Map an engine stop reason onto a protocol finish reason.
pub fn finish_reason(reason: &StopReason) -> String {
    match reason {
        StopReason::End => "stop".to_string(),
        StopReason::MaxTokens => "length".to_string(),
        // Not an OpenAI value; clients get to see what went wrong.
        other => format!("error: {other}"),
    }
}

/// Id and timestamp shared by every object of one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectIdentity {
    id: String,
    created: i64,
}

impl ObjectIdentity {
    pub fn new() -> Self {
        static SEQUENCE: AtomicU32 = AtomicU32::new(0);
        let now = chrono::Utc::now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xffff;
        Self {
            id: format!("{nanos:x}{seq:04x}"),
            created: now.timestamp(),
        }
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn completion_id(&self) -> String {
        format!("chatcmpl-{}", self.id)
    }

    pub fn call_id(&self, index: usize) -> String {
        format!("call_{}_{}", self.id, index)
    }
}

impl Default for ObjectIdentity {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request assembly state.
#[derive(Debug, Default)]
pub struct ResponderState {
    pub accumulated_text: String,
    pub identity: ObjectIdentity,
    pub tool: ToolCursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Streaming,
    Single,
}

pub enum ContentMode {
    /// Plain text. With a parser, streamed chunks also carry a `values` preview
    /// of the JSON paths each chunk contributed to.
    Text {
        values: Option<Box<dyn SchemaParser>>,
    },
    /// Tool calls. Streaming needs a parser built with [`ToolSet::hooks`].
    Tools {
        tools: ToolSet,
        parser: Option<Box<dyn SchemaParser>>,
    },
}

pub struct ChatResponder {
    model: String,
    delivery: Delivery,
    content: ContentMode,
    state: ResponderState,
}

/// Argument text of one call within a chunk.
#[derive(Debug, PartialEq)]
struct ArgumentSlice {
    index: usize,
    name: String,
    text: String,
}

impl ChatResponder {
    pub fn new(model: impl Into<String>, delivery: Delivery, content: ContentMode) -> Self {
        Self {
            model: model.into(),
            delivery,
            content,
            state: ResponderState::default(),
        }
    }

    pub fn state(&self) -> &ResponderState {
        &self.state
    }

    /// Feed one event. Returns the wire object it produced, if any.
    pub fn on_event(&mut self, event: &GenerationEvent) -> Result<Option<ChatObject>, ApiError> {
        match event {
            GenerationEvent::Chunk(chunk) => Ok(self.on_chunk(chunk)?.map(ChatObject::Chunk)),
            GenerationEvent::End(end) => self.on_end(end).map(Some),
            GenerationEvent::Load | GenerationEvent::Unload => Ok(None),
        }
    }

    /// Terminal chunk for a failure that interrupted a stream.
    pub fn error_chunk(&self, err: &ApiError) -> ChatCompletionChunk {
        self.chunk_message(Delta::default(), Some(format!("error: {err}")), None)
    }

    fn on_chunk(&mut self, chunk: &ChunkEvent) -> Result<Option<ChatCompletionChunk>, ApiError> {
        self.state.accumulated_text.push_str(&chunk.text);
        if self.delivery == Delivery::Single {
            return Ok(None);
        }

        let usage = Usage::new(chunk.prompt_tokens, chunk.completion_tokens);
        let delta = match &mut self.content {
            ContentMode::Text { values } => Delta {
                values: preview_values(values, &chunk.text),
                ..Delta::text(chunk.text.as_str())
            },
            ContentMode::Tools { tools, parser } => {
                let parser = parser.as_deref_mut().ok_or_else(|| {
                    ApiError::Internal("streaming tool calls need a schema parser".to_string())
                })?;
                let slices = advance_tool_cursor(parser, &mut self.state.tool, &chunk.text)?;
                if slices.is_empty() {
                    return Ok(None);
                }
                tool_delta(tools.is_legacy(), &self.state.identity, slices)
            }
        };

        Ok(Some(self.chunk_message(delta, None, Some(usage))))
    }

    fn on_end(&mut self, end: &EndEvent) -> Result<ChatObject, ApiError> {
        let usage = Usage::new(end.prompt_token_count, end.completion_token_count);
        let finish = self.finish_reason(&end.done_reason);

        let message = match (&self.content, self.delivery) {
            (ContentMode::Text { .. }, Delivery::Streaming) => {
                let chunk = self.chunk_message(Delta::text(""), Some(finish), Some(usage));
                return Ok(ChatObject::Chunk(chunk));
            }
            (ContentMode::Tools { .. }, Delivery::Streaming) => {
                let chunk = self.chunk_message(Delta::default(), Some(finish), Some(usage));
                return Ok(ChatObject::Chunk(chunk));
            }
            (ContentMode::Tools { tools, .. }, Delivery::Single)
                if end.done_reason == StopReason::End =>
            {
                let calls = tools.parse_calls(&self.state.accumulated_text)?;
                tool_message(tools.is_legacy(), &self.state.identity, calls)?
            }
            (_, Delivery::Single) => AssistantMessage::text(self.state.accumulated_text.as_str()),
        };

        Ok(ChatObject::Completion(ChatCompletionResponse {
            id: self.state.identity.completion_id(),
            object: "chat.completion",
            created: self.state.identity.created(),
            model: self.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message,
                finish_reason: finish,
            }],
            usage,
        }))
    }

    fn finish_reason(&self, reason: &StopReason) -> String {
        match (&self.content, reason) {
            (ContentMode::Tools { tools, .. }, StopReason::End) if tools.is_legacy() => {
                "function_call".to_string()
            }
            (ContentMode::Tools { .. }, StopReason::End) => "tool_calls".to_string(),
            _ => finish_reason(reason),
        }
    }

    fn chunk_message(
        &self,
        delta: Delta,
        finish: Option<String>,
        usage: Option<Usage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.state.identity.completion_id(),
            object: "chat.completion.chunk",
            created: self.state.identity.created(),
            model: self.model.clone(),
            choices: vec![ChatChoiceDelta {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            usage,
        }
    }
}

/// Characters of `text` per JSON path they fell into. Stops previewing for
/// the rest of the response once the text stops parsing.
fn preview_values(
    parser: &mut Option<Box<dyn SchemaParser>>,
    text: &str,
) -> Option<BTreeMap<String, String>> {
    let active = parser.as_deref_mut()?;
    let mut values: BTreeMap<String, String> = BTreeMap::new();
    let mut failed = None;
    for c in text.chars() {
        if let Err(e) = active.advance_char(c) {
            failed = Some(e);
            break;
        }
        for path in active.current_value_paths() {
            values.entry(path).or_default().push(c);
        }
    }
    if let Some(e) = failed {
        tracing::warn!("Output no longer matches the response schema, dropping previews: {}", e);
        *parser = None;
    }
    Some(values)
}

/// Feed `text` through the tool parser, collecting the characters that belong
/// to call arguments. An argument's opening and closing characters count as
/// part of it.
fn advance_tool_cursor(
    parser: &mut dyn SchemaParser,
    cursor: &mut ToolCursor,
    text: &str,
) -> Result<Vec<ArgumentSlice>, ApiError> {
    let mut slices: Vec<ArgumentSlice> = Vec::new();
    for c in text.chars() {
        let before = cursor.in_arguments;
        let events = parser
            .advance_char(c)
            .map_err(|e| ApiError::StructuralMismatch(e.to_string()))?;
        for event in &events {
            cursor.apply(event);
        }
        if !(before || cursor.in_arguments) {
            continue;
        }

        let (Some(index), Some(name)) = (cursor.index, cursor.name.as_ref()) else {
            return Err(ApiError::StructuralMismatch(
                "arguments started before a function name".to_string(),
            ));
        };
        match slices.last_mut() {
            Some(slice) if slice.index == index => slice.text.push(c),
            _ => slices.push(ArgumentSlice {
                index,
                name: name.clone(),
                text: c.to_string(),
            }),
        }
    }
    Ok(slices)
}

fn tool_delta(legacy: bool, identity: &ObjectIdentity, slices: Vec<ArgumentSlice>) -> Delta {
    if legacy {
        let name = slices.first().map(|s| s.name.clone()).unwrap_or_default();
        let arguments: String = slices.into_iter().map(|s| s.text).collect();
        return Delta {
            function_call: Some(FunctionCallPayload { name, arguments }),
            ..Delta::default()
        };
    }

    // The name is repeated on every delta, not only the first one of a call.
    let calls = slices
        .into_iter()
        .map(|slice| ToolCallPayload {
            index: Some(slice.index),
            id: identity.call_id(slice.index),
            kind: "function",
            function: FunctionCallPayload {
                name: slice.name,
                arguments: slice.text,
            },
        })
        .collect();
    Delta {
        tool_calls: Some(calls),
        ..Delta::default()
    }
}

fn tool_message(
    legacy: bool,
    identity: &ObjectIdentity,
    calls: Vec<FunctionCall>,
) -> Result<AssistantMessage, ApiError> {
    let mut message = AssistantMessage {
        role: "assistant",
        content: None,
        function_call: None,
        tool_calls: None,
    };
    if legacy {
        let mut calls = calls.into_iter();
        let (Some(call), None) = (calls.next(), calls.next()) else {
            return Err(ApiError::StructuralMismatch(
                "expected exactly one function call".to_string(),
            ));
        };
        message.function_call = Some(FunctionCallPayload {
            name: call.name,
            arguments: call.arguments.to_string(),
        });
        return Ok(message);
    }

    let tool_calls = calls
        .into_iter()
        .enumerate()
        .map(|(i, call)| ToolCallPayload {
            index: None,
            id: identity.call_id(i),
            kind: "function",
            function: FunctionCallPayload {
                name: call.name,
                arguments: call.arguments.to_string(),
            },
        })
        .collect();
    message.tool_calls = Some(tool_calls);
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Durations;
    use kiln_runtime_api::{HookSpec, JsonPathParser};
    use serde_json::{json, Value};

    fn events(chunks: &[&str], reason: StopReason) -> Vec<GenerationEvent> {
        let mut out: Vec<GenerationEvent> = chunks
            .iter()
            .enumerate()
            .map(|(i, text)| {
                GenerationEvent::Chunk(ChunkEvent {
                    text: text.to_string(),
                    prompt_tokens: 4,
                    completion_tokens: i + 1,
                })
            })
            .collect();
        out.push(GenerationEvent::End(EndEvent {
            done_reason: reason,
            full_response: chunks.concat(),
            prompt_token_count: 4,
            completion_token_count: chunks.len(),
            durations: Durations::default(),
        }));
        out
    }

    fn split(text: &str, size: usize) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars.chunks(size).map(|c| c.iter().collect()).collect()
    }

    fn run(responder: &mut ChatResponder, events: &[GenerationEvent]) -> Vec<Value> {
        events
            .iter()
            .filter_map(|e| responder.on_event(e).unwrap())
            .map(|m| serde_json::to_value(m).unwrap())
            .collect()
    }

    fn parser(schema: &Value, hooks: Vec<HookSpec>) -> Box<dyn SchemaParser> {
        Box::new(JsonPathParser::for_schema(schema, hooks).unwrap())
    }

    fn function(name: &str) -> FunctionSpec {
        FunctionSpec {
            name: name.to_string(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        }
    }

    fn tool_responder(names: &[&str], legacy: bool, delivery: Delivery) -> ChatResponder {
        let tools = ToolSet::new(names.iter().map(|n| function(n)).collect(), legacy).unwrap();
        let parser = match delivery {
            Delivery::Streaming => Some(parser(&tools.schema(), tools.hooks())),
            Delivery::Single => None,
        };
        ChatResponder::new("m", delivery, ContentMode::Tools { tools, parser })
    }

    fn text_responder(delivery: Delivery) -> ChatResponder {
        ChatResponder::new("m", delivery, ContentMode::Text { values: None })
    }

    #[test]
    fn translates_finish_reasons() {
        assert_eq!(finish_reason(&StopReason::End), "stop");
        assert_eq!(finish_reason(&StopReason::MaxTokens), "length");
        assert_eq!(
            finish_reason(&StopReason::Error("boom".into())),
            "error: boom"
        );
        assert_eq!(finish_reason(&StopReason::Cancelled), "error: cancelled");
    }

    #[test]
    fn tool_mode_overrides_only_successful_ends() {
        let modern = tool_responder(&["a"], false, Delivery::Streaming);
        assert_eq!(modern.finish_reason(&StopReason::End), "tool_calls");
        assert_eq!(modern.finish_reason(&StopReason::MaxTokens), "length");

        let legacy = tool_responder(&["a"], true, Delivery::Streaming);
        assert_eq!(legacy.finish_reason(&StopReason::End), "function_call");
    }

    #[test]
    fn single_text_response() {
        let mut responder = text_responder(Delivery::Single);
        let out = run(&mut responder, &events(&["Hel", "lo"], StopReason::End));

        assert_eq!(out.len(), 1);
        let msg = &out[0];
        assert_eq!(msg["object"], "chat.completion");
        assert_eq!(msg["choices"][0]["message"]["content"], "Hello");
        assert_eq!(msg["choices"][0]["finish_reason"], "stop");
        assert_eq!(msg["usage"]["total_tokens"], 6);
        assert!(msg["id"].as_str().unwrap().starts_with("chatcmpl-"));
    }

    #[test]
    fn streamed_deltas_match_single_content() {
        let evs = events(&["The ", "quick", " fox"], StopReason::MaxTokens);

        let mut single = text_responder(Delivery::Single);
        let full = run(&mut single, &evs);

        let mut streaming = text_responder(Delivery::Streaming);
        let chunks = run(&mut streaming, &evs);
        let streamed: String = chunks
            .iter()
            .filter_map(|m| m["choices"][0]["delta"]["content"].as_str())
            .collect();

        assert_eq!(streamed, full[0]["choices"][0]["message"]["content"]);
        let last = chunks.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "length");
        assert!(chunks.iter().all(|m| m["object"] == "chat.completion.chunk"));
    }

    #[test]
    fn usage_rides_on_every_streamed_message() {
        let mut responder = text_responder(Delivery::Streaming);
        let out = run(&mut responder, &events(&["a", "b"], StopReason::End));

        let completions: Vec<u64> = out
            .iter()
            .map(|m| m["usage"]["completion_tokens"].as_u64().unwrap())
            .collect();
        assert_eq!(completions, vec![1, 2, 2]);
        assert!(out.iter().all(|m| m["usage"]["prompt_tokens"] == 4));
    }

    #[test]
    fn json_schema_values_preview() {
        let schema = json!({"type": "object", "properties": {"foo": {"type": "boolean"}}});
        let mut responder = ChatResponder::new(
            "m",
            Delivery::Streaming,
            ContentMode::Text {
                values: Some(parser(&schema, Vec::new())),
            },
        );
        let out = run(&mut responder, &events(&[r#"{"foo""#, r#": true}"#], StopReason::End));

        assert_eq!(out[0]["choices"][0]["delta"]["values"]["$"], r#"{"foo""#);
        assert_eq!(out[1]["choices"][0]["delta"]["values"]["$.foo"], "true");

        let text = &responder.state().accumulated_text;
        let parsed: Value = serde_json::from_str(text).unwrap();
        assert_eq!(parsed["foo"], true);
    }

    #[test]
    fn preview_stops_quietly_on_unparseable_text() {
        let mut responder = ChatResponder::new(
            "m",
            Delivery::Streaming,
            ContentMode::Text {
                values: Some(parser(&json!({"type": "object"}), Vec::new())),
            },
        );
        let out = run(&mut responder, &events(&["oops", " more"], StopReason::End));

        assert_eq!(out[0]["choices"][0]["delta"]["content"], "oops");
        assert!(out[1]["choices"][0]["delta"].get("values").is_none());
        assert_eq!(responder.state().accumulated_text, "oops more");
    }

    #[test]
    fn two_streamed_calls_keep_their_indices() {
        let text = r#"[{"name":"a","arguments":{"x":1}},{"name":"b","arguments":{"y":2}}]"#;
        let chunks = split(text, 3);
        let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();

        let mut responder = tool_responder(&["a", "b"], false, Delivery::Streaming);
        let out = run(&mut responder, &events(&chunk_refs, StopReason::End));

        let mut seen: Vec<(u64, String, String)> = Vec::new();
        for msg in &out {
            let Some(calls) = msg["choices"][0]["delta"]["tool_calls"].as_array() else {
                continue;
            };
            for call in calls {
                seen.push((
                    call["index"].as_u64().unwrap(),
                    call["function"]["name"].as_str().unwrap().to_string(),
                    call["function"]["arguments"].as_str().unwrap().to_string(),
                ));
            }
        }

        let indices: Vec<u64> = seen.iter().map(|(i, _, _)| *i).collect();
        let first_b = indices.iter().position(|i| *i == 1).unwrap();
        assert!(indices[..first_b].iter().all(|i| *i == 0));
        assert!(indices[first_b..].iter().all(|i| *i == 1));

        let args_for = |index: u64| -> String {
            seen.iter()
                .filter(|(i, _, _)| *i == index)
                .map(|(_, _, a)| a.as_str())
                .collect()
        };
        assert_eq!(args_for(0), r#"{"x":1}"#);
        assert_eq!(args_for(1), r#"{"y":2}"#);
        assert!(seen.iter().all(|(i, name, _)| name == if *i == 0 { "a" } else { "b" }));

        let last = out.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(last["choices"][0]["delta"], json!({}));
    }

    #[test]
    fn calls_sharing_a_chunk_get_separate_entries() {
        let text = r#"[{"name":"a","arguments":{}},{"name":"b","arguments":{}}]"#;
        let mut responder = tool_responder(&["a", "b"], false, Delivery::Streaming);
        let out = run(&mut responder, &events(&[text], StopReason::End));

        let calls = out[0]["choices"][0]["delta"]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["index"], 0);
        assert_eq!(calls[1]["index"], 1);
        assert_eq!(calls[1]["function"]["arguments"], "{}");
    }

    #[test]
    fn chunks_without_arguments_are_silent() {
        let mut responder = tool_responder(&["a"], false, Delivery::Streaming);
        let out = run(
            &mut responder,
            &events(&[r#"{"name":"#, r#""a","#, r#""arguments":{"q":"hi"}}"#], StopReason::End),
        );

        // two silent chunks, one argument delta, one terminal message
        assert_eq!(out.len(), 2);
        let call = &out[0]["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["function"]["arguments"], r#"{"q":"hi"}"#);
        assert_eq!(call["function"]["name"], "a");
        assert!(call["id"].as_str().unwrap().ends_with("_0"));
    }

    #[test]
    fn legacy_streaming_uses_function_call() {
        let mut responder = tool_responder(&["a", "b"], true, Delivery::Streaming);
        let out = run(
            &mut responder,
            &events(&[r#"{"name":"b","argu"#, r#"ments":{"y":2}}"#], StopReason::End),
        );

        assert_eq!(
            out[0]["choices"][0]["delta"],
            json!({"function_call": {"name": "b", "arguments": "{\"y\":2}"}})
        );
        assert_eq!(out[1]["choices"][0]["finish_reason"], "function_call");
    }

    #[test]
    fn streamed_and_single_tool_calls_agree() {
        let text = r#"[{"name": "a", "arguments": {"x": 1}}]"#;
        let chunks = split(text, 4);
        let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let evs = events(&chunk_refs, StopReason::End);

        let mut streaming = tool_responder(&["a", "b"], false, Delivery::Streaming);
        let streamed: String = run(&mut streaming, &evs)
            .iter()
            .filter_map(|m| m["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"].as_str().map(String::from))
            .collect();

        let mut single = tool_responder(&["a", "b"], false, Delivery::Single);
        let out = run(&mut single, &evs);
        let call = &out[0]["choices"][0]["message"]["tool_calls"][0];

        let single_args: Value =
            serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
        let streamed_args: Value = serde_json::from_str(&streamed).unwrap();
        assert_eq!(single_args, streamed_args);
        assert_eq!(call["id"], json!(single.state().identity.call_id(0)));
    }

    #[test]
    fn single_shot_wraps_a_bare_object() {
        let mut responder = tool_responder(&["a"], false, Delivery::Single);
        let out = run(
            &mut responder,
            &events(&[r#"{"name": "a", "arguments": {"x": 1}}"#], StopReason::End),
        );

        let message = &out[0]["choices"][0]["message"];
        assert_eq!(message["tool_calls"].as_array().unwrap().len(), 1);
        assert_eq!(message["tool_calls"][0]["function"]["arguments"], r#"{"x":1}"#);
        assert_eq!(out[0]["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn single_shot_legacy_call() {
        let mut responder = tool_responder(&["a", "b"], true, Delivery::Single);
        let out = run(
            &mut responder,
            &events(&[r#"{"name": "b", "arguments": {}}"#], StopReason::End),
        );

        let message = &out[0]["choices"][0]["message"];
        assert_eq!(message["function_call"]["name"], "b");
        assert_eq!(message["function_call"]["arguments"], "{}");
        assert_eq!(out[0]["choices"][0]["finish_reason"], "function_call");
    }

    #[test]
    fn invalid_tool_output_is_a_structural_mismatch() {
        let mut single = tool_responder(&["a"], false, Delivery::Single);
        let evs = events(&["I think you should call a"], StopReason::End);
        assert!(single.on_event(&evs[0]).unwrap().is_none());
        assert!(matches!(
            single.on_event(&evs[1]),
            Err(ApiError::StructuralMismatch(_))
        ));

        let mut streaming = tool_responder(&["a"], false, Delivery::Streaming);
        assert!(matches!(
            streaming.on_event(&evs[0]),
            Err(ApiError::StructuralMismatch(_))
        ));
    }

    #[test]
    fn truncated_tool_output_reports_length() {
        let mut single = tool_responder(&["a"], false, Delivery::Single);
        let out = run(&mut single, &events(&[r#"{"name": "a", "argu"#], StopReason::MaxTokens));

        assert_eq!(out[0]["choices"][0]["finish_reason"], "length");
        assert_eq!(out[0]["choices"][0]["message"]["content"], r#"{"name": "a", "argu"#);
    }

    #[test]
    fn error_chunk_carries_the_reason() {
        let responder = text_responder(Delivery::Streaming);
        let chunk = responder.error_chunk(&ApiError::Internal("engine crashed".into()));
        let chunk = serde_json::to_value(chunk).unwrap();
        assert_eq!(chunk["choices"][0]["finish_reason"], "error: engine crashed");
        assert_eq!(chunk["choices"][0]["delta"], json!({}));
        assert!(chunk.get("usage").is_none());
    }
}
