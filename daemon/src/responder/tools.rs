//! Tool-call schemas, prompts and the streaming tool cursor.

use kiln_runtime_api::{HookKind, HookSpec, ParseEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ApiError;

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

fn empty_parameters() -> Value {
    json!({})
}

impl FunctionSpec {
    /// `{"name": <const>, "arguments": <parameters>}`
    fn invocation_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "const", "const": self.name},
                "arguments": self.parameters,
            },
            "required": ["name", "arguments"],
        })
    }
}

/// The functions offered to one request and how their calls are reported.
#[derive(Debug, Clone)]
pub struct ToolSet {
    functions: Vec<FunctionSpec>,
    legacy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    /// A single function: one object
    One,
    /// Legacy `functions`: one object, any of the functions
    SelectOne,
    /// Modern `tools`: an array of calls
    Many,
}

impl ToolSet {
    pub fn new(functions: Vec<FunctionSpec>, legacy: bool) -> Result<Self, ApiError> {
        if functions.is_empty() {
            return Err(ApiError::InvalidConfiguration(
                "no functions to call".to_string(),
            ));
        }
        Ok(Self { functions, legacy })
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub fn functions(&self) -> &[FunctionSpec] {
        &self.functions
    }

    fn shape(&self) -> Shape {
        match (self.functions.len(), self.legacy) {
            (1, _) => Shape::One,
            (_, true) => Shape::SelectOne,
            (_, false) => Shape::Many,
        }
    }

    /// Schema the model output is constrained to.
    pub fn schema(&self) -> Value {
        let schemas: Vec<Value> = self
            .functions
            .iter()
            .map(FunctionSpec::invocation_schema)
            .collect();
        match self.shape() {
            Shape::One => schemas.into_iter().next().unwrap_or_else(|| json!({})),
            Shape::SelectOne => json!({ "oneOf": schemas }),
            Shape::Many => json!({ "type": "array", "items": { "anyOf": schemas } }),
        }
    }

    /// Parser hooks tracking the `name` and `arguments` of each call.
    pub fn hooks(&self) -> Vec<HookSpec> {
        let root = match self.shape() {
            Shape::One | Shape::SelectOne => "$",
            Shape::Many => "$[*]",
        };
        vec![
            HookSpec::value_end(format!("{root}.name")),
            HookSpec::value_start(format!("{root}.arguments")),
            HookSpec::value_end(format!("{root}.arguments")),
        ]
    }

    /// System message steering the model towards the invocation schema.
    pub fn prompt(&self) -> String {
        let compact = |f: &FunctionSpec| f.invocation_schema().to_string();
        match self.shape() {
            Shape::One => {
                let f = &self.functions[0];
                format!(
                    "\nYou are a helpful assistant with access to a tool that you must invoke to answer the user's request.\n\
                     The tool is:\n\
                     Tool {}: {}\n\
                     Invocation schema: {}\n\
                     Your answer is a JSON object according to the invocation schema in order to answer the user request below.\n",
                    f.name,
                    f.description,
                    compact(f)
                )
            }
            Shape::SelectOne => {
                let listing: Vec<String> = self
                    .functions
                    .iter()
                    .map(|f| {
                        format!(
                            "\nFunction {}: {}\nTool schema: {}\n",
                            f.name,
                            f.description,
                            compact(f)
                        )
                    })
                    .collect();
                format!(
                    "\nYou are a helpful assistant with access to tools that you must invoke to answer the user's request.\n\
                     The following tools are available:\n{}\n\
                     Your answer is a JSON object according to the invocation schema of the most appropriate tool to use\n\
                     to answer the user request below.\n",
                    listing.join("\n")
                )
            }
            Shape::Many => {
                let listing: Vec<String> = self
                    .functions
                    .iter()
                    .map(|f| {
                        format!(
                            "\nTool {}: {}\nInvocation schema: {}\n",
                            f.name,
                            f.description,
                            compact(f)
                        )
                    })
                    .collect();
                format!(
                    "\nYou are a helpful assistant with access to tools that you must invoke to answer the user's request.\n\
                     The following tools are available:\n{}\n\
                     Your answer is a JSON array with one or more tool invocations according to the appropriate schema(s)\n\
                     in order to answer the user request below.\n",
                    listing.join("\n")
                )
            }
        }
    }

    /// Parse the complete output into calls.
    pub fn parse_calls(&self, text: &str) -> Result<Vec<FunctionCall>, ApiError> {
        let parsed: Value = serde_json::from_str(text.trim()).map_err(|e| {
            ApiError::StructuralMismatch(format!("tool call output is not valid JSON: {e}"))
        })?;

        let items = match (self.shape(), parsed) {
            (Shape::Many, Value::Array(items)) => items,
            // A bare object still counts as one call.
            (_, Value::Object(map)) => vec![Value::Object(map)],
            (_, other) => {
                return Err(ApiError::StructuralMismatch(format!(
                    "expected a tool call object, got {other}"
                )))
            }
        };
        if items.is_empty() {
            return Err(ApiError::StructuralMismatch(
                "tool call array is empty".to_string(),
            ));
        }

        items.into_iter().map(|item| self.call_from(item)).collect()
    }

    fn call_from(&self, item: Value) -> Result<FunctionCall, ApiError> {
        let mut call = match item {
            Value::Object(call) => call,
            other => {
                return Err(ApiError::StructuralMismatch(format!(
                    "expected a tool call object, got {other}"
                )))
            }
        };
        let name = match call.remove("name") {
            Some(Value::String(name)) => name,
            _ => {
                return Err(ApiError::StructuralMismatch(
                    "tool call has no function name".to_string(),
                ))
            }
        };
        if !self.functions.iter().any(|f| f.name == name) {
            return Err(ApiError::StructuralMismatch(format!(
                "model called unknown function '{name}'"
            )));
        }
        let arguments = call.remove("arguments").ok_or_else(|| {
            ApiError::StructuralMismatch(format!("call to '{name}' has no arguments"))
        })?;
        Ok(FunctionCall { name, arguments })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
}

/// Where the streamed output currently is relative to the calls.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ToolCursor {
    /// Index of the call whose name was seen last
    pub index: Option<usize>,
    pub name: Option<String>,
    pub in_arguments: bool,
}

impl ToolCursor {
    pub fn apply(&mut self, event: &ParseEvent) {
        match (event.kind, event.property.as_deref()) {
            (HookKind::ValueEnd, Some("name")) => {
                self.index = Some(self.index.map_or(0, |i| i + 1));
                self.name = event
                    .value
                    .as_ref()
                    .and_then(Value::as_str)
                    .map(String::from);
            }
            (HookKind::ValueStart, Some("arguments")) => self.in_arguments = true,
            (HookKind::ValueEnd, Some("arguments")) => self.in_arguments = false,
            _ => {}
        }
    }
}
