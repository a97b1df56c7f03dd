//! Incremental, character-at-a-time JSON parsing.
//!
//! Value paths are rendered JSONPath style: `$` is the document, `$.foo` a
//! member, `$[2]` an array element. Hook paths use `[*]` in place of array
//! indices so one hook covers every element (`$[*].arguments`).

use serde_json::Value;
use std::fmt::Write as _;

use crate::{ParseError, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    ValueStart,
    ValueEnd,
}

/// A structural event the caller wants reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub path: String,
    pub kind: HookKind,
}

impl HookSpec {
    pub fn value_start(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: HookKind::ValueStart,
        }
    }

    pub fn value_end(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: HookKind::ValueEnd,
        }
    }
}

/// A hooked value started or finished on the character just consumed.
///
/// `ValueStart` fires on the value's first character and `ValueEnd` on its
/// last one, except for numbers, which end on the delimiter that follows them.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseEvent {
    pub kind: HookKind,
    /// Hook path that matched (wildcard form)
    pub path: String,
    /// Member name, when the value sits inside an object
    pub property: Option<String>,
    /// Completed value, on `ValueEnd`
    pub value: Option<Value>,
}

pub trait SchemaParser: Send {
    fn advance_char(&mut self, c: char) -> Result<Vec<ParseEvent>, ParseError>;

    /// Paths of every value containing the last consumed character,
    /// outermost first.
    fn current_value_paths(&self) -> Vec<String>;
}

#[derive(Debug, Clone)]
enum Segment {
    Key(String),
    Index(usize),
}

fn render(path: &[Segment], wildcard: bool) -> String {
    let mut out = String::from("$");
    for segment in path {
        match segment {
            Segment::Key(key) => {
                out.push('.');
                out.push_str(key);
            }
            Segment::Index(_) if wildcard => out.push_str("[*]"),
            Segment::Index(i) => {
                let _ = write!(out, "[{i}]");
            }
        }
    }
    out
}

#[derive(Debug)]
enum ObjectState {
    KeyOrClose,
    Key,
    InKey(KeyText),
    Colon { key: String },
    Value { key: String },
    CommaOrClose,
}

#[derive(Debug, Clone, Copy, Default)]
enum KeyEscape {
    #[default]
    None,
    Backslash,
    Unicode { code: u32, digits: u8 },
}

/// An object key being read. Escapes are decoded, so paths name the key as
/// a JSON parser would see it.
#[derive(Debug, Default)]
struct KeyText {
    text: String,
    escape: KeyEscape,
    high_surrogate: Option<u32>,
}

impl KeyText {
    /// Returns true once the closing quote has been read.
    fn push(&mut self, c: char) -> Result<bool, ParseError> {
        match self.escape {
            KeyEscape::None if c == '\\' => self.escape = KeyEscape::Backslash,
            KeyEscape::None => {
                self.expect_no_surrogate(c)?;
                if c == '"' {
                    return Ok(true);
                }
                self.text.push(c);
            }
            KeyEscape::Backslash if c == 'u' => {
                self.escape = KeyEscape::Unicode { code: 0, digits: 0 };
            }
            KeyEscape::Backslash => {
                self.expect_no_surrogate(c)?;
                self.text.push(unescape(c));
                self.escape = KeyEscape::None;
            }
            KeyEscape::Unicode { code, digits } => {
                let digit = c.to_digit(16).ok_or(ParseError::Unexpected {
                    ch: c,
                    expected: "a hex digit",
                })?;
                let code = code * 16 + digit;
                if digits < 3 {
                    self.escape = KeyEscape::Unicode {
                        code,
                        digits: digits + 1,
                    };
                } else {
                    self.escape = KeyEscape::None;
                    self.push_code(code, c)?;
                }
            }
        }
        Ok(false)
    }

    fn push_code(&mut self, code: u32, c: char) -> Result<(), ParseError> {
        let decoded = match (self.high_surrogate.take(), code) {
            (None, 0xD800..=0xDBFF) => {
                self.high_surrogate = Some(code);
                return Ok(());
            }
            (Some(high), 0xDC00..=0xDFFF) => {
                char::from_u32(0x10000 + ((high - 0xD800) << 10) + (code - 0xDC00))
            }
            (Some(_), _) => None,
            (None, _) => char::from_u32(code),
        };
        let decoded = decoded.ok_or(ParseError::Unexpected {
            ch: c,
            expected: "a valid unicode escape",
        })?;
        self.text.push(decoded);
        Ok(())
    }

    /// A high surrogate must be followed directly by its low half.
    fn expect_no_surrogate(&self, c: char) -> Result<(), ParseError> {
        match self.high_surrogate {
            Some(_) => Err(ParseError::Unexpected {
                ch: c,
                expected: "a low surrogate escape",
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
enum ArrayState {
    ValueOrClose,
    Value,
    CommaOrClose,
}

#[derive(Debug)]
enum FrameKind {
    Object(ObjectState),
    Array { state: ArrayState, len: usize },
    Str { escaped: bool },
    Number,
    Literal { word: &'static str, matched: usize },
}

#[derive(Debug)]
struct Frame {
    path: Vec<Segment>,
    kind: FrameKind,
    /// Raw text of the value, kept only when a `ValueEnd` hook wants it
    capture: Option<String>,
}

enum Step {
    Record,
    Close,
    Open(Vec<Segment>),
}

/// Structural JSON parser enforcing the schema's top-level `type`.
///
/// It does not constrain anything below the root; that is the job of the
/// engine's decoder. What it adds is a precise view of where in the document
/// each character falls.
#[derive(Debug)]
pub struct JsonPathParser {
    stack: Vec<Frame>,
    root_type: Option<String>,
    finished: bool,
    start_hooks: Vec<String>,
    end_hooks: Vec<String>,
    current: Vec<String>,
}

impl JsonPathParser {
    pub fn for_schema(schema: &Value, hooks: Vec<HookSpec>) -> Result<Self, RuntimeError> {
        let root_type = match schema {
            Value::Object(map) => match map.get("type") {
                None => None,
                Some(Value::String(t)) => Some(t.clone()),
                Some(other) => {
                    return Err(RuntimeError::InvalidConfiguration(format!(
                        "schema 'type' must be a string, got {other}"
                    )))
                }
            },
            Value::Bool(_) => None,
            other => {
                return Err(RuntimeError::InvalidConfiguration(format!(
                    "schema must be a JSON object, got {other}"
                )))
            }
        };

        let (start_hooks, end_hooks) = hooks.into_iter().fold(
            (Vec::new(), Vec::new()),
            |(mut starts, mut ends), hook| {
                match hook.kind {
                    HookKind::ValueStart => starts.push(hook.path),
                    HookKind::ValueEnd => ends.push(hook.path),
                }
                (starts, ends)
            },
        );

        Ok(Self {
            stack: Vec::new(),
            root_type,
            finished: false,
            start_hooks,
            end_hooks,
            current: Vec::new(),
        })
    }

    /// Whether a complete top-level value has been consumed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn step(&mut self, c: char, events: &mut Vec<ParseEvent>) -> Result<(), ParseError> {
        // Scalars in progress consume characters before any container does.
        let scalar = match self.stack.last_mut().map(|f| &mut f.kind) {
            Some(FrameKind::Str { escaped }) => {
                let close = !*escaped && c == '"';
                *escaped = !*escaped && c == '\\';
                Some(close)
            }
            Some(FrameKind::Number) if is_number_char(c) => Some(false),
            Some(FrameKind::Number) => None,
            Some(FrameKind::Literal { word, matched }) => {
                if !c.is_ascii() || word.as_bytes().get(*matched) != Some(&(c as u8)) {
                    return Err(ParseError::Unexpected {
                        ch: c,
                        expected: "a literal",
                    });
                }
                *matched += 1;
                Some(*matched == word.len())
            }
            _ => None,
        };

        match scalar {
            Some(close) => {
                self.record(c);
                if close {
                    self.close_value(events);
                }
                return Ok(());
            }
            None => {
                if matches!(self.stack.last().map(|f| &f.kind), Some(FrameKind::Number)) {
                    // The delimiter belongs to the enclosing value.
                    self.close_value(events);
                }
            }
        }

        if self.finished {
            return if c.is_whitespace() {
                Ok(())
            } else {
                Err(ParseError::Trailing(c))
            };
        }

        let Some(frame) = self.stack.last_mut() else {
            if c.is_whitespace() {
                return Ok(());
            }
            self.check_root_type(c)?;
            return self.open_value(c, Vec::new(), events);
        };

        let step = match &mut frame.kind {
            FrameKind::Object(state) => match state {
                _ if c.is_whitespace() && !matches!(state, ObjectState::InKey(_)) => {
                    Step::Record
                }
                ObjectState::KeyOrClose | ObjectState::Key if c == '"' => {
                    *state = ObjectState::InKey(KeyText::default());
                    Step::Record
                }
                ObjectState::KeyOrClose if c == '}' => Step::Close,
                ObjectState::KeyOrClose | ObjectState::Key => {
                    return Err(ParseError::Unexpected {
                        ch: c,
                        expected: "an object key",
                    })
                }
                ObjectState::InKey(key) => {
                    if key.push(c)? {
                        let key = std::mem::take(&mut key.text);
                        *state = ObjectState::Colon { key };
                    }
                    Step::Record
                }
                ObjectState::Colon { key } if c == ':' => {
                    let key = std::mem::take(key);
                    *state = ObjectState::Value { key };
                    Step::Record
                }
                ObjectState::Colon { .. } => {
                    return Err(ParseError::Unexpected { ch: c, expected: "':'" })
                }
                ObjectState::Value { key } => {
                    let mut path = frame.path.clone();
                    path.push(Segment::Key(std::mem::take(key)));
                    *state = ObjectState::CommaOrClose;
                    Step::Open(path)
                }
                ObjectState::CommaOrClose if c == ',' => {
                    *state = ObjectState::Key;
                    Step::Record
                }
                ObjectState::CommaOrClose if c == '}' => Step::Close,
                ObjectState::CommaOrClose => {
                    return Err(ParseError::Unexpected {
                        ch: c,
                        expected: "',' or '}'",
                    })
                }
            },
            FrameKind::Array { state, len } => match state {
                _ if c.is_whitespace() => Step::Record,
                ArrayState::ValueOrClose if c == ']' => Step::Close,
                ArrayState::ValueOrClose | ArrayState::Value => {
                    let mut path = frame.path.clone();
                    path.push(Segment::Index(*len));
                    *len += 1;
                    *state = ArrayState::CommaOrClose;
                    Step::Open(path)
                }
                ArrayState::CommaOrClose if c == ',' => {
                    *state = ArrayState::Value;
                    Step::Record
                }
                ArrayState::CommaOrClose if c == ']' => Step::Close,
                ArrayState::CommaOrClose => {
                    return Err(ParseError::Unexpected {
                        ch: c,
                        expected: "',' or ']'",
                    })
                }
            },
            FrameKind::Str { .. } | FrameKind::Number | FrameKind::Literal { .. } => {
                return Err(ParseError::Unexpected {
                    ch: c,
                    expected: "the end of a scalar",
                })
            }
        };

        match step {
            Step::Record => self.record(c),
            Step::Close => {
                self.record(c);
                self.close_value(events);
            }
            Step::Open(path) => self.open_value(c, path, events)?,
        }
        Ok(())
    }

    fn check_root_type(&self, c: char) -> Result<(), ParseError> {
        let Some(expected) = &self.root_type else {
            return Ok(());
        };
        let ok = match expected.as_str() {
            "object" => c == '{',
            "array" => c == '[',
            "string" | "const" => c == '"',
            "number" | "integer" => c == '-' || c.is_ascii_digit(),
            "boolean" => c == 't' || c == 'f',
            "null" => c == 'n',
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ParseError::TypeMismatch {
                expected: expected.clone(),
                found: c,
            })
        }
    }

    fn open_value(
        &mut self,
        c: char,
        path: Vec<Segment>,
        events: &mut Vec<ParseEvent>,
    ) -> Result<(), ParseError> {
        let kind = match c {
            '{' => FrameKind::Object(ObjectState::KeyOrClose),
            '[' => FrameKind::Array {
                state: ArrayState::ValueOrClose,
                len: 0,
            },
            '"' => FrameKind::Str { escaped: false },
            '-' | '0'..='9' => FrameKind::Number,
            't' => FrameKind::Literal {
                word: "true",
                matched: 1,
            },
            'f' => FrameKind::Literal {
                word: "false",
                matched: 1,
            },
            'n' => FrameKind::Literal {
                word: "null",
                matched: 1,
            },
            _ => {
                return Err(ParseError::Unexpected {
                    ch: c,
                    expected: "a value",
                })
            }
        };

        let pattern = render(&path, true);
        if self.start_hooks.contains(&pattern) {
            events.push(ParseEvent {
                kind: HookKind::ValueStart,
                path: pattern.clone(),
                property: property_of(&path),
                value: None,
            });
        }
        let capture = self.end_hooks.contains(&pattern).then(String::new);

        self.stack.push(Frame {
            path,
            kind,
            capture,
        });
        self.record(c);
        Ok(())
    }

    fn close_value(&mut self, events: &mut Vec<ParseEvent>) {
        let Some(frame) = self.stack.pop() else {
            return;
        };
        if self.stack.is_empty() {
            self.finished = true;
        }

        let Some(raw) = frame.capture else {
            return;
        };
        events.push(ParseEvent {
            kind: HookKind::ValueEnd,
            path: render(&frame.path, true),
            property: property_of(&frame.path),
            value: serde_json::from_str(&raw).ok(),
        });
    }

    /// The character belongs to every open value.
    fn record(&mut self, c: char) {
        for frame in &mut self.stack {
            if let Some(capture) = &mut frame.capture {
                capture.push(c);
            }
        }
        self.current = self
            .stack
            .iter()
            .map(|frame| render(&frame.path, false))
            .collect();
    }
}

impl SchemaParser for JsonPathParser {
    fn advance_char(&mut self, c: char) -> Result<Vec<ParseEvent>, ParseError> {
        self.current.clear();
        let mut events = Vec::new();
        self.step(c, &mut events)?;
        Ok(events)
    }

    fn current_value_paths(&self) -> Vec<String> {
        self.current.clone()
    }
}

fn property_of(path: &[Segment]) -> Option<String> {
    match path.last() {
        Some(Segment::Key(key)) => Some(key.clone()),
        _ => None,
    }
}

fn is_number_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E')
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        'b' => '\u{8}',
        'f' => '\u{c}',
        other => other,
    }
}
