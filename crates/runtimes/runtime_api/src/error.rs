/// Failures reported by an engine.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to load model '{id}': {reason}")]
    Load { id: String, reason: String },

    #[error("tokenization failed: {0}")]
    Tokenization(String),

    #[error("generation failed: {0}")]
    Generation(String),
}

/// A character the schema parser could not accept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected character {ch:?} while expecting {expected}")]
    Unexpected { ch: char, expected: &'static str },

    #[error("unexpected character {0:?} after the end of the document")]
    Trailing(char),

    #[error("schema expects a top-level {expected}, found {found:?}")]
    TypeMismatch { expected: String, found: char },
}
