pub mod chat;
pub mod models;
pub mod ollama;

use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;

use crate::error::{ApiError, OllamaError};
use crate::state::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        // HEAD is answered by the GET handler
        .route("/", get(root))
        .route("/health", get(health))
        // OpenAI
        .route("/v1/models", get(models::list_models))
        .route("/v1/chat/completions", post(chat::chat_completions))
        // Ollama
        .route("/api/generate", post(ollama::generate))
        .route("/api/chat", post(ollama::chat))
        .route("/api/tags", get(ollama::tags))
        .route("/api/version", get(ollama::version))
        .route("/api/show", post(ollama::show))
        .route("/api/ps", get(ollama::ps))
        .route("/api/create", any(|| not_implemented("create")))
        .route("/api/copy", any(|| not_implemented("copy")))
        .route("/api/delete", any(|| not_implemented("delete")))
        .route("/api/push", any(|| not_implemented("push")))
        .route("/api/pull", any(|| not_implemented("pull")))
        .route("/api/embed", any(|| not_implemented("embed")))
        .with_state(state)
}

async fn root() -> &'static str {
    "Kiln is running"
}

async fn health() -> &'static str {
    "ok"
}

async fn not_implemented(endpoint: &'static str) -> OllamaError {
    OllamaError(ApiError::NotImplemented(format!("/api/{endpoint}")))
}
