use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use kiln_core::Config;
use kiln_daemon::{api, state::AppState};
use kiln_runtime_api::testing::ScriptedLoader;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app(loader: ScriptedLoader) -> (Router, Arc<AppState>) {
    let loader = Arc::new(loader.only(["test-model"]));
    let state =
        Arc::new(AppState::with_loader(Config::default(), Arc::default(), loader).unwrap());
    (api::routes(state.clone()), state)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn openai_single_shot_completion() {
    let (app, _) = app(ScriptedLoader::new(["Hello", " world"]));
    let response = app
        .oneshot(post(
            "/v1/chat/completions",
            json!({"model": "test-model", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello world");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["completion_tokens"], 2);
}

#[tokio::test]
async fn openai_stream_ends_with_done_sentinel() {
    let (app, _) = app(ScriptedLoader::new(["Hel", "lo"]));
    let response = app
        .oneshot(post(
            "/v1/chat/completions",
            json!({
                "model": "test-model",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}],
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    let data: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();
    assert_eq!(data.last(), Some(&"[DONE]"));

    let chunks: Vec<Value> = data[..data.len() - 1]
        .iter()
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "Hel");
    assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "lo");
    assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
    assert_eq!(chunks[0]["id"], chunks[2]["id"]);
}

#[tokio::test]
async fn openai_tool_call_is_parsed() {
    let (app, _) = app(ScriptedLoader::new([
        r#"{"name": "get_weather", "#,
        r#""arguments": {"city": "Paris"}}"#,
    ]));
    let response = app
        .oneshot(post(
            "/v1/chat/completions",
            json!({
                "model": "test-model",
                "messages": [{"role": "user", "content": "weather?"}],
                "tools": [{"type": "function", "function": {
                    "name": "get_weather",
                    "parameters": {"type": "object"},
                }}],
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let choice = &body["choices"][0];
    assert_eq!(choice["finish_reason"], "tool_calls");
    assert_eq!(choice["message"]["content"], Value::Null);
    let call = &choice["message"]["tool_calls"][0];
    assert_eq!(call["function"]["name"], "get_weather");
    assert_eq!(call["function"]["arguments"], r#"{"city":"Paris"}"#);
}

#[tokio::test]
async fn openai_unknown_model_is_404() {
    let (app, _) = app(ScriptedLoader::new(["x"]));
    let response = app
        .oneshot(post(
            "/v1/chat/completions",
            json!({"model": "nope", "messages": []}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "model_not_found");
}

#[tokio::test]
async fn ollama_generate_streams_ndjson() {
    let (app, _) = app(ScriptedLoader::new(["a", "b"]));
    let response = app
        .oneshot(post(
            "/api/generate",
            json!({"model": "test-model", "prompt": "hi there"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-ndjson"
    );
    let text = body_text(response).await;
    let lines: Vec<Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["response"], "a");
    assert_eq!(lines[0]["done"], false);
    let last = &lines[2];
    assert_eq!(last["done"], true);
    assert_eq!(last["done_reason"], "stop");
    assert_eq!(last["prompt_eval_count"], 2);
    assert_eq!(last["eval_count"], 2);
    assert!(last.get("load_duration").is_some());
}

#[tokio::test]
async fn ollama_chat_single_object() {
    let (app, _) = app(ScriptedLoader::new(["Hi", "!"]));
    let response = app
        .oneshot(post(
            "/api/chat",
            json!({
                "model": "test-model",
                "stream": false,
                "messages": [{"role": "user", "content": "hello"}],
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["message"]["content"], "Hi!");
    assert_eq!(body["done"], true);
}

#[tokio::test]
async fn ollama_load_and_unload() {
    let (app, state) = app(ScriptedLoader::new(["x"]));

    let response = app
        .clone()
        .oneshot(post(
            "/api/generate",
            json!({"model": "test-model", "stream": false}),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["done_reason"], "load");
    assert_eq!(state.cache.resident().len(), 1);

    let response = app
        .clone()
        .oneshot(get("/api/ps"))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["models"][0]["name"], "test-model");

    let response = app
        .oneshot(post(
            "/api/generate",
            json!({"model": "test-model", "keep_alive": 0, "stream": false}),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["done_reason"], "unload");
    assert!(state.cache.resident().is_empty());
}

#[tokio::test]
async fn ollama_rejects_unsupported_fields() {
    let (app, _) = app(ScriptedLoader::new(["x"]));

    let response = app
        .clone()
        .oneshot(post(
            "/api/generate",
            json!({"model": "test-model", "prompt": "hi", "system": "be brief"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("system"));

    let response = app
        .clone()
        .oneshot(post(
            "/api/chat",
            json!({"model": "test-model", "messages": [], "tools": [{"type": "function"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);

    let response = app
        .oneshot(post("/api/pull", json!({"model": "test-model"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn ollama_malformed_keep_alive_is_400() {
    let (app, _) = app(ScriptedLoader::new(["x"]));
    let response = app
        .oneshot(post(
            "/api/generate",
            json!({"model": "test-model", "prompt": "hi", "keep_alive": "5s"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ollama_chat_bad_format_does_not_load() {
    let (app, state) = app(ScriptedLoader::new(["x"]));
    let response = app
        .oneshot(post(
            "/api/chat",
            json!({
                "model": "test-model",
                "format": 7,
                "messages": [{"role": "user", "content": "hi"}],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(state.cache.resident().is_empty());
}

#[tokio::test]
async fn liveness_endpoints() {
    let (app, _) = app(ScriptedLoader::new(["x"]));

    let response = app.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let head = Request::builder()
        .method(Method::HEAD)
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(head).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/api/version")).await.unwrap();
    assert!(body_json(response).await["version"].is_string());
}
