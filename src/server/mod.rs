use crate::config::LimitsConfig;
use crate::engine::{ApproveToolCallRequest, ChatEngine, ChatRequest, ChatResponseEvent};
use crate::platform::PipelinePlatform;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

/// Request bodies above this are rejected with 413.
const MAX_REQUEST_BODY_BYTES: usize = 1 << 20;

const EVENT_CHANNEL_BUFFER: usize = 64;

pub struct AppState {
    pub engine: Arc<ChatEngine>,
    pub platform: Arc<dyn PipelinePlatform>,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(
        engine: Arc<ChatEngine>,
        platform: Arc<dyn PipelinePlatform>,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            engine,
            platform,
            rate_limiter: RateLimiter::new(
                limits.rate_max_requests,
                Duration::from_secs(limits.rate_window_secs),
            ),
        }
    }
}

/// Sliding-window request limiter keyed by caller identity.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let mut requests = self.requests.lock().unwrap();
        let now = Instant::now();
        let entries = requests.entry(key.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < self.window);
        if entries.len() >= self.max_requests {
            return false;
        }
        entries.push(now);
        true
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/apis/v2beta1/ai/chat/stream", post(chat_stream_handler))
        .route("/apis/v2beta1/ai/approve", post(approve_handler))
        .route("/apis/v2beta1/ai/rules", get(list_rules_handler))
        .route("/apis/v2beta1/ai/rules/toggle", post(toggle_rule_handler))
        .route("/apis/v2beta1/ai/generate-docs", post(generate_docs_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("flowpilot server listening on http://localhost:{}", port);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Identity & auth
// ---------------------------------------------------------------------------

/// Pull the caller identity from the configured header, minus the configured
/// prefix. Empty in single-user mode or when the header is absent.
fn extract_user_id(platform: &dyn PipelinePlatform, headers: &HeaderMap) -> String {
    if !platform.is_multi_user_mode() {
        return String::new();
    }
    let value = headers
        .get(platform.user_id_header())
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let prefix = platform.user_id_prefix();
    value.strip_prefix(prefix).unwrap_or(value).to_string()
}

/// 401 unless the caller is identified (or the deployment is single-user).
fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let user_id = extract_user_id(state.platform.as_ref(), headers);
    if state.platform.is_multi_user_mode() && user_id.is_empty() {
        return Err((StatusCode::UNAUTHORIZED, "Authentication required").into_response());
    }
    Ok(user_id)
}

fn rate_limit_key(user_id: &str, addr: &SocketAddr) -> String {
    if user_id.is_empty() {
        addr.ip().to_string()
    } else {
        user_id.to_string()
    }
}

fn generate_session_id() -> String {
    format!("session-{}", uuid::Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /apis/v2beta1/ai/chat/stream — the SSE chat endpoint.
async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut req: ChatRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Invalid request body: {}", e),
            )
                .into_response()
        }
    };

    let user_id = match require_auth(&state, &headers) {
        Ok(user_id) => user_id,
        Err(resp) => return resp,
    };
    req.user_id = user_id.clone();

    if !state.rate_limiter.allow(&rate_limit_key(&user_id, &addr)) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded. Please wait before sending another message.",
        )
            .into_response();
    }

    if req.message.is_empty() {
        return (StatusCode::BAD_REQUEST, "message is required").into_response();
    }
    if req.session_id.is_empty() {
        req.session_id = generate_session_id();
    }

    let (tx, rx) = mpsc::channel::<ChatResponseEvent>(EVENT_CHANNEL_BUFFER);
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.stream_chat(req, tx).await {
            // The stream already carries a sanitized error event; the full
            // diagnostic belongs in the log only.
            warn!("chat stream ended with error: {:#}", e);
        }
    });

    let events = ReceiverStream::new(rx)
        .map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Ok::<_, Infallible>(Event::default().data(data))
        })
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))));

    let mut response = Sse::new(events).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// POST /apis/v2beta1/ai/approve — resolve a pending tool confirmation.
async fn approve_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: ApproveToolCallRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Invalid request body: {}", e),
            )
                .into_response()
        }
    };

    if state.platform.is_multi_user_mode() {
        let user_id = match require_auth(&state, &headers) {
            Ok(user_id) => user_id,
            Err(resp) => return resp,
        };
        if let Err(e) = state.engine.validate_session_owner(&req.session_id, &user_id) {
            return (StatusCode::FORBIDDEN, format!("Unauthorized: {}", e)).into_response();
        }
    }

    if let Err(e) = state.engine.approve_tool_call(&req) {
        return (
            StatusCode::BAD_REQUEST,
            format!("Failed to process approval: {}", e),
        )
            .into_response();
    }

    Json(json!({ "success": true })).into_response()
}

/// GET /apis/v2beta1/ai/rules
async fn list_rules_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    Json(json!({ "rules": state.engine.rules().list_rules() })).into_response()
}

#[derive(Deserialize)]
struct ToggleRuleRequest {
    rule_id: String,
    enabled: bool,
}

/// POST /apis/v2beta1/ai/rules/toggle
async fn toggle_rule_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers) {
        return resp;
    }
    let req: ToggleRuleRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Invalid request body: {}", e),
            )
                .into_response()
        }
    };
    match state.engine.rules().toggle_rule(&req.rule_id, req.enabled) {
        Ok(rule) => Json(json!({ "rule": rule })).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            format!("Failed to toggle rule: {}", e),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct GenerateDocsRequest {
    #[serde(default)]
    pipeline_id: String,
    #[serde(default)]
    pipeline_version_id: String,
}

/// POST /apis/v2beta1/ai/generate-docs — one-shot pipeline documentation.
/// Runs a single Ask-mode chat turn on a throwaway session and collects only
/// the markdown chunks.
async fn generate_docs_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user_id = match require_auth(&state, &headers) {
        Ok(user_id) => user_id,
        Err(resp) => return resp,
    };
    if !state.rate_limiter.allow(&rate_limit_key(&user_id, &addr)) {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    }

    let req: GenerateDocsRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Invalid request body: {}", e),
            )
                .into_response()
        }
    };
    if req.pipeline_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "pipeline_id is required").into_response();
    }

    // Ground the documentation in the pipeline's metadata and spec.
    let mut spec_context = String::new();
    if let Ok(pipeline) = state.platform.get_pipeline(&req.pipeline_id).await {
        spec_context.push_str(&format!(
            "Pipeline Name: {}\nDescription: {}\nNamespace: {}\n\n",
            pipeline.name, pipeline.description, pipeline.namespace
        ));
    }
    if !req.pipeline_version_id.is_empty() {
        if let Ok(template) = state
            .platform
            .get_pipeline_version_template(&req.pipeline_version_id)
            .await
        {
            spec_context.push_str(&format!(
                "Pipeline Spec (version {}):\n```json\n{}\n```\n",
                req.pipeline_version_id, template
            ));
        }
    } else if let Ok(template) = state
        .platform
        .get_pipeline_latest_template(&req.pipeline_id)
        .await
    {
        spec_context.push_str(&format!(
            "Pipeline Spec (latest version):\n```json\n{}\n```\n",
            template
        ));
    }

    let prompt = format!(
        "Generate comprehensive documentation for the following pipeline. Include an overview, description of each component/step, input parameters, output artifacts, and usage examples.\n\n{}",
        spec_context
    );
    let chat_req = ChatRequest {
        message: prompt,
        session_id: generate_session_id(),
        mode: 1,
        page_context: None,
        user_id,
    };

    let (tx, mut rx) = mpsc::channel::<ChatResponseEvent>(EVENT_CHANNEL_BUFFER);
    let engine = state.engine.clone();
    let task = tokio::spawn(async move { engine.stream_chat(chat_req, tx).await });

    let mut markdown = String::new();
    while let Some(event) = rx.recv().await {
        if let ChatResponseEvent::MarkdownChunk { content } = event {
            markdown.push_str(&content);
        }
    }

    match task.await {
        Ok(Ok(())) => Json(json!({ "documentation_markdown": markdown })).into_response(),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to generate documentation",
        )
            .into_response(),
    }
}
