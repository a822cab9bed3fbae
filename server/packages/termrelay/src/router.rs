use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use termrelay_error::{ErrorType, ProblemDetails, RelayError};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::config::InvokeMode;
use crate::model_client::ChatMessage;
use crate::relay::StreamingRelay;

pub const SERVICE_NAME: &str = "termrelay";

#[derive(Debug)]
pub struct AppState {
    relay: StreamingRelay,
    script: Option<String>,
    log_http: bool,
}

impl AppState {
    pub fn new(relay: StreamingRelay) -> Self {
        Self {
            relay,
            script: None,
            log_http: false,
        }
    }

    /// Application script served at `/api/script`.
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_http_logging(mut self, enabled: bool) -> Self {
        self.log_http = enabled;
        self
    }

    pub fn relay(&self) -> &StreamingRelay {
        &self.relay
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route("/api/chat", post(post_chat))
        .route("/api/script", get(get_script))
        .route("/api/openapi.json", get(get_openapi))
        .fallback(not_found)
        .with_state(shared.clone());

    if shared.log_http {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, post_chat, get_script),
    components(schemas(ChatRequest, ChatMessage, HealthResponse, ProblemDetails, ErrorType)),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "chat", description = "Streamed model replies")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub timestamp: String,
}

async fn not_found() -> ApiError {
    ApiError::Relay(RelayError::NotFound {
        message: "no such route".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "SSE stream of content deltas, ending with [DONE] or [ERROR]"),
        (status = 400, body = ProblemDetails),
        (status = 415, body = ProblemDetails),
        (status = 502, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let essence = content_type.split(';').next().unwrap_or("").trim();
    if !essence.eq_ignore_ascii_case("application/json") {
        return Err(RelayError::UnsupportedMediaType {
            message: format!("expected application/json, got `{content_type}`"),
        }
        .into());
    }
    let request: ChatRequest =
        serde_json::from_slice(&body).map_err(|err| RelayError::InvalidRequest {
            message: err.to_string(),
        })?;
    if request.messages.is_empty() {
        return Err(RelayError::InvalidRequest {
            message: "messages must not be empty".to_string(),
        }
        .into());
    }

    let stream_headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (header::HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    match state.relay.invoke_mode() {
        InvokeMode::ResponseStream => {
            let chunks = state.relay.stream(request.messages).await?;
            let events = chunks
                .map(|chunk| Ok::<_, Infallible>(Event::default().data(chunk.to_sse_data())));
            Ok((stream_headers, Sse::new(events)).into_response())
        }
        InvokeMode::Buffered => {
            let body = state.relay.collect(request.messages).await?;
            Ok((
                [(header::CONTENT_TYPE, "text/event-stream")],
                stream_headers,
                body,
            )
                .into_response())
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/script",
    responses(
        (status = 200, description = "Application script handed to the sandbox", body = String, content_type = "text/plain"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "meta"
)]
async fn get_script(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    match &state.script {
        Some(script) => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            script.clone(),
        )
            .into_response()),
        None => Err(RelayError::NotFound {
            message: "no application script is configured".to_string(),
        }
        .into()),
    }
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
