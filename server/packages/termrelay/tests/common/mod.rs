#![allow(dead_code)]

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use termrelay::config::InvokeMode;
use termrelay::model_client::ScriptedModelClient;
use termrelay::{build_router_with_state, AppState, RelaySettings, StreamingRelay};
use termrelay_credentials::{CredentialChain, StaticSource};
use tokio::net::TcpListener;
use tower::util::ServiceExt;

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    pub client: Arc<ScriptedModelClient>,
}

impl TestApp {
    pub fn new(client: ScriptedModelClient) -> Self {
        Self::with_chain(client, static_chain(), InvokeMode::ResponseStream)
    }

    pub fn with_chain(client: ScriptedModelClient, chain: CredentialChain, mode: InvokeMode) -> Self {
        Self::with_state(client, chain, mode, |state| state)
    }

    pub fn with_state(
        client: ScriptedModelClient,
        chain: CredentialChain,
        mode: InvokeMode,
        configure: impl FnOnce(AppState) -> AppState,
    ) -> Self {
        let client = Arc::new(client);
        let relay = StreamingRelay::new(
            client.clone(),
            Arc::new(chain),
            RelaySettings {
                max_tokens: 1024,
                temperature: 0.9,
                invoke_mode: mode,
            },
        );
        let (app, state) = build_router_with_state(Arc::new(configure(AppState::new(relay))));
        Self { app, state, client }
    }

    pub async fn get(&self, path: &str) -> (StatusCode, HeaderMap, Bytes) {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .expect("request");
        self.send(request).await
    }

    pub async fn post_chat(&self, content_type: &str, body: &str) -> (StatusCode, HeaderMap, Bytes) {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .expect("request");
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        (status, headers, bytes)
    }
}

pub fn static_chain() -> CredentialChain {
    CredentialChain::new().with_source(StaticSource::new("AKIDEXAMPLE", "secret"))
}

pub fn json(bytes: &Bytes) -> Value {
    serde_json::from_slice(bytes).expect("json body")
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}
