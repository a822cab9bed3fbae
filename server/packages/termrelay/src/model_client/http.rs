use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Method;
use termrelay_credentials::Credentials;
use time::OffsetDateTime;
use url::Url;

use super::event_stream::EventStreamDecoder;
use super::sigv4::{self, SigningInput};
use super::{ChunkStream, ClientFuture, ConverseRequest, ModelClient, UpstreamError};
use crate::config::RelayConfig;

const SERVICE: &str = "bedrock";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(300);
const ERROR_BODY_LIMIT: usize = 512;

/// Calls the hosted model over HTTPS with SigV4-signed requests.
#[derive(Debug, Clone)]
pub struct HttpModelClient {
    client: reqwest::Client,
    model_endpoint: String,
    control_endpoint: String,
    region: String,
    model_id: String,
}

impl HttpModelClient {
    pub fn new(
        model_endpoint: impl Into<String>,
        control_endpoint: impl Into<String>,
        region: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        // Streams stay open for the whole reply, so only connecting is bounded.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            model_endpoint: model_endpoint.into().trim_end_matches('/').to_string(),
            control_endpoint: control_endpoint.into().trim_end_matches('/').to_string(),
            region: region.into(),
            model_id: model_id.into(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            &config.model_endpoint,
            &config.control_endpoint,
            &config.region,
            &config.model_id,
        )
    }

    pub fn converse_stream_url(&self) -> Result<Url, UpstreamError> {
        parse_url(&format!(
            "{}/model/{}/converse-stream",
            self.model_endpoint,
            sigv4::uri_encode(&self.model_id)
        ))
    }

    pub fn foundation_model_url(&self) -> Result<Url, UpstreamError> {
        parse_url(&format!(
            "{}/foundation-models/{}",
            self.control_endpoint,
            sigv4::uri_encode(&self.model_id)
        ))
    }

    async fn send_signed(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
        credentials: &Credentials,
        accept: &str,
    ) -> Result<reqwest::Response, UpstreamError> {
        let signed = sigv4::sign(
            &SigningInput {
                method: method.as_str(),
                url: &url,
                body: &body,
                region: &self.region,
                service: SERVICE,
                time: OffsetDateTime::now_utc(),
            },
            credentials,
        )?;

        let mut request = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, accept);
        if !body.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        for (name, value) in signed {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|err| UpstreamError::Request(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_LIMIT {
            let mut cut = ERROR_BODY_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(UpstreamError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl ModelClient for HttpModelClient {
    fn verify<'a>(&'a self, credentials: &'a Credentials) -> ClientFuture<'a, Result<(), UpstreamError>> {
        Box::pin(async move {
            let url = self.foundation_model_url()?;
            self.send_signed(Method::GET, url, Vec::new(), credentials, "application/json")
                .await?;
            tracing::debug!(source = %credentials.source, model = %self.model_id, "credentials accepted by model endpoint");
            Ok(())
        })
    }

    fn converse_stream<'a>(
        &'a self,
        credentials: &'a Credentials,
        request: ConverseRequest,
    ) -> ClientFuture<'a, Result<ChunkStream, UpstreamError>> {
        Box::pin(async move {
            let url = self.converse_stream_url()?;
            let body = serde_json::to_vec(&request.to_body())
                .map_err(|err| UpstreamError::Request(err.to_string()))?;
            let response = self
                .send_signed(
                    Method::POST,
                    url,
                    body,
                    credentials,
                    "application/vnd.amazon.eventstream",
                )
                .await?;
            Ok(decode_body(response.bytes_stream().boxed()))
        })
    }
}

fn parse_url(raw: &str) -> Result<Url, UpstreamError> {
    Url::parse(raw).map_err(|err| UpstreamError::Request(format!("invalid url {raw}: {err}")))
}

struct DecodeState {
    body: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: EventStreamDecoder,
    finished: bool,
}

/// Turn a raw event-stream body into text deltas. The stream ends after the
/// first error.
pub(crate) fn decode_body(body: BoxStream<'static, reqwest::Result<bytes::Bytes>>) -> ChunkStream {
    let state = DecodeState {
        body,
        decoder: EventStreamDecoder::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            match state.decoder.next_frame() {
                Ok(Some(frame)) => match frame.delta_text() {
                    Ok(Some(text)) => return Some((Ok(text), state)),
                    Ok(None) => continue,
                    Err(err) => {
                        state.finished = true;
                        return Some((Err(err), state));
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
            }
            match state.body.next().await {
                Some(Ok(bytes)) => state.decoder.push(&bytes),
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(UpstreamError::Request(err.to_string())), state));
                }
                None if state.decoder.has_partial() => {
                    state.finished = true;
                    return Some((
                        Err(UpstreamError::Decode("stream ended mid-frame".to_string())),
                        state,
                    ));
                }
                None => return None,
            }
        }
    })
    .boxed()
}
