//! Provider clients
//!
//! A platform is reached through a [`ProviderClient`] offering the two
//! capabilities the dispatcher needs: a buffered call and a chunked stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{header, Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::ProviderConfig;
use crate::error::{mapping, DispatchError, Result};

/// Incremental response chunks from a provider
pub type ChunkStream = BoxStream<'static, Result<String>>;

/// Everything a client needs to perform one call
pub struct ProviderRequest {
    pub provider: Arc<ProviderConfig>,
    pub payload: Value,
    pub credential: SecretString,
    pub request_id: String,
}

impl std::fmt::Debug for ProviderRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRequest")
            .field("provider", &self.provider.identity())
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// Capability set of an interchangeable backend platform
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Perform a call and return the complete structured response
    async fn invoke(&self, request: &ProviderRequest) -> Result<Value>;

    /// Open a streaming call
    ///
    /// Errors returned here happen before any chunk was produced; errors
    /// yielded by the stream happen mid-flight.
    async fn stream(&self, request: &ProviderRequest) -> Result<ChunkStream>;
}

const USER_AGENT: &str = concat!("scenario-dispatch/", env!("CARGO_PKG_VERSION"));

/// reqwest-backed client speaking the platform gateway envelope
///
/// `timeout` bounds a buffered call end to end. A stream is bounded only
/// while it is being established and between two reads, so a long but live
/// stream is never cut off.
#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    http_client: Client,
    timeout: Duration,
}

impl HttpProviderClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));

        let http_client = Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| DispatchError::invalid_config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { http_client, timeout })
    }

    async fn send(&self, request: &ProviderRequest, streaming: bool) -> Result<Response> {
        let provider = &request.provider;
        let body = json!({
            "endpoint_id": provider.endpoint_id,
            "payload": request.payload,
            "stream": streaming,
        });

        debug!(
            provider = %provider.identity(),
            request_id = %request.request_id,
            streaming,
            "Sending provider request"
        );

        let mut builder = self
            .http_client
            .post(&provider.base_url)
            .bearer_auth(request.credential.expose_secret())
            .header("X-Request-Id", &request.request_id)
            .json(&body);
        let response = if streaming {
            builder = builder.header(header::ACCEPT, "text/event-stream");
            tokio::time::timeout(self.timeout, builder.send())
                .await
                .map_err(|_| {
                    DispatchError::transient(format!(
                        "Stream not established within {}ms",
                        self.timeout.as_millis()
                    ))
                })??
        } else {
            builder.timeout(self.timeout).send().await?
        };
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(mapping::classify_status(status, &text))
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn invoke(&self, request: &ProviderRequest) -> Result<Value> {
        let response = self.send(request, false).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            DispatchError::permanent(format!("Provider returned malformed JSON: {}", e))
        })
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<ChunkStream> {
        let response = self.send(request, true).await?;
        let upstream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(DispatchError::from))
            .boxed();
        Ok(split_lines(upstream, self.timeout))
    }
}

#[derive(Debug, PartialEq)]
enum Line {
    Skip,
    Data(String),
    Done,
}

fn parse_line(raw: &[u8]) -> Line {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\r', '\n']);

    if text.trim().is_empty() || text.starts_with(':') {
        return Line::Skip;
    }
    if ["event:", "id:", "retry:"].iter().any(|prefix| text.starts_with(prefix)) {
        return Line::Skip;
    }

    let data = match text.strip_prefix("data:") {
        Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
        None => text,
    };
    if data.trim() == "[DONE]" {
        Line::Done
    } else {
        Line::Data(data.to_string())
    }
}

struct LineSplitter {
    upstream: BoxStream<'static, Result<Vec<u8>>>,
    buffer: Vec<u8>,
    idle_timeout: Duration,
    finished: bool,
}

/// Split a byte stream into newline-delimited events
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network reads are reassembled intact. A read
/// that stalls longer than `idle_timeout` ends the stream with a transient
/// error.
fn split_lines(upstream: BoxStream<'static, Result<Vec<u8>>>, idle_timeout: Duration) -> ChunkStream {
    let splitter = LineSplitter {
        upstream,
        buffer: Vec::new(),
        idle_timeout,
        finished: false,
    };

    stream::unfold(splitter, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                match parse_line(&line) {
                    Line::Skip => continue,
                    Line::Done => {
                        state.finished = true;
                        return None;
                    }
                    Line::Data(data) => return Some((Ok(data), state)),
                }
            }

            let next = match tokio::time::timeout(state.idle_timeout, state.upstream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    state.finished = true;
                    let err = DispatchError::transient(format!(
                        "Stream stalled for {}ms",
                        state.idle_timeout.as_millis()
                    ));
                    return Some((Err(err), state));
                }
            };
            match next {
                Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.finished = true;
                    let rest = std::mem::take(&mut state.buffer);
                    return match parse_line(&rest) {
                        Line::Data(data) => Some((Ok(data), state)),
                        Line::Skip | Line::Done => None,
                    };
                }
            }
        }
    })
    .boxed()
}
