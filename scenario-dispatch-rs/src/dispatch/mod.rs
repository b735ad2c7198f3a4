//! Resilience Dispatcher
//!
//! Sends a composed payload to the selected provider through the circuit
//! breaker and retry policy, either buffered or as a stream of chunks.

mod stream;

pub use stream::{DispatchStream, StreamEvent};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{DispatchError, ErrorContext, Result};
use crate::provider::{CredentialStore, Platform, ProviderClient, ProviderConfig, ProviderRequest};
use crate::resilience::Resilience;
use crate::util::generate_request_id;

/// Default capacity of the channel between the upstream reader and the caller
pub const DEFAULT_STREAM_BUFFER: usize = 32;

/// Result of a dispatch
#[derive(Debug)]
pub enum DispatchResponse {
    Complete(Value),
    Streaming(DispatchStream),
}

pub struct Dispatcher {
    clients: HashMap<Platform, Arc<dyn ProviderClient>>,
    credentials: Arc<dyn CredentialStore>,
    resilience: Resilience,
    stream_buffer: usize,
}

impl Dispatcher {
    pub fn new(resilience: Resilience, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            clients: HashMap::new(),
            credentials,
            resilience,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Register the client that reaches a platform
    pub fn with_client(mut self, platform: Platform, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(platform, client);
        self
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    /// Dispatch to one provider
    ///
    /// Buffered calls are retried on transient failures. Streaming calls are
    /// retried only until the stream is established; once chunks flow, a
    /// failure ends the stream with [`StreamEvent::Error`].
    pub async fn dispatch(
        &self,
        provider: &Arc<ProviderConfig>,
        payload: Value,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> Result<DispatchResponse> {
        let identity = provider.identity();
        let context = || ErrorContext::new().provider(&identity);

        let client = self.clients.get(&provider.platform).cloned().ok_or_else(|| {
            DispatchError::invalid_config(format!("no client registered for platform {}", provider.platform))
                .with_context(context())
        })?;

        if streaming && !provider.supports_streaming {
            return Err(DispatchError::permanent(format!(
                "provider {} does not support streaming",
                identity
            ))
            .with_context(context()));
        }

        let credential = self
            .credentials
            .resolve(&provider.credential_ref)
            .map_err(|e| e.with_context(context()))?;

        let request = Arc::new(ProviderRequest {
            provider: Arc::clone(provider),
            payload,
            credential,
            request_id: generate_request_id(),
        });

        debug!(
            provider = %identity,
            request_id = %request.request_id,
            streaming,
            "Dispatching to provider"
        );

        if streaming {
            let stream =
                stream::open(client, request, &self.resilience, cancel.clone(), self.stream_buffer).await?;
            return Ok(DispatchResponse::Streaming(stream));
        }

        let result = self
            .resilience
            .execute(&identity, cancel, |_| client.invoke(&request))
            .await;

        if let Err(err) = &result {
            if err.is_cancelled() {
                info!(provider = %identity, "Dispatch cancelled by caller");
            }
        }
        result.map(DispatchResponse::Complete)
    }
}
