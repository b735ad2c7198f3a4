//! Streaming passthrough
//!
//! The upstream stream is read by a spawned task and forwarded over a bounded
//! channel. The breaker permit taken when the stream was established is held
//! until the stream ends, then resolved by how it ended: completion is a
//! success, an upstream error is a failure, and caller cancellation or a
//! dropped receiver only frees the permit.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, ErrorContext, Result};
use crate::provider::{ChunkStream, ProviderClient, ProviderRequest};
use crate::resilience::{CircuitBreaker, Outcome, Permit, Resilience};

/// One item delivered to a streaming caller
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(String),
    /// Upstream finished normally
    End,
    /// Upstream failed after the stream was established
    Error(DispatchError),
    /// The caller's cancellation token fired; the upstream call was closed
    Cancelled,
}

/// Receiving half of a streaming dispatch
///
/// Dropping it closes the upstream call and counts as cancellation.
#[derive(Debug)]
pub struct DispatchStream {
    receiver: mpsc::Receiver<StreamEvent>,
}

impl DispatchStream {
    /// Next event, `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Drain the stream, concatenating chunks
    ///
    /// Returns the text gathered so far together with the terminal event.
    pub async fn collect_text(mut self) -> (String, Option<StreamEvent>) {
        let mut text = String::new();
        while let Some(event) = self.recv().await {
            match event {
                StreamEvent::Chunk(chunk) => text.push_str(&chunk),
                terminal => return (text, Some(terminal)),
            }
        }
        (text, None)
    }
}

impl Stream for DispatchStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

enum StreamEnd {
    Completed,
    Failed(DispatchError),
    Cancelled,
    Abandoned,
}

/// Establish the upstream stream under the retry policy and start forwarding
pub(super) async fn open(
    client: Arc<dyn ProviderClient>,
    request: Arc<ProviderRequest>,
    resilience: &Resilience,
    cancel: CancellationToken,
    buffer: usize,
) -> Result<DispatchStream> {
    let identity = request.provider.identity();
    let breaker = resilience.breakers().get(&identity);

    let (upstream, permit) = resilience
        .retry()
        .execute(&cancel, |attempt| {
            let breaker = Arc::clone(&breaker);
            let client = Arc::clone(&client);
            let request = Arc::clone(&request);
            let cancel = cancel.clone();
            async move {
                let permit = breaker.try_acquire()?;
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(DispatchError::cancelled("cancelled while opening stream")),
                    result = client.stream(&request) => result,
                };
                match result {
                    Ok(upstream) => Ok((upstream, permit)),
                    Err(err) => {
                        debug!(attempt, error = %err, "Stream establishment failed");
                        breaker.record(permit, Outcome::of_error(&err));
                        Err(err)
                    }
                }
            }
        })
        .await
        .map_err(|e| e.with_context(ErrorContext::new().provider(&identity)))?;

    let (sender, receiver) = mpsc::channel(buffer);
    tokio::spawn(forward(upstream, sender, cancel, breaker, permit));

    Ok(DispatchStream { receiver })
}

async fn forward(
    mut upstream: ChunkStream,
    sender: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    breaker: Arc<CircuitBreaker>,
    permit: Permit,
) {
    let mut chunks: u64 = 0;

    let end = loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            _ = sender.closed() => break StreamEnd::Abandoned,
            item = upstream.next() => item,
        };

        match item {
            Some(Ok(chunk)) => {
                chunks += 1;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break StreamEnd::Cancelled,
                    sent = sender.send(StreamEvent::Chunk(chunk)) => {
                        if sent.is_err() {
                            break StreamEnd::Abandoned;
                        }
                    }
                }
            }
            Some(Err(err)) => break StreamEnd::Failed(err),
            None => break StreamEnd::Completed,
        }
    };

    // Closes the upstream connection before any accounting
    drop(upstream);

    let provider = breaker.name().to_string();
    match end {
        StreamEnd::Completed => {
            breaker.record_success(permit);
            debug!(provider = %provider, chunks, "Stream completed");
            let _ = sender.send(StreamEvent::End).await;
        }
        StreamEnd::Failed(err) => {
            warn!(provider = %provider, chunks, error = %err, "Stream failed mid-flight");
            breaker.record(permit, Outcome::of_error(&err));
            let err = err.with_context(ErrorContext::new().provider(&provider).with("chunks", chunks));
            let _ = sender.send(StreamEvent::Error(err)).await;
        }
        StreamEnd::Cancelled => {
            breaker.release(permit);
            info!(provider = %provider, chunks, "Stream cancelled by caller");
            // Waits behind undelivered chunks; gives up only if the receiver goes away
            let _ = sender.send(StreamEvent::Cancelled).await;
        }
        StreamEnd::Abandoned => {
            breaker.release(permit);
            info!(provider = %provider, chunks, "Stream receiver dropped, upstream closed");
        }
    }
}
