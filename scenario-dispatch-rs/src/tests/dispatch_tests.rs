#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use crate::dispatch::{DispatchResponse, DispatchStream, StreamEvent};
    use crate::error::ErrorKind;
    use crate::provider::ProviderConfig;
    use crate::resilience::CircuitState;
    use crate::tests::support::{breaker_config, eventually, Harness, HarnessOptions, Step};

    fn payload() -> Value {
        json!({"mingpan_shiye_caifu_zonglun": {"ten_gods": ["正财"]}})
    }

    fn complete(response: DispatchResponse) -> Value {
        match response {
            DispatchResponse::Complete(value) => value,
            DispatchResponse::Streaming(_) => panic!("expected a complete response"),
        }
    }

    fn streaming(response: DispatchResponse) -> DispatchStream {
        match response {
            DispatchResponse::Streaming(stream) => stream,
            DispatchResponse::Complete(value) => panic!("expected a stream, got {}", value),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_success() {
        let harness = Harness::new().await;
        harness.coze.script([Step::Transient("HTTP 503"), Step::Transient("timeout")]);

        let response = harness
            .dispatcher
            .dispatch(&harness.selected_coze(), payload(), false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(complete(response), json!({"answer": "ok"}));
        assert_eq!(harness.coze.calls(), 3);
        assert_eq!(harness.coze.payloads()[2], payload());

        // Success on the last attempt resets the streak
        let breaker = harness.breakers.get(&harness.selected_coze().identity());
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let harness = Harness::new().await;
        harness.coze.script([Step::Permanent("HTTP 400: malformed payload")]);

        let err = harness
            .dispatcher
            .dispatch(&harness.selected_coze(), payload(), false, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UpstreamPermanent);
        assert_eq!(harness.coze.calls(), 1);
        let breaker = harness.breakers.get(&harness.selected_coze().identity());
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_upstream_error() {
        let harness = Harness::new().await;
        harness.coze.script([
            Step::Transient("HTTP 502"),
            Step::Transient("HTTP 502"),
            Step::Transient("HTTP 502"),
        ]);

        let err = harness
            .dispatcher
            .dispatch(&harness.selected_coze(), payload(), false, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(err.context().and_then(|c| c.provider.as_deref()), Some("coze/bot-1"));
        assert_eq!(harness.coze.calls(), 3);

        let breaker = harness.breakers.get(&harness.selected_coze().identity());
        assert_eq!(breaker.consecutive_failures(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_buffered_call_is_not_a_provider_failure() {
        let harness = Harness::new().await;
        harness.coze.script([Step::Hang]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = harness
            .dispatcher
            .dispatch(&harness.selected_coze(), payload(), false, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(harness.coze.calls(), 1);
        let snapshot = harness.breakers.get(&harness.selected_coze().identity()).snapshot();
        assert_eq!(snapshot.total_failures, 0);
        assert_eq!(snapshot.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_any_call() {
        let harness = Harness::new().await;
        harness.credentials.remove("COZE_TOKEN");

        let err = harness
            .dispatcher
            .dispatch(&harness.selected_coze(), payload(), false, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Credential);
        assert!(!err.to_string().contains("pat-coze"));
        assert_eq!(harness.coze.calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_delivers_chunks_in_order_then_end() {
        let harness = Harness::new().await;
        harness.coze.script([Step::Chunks(vec!["事业", "财运", "总论"])]);

        let response = harness
            .dispatcher
            .dispatch(&harness.selected_coze(), payload(), true, &CancellationToken::new())
            .await
            .unwrap();
        let (text, terminal) = streaming(response).collect_text().await;

        assert_eq!(text, "事业财运总论");
        assert!(matches!(terminal, Some(StreamEvent::End)));
        assert!(eventually(|| harness.coze.upstream_closed()).await);

        let snapshot = harness.breakers.get(&harness.selected_coze().identity()).snapshot();
        assert_eq!(snapshot.total_successes, 1);
    }

    #[tokio::test]
    async fn test_stream_establishment_is_retried() {
        let harness = Harness::new().await;
        harness
            .coze
            .script([Step::Transient("connection refused"), Step::Chunks(vec!["ok"])]);

        let response = harness
            .dispatcher
            .dispatch(&harness.selected_coze(), payload(), true, &CancellationToken::new())
            .await
            .unwrap();
        let (text, terminal) = streaming(response).collect_text().await;

        assert_eq!(text, "ok");
        assert!(matches!(terminal, Some(StreamEvent::End)));
        assert_eq!(harness.coze.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_stream_closes_upstream_without_failure() {
        let harness = Harness::new().await;
        harness.coze.script([Step::ChunksThenHang(vec!["first"])]);

        let cancel = CancellationToken::new();
        let response = harness
            .dispatcher
            .dispatch(&harness.selected_coze(), payload(), true, &cancel)
            .await
            .unwrap();
        let mut stream = streaming(response);

        assert!(matches!(stream.recv().await, Some(StreamEvent::Chunk(c)) if c == "first"));
        cancel.cancel();

        assert!(matches!(stream.recv().await, Some(StreamEvent::Cancelled)));
        assert!(stream.recv().await.is_none());
        assert!(harness.coze.upstream_closed());

        let breaker = harness.breakers.get(&harness.selected_coze().identity());
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.snapshot().total_failures, 0);
    }

    #[tokio::test]
    async fn test_cancelled_marker_survives_a_full_channel() {
        let harness = Harness::with_options(HarnessOptions {
            stream_buffer: 1,
            ..HarnessOptions::default()
        })
        .await;
        harness.coze.script([Step::ChunksThenHang(vec!["first", "second"])]);

        let cancel = CancellationToken::new();
        let response = harness
            .dispatcher
            .dispatch(&harness.selected_coze(), payload(), true, &cancel)
            .await
            .unwrap();
        let mut stream = streaming(response);

        // "first" fills the only slot; the forwarder waits on "second"
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert!(eventually(|| harness.coze.upstream_closed()).await);

        assert!(matches!(stream.recv().await, Some(StreamEvent::Chunk(c)) if c == "first"));
        assert!(matches!(stream.recv().await, Some(StreamEvent::Cancelled)));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_mid_stream_error_ends_stream_and_counts_as_failure() {
        let harness = Harness::new().await;
        harness.coze.script([Step::ChunksThenError(vec!["part one, "])]);

        let response = harness
            .dispatcher
            .dispatch(&harness.selected_coze(), payload(), true, &CancellationToken::new())
            .await
            .unwrap();
        let (text, terminal) = streaming(response).collect_text().await;

        assert_eq!(text, "part one, ");
        match terminal {
            Some(StreamEvent::Error(err)) => {
                assert_eq!(err.kind(), ErrorKind::UpstreamTransient);
                assert_eq!(err.context().and_then(|c| c.provider.as_deref()), Some("coze/bot-1"));
            }
            other => panic!("expected an error event, got {:?}", other),
        }

        // Mid-stream failures are never retried
        assert_eq!(harness.coze.calls(), 1);
        let breaker = harness.breakers.get(&harness.selected_coze().identity());
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_frees_the_trial_slot() {
        let harness = Harness::with_options(HarnessOptions {
            breaker: breaker_config(1, Duration::from_millis(20)),
            ..HarnessOptions::default()
        })
        .await;
        let provider = harness.selected_coze();
        let breaker = harness.breakers.get(&provider.identity());

        breaker.record_failure(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(40)).await;

        harness.coze.script([Step::ChunksThenHang(vec!["probe"])]);
        let response = harness
            .dispatcher
            .dispatch(&provider, payload(), true, &CancellationToken::new())
            .await
            .unwrap();
        let mut stream = streaming(response);
        assert!(matches!(stream.recv().await, Some(StreamEvent::Chunk(_))));

        // The open stream holds the only half-open slot
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        drop(stream);
        assert!(eventually(|| harness.coze.upstream_closed()).await);
        assert!(eventually(|| breaker.try_acquire().is_ok()).await, "trial slot was not released");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().total_failures, 1);
    }

    #[tokio::test]
    async fn test_streaming_request_to_non_streaming_provider_fails() {
        let harness = Harness::new().await;
        let provider = Arc::new(ProviderConfig {
            supports_streaming: false,
            ..(*harness.selected_coze()).clone()
        });

        let err = harness
            .dispatcher
            .dispatch(&provider, payload(), true, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UpstreamPermanent);
        assert_eq!(harness.coze.calls(), 0);
    }
}
