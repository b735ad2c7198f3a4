#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};
    use tokio_util::sync::CancellationToken;

    use crate::engine::{DispatchOutcome, DispatchRequest};
    use crate::error::ErrorKind;
    use crate::format::{FieldSpec, FormatDefinition};
    use crate::provider::{platform_override_key, Platform};
    use crate::resilience::CircuitState;
    use crate::tests::support::{
        career_bag, career_format, eventually, Harness, Step, DEFAULT_KEY, ENVIRONMENT, SCENARIO,
    };

    fn career_format_v2() -> FormatDefinition {
        let mut format = career_format(2);
        format
            .structure
            .insert("schema".to_string(), FieldSpec::Literal { value: json!("v2") });
        format
    }

    fn response_of(outcome: &DispatchOutcome) -> &serde_json::Value {
        match outcome {
            DispatchOutcome::Complete { response, .. } => response,
            DispatchOutcome::Streaming { .. } => panic!("expected a complete outcome"),
        }
    }

    #[tokio::test]
    async fn test_in_flight_request_keeps_its_snapshot_across_reload() {
        let harness = Harness::new().await;
        harness
            .coze
            .script([Step::Delayed(Duration::from_millis(100), json!({"from": "coze"}))]);
        harness.bailian.script([Step::Respond(json!({"from": "bailian"}))]);

        let engine = harness.engine.clone();
        let in_flight = tokio::spawn(async move {
            engine
                .dispatch(DispatchRequest::new(SCENARIO, career_bag()), CancellationToken::new())
                .await
        });
        assert!(eventually(|| harness.coze.calls() == 1).await);

        harness.store.update(|contents| {
            contents.formats = vec![career_format_v2()];
            contents
                .platform_keys
                .insert(platform_override_key(SCENARIO), "bailian".to_string());
        });
        let summary = assert_ok!(harness.coordinator.reload().await);
        assert_eq!(summary.previous_version, 1);
        assert_eq!(summary.new_version, 2);
        assert_eq!(summary.changed_formats, 1);
        assert_eq!(summary.changed_providers, 1);

        let fresh = harness
            .engine
            .dispatch(DispatchRequest::new(SCENARIO, career_bag()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fresh.snapshot_version(), 2);
        assert_eq!(fresh.provider().platform, Platform::Bailian);
        assert_eq!(response_of(&fresh), &json!({"from": "bailian"}));
        assert_eq!(harness.bailian.payloads()[0]["schema"], json!("v2"));

        let old = in_flight.await.unwrap().unwrap();
        assert_eq!(old.snapshot_version(), 1);
        assert_eq!(old.provider().platform, Platform::Coze);
        assert_eq!(response_of(&old), &json!({"from": "coze"}));
        assert!(harness.coze.payloads()[0].get("schema").is_none());

        // Keys are tagged with the versions each request actually used
        assert_ne!(old.cache_key(), fresh.cache_key());
        assert!(old.cache_key().contains(":f1:p1:"));
        assert!(fresh.cache_key().contains(":f2:p1:"));
    }

    #[tokio::test]
    async fn test_breaker_state_survives_reload() {
        let harness = Harness::new().await;
        let identity = harness.selected_coze().identity();
        let breaker = harness.breakers.get(&identity);
        for _ in 0..5 {
            breaker.record_failure(breaker.try_acquire().unwrap());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        harness.store.update(|contents| {
            let row = contents
                .providers
                .iter_mut()
                .find(|row| row.platform == Platform::Coze)
                .unwrap();
            row.base_url = "http://coze-gateway.invalid".to_string();
            row.version = 2;
        });
        let summary = assert_ok!(harness.coordinator.reload().await);
        assert_eq!(summary.changed_providers, 1);
        assert_eq!(harness.selected_coze().version, 2);

        assert_eq!(harness.breakers.get(&identity).state(), CircuitState::Open);
        let err = harness
            .engine
            .dispatch(DispatchRequest::new(SCENARIO, career_bag()), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(harness.coze.calls(), 0);
        assert_eq!(err.context().and_then(|c| c.snapshot_version), Some(2));
    }

    #[tokio::test]
    async fn test_rejected_reload_keeps_current_snapshot() {
        let harness = Harness::new().await;

        // Structure changed but the version did not
        harness.store.update(|contents| {
            let mut format = career_format_v2();
            format.version = 1;
            contents.formats = vec![format];
        });
        let err = assert_err!(harness.coordinator.reload().await);
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert_eq!(harness.snapshots.version(), 1);

        let outcome = harness
            .engine
            .dispatch(DispatchRequest::new(SCENARIO, career_bag()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.snapshot_version(), 1);
        assert!(harness.coze.payloads()[0].get("schema").is_none());
    }

    #[tokio::test]
    async fn test_unknown_platform_in_key_rejects_reload() {
        let harness = Harness::new().await;
        harness.store.set_platform_key(platform_override_key(SCENARIO), "wenxin");

        let err = assert_err!(harness.coordinator.reload().await);
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert_eq!(harness.snapshots.version(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_store_does_not_publish() {
        let harness = Harness::new().await;
        let before = harness.snapshots.load();

        let summary = assert_ok!(harness.coordinator.reload().await);
        assert!(!summary.published());
        assert_eq!(summary.new_version, 1);
        assert!(std::sync::Arc::ptr_eq(&before, &harness.snapshots.load()));
    }

    #[tokio::test]
    async fn test_concurrent_reloads_yield_monotonic_versions() {
        let harness = Harness::new().await;
        harness.store.update(|contents| contents.formats = vec![career_format_v2()]);

        let (a, b) = tokio::join!(harness.coordinator.reload(), harness.coordinator.reload());
        let (a, b) = (a.unwrap(), b.unwrap());

        // One of them publishes v2, the other sees nothing left to change
        let mut versions = [a.new_version, b.new_version];
        versions.sort_unstable();
        assert_eq!(versions, [2, 2]);
        assert_eq!([a.published(), b.published()].iter().filter(|p| **p).count(), 1);
        assert_eq!(harness.snapshots.version(), 2);
    }

    #[tokio::test]
    async fn test_periodic_reload_picks_up_store_changes() {
        let harness = Harness::new().await;
        let cancel = CancellationToken::new();
        let task = harness
            .coordinator
            .clone()
            .spawn_periodic(Duration::from_millis(20), cancel.clone());

        harness
            .store
            .set_platform_key(platform_override_key(SCENARIO), "bailian");
        assert!(eventually(|| harness.snapshots.version() == 2).await);
        assert_eq!(harness.selected_coze().platform, Platform::Bailian);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_key_that_creates_a_selection_is_published() {
        let harness = Harness::new().await;
        harness.store.update(|contents| {
            contents.platform_keys.remove(DEFAULT_KEY);
        });
        let summary = assert_ok!(harness.coordinator.reload().await);
        assert_eq!(summary.new_version, 2);
        assert_eq!(summary.changed_providers, 1);

        let err = harness
            .engine
            .dispatch(DispatchRequest::new(SCENARIO, career_bag()), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigNotFound);

        // Restoring the key alone must route again
        harness.store.set_platform_key(DEFAULT_KEY, "coze");
        let summary = assert_ok!(harness.coordinator.reload().await);
        assert!(summary.published());
        assert_eq!(summary.new_version, 3);
        assert_eq!(summary.changed_providers, 1);
        let outcome = assert_ok!(
            harness
                .engine
                .dispatch(DispatchRequest::new(SCENARIO, career_bag()), CancellationToken::new())
                .await
        );
        assert_eq!(outcome.provider().platform, Platform::Coze);
    }

    #[tokio::test]
    async fn test_scenario_key_alone_creates_a_selection() {
        let harness = Harness::new().await;
        harness.store.update(|contents| {
            contents.platform_keys.remove(DEFAULT_KEY);
        });
        assert_ok!(harness.coordinator.reload().await);
        assert!(harness.snapshots.load().providers().select(SCENARIO, ENVIRONMENT).is_err());

        harness
            .store
            .set_platform_key(platform_override_key(SCENARIO), "bailian");
        let summary = assert_ok!(harness.coordinator.reload().await);
        assert!(summary.published());
        assert_eq!(harness.selected_coze().platform, Platform::Bailian);
    }

    #[tokio::test]
    async fn test_default_key_move_updates_fallback() {
        let harness = Harness::new().await;
        harness
            .store
            .set_platform_key(platform_override_key(SCENARIO), "coze");
        // Same routing as before, nothing to publish
        let summary = assert_ok!(harness.coordinator.reload().await);
        assert!(!summary.published());

        harness.store.set_platform_key(DEFAULT_KEY, "bailian");
        let summary = assert_ok!(harness.coordinator.reload().await);
        assert!(summary.published());
        assert_eq!(summary.changed_providers, 1);

        let snapshot = harness.snapshots.load();
        assert_eq!(snapshot.providers().select(SCENARIO, ENVIRONMENT).unwrap().platform, Platform::Coze);
        assert_eq!(
            snapshot.providers().selection(SCENARIO, ENVIRONMENT).unwrap().default.clone().unwrap().platform,
            Platform::Bailian
        );
    }
}
