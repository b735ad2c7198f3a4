//! scenario-dispatchd: serves the dispatch engine and its control endpoint

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scenario_dispatch::config::{EngineConfig, EnvConfigProvider, ENV_PREFIX};
use scenario_dispatch::control::{self, ControlState};
use scenario_dispatch::logging::init_tracing;
use scenario_dispatch::provider::{EnvCredentialStore, HttpProviderClient, Platform, ProviderClient};
use scenario_dispatch::{
    CircuitBreakerRegistry, ConfigStore, Dispatcher, JsonFileConfigStore, MemoryConfigStore,
    ReloadCoordinator, Resilience, ScenarioEngine, SnapshotStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let provider = EnvConfigProvider::new().with_prefix(ENV_PREFIX);
    let config = EngineConfig::from_provider(&provider).context("invalid engine configuration")?;
    init_tracing(&config.logging).context("failed to initialize logging")?;

    let store: Arc<dyn ConfigStore> = match &config.store_path {
        Some(path) => Arc::new(JsonFileConfigStore::new(path)),
        None => {
            warn!("No config store path set, starting with an empty in-memory store");
            Arc::new(MemoryConfigStore::default())
        }
    };

    let snapshots = SnapshotStore::new();
    let coordinator = Arc::new(ReloadCoordinator::new(
        store,
        snapshots.clone(),
        config.default_platform_key.clone(),
    ));
    match coordinator.reload().await {
        Ok(summary) => info!(version = summary.new_version, "Initial configuration loaded"),
        // Serve health as "starting" until an operator reload succeeds
        Err(e) => warn!(error = %e, "Initial configuration load failed"),
    }

    let shutdown = CancellationToken::new();
    let reload_task = (!config.reload_interval.is_zero()).then(|| {
        Arc::clone(&coordinator).spawn_periodic(config.reload_interval, shutdown.child_token())
    });

    let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
    let resilience = Resilience::new(config.retry.clone(), Arc::clone(&breakers));
    let http_client: Arc<dyn ProviderClient> = Arc::new(HttpProviderClient::new(config.upstream_timeout)?);

    let dispatcher = Platform::ALL.into_iter().fold(
        Dispatcher::new(resilience, Arc::new(EnvCredentialStore::new())),
        |dispatcher, platform| dispatcher.with_client(platform, Arc::clone(&http_client)),
    );

    let engine = ScenarioEngine::new(snapshots.clone(), Arc::new(dispatcher), config.environment.clone())
        .with_fallback_on_open(config.fallback_on_open);

    let app = control::router(ControlState {
        reload: coordinator,
        snapshots,
        breakers,
        engine: Arc::new(engine),
    });

    let listener = tokio::net::TcpListener::bind(&config.control_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.control_addr))?;
    info!(addr = %config.control_addr, environment = %config.environment, "Control endpoint listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            signal.cancel();
        })
        .await
        .context("control endpoint failed")?;

    shutdown.cancel();
    if let Some(task) = reload_task {
        let _ = task.await;
    }
    info!("Shutdown complete");
    Ok(())
}
