//! Shared fixtures: scripted provider clients and a fully wired engine

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::dispatch::{Dispatcher, DEFAULT_STREAM_BUFFER};
use crate::engine::ScenarioEngine;
use crate::error::{DispatchError, Result};
use crate::format::{FormatDefinition, ResultBag};
use crate::provider::{
    ChunkStream, MemoryCredentialStore, Platform, ProviderClient, ProviderConfig, ProviderRequest,
};
use crate::reload::ReloadCoordinator;
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, Resilience, RetryConfig};
use crate::snapshot::SnapshotStore;
use crate::store::{MemoryConfigStore, StoreContents};

pub const SCENARIO: &str = "career_wealth_analysis";
pub const ENVIRONMENT: &str = "production";
pub const DEFAULT_KEY: &str = "DEFAULT_PLATFORM";

/// One scripted provider behaviour
#[derive(Debug, Clone)]
pub enum Step {
    Respond(Value),
    /// Respond after a delay
    Delayed(Duration, Value),
    Transient(&'static str),
    Permanent(&'static str),
    /// Never completes
    Hang,
    /// Stream these chunks, then end
    Chunks(Vec<&'static str>),
    /// Stream these chunks, then fail transiently
    ChunksThenError(Vec<&'static str>),
    /// Stream these chunks, then stall forever
    ChunksThenHang(Vec<&'static str>),
}

/// In-process provider whose behaviour is scripted per call
#[derive(Debug)]
pub struct ScriptedClient {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicU32,
    payloads: Mutex<Vec<Value>>,
    upstream_closed: Arc<AtomicBool>,
}

impl ScriptedClient {
    /// Client that repeats `fallback` once the script runs out
    pub fn new(fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU32::new(0),
            payloads: Mutex::new(Vec::new()),
            upstream_closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(Step::Respond(json!({"answer": "ok"})))
    }

    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.steps.lock().extend(steps);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().clone()
    }

    /// Whether the last stream handed out has been dropped
    pub fn upstream_closed(&self) -> bool {
        self.upstream_closed.load(Ordering::SeqCst)
    }

    fn next_step(&self, request: &ProviderRequest) -> Step {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().push(request.payload.clone());
        self.steps.lock().pop_front().unwrap_or_else(|| self.fallback.clone())
    }

    fn track(&self, inner: ChunkStream) -> ChunkStream {
        let flag = Arc::clone(&self.upstream_closed);
        flag.store(false, Ordering::SeqCst);
        let guard = CloseFlag(flag);
        stream::unfold((inner, guard), |(mut inner, guard)| async move {
            let item = inner.next().await?;
            Some((item, (inner, guard)))
        })
        .boxed()
    }
}

struct CloseFlag(Arc<AtomicBool>);

impl Drop for CloseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn chunk_stream(chunks: &[&'static str]) -> ChunkStream {
    let items: Vec<Result<String>> = chunks.iter().map(|c| Ok(c.to_string())).collect();
    stream::iter(items).boxed()
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn invoke(&self, request: &ProviderRequest) -> Result<Value> {
        match self.next_step(request) {
            Step::Respond(value) => Ok(value),
            Step::Delayed(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Step::Transient(message) => Err(DispatchError::transient(message)),
            Step::Permanent(message) => Err(DispatchError::permanent(message)),
            Step::Hang => futures::future::pending().await,
            Step::Chunks(chunks) | Step::ChunksThenError(chunks) | Step::ChunksThenHang(chunks) => {
                Ok(Value::String(chunks.concat()))
            }
        }
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<ChunkStream> {
        let upstream = match self.next_step(request) {
            Step::Respond(value) => stream::once(async move { Ok(value.to_string()) }).boxed(),
            Step::Delayed(delay, value) => {
                tokio::time::sleep(delay).await;
                stream::once(async move { Ok(value.to_string()) }).boxed()
            }
            Step::Transient(message) => return Err(DispatchError::transient(message)),
            Step::Permanent(message) => return Err(DispatchError::permanent(message)),
            Step::Hang => futures::future::pending().await,
            Step::Chunks(chunks) => chunk_stream(&chunks),
            Step::ChunksThenError(chunks) => chunk_stream(&chunks)
                .chain(stream::once(async { Err(DispatchError::transient("connection reset")) }))
                .boxed(),
            Step::ChunksThenHang(chunks) => chunk_stream(&chunks).chain(stream::pending()).boxed(),
        };
        Ok(self.track(upstream))
    }
}

pub fn career_format(version: u64) -> FormatDefinition {
    serde_json::from_value(json!({
        "name": SCENARIO,
        "version": version,
        "structure": {
            "mingpan_shiye_caifu_zonglun": {
                "type": "result",
                "data_source": "bazi_data",
                "fields": ["bazi_pillars", "ten_gods"]
            },
            "tiyun_jianyi": {
                "type": "result",
                "data_source": "wangshuai_result",
                "optional": true
            }
        }
    }))
    .unwrap()
}

pub fn career_bag() -> ResultBag {
    ResultBag::new()
        .with(
            "bazi_data",
            json!({
                "bazi_pillars": {"year": "甲子", "month": "丙寅", "day": "戊辰", "hour": "庚申"},
                "ten_gods": ["正财", "七杀"],
                "day_master": "戊"
            }),
        )
        .with("detail_result", json!({"summary": "stable career"}))
}

pub fn provider_row(platform: Platform, endpoint: &str, version: u64) -> ProviderConfig {
    ProviderConfig {
        scenario: SCENARIO.to_string(),
        platform,
        credential_ref: format!("{}_TOKEN", platform.as_str().to_uppercase()),
        endpoint_id: endpoint.to_string(),
        environment: ENVIRONMENT.to_string(),
        active: true,
        version,
        base_url: "http://provider.invalid".to_string(),
        supports_streaming: true,
    }
}

pub fn store_contents() -> StoreContents {
    StoreContents {
        formats: vec![career_format(1)],
        providers: vec![
            provider_row(Platform::Coze, "bot-1", 1),
            provider_row(Platform::Bailian, "app-1", 1),
        ],
        platform_keys: [(DEFAULT_KEY.to_string(), "coze".to_string())].into_iter().collect(),
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(5),
        multiplier: 2.0,
        randomization_factor: 0.0,
    }
}

pub fn breaker_config(failure_threshold: u32, cooldown: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        cooldown,
        success_threshold: 3,
        half_open_max_calls: 1,
    }
}

/// Engine wired to scripted Coze and Bailian clients and an in-memory store
pub struct Harness {
    pub store: MemoryConfigStore,
    pub snapshots: SnapshotStore,
    pub coordinator: Arc<ReloadCoordinator>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub coze: Arc<ScriptedClient>,
    pub bailian: Arc<ScriptedClient>,
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<ScenarioEngine>,
}

pub struct HarnessOptions {
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub fallback_on_open: bool,
    pub stream_buffer: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            retry: fast_retry(3),
            breaker: breaker_config(5, Duration::from_secs(60)),
            fallback_on_open: false,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    /// Build the harness and perform the initial load
    pub async fn with_options(options: HarnessOptions) -> Self {
        let store = MemoryConfigStore::new(store_contents());
        let snapshots = SnapshotStore::new();
        let coordinator = Arc::new(ReloadCoordinator::new(
            Arc::new(store.clone()),
            snapshots.clone(),
            DEFAULT_KEY,
        ));
        coordinator.reload().await.unwrap();

        let breakers = Arc::new(CircuitBreakerRegistry::new(options.breaker));
        let credentials = Arc::new(
            MemoryCredentialStore::new()
                .with("COZE_TOKEN", "pat-coze")
                .with("BAILIAN_TOKEN", "sk-bailian"),
        );
        let coze = ScriptedClient::ok();
        let bailian = ScriptedClient::ok();

        let dispatcher = Arc::new(
            Dispatcher::new(
                Resilience::new(options.retry, Arc::clone(&breakers)),
                credentials.clone(),
            )
            .with_client(Platform::Coze, coze.clone())
            .with_client(Platform::Bailian, bailian.clone())
            .with_stream_buffer(options.stream_buffer),
        );
        let engine = Arc::new(
            ScenarioEngine::new(snapshots.clone(), Arc::clone(&dispatcher), ENVIRONMENT)
                .with_fallback_on_open(options.fallback_on_open),
        );

        Self {
            store,
            snapshots,
            coordinator,
            breakers,
            credentials,
            coze,
            bailian,
            dispatcher,
            engine,
        }
    }

    pub fn selected_coze(&self) -> Arc<ProviderConfig> {
        self.snapshots.load().providers().select(SCENARIO, ENVIRONMENT).unwrap()
    }
}

/// Poll `condition` for up to a second
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
