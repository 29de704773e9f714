//! Shared fixtures for the V8-backed integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fathom_config::{ChainMode, RuntimeSection};
use fathom_runtime::{
    FetchRequest, FetchResponse, Fetcher, GuestLogLevel, GuestLogRecord, GuestLogger, HostBridge,
    InMemoryKvStore, SandboxManager,
};
use fathom_types::{FunctionConfig, PipelineBundle, PipelineSpec, ProfileUser, Timestamp};
use parking_lot::Mutex;
use serde_json::{Value, json};

pub const WORKSPACE: &str = "ws1";

pub fn updated_at() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn function(id: &str, code: &str, code_hash: &str) -> FunctionConfig {
    FunctionConfig::new(id, format!("fn {id}"), code, code_hash, WORKSPACE)
}

pub fn bundle(pipeline_id: &str, functions: Vec<FunctionConfig>) -> PipelineBundle {
    let refs = functions.iter().map(|f| f.id.clone()).collect();
    PipelineBundle::new(
        PipelineSpec::new(pipeline_id, WORKSPACE, 1, refs, updated_at()),
        functions,
    )
}

/// Runtime limits tuned for tests.
pub fn section() -> RuntimeSection {
    RuntimeSection {
        invoke_timeout_ms: 2000,
        compile_timeout_ms: 10_000,
        cache_ttl_secs: 600,
        sweep_interval_secs: 30,
        grace_period_ms: 50,
        max_heap_mb: 64,
        chain_mode: ChainMode::First,
    }
}

/// Bridge with a capturing logger, a canned fetcher and a fresh store.
pub fn bridge() -> (HostBridge, Arc<CapturingLogger>, Arc<MockFetcher>) {
    let logger = Arc::new(CapturingLogger::default());
    let fetcher = Arc::new(MockFetcher::default());
    let bridge = HostBridge::from_config(&Default::default())
        .unwrap()
        .with_logger(logger.clone())
        .with_fetcher(fetcher.clone())
        .with_store(Arc::new(InMemoryKvStore::new()));
    (bridge, logger, fetcher)
}

pub fn manager_with(section: RuntimeSection) -> Arc<SandboxManager> {
    let (bridge, _, _) = bridge();
    Arc::new(SandboxManager::new(&section, bridge))
}

pub fn manager() -> Arc<SandboxManager> {
    manager_with(section())
}

pub fn user() -> ProfileUser {
    ProfileUser::new("u1").with_trait("plan", json!("pro"))
}

pub fn events(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| json!({"type": "track", "event": format!("e{}", i + 1)}))
        .collect()
}

pub const COUNT_EVENTS: &str =
    "export default (ctx, events, user) => ({ properties: { count: events.length } });";

/// Waits for tasks spawned with a delay, such as superseded disposals.
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLog {
    pub level: GuestLogLevel,
    pub message: String,
    pub pipeline_id: String,
}

#[derive(Default)]
pub struct CapturingLogger {
    records: Mutex<Vec<CapturedLog>>,
}

impl CapturingLogger {
    pub fn records(&self) -> Vec<CapturedLog> {
        self.records.lock().clone()
    }
}

impl GuestLogger for CapturingLogger {
    fn log(&self, record: &GuestLogRecord<'_>) {
        self.records.lock().push(CapturedLog {
            level: record.level,
            message: record.message.to_string(),
            pipeline_id: record.pipeline_id.to_string(),
        });
    }
}

/// Answers every request with a JSON echo of what it received.
#[derive(Default)]
pub struct MockFetcher {
    requests: Mutex<Vec<(String, FetchRequest)>>,
}

impl MockFetcher {
    pub fn requests(&self) -> Vec<(String, FetchRequest)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str, request: FetchRequest) -> anyhow::Result<FetchResponse> {
        if url.contains("unreachable") {
            anyhow::bail!("connection refused");
        }
        self.requests.lock().push((url.to_string(), request.clone()));
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Ok(FetchResponse {
            status: 200,
            ok: true,
            headers,
            body: json!({"url": url, "method": request.method, "body": request.body}).to_string(),
        })
    }
}
