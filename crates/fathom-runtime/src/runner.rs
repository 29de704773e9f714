//! Profile Builder Runner: the per-pipeline shell around the sandbox cache.
//!
//! A [`ProfileBuilderRunner`] owns one resolved pipeline, feeds user batches
//! through [`SandboxManager::invoke`], and tracks progress for checkpoints.
//! [`RunnerRegistry`] keeps one runner per pipeline in step with a pull-based
//! [`ConfigSource`], rebuilding a runner whenever its pipeline's version,
//! `updated_at` or any referenced code hash changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fathom_config::StateSection;
use fathom_types::{
    Event, FunctionConfig, InvocationContext, PipelineBundle, PipelineSpec, ProfileResult,
    ProfileUser, StateKey, StateRecord, Timestamp,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::hash::content_hash;
use crate::manager::SandboxManager;

// ─────────────────────────────────────────────────────────────────────────────
// Collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Destination for progress checkpoints. Upserts are keyed by
/// [`StateRecord::key`] and must be idempotent.
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn upsert(&self, record: StateRecord) -> anyhow::Result<()>;
}

/// Checkpoints kept in memory, one per [`StateKey`].
#[derive(Debug, Default)]
pub struct InMemoryStateSink {
    records: Mutex<BTreeMap<StateKey, StateRecord>>,
}

impl InMemoryStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &StateKey) -> Option<StateRecord> {
        self.records.lock().get(key).cloned()
    }

    pub fn records(&self) -> Vec<StateRecord> {
        self.records.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl StateSink for InMemoryStateSink {
    async fn upsert(&self, record: StateRecord) -> anyhow::Result<()> {
        self.records.lock().insert(record.key(), record);
        Ok(())
    }
}

/// Everything the configuration store currently holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSnapshot {
    pub functions: Vec<FunctionConfig>,
    pub pipelines: Vec<PipelineSpec>,
}

/// Pull-based source of functions and pipelines.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<ConfigSnapshot>;
}

/// A [`ConfigSource`] backed by an editable in-memory snapshot.
#[derive(Debug, Default)]
pub struct InMemoryConfigSource {
    snapshot: Mutex<ConfigSnapshot>,
}

impl InMemoryConfigSource {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn replace(&self, snapshot: ConfigSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    /// Insert or replace a function by id.
    pub fn upsert_function(&self, function: FunctionConfig) {
        let mut snapshot = self.snapshot.lock();
        snapshot.functions.retain(|f| f.id != function.id);
        snapshot.functions.push(function);
    }

    /// Insert or replace a pipeline by id.
    pub fn upsert_pipeline(&self, pipeline: PipelineSpec) {
        let mut snapshot = self.snapshot.lock();
        snapshot.pipelines.retain(|p| p.id != pipeline.id);
        snapshot.pipelines.push(pipeline);
    }

    pub fn remove_pipeline(&self, pipeline_id: &str) {
        self.snapshot.lock().pipelines.retain(|p| p.id != pipeline_id);
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn snapshot(&self) -> anyhow::Result<ConfigSnapshot> {
        Ok(self.snapshot.lock().clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Progress {
    started_at: Timestamp,
    last_processed_timestamp: Option<Timestamp>,
    processed_count: u64,
    error_count: u64,
    total_count: u64,
}

impl Progress {
    fn new() -> Self {
        Self {
            started_at: fathom_types::now(),
            last_processed_timestamp: None,
            processed_count: 0,
            error_count: 0,
            total_count: 0,
        }
    }
}

/// Runs one pipeline for one runtime instance.
pub struct ProfileBuilderRunner {
    bundle: PipelineBundle,
    content_hash: String,
    manager: Arc<SandboxManager>,
    instance_index: u32,
    total_instances: u32,
    progress: Mutex<Progress>,
}

impl ProfileBuilderRunner {
    pub fn new(bundle: PipelineBundle, manager: Arc<SandboxManager>, state: &StateSection) -> Self {
        Self {
            content_hash: content_hash(&bundle),
            bundle,
            manager,
            instance_index: state.instance_index,
            total_instances: state.total_instances,
            progress: Mutex::new(Progress::new()),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        self.bundle.id()
    }

    pub fn version(&self) -> u64 {
        self.bundle.spec.version
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn bundle(&self) -> &PipelineBundle {
        &self.bundle
    }

    fn context(&self) -> InvocationContext {
        InvocationContext::new()
            .with_debug_until(self.bundle.spec.debug_until)
            .with_property("pipelineId", json!(self.bundle.spec.id))
            .with_property("workspaceId", json!(self.bundle.spec.workspace_id))
    }

    /// Run one user's batch of events through the pipeline.
    ///
    /// Failures are counted and returned; the caller decides whether the
    /// batch is retried or dropped.
    pub async fn process(
        &self,
        user: &ProfileUser,
        events: &[Event],
    ) -> Result<Option<ProfileResult>> {
        let outcome = self
            .manager
            .invoke(&self.bundle, &self.context(), events, user)
            .await;

        let count = events.len() as u64;
        let mut progress = self.progress.lock();
        progress.total_count += count;
        match &outcome {
            Ok(_) => {
                progress.processed_count += count;
                let latest = events
                    .iter()
                    .filter_map(event_timestamp)
                    .max()
                    .unwrap_or_else(fathom_types::now);
                progress.last_processed_timestamp = Some(
                    progress
                        .last_processed_timestamp
                        .map_or(latest, |previous| previous.max(latest)),
                );
            }
            Err(err) => {
                progress.error_count += count;
                warn!(
                    pipeline_id = %self.pipeline_id(),
                    events = count,
                    droppable = err.is_droppable(),
                    error = %err,
                    "batch failed"
                );
            }
        }
        outcome
    }

    /// Current progress as a checkpoint record.
    pub fn record(&self) -> StateRecord {
        let progress = self.progress.lock().clone();
        let updated_at = fathom_types::now();
        let elapsed = (updated_at - progress.started_at).num_milliseconds() as f64 / 1000.0;
        let throughput = if elapsed > 0.0 {
            progress.processed_count as f64 / elapsed
        } else {
            0.0
        };
        StateRecord {
            pipeline_id: self.bundle.spec.id.clone(),
            pipeline_version: self.bundle.spec.version,
            instance_index: self.instance_index,
            total_instances: self.total_instances,
            started_at: progress.started_at,
            updated_at,
            last_processed_timestamp: progress.last_processed_timestamp,
            processed_count: progress.processed_count,
            error_count: progress.error_count,
            total_count: progress.total_count,
            throughput,
        }
    }

    /// Write the current progress to `sink`.
    pub async fn checkpoint(&self, sink: &dyn StateSink) -> Result<StateRecord> {
        let record = self.record();
        sink.upsert(record.clone())
            .await
            .map_err(|e| RuntimeError::External(format!("state sink: {e}")))?;
        debug!(
            pipeline_id = %record.pipeline_id,
            processed = record.processed_count,
            errors = record.error_count,
            "checkpoint written"
        );
        Ok(record)
    }

    /// Continue counting from `previous` when the pipeline version is unchanged.
    fn inherit_progress(&self, previous: &ProfileBuilderRunner) {
        if previous.version() == self.version() {
            *self.progress.lock() = previous.progress.lock().clone();
        }
    }
}

impl std::fmt::Debug for ProfileBuilderRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileBuilderRunner")
            .field("pipeline_id", &self.bundle.spec.id)
            .field("version", &self.bundle.spec.version)
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// `timestamp`, else `originalTimestamp`, as RFC 3339.
fn event_timestamp(event: &Event) -> Option<Timestamp> {
    ["timestamp", "originalTimestamp"].iter().find_map(|field| {
        let raw = event.get(*field)?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// What a reconcile pass did to one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    Started { pipeline_id: String, version: u64 },
    Rebuilt { pipeline_id: String, version: u64 },
    Removed { pipeline_id: String },
    /// The pipeline could not be resolved; any existing runner is kept.
    Skipped { pipeline_id: String, reason: String },
}

/// One runner per pipeline, kept in step with a [`ConfigSource`].
pub struct RunnerRegistry {
    manager: Arc<SandboxManager>,
    state: StateSection,
    runners: RwLock<HashMap<String, Arc<ProfileBuilderRunner>>>,
}

impl RunnerRegistry {
    pub fn new(manager: Arc<SandboxManager>, state: StateSection) -> Self {
        Self {
            manager,
            state,
            runners: RwLock::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    pub async fn get(&self, pipeline_id: &str) -> Option<Arc<ProfileBuilderRunner>> {
        self.runners.read().await.get(pipeline_id).cloned()
    }

    pub async fn pipeline_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runners.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.runners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runners.read().await.is_empty()
    }

    /// Pull a snapshot from `source` and start, rebuild or remove runners.
    pub async fn reconcile(&self, source: &dyn ConfigSource) -> Result<Vec<RunnerEvent>> {
        let snapshot = source
            .snapshot()
            .await
            .map_err(|e| RuntimeError::External(format!("config source: {e}")))?;
        let functions: HashMap<String, FunctionConfig> = snapshot
            .functions
            .into_iter()
            .map(|f| (f.id.clone(), f))
            .collect();

        let mut events = Vec::new();
        let mut removed = Vec::new();
        {
            let mut runners = self.runners.write().await;
            let mut seen = HashSet::with_capacity(snapshot.pipelines.len());

            for spec in snapshot.pipelines {
                let pipeline_id = spec.id.clone();
                seen.insert(pipeline_id.clone());

                let bundle = match resolve(spec, &functions) {
                    Ok(bundle) => bundle,
                    Err(reason) => {
                        warn!(pipeline_id = %pipeline_id, reason = %reason, "skipping pipeline");
                        events.push(RunnerEvent::Skipped {
                            pipeline_id,
                            reason,
                        });
                        continue;
                    }
                };

                let existing = runners.get(&pipeline_id).cloned();
                if let Some(current) = &existing {
                    if current.content_hash() == content_hash(&bundle) {
                        continue;
                    }
                }

                let version = bundle.spec.version;
                let runner = ProfileBuilderRunner::new(bundle, self.manager.clone(), &self.state);
                match existing {
                    Some(previous) => {
                        runner.inherit_progress(&previous);
                        info!(pipeline_id = %pipeline_id, version, "runner rebuilt");
                        events.push(RunnerEvent::Rebuilt {
                            pipeline_id: pipeline_id.clone(),
                            version,
                        });
                    }
                    None => {
                        info!(pipeline_id = %pipeline_id, version, "runner started");
                        events.push(RunnerEvent::Started {
                            pipeline_id: pipeline_id.clone(),
                            version,
                        });
                    }
                }
                runners.insert(pipeline_id, Arc::new(runner));
            }

            runners.retain(|id, _| {
                let keep = seen.contains(id);
                if !keep {
                    removed.push(id.clone());
                }
                keep
            });
        }

        removed.sort();
        for pipeline_id in removed {
            self.manager.evict(&pipeline_id).await;
            info!(pipeline_id = %pipeline_id, "runner removed");
            events.push(RunnerEvent::Removed { pipeline_id });
        }
        Ok(events)
    }

    /// Checkpoint every runner. Returns how many records were written.
    pub async fn checkpoint_all(&self, sink: &dyn StateSink) -> Result<usize> {
        let runners: Vec<Arc<ProfileBuilderRunner>> =
            self.runners.read().await.values().cloned().collect();
        for runner in &runners {
            runner.checkpoint(sink).await?;
        }
        Ok(runners.len())
    }

    /// Reconcile against `source` immediately and then every `interval`,
    /// until the registry is dropped.
    pub fn spawn_poller(
        self: &Arc<Self>,
        source: Arc<dyn ConfigSource>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if let Err(e) = registry.reconcile(source.as_ref()).await {
                    warn!(error = %e, "config poll failed");
                }
            }
        })
    }

    /// Checkpoint every runner every `interval`, until the registry is dropped.
    pub fn spawn_checkpointer(
        self: &Arc<Self>,
        sink: Arc<dyn StateSink>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if let Err(e) = registry.checkpoint_all(sink.as_ref()).await {
                    warn!(error = %e, "checkpoint failed");
                }
            }
        })
    }
}

/// Resolve a pipeline's functions, keeping tenants apart.
fn resolve(
    spec: PipelineSpec,
    functions: &HashMap<String, FunctionConfig>,
) -> std::result::Result<PipelineBundle, String> {
    let bundle = PipelineBundle::resolve(spec, functions)
        .map_err(|missing| format!("unknown function {missing}"))?;
    if let Some(foreign) = bundle
        .functions
        .iter()
        .find(|f| f.workspace_id != bundle.spec.workspace_id)
    {
        return Err(format!(
            "function {} belongs to workspace {}",
            foreign.id, foreign.workspace_id
        ));
    }
    Ok(bundle)
}
