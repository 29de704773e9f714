//! Sandbox Lifecycle Manager: the per-pipeline sandbox cache.
//!
//! One slot per pipeline id. Each slot is serialized by an async mutex, so
//! hash-change detection, recompilation and supersession for one pipeline
//! never interleave, while different pipelines proceed independently.
//!
//! ```text
//!   Empty ──compile ok──► Ready ──hash change──► Ready(new) + old Superseded
//!     │                     │                        (disposed after grace)
//!     └──compile err──► Broken(hash, error)
//!                           │ same hash: replay error, no recompile
//!                           └ new hash: compile again
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fathom_config::{FathomConfig, RuntimeSection};
use fathom_types::{Event, InvocationContext, PipelineBundle, ProfileResult, ProfileUser};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::bridge::HostBridge;
use crate::error::{CompileError, DisposeReason, Result, RuntimeError};
use crate::hash::content_hash;
use crate::sandbox::{Sandbox, SandboxOptions};
use crate::ttl::ExpiryTracker;

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Successful compilations.
    pub compiles: u64,
    pub compile_failures: u64,
    pub cache_hits: u64,
    /// Calls retried against a healed sandbox.
    pub retries: u64,
    pub disposals: u64,
    /// Ready sandboxes that are not disposed.
    pub live: usize,
}

#[derive(Default)]
struct Counters {
    compiles: AtomicU64,
    compile_failures: AtomicU64,
    cache_hits: AtomicU64,
    retries: AtomicU64,
    disposals: Arc<AtomicU64>,
}

enum Current {
    Empty,
    Ready(Arc<Sandbox>),
    Broken {
        content_hash: String,
        error: CompileError,
    },
}

struct SlotState {
    current: Current,
    /// Removed from the slot map; lockers must fetch a fresh slot.
    forgotten: bool,
}

struct Slot {
    state: tokio::sync::Mutex<SlotState>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(SlotState {
                current: Current::Empty,
                forgotten: false,
            }),
        }
    }
}

/// Owns at most one live sandbox per pipeline.
pub struct SandboxManager {
    options: SandboxOptions,
    grace_period: Duration,
    bridge: HostBridge,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    expiry: Mutex<ExpiryTracker>,
    counters: Counters,
    /// Manager-wide, so a pipeline evicted and added back keeps counting up.
    last_generation: AtomicU64,
}

impl SandboxManager {
    /// `cache_ttl_secs = 0` disables expiry.
    pub fn new(section: &RuntimeSection, bridge: HostBridge) -> Self {
        let ttl = (section.cache_ttl_secs > 0).then(|| section.cache_ttl());
        Self {
            options: SandboxOptions::from(section),
            grace_period: section.grace_period(),
            bridge,
            slots: Mutex::new(HashMap::new()),
            expiry: Mutex::new(ExpiryTracker::new(ttl)),
            counters: Counters::default(),
            last_generation: AtomicU64::new(0),
        }
    }

    /// Manager with the default host services for `config`.
    pub fn from_config(config: &FathomConfig) -> Result<Self> {
        let bridge = HostBridge::from_config(&config.bridge())?;
        Ok(Self::new(&config.runtime(), bridge))
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    pub fn bridge(&self) -> &HostBridge {
        &self.bridge
    }

    fn slot(&self, pipeline_id: &str) -> Arc<Slot> {
        self.slots
            .lock()
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    fn existing_slot(&self, pipeline_id: &str) -> Option<Arc<Slot>> {
        self.slots.lock().get(pipeline_id).cloned()
    }

    /// Drop `slot` from the map. Callers hold its lock.
    fn forget_slot(&self, pipeline_id: &str, slot: &Arc<Slot>, state: &mut SlotState) {
        state.forgotten = true;
        let mut slots = self.slots.lock();
        if slots.get(pipeline_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(pipeline_id);
        }
    }

    /// The current sandbox for `bundle`, compiling it if needed.
    ///
    /// Reuses the cached sandbox when its content hash matches and it is
    /// healthy and unexpired. A hash change supersedes the cached sandbox: it
    /// is disposed once the grace period has passed, and the new sandbox
    /// serves all calls from now on. A pipeline that failed to compile keeps
    /// returning the same error until its content hash changes.
    pub async fn sandbox(&self, bundle: &PipelineBundle) -> Result<Arc<Sandbox>> {
        let hash = content_hash(bundle);
        loop {
            let slot = self.slot(bundle.id());
            let mut state = slot.state.lock().await;
            if state.forgotten {
                continue;
            }
            return self.sandbox_in_slot(bundle, hash, &mut state).await;
        }
    }

    async fn sandbox_in_slot(
        &self,
        bundle: &PipelineBundle,
        hash: String,
        state: &mut SlotState,
    ) -> Result<Arc<Sandbox>> {
        let pipeline_id = bundle.id();
        let expired = self.expiry.lock().is_expired(pipeline_id);

        match std::mem::replace(&mut state.current, Current::Empty) {
            Current::Ready(sandbox) if sandbox.is_disposed() => {
                debug!(
                    pipeline_id = %pipeline_id,
                    generation = sandbox.generation(),
                    reason = ?sandbox.dispose_reason(),
                    "replacing disposed sandbox"
                );
            }
            Current::Ready(sandbox) if expired => {
                sandbox.dispose(DisposeReason::Expired);
            }
            Current::Ready(sandbox) if sandbox.content_hash() == hash => {
                trace!(pipeline_id = %pipeline_id, "sandbox cache hit");
                self.expiry.lock().touch(pipeline_id);
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                state.current = Current::Ready(sandbox.clone());
                return Ok(sandbox);
            }
            Current::Ready(sandbox) => {
                info!(
                    pipeline_id = %pipeline_id,
                    generation = sandbox.generation(),
                    "pipeline changed, superseding sandbox"
                );
                self.retire(sandbox);
            }
            Current::Broken {
                content_hash: broken_hash,
                error,
            } if broken_hash == hash => {
                state.current = Current::Broken {
                    content_hash: broken_hash,
                    error: error.clone(),
                };
                return Err(error.into());
            }
            Current::Broken { .. } | Current::Empty => {}
        }

        let generation = self.last_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let compiled = Sandbox::compile(
            bundle,
            hash.clone(),
            generation,
            &self.options,
            &self.bridge,
            self.counters.disposals.clone(),
        )
        .await;

        match compiled {
            Ok(sandbox) => {
                self.counters.compiles.fetch_add(1, Ordering::Relaxed);
                let sandbox = Arc::new(sandbox);
                state.current = Current::Ready(sandbox.clone());
                self.expiry.lock().touch(pipeline_id);
                Ok(sandbox)
            }
            Err(RuntimeError::Compile(compile_error)) => {
                self.counters.compile_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    pipeline_id = %pipeline_id,
                    generation,
                    function_id = compile_error.function_id.as_deref().unwrap_or(""),
                    error = %compile_error,
                    "pipeline failed to compile"
                );
                state.current = Current::Broken {
                    content_hash: hash,
                    error: compile_error.clone(),
                };
                self.expiry.lock().remove(pipeline_id);
                Err(compile_error.into())
            }
            Err(other) => {
                error!(pipeline_id = %pipeline_id, error = %other, "sandbox startup failed");
                Err(other)
            }
        }
    }

    /// Dispose a superseded sandbox after the grace period.
    fn retire(&self, sandbox: Arc<Sandbox>) {
        if self.grace_period.is_zero() {
            sandbox.dispose(DisposeReason::Superseded);
            return;
        }
        let grace = self.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            sandbox.dispose(DisposeReason::Superseded);
        });
    }

    /// Invoke `bundle`'s chain.
    ///
    /// A call that fails because its sandbox was disposed for some other
    /// reason is retried once, but only if a newer healthy sandbox for the
    /// same content is already in place. Timeouts are never retried.
    pub async fn invoke(
        &self,
        bundle: &PipelineBundle,
        context: &InvocationContext,
        events: &[Event],
        user: &ProfileUser,
    ) -> Result<Option<ProfileResult>> {
        let sandbox = self.sandbox(bundle).await?;
        match sandbox.invoke(context, events, user).await {
            Err(RuntimeError::Disposed { reason }) => match self.healed(&sandbox).await {
                Some(healed) => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    info!(
                        pipeline_id = %bundle.id(),
                        failed_generation = sandbox.generation(),
                        generation = healed.generation(),
                        reason = %reason,
                        "retrying on healed sandbox"
                    );
                    healed.invoke(context, events, user).await
                }
                None => Err(RuntimeError::Disposed { reason }),
            },
            other => other,
        }
    }

    async fn healed(&self, failed: &Sandbox) -> Option<Arc<Sandbox>> {
        let slot = self.existing_slot(failed.pipeline_id())?;
        let state = slot.state.lock().await;
        match &state.current {
            Current::Ready(sandbox)
                if sandbox.generation() != failed.generation()
                    && sandbox.content_hash() == failed.content_hash()
                    && !sandbox.is_disposed() =>
            {
                Some(sandbox.clone())
            }
            _ => None,
        }
    }

    /// Generation of the current sandbox for `pipeline_id`, if one is cached.
    pub async fn generation(&self, pipeline_id: &str) -> Option<u64> {
        let slot = self.existing_slot(pipeline_id)?;
        let state = slot.state.lock().await;
        match &state.current {
            Current::Ready(sandbox) => Some(sandbox.generation()),
            _ => None,
        }
    }

    /// The cached sandbox for `pipeline_id`, without compiling or touching it.
    pub async fn peek(&self, pipeline_id: &str) -> Option<Arc<Sandbox>> {
        let slot = self.existing_slot(pipeline_id)?;
        let state = slot.state.lock().await;
        match &state.current {
            Current::Ready(sandbox) => Some(sandbox.clone()),
            _ => None,
        }
    }

    /// Dispose and forget `pipeline_id`'s sandbox or cached compile error.
    pub async fn evict(&self, pipeline_id: &str) -> bool {
        self.expiry.lock().remove(pipeline_id);
        let Some(slot) = self.existing_slot(pipeline_id) else {
            return false;
        };
        let mut state = slot.state.lock().await;
        let evicted = match std::mem::replace(&mut state.current, Current::Empty) {
            Current::Ready(sandbox) => {
                sandbox.dispose(DisposeReason::Evicted);
                true
            }
            Current::Broken { .. } => true,
            Current::Empty => false,
        };
        self.forget_slot(pipeline_id, &slot, &mut state);
        evicted
    }

    /// Dispose every sandbox whose TTL has elapsed. Returns how many.
    pub async fn sweep_expired(&self) -> usize {
        let candidates = self.expiry.lock().expired();
        let mut swept = 0;
        for pipeline_id in candidates {
            let Some(slot) = self.existing_slot(&pipeline_id) else {
                self.expiry.lock().remove(&pipeline_id);
                continue;
            };
            let mut state = slot.state.lock().await;
            // Touched while we waited for the slot.
            if !self.expiry.lock().is_expired(&pipeline_id) {
                continue;
            }
            self.expiry.lock().remove(&pipeline_id);
            if let Current::Ready(sandbox) = std::mem::replace(&mut state.current, Current::Empty) {
                sandbox.dispose(DisposeReason::Expired);
                swept += 1;
            }
            self.forget_slot(&pipeline_id, &slot, &mut state);
        }
        if swept > 0 {
            debug!(count = swept, "swept expired sandboxes");
        }
        swept
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until the
    /// manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep_expired().await;
            }
        })
    }

    /// Dispose every cached sandbox.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.lock().values().cloned().collect();
        let mut disposed = 0usize;
        for slot in slots {
            let mut state = slot.state.lock().await;
            if let Current::Ready(sandbox) = std::mem::replace(&mut state.current, Current::Empty) {
                if sandbox.dispose(DisposeReason::Shutdown) {
                    disposed += 1;
                }
            }
        }
        self.expiry.lock().clear();
        info!(disposed, "sandbox manager shut down");
    }

    pub async fn stats(&self) -> CacheStats {
        let slots: Vec<Arc<Slot>> = self.slots.lock().values().cloned().collect();
        let mut live = 0;
        for slot in slots {
            if let Current::Ready(sandbox) = &slot.state.lock().await.current {
                if !sandbox.is_disposed() {
                    live += 1;
                }
            }
        }
        CacheStats {
            compiles: self.counters.compiles.load(Ordering::Relaxed),
            compile_failures: self.counters.compile_failures.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            disposals: self.counters.disposals.load(Ordering::Relaxed),
            live,
        }
    }

    /// Pipelines holding a slot. Evicted and swept pipelines drop out.
    pub fn tracked_pipelines(&self) -> usize {
        self.slots.lock().len()
    }
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("options", &self.options)
            .field("grace_period", &self.grace_period)
            .field("pipelines", &self.slots.lock().len())
            .finish_non_exhaustive()
    }
}
