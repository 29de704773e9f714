//! Sandbox Lifecycle Manager, isolate side.
//!
//! A [`Sandbox`] is one compiled pipeline living in its own V8 isolate. V8
//! isolates are `!Send`, so each sandbox owns a dedicated OS thread running a
//! current-thread tokio runtime; the host talks to it over channels.
//!
//! ```text
//!  host tasks                          fathom-sandbox-<id> thread
//!  ──────────                          ──────────────────────────
//!  Sandbox::invoke ──Job──► mpsc ───►  serve() ─► __fathomRunChain()
//!        ▲                                 │
//!        └────────── oneshot reply ◄───────┘
//!
//!  dispose() ─► terminate_execution + cancel ─► worker exits, drops bridge
//! ```
//!
//! Disposal is exactly-once. Whatever triggers it (deadline, heap ceiling,
//! supersession, expiry, eviction, shutdown) records the first reason and
//! every later call is a no-op.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use fathom_config::{ChainMode, RuntimeSection};
use fathom_types::PipelineBundle;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bridge::{ops::fathom_bridge, BridgeHandles, CallState, ChainOutput, HostBridge};
use crate::error::{CompileError, DisposeReason, Result, RuntimeError};
use crate::linker::{self, LinkPlan};

/// Extra heap granted past the ceiling so termination can unwind.
const HEAP_GRACE_BYTES: usize = 4 * 1024 * 1024;

const INVOKE_SCRIPT_NAME: &str = "[fathom:invoke]";
const INVOKE_SCRIPT: &str = "globalThis.__fathomRunChain();";

/// Limits applied to each sandbox.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub invoke_timeout: Duration,
    pub compile_timeout: Duration,
    pub max_heap_bytes: usize,
    pub chain_mode: ChainMode,
}

impl From<&RuntimeSection> for SandboxOptions {
    fn from(section: &RuntimeSection) -> Self {
        Self {
            invoke_timeout: section.invoke_timeout(),
            compile_timeout: section.compile_timeout(),
            max_heap_bytes: section.max_heap_bytes(),
            chain_mode: section.chain_mode,
        }
    }
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self::from(&RuntimeSection::default())
    }
}

/// One invocation queued for the worker.
pub(crate) struct Job {
    pub payload: String,
    pub debug: bool,
    pub call_id: String,
    /// `Ok(envelope)` or the engine's error text.
    pub reply: oneshot::Sender<std::result::Result<String, String>>,
}

/// State shared between the host handle, deadline timers and the worker.
pub(crate) struct SandboxShared {
    pipeline_id: String,
    generation: u64,
    disposed: AtomicBool,
    reason: Mutex<Option<DisposeReason>>,
    isolate: v8::IsolateHandle,
    pub(crate) cancel: CancellationToken,
    disposals: Arc<AtomicU64>,
}

impl SandboxShared {
    /// Tear the sandbox down. Returns `false` if it was already disposed.
    pub(crate) fn dispose(&self, reason: DisposeReason) -> bool {
        let mut slot = self.reason.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        self.disposed.store(true, Ordering::SeqCst);
        drop(slot);

        tracing::error!(
            pipeline_id = %self.pipeline_id,
            generation = self.generation,
            reason = %reason,
            "sandbox disposed"
        );
        self.isolate.terminate_execution();
        self.cancel.cancel();
        self.disposals.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn reason(&self) -> Option<DisposeReason> {
        *self.reason.lock()
    }
}

/// Host-side handle to a compiled pipeline.
pub struct Sandbox {
    pipeline_id: String,
    workspace_id: String,
    generation: u64,
    content_hash: String,
    pub(crate) jobs: mpsc::UnboundedSender<Job>,
    pub(crate) shared: Arc<SandboxShared>,
    pub(crate) invoke_timeout: Duration,
}

impl Sandbox {
    /// Create an isolate for `bundle`, link it, and wait for it to be ready.
    ///
    /// Link failures come back as [`RuntimeError::Compile`]. If linking does
    /// not finish within the compile timeout the isolate is terminated.
    /// `disposals` counts this sandbox's eventual disposal.
    pub(crate) async fn compile(
        bundle: &PipelineBundle,
        content_hash: String,
        generation: u64,
        options: &SandboxOptions,
        bridge: &HostBridge,
        disposals: Arc<AtomicU64>,
    ) -> Result<Self> {
        let pipeline_id = bundle.id().to_string();
        let workspace_id = bundle.spec.workspace_id.clone();
        let init = WorkerInit {
            plan: LinkPlan::new(bundle, options.chain_mode),
            handles: bridge.handles(&pipeline_id, &workspace_id),
            max_heap_bytes: options.max_heap_bytes,
            pipeline_id: pipeline_id.clone(),
            generation,
            disposals,
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let (compiled_tx, compiled_rx) = oneshot::channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name(format!("fathom-sandbox-{pipeline_id}"))
            .spawn(move || worker_main(init, ready_tx, compiled_tx, jobs_rx))
            .map_err(|e| RuntimeError::Internal(format!("failed to spawn sandbox thread: {e}")))?;

        let shared = ready_rx
            .await
            .map_err(|_| RuntimeError::Internal("sandbox thread exited during startup".into()))?
            .map_err(RuntimeError::Internal)?;

        match tokio::time::timeout(options.compile_timeout, compiled_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(error))) => return Err(error.into()),
            Ok(Err(_)) => {
                return Err(RuntimeError::Internal(
                    "sandbox thread exited during compilation".into(),
                ))
            }
            Err(_) => {
                shared.dispose(DisposeReason::Timeout);
                return Err(CompileError::new(format!(
                    "compilation did not finish within {}ms",
                    options.compile_timeout.as_millis()
                ))
                .into());
            }
        }

        tracing::info!(
            pipeline_id = %pipeline_id,
            generation,
            functions = bundle.functions.len(),
            "sandbox compiled"
        );

        Ok(Self {
            pipeline_id,
            workspace_id,
            generation,
            content_hash,
            jobs: jobs_tx,
            shared,
            invoke_timeout: options.invoke_timeout,
        })
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Monotonic per pipeline; a recompile always has a higher generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn invoke_timeout(&self) -> Duration {
        self.invoke_timeout
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    pub fn dispose_reason(&self) -> Option<DisposeReason> {
        self.shared.reason()
    }

    /// Dispose this sandbox. Idempotent; returns whether this call did it.
    pub fn dispose(&self, reason: DisposeReason) -> bool {
        self.shared.dispose(reason)
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("pipeline_id", &self.pipeline_id)
            .field("generation", &self.generation)
            .field("content_hash", &self.content_hash)
            .field("disposed", &self.dispose_reason())
            .finish()
    }
}

struct WorkerInit {
    plan: LinkPlan,
    handles: BridgeHandles,
    max_heap_bytes: usize,
    pipeline_id: String,
    generation: u64,
    disposals: Arc<AtomicU64>,
}

fn worker_main(
    init: WorkerInit,
    ready: oneshot::Sender<std::result::Result<Arc<SandboxShared>, String>>,
    compiled: oneshot::Sender<std::result::Result<(), CompileError>>,
    jobs: mpsc::UnboundedReceiver<Job>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(format!("failed to build sandbox runtime: {e}")));
            return;
        }
    };
    rt.block_on(run_worker(init, ready, compiled, jobs));
}

/// Disallow `eval` and `new Function` in every isolate.
fn harden_v8() {
    static FLAGS: Once = Once::new();
    FLAGS.call_once(|| {
        let rejected = deno_core::v8_set_flags(vec![
            "fathom".to_string(),
            "--disallow-code-generation-from-strings".to_string(),
        ]);
        if rejected.len() > 1 {
            tracing::warn!(?rejected, "V8 rejected sandbox flags");
        }
    });
}

async fn run_worker(
    init: WorkerInit,
    ready: oneshot::Sender<std::result::Result<Arc<SandboxShared>, String>>,
    compiled: oneshot::Sender<std::result::Result<(), CompileError>>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    harden_v8();
    let WorkerInit {
        plan,
        handles,
        max_heap_bytes,
        pipeline_id,
        generation,
        disposals,
    } = init;

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![fathom_bridge::init_ops()],
        module_loader: Some(Rc::new(plan.loader())),
        create_params: Some(v8::CreateParams::default().heap_limits(0, max_heap_bytes)),
        ..Default::default()
    });

    let shared = Arc::new(SandboxShared {
        pipeline_id,
        generation,
        disposed: AtomicBool::new(false),
        reason: Mutex::new(None),
        isolate: runtime.v8_isolate().thread_safe_handle(),
        cancel: CancellationToken::new(),
        disposals,
    });

    let heap_shared = shared.clone();
    runtime.add_near_heap_limit_callback(move |current, _initial| {
        heap_shared.dispose(DisposeReason::MemoryLimit);
        current + HEAP_GRACE_BYTES
    });
    runtime.op_state().borrow_mut().put(handles);

    if ready.send(Ok(shared.clone())).is_err() {
        return;
    }

    let linked = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {
            Err(CompileError::new("sandbox disposed during compilation"))
        }
        result = linker::link(&mut runtime, &plan) => result,
    };
    let ready_to_serve = linked.is_ok();
    let _ = compiled.send(linked);

    if ready_to_serve {
        serve(&mut runtime, &shared, &mut jobs).await;
    }
    release(runtime, &shared);
}

async fn serve(
    runtime: &mut JsRuntime,
    shared: &SandboxShared,
    jobs: &mut mpsc::UnboundedReceiver<Job>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let Job {
            payload,
            debug,
            call_id,
            reply,
        } = job;
        let outcome = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            outcome = run_job(runtime, payload, debug, call_id) => outcome,
        };
        let _ = reply.send(outcome);
    }
}

async fn run_job(
    runtime: &mut JsRuntime,
    payload: String,
    debug: bool,
    call_id: String,
) -> std::result::Result<String, String> {
    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.try_take::<ChainOutput>();
        state.put(CallState {
            input: Some(payload),
            debug,
            call_id,
        });
    }

    runtime
        .execute_script(INVOKE_SCRIPT_NAME, INVOKE_SCRIPT)
        .map_err(|e| e.to_string())?;
    runtime
        .run_event_loop(PollEventLoopOptions::default())
        .await
        .map_err(|e| e.to_string())?;

    let output = runtime.op_state().borrow_mut().try_take::<ChainOutput>();
    output
        .map(|ChainOutput(envelope)| envelope)
        .ok_or_else(|| "chain finished without producing a result".to_string())
}

/// Drop the bridge handles before the isolate so host services are released
/// even if V8 teardown is slow.
fn release(mut runtime: JsRuntime, shared: &SandboxShared) {
    let handles = {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.try_take::<CallState>();
        state.try_take::<BridgeHandles>()
    };
    if handles.is_some() {
        drop(handles);
        tracing::debug!(
            pipeline_id = %shared.pipeline_id,
            generation = shared.generation,
            "bridge handles released"
        );
    }
    drop(runtime);
}
