//! Invocation Wrapper: one guarded call into a sandbox.
//!
//! Every call arms a deadline. If it fires, the sandbox is disposed and the
//! caller gets [`RuntimeError::Timeout`]; a call that fails because the
//! sandbox was disposed for another reason gets [`RuntimeError::Disposed`].
//! Guest errors are split into structured application errors (a JSON object
//! message) and plain guest errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fathom_types::{Event, InvocationContext, ProfileResult, ProfileUser};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{DisposeReason, GuestError, Result, RuntimeError, StructuredError};
use crate::sandbox::{Job, Sandbox, SandboxShared};

#[derive(Serialize)]
struct Payload<'a> {
    context: &'a InvocationContext,
    events: &'a [Event],
    user: &'a ProfileUser,
}

/// Per-function timing reported by the chain.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TraceEntry {
    pub id: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: f64,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    trace: Vec<TraceEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    stack: Option<String>,
}

/// Disposes the sandbox if the call outlives its deadline. Dropping the
/// guard cancels the timer.
struct DeadlineGuard {
    fired: Arc<AtomicBool>,
    timer: JoinHandle<()>,
}

impl DeadlineGuard {
    fn arm(shared: Arc<SandboxShared>, deadline: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            flag.store(true, Ordering::SeqCst);
            shared.dispose(DisposeReason::Timeout);
        });
        Self { fired, timer }
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

enum Failure {
    /// The engine reported an error outside the chain's own handling.
    Engine(String),
    /// The worker went away without replying.
    Gone,
}

impl Sandbox {
    /// Run the pipeline's chain once.
    ///
    /// Returns `Ok(None)` when the chain produced no properties.
    pub async fn invoke(
        &self,
        context: &InvocationContext,
        events: &[Event],
        user: &ProfileUser,
    ) -> Result<Option<ProfileResult>> {
        if let Some(reason) = self.shared.reason() {
            return Err(RuntimeError::Disposed { reason });
        }

        let payload = serde_json::to_string(&Payload {
            context,
            events,
            user,
        })?;
        let call_id = uuid::Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            payload,
            debug: context.is_debug_active(fathom_types::now()),
            call_id: call_id.clone(),
            reply: reply_tx,
        };

        let guard = DeadlineGuard::arm(self.shared.clone(), self.invoke_timeout);
        let outcome = if self.jobs.send(job).is_err() {
            Err(Failure::Gone)
        } else {
            tokio::select! {
                biased;
                reply = reply_rx => match reply {
                    Ok(Ok(envelope)) => Ok(envelope),
                    Ok(Err(message)) => Err(Failure::Engine(message)),
                    Err(_) => Err(Failure::Gone),
                },
                _ = self.shared.cancel.cancelled() => Err(Failure::Gone),
            }
        };
        let timed_out = guard.fired();
        drop(guard);

        if timed_out {
            let timeout_ms = self.invoke_timeout.as_millis() as u64;
            tracing::warn!(
                pipeline_id = %self.pipeline_id(),
                generation = self.generation(),
                call_id = %call_id,
                timeout_ms,
                "invocation timed out"
            );
            return Err(RuntimeError::Timeout { timeout_ms });
        }

        let envelope = match outcome {
            Ok(envelope) => envelope,
            Err(failure) => {
                if let Some(reason) = self.shared.reason() {
                    return Err(RuntimeError::Disposed { reason });
                }
                return Err(match failure {
                    Failure::Engine(message) => classify_guest_error(None, message, None),
                    Failure::Gone => RuntimeError::Internal("sandbox worker stopped".into()),
                });
            }
        };

        let (result, trace) = decode_envelope(&envelope)?;
        for entry in &trace {
            tracing::debug!(
                pipeline_id = %self.pipeline_id(),
                call_id = %call_id,
                function_id = %entry.id,
                duration_ms = entry.duration_ms,
                "function finished"
            );
        }
        Ok(result)
    }
}

/// Decode the chain's envelope into a result or a classified guest error.
pub(crate) fn decode_envelope(text: &str) -> Result<(Option<ProfileResult>, Vec<TraceEntry>)> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if let Some(error) = envelope.error {
        return Err(classify_guest_error(error.name, error.message, error.stack));
    }
    let result = envelope.result.and_then(ProfileResult::from_guest_value);
    Ok((result, envelope.trace))
}

fn classify_guest_error(name: Option<String>, message: String, stack: Option<String>) -> RuntimeError {
    match StructuredError::parse(&message) {
        Some(structured) => RuntimeError::Application(structured),
        None => RuntimeError::Guest(GuestError {
            name: name.unwrap_or_else(|| "Error".to_string()),
            message,
            stack,
        }),
    }
}
