//! Error types for the sandbox runtime.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Why a sandbox was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisposeReason {
    /// An invocation exceeded its deadline.
    Timeout,
    /// The isolate approached its heap ceiling.
    MemoryLimit,
    /// A newer sandbox for the same pipeline took over.
    Superseded,
    /// The cache entry outlived its TTL.
    Expired,
    /// Removed explicitly, e.g. the pipeline was deleted.
    Evicted,
    /// The manager is shutting down.
    Shutdown,
}

impl DisposeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisposeReason::Timeout => "timeout",
            DisposeReason::MemoryLimit => "memory_limit",
            DisposeReason::Superseded => "superseded",
            DisposeReason::Expired => "expired",
            DisposeReason::Evicted => "evicted",
            DisposeReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for DisposeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure to compile or link a pipeline's modules.
///
/// Stored by a broken cache slot and replayed verbatim until the pipeline's
/// content hash changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.render())]
pub struct CompileError {
    /// The user function the failure is attributed to, when known.
    pub function_id: Option<String>,
    pub message: String,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            function_id: None,
            message: message.into(),
        }
    }

    pub fn in_function(function_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            function_id: Some(function_id.into()),
            message: message.into(),
        }
    }

    fn render(&self) -> String {
        match &self.function_id {
            Some(id) => format!("function {id}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

/// A guest error whose message was a JSON object.
///
/// The parsed object is kept as-is so retry hints and any other fields the
/// guest attached survive the boundary.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct StructuredError {
    /// `payload.message` if present, else the raw JSON text.
    pub message: String,
    pub payload: Map<String, Value>,
}

impl StructuredError {
    /// Parse a guest error message. Returns `None` unless it is a JSON object.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let payload: Map<String, Value> = serde_json::from_str(trimmed).ok()?;
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| trimmed.to_string());
        Some(Self { message, payload })
    }

    /// The guest's `retryable` hint, if it gave one.
    pub fn retryable(&self) -> Option<bool> {
        self.payload.get("retryable").and_then(Value::as_bool)
    }

    /// The guest's `retryAfterMs` hint, if it gave one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        self.payload.get("retryAfterMs").and_then(Value::as_u64)
    }
}

/// Any other error thrown by guest code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct GuestError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

/// Errors that can occur while compiling or invoking a sandbox.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Syntax error, disallowed import or missing default export.
    #[error("Compilation failed: {0}")]
    Compile(#[from] CompileError),

    /// This call's deadline elapsed and the sandbox was disposed.
    #[error("Invocation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The sandbox was disposed for a reason other than this call's deadline.
    #[error("Sandbox disposed ({reason})")]
    Disposed { reason: DisposeReason },

    /// Guest code threw a JSON-encoded error.
    #[error("Application error: {0}")]
    Application(StructuredError),

    /// Guest code threw an unstructured error.
    #[error("Guest error: {0}")]
    Guest(GuestError),

    /// A host capability failed outside any guest call.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// A value could not be copied across the sandbox boundary.
    #[error("Marshalling failed: {0}")]
    Marshal(String),

    /// A configuration source or state sink failed.
    #[error("External collaborator failed: {0}")]
    External(String),

    /// The engine itself misbehaved.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Config(#[from] fathom_config::ConfigError),
}

impl RuntimeError {
    /// Whether the unit of work may be dropped instead of retried forever.
    pub fn is_droppable(&self) -> bool {
        matches!(self, RuntimeError::Timeout { .. } | RuntimeError::Disposed { .. })
    }

    /// Whether a later retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Timeout { .. } | RuntimeError::Disposed { .. } => true,
            RuntimeError::Application(err) => err.retryable().unwrap_or(false),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Marshal(err.to_string())
    }
}
