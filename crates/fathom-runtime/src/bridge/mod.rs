//! Host Bridge: the only capabilities guest code can reach.
//!
//! Four groups are exposed, all as opaque callables captured by the trusted
//! library modules before user code runs:
//!
//! - `log.{info,warn,debug,error}` via [`GuestLogger`]
//! - `fetch` / `fetchV2` via [`Fetcher`]
//! - `store.{get,set,del,ttl}` via [`KvStore`]
//! - `crypto.{hash,randomUUID,randomBytes,randomInt}`
//!
//! [`HostBridge`] holds the shared services. Each sandbox gets its own
//! [`BridgeHandles`] in the isolate's `OpState`; the sandbox worker takes them
//! back out and drops them on teardown.

pub mod crypto;
pub mod fetch;
pub mod logger;
pub(crate) mod ops;
pub mod store;

use std::sync::Arc;

use fathom_config::BridgeSection;

pub use fetch::{FetchPolicy, FetchRequest, FetchResponse, Fetcher, ReqwestFetcher};
pub use logger::{GuestLogLevel, GuestLogRecord, GuestLogger, TracingGuestLogger};
pub use store::{InMemoryKvStore, KvStore, TTL_MISSING, TTL_PERSISTENT};

use crate::error::{Result, RuntimeError};

/// Shared host services backing every sandbox's bridge.
#[derive(Clone)]
pub struct HostBridge {
    pub logger: Arc<dyn GuestLogger>,
    pub fetcher: Arc<dyn Fetcher>,
    pub store: Arc<dyn KvStore>,
    pub max_random_bytes: usize,
}

impl HostBridge {
    /// Default services: tracing logger, reqwest fetcher, in-memory store.
    pub fn from_config(section: &BridgeSection) -> Result<Self> {
        let fetcher = ReqwestFetcher::new(FetchPolicy::from(section))
            .map_err(|e| RuntimeError::Bridge(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            logger: Arc::new(TracingGuestLogger),
            fetcher: Arc::new(fetcher),
            store: Arc::new(InMemoryKvStore::new()),
            max_random_bytes: section.max_random_bytes,
        })
    }

    pub fn with_logger(mut self, logger: Arc<dyn GuestLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = store;
        self
    }

    /// Handles for one sandbox.
    pub(crate) fn handles(&self, pipeline_id: &str, workspace_id: &str) -> BridgeHandles {
        BridgeHandles {
            logger: self.logger.clone(),
            fetcher: self.fetcher.clone(),
            store: self.store.clone(),
            max_random_bytes: self.max_random_bytes,
            pipeline_id: pipeline_id.to_string(),
            workspace_id: workspace_id.to_string(),
        }
    }
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("max_random_bytes", &self.max_random_bytes)
            .finish_non_exhaustive()
    }
}

/// One sandbox's references to the host services. Lives in `OpState`.
pub(crate) struct BridgeHandles {
    pub logger: Arc<dyn GuestLogger>,
    pub fetcher: Arc<dyn Fetcher>,
    pub store: Arc<dyn KvStore>,
    pub max_random_bytes: usize,
    pub pipeline_id: String,
    pub workspace_id: String,
}

impl BridgeHandles {
    /// Store keys are scoped to the workspace.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.workspace_id, key)
    }
}

/// Per-call values the guest reads through the bridge. Lives in `OpState`.
#[derive(Debug, Default)]
pub(crate) struct CallState {
    /// Serialized `{context, events, user}`; taken once by the chain.
    pub input: Option<String>,
    /// Forward `log.debug` output.
    pub debug: bool,
    pub call_id: String,
}

/// The chain's serialized result envelope for the current call.
pub(crate) struct ChainOutput(pub String);

/// A link-time failure the chain attributed to one function.
#[derive(Debug, Clone)]
pub(crate) struct LinkFailure {
    pub function_id: String,
    pub message: String,
}
