//! Hot-reloadable sandbox runtime for user-defined profile functions.
//!
//! Each pipeline ("profile builder") is compiled into its own V8 isolate
//! together with two trusted libraries, `@fathom/functions` and
//! `@fathom/crypto`, which are the only modules user code may import. The
//! compiled sandbox is cached per pipeline and replaced when the pipeline's
//! content hash changes.
//!
//! ```text
//! RunnerRegistry ─► ProfileBuilderRunner ─► SandboxManager ─► Sandbox ─► isolate
//!   (config poll)      (progress, state)      (cache, TTL)     (invoke)   (linker,
//!                                                                          chain,
//!                                                                          bridge)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use fathom_runtime::{HostBridge, SandboxManager};
//!
//! let config = fathom_config::load_config(None)?.config;
//! fathom_runtime::telemetry::init(&config.logging())?;
//! let manager = SandboxManager::from_config(&config)?;
//! let result = manager.invoke(&bundle, &context, &events, &user).await?;
//! ```

pub mod bridge;
pub mod chain;
pub mod error;
pub mod hash;
pub mod invoke;
pub mod linker;
pub mod manager;
pub mod runner;
pub mod sandbox;
pub mod telemetry;
pub mod ttl;

pub use bridge::{
    FetchPolicy, FetchRequest, FetchResponse, Fetcher, GuestLogLevel, GuestLogRecord,
    GuestLogger, HostBridge, InMemoryKvStore, KvStore, ReqwestFetcher, TracingGuestLogger,
};
pub use error::{
    CompileError, DisposeReason, GuestError, Result, RuntimeError, StructuredError,
};
pub use hash::content_hash;
pub use invoke::TraceEntry;
pub use linker::{ImportKind, ImportPolicy, LinkError, LinkPlan, CRYPTO_LIB, FUNCTIONS_LIB};
pub use manager::{CacheStats, SandboxManager};
pub use runner::{
    ConfigSnapshot, ConfigSource, InMemoryConfigSource, InMemoryStateSink, ProfileBuilderRunner,
    RunnerEvent, RunnerRegistry, StateSink,
};
pub use sandbox::{Sandbox, SandboxOptions};
pub use ttl::ExpiryTracker;
