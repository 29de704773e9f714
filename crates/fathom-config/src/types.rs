//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [runtime]    # sandbox cache, deadlines, heap cap, chain mode
//! [bridge]     # host capabilities exposed to guest code
//! [logging]    # tracing filter and output format
//! [state]      # instance sharding and checkpoint cadence
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged. Use the accessors to read a section
/// with defaults filled in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FathomConfig {
    pub runtime: Option<RuntimeSection>,
    pub bridge: Option<BridgeSection>,
    pub logging: Option<LoggingSection>,
    pub state: Option<StateSection>,
}

impl FathomConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Merging is per section: a section present in `other` replaces ours.
    pub fn merge(&mut self, other: FathomConfig) {
        if other.runtime.is_some() {
            self.runtime = other.runtime;
        }
        if other.bridge.is_some() {
            self.bridge = other.bridge;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
        if other.state.is_some() {
            self.state = other.state;
        }
    }

    pub fn runtime(&self) -> RuntimeSection {
        self.runtime.clone().unwrap_or_default()
    }

    pub fn bridge(&self) -> BridgeSection {
        self.bridge.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }

    pub fn state(&self) -> StateSection {
        self.state.clone().unwrap_or_default()
    }

    pub(crate) fn runtime_mut(&mut self) -> &mut RuntimeSection {
        self.runtime.get_or_insert_with(RuntimeSection::default)
    }

    pub(crate) fn state_mut(&mut self) -> &mut StateSection {
        self.state.get_or_insert_with(StateSection::default)
    }

    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let runtime = self.runtime();
        if runtime.invoke_timeout_ms == 0 {
            return Err(invalid("runtime.invoke_timeout_ms", "must be greater than zero"));
        }
        if runtime.compile_timeout_ms == 0 {
            return Err(invalid("runtime.compile_timeout_ms", "must be greater than zero"));
        }
        if runtime.max_heap_mb == 0 {
            return Err(invalid("runtime.max_heap_mb", "must be greater than zero"));
        }

        let bridge = self.bridge();
        if bridge.fetch_timeout_ms == 0 {
            return Err(invalid("bridge.fetch_timeout_ms", "must be greater than zero"));
        }

        let state = self.state();
        if state.total_instances == 0 {
            return Err(invalid("state.total_instances", "must be at least 1"));
        }
        if state.instance_index >= state.total_instances {
            return Err(invalid(
                "state.instance_index",
                format!(
                    "{} is out of range for {} instances",
                    state.instance_index, state.total_instances
                ),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// How a pipeline with several functions combines their results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    /// Only the first function runs.
    #[default]
    First,
    /// Each function sees the properties produced so far merged into the user's traits.
    Sequential,
    /// Every function sees the original input; results are shallow-merged, later wins.
    Merge,
}

impl ChainMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainMode::First => "first",
            ChainMode::Sequential => "sequential",
            ChainMode::Merge => "merge",
        }
    }
}

impl fmt::Display for ChainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(ChainMode::First),
            "sequential" => Ok(ChainMode::Sequential),
            "merge" => Ok(ChainMode::Merge),
            other => Err(format!("unknown chain mode '{other}'")),
        }
    }
}

/// Sandbox runtime configuration.
///
/// ```toml
/// [runtime]
/// invoke_timeout_ms = 4000
/// compile_timeout_ms = 10000
/// cache_ttl_secs = 600
/// sweep_interval_secs = 30
/// grace_period_ms = 2000
/// max_heap_mb = 64
/// chain_mode = "first"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Per-call deadline. Exceeding it disposes the whole sandbox.
    pub invoke_timeout_ms: u64,
    /// Deadline for compiling and linking one sandbox.
    pub compile_timeout_ms: u64,
    /// Idle time after which a cached sandbox is evicted.
    pub cache_ttl_secs: u64,
    /// Interval between background sweeps for expired sandboxes.
    pub sweep_interval_secs: u64,
    /// How long a superseded sandbox stays alive for in-flight calls.
    pub grace_period_ms: u64,
    /// Heap ceiling per sandbox.
    pub max_heap_mb: usize,
    pub chain_mode: ChainMode,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            invoke_timeout_ms: 4000,
            compile_timeout_ms: 10_000,
            cache_ttl_secs: 600,
            sweep_interval_secs: 30,
            grace_period_ms: 2000,
            max_heap_mb: 64,
            chain_mode: ChainMode::First,
        }
    }
}

impl RuntimeSection {
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn max_heap_bytes(&self) -> usize {
        self.max_heap_mb.saturating_mul(1024 * 1024)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host Bridge
// ─────────────────────────────────────────────────────────────────────────────

/// Limits on the capabilities guest code can reach.
///
/// ```toml
/// [bridge]
/// fetch_timeout_ms = 3000
/// max_response_bytes = 1048576
/// allowed_schemes = ["http", "https"]
/// max_random_bytes = 65536
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    pub fetch_timeout_ms: u64,
    /// Responses larger than this are rejected.
    pub max_response_bytes: usize,
    pub allowed_schemes: Vec<String>,
    /// Upper bound for a single `randomBytes` call.
    pub max_random_bytes: usize,
    pub user_agent: String,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 3000,
            max_response_bytes: 1024 * 1024,
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
            max_random_bytes: 65_536,
            user_agent: "fathom-runtime".to_string(),
        }
    }
}

impl BridgeSection {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Tracing subscriber settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive. `RUST_LOG` takes precedence when set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "fathom=info,warn".to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Instance sharding and checkpoint cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    pub instance_index: u32,
    pub total_instances: u32,
    pub checkpoint_interval_secs: u64,
    /// How often the configuration source is polled for changes.
    pub config_poll_interval_secs: u64,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            instance_index: 0,
            total_instances: 1,
            checkpoint_interval_secs: 30,
            config_poll_interval_secs: 30,
        }
    }
}

impl StateSection {
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn config_poll_interval(&self) -> Duration {
        Duration::from_secs(self.config_poll_interval_secs)
    }
}
