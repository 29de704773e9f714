//! Guest logging.

use std::fmt;
use std::str::FromStr;

/// Severity of a guest `log.*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for GuestLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(GuestLogLevel::Debug),
            "info" => Ok(GuestLogLevel::Info),
            "warn" => Ok(GuestLogLevel::Warn),
            "error" => Ok(GuestLogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl fmt::Display for GuestLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GuestLogLevel::Debug => "debug",
            GuestLogLevel::Info => "info",
            GuestLogLevel::Warn => "warn",
            GuestLogLevel::Error => "error",
        })
    }
}

/// One guest log line with the identity of the sandbox that produced it.
#[derive(Debug, Clone, Copy)]
pub struct GuestLogRecord<'a> {
    pub level: GuestLogLevel,
    pub message: &'a str,
    pub pipeline_id: &'a str,
    pub workspace_id: &'a str,
    pub call_id: &'a str,
}

/// Destination for guest log output.
pub trait GuestLogger: Send + Sync {
    fn log(&self, record: &GuestLogRecord<'_>);
}

/// Re-emits guest logs as `tracing` events under the `fathom::guest` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingGuestLogger;

impl GuestLogger for TracingGuestLogger {
    fn log(&self, r: &GuestLogRecord<'_>) {
        match r.level {
            GuestLogLevel::Debug => tracing::debug!(
                target: "fathom::guest",
                pipeline_id = r.pipeline_id,
                workspace_id = r.workspace_id,
                call_id = r.call_id,
                "{}",
                r.message
            ),
            GuestLogLevel::Info => tracing::info!(
                target: "fathom::guest",
                pipeline_id = r.pipeline_id,
                workspace_id = r.workspace_id,
                call_id = r.call_id,
                "{}",
                r.message
            ),
            GuestLogLevel::Warn => tracing::warn!(
                target: "fathom::guest",
                pipeline_id = r.pipeline_id,
                workspace_id = r.workspace_id,
                call_id = r.call_id,
                "{}",
                r.message
            ),
            GuestLogLevel::Error => tracing::error!(
                target: "fathom::guest",
                pipeline_id = r.pipeline_id,
                workspace_id = r.workspace_id,
                call_id = r.call_id,
                "{}",
                r.message
            ),
        }
    }
}
