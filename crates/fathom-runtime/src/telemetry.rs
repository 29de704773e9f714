//! Process-wide tracing setup.
//!
//! The runtime never installs a subscriber on its own. An embedding host
//! calls [`init`] once at startup, before building a `SandboxManager`.

use fathom_config::LoggingSection;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::{Result, RuntimeError};

/// Filter for `section`; `RUST_LOG` wins when set.
pub fn env_filter(section: &LoggingSection) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&section.filter))
}

/// Install the global subscriber: human-readable console output, or one
/// JSON object per line when `section.json` is set.
///
/// Fails if a global subscriber is already installed.
pub fn init(section: &LoggingSection) -> Result<()> {
    let (console, json) = if section.json {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            ),
        )
    } else {
        (
            Some(tracing_subscriber::fmt::layer().with_target(true)),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(env_filter(section))
        .with(console)
        .with(json)
        .try_init()
        .map_err(|e| RuntimeError::Internal(format!("failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let section = LoggingSection::default();
        let _ = init(&section);
        assert!(matches!(init(&section), Err(RuntimeError::Internal(_))));
    }
}
