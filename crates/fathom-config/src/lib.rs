//! Configuration system for the Fathom UDF runtime.
//!
//! Provides TOML-based configuration with:
//! - Sections for the sandbox runtime, host bridge limits, logging and state
//! - Config file layering (user config + project-local overrides)
//! - `FATHOM_*` environment overrides and validation

pub mod discovery;
pub mod env;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigLayer, LoadedConfig, load_config, load_config_file, load_config_with_options,
    user_config_dir, user_config_path,
};
pub use env::{apply_env_overrides, apply_overrides_from};
pub use error::{ConfigError, Result};
pub use types::*;
