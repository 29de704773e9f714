//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `$FATHOM_CONFIG_DIR/config.toml`, else the platform config dir
//! 2. `./fathom.toml` (project-local)
//! 3. `FATHOM_*` environment overrides

use std::path::{Path, PathBuf};

use crate::{ConfigError, FathomConfig, Result, env};

/// Default config filename for project-local config.
const PROJECT_CONFIG_FILE: &str = "fathom.toml";

/// Default config filename within the user config directory.
const USER_CONFIG_FILE: &str = "config.toml";

const APP_NAME: &str = "fathom";

/// Environment variable to override the config directory.
const CONFIG_DIR_ENV: &str = "FATHOM_CONFIG_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged, validated configuration.
    pub config: FathomConfig,
    /// Layers that were checked, lowest precedence first.
    pub layers: Vec<ConfigLayer>,
    /// Environment variables that overrode file values.
    pub env_overrides: Vec<&'static str>,
    /// Non-fatal problems, e.g. a layer that failed to parse.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Paths of layers that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.layers
            .iter()
            .filter(|l| l.loaded)
            .map(|l| l.path.as_path())
            .collect()
    }
}

/// Discover, merge, override and validate configuration.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Load configuration with explicit control over the user config directory.
///
/// `config_dir` overrides both `FATHOM_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = FathomConfig::new();
    let mut layers = Vec::new();
    let mut warnings = Vec::new();

    let user_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    if let Some(path) = user_path {
        layers.push(load_layer(&mut config, &path, &mut warnings));
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    layers.push(load_layer(&mut config, &project_path, &mut warnings));

    let env_overrides = env::apply_env_overrides(&mut config)?;
    config.validate()?;

    Ok(LoadedConfig {
        config,
        layers,
        env_overrides,
        warnings,
    })
}

/// Load config from a specific file path (no discovery, no overrides).
pub fn load_config_file(path: &Path) -> Result<FathomConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    FathomConfig::from_toml(&contents)
}

/// `config.toml` inside the user config directory.
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// `FATHOM_CONFIG_DIR` if set, else the platform config dir.
pub fn user_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

fn load_layer(config: &mut FathomConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigLayer {
    if !path.is_file() {
        return ConfigLayer {
            path: path.to_path_buf(),
            loaded: false,
        };
    }

    match load_config_file(path) {
        Ok(layer) => {
            config.merge(layer);
            ConfigLayer {
                path: path.to_path_buf(),
                loaded: true,
            }
        }
        Err(e) => {
            warnings.push(format!("Failed to load {}: {}", path.display(), e));
            ConfigLayer {
                path: path.to_path_buf(),
                loaded: false,
            }
        }
    }
}
