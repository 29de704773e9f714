use std::fs;

use fathom_config::{ChainMode, ConfigError, load_config_file, load_config_with_options};
use tempfile::TempDir;

#[test]
fn test_project_layer_overrides_user_layer() {
    let user = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    fs::write(
        user.path().join("config.toml"),
        "[runtime]\nmax_heap_mb = 32\n\n[logging]\njson = true\n",
    )
    .unwrap();
    fs::write(
        project.path().join("fathom.toml"),
        "[runtime]\nmax_heap_mb = 96\nchain_mode = \"sequential\"\n",
    )
    .unwrap();

    let loaded = load_config_with_options(Some(project.path()), Some(user.path())).unwrap();

    assert_eq!(loaded.loaded_from().len(), 2);
    assert_eq!(loaded.config.runtime().max_heap_mb, 96);
    assert_eq!(loaded.config.runtime().chain_mode, ChainMode::Sequential);
    assert!(loaded.config.logging().json);
    assert!(loaded.warnings.is_empty());
}

#[test]
fn test_missing_files_yield_defaults() {
    let user = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    let loaded = load_config_with_options(Some(project.path()), Some(user.path())).unwrap();

    assert!(loaded.loaded_from().is_empty());
    assert_eq!(loaded.config.runtime().cache_ttl_secs, 600);
}

#[test]
fn test_broken_layer_becomes_warning() {
    let user = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    fs::write(project.path().join("fathom.toml"), "[runtime\nbroken").unwrap();

    let loaded = load_config_with_options(Some(project.path()), Some(user.path())).unwrap();

    assert_eq!(loaded.warnings.len(), 1);
    assert!(loaded.loaded_from().is_empty());
}

#[test]
fn test_invalid_settings_fail_load() {
    let user = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    fs::write(project.path().join("fathom.toml"), "[state]\ntotal_instances = 0\n").unwrap();

    let err = load_config_with_options(Some(project.path()), Some(user.path())).unwrap_err();

    assert!(matches!(err, ConfigError::Invalid { .. }));
}

#[test]
fn test_load_config_file_reports_path() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.toml");

    let err = load_config_file(&missing).unwrap_err();

    assert!(err.to_string().contains("nope.toml"));
}
