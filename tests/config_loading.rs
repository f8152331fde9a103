//! Configuration loading from TOML files and environment overrides.

use std::fs;

use rust_psi::calibration::CalibrationConfig;
use rust_psi::config::{PsiConfig, DEFAULT_CONFIG_PATH};
use rust_psi::engine::MockEngine;
use serial_test::serial;
use tempfile::TempDir;

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("psi.toml");
    fs::write(&path, contents).unwrap();
    path
}

#[test]
#[serial]
fn test_shipped_config_is_valid() {
    let config = PsiConfig::load_from(DEFAULT_CONFIG_PATH).unwrap();
    config.validate().unwrap();

    assert_eq!(config.engine.name, "booth");
    assert_eq!(config.engine.ao_channels[0].name, "speaker");
    let microphone = &config.engine.ai_channels[0];
    assert_eq!(microphone.loopback.as_deref(), Some("speaker"));
    assert_eq!(
        microphone.calibration,
        CalibrationConfig::Flat { sensitivity: -40.0 }
    );
    assert_eq!(config.sweep.min_snr, Some(20.0));
    assert_eq!(config.sweep_config().block_duration, Some(0.1));

    assert!(MockEngine::new(config.engine).is_ok());
}

#[test]
#[serial]
fn test_minimal_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[application]\nname = \"bench\"\n");
    let config = PsiConfig::load_from(&path).unwrap();

    assert_eq!(config.application.name, "bench");
    assert_eq!(config.application.log_level, "info");
    assert!(config.engine.ao_channels.is_empty());
    assert_eq!(config.sweep.repetitions, 2);
    assert_eq!(config.sweep.block_duration, None);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_missing_application_section_fails() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[engine]\nfs = 48000.0\n");
    assert!(PsiConfig::load_from(&path).is_err());
}

#[test]
#[serial]
fn test_semantic_errors_caught_by_validate() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[application]
name = "bench"

[sweep]
duration = 0.1
trim = 0.06
"#,
    );
    let config = PsiConfig::load_from(&path).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.starts_with("Invalid sweep"), "{err}");

    let path = write_config(
        &dir,
        r#"
[application]
name = "bench"

[[engine.ai_channels]]
name = "microphone"
loopback = "speaker"
"#,
    );
    let err = PsiConfig::load_from(&path).unwrap().validate().unwrap_err();
    assert!(err.contains("unknown output 'speaker'"), "{err}");
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "[application]\nname = \"bench\"\n\n[sweep]\ntimeout = 30.0\n",
    );

    std::env::set_var("RUST_PSI_SWEEP__TIMEOUT", "5.0");
    let loaded = PsiConfig::load_from(&path);
    std::env::remove_var("RUST_PSI_SWEEP__TIMEOUT");

    let config = loaded.unwrap();
    assert_eq!(config.sweep.timeout, 5.0);
    assert_eq!(config.application.name, "bench");
}

#[test]
#[serial]
fn test_rendered_config_loads_back() {
    let original = PsiConfig::load_from(DEFAULT_CONFIG_PATH).unwrap();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, &original.to_toml().unwrap());

    let reloaded = PsiConfig::load_from(&path).unwrap();
    assert_eq!(reloaded.application, original.application);
    assert_eq!(reloaded.engine, original.engine);
    assert_eq!(reloaded.output, original.output);
    assert_eq!(reloaded.sweep.min_snr, original.sweep.min_snr);
}
