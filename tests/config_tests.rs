// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for configuration module

use camera_postproc::PostProcConfig;

#[test]
fn test_config_default() {
    let config = PostProcConfig::default();

    assert!(config.jpeg_mem_opt, "Memory handover should be enabled by default");
    assert!(!config.longshot_save, "Save mode should be off by default");
    assert!(
        config.store_location.contains("{}"),
        "Store location must carry the counter placeholder"
    );
}

#[test]
fn test_config_roundtrip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("postproc.json");

    let config = PostProcConfig {
        longshot_save: true,
        jpeg_burst: true,
        store_location: "/tmp/shot_{}.jpg".into(),
        ..Default::default()
    };
    config.save(&path).unwrap();

    let loaded = PostProcConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
    assert!(!loaded.burst_enabled());
}

#[test]
fn test_missing_config_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let loaded = PostProcConfig::load(&dir.path().join("absent.json")).unwrap();
    assert_eq!(loaded, PostProcConfig::default());
}

#[test]
fn test_partial_config_keeps_other_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.json");
    std::fs::write(&path, r#"{"thumbnail_disabled": true}"#).unwrap();

    let loaded = PostProcConfig::load(&path).unwrap();
    assert!(loaded.thumbnail_disabled);
    assert!(loaded.jpeg_mem_opt);
}

#[test]
fn test_malformed_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = PostProcConfig::load(&path).unwrap_err();
    assert!(err.to_string().starts_with("Configuration error"));
}
