//! Config load/save, error-message, and permission integration tests.
//! Storage: ~/.quill/config.yaml

use std::fs;
use std::path::PathBuf;

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use quill_core::{config, QuillConfig, SyncError};

// ---------------------------------------------------------------------------
// 1. Load
// ---------------------------------------------------------------------------

#[test]
fn load_missing_config_returns_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded, QuillConfig::default());
    assert!(loaded.auto_sync_enabled);
    assert_eq!(loaded.sync_delay_minutes, 5);
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let dir = home.path().join(".quill");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("config.yaml"), b"sync_delay_minutes: [unclosed").expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, SyncError::ConfigParse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn partial_config_fills_remaining_fields_with_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".quill/config.yaml")
        .write_str("sync_delay_minutes: 1\nauto_sync_enabled: false\n")
        .expect("write");

    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded.sync_delay_minutes, 1);
    assert!(!loaded.auto_sync_enabled);
    assert_eq!(loaded.connectivity_notice_cooldown_secs, 60);
    // Configured 1 minute is clamped, not rejected.
    assert_eq!(loaded.effective_sync_delay().as_secs(), 5 * 60);
}

// ---------------------------------------------------------------------------
// 2. Save
// ---------------------------------------------------------------------------

#[test]
fn save_then_load_preserves_every_field() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let original = QuillConfig {
        workspace: Some(PathBuf::from("/work/translation")),
        auto_sync_enabled: false,
        sync_delay_minutes: 15,
        connectivity_notice_cooldown_secs: 30,
        settle_delay_ms: 250,
        lock_stuck_after_secs: 120,
        required_git_version: "2.40.0".to_string(),
        min_host_version: "0.2.0".to_string(),
        auth_token_env: Some("QUILL_TOKEN".to_string()),
    };
    config::save_at(home.path(), &original).expect("save");
    assert_eq!(config::load_at(home.path()).expect("load"), original);

    home.child(".quill/config.yaml")
        .assert(predicate::str::contains("workspace: /work/translation"));
}

#[cfg(unix)]
#[test]
fn saved_config_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &QuillConfig::default()).expect("save");

    let file_mode = fs::metadata(config::config_path_at(home.path()))
        .expect("stat")
        .permissions()
        .mode()
        & 0o777;
    assert_eq!(file_mode, 0o600);

    let dir_mode = fs::metadata(config::quill_root(home.path()))
        .expect("stat")
        .permissions()
        .mode()
        & 0o777;
    assert_eq!(dir_mode, 0o700);
}

#[test]
fn set_workspace_keeps_other_settings() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let custom = QuillConfig {
        sync_delay_minutes: 20,
        ..QuillConfig::default()
    };
    config::save_at(home.path(), &custom).expect("save");

    let updated =
        config::set_workspace_at(home.path(), PathBuf::from("/work/bible")).expect("set workspace");
    assert_eq!(updated.workspace, Some(PathBuf::from("/work/bible")));
    assert_eq!(updated.sync_delay_minutes, 20);
    assert_eq!(config::load_at(home.path()).expect("reload"), updated);
}
