//! Quill configuration file.
//!
//! # Storage layout
//!
//! ```text
//! ~/.quill/
//!   config.yaml   (mode 0600, written atomically)
//! ```
//!
//! # API pattern
//!
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, SyncError};

/// Automatic syncs never fire sooner than this after the last edit.
pub const MIN_SYNC_DELAY_MINUTES: u64 = 5;

/// Engine and daemon configuration. Read-only to the engine; changes are
/// pushed in through `SyncEngine::update_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuillConfig {
    /// Working copy the daemon keeps in sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    pub auto_sync_enabled: bool,
    /// Configured debounce delay. Values below [`MIN_SYNC_DELAY_MINUTES`] are
    /// raised silently.
    pub sync_delay_minutes: u64,
    /// At most one connectivity notice is shown per window.
    pub connectivity_notice_cooldown_secs: u64,
    /// Pause before checking working-copy dirtiness after a session ends.
    pub settle_delay_ms: u64,
    /// A lock older than this is reported as stuck.
    pub lock_stuck_after_secs: u64,
    /// Minimum git version the transport requires (hard gate).
    pub required_git_version: String,
    /// Minimum host version (soft gate).
    pub min_host_version: String,
    /// Environment variable holding the remote credential. When unset, no
    /// authentication is required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token_env: Option<String>,
}

impl Default for QuillConfig {
    fn default() -> Self {
        Self {
            workspace: None,
            auto_sync_enabled: true,
            sync_delay_minutes: MIN_SYNC_DELAY_MINUTES,
            connectivity_notice_cooldown_secs: 60,
            settle_delay_ms: 1000,
            lock_stuck_after_secs: 600,
            required_git_version: "2.30.0".to_string(),
            min_host_version: "0.1.0".to_string(),
            auth_token_env: None,
        }
    }
}

impl QuillConfig {
    /// The delay actually used when arming the sync timer.
    pub fn effective_sync_delay(&self) -> Duration {
        Duration::from_secs(self.sync_delay_minutes.max(MIN_SYNC_DELAY_MINUTES) * 60)
    }

    pub fn connectivity_notice_cooldown(&self) -> Duration {
        Duration::from_secs(self.connectivity_notice_cooldown_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn lock_stuck_after(&self) -> Duration {
        Duration::from_secs(self.lock_stuck_after_secs)
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<home>/.quill/`
pub fn quill_root(home: &Path) -> PathBuf {
    home.join(".quill")
}

/// `<home>/.quill/config.yaml`, pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    quill_root(home).join("config.yaml")
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load the config from `<home>/.quill/config.yaml`.
///
/// A missing file yields defaults; malformed YAML is a
/// [`SyncError::ConfigParse`] carrying the path.
pub fn load_at(home: &Path) -> Result<QuillConfig, SyncError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(QuillConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    if contents.trim().is_empty() {
        return Ok(QuillConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| SyncError::ConfigParse { path, source })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<QuillConfig, SyncError> {
    load_at(&home()?)
}

/// Atomically save the config.
///
/// Write flow: serialize → `config.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &QuillConfig) -> Result<(), SyncError> {
    let root = quill_root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        set_dir_permissions(&root)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &QuillConfig) -> Result<(), SyncError> {
    save_at(&home()?, config)
}

/// Record `workspace` as the synced working copy, keeping other settings.
pub fn set_workspace_at(home: &Path, workspace: PathBuf) -> Result<QuillConfig, SyncError> {
    let mut config = load_at(home)?;
    config.workspace = Some(workspace);
    save_at(home, &config)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, SyncError> {
    dirs::home_dir().ok_or(SyncError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), SyncError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), SyncError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), SyncError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), SyncError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    #[rstest]
    #[case(0, 5)]
    #[case(1, 5)]
    #[case(4, 5)]
    #[case(5, 5)]
    #[case(12, 12)]
    fn effective_delay_has_five_minute_floor(#[case] configured: u64, #[case] minutes: u64) {
        let config = QuillConfig {
            sync_delay_minutes: configured,
            ..QuillConfig::default()
        };
        assert_eq!(config.effective_sync_delay(), Duration::from_secs(minutes * 60));
    }

    #[test]
    fn config_path_is_correct() {
        let home = TempDir::new().expect("tempdir");
        assert!(config_path_at(home.path()).ends_with(".quill/config.yaml"));
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let home = TempDir::new().expect("tempdir");
        save_at(home.path(), &QuillConfig::default()).expect("save");
        let tmp = config_path_at(home.path()).with_file_name("config.yaml.tmp");
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(SyncError::HomeNotFound.to_string().contains("home directory"));
    }
}
