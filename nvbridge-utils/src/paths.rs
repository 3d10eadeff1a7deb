//! Path utilities for nvbridge
//!
//! Handles XDG Base Directory specification compliance for config,
//! state and runtime directories.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::{BridgeError, Result};

/// Application identifier for XDG directories
const APP_NAME: &str = "nvbridge";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the default Unix socket path
///
/// Location: `$XDG_RUNTIME_DIR/nvbridge/nvbridge.sock` or `/tmp/nvbridge-$UID/nvbridge.sock`
pub fn socket_path() -> PathBuf {
    runtime_dir().join("nvbridge.sock")
}

/// Get the runtime directory
///
/// Location: `$XDG_RUNTIME_DIR/nvbridge` or `/tmp/nvbridge-$UID`
pub fn runtime_dir() -> PathBuf {
    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg_runtime).join(APP_NAME)
    } else {
        // Fallback to /tmp with UID for security
        // SAFETY: getuid() is always safe to call
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
    }
}

/// Get the configuration directory
///
/// Location: `$XDG_CONFIG_HOME/nvbridge` or `~/.config/nvbridge`
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| home_dir().join(".config").join(APP_NAME))
}

/// Get the main configuration file path
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the state directory
///
/// Location: `$XDG_STATE_HOME/nvbridge` or `~/.local/state/nvbridge`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| home_dir().join(".local").join("state").join(APP_NAME))
}

/// Get the log directory
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

/// Create `dir` and any missing parents, owner-only (0700)
///
/// Existing directories keep their permissions.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|source| BridgeError::FileWrite {
            path: dir.to_path_buf(),
            source,
        })
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_is_in_runtime_dir() {
        let sock = socket_path();
        assert!(sock.starts_with(runtime_dir()));
        assert_eq!(sock.file_name().unwrap().to_str().unwrap(), "nvbridge.sock");
    }

    #[test]
    fn test_runtime_dir_contains_app_name() {
        assert!(runtime_dir().to_string_lossy().contains("nvbridge"));
    }

    #[test]
    fn test_config_file_in_config_dir() {
        let file = config_file();
        assert!(file.starts_with(config_dir()));
        assert_eq!(file.file_name().unwrap().to_str().unwrap(), "config.toml");
    }

    #[test]
    fn test_ensure_private_dir() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("a").join("b");
        ensure_private_dir(&dir).unwrap();
        ensure_private_dir(&dir).unwrap();

        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_log_dir_in_state_dir() {
        assert!(log_dir().starts_with(state_dir()));
    }
}
