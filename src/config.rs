//! Daemon configuration loading and persistence.
//!
//! Mirrors the file-then-env-override pattern used throughout this crate's
//! config handling: a JSON file provides the base, environment variables
//! override individual fields, and the result is validated before use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShareTtyError};

/// Default path for the control-plane Unix socket.
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/gotty.sock";

/// Configuration for the `daemon` subcommand.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DaemonConfig {
    /// Address the front door listens on, e.g. "0.0.0.0:8080".
    pub addr: String,
    /// Filesystem path of the control-plane Unix socket.
    pub control_socket: PathBuf,
    /// Directory recordings are written to.
    pub rec_dir: PathBuf,
    /// Seconds a Waiting session survives before the reaper closes it.
    pub waiting_conn_time: u64,
    /// Shared credential clients must present; empty means no auth check.
    #[serde(default)]
    pub credential: String,
    /// Title template rendered into SetWindowTitle frames.
    #[serde(default = "default_title_format")]
    pub title_format: String,
    /// Default permit_write for new Exec sessions when not overridden by the CLI.
    #[serde(default)]
    pub permit_write: bool,
    /// Default permit_share for new Exec sessions when not overridden by the CLI.
    #[serde(default)]
    pub permit_share: bool,
    /// Signal number sent to a session's child on close (default SIGHUP).
    #[serde(default = "default_close_signal")]
    pub close_signal: i32,
    /// Seconds advertised in a `SetReconnect` frame after promotion; 0 disables it.
    #[serde(default)]
    pub reconnect_seconds: u64,
}

fn default_title_format() -> String {
    "{{ .Command }}@{{ .Hostname }}".to_string()
}

fn default_close_signal() -> i32 {
    libc::SIGHUP
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            control_socket: PathBuf::from(DEFAULT_CONTROL_SOCKET),
            rec_dir: std::env::temp_dir().join("sharetty-rec"),
            waiting_conn_time: 10,
            credential: String::new(),
            title_format: default_title_format(),
            permit_write: false,
            permit_share: false,
            close_signal: default_close_signal(),
            reconnect_seconds: 0,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from an optional file path, then apply env overrides.
    ///
    /// A `Some(path)` that fails to parse is a fatal `ConfigError` (exit code 2
    /// at the CLI boundary); a missing path falls back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    ShareTtyError::ConfigParse(format!("cannot read {}: {e}", p.display()))
                })?;
                serde_json::from_str(&content).map_err(|e| {
                    ShareTtyError::ConfigParse(format!("invalid config {}: {e}", p.display()))
                })?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SHARETTY_ADDR") {
            self.addr = addr;
        }
        if let Ok(sock) = std::env::var("SHARETTY_CONTROL_SOCKET") {
            self.control_socket = PathBuf::from(sock);
        }
        if let Ok(cred) = std::env::var("SHARETTY_CREDENTIAL") {
            self.credential = cred;
        }
        if let Ok(dir) = std::env::var("SHARETTY_REC_DIR") {
            self.rec_dir = PathBuf::from(dir);
        }
        if let Ok(secs) = std::env::var("SHARETTY_RECONNECT_SECONDS") {
            if let Ok(secs) = secs.parse() {
                self.reconnect_seconds = secs;
            }
        }
    }

    /// Validate field values; failures map to exit code 6 (config validation).
    fn validate(&self) -> Result<()> {
        if self.waiting_conn_time == 0 {
            return Err(ShareTtyError::Config(
                "waiting_conn_time must be greater than zero".to_string(),
            ));
        }
        std::fs::create_dir_all(&self.rec_dir).map_err(|e| {
            ShareTtyError::Config(format!(
                "rec_dir {} is not creatable: {e}",
                self.rec_dir.display()
            ))
        })?;
        Ok(())
    }

    /// Directory configuration files and the config dir default to.
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("sharetty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.control_socket, PathBuf::from(DEFAULT_CONTROL_SOCKET));
    }

    #[test]
    fn test_zero_waiting_conn_time_rejected() {
        let mut config = DaemonConfig {
            waiting_conn_time: 0,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
        config.waiting_conn_time = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_path_uses_defaults() {
        let config = DaemonConfig::load(None).expect("defaults must validate");
        assert_eq!(config.addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_load_bad_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.json");
        let err = DaemonConfig::load(Some(&path)).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_env_override_credential() {
        std::env::set_var("SHARETTY_CREDENTIAL", "test-cred-xyz");
        let config = DaemonConfig::load(None).expect("valid");
        assert_eq!(config.credential, "test-cred-xyz");
        std::env::remove_var("SHARETTY_CREDENTIAL");
    }
}
