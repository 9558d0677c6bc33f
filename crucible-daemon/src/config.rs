// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Daemon configuration.
//!
//! Settings come from an optional TOML file; `STORE_DIR` and
//! `STORE_SOCKET` in the environment override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, IoContext as _};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Path to bind the daemon socket.
    pub socket_path: PathBuf,

    /// The store directory.
    pub store_dir: PathBuf,

    /// Path of the metadata database.
    pub db_path: PathBuf,

    /// Parent directory for per-build temporary roots.
    pub build_dir: PathBuf,

    /// Directory for captured builder output. `None` disables log
    /// persistence (useful in tests).
    pub log_dir: Option<PathBuf>,

    /// Maximum concurrent sandboxed builds.
    pub max_jobs: usize,

    /// Wall-clock build timeout in seconds; 0 means none.
    pub build_timeout_secs: u64,

    /// Maximum seconds without builder output before the watchdog kills the
    /// build; 0 means no limit.
    pub max_silent_secs: u64,

    /// Grace period between SIGTERM and SIGKILL on cancellation.
    pub kill_grace_secs: u64,

    /// Keep failed build outputs under a `.failed` suffix.
    pub keep_failed: bool,

    /// Unix group whose members serve as build users. When unset (or when
    /// not running as root), builders run as the daemon's own user.
    pub build_users_group: Option<String>,

    /// Log filter, overridden by `RUST_LOG`.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/crucible-daemon.sock"),
            store_dir: PathBuf::from(crucible_store_core::store_path::StoreDir::default().to_str()),
            db_path: PathBuf::from("/nix/var/crucible/db.sqlite"),
            build_dir: PathBuf::from("/nix/var/crucible/builds"),
            log_dir: Some(PathBuf::from("/nix/var/crucible/log")),
            max_jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            build_timeout_secs: 0,
            max_silent_secs: 0,
            kill_grace_secs: 10,
            keep_failed: false,
            build_users_group: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, DaemonError> {
        let contents = std::fs::read_to_string(path)
            .io_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Apply `STORE_DIR` and `STORE_SOCKET` from the environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), DaemonError> {
        if let Ok(dir) = std::env::var("STORE_DIR") {
            if !Path::new(&dir).is_absolute() {
                return Err(DaemonError::Config(format!(
                    "STORE_DIR must be absolute, got '{dir}'"
                )));
            }
            self.store_dir = PathBuf::from(dir);
        }
        if let Ok(socket) = std::env::var("STORE_SOCKET") {
            self.socket_path = PathBuf::from(socket);
        }
        Ok(())
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        (self.build_timeout_secs > 0).then(|| Duration::from_secs(self.build_timeout_secs))
    }

    pub fn max_silent(&self) -> Option<Duration> {
        (self.max_silent_secs > 0).then(|| Duration::from_secs(self.max_silent_secs))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}
