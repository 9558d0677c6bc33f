// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Shared daemon-side store state.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crucible_store_core::derivation::{Derivation, parse_aterm};
use crucible_store_core::store_path::{StoreDir, StorePath};
use crucible_store_db::{OpenMode, StoreDb};

use crate::config::Config;
use crate::error::{DaemonError, DaemonResult, IoContext as _};

/// The daemon's handle on the store directory and metadata database.
#[derive(Clone)]
pub struct LocalStore {
    store_dir: StoreDir,
    db: Arc<Mutex<StoreDb>>,
}

impl LocalStore {
    /// Open the store described by `config`, creating directories and the
    /// database as needed.
    pub fn open(config: &Config) -> DaemonResult<Self> {
        let store_dir_str = config
            .store_dir
            .to_str()
            .ok_or_else(|| DaemonError::Config("store_dir is not valid UTF-8".into()))?;
        let store_dir = StoreDir::new(store_dir_str)
            .map_err(|e| DaemonError::Config(format!("invalid store_dir: {e}")))?;

        std::fs::create_dir_all(&config.store_dir)
            .io_context(|| format!("creating store directory {}", config.store_dir.display()))?;
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)
                .io_context(|| format!("creating database directory {}", parent.display()))?;
        }
        std::fs::create_dir_all(&config.build_dir)
            .io_context(|| format!("creating build directory {}", config.build_dir.display()))?;
        if let Some(log_dir) = &config.log_dir {
            std::fs::create_dir_all(log_dir)
                .io_context(|| format!("creating log directory {}", log_dir.display()))?;
        }

        let db = StoreDb::open(&config.db_path, OpenMode::Create)?;
        info!(store_dir = %store_dir, db = %config.db_path.display(), "opened store");

        Ok(LocalStore {
            store_dir,
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// In-memory variant rooted at a caller-provided directory, for tests.
    pub fn open_ephemeral(store_dir: StoreDir) -> DaemonResult<Self> {
        std::fs::create_dir_all(store_dir.to_path())
            .io_context(|| format!("creating store directory {}", store_dir))?;
        Ok(LocalStore {
            store_dir,
            db: Arc::new(Mutex::new(StoreDb::open_memory()?)),
        })
    }

    pub fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    pub fn db(&self) -> &Arc<Mutex<StoreDb>> {
        &self.db
    }

    /// Absolute filesystem location of a store object.
    pub fn object_path(&self, path: &StorePath) -> PathBuf {
        self.store_dir.join(path)
    }

    /// Parse an absolute path against this store's directory.
    pub fn parse_path(&self, s: &str) -> DaemonResult<StorePath> {
        Ok(self.store_dir.parse_path(s)?)
    }

    /// Registered *and* materialized.
    pub async fn exists(&self, path: &StorePath) -> DaemonResult<bool> {
        let rendered = self.store_dir.display(path).to_string();
        let registered = self.db.lock().await.is_valid_path(&rendered)?;
        Ok(registered && self.object_path(path).exists())
    }

    /// Load and parse a `.drv` object.
    pub async fn read_derivation(&self, drv_path: &StorePath) -> DaemonResult<Derivation> {
        if !drv_path.is_derivation() {
            return Err(DaemonError::InvalidPath(format!(
                "{drv_path} is not a derivation path"
            )));
        }
        if !self.exists(drv_path).await? {
            return Err(DaemonError::NotFound(
                self.store_dir.display(drv_path).to_string(),
            ));
        }

        let disk_path = self.object_path(drv_path);
        let text = tokio::fs::read_to_string(&disk_path)
            .await
            .io_context(|| format!("reading derivation {}", disk_path.display()))?;

        let name: crucible_store_core::store_path::StorePathName = drv_path
            .name()
            .without_drv_extension()
            .parse()
            .map_err(DaemonError::Name)?;

        parse_aterm(&self.store_dir, &text, &name).map_err(|e| DaemonError::DerivationParse {
            path: self.store_dir.display(drv_path).to_string(),
            detail: e.to_string(),
        })
    }
}
