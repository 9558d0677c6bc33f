// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Shared test harness: a store rooted in a temp directory with an
//! in-memory database.

use std::path::PathBuf;

use tempfile::TempDir;

use crucible_store_core::store_path::StoreDir;

use crate::build_users::BuildUserPool;
use crate::config::Config;
use crate::scheduler::Scheduler;
use crate::store::LocalStore;

pub struct TestStore {
    pub root: TempDir,
    pub store: LocalStore,
    pub config: Config,
}

impl TestStore {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let store_dir_path = root.path().join("store");
        let store_dir = StoreDir::new(store_dir_path.to_str().unwrap()).unwrap();
        let store = LocalStore::open_ephemeral(store_dir).unwrap();

        let build_dir = root.path().join("builds");
        std::fs::create_dir_all(&build_dir).unwrap();

        let config = Config {
            store_dir: store_dir_path,
            build_dir,
            log_dir: None,
            max_jobs: 4,
            ..Config::default()
        };

        TestStore {
            root,
            store,
            config,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.config.clone(),
            BuildUserPool::disabled(),
        )
    }

    /// A scratch path outside the store.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }
}
