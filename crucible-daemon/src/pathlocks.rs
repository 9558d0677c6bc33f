// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Filesystem-based store path locks.
//!
//! Each store path `<path>` is protected by an exclusive `flock()` on
//! `<path>.lock`, so imports and builds of the same path coordinate even
//! across daemon processes. The lock releases on drop.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

pub struct PathLock {
    _flock: Flock<File>,
    _lock_path: PathBuf,
}

impl PathLock {
    /// Acquire an exclusive lock on `path`, blocking. Creates
    /// `<path>.lock` as needed.
    pub fn lock(path: &Path) -> io::Result<Self> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::other(format!("flock failed: {errno}")))?;

        Ok(Self {
            _flock: flock,
            _lock_path: lock_path,
        })
    }

    /// Acquire the lock without blocking the async runtime.
    pub async fn lock_async(path: &Path) -> io::Result<Self> {
        let path = path.to_owned();
        tokio::task::spawn_blocking(move || Self::lock(&path))
            .await
            .map_err(|e| io::Error::other(format!("lock task failed: {e}")))?
    }
}

#[cfg(test)]
mod unittests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_lock_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("object");
        let _lock = PathLock::lock(&path).unwrap();
        assert!(dir.path().join("object.lock").exists());
    }

    #[test]
    fn reacquire_after_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("object");
        {
            let _lock = PathLock::lock(&path).unwrap();
        }
        let _lock = PathLock::lock(&path).unwrap();
    }

    #[test]
    fn exclusive_across_threads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contested");
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let lock = PathLock::lock(&path).unwrap();
        let handle = {
            let path = path.clone();
            let order = order.clone();
            std::thread::spawn(move || {
                let _lock = PathLock::lock(&path).unwrap();
                order.lock().unwrap().push("second");
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        order.lock().unwrap().push("first");
        drop(lock);
        handle.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
