// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The evaluator-side import cache.
//!
//! Serializing and hashing a large source tree on every evaluation is
//! wasteful when nothing changed. This client-local database remembers,
//! per `(source_path, name)`, the store path a previous import produced
//! together with a *stamp* per directory entry. If every stamp still
//! matches and the daemon confirms the store path exists, the import is
//! skipped entirely. The cache is advisory: a miss or a stale entry only
//! costs a re-import.

use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt as _;
use std::path::Path;

use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum EvalCacheError {
    #[error("cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("walking source tree: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("io error stamping source: {0}")]
    Io(#[from] std::io::Error),
}

const SCHEMA: &str = r#"
create table if not exists imports (
    source_path text not null,
    name        text not null,
    store_path  text not null,
    primary key (source_path, name)
);

create table if not exists stamps (
    source_path text not null,
    name        text not null,
    entry       text not null,
    stamp       text not null,
    primary key (source_path, name, entry),
    foreign key (source_path, name) references imports(source_path, name) on delete cascade
);
"#;

pub struct EvalCache {
    conn: Connection,
}

impl EvalCache {
    pub fn open(path: &Path) -> Result<Self, EvalCacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(EvalCache { conn })
    }

    pub fn open_memory() -> Result<Self, EvalCacheError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(EvalCache { conn })
    }

    /// The cached store path for `(source_path, name)` if every stamp
    /// still matches the filesystem.
    pub fn lookup(
        &self,
        source_path: &Path,
        name: &str,
    ) -> Result<Option<String>, EvalCacheError> {
        let source_key = source_path.to_string_lossy();
        let store_path: Option<String> = self
            .conn
            .query_row(
                "SELECT store_path FROM imports WHERE source_path = ?1 AND name = ?2",
                params![source_key, name],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some(store_path) = store_path else {
            return Ok(None);
        };

        let mut cached = BTreeMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT entry, stamp FROM stamps WHERE source_path = ?1 AND name = ?2")?;
        let rows = stmt.query_map(params![source_key, name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (entry, stamp) = row?;
            cached.insert(entry, stamp);
        }

        let current = stamp_tree(source_path)?;
        if current == cached {
            debug!(source = %source_path.display(), "eval cache stamps match");
            Ok(Some(store_path))
        } else {
            debug!(source = %source_path.display(), "eval cache stamps changed");
            Ok(None)
        }
    }

    /// Record a fresh import with the current stamps.
    pub fn record(
        &mut self,
        source_path: &Path,
        name: &str,
        store_path: &str,
    ) -> Result<(), EvalCacheError> {
        let stamps = stamp_tree(source_path)?;
        let source_key = source_path.to_string_lossy().into_owned();

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO imports (source_path, name, store_path) VALUES (?1, ?2, ?3)",
            params![source_key, name, store_path],
        )?;
        tx.execute(
            "DELETE FROM stamps WHERE source_path = ?1 AND name = ?2",
            params![source_key, name],
        )?;
        for (entry, stamp) in &stamps {
            tx.execute(
                "INSERT INTO stamps (source_path, name, entry, stamp) VALUES (?1, ?2, ?3, ?4)",
                params![source_key, name, entry, stamp],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// One stamp per entry: `(mtime, size, inode, mode, uid, gid)` for regular
/// files, `dir` for directories, `link:<target>` for symlinks.
fn stamp_tree(root: &Path) -> Result<BTreeMap<String, String>, EvalCacheError> {
    let mut stamps = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under the root")
            .to_string_lossy()
            .into_owned();

        let file_type = entry.file_type();
        let stamp = if file_type.is_dir() {
            "dir".to_string()
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            format!("link:{}", target.to_string_lossy())
        } else {
            let metadata = entry.metadata()?;
            format!(
                "{}:{}:{}:{}:{}:{}",
                metadata.mtime(),
                metadata.size(),
                metadata.ino(),
                metadata.mode(),
                metadata.uid(),
                metadata.gid(),
            )
        };
        stamps.insert(rel, stamp);
    }
    Ok(stamps)
}

#[cfg(test)]
mod unittests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("file"), b"contents").unwrap();

        let mut cache = EvalCache::open_memory().unwrap();
        assert_eq!(cache.lookup(&src, "my-src").unwrap(), None);

        cache
            .record(&src, "my-src", "/nix/store/00000000000000000000000000000000-my-src")
            .unwrap();
        assert_eq!(
            cache.lookup(&src, "my-src").unwrap().as_deref(),
            Some("/nix/store/00000000000000000000000000000000-my-src")
        );
    }

    #[test]
    fn content_change_invalidates() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("file"), b"one").unwrap();

        let mut cache = EvalCache::open_memory().unwrap();
        cache.record(&src, "n", "/nix/store/00000000000000000000000000000000-n").unwrap();

        // Adding an entry changes the stamp set even if mtimes coincide.
        std::fs::write(src.join("second"), b"two").unwrap();
        assert_eq!(cache.lookup(&src, "n").unwrap(), None);
    }

    #[test]
    fn different_names_are_distinct_keys() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();

        let mut cache = EvalCache::open_memory().unwrap();
        cache.record(&src, "a", "/nix/store/00000000000000000000000000000000-a").unwrap();
        assert_eq!(cache.lookup(&src, "b").unwrap(), None);
    }

    #[test]
    fn symlink_stamps_track_target() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::os::unix::fs::symlink("old-target", src.join("link")).unwrap();

        let mut cache = EvalCache::open_memory().unwrap();
        cache.record(&src, "n", "/nix/store/00000000000000000000000000000000-n").unwrap();

        std::fs::remove_file(src.join("link")).unwrap();
        std::os::unix::fs::symlink("new-target", src.join("link")).unwrap();
        assert_eq!(cache.lookup(&src, "n").unwrap(), None);
    }
}
