// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Read operations.

use std::collections::BTreeSet;

use rusqlite::{OptionalExtension as _, params};

use crate::connection::StoreDb;
use crate::error::Result;

/// Metadata of a registered store object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub path: String,
    pub ca: String,
    pub nar_hash: String,
    pub nar_size: u64,
    pub registered_at: i64,
}

/// A recorded build outcome row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realization {
    pub drv_path: String,
    pub output_name: String,
    pub store_path: String,
    pub timestamp: i64,
}

impl StoreDb {
    /// Whether `path` is registered.
    pub fn is_valid_path(&self, path: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM store_objects WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Metadata of `path`, if registered.
    pub fn query_object(&self, path: &str) -> Result<Option<ObjectInfo>> {
        self.conn
            .query_row(
                r#"
                SELECT path, ca, nar_hash, nar_size, registered_at
                FROM store_objects WHERE path = ?1
                "#,
                params![path],
                |row| {
                    Ok(ObjectInfo {
                        path: row.get(0)?,
                        ca: row.get(1)?,
                        nar_hash: row.get(2)?,
                        nar_size: row.get::<_, i64>(3)? as u64,
                        registered_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// The references of `path`, sorted.
    pub fn references_of(&self, path: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT reference FROM refs WHERE referrer = ?1")?;
        let rows = stmt.query_map(params![path], |row| row.get::<_, String>(0))?;
        let mut result = BTreeSet::new();
        for row in rows {
            result.insert(row?);
        }
        Ok(result)
    }

    /// The recorded output path of `(drv_path, output_name)`, if any.
    pub fn query_realization(&self, drv_path: &str, output_name: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT store_path FROM realizations WHERE drv_path = ?1 AND output_name = ?2",
                params![drv_path, output_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// All recorded outputs of `drv_path`.
    pub fn realizations_for(&self, drv_path: &str) -> Result<Vec<Realization>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT drv_path, output_name, store_path, timestamp
            FROM realizations WHERE drv_path = ?1 ORDER BY output_name
            "#,
        )?;
        let rows = stmt.query_map(params![drv_path], |row| {
            Ok(Realization {
                drv_path: row.get(0)?,
                output_name: row.get(1)?,
                store_path: row.get(2)?,
                timestamp: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<_, _>>().map_err(Into::into)
    }
}
