// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Write operations.
//!
//! Multi-row updates run inside immediate transactions so a crash never
//! leaves a store object registered without its references (or vice versa).

use std::collections::BTreeSet;
use std::time::SystemTime;

use rusqlite::{TransactionBehavior, params};

use crate::connection::StoreDb;
use crate::error::Result;
use crate::types::system_time_to_unix;

/// Parameters for registering a store object.
#[derive(Debug, Clone)]
pub struct RegisterObjectParams {
    /// Absolute store path.
    pub path: String,
    /// Textual content address.
    pub ca: String,
    /// Hash of the object's tree serialization.
    pub nar_hash: String,
    pub nar_size: u64,
    /// Absolute paths this object references. A self-reference simply names
    /// `path` itself.
    pub references: BTreeSet<String>,
}

/// A finished row for the `build_log` table.
#[derive(Debug, Clone)]
pub struct BuildLogEntry {
    pub drv_path: String,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    /// Terminal status, e.g. `built`, `failed`, `timedOut`, `canceled`.
    pub status: String,
    /// Where the captured builder output went, if persisted.
    pub log_blob_ref: Option<String>,
}

impl StoreDb {
    /// Register a store object and its references in one transaction.
    ///
    /// Referenced paths must already be registered (a self-reference counts,
    /// since the referrer row is inserted first); callers register objects
    /// in dependency order.
    pub fn register_object(&mut self, object: &RegisterObjectParams) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            r#"
            INSERT INTO store_objects (path, ca, nar_hash, nar_size, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                object.path,
                object.ca,
                object.nar_hash,
                object.nar_size as i64,
                system_time_to_unix(SystemTime::now()),
            ],
        )?;

        for reference in &object.references {
            tx.execute(
                "INSERT OR REPLACE INTO refs (referrer, reference) VALUES (?1, ?2)",
                params![object.path, reference],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Record a realized output. Replaces an existing row for the same
    /// `(drv_path, output_name)`.
    pub fn record_realization(
        &mut self,
        drv_path: &str,
        output_name: &str,
        store_path: &str,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO realizations (drv_path, output_name, store_path, timestamp)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                drv_path,
                output_name,
                store_path,
                system_time_to_unix(SystemTime::now()),
            ],
        )?;
        Ok(())
    }

    /// Append a build log row.
    pub fn record_build_log(&mut self, entry: &BuildLogEntry) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO build_log (drv_path, started_at, ended_at, status, log_blob_ref)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entry.drv_path,
                system_time_to_unix(entry.started_at),
                system_time_to_unix(entry.ended_at),
                entry.status,
                entry.log_blob_ref,
            ],
        )?;
        Ok(())
    }

    /// Remove a store object; cascades to its outgoing references and any
    /// realizations pointing at it.
    pub fn invalidate_path(&mut self, path: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM store_objects WHERE path = ?1", params![path])?;
        Ok(rows > 0)
    }
}
