// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! SQLite metadata database for the crucible store.
//!
//! The database records which store paths are valid (`store_objects`), what
//! they reference (`refs`), which derivation outputs have been realized
//! (`realizations`), and per-build log bookkeeping (`build_log`). The store
//! directory itself holds only bytes; everything the daemon needs to answer
//! `Exists` or short-circuit a rebuild lives here.
//!
//! Schema changes ship as numbered migrations applied in integer order,
//! tracked in `PRAGMA user_version`.

mod connection;
mod error;
mod migrations;
mod query;
mod types;
mod write;

pub use connection::{OpenMode, StoreDb};
pub use error::{Error, Result};
pub use query::{ObjectInfo, Realization};
pub use types::{system_time_to_unix, unix_to_system_time};
pub use write::{BuildLogEntry, RegisterObjectParams};
