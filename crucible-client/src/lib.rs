// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Client library for the crucible daemon.
//!
//! The evaluator links against this crate: it imports source trees and
//! derivations into the store over the daemon socket, asks for
//! realizations, and keeps a local stamp cache so unchanged source trees
//! are not re-serialized on every evaluation.

pub mod client;
pub mod eval_cache;
pub mod source;

pub use client::{ClientError, DaemonClient};
pub use eval_cache::EvalCache;
pub use source::{
    SourceImport, import_bytes, import_derivation, import_source, import_source_cached,
};
