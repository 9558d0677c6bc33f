// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The client ↔ daemon protocol.
//!
//! Two layers share one socket connection:
//!
//! - **RPC**: length-prefixed JSON records. Requests carry
//!   `{method, id, params}`, responses `{id, result}` or `{id, error}`.
//! - **Export stream**: the body of an `Import` request, following its JSON
//!   header on the same connection. A sequence of framed archive records,
//!   each a serialized tree plus a trailer naming the destination path, its
//!   references and an optional deriver.

pub mod export;
pub mod framing;
pub mod messages;

pub use messages::{
    BuildHandle, BuildOutcome, ErrorBody, ErrorKind, ExistsResult, ImportResult, Request,
    RequestBody, Response,
};
