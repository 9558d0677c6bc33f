// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Canonical tree serialization for the crucible store.
//!
//! A file tree (regular files with an executable bit, directories, symlinks)
//! serializes to a single deterministic byte stream: directory entries are
//! emitted in ascending byte order of their names, every string is
//! length-prefixed and zero-padded to eight bytes, and equivalent trees
//! produce identical bytes regardless of how the filesystem enumerates them.
//! The format is wire-compatible with NAR archives.
//!
//! The crate is event-based throughout: [`dump`] turns a filesystem path into
//! a stream of [`NarEvent`]s, [`write_nar`] turns an event stream into bytes,
//! [`parse`] turns bytes back into events, and [`restore`] materializes an
//! event stream on disk. File contents travel as bounded [`NarEvent::FileData`]
//! chunks so no stage ever buffers a whole file.

mod dump;
mod event;
mod parser;
mod restorer;
mod wire;
mod writer;

pub use dump::{DUMP_CHUNK_SIZE, dump};
pub use event::NarEvent;
pub use parser::{NarParseError, parse};
pub use restorer::{NarRestoreError, restore};
pub use writer::{NarWriteError, single_file_nar, write_nar};

use std::path::Path;

use futures::TryStreamExt as _;

/// Serialize the tree at `path` into an in-memory buffer.
///
/// Source imports use this: the buffer is scanned for digest rewrites before
/// it is streamed to the store.
pub async fn pack_to_vec(path: &Path) -> Result<Vec<u8>, NarWriteError> {
    let mut buf = Vec::new();
    write_nar(&mut buf, dump(path).map_err(NarWriteError::from)).await?;
    Ok(buf)
}
