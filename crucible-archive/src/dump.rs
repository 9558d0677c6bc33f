// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Filesystem → event stream.
//!
//! The walk visits each directory's entries in ascending byte order of
//! their names, so the resulting serialization is identical no matter how
//! the filesystem enumerates them.

use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;

use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use tokio::io::AsyncReadExt as _;
use tracing::trace;
use walkdir::WalkDir;

use crate::event::NarEvent;

/// Size of [`NarEvent::FileData`] chunks produced by [`dump`].
pub const DUMP_CHUNK_SIZE: usize = 64 * 1024;

/// Serialize the file, directory tree, or symlink at `path` into a stream
/// of events.
pub fn dump(path: impl Into<PathBuf>) -> impl Stream<Item = io::Result<NarEvent>> {
    let root = path.into();
    try_stream! {
        let mut open_dirs: usize = 0;

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()));

        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            let depth = entry.depth();
            while open_dirs > depth {
                open_dirs -= 1;
                yield NarEvent::EndDirectory;
            }

            // The root node carries no name.
            let name = if depth == 0 {
                Bytes::new()
            } else {
                Bytes::copy_from_slice(entry.file_name().as_bytes())
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                trace!(path = %entry.path().display(), "dumping directory");
                yield NarEvent::StartDirectory { name };
                open_dirs += 1;
            } else if file_type.is_symlink() {
                let target = tokio::fs::read_link(entry.path()).await?;
                yield NarEvent::Symlink {
                    name,
                    target: Bytes::copy_from_slice(target.as_os_str().as_bytes()),
                };
            } else if file_type.is_file() {
                let metadata = entry.metadata().map_err(io::Error::from)?;
                let executable = metadata.permissions().mode() & 0o100 != 0;
                let size = metadata.len();
                trace!(path = %entry.path().display(), size, "dumping file");
                yield NarEvent::File {
                    name,
                    executable,
                    size,
                };
                for await chunk in file_chunks(entry.path().to_owned(), size) {
                    yield NarEvent::FileData(chunk?);
                }
            } else {
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{}: unsupported file type", entry.path().display()),
                ))?;
            }
        }

        while open_dirs > 0 {
            open_dirs -= 1;
            yield NarEvent::EndDirectory;
        }
    }
}

/// Read a file's contents as fixed-size chunks, checking that the file did
/// not change size underneath us.
fn file_chunks(path: PathBuf, expected: u64) -> impl Stream<Item = io::Result<Bytes>> {
    try_stream! {
        let mut file = tokio::fs::File::open(&path).await?;
        let mut remaining = expected;
        let mut buf = vec![0u8; DUMP_CHUNK_SIZE.min(expected.max(1) as usize)];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{}: file shrank while dumping", path.display()),
                ))?;
            }
            remaining -= n as u64;
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod unittests {
    use super::*;
    use futures::StreamExt as _;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_too_large_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big");
        let data = vec![0xabu8; DUMP_CHUNK_SIZE + 17];
        std::fs::write(&path, &data).unwrap();

        let mut total = 0usize;
        let mut chunks = 0usize;
        let mut events = std::pin::pin!(dump(&path));
        while let Some(event) = events.next().await {
            if let NarEvent::FileData(chunk) = event.unwrap() {
                total += chunk.len();
                chunks += 1;
            }
        }
        assert_eq!(total, data.len());
        assert_eq!(chunks, 2);
    }

    #[tokio::test]
    async fn empty_directory() {
        let dir = TempDir::new().unwrap();
        let events: Vec<_> = dump(dir.path())
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                NarEvent::StartDirectory { name: Bytes::new() },
                NarEvent::EndDirectory,
            ]
        );
    }
}
