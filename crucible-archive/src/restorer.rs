// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Event stream → filesystem.

use std::io;
use std::path::{Path, PathBuf};

use bstr::ByteSlice as _;
use derive_more::Display;
use futures::{Stream, StreamExt as _};
use thiserror::Error;
use tokio::io::AsyncWriteExt as _;
use tracing::trace;

use crate::event::NarEvent;

#[derive(Display, Debug, PartialEq, Eq, Clone, Copy)]
pub enum RestoreOperation {
    #[display("creating directory")]
    CreateDirectory,
    #[display("creating symlink")]
    CreateSymlink,
    #[display("creating file")]
    CreateFile,
}

#[derive(Error, Debug)]
pub enum NarRestoreError {
    #[error("{operation} {path}: {source}")]
    Write {
        operation: RestoreOperation,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed event stream: {0}")]
    Stream(&'static str),
    #[error(transparent)]
    Source(io::Error),
}

impl NarRestoreError {
    fn write(operation: RestoreOperation, path: &Path, source: io::Error) -> Self {
        Self::Write {
            operation,
            path: path.to_owned(),
            source,
        }
    }
}

/// Materialize an event stream at `dest`, which must not exist yet.
pub async fn restore<S>(events: S, dest: impl Into<PathBuf>) -> Result<(), NarRestoreError>
where
    S: Stream<Item = io::Result<NarEvent>>,
{
    let mut path: PathBuf = dest.into();
    let mut depth: usize = 0;
    let mut open_file: Option<(tokio::fs::File, u64)> = None;

    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        let event = event.map_err(NarRestoreError::Source)?;
        if open_file.is_some() && !matches!(event, NarEvent::FileData(_)) {
            return Err(NarRestoreError::Stream("file data ended early"));
        }
        match event {
            NarEvent::File {
                name,
                executable,
                size,
            } => {
                let file_path = join_name(&path, &name, depth)?;
                trace!(path = %file_path.display(), size, "restoring file");
                let mut options = tokio::fs::OpenOptions::new();
                options.write(true).create_new(true);
                options.mode(if executable { 0o777 } else { 0o666 });
                let file = options
                    .open(&file_path)
                    .await
                    .map_err(|e| NarRestoreError::write(RestoreOperation::CreateFile, &file_path, e))?;
                if size == 0 {
                    drop(file);
                } else {
                    open_file = Some((file, size));
                    path = file_path;
                    continue;
                }
            }
            NarEvent::FileData(chunk) => {
                let Some((file, remaining)) = open_file.as_mut() else {
                    return Err(NarRestoreError::Stream("file data without an open file"));
                };
                if (chunk.len() as u64) > *remaining {
                    return Err(NarRestoreError::Stream("file data exceeds announced size"));
                }
                file.write_all(&chunk)
                    .await
                    .map_err(|e| NarRestoreError::write(RestoreOperation::CreateFile, &path, e))?;
                *remaining -= chunk.len() as u64;
                if *remaining == 0 {
                    let (mut file, _) = open_file.take().unwrap();
                    file.flush()
                        .await
                        .map_err(|e| NarRestoreError::write(RestoreOperation::CreateFile, &path, e))?;
                    path.pop();
                }
            }
            NarEvent::Symlink { name, target } => {
                let link_path = join_name(&path, &name, depth)?;
                let target = target
                    .to_os_str()
                    .map_err(|_| NarRestoreError::Stream("symlink target is not valid UTF-8"))?
                    .to_owned();
                tokio::fs::symlink(target, &link_path)
                    .await
                    .map_err(|e| {
                        NarRestoreError::write(RestoreOperation::CreateSymlink, &link_path, e)
                    })?;
            }
            NarEvent::StartDirectory { name } => {
                let dir_path = join_name(&path, &name, depth)?;
                tokio::fs::create_dir(&dir_path)
                    .await
                    .map_err(|e| {
                        NarRestoreError::write(RestoreOperation::CreateDirectory, &dir_path, e)
                    })?;
                path = dir_path;
                depth += 1;
            }
            NarEvent::EndDirectory => {
                if depth == 0 {
                    return Err(NarRestoreError::Stream("unbalanced directory close"));
                }
                depth -= 1;
                path.pop();
            }
        }
    }

    if open_file.is_some() {
        return Err(NarRestoreError::Stream("event stream ended inside a file"));
    }
    if depth != 0 {
        return Err(NarRestoreError::Stream("event stream ended inside a directory"));
    }
    Ok(())
}

fn join_name(path: &Path, name: &[u8], depth: usize) -> Result<PathBuf, NarRestoreError> {
    if name.is_empty() {
        if depth != 0 {
            return Err(NarRestoreError::Stream("unnamed entry inside a directory"));
        }
        Ok(path.to_owned())
    } else {
        let name = name
            .to_os_str()
            .map_err(|_| NarRestoreError::Stream("entry name is not valid UTF-8"))?;
        Ok(path.join(name))
    }
}
