// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Event stream → serialized bytes.
//!
//! The writer validates the event stream as it goes: directory entries must
//! arrive in strictly ascending name order, file data must match the
//! announced size, and nesting must balance. A stream that violates any of
//! these would produce a non-canonical serialization, so it is rejected
//! instead of written.

use bstr::BStr;
use bytes::Bytes;
use futures::{Stream, StreamExt as _};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};

use crate::event::NarEvent;
use crate::wire;

pub(crate) const NAR_VERSION_MAGIC: &[u8] = b"nix-archive-1";

/// Longest allowed directory entry name, matching common filesystem limits.
pub(crate) const MAX_NAME_LEN: usize = 255;

#[derive(Error, Debug)]
pub enum NarWriteError {
    #[error("io error writing archive: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid entry name '{0}'")]
    InvalidFileName(String),
    #[error("entry '{name}' not in ascending order after '{previous}'")]
    UnsortedEntry { name: String, previous: String },
    #[error("file data ended {remaining} bytes short of announced size {size}")]
    TruncatedFile { size: u64, remaining: u64 },
    #[error("file data exceeds announced size {size}")]
    OversizedFile { size: u64 },
    #[error("unexpected event: {0}")]
    UnexpectedEvent(&'static str),
}

pub(crate) fn validate_name(name: &[u8]) -> Result<(), NarWriteError> {
    let bad = name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name == b"."
        || name == b".."
        || name.contains(&b'/')
        || name.contains(&0);
    if bad {
        return Err(NarWriteError::InvalidFileName(
            BStr::new(name).to_string(),
        ));
    }
    Ok(())
}

struct DirFrame {
    last_name: Option<Bytes>,
}

#[derive(Clone, Copy)]
enum State {
    /// Expecting the next node (or `EndDirectory` when inside a directory).
    Node,
    /// Streaming file contents.
    FileData { size: u64, remaining: u64 },
    /// Root node complete; no further events allowed.
    Done,
}

struct NarWriter<'w, W> {
    inner: &'w mut W,
    written: u64,
    dirs: Vec<DirFrame>,
    state: State,
}

impl<'w, W: AsyncWrite + Unpin> NarWriter<'w, W> {
    async fn token(&mut self, token: &[u8]) -> std::io::Result<()> {
        wire::write_token(self.inner, token).await?;
        self.written += 8 + token.len() as u64 + wire::padding_len(token.len() as u64) as u64;
        Ok(())
    }

    async fn raw(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Write the `entry(name ...node` preamble for a named node, enforcing
    /// entry ordering; the root node has an empty name and no wrapper.
    async fn open_node(&mut self, name: &Bytes) -> Result<(), NarWriteError> {
        match self.dirs.last_mut() {
            Some(frame) => {
                validate_name(name)?;
                if let Some(previous) = &frame.last_name
                    && name.as_ref() <= previous.as_ref()
                {
                    return Err(NarWriteError::UnsortedEntry {
                        name: BStr::new(name).to_string(),
                        previous: BStr::new(previous).to_string(),
                    });
                }
                frame.last_name = Some(name.clone());
                self.token(b"entry").await?;
                self.token(b"(").await?;
                self.token(b"name").await?;
                self.token(name).await?;
                self.token(b"node").await?;
            }
            None => {
                if !name.is_empty() {
                    return Err(NarWriteError::UnexpectedEvent(
                        "root node must not carry a name",
                    ));
                }
            }
        }
        self.token(b"(").await?;
        self.token(b"type").await?;
        Ok(())
    }

    /// Close the current node and, when nested, its `entry(` wrapper.
    async fn close_node(&mut self) -> Result<(), NarWriteError> {
        self.token(b")").await?;
        if self.dirs.is_empty() {
            self.state = State::Done;
        } else {
            self.token(b")").await?;
            self.state = State::Node;
        }
        Ok(())
    }

    async fn event(&mut self, event: NarEvent) -> Result<(), NarWriteError> {
        match (self.state, event) {
            (
                State::Node,
                NarEvent::File {
                    name,
                    executable,
                    size,
                },
            ) => {
                self.open_node(&name).await?;
                self.token(b"regular").await?;
                if executable {
                    self.token(b"executable").await?;
                    self.token(b"").await?;
                }
                self.token(b"contents").await?;
                wire::write_u64(self.inner, size).await?;
                self.written += 8;
                if size == 0 {
                    self.close_node().await?;
                } else {
                    self.state = State::FileData {
                        size,
                        remaining: size,
                    };
                }
            }
            (State::FileData { size, remaining }, NarEvent::FileData(chunk)) => {
                if chunk.len() as u64 > remaining {
                    return Err(NarWriteError::OversizedFile { size });
                }
                let remaining = remaining - chunk.len() as u64;
                self.raw(&chunk).await?;
                if remaining == 0 {
                    wire::write_padding(self.inner, size).await?;
                    self.written += wire::padding_len(size) as u64;
                    self.state = State::Node;
                    self.close_node().await?;
                } else {
                    self.state = State::FileData { size, remaining };
                }
            }
            (State::FileData { size, remaining }, _) => {
                return Err(NarWriteError::TruncatedFile { size, remaining });
            }
            (State::Node, NarEvent::Symlink { name, target }) => {
                self.open_node(&name).await?;
                self.token(b"symlink").await?;
                self.token(b"target").await?;
                self.token(&target).await?;
                self.close_node().await?;
            }
            (State::Node, NarEvent::StartDirectory { name }) => {
                self.open_node(&name).await?;
                self.token(b"directory").await?;
                self.dirs.push(DirFrame { last_name: None });
            }
            (State::Node, NarEvent::EndDirectory) => {
                if self.dirs.pop().is_none() {
                    return Err(NarWriteError::UnexpectedEvent(
                        "EndDirectory without matching StartDirectory",
                    ));
                }
                self.close_node().await?;
            }
            (State::Node, NarEvent::FileData(_)) => {
                return Err(NarWriteError::UnexpectedEvent("FileData outside a file"));
            }
            (State::Done, _) => {
                return Err(NarWriteError::UnexpectedEvent("event after root node closed"));
            }
        }
        Ok(())
    }
}

/// Serialize `events` into `writer`, returning the number of bytes written.
pub async fn write_nar<W, S>(writer: &mut W, events: S) -> Result<u64, NarWriteError>
where
    W: AsyncWrite + Unpin,
    S: Stream<Item = Result<NarEvent, NarWriteError>>,
{
    let mut nar = NarWriter {
        inner: writer,
        written: 0,
        dirs: Vec::new(),
        state: State::Node,
    };
    nar.token(NAR_VERSION_MAGIC).await?;

    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        nar.event(event?).await?;
    }

    match nar.state {
        State::Done => {
            nar.inner.flush().await?;
            Ok(nar.written)
        }
        State::FileData { size, remaining } => {
            Err(NarWriteError::TruncatedFile { size, remaining })
        }
        State::Node => Err(NarWriteError::UnexpectedEvent(
            "event stream ended before the root node completed",
        )),
    }
}

/// Serialize a single regular file with the given contents.
///
/// Text store objects and byte-buffer sources wrap their payload this way.
pub fn single_file_nar(contents: Bytes, executable: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(contents.len() + 128);
    wire::push_token(&mut buf, NAR_VERSION_MAGIC);
    wire::push_token(&mut buf, b"(");
    wire::push_token(&mut buf, b"type");
    wire::push_token(&mut buf, b"regular");
    if executable {
        wire::push_token(&mut buf, b"executable");
        wire::push_token(&mut buf, b"");
    }
    wire::push_token(&mut buf, b"contents");
    wire::push_token(&mut buf, &contents);
    wire::push_token(&mut buf, b")");
    buf
}

#[cfg(test)]
mod unittests {
    use super::*;
    use futures::stream;

    fn ok(event: NarEvent) -> Result<NarEvent, NarWriteError> {
        Ok(event)
    }

    #[tokio::test]
    async fn unsorted_entries_rejected() {
        let events = stream::iter(
            vec![
                NarEvent::StartDirectory { name: Bytes::new() },
                NarEvent::File {
                    name: Bytes::from_static(b"b"),
                    executable: false,
                    size: 0,
                },
                NarEvent::File {
                    name: Bytes::from_static(b"a"),
                    executable: false,
                    size: 0,
                },
            ]
            .into_iter()
            .map(ok),
        );
        let mut buf = Vec::new();
        let err = write_nar(&mut buf, events).await.unwrap_err();
        assert!(matches!(err, NarWriteError::UnsortedEntry { .. }));
    }

    #[tokio::test]
    async fn duplicate_entry_rejected() {
        let events = stream::iter(
            vec![
                NarEvent::StartDirectory { name: Bytes::new() },
                NarEvent::Symlink {
                    name: Bytes::from_static(b"x"),
                    target: Bytes::from_static(b"t"),
                },
                NarEvent::Symlink {
                    name: Bytes::from_static(b"x"),
                    target: Bytes::from_static(b"t"),
                },
            ]
            .into_iter()
            .map(ok),
        );
        let mut buf = Vec::new();
        let err = write_nar(&mut buf, events).await.unwrap_err();
        assert!(matches!(err, NarWriteError::UnsortedEntry { .. }));
    }

    #[tokio::test]
    async fn bad_names_rejected() {
        for name in [&b"."[..], b"..", b"a/b", b"a\0b"] {
            let events = stream::iter(
                vec![
                    NarEvent::StartDirectory { name: Bytes::new() },
                    NarEvent::File {
                        name: Bytes::copy_from_slice(name),
                        executable: false,
                        size: 0,
                    },
                ]
                .into_iter()
                .map(ok),
            );
            let mut buf = Vec::new();
            let err = write_nar(&mut buf, events).await.unwrap_err();
            assert!(matches!(err, NarWriteError::InvalidFileName(_)), "{name:?}");
        }
    }

    #[test]
    fn single_file_nar_layout() {
        // Field-by-field: magic, '(', 'type', 'regular', 'contents', data, ')'.
        let nar = single_file_nar(Bytes::from_static(b"hi"), false);
        let mut expected = Vec::new();
        for token in [
            &b"nix-archive-1"[..],
            b"(",
            b"type",
            b"regular",
            b"contents",
            b"hi",
            b")",
        ] {
            crate::wire::push_token(&mut expected, token);
        }
        assert_eq!(nar, expected);
    }
}
