// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Serialized bytes → event stream.
//!
//! The parser accepts only canonical serializations: tokens must match the
//! grammar exactly, padding must be zero, entry names must be valid and in
//! strictly ascending order. Anything else is a hard error; there is no
//! recovery, since a non-canonical archive would hash differently than the
//! tree it claims to represent.

use bstr::BStr;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _};

use async_stream::try_stream;

use crate::event::NarEvent;
use crate::wire;
use crate::writer::{NAR_VERSION_MAGIC, validate_name};

/// Tokens longer than this are rejected outright; nothing in the grammar
/// except file contents comes close.
const MAX_TOKEN_LEN: u64 = 4096;

const PARSE_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum NarParseError {
    #[error("io error reading archive: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing archive version magic")]
    BadMagic,
    #[error("at byte {offset}: expected {expected}, got '{got}'")]
    UnexpectedToken {
        offset: u64,
        expected: &'static str,
        got: String,
    },
    #[error("at byte {offset}: token of {len} bytes exceeds limit")]
    OversizedToken { offset: u64, len: u64 },
    #[error("at byte {offset}: nonzero padding")]
    BadPadding { offset: u64 },
    #[error("invalid entry name '{0}'")]
    InvalidFileName(String),
    #[error("entry '{name}' not in ascending order after '{previous}'")]
    UnsortedEntry { name: String, previous: String },
}

struct TokenReader<R> {
    inner: R,
    offset: u64,
}

impl<R: AsyncRead + Unpin> TokenReader<R> {
    async fn read_u64(&mut self) -> Result<u64, NarParseError> {
        let value = wire::read_u64(&mut self.inner).await?;
        self.offset += 8;
        Ok(value)
    }

    /// Read one length-prefixed token, bounded by `MAX_TOKEN_LEN`.
    async fn token(&mut self) -> Result<Bytes, NarParseError> {
        let len = self.read_u64().await?;
        if len > MAX_TOKEN_LEN {
            return Err(NarParseError::OversizedToken {
                offset: self.offset - 8,
                len,
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).await?;
        self.offset += len;
        self.padding(len).await?;
        Ok(Bytes::from(buf))
    }

    async fn padding(&mut self, len: u64) -> Result<(), NarParseError> {
        if !wire::read_padding(&mut self.inner, len).await? {
            return Err(NarParseError::BadPadding { offset: self.offset });
        }
        self.offset += wire::padding_len(len) as u64;
        Ok(())
    }

    async fn expect(&mut self, expected: &'static [u8]) -> Result<(), NarParseError> {
        let token = self.token().await?;
        if token != expected {
            return Err(NarParseError::UnexpectedToken {
                offset: self.offset,
                expected: std::str::from_utf8(expected).unwrap_or("?"),
                got: BStr::new(&token).to_string(),
            });
        }
        Ok(())
    }
}

/// Parse a serialized tree from `reader` into a stream of events.
///
/// File contents are yielded as bounded [`NarEvent::FileData`] chunks.
pub fn parse<R>(reader: R) -> impl Stream<Item = Result<NarEvent, NarParseError>>
where
    R: AsyncRead + Unpin,
{
    let mut r = TokenReader {
        inner: reader,
        offset: 0,
    };
    try_stream! {
        let magic = r.token().await?;
        if magic != NAR_VERSION_MAGIC {
            Err(NarParseError::BadMagic)?;
        }

        // Iterative descent; each frame is an open directory with the name
        // of its last entry for order checking.
        let mut dir_stack: Vec<Option<Bytes>> = Vec::new();
        let mut pending_name: Option<Bytes> = None;

        loop {
            let name = pending_name.take().unwrap_or_default();
            r.expect(b"(").await?;
            r.expect(b"type").await?;
            let node_type = r.token().await?;
            match node_type.as_ref() {
                b"regular" => {
                    let mut token = r.token().await?;
                    let executable = token.as_ref() == b"executable";
                    if executable {
                        r.expect(b"").await?;
                        token = r.token().await?;
                    }
                    if token.as_ref() != b"contents" {
                        Err(NarParseError::UnexpectedToken {
                            offset: r.offset,
                            expected: "contents",
                            got: BStr::new(&token).to_string(),
                        })?;
                    }
                    let size = r.read_u64().await?;
                    yield NarEvent::File {
                        name,
                        executable,
                        size,
                    };
                    let mut remaining = size;
                    let mut buf = vec![0u8; PARSE_CHUNK_SIZE.min(remaining.max(1) as usize)];
                    while remaining > 0 {
                        let want = buf.len().min(remaining as usize);
                        let n = r.inner.read(&mut buf[..want]).await?;
                        if n == 0 {
                            Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
                        }
                        r.offset += n as u64;
                        remaining -= n as u64;
                        yield NarEvent::FileData(Bytes::copy_from_slice(&buf[..n]));
                    }
                    r.padding(size).await?;
                    r.expect(b")").await?;
                    if !dir_stack.is_empty() {
                        // Close this node's entry wrapper.
                        r.expect(b")").await?;
                    }
                }
                b"symlink" => {
                    r.expect(b"target").await?;
                    let target = r.token().await?;
                    yield NarEvent::Symlink { name, target };
                    r.expect(b")").await?;
                    if !dir_stack.is_empty() {
                        r.expect(b")").await?;
                    }
                }
                b"directory" => {
                    yield NarEvent::StartDirectory { name };
                    dir_stack.push(None);
                }
                other => {
                    Err(NarParseError::UnexpectedToken {
                        offset: r.offset,
                        expected: "regular, symlink or directory",
                        got: BStr::new(other).to_string(),
                    })?;
                }
            }

            // Unwind: read directory entries or close frames until either a
            // new node begins or the root completes.
            loop {
                let Some(last_name) = dir_stack.last_mut() else {
                    return;
                };
                let token = r.token().await?;
                match token.as_ref() {
                    b"entry" => {
                        r.expect(b"(").await?;
                        r.expect(b"name").await?;
                        let name = r.token().await?;
                        validate_name(&name)
                            .map_err(|_| NarParseError::InvalidFileName(BStr::new(&name).to_string()))?;
                        if let Some(previous) = last_name
                            && name.as_ref() <= previous.as_ref()
                        {
                            Err(NarParseError::UnsortedEntry {
                                name: BStr::new(&name).to_string(),
                                previous: BStr::new(previous).to_string(),
                            })?;
                        }
                        *last_name = Some(name.clone());
                        r.expect(b"node").await?;
                        pending_name = Some(name);
                        break;
                    }
                    b")" => {
                        dir_stack.pop();
                        yield NarEvent::EndDirectory;
                        if dir_stack.is_empty() {
                            return;
                        }
                        // The entry wrapper around the just-closed directory.
                        r.expect(b")").await?;
                        continue;
                    }
                    other => {
                        Err(NarParseError::UnexpectedToken {
                            offset: r.offset,
                            expected: "entry or )",
                            got: BStr::new(other).to_string(),
                        })?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod unittests {
    use super::*;
    use crate::writer::single_file_nar;
    use futures::StreamExt as _;

    async fn first_error(bytes: &[u8]) -> NarParseError {
        let mut events = std::pin::pin!(parse(bytes));
        while let Some(event) = events.next().await {
            if let Err(err) = event {
                return err;
            }
        }
        panic!("expected a parse error");
    }

    #[tokio::test]
    async fn bad_magic_rejected() {
        let mut nar = single_file_nar(Bytes::from_static(b"x"), false);
        nar[8] = b'X';
        assert!(matches!(first_error(&nar).await, NarParseError::BadMagic));
    }

    #[tokio::test]
    async fn nonzero_padding_rejected() {
        let mut nar = single_file_nar(Bytes::from_static(b"x"), false);
        // The single content byte is followed by seven bytes of padding.
        let contents_at = nar
            .windows(1)
            .rposition(|w| w == b"x")
            .unwrap();
        nar[contents_at + 1] = 1;
        assert!(matches!(
            first_error(&nar).await,
            NarParseError::BadPadding { .. }
        ));
    }

    #[tokio::test]
    async fn truncated_rejected() {
        let nar = single_file_nar(Bytes::from_static(b"hello world"), false);
        let err = first_error(&nar[..nar.len() - 10]).await;
        assert!(matches!(err, NarParseError::Io(_)));
    }
}
