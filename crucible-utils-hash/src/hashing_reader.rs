// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! An [`AsyncRead`] wrapper that hashes everything passing through it.
//!
//! Import decoding uses this to compute the archive hash of exactly the
//! bytes the archive parser consumed, without a second pass.
//!
//! [`AsyncRead`]: tokio::io::AsyncRead

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::{Algorithm, Context, Hash};

pub struct HashingReader<R> {
    inner: R,
    context: Context,
    bytes_read: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R, algorithm: Algorithm) -> Self {
        HashingReader {
            inner,
            context: Context::new(algorithm),
            bytes_read: 0,
        }
    }

    /// Finalize, returning the byte count and digest of everything read.
    pub fn finish(self) -> (u64, Hash) {
        (self.bytes_read, self.context.finish())
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let new_bytes = &buf.filled()[before..];
                this.context.update(new_bytes);
                this.bytes_read += new_bytes.len() as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod unittests {
    use super::*;
    use tokio::io::AsyncReadExt as _;

    #[tokio::test]
    async fn hashes_what_passes_through() {
        let data = b"some bytes worth hashing";
        let mut reader = HashingReader::new(&data[..], Algorithm::SHA256);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        let (count, hash) = reader.finish();
        assert_eq!(out, data);
        assert_eq!(count, data.len() as u64);
        assert_eq!(hash, Algorithm::SHA256.digest(data));
    }

    #[tokio::test]
    async fn partial_reads_accumulate() {
        let data = b"0123456789";
        let mut reader = HashingReader::new(&data[..], Algorithm::SHA256);
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(reader.bytes_read(), 4);
        reader.read_exact(&mut buf).await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        let (count, hash) = reader.finish();
        assert_eq!(count, 10);
        assert_eq!(hash, Algorithm::SHA256.digest(data));
    }
}
