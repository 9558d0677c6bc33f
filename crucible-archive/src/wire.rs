// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Token layer of the serialization: length-prefixed strings padded to
//! eight bytes, written little-endian.

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

pub(crate) const ZEROS: [u8; 8] = [0u8; 8];

pub(crate) const fn padding_len(len: u64) -> usize {
    (len.wrapping_neg() & 7) as usize
}

pub(crate) async fn write_u64<W: AsyncWrite + Unpin>(w: &mut W, value: u64) -> std::io::Result<()> {
    w.write_all(&value.to_le_bytes()).await
}

pub(crate) async fn write_token<W: AsyncWrite + Unpin>(
    w: &mut W,
    token: &[u8],
) -> std::io::Result<()> {
    write_u64(w, token.len() as u64).await?;
    w.write_all(token).await?;
    w.write_all(&ZEROS[..padding_len(token.len() as u64)]).await
}

pub(crate) async fn write_padding<W: AsyncWrite + Unpin>(
    w: &mut W,
    len: u64,
) -> std::io::Result<()> {
    w.write_all(&ZEROS[..padding_len(len)]).await
}

/// Synchronous counterparts for in-memory buffers.
pub(crate) fn push_token(buf: &mut Vec<u8>, token: &[u8]) {
    buf.extend_from_slice(&(token.len() as u64).to_le_bytes());
    buf.extend_from_slice(token);
    buf.extend_from_slice(&ZEROS[..padding_len(token.len() as u64)]);
}

pub(crate) async fn read_u64<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

/// Read and discard the padding for a `len`-byte token, requiring zeros.
pub(crate) async fn read_padding<R: AsyncRead + Unpin>(
    r: &mut R,
    len: u64,
) -> std::io::Result<bool> {
    let pad = padding_len(len);
    if pad == 0 {
        return Ok(true);
    }
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf[..pad]).await?;
    Ok(buf[..pad].iter().all(|b| *b == 0))
}

#[cfg(test)]
mod unittests {
    use super::*;

    #[test]
    fn padding() {
        assert_eq!(padding_len(0), 0);
        assert_eq!(padding_len(1), 7);
        assert_eq!(padding_len(7), 1);
        assert_eq!(padding_len(8), 0);
        assert_eq!(padding_len(14), 2);
    }

    #[test]
    fn token_layout() {
        let mut buf = Vec::new();
        push_token(&mut buf, b"nix-archive-1");
        assert_eq!(
            buf,
            b"\x0d\x00\x00\x00\x00\x00\x00\x00nix-archive-1\x00\x00\x00"
        );
    }
}
