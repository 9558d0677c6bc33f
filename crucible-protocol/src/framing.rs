// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Length-prefixed JSON record framing.
//!
//! Every RPC record is `u64le(len) || json_bytes`. A frame limit bounds
//! memory; JSON records are small, and bulk data (import bodies) bypasses
//! framing entirely.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Upper bound for a single JSON record.
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("io error on rpc connection: {0}")]
    Io(#[from] std::io::Error),
    #[error("rpc record of {0} bytes exceeds frame limit")]
    TooLarge(u64),
    #[error("malformed rpc record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write one JSON record.
pub async fn write_record<W, T>(writer: &mut W, record: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(record)?;
    writer.write_all(&(payload.len() as u64).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON record. `Ok(None)` means the peer closed the connection
/// cleanly between records.
pub async fn read_record<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 8];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod unittests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Probe {
        id: u64,
        text: String,
    }

    #[tokio::test]
    async fn roundtrip() {
        let record = Probe {
            id: 42,
            text: "ping".into(),
        };
        let mut buf = Vec::new();
        write_record(&mut buf, &record).await.unwrap();

        let mut reader = &buf[..];
        let back: Probe = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(back, record);

        // Nothing left → clean end of stream.
        let end: Option<Probe> = read_record(&mut reader).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn oversized_record_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut reader = &buf[..];
        let err = read_record::<_, Probe>(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn truncated_payload_is_io_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u64.to_le_bytes());
        buf.extend_from_slice(b"{\"id\":1");
        let mut reader = &buf[..];
        let err = read_record::<_, Probe>(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }
}
