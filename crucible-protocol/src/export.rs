// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The store export wire format.
//!
//! An export stream is a concatenation of records:
//!
//! ```text
//! record  = MAGIC(8) || tree-serialization || trailer
//! trailer = TRAILER_MAGIC(8)
//!           padded_string(store_path)
//!           u64le(ref_count) padded_string(ref)*
//!           padded_string(deriver)      # may be empty
//!           zeros(8)
//! ```
//!
//! where `padded_string(s) = u64le(len) || s || zero-pad-to-8`. Eight zero
//! bytes in place of the next record's magic end the stream. The tree
//! serialization is self-delimiting; the decoder runs the archive parser
//! over the connection to find its end.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Marks the start of a record.
pub const RECORD_MAGIC: [u8; 8] = [0x01, 0, 0, 0, 0, 0, 0, 0];

/// Separates the tree serialization from its trailer.
pub const TRAILER_MAGIC: [u8; 8] = *b"NIXE\0\0\0\0";

const ZEROS: [u8; 8] = [0u8; 8];

/// Longest padded string accepted in a trailer; paths and references are
/// far shorter.
const MAX_STRING_LEN: u64 = 64 * 1024;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("io error on export stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown record magic {0:02x?}")]
    BadMagic([u8; 8]),
    #[error("missing trailer magic")]
    BadTrailerMagic,
    #[error("trailer string of {0} bytes exceeds limit")]
    OversizedString(u64),
    #[error("nonzero padding in trailer")]
    BadPadding,
}

/// Metadata following each serialized tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTrailer {
    /// Absolute destination store path.
    pub path: String,
    /// Absolute paths of the object's references.
    pub references: Vec<String>,
    /// Absolute path of the producing derivation, if known.
    pub deriver: Option<String>,
}

const fn padding_len(len: u64) -> usize {
    (len.wrapping_neg() & 7) as usize
}

async fn write_padded_string<W: AsyncWrite + Unpin>(
    writer: &mut W,
    s: &str,
) -> std::io::Result<()> {
    writer.write_all(&(s.len() as u64).to_le_bytes()).await?;
    writer.write_all(s.as_bytes()).await?;
    writer
        .write_all(&ZEROS[..padding_len(s.len() as u64)])
        .await
}

async fn read_padded_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ExportError> {
    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes).await?;
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_STRING_LEN {
        return Err(ExportError::OversizedString(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let pad = padding_len(len);
    if pad > 0 {
        let mut padding = [0u8; 8];
        reader.read_exact(&mut padding[..pad]).await?;
        if padding[..pad].iter().any(|b| *b != 0) {
            return Err(ExportError::BadPadding);
        }
    }
    String::from_utf8(buf)
        .map_err(|e| ExportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

/// Write one record: magic, serialized tree, trailer.
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    nar: &[u8],
    trailer: &ExportTrailer,
) -> std::io::Result<()> {
    writer.write_all(&RECORD_MAGIC).await?;
    writer.write_all(nar).await?;
    writer.write_all(&TRAILER_MAGIC).await?;
    write_padded_string(writer, &trailer.path).await?;
    writer
        .write_all(&(trailer.references.len() as u64).to_le_bytes())
        .await?;
    for reference in &trailer.references {
        write_padded_string(writer, reference).await?;
    }
    write_padded_string(writer, trailer.deriver.as_deref().unwrap_or("")).await?;
    writer.write_all(&ZEROS).await
}

/// Terminate the stream.
pub async fn write_end<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    writer.write_all(&ZEROS).await?;
    writer.flush().await
}

/// Read the next record's magic. `false` means the stream ended cleanly.
/// On `true`, the tree serialization follows on the reader; parse it, then
/// call [`read_trailer`].
pub async fn read_record_start<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool, ExportError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).await?;
    if magic == ZEROS {
        return Ok(false);
    }
    if magic != RECORD_MAGIC {
        return Err(ExportError::BadMagic(magic));
    }
    Ok(true)
}

/// Read the trailer that follows a tree serialization.
pub async fn read_trailer<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ExportTrailer, ExportError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).await?;
    if magic != TRAILER_MAGIC {
        return Err(ExportError::BadTrailerMagic);
    }
    let path = read_padded_string(reader).await?;

    let mut count_bytes = [0u8; 8];
    reader.read_exact(&mut count_bytes).await?;
    let ref_count = u64::from_le_bytes(count_bytes);
    if ref_count > MAX_STRING_LEN {
        return Err(ExportError::OversizedString(ref_count));
    }
    let mut references = Vec::with_capacity(ref_count as usize);
    for _ in 0..ref_count {
        references.push(read_padded_string(reader).await?);
    }

    let deriver = read_padded_string(reader).await?;

    let mut padding = [0u8; 8];
    reader.read_exact(&mut padding).await?;
    if padding != ZEROS {
        return Err(ExportError::BadPadding);
    }

    Ok(ExportTrailer {
        path,
        references,
        deriver: (!deriver.is_empty()).then_some(deriver),
    })
}
