// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Self-reference digest rewriting.
//!
//! An object cannot embed its own final path while that path is still being
//! computed from its bytes, so self-referencing objects are serialized with
//! a temporary digest. After the final path is known, every occurrence of
//! the temporary digest is patched in place. Both digests are exactly
//! [`DIGEST_CHARS`] bytes, so offsets stay valid across the rewrite.

use thiserror::Error;

use crate::store_path::DIGEST_CHARS;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum RewriteError {
    #[error("rewrite digest '{0}' is not {DIGEST_CHARS} bytes")]
    BadDigestLength(String),
    #[error("rewrite offset {offset} out of bounds for {len}-byte buffer")]
    OffsetOutOfBounds { offset: usize, len: usize },
}

/// Byte offsets at which `digest` occurs in `haystack`.
pub fn find_digest_offsets(haystack: &[u8], digest: &str) -> Result<Vec<usize>, RewriteError> {
    if digest.len() != DIGEST_CHARS {
        return Err(RewriteError::BadDigestLength(digest.to_owned()));
    }
    Ok(memchr::memmem::find_iter(haystack, digest.as_bytes()).collect())
}

/// Overwrite `buffer` at each offset with `digest`.
pub fn rewrite_digest_at(
    buffer: &mut [u8],
    offsets: &[usize],
    digest: &str,
) -> Result<(), RewriteError> {
    if digest.len() != DIGEST_CHARS {
        return Err(RewriteError::BadDigestLength(digest.to_owned()));
    }
    for &offset in offsets {
        let end = offset + DIGEST_CHARS;
        if end > buffer.len() {
            return Err(RewriteError::OffsetOutOfBounds {
                offset,
                len: buffer.len(),
            });
        }
        buffer[offset..end].copy_from_slice(digest.as_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod unittests {
    use super::*;

    const OLD: &str = "00000000000000000000000000000000";
    const NEW: &str = "abcdfghijklmnpqrsvwxyz0123456789";

    #[test]
    fn find_and_rewrite() {
        let mut buffer = format!("head {OLD} mid {OLD} tail").into_bytes();
        let offsets = find_digest_offsets(&buffer, OLD).unwrap();
        assert_eq!(offsets.len(), 2);

        rewrite_digest_at(&mut buffer, &offsets, NEW).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text, format!("head {NEW} mid {NEW} tail"));
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(matches!(
            find_digest_offsets(b"", "short"),
            Err(RewriteError::BadDigestLength(_))
        ));
        assert!(matches!(
            rewrite_digest_at(&mut [], &[0], "short"),
            Err(RewriteError::BadDigestLength(_))
        ));
    }

    #[test]
    fn out_of_bounds_offset_rejected() {
        let mut buffer = vec![0u8; 10];
        assert!(matches!(
            rewrite_digest_at(&mut buffer, &[4], NEW),
            Err(RewriteError::OffsetOutOfBounds { .. })
        ));
    }
}
