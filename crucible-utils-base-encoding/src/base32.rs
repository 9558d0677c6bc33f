// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The store's base-32 digest encoding.
//!
//! A 32-character alphabet (digits plus lowercase letters minus the
//! confusables `e`, `o`, `t`, `u`), bits consumed least-significant first,
//! and the textual output reversed relative to a conventional base-32
//! encoding. Store path digests (20 bytes → 32 characters) and rendered
//! hashes both use this encoding.

use data_encoding::{BitOrder, DecodeError, DecodePartial, Encoding, Specification};
use std::sync::LazyLock;

/// The canonical digest alphabet. Every use of the encoding in the workspace
/// goes through this constant.
pub const ALPHABET: &str = "0123456789abcdfghijklmnpqrsvwxyz";

static DIGEST_BASE32: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str(ALPHABET);
    spec.bit_order = BitOrder::LeastSignificantFirst;
    spec.encoding().unwrap()
});

/// Number of characters produced for `len` input bytes.
pub const fn encode_len(len: usize) -> usize {
    (8 * len).div_ceil(5)
}

/// Number of bytes produced for `len` input characters, tolerating any
/// character count. Use [`decode_len`] when the length must be exact.
pub const fn decode_scratch_len(len: usize) -> usize {
    5 * len / 8
}

/// Number of bytes produced for `len` input characters.
///
/// Panics if `len` is not a valid encoded length (a length that
/// [`encode_len`] can produce).
pub const fn decode_len(len: usize) -> usize {
    let trail = len * 5 % 8;
    if trail >= 5 {
        panic!("invalid base32 input length");
    }
    5 * len / 8
}

/// Encode `input` into a freshly allocated string.
#[allow(unsafe_code)]
pub fn encode_string(input: &[u8]) -> String {
    let mut output = DIGEST_BASE32.encode(input);
    // The store encoding emits the most significant character first.
    unsafe { output.as_bytes_mut() }.reverse();
    output
}

/// Encode `input` into `output`, which must be `encode_len(input.len())`
/// bytes long.
pub fn encode_mut(input: &[u8], output: &mut [u8]) {
    DIGEST_BASE32.encode_mut(input, output);
    output.reverse();
}

/// Decode `input` into `output`, validating alphabet and length.
pub fn decode_mut(input: &[u8], output: &mut [u8]) -> Result<usize, DecodePartial> {
    let mut reversed = input.to_vec();
    reversed.reverse();

    DIGEST_BASE32.decode_mut(&reversed, output).map_err(|err| {
        // Report the error position in terms of the caller's (unreversed)
        // input.
        let pos = input.len() - err.error.position - 1;
        DecodePartial {
            read: pos / 8 * 8,
            written: pos / 8 * 5,
            error: DecodeError {
                position: pos,
                kind: err.error.kind,
            },
        }
    })
}

/// Decode `input` into a freshly allocated buffer.
pub fn decode_string(input: &str) -> Result<Vec<u8>, DecodePartial> {
    let mut output = vec![0u8; decode_scratch_len(input.len())];
    let n = decode_mut(input.as_bytes(), &mut output)?;
    output.truncate(n);
    Ok(output)
}


#[cfg(test)]
mod proptests {
    use proptest::{prop_assert_eq, proptest};

    use super::*;

    proptest! {
        #[test]
        fn roundtrip(data: Vec<u8>) {
            let encoded = encode_string(&data);
            prop_assert_eq!(decode_string(&encoded).unwrap(), data);
        }

        #[test]
        fn alphabet_only(data: Vec<u8>) {
            let encoded = encode_string(&data);
            prop_assert_eq!(encoded.chars().filter(|c| !ALPHABET.contains(*c)).count(), 0);
        }
    }
}
