// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Base encodings used by the crucible store.
//!
//! The store digest encoding is a base-32 variant with a custom alphabet and
//! reversed output order; base-16 and base-64 are stock `data-encoding`
//! encodings. All encoders work on caller-provided buffers so hash formatting
//! never allocates per digit.

use data_encoding::{BASE64, DecodePartial, HEXLOWER_PERMISSIVE};

pub mod base32;

/// The base encodings a hash can be rendered in.
#[derive(derive_more::Display, Debug, PartialEq, Eq, Clone, Copy)]
pub enum Base {
    #[display("base16")]
    Hex,
    #[display("base32")]
    Base32,
    #[display("base64")]
    Base64,
}

impl Base {
    /// Length of the textual form for a digest of `len` bytes.
    pub const fn input_len(&self, len: usize) -> usize {
        match self {
            Base::Hex => len * 2,
            Base::Base32 => base32::encode_len(len),
            Base::Base64 => ((4 * len / 3) + 3) & !3,
        }
    }

    /// Scratch buffer size needed when decoding `len` bytes of text.
    pub const fn scratch_len(&self, len: usize) -> usize {
        match self {
            Base::Hex => len / 2,
            Base::Base32 => base32::decode_scratch_len(len),
            Base::Base64 => len / 4 * 3,
        }
    }

    /// Encode `input` into `output`, which must be exactly
    /// `input_len(input.len())` bytes.
    pub fn encode_mut(&self, input: &[u8], output: &mut [u8]) {
        match self {
            Base::Hex => HEXLOWER_PERMISSIVE.encode_mut(input, output),
            Base::Base32 => base32::encode_mut(input, output),
            Base::Base64 => BASE64.encode_mut(input, output),
        }
    }

    /// Decode `input` into `output`, returning the number of bytes written.
    pub fn decode_mut(&self, input: &[u8], output: &mut [u8]) -> Result<usize, DecodePartial> {
        match self {
            Base::Hex => HEXLOWER_PERMISSIVE.decode_mut(input, output),
            Base::Base32 => base32::decode_mut(input, output),
            Base::Base64 => BASE64.decode_mut(input, output),
        }
    }
}
