// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Hash types for the crucible store.
//!
//! A [`Hash`] is an algorithm tag plus an inline digest buffer sized for the
//! largest supported algorithm, so hashes are `Copy` and never allocate.
//! [`Sha256`] is the fixed-width variant used wherever the store format
//! mandates SHA-256 (text content addresses, archive hashes, store path
//! fingerprints). [`Context`] is the streaming counterpart.

use std::fmt as sfmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Digest as _;
use thiserror::Error;

use crucible_utils_base_encoding::{Base, base32};

mod algo;
pub mod fmt;
mod hashing_reader;

pub use algo::{Algorithm, UnknownAlgorithm};
pub use hashing_reader::HashingReader;

const LARGEST_ALGORITHM: Algorithm = Algorithm::LARGEST;

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[error("hash has wrong length {length} != {} for hash type '{algorithm}'", algorithm.size())]
pub struct InvalidHashError {
    algorithm: Algorithm,
    length: usize,
}

/// A digest tagged with its algorithm.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct Hash {
    algorithm: Algorithm,
    data: [u8; LARGEST_ALGORITHM.size()],
}

impl Hash {
    pub const fn new(algorithm: Algorithm, digest: &[u8]) -> Hash {
        let mut data = [0u8; LARGEST_ALGORITHM.size()];
        let (prefix, _) = data.split_at_mut(algorithm.size());
        prefix.copy_from_slice(digest);
        Hash { algorithm, data }
    }

    pub fn from_slice(algorithm: Algorithm, digest: &[u8]) -> Result<Hash, InvalidHashError> {
        if digest.len() != algorithm.size() {
            return Err(InvalidHashError {
                algorithm,
                length: digest.len(),
            });
        }
        Ok(Hash::new(algorithm, digest))
    }

    #[inline]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        &self.data[0..self.algorithm.size()]
    }

    /// Render as `<algo>:<base16>`; call `.bare()` on the result to drop
    /// the algorithm prefix.
    pub fn as_base16(&self) -> fmt::Encoded {
        fmt::Encoded::new(*self, Base::Hex)
    }

    /// Render as `<algo>:<base32>`.
    pub fn as_base32(&self) -> fmt::Encoded {
        fmt::Encoded::new(*self, Base::Base32)
    }
}

impl sfmt::Debug for Hash {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        write!(f, "Hash({})", self.as_base32())
    }
}

impl sfmt::Display for Hash {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        write!(f, "{}", self.as_base32())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        self.digest_bytes()
    }
}

impl FromStr for Hash {
    type Err = fmt::ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fmt::parse_prefixed(s)
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.as_base32().to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A SHA-256 digest, the only algorithm allowed in several store formats.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct Sha256([u8; Algorithm::SHA256.size()]);

impl Sha256 {
    pub const fn new(digest: &[u8]) -> Self {
        let mut data = [0u8; Algorithm::SHA256.size()];
        data.copy_from_slice(digest);
        Self(data)
    }

    pub fn from_slice(digest: &[u8]) -> Result<Self, InvalidHashError> {
        if digest.len() != Algorithm::SHA256.size() {
            return Err(InvalidHashError {
                algorithm: Algorithm::SHA256,
                length: digest.len(),
            });
        }
        Ok(Self::new(digest))
    }

    /// One-shot SHA-256 of `data`.
    ///
    /// ```
    /// # use crucible_utils_hash::Sha256;
    /// let hash = Sha256::digest("abc");
    /// assert_eq!(
    ///     hash.to_string(),
    ///     "sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s",
    /// );
    /// ```
    pub fn digest<B: AsRef<[u8]>>(data: B) -> Self {
        Self::new(&sha2::Sha256::digest(data.as_ref()))
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_base16(&self) -> fmt::Encoded {
        Hash::from(*self).as_base16()
    }

    pub fn as_base32(&self) -> fmt::Encoded {
        Hash::from(*self).as_base32()
    }
}

impl sfmt::Debug for Sha256 {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        write!(f, "Sha256({})", self.as_base32())
    }
}

impl sfmt::Display for Sha256 {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        write!(f, "{}", self.as_base32())
    }
}

impl AsRef<[u8]> for Sha256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Sha256> for Hash {
    fn from(value: Sha256) -> Self {
        Hash::new(Algorithm::SHA256, value.as_ref())
    }
}

impl TryFrom<Hash> for Sha256 {
    type Error = fmt::ParseHashError;

    fn try_from(value: Hash) -> Result<Self, Self::Error> {
        if value.algorithm() != Algorithm::SHA256 {
            return Err(fmt::ParseHashError::TypeMismatch {
                expected: Algorithm::SHA256,
                actual: value.algorithm(),
            });
        }
        Ok(Self::new(value.as_ref()))
    }
}

impl FromStr for Sha256 {
    type Err = fmt::ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fmt::parse(Algorithm::SHA256, s)?.try_into()
    }
}

impl Serialize for Sha256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.as_base32().to_string())
    }
}

impl<'de> Deserialize<'de> for Sha256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// XOR-fold a digest down to `size` bytes, by byte index modulo `size`.
///
/// Store path digests are 20-byte compressions of a 32-byte SHA-256.
pub fn compress_hash(digest: &[u8], size: usize) -> Vec<u8> {
    let mut result = vec![0u8; size];
    for (i, &byte) in digest.iter().enumerate() {
        result[i % size] ^= byte;
    }
    result
}

/// Compress to 20 bytes and render in the store's base-32 alphabet, the
/// textual digest form used in store path names.
pub fn compressed_base32(digest: &[u8]) -> String {
    base32::encode_string(&compress_hash(digest, 20))
}

enum InnerContext {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

/// A streaming (init-update-finish) digest computation.
///
/// ```
/// use crucible_utils_hash as hash;
///
/// let one_shot = hash::Algorithm::SHA256.digest("hello, world");
///
/// let mut ctx = hash::Context::new(hash::Algorithm::SHA256);
/// ctx.update("hello");
/// ctx.update(", world");
/// assert_eq!(one_shot, ctx.finish());
/// ```
pub struct Context(Algorithm, InnerContext);

impl Context {
    pub fn new(algorithm: Algorithm) -> Self {
        let inner = match algorithm {
            Algorithm::MD5 => InnerContext::Md5(md5::Context::new()),
            Algorithm::SHA1 => InnerContext::Sha1(sha1::Sha1::new()),
            Algorithm::SHA256 => InnerContext::Sha256(sha2::Sha256::new()),
            Algorithm::SHA512 => InnerContext::Sha512(sha2::Sha512::new()),
        };
        Context(algorithm, inner)
    }

    pub fn update<D: AsRef<[u8]>>(&mut self, data: D) {
        let data = data.as_ref();
        match &mut self.1 {
            InnerContext::Md5(ctx) => ctx.consume(data),
            InnerContext::Sha1(ctx) => ctx.update(data),
            InnerContext::Sha256(ctx) => ctx.update(data),
            InnerContext::Sha512(ctx) => ctx.update(data),
        }
    }

    /// Finalize, consuming the context.
    pub fn finish(self) -> Hash {
        match self.1 {
            InnerContext::Md5(ctx) => Hash::new(self.0, ctx.finalize().as_ref()),
            InnerContext::Sha1(ctx) => Hash::new(self.0, &ctx.finalize()),
            InnerContext::Sha256(ctx) => Hash::new(self.0, &ctx.finalize()),
            InnerContext::Sha512(ctx) => Hash::new(self.0, &ctx.finalize()),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.0
    }
}

impl sfmt::Debug for Context {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        f.debug_tuple("Context").field(&self.0).finish()
    }
}

/// A digest sink implementing [`AsyncWrite`], tracking the byte count.
///
/// [`AsyncWrite`]: tokio::io::AsyncWrite
#[derive(Debug)]
pub struct HashSink(Option<(u64, Context)>);

impl HashSink {
    pub fn new(algorithm: Algorithm) -> HashSink {
        HashSink(Some((0, Context::new(algorithm))))
    }

    /// Finalize, returning the byte count and the digest.
    pub fn finish(self) -> (u64, Hash) {
        let (written, ctx) = self.0.unwrap();
        (written, ctx.finish())
    }
}

impl tokio::io::AsyncWrite for HashSink {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.0.as_mut() {
            None => std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "cannot write to HashSink after calling finish()",
            ))),
            Some((written, ctx)) => {
                *written += buf.len() as u64;
                ctx.update(buf);
                std::task::Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod unittests {
    use hex_literal::hex;
    use rstest::rstest;

    use super::*;

    const SHA1_ABC: Hash = Hash::new(
        Algorithm::SHA1,
        &hex!("a9993e364706816aba3e25717850c26c9cd0d89d"),
    );
    const SHA256_ABC: Hash = Hash::new(
        Algorithm::SHA256,
        &hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"),
    );
    const SHA256_LONG: Hash = Hash::new(
        Algorithm::SHA256,
        &hex!("248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1"),
    );
    const SHA512_ABC: Hash = Hash::new(
        Algorithm::SHA512,
        &hex!(
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        ),
    );
    const MD5_ABC: Hash = Hash::new(Algorithm::MD5, &hex!("900150983cd24fb0d6963f7d28e17f72"));

    #[rstest]
    #[case::sha1(&SHA1_ABC, "abc")]
    #[case::sha256(&SHA256_ABC, "abc")]
    #[case::sha256_long(&SHA256_LONG, "abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq")]
    #[case::sha512(&SHA512_ABC, "abc")]
    #[case::md5(&MD5_ABC, "abc")]
    fn digest(#[case] expected: &Hash, #[case] input: &str) {
        assert_eq!(expected.algorithm().digest(input), *expected);
    }

    #[rstest]
    #[case::sha1(&SHA1_ABC)]
    #[case::sha256(&SHA256_ABC)]
    #[case::sha512(&SHA512_ABC)]
    #[case::md5(&MD5_ABC)]
    fn streaming_matches_one_shot(#[case] expected: &Hash) {
        let mut ctx = Context::new(expected.algorithm());
        ctx.update("a");
        ctx.update("bc");
        assert_eq!(ctx.finish(), *expected);
    }

    #[test]
    fn compress_to_twenty() {
        let compressed = compress_hash(SHA256_ABC.digest_bytes(), 20);
        assert_eq!(compressed.len(), 20);
        // Byte 0 folds bytes 0 and 20 of the input.
        assert_eq!(
            compressed[0],
            SHA256_ABC.digest_bytes()[0] ^ SHA256_ABC.digest_bytes()[20]
        );
    }

    #[test]
    fn compressed_base32_width() {
        assert_eq!(compressed_base32(SHA256_ABC.digest_bytes()).len(), 32);
    }

    #[tokio::test]
    async fn hash_sink() {
        let mut reader: &[u8] = b"hello, world";
        let mut sink = HashSink::new(Algorithm::SHA256);
        tokio::io::copy(&mut reader, &mut sink).await.unwrap();
        let (size, hash) = sink.finish();
        assert_eq!(size, 12);
        assert_eq!(hash, Algorithm::SHA256.digest("hello, world"));
    }

    #[test]
    fn serde_roundtrip() {
        let json = serde_json::to_value(SHA256_ABC).unwrap();
        assert_eq!(
            json.as_str().unwrap(),
            "sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
        );
        let back: Hash = serde_json::from_value(json).unwrap();
        assert_eq!(back, SHA256_ABC);
    }
}
