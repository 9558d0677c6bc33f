// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Digest as _;
use thiserror::Error;

use super::Hash;

/// A digest algorithm.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Display, Default)]
pub enum Algorithm {
    #[display("md5")]
    MD5,
    #[display("sha1")]
    SHA1,
    #[default]
    #[display("sha256")]
    SHA256,
    #[display("sha512")]
    SHA512,
}

impl Algorithm {
    pub(crate) const LARGEST: Algorithm = Algorithm::SHA512;

    /// Digest size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        match self {
            Algorithm::MD5 => 128 / 8,
            Algorithm::SHA1 => 160 / 8,
            Algorithm::SHA256 => 256 / 8,
            Algorithm::SHA512 => 512 / 8,
        }
    }

    /// One-shot digest of `data`.
    ///
    /// ```
    /// # use crucible_utils_hash::Algorithm;
    /// let hash = Algorithm::SHA256.digest("abc");
    /// assert_eq!(
    ///     hash.as_base32().to_string(),
    ///     "sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s",
    /// );
    /// ```
    pub fn digest<B: AsRef<[u8]>>(&self, data: B) -> Hash {
        let data = data.as_ref();
        match self {
            Algorithm::MD5 => Hash::new(Algorithm::MD5, md5::compute(data).as_ref()),
            Algorithm::SHA1 => Hash::new(Algorithm::SHA1, &sha1::Sha1::digest(data)),
            Algorithm::SHA256 => Hash::new(Algorithm::SHA256, &sha2::Sha256::digest(data)),
            Algorithm::SHA512 => Hash::new(Algorithm::SHA512, &sha2::Sha512::digest(data)),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
#[error("unsupported digest algorithm '{0}'")]
pub struct UnknownAlgorithm(pub(super) String);

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("sha256") {
            Ok(Algorithm::SHA256)
        } else if s.eq_ignore_ascii_case("sha512") {
            Ok(Algorithm::SHA512)
        } else if s.eq_ignore_ascii_case("sha1") {
            Ok(Algorithm::SHA1)
        } else if s.eq_ignore_ascii_case("md5") {
            Ok(Algorithm::MD5)
        } else {
            Err(UnknownAlgorithm(s.to_owned()))
        }
    }
}

impl Serialize for Algorithm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod unittests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::md5("md5", Algorithm::MD5)]
    #[case::sha1("sha1", Algorithm::SHA1)]
    #[case::sha256("sha256", Algorithm::SHA256)]
    #[case::sha512("sha512", Algorithm::SHA512)]
    #[case::case_insensitive("SHA256", Algorithm::SHA256)]
    fn from_str(#[case] input: &str, #[case] expected: Algorithm) {
        assert_eq!(input.parse::<Algorithm>().unwrap(), expected);
    }

    #[test]
    fn unknown() {
        assert_eq!(
            "sha384".parse::<Algorithm>(),
            Err(UnknownAlgorithm("sha384".into()))
        );
    }

    #[rstest]
    #[case::md5(Algorithm::MD5, 16)]
    #[case::sha1(Algorithm::SHA1, 20)]
    #[case::sha256(Algorithm::SHA256, 32)]
    #[case::sha512(Algorithm::SHA512, 64)]
    fn size(#[case] algorithm: Algorithm, #[case] bytes: usize) {
        assert_eq!(algorithm.size(), bytes);
        assert_eq!(algorithm.digest("abc").digest_bytes().len(), bytes);
    }
}
