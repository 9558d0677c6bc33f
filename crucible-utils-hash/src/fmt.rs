// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Textual hash formats.
//!
//! Hashes render as `<algorithm>:<digits>` where the digits may be base-16,
//! the store's base-32, or base-64; bare forms drop the prefix. Parsing
//! accepts any of the three digit encodings, disambiguated by length.

use std::fmt;

use thiserror::Error;

use crate::{Algorithm, Hash, UnknownAlgorithm};
use crucible_utils_base_encoding::Base;

/// Largest textual digest: sha512 in base-16.
const MAX_ENCODED: usize = Algorithm::LARGEST.size() * 2;

/// A hash prepared for display in a particular base.
#[derive(Clone, Copy)]
pub struct Encoded {
    hash: Hash,
    base: Base,
    prefix: bool,
}

impl Encoded {
    pub(crate) fn new(hash: Hash, base: Base) -> Self {
        Encoded {
            hash,
            base,
            prefix: true,
        }
    }

    /// Drop the `<algorithm>:` prefix.
    pub fn bare(mut self) -> Self {
        self.prefix = false;
        self
    }
}

impl fmt::Display for Encoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix {
            write!(f, "{}:", self.hash.algorithm())?;
        }
        let digest = self.hash.digest_bytes();
        let mut buf = [0u8; MAX_ENCODED];
        let len = self.base.input_len(digest.len());
        self.base.encode_mut(digest, &mut buf[..len]);
        f.write_str(std::str::from_utf8(&buf[..len]).expect("encoded digits are ASCII"))
    }
}

impl fmt::Debug for Encoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum ParseHashError {
    #[error(transparent)]
    UnknownAlgorithm(#[from] UnknownAlgorithm),
    #[error("hash '{digits}' has wrong length for hash type '{algorithm}'")]
    WrongLength { algorithm: Algorithm, digits: String },
    #[error("hash '{digits}' has invalid {base} digits")]
    BadDigits { base: Base, digits: String },
    #[error("hash should have type '{expected}' but got '{actual}'")]
    TypeMismatch {
        expected: Algorithm,
        actual: Algorithm,
    },
    #[error("hash '{0}' is missing an '<algorithm>:' prefix")]
    MissingPrefix(String),
}

/// Parse `<algorithm>:<digits>`.
pub fn parse_prefixed(s: &str) -> Result<Hash, ParseHashError> {
    let (algo, digits) = s
        .split_once(':')
        .ok_or_else(|| ParseHashError::MissingPrefix(s.to_owned()))?;
    parse_bare(algo.parse()?, digits)
}

/// Parse either `<algorithm>:<digits>` or bare digits of the given
/// algorithm. A conflicting prefix is rejected.
pub fn parse(algorithm: Algorithm, s: &str) -> Result<Hash, ParseHashError> {
    match s.split_once(':') {
        Some((algo, digits)) => {
            let actual: Algorithm = algo.parse()?;
            if actual != algorithm {
                return Err(ParseHashError::TypeMismatch {
                    expected: algorithm,
                    actual,
                });
            }
            parse_bare(algorithm, digits)
        }
        None => parse_bare(algorithm, s),
    }
}

fn parse_bare(algorithm: Algorithm, digits: &str) -> Result<Hash, ParseHashError> {
    let size = algorithm.size();
    let base = [Base::Hex, Base::Base32, Base::Base64]
        .into_iter()
        .find(|base| base.input_len(size) == digits.len())
        .ok_or_else(|| ParseHashError::WrongLength {
            algorithm,
            digits: digits.to_owned(),
        })?;

    let mut buf = vec![0u8; base.scratch_len(digits.len())];
    let n = base
        .decode_mut(digits.as_bytes(), &mut buf)
        .map_err(|_| ParseHashError::BadDigits {
            base,
            digits: digits.to_owned(),
        })?;
    Hash::from_slice(algorithm, &buf[..n]).map_err(|_| ParseHashError::WrongLength {
        algorithm,
        digits: digits.to_owned(),
    })
}
