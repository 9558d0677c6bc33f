// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Store paths and their validation.
//!
//! A store object's base name is `<digest>-<name>`: a 32-character base-32
//! digest (20 bytes compressed out of a SHA-256 fingerprint) followed by a
//! human-readable name of 1..=211 characters from a restricted alphabet.
//! [`StorePath`] is the validated form; path accessors exist only on it.

mod store_dir;

pub use store_dir::{MakeStorePathError, StoreDir};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crucible_utils_base_encoding::base32;

/// Raw length of a store path digest.
pub const DIGEST_BYTES: usize = 20;

/// Encoded length of a store path digest.
pub const DIGEST_CHARS: usize = 32;

/// Maximum length of the name part of a store path.
pub const MAX_NAME_LEN: usize = 211;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum StorePathNameError {
    #[error("store path name is empty")]
    NameTooShort,
    #[error("store path name is {0} characters, longer than {MAX_NAME_LEN}")]
    NameTooLong(usize),
    #[error("store path name contains forbidden byte {1:#04x} at position {0}")]
    NameBadChars(usize, u8),
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum ParseStorePathError {
    #[error("'{0}' is not a valid store path base name")]
    InvalidPath(String),
    #[error("store path digest '{0}' is not 32 base-32 characters")]
    BadDigest(String),
    #[error(transparent)]
    Name(#[from] StorePathNameError),
    #[error("path '{path}' is not inside the store directory '{store_dir}'")]
    NotInStore { path: String, store_dir: String },
}

fn name_byte_ok(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'+' | b'.' | b'_' | b'?' | b'=' | b'-')
}

/// The human-readable half of a store object name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct StorePathName(String);

impl StorePathName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the name carries the `.drv` derivation marker.
    pub fn is_derivation(&self) -> bool {
        self.0.ends_with(".drv")
    }

    /// The name with any `.drv` suffix removed.
    pub fn without_drv_extension(&self) -> &str {
        self.0.strip_suffix(".drv").unwrap_or(&self.0)
    }
}

impl fmt::Display for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorePathName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for StorePathName {
    type Err = StorePathNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(StorePathNameError::NameTooShort);
        }
        if s.len() > MAX_NAME_LEN {
            return Err(StorePathNameError::NameTooLong(s.len()));
        }
        if let Some(pos) = s.bytes().position(|b| !name_byte_ok(b)) {
            return Err(StorePathNameError::NameBadChars(pos, s.as_bytes()[pos]));
        }
        Ok(StorePathName(s.to_owned()))
    }
}

impl<'de> Deserialize<'de> for StorePathName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The digest half of a store object name, kept in its encoded form so that
/// ordering matches the textual ordering of full paths.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePathDigest([u8; DIGEST_CHARS]);

impl StorePathDigest {
    /// Wrap a 20-byte compressed fingerprint.
    pub fn from_bytes(bytes: &[u8; DIGEST_BYTES]) -> Self {
        let mut encoded = [0u8; DIGEST_CHARS];
        base32::encode_mut(bytes, &mut encoded);
        StorePathDigest(encoded)
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).expect("digest is ASCII")
    }
}

impl fmt::Display for StorePathDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for StorePathDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePathDigest({self})")
    }
}

impl FromStr for StorePathDigest {
    type Err = ParseStorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_CHARS {
            return Err(ParseStorePathError::BadDigest(s.to_owned()));
        }
        let mut scratch = [0u8; DIGEST_BYTES];
        base32::decode_mut(s.as_bytes(), &mut scratch)
            .map_err(|_| ParseStorePathError::BadDigest(s.to_owned()))?;
        let mut encoded = [0u8; DIGEST_CHARS];
        encoded.copy_from_slice(s.as_bytes());
        Ok(StorePathDigest(encoded))
    }
}

/// A validated store object name: `<digest>-<name>`.
///
/// `StorePath` is relative to a [`StoreDir`]; rendering the absolute path
/// requires one (`store_dir.display(&path)`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    digest: StorePathDigest,
    name: StorePathName,
}

impl StorePath {
    pub fn new(digest: StorePathDigest, name: StorePathName) -> Self {
        StorePath { digest, name }
    }

    /// Build a path from a 20-byte compressed fingerprint digest.
    pub fn from_digest(digest: &[u8; DIGEST_BYTES], name: StorePathName) -> Self {
        StorePath {
            digest: StorePathDigest::from_bytes(digest),
            name,
        }
    }

    pub fn digest(&self) -> &StorePathDigest {
        &self.digest
    }

    pub fn name(&self) -> &StorePathName {
        &self.name
    }

    pub fn is_derivation(&self) -> bool {
        self.name.is_derivation()
    }

    /// The base name, `<digest>-<name>`.
    pub fn base_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.digest, self.name)
    }
}

impl FromStr for StorePath {
    type Err = ParseStorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (digest, name) = s
            .split_once('-')
            .ok_or_else(|| ParseStorePathError::InvalidPath(s.to_owned()))?;
        Ok(StorePath {
            digest: digest.parse()?,
            name: name.parse()?,
        })
    }
}

impl Serialize for StorePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StorePath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn arb_base_name() -> impl Strategy<Value = String> {
        (
            proptest::collection::vec(
                proptest::sample::select(
                    crucible_utils_base_encoding::base32::ALPHABET
                        .chars()
                        .collect::<Vec<_>>(),
                ),
                32,
            ),
            "[A-Za-z0-9+._?=-]{1,40}",
        )
            .prop_map(|(digest, name)| {
                let digest: String = digest.into_iter().collect();
                format!("{digest}-{name}")
            })
    }

    proptest! {
        /// Parsing a joined path round-trips and exposes dir and base.
        #[test]
        fn full_path_roundtrip(base in arb_base_name()) {
            let store_dir = StoreDir::default();
            let path: StorePath = base.parse().unwrap();
            prop_assert_eq!(path.to_string(), base);

            let full = store_dir.display(&path).to_string();
            let reparsed = store_dir.parse_path(&full).unwrap();
            prop_assert_eq!(reparsed, path);
        }
    }
}
