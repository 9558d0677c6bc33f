// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Content addresses.
//!
//! A content address says how a store object's bytes were reduced to a hash:
//! `Text` is SHA-256 over raw bytes (and only SHA-256), `Flat` hashes raw
//! file bytes with any algorithm, `Recursive` hashes the canonical tree
//! serialization. The textual form (`text:…`, `fixed:…`, `fixed:r:…`) is
//! what the metadata database stores in its `ca` column.

use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crucible_utils_hash::fmt::ParseHashError;
use crucible_utils_hash::{Algorithm, Hash, Sha256, fmt};

/// The ingestion method, without the hash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ContentAddressMethod {
    #[display("text")]
    Text,
    #[display("flat")]
    Flat,
    #[display("recursive")]
    Recursive,
}

impl ContentAddressMethod {
    /// The method's wire prefix, used in fixed-output hash strings and in
    /// `outputHashMode`-style fields.
    pub fn prefix(&self) -> &'static str {
        match self {
            ContentAddressMethod::Text => "text:",
            ContentAddressMethod::Flat => "",
            ContentAddressMethod::Recursive => "r:",
        }
    }
}

/// Method plus hash algorithm, the form carried by floating outputs and the
/// ATerm hash-type field (`text:sha256`, `sha1`, `r:sha256`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum ContentAddressMethodAlgorithm {
    #[display("text:sha256")]
    Text,
    #[display("{_0}")]
    Flat(Algorithm),
    #[display("r:{_0}")]
    Recursive(Algorithm),
}

impl ContentAddressMethodAlgorithm {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            ContentAddressMethodAlgorithm::Text => Algorithm::SHA256,
            ContentAddressMethodAlgorithm::Flat(algorithm) => *algorithm,
            ContentAddressMethodAlgorithm::Recursive(algorithm) => *algorithm,
        }
    }

    pub fn method(&self) -> ContentAddressMethod {
        match self {
            ContentAddressMethodAlgorithm::Text => ContentAddressMethod::Text,
            ContentAddressMethodAlgorithm::Flat(_) => ContentAddressMethod::Flat,
            ContentAddressMethodAlgorithm::Recursive(_) => ContentAddressMethod::Recursive,
        }
    }
}

impl FromStr for ContentAddressMethodAlgorithm {
    type Err = ParseContentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "text:sha256" {
            Ok(Self::Text)
        } else if let Some(algo) = s.strip_prefix("r:") {
            Ok(Self::Recursive(algo.parse()?))
        } else {
            Ok(Self::Flat(s.parse()?))
        }
    }
}

/// A store object's content address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum ContentAddress {
    #[display("text:{_0}")]
    Text(Sha256),
    #[display("fixed:{_0}")]
    Flat(Hash),
    #[display("fixed:r:{_0}")]
    Recursive(Hash),
}

impl ContentAddress {
    /// Pair a method with a hash; `Text` insists on SHA-256.
    pub fn from_hash(
        method: ContentAddressMethod,
        hash: Hash,
    ) -> Result<ContentAddress, ParseHashError> {
        Ok(match method {
            ContentAddressMethod::Text => ContentAddress::Text(hash.try_into()?),
            ContentAddressMethod::Flat => ContentAddress::Flat(hash),
            ContentAddressMethod::Recursive => ContentAddress::Recursive(hash),
        })
    }

    pub fn method(&self) -> ContentAddressMethod {
        match self {
            ContentAddress::Text(_) => ContentAddressMethod::Text,
            ContentAddress::Flat(_) => ContentAddressMethod::Flat,
            ContentAddress::Recursive(_) => ContentAddressMethod::Recursive,
        }
    }

    pub fn method_algorithm(&self) -> ContentAddressMethodAlgorithm {
        match self {
            ContentAddress::Text(_) => ContentAddressMethodAlgorithm::Text,
            ContentAddress::Flat(hash) => ContentAddressMethodAlgorithm::Flat(hash.algorithm()),
            ContentAddress::Recursive(hash) => {
                ContentAddressMethodAlgorithm::Recursive(hash.algorithm())
            }
        }
    }

    pub fn hash(&self) -> Hash {
        match *self {
            ContentAddress::Text(sha256) => sha256.into(),
            ContentAddress::Flat(hash) => hash,
            ContentAddress::Recursive(hash) => hash,
        }
    }
}

#[derive(Error, Debug, PartialEq, Clone)]
pub enum ParseContentAddressError {
    #[error("content address hash: {0}")]
    InvalidHash(
        #[from]
        #[source]
        ParseHashError,
    ),
    #[error("'{0}' is not a content address; expected 'text:…', 'fixed:…' or 'fixed:r:…'")]
    InvalidForm(String),
}

impl From<crucible_utils_hash::UnknownAlgorithm> for ParseContentAddressError {
    fn from(err: crucible_utils_hash::UnknownAlgorithm) -> Self {
        ParseContentAddressError::InvalidHash(ParseHashError::UnknownAlgorithm(err))
    }
}

impl FromStr for ContentAddress {
    type Err = ParseContentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hash_s) = s.strip_prefix("text:") {
            let hash = fmt::parse(Algorithm::SHA256, hash_s)?;
            Ok(Self::Text(hash.try_into()?))
        } else if let Some(hash_s) = s.strip_prefix("fixed:r:") {
            Ok(Self::Recursive(fmt::parse_prefixed(hash_s)?))
        } else if let Some(hash_s) = s.strip_prefix("fixed:") {
            Ok(Self::Flat(fmt::parse_prefixed(hash_s)?))
        } else {
            Err(ParseContentAddressError::InvalidForm(s.into()))
        }
    }
}

impl Serialize for ContentAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
