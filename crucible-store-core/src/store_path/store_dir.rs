// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The store directory and the store-path algebra.
//!
//! Every store path is derived from a *fingerprint*:
//!
//! ```text
//! fingerprint = type { ':' reference } [ ':self' ] ':' hash ':' store_dir ':' name
//! hash        = algorithm ':' base16_digest
//! ```
//!
//! The fingerprint is hashed with SHA-256, XOR-compressed to 20 bytes and
//! base-32 encoded to form the digest of `store_dir/<digest>-<name>`.
//! References participate in the fingerprint, so an object's path pins both
//! its content and what it points at.

use std::fmt;
use std::path::{MAIN_SEPARATOR, Path};
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::content_address::ContentAddress;
use crate::references::StoreReferences;
use crate::store_path::{ParseStorePathError, StorePath, StorePathName};
use crucible_utils_hash::{Algorithm, Hash, Sha256, compress_hash};

/// Default store directory for the running OS family.
#[cfg(not(windows))]
const DEFAULT_STORE_DIR: &str = "/nix/store";
#[cfg(windows)]
const DEFAULT_STORE_DIR: &str = "C:\\nix\\store";

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum MakeStorePathError {
    #[error("references are not allowed on fixed outputs with method '{0}'")]
    RefsNotAllowed(String),
    #[error("self-references are not allowed on text objects")]
    SelfRefNotAllowed,
}

/// An absolute store directory.
///
/// [`StorePath`] holds only digest and name; joining and parsing absolute
/// paths goes through a `StoreDir`.
///
/// ```
/// use crucible_store_core::store_path::{StoreDir, StorePath};
/// let store = StoreDir::default();
/// let path: StorePath = "55xkmqns51sw7nrgykp5vnz36w4fr3cw-crucible-0.1".parse().unwrap();
/// assert_eq!(
///     store.display(&path).to_string(),
///     "/nix/store/55xkmqns51sw7nrgykp5vnz36w4fr3cw-crucible-0.1",
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreDir(Arc<str>);

impl StoreDir {
    /// Create a store directory, which must be an absolute path without a
    /// trailing separator.
    pub fn new(path: &str) -> Result<StoreDir, ParseStorePathError> {
        let absolute = if cfg!(windows) {
            path.len() >= 3
                && path.as_bytes()[0].is_ascii_alphabetic()
                && &path[1..3] == ":\\"
        } else {
            path.starts_with('/')
        };
        if !absolute || path.ends_with(MAIN_SEPARATOR) || path.len() < 2 {
            return Err(ParseStorePathError::InvalidPath(path.to_owned()));
        }
        Ok(StoreDir(Arc::from(path)))
    }

    pub fn to_str(&self) -> &str {
        &self.0
    }

    pub fn to_path(&self) -> &Path {
        Path::new(self.0.as_ref())
    }

    /// The absolute filesystem path of a store object.
    pub fn join(&self, path: &StorePath) -> std::path::PathBuf {
        self.to_path().join(path.to_string())
    }

    /// Display a [`StorePath`] as an absolute path.
    pub fn display<'a>(&'a self, path: &'a StorePath) -> impl fmt::Display + 'a {
        DisplayStorePath {
            store_dir: self,
            path,
        }
    }

    /// Parse an absolute path into a [`StorePath`], requiring it to sit
    /// directly inside this store directory.
    pub fn parse_path(&self, s: &str) -> Result<StorePath, ParseStorePathError> {
        let base = s
            .strip_prefix(self.0.as_ref())
            .and_then(|rest| rest.strip_prefix(MAIN_SEPARATOR))
            .ok_or_else(|| ParseStorePathError::NotInStore {
                path: s.to_owned(),
                store_dir: self.0.to_string(),
            })?;
        if base.contains(MAIN_SEPARATOR) {
            return Err(ParseStorePathError::NotInStore {
                path: s.to_owned(),
                store_dir: self.0.to_string(),
            });
        }
        base.parse()
    }

    /// The core path computation: hash the fingerprint of `(type, refs,
    /// hash, dir, name)` and compress it into a path digest.
    pub fn make_store_path(
        &self,
        path_type: &str,
        hash: Hash,
        name: &StorePathName,
    ) -> StorePath {
        let fingerprint = format!("{}:{}:{}:{}", path_type, hash.as_base16(), self, name);
        trace!(fingerprint, "computing store path");
        let digest = Sha256::digest(&fingerprint);
        let compressed: [u8; super::DIGEST_BYTES] = compress_hash(
            digest.digest_bytes(),
            super::DIGEST_BYTES,
        )
        .try_into()
        .expect("compress_hash returns the requested size");
        StorePath::from_digest(&compressed, name.clone())
    }

    /// Fold a reference set into the fingerprint type, `type:ref…[:self]`.
    fn make_type(&self, base: &str, references: &StoreReferences) -> String {
        let mut path_type = String::from(base);
        for reference in &references.others {
            path_type.push(':');
            path_type.push_str(&self.display(reference).to_string());
        }
        if references.self_ref {
            path_type.push_str(":self");
        }
        path_type
    }

    /// Path of a text object (SHA-256 of raw bytes). Text objects may
    /// reference other paths but never themselves.
    pub fn make_text_path(
        &self,
        name: &StorePathName,
        hash: Sha256,
        references: &StoreReferences,
    ) -> Result<StorePath, MakeStorePathError> {
        if references.self_ref {
            return Err(MakeStorePathError::SelfRefNotAllowed);
        }
        let path_type = self.make_type("text", references);
        Ok(self.make_store_path(&path_type, hash.into(), name))
    }

    /// Path of a source object: recursive SHA-256 serialization with
    /// arbitrary references, the distinguished `source` fingerprint type.
    pub fn make_source_path(
        &self,
        name: &StorePathName,
        nar_hash: Sha256,
        references: &StoreReferences,
    ) -> StorePath {
        let path_type = self.make_type("source", references);
        self.make_store_path(&path_type, nar_hash.into(), name)
    }

    /// Path of a fixed content-addressed object.
    pub fn make_fixed_output_path(
        &self,
        name: &StorePathName,
        ca: ContentAddress,
        references: &StoreReferences,
    ) -> Result<StorePath, MakeStorePathError> {
        match ca {
            ContentAddress::Text(hash) => self.make_text_path(name, hash, references),
            ContentAddress::Recursive(hash) if hash.algorithm() == Algorithm::SHA256 => {
                let sha256: Sha256 = hash.try_into().expect("algorithm checked above");
                Ok(self.make_source_path(name, sha256, references))
            }
            ContentAddress::Flat(_) | ContentAddress::Recursive(_) => {
                if !references.is_empty() {
                    return Err(MakeStorePathError::RefsNotAllowed(
                        ca.method_algorithm().to_string(),
                    ));
                }
                let inner = Sha256::digest(format!(
                    "fixed:out:{}{}:",
                    ca.method().prefix(),
                    ca.hash().as_base16(),
                ));
                Ok(self.make_store_path("output:out", inner.into(), name))
            }
        }
    }

    /// Path of a fixed content-addressed object without references.
    pub fn make_store_path_from_ca(&self, name: &StorePathName, ca: ContentAddress) -> StorePath {
        self.make_fixed_output_path(name, ca, &StoreReferences::default())
            .expect("empty references are always allowed")
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        StoreDir(Arc::from(DEFAULT_STORE_DIR))
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct DisplayStorePath<'a> {
    store_dir: &'a StoreDir,
    path: &'a StorePath,
}

impl fmt::Display for DisplayStorePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.store_dir, MAIN_SEPARATOR, self.path)
    }
}
