// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Derivations: immutable descriptions of a single build action.
//!
//! A derivation names its builder, arguments and environment, the source
//! paths and upstream derivation outputs it consumes, and descriptors for
//! the outputs it produces. Its canonical text encoding ([`aterm`]) is what
//! lands in the store as a `.drv` object, and the store path of that object
//! is derived from the encoded bytes like any other text object.

mod aterm;
mod fingerprint;
mod output;

pub use aterm::{ATermParseError, parse_aterm, unparse};
pub use fingerprint::{BuildFingerprint, MissingInputHash, hash_modulo, masked_unparse};
pub use output::DerivationOutput;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::references::StoreReferences;
use crate::store_path::{
    MakeStorePathError, StoreDir, StorePath, StorePathName, StorePathNameError,
};
use crucible_utils_hash::Sha256;

/// A derivation output name. `out` is the default and is omitted from
/// output path names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct OutputName(String);

impl OutputName {
    pub fn is_default(&self) -> bool {
        self.0 == "out"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OutputName {
    fn default() -> Self {
        OutputName("out".into())
    }
}

impl AsRef<str> for OutputName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OutputName {
    type Err = StorePathNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Output names obey store path name rules; they end up as name
        // suffixes of output paths.
        let name: StorePathName = s.parse()?;
        Ok(OutputName(name.as_str().to_owned()))
    }
}

impl<'de> Deserialize<'de> for OutputName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An immutable build action.
///
/// Identity is structural: two derivations with the same fields serialize
/// to the same canonical text and therefore land on the same store path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    /// Base name, without the `.drv` marker.
    pub name: StorePathName,
    /// Build platform tag, e.g. `x86_64-linux`.
    pub system: String,
    /// Absolute path of the builder program, or a `builtin:` scheme.
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Direct source dependencies.
    pub input_sources: BTreeSet<StorePath>,
    /// Upstream derivations and which of their outputs are required.
    /// Every set is non-empty.
    pub input_derivations: BTreeMap<StorePath, BTreeSet<OutputName>>,
    pub outputs: BTreeMap<OutputName, DerivationOutput>,
}

impl Derivation {
    /// The store path name of an output: `<name>` for `out`, otherwise
    /// `<name>-<output>`.
    pub fn output_path_name(&self, output: &OutputName) -> Result<StorePathName, StorePathNameError> {
        if output.is_default() {
            Ok(self.name.clone())
        } else {
            format!("{}-{}", self.name, output).parse()
        }
    }

    /// References of the `.drv` store object: all input sources plus the
    /// input derivation paths.
    pub fn input_references(&self) -> StoreReferences {
        let mut others = self.input_sources.clone();
        others.extend(self.input_derivations.keys().cloned());
        StoreReferences {
            others,
            self_ref: false,
        }
    }

    /// The canonical text encoding of this derivation.
    pub fn to_aterm(&self, store_dir: &StoreDir) -> String {
        unparse(store_dir, self)
    }

    /// The store path of the `.drv` object holding this derivation.
    pub fn store_path(&self, store_dir: &StoreDir) -> Result<StorePath, DerivationPathError> {
        let text = self.to_aterm(store_dir);
        let name: StorePathName = format!("{}.drv", self.name).parse()?;
        let path = store_dir.make_text_path(&name, Sha256::digest(&text), &self.input_references())?;
        Ok(path)
    }

    /// Whether every output already has a definite store path (input
    /// addressed or fixed content address).
    pub fn all_outputs_known(&self) -> bool {
        self.outputs.values().all(|output| {
            matches!(
                output,
                DerivationOutput::InputAddressed(_) | DerivationOutput::CAFixed(_)
            )
        })
    }

    /// Whether this is a fixed-output derivation: a single `out` output
    /// with a declared content address.
    pub fn is_fixed_output(&self) -> bool {
        self.outputs.len() == 1
            && self
                .outputs
                .iter()
                .next()
                .is_some_and(|(name, output)| {
                    name.is_default() && matches!(output, DerivationOutput::CAFixed(_))
                })
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum DerivationPathError {
    #[error(transparent)]
    Name(#[from] StorePathNameError),
    #[error(transparent)]
    MakePath(#[from] MakeStorePathError),
}
