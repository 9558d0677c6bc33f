// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Build placeholders.
//!
//! While a derivation is being constructed, the paths of its own outputs and
//! of not-yet-built upstream outputs are unknown. Placeholders are
//! fixed-length sentinel strings embedded in builder env and args, replaced
//! with real store paths just before the builder runs. They render as
//! `/` followed by 52 base-32 characters, which cannot collide with a real
//! store path.

use std::fmt;

use crucible_utils_base_encoding::base32;
use crucible_utils_hash::Sha256;

use crate::derivation::OutputName;
use crate::store_path::StorePath;

/// A placeholder for a store path that is not known yet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Placeholder(Sha256);

impl Placeholder {
    /// Placeholder for a named output of the derivation being constructed.
    pub fn output(output_name: &OutputName) -> Self {
        Placeholder(Sha256::digest(format!("nix-output:{output_name}")))
    }

    /// Placeholder for a named output of another derivation whose output
    /// path is unknown until it is built.
    pub fn upstream_output(drv_path: &StorePath, output_name: &OutputName) -> Self {
        let mut clear_text = format!(
            "nix-upstream-output:{}:{}",
            drv_path.digest(),
            drv_path.name().without_drv_extension(),
        );
        if !output_name.is_default() {
            clear_text.push('-');
            clear_text.push_str(output_name.as_str());
        }
        Placeholder(Sha256::digest(clear_text))
    }

    /// The sentinel string to embed.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", base32::encode_string(self.0.digest_bytes()))
    }
}
