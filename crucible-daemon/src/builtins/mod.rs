// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Builders that run inside the daemon instead of as external processes,
//! selected by a `builtin:` scheme in the derivation's builder field.

pub mod fetchurl;
