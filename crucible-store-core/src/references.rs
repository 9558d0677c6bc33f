// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Reference sets and reference scanning.
//!
//! A store object references other store objects by embedding their path
//! digests in its bytes. The scanner finds which candidate digests actually
//! occur in a byte stream; imports use it to trim declared reference sets
//! and builds use it to discover the references of fresh outputs.

use std::collections::{BTreeMap, BTreeSet};

use crate::store_path::{DIGEST_CHARS, StorePath};

/// The references of a store object: other paths plus an optional
/// self-reference. Both participate in path computation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreReferences {
    pub others: BTreeSet<StorePath>,
    pub self_ref: bool,
}

impl StoreReferences {
    pub fn is_empty(&self) -> bool {
        self.others.is_empty() && !self.self_ref
    }

    /// Number of paths, counting the self-reference.
    pub fn len(&self) -> usize {
        self.others.len() + usize::from(self.self_ref)
    }
}

/// Streaming scanner for store path digests.
///
/// Feed it chunks in order; digests spanning a chunk boundary are caught by
/// keeping the last `DIGEST_CHARS - 1` bytes of the previous chunk.
pub struct RefScanSink {
    candidates: BTreeMap<Vec<u8>, StorePath>,
    found: BTreeSet<StorePath>,
    tail: Vec<u8>,
}

impl RefScanSink {
    /// Scan for the digests of `candidates`.
    pub fn new<'a>(candidates: impl IntoIterator<Item = &'a StorePath>) -> Self {
        RefScanSink {
            candidates: candidates
                .into_iter()
                .map(|p| (p.digest().as_str().as_bytes().to_vec(), p.clone()))
                .collect(),
            found: BTreeSet::new(),
            tail: Vec::with_capacity(2 * DIGEST_CHARS),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        if self.candidates.is_empty() {
            return;
        }
        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(chunk);

        let mut hit: Vec<Vec<u8>> = Vec::new();
        for digest in self.candidates.keys() {
            if memchr::memmem::find(&window, digest).is_some() {
                hit.push(digest.clone());
            }
        }
        for digest in hit {
            if let Some(path) = self.candidates.remove(&digest) {
                self.found.insert(path);
            }
        }

        let keep = window.len().min(DIGEST_CHARS - 1);
        self.tail = window.split_off(window.len() - keep);
    }

    /// The candidate paths whose digests occurred in the stream.
    pub fn found_paths(self) -> BTreeSet<StorePath> {
        self.found
    }
}

/// Scan a complete buffer for the digests of `candidates`.
pub fn scan_for_references<'a>(
    bytes: &[u8],
    candidates: impl IntoIterator<Item = &'a StorePath>,
) -> BTreeSet<StorePath> {
    let mut sink = RefScanSink::new(candidates);
    sink.feed(bytes);
    sink.found_paths()
}

#[cfg(test)]
mod unittests {
    use super::*;

    fn path(digest: char, name: &str) -> StorePath {
        format!("{}-{}", digest.to_string().repeat(DIGEST_CHARS), name)
            .parse()
            .unwrap()
    }

    #[test]
    fn finds_embedded_digest() {
        let dep = path('5', "dep");
        let bytes = format!("prefix /nix/store/{dep} suffix");
        let found = scan_for_references(bytes.as_bytes(), [&dep]);
        assert_eq!(found, BTreeSet::from([dep]));
    }

    #[test]
    fn ignores_absent_digest() {
        let dep = path('5', "dep");
        let found = scan_for_references(b"nothing interesting here", [&dep]);
        assert!(found.is_empty());
    }

    #[test]
    fn digest_split_across_chunks() {
        let dep = path('7', "dep");
        let digest = dep.digest().to_string();
        let (left, right) = digest.split_at(13);

        let mut sink = RefScanSink::new([&dep]);
        sink.feed(format!("padding {left}").as_bytes());
        sink.feed(right.as_bytes());
        assert_eq!(sink.found_paths(), BTreeSet::from([dep]));
    }

    #[test]
    fn bare_digest_matches_without_name() {
        // Reference scanning keys on the digest alone; the name may be
        // rewritten or absent in the referring object.
        let dep = path('3', "some-long-name");
        let bytes = format!("x{}y", dep.digest());
        let found = scan_for_references(bytes.as_bytes(), [&dep]);
        assert_eq!(found.len(), 1);
    }
}
