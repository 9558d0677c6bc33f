// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Importing sources into the store.
//!
//! A source import serializes a file tree (or byte buffer) into memory,
//! trims the declared reference set down to digests that actually occur in
//! the serialization, computes the store path, patches any temporary
//! self-reference digest to the final one, and streams the result to the
//! daemon.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::StreamExt as _;
use thiserror::Error;
use tracing::debug;

use crucible_archive::{NarEvent, NarWriteError, single_file_nar, write_nar};
use crucible_protocol::export::ExportTrailer;
use crucible_store_core::derivation::Derivation;
use crucible_store_core::references::{StoreReferences, scan_for_references};
use crucible_store_core::rewrite::{RewriteError, find_digest_offsets, rewrite_digest_at};
use crucible_store_core::store_path::{
    MakeStorePathError, StoreDir, StorePath, StorePathName,
};
use crucible_utils_hash::Sha256;

use crate::client::{ClientError, DaemonClient};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("serializing source: {0}")]
    Archive(#[from] NarWriteError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error(transparent)]
    MakePath(#[from] MakeStorePathError),
    #[error("derivation has no valid store path: {0}")]
    DerivationPath(String),
}

/// A filter decides, per path relative to the import root, whether an
/// entry (and for directories, its whole subtree) is included.
pub type SourceFilter = dyn Fn(&Path) -> bool + Send + Sync;

/// Parameters of a filesystem source import.
pub struct SourceImport<'a> {
    pub name: StorePathName,
    /// Store paths the source may reference; trimmed against the actual
    /// serialization before the path is computed.
    pub references: BTreeSet<StorePath>,
    /// The caller's temporary digest for self-references, if the source
    /// was generated with one embedded.
    pub temp_digest: Option<String>,
    pub filter: Option<&'a SourceFilter>,
}

impl<'a> SourceImport<'a> {
    pub fn new(name: StorePathName) -> Self {
        SourceImport {
            name,
            references: BTreeSet::new(),
            temp_digest: None,
            filter: None,
        }
    }
}

/// Import the tree (or file, or symlink) at `fs_path`.
pub async fn import_source(
    client: &mut DaemonClient,
    store_dir: &StoreDir,
    fs_path: &Path,
    spec: SourceImport<'_>,
) -> Result<StorePath, SourceError> {
    // Serialize into memory; rewrite offsets only exist relative to the
    // full buffer.
    let mut nar = Vec::new();
    let events = filtered_events(fs_path, spec.filter);
    write_nar(&mut nar, events).await?;

    // Trim declared references down to digests that occur in the bytes.
    let references = StoreReferences {
        others: scan_for_references(&nar, spec.references.iter()),
        self_ref: match &spec.temp_digest {
            Some(digest) if !digest.is_empty() => {
                !find_digest_offsets(&nar, digest)?.is_empty()
            }
            _ => false,
        },
    };

    let nar_hash = Sha256::digest(&nar);
    let path = store_dir.make_source_path(&spec.name, nar_hash, &references);

    // Patch the temporary self digest to the final one.
    if references.self_ref {
        let temp = spec.temp_digest.as_deref().expect("checked above");
        let offsets = find_digest_offsets(&nar, temp)?;
        rewrite_digest_at(&mut nar, &offsets, path.digest().as_str())?;
    }

    debug!(path = %store_dir.display(&path), refs = references.len(), "importing source");
    send(client, store_dir, &nar, &path, &references, None).await?;
    Ok(path)
}

/// Import raw bytes as a text object (`toFile`-style).
///
/// Text objects may reference sources and derivation files, but never
/// derivation *outputs* and never themselves, so no rewrite pass exists
/// here.
pub async fn import_bytes(
    client: &mut DaemonClient,
    store_dir: &StoreDir,
    name: &StorePathName,
    contents: Bytes,
    declared_references: &BTreeSet<StorePath>,
) -> Result<StorePath, SourceError> {
    let nar = single_file_nar(contents.clone(), false);
    let references = StoreReferences {
        others: scan_for_references(&nar, declared_references.iter()),
        self_ref: false,
    };

    let path = store_dir.make_text_path(name, Sha256::digest(&contents), &references)?;
    debug!(path = %store_dir.display(&path), "importing text object");
    send(client, store_dir, &nar, &path, &references, None).await?;
    Ok(path)
}

/// Serialize a derivation and import it as a `.drv` text object.
pub async fn import_derivation(
    client: &mut DaemonClient,
    store_dir: &StoreDir,
    drv: &Derivation,
) -> Result<StorePath, SourceError> {
    let text = drv.to_aterm(store_dir);
    let path = drv
        .store_path(store_dir)
        .map_err(|e| SourceError::DerivationPath(e.to_string()))?;

    let references = drv.input_references();
    let nar = single_file_nar(Bytes::from(text.into_bytes()), false);
    debug!(path = %store_dir.display(&path), "importing derivation");
    send(client, store_dir, &nar, &path, &references, None).await?;
    Ok(path)
}

/// Import with the evaluator-side cache: if the stamps for
/// `(fs_path, name)` match a previous import *and* the daemon still has
/// the path, skip serialization entirely.
pub async fn import_source_cached(
    client: &mut DaemonClient,
    cache: &mut crate::eval_cache::EvalCache,
    store_dir: &StoreDir,
    fs_path: &Path,
    spec: SourceImport<'_>,
) -> Result<StorePath, SourceError> {
    let name = spec.name.as_str().to_owned();
    if let Ok(Some(cached)) = cache.lookup(fs_path, &name)
        && let Ok(path) = store_dir.parse_path(&cached)
        && client.exists(&cached).await.unwrap_or(false)
    {
        debug!(path = %cached, "source import served from eval cache");
        return Ok(path);
    }

    let path = import_source(client, store_dir, fs_path, spec).await?;
    if let Err(e) = cache.record(fs_path, &name, &store_dir.display(&path).to_string()) {
        debug!("eval cache record failed: {e}");
    }
    Ok(path)
}

async fn send(
    client: &mut DaemonClient,
    store_dir: &StoreDir,
    nar: &[u8],
    path: &StorePath,
    references: &StoreReferences,
    deriver: Option<String>,
) -> Result<(), SourceError> {
    let mut refs: Vec<String> = references
        .others
        .iter()
        .map(|r| store_dir.display(r).to_string())
        .collect();
    if references.self_ref {
        refs.push(store_dir.display(path).to_string());
    }
    let trailer = ExportTrailer {
        path: store_dir.display(path).to_string(),
        references: refs,
        deriver,
    };
    client.import(nar, &trailer).await?;
    Ok(())
}

/// Dump `fs_path`, dropping entries the filter rejects (directories drop
/// their whole subtree). Paths given to the filter are relative to the
/// import root.
fn filtered_events<'a>(
    fs_path: &'a Path,
    filter: Option<&'a SourceFilter>,
) -> impl futures::Stream<Item = Result<NarEvent, NarWriteError>> + 'a {
    let inner = crucible_archive::dump(fs_path);
    async_filter(inner, filter)
}

fn async_filter<'a, S>(
    inner: S,
    filter: Option<&'a SourceFilter>,
) -> impl futures::Stream<Item = Result<NarEvent, NarWriteError>> + 'a
where
    S: futures::Stream<Item = std::io::Result<NarEvent>> + 'a,
{
    async_stream::stream! {
        let mut dir_stack: Vec<PathBuf> = Vec::new();
        // Depth of directories inside a skipped subtree; while > 0 all
        // events are dropped.
        let mut skip_depth: usize = 0;
        let mut skip_file = false;

        let mut inner = std::pin::pin!(inner);
        while let Some(event) = inner.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield Err(NarWriteError::from(e));
                    continue;
                }
            };

            if skip_file {
                match &event {
                    NarEvent::FileData(_) => continue,
                    _ => skip_file = false,
                }
            }
            if skip_depth > 0 {
                match &event {
                    NarEvent::StartDirectory { .. } => skip_depth += 1,
                    NarEvent::EndDirectory => skip_depth -= 1,
                    _ => {}
                }
                continue;
            }

            let keep = |name: &Bytes| -> bool {
                if name.is_empty() {
                    return true;
                }
                match filter {
                    None => true,
                    Some(filter) => {
                        let mut rel = dir_stack
                            .last()
                            .cloned()
                            .unwrap_or_default();
                        rel.push(String::from_utf8_lossy(name).as_ref());
                        filter(&rel)
                    }
                }
            };

            match &event {
                NarEvent::File { name, size, .. } => {
                    if keep(name) {
                        yield Ok(event);
                    } else if *size > 0 {
                        skip_file = true;
                    }
                }
                NarEvent::Symlink { name, .. } => {
                    if keep(name) {
                        yield Ok(event);
                    }
                }
                NarEvent::StartDirectory { name } => {
                    if keep(name) {
                        let mut next = dir_stack.last().cloned().unwrap_or_default();
                        if !name.is_empty() {
                            next.push(String::from_utf8_lossy(name).as_ref());
                        }
                        dir_stack.push(next);
                        yield Ok(event);
                    } else {
                        skip_depth = 1;
                    }
                }
                NarEvent::EndDirectory => {
                    dir_stack.pop();
                    yield Ok(event);
                }
                NarEvent::FileData(_) => yield Ok(event),
            }
        }
    }
}
