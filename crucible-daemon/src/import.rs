// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Import stream handling.
//!
//! An `Import` request is followed on the connection by an export stream
//! (`crucible_protocol::export`). Each record is restored into a temporary
//! directory while its serialization is hashed in a single pass, then the
//! trailer names the destination path. Registration happens only after the
//! object has been renamed into place, under a per-path lock.
//!
//! The declared path is verified: it must be derivable from the received
//! bytes and declared references as a text, source, or fixed content
//! address. Re-importing an existing path is idempotent when the bytes
//! agree and a [`DaemonError::Conflict`] when they do not.

use std::sync::{Arc, Mutex};

use futures::StreamExt as _;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crucible_archive::NarEvent;
use crucible_protocol::export;
use crucible_store_core::content_address::ContentAddress;
use crucible_store_core::references::StoreReferences;
use crucible_store_core::store_path::StorePath;
use crucible_store_db::RegisterObjectParams;
use crucible_utils_hash::{Algorithm, Context, HashingReader, Sha256};

use crate::error::{DaemonError, DaemonResult, IoContext as _};
use crate::pathlocks::PathLock;
use crate::store::LocalStore;

/// What the event stream revealed about the object's shape.
enum RootShape {
    Empty,
    SingleFile { context: Context, executable: bool },
    Tree,
}

struct Inspector {
    shape: RootShape,
}

impl Inspector {
    fn observe(&mut self, event: &NarEvent) {
        match (&mut self.shape, event) {
            (RootShape::Empty, NarEvent::File { executable, .. }) => {
                self.shape = RootShape::SingleFile {
                    context: Context::new(Algorithm::SHA256),
                    executable: *executable,
                };
            }
            (RootShape::SingleFile { context, .. }, NarEvent::FileData(chunk)) => {
                context.update(chunk);
            }
            (RootShape::Empty, _) => self.shape = RootShape::Tree,
            (RootShape::SingleFile { .. }, _) => self.shape = RootShape::Tree,
            (RootShape::Tree, _) => {}
        }
    }
}

/// Decode an entire import stream, returning the imported paths in order.
pub async fn handle_import<R>(store: &LocalStore, reader: &mut R) -> DaemonResult<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let mut imported = Vec::new();
    loop {
        let more = export::read_record_start(reader)
            .await
            .map_err(|e| DaemonError::InvalidPath(format!("import stream: {e}")))?;
        if !more {
            break;
        }
        let path = import_one(store, reader).await?;
        imported.push(store.store_dir().display(&path).to_string());
    }
    info!(count = imported.len(), "import stream complete");
    Ok(imported)
}

async fn import_one<R>(store: &LocalStore, reader: &mut R) -> DaemonResult<StorePath>
where
    R: AsyncRead + Unpin,
{
    // Restore into a temp directory inside the store so the final rename
    // stays on one filesystem.
    let temp_dir = tempfile::Builder::new()
        .prefix(".tmp-import-")
        .tempdir_in(store.store_dir().to_path())
        .io_context(|| "creating import temp directory".to_string())?;
    let temp_root = temp_dir.path().join("root");

    let mut hashing = HashingReader::new(&mut *reader, Algorithm::SHA256);
    let inspector = Arc::new(Mutex::new(Inspector {
        shape: RootShape::Empty,
    }));

    {
        let inspector = Arc::clone(&inspector);
        let events = crucible_archive::parse(&mut hashing).map(move |event| {
            let event = event.map_err(std::io::Error::other)?;
            inspector.lock().expect("inspector mutex").observe(&event);
            Ok(event)
        });
        crucible_archive::restore(events, &temp_root)
            .await
            .map_err(|e| DaemonError::InvalidPath(format!("restoring import: {e}")))?;
    }

    let (nar_size, nar_hash) = hashing.finish();
    let nar_sha256: Sha256 = nar_hash.try_into().expect("hashing reader uses SHA-256");

    // The parse stream and its closure are gone; the inspector is ours.
    let inspector = Arc::try_unwrap(inspector)
        .unwrap_or_else(|_| unreachable!("inspector outlives the event stream"))
        .into_inner()
        .expect("inspector mutex");
    let single_file = match inspector.shape {
        RootShape::SingleFile {
            context,
            executable,
        } => {
            let contents: Sha256 = context
                .finish()
                .try_into()
                .expect("inspector hashes with SHA-256");
            Some((contents, executable))
        }
        _ => None,
    };

    let trailer = export::read_trailer(reader)
        .await
        .map_err(|e| DaemonError::InvalidPath(format!("import trailer: {e}")))?;

    let path = store.parse_path(&trailer.path)?;

    // The trailer lists a self-reference as the object's own path.
    let mut references = StoreReferences::default();
    for reference in &trailer.references {
        let parsed = store.parse_path(reference)?;
        if parsed == path {
            references.self_ref = true;
        } else {
            references.others.insert(parsed);
        }
    }

    let final_path = store.object_path(&path);
    let _lock = PathLock::lock_async(&final_path)
        .await
        .io_context(|| format!("locking {}", final_path.display()))?;

    // Idempotent re-import / conflict detection comes first: a trailer
    // claiming an existing path with different bytes is a conflict even if
    // the path would not verify.
    let rendered = store.store_dir().display(&path).to_string();
    {
        let db = store.db().lock().await;
        if let Some(existing) = db.query_object(&rendered)? {
            let incoming = nar_sha256.to_string();
            if existing.nar_hash == incoming {
                if !final_path.exists() {
                    // Registered but missing on disk: repair from this
                    // import.
                    drop(db);
                    tokio::fs::rename(&temp_root, &final_path)
                        .await
                        .io_context(|| {
                            format!("rematerializing {}", final_path.display())
                        })?;
                }
                debug!(path = %rendered, "re-import of existing object");
                return Ok(path);
            }
            return Err(DaemonError::Conflict {
                path: rendered,
                detail: format!(
                    "existing archive hash {} differs from imported {}",
                    existing.nar_hash, incoming
                ),
            });
        }
    }

    let content_address = verify_declared_path(store, &path, &references, nar_sha256, single_file)?;

    // References must already be registered, in dependency order.
    for reference in &references.others {
        if !store.exists(reference).await? {
            return Err(DaemonError::NotFound(
                store.store_dir().display(reference).to_string(),
            ));
        }
    }

    // A materialized but unregistered path is debris from an interrupted
    // import; replace it.
    if final_path.exists() {
        let _ = tokio::fs::remove_dir_all(&final_path).await;
        let _ = tokio::fs::remove_file(&final_path).await;
    }
    tokio::fs::rename(&temp_root, &final_path)
        .await
        .io_context(|| format!("moving import into place at {}", final_path.display()))?;

    let mut reference_strings: std::collections::BTreeSet<String> = references
        .others
        .iter()
        .map(|r| store.store_dir().display(r).to_string())
        .collect();
    if references.self_ref {
        reference_strings.insert(rendered.clone());
    }

    let register = store.db().lock().await.register_object(&RegisterObjectParams {
        path: rendered.clone(),
        ca: content_address.to_string(),
        nar_hash: nar_sha256.to_string(),
        nar_size,
        references: reference_strings,
    });
    if let Err(e) = register {
        let _ = tokio::fs::remove_dir_all(&final_path).await;
        let _ = tokio::fs::remove_file(&final_path).await;
        return Err(e.into());
    }

    debug!(path = %rendered, nar_size, "imported store object");
    Ok(path)
}

/// Check that the declared path derives from the received bytes and
/// references, and determine the object's content address.
///
/// Imported objects are one of three shapes: a *source* (recursive SHA-256
/// of the serialization, any references), a *text* object (SHA-256 of a
/// single file's bytes, references but no self-reference), or a *flat
/// fixed* output (single file, no references). The declared path must
/// derive from one of them.
fn verify_declared_path(
    store: &LocalStore,
    path: &StorePath,
    references: &StoreReferences,
    nar_sha256: Sha256,
    single_file: Option<(Sha256, bool)>,
) -> DaemonResult<ContentAddress> {
    let store_dir = store.store_dir();
    let name = path.name();

    // Self-referential objects were serialized with a temporary digest,
    // hashed, and then rewritten to embed the final digest. The received
    // bytes are post-rewrite, so the fingerprint hash cannot be recomputed
    // here; the declared path is taken at face value.
    if references.self_ref {
        return Ok(ContentAddress::Recursive(nar_sha256.into()));
    }

    let source_path = store_dir.make_source_path(name, nar_sha256, references);
    if source_path == *path {
        return Ok(ContentAddress::Recursive(nar_sha256.into()));
    }

    if let Some((contents, executable)) = single_file
        && !executable
    {
        if !references.self_ref
            && let Ok(text_path) = store_dir.make_text_path(name, contents, references)
            && text_path == *path
        {
            return Ok(ContentAddress::Text(contents));
        }
        if references.is_empty() {
            let ca = ContentAddress::Flat(contents.into());
            if store_dir.make_store_path_from_ca(name, ca) == *path {
                return Ok(ca);
            }
        }
    }

    Err(DaemonError::ContentMismatch {
        path: store_dir.display(path).to_string(),
        detail: "declared path does not derive from the imported bytes and references".into(),
    })
}

