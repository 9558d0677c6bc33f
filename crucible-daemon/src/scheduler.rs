// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The build scheduler.
//!
//! `Realize` requests coalesce on a *fingerprint*: the `.drv` store path
//! when every output path is known, otherwise the recursive masked-text
//! hash. At most one build runs per fingerprint; later requests attach to
//! the in-flight build and share its outcome. A bounded semaphore caps
//! concurrent sandboxed builders, queueing excess builds FIFO.
//!
//! Each `Realize`/`Expand` returns a handle. Waiters attach to handles;
//! when the last waiter of an unfinished build detaches, the build is
//! canceled (SIGTERM, then SIGKILL after the grace period).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crucible_protocol::{BuildOutcome, ErrorBody};
use crucible_store_core::derivation::{BuildFingerprint, Derivation, OutputName, hash_modulo};
use crucible_store_core::store_path::StorePath;
use crucible_utils_hash::Sha256;

use crate::build;
use crate::build_users::BuildUserPool;
use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::store::LocalStore;

/// Terminal state of a build or expansion, shared between all waiters.
#[derive(Debug, Clone)]
enum Terminal {
    Built(BTreeMap<String, String>),
    Expanded {
        builder: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    Failed {
        exit: i32,
        message: String,
    },
    TimedOut,
    Canceled,
    Error(ErrorBody),
}

impl Terminal {
    fn from_result(result: DaemonResult<BTreeMap<String, String>>) -> Self {
        match result {
            Ok(outputs) => Terminal::Built(outputs),
            Err(err) => Terminal::from_error(err),
        }
    }

    fn from_error(err: DaemonError) -> Self {
        match err {
            DaemonError::BuildFailed { exit, .. } => Terminal::Failed {
                exit,
                message: err.to_string(),
            },
            DaemonError::TimedOut(_) => Terminal::TimedOut,
            DaemonError::Canceled(_) => Terminal::Canceled,
            other => Terminal::Error(other.to_error_body()),
        }
    }
}

struct BuildEntry {
    outcome: watch::Sender<Option<Terminal>>,
    waiters: AtomicUsize,
    cancel: CancellationToken,
}

impl BuildEntry {
    fn new() -> Arc<Self> {
        let (outcome, _) = watch::channel(None);
        Arc::new(BuildEntry {
            outcome,
            waiters: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        })
    }

    fn terminal(&self) -> Option<Terminal> {
        self.outcome.borrow().clone()
    }
}

/// Keeps a build alive; dropping the last one cancels it.
struct WaiterGuard {
    entry: Arc<BuildEntry>,
}

impl WaiterGuard {
    fn attach(entry: &Arc<BuildEntry>) -> Self {
        entry.waiters.fetch_add(1, Ordering::SeqCst);
        WaiterGuard {
            entry: Arc::clone(entry),
        }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.entry.waiters.fetch_sub(1, Ordering::SeqCst) == 1
            && self.entry.terminal().is_none()
        {
            warn!("all waiters detached, canceling build");
            self.entry.cancel.cancel();
        }
    }
}

struct Inner {
    store: LocalStore,
    config: Config,
    users: BuildUserPool,
    jobs: Semaphore,
    /// Fingerprint → in-flight build.
    in_flight: Mutex<HashMap<String, Arc<BuildEntry>>>,
    /// Memoized masked-text hashes.
    modulo_hashes: Mutex<HashMap<StorePath, Sha256>>,
    /// Build handle → (entry, waiter guard held on behalf of the client).
    handles: Mutex<HashMap<u64, Handle>>,
    next_handle: std::sync::atomic::AtomicU64,
}

struct Handle {
    entry: Arc<BuildEntry>,
    _guard: WaiterGuard,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(store: LocalStore, config: Config, users: BuildUserPool) -> Self {
        let max_jobs = config.max_jobs.max(1);
        Scheduler {
            inner: Arc::new(Inner {
                store,
                config,
                users,
                jobs: Semaphore::new(max_jobs),
                in_flight: Mutex::new(HashMap::new()),
                modulo_hashes: Mutex::new(HashMap::new()),
                handles: Mutex::new(HashMap::new()),
                next_handle: std::sync::atomic::AtomicU64::new(1),
            }),
        }
    }

    /// Begin realizing `drv_path`; returns a build handle.
    pub async fn realize(&self, drv_path: &StorePath) -> DaemonResult<u64> {
        let entry = realize_entry(&self.inner, drv_path.clone()).await?;
        Ok(self.register_handle(entry))
    }

    /// Begin expanding `drv_path` against `temp_dir`; returns a handle.
    pub async fn expand(&self, drv_path: &StorePath, temp_dir: PathBuf) -> DaemonResult<u64> {
        let inner = Arc::clone(&self.inner);
        let drv = inner.store.read_derivation(drv_path).await?;
        let entry = BuildEntry::new();

        let task_entry = Arc::clone(&entry);
        let task_drv_path = drv_path.clone();
        tokio::spawn(async move {
            let result = expand_task(&inner, &task_drv_path, drv, temp_dir).await;
            let terminal = match result {
                Ok(terminal) => terminal,
                Err(err) => Terminal::from_error(err),
            };
            let _ = task_entry.outcome.send(Some(terminal));
        });

        Ok(self.register_handle(entry))
    }

    fn register_handle(&self, entry: Arc<BuildEntry>) -> u64 {
        let id = self.inner.next_handle.fetch_add(1, Ordering::SeqCst);
        let guard = WaiterGuard::attach(&entry);
        self.inner.handles.lock().expect("handles mutex").insert(
            id,
            Handle {
                entry,
                _guard: guard,
            },
        );
        id
    }

    /// Block until the build behind `build_id` is terminal.
    pub async fn wait(&self, build_id: u64) -> Result<BuildOutcome, ErrorBody> {
        let entry = {
            let handles = self.inner.handles.lock().expect("handles mutex");
            handles
                .get(&build_id)
                .map(|handle| Arc::clone(&handle.entry))
        }
        .ok_or_else(|| {
            ErrorBody::new(
                crucible_protocol::ErrorKind::NotFound,
                format!("unknown build handle {build_id}"),
            )
        })?;

        let mut rx = entry.outcome.subscribe();
        let terminal = loop {
            if let Some(terminal) = rx.borrow_and_update().clone() {
                break terminal;
            }
            if rx.changed().await.is_err() {
                break Terminal::Canceled;
            }
        };

        match terminal {
            Terminal::Built(outputs) => Ok(BuildOutcome::Built { outputs }),
            Terminal::Expanded { builder, args, env } => {
                Ok(BuildOutcome::Expanded { builder, args, env })
            }
            Terminal::Failed { exit, message } => Ok(BuildOutcome::Failed { exit, message }),
            Terminal::TimedOut => Ok(BuildOutcome::TimedOut),
            Terminal::Canceled => Ok(BuildOutcome::Canceled),
            Terminal::Error(body) => Err(body),
        }
    }

    /// Drop the handles a disconnecting client still holds.
    pub fn release_handles(&self, ids: &[u64]) {
        let mut handles = self.inner.handles.lock().expect("handles mutex");
        for id in ids {
            handles.remove(id);
        }
    }
}

/// Get or create the in-flight build entry for a derivation.
async fn realize_entry(inner: &Arc<Inner>, drv_path: StorePath) -> DaemonResult<Arc<BuildEntry>> {
    let drv = inner.store.read_derivation(&drv_path).await?;
    let fingerprint = fingerprint_for(inner, &drv_path, &drv).await?;

    let (entry, spawned) = {
        let mut in_flight = inner.in_flight.lock().expect("in-flight mutex");
        match in_flight.get(&fingerprint) {
            Some(entry) => (Arc::clone(entry), false),
            None => {
                let entry = BuildEntry::new();
                in_flight.insert(fingerprint.clone(), Arc::clone(&entry));
                (entry, true)
            }
        }
    };

    if spawned {
        let inner = Arc::clone(inner);
        let task_entry = Arc::clone(&entry);
        let task_fingerprint = fingerprint.clone();
        tokio::spawn(async move {
            let cancel = task_entry.cancel.clone();
            let result = drive_build(&inner, &drv_path, &drv, &task_fingerprint, &cancel).await;
            let _ = task_entry
                .outcome
                .send(Some(Terminal::from_result(result)));
            inner
                .in_flight
                .lock()
                .expect("in-flight mutex")
                .remove(&task_fingerprint);
        });
    } else {
        debug!(fingerprint, "attached to in-flight build");
    }

    Ok(entry)
}

/// Realize a derivation's outputs and return them as rendered paths; used
/// both for client requests and recursive input realization.
fn realize_outputs<'a>(
    inner: &'a Arc<Inner>,
    drv_path: &'a StorePath,
) -> futures::future::BoxFuture<'a, DaemonResult<BTreeMap<OutputName, StorePath>>> {
    Box::pin(async move {
        let entry = realize_entry(inner, drv_path.clone()).await?;
        let _guard = WaiterGuard::attach(&entry);

        let mut rx = entry.outcome.subscribe();
        let terminal = loop {
            if let Some(terminal) = rx.borrow_and_update().clone() {
                break terminal;
            }
            if rx.changed().await.is_err() {
                break Terminal::Canceled;
            }
        };

        match terminal {
            Terminal::Built(outputs) => {
                let mut resolved = BTreeMap::new();
                for (name, rendered) in outputs {
                    let output_name: OutputName = name
                        .parse()
                        .map_err(|e| DaemonError::InvalidPath(format!("output '{name}': {e}")))?;
                    resolved.insert(output_name, inner.store.parse_path(&rendered)?);
                }
                Ok(resolved)
            }
            Terminal::Failed { exit, .. } => Err(DaemonError::BuildFailed {
                drv_path: drv_path.to_string(),
                exit,
            }),
            Terminal::TimedOut => Err(DaemonError::TimedOut(drv_path.to_string())),
            Terminal::Canceled => Err(DaemonError::Canceled(drv_path.to_string())),
            Terminal::Expanded { .. } => unreachable!("realize entries never expand"),
            Terminal::Error(body) => Err(DaemonError::Upstream(body)),
        }
    })
}

/// The driver for one deduplicated build.
async fn drive_build(
    inner: &Arc<Inner>,
    drv_path: &StorePath,
    drv: &Derivation,
    fingerprint: &str,
    cancel: &CancellationToken,
) -> DaemonResult<BTreeMap<String, String>> {
    let store = &inner.store;
    let rendered_drv = store.store_dir().display(drv_path).to_string();

    // Preparation responds to cancellation directly; once the builder is
    // running, cancellation is handled inside the build monitor so the
    // child is always reaped.
    let prepared = tokio::select! {
        prepared = prepare_build(inner, drv_path, drv) => prepared?,
        _ = cancel.cancelled() => return Err(DaemonError::Canceled(rendered_drv)),
    };
    let resolved_inputs = match prepared {
        Prepared::Cached(outputs) => {
            debug!(drv = %rendered_drv, "realization cache hit");
            return Ok(outputs);
        }
        Prepared::NeedsBuild(resolved_inputs) => resolved_inputs,
    };

    // FIFO backpressure on sandboxed builds.
    let _permit = tokio::select! {
        permit = inner.jobs.acquire() => permit.expect("job semaphore is never closed"),
        _ = cancel.cancelled() => return Err(DaemonError::Canceled(rendered_drv)),
    };

    info!(drv = %rendered_drv, fingerprint, "starting build");
    let outputs = build::build_derivation(
        store,
        &inner.config,
        &inner.users,
        drv_path,
        drv,
        &resolved_inputs,
        fingerprint,
        cancel,
    )
    .await?;

    Ok(outputs
        .into_iter()
        .map(|(name, path)| {
            (
                name.to_string(),
                store.store_dir().display(&path).to_string(),
            )
        })
        .collect())
}

enum Prepared {
    Cached(BTreeMap<String, String>),
    NeedsBuild(BTreeMap<StorePath, BTreeMap<OutputName, StorePath>>),
}

/// Realize inputs, check sources, and consult the realization cache.
async fn prepare_build(
    inner: &Arc<Inner>,
    drv_path: &StorePath,
    drv: &Derivation,
) -> DaemonResult<Prepared> {
    let store = &inner.store;
    let rendered_drv = store.store_dir().display(drv_path).to_string();

    // Realize every required input derivation output first.
    let mut resolved_inputs: BTreeMap<StorePath, BTreeMap<OutputName, StorePath>> = BTreeMap::new();
    for in_drv_path in drv.input_derivations.keys() {
        let outputs = realize_outputs(inner, in_drv_path).await?;
        resolved_inputs.insert(in_drv_path.clone(), outputs);
    }

    // Input sources must already be present.
    for source in &drv.input_sources {
        if !store.exists(source).await? {
            return Err(DaemonError::NotFound(
                store.store_dir().display(source).to_string(),
            ));
        }
    }

    // Realization cache: if every output is recorded and still on disk,
    // skip the build.
    if let Some(cached) = cached_outputs(inner, &rendered_drv, drv).await? {
        return Ok(Prepared::Cached(cached));
    }
    Ok(Prepared::NeedsBuild(resolved_inputs))
}

/// Check the realization table for a complete, still-materialized result.
async fn cached_outputs(
    inner: &Arc<Inner>,
    rendered_drv: &str,
    drv: &Derivation,
) -> DaemonResult<Option<BTreeMap<String, String>>> {
    let store = &inner.store;
    let mut outputs = BTreeMap::new();
    for output_name in drv.outputs.keys() {
        let row = store
            .db()
            .lock()
            .await
            .query_realization(rendered_drv, output_name.as_str())?;
        let Some(rendered) = row else {
            return Ok(None);
        };
        let path = store.parse_path(&rendered)?;
        if !store.exists(&path).await? {
            return Ok(None);
        }
        outputs.insert(output_name.to_string(), rendered);
    }
    Ok(Some(outputs))
}

/// The dedup fingerprint of a derivation.
async fn fingerprint_for(
    inner: &Arc<Inner>,
    drv_path: &StorePath,
    drv: &Derivation,
) -> DaemonResult<String> {
    let fingerprint = if drv.all_outputs_known() {
        BuildFingerprint::Path(drv_path.clone())
    } else {
        BuildFingerprint::Masked(modulo_hash_for(inner, drv_path).await?)
    };
    Ok(fingerprint.to_string())
}

/// Recursive masked-text hash with memoization.
fn modulo_hash_for<'a>(
    inner: &'a Arc<Inner>,
    drv_path: &'a StorePath,
) -> futures::future::BoxFuture<'a, DaemonResult<Sha256>> {
    Box::pin(async move {
        if let Some(hash) = inner
            .modulo_hashes
            .lock()
            .expect("modulo hash mutex")
            .get(drv_path)
        {
            return Ok(*hash);
        }

        let drv = inner.store.read_derivation(drv_path).await?;
        let mut input_hashes = BTreeMap::new();
        for in_drv_path in drv.input_derivations.keys() {
            let hash = modulo_hash_for(inner, in_drv_path).await?;
            input_hashes.insert(in_drv_path.clone(), hash);
        }

        let hash = hash_modulo(inner.store.store_dir(), &drv, &input_hashes)
            .map_err(|e| DaemonError::DerivationParse {
                path: drv_path.to_string(),
                detail: e.to_string(),
            })?;
        inner
            .modulo_hashes
            .lock()
            .expect("modulo hash mutex")
            .insert(drv_path.clone(), hash);
        Ok(hash)
    })
}

/// The `Expand` pipeline: realize inputs, then compute the substituted
/// environment against the caller's temp directory.
async fn expand_task(
    inner: &Arc<Inner>,
    drv_path: &StorePath,
    drv: Derivation,
    temp_dir: PathBuf,
) -> DaemonResult<Terminal> {
    let mut resolved_inputs: BTreeMap<StorePath, BTreeMap<OutputName, StorePath>> = BTreeMap::new();
    for in_drv_path in drv.input_derivations.keys() {
        let outputs = realize_outputs(inner, in_drv_path).await?;
        resolved_inputs.insert(in_drv_path.clone(), outputs);
    }

    debug!(drv = %drv_path, "expanding build environment");
    let environment = build::expand_environment(
        &inner.store,
        &inner.config,
        &drv,
        &resolved_inputs,
        &temp_dir,
    )?;

    Ok(Terminal::Expanded {
        builder: environment.builder,
        args: environment.args,
        env: environment.env,
    })
}
