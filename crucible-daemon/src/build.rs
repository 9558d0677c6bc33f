// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Building a single derivation.
//!
//! The scheduler hands this module a derivation whose inputs are already
//! realized. It plans output paths (temporary ones for floating outputs),
//! substitutes placeholders into builder/args/env, runs the builder in a
//! sandbox under watchdog and cancellation, then verifies, rewrites and
//! registers the outputs.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::io::AsyncBufReadExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crucible_store_core::content_address::{
    ContentAddress, ContentAddressMethod, ContentAddressMethodAlgorithm,
};
use crucible_store_core::derivation::{Derivation, DerivationOutput, OutputName};
use crucible_store_core::placeholder::Placeholder;
use crucible_store_core::references::{StoreReferences, scan_for_references};
use crucible_store_core::rewrite::{find_digest_offsets, rewrite_digest_at};
use crucible_store_core::store_path::{StorePath, StorePathName};
use crucible_store_db::{BuildLogEntry, RegisterObjectParams};
use crucible_utils_hash::{Algorithm, Sha256, compressed_base32};

use crate::build_users::BuildUserPool;
use crate::config::Config;
use crate::error::{DaemonError, DaemonResult, IoContext as _};
use crate::pathlocks::PathLock;
use crate::sandbox::{self, SandboxSpec};
use crate::store::LocalStore;

/// Failures local to builder execution; converted to [`DaemonError`] with
/// the derivation path attached.
#[derive(Debug)]
pub enum BuildError {
    Timeout,
    Canceled,
    ExitCode(i32),
    Other(String),
}

/// Where each output will materialize.
#[derive(Debug, Clone)]
pub enum PlannedOutput {
    /// Path known up front; the builder writes straight into the store.
    Known {
        path: StorePath,
        fixed: Option<ContentAddress>,
    },
    /// Floating: the builder writes to a temporary store path whose digest
    /// is rewritten once the real path is computed from the output's
    /// content.
    Floating {
        temp_path: StorePath,
        temp_digest: String,
        method_algo: ContentAddressMethodAlgorithm,
    },
}

impl PlannedOutput {
    fn build_path(&self) -> &StorePath {
        match self {
            PlannedOutput::Known { path, .. } => path,
            PlannedOutput::Floating { temp_path, .. } => temp_path,
        }
    }
}

/// The substituted environment a build runs with, also returned verbatim
/// by `Expand`.
pub struct BuildEnvironment {
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub allow_network: bool,
    /// Output name → absolute path the builder writes to.
    pub outputs: BTreeMap<OutputName, String>,
}

/// Compute the temporary digest for a floating output, deterministic per
/// (fingerprint, output) so concurrent identical builds agree.
fn temp_digest(fingerprint: &str, output_name: &OutputName) -> String {
    let hash = Sha256::digest(format!("rewrite:{fingerprint}:{output_name}"));
    compressed_base32(hash.digest_bytes())
}

/// Plan output paths and build the placeholder substitution map.
pub fn plan_outputs(
    store: &LocalStore,
    drv: &Derivation,
    resolved_inputs: &BTreeMap<StorePath, BTreeMap<OutputName, StorePath>>,
    fingerprint: &str,
) -> DaemonResult<(BTreeMap<OutputName, PlannedOutput>, Vec<(String, String)>)> {
    let store_dir = store.store_dir();
    let mut planned = BTreeMap::new();
    let mut substitutions = Vec::new();

    for (output_name, output) in &drv.outputs {
        let planned_output = match output {
            DerivationOutput::InputAddressed(path) => PlannedOutput::Known {
                path: path.clone(),
                fixed: None,
            },
            DerivationOutput::CAFixed(ca) => {
                let path = output
                    .path(store_dir, drv, output_name)
                    .map_err(DaemonError::Name)?
                    .expect("fixed outputs derive a path");
                PlannedOutput::Known {
                    path,
                    fixed: Some(*ca),
                }
            }
            DerivationOutput::CAFloating(method_algo) => {
                let digest = temp_digest(fingerprint, output_name);
                let name: StorePathName = drv
                    .output_path_name(output_name)
                    .map_err(DaemonError::Name)?;
                let temp_path: StorePath = format!("{digest}-{name}")
                    .parse()
                    .map_err(DaemonError::from)?;
                PlannedOutput::Floating {
                    temp_path,
                    temp_digest: digest,
                    method_algo: *method_algo,
                }
            }
            DerivationOutput::Deferred => {
                return Err(DaemonError::DerivationParse {
                    path: drv.name.to_string(),
                    detail: format!("output '{output_name}' is deferred and cannot be built"),
                });
            }
        };

        let placeholder = Placeholder::output(output_name).render();
        let replacement = store_dir.display(planned_output.build_path()).to_string();
        substitutions.push((placeholder, replacement));
        planned.insert(output_name.clone(), planned_output);
    }

    for (in_drv_path, wanted_outputs) in &drv.input_derivations {
        let realized = resolved_inputs.get(in_drv_path).ok_or_else(|| {
            DaemonError::NotFound(format!("unrealized input derivation {in_drv_path}"))
        })?;
        for output_name in wanted_outputs {
            let resolved = realized.get(output_name).ok_or_else(|| {
                DaemonError::NotFound(format!(
                    "input derivation {in_drv_path} has no realized output '{output_name}'"
                ))
            })?;
            substitutions.push((
                Placeholder::upstream_output(in_drv_path, output_name).render(),
                store_dir.display(resolved).to_string(),
            ));
        }
    }

    Ok((planned, substitutions))
}

fn substitute(value: &str, substitutions: &[(String, String)]) -> String {
    let mut result = value.to_string();
    for (placeholder, replacement) in substitutions {
        if result.contains(placeholder.as_str()) {
            result = result.replace(placeholder.as_str(), replacement);
        }
    }
    result
}

/// Apply substitutions and assemble the builder environment.
///
/// `outputs` maps each output name to the absolute path the builder writes
/// to — store paths for a real build, scratch paths for `Expand`.
///
/// Ordering: overridable defaults, then the derivation's env, then the
/// variables a builder may never override (temp dirs, output paths).
pub fn prepare_environment(
    store: &LocalStore,
    config: &Config,
    drv: &Derivation,
    outputs: &BTreeMap<OutputName, String>,
    substitutions: &[(String, String)],
    build_dir: &Path,
) -> BuildEnvironment {
    let store_dir = store.store_dir();
    let build_dir_str = build_dir.to_string_lossy().to_string();

    let mut env: BTreeMap<String, String> = BTreeMap::new();
    env.insert("PATH".into(), "/path-not-set".into());
    env.insert("HOME".into(), "/homeless-shelter".into());
    env.insert("NIX_STORE".into(), store_dir.to_str().to_string());
    env.insert("NIX_BUILD_CORES".into(), config.max_jobs.to_string());

    let mut allow_network = false;
    for (key, value) in &drv.env {
        let value = substitute(value, substitutions);
        if key == "__network" {
            allow_network = value == "1" || value == "true";
            continue;
        }
        env.insert(key.clone(), value);
    }

    env.insert("NIX_BUILD_TOP".into(), build_dir_str.clone());
    env.insert("TMPDIR".into(), build_dir_str.clone());
    env.insert("TEMPDIR".into(), build_dir_str.clone());
    env.insert("TMP".into(), build_dir_str.clone());
    env.insert("TEMP".into(), build_dir_str.clone());
    env.insert("PWD".into(), build_dir_str);

    let mut output_names = Vec::new();
    for (name, path) in outputs {
        env.insert(name.to_string(), path.clone());
        output_names.push(name.to_string());
    }
    env.insert("outputs".into(), output_names.join(" "));

    // Fixed-output builds may import whitelisted host variables, e.g.
    // proxies for fetchers.
    if drv.is_fixed_output()
        && let Some(impure) = drv.env.get("impureEnvVars")
    {
        for var in impure.split_whitespace() {
            if let Ok(value) = std::env::var(var) {
                env.insert(var.to_string(), value);
            }
        }
        // Fixed outputs are verified against their declared hash, so the
        // network is open for them regardless of __network.
        allow_network = true;
    }

    env.insert("TERM".into(), "xterm-256color".into());

    BuildEnvironment {
        builder: substitute(&drv.builder, substitutions),
        args: drv
            .args
            .iter()
            .map(|arg| substitute(arg, substitutions))
            .collect(),
        env,
        allow_network,
        outputs: outputs.clone(),
    }
}

/// The `Expand` variant: substitute like a real build, but point outputs
/// at scratch paths under `temp_dir`.
pub fn expand_environment(
    store: &LocalStore,
    config: &Config,
    drv: &Derivation,
    resolved_inputs: &BTreeMap<StorePath, BTreeMap<OutputName, StorePath>>,
    temp_dir: &Path,
) -> DaemonResult<BuildEnvironment> {
    let mut outputs = BTreeMap::new();
    let mut substitutions = Vec::new();
    for output_name in drv.outputs.keys() {
        let scratch = temp_dir.join(output_name.as_str());
        let rendered = scratch.to_string_lossy().to_string();
        substitutions.push((Placeholder::output(output_name).render(), rendered.clone()));
        outputs.insert(output_name.clone(), rendered);
    }
    for (in_drv_path, wanted_outputs) in &drv.input_derivations {
        let realized = resolved_inputs.get(in_drv_path).ok_or_else(|| {
            DaemonError::NotFound(format!("unrealized input derivation {in_drv_path}"))
        })?;
        for output_name in wanted_outputs {
            let resolved = realized.get(output_name).ok_or_else(|| {
                DaemonError::NotFound(format!(
                    "input derivation {in_drv_path} has no realized output '{output_name}'"
                ))
            })?;
            substitutions.push((
                Placeholder::upstream_output(in_drv_path, output_name).render(),
                store.store_dir().display(resolved).to_string(),
            ));
        }
    }
    Ok(prepare_environment(
        store,
        config,
        drv,
        &outputs,
        &substitutions,
        temp_dir,
    ))
}

/// Run the builder for `drv` and register its outputs.
#[allow(clippy::too_many_arguments)]
pub async fn build_derivation(
    store: &LocalStore,
    config: &Config,
    users: &BuildUserPool,
    drv_path: &StorePath,
    drv: &Derivation,
    resolved_inputs: &BTreeMap<StorePath, BTreeMap<OutputName, StorePath>>,
    fingerprint: &str,
    cancel: &CancellationToken,
) -> DaemonResult<BTreeMap<OutputName, StorePath>> {
    let started_at = SystemTime::now();
    let rendered_drv = store.store_dir().display(drv_path).to_string();

    let build_tmp = tempfile::Builder::new()
        .prefix("crucible-build-")
        .tempdir_in(&config.build_dir)
        .io_context(|| format!("creating build dir in {}", config.build_dir.display()))?;

    let (planned, substitutions) = plan_outputs(store, drv, resolved_inputs, fingerprint)?;
    let output_paths: BTreeMap<OutputName, String> = planned
        .iter()
        .map(|(name, planned_output)| {
            (
                name.clone(),
                store
                    .store_dir()
                    .display(planned_output.build_path())
                    .to_string(),
            )
        })
        .collect();
    let environment =
        prepare_environment(store, config, drv, &output_paths, &substitutions, build_tmp.path());

    // Take per-output path locks in sorted order (BTreeMap iteration) so
    // concurrent builds touching the same outputs cannot deadlock.
    let mut locks = Vec::new();
    for planned_output in planned.values() {
        let disk = store.object_path(planned_output.build_path());
        locks.push(
            PathLock::lock_async(&disk)
                .await
                .io_context(|| format!("locking output {}", disk.display()))?,
        );
    }

    // Clear unregistered debris from interrupted builds so the builder can
    // create its outputs.
    for planned_output in planned.values() {
        let disk = store.object_path(planned_output.build_path());
        let rendered = store
            .store_dir()
            .display(planned_output.build_path())
            .to_string();
        if disk.exists() && !store.db().lock().await.is_valid_path(&rendered)? {
            let _ = tokio::fs::remove_dir_all(&disk).await;
            let _ = tokio::fs::remove_file(&disk).await;
        }
    }

    let (log_sink, log_ref) = open_build_log(config, drv_path)?;
    let result =
        run_builder(config, users, &environment, build_tmp.path(), cancel, &log_sink).await;

    let status = match &result {
        Ok(()) => "built",
        Err(BuildError::Timeout) => "timedOut",
        Err(BuildError::Canceled) => "canceled",
        Err(BuildError::ExitCode(_)) | Err(BuildError::Other(_)) => "failed",
    };
    store
        .db()
        .lock()
        .await
        .record_build_log(&BuildLogEntry {
            drv_path: rendered_drv.clone(),
            started_at,
            ended_at: SystemTime::now(),
            status: status.into(),
            log_blob_ref: log_ref.clone(),
        })?;

    match result {
        Ok(()) => {}
        Err(BuildError::Timeout) => {
            cleanup_outputs(store, &planned, config.keep_failed).await;
            return Err(DaemonError::TimedOut(rendered_drv));
        }
        Err(BuildError::Canceled) => {
            cleanup_outputs(store, &planned, false).await;
            return Err(DaemonError::Canceled(rendered_drv));
        }
        Err(BuildError::ExitCode(exit)) => {
            cleanup_outputs(store, &planned, config.keep_failed).await;
            return Err(DaemonError::BuildFailed {
                drv_path: rendered_drv,
                exit,
            });
        }
        Err(BuildError::Other(message)) => {
            cleanup_outputs(store, &planned, config.keep_failed).await;
            return Err(DaemonError::Sandbox(message));
        }
    }

    let outputs = register_outputs(store, drv_path, drv, resolved_inputs, &planned).await;
    if outputs.is_err() {
        cleanup_outputs(store, &planned, config.keep_failed).await;
    }
    let outputs = outputs?;

    info!(drv = %rendered_drv, outputs = outputs.len(), "build complete");
    Ok(outputs)
}

/// Spawn and monitor the builder (or run a builtin in-process).
async fn run_builder(
    config: &Config,
    users: &BuildUserPool,
    environment: &BuildEnvironment,
    work_dir: &Path,
    cancel: &CancellationToken,
    log_sink: &Arc<Mutex<dyn std::io::Write + Send>>,
) -> Result<(), BuildError> {
    if let Some(builtin) = environment.builder.strip_prefix("builtin:") {
        return match builtin {
            "fetchurl" => {
                let out = environment
                    .outputs
                    .values()
                    .next()
                    .ok_or_else(|| BuildError::Other("fetchurl: no output".into()))?;
                crate::builtins::fetchurl::run(&environment.env, Path::new(out)).await
            }
            other => Err(BuildError::Other(format!(
                "unsupported builtin builder 'builtin:{other}'"
            ))),
        };
    }

    let lease = users.acquire().await;
    let spec = SandboxSpec {
        builder: &environment.builder,
        args: &environment.args,
        env: &environment.env,
        work_dir,
        build_user: lease.as_ref().map(|l| l.user()),
        allow_network: environment.allow_network,
    };
    let child = sandbox::spawn(&spec).map_err(|e| BuildError::Other(e.to_string()))?;
    monitor_child(child, config, cancel, log_sink).await
}

/// Drain builder output to the log sink while enforcing the wall-clock
/// timeout, the silence watchdog, and cancellation (SIGTERM, then SIGKILL
/// after the grace period).
async fn monitor_child(
    mut child: sandbox::SandboxChild,
    config: &Config,
    cancel: &CancellationToken,
    log_sink: &Arc<Mutex<dyn std::io::Write + Send>>,
) -> Result<(), BuildError> {
    let pid = child.pid();
    let last_output = Arc::new(Mutex::new(tokio::time::Instant::now()));

    let mut drains = Vec::new();
    if let Some(stdout) = child.take_stdout() {
        drains.push(tokio::spawn(drain_lines(
            stdout,
            Arc::clone(log_sink),
            Arc::clone(&last_output),
        )));
    }
    if let Some(stderr) = child.take_stderr() {
        drains.push(tokio::spawn(drain_lines(
            stderr,
            Arc::clone(log_sink),
            Arc::clone(&last_output),
        )));
    }

    let wall_deadline = config
        .build_timeout()
        .map(|timeout| tokio::time::Instant::now() + timeout);
    let max_silent = config.max_silent();

    enum Interrupt {
        Exited(Result<std::process::ExitStatus, crate::sandbox::SandboxError>),
        Canceled,
        Tick,
    }

    let poll_interval = std::time::Duration::from_millis(50);
    let outcome = loop {
        // The select only decides *what happened*; the child is acted on
        // afterwards, once the competing wait future is gone.
        let interrupt = tokio::select! {
            status = child.wait() => Interrupt::Exited(status),
            _ = cancel.cancelled() => Interrupt::Canceled,
            _ = tokio::time::sleep(poll_interval) => Interrupt::Tick,
        };

        match interrupt {
            Interrupt::Exited(Ok(status)) if status.success() => break Ok(()),
            Interrupt::Exited(Ok(status)) => {
                break Err(BuildError::ExitCode(status.code().unwrap_or(-1)));
            }
            Interrupt::Exited(Err(e)) => {
                break Err(BuildError::Other(format!("wait failed: {e}")));
            }
            Interrupt::Canceled => {
                warn!("build canceled, terminating builder");
                sandbox::term_process_group(pid);
                let graceful = tokio::time::timeout(config.kill_grace(), child.wait()).await;
                if graceful.is_err() {
                    sandbox::kill_process_group(pid);
                    let _ = child.kill().await;
                }
                break Err(BuildError::Canceled);
            }
            Interrupt::Tick => {
                let wall_expired = wall_deadline
                    .is_some_and(|deadline| tokio::time::Instant::now() >= deadline);
                let silent_expired = max_silent.is_some_and(|limit| {
                    last_output.lock().expect("watchdog mutex").elapsed() >= limit
                });
                if wall_expired || silent_expired {
                    sandbox::kill_process_group(pid);
                    let _ = child.kill().await;
                    break Err(BuildError::Timeout);
                }
            }
        }
    };

    for drain in drains {
        let _ = drain.await;
    }
    outcome
}

async fn drain_lines<R>(
    reader: R,
    sink: Arc<Mutex<dyn std::io::Write + Send>>,
    last_output: Arc<Mutex<tokio::time::Instant>>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = tokio::io::BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        *last_output.lock().expect("watchdog mutex") = tokio::time::Instant::now();
        let mut sink = sink.lock().expect("log sink mutex");
        let _ = writeln!(sink, "{line}");
    }
}

#[allow(clippy::type_complexity)]
fn open_build_log(
    config: &Config,
    drv_path: &StorePath,
) -> DaemonResult<(Arc<Mutex<dyn std::io::Write + Send>>, Option<String>)> {
    match &config.log_dir {
        Some(log_dir) => {
            let file_name = format!("{drv_path}.log");
            let log_path = log_dir.join(&file_name);
            let file = std::fs::File::create(&log_path)
                .io_context(|| format!("creating build log {}", log_path.display()))?;
            Ok((
                Arc::new(Mutex::new(file)),
                Some(log_path.to_string_lossy().to_string()),
            ))
        }
        None => Ok((Arc::new(Mutex::new(std::io::sink())), None)),
    }
}

/// Verify, rewrite and register every declared output.
async fn register_outputs(
    store: &LocalStore,
    drv_path: &StorePath,
    drv: &Derivation,
    resolved_inputs: &BTreeMap<StorePath, BTreeMap<OutputName, StorePath>>,
    planned: &BTreeMap<OutputName, PlannedOutput>,
) -> DaemonResult<BTreeMap<OutputName, StorePath>> {
    // Anything a fresh output may legitimately reference: declared sources
    // and the realized outputs of input derivations.
    let mut candidate_refs: Vec<StorePath> = drv.input_sources.iter().cloned().collect();
    for realized in resolved_inputs.values() {
        candidate_refs.extend(realized.values().cloned());
    }

    let rendered_drv = store.store_dir().display(drv_path).to_string();
    let mut outputs = BTreeMap::new();

    for (output_name, planned_output) in planned {
        let final_path = match planned_output {
            PlannedOutput::Known { path, fixed } => {
                register_known_output(store, path, *fixed, &candidate_refs).await?
            }
            PlannedOutput::Floating {
                temp_path,
                temp_digest,
                method_algo,
            } => {
                register_floating_output(
                    store,
                    drv,
                    output_name,
                    temp_path,
                    temp_digest,
                    *method_algo,
                    &candidate_refs,
                )
                .await?
            }
        };

        store.db().lock().await.record_realization(
            &rendered_drv,
            output_name.as_str(),
            &store.store_dir().display(&final_path).to_string(),
        )?;
        outputs.insert(output_name.clone(), final_path);
    }

    Ok(outputs)
}

/// A fixed or input-addressed output: the builder wrote to its final path;
/// verify (for fixed) and register.
async fn register_known_output(
    store: &LocalStore,
    path: &StorePath,
    fixed: Option<ContentAddress>,
    candidate_refs: &[StorePath],
) -> DaemonResult<StorePath> {
    let disk = store.object_path(path);
    let rendered = store.store_dir().display(path).to_string();
    if !disk.exists() {
        return Err(DaemonError::Sandbox(format!(
            "builder did not produce output path '{rendered}'"
        )));
    }

    let nar = crucible_archive::pack_to_vec(&disk)
        .await
        .map_err(|e| DaemonError::io("packing output", std::io::Error::other(e)))?;
    let nar_sha256 = Sha256::digest(&nar);

    if let Some(ca) = fixed {
        verify_fixed_output(&disk, &rendered, ca, &nar, nar_sha256).await?;
    }

    // Already registered (e.g. a concurrent fixed-output build landed
    // first): the content matched, so keep the existing registration.
    if store.db().lock().await.is_valid_path(&rendered)? {
        return Ok(path.clone());
    }

    // Fixed outputs are addressed with an empty reference set; only
    // input-addressed outputs record scanned references.
    let mut references = std::collections::BTreeSet::new();
    if fixed.is_none() {
        references = scan_for_references(&nar, candidate_refs.iter())
            .into_iter()
            .map(|r| store.store_dir().display(&r).to_string())
            .collect();
        if !scan_for_references(&nar, [path]).is_empty() {
            references.insert(rendered.clone());
        }
    }

    store.db().lock().await.register_object(&RegisterObjectParams {
        path: rendered,
        ca: fixed.map(|ca| ca.to_string()).unwrap_or_default(),
        nar_hash: nar_sha256.to_string(),
        nar_size: nar.len() as u64,
        references,
    })?;
    Ok(path.clone())
}

/// Check a fixed output's bytes against its declared content address.
async fn verify_fixed_output(
    disk: &Path,
    rendered: &str,
    ca: ContentAddress,
    nar: &[u8],
    nar_sha256: Sha256,
) -> DaemonResult<()> {
    let actual = match ca.method() {
        ContentAddressMethod::Recursive => {
            if ca.hash().algorithm() == Algorithm::SHA256 {
                crucible_utils_hash::Hash::from(nar_sha256)
            } else {
                ca.hash().algorithm().digest(nar)
            }
        }
        ContentAddressMethod::Flat => {
            let contents = tokio::fs::read(disk)
                .await
                .io_context(|| format!("reading fixed output {}", disk.display()))?;
            ca.hash().algorithm().digest(&contents)
        }
        ContentAddressMethod::Text => {
            return Err(DaemonError::ContentMismatch {
                path: rendered.to_string(),
                detail: "text content addresses are not valid for build outputs".into(),
            });
        }
    };

    if actual != ca.hash() {
        return Err(DaemonError::ContentMismatch {
            path: rendered.to_string(),
            detail: format!(
                "declared {} but produced {}",
                ca.hash().as_base32(),
                actual.as_base32()
            ),
        });
    }
    Ok(())
}

/// A floating output: compute its content address from what was built,
/// derive the final path, rewrite the temporary digest, move into place.
#[allow(clippy::too_many_arguments)]
async fn register_floating_output(
    store: &LocalStore,
    drv: &Derivation,
    output_name: &OutputName,
    temp_path: &StorePath,
    temp_digest: &str,
    method_algo: ContentAddressMethodAlgorithm,
    candidate_refs: &[StorePath],
) -> DaemonResult<StorePath> {
    let store_dir = store.store_dir();
    let temp_disk = store.object_path(temp_path);
    if !temp_disk.exists() {
        return Err(DaemonError::Sandbox(format!(
            "builder did not produce output path '{}'",
            store_dir.display(temp_path)
        )));
    }

    let mut nar = crucible_archive::pack_to_vec(&temp_disk)
        .await
        .map_err(|e| DaemonError::io("packing output", std::io::Error::other(e)))?;

    let offsets = find_digest_offsets(&nar, temp_digest)
        .map_err(|e| DaemonError::Sandbox(e.to_string()))?;
    let references = StoreReferences {
        others: scan_for_references(&nar, candidate_refs.iter()),
        self_ref: !offsets.is_empty(),
    };

    // The content address hashes the serialization as built, before the
    // digest rewrite.
    let nar_sha256 = Sha256::digest(&nar);
    let name = drv.output_path_name(output_name).map_err(DaemonError::Name)?;

    let ca = match method_algo {
        ContentAddressMethodAlgorithm::Recursive(Algorithm::SHA256) => {
            ContentAddress::Recursive(nar_sha256.into())
        }
        other => {
            if !references.is_empty() {
                return Err(DaemonError::ContentMismatch {
                    path: store_dir.display(temp_path).to_string(),
                    detail: format!("floating '{other}' outputs cannot carry references"),
                });
            }
            floating_content_address(&temp_disk, other, &nar).await?
        }
    };
    let final_path = match ca {
        ContentAddress::Recursive(hash) if hash.algorithm() == Algorithm::SHA256 => {
            store_dir.make_source_path(&name, nar_sha256, &references)
        }
        other_ca => store_dir
            .make_fixed_output_path(&name, other_ca, &references)
            .map_err(|e| DaemonError::InvalidPath(e.to_string()))?,
    };

    rewrite_digest_at(&mut nar, &offsets, final_path.digest().as_str())
        .map_err(|e| DaemonError::Sandbox(e.to_string()))?;

    let final_disk = store.object_path(&final_path);
    let rendered = store_dir.display(&final_path).to_string();
    let _lock = PathLock::lock_async(&final_disk)
        .await
        .io_context(|| format!("locking {}", final_disk.display()))?;

    if !store.db().lock().await.is_valid_path(&rendered)? {
        if final_disk.exists() {
            let _ = tokio::fs::remove_dir_all(&final_disk).await;
            let _ = tokio::fs::remove_file(&final_disk).await;
        }
        if offsets.is_empty() {
            // No self-references: the built tree is already correct.
            tokio::fs::rename(&temp_disk, &final_disk)
                .await
                .io_context(|| format!("moving output to {}", final_disk.display()))?;
        } else {
            // Materialize the rewritten serialization instead.
            use futures::TryStreamExt as _;
            crucible_archive::restore(
                crucible_archive::parse(&nar[..]).map_err(std::io::Error::other),
                &final_disk,
            )
            .await
            .map_err(|e| DaemonError::io("restoring rewritten output", std::io::Error::other(e)))?;
        }

        let nar_stored_hash = if offsets.is_empty() {
            nar_sha256
        } else {
            Sha256::digest(&nar)
        };
        let mut reference_strings: std::collections::BTreeSet<String> = references
            .others
            .iter()
            .map(|r| store_dir.display(r).to_string())
            .collect();
        if references.self_ref {
            reference_strings.insert(rendered.clone());
        }
        store.db().lock().await.register_object(&RegisterObjectParams {
            path: rendered,
            ca: ca.to_string(),
            nar_hash: nar_stored_hash.to_string(),
            nar_size: nar.len() as u64,
            references: reference_strings,
        })?;
    } else {
        debug!(path = %rendered, "floating output already registered");
    }

    // The temporary tree is no longer needed (rename already removed it in
    // the common case).
    let _ = tokio::fs::remove_dir_all(&temp_disk).await;
    let _ = tokio::fs::remove_file(&temp_disk).await;

    Ok(final_path)
}

/// Content address of a non-`r:sha256` floating output.
async fn floating_content_address(
    disk: &Path,
    method_algo: ContentAddressMethodAlgorithm,
    nar: &[u8],
) -> DaemonResult<ContentAddress> {
    Ok(match method_algo {
        ContentAddressMethodAlgorithm::Text => {
            return Err(DaemonError::ContentMismatch {
                path: disk.display().to_string(),
                detail: "text content addresses are not valid for build outputs".into(),
            });
        }
        ContentAddressMethodAlgorithm::Flat(algorithm) => {
            let contents = tokio::fs::read(disk)
                .await
                .io_context(|| format!("reading output {}", disk.display()))?;
            ContentAddress::Flat(algorithm.digest(&contents))
        }
        ContentAddressMethodAlgorithm::Recursive(algorithm) => {
            ContentAddress::Recursive(algorithm.digest(nar))
        }
    })
}

/// Remove (or preserve under `.failed`) the outputs of an unsuccessful
/// build. Outputs that are registered store objects are left alone.
async fn cleanup_outputs(
    store: &LocalStore,
    planned: &BTreeMap<OutputName, PlannedOutput>,
    keep_failed: bool,
) {
    for planned_output in planned.values() {
        let disk = store.object_path(planned_output.build_path());
        if !disk.exists() {
            continue;
        }
        let rendered = store
            .store_dir()
            .display(planned_output.build_path())
            .to_string();
        if matches!(
            store.db().lock().await.is_valid_path(&rendered),
            Ok(true)
        ) {
            continue;
        }
        if keep_failed {
            let failed = PathBuf::from(format!("{}.failed", disk.display()));
            let _ = tokio::fs::rename(&disk, &failed).await;
        } else {
            let _ = tokio::fs::remove_dir_all(&disk).await;
            let _ = tokio::fs::remove_file(&disk).await;
        }
    }
}
