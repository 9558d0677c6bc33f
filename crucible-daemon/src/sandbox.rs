// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Builder process isolation.
//!
//! Every build runs in a fresh working directory with a scrubbed
//! environment. When the daemon is root, the builder additionally drops to
//! a leased build uid, and network access is cut with a fresh network
//! namespace unless the derivation sets `__network = 1`. Builders are
//! spawned in their own process group so watchdog and cancellation kills
//! reach the whole process tree.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tracing::debug;

use crate::build_users::BuildUser;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("sandbox spawn failed: {0}")]
    Spawn(String),
    #[error("io error in sandbox: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to launch one builder process.
pub struct SandboxSpec<'a> {
    pub builder: &'a str,
    pub args: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub work_dir: &'a Path,
    /// Leased uid/gid to drop to; `None` runs as the daemon's user.
    pub build_user: Option<BuildUser>,
    /// Permit outbound network (`__network = 1` in the derivation env).
    pub allow_network: bool,
}

/// A running builder.
pub struct SandboxChild {
    inner: tokio::process::Child,
}

impl SandboxChild {
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, SandboxError> {
        self.inner.wait().await.map_err(SandboxError::Io)
    }

    pub async fn kill(&mut self) -> Result<(), SandboxError> {
        self.inner.kill().await.map_err(SandboxError::Io)
    }

    pub fn take_stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.inner.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<tokio::process::ChildStderr> {
        self.inner.stderr.take()
    }

    /// Process id, which is also the process group id.
    pub fn pid(&self) -> Option<u32> {
        self.inner.id()
    }
}

/// Spawn a builder under the sandbox policy in `spec`.
#[allow(unsafe_code)]
pub fn spawn(spec: &SandboxSpec<'_>) -> Result<SandboxChild, SandboxError> {
    let mut cmd = tokio::process::Command::new(spec.builder);
    cmd.args(spec.args)
        .current_dir(spec.work_dir)
        .env_clear()
        .envs(spec.env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let build_user = spec.build_user;
    let cut_network = !spec.allow_network && nix::unistd::geteuid().is_root();
    if cut_network || build_user.is_some() {
        // SAFETY: only async-signal-safe calls (unshare, setgid, setuid)
        // run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if cut_network && libc::unshare(libc::CLONE_NEWNET) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(user) = build_user {
                    if libc::setgid(user.gid.as_raw()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setgroups(0, std::ptr::null()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setuid(user.uid.as_raw()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    debug!(
        builder = spec.builder,
        uid = ?build_user.map(|u| u.uid.as_raw()),
        network = spec.allow_network,
        "spawning builder"
    );
    let child = cmd
        .spawn()
        .map_err(|e| SandboxError::Spawn(format!("failed to spawn '{}': {e}", spec.builder)))?;

    Ok(SandboxChild { inner: child })
}

/// SIGKILL the whole process group rooted at `pid`.
#[allow(unsafe_code)]
pub fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: plain POSIX kill on a process group we created via
        // process_group(0).
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

/// SIGTERM the process group, the polite half of cancellation.
#[allow(unsafe_code)]
pub fn term_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: as above.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        }
    }
}
