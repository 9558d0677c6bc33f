// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Build user allocation.
//!
//! When the daemon runs as root with a configured build-users group, each
//! build leases a distinct uid from the group's members for its lifetime.
//! A uid is never handed to two active builds at once; builds past the
//! pool size wait for a lease to free up.

use std::sync::{Arc, Mutex};

use nix::unistd::{Gid, Uid};
use tokio::sync::Semaphore;

use crate::error::DaemonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildUser {
    pub uid: Uid,
    pub gid: Gid,
}

struct PoolInner {
    users: Vec<BuildUser>,
    free: Mutex<Vec<usize>>,
    slots: Semaphore,
}

/// A pool of build users; empty means "run builders as the daemon's user".
#[derive(Clone)]
pub struct BuildUserPool {
    inner: Option<Arc<PoolInner>>,
}

impl BuildUserPool {
    /// No isolation uids; leases are `None`.
    pub fn disabled() -> Self {
        BuildUserPool { inner: None }
    }

    /// Resolve the members of `group_name` into the pool.
    pub fn from_group(group_name: &str) -> Result<Self, DaemonError> {
        let group = nix::unistd::Group::from_name(group_name)
            .map_err(|e| DaemonError::Sandbox(format!("looking up group '{group_name}': {e}")))?
            .ok_or_else(|| {
                DaemonError::Sandbox(format!("build-users group '{group_name}' does not exist"))
            })?;

        let mut users = Vec::new();
        for member in &group.mem {
            let user = nix::unistd::User::from_name(member)
                .map_err(|e| DaemonError::Sandbox(format!("looking up user '{member}': {e}")))?
                .ok_or_else(|| {
                    DaemonError::Sandbox(format!(
                        "user '{member}' in group '{group_name}' does not exist"
                    ))
                })?;
            users.push(BuildUser {
                uid: user.uid,
                gid: group.gid,
            });
        }

        if users.is_empty() {
            return Err(DaemonError::Sandbox(format!(
                "build-users group '{group_name}' has no members"
            )));
        }

        let count = users.len();
        Ok(BuildUserPool {
            inner: Some(Arc::new(PoolInner {
                users,
                free: Mutex::new((0..count).collect()),
                slots: Semaphore::new(count),
            })),
        })
    }

    /// Lease a build user, waiting for one to free up if the pool is
    /// exhausted. `None` when the pool is disabled.
    pub async fn acquire(&self) -> Option<BuildUserLease> {
        let inner = self.inner.as_ref()?.clone();
        let permit = inner
            .slots
            .acquire()
            .await
            .expect("build user semaphore is never closed");
        permit.forget();
        let index = inner
            .free
            .lock()
            .expect("build user pool mutex")
            .pop()
            .expect("a permit guarantees a free slot");
        let user = inner.users[index];
        Some(BuildUserLease { inner, index, user })
    }
}

/// Exclusive use of one build user; returns to the pool on drop.
pub struct BuildUserLease {
    inner: Arc<PoolInner>,
    index: usize,
    user: BuildUser,
}

impl BuildUserLease {
    pub fn user(&self) -> BuildUser {
        self.user
    }
}

impl Drop for BuildUserLease {
    fn drop(&mut self) {
        self.inner
            .free
            .lock()
            .expect("build user pool mutex")
            .push(self.index);
        self.inner.slots.add_permits(1);
    }
}
