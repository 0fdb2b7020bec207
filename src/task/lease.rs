//! Per-resource task leases.
//!
//! A task holds an exclusive lease on the config it mutates and a shared
//! lease on every universe it touches. Leases are acquired all-or-nothing
//! before a pipeline is built and released when the [`Lease`] guard drops,
//! which the orchestrator does on the task's terminal state. A conflicting
//! request fails immediately; nothing is queued.

use super::types::TaskId;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseKey {
    Config(Uuid),
    Universe(Uuid),
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseKey::Config(id) => write!(f, "config {}", id),
            LeaseKey::Universe(id) => write!(f, "universe {}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    Exclusive,
    Shared,
}

#[derive(Debug, Default)]
struct Holders {
    exclusive: Option<TaskId>,
    shared: HashSet<TaskId>,
}

impl Holders {
    fn conflict(&self, owner: TaskId, mode: LeaseMode) -> Option<TaskId> {
        if let Some(holder) = self.exclusive.filter(|h| *h != owner) {
            return Some(holder);
        }
        match mode {
            LeaseMode::Exclusive => self.shared.iter().find(|h| **h != owner).copied(),
            LeaseMode::Shared => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

type Table = Arc<Mutex<HashMap<LeaseKey, Holders>>>;

#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    inner: Table,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every requested key for `owner`, or none of them.
    pub fn acquire(&self, owner: TaskId, requests: &[(LeaseKey, LeaseMode)]) -> Result<Lease> {
        let mut table = self.inner.lock();

        for (key, mode) in requests {
            if let Some(holder) = table.get(key).and_then(|h| h.conflict(owner, *mode)) {
                debug!(%key, %owner, %holder, "Lease conflict");
                return Err(Error::ConcurrencyConflict {
                    resource: key.to_string(),
                    holder,
                });
            }
        }

        for (key, mode) in requests {
            let holders = table.entry(*key).or_default();
            match mode {
                LeaseMode::Exclusive => holders.exclusive = Some(owner),
                LeaseMode::Shared => {
                    holders.shared.insert(owner);
                }
            }
        }

        Ok(Lease {
            table: Arc::clone(&self.inner),
            owner,
            keys: requests.to_vec(),
        })
    }

    /// Lease for a task mutating `config_id` across `universes`.
    pub fn acquire_for_config(
        &self,
        owner: TaskId,
        config_id: Uuid,
        universes: &[Uuid],
    ) -> Result<Lease> {
        let mut requests = vec![(LeaseKey::Config(config_id), LeaseMode::Exclusive)];
        requests.extend(
            universes
                .iter()
                .map(|u| (LeaseKey::Universe(*u), LeaseMode::Shared)),
        );
        self.acquire(owner, &requests)
    }

    pub fn is_held(&self, key: LeaseKey) -> bool {
        self.inner
            .lock()
            .get(&key)
            .map(|h| !h.is_empty())
            .unwrap_or(false)
    }
}

/// Guard releasing its keys on drop.
#[derive(Debug)]
pub struct Lease {
    table: Table,
    owner: TaskId,
    keys: Vec<(LeaseKey, LeaseMode)>,
}

impl Lease {
    pub fn owner(&self) -> TaskId {
        self.owner
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        for (key, mode) in &self.keys {
            if let Some(holders) = table.get_mut(key) {
                match mode {
                    LeaseMode::Exclusive => {
                        if holders.exclusive == Some(self.owner) {
                            holders.exclusive = None;
                        }
                    }
                    LeaseMode::Shared => {
                        holders.shared.remove(&self.owner);
                    }
                }
                if holders.is_empty() {
                    table.remove(key);
                }
            }
        }
    }
}
