//! # Lock State
//!
//! Whole-file locks in the classic four levels:
//!
//! ```text
//! None ──> Shared ──> Reserved ──> Exclusive
//! ```
//!
//! ## Compatibility
//!
//! | request           | granted when                                         |
//! |-------------------|------------------------------------------------------|
//! | Shared            | resource is None/Shared, or the requester itself     |
//! |                   | holds the Reserved/Exclusive lock                    |
//! | Reserved/Exclusive| no holders, or the requester is the sole holder      |
//!
//! A holder never downgrades: asking for a level at or below the one already
//! held succeeds immediately.
//!
//! ## Waiting
//!
//! An incompatible request waits on a `parking_lot::Condvar`. Releases wake
//! every waiter. Waiters also wake every `DEADLOCK_POLL_INTERVAL` to run
//! deadlock detection and check their deadline; a request that outlives its
//! timeout fails with `StorageError::Locked`.
//!
//! ## Deadlock Detection
//!
//! Waiters form a wait-for graph: a waiter points at every other holder of
//! the resource it waits on. A cycle through the requester picks the largest
//! holder id in the cycle as victim. If the requester is the victim its
//! request fails with `StorageError::Deadlock`; otherwise it keeps waiting
//! for the victim to give up. Nothing is rolled back automatically.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use eyre::{bail, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::DEADLOCK_POLL_INTERVAL;
use crate::error::StorageError;

pub type HolderId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockType {
    #[default]
    None,
    Shared,
    Reserved,
    Exclusive,
}

/// Name of a lockable resource, normally the database path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource(String);

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Resource {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<&Path> for Resource {
    fn from(path: &Path) -> Self {
        Self::new(path.to_string_lossy())
    }
}

/// Lock acquisition seam used by the transaction manager.
pub trait LockManager: Send + Sync {
    fn acquire(
        &self,
        resource: &Resource,
        holder: HolderId,
        lock: LockType,
        timeout: Duration,
    ) -> Result<()>;

    /// Drops every lock `holder` has on `resource`.
    fn release(&self, resource: &Resource, holder: HolderId);

    fn held(&self, resource: &Resource, holder: HolderId) -> LockType;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStats {
    pub acquired: u64,
    pub contended: u64,
    pub timeouts: u64,
    pub deadlocks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockInfo {
    pub resource: Resource,
    pub victim: HolderId,
}

#[derive(Debug, Default)]
struct ResourceLock {
    holders: HashMap<HolderId, LockType>,
}

impl ResourceLock {
    fn level(&self) -> LockType {
        self.holders.values().copied().max().unwrap_or_default()
    }

    fn can_grant(&self, holder: HolderId, lock: LockType) -> bool {
        let current = self.holders.get(&holder).copied().unwrap_or_default();
        if lock <= current {
            return true;
        }

        match lock {
            LockType::None => true,
            LockType::Shared => self.level() <= LockType::Shared,
            LockType::Reserved | LockType::Exclusive => {
                self.holders.is_empty() || (self.holders.len() == 1 && current != LockType::None)
            }
        }
    }
}

#[derive(Debug, Default)]
struct LockTable {
    resources: HashMap<Resource, ResourceLock>,
    waiting: HashMap<HolderId, Resource>,
}

impl LockTable {
    /// Holders in a wait-for cycle through `start`, if there is one.
    fn cycle_through(&self, start: HolderId) -> Option<Vec<HolderId>> {
        let mut visited = HashSet::new();
        let mut stack = vec![(start, vec![start])];

        while let Some((node, path)) = stack.pop() {
            let Some(lock) = self
                .waiting
                .get(&node)
                .and_then(|resource| self.resources.get(resource))
            else {
                continue;
            };

            for &blocker in lock.holders.keys() {
                if blocker == node {
                    continue;
                }
                if blocker == start {
                    return Some(path);
                }
                if visited.insert(blocker) {
                    let mut next = path.clone();
                    next.push(blocker);
                    stack.push((blocker, next));
                }
            }
        }
        None
    }

    fn deadlock_through(&self, start: HolderId) -> Option<DeadlockInfo> {
        let cycle = self.cycle_through(start)?;
        let victim = cycle.into_iter().max()?;
        let resource = self.waiting.get(&victim)?.clone();
        Some(DeadlockInfo { resource, victim })
    }
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    contended: AtomicU64,
    timeouts: AtomicU64,
    deadlocks: AtomicU64,
}

pub struct LockState {
    table: Mutex<LockTable>,
    released: Condvar,
    counters: Counters,
}

impl LockState {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            contended: self.counters.contended.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            deadlocks: self.counters.deadlocks.load(Ordering::Relaxed),
        }
    }

    /// Current holders of `resource` and their levels, ordered by holder id.
    pub fn holders(&self, resource: &Resource) -> Vec<(HolderId, LockType)> {
        let table = self.table.lock();
        let mut holders: Vec<_> = table
            .resources
            .get(resource)
            .map(|lock| lock.holders.iter().map(|(&h, &t)| (h, t)).collect())
            .unwrap_or_default();
        holders.sort_unstable();
        holders
    }

    /// The effective level of `resource`: the strongest lock held on it.
    pub fn level(&self, resource: &Resource) -> LockType {
        self.table
            .lock()
            .resources
            .get(resource)
            .map_or(LockType::None, ResourceLock::level)
    }

    /// Scans every waiter for a wait-for cycle.
    pub fn detect_deadlock(&self) -> Option<DeadlockInfo> {
        let table = self.table.lock();
        let mut waiters: Vec<HolderId> = table.waiting.keys().copied().collect();
        waiters.sort_unstable();
        waiters
            .into_iter()
            .find_map(|waiter| table.deadlock_through(waiter))
    }
}

impl Default for LockState {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager for LockState {
    fn acquire(
        &self,
        resource: &Resource,
        holder: HolderId,
        lock: LockType,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();
        let mut contended = false;

        loop {
            let state = table.resources.entry(resource.clone()).or_default();
            if state.can_grant(holder, lock) {
                let held = state.holders.entry(holder).or_default();
                *held = (*held).max(lock);
                table.waiting.remove(&holder);
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                debug!(%resource, holder, ?lock, "lock granted");
                return Ok(());
            }

            if !contended {
                contended = true;
                self.counters.contended.fetch_add(1, Ordering::Relaxed);
                debug!(%resource, holder, ?lock, "waiting for lock");
            }
            table.waiting.insert(holder, resource.clone());

            if let Some(info) = table.deadlock_through(holder) {
                if info.victim == holder {
                    table.waiting.remove(&holder);
                    self.counters.deadlocks.fetch_add(1, Ordering::Relaxed);
                    debug!(%resource, holder, "lock request chosen as deadlock victim");
                    bail!(StorageError::Deadlock {
                        resource: resource.to_string(),
                        victim: holder,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                table.waiting.remove(&holder);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(%resource, holder, ?lock, "lock request timed out");
                bail!(StorageError::Locked {
                    resource: resource.to_string(),
                });
            }

            let wait = (deadline - now).min(DEADLOCK_POLL_INTERVAL);
            self.released.wait_for(&mut table, wait);
        }
    }

    fn release(&self, resource: &Resource, holder: HolderId) {
        let mut table = self.table.lock();
        table.waiting.remove(&holder);

        let Some(state) = table.resources.get_mut(resource) else {
            return;
        };
        if state.holders.remove(&holder).is_none() {
            return;
        }
        if state.holders.is_empty() {
            table.resources.remove(resource);
        }
        drop(table);

        debug!(%resource, holder, "lock released");
        self.released.notify_all();
    }

    fn held(&self, resource: &Resource, holder: HolderId) -> LockType {
        self.table
            .lock()
            .resources
            .get(resource)
            .and_then(|lock| lock.holders.get(&holder).copied())
            .unwrap_or_default()
    }
}

impl fmt::Debug for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockState")
            .field("stats", &self.stats())
            .finish()
    }
}
