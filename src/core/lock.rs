//! Transaction-scoped advisory locks
//!
//! Keys are arbitrary strings hashed to a 63-bit lock id:
//!
//! ```text
//! lock_id = xxh3_64(key.as_bytes()) & 0x7fff_ffff_ffff_ffff
//! ```
//!
//! XXH3-64 with the default seed is stable across platforms and releases, so
//! the same key always maps to the same id. The top bit is cleared to keep ids
//! inside the signed 64-bit space Postgres advisory locks accept. With 2^63
//! ids, a collision between two live keys is negligible at the handful of
//! locks one transaction takes.
//!
//! Acquisition never blocks: a key held by another scope fails immediately
//! with [`AllocError::LockUnavailable`], which callers treat as retryable.
//! A [`LockScope`] belongs to exactly one transaction and releases everything
//! it holds when the transaction ends or the scope is dropped.

use crate::error::{AllocError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

/// Clears the most significant bit of a lock id
pub const LOCK_ID_MASK: u64 = 0x7fff_ffff_ffff_ffff;

/// Derive the lock id for a key
pub fn lock_id(key: &str) -> u64 {
    xxh3_64(key.as_bytes()) & LOCK_ID_MASK
}

/// Serializes "first/last allocation of this tenant on this site" decisions
pub fn tenant_site_key(provider_id: Uuid, site_id: Uuid, tenant_id: Uuid) -> String {
    format!("{}-{}-{}", provider_id, site_id, tenant_id)
}

/// Serializes admission checks against one Instance Type
pub fn instance_type_key(instance_type_id: Uuid) -> String {
    instance_type_id.to_string()
}

/// Serializes carving from one parent IP Block
pub fn ip_block_key(ip_block_id: Uuid) -> String {
    ip_block_id.to_string()
}

/// Serializes changes to a tenant's derived IP Block
pub fn derived_block_key(tenant_id: Uuid, derived_block_id: Uuid) -> String {
    format!("{}-{}", tenant_id, derived_block_id)
}

#[derive(Debug, Default)]
struct LockTable {
    /// lock id -> owning scope
    held: Mutex<HashMap<u64, u64>>,
    next_owner: AtomicU64,
}

/// Process-wide table of held advisory locks
#[derive(Debug, Clone, Default)]
pub struct LockCoordinator {
    table: Arc<LockTable>,
}

impl LockCoordinator {
    /// A fresh, isolated coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// The coordinator shared by every store in this process
    pub fn global() -> Self {
        static GLOBAL: OnceLock<LockCoordinator> = OnceLock::new();
        GLOBAL.get_or_init(LockCoordinator::new).clone()
    }

    /// Open a scope for one transaction
    pub fn scope(&self) -> LockScope {
        let owner = self.table.next_owner.fetch_add(1, Ordering::Relaxed) + 1;
        LockScope {
            coordinator: self.clone(),
            owner,
            held: Vec::new(),
        }
    }

    /// Whether any scope currently holds the key
    pub fn is_held(&self, key: &str) -> bool {
        self.table.held.lock().contains_key(&lock_id(key))
    }

    /// Number of locks held across all scopes
    pub fn held_count(&self) -> usize {
        self.table.held.lock().len()
    }

    fn try_acquire(&self, owner: u64, id: u64) -> bool {
        let mut held = self.table.held.lock();
        match held.get(&id) {
            Some(&current) => current == owner,
            None => {
                held.insert(id, owner);
                true
            }
        }
    }

    fn release(&self, owner: u64, ids: &[u64]) {
        let mut held = self.table.held.lock();
        for id in ids {
            if held.get(id) == Some(&owner) {
                held.remove(id);
            }
        }
    }
}

/// Locks held by one transaction
#[derive(Debug)]
pub struct LockScope {
    coordinator: LockCoordinator,
    owner: u64,
    held: Vec<u64>,
}

impl LockScope {
    /// Take the lock for `key` without waiting
    ///
    /// Re-acquiring a key this scope already holds succeeds.
    pub fn try_acquire(&mut self, key: &str) -> Result<u64> {
        let id = lock_id(key);
        if self.held.contains(&id) {
            return Ok(id);
        }
        if !self.coordinator.try_acquire(self.owner, id) {
            debug!(lock_id = id, key, "advisory lock busy");
            return Err(AllocError::LockUnavailable {
                key: key.to_string(),
                lock_id: id,
            });
        }
        debug!(lock_id = id, key, "advisory lock acquired");
        self.held.push(id);
        Ok(id)
    }

    pub fn holds(&self, key: &str) -> bool {
        self.held.contains(&lock_id(key))
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release every lock in the scope
    pub fn release_all(&mut self) {
        if self.held.is_empty() {
            return;
        }
        self.coordinator.release(self.owner, &self.held);
        debug!(count = self.held.len(), "advisory locks released");
        self.held.clear();
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_id_is_stable_and_masked() {
        let key = "6f1c7b1e-2b55-4d1e-9a53-0d5f1c1e4a10";
        assert_eq!(lock_id(key), lock_id(key));
        assert_eq!(lock_id(key) & !LOCK_ID_MASK, 0);
        assert_ne!(lock_id("a-b-c"), lock_id("a-b-d"));
    }

    #[test]
    fn test_second_scope_fails_fast() {
        let coordinator = LockCoordinator::new();
        let mut first = coordinator.scope();
        let mut second = coordinator.scope();

        first.try_acquire("site-1").unwrap();
        let err = second.try_acquire("site-1").unwrap_err();
        assert!(matches!(err, AllocError::LockUnavailable { .. }));
        assert!(err.is_retryable());

        // Disjoint keys do not contend
        second.try_acquire("site-2").unwrap();
        assert_eq!(coordinator.held_count(), 2);
    }

    #[test]
    fn test_reacquire_in_same_scope() {
        let coordinator = LockCoordinator::new();
        let mut scope = coordinator.scope();
        let a = scope.try_acquire("k").unwrap();
        let b = scope.try_acquire("k").unwrap();
        assert_eq!(a, b);
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn test_drop_releases() {
        let coordinator = LockCoordinator::new();
        {
            let mut scope = coordinator.scope();
            scope.try_acquire("tenant-site").unwrap();
            assert!(coordinator.is_held("tenant-site"));
        }
        assert!(!coordinator.is_held("tenant-site"));

        let mut next = coordinator.scope();
        next.try_acquire("tenant-site").unwrap();
    }

    #[test]
    fn test_release_only_own_locks() {
        let coordinator = LockCoordinator::new();
        let mut a = coordinator.scope();
        let mut b = coordinator.scope();
        a.try_acquire("x").unwrap();
        b.try_acquire("y").unwrap();

        a.release_all();
        assert!(!coordinator.is_held("x"));
        assert!(coordinator.is_held("y"));
    }

    #[test]
    fn test_key_conventions() {
        let p = Uuid::new_v4();
        let s = Uuid::new_v4();
        let t = Uuid::new_v4();
        assert_eq!(tenant_site_key(p, s, t), format!("{}-{}-{}", p, s, t));
        assert_eq!(instance_type_key(p), p.to_string());
        assert_eq!(derived_block_key(t, s), format!("{}-{}", t, s));
    }
}
