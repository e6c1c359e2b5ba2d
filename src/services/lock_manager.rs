//! src/services/lock_manager.rs
//!
//! Registry of time-bounded read/write locks keyed by resource path.
//! One writer or many readers per resource; expired locks count as absent
//! and are evicted by whichever acquire or release touches the resource next.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::lock::{LockType, UrlLock};

type LockTable = HashMap<String, Vec<UrlLock>>;

/// Grants and tracks resource locks for this node.
///
/// The table mutex only guards the check-and-insert itself; callers do their
/// I/O while holding the returned [`LockGuard`], never the mutex.
#[derive(Debug, Clone)]
pub struct LockManager {
    table: Arc<Mutex<LockTable>>,
    host: String,
}

impl LockManager {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            host: host.into(),
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, LockTable> {
        // A poisoned table still holds consistent entries: every mutation is
        // a single push or retain.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resource path for an object, e.g. `/alice/docs/a.txt`.
    pub fn resource_path(user: &str, container: &str, key: &str) -> String {
        format!("/{user}/{container}/{key}")
    }

    pub fn acquire_read(&self, resource: &str, holder: &str, ttl: Duration) -> Option<LockGuard> {
        self.acquire(resource, holder, ttl, LockType::Read)
    }

    pub fn acquire_write(&self, resource: &str, holder: &str, ttl: Duration) -> Option<LockGuard> {
        self.acquire(resource, holder, ttl, LockType::Write)
    }

    fn acquire(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
        lock_type: LockType,
    ) -> Option<LockGuard> {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let lock = UrlLock {
            id: Uuid::new_v4(),
            lock_type,
            resource: resource.to_string(),
            holder: holder.to_string(),
            host: self.host.clone(),
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let mut table = self.lock_table();
        let held = table.entry(resource.to_string()).or_default();
        held.retain(|existing| {
            let expired = existing.is_expired(now);
            if expired {
                warn!(resource, holder = %existing.holder, lock_id = %existing.id, "evicting expired lock");
            }
            !expired
        });

        let granted = match lock_type {
            LockType::Write => held.is_empty(),
            LockType::Read => held.iter().all(|l| l.lock_type == LockType::Read),
        };
        if !granted {
            if held.is_empty() {
                table.remove(resource);
            }
            debug!(resource, holder, ?lock_type, "lock refused");
            return None;
        }

        let id = lock.id;
        held.push(lock);
        debug!(resource, holder, ?lock_type, lock_id = %id, "lock granted");
        Some(LockGuard {
            manager: self.clone(),
            resource: resource.to_string(),
            id,
            released: false,
        })
    }

    /// Remove the lock `lock_id` from `resource`. Unknown ids are ignored.
    pub fn release(&self, resource: &str, lock_id: Uuid) {
        let now = Utc::now();
        let mut table = self.lock_table();
        if let Some(held) = table.get_mut(resource) {
            held.retain(|l| l.id != lock_id && !l.is_expired(now));
            if held.is_empty() {
                table.remove(resource);
            }
        }
        debug!(resource, %lock_id, "lock released");
    }

    /// Unexpired locks currently held on `resource`.
    pub fn active_locks(&self, resource: &str) -> Vec<UrlLock> {
        let now = Utc::now();
        self.lock_table()
            .get(resource)
            .map(|held| held.iter().filter(|l| !l.is_expired(now)).cloned().collect())
            .unwrap_or_default()
    }
}

/// Releases its lock when dropped.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    resource: String,
    id: Uuid,
    released: bool,
}

impl LockGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.release(&self.resource, self.id);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn concurrent_writers_get_exactly_one_grant() {
        let manager = LockManager::new("node-1");
        let granted = AtomicUsize::new(0);
        let guards = Mutex::new(Vec::new());

        thread::scope(|s| {
            for i in 0..16 {
                let manager = &manager;
                let granted = &granted;
                let guards = &guards;
                s.spawn(move || {
                    if let Some(guard) =
                        manager.acquire_write("/alice/docs/a.txt", &format!("w{i}"), TTL)
                    {
                        granted.fetch_add(1, Ordering::SeqCst);
                        guards.lock().unwrap().push(guard);
                    }
                });
            }
        });

        assert_eq!(granted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_excludes_readers_until_released() {
        let manager = LockManager::new("node-1");
        let writer = manager.acquire_write("/r", "w", TTL).unwrap();

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| assert!(manager.acquire_read("/r", "r", TTL).is_none()));
            }
        });

        writer.release();
        assert!(manager.acquire_read("/r", "r", TTL).is_some());
    }

    #[test]
    fn readers_share_but_block_writers() {
        let manager = LockManager::new("node-1");
        let r1 = manager.acquire_read("/r", "a", TTL).unwrap();
        let r2 = manager.acquire_read("/r", "b", TTL).unwrap();
        assert!(manager.acquire_write("/r", "c", TTL).is_none());
        assert_eq!(manager.active_locks("/r").len(), 2);

        drop(r1);
        assert!(manager.acquire_write("/r", "c", TTL).is_none());
        drop(r2);
        assert!(manager.acquire_write("/r", "c", TTL).is_some());
    }

    #[test]
    fn expired_locks_are_reclaimed() {
        let manager = LockManager::new("node-1");
        let stale = manager.acquire_write("/r", "crashed", Duration::ZERO).unwrap();
        // Holder never releases; the lock has already expired.
        std::mem::forget(stale);

        let fresh = manager.acquire_write("/r", "next", TTL);
        assert!(fresh.is_some());
        assert_eq!(manager.active_locks("/r").len(), 1);
    }

    #[test]
    fn locks_are_per_resource() {
        let manager = LockManager::new("node-1");
        let _a = manager.acquire_write("/alice/docs/a", "w", TTL).unwrap();
        assert!(manager.acquire_write("/alice/docs/b", "w", TTL).is_some());
        assert!(manager.active_locks("/alice/docs/b").is_empty());
    }

    #[test]
    fn release_by_id_is_idempotent() {
        let manager = LockManager::new("node-1");
        let guard = manager.acquire_write("/r", "w", TTL).unwrap();
        let id = guard.id();
        manager.release("/r", id);
        manager.release("/r", id);
        assert!(manager.acquire_write("/r", "w2", TTL).is_some());
        drop(guard);
    }
}
