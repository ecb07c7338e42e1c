//! Named lock registry.
//!
//! Every shared structure (the server's connection table, its handler table,
//! each connection's channel map and I/O path) is guarded by a [`NamedLock`]
//! registered in a [`LockRegistry`]. The registry makes "who holds what"
//! inspectable at runtime: [`LockRegistry::snapshot`] reports, per key, how
//! many readers are inside and whether a writer holds the lock.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────┐
//! │        LockRegistry         │
//! │  Mutex<Vec<Arc<LockEntry>>> │──── snapshot() ──▶ { key: {readers, writerHeld} }
//! └──────────────┬──────────────┘
//!                │ create_lock / guard
//!                ▼
//! ┌─────────────────────────────┐
//! │        NamedLock<T>         │
//! │  Arc<LockEntry> (counters)  │
//! │  tokio RwLock<T> (value)    │
//! └─────────────────────────────┘
//! ```
//!
//! The reader count and writer flag are diagnostics only. They are updated
//! after the underlying lock is acquired and before it is released, so a
//! snapshot racing an acquire or release can briefly lag behind.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

/// Bookkeeping for one registered lock.
#[derive(Debug)]
pub struct LockEntry {
    key: String,
    readers: AtomicUsize,
    writer: AtomicBool,
}

impl LockEntry {
    fn new(key: String) -> Self {
        Self {
            key,
            readers: AtomicUsize::new(0),
            writer: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of shared holders at this instant.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Relaxed)
    }

    /// Whether an exclusive holder is inside at this instant.
    pub fn writer_held(&self) -> bool {
        self.writer.load(Ordering::Relaxed)
    }

    pub fn view(&self) -> LockView {
        LockView {
            readers: self.readers(),
            writer_held: self.writer_held(),
        }
    }
}

/// Serializable state of one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockView {
    pub readers: usize,
    pub writer_held: bool,
}

/// Process-wide catalog of named locks.
///
/// Structural changes (create, delete, snapshot) are serialized by a
/// coarse mutex that is never held across an await point. Duplicate keys
/// are allowed; they are conflated in snapshots.
#[derive(Debug, Default)]
pub struct LockRegistry {
    entries: Mutex<Vec<Arc<LockEntry>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new lock with no guarded value.
    pub fn create_lock(&self, key: impl Into<String>) -> NamedLock<()> {
        self.guard(key, ())
    }

    /// Registers a new lock guarding `value`.
    pub fn guard<T>(&self, key: impl Into<String>, value: T) -> NamedLock<T> {
        let entry = Arc::new(LockEntry::new(key.into()));
        trace!(key = %entry.key, "create lock");
        self.entries.lock().push(Arc::clone(&entry));
        NamedLock {
            entry,
            inner: RwLock::new(value),
        }
    }

    /// Removes the oldest entry registered under `key`.
    ///
    /// Returns `false` if no entry has that key.
    pub fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        trace!(key, "delete lock");
        match entries.iter().position(|e| e.key == key) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Removes exactly this lock's entry, leaving same-named entries of
    /// other owners in place.
    pub fn release<T>(&self, lock: &NamedLock<T>) -> bool {
        let mut entries = self.entries.lock();
        trace!(key = %lock.entry.key, "release lock");
        match entries.iter().position(|e| Arc::ptr_eq(e, &lock.entry)) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Whether any entry is registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().iter().any(|e| e.key == key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Key → state for every registered lock.
    ///
    /// The key set is consistent (taken under the structural lock); the
    /// counts may change immediately afterwards.
    pub fn snapshot(&self) -> BTreeMap<String, LockView> {
        let entries = self.entries.lock();
        entries
            .iter()
            .map(|e| (e.key.clone(), e.view()))
            .collect()
    }
}

/// A read/write lock with a registry-visible name.
#[derive(Debug)]
pub struct NamedLock<T> {
    entry: Arc<LockEntry>,
    inner: RwLock<T>,
}

impl<T> NamedLock<T> {
    pub fn key(&self) -> &str {
        &self.entry.key
    }

    pub fn entry(&self) -> &LockEntry {
        &self.entry
    }

    /// Acquires shared access.
    pub async fn read(&self) -> NamedReadGuard<'_, T> {
        trace!(key = %self.entry.key, "rlock");
        let inner = self.inner.read().await;
        self.entry.readers.fetch_add(1, Ordering::Relaxed);
        NamedReadGuard {
            inner,
            entry: &self.entry,
        }
    }

    /// Acquires exclusive access.
    pub async fn write(&self) -> NamedWriteGuard<'_, T> {
        trace!(key = %self.entry.key, "lock");
        let inner = self.inner.write().await;
        self.entry.writer.store(true, Ordering::Relaxed);
        NamedWriteGuard {
            inner,
            entry: &self.entry,
        }
    }
}

/// Shared access to a [`NamedLock`]; dropping it is the RUnlock.
pub struct NamedReadGuard<'a, T> {
    inner: RwLockReadGuard<'a, T>,
    entry: &'a LockEntry,
}

impl<T> Deref for NamedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> Drop for NamedReadGuard<'_, T> {
    fn drop(&mut self) {
        trace!(key = %self.entry.key, "runlock");
        self.entry.readers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Exclusive access to a [`NamedLock`]; dropping it is the Unlock.
pub struct NamedWriteGuard<'a, T> {
    inner: RwLockWriteGuard<'a, T>,
    entry: &'a LockEntry,
}

impl<T> Deref for NamedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for NamedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for NamedWriteGuard<'_, T> {
    fn drop(&mut self) {
        trace!(key = %self.entry.key, "unlock");
        self.entry.writer.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    #[tokio::test]
    async fn test_concurrent_readers_are_counted() {
        let registry = LockRegistry::new();
        let lock = registry.create_lock("server.clients");

        let guards = join_all((0..5).map(|_| lock.read())).await;

        let snapshot = registry.snapshot();
        let view = snapshot.get("server.clients").unwrap();
        assert_eq!(view.readers, 5);
        assert!(!view.writer_held);

        drop(guards);
        assert_eq!(registry.snapshot()["server.clients"].readers, 0);
    }

    #[tokio::test]
    async fn test_writer_is_reported() {
        let registry = LockRegistry::new();
        let lock = registry.create_lock("peer-A");

        let guard = lock.write().await;
        let view = registry.snapshot()["peer-A"];
        assert!(view.writer_held);
        assert_eq!(view.readers, 0);

        drop(guard);
        assert!(!registry.snapshot()["peer-A"].writer_held);
    }

    #[tokio::test]
    async fn test_guarded_value_is_mutable_under_write() {
        let registry = LockRegistry::new();
        let lock = registry.guard("counter", 0u32);

        *lock.write().await += 3;
        assert_eq!(*lock.read().await, 3);
    }

    #[tokio::test]
    async fn test_writer_waits_for_readers() {
        let registry = LockRegistry::new();
        let lock = Arc::new(registry.guard("shared", Vec::<u8>::new()));

        let reader = lock.read().await;
        let writer_lock = Arc::clone(&lock);
        let writer = tokio::spawn(async move {
            writer_lock.write().await.push(1);
        });

        tokio::task::yield_now().await;
        assert!(!writer.is_finished());
        assert!(!lock.entry().writer_held());

        drop(reader);
        writer.await.unwrap();
        assert_eq!(*lock.read().await, vec![1]);
    }

    #[test]
    fn test_delete_removes_oldest_duplicate() {
        let registry = LockRegistry::new();
        let _first = registry.create_lock("peer-A");
        let _second = registry.create_lock("peer-A");
        assert_eq!(registry.len(), 2);

        assert!(registry.delete("peer-A"));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("peer-A"));

        assert!(registry.delete("peer-A"));
        assert!(!registry.delete("peer-A"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_is_by_identity() {
        let registry = LockRegistry::new();
        let old = registry.create_lock("peer-A");
        let new = registry.create_lock("peer-A");

        assert!(registry.release(&new));
        assert!(registry.contains("peer-A"));
        assert!(!registry.release(&new));
        assert!(registry.release(&old));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_conflates_duplicate_keys() {
        let registry = LockRegistry::new();
        let _a = registry.create_lock("same");
        let _b = registry.create_lock("same");
        let _c = registry.create_lock("other");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_lock_view_json_shape() {
        let view = LockView {
            readers: 2,
            writer_held: false,
        };
        let json = serde_json::to_string(&view).unwrap();
        assert_eq!(json, r#"{"readers":2,"writerHeld":false}"#);
    }
}
