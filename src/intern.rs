//! Content-addressed string interning with per-category accounting.
//!
//! The store keeps a single copy of each distinct byte string per category.
//! Handles are reference counted: incrementing is a lock-free CAS, while
//! insertion and the final 1→0 decrement run under the category mutex so the
//! map invariant holds at all times — *an entry exists in the pool iff its
//! refcount is greater than zero*.
//!
//! Within one category, pointer equality of handles is equivalent to content
//! equality, which lets indexes compare and hash keys by address. Equality
//! and hashing on [`InternedStr`] itself still compare bytes so that foreign
//! (non-pooled) handles can be used for lookups.
//!
//! ANN indexes that vacuum lazily flip a logical delete mark on entries via
//! [`InternStore::set_delete_mark`]; the overlay keeps its own byte and
//! object totals, independent of the live counters.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::memory::{MemoryPool, TrackingScope};

/// Accounting category an interned string belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringCategory {
    Vector,
    Tag,
    Key,
    Other,
}

impl StringCategory {
    const COUNT: usize = 4;

    fn slot(self) -> usize {
        match self {
            StringCategory::Vector => 0,
            StringCategory::Tag => 1,
            StringCategory::Key => 2,
            StringCategory::Other => 3,
        }
    }
}

/// Snapshot of object/byte totals for a category or the delete-mark overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounters {
    pub object_count: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Default)]
struct AtomicCounters {
    object_count: AtomicU64,
    memory_bytes: AtomicI64,
}

impl AtomicCounters {
    fn on_insert(&self, bytes: usize) {
        self.object_count.fetch_add(1, Ordering::Relaxed);
        self.memory_bytes.fetch_add(bytes as i64, Ordering::Relaxed);
    }

    fn on_erase(&self, bytes: usize) {
        self.object_count.fetch_sub(1, Ordering::Relaxed);
        self.memory_bytes.fetch_sub(bytes as i64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolCounters {
        PoolCounters {
            object_count: self.object_count.load(Ordering::Relaxed),
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed).max(0) as u64,
        }
    }
}

struct Entry {
    bytes: Box<[u8]>,
    category: StringCategory,
    refcount: AtomicU32,
    marked_deleted: AtomicBool,
}

impl Entry {
    fn len(&self) -> usize {
        self.bytes.len()
    }
}

struct StoreShared {
    // One map per category: same bytes under two categories are two entries.
    maps: [Mutex<HashMap<Box<[u8]>, Arc<Entry>>>; StringCategory::COUNT],
    counters: [AtomicCounters; StringCategory::COUNT],
    marked_deleted: AtomicCounters,
    memory_pool: Arc<MemoryPool>,
}

impl StoreShared {
    /// Final decrement. Holds the category mutex across the 1→0 transition
    /// so a concurrent `intern` of the same bytes either finds the entry
    /// still present (and revives it) or not at all.
    fn release(&self, entry: &Arc<Entry>) {
        let mut current = entry.refcount.load(Ordering::SeqCst);
        loop {
            match current {
                0 => return,
                1 => {
                    let mut map = self.maps[entry.category.slot()].lock();
                    let old = entry.refcount.fetch_sub(1, Ordering::SeqCst);
                    if old > 1 {
                        // Revived by a racing intern; nothing to erase.
                        return;
                    }
                    let _scope = TrackingScope::enter(self.memory_pool.clone());
                    if map.remove(entry.bytes.as_ref()).is_some() {
                        TrackingScope::record(-(entry.len() as i64));
                        self.counters[entry.category.slot()].on_erase(entry.len());
                        if entry.marked_deleted.load(Ordering::Relaxed) {
                            self.marked_deleted.on_erase(entry.len());
                        }
                    }
                    return;
                }
                _ => {
                    match entry.refcount.compare_exchange_weak(
                        current,
                        current - 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => return,
                        Err(observed) => current = observed,
                    }
                }
            }
        }
    }
}

/// The process-wide intern pool. Constructed explicitly so tests can hold
/// isolated instances.
pub struct InternStore {
    shared: Arc<StoreShared>,
}

impl Default for InternStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InternStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(StoreShared {
                maps: Default::default(),
                counters: Default::default(),
                marked_deleted: AtomicCounters::default(),
                memory_pool: MemoryPool::new(),
            }),
        }
    }

    /// Return the unique handle for `bytes` in `category`, creating the
    /// entry on first use. Only the first insertion accounts the content
    /// bytes; later calls bump the refcount without re-counting.
    pub fn intern(&self, bytes: &[u8], category: StringCategory) -> InternedStr {
        let shared = &self.shared;
        let mut map = shared.maps[category.slot()].lock();
        if let Some(entry) = map.get(bytes) {
            entry.refcount.fetch_add(1, Ordering::SeqCst);
            return InternedStr {
                entry: entry.clone(),
                store: Some(shared.clone()),
            };
        }
        let _scope = TrackingScope::enter(shared.memory_pool.clone());
        let entry = Arc::new(Entry {
            bytes: bytes.to_vec().into_boxed_slice(),
            category,
            refcount: AtomicU32::new(1),
            marked_deleted: AtomicBool::new(false),
        });
        TrackingScope::record(bytes.len() as i64);
        shared.counters[category.slot()].on_insert(bytes.len());
        map.insert(entry.bytes.clone(), entry.clone());
        InternedStr {
            entry,
            store: Some(shared.clone()),
        }
    }

    /// Look up an existing entry without changing its refcount.
    pub fn get(&self, bytes: &[u8], category: StringCategory) -> Option<InternedStr> {
        let map = self.shared.maps[category.slot()].lock();
        map.get(bytes).map(|entry| {
            entry.refcount.fetch_add(1, Ordering::SeqCst);
            InternedStr {
                entry: entry.clone(),
                store: Some(self.shared.clone()),
            }
        })
    }

    /// Toggle the marked-deleted overlay for `bytes`. Returns false when the
    /// entry is not interned or the mark already had the requested value.
    pub fn set_delete_mark(&self, bytes: &[u8], category: StringCategory, mark: bool) -> bool {
        let map = self.shared.maps[category.slot()].lock();
        let Some(entry) = map.get(bytes) else {
            return false;
        };
        let previous = entry.marked_deleted.swap(mark, Ordering::Relaxed);
        if previous == mark {
            return false;
        }
        if mark {
            self.shared.marked_deleted.on_insert(entry.len());
        } else {
            self.shared.marked_deleted.on_erase(entry.len());
        }
        true
    }

    pub fn counters(&self, category: StringCategory) -> PoolCounters {
        self.shared.counters[category.slot()].snapshot()
    }

    pub fn marked_deleted_counters(&self) -> PoolCounters {
        self.shared.marked_deleted.snapshot()
    }

    /// Total number of distinct entries across all categories.
    pub fn len(&self) -> usize {
        self.shared.maps.iter().map(|m| m.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently charged to the pool's memory accounting.
    pub fn memory_usage(&self) -> i64 {
        self.shared.memory_pool.used_bytes()
    }
}

/// Refcounted handle to an interned byte string.
///
/// Dropping the last handle removes the entry from the pool. Handles created
/// with [`InternedStr::ephemeral`] are *foreign*: they carry bytes without
/// touching any pool and exist so remote keys can participate in byte-wise
/// lookups.
pub struct InternedStr {
    entry: Arc<Entry>,
    store: Option<Arc<StoreShared>>,
}

impl InternedStr {
    /// A handle that is not backed by any pool.
    pub fn ephemeral(bytes: &[u8]) -> Self {
        Self {
            entry: Arc::new(Entry {
                bytes: bytes.to_vec().into_boxed_slice(),
                category: StringCategory::Other,
                refcount: AtomicU32::new(1),
                marked_deleted: AtomicBool::new(false),
            }),
            store: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.entry.bytes
    }

    /// Lossy UTF-8 view, for logging and replies.
    pub fn display(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.entry.bytes)
    }

    pub fn category(&self) -> StringCategory {
        self.entry.category
    }

    pub fn is_marked_deleted(&self) -> bool {
        self.entry.marked_deleted.load(Ordering::Relaxed)
    }

    /// Fast path: same-category pooled handles may be compared by address.
    pub fn ptr_eq(&self, other: &InternedStr) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    pub fn refcount(&self) -> u32 {
        self.entry.refcount.load(Ordering::SeqCst)
    }
}

impl Clone for InternedStr {
    fn clone(&self) -> Self {
        if self.store.is_some() {
            // Lock-free increment; pool membership is unaffected.
            self.entry.refcount.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            entry: self.entry.clone(),
            store: self.store.clone(),
        }
    }
}

impl Drop for InternedStr {
    fn drop(&mut self) {
        if let Some(store) = &self.store {
            store.release(&self.entry);
        }
    }
}

impl PartialEq for InternedStr {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.entry.bytes == other.entry.bytes
    }
}

impl Eq for InternedStr {}

impl Hash for InternedStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entry.bytes.hash(state);
    }
}

impl PartialOrd for InternedStr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternedStr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.entry.bytes.cmp(&other.entry.bytes)
    }
}

impl fmt::Debug for InternedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InternedStr({:?})", self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_entry() {
        let store = InternStore::new();
        let a = store.intern(b"doc:1", StringCategory::Key);
        let b = store.intern(b"doc:1", StringCategory::Key);
        assert!(a.ptr_eq(&b));
        assert_eq!(store.len(), 1);
        assert_eq!(a.refcount(), 2);
    }

    #[test]
    fn categories_are_distinct_pools() {
        let store = InternStore::new();
        let key = store.intern(b"payload", StringCategory::Key);
        let tag = store.intern(b"payload", StringCategory::Tag);
        assert!(!key.ptr_eq(&tag));
        assert_eq!(key, tag); // byte-wise equality still holds
        assert_eq!(store.counters(StringCategory::Key).object_count, 1);
        assert_eq!(store.counters(StringCategory::Tag).object_count, 1);
    }

    #[test]
    fn refcount_conservation() {
        let store = InternStore::new();
        let handles: Vec<_> = (0..5)
            .map(|_| store.intern(b"doc:2", StringCategory::Key))
            .collect();
        assert_eq!(handles[0].refcount(), 5);
        drop(handles);
        assert!(store.is_empty());
        assert_eq!(store.counters(StringCategory::Key).object_count, 0);
    }

    #[test]
    fn first_insert_accounts_bytes_once() {
        let store = InternStore::new();
        let _a = store.intern(b"0123456789", StringCategory::Tag);
        let _b = store.intern(b"0123456789", StringCategory::Tag);
        assert_eq!(store.counters(StringCategory::Tag).memory_bytes, 10);
        assert_eq!(store.memory_usage(), 10);
    }

    #[test]
    fn erase_releases_accounting() {
        let store = InternStore::new();
        {
            let _v = store.intern(&[0u8; 16], StringCategory::Vector);
            assert_eq!(store.counters(StringCategory::Vector).memory_bytes, 16);
        }
        assert_eq!(store.counters(StringCategory::Vector).memory_bytes, 0);
        assert_eq!(store.memory_usage(), 0);
    }

    #[test]
    fn delete_mark_overlay_tracks_totals() {
        let store = InternStore::new();
        let v = store.intern(&[1u8; 12], StringCategory::Vector);
        assert!(store.set_delete_mark(v.as_bytes(), StringCategory::Vector, true));
        // Re-marking is a no-op.
        assert!(!store.set_delete_mark(v.as_bytes(), StringCategory::Vector, true));
        let marked = store.marked_deleted_counters();
        assert_eq!(marked.object_count, 1);
        assert_eq!(marked.memory_bytes, 12);
        assert!(v.is_marked_deleted());

        assert!(store.set_delete_mark(v.as_bytes(), StringCategory::Vector, false));
        assert_eq!(store.marked_deleted_counters(), PoolCounters::default());
    }

    #[test]
    fn foreign_handles_compare_by_bytes() {
        let store = InternStore::new();
        let pooled = store.intern(b"doc:3", StringCategory::Key);
        let foreign = InternedStr::ephemeral(b"doc:3");
        assert_eq!(pooled, foreign);
        assert!(!pooled.ptr_eq(&foreign));
        // Foreign drops never touch the pool.
        drop(foreign);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_intern_release_converges() {
        use std::sync::Barrier;
        let store = std::sync::Arc::new(InternStore::new());
        let barrier = std::sync::Arc::new(Barrier::new(4));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let barrier = barrier.clone();
            threads.push(std::thread::spawn(move || {
                barrier.wait();
                for i in 0..500u32 {
                    let key = format!("key:{}", i % 17);
                    let handle = store.intern(key.as_bytes(), StringCategory::Key);
                    assert_eq!(handle.as_bytes(), key.as_bytes());
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert!(store.is_empty());
        assert_eq!(store.memory_usage(), 0);
    }
}
