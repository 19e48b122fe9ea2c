//! Scoped memory accounting.
//!
//! A [`MemoryPool`] is a signed byte counter that components charge their
//! allocations against. Attribution happens through [`TrackingScope`], an
//! RAII guard bound to a pool: while the scope is alive, every byte reported
//! via [`TrackingScope::record`] accumulates in a thread-local ambient
//! counter; when the scope drops, the delta observed since entry moves into
//! the pool *and* back-propagates to the enclosing scope, so nested scopes
//! compose without double-counting.

use std::cell::Cell;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

thread_local! {
    /// Ambient byte delta of the innermost live scope on this thread.
    static AMBIENT_DELTA: Cell<i64> = const { Cell::new(0) };
}

/// A signed byte counter shared by all scopes charging the same component.
#[derive(Debug, Default)]
pub struct MemoryPool {
    used: AtomicI64,
}

impl MemoryPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current pool usage in bytes. May be transiently negative while a
    /// deallocation-heavy scope is still open.
    pub fn used_bytes(&self) -> i64 {
        self.used.load(Ordering::Relaxed)
    }

    fn add(&self, delta: i64) {
        self.used.fetch_add(delta, Ordering::Relaxed);
    }
}

/// RAII scope that attributes ambient byte deltas to a [`MemoryPool`].
///
/// The scope records the thread-ambient counter on entry; on drop it moves
/// `(current - entry)` into its pool and re-applies the same delta to the
/// ambient counter so the enclosing scope observes it exactly once.
pub struct TrackingScope {
    pool: Arc<MemoryPool>,
    entry_ambient: i64,
}

impl TrackingScope {
    pub fn enter(pool: Arc<MemoryPool>) -> Self {
        let entry_ambient = AMBIENT_DELTA.with(|cell| {
            let entry = cell.get();
            cell.set(0);
            entry
        });
        Self {
            pool,
            entry_ambient,
        }
    }

    /// Report an allocation (positive) or deallocation (negative) in bytes.
    pub fn record(bytes: i64) {
        AMBIENT_DELTA.with(|cell| cell.set(cell.get() + bytes));
    }
}

impl Drop for TrackingScope {
    fn drop(&mut self) {
        AMBIENT_DELTA.with(|cell| {
            let scope_delta = cell.get();
            self.pool.add(scope_delta);
            // The outer scope sees the inner delta exactly once.
            cell.set(self.entry_ambient + scope_delta);
        });
    }
}
