//! Backfill job state.
//!
//! A newly created schema scans the whole database once, routing matching
//! keys through the regular ingest path at low priority. The job keeps a
//! private scan cursor, a monotonically raised database-size snapshot (so
//! reported progress never goes backwards), and an OOM pause flag that is
//! re-sampled on every batch.

use std::time::Instant;

use crate::host::ScanCursor;

pub struct BackfillJob {
    pub cursor: ScanCursor,
    pub scan_done: bool,
    pub scanned_key_count: u64,
    pub db_size: u64,
    pub paused_by_oom: bool,
    pub started: Instant,
}

impl BackfillJob {
    pub fn new(db_size: u64) -> Self {
        Self {
            cursor: ScanCursor::new(),
            scan_done: false,
            scanned_key_count: 0,
            db_size,
            paused_by_oom: false,
            started: Instant::now(),
        }
    }

    pub fn mark_scan_done(&mut self) {
        self.scan_done = true;
    }

    /// Raise (never lower) the size snapshot.
    pub fn observe_db_size(&mut self, current: u64) {
        self.db_size = self.db_size.max(current);
    }

    /// Completion fraction given the number of scanned-but-unapplied keys.
    /// Clamped below 1.0 while the scan runs; double-counted keys from hash
    /// table resizes report 0.99 instead of overshooting.
    pub fn percent(&self, inqueue: u64) -> f32 {
        if self.db_size == 0 {
            return 1.0;
        }
        if self.scanned_key_count < inqueue {
            return 0.99;
        }
        let processed = self.scanned_key_count - inqueue;
        if self.db_size < processed {
            return 0.99;
        }
        processed as f32 / self.db_size as f32
    }
}
