//! Vector externalization.
//!
//! HASH records duplicate every vector: once in the host's hash field, once
//! interned inside the vector index. When the host exposes its string-ref
//! hash API, the engine hands the interned allocation back to the host after
//! an AddRecord, and the host drops its private copy. The registry below
//! remembers which `(db, key, identifier)` slots currently point at interned
//! memory so moves, deletions, and schema teardown can release them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::host::{DbIndex, SharedHost};
use crate::index::{Key, VectorIndex};
use crate::intern::InternedStr;

type SlotKey = (DbIndex, Vec<u8>, String);

pub struct VectorExternalizer {
    host: SharedHost,
    tracked: Mutex<HashMap<SlotKey, InternedStr>>,
    extern_errors: AtomicU64,
}

impl VectorExternalizer {
    pub fn new(host: SharedHost) -> Arc<Self> {
        Arc::new(Self {
            host,
            tracked: Mutex::new(HashMap::new()),
            extern_errors: AtomicU64::new(0),
        })
    }

    /// Register the interned copy of `raw` with the host hash field. A host
    /// refusal is counted, not raised; the record stays correct either way.
    pub fn externalize(
        &self,
        db: DbIndex,
        key: &Key,
        identifier: &str,
        raw: &Bytes,
        vector_index: &VectorIndex,
    ) {
        if !self.host.supports_hash_string_ref() {
            return;
        }
        let Some(interned) = vector_index.intern_vector(raw) else {
            return;
        };
        match self
            .host
            .externalize_hash_field(db, key.as_bytes(), identifier.as_bytes(), &interned)
        {
            Ok(()) => {
                self.tracked.lock().insert(
                    (db, key.as_bytes().to_vec(), identifier.to_string()),
                    interned,
                );
            }
            Err(err) => {
                self.extern_errors.fetch_add(1, Ordering::Relaxed);
                debug!(%err, identifier, "host refused vector externalization");
            }
        }
    }

    /// Untrack one slot (record moved or deleted).
    pub fn remove(&self, db: DbIndex, key: &Key, identifier: &str) {
        let slot = (db, key.as_bytes().to_vec(), identifier.to_string());
        if self.tracked.lock().remove(&slot).is_some() {
            self.host
                .release_hash_string_ref(db, key.as_bytes(), identifier.as_bytes());
        }
    }

    /// Untrack everything a schema registered (schema destruction).
    pub fn release_schema(&self, db: DbIndex, identifiers: &[String]) {
        let mut tracked = self.tracked.lock();
        let victims: Vec<SlotKey> = tracked
            .keys()
            .filter(|(slot_db, _, identifier)| {
                *slot_db == db && identifiers.iter().any(|i| i == identifier)
            })
            .cloned()
            .collect();
        for slot in victims {
            tracked.remove(&slot);
            self.host
                .release_hash_string_ref(slot.0, &slot.1, slot.2.as_bytes());
        }
    }

    pub fn hash_extern_errors(&self) -> u64 {
        self.extern_errors.load(Ordering::Relaxed)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }
}
