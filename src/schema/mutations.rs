//! Per-key mutation tracking.
//!
//! Between a keyspace notification and its application on the writer pool,
//! each key owns at most one [`DocumentMutation`]. A second notification for
//! an in-flight key merges its attribute data into the existing entry; the
//! consuming worker re-reads after finishing so nothing is lost. Backfill
//! entries are promoted when a foreground write collides with them, and
//! blocked clients ride on the entry until it fully drains.

use std::collections::HashMap;

use bytes::Bytes;

use crate::host::BlockedClient;
use crate::index::{DeletionKind, Key};

/// New value for one attribute, or the kind of deletion it suffered.
#[derive(Debug, Clone)]
pub struct AttributeData {
    pub data: Option<Bytes>,
    pub deletion: DeletionKind,
}

impl AttributeData {
    pub fn value(data: Bytes) -> Self {
        Self {
            data: Some(data),
            deletion: DeletionKind::Field,
        }
    }

    pub fn deletion(kind: DeletionKind) -> Self {
        Self {
            data: None,
            deletion: kind,
        }
    }
}

/// `alias → new-value-or-deletion` for one notification.
pub type MutatedAttributes = HashMap<String, AttributeData>;

#[derive(Default)]
pub struct DocumentMutation {
    /// `None` once the current bundle has been consumed and no newer
    /// notification has merged in.
    pub attributes: Option<MutatedAttributes>,
    pub blocked_clients: Vec<BlockedClient>,
    pub consume_in_progress: bool,
    pub from_backfill: bool,
    pub from_multi: bool,
}

/// Outcome of tracking a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// First entry for this key: the caller must schedule a consumer.
    Inserted,
    /// Merged into an in-flight entry; a consumer already owns the key.
    Merged,
    /// Merged, and a backfill entry was promoted by foreground traffic: the
    /// caller must re-schedule at high priority.
    Promoted,
}

/// The dedup table. Guarded by one mutex in the owning schema; never held
/// across index operations.
#[derive(Default)]
pub struct MutationTable {
    records: HashMap<Key, DocumentMutation>,
}

impl MutationTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn references(&self, key: &Key) -> bool {
        self.records.contains_key(key)
    }

    /// True when a pending bundle for `key` touches `alias`.
    pub fn references_attribute(&self, key: &Key, alias: &str) -> bool {
        self.records
            .get(key)
            .and_then(|m| m.attributes.as_ref())
            .is_some_and(|attrs| attrs.contains_key(alias))
    }

    pub fn track(
        &mut self,
        key: &Key,
        mutated: MutatedAttributes,
        from_backfill: bool,
        blocked_client: Option<BlockedClient>,
        from_multi: bool,
    ) -> TrackOutcome {
        let entry = self.records.entry(key.clone());
        match entry {
            std::collections::hash_map::Entry::Vacant(slot) => {
                let mut mutation = DocumentMutation {
                    attributes: Some(mutated),
                    from_backfill,
                    from_multi,
                    ..Default::default()
                };
                if let Some(client) = blocked_client {
                    mutation.blocked_clients.push(client);
                }
                slot.insert(mutation);
                TrackOutcome::Inserted
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let mutation = slot.get_mut();
                if from_multi {
                    mutation.from_multi = true;
                }
                let attrs = mutation.attributes.get_or_insert_with(MutatedAttributes::new);
                for (alias, data) in mutated {
                    attrs.insert(alias, data);
                }
                if let Some(client) = blocked_client {
                    if !mutation.from_multi {
                        mutation.blocked_clients.push(client);
                    } else {
                        // MULTI entries drain in one batch; the client was
                        // never really parked.
                        return if !from_backfill && mutation.from_backfill {
                            mutation.from_backfill = false;
                            TrackOutcome::Promoted
                        } else {
                            TrackOutcome::Merged
                        };
                    }
                }
                if !from_backfill && mutation.from_backfill {
                    mutation.from_backfill = false;
                    TrackOutcome::Promoted
                } else {
                    TrackOutcome::Merged
                }
            }
        }
    }

    /// Take the pending bundle for `key`. `first_time` consumers back off
    /// when another worker already owns the entry; the owning worker loops
    /// with `first_time = false` until the entry drains, at which point the
    /// entry is removed and its blocked clients are returned for release.
    pub fn consume(
        &mut self,
        key: &Key,
        first_time: bool,
    ) -> ConsumeResult {
        let Some(mutation) = self.records.get_mut(key) else {
            return ConsumeResult::Done(Vec::new());
        };
        if first_time && mutation.consume_in_progress {
            return ConsumeResult::Busy;
        }
        mutation.consume_in_progress = true;
        match mutation.attributes.take() {
            Some(attrs) => ConsumeResult::Bundle(attrs),
            None => {
                let mutation = self.records.remove(key).expect("entry just accessed");
                ConsumeResult::Done(mutation.blocked_clients)
            }
        }
    }

    /// Drop everything (schema teardown). Returns all parked clients.
    pub fn clear(&mut self) -> Vec<BlockedClient> {
        self.records
            .drain()
            .flat_map(|(_, mutation)| mutation.blocked_clients)
            .collect()
    }

    /// Keys with pending bundles, for the v2 RDB extension.
    pub fn pending_keys(&self) -> Vec<Key> {
        self.records.keys().cloned().collect()
    }
}

/// Result of [`MutationTable::consume`].
pub enum ConsumeResult {
    /// A bundle to apply under the writer lock.
    Bundle(MutatedAttributes),
    /// Another worker owns this key right now.
    Busy,
    /// Entry fully drained (or absent); release these clients.
    Done(Vec<BlockedClient>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::{InternStore, StringCategory};

    fn key(store: &InternStore, name: &str) -> Key {
        store.intern(name.as_bytes(), StringCategory::Key)
    }

    fn attrs(alias: &str, value: &str) -> MutatedAttributes {
        let mut map = MutatedAttributes::new();
        map.insert(
            alias.to_string(),
            AttributeData::value(Bytes::copy_from_slice(value.as_bytes())),
        );
        map
    }

    #[test]
    fn single_entry_per_key() {
        let store = InternStore::new();
        let mut table = MutationTable::default();
        let k = key(&store, "doc:1");
        assert_eq!(
            table.track(&k, attrs("n", "1"), false, None, false),
            TrackOutcome::Inserted
        );
        assert_eq!(
            table.track(&k, attrs("n", "2"), false, None, false),
            TrackOutcome::Merged
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn merge_overwrites_attribute_data() {
        let store = InternStore::new();
        let mut table = MutationTable::default();
        let k = key(&store, "doc:1");
        table.track(&k, attrs("n", "1"), false, None, false);
        table.track(&k, attrs("n", "2"), false, None, false);
        match table.consume(&k, true) {
            ConsumeResult::Bundle(bundle) => {
                let data = bundle["n"].data.as_ref().unwrap();
                assert_eq!(data.as_ref(), b"2");
            }
            _ => panic!("expected bundle"),
        }
    }

    #[test]
    fn backfill_promotion() {
        let store = InternStore::new();
        let mut table = MutationTable::default();
        let k = key(&store, "doc:1");
        table.track(&k, attrs("n", "1"), true, None, false);
        assert_eq!(
            table.track(&k, attrs("n", "2"), false, None, false),
            TrackOutcome::Promoted
        );
        // Once promoted, further foreground merges stay merges.
        assert_eq!(
            table.track(&k, attrs("n", "3"), false, None, false),
            TrackOutcome::Merged
        );
    }

    #[test]
    fn consume_lifecycle() {
        let store = InternStore::new();
        let mut table = MutationTable::default();
        let k = key(&store, "doc:1");
        table.track(&k, attrs("n", "1"), false, Some(BlockedClient(7)), false);

        // First consumer takes the bundle.
        assert!(matches!(table.consume(&k, true), ConsumeResult::Bundle(_)));
        // A second first-time consumer backs off.
        assert!(matches!(table.consume(&k, true), ConsumeResult::Busy));
        // A merge lands while the worker is applying.
        table.track(&k, attrs("n", "2"), false, None, false);
        assert!(matches!(table.consume(&k, false), ConsumeResult::Bundle(_)));
        // Drained: entry removed, clients returned.
        match table.consume(&k, false) {
            ConsumeResult::Done(clients) => assert_eq!(clients, vec![BlockedClient(7)]),
            _ => panic!("expected done"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn attribute_reference_lookup() {
        let store = InternStore::new();
        let mut table = MutationTable::default();
        let k = key(&store, "doc:1");
        table.track(&k, attrs("n", "1"), false, None, false);
        assert!(table.references(&k));
        assert!(table.references_attribute(&k, "n"));
        assert!(!table.references_attribute(&k, "v"));
    }
}
