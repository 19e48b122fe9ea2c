//! Cluster-wide metadata reconciliation.
//!
//! The [`MetadataManager`] keeps a replicated map of registered object types
//! (index schemas, for one) and converges it across the cluster without a
//! coordinator: primaries periodically broadcast a compact version header;
//! a node that sees a newer or conflicting header pulls the sender's full
//! snapshot over unary RPC and merges it entry by entry under the
//! `(version, encoding_version, fingerprint)` lexicographic order. Every
//! local mutation bumps the entry version, recomputes both fingerprints,
//! replicates through the host's internal-update channel, and broadcasts.
//!
//! Commits are atomic: the merged [`GlobalMetadata`] value is swapped in
//! whole, so readers observe either the old map or the new one. Mutating
//! entry points belong to the host main thread; background completions
//! re-enter through `run_on_main` and only ever carry value snapshots.

pub mod fingerprint;
pub mod objname;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::host::{ClusterTransport, SharedHost};
use crate::version::MODULE_VERSION;
use crate::wire::{
    self, GlobalMetadata, GlobalMetadataEntry, GlobalMetadataVersionHeader,
    IndexFingerprintVersion, PartitionRequest,
};

pub use fingerprint::{fingerprint64, top_level_fingerprint};
pub use objname::ObjName;

/// Computes an entry's content fingerprint under the current encoding.
pub type FingerprintCallback = Box<dyn Fn(&[u8]) -> Result<u64> + Send + Sync>;

/// Applies an accepted entry to the owning component. `None` content means
/// deletion.
pub type UpdateCallback =
    Box<dyn Fn(&ObjName, Option<&[u8]>, u64, u32) -> Result<()> + Send + Sync>;

/// Oldest module version able to consume the content.
pub type MinVersionCallback = Box<dyn Fn(&[u8]) -> Result<u32> + Send + Sync>;

pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 30_000;
pub const BROADCAST_JITTER_RATIO: f64 = 0.5;

struct RegisteredType {
    encoding_version: u32,
    fingerprint_cb: FingerprintCallback,
    update_cb: UpdateCallback,
    min_version_cb: MinVersionCallback,
}

struct ManagerState {
    metadata: GlobalMetadata,
    staged: GlobalMetadata,
    staging_due_to_repl_load: bool,
    is_loading: bool,
    registered_types: HashMap<String, RegisteredType>,
}

/// An accepted child plus whether callbacks still owe it an application.
struct AcceptedEntry {
    type_name: String,
    encoded_id: String,
    entry: GlobalMetadataEntry,
}

pub struct MetadataManager {
    host: SharedHost,
    transport: Arc<dyn ClusterTransport>,
    state: Mutex<ManagerState>,
    last_healthy_ms: AtomicI64,
    reconcile_completed: AtomicI64,
    internal_update_failures: AtomicU64,
    broadcast_interval_ms: u64,
}

impl MetadataManager {
    pub fn new(
        host: SharedHost,
        transport: Arc<dyn ClusterTransport>,
        broadcast_interval_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            transport,
            state: Mutex::new(ManagerState {
                metadata: GlobalMetadata::default(),
                staged: GlobalMetadata::default(),
                staging_due_to_repl_load: false,
                is_loading: false,
                registered_types: HashMap::new(),
            }),
            last_healthy_ms: AtomicI64::new(0),
            reconcile_completed: AtomicI64::new(0),
            internal_update_failures: AtomicU64::new(0),
            broadcast_interval_ms,
        })
    }

    /// Register a metadata type. Must happen once per type, at startup,
    /// before any entry of that type is created or reconciled. Callbacks
    /// must not re-enter the manager.
    pub fn register_type(
        &self,
        type_name: &str,
        encoding_version: u32,
        fingerprint_cb: FingerprintCallback,
        update_cb: UpdateCallback,
        min_version_cb: MinVersionCallback,
    ) {
        let mut state = self.state.lock();
        let previous = state.registered_types.insert(
            type_name.to_string(),
            RegisteredType {
                encoding_version,
                fingerprint_cb,
                update_cb,
                min_version_cb,
            },
        );
        debug!(type_name, "registered metadata type");
        assert!(previous.is_none(), "type already registered: {type_name}");
    }

    // ── Local mutation ──────────────────────────────────────────────────

    /// Create or overwrite an entry. The update callback runs before the
    /// commit; its failure aborts with no state change.
    pub fn create_entry(
        &self,
        type_name: &str,
        obj_name: &ObjName,
        content: Vec<u8>,
    ) -> Result<IndexFingerprintVersion> {
        let encoded_id = obj_name.encode();
        let mut state = self.state.lock();
        let registered = state
            .registered_types
            .get(type_name)
            .ok_or_else(|| EngineError::not_found(format!("no type registered for {type_name}")))?;

        let version = state
            .metadata
            .type_namespace_map
            .get(type_name)
            .and_then(|entries| entries.get(&encoded_id))
            .map(|entry| entry.version + 1)
            .unwrap_or(0);
        let fingerprint = (registered.fingerprint_cb)(&content)?;
        let min_version = (registered.min_version_cb)(&content)?;
        let new_entry = GlobalMetadataEntry {
            version,
            fingerprint,
            encoding_version: registered.encoding_version,
            min_version,
            content: Some(content),
        };

        (registered.update_cb)(
            obj_name,
            new_entry.content.as_deref(),
            fingerprint,
            version,
        )?;

        state
            .metadata
            .type_namespace_map
            .entry(type_name.to_string())
            .or_default()
            .insert(encoded_id.clone(), new_entry.clone());
        state.metadata.version_header.top_level_version += 1;
        state.metadata.version_header.top_level_fingerprint =
            top_level_fingerprint(&state.metadata);
        state.metadata.version_header.top_level_min_version =
            compute_min_version(&state.metadata, &state.registered_types);
        let header = state.metadata.version_header;
        drop(state);

        self.replicate_internal_update(&encoded_id, &new_entry, &header);
        self.broadcast_header(header);
        Ok(IndexFingerprintVersion {
            fingerprint,
            version,
        })
    }

    /// Tombstone an entry: next version, no content, zero fingerprint.
    pub fn delete_entry(&self, type_name: &str, obj_name: &ObjName) -> Result<()> {
        let encoded_id = obj_name.encode();
        let mut state = self.state.lock();
        let current = state
            .metadata
            .type_namespace_map
            .get(type_name)
            .and_then(|entries| entries.get(&encoded_id))
            .filter(|entry| entry.content.is_some())
            .ok_or_else(|| {
                EngineError::not_found(format!("entry not found: {type_name} {obj_name}"))
            })?;
        let tombstone = GlobalMetadataEntry {
            version: current.version + 1,
            fingerprint: 0,
            encoding_version: 0,
            min_version: 0,
            content: None,
        };

        if let Some(registered) = state.registered_types.get(type_name) {
            (registered.update_cb)(obj_name, None, 0, tombstone.version)?;
        }

        state
            .metadata
            .type_namespace_map
            .get_mut(type_name)
            .expect("bucket exists")
            .insert(encoded_id.clone(), tombstone.clone());
        state.metadata.version_header.top_level_version += 1;
        state.metadata.version_header.top_level_fingerprint =
            top_level_fingerprint(&state.metadata);
        let header = state.metadata.version_header;
        drop(state);

        self.replicate_internal_update(&encoded_id, &tombstone, &header);
        self.broadcast_header(header);
        Ok(())
    }

    pub fn entry_content(&self, type_name: &str, obj_name: &ObjName) -> Result<Vec<u8>> {
        let encoded_id = obj_name.encode();
        let state = self.state.lock();
        state
            .metadata
            .type_namespace_map
            .get(type_name)
            .and_then(|entries| entries.get(&encoded_id))
            .and_then(|entry| entry.content.clone())
            .ok_or_else(|| {
                EngineError::not_found(format!("entry not found: {type_name} {obj_name}"))
            })
    }

    /// `(obj, fingerprint, version)` of every live entry of one type.
    pub fn entries_of_type(&self, type_name: &str) -> Vec<(ObjName, u64, u32)> {
        let state = self.state.lock();
        state
            .metadata
            .type_namespace_map
            .get(type_name)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, entry)| entry.content.is_some())
                    .map(|(id, entry)| (ObjName::decode(id), entry.fingerprint, entry.version))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Value snapshot of the whole replicated map.
    pub fn global_metadata(&self) -> GlobalMetadata {
        self.state.lock().metadata.clone()
    }

    pub fn version_header(&self) -> GlobalMetadataVersionHeader {
        self.state.lock().metadata.version_header
    }

    // ── Broadcast plane ─────────────────────────────────────────────────

    fn broadcast_header(&self, header: GlobalMetadataVersionHeader) {
        if self.state.lock().is_loading {
            debug!("skipping metadata broadcast while loading");
            return;
        }
        match wire::encode(&header) {
            Ok(payload) => self.transport.broadcast(&payload),
            Err(err) => warn!(%err, "failed to encode metadata header"),
        }
    }

    /// Broadcast the current header to all peers.
    pub fn broadcast_metadata(&self) {
        let header = self.version_header();
        self.broadcast_header(header);
    }

    /// Arm the periodic broadcast: `interval ± 50%` jitter, re-armed from
    /// each firing. Timer cancellation is cooperative — the callback holds
    /// only a weak handle.
    pub fn start_periodic_broadcast(self: &Arc<Self>) {
        self.schedule_next_broadcast();
    }

    fn schedule_next_broadcast(self: &Arc<Self>) {
        let jitter = rand::thread_rng()
            .gen_range(-BROADCAST_JITTER_RATIO / 2.0..BROADCAST_JITTER_RATIO / 2.0);
        let interval = self.broadcast_interval_ms as f64 * (1.0 + jitter);
        let weak = Arc::downgrade(self);
        self.host.create_timer(
            Duration::from_millis(interval.max(1.0) as u64),
            Box::new(move || {
                if let Some(manager) = weak.upgrade() {
                    manager.broadcast_metadata();
                    manager.schedule_next_broadcast();
                }
            }),
        );
    }

    /// Cluster-bus receiver: decode the header and decide whether to pull.
    pub fn handle_cluster_message(self: &Arc<Self>, sender_id: &str, payload: &[u8]) {
        let header: GlobalMetadataVersionHeader = match wire::decode(payload) {
            Ok(header) => header,
            Err(err) => {
                warn!(%err, sender_id, "dropping malformed metadata header");
                return;
            }
        };
        self.handle_broadcasted_metadata(sender_id, header);
    }

    fn handle_broadcasted_metadata(
        self: &Arc<Self>,
        sender_id: &str,
        header: GlobalMetadataVersionHeader,
    ) {
        {
            let state = self.state.lock();
            if state.is_loading {
                debug!(sender_id, "ignoring metadata broadcast while loading");
                return;
            }
        }
        // Replicas learn through the replication link, not the bus.
        if !self.transport.is_primary() {
            return;
        }
        if header.top_level_min_version > MODULE_VERSION.to_int() {
            warn!(
                sender_id,
                required = header.top_level_min_version,
                running = MODULE_VERSION.to_int(),
                "ignoring metadata header above our version"
            );
            return;
        }
        let local = self.version_header();
        if header.top_level_version < local.top_level_version {
            return;
        }
        if header.top_level_version == local.top_level_version {
            if header.top_level_fingerprint == local.top_level_fingerprint {
                return;
            }
            warn!(
                sender_id,
                version = local.top_level_version,
                local_fingerprint = local.top_level_fingerprint,
                remote_fingerprint = header.top_level_fingerprint,
                "conflicting metadata contents; retrieving full snapshot"
            );
        } else {
            info!(
                sender_id,
                local = local.top_level_version,
                remote = header.top_level_version,
                "newer metadata version; retrieving full snapshot"
            );
        }

        let snapshot = match self
            .transport
            .unary(sender_id, PartitionRequest::GetGlobalMetadata)
            .and_then(|resp| resp.into_metadata())
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, sender_id, "failed to pull metadata snapshot");
                return;
            }
        };
        // Completion hops back to the main loop; only the snapshot value
        // crosses the boundary.
        let manager = self.clone();
        let source = sender_id.to_string();
        self.host.run_on_main(Box::new(move || {
            if let Err(err) = manager.reconcile(&snapshot, &source, true, false) {
                warn!(%err, source, "failed to reconcile metadata");
            }
        }));
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    /// Merge a peer snapshot. Accepts a child iff it is new, preferred, or
    /// strictly greater under `(version, encoding_version, fingerprint)`;
    /// equal-fingerprint ties are no-ops. Accepted entries coming from an
    /// older encoding are re-fingerprinted under local rules so our stamp
    /// wins downstream.
    pub fn reconcile(
        &self,
        proposed: &GlobalMetadata,
        source: &str,
        trigger_callbacks: bool,
        prefer_incoming: bool,
    ) -> Result<()> {
        if proposed.version_header.top_level_min_version > MODULE_VERSION.to_int() {
            return Err(EngineError::failed_precondition(format!(
                "metadata from {source} requires module version {}, running {}",
                proposed.version_header.top_level_min_version,
                MODULE_VERSION
            )));
        }
        let mut accepted: Vec<AcceptedEntry> = Vec::new();
        let (header, should_broadcast) = {
            let mut state = self.state.lock();
            let mut result = state.metadata.clone();
            for (type_name, proposed_inner) in &proposed.type_namespace_map {
                for (id, proposed_entry) in proposed_inner {
                    let existing = result
                        .type_namespace_map
                        .get(type_name)
                        .and_then(|entries| entries.get(id));
                    if let Some(existing) = existing {
                        if !prefer_incoming && !wins(proposed_entry, existing) {
                            continue;
                        }
                    }
                    let mut entry = proposed_entry.clone();
                    if let Some(registered) = state.registered_types.get(type_name) {
                        if entry.content.is_some()
                            && entry.encoding_version < registered.encoding_version
                        {
                            entry.fingerprint = (registered.fingerprint_cb)(
                                entry.content.as_deref().expect("content checked"),
                            )?;
                            entry.encoding_version = registered.encoding_version;
                        }
                    }
                    result
                        .type_namespace_map
                        .entry(type_name.clone())
                        .or_default()
                        .insert(id.clone(), entry.clone());
                    accepted.push(AcceptedEntry {
                        type_name: type_name.clone(),
                        encoded_id: id.clone(),
                        entry,
                    });
                }
            }

            let old_fingerprint = state.metadata.version_header.top_level_fingerprint;
            let new_fingerprint = top_level_fingerprint(&result);
            result.version_header.top_level_fingerprint = new_fingerprint;
            let mut new_version = state
                .metadata
                .version_header
                .top_level_version
                .max(proposed.version_header.top_level_version);
            // A digest differing from both inputs is a genuinely new state
            // and needs its own version plus a broadcast.
            let should_broadcast = new_fingerprint
                != proposed.version_header.top_level_fingerprint
                && new_fingerprint != old_fingerprint;
            if should_broadcast {
                new_version += 1;
            }
            result.version_header.top_level_version = new_version;
            result.version_header.top_level_min_version =
                compute_min_version(&result, &state.registered_types);
            state.metadata = result;
            (state.metadata.version_header, should_broadcast)
        };

        if trigger_callbacks {
            let state = self.state.lock();
            for item in &accepted {
                let obj_name = ObjName::decode(&item.encoded_id);
                if let Some(registered) = state.registered_types.get(&item.type_name) {
                    if let Err(err) = (registered.update_cb)(
                        &obj_name,
                        item.entry.content.as_deref(),
                        item.entry.fingerprint,
                        item.entry.version,
                    ) {
                        // Best-effort merge: a failed application is logged
                        // and repaired by a later cycle, never an abort.
                        warn!(
                            %err,
                            type_name = item.type_name,
                            id = item.encoded_id,
                            source,
                            "reconciliation callback failed"
                        );
                    }
                } else {
                    warn!(
                        type_name = item.type_name,
                        "no type registered; skipping callback"
                    );
                }
            }
            drop(state);
            for item in &accepted {
                self.replicate_internal_update(&item.encoded_id, &item.entry, &header);
            }
        }

        if should_broadcast {
            self.broadcast_header(header);
        }
        self.last_healthy_ms
            .store(self.host.now_ms(), Ordering::Relaxed);
        self.reconcile_completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn replicate_internal_update(
        &self,
        encoded_id: &str,
        entry: &GlobalMetadataEntry,
        header: &GlobalMetadataVersionHeader,
    ) {
        let (entry_bytes, header_bytes) = match (wire::encode(entry), wire::encode(header)) {
            (Ok(entry), Ok(header)) => (entry, header),
            _ => {
                warn!(encoded_id, "failed to encode internal update");
                self.internal_update_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if let Err(err) =
            self.transport
                .replicate_internal_update(encoded_id, &entry_bytes, &header_bytes)
        {
            // Transient replication failures are repaired by the next
            // broadcast cycle.
            self.internal_update_failures.fetch_add(1, Ordering::Relaxed);
            warn!(%err, encoded_id, "internal update replication failed");
        }
    }

    /// Replica-side replay of an internal update. Accepted only on replica
    /// contexts or while loading.
    pub fn apply_internal_update(
        &self,
        encoded_id: &str,
        entry_bytes: &[u8],
        header_bytes: &[u8],
    ) -> Result<()> {
        let entry: GlobalMetadataEntry = wire::decode(entry_bytes)?;
        let header: GlobalMetadataVersionHeader = wire::decode(header_bytes)?;
        {
            let state = self.state.lock();
            if self.transport.is_primary() && !state.is_loading {
                return Err(EngineError::failed_precondition(
                    "internal update replay outside replica or loading context",
                ));
            }
        }
        let obj_name = ObjName::decode(encoded_id);
        let type_name = crate::registry::SCHEMA_METADATA_TYPE;
        {
            let state = self.state.lock();
            if let Some(registered) = state.registered_types.get(type_name) {
                (registered.update_cb)(
                    &obj_name,
                    entry.content.as_deref(),
                    entry.fingerprint,
                    entry.version,
                )?;
            }
        }
        let mut state = self.state.lock();
        state
            .metadata
            .type_namespace_map
            .entry(type_name.to_string())
            .or_default()
            .insert(encoded_id.to_string(), entry);
        state.metadata.version_header.top_level_version = header.top_level_version;
        state.metadata.version_header.top_level_fingerprint =
            top_level_fingerprint(&state.metadata);
        Ok(())
    }

    // ── RDB & loading lifecycle ─────────────────────────────────────────

    /// Serialize the map into its aux section. Writes nothing at all when
    /// there is no entry to carry.
    pub fn rdb_save(&self, sink: &mut dyn crate::host::RdbSink) -> Result<bool> {
        let (metadata, min_version) = {
            let state = self.state.lock();
            if !state.metadata.has_entries() {
                debug!("skipping metadata aux section: no content");
                return Ok(false);
            }
            (
                state.metadata.clone(),
                compute_min_version(&state.metadata, &state.registered_types),
            )
        };
        let mut out = crate::rdb::ChunkedWriter::new(sink);
        crate::rdb::write_section_header(
            &mut out,
            &crate::rdb::SectionHeader {
                section_type: crate::rdb::SectionType::GlobalMetadata,
                supplemental_count: 0,
                min_version,
            },
        )?;
        out.write_value(&metadata)?;
        Ok(true)
    }

    /// Load the aux section. During a replication load the snapshot stages
    /// and applies on loading-ended with `prefer_incoming`; otherwise it
    /// merges immediately.
    pub fn rdb_load(
        &self,
        header: &crate::rdb::SectionHeader,
        source: &mut dyn crate::host::RdbSource,
    ) -> Result<()> {
        if header.section_type != crate::rdb::SectionType::GlobalMetadata {
            return Err(EngineError::internal(
                "metadata loader fed a non-metadata section",
            ));
        }
        let mut input = crate::rdb::ChunkedReader::new(source);
        let metadata: GlobalMetadata = input.read_value()?;
        let staging = {
            let mut state = self.state.lock();
            if state.staging_due_to_repl_load {
                state.staged = metadata.clone();
                true
            } else {
                false
            }
        };
        if !staging {
            self.reconcile(&metadata, "RDB Load", false, true)?;
        }
        Ok(())
    }

    pub fn on_loading_started(&self) {
        info!("loading started; pausing incoming metadata updates");
        self.state.lock().is_loading = true;
    }

    pub fn on_replication_load_start(&self) {
        info!("staging metadata during replication load");
        let mut state = self.state.lock();
        state.is_loading = true;
        state.staging_due_to_repl_load = true;
    }

    pub fn on_loading_ended(&self) -> Result<()> {
        let staged = {
            let mut state = self.state.lock();
            if state.staging_due_to_repl_load {
                state.staging_due_to_repl_load = false;
                state.metadata = GlobalMetadata::default();
                Some(std::mem::take(&mut state.staged))
            } else {
                None
            }
        };
        if let Some(staged) = staged {
            info!("applying staged metadata at the end of loading");
            self.reconcile(&staged, "RDB Load Staged", false, true)?;
        }
        self.state.lock().is_loading = false;
        Ok(())
    }

    // ── Health ──────────────────────────────────────────────────────────

    pub fn ms_since_last_healthy(&self) -> i64 {
        let last = self.last_healthy_ms.load(Ordering::Relaxed);
        if last == 0 {
            return -1;
        }
        self.host.now_ms() - last
    }

    pub fn reconcile_completed_count(&self) -> i64 {
        self.reconcile_completed.load(Ordering::Relaxed)
    }

    pub fn internal_update_failure_count(&self) -> u64 {
        self.internal_update_failures.load(Ordering::Relaxed)
    }
}

/// Strictly-greater comparison under the conflict-resolution order.
fn wins(proposed: &GlobalMetadataEntry, existing: &GlobalMetadataEntry) -> bool {
    if proposed.version != existing.version {
        return proposed.version > existing.version;
    }
    if proposed.encoding_version != existing.encoding_version {
        return proposed.encoding_version > existing.encoding_version;
    }
    proposed.fingerprint > existing.fingerprint
}

fn compute_min_version(
    metadata: &GlobalMetadata,
    registered: &HashMap<String, RegisteredType>,
) -> u32 {
    let mut min_version = 0;
    for (type_name, entries) in &metadata.type_namespace_map {
        let callback = registered.get(type_name).map(|r| &r.min_version_cb);
        for entry in entries.values() {
            let required = match (&callback, &entry.content) {
                (Some(cb), Some(content)) => cb(content).unwrap_or(entry.min_version),
                _ => entry.min_version,
            };
            min_version = min_version.max(required);
        }
    }
    min_version
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;
    use crate::host::{NodeInfo, TargetMode};
    use crate::wire::PartitionResponse;

    struct NullTransport;

    impl ClusterTransport for NullTransport {
        fn node_id(&self) -> String {
            "test-node".into()
        }
        fn is_primary(&self) -> bool {
            true
        }
        fn broadcast(&self, _payload: &[u8]) {}
        fn unary(&self, _target: &str, _req: PartitionRequest) -> Result<PartitionResponse> {
            Err(EngineError::unavailable("null transport"))
        }
        fn targets(&self, _mode: TargetMode) -> Vec<NodeInfo> {
            Vec::new()
        }
        fn replicate_internal_update(&self, _id: &str, _e: &[u8], _h: &[u8]) -> Result<()> {
            Ok(())
        }
        fn slot_fingerprint(&self) -> u64 {
            0
        }
    }

    fn manager() -> Arc<MetadataManager> {
        let host = Arc::new(MemoryHost::new());
        let manager = MetadataManager::new(host, Arc::new(NullTransport), 30_000);
        manager.register_type(
            crate::registry::SCHEMA_METADATA_TYPE,
            MODULE_VERSION.to_int(),
            Box::new(|content| Ok(fingerprint64(content))),
            Box::new(|_, _, _, _| Ok(())),
            Box::new(|_| Ok(0)),
        );
        manager
    }

    const TYPE: &str = crate::registry::SCHEMA_METADATA_TYPE;

    #[test]
    fn create_assigns_incrementing_versions() {
        let manager = manager();
        let obj = ObjName::new(0, "idx");
        let first = manager.create_entry(TYPE, &obj, vec![1]).unwrap();
        assert_eq!(first.version, 0);
        let second = manager.create_entry(TYPE, &obj, vec![2]).unwrap();
        assert_eq!(second.version, 1);
        assert_ne!(first.fingerprint, second.fingerprint);
        assert_eq!(manager.version_header().top_level_version, 2);
    }

    #[test]
    fn update_callback_failure_aborts_create() {
        let host = Arc::new(MemoryHost::new());
        let manager = MetadataManager::new(host, Arc::new(NullTransport), 30_000);
        manager.register_type(
            TYPE,
            MODULE_VERSION.to_int(),
            Box::new(|content| Ok(fingerprint64(content))),
            Box::new(|_, _, _, _| Err(EngineError::internal("refused"))),
            Box::new(|_| Ok(0)),
        );
        let obj = ObjName::new(0, "idx");
        assert!(manager.create_entry(TYPE, &obj, vec![1]).is_err());
        assert!(!manager.global_metadata().has_entries());
        assert_eq!(manager.version_header().top_level_version, 0);
    }

    #[test]
    fn delete_writes_tombstone() {
        let manager = manager();
        let obj = ObjName::new(0, "idx");
        manager.create_entry(TYPE, &obj, vec![1]).unwrap();
        manager.delete_entry(TYPE, &obj).unwrap();

        let snapshot = manager.global_metadata();
        let entry = &snapshot.type_namespace_map[TYPE]["idx"];
        assert!(entry.is_tombstone());
        assert_eq!(entry.version, 1);
        // Deleting again is NotFound.
        assert!(matches!(
            manager.delete_entry(TYPE, &obj),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn reconcile_is_monotonic() {
        let manager = manager();
        let obj = ObjName::new(0, "idx");
        manager.create_entry(TYPE, &obj, vec![1]).unwrap();
        let before = manager.global_metadata();

        // A stale snapshot (lower version) must not regress our entry.
        let mut stale = before.clone();
        let entry = stale
            .type_namespace_map
            .get_mut(TYPE)
            .unwrap()
            .get_mut("idx")
            .unwrap();
        entry.version = 0;
        entry.fingerprint = 1;
        entry.content = Some(vec![9]);
        stale.version_header.top_level_version = 0;

        manager.create_entry(TYPE, &obj, vec![2]).unwrap(); // version 1
        manager.reconcile(&stale, "peer", false, false).unwrap();
        let after = manager.global_metadata();
        assert_eq!(after.type_namespace_map[TYPE]["idx"].version, 1);
        assert_eq!(
            after.type_namespace_map[TYPE]["idx"].content,
            Some(vec![2])
        );
        assert!(manager.reconcile_completed_count() >= 1);
    }

    #[test]
    fn equal_version_ties_break_on_fingerprint() {
        let manager = manager();
        let obj = ObjName::new(0, "idx");
        manager.create_entry(TYPE, &obj, vec![1]).unwrap();
        let local_fp = manager.global_metadata().type_namespace_map[TYPE]["idx"].fingerprint;

        let mut rival = GlobalMetadata::default();
        let rival_fp = local_fp.wrapping_add(1);
        rival.type_namespace_map.entry(TYPE.into()).or_default().insert(
            "idx".into(),
            GlobalMetadataEntry {
                version: 0,
                fingerprint: rival_fp,
                encoding_version: MODULE_VERSION.to_int(),
                min_version: 0,
                content: Some(vec![7]),
            },
        );
        rival.version_header.top_level_version = 1;
        rival.version_header.top_level_fingerprint = top_level_fingerprint(&rival);

        manager.reconcile(&rival, "peer", false, false).unwrap();
        let merged = manager.global_metadata();
        if rival_fp > local_fp {
            assert_eq!(merged.type_namespace_map[TYPE]["idx"].content, Some(vec![7]));
        } else {
            assert_eq!(merged.type_namespace_map[TYPE]["idx"].content, Some(vec![1]));
        }
    }

    #[test]
    fn reconcile_bumps_version_when_merge_differs_from_both() {
        let manager = manager();
        let obj_a = ObjName::new(0, "a");
        manager.create_entry(TYPE, &obj_a, vec![1]).unwrap();
        let local_version = manager.version_header().top_level_version;

        // Peer knows a different entry at the same top-level version.
        let mut peer = GlobalMetadata::default();
        peer.type_namespace_map.entry(TYPE.into()).or_default().insert(
            "b".into(),
            GlobalMetadataEntry {
                version: 0,
                fingerprint: 42,
                encoding_version: MODULE_VERSION.to_int(),
                min_version: 0,
                content: Some(vec![2]),
            },
        );
        peer.version_header.top_level_version = local_version;
        peer.version_header.top_level_fingerprint = top_level_fingerprint(&peer);

        manager.reconcile(&peer, "peer", false, false).unwrap();
        let merged = manager.global_metadata();
        // Union of both sides, at a bumped version.
        assert_eq!(merged.type_namespace_map[TYPE].len(), 2);
        assert_eq!(
            merged.version_header.top_level_version,
            local_version + 1
        );
    }

    #[test]
    fn prefer_incoming_overwrites() {
        let manager = manager();
        let obj = ObjName::new(0, "idx");
        manager.create_entry(TYPE, &obj, vec![5]).unwrap();
        let snapshot = manager.global_metadata();

        manager.create_entry(TYPE, &obj, vec![6]).unwrap(); // local moves ahead
        manager
            .reconcile(&snapshot, "rdb", false, true)
            .unwrap();
        let restored = manager.global_metadata();
        assert_eq!(
            restored.type_namespace_map[TYPE]["idx"].content,
            Some(vec![5])
        );
    }

    #[test]
    fn too_new_metadata_is_refused() {
        let manager = manager();
        let mut future = GlobalMetadata::default();
        future.version_header.top_level_min_version = MODULE_VERSION.to_int() + 100;
        assert!(matches!(
            manager.reconcile(&future, "peer", false, false),
            Err(EngineError::FailedPrecondition(_))
        ));
    }

    #[test]
    fn rdb_skips_empty_metadata() {
        let manager = manager();
        let mut rdb = crate::host::memory::MemoryRdb::new();
        assert!(!manager.rdb_save(&mut rdb).unwrap());
        assert!(rdb.is_empty());
    }

    #[test]
    fn rdb_roundtrip_reproduces_map() {
        let mgr = manager();
        let obj = ObjName::new(0, "idx");
        mgr.create_entry(TYPE, &obj, vec![1, 2, 3]).unwrap();
        let saved = mgr.global_metadata();

        let mut rdb = crate::host::memory::MemoryRdb::new();
        assert!(mgr.rdb_save(&mut rdb).unwrap());

        let fresh = manager();
        let mut reader = crate::rdb::ChunkedReader::new(&mut rdb);
        let header = crate::rdb::read_section_header(&mut reader).unwrap();
        drop(reader);
        fresh.rdb_load(&header, &mut rdb).unwrap();
        let loaded = fresh.global_metadata();
        assert_eq!(
            loaded.type_namespace_map[TYPE]["idx"],
            saved.type_namespace_map[TYPE]["idx"]
        );
    }

    #[test]
    fn replication_load_stages_until_loading_ends() {
        let manager = manager();
        let donor = {
            let m = self::manager();
            m.create_entry(TYPE, &ObjName::new(0, "idx"), vec![9]).unwrap();
            m
        };
        let mut rdb = crate::host::memory::MemoryRdb::new();
        donor.rdb_save(&mut rdb).unwrap();

        manager.on_replication_load_start();
        let mut reader = crate::rdb::ChunkedReader::new(&mut rdb);
        let header = crate::rdb::read_section_header(&mut reader).unwrap();
        drop(reader);
        manager.rdb_load(&header, &mut rdb).unwrap();
        // Nothing applied yet.
        assert!(!manager.global_metadata().has_entries());
        manager.on_loading_ended().unwrap();
        assert!(manager.global_metadata().has_entries());
    }
}
