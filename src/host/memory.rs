//! In-memory host and loopback cluster.
//!
//! [`MemoryHost`] implements the full [`Host`] capability surface over plain
//! maps, which makes it the reference embedding for tests and for callers
//! who want the engine without a server process. [`LoopbackCluster`] wires
//! several engines into one process so fanout, broadcast, and replication
//! paths run end-to-end with no sockets.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use super::{
    BlockedClient, ClusterTransport, DbIndex, Host, KeyspaceObserver, NodeInfo, PartitionService,
    RdbSink, RdbSource, RecordKind, ScanCursor, TargetMode,
};
use crate::error::{EngineError, Result};
use crate::intern::InternedStr;
use crate::wire::{PartitionRequest, PartitionResponse};

enum FieldSlot {
    Owned(Bytes),
    /// Served straight from the engine's intern pool (externalized vector).
    Ref(InternedStr),
}

impl FieldSlot {
    fn bytes(&self) -> Bytes {
        match self {
            FieldSlot::Owned(bytes) => bytes.clone(),
            FieldSlot::Ref(interned) => Bytes::copy_from_slice(interned.as_bytes()),
        }
    }
}

enum StoredRecord {
    Hash(HashMap<Vec<u8>, FieldSlot>),
    Json(JsonValue),
}

type Keyspace = BTreeMap<Vec<u8>, StoredRecord>;

enum PendingWrite {
    HashSet {
        db: DbIndex,
        key: Vec<u8>,
        fields: Vec<(Vec<u8>, Bytes)>,
    },
    Delete {
        db: DbIndex,
        key: Vec<u8>,
    },
}

/// In-memory implementation of the host capability surface.
///
/// Write helpers (`hash_set`, `json_set`, `delete_key`, …) mutate the
/// keyspace and dispatch keyspace events to registered observers, so an
/// engine attached to this host sees the same event flow it would inside a
/// real server. `run_on_main` executes inline; timers are collected and
/// fired explicitly via [`MemoryHost::run_due_timers`], keeping tests
/// deterministic.
pub struct MemoryHost {
    dbs: Mutex<HashMap<DbIndex, Keyspace>>,
    observers: Mutex<Vec<Weak<dyn KeyspaceObserver>>>,
    timers: Mutex<Vec<(Instant, Box<dyn FnOnce() + Send>)>>,
    epoch: Instant,
    oom: AtomicBool,
    in_multi: AtomicBool,
    multi_queueing: AtomicBool,
    multi_queue: Mutex<Vec<PendingWrite>>,
    blocked: Mutex<HashMap<u64, ()>>,
    next_block_id: AtomicU64,
    json_enabled: bool,
    string_ref_enabled: bool,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            dbs: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            epoch: Instant::now(),
            oom: AtomicBool::new(false),
            in_multi: AtomicBool::new(false),
            multi_queueing: AtomicBool::new(false),
            multi_queue: Mutex::new(Vec::new()),
            blocked: Mutex::new(HashMap::new()),
            next_block_id: AtomicU64::new(1),
            json_enabled: true,
            string_ref_enabled: true,
        }
    }

    /// Host without the optional JSON module.
    pub fn without_json() -> Self {
        Self {
            json_enabled: false,
            ..Self::new()
        }
    }

    /// Host without the string-ref hash API (externalization disabled).
    pub fn without_string_refs() -> Self {
        Self {
            string_ref_enabled: false,
            ..Self::new()
        }
    }

    pub fn subscribe(&self, observer: &Arc<dyn KeyspaceObserver>) {
        self.observers.lock().push(Arc::downgrade(observer));
    }

    fn notify(&self, db: DbIndex, key: &[u8]) {
        // Dispatch outside the keyspace lock; observers read back.
        let observers: Vec<_> = {
            let mut guard = self.observers.lock();
            guard.retain(|weak| weak.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.on_key_event(db, key);
        }
    }

    /// Set hash fields on `key` and fire a keyspace event (HSET).
    pub fn hash_set(&self, db: DbIndex, key: &[u8], fields: &[(&[u8], &[u8])]) {
        if self.in_multi_queueing() {
            self.multi_queue.lock().push(PendingWrite::HashSet {
                db,
                key: key.to_vec(),
                fields: fields
                    .iter()
                    .map(|(f, v)| (f.to_vec(), Bytes::copy_from_slice(v)))
                    .collect(),
            });
            return;
        }
        self.apply_hash_set(db, key, fields.iter().map(|(f, v)| {
            (f.to_vec(), Bytes::copy_from_slice(v))
        }));
        self.notify(db, key);
    }

    fn apply_hash_set(
        &self,
        db: DbIndex,
        key: &[u8],
        fields: impl IntoIterator<Item = (Vec<u8>, Bytes)>,
    ) {
        let mut dbs = self.dbs.lock();
        let keyspace = dbs.entry(db).or_default();
        let record = keyspace
            .entry(key.to_vec())
            .or_insert_with(|| StoredRecord::Hash(HashMap::new()));
        if let StoredRecord::Hash(map) = record {
            for (field, value) in fields {
                map.insert(field, FieldSlot::Owned(value));
            }
        } else {
            let mut map = HashMap::new();
            for (field, value) in fields {
                map.insert(field, FieldSlot::Owned(value));
            }
            *record = StoredRecord::Hash(map);
        }
    }

    /// Store a JSON document at `key` and fire a keyspace event (JSON.SET).
    pub fn json_set(&self, db: DbIndex, key: &[u8], doc: JsonValue) {
        {
            let mut dbs = self.dbs.lock();
            dbs.entry(db)
                .or_default()
                .insert(key.to_vec(), StoredRecord::Json(doc));
        }
        self.notify(db, key);
    }

    /// Delete `key` and fire a keyspace event (DEL / expiry).
    pub fn delete_key(&self, db: DbIndex, key: &[u8]) {
        if self.in_multi_queueing() {
            self.multi_queue.lock().push(PendingWrite::Delete {
                db,
                key: key.to_vec(),
            });
            return;
        }
        self.apply_delete(db, key);
        self.notify(db, key);
    }

    fn apply_delete(&self, db: DbIndex, key: &[u8]) {
        let mut dbs = self.dbs.lock();
        if let Some(keyspace) = dbs.get_mut(&db) {
            keyspace.remove(key);
        }
    }

    /// Begin buffering writes as a MULTI transaction.
    pub fn begin_multi(&self) {
        self.multi_queue.lock().clear();
        self.multi_queueing.store(true, Ordering::Release);
    }

    fn in_multi_queueing(&self) -> bool {
        self.multi_queueing.load(Ordering::Acquire)
    }

    /// Apply all buffered writes; keyspace events fire per command with the
    /// MULTI flag raised, matching EXEC semantics.
    pub fn exec_multi(&self) {
        self.multi_queueing.store(false, Ordering::Release);
        let pending: Vec<_> = self.multi_queue.lock().drain(..).collect();
        self.in_multi.store(true, Ordering::Release);
        for write in pending {
            match write {
                PendingWrite::HashSet { db, key, fields } => {
                    self.apply_hash_set(db, &key, fields);
                    self.notify(db, &key);
                }
                PendingWrite::Delete { db, key } => {
                    self.apply_delete(db, &key);
                    self.notify(db, &key);
                }
            }
        }
        self.in_multi.store(false, Ordering::Release);
    }

    /// Swap two database indexes, like SWAPDB. The embedder is responsible
    /// for forwarding the event to the engine registry.
    pub fn swap_db(&self, first: DbIndex, second: DbIndex) {
        let mut dbs = self.dbs.lock();
        let first_space = dbs.remove(&first);
        let second_space = dbs.remove(&second);
        if let Some(space) = second_space {
            dbs.insert(first, space);
        }
        if let Some(space) = first_space {
            dbs.insert(second, space);
        }
    }

    /// Drop every key in `db` without firing per-key events (FLUSHDB).
    pub fn flush_db(&self, db: DbIndex) {
        self.dbs.lock().remove(&db);
    }

    pub fn set_oom(&self, oom: bool) {
        self.oom.store(oom, Ordering::Release);
    }

    /// Number of clients currently parked by the engine.
    pub fn blocked_client_count(&self) -> usize {
        self.blocked.lock().len()
    }

    /// Fire every timer whose deadline has passed.
    pub fn run_due_timers(&self) {
        let now = Instant::now();
        let due: Vec<_> = {
            let mut timers = self.timers.lock();
            let mut due = Vec::new();
            let mut remaining = Vec::new();
            for (deadline, task) in timers.drain(..) {
                if deadline <= now {
                    due.push(task);
                } else {
                    remaining.push((deadline, task));
                }
            }
            *timers = remaining;
            due
        };
        for task in due {
            task();
        }
    }

    /// Fire all pending timers regardless of deadline (at most one round, so
    /// self-rescheduling timers cannot spin forever).
    pub fn run_all_timers(&self) {
        let pending: Vec<_> = {
            let mut timers = self.timers.lock();
            timers.drain(..).map(|(_, task)| task).collect()
        };
        for task in pending {
            task();
        }
    }

    pub fn pending_timer_count(&self) -> usize {
        self.timers.lock().len()
    }
}

fn json_leaf_bytes(value: &JsonValue) -> Option<Bytes> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
        JsonValue::Number(n) => Some(Bytes::from(n.to_string())),
        JsonValue::Bool(b) => Some(Bytes::from_static(if *b { b"true" } else { b"false" })),
        other => serde_json::to_string(other).ok().map(Bytes::from),
    }
}

/// Resolve a restricted JSONPath: `$`, `.name` segments, `[idx]` accessors.
fn resolve_json_path<'v>(doc: &'v JsonValue, path: &str) -> Option<&'v JsonValue> {
    let mut current = doc;
    let trimmed = path.strip_prefix('$').unwrap_or(path);
    let mut rest = trimmed;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after
                .find(['.', '['])
                .unwrap_or(after.len());
            let (name, tail) = after.split_at(end);
            if name.is_empty() {
                return None;
            }
            current = current.get(name)?;
            rest = tail;
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']')?;
            let idx: usize = after[..close].parse().ok()?;
            current = current.get(idx)?;
            rest = &after[close + 1..];
        } else {
            // Bare field name without a leading dot.
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            let (name, tail) = rest.split_at(end);
            current = current.get(name)?;
            rest = tail;
        }
    }
    Some(current)
}

impl Host for MemoryHost {
    fn subscribe_keyspace_events(&self, observer: Arc<dyn KeyspaceObserver>) {
        self.observers.lock().push(Arc::downgrade(&observer));
    }

    fn record_kind(&self, db: DbIndex, key: &[u8]) -> Option<RecordKind> {
        let dbs = self.dbs.lock();
        match dbs.get(&db)?.get(key)? {
            StoredRecord::Hash(_) => Some(RecordKind::Hash),
            StoredRecord::Json(_) => Some(RecordKind::Json),
        }
    }

    fn key_exists(&self, db: DbIndex, key: &[u8]) -> bool {
        let dbs = self.dbs.lock();
        dbs.get(&db).is_some_and(|space| space.contains_key(key))
    }

    fn hash_field(&self, db: DbIndex, key: &[u8], field: &[u8]) -> Option<Bytes> {
        let dbs = self.dbs.lock();
        match dbs.get(&db)?.get(key)? {
            StoredRecord::Hash(map) => map.get(field).map(FieldSlot::bytes),
            StoredRecord::Json(_) => None,
        }
    }

    fn json_path(&self, db: DbIndex, key: &[u8], path: &str) -> Option<Bytes> {
        if !self.json_enabled {
            return None;
        }
        let dbs = self.dbs.lock();
        match dbs.get(&db)?.get(key)? {
            StoredRecord::Json(doc) => resolve_json_path(doc, path).and_then(json_leaf_bytes),
            StoredRecord::Hash(_) => None,
        }
    }

    fn supports_json(&self) -> bool {
        self.json_enabled
    }

    fn db_size(&self, db: DbIndex) -> u64 {
        let dbs = self.dbs.lock();
        dbs.get(&db).map_or(0, |space| space.len() as u64)
    }

    fn scan_step(
        &self,
        db: DbIndex,
        cursor: &mut ScanCursor,
        visit: &mut dyn FnMut(&[u8]),
    ) -> bool {
        if cursor.done {
            return false;
        }
        let next_key = {
            let dbs = self.dbs.lock();
            let Some(space) = dbs.get(&db) else {
                cursor.done = true;
                return false;
            };
            match &cursor.resume_after {
                Some(last) => space
                    .range::<Vec<u8>, _>((
                        std::ops::Bound::Excluded(last.clone()),
                        std::ops::Bound::Unbounded,
                    ))
                    .next()
                    .map(|(k, _)| k.clone()),
                None => space.keys().next().cloned(),
            }
        };
        match next_key {
            Some(key) => {
                visit(&key);
                cursor.resume_after = Some(key);
                true
            }
            None => {
                cursor.done = true;
                false
            }
        }
    }

    fn is_oom(&self) -> bool {
        self.oom.load(Ordering::Acquire)
    }

    fn in_multi_exec(&self) -> bool {
        self.in_multi.load(Ordering::Acquire)
    }

    fn block_client(&self) -> Option<BlockedClient> {
        let id = self.next_block_id.fetch_add(1, Ordering::Relaxed);
        self.blocked.lock().insert(id, ());
        Some(BlockedClient(id))
    }

    fn unblock_client(&self, client: BlockedClient) {
        self.blocked.lock().remove(&client.0);
    }

    fn run_on_main(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }

    fn create_timer(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) {
        self.timers.lock().push((Instant::now() + delay, task));
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    fn supports_hash_string_ref(&self) -> bool {
        self.string_ref_enabled
    }

    fn externalize_hash_field(
        &self,
        db: DbIndex,
        key: &[u8],
        field: &[u8],
        value: &InternedStr,
    ) -> Result<()> {
        if !self.string_ref_enabled {
            return Err(EngineError::internal("host lacks hash string-ref support"));
        }
        let mut dbs = self.dbs.lock();
        let slot = dbs
            .get_mut(&db)
            .and_then(|space| space.get_mut(key))
            .and_then(|record| match record {
                StoredRecord::Hash(map) => map.get_mut(field),
                StoredRecord::Json(_) => None,
            })
            .ok_or_else(|| EngineError::not_found("hash field to externalize"))?;
        *slot = FieldSlot::Ref(value.clone());
        Ok(())
    }

    fn release_hash_string_ref(&self, db: DbIndex, key: &[u8], field: &[u8]) {
        let mut dbs = self.dbs.lock();
        let Some(slot) = dbs
            .get_mut(&db)
            .and_then(|space| space.get_mut(key))
            .and_then(|record| match record {
                StoredRecord::Hash(map) => map.get_mut(field),
                StoredRecord::Json(_) => None,
            })
        else {
            return;
        };
        if let FieldSlot::Ref(interned) = slot {
            *slot = FieldSlot::Owned(Bytes::copy_from_slice(interned.as_bytes()));
        }
    }
}

/// Growable chunk buffer implementing both RDB stream directions.
#[derive(Default)]
pub struct MemoryRdb {
    chunks: VecDeque<Vec<u8>>,
}

impl MemoryRdb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl RdbSink for MemoryRdb {
    fn save_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.chunks.push_back(bytes.to_vec());
        Ok(())
    }
}

impl RdbSource for MemoryRdb {
    fn load_chunk(&mut self) -> Result<Vec<u8>> {
        self.chunks
            .pop_front()
            .ok_or_else(|| EngineError::internal("rdb stream exhausted"))
    }
}

struct LoopbackNodeState {
    service: Weak<dyn PartitionService>,
    is_primary: bool,
    partitioned: bool,
    replicates_from: Option<String>,
}

/// Several engines joined into one in-process cluster.
pub struct LoopbackCluster {
    nodes: Mutex<BTreeMap<String, LoopbackNodeState>>,
}

impl Default for LoopbackCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackCluster {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a node and obtain its transport handle. The partition
    /// service is attached separately once the engine exists.
    pub fn join(self: &Arc<Self>, node_id: &str, is_primary: bool) -> Arc<LoopbackTransport> {
        self.nodes.lock().insert(
            node_id.to_string(),
            LoopbackNodeState {
                service: Weak::<NullService>::new(),
                is_primary,
                partitioned: false,
                replicates_from: None,
            },
        );
        Arc::new(LoopbackTransport {
            cluster: self.clone(),
            node_id: node_id.to_string(),
            slot_fingerprint: AtomicU64::new(0),
        })
    }

    pub fn attach_service(&self, node_id: &str, service: Arc<dyn PartitionService>) {
        if let Some(state) = self.nodes.lock().get_mut(node_id) {
            state.service = Arc::downgrade(&service);
        }
    }

    /// Make `replica_id` replay internal updates issued by `primary_id`.
    pub fn set_replica_of(&self, replica_id: &str, primary_id: &str) {
        let mut nodes = self.nodes.lock();
        if let Some(state) = nodes.get_mut(replica_id) {
            state.replicates_from = Some(primary_id.to_string());
            state.is_primary = false;
        }
    }

    /// Simulate a network partition around `node_id`.
    pub fn set_partitioned(&self, node_id: &str, partitioned: bool) {
        if let Some(state) = self.nodes.lock().get_mut(node_id) {
            state.partitioned = partitioned;
        }
    }

    fn service_of(&self, node_id: &str) -> Option<Arc<dyn PartitionService>> {
        self.nodes.lock().get(node_id)?.service.upgrade()
    }

    fn is_partitioned(&self, node_id: &str) -> bool {
        self.nodes
            .lock()
            .get(node_id)
            .is_some_and(|state| state.partitioned)
    }
}

struct NullService;

impl PartitionService for NullService {
    fn handle(&self, _request: PartitionRequest) -> PartitionResponse {
        PartitionResponse::Info(Default::default())
    }

    fn on_cluster_message(&self, _sender_id: &str, _payload: &[u8]) {}

    fn on_internal_update(&self, _encoded_id: &str, _entry: &[u8], _header: &[u8]) {}
}

/// Per-node transport handle into a [`LoopbackCluster`].
pub struct LoopbackTransport {
    cluster: Arc<LoopbackCluster>,
    node_id: String,
    slot_fingerprint: AtomicU64,
}

impl LoopbackTransport {
    pub fn set_slot_fingerprint(&self, fingerprint: u64) {
        self.slot_fingerprint.store(fingerprint, Ordering::Release);
    }
}

impl ClusterTransport for LoopbackTransport {
    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    fn is_primary(&self) -> bool {
        self.cluster
            .nodes
            .lock()
            .get(&self.node_id)
            .is_some_and(|state| state.is_primary)
    }

    fn broadcast(&self, payload: &[u8]) {
        if self.cluster.is_partitioned(&self.node_id) {
            return;
        }
        let targets: Vec<(String, Arc<dyn PartitionService>)> = {
            let nodes = self.cluster.nodes.lock();
            nodes
                .iter()
                .filter(|(id, state)| **id != self.node_id && !state.partitioned)
                .filter_map(|(id, state)| {
                    state.service.upgrade().map(|svc| (id.clone(), svc))
                })
                .collect()
        };
        for (_, service) in targets {
            service.on_cluster_message(&self.node_id, payload);
        }
    }

    fn unary(&self, target: &str, request: PartitionRequest) -> Result<PartitionResponse> {
        if self.cluster.is_partitioned(&self.node_id) || self.cluster.is_partitioned(target) {
            return Err(EngineError::unavailable(format!(
                "node {target} unreachable"
            )));
        }
        let service = self
            .cluster
            .service_of(target)
            .ok_or_else(|| EngineError::unavailable(format!("node {target} not registered")))?;
        Ok(service.handle(request))
    }

    fn targets(&self, mode: TargetMode) -> Vec<NodeInfo> {
        let nodes = self.cluster.nodes.lock();
        nodes
            .iter()
            .filter(|(_, state)| match mode {
                TargetMode::All => true,
                TargetMode::Primaries => state.is_primary,
            })
            .map(|(id, state)| NodeInfo {
                node_id: id.clone(),
                is_local: *id == self.node_id,
                is_primary: state.is_primary,
            })
            .collect()
    }

    fn replicate_internal_update(
        &self,
        encoded_id: &str,
        entry: &[u8],
        header: &[u8],
    ) -> Result<()> {
        let replicas: Vec<Arc<dyn PartitionService>> = {
            let nodes = self.cluster.nodes.lock();
            nodes
                .values()
                .filter(|state| state.replicates_from.as_deref() == Some(self.node_id.as_str()))
                .filter_map(|state| state.service.upgrade())
                .collect()
        };
        for replica in replicas {
            replica.on_internal_update(encoded_id, entry, header);
        }
        Ok(())
    }

    fn slot_fingerprint(&self) -> u64 {
        self.slot_fingerprint.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("node_id", &self.node_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_roundtrip_and_kind() {
        let host = MemoryHost::new();
        host.hash_set(0, b"doc:1", &[(b"n", b"1.5"), (b"title", b"abc")]);
        assert_eq!(host.record_kind(0, b"doc:1"), Some(RecordKind::Hash));
        assert_eq!(host.hash_field(0, b"doc:1", b"n").unwrap().as_ref(), b"1.5");
        assert!(host.hash_field(0, b"doc:1", b"missing").is_none());
        assert_eq!(host.db_size(0), 1);
    }

    #[test]
    fn json_path_resolution() {
        let host = MemoryHost::new();
        host.json_set(
            0,
            b"doc:2",
            json!({"title": "hello", "score": 1.5, "vec": [1.0, 2.0], "nested": {"tag": "a"}}),
        );
        assert_eq!(
            host.json_path(0, b"doc:2", "$.title").unwrap().as_ref(),
            b"hello"
        );
        assert_eq!(
            host.json_path(0, b"doc:2", "$.score").unwrap().as_ref(),
            b"1.5"
        );
        assert_eq!(
            host.json_path(0, b"doc:2", "$.vec").unwrap().as_ref(),
            b"[1.0,2.0]"
        );
        assert_eq!(
            host.json_path(0, b"doc:2", "$.nested.tag").unwrap().as_ref(),
            b"a"
        );
        assert_eq!(
            host.json_path(0, b"doc:2", "$.vec[1]").unwrap().as_ref(),
            b"2.0"
        );
        assert!(host.json_path(0, b"doc:2", "$.absent").is_none());
    }

    #[test]
    fn scan_visits_every_key_once() {
        let host = MemoryHost::new();
        for i in 0..10 {
            host.hash_set(0, format!("k{i}").as_bytes(), &[(b"f", b"v")]);
        }
        let mut cursor = ScanCursor::new();
        let mut seen = Vec::new();
        while host.scan_step(0, &mut cursor, &mut |key| seen.push(key.to_vec())) {}
        assert_eq!(seen.len(), 10);
        assert!(cursor.is_done());
    }

    #[test]
    fn events_reach_observers() {
        struct Recorder(Mutex<Vec<Vec<u8>>>);
        impl KeyspaceObserver for Recorder {
            fn on_key_event(&self, _db: DbIndex, key: &[u8]) {
                self.0.lock().push(key.to_vec());
            }
        }
        let host = MemoryHost::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let observer: Arc<dyn KeyspaceObserver> = recorder.clone();
        host.subscribe(&observer);
        host.hash_set(0, b"doc:1", &[(b"f", b"v")]);
        host.delete_key(0, b"doc:1");
        assert_eq!(recorder.0.lock().len(), 2);
    }

    #[test]
    fn multi_defers_events_until_exec() {
        struct Recorder(Mutex<Vec<bool>>, Arc<MemoryHost>);
        impl KeyspaceObserver for Recorder {
            fn on_key_event(&self, _db: DbIndex, _key: &[u8]) {
                self.0.lock().push(self.1.in_multi_exec());
            }
        }
        let host = Arc::new(MemoryHost::new());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new()), host.clone()));
        let observer: Arc<dyn KeyspaceObserver> = recorder.clone();
        host.subscribe(&observer);

        host.begin_multi();
        host.hash_set(0, b"doc:1", &[(b"f", b"v")]);
        host.hash_set(0, b"doc:2", &[(b"f", b"v")]);
        assert!(recorder.0.lock().is_empty());
        host.exec_multi();
        assert_eq!(recorder.0.lock().as_slice(), &[true, true]);
        assert!(!host.in_multi_exec());
    }

    #[test]
    fn loopback_unary_and_partition() {
        struct Echo;
        impl PartitionService for Echo {
            fn handle(&self, _req: PartitionRequest) -> PartitionResponse {
                PartitionResponse::Info(crate::wire::InfoIndexPartitionResponse {
                    exists: true,
                    ..Default::default()
                })
            }
            fn on_cluster_message(&self, _sender: &str, _payload: &[u8]) {}
            fn on_internal_update(&self, _id: &str, _entry: &[u8], _header: &[u8]) {}
        }

        let cluster = Arc::new(LoopbackCluster::new());
        let a = cluster.join("a", true);
        let _b = cluster.join("b", true);
        let echo: Arc<dyn PartitionService> = Arc::new(Echo);
        cluster.attach_service("b", echo.clone());

        let resp = a.unary("b", PartitionRequest::GetGlobalMetadata).unwrap();
        assert!(matches!(resp, PartitionResponse::Info(ref info) if info.exists));

        cluster.set_partitioned("b", true);
        assert!(a.unary("b", PartitionRequest::GetGlobalMetadata).is_err());
        cluster.set_partitioned("b", false);
        assert!(a.unary("b", PartitionRequest::GetGlobalMetadata).is_ok());

        assert_eq!(a.targets(TargetMode::Primaries).len(), 2);
    }
}
