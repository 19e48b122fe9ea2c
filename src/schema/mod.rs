//! Index schema runtime.
//!
//! An [`IndexSchema`] owns the attribute indexes for one registered index in
//! one database. It ingests keyspace notifications, deduplicates in-flight
//! mutations per key, applies them on the writer pool under the time-sliced
//! lock, backfills existing keys at low priority, and serializes itself into
//! RDB supplemental sections.

pub mod backfill;
pub mod mutations;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::externalizer::VectorExternalizer;
use crate::host::{DbIndex, RdbSink, RdbSource, RecordKind, SharedHost};
use crate::index::{
    AttributeIndex, DeletionKind, IndexDefinition, IndexKind, Key,
};
use crate::intern::{InternStore, StringCategory};
use crate::rdb::{
    read_supplemental_header, write_section_header, write_supplemental_header, ChunkedReader,
    ChunkedWriter, IndexExtension, RdbOptions, SectionHeader, SectionType, SupplementalHeader,
    SupplementalType,
};
use crate::timeslice::{TimeSliceConfig, TimeSlicedRwLock};
use crate::version::MODULE_VERSION;
use crate::workers::{Priority, WorkerPool};

use backfill::BackfillJob;
use mutations::{AttributeData, ConsumeResult, MutatedAttributes, MutationTable, TrackOutcome};

/// Hard cap on attributes per schema, enforced at parse time as well.
pub const MAX_ATTRIBUTES: usize = 50;

/// Serializable schema definition — what FT.CREATE produces and RDB stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaProto {
    pub name: String,
    pub db_num: DbIndex,
    pub data_type: RecordKind,
    /// Empty means every key in the database.
    pub key_prefixes: Vec<String>,
    pub attributes: Vec<AttributeProto>,
    /// Carried through saves so a reloaded index reports a stable count
    /// while its contents stream back in.
    pub documents_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeProto {
    pub alias: String,
    pub identifier: String,
    pub definition: IndexDefinition,
}

impl SchemaProto {
    /// Apply the derivations `create` performs (vector value encoding
    /// follows the record kind), so protos from different sources compare
    /// structurally.
    pub fn normalized(&self) -> SchemaProto {
        let mut proto = self.clone();
        for attr in &mut proto.attributes {
            if let IndexDefinition::Vector(params) = &mut attr.definition {
                params.json_encoded = proto.data_type == RecordKind::Json;
            }
        }
        proto
    }
}

/// A declared index field: user-facing alias, storage-facing identifier,
/// and the index capability behind them.
pub struct Attribute {
    alias: String,
    identifier: String,
    position: u16,
    index: Arc<AttributeIndex>,
}

impl Attribute {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn position(&self) -> u16 {
        self.position
    }

    pub fn index(&self) -> &Arc<AttributeIndex> {
        &self.index
    }
}

#[derive(Default)]
pub struct ResultCounters {
    pub success: AtomicU64,
    pub failure: AtomicU64,
    pub skipped: AtomicU64,
}

impl ResultCounters {
    fn record(&self, outcome: &Result<bool>) {
        match outcome {
            Ok(true) => self.success.fetch_add(1, Ordering::Relaxed),
            Ok(false) => self.skipped.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failure.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Live ingest statistics. `document_cnt` counts keys tracked by at least
/// one attribute; skipped adds surface as `hash_indexing_failures`.
#[derive(Default)]
pub struct SchemaStats {
    pub subscription_add: ResultCounters,
    pub subscription_modify: ResultCounters,
    pub subscription_remove: ResultCounters,
    pub document_cnt: AtomicU64,
    pub backfill_inqueue_tasks: AtomicU64,
    pub mutation_queue_size: AtomicU64,
    pub recent_queue_delay_secs: AtomicU64,
}

/// Flat snapshot served to FT.INFO and the info fanout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoPartitionData {
    pub num_docs: u64,
    pub num_records: u64,
    pub hash_indexing_failures: u64,
    pub backfill_scanned_count: u64,
    pub backfill_db_size: u64,
    pub backfill_inqueue_tasks: u64,
    pub backfill_complete_percent: f32,
    pub backfill_in_progress: bool,
    pub mutation_queue_size: u64,
    pub recent_mutations_queue_delay_secs: u64,
    pub state: String,
}

struct MultiQueue {
    keys: Vec<Key>,
    drain_scheduled: bool,
}

/// Runtime of one registered index.
pub struct IndexSchema {
    name: String,
    db_num: AtomicU32,
    data_type: RecordKind,
    key_prefixes: Vec<String>,
    attributes: HashMap<String, Attribute>,
    identifier_to_alias: HashMap<String, String>,
    host: SharedHost,
    intern: Arc<InternStore>,
    mutations_pool: Option<Arc<WorkerPool>>,
    time_sliced: TimeSlicedRwLock,
    mutated: Mutex<MutationTable>,
    multi: Mutex<MultiQueue>,
    key_registry: Mutex<HashSet<Key>>,
    backfill: Mutex<Option<BackfillJob>>,
    stats: SchemaStats,
    fingerprint: AtomicU64,
    version: AtomicU32,
    destructing: AtomicBool,
    loaded_v2: AtomicBool,
    block_clients: bool,
    externalizer: Mutex<Option<Arc<VectorExternalizer>>>,
    externalized_identifiers: HashSet<String>,
}

impl IndexSchema {
    /// Build a schema from its definition, validating attribute types
    /// against host capabilities. `start_backfill` is false when contents
    /// will stream in from an RDB load instead.
    pub fn create(
        proto: &SchemaProto,
        host: SharedHost,
        intern: Arc<InternStore>,
        mutations_pool: Option<Arc<WorkerPool>>,
        time_slice: TimeSliceConfig,
        block_clients: bool,
        start_backfill: bool,
    ) -> Result<Arc<Self>> {
        if proto.data_type == RecordKind::Json && !host.supports_json() {
            return Err(EngineError::invalid_argument(
                "index on JSON requires JSON support in the host",
            ));
        }
        if proto.attributes.is_empty() {
            return Err(EngineError::invalid_argument(
                "index must declare at least one attribute",
            ));
        }
        if proto.attributes.len() > MAX_ATTRIBUTES {
            return Err(EngineError::invalid_argument(format!(
                "too many attributes: {} > {MAX_ATTRIBUTES}",
                proto.attributes.len()
            )));
        }

        let mut attributes = HashMap::new();
        let mut identifier_to_alias = HashMap::new();
        let mut externalized_identifiers = HashSet::new();
        for (position, attr) in proto.attributes.iter().enumerate() {
            if attributes.contains_key(&attr.alias) {
                return Err(EngineError::already_exists(format!(
                    "duplicate attribute alias {}",
                    attr.alias
                )));
            }
            let mut definition = attr.definition.clone();
            if let IndexDefinition::Vector(params) = &mut definition {
                params.json_encoded = proto.data_type == RecordKind::Json;
                // Hash vectors qualify for externalization back into the
                // host record.
                if proto.data_type == RecordKind::Hash && host.supports_hash_string_ref() {
                    externalized_identifiers.insert(attr.identifier.clone());
                }
            }
            let index = Arc::new(definition.build(intern.clone()));
            identifier_to_alias.insert(attr.identifier.clone(), attr.alias.clone());
            attributes.insert(
                attr.alias.clone(),
                Attribute {
                    alias: attr.alias.clone(),
                    identifier: attr.identifier.clone(),
                    position: position as u16,
                    index,
                },
            );
        }

        let backfill = start_backfill.then(|| BackfillJob::new(host.db_size(proto.db_num)));
        let schema = Arc::new(Self {
            name: proto.name.clone(),
            db_num: AtomicU32::new(proto.db_num),
            data_type: proto.data_type,
            key_prefixes: proto.key_prefixes.clone(),
            attributes,
            identifier_to_alias,
            host,
            intern,
            mutations_pool,
            time_sliced: TimeSlicedRwLock::new(time_slice),
            mutated: Mutex::new(MutationTable::default()),
            multi: Mutex::new(MultiQueue {
                keys: Vec::new(),
                drain_scheduled: false,
            }),
            key_registry: Mutex::new(HashSet::new()),
            backfill: Mutex::new(backfill),
            stats: SchemaStats::default(),
            fingerprint: AtomicU64::new(0),
            version: AtomicU32::new(0),
            destructing: AtomicBool::new(false),
            loaded_v2: AtomicBool::new(false),
            block_clients,
            externalizer: Mutex::new(None),
            externalized_identifiers,
        });
        info!(
            index = schema.name,
            db = proto.db_num,
            attributes = schema.attributes.len(),
            backfill = start_backfill,
            "created index schema"
        );
        Ok(schema)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_num(&self) -> DbIndex {
        self.db_num.load(Ordering::Acquire)
    }

    pub fn data_type(&self) -> RecordKind {
        self.data_type
    }

    pub fn key_prefixes(&self) -> &[String] {
        &self.key_prefixes
    }

    /// Schema-constant reply score, distinct from per-hit distances.
    pub fn default_score(&self) -> f64 {
        1.0
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_fingerprint_version(&self, fingerprint: u64, version: u32) {
        self.fingerprint.store(fingerprint, Ordering::Release);
        self.version.store(version, Ordering::Release);
    }

    pub fn is_destructing(&self) -> bool {
        self.destructing.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &SchemaStats {
        &self.stats
    }

    pub fn time_slice(&self) -> &TimeSlicedRwLock {
        &self.time_sliced
    }

    pub fn attribute(&self, alias: &str) -> Option<&Attribute> {
        self.attributes.get(alias)
    }

    pub fn alias_for_identifier(&self, identifier: &str) -> Option<&str> {
        self.identifier_to_alias.get(identifier).map(String::as_str)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Snapshot of every key tracked by at least one attribute — the
    /// universal set for negation queries.
    pub fn key_universe(&self) -> Vec<Key> {
        self.key_registry.lock().iter().cloned().collect()
    }

    pub fn matches_key(&self, key: &[u8]) -> bool {
        self.key_prefixes.is_empty()
            || self
                .key_prefixes
                .iter()
                .any(|prefix| key.starts_with(prefix.as_bytes()))
    }

    pub fn subscribe_to_externalizer(&self, externalizer: Arc<VectorExternalizer>) {
        *self.externalizer.lock() = Some(externalizer);
    }

    // ── Ingest ──────────────────────────────────────────────────────────

    fn extract(&self, key: &[u8], identifier: &str) -> Option<Bytes> {
        match self.data_type {
            RecordKind::Hash => self.host.hash_field(self.db_num(), key, identifier.as_bytes()),
            RecordKind::Json => self.host.json_path(self.db_num(), key, identifier),
        }
    }

    fn is_tracked_by_any(&self, key: &Key) -> bool {
        self.attributes
            .values()
            .any(|attr| attr.index.is_tracked(key))
    }

    /// Keyspace notification entry point; also the backfill ingest path.
    pub fn process_keyspace_notification(self: &Arc<Self>, key_bytes: &[u8], from_backfill: bool) {
        if key_bytes.is_empty() || self.is_destructing() {
            return;
        }
        let right_type = self.host.record_kind(self.db_num(), key_bytes) == Some(self.data_type);
        let interned_key = self.intern.intern(key_bytes, StringCategory::Key);
        let mut mutated = MutatedAttributes::new();
        let mut added = false;
        for attribute in self.attributes.values() {
            if !right_type {
                // Key gone or wrong type: every attribute becomes a record
                // deletion.
                mutated.insert(
                    attribute.alias.clone(),
                    AttributeData::deletion(DeletionKind::Record),
                );
                added = true;
                continue;
            }
            let record = self.extract(key_bytes, &attribute.identifier);
            if record.is_none()
                && !self.is_tracked_by_any(&interned_key)
                && !self.mutated.lock().references(&interned_key)
            {
                // Nothing indexed, nothing pending: this notification does
                // not concern us.
                return;
            }
            match record {
                Some(data) => {
                    self.maybe_externalize(&interned_key, attribute, Some(&data));
                    mutated.insert(attribute.alias.clone(), AttributeData::value(data));
                }
                None => {
                    self.maybe_externalize(&interned_key, attribute, None);
                    mutated.insert(
                        attribute.alias.clone(),
                        AttributeData::deletion(DeletionKind::Field),
                    );
                }
            }
            added = true;
        }
        if !added {
            return;
        }
        match (self.data_type, from_backfill) {
            (RecordKind::Hash, true) => counter!("kvsearch_backfill_hash_keys").increment(1),
            (RecordKind::Hash, false) => counter!("kvsearch_ingest_hash_keys").increment(1),
            (RecordKind::Json, true) => counter!("kvsearch_backfill_json_keys").increment(1),
            (RecordKind::Json, false) => counter!("kvsearch_ingest_json_keys").increment(1),
        }
        self.process_mutation(mutated, interned_key, from_backfill);
    }

    fn maybe_externalize(&self, key: &Key, attribute: &Attribute, record: Option<&Bytes>) {
        if !self.externalized_identifiers.contains(&attribute.identifier) {
            return;
        }
        let Some(externalizer) = self.externalizer.lock().clone() else {
            return;
        };
        let Some(vector_index) = attribute.index.as_vector() else {
            return;
        };
        match record {
            Some(bytes) => externalizer.externalize(
                self.db_num(),
                key,
                &attribute.identifier,
                bytes,
                vector_index,
            ),
            None => externalizer.remove(self.db_num(), key, &attribute.identifier),
        }
    }

    fn process_mutation(self: &Arc<Self>, mutated: MutatedAttributes, key: Key, from_backfill: bool) {
        let Some(pool) = self.mutations_pool.clone().filter(|p| p.size() > 0) else {
            let mut bundle = mutated;
            self.sync_process_mutation(&mut bundle, &key);
            return;
        };
        let inside_multi = self.host.in_multi_exec();
        let block_client = self.block_clients && !inside_multi && !from_backfill;
        let blocked = block_client.then(|| self.host.block_client()).flatten();

        // Track before announcing to the MULTI queue: the drain may run
        // inline on hosts that execute run-on-main synchronously.
        let outcome = self
            .mutated
            .lock()
            .track(&key, mutated, from_backfill, blocked, inside_multi);
        if inside_multi {
            self.enqueue_multi_mutation(key, pool.size());
            return;
        }
        if outcome == TrackOutcome::Merged {
            // An in-flight consumer will re-read the merged bundle.
            return;
        }
        let priority = match outcome {
            TrackOutcome::Promoted => Priority::High,
            _ if from_backfill => Priority::Low,
            _ => Priority::High,
        };
        self.schedule_mutation(&pool, from_backfill, key, priority, None);
    }

    fn schedule_mutation(
        self: &Arc<Self>,
        pool: &Arc<WorkerPool>,
        from_backfill: bool,
        key: Key,
        priority: Priority,
        done: Option<crossbeam::sync::WaitGroup>,
    ) {
        self.stats.mutation_queue_size.fetch_add(1, Ordering::AcqRel);
        if from_backfill {
            self.stats
                .backfill_inqueue_tasks
                .fetch_add(1, Ordering::AcqRel);
        }
        let weak = Arc::downgrade(self);
        let enqueued = std::time::Instant::now();
        pool.schedule(
            priority,
            Box::new(move || {
                let _done = done;
                let Some(schema) = weak.upgrade() else {
                    return;
                };
                schema.process_single_mutation_async(from_backfill, &key, enqueued);
            }),
        );
    }

    fn process_single_mutation_async(
        self: &Arc<Self>,
        from_backfill: bool,
        key: &Key,
        enqueued: std::time::Instant,
    ) {
        let mut first_time = true;
        loop {
            let consumed = self.mutated.lock().consume(key, first_time);
            first_time = false;
            match consumed {
                ConsumeResult::Busy => break,
                ConsumeResult::Done(clients) => {
                    for client in clients {
                        self.host.unblock_client(client);
                    }
                    break;
                }
                ConsumeResult::Bundle(mut bundle) => {
                    self.sync_process_mutation(&mut bundle, key);
                }
            }
        }
        self.stats.mutation_queue_size.fetch_sub(1, Ordering::AcqRel);
        if from_backfill {
            self.stats
                .backfill_inqueue_tasks
                .fetch_sub(1, Ordering::AcqRel);
        }
        self.stats
            .recent_queue_delay_secs
            .store(enqueued.elapsed().as_secs(), Ordering::Relaxed);
    }

    /// Apply one bundle under the write side of the time-sliced lock.
    pub(crate) fn sync_process_mutation(&self, bundle: &mut MutatedAttributes, key: &Key) {
        let _writer = self.time_sliced.write();
        for (alias, data) in bundle.drain() {
            let Some(attribute) = self.attributes.get(&alias) else {
                continue;
            };
            self.process_attribute_mutation(attribute, key, data);
        }
    }

    fn process_attribute_mutation(&self, attribute: &Attribute, key: &Key, data: AttributeData) {
        let index = &attribute.index;
        match data.data {
            Some(bytes) => {
                if index.is_tracked(key) {
                    let result = index.modify_record(key, &bytes);
                    self.track_result(&result, "modify", &self.stats.subscription_modify);
                    // A payload gone ill-typed drops the record from this
                    // index; keep the registry in step when that was its
                    // last one.
                    if matches!(result, Ok(false))
                        && !index.is_tracked(key)
                        && !self.is_tracked_by_any(key)
                        && self.key_registry.lock().remove(key)
                    {
                        self.stats.document_cnt.fetch_sub(1, Ordering::AcqRel);
                    }
                    return;
                }
                let result = index.add_record(key, &bytes);
                self.track_result(&result, "add", &self.stats.subscription_add);
                if matches!(result, Ok(true)) {
                    if self.key_registry.lock().insert(key.clone()) {
                        self.stats.document_cnt.fetch_add(1, Ordering::AcqRel);
                    }
                    match index.kind() {
                        IndexKind::VectorHnsw | IndexKind::VectorFlat => {
                            counter!("kvsearch_ingest_field_vector").increment(1)
                        }
                        IndexKind::Numeric => {
                            counter!("kvsearch_ingest_field_numeric").increment(1)
                        }
                        IndexKind::Tag => counter!("kvsearch_ingest_field_tag").increment(1),
                        IndexKind::Text => counter!("kvsearch_ingest_field_text").increment(1),
                    }
                }
            }
            None => {
                let result = index.remove_record(key, data.deletion);
                self.track_result(&result, "remove", &self.stats.subscription_remove);
                if matches!(result, Ok(true)) && !self.is_tracked_by_any(key) {
                    if self.key_registry.lock().remove(key) {
                        self.stats.document_cnt.fetch_sub(1, Ordering::AcqRel);
                    }
                }
            }
        }
    }

    fn track_result(&self, result: &Result<bool>, op: &'static str, counters: &ResultCounters) {
        counters.record(result);
        if let Err(err) = result {
            warn!(index = self.name, op, error = %err, "index mutation failed");
        }
    }

    // ── MULTI/EXEC ──────────────────────────────────────────────────────

    fn enqueue_multi_mutation(self: &Arc<Self>, key: Key, pool_width: usize) {
        let mut multi = self.multi.lock();
        multi.keys.push(key);
        if multi.keys.len() >= pool_width && !multi.drain_scheduled {
            multi.drain_scheduled = true;
            let weak = Arc::downgrade(self);
            self.host.run_on_main(Box::new(move || {
                if let Some(schema) = weak.upgrade() {
                    schema.process_multi_queue();
                }
            }));
        }
    }

    /// Drain the MULTI side queue under one writer-slice acquisition so a
    /// concurrent reader observes the whole transaction or none of it.
    /// Called lazily before queries and once the queue exceeds the pool
    /// width.
    pub fn process_multi_queue(self: &Arc<Self>) {
        let keys: Vec<Key> = {
            let mut multi = self.multi.lock();
            multi.drain_scheduled = false;
            std::mem::take(&mut multi.keys)
        };
        if keys.is_empty() {
            return;
        }
        counter!("kvsearch_ingest_batches").increment(1);
        let Some(pool) = self.mutations_pool.clone().filter(|p| p.size() > 0) else {
            for key in keys {
                let mut first = true;
                loop {
                    let consumed = self.mutated.lock().consume(&key, first);
                    first = false;
                    match consumed {
                        ConsumeResult::Bundle(mut bundle) => {
                            self.sync_process_mutation(&mut bundle, &key)
                        }
                        ConsumeResult::Busy => break,
                        ConsumeResult::Done(clients) => {
                            for client in clients {
                                self.host.unblock_client(client);
                            }
                            break;
                        }
                    }
                }
            }
            return;
        };
        // Hold the write slice across the whole drain: workers join the
        // held side, and readers see the transaction whole or not at all.
        let wait = crossbeam::sync::WaitGroup::new();
        let _writer = self.time_sliced.write();
        for key in keys {
            self.schedule_mutation(&pool, false, key, Priority::Max, Some(wait.clone()));
        }
        wait.wait();
    }

    // ── Backfill ────────────────────────────────────────────────────────

    /// Advance the backfill scan by up to `batch_size` keys. Returns the
    /// number of keys scanned this call.
    pub fn perform_backfill(self: &Arc<Self>, batch_size: u32) -> u32 {
        let mut guard = self.backfill.lock();
        let Some(job) = guard.as_mut() else {
            return 0;
        };
        if job.scan_done {
            return 0;
        }
        job.paused_by_oom = false;
        job.observe_db_size(self.host.db_size(self.db_num()));

        let mut scanned: u32 = 0;
        loop {
            // Re-sample the OOM flag every step; a single reading is not to
            // be trusted.
            if self.host.is_oom() {
                job.paused_by_oom = true;
                debug!(index = self.name, "backfill paused by host OOM");
                return 0;
            }
            let mut visited: Vec<Vec<u8>> = Vec::new();
            let more = self.host.scan_step(self.db_num(), &mut job.cursor, &mut |key| {
                visited.push(key.to_vec());
            });
            job.scanned_key_count += visited.len() as u64;
            scanned += visited.len() as u32;
            // Route matches through the ingest path before advancing, so a
            // pause never drops scanned keys.
            for key in visited {
                if self.matches_key(&key) {
                    self.process_keyspace_notification(&key, true);
                }
            }
            if !more {
                info!(
                    index = self.name,
                    scanned = job.scanned_key_count,
                    elapsed_ms = job.started.elapsed().as_millis() as u64,
                    "backfill scan finished"
                );
                job.mark_scan_done();
                break;
            }
            if scanned >= batch_size {
                break;
            }
        }
        scanned
    }

    pub fn is_backfill_in_progress(&self) -> bool {
        let guard = self.backfill.lock();
        match guard.as_ref() {
            Some(job) => {
                !job.scan_done || self.stats.backfill_inqueue_tasks.load(Ordering::Acquire) > 0
            }
            None => false,
        }
    }

    pub fn backfill_percent(&self) -> f32 {
        let guard = self.backfill.lock();
        match guard.as_ref() {
            Some(job) if self.is_backfill_in_progress_inner(job) => {
                job.percent(self.stats.backfill_inqueue_tasks.load(Ordering::Acquire))
            }
            _ => 1.0,
        }
    }

    fn is_backfill_in_progress_inner(&self, job: &BackfillJob) -> bool {
        !job.scan_done || self.stats.backfill_inqueue_tasks.load(Ordering::Acquire) > 0
    }

    pub fn backfill_scanned_key_count(&self) -> u64 {
        self.backfill
            .lock()
            .as_ref()
            .map_or(0, |job| job.scanned_key_count)
    }

    pub fn backfill_db_size(&self) -> u64 {
        self.backfill.lock().as_ref().map_or(0, |job| job.db_size)
    }

    pub fn state_for_info(&self) -> &'static str {
        let guard = self.backfill.lock();
        match guard.as_ref() {
            Some(job) if self.is_backfill_in_progress_inner(job) => {
                if job.paused_by_oom {
                    "backfill_paused_by_oom"
                } else {
                    "backfill_in_progress"
                }
            }
            _ => "ready",
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Detach from ingest: stop the backfill scan, drop pending mutations,
    /// release parked clients, and flag background workers off.
    pub fn mark_as_destructing(&self) {
        self.destructing.store(true, Ordering::Release);
        if let Some(job) = self.backfill.lock().as_mut() {
            job.mark_scan_done();
        }
        let clients = self.mutated.lock().clear();
        for client in clients {
            self.host.unblock_client(client);
        }
        info!(index = self.name, "index schema marked destructing");
    }

    /// FLUSHDB dropped every key without per-key events: enqueue record
    /// deletions for everything currently tracked.
    pub fn on_flush_db(self: &Arc<Self>) {
        let keys = self.key_universe();
        if keys.is_empty() {
            return;
        }
        info!(index = self.name, keys = keys.len(), "flushing tracked keys");
        for key in keys {
            let mut bundle = MutatedAttributes::new();
            for attribute in self.attributes.values() {
                bundle.insert(
                    attribute.alias.clone(),
                    AttributeData::deletion(DeletionKind::Record),
                );
            }
            self.process_mutation(bundle, key, true);
        }
    }

    /// SWAPDB: remap our database number; the backfill cursor re-targets on
    /// its next step since scans always address the current `db_num`.
    pub fn on_swap_db(&self, first: DbIndex, second: DbIndex) {
        let current = self.db_num();
        if current == first {
            self.db_num.store(second, Ordering::Release);
        } else if current == second {
            self.db_num.store(first, Ordering::Release);
        }
    }

    /// After a v1 RDB load the mutation queue was not persisted, so record
    /// deletions that raced the snapshot are lost. Walk every tracked key
    /// and enqueue deletions for those gone from the host.
    pub fn on_loading_ended(self: &Arc<Self>) {
        if self.loaded_v2.load(Ordering::Acquire) {
            debug!(
                index = self.name,
                pending = self.mutated.lock().len(),
                "v2 load complete; queue restored exactly"
            );
            return;
        }
        let mut stale: HashSet<Key> = HashSet::new();
        for attribute in self.attributes.values() {
            attribute.index.for_each_tracked_key(&mut |key| {
                if !self.host.key_exists(self.db_num(), key.as_bytes()) {
                    stale.insert(key.clone());
                }
            });
        }
        if stale.is_empty() {
            return;
        }
        info!(
            index = self.name,
            stale = stale.len(),
            "reconciling deletions lost during snapshot"
        );
        for key in stale {
            let mut bundle = MutatedAttributes::new();
            for attribute in self.attributes.values() {
                bundle.insert(
                    attribute.alias.clone(),
                    AttributeData::deletion(DeletionKind::Record),
                );
            }
            self.process_mutation(bundle, key, true);
        }
    }

    pub fn pending_mutation_count(&self) -> usize {
        self.mutated.lock().len()
    }

    // ── Info ────────────────────────────────────────────────────────────

    pub fn count_records(&self) -> u64 {
        self.attributes
            .values()
            .map(|attr| attr.index.tracked_key_count())
            .sum()
    }

    pub fn info_partition_data(&self) -> InfoPartitionData {
        let queue_size = self.stats.mutation_queue_size.load(Ordering::Acquire);
        InfoPartitionData {
            num_docs: self.stats.document_cnt.load(Ordering::Acquire),
            num_records: self.count_records(),
            hash_indexing_failures: self.stats.subscription_add.skipped.load(Ordering::Acquire),
            backfill_scanned_count: self.backfill_scanned_key_count(),
            backfill_db_size: self.backfill_db_size(),
            backfill_inqueue_tasks: self.stats.backfill_inqueue_tasks.load(Ordering::Acquire),
            backfill_complete_percent: self.backfill_percent(),
            backfill_in_progress: self.is_backfill_in_progress(),
            mutation_queue_size: queue_size,
            recent_mutations_queue_delay_secs: if queue_size > 0 {
                self.stats.recent_queue_delay_secs.load(Ordering::Acquire)
            } else {
                0
            },
            state: self.state_for_info().to_string(),
        }
    }

    // ── RDB ─────────────────────────────────────────────────────────────

    pub fn to_proto(&self) -> SchemaProto {
        let mut attributes: Vec<&Attribute> = self.attributes.values().collect();
        attributes.sort_by_key(|attr| attr.position);
        SchemaProto {
            name: self.name.clone(),
            db_num: self.db_num(),
            data_type: self.data_type,
            key_prefixes: self.key_prefixes.clone(),
            attributes: attributes
                .into_iter()
                .map(|attr| AttributeProto {
                    alias: attr.alias.clone(),
                    identifier: attr.identifier.clone(),
                    definition: self.definition_of(attr),
                })
                .collect(),
            documents_count: self.stats.document_cnt.load(Ordering::Acquire),
        }
    }

    fn definition_of(&self, attr: &Attribute) -> IndexDefinition {
        match attr.index.as_ref() {
            AttributeIndex::Numeric(_) => IndexDefinition::Numeric,
            AttributeIndex::Tag(index) => IndexDefinition::Tag(index.options()),
            AttributeIndex::Text(index) => IndexDefinition::Text(index.options().clone()),
            AttributeIndex::Vector(index) => IndexDefinition::Vector(*index.params()),
        }
    }

    pub fn rdb_save(&self, sink: &mut dyn RdbSink, options: &RdbOptions) -> Result<()> {
        let vector_attrs = self
            .attributes
            .values()
            .filter(|a| a.index.kind().is_vector())
            .count();
        let supplemental_count =
            self.attributes.len() + vector_attrs + usize::from(options.write_v2);

        let mut out = ChunkedWriter::with_validation(sink, options.validate_on_write);
        write_section_header(
            &mut out,
            &SectionHeader {
                section_type: SectionType::IndexSchema,
                supplemental_count: supplemental_count as u32,
                min_version: MODULE_VERSION.to_int(),
            },
        )?;
        out.write_value(&self.to_proto())?;

        let mut ordered: Vec<&Attribute> = self.attributes.values().collect();
        ordered.sort_by_key(|attr| attr.position);
        for attribute in &ordered {
            write_supplemental_header(
                &mut out,
                &SupplementalHeader {
                    content_type: SupplementalType::IndexContent,
                    attribute: attribute.alias.clone(),
                },
            )?;
            attribute.index.save_content(&mut out)?;
        }
        for attribute in &ordered {
            let Some(vector) = attribute.index.as_vector() else {
                continue;
            };
            write_supplemental_header(
                &mut out,
                &SupplementalHeader {
                    content_type: SupplementalType::KeyToIdMap,
                    attribute: attribute.alias.clone(),
                },
            )?;
            vector.save_key_map(&mut out)?;
        }
        if options.write_v2 {
            write_supplemental_header(
                &mut out,
                &SupplementalHeader {
                    content_type: SupplementalType::IndexExtension,
                    attribute: String::new(),
                },
            )?;
            let extension = IndexExtension {
                tracked_keys: self
                    .key_registry
                    .lock()
                    .iter()
                    .map(|key| key.as_bytes().to_vec())
                    .collect(),
                pending_mutation_keys: self
                    .mutated
                    .lock()
                    .pending_keys()
                    .iter()
                    .map(|key| key.as_bytes().to_vec())
                    .collect(),
                backfilling: self.is_backfill_in_progress(),
            };
            out.write_value(&extension)?;
        }
        Ok(())
    }

    /// Rebuild a schema from an RDB section. The section header must have
    /// been consumed already (the registry dispatches on it).
    pub fn load_from_rdb(
        header: &SectionHeader,
        source: &mut dyn RdbSource,
        host: SharedHost,
        intern: Arc<InternStore>,
        mutations_pool: Option<Arc<WorkerPool>>,
        time_slice: TimeSliceConfig,
        block_clients: bool,
        options: &RdbOptions,
    ) -> Result<Arc<Self>> {
        if header.section_type != SectionType::IndexSchema {
            return Err(EngineError::internal(
                "index schema loader fed a non-schema section",
            ));
        }
        if header.min_version > MODULE_VERSION.to_int() {
            return Err(EngineError::failed_precondition(format!(
                "RDB section requires module version {} but this is {}",
                header.min_version,
                MODULE_VERSION.to_int()
            )));
        }
        let mut input = ChunkedReader::new(source);
        let proto: SchemaProto = input.read_value()?;
        let schema = Self::create(
            &proto,
            host,
            intern.clone(),
            mutations_pool,
            time_slice,
            block_clients,
            // Contents stream in below; backfill only if requested by the
            // extension or when contents are skipped.
            options.skip_index_load,
        )?;
        schema
            .stats
            .document_cnt
            .store(proto.documents_count, Ordering::Release);

        let mut vector_contents: HashMap<String, Vec<(usize, Vec<f32>)>> = HashMap::new();
        let mut extension: Option<IndexExtension> = None;
        for _ in 0..header.supplemental_count {
            let supplemental = read_supplemental_header(&mut input)?;
            match supplemental.content_type {
                SupplementalType::IndexContent => {
                    if options.skip_index_load {
                        input.read_blob()?;
                        continue;
                    }
                    let attribute = schema
                        .attributes
                        .get(&supplemental.attribute)
                        .ok_or_else(|| {
                            EngineError::internal(format!(
                                "content block for unknown attribute {}",
                                supplemental.attribute
                            ))
                        })?;
                    let loaded = attribute.index.load_content(&mut input, |bytes| {
                        intern.intern(bytes, StringCategory::Key)
                    })?;
                    if let Some(content) = loaded {
                        vector_contents.insert(supplemental.attribute.clone(), content);
                    }
                }
                SupplementalType::KeyToIdMap => {
                    if options.skip_index_load {
                        input.read_blob()?;
                        continue;
                    }
                    let attribute = schema
                        .attributes
                        .get(&supplemental.attribute)
                        .ok_or_else(|| {
                            EngineError::internal(format!(
                                "key map for unknown attribute {}",
                                supplemental.attribute
                            ))
                        })?;
                    let vector = attribute.index.as_vector().ok_or_else(|| {
                        EngineError::internal("key map block on a non-vector attribute")
                    })?;
                    let content = vector_contents
                        .remove(&supplemental.attribute)
                        .unwrap_or_default();
                    vector.load_key_map(&mut input, content, |bytes| {
                        intern.intern(bytes, StringCategory::Key)
                    })?;
                }
                SupplementalType::IndexExtension => {
                    let ext: IndexExtension = input.read_value()?;
                    if options.read_v2 {
                        extension = Some(ext);
                    }
                }
            }
        }

        if !options.skip_index_load {
            // Rebuild the key registry and exact document count from the
            // loaded indexes.
            let mut registry = HashSet::new();
            for attribute in schema.attributes.values() {
                attribute
                    .index
                    .for_each_tracked_key(&mut |key| {
                        registry.insert(key.clone());
                    });
            }
            schema
                .stats
                .document_cnt
                .store(registry.len() as u64, Ordering::Release);
            *schema.key_registry.lock() = registry;
        }

        if let Some(extension) = extension {
            schema.loaded_v2.store(true, Ordering::Release);
            if extension.backfilling && !options.skip_index_load {
                *schema.backfill.lock() = Some(BackfillJob::new(
                    schema.host.db_size(schema.db_num()),
                ));
            }
            for key_bytes in extension.pending_mutation_keys {
                // Replay dropped in-flight work through the normal path.
                schema.process_keyspace_notification(&key_bytes, true);
            }
        }
        Ok(schema)
    }
}
