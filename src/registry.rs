//! Process-wide schema registry.
//!
//! The [`SchemaManager`] owns every live [`IndexSchema`] keyed by
//! `(db_num, name)`. It is the keyspace-event observer for the whole engine
//! (routing events by database and prefix), the RDB orchestration point for
//! schema sections, and — in cluster mode — the application target for
//! reconciled metadata entries: creates, updates, and drops all flow through
//! [`SchemaManager::apply_metadata_entry`] so a local FT.CREATE and a
//! reconciled remote one take the same path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::externalizer::VectorExternalizer;
use crate::host::{DbIndex, KeyspaceObserver, RdbSink, RdbSource, SharedHost};
use crate::intern::InternStore;
use crate::rdb::{RdbOptions, SectionHeader};
use crate::schema::{IndexSchema, SchemaProto};
use crate::timeslice::TimeSliceConfig;
use crate::wire;
use crate::workers::WorkerPool;

/// Metadata type name under which schemas replicate.
pub const SCHEMA_METADATA_TYPE: &str = "index_schema";

/// Construction-time knobs for the registry.
#[derive(Clone)]
pub struct SchemaManagerOptions {
    pub max_indexes_per_db: usize,
    pub block_client_on_mutation: bool,
    pub time_slice: TimeSliceConfig,
    pub rdb: RdbOptions,
    pub stop_backfill: bool,
}

impl Default for SchemaManagerOptions {
    fn default() -> Self {
        Self {
            max_indexes_per_db: 16,
            block_client_on_mutation: false,
            time_slice: TimeSliceConfig::default(),
            rdb: RdbOptions::default(),
            stop_backfill: false,
        }
    }
}

pub struct SchemaManager {
    host: SharedHost,
    intern: Arc<InternStore>,
    mutations_pool: Option<Arc<WorkerPool>>,
    externalizer: Arc<VectorExternalizer>,
    options: SchemaManagerOptions,
    schemas: Mutex<HashMap<(DbIndex, String), Arc<IndexSchema>>>,
    backfill_cursor: AtomicUsize,
    loading: AtomicBool,
    staged_events: Mutex<Vec<(DbIndex, Vec<u8>)>>,
    stop_backfill: AtomicBool,
}

impl SchemaManager {
    pub fn new(
        host: SharedHost,
        intern: Arc<InternStore>,
        mutations_pool: Option<Arc<WorkerPool>>,
        options: SchemaManagerOptions,
    ) -> Arc<Self> {
        let externalizer = VectorExternalizer::new(host.clone());
        let stop_backfill = options.stop_backfill;
        Arc::new(Self {
            host,
            intern,
            mutations_pool,
            externalizer,
            options,
            schemas: Mutex::new(HashMap::new()),
            backfill_cursor: AtomicUsize::new(0),
            loading: AtomicBool::new(false),
            staged_events: Mutex::new(Vec::new()),
            stop_backfill: AtomicBool::new(stop_backfill),
        })
    }

    pub fn externalizer(&self) -> &Arc<VectorExternalizer> {
        &self.externalizer
    }

    pub fn intern_store(&self) -> &Arc<InternStore> {
        &self.intern
    }

    /// Wait for every queued mutation to apply. Test and shutdown helper.
    pub fn quiesce(&self) {
        if let Some(pool) = &self.mutations_pool {
            pool.drain();
        }
    }

    /// Feature flag: halt backfill ticks without touching job state.
    pub fn set_stop_backfill(&self, stop: bool) {
        self.stop_backfill.store(stop, Ordering::Release);
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(EngineError::invalid_argument("index name must not be empty"));
        }
        if name.contains('{') || name.contains('}') {
            return Err(EngineError::invalid_argument(
                "index name must not contain a hash tag",
            ));
        }
        Ok(())
    }

    /// Validate and construct a schema locally. The caller (engine facade)
    /// registers the definition with the metadata manager when clustered;
    /// this path is also the metadata update-callback target, so both ends
    /// converge here.
    pub fn create_index_schema(&self, proto: &SchemaProto) -> Result<Arc<IndexSchema>> {
        Self::validate_name(&proto.name)?;
        for prefix in &proto.key_prefixes {
            if prefix.contains('{') || prefix.contains('}') {
                return Err(EngineError::invalid_argument(
                    "key prefix must not contain a hash tag",
                ));
            }
        }
        let mut schemas = self.schemas.lock();
        let slot = (proto.db_num, proto.name.clone());
        if schemas.contains_key(&slot) {
            return Err(EngineError::already_exists(format!(
                "index {} already exists",
                proto.name
            )));
        }
        let in_db = schemas
            .keys()
            .filter(|(db, _)| *db == proto.db_num)
            .count();
        if in_db >= self.options.max_indexes_per_db {
            return Err(EngineError::out_of_range(format!(
                "index limit reached for db {} ({} max)",
                proto.db_num, self.options.max_indexes_per_db
            )));
        }
        let schema = IndexSchema::create(
            proto,
            self.host.clone(),
            self.intern.clone(),
            self.mutations_pool.clone(),
            self.options.time_slice,
            self.options.block_client_on_mutation,
            true,
        )?;
        schema.subscribe_to_externalizer(self.externalizer.clone());
        schemas.insert(slot, schema.clone());
        Ok(schema)
    }

    /// Drop a schema: release externalized vectors, detach from events,
    /// erase. Metadata deregistration happens in the engine facade.
    pub fn remove_index_schema(&self, db_num: DbIndex, name: &str) -> Result<()> {
        let Some(schema) = self.schemas.lock().remove(&(db_num, name.to_string())) else {
            return Err(EngineError::not_found(format!("index {name} not found")));
        };
        let identifiers: Vec<String> = schema
            .attributes()
            .map(|attr| attr.identifier().to_string())
            .collect();
        self.externalizer.release_schema(db_num, &identifiers);
        schema.mark_as_destructing();
        info!(index = name, db = db_num, "removed index schema");
        Ok(())
    }

    pub fn get_index_schema(&self, db_num: DbIndex, name: &str) -> Result<Arc<IndexSchema>> {
        self.schemas
            .lock()
            .get(&(db_num, name.to_string()))
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("index {name} not found")))
    }

    pub fn schema_count(&self) -> usize {
        self.schemas.lock().len()
    }

    pub fn schemas_in_db(&self, db_num: DbIndex) -> Vec<Arc<IndexSchema>> {
        self.schemas
            .lock()
            .iter()
            .filter(|((db, _), _)| *db == db_num)
            .map(|(_, schema)| schema.clone())
            .collect()
    }

    pub fn all_schemas(&self) -> Vec<Arc<IndexSchema>> {
        self.schemas.lock().values().cloned().collect()
    }

    // ── Metadata application ────────────────────────────────────────────

    /// Apply a reconciled metadata entry: `Some` content creates or updates
    /// the schema, `None` drops it. Fingerprint and version stamp onto the
    /// schema so consistency checks can compare cheaply.
    pub fn apply_metadata_entry(
        &self,
        db_num: DbIndex,
        name: &str,
        content: Option<&[u8]>,
        fingerprint: u64,
        version: u32,
    ) -> Result<()> {
        match content {
            Some(bytes) => {
                let proto: SchemaProto = wire::decode::<SchemaProto>(bytes)?.normalized();
                let existing = self.schemas.lock().get(&(db_num, name.to_string())).cloned();
                match existing {
                    Some(schema) if schema.to_proto().normalized().attributes == proto.attributes => {
                        schema.set_fingerprint_version(fingerprint, version);
                        Ok(())
                    }
                    Some(_) => {
                        // Definition changed under the same name: rebuild.
                        warn!(index = name, "reconciled definition differs; rebuilding");
                        self.remove_index_schema(db_num, name)?;
                        let schema = self.create_index_schema(&proto)?;
                        schema.set_fingerprint_version(fingerprint, version);
                        Ok(())
                    }
                    None => {
                        let schema = self.create_index_schema(&proto)?;
                        schema.set_fingerprint_version(fingerprint, version);
                        Ok(())
                    }
                }
            }
            None => match self.remove_index_schema(db_num, name) {
                Ok(()) | Err(EngineError::NotFound(_)) => Ok(()),
                Err(err) => Err(err),
            },
        }
    }

    /// Stamp fingerprints/versions onto loaded schemas (end of RDB load).
    pub fn populate_fingerprint_version(
        &self,
        db_num: DbIndex,
        name: &str,
        fingerprint: u64,
        version: u32,
    ) {
        if let Ok(schema) = self.get_index_schema(db_num, name) {
            schema.set_fingerprint_version(fingerprint, version);
        }
    }

    // ── Host lifecycle propagation ──────────────────────────────────────

    pub fn on_flush_db(&self, db_num: DbIndex) {
        for schema in self.schemas_in_db(db_num) {
            schema.on_flush_db();
        }
    }

    pub fn on_swap_db(&self, first: DbIndex, second: DbIndex) {
        let mut schemas = self.schemas.lock();
        let moved: Vec<((DbIndex, String), Arc<IndexSchema>)> = schemas
            .iter()
            .filter(|((db, _), _)| *db == first || *db == second)
            .map(|(slot, schema)| (slot.clone(), schema.clone()))
            .collect();
        for (slot, schema) in moved {
            schemas.remove(&slot);
            schema.on_swap_db(first, second);
            schemas.insert((schema.db_num(), slot.1), schema);
        }
    }

    pub fn on_loading_started(&self) {
        self.loading.store(true, Ordering::Release);
        if let Some(pool) = &self.mutations_pool {
            pool.suspend();
        }
    }

    pub fn on_loading_ended(&self) {
        self.loading.store(false, Ordering::Release);
        if let Some(pool) = &self.mutations_pool {
            pool.resume();
        }
        // Replay events staged while the snapshot streamed in.
        let staged: Vec<(DbIndex, Vec<u8>)> = self.staged_events.lock().drain(..).collect();
        for (db, key) in staged {
            self.dispatch_event(db, &key);
        }
        for schema in self.all_schemas() {
            schema.on_loading_ended();
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    // ── Backfill ────────────────────────────────────────────────────────

    /// One backfill tick: round-robin `batch_size` keys across schemas,
    /// starting after the schema served last tick.
    pub fn perform_backfill(&self, batch_size: u32) -> u32 {
        if self.stop_backfill.load(Ordering::Acquire) {
            return 0;
        }
        let schemas = self.all_schemas();
        if schemas.is_empty() {
            return 0;
        }
        let start = self.backfill_cursor.fetch_add(1, Ordering::Relaxed) % schemas.len();
        let mut remaining = batch_size;
        let mut total = 0;
        for offset in 0..schemas.len() {
            if remaining == 0 {
                break;
            }
            let schema = &schemas[(start + offset) % schemas.len()];
            let scanned = schema.perform_backfill(remaining);
            total += scanned;
            remaining = remaining.saturating_sub(scanned);
        }
        total
    }

    // ── Event routing ───────────────────────────────────────────────────

    fn dispatch_event(&self, db: DbIndex, key: &[u8]) {
        let schemas = self.schemas_in_db(db);
        for schema in schemas {
            if schema.matches_key(key) {
                schema.process_keyspace_notification(key, false);
            }
        }
    }

    // ── RDB ─────────────────────────────────────────────────────────────

    /// Save every schema as its own section. Returns the section count.
    pub fn rdb_save_all(&self, sink: &mut dyn RdbSink) -> Result<usize> {
        let schemas = self.all_schemas();
        for schema in &schemas {
            schema.rdb_save(sink, &self.options.rdb)?;
        }
        Ok(schemas.len())
    }

    /// Load one schema section (header already consumed) and register it.
    pub fn rdb_load_section(
        &self,
        header: &SectionHeader,
        source: &mut dyn RdbSource,
    ) -> Result<Arc<IndexSchema>> {
        let schema = IndexSchema::load_from_rdb(
            header,
            source,
            self.host.clone(),
            self.intern.clone(),
            self.mutations_pool.clone(),
            self.options.time_slice,
            self.options.block_client_on_mutation,
            &self.options.rdb,
        )?;
        schema.subscribe_to_externalizer(self.externalizer.clone());
        let slot = (schema.db_num(), schema.name().to_string());
        let mut schemas = self.schemas.lock();
        if schemas.contains_key(&slot) {
            return Err(EngineError::already_exists(format!(
                "duplicate schema section for {}",
                schema.name()
            )));
        }
        schemas.insert(slot, schema.clone());
        Ok(schema)
    }
}

impl KeyspaceObserver for SchemaManager {
    fn on_key_event(&self, db: DbIndex, key: &[u8]) {
        if self.is_loading() {
            // Applied on loading-ended so intermediate states stay hidden.
            self.staged_events.lock().push((db, key.to_vec()));
            return;
        }
        self.dispatch_event(db, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;
    use crate::host::RecordKind;
    use crate::index::{IndexDefinition, TagOptions};
    use crate::schema::AttributeProto;

    fn proto(name: &str, db: DbIndex) -> SchemaProto {
        SchemaProto {
            name: name.into(),
            db_num: db,
            data_type: RecordKind::Hash,
            key_prefixes: vec!["doc:".into()],
            attributes: vec![AttributeProto {
                alias: "n".into(),
                identifier: "n".into(),
                definition: IndexDefinition::Numeric,
            }],
            documents_count: 0,
        }
    }

    fn manager(host: Arc<MemoryHost>) -> Arc<SchemaManager> {
        SchemaManager::new(
            host,
            Arc::new(InternStore::new()),
            None,
            SchemaManagerOptions::default(),
        )
    }

    #[test]
    fn create_get_remove() {
        let host = Arc::new(MemoryHost::new());
        let manager = manager(host);
        manager.create_index_schema(&proto("idx", 0)).unwrap();
        assert!(manager.get_index_schema(0, "idx").is_ok());
        assert!(matches!(
            manager.create_index_schema(&proto("idx", 0)),
            Err(EngineError::AlreadyExists(_))
        ));
        manager.remove_index_schema(0, "idx").unwrap();
        assert!(matches!(
            manager.get_index_schema(0, "idx"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn rejects_hash_tag_names_and_prefixes() {
        let host = Arc::new(MemoryHost::new());
        let manager = manager(host);
        assert!(manager.create_index_schema(&proto("bad{tag}", 0)).is_err());
        let mut bad_prefix = proto("idx", 0);
        bad_prefix.key_prefixes = vec!["doc{0}:".into()];
        assert!(manager.create_index_schema(&bad_prefix).is_err());
    }

    #[test]
    fn enforces_per_db_limit() {
        let host = Arc::new(MemoryHost::new());
        let manager = SchemaManager::new(
            host,
            Arc::new(InternStore::new()),
            None,
            SchemaManagerOptions {
                max_indexes_per_db: 2,
                ..Default::default()
            },
        );
        manager.create_index_schema(&proto("a", 0)).unwrap();
        manager.create_index_schema(&proto("b", 0)).unwrap();
        assert!(matches!(
            manager.create_index_schema(&proto("c", 0)),
            Err(EngineError::OutOfRange(_))
        ));
        // Other databases are unaffected.
        manager.create_index_schema(&proto("c", 1)).unwrap();
    }

    #[test]
    fn events_route_by_db_and_prefix() {
        let host = Arc::new(MemoryHost::new());
        let manager = manager(host.clone());
        let observer: Arc<dyn KeyspaceObserver> = manager.clone();
        host.subscribe(&observer);
        let schema = manager.create_index_schema(&proto("idx", 0)).unwrap();

        host.hash_set(0, b"doc:1", &[(b"n", b"1")]);
        host.hash_set(0, b"other:1", &[(b"n", b"1")]);
        host.hash_set(1, b"doc:2", &[(b"n", b"1")]);
        assert_eq!(
            schema
                .stats()
                .document_cnt
                .load(std::sync::atomic::Ordering::Acquire),
            1
        );
    }

    #[test]
    fn loading_stages_events() {
        let host = Arc::new(MemoryHost::new());
        let manager = manager(host.clone());
        let observer: Arc<dyn KeyspaceObserver> = manager.clone();
        host.subscribe(&observer);
        let schema = manager.create_index_schema(&proto("idx", 0)).unwrap();

        manager.on_loading_started();
        host.hash_set(0, b"doc:1", &[(b"n", b"1")]);
        assert_eq!(
            schema
                .stats()
                .document_cnt
                .load(std::sync::atomic::Ordering::Acquire),
            0
        );
        manager.on_loading_ended();
        assert_eq!(
            schema
                .stats()
                .document_cnt
                .load(std::sync::atomic::Ordering::Acquire),
            1
        );
    }

    #[test]
    fn swap_db_rekeys_registry() {
        let host = Arc::new(MemoryHost::new());
        let manager = manager(host);
        manager.create_index_schema(&proto("idx", 0)).unwrap();
        manager.on_swap_db(0, 4);
        assert!(manager.get_index_schema(0, "idx").is_err());
        let schema = manager.get_index_schema(4, "idx").unwrap();
        assert_eq!(schema.db_num(), 4);
    }

    #[test]
    fn apply_metadata_creates_and_drops() {
        let host = Arc::new(MemoryHost::new());
        let manager = manager(host);
        let encoded = wire::encode(&proto("idx", 0)).unwrap();
        manager
            .apply_metadata_entry(0, "idx", Some(&encoded), 77, 3)
            .unwrap();
        let schema = manager.get_index_schema(0, "idx").unwrap();
        assert_eq!(schema.fingerprint(), 77);
        assert_eq!(schema.version(), 3);

        // Same definition again: only restamps.
        manager
            .apply_metadata_entry(0, "idx", Some(&encoded), 78, 4)
            .unwrap();
        assert_eq!(manager.get_index_schema(0, "idx").unwrap().version(), 4);

        manager.apply_metadata_entry(0, "idx", None, 0, 5).unwrap();
        assert!(manager.get_index_schema(0, "idx").is_err());
        // Dropping a missing schema is not an error (tombstone replay).
        manager.apply_metadata_entry(0, "idx", None, 0, 6).unwrap();
    }

    #[test]
    fn backfill_round_robin_covers_all_schemas() {
        let host = Arc::new(MemoryHost::new());
        for i in 0..6 {
            host.hash_set(0, format!("doc:{i}").as_bytes(), &[(b"n", b"1")]);
        }
        let manager = manager(host);
        let a = manager.create_index_schema(&proto("a", 0)).unwrap();
        let b = manager.create_index_schema(&proto("b", 0)).unwrap();
        while manager.perform_backfill(4) > 0 {}
        assert!(!a.is_backfill_in_progress());
        assert!(!b.is_backfill_in_progress());
        assert_eq!(
            a.stats()
                .document_cnt
                .load(std::sync::atomic::Ordering::Acquire),
            6
        );
        assert_eq!(
            b.stats()
                .document_cnt
                .load(std::sync::atomic::Ordering::Acquire),
            6
        );
    }

    #[test]
    fn stop_backfill_flag_halts_ticks() {
        let host = Arc::new(MemoryHost::new());
        host.hash_set(0, b"doc:1", &[(b"n", b"1")]);
        let manager = manager(host);
        let schema = manager.create_index_schema(&proto("idx", 0)).unwrap();
        manager.set_stop_backfill(true);
        assert_eq!(manager.perform_backfill(10), 0);
        assert!(schema.is_backfill_in_progress());
        manager.set_stop_backfill(false);
        while manager.perform_backfill(10) > 0 {}
        assert!(!schema.is_backfill_in_progress());
    }
}
