//! Engine facade.
//!
//! [`SearchEngine`] wires the pieces into one embeddable unit: intern pool,
//! worker pools, schema registry, metadata manager, and the fanout layer.
//! It implements [`PartitionService`], so it both issues and answers cluster
//! RPCs; in a loopback cluster several engines converse entirely in-process.
//!
//! Command entry points (`ft_create`, `ft_drop_index`, `ft_search`,
//! `ft_info`, `ft_internal_update`) accept already-parsed requests; the thin
//! argv translators live in [`crate::commands`].

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::host::{
    ClusterTransport, DbIndex, PartitionService, RdbSink, RdbSource, SharedHost,
};
use crate::intern::InternStore;
use crate::metadata::{fingerprint64, MetadataManager, ObjName};
use crate::query::{
    self, fanout, CancellationToken, QueryExpr, SearchOptions,
};
use crate::rdb::{ChunkedReader, ChunkedWriter, SectionType};
use crate::registry::{SchemaManager, SchemaManagerOptions, SCHEMA_METADATA_TYPE};
use crate::schema::{IndexSchema, InfoPartitionData, SchemaProto};
use crate::wire::{
    self, IndexFingerprintVersion, InfoIndexPartitionRequest, InfoIndexPartitionResponse,
    PartitionRequest, PartitionResponse, SearchIndexPartitionRequest,
    SearchIndexPartitionResponse,
};
use crate::workers::{Priority, WorkerPool};

/// Oldest module able to consume the current schema encoding.
const SCHEMA_CONTENT_MIN_VERSION: u32 = 10_000; // 1.0.0

/// Aggregated FT.INFO reply material.
#[derive(Debug, Clone)]
pub enum InfoReply {
    Local {
        schema_proto: SchemaProto,
        data: InfoPartitionData,
        default_score: f64,
        attribute_memory: Vec<(String, u64)>,
    },
    Global {
        index_name: String,
        num_docs: u64,
        num_records: u64,
        hash_indexing_failures: u64,
    },
}

pub struct SearchEngine {
    host: SharedHost,
    transport: Arc<dyn ClusterTransport>,
    intern: Arc<InternStore>,
    schema_manager: Arc<SchemaManager>,
    metadata: Arc<MetadataManager>,
    reader_pool: Option<Arc<WorkerPool>>,
    cluster_mode: bool,
}

impl SearchEngine {
    pub fn new(
        host: SharedHost,
        transport: Arc<dyn ClusterTransport>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let intern = Arc::new(InternStore::new());
        let mutations_pool = (config.mutation_workers > 0)
            .then(|| Arc::new(WorkerPool::new("kvsearch-mutations", config.mutation_workers)));
        let reader_pool = (config.reader_workers > 0)
            .then(|| Arc::new(WorkerPool::new("kvsearch-readers", config.reader_workers)));

        let schema_manager = SchemaManager::new(
            host.clone(),
            intern.clone(),
            mutations_pool,
            SchemaManagerOptions {
                max_indexes_per_db: config.max_indexes,
                block_client_on_mutation: config.block_client_on_mutation,
                time_slice: config.time_slice(),
                rdb: config.rdb_options(),
                stop_backfill: false,
            },
        );
        host.subscribe_keyspace_events(schema_manager.clone());

        let metadata = MetadataManager::new(
            host.clone(),
            transport.clone(),
            config.metadata_broadcast_interval_ms,
        );
        let registry = schema_manager.clone();
        metadata.register_type(
            SCHEMA_METADATA_TYPE,
            crate::version::MODULE_VERSION.to_int(),
            Box::new(|content| Ok(fingerprint64(content))),
            Box::new(move |obj_name, content, fingerprint, version| {
                registry.apply_metadata_entry(
                    obj_name.db_num(),
                    obj_name.name(),
                    content,
                    fingerprint,
                    version,
                )
            }),
            Box::new(|_| Ok(SCHEMA_CONTENT_MIN_VERSION)),
        );

        Arc::new(Self {
            host,
            transport,
            intern,
            schema_manager,
            metadata,
            reader_pool,
            cluster_mode: config.cluster_mode,
        })
    }

    pub fn host(&self) -> &SharedHost {
        &self.host
    }

    pub fn intern_store(&self) -> &Arc<InternStore> {
        &self.intern
    }

    pub fn schema_manager(&self) -> &Arc<SchemaManager> {
        &self.schema_manager
    }

    pub fn metadata_manager(&self) -> &Arc<MetadataManager> {
        &self.metadata
    }

    /// Arm the periodic metadata broadcast on the host timer wheel.
    pub fn start_timers(self: &Arc<Self>) {
        self.metadata.start_periodic_broadcast();
    }

    // ── Commands ────────────────────────────────────────────────────────

    pub fn ft_create(&self, proto: SchemaProto) -> Result<IndexFingerprintVersion> {
        let proto = proto.normalized();
        if self.schema_manager.get_index_schema(proto.db_num, &proto.name).is_ok() {
            return Err(EngineError::already_exists(format!(
                "index {} already exists",
                proto.name
            )));
        }
        if !self.cluster_mode {
            self.schema_manager.create_index_schema(&proto)?;
            return Ok(IndexFingerprintVersion::default());
        }
        let min_required = self.metadata.version_header().top_level_min_version;
        if min_required > crate::version::MODULE_VERSION.to_int() {
            return Err(EngineError::failed_precondition(format!(
                "cluster metadata requires module version {min_required}; \
                 this node runs {}",
                crate::version::MODULE_VERSION
            )));
        }
        let obj = ObjName::new(proto.db_num, &proto.name);
        // The metadata update callback performs the actual registration, so
        // local creates and reconciled remote ones share one path.
        let stamp = self
            .metadata
            .create_entry(SCHEMA_METADATA_TYPE, &obj, wire::encode(&proto)?)?;
        self.schema_manager.populate_fingerprint_version(
            proto.db_num,
            &proto.name,
            stamp.fingerprint,
            stamp.version,
        );
        Ok(stamp)
    }

    pub fn ft_drop_index(&self, db_num: DbIndex, name: &str) -> Result<()> {
        self.schema_manager.get_index_schema(db_num, name)?;
        if !self.cluster_mode {
            return self.schema_manager.remove_index_schema(db_num, name);
        }
        let obj = ObjName::new(db_num, name);
        self.metadata.delete_entry(SCHEMA_METADATA_TYPE, &obj)
    }

    fn expected_stamp(&self, db_num: DbIndex, name: &str) -> Option<IndexFingerprintVersion> {
        self.metadata
            .entries_of_type(SCHEMA_METADATA_TYPE)
            .into_iter()
            .find(|(obj, _, _)| obj.db_num() == db_num && obj.name() == name)
            .map(|(_, fingerprint, version)| IndexFingerprintVersion {
                fingerprint,
                version,
            })
    }

    pub fn ft_search(
        self: &Arc<Self>,
        db_num: DbIndex,
        index_name: &str,
        expr: QueryExpr,
        options: SearchOptions,
    ) -> Result<SearchIndexPartitionResponse> {
        let k = expr
            .knn_k()
            .map(|k| k as usize)
            .unwrap_or(options.limit_offset + options.limit_num);
        if !self.cluster_mode {
            let schema = self.schema_manager.get_index_schema(db_num, index_name)?;
            let response = self.run_on_reader_pool(&schema, &expr, &options)?;
            return Ok(self.apply_limit(response, &options, &expr));
        }

        let request = SearchIndexPartitionRequest {
            db_num,
            index_name: index_name.to_string(),
            index_fingerprint_version: options
                .require_consistency
                .then(|| self.expected_stamp(db_num, index_name))
                .flatten(),
            slot_fingerprint: options
                .require_consistency
                .then(|| self.transport.slot_fingerprint()),
            enable_consistency: options.require_consistency,
            query: wire::encode(&expr)?,
            k: k as u32,
            timeout_ms: options.timeout.as_millis() as u64,
            no_content: options.no_content,
        };
        let mut operation = fanout::SearchFanout::new(request);
        let engine = self.clone();
        let tally = fanout::run_fanout(
            &mut operation,
            &self.transport,
            &move |req| engine.handle(req),
            fanout::DEFAULT_MAX_RETRIES,
            fanout::DEFAULT_BACKOFF,
        )?;
        let strict = options.require_consistency;
        let acceptable = tally.index_name_nodes.is_empty()
            && tally.inconsistent_state_nodes.is_empty()
            && (!strict || tally.communication_nodes.is_empty())
            && (options.enable_partial_results || tally.communication_nodes.is_empty());
        if !acceptable {
            if options.enable_partial_results && operation.partial_count() > 0 && !strict {
                warn!(index = index_name, "returning partial search results");
            } else {
                return Err(tally
                    .worst()
                    .unwrap_or_else(|| EngineError::internal("fanout failed")));
            }
        }
        let knn = matches!(expr, QueryExpr::Knn { .. });
        Ok(self.apply_limit(operation.into_merged(k, knn), &options, &expr))
    }

    fn apply_limit(
        &self,
        mut response: SearchIndexPartitionResponse,
        options: &SearchOptions,
        expr: &QueryExpr,
    ) -> SearchIndexPartitionResponse {
        let upper = match expr.knn_k() {
            Some(k) => (k as usize).min(options.limit_offset + options.limit_num),
            None => options.limit_offset + options.limit_num,
        };
        response.neighbors.truncate(upper);
        if options.limit_offset > 0 {
            response.neighbors = response
                .neighbors
                .split_off(options.limit_offset.min(response.neighbors.len()));
        }
        response
    }

    fn run_on_reader_pool(
        &self,
        schema: &Arc<IndexSchema>,
        expr: &QueryExpr,
        options: &SearchOptions,
    ) -> Result<SearchIndexPartitionResponse> {
        let Some(pool) = &self.reader_pool else {
            return query::execute_local(
                schema,
                &self.host,
                expr,
                options,
                &CancellationToken::new(),
            );
        };
        let (tx, rx) = channel::bounded(1);
        let schema = schema.clone();
        let host = self.host.clone();
        let expr = expr.clone();
        let opts = options.clone();
        let token = CancellationToken::new();
        let task_token = token.clone();
        pool.schedule(
            Priority::High,
            Box::new(move || {
                let result = query::execute_local(&schema, &host, &expr, &opts, &task_token);
                let _ = tx.send(result);
            }),
        );
        match rx.recv_timeout(options.timeout + Duration::from_millis(50)) {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(EngineError::DeadlineExceeded(
                    "search timed out on reader pool".into(),
                ))
            }
        }
    }

    pub fn ft_info_local(&self, db_num: DbIndex, name: &str) -> Result<InfoReply> {
        let schema = self.schema_manager.get_index_schema(db_num, name)?;
        let attribute_memory = schema
            .attributes()
            .map(|attr| (attr.alias().to_string(), attr.index().memory_bytes()))
            .collect();
        Ok(InfoReply::Local {
            schema_proto: schema.to_proto(),
            data: schema.info_partition_data(),
            default_score: schema.default_score(),
            attribute_memory,
        })
    }

    pub fn ft_info_global(self: &Arc<Self>, db_num: DbIndex, name: &str) -> Result<InfoReply> {
        let expected = self.expected_stamp(db_num, name);
        let mut operation = fanout::InfoFanout::new(db_num, name, true, expected);
        let engine = self.clone();
        let tally = fanout::run_fanout(
            &mut operation,
            &self.transport,
            &move |req| engine.handle(req),
            fanout::DEFAULT_MAX_RETRIES,
            fanout::DEFAULT_BACKOFF,
        )?;
        if !tally.is_clean() {
            return Err(tally
                .worst()
                .unwrap_or_else(|| EngineError::internal("info fanout failed")));
        }
        Ok(InfoReply::Global {
            index_name: name.to_string(),
            num_docs: operation.num_docs,
            num_records: operation.num_records,
            hash_indexing_failures: operation.hash_indexing_failures,
        })
    }

    pub fn ft_internal_update(
        &self,
        encoded_id: &str,
        entry: &[u8],
        header: &[u8],
    ) -> Result<()> {
        self.metadata.apply_internal_update(encoded_id, entry, header)
    }

    // ── Post-create / post-drop consistency checks ──────────────────────

    /// Verify the whole cluster observes one `(fingerprint, version)` for a
    /// freshly created index.
    pub fn check_create_consistency(self: &Arc<Self>, db_num: DbIndex, name: &str) -> Result<()> {
        let mut operation = fanout::CreateConsistencyCheck::new(db_num, name);
        let engine = self.clone();
        let tally = fanout::run_fanout(
            &mut operation,
            &self.transport,
            &move |req| engine.handle(req),
            fanout::DEFAULT_MAX_RETRIES,
            fanout::DEFAULT_BACKOFF,
        )?;
        if tally.is_clean() && operation.consistent {
            Ok(())
        } else {
            Err(tally
                .worst()
                .unwrap_or_else(|| EngineError::failed_precondition("create not yet consistent")))
        }
    }

    /// Verify the whole cluster dropped an index.
    pub fn check_drop_consistency(self: &Arc<Self>, db_num: DbIndex, name: &str) -> Result<()> {
        let mut operation = fanout::DropConsistencyCheck::new(db_num, name);
        let engine = self.clone();
        let target_count = self.transport.targets(crate::host::TargetMode::All).len();
        let tally = fanout::run_fanout(
            &mut operation,
            &self.transport,
            &move |req| engine.handle(req),
            fanout::DEFAULT_MAX_RETRIES,
            fanout::DEFAULT_BACKOFF,
        )?;
        if fanout::drop_check_succeeded(&tally, target_count) {
            Ok(())
        } else {
            Err(EngineError::failed_precondition(
                "index still present on some nodes",
            ))
        }
    }

    // ── Lifecycle plumbing ──────────────────────────────────────────────

    pub fn on_flush_db(&self, db_num: DbIndex) {
        self.schema_manager.on_flush_db(db_num);
    }

    pub fn on_swap_db(&self, first: DbIndex, second: DbIndex) {
        self.schema_manager.on_swap_db(first, second);
    }

    pub fn on_loading_started(&self) {
        self.schema_manager.on_loading_started();
        self.metadata.on_loading_started();
    }

    pub fn on_replication_load_start(&self) {
        self.schema_manager.on_loading_started();
        self.metadata.on_replication_load_start();
    }

    pub fn on_loading_ended(&self) {
        if let Err(err) = self.metadata.on_loading_ended() {
            warn!(%err, "failed to apply staged metadata");
        }
        self.schema_manager.on_loading_ended();
        // Stamp reconciled fingerprints onto freshly loaded schemas.
        for (obj, fingerprint, version) in self.metadata.entries_of_type(SCHEMA_METADATA_TYPE) {
            self.schema_manager.populate_fingerprint_version(
                obj.db_num(),
                obj.name(),
                fingerprint,
                version,
            );
        }
    }

    pub fn perform_backfill(&self, batch_size: u32) -> u32 {
        self.schema_manager.perform_backfill(batch_size)
    }

    /// Wait for the writer pool to drain (tests, shutdown).
    pub fn quiesce(&self) {
        self.schema_manager.quiesce();
    }

    // ── RDB ─────────────────────────────────────────────────────────────

    pub fn rdb_save(&self, sink: &mut dyn RdbSink) -> Result<()> {
        let metadata_sections = usize::from(self.metadata.global_metadata().has_entries());
        let section_count = self.schema_manager.schema_count() + metadata_sections;
        {
            let mut out = ChunkedWriter::new(sink);
            out.write_value(&(section_count as u32))?;
        }
        self.schema_manager.rdb_save_all(sink)?;
        // Global metadata lands after everything else (aux-after position).
        self.metadata.rdb_save(sink)?;
        info!(sections = section_count, "rdb save complete");
        Ok(())
    }

    pub fn rdb_load(&self, source: &mut dyn RdbSource) -> Result<()> {
        let section_count: u32 = {
            let mut input = ChunkedReader::new(source);
            input.read_value()?
        };
        for _ in 0..section_count {
            let header = {
                let mut input = ChunkedReader::new(source);
                crate::rdb::read_section_header(&mut input)?
            };
            match header.section_type {
                SectionType::IndexSchema => {
                    self.schema_manager.rdb_load_section(&header, source)?;
                }
                SectionType::GlobalMetadata => {
                    self.metadata.rdb_load(&header, source)?;
                }
            }
        }
        Ok(())
    }
}

impl PartitionService for SearchEngine {
    fn handle(&self, request: PartitionRequest) -> PartitionResponse {
        match request {
            PartitionRequest::GetGlobalMetadata => {
                PartitionResponse::GlobalMetadata(self.metadata.global_metadata())
            }
            PartitionRequest::Info(req) => PartitionResponse::Info(self.handle_info(&req)),
            PartitionRequest::Search(req) => self.handle_search(&req),
        }
    }

    fn on_cluster_message(&self, sender_id: &str, payload: &[u8]) {
        // Safe to call from RPC threads: the handler snapshots by value and
        // re-enters through run_on_main.
        let metadata = self.metadata.clone();
        metadata.handle_cluster_message(sender_id, payload);
    }

    fn on_internal_update(&self, encoded_id: &str, entry: &[u8], header: &[u8]) {
        if let Err(err) = self.metadata.apply_internal_update(encoded_id, entry, header) {
            warn!(%err, encoded_id, "internal update replay failed");
        }
    }
}

impl SearchEngine {
    fn handle_info(&self, request: &InfoIndexPartitionRequest) -> InfoIndexPartitionResponse {
        let Ok(schema) = self
            .schema_manager
            .get_index_schema(request.db_num, &request.index_name)
        else {
            return InfoIndexPartitionResponse::default(); // exists = false
        };
        if request.require_consistency {
            if let Err(err) = query::validate_consistency(
                &schema,
                request.index_fingerprint_version,
                request.slot_fingerprint,
                self.transport.slot_fingerprint(),
            ) {
                return InfoIndexPartitionResponse::error(
                    wire::FanoutErrorKind::InconsistentState,
                    err.to_string(),
                );
            }
        }
        let data = schema.info_partition_data();
        InfoIndexPartitionResponse {
            exists: true,
            index_name: schema.name().to_string(),
            num_docs: data.num_docs,
            num_records: data.num_records,
            hash_indexing_failures: data.hash_indexing_failures,
            backfill_in_progress: data.backfill_in_progress,
            backfill_complete_percent: data.backfill_complete_percent,
            state: data.state,
            schema_fingerprint: schema.fingerprint(),
            schema_version: schema.version(),
            error: None,
            error_kind: None,
        }
    }

    fn handle_search(&self, request: &SearchIndexPartitionRequest) -> PartitionResponse {
        let schema = match self
            .schema_manager
            .get_index_schema(request.db_num, &request.index_name)
        {
            Ok(schema) => schema,
            Err(_) => return PartitionResponse::Info(InfoIndexPartitionResponse::default()),
        };
        if request.enable_consistency {
            if let Err(err) = query::validate_consistency(
                &schema,
                request.index_fingerprint_version,
                request.slot_fingerprint,
                self.transport.slot_fingerprint(),
            ) {
                return PartitionResponse::Info(InfoIndexPartitionResponse::error(
                    wire::FanoutErrorKind::InconsistentState,
                    err.to_string(),
                ));
            }
        }
        let expr: QueryExpr = match wire::decode(&request.query) {
            Ok(expr) => expr,
            Err(err) => {
                return PartitionResponse::Info(InfoIndexPartitionResponse::error(
                    wire::FanoutErrorKind::Internal,
                    err.to_string(),
                ))
            }
        };
        let options = SearchOptions {
            no_content: request.no_content,
            timeout: Duration::from_millis(request.timeout_ms.max(1)),
            limit_offset: 0,
            limit_num: request.k as usize,
            ..Default::default()
        };
        match self.run_on_reader_pool(&schema, &expr, &options) {
            Ok(response) => PartitionResponse::Search(response),
            Err(err @ EngineError::DeadlineExceeded(_)) => PartitionResponse::Info(
                InfoIndexPartitionResponse::error(wire::FanoutErrorKind::Communication, err.to_string()),
            ),
            Err(err) => PartitionResponse::Info(InfoIndexPartitionResponse::error(
                wire::FanoutErrorKind::Internal,
                err.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{LoopbackCluster, MemoryHost};
    use crate::host::RecordKind;
    use crate::index::{FilterPredicate, IndexDefinition, NumericRange};
    use crate::schema::AttributeProto;

    fn engine_with(config: EngineConfig) -> (Arc<MemoryHost>, Arc<SearchEngine>) {
        let host = Arc::new(MemoryHost::new());
        let cluster = Arc::new(LoopbackCluster::new());
        let transport = cluster.join("solo", true);
        let engine = SearchEngine::new(host.clone(), transport, config);
        cluster.attach_service("solo", engine.clone());
        (host, engine)
    }

    fn engine_single() -> (Arc<MemoryHost>, Arc<SearchEngine>) {
        engine_with(EngineConfig {
            mutation_workers: 0,
            reader_workers: 0,
            cluster_mode: false,
            ..Default::default()
        })
    }

    fn proto(name: &str) -> SchemaProto {
        SchemaProto {
            name: name.into(),
            db_num: 0,
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

    #[test]
    fn create_ingest_search_single_node() {
        let (host, engine) = engine_single();
        engine.ft_create(proto("idx")).unwrap();
        engine.perform_backfill(16);
        host.hash_set(0, b"doc:1", &[(b"n", b"1.5")]);
        host.hash_set(0, b"doc:2", &[(b"n", b"2.5")]);

        let resp = engine
            .ft_search(
                0,
                "idx",
                QueryExpr::Filter {
                    attribute: "n".into(),
                    predicate: FilterPredicate::Numeric(NumericRange::closed(1.0, 2.0)),
                },
                SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(resp.neighbors.len(), 1);
        assert_eq!(resp.neighbors[0].key, b"doc:1".to_vec());

        match engine.ft_info_local(0, "idx").unwrap() {
            InfoReply::Local { data, .. } => {
                assert_eq!(data.num_docs, 2);
                assert_eq!(data.hash_indexing_failures, 0);
                assert_eq!(data.state, "ready");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let (_host, engine) = engine_single();
        engine.ft_create(proto("idx")).unwrap();
        assert!(matches!(
            engine.ft_create(proto("idx")),
            Err(EngineError::AlreadyExists(_))
        ));
    }

    #[test]
    fn drop_then_search_is_not_found() {
        let (_host, engine) = engine_single();
        engine.ft_create(proto("idx")).unwrap();
        engine.ft_drop_index(0, "idx").unwrap();
        assert!(matches!(
            engine.ft_search(0, "idx", QueryExpr::All, SearchOptions::default()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn rdb_roundtrip_through_engine() {
        // v1 layout: no extension block, so loading-ended must reconcile
        // deletions that raced the snapshot.
        let v1 = || EngineConfig {
            mutation_workers: 0,
            reader_workers: 0,
            cluster_mode: false,
            rdb_write_v2: false,
            rdb_read_v2: false,
            ..Default::default()
        };
        let (host, engine) = engine_with(v1());
        engine.ft_create(proto("idx")).unwrap();
        host.hash_set(0, b"doc:1", &[(b"n", b"1")]);

        let mut rdb = crate::host::memory::MemoryRdb::new();
        engine.rdb_save(&mut rdb).unwrap();

        let (host2, engine2) = engine_with(v1());
        engine2.on_loading_started();
        engine2.rdb_load(&mut rdb).unwrap();
        // doc:1 does not exist on the fresh host: the v1 reconcile pass on
        // loading-ended cleans it out.
        engine2.on_loading_ended();
        let schema = engine2.schema_manager().get_index_schema(0, "idx").unwrap();
        assert_eq!(
            schema
                .stats()
                .document_cnt
                .load(std::sync::atomic::Ordering::Acquire),
            0
        );
        // With the key present the document survives the roundtrip.
        host2.hash_set(0, b"doc:1", &[(b"n", b"1")]);
        assert_eq!(
            schema
                .stats()
                .document_cnt
                .load(std::sync::atomic::Ordering::Acquire),
            1
        );
    }
}
