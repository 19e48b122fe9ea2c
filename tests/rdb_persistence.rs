//! RDB round-trips: schema sections, vector key maps, the v2 extension,
//! skip-index-load, and the global metadata aux section.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use kvsearch::commands;
use kvsearch::config::EngineConfig;
use kvsearch::engine::SearchEngine;
use kvsearch::host::memory::{LoopbackCluster, MemoryHost, MemoryRdb};
use kvsearch::registry::SCHEMA_METADATA_TYPE;

fn strs(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn vector_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn node(config: EngineConfig) -> (Arc<MemoryHost>, Arc<SearchEngine>) {
    let host = Arc::new(MemoryHost::new());
    let cluster = Arc::new(LoopbackCluster::new());
    let transport = cluster.join("solo", true);
    let engine = SearchEngine::new(host.clone(), transport, config);
    cluster.attach_service("solo", engine.clone());
    (host, engine)
}

fn base_config() -> EngineConfig {
    EngineConfig::new()
        .with_mutation_workers(0)
        .with_reader_workers(0)
}

fn populate(host: &MemoryHost, engine: &Arc<SearchEngine>) {
    let proto = commands::parse_ft_create(
        0,
        &strs(&[
            "idx", "ON", "HASH", "PREFIX", "1", "doc:", "SCHEMA", "v", "VECTOR", "FLAT", "6",
            "TYPE", "FLOAT32", "DIM", "2", "DISTANCE_METRIC", "L2", "n", "NUMERIC",
        ]),
    )
    .unwrap();
    engine.ft_create(proto).unwrap();
    for i in 0..10 {
        host.hash_set(
            0,
            format!("doc:{i}").as_bytes(),
            &[
                (b"v", vector_bytes(&[i as f32, 1.0]).as_slice()),
                (b"n", format!("{i}").as_bytes()),
            ],
        );
    }
}

fn copy_keyspace(from: &MemoryHost, to: &MemoryHost) {
    for i in 0..10 {
        to.hash_set(
            0,
            format!("doc:{i}").as_bytes(),
            &[
                (b"v", vector_bytes(&[i as f32, 1.0]).as_slice()),
                (b"n", format!("{i}").as_bytes()),
            ],
        );
    }
    let _ = from;
}

#[test]
fn schema_roundtrip_preserves_definition_modulo_stats() {
    let (host, engine) = node(base_config());
    populate(&host, &engine);
    let original = engine
        .schema_manager()
        .get_index_schema(0, "idx")
        .unwrap()
        .to_proto();

    let mut rdb = MemoryRdb::new();
    engine.rdb_save(&mut rdb).unwrap();

    let (_host2, engine2) = node(base_config());
    engine2.on_loading_started();
    engine2.rdb_load(&mut rdb).unwrap();
    engine2.on_loading_ended();

    let reloaded = engine2
        .schema_manager()
        .get_index_schema(0, "idx")
        .unwrap()
        .to_proto();
    assert_eq!(reloaded.name, original.name);
    assert_eq!(reloaded.db_num, original.db_num);
    assert_eq!(reloaded.data_type, original.data_type);
    assert_eq!(reloaded.key_prefixes, original.key_prefixes);
    assert_eq!(reloaded.attributes, original.attributes);
}

#[test]
fn contents_and_search_survive_reload() {
    let (host, engine) = node(base_config());
    populate(&host, &engine);

    let mut rdb = MemoryRdb::new();
    engine.rdb_save(&mut rdb).unwrap();

    // The new node's keyspace carries the same documents, as a host RDB
    // load would restore them.
    let (host2, engine2) = node(base_config());
    engine2.on_loading_started();
    copy_keyspace(&host, &host2);
    engine2.rdb_load(&mut rdb).unwrap();
    engine2.on_loading_ended();
    engine2.quiesce();

    let schema = engine2.schema_manager().get_index_schema(0, "idx").unwrap();
    assert_eq!(schema.stats().document_cnt.load(Ordering::Acquire), 10);
    assert_eq!(schema.count_records(), 20);

    let mut params = HashMap::new();
    params.insert("B".to_string(), vector_bytes(&[3.0, 1.0]));
    let search =
        commands::parse_ft_search(&strs(&["idx", "*=>[KNN 1 @v $B]"]), &params).unwrap();
    let reply = engine2
        .ft_search(0, &search.index_name, search.expr, search.options)
        .unwrap();
    assert_eq!(reply.neighbors[0].key, b"doc:3".to_vec());
    assert_eq!(reply.neighbors[0].score, 0.0);
}

#[test]
fn skip_index_load_rebuilds_through_backfill() {
    let (host, engine) = node(base_config());
    populate(&host, &engine);

    let mut rdb = MemoryRdb::new();
    engine.rdb_save(&mut rdb).unwrap();

    let mut config = base_config();
    config.skip_index_load = true;
    let (host2, engine2) = node(config);
    engine2.on_loading_started();
    copy_keyspace(&host, &host2);
    engine2.rdb_load(&mut rdb).unwrap();
    engine2.on_loading_ended();

    let schema = engine2.schema_manager().get_index_schema(0, "idx").unwrap();
    // Contents skipped: an empty index in backfill state.
    assert_eq!(schema.count_records(), 0);
    assert!(schema.is_backfill_in_progress());

    while engine2.perform_backfill(16) > 0 {}
    engine2.quiesce();
    assert_eq!(schema.stats().document_cnt.load(Ordering::Acquire), 10);
    assert!(!schema.is_backfill_in_progress());
}

#[test]
fn global_metadata_roundtrip_with_prefer_incoming() {
    let (host, engine) = node(base_config().with_cluster_mode(true));
    populate(&host, &engine);
    let saved = engine.metadata_manager().global_metadata();
    assert!(saved.has_entries());

    let mut rdb = MemoryRdb::new();
    engine.rdb_save(&mut rdb).unwrap();

    let (_host2, engine2) = node(base_config().with_cluster_mode(true));
    engine2.on_replication_load_start();
    engine2.rdb_load(&mut rdb).unwrap();
    // Staged: nothing visible until loading ends.
    assert!(!engine2.metadata_manager().global_metadata().has_entries());
    engine2.on_loading_ended();

    let restored = engine2.metadata_manager().global_metadata();
    assert_eq!(
        restored.type_namespace_map[SCHEMA_METADATA_TYPE],
        saved.type_namespace_map[SCHEMA_METADATA_TYPE]
    );
}

#[test]
fn empty_engine_writes_no_metadata_section() {
    let (_host, engine) = node(base_config());
    let mut rdb = MemoryRdb::new();
    engine.rdb_save(&mut rdb).unwrap();
    // Only the section-count blob (one length prefix + one chunk).
    assert_eq!(rdb.chunk_count(), 2);

    let (_host2, engine2) = node(base_config());
    engine2.rdb_load(&mut rdb).unwrap();
    assert_eq!(engine2.schema_manager().schema_count(), 0);
}

#[test]
fn validate_on_write_accepts_clean_state() {
    let mut config = base_config();
    config.rdb_validate_on_write = true;
    let (host, engine) = node(config);
    populate(&host, &engine);
    let mut rdb = MemoryRdb::new();
    engine.rdb_save(&mut rdb).unwrap();
    assert!(!rdb.is_empty());
}
