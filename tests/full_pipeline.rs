//! End-to-end flows on a single node: create, ingest, search, MULTI/EXEC
//! atomicity, and the FT.INFO reply shape.

use std::collections::HashMap;
use std::sync::Arc;

use kvsearch::commands::{self, InfoScope, RespValue};
use kvsearch::config::EngineConfig;
use kvsearch::engine::{InfoReply, SearchEngine};
use kvsearch::host::memory::{LoopbackCluster, MemoryHost};

fn strs(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn vector_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn single_node(config: EngineConfig) -> (Arc<MemoryHost>, Arc<SearchEngine>) {
    let host = Arc::new(MemoryHost::new());
    let cluster = Arc::new(LoopbackCluster::new());
    let transport = cluster.join("solo", true);
    let engine = SearchEngine::new(host.clone(), transport, config);
    cluster.attach_service("solo", engine.clone());
    (host, engine)
}

fn sync_config() -> EngineConfig {
    EngineConfig::new()
        .with_mutation_workers(0)
        .with_reader_workers(0)
}

#[test]
fn create_ingest_search_roundtrip() {
    let (host, engine) = single_node(sync_config());

    let create = commands::parse_ft_create(
        0,
        &strs(&[
            "idx", "ON", "HASH", "PREFIX", "1", "doc:", "SCHEMA", "v", "VECTOR", "HNSW", "6",
            "TYPE", "FLOAT32", "DIM", "3", "DISTANCE_METRIC", "IP", "n", "NUMERIC",
        ]),
    )
    .unwrap();
    engine.ft_create(create).unwrap();
    // Drain the (empty-db) backfill so the index reports ready.
    engine.perform_backfill(16);

    host.hash_set(
        0,
        b"doc:1",
        &[(b"v", vector_bytes(&[1.0, 0.0, 0.0]).as_slice()), (b"n", b"1.5")],
    );
    host.hash_set(
        0,
        b"doc:2",
        &[(b"v", vector_bytes(&[0.0, 1.0, 0.0]).as_slice()), (b"n", b"2.5")],
    );

    let search = commands::parse_ft_search(&strs(&["idx", "@n:[1 2]"]), &HashMap::new()).unwrap();
    let reply = engine
        .ft_search(0, &search.index_name, search.expr, search.options)
        .unwrap();
    assert_eq!(reply.neighbors.len(), 1);
    assert_eq!(reply.neighbors[0].key, b"doc:1".to_vec());

    let (name, scope) = commands::parse_ft_info(&strs(&["idx"])).unwrap();
    assert_eq!(scope, InfoScope::Local);
    match engine.ft_info_local(0, &name).unwrap() {
        InfoReply::Local { data, .. } => {
            assert_eq!(data.num_docs, 2);
            assert_eq!(data.hash_indexing_failures, 0);
            assert_eq!(data.state, "ready");
        }
        other => panic!("unexpected info reply: {other:?}"),
    }
}

#[test]
fn knn_search_via_params() {
    let (host, engine) = single_node(sync_config());
    let create = commands::parse_ft_create(
        0,
        &strs(&[
            "idx", "ON", "HASH", "PREFIX", "1", "doc:", "SCHEMA", "v", "VECTOR", "FLAT", "6",
            "TYPE", "FLOAT32", "DIM", "2", "DISTANCE_METRIC", "L2",
        ]),
    )
    .unwrap();
    engine.ft_create(create).unwrap();

    for i in 0..8 {
        host.hash_set(
            0,
            format!("doc:{i}").as_bytes(),
            &[(b"v", vector_bytes(&[i as f32, 0.0]).as_slice())],
        );
    }

    let mut params = HashMap::new();
    params.insert("BLOB".to_string(), vector_bytes(&[2.9, 0.0]));
    let search =
        commands::parse_ft_search(&strs(&["idx", "*=>[KNN 3 @v $BLOB]", "NOCONTENT"]), &params)
            .unwrap();
    let reply = engine
        .ft_search(0, &search.index_name, search.expr, search.options)
        .unwrap();
    assert_eq!(reply.neighbors.len(), 3);
    assert_eq!(reply.neighbors[0].key, b"doc:3".to_vec());
    assert!(reply.neighbors[0].score < reply.neighbors[1].score);
    assert!(reply.neighbors[0].attribute_contents.is_none());
}

#[test]
fn multi_exec_applies_atomically() {
    // Worker pool on: MULTI mutations ride the side queue and drain under a
    // single writer acquisition.
    let (host, engine) = single_node(
        EngineConfig::new()
            .with_mutation_workers(2)
            .with_reader_workers(0),
    );
    let create = commands::parse_ft_create(
        0,
        &strs(&["idx", "ON", "HASH", "PREFIX", "1", "doc:", "SCHEMA", "n", "NUMERIC"]),
    )
    .unwrap();
    engine.ft_create(create).unwrap();

    host.begin_multi();
    host.hash_set(0, b"doc:3", &[(b"n", b"10")]);
    host.hash_set(0, b"doc:4", &[(b"n", b"20")]);
    host.exec_multi();

    // A search initiated after EXEC drains the transaction first and must
    // observe both documents.
    let search =
        commands::parse_ft_search(&strs(&["idx", "@n:[0 100]"]), &HashMap::new()).unwrap();
    let reply = engine
        .ft_search(0, &search.index_name, search.expr, search.options)
        .unwrap();
    assert_eq!(reply.neighbors.len(), 2);

    engine.quiesce();
    let schema = engine.schema_manager().get_index_schema(0, "idx").unwrap();
    assert_eq!(
        schema
            .stats()
            .document_cnt
            .load(std::sync::atomic::Ordering::Acquire),
        2
    );
}

#[test]
fn info_reply_shape_matches_contract() {
    let (_host, engine) = single_node(sync_config());
    let create = commands::parse_ft_create(
        0,
        &strs(&[
            "idx", "ON", "HASH", "PREFIX", "1", "doc:", "SCHEMA", "v", "VECTOR", "HNSW", "6",
            "TYPE", "FLOAT32", "DIM", "3", "DISTANCE_METRIC", "L2", "n", "NUMERIC",
        ]),
    )
    .unwrap();
    engine.ft_create(create).unwrap();
    engine.perform_backfill(16);

    let reply = engine.ft_info_local(0, "idx").unwrap();
    let RespValue::Array(items) = commands::format_info_reply(&reply) else {
        panic!("info reply must be an array");
    };
    // Flat key/value layout: 11 pairs.
    assert_eq!(items.len(), 22);

    let key_at = |idx: usize| match &items[idx] {
        RespValue::Simple(s) => s.clone(),
        other => panic!("expected key at {idx}, found {other:?}"),
    };
    assert_eq!(key_at(0), "index_name");
    assert_eq!(items[1], RespValue::simple("idx"));

    assert_eq!(key_at(2), "index_definition");
    let RespValue::Array(definition) = &items[3] else {
        panic!("index_definition must nest");
    };
    assert_eq!(definition[0], RespValue::simple("key_type"));
    assert_eq!(definition[1], RespValue::simple("HASH"));
    assert_eq!(definition[2], RespValue::simple("prefixes"));
    assert_eq!(
        definition[3],
        RespValue::Array(vec![RespValue::simple("doc:")])
    );
    assert_eq!(definition[4], RespValue::simple("default_score"));
    assert_eq!(definition[5], RespValue::simple("1"));

    assert_eq!(key_at(4), "attributes");
    let RespValue::Array(attributes) = &items[5] else {
        panic!("attributes must nest");
    };
    assert_eq!(attributes.len(), 2);
    let RespValue::Array(first) = &attributes[0] else {
        panic!("attribute entries must nest");
    };
    assert_eq!(first[0], RespValue::simple("identifier"));
    assert_eq!(first[2], RespValue::simple("attribute"));
    assert!(first
        .iter()
        .any(|item| *item == RespValue::simple("user_indexed_memory")));

    let expected_pairs = [
        (6, "num_docs", RespValue::Int(0)),
        (8, "num_records", RespValue::Int(0)),
        (10, "hash_indexing_failures", RespValue::Int(0)),
    ];
    for (idx, key, value) in expected_pairs {
        assert_eq!(key_at(idx), key);
        assert_eq!(items[idx + 1], value);
    }
    assert_eq!(key_at(12), "backfill_in_progress");
    assert_eq!(key_at(14), "backfill_complete_percent");
    assert_eq!(key_at(16), "mutation_queue_size");
    assert_eq!(items[17], RespValue::Int(0));
    assert_eq!(key_at(18), "recent_mutations_queue_delay");
    assert_eq!(items[19], RespValue::simple("0 sec"));
    assert_eq!(key_at(20), "state");
    assert_eq!(items[21], RespValue::simple("ready"));
}

#[test]
fn ill_typed_fields_count_as_failures_not_errors() {
    let (host, engine) = single_node(sync_config());
    let create = commands::parse_ft_create(
        0,
        &strs(&[
            "idx", "ON", "HASH", "PREFIX", "1", "doc:", "SCHEMA", "v", "VECTOR", "FLAT", "6",
            "TYPE", "FLOAT32", "DIM", "2", "DISTANCE_METRIC", "L2", "n", "NUMERIC",
        ]),
    )
    .unwrap();
    engine.ft_create(create).unwrap();

    // Wrong vector width plus a fine numeric value.
    host.hash_set(0, b"doc:1", &[(b"v", b"shrt"), (b"n", b"1")]);
    match engine.ft_info_local(0, "idx").unwrap() {
        InfoReply::Local { data, .. } => {
            assert_eq!(data.hash_indexing_failures, 1);
            assert_eq!(data.num_docs, 1);
        }
        other => panic!("unexpected info reply: {other:?}"),
    }
}

#[test]
fn json_documents_index_through_paths() {
    let (host, engine) = single_node(sync_config());
    let create = commands::parse_ft_create(
        0,
        &strs(&[
            "jidx", "ON", "JSON", "PREFIX", "1", "j:", "SCHEMA", "$.rating", "AS", "rating",
            "NUMERIC", "$.labels", "AS", "labels", "TAG",
        ]),
    )
    .unwrap();
    engine.ft_create(create).unwrap();

    host.json_set(
        0,
        b"j:1",
        serde_json::json!({"rating": 4.5, "labels": "a,b"}),
    );
    host.json_set(
        0,
        b"j:2",
        serde_json::json!({"rating": 2.0, "labels": "b,c"}),
    );

    let search = commands::parse_ft_search(
        &strs(&["jidx", "@rating:[4 5] @labels:{a}"]),
        &HashMap::new(),
    )
    .unwrap();
    let reply = engine
        .ft_search(0, &search.index_name, search.expr, search.options)
        .unwrap();
    assert_eq!(reply.neighbors.len(), 1);
    assert_eq!(reply.neighbors[0].key, b"j:1".to_vec());
}

#[test]
fn backfill_indexes_preexisting_keys() {
    let (host, engine) = single_node(sync_config());
    for i in 0..20 {
        host.hash_set(0, format!("doc:{i}").as_bytes(), &[(b"n", b"7")]);
    }
    let create = commands::parse_ft_create(
        0,
        &strs(&["idx", "ON", "HASH", "PREFIX", "1", "doc:", "SCHEMA", "n", "NUMERIC"]),
    )
    .unwrap();
    engine.ft_create(create).unwrap();

    while engine.perform_backfill(8) > 0 {}
    engine.quiesce();

    match engine.ft_info_local(0, "idx").unwrap() {
        InfoReply::Local { data, .. } => {
            assert_eq!(data.num_docs, 20);
            assert!(!data.backfill_in_progress);
            assert!((data.backfill_complete_percent - 1.0).abs() < f32::EPSILON);
            assert_eq!(data.state, "ready");
        }
        other => panic!("unexpected info reply: {other:?}"),
    }

    let search =
        commands::parse_ft_search(&strs(&["idx", "@n:[7 7]", "LIMIT", "0", "50"]), &HashMap::new())
            .unwrap();
    let reply = engine
        .ft_search(0, &search.index_name, search.expr, search.options)
        .unwrap();
    assert_eq!(reply.neighbors.len(), 20);
}
