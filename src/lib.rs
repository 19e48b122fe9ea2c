//! Clustered in-memory search and indexing for key-value stores.
//!
//! `kvsearch` maintains secondary indexes — vector ANN, numeric, tag, and
//! full-text — over keys whose values are hashes or JSON documents, and
//! answers KNN, range, tag, and text queries, optionally fanning out across
//! a cluster of shards. The engine is embeddable: it talks to its host store
//! exclusively through the capability traits in [`host`], and the crate
//! ships an in-memory host plus a loopback cluster so the whole system runs
//! in-process.
//!
//! ## Architecture
//!
//! - [`intern`] — content-addressed, refcounted string pool with
//!   per-category memory accounting; keys and vectors are interned once and
//!   shared by every index.
//! - [`index`] — the per-attribute index capability: numeric ranges, tags,
//!   text postings, and HNSW/flat vector search, composed through entry
//!   fetchers (AND/OR/NOT).
//! - [`schema`] — the index runtime: keyspace-notification ingest with
//!   per-key mutation dedup, MULTI/EXEC draining, prioritized worker
//!   scheduling, backfill over existing keys, and RDB serialization.
//! - [`registry`] — the process-wide schema registry routing keyspace
//!   events and lifecycle callbacks.
//! - [`metadata`] — the cluster-wide, gossip-reconciled map of registered
//!   index definitions: deterministic HighwayHash fingerprints,
//!   version-ordered conflict resolution, replica replay, RDB persistence.
//! - [`query`] — query trees, single-shard execution under the time-sliced
//!   reader/writer discipline, and the fanout template with consistency
//!   checks, partial-result policy, and bounded retries.
//! - [`engine`] — the facade wiring everything into one embeddable unit.
//! - [`commands`] — thin argv translators for the `FT.*` command surface.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use kvsearch::config::EngineConfig;
//! use kvsearch::engine::SearchEngine;
//! use kvsearch::host::memory::{LoopbackCluster, MemoryHost};
//! use kvsearch::commands;
//! use std::collections::HashMap;
//!
//! let host = Arc::new(MemoryHost::new());
//! let cluster = Arc::new(LoopbackCluster::new());
//! let transport = cluster.join("node-a", true);
//! let engine = SearchEngine::new(
//!     host.clone(),
//!     transport,
//!     EngineConfig::new().with_mutation_workers(0).with_reader_workers(0),
//! );
//! cluster.attach_service("node-a", engine.clone());
//!
//! let args: Vec<String> = ["idx", "ON", "HASH", "PREFIX", "1", "doc:", "SCHEMA", "n", "NUMERIC"]
//!     .iter().map(|s| s.to_string()).collect();
//! engine.ft_create(commands::parse_ft_create(0, &args).unwrap()).unwrap();
//!
//! host.hash_set(0, b"doc:1", &[(b"n", b"1.5")]);
//! let cmd = commands::parse_ft_search(
//!     &["idx".to_string(), "@n:[1 2]".to_string()],
//!     &HashMap::new(),
//! ).unwrap();
//! let reply = engine.ft_search(0, &cmd.index_name, cmd.expr, cmd.options).unwrap();
//! assert_eq!(reply.neighbors.len(), 1);
//! ```

pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod externalizer;
pub mod host;
pub mod index;
pub mod intern;
pub mod memory;
pub mod metadata;
pub mod query;
pub mod rdb;
pub mod registry;
pub mod schema;
pub mod timeslice;
pub mod version;
pub mod wire;
pub mod workers;

pub use config::EngineConfig;
pub use engine::SearchEngine;
pub use error::{EngineError, Result};
pub use intern::{InternStore, InternedStr, StringCategory};
pub use metadata::{MetadataManager, ObjName};
pub use query::{QueryExpr, SearchOptions};
pub use registry::SchemaManager;
pub use schema::IndexSchema;
