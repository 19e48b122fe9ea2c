//! Host capability interface.
//!
//! The engine never talks to a key-value store directly; it consumes the
//! narrow set of capabilities below and the host implements them. The crate
//! ships a first-class in-memory host ([`memory::MemoryHost`]) plus a
//! loopback cluster so embedders and tests can run the whole engine without
//! a server process.

pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::intern::InternedStr;
use crate::wire::{PartitionRequest, PartitionResponse};

/// Database index within the host keyspace.
pub type DbIndex = u32;

/// Record shape the engine can index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RecordKind {
    Hash,
    Json,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Hash => f.write_str("HASH"),
            RecordKind::Json => f.write_str("JSON"),
        }
    }
}

/// Opaque resumable position for keyspace scans.
#[derive(Debug, Default, Clone)]
pub struct ScanCursor {
    pub(crate) resume_after: Option<Vec<u8>>,
    pub(crate) done: bool,
}

impl ScanCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Handle for a client the host has parked awaiting a mutation.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct BlockedClient(pub u64);

/// Read-side view of the host keyspace plus the ambient facilities the
/// engine depends on (timers, run-on-main, client blocking).
pub trait Host: Send + Sync {
    /// Register for keyspace events. Observers are held weakly; dropping
    /// the observer ends the subscription.
    fn subscribe_keyspace_events(&self, observer: Arc<dyn KeyspaceObserver>);

    /// The record kind stored at `key`, or `None` when the key is absent or
    /// holds an unindexable type.
    fn record_kind(&self, db: DbIndex, key: &[u8]) -> Option<RecordKind>;

    fn key_exists(&self, db: DbIndex, key: &[u8]) -> bool;

    /// Raw bytes of one hash field.
    fn hash_field(&self, db: DbIndex, key: &[u8], field: &[u8]) -> Option<Bytes>;

    /// Serialized value at a JSON path (strings unquoted, numbers in
    /// canonical text form, arrays/objects as JSON text).
    fn json_path(&self, db: DbIndex, key: &[u8], path: &str) -> Option<Bytes>;

    /// Whether JSON documents are readable at all (JSON support is an
    /// optional host module).
    fn supports_json(&self) -> bool;

    fn db_size(&self, db: DbIndex) -> u64;

    /// Advance `cursor` by roughly one step, invoking `visit` for each key
    /// seen. Returns false when the scan is exhausted.
    fn scan_step(
        &self,
        db: DbIndex,
        cursor: &mut ScanCursor,
        visit: &mut dyn FnMut(&[u8]),
    ) -> bool;

    /// Host memory-pressure flag; backfill pauses while set. Sampled per
    /// batch, never trusted from a single read.
    fn is_oom(&self) -> bool;

    /// True while the currently dispatched keyspace event originates from a
    /// MULTI/EXEC (or scripted) execution.
    fn in_multi_exec(&self) -> bool;

    /// Park the issuing client until its mutation applies. `None` when the
    /// event has no real user client behind it.
    fn block_client(&self) -> Option<BlockedClient>;

    fn unblock_client(&self, client: BlockedClient);

    /// Hand a closure to the host event loop. Ordering with other main-loop
    /// work is the host's.
    fn run_on_main(&self, task: Box<dyn FnOnce() + Send>);

    /// One-shot timer on the host event loop.
    fn create_timer(&self, delay: Duration, task: Box<dyn FnOnce() + Send>);

    /// Milliseconds from the host's monotonic-ish clock.
    fn now_ms(&self) -> i64;

    /// Whether the host exposes the string-ref hash API needed for vector
    /// externalization.
    fn supports_hash_string_ref(&self) -> bool {
        false
    }

    /// Replace the host's copy of a hash field with a reference to the
    /// engine-interned value.
    fn externalize_hash_field(
        &self,
        _db: DbIndex,
        _key: &[u8],
        _field: &[u8],
        _value: &InternedStr,
    ) -> Result<()> {
        Err(crate::error::EngineError::internal(
            "host lacks hash string-ref support",
        ))
    }

    /// Drop a previously externalized reference.
    fn release_hash_string_ref(&self, _db: DbIndex, _key: &[u8], _field: &[u8]) {}
}

/// Receiver side of keyspace-event subscription. The schema registry
/// implements this and routes events to matching schemas.
pub trait KeyspaceObserver: Send + Sync {
    fn on_key_event(&self, db: DbIndex, key: &[u8]);
}

/// A node the fanout layer may target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    pub is_local: bool,
    pub is_primary: bool,
}

/// Which nodes a fanout operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMode {
    All,
    Primaries,
}

/// Cluster message-plane capabilities: broadcast, unary RPC, replication.
pub trait ClusterTransport: Send + Sync {
    fn node_id(&self) -> String;

    fn is_primary(&self) -> bool;

    /// Fire-and-forget payload to every other node.
    fn broadcast(&self, payload: &[u8]);

    /// Synchronous unary exchange with `target`'s partition service.
    fn unary(&self, target: &str, request: PartitionRequest) -> Result<PartitionResponse>;

    fn targets(&self, mode: TargetMode) -> Vec<NodeInfo>;

    /// Ship an internal-update command down the replication link.
    fn replicate_internal_update(
        &self,
        encoded_id: &str,
        entry: &[u8],
        header: &[u8],
    ) -> Result<()>;

    /// Digest of the slot-ownership map this shard currently serves.
    fn slot_fingerprint(&self) -> u64;
}

/// Service each shard exposes to the cluster: answers unary RPCs and accepts
/// broadcast messages. The engine facade implements this.
pub trait PartitionService: Send + Sync {
    fn handle(&self, request: PartitionRequest) -> PartitionResponse;

    fn on_cluster_message(&self, sender_id: &str, payload: &[u8]);

    /// Replica-side replay of a metadata update (the internal-update
    /// replication command).
    fn on_internal_update(&self, encoded_id: &str, entry: &[u8], header: &[u8]);
}

/// Chunked output stream for RDB aux sections.
pub trait RdbSink {
    fn save_chunk(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Chunked input stream for RDB aux sections.
pub trait RdbSource {
    fn load_chunk(&mut self) -> Result<Vec<u8>>;
}

/// Convenience alias used across the engine.
pub type SharedHost = Arc<dyn Host>;
