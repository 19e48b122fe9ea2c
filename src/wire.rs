//! Cluster wire schemas.
//!
//! Only the message *shapes* are part of the engine contract — framing and
//! transport belong to the host. Everything here is serde-encoded with
//! bincode, and the same structs double as the in-memory representation of
//! the replicated metadata map, so a snapshot travels without translation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};

/// Bincode round-trip helpers shared by RDB and RPC payloads.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        value,
        bincode::config::standard(),
    )?)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// Version header broadcast by primaries each metadata cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMetadataVersionHeader {
    pub top_level_version: u32,
    pub top_level_fingerprint: u64,
    pub top_level_min_version: u32,
}

/// One replicated entry. `fingerprint == 0` with no content is a tombstone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMetadataEntry {
    pub version: u32,
    pub fingerprint: u64,
    pub encoding_version: u32,
    pub min_version: u32,
    pub content: Option<Vec<u8>>,
}

impl GlobalMetadataEntry {
    pub fn is_tombstone(&self) -> bool {
        self.content.is_none() && self.fingerprint == 0
    }
}

/// The full replicated map: `type name → encoded id → entry`.
///
/// BTreeMaps keep the serialized form deterministic; fingerprint computation
/// is additionally insertion-order independent by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMetadata {
    pub version_header: GlobalMetadataVersionHeader,
    pub type_namespace_map: BTreeMap<String, BTreeMap<String, GlobalMetadataEntry>>,
}

impl GlobalMetadata {
    /// True when at least one live (or tombstoned) entry exists.
    pub fn has_entries(&self) -> bool {
        self.type_namespace_map.values().any(|m| !m.is_empty())
    }
}

/// Expected `(fingerprint, version)` pair carried by consistency checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFingerprintVersion {
    pub fingerprint: u64,
    pub version: u32,
}

/// Classification a shard attaches to a failed partition response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanoutErrorKind {
    IndexName,
    InconsistentState,
    Communication,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchIndexPartitionRequest {
    pub db_num: u32,
    pub index_name: String,
    pub index_fingerprint_version: Option<IndexFingerprintVersion>,
    pub slot_fingerprint: Option<u64>,
    pub enable_consistency: bool,
    pub query: Vec<u8>,
    pub k: u32,
    pub timeout_ms: u64,
    pub no_content: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub key: Vec<u8>,
    pub score: f32,
    /// `(alias, serialized value)` pairs; absent under `no_content`.
    pub attribute_contents: Option<Vec<(String, Vec<u8>)>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchIndexPartitionResponse {
    pub neighbors: Vec<Neighbor>,
    pub total_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoIndexPartitionRequest {
    pub db_num: u32,
    pub index_name: String,
    pub index_fingerprint_version: Option<IndexFingerprintVersion>,
    pub require_consistency: bool,
    pub slot_fingerprint: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoIndexPartitionResponse {
    pub exists: bool,
    pub index_name: String,
    pub num_docs: u64,
    pub num_records: u64,
    pub hash_indexing_failures: u64,
    pub backfill_in_progress: bool,
    pub backfill_complete_percent: f32,
    pub state: String,
    pub schema_fingerprint: u64,
    pub schema_version: u32,
    pub error: Option<String>,
    pub error_kind: Option<FanoutErrorKind>,
}

impl InfoIndexPartitionResponse {
    pub fn error(kind: FanoutErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            error_kind: Some(kind),
            ..Default::default()
        }
    }
}

/// Unary RPC envelope handled by every shard's partition service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionRequest {
    Search(SearchIndexPartitionRequest),
    Info(InfoIndexPartitionRequest),
    GetGlobalMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionResponse {
    Search(SearchIndexPartitionResponse),
    Info(InfoIndexPartitionResponse),
    GlobalMetadata(GlobalMetadata),
}

impl PartitionResponse {
    pub fn into_search(self) -> Result<SearchIndexPartitionResponse> {
        match self {
            PartitionResponse::Search(resp) => Ok(resp),
            other => Err(EngineError::internal(format!(
                "unexpected partition response: {other:?}"
            ))),
        }
    }

    pub fn into_info(self) -> Result<InfoIndexPartitionResponse> {
        match self {
            PartitionResponse::Info(resp) => Ok(resp),
            other => Err(EngineError::internal(format!(
                "unexpected partition response: {other:?}"
            ))),
        }
    }

    pub fn into_metadata(self) -> Result<GlobalMetadata> {
        match self {
            PartitionResponse::GlobalMetadata(meta) => Ok(meta),
            other => Err(EngineError::internal(format!(
                "unexpected partition response: {other:?}"
            ))),
        }
    }
}
