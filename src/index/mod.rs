//! Per-attribute index capability.
//!
//! A schema attribute owns exactly one [`AttributeIndex`]. The enum carries
//! the concrete structures; the uniform operation set (`add_record`,
//! `modify_record`, `remove_record`, `is_tracked`, `search`, save/load)
//! follows one result convention everywhere: `Ok(true)` changed state,
//! `Ok(false)` was a no-op or an ill-typed payload (counted as skipped by
//! the schema and surfaced as `hash_indexing_failures`), `Err` is a real
//! failure.

pub mod fetcher;
pub mod numeric;
pub mod tag;
pub mod text;
pub mod vector;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use fetcher::{EntriesFetcher, IntersectFetcher, Key, NegateFetcher, UnionFetcher, VecFetcher};
pub use numeric::{NumericIndex, NumericRange};
pub use tag::{TagIndex, TagMatch, TagOptions};
pub use text::{TextIndex, TextMatch, TextOptions};
pub use vector::{
    DistanceMetric, KnnQuery, ScoredKey, VectorAlgorithm, VectorIndex, VectorParams,
};

use crate::error::{EngineError, Result};
use crate::intern::InternStore;
use crate::rdb::{ChunkedReader, ChunkedWriter};

/// What a removal means for the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionKind {
    /// The whole key vanished (DEL, expiry, wrong type).
    Record,
    /// Only this attribute's field went away or turned ill-typed.
    Field,
}

/// Concrete index family, used for stats and RDB section tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Numeric,
    Tag,
    Text,
    VectorHnsw,
    VectorFlat,
}

impl IndexKind {
    pub fn is_vector(self) -> bool {
        matches!(self, IndexKind::VectorHnsw | IndexKind::VectorFlat)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Numeric => "NUMERIC",
            IndexKind::Tag => "TAG",
            IndexKind::Text => "TEXT",
            IndexKind::VectorHnsw => "VECTOR_HNSW",
            IndexKind::VectorFlat => "VECTOR_FLAT",
        }
    }
}

/// Non-KNN predicate routed to an attribute index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterPredicate {
    Numeric(NumericRange),
    Tag(TagMatch),
    Text(TextMatch),
}

/// Serializable attribute definition — the schema proto's per-field part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexDefinition {
    Numeric,
    Tag(TagOptions),
    Text(TextOptions),
    Vector(VectorParams),
}

impl IndexDefinition {
    pub fn kind(&self) -> IndexKind {
        match self {
            IndexDefinition::Numeric => IndexKind::Numeric,
            IndexDefinition::Tag(_) => IndexKind::Tag,
            IndexDefinition::Text(_) => IndexKind::Text,
            IndexDefinition::Vector(params) => match params.algorithm {
                VectorAlgorithm::Hnsw { .. } => IndexKind::VectorHnsw,
                VectorAlgorithm::Flat { .. } => IndexKind::VectorFlat,
            },
        }
    }

    pub fn build(&self, intern: Arc<InternStore>) -> AttributeIndex {
        match self {
            IndexDefinition::Numeric => AttributeIndex::Numeric(NumericIndex::new()),
            IndexDefinition::Tag(options) => AttributeIndex::Tag(TagIndex::new(*options)),
            IndexDefinition::Text(options) => {
                AttributeIndex::Text(TextIndex::new(options.clone()))
            }
            IndexDefinition::Vector(params) => {
                AttributeIndex::Vector(VectorIndex::new(*params, intern))
            }
        }
    }
}

/// The polymorphic per-attribute index.
pub enum AttributeIndex {
    Numeric(NumericIndex),
    Tag(TagIndex),
    Text(TextIndex),
    Vector(VectorIndex),
}

impl AttributeIndex {
    pub fn kind(&self) -> IndexKind {
        match self {
            AttributeIndex::Numeric(_) => IndexKind::Numeric,
            AttributeIndex::Tag(_) => IndexKind::Tag,
            AttributeIndex::Text(_) => IndexKind::Text,
            AttributeIndex::Vector(v) => match v.params().algorithm {
                VectorAlgorithm::Hnsw { .. } => IndexKind::VectorHnsw,
                VectorAlgorithm::Flat { .. } => IndexKind::VectorFlat,
            },
        }
    }

    pub fn add_record(&self, key: &Key, raw: &[u8]) -> Result<bool> {
        match self {
            AttributeIndex::Numeric(index) => index.add_record(key, raw),
            AttributeIndex::Tag(index) => index.add_record(key, raw),
            AttributeIndex::Text(index) => index.add_record(key, raw),
            AttributeIndex::Vector(index) => index.add_record(key, raw),
        }
    }

    pub fn modify_record(&self, key: &Key, raw: &[u8]) -> Result<bool> {
        match self {
            AttributeIndex::Numeric(index) => index.modify_record(key, raw),
            AttributeIndex::Tag(index) => index.modify_record(key, raw),
            AttributeIndex::Text(index) => index.modify_record(key, raw),
            AttributeIndex::Vector(index) => index.modify_record(key, raw),
        }
    }

    pub fn remove_record(&self, key: &Key, kind: DeletionKind) -> Result<bool> {
        match self {
            AttributeIndex::Numeric(index) => index.remove_record(key, kind),
            AttributeIndex::Tag(index) => index.remove_record(key, kind),
            AttributeIndex::Text(index) => index.remove_record(key, kind),
            AttributeIndex::Vector(index) => index.remove_record(key, kind),
        }
    }

    pub fn is_tracked(&self, key: &Key) -> bool {
        match self {
            AttributeIndex::Numeric(index) => index.is_tracked(key),
            AttributeIndex::Tag(index) => index.is_tracked(key),
            AttributeIndex::Text(index) => index.is_tracked(key),
            AttributeIndex::Vector(index) => index.is_tracked(key),
        }
    }

    pub fn tracked_key_count(&self) -> u64 {
        match self {
            AttributeIndex::Numeric(index) => index.tracked_key_count(),
            AttributeIndex::Tag(index) => index.tracked_key_count(),
            AttributeIndex::Text(index) => index.tracked_key_count(),
            AttributeIndex::Vector(index) => index.tracked_key_count(),
        }
    }

    pub fn for_each_tracked_key(&self, visit: &mut dyn FnMut(&Key)) {
        match self {
            AttributeIndex::Numeric(index) => index.for_each_tracked_key(visit),
            AttributeIndex::Tag(index) => index.for_each_tracked_key(visit),
            AttributeIndex::Text(index) => index.for_each_tracked_key(visit),
            AttributeIndex::Vector(index) => index.for_each_tracked_key(visit),
        }
    }

    /// Resolve a filter predicate. Negation composes above this level via
    /// [`NegateFetcher`] with the schema's key registry as the universe.
    pub fn search(&self, predicate: &FilterPredicate) -> Result<Box<dyn EntriesFetcher>> {
        match (self, predicate) {
            (AttributeIndex::Numeric(index), FilterPredicate::Numeric(range)) => {
                Ok(index.search(range))
            }
            (AttributeIndex::Tag(index), FilterPredicate::Tag(tags)) => Ok(index.search(tags)),
            (AttributeIndex::Text(index), FilterPredicate::Text(query)) => Ok(index.search(query)),
            (index, predicate) => Err(EngineError::invalid_argument(format!(
                "predicate {predicate:?} does not apply to a {} attribute",
                index.kind().as_str()
            ))),
        }
    }

    /// KNN entry point; errors on non-vector attributes.
    pub fn knn(&self, query: &KnnQuery) -> Result<Vec<ScoredKey>> {
        match self {
            AttributeIndex::Vector(index) => index.knn(query),
            other => Err(EngineError::invalid_argument(format!(
                "KNN requires a vector attribute, found {}",
                other.kind().as_str()
            ))),
        }
    }

    pub fn as_vector(&self) -> Option<&VectorIndex> {
        match self {
            AttributeIndex::Vector(index) => Some(index),
            _ => None,
        }
    }

    pub fn memory_bytes(&self) -> u64 {
        match self {
            AttributeIndex::Numeric(index) => index.memory_bytes(),
            AttributeIndex::Tag(index) => index.memory_bytes(),
            AttributeIndex::Text(index) => index.memory_bytes(),
            AttributeIndex::Vector(index) => index.memory_bytes(),
        }
    }

    /// Write the primary content block for this attribute.
    pub fn save_content(&self, out: &mut ChunkedWriter<'_>) -> Result<()> {
        match self {
            AttributeIndex::Numeric(index) => index.save(out),
            AttributeIndex::Tag(index) => index.save(out),
            AttributeIndex::Text(index) => index.save(out),
            AttributeIndex::Vector(index) => index.save_content(out),
        }
    }

    /// Load the primary content block. Vector attributes defer wiring until
    /// their key map arrives (see [`VectorIndex::load_key_map`]).
    pub fn load_content(
        &self,
        input: &mut ChunkedReader<'_>,
        intern: impl Fn(&[u8]) -> Key,
    ) -> Result<Option<Vec<(usize, Vec<f32>)>>> {
        match self {
            AttributeIndex::Numeric(index) => {
                index.load(input, intern)?;
                Ok(None)
            }
            AttributeIndex::Tag(index) => {
                index.load(input, intern)?;
                Ok(None)
            }
            AttributeIndex::Text(index) => {
                index.load(input, intern)?;
                Ok(None)
            }
            AttributeIndex::Vector(index) => Ok(Some(index.load_content(input)?)),
        }
    }
}
