//! Vector attribute indexes: HNSW graph and flat brute force.
//!
//! Both variants share the same bookkeeping: raw vector bytes are interned
//! under [`StringCategory::Vector`] (so the externalizer can hand the same
//! allocation back to the host), parsed once into `f32` form, and assigned a
//! stable internal id. The HNSW graph cannot delete points, so removals
//! tombstone the id, flip the intern pool's delete mark (the lazy-vacuum
//! overlay), and searches over-fetch to compensate. The flat variant scans
//! with rayon and needs no tombstones.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hnsw_rs::prelude::*;
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::fetcher::Key;
use super::DeletionKind;
use crate::error::{EngineError, Result};
use crate::intern::{InternStore, InternedStr, StringCategory};
use crate::rdb::{ChunkedReader, ChunkedWriter};
use crate::wire;

/// Distance metric declared at FT.CREATE time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    L2,
    Ip,
    Cosine,
}

/// Algorithm selection plus its tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorAlgorithm {
    Hnsw {
        m: usize,
        ef_construction: usize,
        ef_runtime: usize,
    },
    Flat {
        block_size: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorParams {
    pub dim: u32,
    pub metric: DistanceMetric,
    pub algorithm: VectorAlgorithm,
    /// JSON schemas deliver vectors as number arrays, hash schemas as packed
    /// little-endian f32 bytes.
    pub json_encoded: bool,
    pub initial_cap: usize,
}

/// KNN request against a single vector attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct KnnQuery {
    pub vector: Vec<f32>,
    pub k: usize,
}

/// One scored hit.
#[derive(Debug, Clone)]
pub struct ScoredKey {
    pub key: Key,
    pub distance: f32,
}

struct VectorEntry {
    id: usize,
    raw: InternedStr,
    parsed: Arc<Vec<f32>>,
}

#[derive(Default)]
struct VectorState {
    by_key: HashMap<Key, VectorEntry>,
    by_id: HashMap<usize, Key>,
    next_id: usize,
    tombstones: HashSet<usize>,
    /// Interned vectors kept alive for ids the graph still references.
    retired: Vec<InternedStr>,
}

enum GraphBackend {
    L2(Hnsw<'static, f32, DistL2>),
    Ip(Hnsw<'static, f32, DistDot>),
    Cosine(Hnsw<'static, f32, DistCosine>),
}

const MAX_LAYER: usize = 16;

impl GraphBackend {
    fn build(metric: DistanceMetric, m: usize, capacity: usize, ef_construction: usize) -> Self {
        let capacity = capacity.max(16);
        match metric {
            DistanceMetric::L2 => Self::L2(Hnsw::new(m, capacity, MAX_LAYER, ef_construction, DistL2 {})),
            DistanceMetric::Ip => Self::Ip(Hnsw::new(m, capacity, MAX_LAYER, ef_construction, DistDot {})),
            DistanceMetric::Cosine => {
                Self::Cosine(Hnsw::new(m, capacity, MAX_LAYER, ef_construction, DistCosine {}))
            }
        }
    }

    fn insert(&self, vector: &Vec<f32>, id: usize) {
        match self {
            GraphBackend::L2(graph) => graph.insert((vector, id)),
            GraphBackend::Ip(graph) => graph.insert((vector, id)),
            GraphBackend::Cosine(graph) => graph.insert((vector, id)),
        }
    }

    fn bulk_insert(&self, data: &Vec<(&Vec<f32>, usize)>) {
        match self {
            GraphBackend::L2(graph) => graph.parallel_insert(data),
            GraphBackend::Ip(graph) => graph.parallel_insert(data),
            GraphBackend::Cosine(graph) => graph.parallel_insert(data),
        }
    }

    fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<Neighbour> {
        match self {
            GraphBackend::L2(graph) => graph.search(query, k, ef),
            GraphBackend::Ip(graph) => graph.search(query, k, ef),
            GraphBackend::Cosine(graph) => graph.search(query, k, ef),
        }
    }
}

fn flat_distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::L2 => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        DistanceMetric::Ip => 1.0 - a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        DistanceMetric::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                return 1.0;
            }
            1.0 - (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
        }
    }
}

/// ANN index over one vector attribute.
pub struct VectorIndex {
    params: VectorParams,
    intern: Arc<InternStore>,
    state: RwLock<VectorState>,
    graph: RwLock<Option<GraphBackend>>,
}

impl VectorIndex {
    pub fn new(params: VectorParams, intern: Arc<InternStore>) -> Self {
        let graph = match params.algorithm {
            VectorAlgorithm::Hnsw {
                m, ef_construction, ..
            } => Some(GraphBackend::build(
                params.metric,
                m,
                params.initial_cap,
                ef_construction,
            )),
            VectorAlgorithm::Flat { .. } => None,
        };
        Self {
            params,
            intern,
            state: RwLock::new(VectorState::default()),
            graph: RwLock::new(graph),
        }
    }

    pub fn params(&self) -> &VectorParams {
        &self.params
    }

    fn parse(&self, raw: &[u8]) -> Option<Vec<f32>> {
        let dim = self.params.dim as usize;
        if self.params.json_encoded {
            let parsed: Vec<f32> = serde_json::from_slice(raw).ok()?;
            (parsed.len() == dim && parsed.iter().all(|v| v.is_finite())).then_some(parsed)
        } else {
            if raw.len() != dim * 4 {
                return None;
            }
            let parsed: Vec<f32> = raw
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            parsed.iter().all(|v| v.is_finite()).then_some(parsed)
        }
    }

    /// Intern raw vector bytes under the vector category. The externalizer
    /// uses this to share the engine's allocation with the host.
    pub fn intern_vector(&self, raw: &[u8]) -> Option<InternedStr> {
        self.parse(raw)?;
        Some(self.intern.intern(raw, StringCategory::Vector))
    }

    pub fn add_record(&self, key: &Key, raw: &[u8]) -> Result<bool> {
        let Some(parsed) = self.parse(raw) else {
            return Ok(false);
        };
        let mut state = self.state.write();
        if state.by_key.contains_key(key) {
            return Ok(false);
        }
        let id = state.next_id;
        state.next_id += 1;
        let raw_interned = self.intern.intern(raw, StringCategory::Vector);
        let parsed = Arc::new(parsed);
        if let Some(graph) = self.graph.read().as_ref() {
            graph.insert(&parsed, id);
        }
        state.by_id.insert(id, key.clone());
        state.by_key.insert(
            key.clone(),
            VectorEntry {
                id,
                raw: raw_interned,
                parsed,
            },
        );
        Ok(true)
    }

    pub fn modify_record(&self, key: &Key, raw: &[u8]) -> Result<bool> {
        let Some(parsed) = self.parse(raw) else {
            self.remove_record(key, DeletionKind::Field)?;
            return Ok(false);
        };
        let mut state = self.state.write();
        let Some(previous) = state.by_key.remove(key) else {
            drop(state);
            return self.add_record(key, raw);
        };
        if previous.raw.as_bytes() == raw {
            state.by_key.insert(key.clone(), previous);
            return Ok(false);
        }
        self.retire_entry(&mut state, previous);
        let id = state.next_id;
        state.next_id += 1;
        let raw_interned = self.intern.intern(raw, StringCategory::Vector);
        let parsed = Arc::new(parsed);
        if let Some(graph) = self.graph.read().as_ref() {
            graph.insert(&parsed, id);
        }
        state.by_id.insert(id, key.clone());
        state.by_key.insert(
            key.clone(),
            VectorEntry {
                id,
                raw: raw_interned,
                parsed,
            },
        );
        Ok(true)
    }

    fn retire_entry(&self, state: &mut VectorState, entry: VectorEntry) {
        state.by_id.remove(&entry.id);
        if self.graph.read().is_some() {
            // The graph still holds the point: tombstone the id and mark the
            // interned bytes deleted until a rebuild vacuums them.
            state.tombstones.insert(entry.id);
            self.intern
                .set_delete_mark(entry.raw.as_bytes(), StringCategory::Vector, true);
            state.retired.push(entry.raw);
        }
    }

    pub fn remove_record(&self, key: &Key, _kind: DeletionKind) -> Result<bool> {
        let mut state = self.state.write();
        let Some(entry) = state.by_key.remove(key) else {
            return Ok(false);
        };
        self.retire_entry(&mut state, entry);
        Ok(true)
    }

    pub fn is_tracked(&self, key: &Key) -> bool {
        self.state.read().by_key.contains_key(key)
    }

    pub fn tracked_key_count(&self) -> u64 {
        self.state.read().by_key.len() as u64
    }

    pub fn for_each_tracked_key(&self, visit: &mut dyn FnMut(&Key)) {
        for key in self.state.read().by_key.keys() {
            visit(key);
        }
    }

    /// K nearest neighbors with index-reported distances.
    pub fn knn(&self, query: &KnnQuery) -> Result<Vec<ScoredKey>> {
        if query.vector.len() != self.params.dim as usize {
            return Err(EngineError::invalid_argument(format!(
                "query vector has dimension {}, index expects {}",
                query.vector.len(),
                self.params.dim
            )));
        }
        let state = self.state.read();
        let graph = self.graph.read();
        match graph.as_ref() {
            Some(graph) => {
                if state.by_key.is_empty() {
                    return Ok(Vec::new());
                }
                // Over-fetch past tombstones, bounded by the live set.
                let fetch = (query.k + state.tombstones.len())
                    .min(state.by_key.len() + state.tombstones.len());
                let ef = match self.params.algorithm {
                    VectorAlgorithm::Hnsw { ef_runtime, .. } => ef_runtime.max(fetch),
                    VectorAlgorithm::Flat { .. } => fetch,
                };
                let neighbours = graph.search(&query.vector, fetch, ef);
                Ok(neighbours
                    .into_iter()
                    .filter_map(|n| {
                        let id = n.get_origin_id();
                        if state.tombstones.contains(&id) {
                            return None;
                        }
                        state.by_id.get(&id).map(|key| ScoredKey {
                            key: key.clone(),
                            distance: n.distance,
                        })
                    })
                    .take(query.k)
                    .collect())
            }
            None => {
                let mut scored: Vec<ScoredKey> = state
                    .by_key
                    .par_iter()
                    .map(|(key, entry)| ScoredKey {
                        key: key.clone(),
                        distance: flat_distance(self.params.metric, &query.vector, &entry.parsed),
                    })
                    .collect();
                scored.sort_by(|a, b| {
                    a.distance
                        .partial_cmp(&b.distance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                scored.truncate(query.k);
                Ok(scored)
            }
        }
    }

    pub fn memory_bytes(&self) -> u64 {
        let state = self.state.read();
        (state.by_key.len() * self.params.dim as usize * std::mem::size_of::<f32>() * 2) as u64
    }

    pub fn save_content(&self, out: &mut ChunkedWriter<'_>) -> Result<()> {
        let state = self.state.read();
        let entries: Vec<(usize, Vec<f32>)> = state
            .by_key
            .values()
            .map(|entry| (entry.id, entry.parsed.as_ref().clone()))
            .collect();
        out.write_blob(&wire::encode(&(state.next_id, entries))?)
    }

    /// Key → internal-id map, stored as its own supplemental block so ids
    /// survive a save/load cycle.
    pub fn save_key_map(&self, out: &mut ChunkedWriter<'_>) -> Result<()> {
        let state = self.state.read();
        let entries: Vec<(Vec<u8>, usize)> = state
            .by_key
            .iter()
            .map(|(key, entry)| (key.as_bytes().to_vec(), entry.id))
            .collect();
        out.write_blob(&wire::encode(&entries)?)
    }

    pub fn load_content(&self, input: &mut ChunkedReader<'_>) -> Result<Vec<(usize, Vec<f32>)>> {
        let (next_id, entries): (usize, Vec<(usize, Vec<f32>)>) =
            wire::decode(&input.read_blob()?)?;
        self.state.write().next_id = next_id;
        Ok(entries)
    }

    pub fn load_key_map(
        &self,
        input: &mut ChunkedReader<'_>,
        content: Vec<(usize, Vec<f32>)>,
        intern: impl Fn(&[u8]) -> Key,
    ) -> Result<()> {
        let key_map: Vec<(Vec<u8>, usize)> = wire::decode(&input.read_blob()?)?;
        let vectors: HashMap<usize, Vec<f32>> = content.into_iter().collect();
        let mut state = self.state.write();
        for (key_bytes, id) in key_map {
            let Some(parsed) = vectors.get(&id) else {
                return Err(EngineError::internal(format!(
                    "vector content missing for id {id}"
                )));
            };
            let key = intern(&key_bytes);
            let raw = self.encode_raw(parsed);
            let raw_interned = self.intern.intern(&raw, StringCategory::Vector);
            state.by_id.insert(id, key.clone());
            state.by_key.insert(
                key,
                VectorEntry {
                    id,
                    raw: raw_interned,
                    parsed: Arc::new(parsed.clone()),
                },
            );
            state.next_id = state.next_id.max(id + 1);
        }
        drop(state);
        self.rebuild_graph();
        Ok(())
    }

    fn encode_raw(&self, parsed: &[f32]) -> Vec<u8> {
        if self.params.json_encoded {
            serde_json::to_vec(parsed).unwrap_or_default()
        } else {
            parsed.iter().flat_map(|v| v.to_le_bytes()).collect()
        }
    }

    fn rebuild_graph(&self) {
        let VectorAlgorithm::Hnsw {
            m, ef_construction, ..
        } = self.params.algorithm
        else {
            return;
        };
        let state = self.state.read();
        let graph = GraphBackend::build(
            self.params.metric,
            m,
            state.by_key.len().max(self.params.initial_cap),
            ef_construction,
        );
        let points: Vec<(&Vec<f32>, usize)> = state
            .by_key
            .values()
            .map(|entry| (entry.parsed.as_ref(), entry.id))
            .collect();
        graph.bulk_insert(&points);
        drop(state);
        *self.graph.write() = Some(graph);
    }
}
