//! Query model and single-shard execution.
//!
//! A parsed query is a [`QueryExpr`] tree: KNN at the top or any boolean
//! combination of per-attribute filters. Execution happens under the read
//! side of the schema's time-sliced lock; the MULTI side queue drains first
//! so a search initiated after EXEC observes the whole transaction.
//! Filter-only hits score [`IndexSchema::default_score`]; KNN hits carry the
//! index-reported distance. The two never mix into one number.

pub mod fanout;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::host::SharedHost;
use crate::index::{
    EntriesFetcher, FilterPredicate, IntersectFetcher, KnnQuery, NegateFetcher, UnionFetcher,
    VecFetcher,
};
use crate::schema::IndexSchema;
use crate::wire::{IndexFingerprintVersion, Neighbor, SearchIndexPartitionResponse};

/// Parsed query tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryExpr {
    /// `*` — every indexed document.
    All,
    /// One attribute predicate.
    Filter {
        attribute: String,
        predicate: FilterPredicate,
    },
    And(Vec<QueryExpr>),
    Or(Vec<QueryExpr>),
    Not(Box<QueryExpr>),
    /// K nearest neighbors, optionally restricted to a filter subtree.
    Knn {
        attribute: String,
        k: u32,
        vector: Vec<f32>,
        filter: Option<Box<QueryExpr>>,
    },
}

impl QueryExpr {
    pub fn knn_k(&self) -> Option<u32> {
        match self {
            QueryExpr::Knn { k, .. } => Some(*k),
            _ => None,
        }
    }
}

/// Cooperative cancellation: queries poll between stages.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Per-search execution parameters.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub no_content: bool,
    pub timeout: Duration,
    pub limit_offset: usize,
    pub limit_num: usize,
    pub enable_partial_results: bool,
    pub require_consistency: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            no_content: false,
            timeout: Duration::from_secs(1),
            limit_offset: 0,
            limit_num: 10,
            enable_partial_results: false,
            require_consistency: false,
        }
    }
}

/// Reject a partition request whose expectations do not match this shard.
pub fn validate_consistency(
    schema: &IndexSchema,
    expected: Option<IndexFingerprintVersion>,
    expected_slot: Option<u64>,
    local_slot: u64,
) -> Result<()> {
    if let Some(expected) = expected {
        if expected.fingerprint != schema.fingerprint() || expected.version != schema.version() {
            return Err(EngineError::failed_precondition(format!(
                "index fingerprint/version mismatch: expected {}/{}, have {}/{}",
                expected.fingerprint,
                expected.version,
                schema.fingerprint(),
                schema.version()
            )));
        }
    }
    if let Some(slot) = expected_slot {
        if slot != local_slot {
            return Err(EngineError::failed_precondition(format!(
                "slot fingerprint mismatch: expected {slot}, have {local_slot}"
            )));
        }
    }
    Ok(())
}

fn resolve_filter(
    schema: &IndexSchema,
    expr: &QueryExpr,
) -> Result<Box<dyn EntriesFetcher>> {
    match expr {
        QueryExpr::All => Ok(Box::new(VecFetcher::new(schema.key_universe()))),
        QueryExpr::Filter {
            attribute,
            predicate,
        } => {
            let attr = schema.attribute(attribute).ok_or_else(|| {
                EngineError::not_found(format!("unknown attribute @{attribute}"))
            })?;
            attr.index().search(predicate)
        }
        QueryExpr::And(parts) => {
            let inner = parts
                .iter()
                .map(|part| resolve_filter(schema, part))
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(IntersectFetcher::new(inner)))
        }
        QueryExpr::Or(parts) => {
            let inner = parts
                .iter()
                .map(|part| resolve_filter(schema, part))
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(UnionFetcher::new(inner)))
        }
        QueryExpr::Not(inner) => {
            let matched = resolve_filter(schema, inner)?;
            Ok(Box::new(NegateFetcher::over(schema.key_universe(), matched)))
        }
        QueryExpr::Knn { .. } => Err(EngineError::invalid_argument(
            "KNN cannot nest inside a boolean filter",
        )),
    }
}

fn resolve_contents(
    schema: &IndexSchema,
    host: &SharedHost,
    key: &[u8],
) -> Vec<(String, Vec<u8>)> {
    let mut contents = Vec::new();
    for attribute in schema.attributes() {
        let value = match schema.data_type() {
            crate::host::RecordKind::Hash => {
                host.hash_field(schema.db_num(), key, attribute.identifier().as_bytes())
            }
            crate::host::RecordKind::Json => {
                host.json_path(schema.db_num(), key, attribute.identifier())
            }
        };
        if let Some(value) = value {
            contents.push((attribute.alias().to_string(), value.to_vec()));
        }
    }
    contents
}

/// Execute one query against the local shard, under the reader side of the
/// schema's time-sliced lock.
pub fn execute_local(
    schema: &Arc<IndexSchema>,
    host: &SharedHost,
    expr: &QueryExpr,
    options: &SearchOptions,
    cancellation: &CancellationToken,
) -> Result<SearchIndexPartitionResponse> {
    let deadline = Instant::now() + options.timeout;
    // A search is the lazy drain point for pending MULTI mutations.
    schema.process_multi_queue();

    let check = |stage: &str| -> Result<()> {
        if cancellation.is_cancelled() {
            return Err(EngineError::DeadlineExceeded(format!(
                "query cancelled during {stage}"
            )));
        }
        if Instant::now() > deadline {
            return Err(EngineError::DeadlineExceeded(format!(
                "query deadline passed during {stage}"
            )));
        }
        Ok(())
    };
    check("setup")?;

    let _reader = schema.time_slice().read();
    let default_score = schema.default_score() as f32;

    let (mut scored, total): (Vec<(Vec<u8>, f32)>, u64) = match expr {
        QueryExpr::Knn {
            attribute,
            k,
            vector,
            filter,
        } => {
            let attr = schema.attribute(attribute).ok_or_else(|| {
                EngineError::not_found(format!("unknown attribute @{attribute}"))
            })?;
            let allowed: Option<std::collections::HashSet<crate::index::Key>> = match filter {
                Some(filter_expr) => {
                    let fetcher = resolve_filter(schema, filter_expr)?;
                    Some(fetcher.entries().collect())
                }
                None => None,
            };
            check("filter resolution")?;
            // Over-fetch past filtered-out candidates; exact for flat,
            // best-effort for the graph.
            let fetch_k = match &allowed {
                Some(allowed) => {
                    let universe = schema.key_universe().len();
                    (*k as usize + universe.saturating_sub(allowed.len())).min(universe.max(1))
                }
                None => *k as usize,
            };
            let hits = attr.index().knn(&KnnQuery {
                vector: vector.clone(),
                k: fetch_k,
            })?;
            let filtered: Vec<(Vec<u8>, f32)> = hits
                .into_iter()
                .filter(|hit| {
                    allowed
                        .as_ref()
                        .map_or(true, |allowed| allowed.contains(&hit.key))
                })
                .take(*k as usize)
                .map(|hit| (hit.key.as_bytes().to_vec(), hit.distance))
                .collect();
            let total = filtered.len() as u64;
            (filtered, total)
        }
        filter_expr => {
            let fetcher = resolve_filter(schema, filter_expr)?;
            check("filter resolution")?;
            let mut keys: Vec<(Vec<u8>, f32)> = fetcher
                .entries()
                .map(|key| (key.as_bytes().to_vec(), default_score))
                .collect();
            keys.sort_by(|a, b| a.0.cmp(&b.0));
            let total = keys.len() as u64;
            (keys, total)
        }
    };
    check("match")?;

    // KNN results arrive distance-ordered; keep them stable otherwise.
    if matches!(expr, QueryExpr::Knn { .. }) {
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    }
    // Bound the payload before resolving contents; `total` already counted
    // the full match set.
    scored.truncate(options.limit_offset.saturating_add(options.limit_num));

    let neighbors = scored
        .into_iter()
        .map(|(key, score)| {
            let attribute_contents = if options.no_content {
                None
            } else {
                Some(resolve_contents(schema, host, &key))
            };
            Neighbor {
                key,
                score,
                attribute_contents,
            }
        })
        .collect();
    Ok(SearchIndexPartitionResponse {
        neighbors,
        total_count: total,
    })
}

/// Merge per-shard responses into the final top-K.
pub fn merge_responses(
    mut responses: Vec<SearchIndexPartitionResponse>,
    k: usize,
    knn: bool,
) -> SearchIndexPartitionResponse {
    let total_count = responses.iter().map(|r| r.total_count).sum();
    let mut neighbors: Vec<Neighbor> = responses
        .drain(..)
        .flat_map(|r| r.neighbors)
        .collect();
    if knn {
        neighbors.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
    } else {
        neighbors.sort_by(|a, b| a.key.cmp(&b.key));
        neighbors.dedup_by(|a, b| a.key == b.key);
    }
    neighbors.truncate(k);
    SearchIndexPartitionResponse {
        neighbors,
        total_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;
    use crate::host::RecordKind;
    use crate::index::{
        DistanceMetric, IndexDefinition, NumericRange, TagMatch, TagOptions, VectorAlgorithm,
        VectorParams,
    };
    use crate::intern::InternStore;
    use crate::schema::{AttributeProto, SchemaProto};
    use crate::timeslice::TimeSliceConfig;

    fn setup() -> (Arc<MemoryHost>, Arc<IndexSchema>) {
        let host = Arc::new(MemoryHost::new());
        let proto = SchemaProto {
            name: "idx".into(),
            db_num: 0,
            data_type: RecordKind::Hash,
            key_prefixes: vec!["doc:".into()],
            attributes: vec![
                AttributeProto {
                    alias: "n".into(),
                    identifier: "n".into(),
                    definition: IndexDefinition::Numeric,
                },
                AttributeProto {
                    alias: "t".into(),
                    identifier: "t".into(),
                    definition: IndexDefinition::Tag(TagOptions::default()),
                },
                AttributeProto {
                    alias: "v".into(),
                    identifier: "v".into(),
                    definition: IndexDefinition::Vector(VectorParams {
                        dim: 2,
                        metric: DistanceMetric::L2,
                        algorithm: VectorAlgorithm::Flat { block_size: 1024 },
                        json_encoded: false,
                        initial_cap: 16,
                    }),
                },
            ],
            documents_count: 0,
        };
        let schema = IndexSchema::create(
            &proto,
            host.clone(),
            Arc::new(InternStore::new()),
            None,
            TimeSliceConfig::default(),
            false,
            true,
        )
        .unwrap();
        for (i, (n, t)) in [("1.5", "red"), ("2.5", "blue"), ("3.5", "red")]
            .iter()
            .enumerate()
        {
            let vec_bytes: Vec<u8> = [i as f32, 0.0].iter().flat_map(|v| v.to_le_bytes()).collect();
            host.hash_set(
                0,
                format!("doc:{i}").as_bytes(),
                &[(b"n", n.as_bytes()), (b"t", t.as_bytes()), (b"v", &vec_bytes)],
            );
            schema.process_keyspace_notification(format!("doc:{i}").as_bytes(), false);
        }
        (host, schema)
    }

    fn names(resp: &SearchIndexPartitionResponse) -> Vec<String> {
        resp.neighbors
            .iter()
            .map(|n| String::from_utf8_lossy(&n.key).into_owned())
            .collect()
    }

    #[test]
    fn numeric_range_filter() {
        let (host, schema) = setup();
        let host: SharedHost = host;
        let resp = execute_local(
            &schema,
            &host,
            &QueryExpr::Filter {
                attribute: "n".into(),
                predicate: FilterPredicate::Numeric(NumericRange::closed(1.0, 2.0)),
            },
            &SearchOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(names(&resp), vec!["doc:0"]);
        assert_eq!(resp.total_count, 1);
        // Content resolution includes every present attribute.
        let contents = resp.neighbors[0].attribute_contents.as_ref().unwrap();
        assert!(contents.iter().any(|(alias, value)| alias == "n" && value == b"1.5"));
    }

    #[test]
    fn boolean_composition() {
        let (host, schema) = setup();
        let host: SharedHost = host;
        let tag_red = QueryExpr::Filter {
            attribute: "t".into(),
            predicate: FilterPredicate::Tag(TagMatch {
                tags: vec!["red".into()],
            }),
        };
        let high_n = QueryExpr::Filter {
            attribute: "n".into(),
            predicate: FilterPredicate::Numeric(NumericRange::closed(3.0, 9.0)),
        };
        let resp = execute_local(
            &schema,
            &host,
            &QueryExpr::And(vec![tag_red.clone(), high_n]),
            &SearchOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(names(&resp), vec!["doc:2"]);

        let resp = execute_local(
            &schema,
            &host,
            &QueryExpr::Not(Box::new(tag_red)),
            &SearchOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(names(&resp), vec!["doc:1"]);
    }

    #[test]
    fn knn_returns_distances() {
        let (host, schema) = setup();
        let host: SharedHost = host;
        let resp = execute_local(
            &schema,
            &host,
            &QueryExpr::Knn {
                attribute: "v".into(),
                k: 2,
                vector: vec![0.1, 0.0],
                filter: None,
            },
            &SearchOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(names(&resp), vec!["doc:0", "doc:1"]);
        assert!(resp.neighbors[0].score < resp.neighbors[1].score);
    }

    #[test]
    fn knn_with_filter() {
        let (host, schema) = setup();
        let host: SharedHost = host;
        let resp = execute_local(
            &schema,
            &host,
            &QueryExpr::Knn {
                attribute: "v".into(),
                k: 2,
                vector: vec![0.0, 0.0],
                filter: Some(Box::new(QueryExpr::Filter {
                    attribute: "t".into(),
                    predicate: FilterPredicate::Tag(TagMatch {
                        tags: vec!["red".into()],
                    }),
                })),
            },
            &SearchOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(names(&resp), vec!["doc:0", "doc:2"]);
    }

    #[test]
    fn unknown_attribute_is_not_found() {
        let (host, schema) = setup();
        let host: SharedHost = host;
        let result = execute_local(
            &schema,
            &host,
            &QueryExpr::Filter {
                attribute: "missing".into(),
                predicate: FilterPredicate::Numeric(NumericRange::closed(0.0, 1.0)),
            },
            &SearchOptions::default(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[test]
    fn cancellation_aborts() {
        let (host, schema) = setup();
        let host: SharedHost = host;
        let token = CancellationToken::new();
        token.cancel();
        let result = execute_local(
            &schema,
            &host,
            &QueryExpr::All,
            &SearchOptions::default(),
            &token,
        );
        assert!(matches!(result, Err(EngineError::DeadlineExceeded(_))));
    }

    #[test]
    fn consistency_validation() {
        let (_, schema) = setup();
        schema.set_fingerprint_version(10, 2);
        assert!(validate_consistency(
            &schema,
            Some(IndexFingerprintVersion {
                fingerprint: 10,
                version: 2
            }),
            Some(5),
            5
        )
        .is_ok());
        assert!(matches!(
            validate_consistency(
                &schema,
                Some(IndexFingerprintVersion {
                    fingerprint: 11,
                    version: 2
                }),
                None,
                0
            ),
            Err(EngineError::FailedPrecondition(_))
        ));
        assert!(matches!(
            validate_consistency(&schema, None, Some(5), 6),
            Err(EngineError::FailedPrecondition(_))
        ));
    }

    #[test]
    fn merge_truncates_to_k() {
        let shard = |keys: &[(&str, f32)]| SearchIndexPartitionResponse {
            neighbors: keys
                .iter()
                .map(|(key, score)| Neighbor {
                    key: key.as_bytes().to_vec(),
                    score: *score,
                    attribute_contents: None,
                })
                .collect(),
            total_count: keys.len() as u64,
        };
        let merged = merge_responses(
            vec![
                shard(&[("a", 0.3), ("b", 0.1)]),
                shard(&[("c", 0.2), ("d", 0.9)]),
            ],
            3,
            true,
        );
        assert_eq!(
            merged
                .neighbors
                .iter()
                .map(|n| n.key.as_slice())
                .collect::<Vec<_>>(),
            vec![b"b".as_slice(), b"c", b"a"]
        );
        assert_eq!(merged.total_count, 4);
    }
}
