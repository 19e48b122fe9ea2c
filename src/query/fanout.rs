//! Cluster fanout template.
//!
//! One request fans out to all shards (or all primaries), every response is
//! classified — OK, index-name error, inconsistent-state error, or
//! communication error — and the per-operation retry predicate decides
//! whether another bounded round with backoff is worth it. Success requires
//! zero index-name and zero inconsistent-state errors; strict operations
//! additionally require zero communication errors, while
//! `enable_partial_results` downgrades missing shards to a partial reply.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::host::{ClusterTransport, NodeInfo, TargetMode};
use crate::wire::{
    FanoutErrorKind, IndexFingerprintVersion, InfoIndexPartitionRequest,
    InfoIndexPartitionResponse, PartitionRequest, PartitionResponse,
    SearchIndexPartitionRequest, SearchIndexPartitionResponse,
};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(20);

/// Error bookkeeping for one fanout round.
#[derive(Debug, Default, Clone)]
pub struct ErrorTally {
    pub index_name_nodes: Vec<String>,
    pub inconsistent_state_nodes: Vec<String>,
    pub communication_nodes: Vec<String>,
    pub internal_nodes: Vec<String>,
}

impl ErrorTally {
    fn clear(&mut self) {
        self.index_name_nodes.clear();
        self.inconsistent_state_nodes.clear();
        self.communication_nodes.clear();
        self.internal_nodes.clear();
    }

    pub fn record(&mut self, node: &str, kind: FanoutErrorKind) {
        match kind {
            FanoutErrorKind::IndexName => self.index_name_nodes.push(node.to_string()),
            FanoutErrorKind::InconsistentState => {
                self.inconsistent_state_nodes.push(node.to_string())
            }
            FanoutErrorKind::Communication => self.communication_nodes.push(node.to_string()),
            FanoutErrorKind::Internal => self.internal_nodes.push(node.to_string()),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.index_name_nodes.is_empty()
            && self.inconsistent_state_nodes.is_empty()
            && self.communication_nodes.is_empty()
            && self.internal_nodes.is_empty()
    }

    /// The reply-worthy failure, worst class first.
    pub fn worst(&self) -> Option<EngineError> {
        if let Some(node) = self.index_name_nodes.first() {
            return Some(EngineError::not_found(format!(
                "index missing on node {node}"
            )));
        }
        if let Some(node) = self.inconsistent_state_nodes.first() {
            return Some(EngineError::failed_precondition(format!(
                "cluster not in a consistent state (node {node}), please retry"
            )));
        }
        if let Some(node) = self.communication_nodes.first() {
            return Some(EngineError::unavailable(format!(
                "node {node} unreachable"
            )));
        }
        self.internal_nodes
            .first()
            .map(|node| EngineError::internal(format!("node {node} failed")))
    }
}

/// One fanned-out operation: request generation, response folding, and the
/// retry predicate.
pub trait FanoutOperation {
    fn target_mode(&self) -> TargetMode;

    fn generate_request(&self, target: &NodeInfo) -> PartitionRequest;

    /// Fold a response in; classification errors go to `tally`.
    fn on_response(&mut self, target: &NodeInfo, response: PartitionResponse, tally: &mut ErrorTally);

    fn should_retry(&self, tally: &ErrorTally, target_count: usize) -> bool;

    fn reset_for_retry(&mut self);
}

/// Drive an operation to completion with bounded retries. The local target
/// short-circuits through `local`, everything else goes over the transport.
pub fn run_fanout<O: FanoutOperation>(
    operation: &mut O,
    transport: &Arc<dyn ClusterTransport>,
    local: &dyn Fn(PartitionRequest) -> PartitionResponse,
    max_retries: u32,
    backoff: Duration,
) -> Result<ErrorTally> {
    let mut tally = ErrorTally::default();
    let mut attempt = 0;
    loop {
        tally.clear();
        let targets = transport.targets(operation.target_mode());
        if targets.is_empty() {
            return Err(EngineError::unavailable("no fanout targets available"));
        }
        for target in &targets {
            let request = operation.generate_request(target);
            let response = if target.is_local {
                Ok(local(request))
            } else {
                transport.unary(&target.node_id, request)
            };
            match response {
                Ok(response) => operation.on_response(target, response, &mut tally),
                Err(err) => {
                    debug!(node = target.node_id, %err, "fanout rpc failed");
                    tally.record(&target.node_id, FanoutErrorKind::Communication);
                }
            }
        }
        if tally.is_clean() || !operation.should_retry(&tally, targets.len()) {
            return Ok(tally);
        }
        attempt += 1;
        if attempt > max_retries {
            warn!(attempts = attempt, "fanout retry budget exhausted");
            return Ok(tally);
        }
        counter!("kvsearch_fanout_retries").increment(1);
        operation.reset_for_retry();
        std::thread::sleep(backoff * attempt);
    }
}

fn classify_info_response(
    resp: &InfoIndexPartitionResponse,
    target: &NodeInfo,
    tally: &mut ErrorTally,
) -> bool {
    if let Some(error) = &resp.error {
        debug!(node = target.node_id, error, "info partition error");
        tally.record(
            &target.node_id,
            resp.error_kind.unwrap_or(FanoutErrorKind::Internal),
        );
        return false;
    }
    if !resp.exists {
        tally.record(&target.node_id, FanoutErrorKind::IndexName);
        return false;
    }
    true
}

// ── Search ──────────────────────────────────────────────────────────────

/// All-shard search fan with top-K merge.
pub struct SearchFanout {
    request: SearchIndexPartitionRequest,
    responses: Vec<SearchIndexPartitionResponse>,
}

impl SearchFanout {
    pub fn new(request: SearchIndexPartitionRequest) -> Self {
        Self {
            request,
            responses: Vec::new(),
        }
    }

    pub fn into_merged(self, k: usize, knn: bool) -> SearchIndexPartitionResponse {
        super::merge_responses(self.responses, k, knn)
    }

    pub fn partial_count(&self) -> usize {
        self.responses.len()
    }
}

impl FanoutOperation for SearchFanout {
    fn target_mode(&self) -> TargetMode {
        TargetMode::All
    }

    fn generate_request(&self, _target: &NodeInfo) -> PartitionRequest {
        PartitionRequest::Search(self.request.clone())
    }

    fn on_response(
        &mut self,
        target: &NodeInfo,
        response: PartitionResponse,
        tally: &mut ErrorTally,
    ) {
        match response {
            PartitionResponse::Search(resp) => self.responses.push(resp),
            PartitionResponse::Info(info) => {
                // A shard that failed validation answers with a classified
                // info error instead of a result set.
                classify_info_response(&info, target, tally);
            }
            other => {
                warn!(node = target.node_id, ?other, "unexpected search response");
                tally.record(&target.node_id, FanoutErrorKind::Internal);
            }
        }
    }

    fn should_retry(&self, tally: &ErrorTally, _target_count: usize) -> bool {
        !tally.inconsistent_state_nodes.is_empty() || !tally.communication_nodes.is_empty()
    }

    fn reset_for_retry(&mut self) {
        self.responses.clear();
    }
}

// ── Info ────────────────────────────────────────────────────────────────

/// Primary-only info aggregation (FT.INFO GLOBAL).
pub struct InfoFanout {
    request: InfoIndexPartitionRequest,
    pub exists: bool,
    pub num_docs: u64,
    pub num_records: u64,
    pub hash_indexing_failures: u64,
}

impl InfoFanout {
    pub fn new(
        db_num: u32,
        index_name: &str,
        require_consistency: bool,
        expected: Option<IndexFingerprintVersion>,
    ) -> Self {
        Self {
            request: InfoIndexPartitionRequest {
                db_num,
                index_name: index_name.to_string(),
                index_fingerprint_version: expected,
                require_consistency,
                slot_fingerprint: None,
            },
            exists: false,
            num_docs: 0,
            num_records: 0,
            hash_indexing_failures: 0,
        }
    }
}

impl FanoutOperation for InfoFanout {
    fn target_mode(&self) -> TargetMode {
        TargetMode::Primaries
    }

    fn generate_request(&self, _target: &NodeInfo) -> PartitionRequest {
        PartitionRequest::Info(self.request.clone())
    }

    fn on_response(
        &mut self,
        target: &NodeInfo,
        response: PartitionResponse,
        tally: &mut ErrorTally,
    ) {
        let PartitionResponse::Info(resp) = response else {
            tally.record(&target.node_id, FanoutErrorKind::Internal);
            return;
        };
        if !classify_info_response(&resp, target, tally) {
            return;
        }
        self.exists = true;
        self.num_docs += resp.num_docs;
        self.num_records += resp.num_records;
        self.hash_indexing_failures += resp.hash_indexing_failures;
    }

    fn should_retry(&self, tally: &ErrorTally, _target_count: usize) -> bool {
        !tally.inconsistent_state_nodes.is_empty()
            || !tally.communication_nodes.is_empty()
            || !tally.index_name_nodes.is_empty()
    }

    fn reset_for_retry(&mut self) {
        self.exists = false;
        self.num_docs = 0;
        self.num_records = 0;
        self.hash_indexing_failures = 0;
    }
}

// ── Consistency checks around create/drop ───────────────────────────────

/// After FT.CREATE: every shard must know the index at one
/// `(fingerprint, version)`.
pub struct CreateConsistencyCheck {
    request: InfoIndexPartitionRequest,
    fingerprint: Option<u64>,
    version: Option<u32>,
    index_name: String,
    pub consistent: bool,
}

impl CreateConsistencyCheck {
    pub fn new(db_num: u32, index_name: &str) -> Self {
        Self {
            request: InfoIndexPartitionRequest {
                db_num,
                index_name: index_name.to_string(),
                ..Default::default()
            },
            fingerprint: None,
            version: None,
            index_name: index_name.to_string(),
            consistent: false,
        }
    }
}

impl FanoutOperation for CreateConsistencyCheck {
    fn target_mode(&self) -> TargetMode {
        TargetMode::All
    }

    fn generate_request(&self, _target: &NodeInfo) -> PartitionRequest {
        PartitionRequest::Info(self.request.clone())
    }

    fn on_response(
        &mut self,
        target: &NodeInfo,
        response: PartitionResponse,
        tally: &mut ErrorTally,
    ) {
        let PartitionResponse::Info(resp) = response else {
            tally.record(&target.node_id, FanoutErrorKind::Internal);
            return;
        };
        if !classify_info_response(&resp, target, tally) {
            return;
        }
        if resp.index_name != self.index_name {
            tally.record(&target.node_id, FanoutErrorKind::InconsistentState);
            return;
        }
        match (self.fingerprint, self.version) {
            (None, None) => {
                self.fingerprint = Some(resp.schema_fingerprint);
                self.version = Some(resp.schema_version);
            }
            (Some(fingerprint), Some(version)) => {
                if fingerprint != resp.schema_fingerprint || version != resp.schema_version {
                    tally.record(&target.node_id, FanoutErrorKind::InconsistentState);
                    return;
                }
            }
            _ => unreachable!("fingerprint and version are set together"),
        }
        self.consistent = true;
    }

    fn should_retry(&self, tally: &ErrorTally, _target_count: usize) -> bool {
        !tally.inconsistent_state_nodes.is_empty() || !tally.communication_nodes.is_empty()
    }

    fn reset_for_retry(&mut self) {
        self.fingerprint = None;
        self.version = None;
        self.consistent = false;
    }
}

/// After FT.DROPINDEX: retry until *every* target reports the index gone.
pub struct DropConsistencyCheck {
    request: InfoIndexPartitionRequest,
}

impl DropConsistencyCheck {
    pub fn new(db_num: u32, index_name: &str) -> Self {
        Self {
            request: InfoIndexPartitionRequest {
                db_num,
                index_name: index_name.to_string(),
                ..Default::default()
            },
        }
    }
}

impl FanoutOperation for DropConsistencyCheck {
    fn target_mode(&self) -> TargetMode {
        TargetMode::All
    }

    fn generate_request(&self, _target: &NodeInfo) -> PartitionRequest {
        PartitionRequest::Info(self.request.clone())
    }

    fn on_response(
        &mut self,
        target: &NodeInfo,
        response: PartitionResponse,
        tally: &mut ErrorTally,
    ) {
        let PartitionResponse::Info(resp) = response else {
            tally.record(&target.node_id, FanoutErrorKind::Internal);
            return;
        };
        // Not-found is the success condition here.
        classify_info_response(&resp, target, tally);
    }

    fn should_retry(&self, tally: &ErrorTally, target_count: usize) -> bool {
        !tally.inconsistent_state_nodes.is_empty()
            || !tally.communication_nodes.is_empty()
            || tally.index_name_nodes.len() != target_count
    }

    fn reset_for_retry(&mut self) {}
}

/// Drop succeeded when every target answered "no such index".
pub fn drop_check_succeeded(tally: &ErrorTally, target_count: usize) -> bool {
    tally.index_name_nodes.len() == target_count
        && tally.inconsistent_state_nodes.is_empty()
        && tally.communication_nodes.is_empty()
}
