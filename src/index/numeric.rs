//! Numeric attribute index.
//!
//! Values are parsed as f64 and kept in an order-preserving map so range
//! predicates resolve with two bound seeks. NaN never enters the index: an
//! unparseable or non-finite value counts as skipped, which is what feeds
//! the `hash_indexing_failures` gauge upstream.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::fetcher::{EntriesFetcher, Key, VecFetcher};
use super::DeletionKind;
use crate::error::Result;
use crate::rdb::{ChunkedReader, ChunkedWriter};
use crate::wire;

/// Total order over finite f64 bit patterns.
///
/// Flipping the sign bit (negatives) or setting it (positives) maps IEEE-754
/// doubles onto monotonically increasing u64 keys.
fn order_key(value: f64) -> u64 {
    let bits = value.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// Inclusive/exclusive range over numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    pub min: f64,
    pub max: f64,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
}

impl NumericRange {
    pub fn closed(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            min_inclusive: true,
            max_inclusive: true,
        }
    }

    fn contains(&self, value: f64) -> bool {
        let above = if self.min_inclusive {
            value >= self.min
        } else {
            value > self.min
        };
        let below = if self.max_inclusive {
            value <= self.max
        } else {
            value < self.max
        };
        above && below
    }
}

#[derive(Default)]
struct NumericState {
    by_value: BTreeMap<u64, HashSet<Key>>,
    by_key: HashMap<Key, f64>,
}

/// Range index over one numeric attribute.
#[derive(Default)]
pub struct NumericIndex {
    state: RwLock<NumericState>,
}

fn parse_value(raw: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(raw).ok()?;
    let value: f64 = text.trim().parse().ok()?;
    value.is_finite().then_some(value)
}

impl NumericIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(false)` (skipped) for unparseable input.
    pub fn add_record(&self, key: &Key, raw: &[u8]) -> Result<bool> {
        let Some(value) = parse_value(raw) else {
            return Ok(false);
        };
        let mut state = self.state.write();
        if state.by_key.contains_key(key) {
            return Ok(false);
        }
        state.by_key.insert(key.clone(), value);
        state
            .by_value
            .entry(order_key(value))
            .or_default()
            .insert(key.clone());
        Ok(true)
    }

    pub fn modify_record(&self, key: &Key, raw: &[u8]) -> Result<bool> {
        let Some(value) = parse_value(raw) else {
            // The new payload is ill-typed; the record leaves the index so a
            // later valid write can re-add it.
            self.remove_record(key, DeletionKind::Field)?;
            return Ok(false);
        };
        let mut state = self.state.write();
        match state.by_key.insert(key.clone(), value) {
            Some(previous) if previous == value => return Ok(false),
            Some(previous) => {
                let old_slot = order_key(previous);
                if let Some(set) = state.by_value.get_mut(&old_slot) {
                    set.remove(key);
                    if set.is_empty() {
                        state.by_value.remove(&old_slot);
                    }
                }
            }
            None => {}
        }
        state
            .by_value
            .entry(order_key(value))
            .or_default()
            .insert(key.clone());
        Ok(true)
    }

    pub fn remove_record(&self, key: &Key, _kind: DeletionKind) -> Result<bool> {
        let mut state = self.state.write();
        let Some(value) = state.by_key.remove(key) else {
            return Ok(false);
        };
        let slot = order_key(value);
        if let Some(set) = state.by_value.get_mut(&slot) {
            set.remove(key);
            if set.is_empty() {
                state.by_value.remove(&slot);
            }
        }
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

    pub fn search(&self, range: &NumericRange) -> Box<dyn EntriesFetcher> {
        if range.min > range.max {
            return Box::new(VecFetcher::empty());
        }
        let state = self.state.read();
        let mut keys = Vec::new();
        for set in state
            .by_value
            .range(order_key(range.min)..=order_key(range.max))
            .map(|(_, set)| set)
        {
            for key in set {
                // Exclusive bounds share the seek slots; re-check per value.
                let value = state.by_key[key];
                if range.contains(value) {
                    keys.push(key.clone());
                }
            }
        }
        Box::new(VecFetcher::new(keys))
    }

    pub fn memory_bytes(&self) -> u64 {
        let state = self.state.read();
        (state.by_key.len() * (std::mem::size_of::<f64>() + std::mem::size_of::<Key>())) as u64
    }

    pub fn save(&self, out: &mut ChunkedWriter<'_>) -> Result<()> {
        let state = self.state.read();
        let entries: Vec<(Vec<u8>, f64)> = state
            .by_key
            .iter()
            .map(|(key, value)| (key.as_bytes().to_vec(), *value))
            .collect();
        out.write_blob(&wire::encode(&entries)?)
    }

    pub fn load(
        &self,
        input: &mut ChunkedReader<'_>,
        intern: impl Fn(&[u8]) -> Key,
    ) -> Result<()> {
        let entries: Vec<(Vec<u8>, f64)> = wire::decode(&input.read_blob()?)?;
        let mut state = self.state.write();
        for (key_bytes, value) in entries {
            let key = intern(&key_bytes);
            state.by_key.insert(key.clone(), value);
            state
                .by_value
                .entry(order_key(value))
                .or_default()
                .insert(key);
        }
        Ok(())
    }
}
