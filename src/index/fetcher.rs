//! Entry fetchers and their composition.
//!
//! A fetcher produces the set of interned keys matching one predicate. Query
//! plans combine them: AND intersects, OR unions, NOT subtracts from the
//! universal set — which is always the owning schema's key registry, so a
//! negation also matches documents that lack the attribute entirely.

use std::collections::HashSet;

use crate::intern::InternedStr;

/// Key type flowing through fetchers.
pub type Key = InternedStr;

/// Produces an iterator over matching keys. `estimated_len` guides join
/// ordering (smallest set drives the intersection probe).
pub trait EntriesFetcher: Send {
    fn entries(&self) -> Box<dyn Iterator<Item = Key> + '_>;

    fn estimated_len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.estimated_len() == 0
    }
}

/// Materialized fetcher over an owned key set.
pub struct VecFetcher {
    keys: Vec<Key>,
}

impl VecFetcher {
    pub fn new(keys: Vec<Key>) -> Self {
        Self { keys }
    }

    pub fn empty() -> Self {
        Self { keys: Vec::new() }
    }
}

impl EntriesFetcher for VecFetcher {
    fn entries(&self) -> Box<dyn Iterator<Item = Key> + '_> {
        Box::new(self.keys.iter().cloned())
    }

    fn estimated_len(&self) -> usize {
        self.keys.len()
    }
}

/// Intersection of all inner fetchers.
pub struct IntersectFetcher {
    inner: Vec<Box<dyn EntriesFetcher>>,
}

impl IntersectFetcher {
    pub fn new(inner: Vec<Box<dyn EntriesFetcher>>) -> Self {
        Self { inner }
    }
}

impl EntriesFetcher for IntersectFetcher {
    fn entries(&self) -> Box<dyn Iterator<Item = Key> + '_> {
        if self.inner.is_empty() {
            return Box::new(std::iter::empty());
        }
        // Probe from the smallest inner set.
        let mut order: Vec<&Box<dyn EntriesFetcher>> = self.inner.iter().collect();
        order.sort_by_key(|f| f.estimated_len());
        let (driver, rest) = order.split_first().expect("non-empty inner list");
        let rest_sets: Vec<HashSet<Key>> = rest
            .iter()
            .map(|f| f.entries().collect::<HashSet<_>>())
            .collect();
        let matching: Vec<Key> = driver
            .entries()
            .filter(|key| rest_sets.iter().all(|set| set.contains(key)))
            .collect();
        Box::new(matching.into_iter())
    }

    fn estimated_len(&self) -> usize {
        self.inner
            .iter()
            .map(|f| f.estimated_len())
            .min()
            .unwrap_or(0)
    }
}

/// Union of all inner fetchers, deduplicated.
pub struct UnionFetcher {
    inner: Vec<Box<dyn EntriesFetcher>>,
}

impl UnionFetcher {
    pub fn new(inner: Vec<Box<dyn EntriesFetcher>>) -> Self {
        Self { inner }
    }
}

impl EntriesFetcher for UnionFetcher {
    fn entries(&self) -> Box<dyn Iterator<Item = Key> + '_> {
        let mut seen: HashSet<Key> = HashSet::new();
        let mut keys = Vec::new();
        for fetcher in &self.inner {
            for key in fetcher.entries() {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        Box::new(keys.into_iter())
    }

    fn estimated_len(&self) -> usize {
        self.inner.iter().map(|f| f.estimated_len()).sum()
    }
}

/// Universal set minus the inner fetcher.
pub struct NegateFetcher {
    universe: Vec<Key>,
    inner: Box<dyn EntriesFetcher>,
}

impl NegateFetcher {
    /// `universe` is the owning schema's key registry at query time.
    pub fn over(universe: Vec<Key>, inner: Box<dyn EntriesFetcher>) -> Self {
        Self { universe, inner }
    }
}

impl EntriesFetcher for NegateFetcher {
    fn entries(&self) -> Box<dyn Iterator<Item = Key> + '_> {
        let excluded: HashSet<Key> = self.inner.entries().collect();
        Box::new(
            self.universe
                .iter()
                .filter(move |key| !excluded.contains(*key))
                .cloned(),
        )
    }

    fn estimated_len(&self) -> usize {
        self.universe
            .len()
            .saturating_sub(self.inner.estimated_len())
    }
}
