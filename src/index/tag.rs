//! Tag attribute index.
//!
//! The raw field value is split on a single-character separator, trimmed,
//! and optionally lowercased. Each resulting tag maps to the set of keys
//! carrying it; a match predicate unions the sets of all requested tags.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::fetcher::{EntriesFetcher, Key, VecFetcher};
use super::DeletionKind;
use crate::error::Result;
use crate::rdb::{ChunkedReader, ChunkedWriter};
use crate::wire;

pub const DEFAULT_SEPARATOR: char = ',';

/// Match any of the listed tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMatch {
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagOptions {
    pub separator: char,
    pub case_sensitive: bool,
}

impl Default for TagOptions {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR,
            case_sensitive: false,
        }
    }
}

#[derive(Default)]
struct TagState {
    by_tag: HashMap<Box<str>, HashSet<Key>>,
    by_key: HashMap<Key, Vec<Box<str>>>,
}

/// Set-membership index over one tag attribute.
pub struct TagIndex {
    options: TagOptions,
    state: RwLock<TagState>,
}

impl TagIndex {
    pub fn new(options: TagOptions) -> Self {
        Self {
            options,
            state: RwLock::new(TagState::default()),
        }
    }

    pub fn options(&self) -> TagOptions {
        self.options
    }

    fn split(&self, raw: &[u8]) -> Option<Vec<Box<str>>> {
        let text = std::str::from_utf8(raw).ok()?;
        let mut tags: Vec<Box<str>> = text
            .split(self.options.separator)
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(|tag| {
                if self.options.case_sensitive {
                    Box::from(tag)
                } else {
                    Box::from(tag.to_lowercase())
                }
            })
            .collect();
        tags.sort();
        tags.dedup();
        (!tags.is_empty()).then_some(tags)
    }

    fn canonical(&self, tag: &str) -> String {
        let trimmed = tag.trim();
        if self.options.case_sensitive {
            trimmed.to_string()
        } else {
            trimmed.to_lowercase()
        }
    }

    pub fn add_record(&self, key: &Key, raw: &[u8]) -> Result<bool> {
        let Some(tags) = self.split(raw) else {
            return Ok(false);
        };
        let mut state = self.state.write();
        if state.by_key.contains_key(key) {
            return Ok(false);
        }
        for tag in &tags {
            state
                .by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        state.by_key.insert(key.clone(), tags);
        Ok(true)
    }

    pub fn modify_record(&self, key: &Key, raw: &[u8]) -> Result<bool> {
        let Some(tags) = self.split(raw) else {
            self.remove_record(key, DeletionKind::Field)?;
            return Ok(false);
        };
        let mut state = self.state.write();
        if let Some(previous) = state.by_key.remove(key) {
            if previous == tags {
                state.by_key.insert(key.clone(), previous);
                return Ok(false);
            }
            for tag in previous {
                if let Some(set) = state.by_tag.get_mut(&tag) {
                    set.remove(key);
                    if set.is_empty() {
                        state.by_tag.remove(&tag);
                    }
                }
            }
        }
        for tag in &tags {
            state
                .by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        state.by_key.insert(key.clone(), tags);
        Ok(true)
    }

    pub fn remove_record(&self, key: &Key, _kind: DeletionKind) -> Result<bool> {
        let mut state = self.state.write();
        let Some(tags) = state.by_key.remove(key) else {
            return Ok(false);
        };
        for tag in tags {
            if let Some(set) = state.by_tag.get_mut(&tag) {
                set.remove(key);
                if set.is_empty() {
                    state.by_tag.remove(&tag);
                }
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

    pub fn search(&self, predicate: &TagMatch) -> Box<dyn EntriesFetcher> {
        let state = self.state.read();
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for tag in &predicate.tags {
            let canonical = self.canonical(tag);
            if let Some(set) = state.by_tag.get(canonical.as_str()) {
                for key in set {
                    if seen.insert(key.clone()) {
                        keys.push(key.clone());
                    }
                }
            }
        }
        Box::new(VecFetcher::new(keys))
    }

    pub fn memory_bytes(&self) -> u64 {
        let state = self.state.read();
        state
            .by_tag
            .iter()
            .map(|(tag, set)| tag.len() + set.len() * std::mem::size_of::<Key>())
            .sum::<usize>() as u64
    }

    pub fn save(&self, out: &mut ChunkedWriter<'_>) -> Result<()> {
        let state = self.state.read();
        let entries: Vec<(Vec<u8>, Vec<String>)> = state
            .by_key
            .iter()
            .map(|(key, tags)| {
                (
                    key.as_bytes().to_vec(),
                    tags.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect();
        out.write_blob(&wire::encode(&entries)?)
    }

    pub fn load(
        &self,
        input: &mut ChunkedReader<'_>,
        intern: impl Fn(&[u8]) -> Key,
    ) -> Result<()> {
        let entries: Vec<(Vec<u8>, Vec<String>)> = wire::decode(&input.read_blob()?)?;
        let mut state = self.state.write();
        for (key_bytes, tags) in entries {
            let key = intern(&key_bytes);
            let tags: Vec<Box<str>> = tags.into_iter().map(|t| t.into_boxed_str()).collect();
            for tag in &tags {
                state
                    .by_tag
                    .entry(tag.clone())
                    .or_default()
                    .insert(key.clone());
            }
            state.by_key.insert(key, tags);
        }
        Ok(())
    }
}
