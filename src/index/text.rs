//! Full-text attribute index.
//!
//! Documents tokenize into lowercased terms; each term owns a posting — a
//! roaring bitmap of dense per-index document ids, plus per-document
//! positions when offsets are enabled. Matching covers exact terms, prefix,
//! suffix, contains, `*`/`?` wildcards, bounded-distance fuzzy terms, and
//! positional phrases. Suffix and contains queries are served from a
//! reversed-term map when the attribute was declared with suffix support
//! and fall back to a dictionary sweep otherwise.
//!
//! With offsets disabled the index runs in boolean posting mode: every
//! inserted posting records position 0 no matter what position the caller
//! supplies, which keeps phrase queries degrading to plain intersection.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use super::fetcher::{EntriesFetcher, Key, VecFetcher};
use super::DeletionKind;
use crate::error::Result;
use crate::rdb::{ChunkedReader, ChunkedWriter};
use crate::wire;

/// Punctuation characters treated as token separators.
const DEFAULT_PUNCTUATION: &str = ",.<>{}[]\"':;!@#$%^&*()-+=~?/\\|";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextOptions {
    /// Maintain the reversed-term map for suffix/contains acceleration.
    pub with_suffix_trie: bool,
    /// Record token positions (disables boolean posting mode).
    pub with_offsets: bool,
    /// Stemming requested at schema creation; honored by a host-provided
    /// stemmer, recorded here for FT.INFO and RDB fidelity.
    pub stemming: bool,
    pub min_stem_size: u32,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            with_suffix_trie: false,
            with_offsets: true,
            stemming: true,
            min_stem_size: 4,
        }
    }
}

/// Text predicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextMatch {
    Term(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    /// `*` and `?` glob over the term dictionary.
    Wildcard(String),
    Fuzzy {
        term: String,
        max_distance: u32,
    },
    Phrase(Vec<String>),
}

#[derive(Default)]
struct Posting {
    docs: RoaringBitmap,
    positions: HashMap<u32, Vec<u32>>,
}

impl Posting {
    /// Boolean posting mode pins every stored position to 0.
    fn insert(&mut self, doc: u32, position: u32, boolean_mode: bool) {
        self.docs.insert(doc);
        let stored = if boolean_mode { 0 } else { position };
        self.positions.entry(doc).or_default().push(stored);
    }

    fn remove_doc(&mut self, doc: u32) {
        self.docs.remove(doc);
        self.positions.remove(&doc);
    }

    fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[derive(Default)]
struct TextState {
    doc_ids: HashMap<Key, u32>,
    docs: Vec<Option<Key>>,
    free_ids: Vec<u32>,
    terms: BTreeMap<Box<str>, Posting>,
    /// reversed term → term, present when suffix support is on.
    reversed: BTreeMap<Box<str>, Box<str>>,
    doc_terms: HashMap<u32, Vec<Box<str>>>,
}

impl TextState {
    fn allocate_doc(&mut self, key: &Key) -> u32 {
        if let Some(id) = self.free_ids.pop() {
            self.docs[id as usize] = Some(key.clone());
            self.doc_ids.insert(key.clone(), id);
            return id;
        }
        let id = self.docs.len() as u32;
        self.docs.push(Some(key.clone()));
        self.doc_ids.insert(key.clone(), id);
        id
    }

    fn release_doc(&mut self, key: &Key) -> Option<u32> {
        let id = self.doc_ids.remove(key)?;
        self.docs[id as usize] = None;
        self.free_ids.push(id);
        Some(id)
    }
}

/// Postings index over one text attribute.
pub struct TextIndex {
    options: TextOptions,
    state: RwLock<TextState>,
}

/// Lowercased alphanumeric tokens with their positions.
pub fn tokenize(raw: &str) -> Vec<(String, u32)> {
    raw.split(|c: char| c.is_whitespace() || DEFAULT_PUNCTUATION.contains(c))
        .filter(|token| !token.is_empty())
        .enumerate()
        .map(|(position, token)| (token.to_lowercase(), position as u32))
        .collect()
}

fn reversed(term: &str) -> Box<str> {
    term.chars().rev().collect::<String>().into_boxed_str()
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    // Iterative star backtracking.
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut star_t) = (None::<usize>, 0usize);
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(star_p) = star {
            p = star_p + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

fn levenshtein_within(a: &str, b: &str, max: u32) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    if n.abs_diff(m) > max as usize {
        return false;
    }
    let mut previous: Vec<u32> = (0..=m as u32).collect();
    for i in 1..=n {
        let mut current = vec![i as u32; m + 1];
        for j in 1..=m {
            let substitution = previous[j - 1] + u32::from(a[i - 1] != b[j - 1]);
            current[j] = substitution
                .min(previous[j] + 1)
                .min(current[j - 1] + 1);
        }
        if current.iter().min().copied().unwrap_or(u32::MAX) > max {
            return false;
        }
        previous = current;
    }
    previous[m] <= max
}

impl TextIndex {
    pub fn new(options: TextOptions) -> Self {
        Self {
            options,
            state: RwLock::new(TextState::default()),
        }
    }

    pub fn options(&self) -> &TextOptions {
        &self.options
    }

    fn boolean_mode(&self) -> bool {
        !self.options.with_offsets
    }

    fn index_tokens(&self, state: &mut TextState, doc: u32, tokens: &[(String, u32)]) {
        let boolean_mode = self.boolean_mode();
        let mut doc_terms: Vec<Box<str>> = Vec::with_capacity(tokens.len());
        for (term, position) in tokens {
            let term_key: Box<str> = term.as_str().into();
            if !state.terms.contains_key(&term_key) && self.options.with_suffix_trie {
                state.reversed.insert(reversed(term), term_key.clone());
            }
            state
                .terms
                .entry(term_key.clone())
                .or_default()
                .insert(doc, *position, boolean_mode);
            doc_terms.push(term_key);
        }
        doc_terms.sort();
        doc_terms.dedup();
        state.doc_terms.insert(doc, doc_terms);
    }

    fn unindex_doc(&self, state: &mut TextState, doc: u32) {
        let Some(terms) = state.doc_terms.remove(&doc) else {
            return;
        };
        for term in terms {
            let gone = if let Some(posting) = state.terms.get_mut(&term) {
                posting.remove_doc(doc);
                posting.is_empty()
            } else {
                false
            };
            if gone {
                state.terms.remove(&term);
                if self.options.with_suffix_trie {
                    state.reversed.remove(&reversed(&term));
                }
            }
        }
    }

    pub fn add_record(&self, key: &Key, raw: &[u8]) -> Result<bool> {
        let Ok(text) = std::str::from_utf8(raw) else {
            return Ok(false);
        };
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Ok(false);
        }
        let mut state = self.state.write();
        if state.doc_ids.contains_key(key) {
            return Ok(false);
        }
        let doc = state.allocate_doc(key);
        self.index_tokens(&mut state, doc, &tokens);
        Ok(true)
    }

    pub fn modify_record(&self, key: &Key, raw: &[u8]) -> Result<bool> {
        let Ok(text) = std::str::from_utf8(raw) else {
            self.remove_record(key, DeletionKind::Field)?;
            return Ok(false);
        };
        let tokens = tokenize(text);
        if tokens.is_empty() {
            self.remove_record(key, DeletionKind::Field)?;
            return Ok(false);
        }
        let mut state = self.state.write();
        let doc = match state.doc_ids.get(key) {
            Some(id) => {
                let id = *id;
                self.unindex_doc(&mut state, id);
                id
            }
            None => state.allocate_doc(key),
        };
        self.index_tokens(&mut state, doc, &tokens);
        Ok(true)
    }

    pub fn remove_record(&self, key: &Key, _kind: DeletionKind) -> Result<bool> {
        let mut state = self.state.write();
        let Some(doc) = state.release_doc(key) else {
            return Ok(false);
        };
        self.unindex_doc(&mut state, doc);
        Ok(true)
    }

    pub fn is_tracked(&self, key: &Key) -> bool {
        self.state.read().doc_ids.contains_key(key)
    }

    pub fn tracked_key_count(&self) -> u64 {
        self.state.read().doc_ids.len() as u64
    }

    pub fn term_count(&self) -> u64 {
        self.state.read().terms.len() as u64
    }

    pub fn for_each_tracked_key(&self, visit: &mut dyn FnMut(&Key)) {
        for key in self.state.read().doc_ids.keys() {
            visit(key);
        }
    }

    fn docs_to_keys(state: &TextState, docs: &RoaringBitmap) -> Vec<Key> {
        docs.iter()
            .filter_map(|doc| state.docs.get(doc as usize).and_then(Clone::clone))
            .collect()
    }

    fn matching_terms<'s>(&self, state: &'s TextState, predicate: &TextMatch) -> Vec<&'s str> {
        match predicate {
            TextMatch::Term(term) => {
                let needle = term.to_lowercase();
                state
                    .terms
                    .get_key_value(needle.as_str())
                    .map(|(k, _)| vec![k.as_ref()])
                    .unwrap_or_default()
            }
            TextMatch::Prefix(prefix) => {
                let needle = prefix.to_lowercase();
                state
                    .terms
                    .range::<str, _>((
                        std::ops::Bound::Included(needle.as_str()),
                        std::ops::Bound::Unbounded,
                    ))
                    .take_while(|(term, _)| term.starts_with(needle.as_str()))
                    .map(|(term, _)| term.as_ref())
                    .collect()
            }
            TextMatch::Suffix(suffix) => {
                let needle = suffix.to_lowercase();
                if self.options.with_suffix_trie {
                    let probe: String = needle.chars().rev().collect();
                    state
                        .reversed
                        .range::<str, _>((
                            std::ops::Bound::Included(probe.as_str()),
                            std::ops::Bound::Unbounded,
                        ))
                        .take_while(|(rev, _)| rev.starts_with(probe.as_str()))
                        .map(|(_, term)| term.as_ref())
                        .collect()
                } else {
                    state
                        .terms
                        .keys()
                        .filter(|term| term.ends_with(needle.as_str()))
                        .map(|term| term.as_ref())
                        .collect()
                }
            }
            TextMatch::Contains(infix) => {
                let needle = infix.to_lowercase();
                state
                    .terms
                    .keys()
                    .filter(|term| term.contains(needle.as_str()))
                    .map(|term| term.as_ref())
                    .collect()
            }
            TextMatch::Wildcard(pattern) => {
                let needle = pattern.to_lowercase();
                state
                    .terms
                    .keys()
                    .filter(|term| glob_match(&needle, term))
                    .map(|term| term.as_ref())
                    .collect()
            }
            TextMatch::Fuzzy { term, max_distance } => {
                let needle = term.to_lowercase();
                state
                    .terms
                    .keys()
                    .filter(|candidate| levenshtein_within(&needle, candidate, *max_distance))
                    .map(|term| term.as_ref())
                    .collect()
            }
            TextMatch::Phrase(_) => Vec::new(),
        }
    }

    fn phrase_docs(&self, state: &TextState, words: &[String]) -> RoaringBitmap {
        let mut postings = Vec::with_capacity(words.len());
        for word in words {
            let needle = word.to_lowercase();
            match state.terms.get(needle.as_str()) {
                Some(posting) => postings.push(posting),
                None => return RoaringBitmap::new(),
            }
        }
        let Some((first, rest)) = postings.split_first() else {
            return RoaringBitmap::new();
        };
        let mut candidates = first.docs.clone();
        for posting in rest {
            candidates &= &posting.docs;
        }
        if self.boolean_mode() {
            // Without offsets a phrase is only a conjunction.
            return candidates;
        }
        let mut result = RoaringBitmap::new();
        'docs: for doc in candidates.iter() {
            let starts = &postings[0].positions[&doc];
            for start in starts {
                if postings
                    .iter()
                    .enumerate()
                    .skip(1)
                    .all(|(offset, posting)| {
                        posting.positions[&doc].contains(&(start + offset as u32))
                    })
                {
                    result.insert(doc);
                    continue 'docs;
                }
            }
        }
        result
    }

    pub fn search(&self, predicate: &TextMatch) -> Box<dyn EntriesFetcher> {
        let state = self.state.read();
        let docs = match predicate {
            TextMatch::Phrase(words) => self.phrase_docs(&state, words),
            other => {
                let mut docs = RoaringBitmap::new();
                for term in self.matching_terms(&state, other) {
                    if let Some(posting) = state.terms.get(term) {
                        docs |= &posting.docs;
                    }
                }
                docs
            }
        };
        Box::new(VecFetcher::new(Self::docs_to_keys(&state, &docs)))
    }

    pub fn memory_bytes(&self) -> u64 {
        let state = self.state.read();
        let term_bytes: usize = state.terms.keys().map(|t| t.len()).sum();
        let posting_bytes: usize = state
            .terms
            .values()
            .map(|p| p.docs.serialized_size() as usize)
            .sum();
        (term_bytes + posting_bytes) as u64
    }

    pub fn save(&self, out: &mut ChunkedWriter<'_>) -> Result<()> {
        let state = self.state.read();
        let docs: Vec<(Vec<u8>, Vec<(String, Vec<u32>)>)> = state
            .doc_ids
            .iter()
            .map(|(key, doc)| {
                let terms = state
                    .doc_terms
                    .get(doc)
                    .map(|terms| {
                        terms
                            .iter()
                            .map(|term| {
                                let positions = state
                                    .terms
                                    .get(term)
                                    .and_then(|p| p.positions.get(doc))
                                    .cloned()
                                    .unwrap_or_default();
                                (term.to_string(), positions)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                (key.as_bytes().to_vec(), terms)
            })
            .collect();
        out.write_blob(&wire::encode(&docs)?)
    }

    pub fn load(
        &self,
        input: &mut ChunkedReader<'_>,
        intern: impl Fn(&[u8]) -> Key,
    ) -> Result<()> {
        let docs: Vec<(Vec<u8>, Vec<(String, Vec<u32>)>)> = wire::decode(&input.read_blob()?)?;
        let boolean_mode = self.boolean_mode();
        let mut state = self.state.write();
        for (key_bytes, terms) in docs {
            let key = intern(&key_bytes);
            let doc = state.allocate_doc(&key);
            let mut doc_terms = Vec::with_capacity(terms.len());
            for (term, positions) in terms {
                let term_key: Box<str> = term.into_boxed_str();
                if self.options.with_suffix_trie && !state.terms.contains_key(&term_key) {
                    state.reversed.insert(reversed(&term_key), term_key.clone());
                }
                let posting = state.terms.entry(term_key.clone()).or_default();
                for position in positions {
                    posting.insert(doc, position, boolean_mode);
                }
                doc_terms.push(term_key);
            }
            state.doc_terms.insert(doc, doc_terms);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::{InternStore, StringCategory};

    fn key(store: &InternStore, name: &str) -> Key {
        store.intern(name.as_bytes(), StringCategory::Key)
    }

    fn matched(index: &TextIndex, predicate: TextMatch) -> Vec<String> {
        let mut out: Vec<String> = index
            .search(&predicate)
            .entries()
            .map(|k| k.display().into_owned())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn tokenizer_lowercases_and_strips_punctuation() {
        let tokens = tokenize("Hello, World! rust-lang");
        let words: Vec<&str> = tokens.iter().map(|(w, _)| w.as_str()).collect();
        assert_eq!(words, vec!["hello", "world", "rust", "lang"]);
        assert_eq!(tokens[1].1, 1);
    }

    #[test]
    fn term_and_prefix_search() {
        let store = InternStore::new();
        let index = TextIndex::new(TextOptions::default());
        index
            .add_record(&key(&store, "doc:1"), b"the quick brown fox")
            .unwrap();
        index
            .add_record(&key(&store, "doc:2"), b"quicksilver surfer")
            .unwrap();

        assert_eq!(matched(&index, TextMatch::Term("quick".into())), vec!["doc:1"]);
        assert_eq!(
            matched(&index, TextMatch::Prefix("quick".into())),
            vec!["doc:1", "doc:2"]
        );
    }

    #[test]
    fn suffix_with_and_without_trie() {
        let store = InternStore::new();
        for with_trie in [true, false] {
            let index = TextIndex::new(TextOptions {
                with_suffix_trie: with_trie,
                ..TextOptions::default()
            });
            index
                .add_record(&key(&store, "doc:1"), b"running jumping")
                .unwrap();
            index.add_record(&key(&store, "doc:2"), b"walker").unwrap();
            assert_eq!(
                matched(&index, TextMatch::Suffix("ing".into())),
                vec!["doc:1"],
                "with_trie={with_trie}"
            );
        }
    }

    #[test]
    fn wildcard_and_contains() {
        let store = InternStore::new();
        let index = TextIndex::new(TextOptions::default());
        index
            .add_record(&key(&store, "doc:1"), b"searching indexes")
            .unwrap();
        assert_eq!(
            matched(&index, TextMatch::Wildcard("se?rch*".into())),
            vec!["doc:1"]
        );
        assert_eq!(
            matched(&index, TextMatch::Contains("dex".into())),
            vec!["doc:1"]
        );
        assert!(matched(&index, TextMatch::Wildcard("se?rch".into())).is_empty());
    }

    #[test]
    fn fuzzy_bounded_distance() {
        let store = InternStore::new();
        let index = TextIndex::new(TextOptions::default());
        index.add_record(&key(&store, "doc:1"), b"valkey").unwrap();
        assert_eq!(
            matched(
                &index,
                TextMatch::Fuzzy {
                    term: "valkye".into(),
                    max_distance: 2
                }
            ),
            vec!["doc:1"]
        );
        assert!(matched(
            &index,
            TextMatch::Fuzzy {
                term: "postgres".into(),
                max_distance: 2
            }
        )
        .is_empty());
    }

    #[test]
    fn phrase_requires_adjacent_positions() {
        let store = InternStore::new();
        let index = TextIndex::new(TextOptions::default());
        index
            .add_record(&key(&store, "doc:1"), b"fast vector search engine")
            .unwrap();
        index
            .add_record(&key(&store, "doc:2"), b"vector based search")
            .unwrap();
        assert_eq!(
            matched(
                &index,
                TextMatch::Phrase(vec!["vector".into(), "search".into()])
            ),
            vec!["doc:1"]
        );
    }

    #[test]
    fn boolean_mode_pins_position_zero() {
        let store = InternStore::new();
        let index = TextIndex::new(TextOptions {
            with_offsets: false,
            ..TextOptions::default()
        });
        index
            .add_record(&key(&store, "doc:1"), b"alpha beta gamma")
            .unwrap();
        let state = index.state.read();
        for posting in state.terms.values() {
            for positions in posting.positions.values() {
                assert!(positions.iter().all(|p| *p == 0));
            }
        }
        drop(state);
        // Phrase degrades to intersection.
        assert_eq!(
            matched(
                &index,
                TextMatch::Phrase(vec!["alpha".into(), "gamma".into()])
            ),
            vec!["doc:1"]
        );
    }

    #[test]
    fn remove_reclaims_doc_ids_and_terms() {
        let store = InternStore::new();
        let index = TextIndex::new(TextOptions {
            with_suffix_trie: true,
            ..TextOptions::default()
        });
        let k = key(&store, "doc:1");
        index.add_record(&k, b"transient").unwrap();
        assert_eq!(index.term_count(), 1);
        assert!(index.remove_record(&k, DeletionKind::Record).unwrap());
        assert_eq!(index.term_count(), 0);
        assert_eq!(index.tracked_key_count(), 0);
        assert!(matched(&index, TextMatch::Term("transient".into())).is_empty());
    }

    #[test]
    fn modify_reindexes() {
        let store = InternStore::new();
        let index = TextIndex::new(TextOptions::default());
        let k = key(&store, "doc:1");
        index.add_record(&k, b"old words").unwrap();
        index.modify_record(&k, b"new content").unwrap();
        assert!(matched(&index, TextMatch::Term("old".into())).is_empty());
        assert_eq!(matched(&index, TextMatch::Term("content".into())), vec!["doc:1"]);
    }
}
