//! Metadata fingerprinting.
//!
//! All fingerprints are 64-bit HighwayHash digests under one fixed 256-bit
//! key. The key is part of the on-wire contract: two nodes disagree about a
//! fingerprint's meaning the moment their keys differ, so changing it is a
//! breaking incompatibility.
//!
//! The top-level fingerprint summarizes every child as a fixed-layout record
//! `{hash(type_name), hash(id), version, child_fingerprint}`, sorts the
//! records by `(hash(type_name), hash(id))`, and hashes the packed array —
//! equal contents therefore produce equal digests no matter what order the
//! maps were populated in.

use highway::{HighwayHash, HighwayHasher, Key};

use crate::wire::GlobalMetadata;

/// Fixed fingerprint key. Breaking on-wire change if ever altered.
const HASH_KEY: Key = Key([
    0x9736bad976c904ea,
    0x08f963a1a52eece9,
    0x1ea3f3f773f3b510,
    0x9290a6b4e4db3d51,
]);

/// 64-bit HighwayHash of `bytes` under the wire key.
pub fn fingerprint64(bytes: &[u8]) -> u64 {
    let mut hasher = HighwayHasher::new(HASH_KEY);
    hasher.append(bytes);
    hasher.finalize64()
}

#[derive(Clone, Copy)]
struct ChildRecord {
    type_name_fingerprint: u64,
    id_fingerprint: u64,
    version: u64,
    fingerprint: u64,
}

impl ChildRecord {
    fn pack_into(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.type_name_fingerprint.to_le_bytes());
        out.extend_from_slice(&self.id_fingerprint.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.fingerprint.to_le_bytes());
    }
}

/// Order-independent digest over all child entries of `metadata`.
pub fn top_level_fingerprint(metadata: &GlobalMetadata) -> u64 {
    let mut children = Vec::new();
    for (type_name, entries) in &metadata.type_namespace_map {
        let type_name_fingerprint = fingerprint64(type_name.as_bytes());
        for (id, entry) in entries {
            children.push(ChildRecord {
                type_name_fingerprint,
                id_fingerprint: fingerprint64(id.as_bytes()),
                version: entry.version as u64,
                fingerprint: entry.fingerprint,
            });
        }
    }
    children.sort_by(|a, b| {
        (a.type_name_fingerprint, a.id_fingerprint)
            .cmp(&(b.type_name_fingerprint, b.id_fingerprint))
    });
    let mut packed = Vec::with_capacity(children.len() * 32);
    for child in children {
        child.pack_into(&mut packed);
    }
    fingerprint64(&packed)
}
