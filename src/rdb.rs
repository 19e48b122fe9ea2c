//! RDB aux-section codec.
//!
//! The engine persists through the host's aux save/load hooks as a sequence
//! of *sections*, each a bincode header followed by supplemental blocks.
//! Payloads travel through a chunked stream: a length prefix, then chunks
//! capped at [`CHUNK_SIZE`], so a multi-gigabyte index never materializes a
//! single contiguous buffer inside the host's RDB writer.
//!
//! Layout per index schema (section type [`SectionType::IndexSchema`]):
//! the schema proto, then one `IndexContent` block per attribute, one
//! `KeyToIdMap` block per vector attribute, and — when v2 writing is on —
//! an `IndexExtension` block capturing tracked-key sets, pending mutation
//! keys, and the backfill flag for exact reconstruction. Global metadata
//! saves once per RDB under [`SectionType::GlobalMetadata`], skipped
//! entirely when the map is empty.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::host::{RdbSink, RdbSource};
use crate::wire;

/// Upper bound for a single stream chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Aux-section discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionType {
    IndexSchema,
    GlobalMetadata,
}

/// Section header written before any supplemental content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionHeader {
    pub section_type: SectionType,
    pub supplemental_count: u32,
    /// Oldest module version able to consume this section.
    pub min_version: u32,
}

/// Supplemental block discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupplementalType {
    IndexContent,
    KeyToIdMap,
    IndexExtension,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplementalHeader {
    pub content_type: SupplementalType,
    /// Attribute alias the block belongs to; empty for schema-wide blocks.
    pub attribute: String,
}

/// Exact-reconstruction extension written under `rdb_write_v2`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexExtension {
    pub tracked_keys: Vec<Vec<u8>>,
    pub pending_mutation_keys: Vec<Vec<u8>>,
    pub backfilling: bool,
}

/// Options gating the v2 layout and validation behavior (§6.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RdbOptions {
    pub write_v2: bool,
    pub read_v2: bool,
    /// Decode every blob immediately after encoding it and fail the save on
    /// mismatch.
    pub validate_on_write: bool,
    /// Load schema definitions but skip index contents; backfill rebuilds.
    pub skip_index_load: bool,
}

impl Default for RdbOptions {
    fn default() -> Self {
        Self {
            write_v2: true,
            read_v2: true,
            validate_on_write: false,
            skip_index_load: false,
        }
    }
}

/// Length-prefixed chunked writer over a host RDB sink.
pub struct ChunkedWriter<'a> {
    sink: &'a mut dyn RdbSink,
    validate: bool,
}

impl<'a> ChunkedWriter<'a> {
    pub fn new(sink: &'a mut dyn RdbSink) -> Self {
        Self {
            sink,
            validate: false,
        }
    }

    pub fn with_validation(sink: &'a mut dyn RdbSink, validate: bool) -> Self {
        Self { sink, validate }
    }

    pub fn write_blob(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.save_chunk(&(bytes.len() as u64).to_le_bytes())?;
        for chunk in bytes.chunks(CHUNK_SIZE) {
            self.sink.save_chunk(chunk)?;
        }
        Ok(())
    }

    /// Encode `value` and write it as one blob, optionally round-tripping
    /// the encoding first.
    pub fn write_value<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + for<'de> Deserialize<'de> + PartialEq + std::fmt::Debug,
    {
        let encoded = wire::encode(value)?;
        if self.validate {
            let reread: T = wire::decode(&encoded)?;
            if &reread != value {
                return Err(EngineError::internal(
                    "validate-on-write: decoded value differs from encoded input",
                ));
            }
        }
        self.write_blob(&encoded)
    }
}

/// Counterpart reader reassembling length-prefixed blobs.
pub struct ChunkedReader<'a> {
    source: &'a mut dyn RdbSource,
}

impl<'a> ChunkedReader<'a> {
    pub fn new(source: &'a mut dyn RdbSource) -> Self {
        Self { source }
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len_chunk = self.source.load_chunk()?;
        if len_chunk.len() != 8 {
            return Err(EngineError::internal(format!(
                "corrupt chunk stream: length prefix of {} bytes",
                len_chunk.len()
            )));
        }
        let total = u64::from_le_bytes(len_chunk.try_into().expect("checked length")) as usize;
        let mut blob = Vec::with_capacity(total);
        while blob.len() < total {
            let chunk = self.source.load_chunk()?;
            blob.extend_from_slice(&chunk);
        }
        if blob.len() != total {
            return Err(EngineError::internal(
                "corrupt chunk stream: blob overruns its length prefix",
            ));
        }
        Ok(blob)
    }

    pub fn read_value<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T> {
        wire::decode(&self.read_blob()?)
    }
}

pub fn write_section_header(out: &mut ChunkedWriter<'_>, header: &SectionHeader) -> Result<()> {
    out.write_value(header)
}

pub fn read_section_header(input: &mut ChunkedReader<'_>) -> Result<SectionHeader> {
    input.read_value()
}

pub fn write_supplemental_header(
    out: &mut ChunkedWriter<'_>,
    header: &SupplementalHeader,
) -> Result<()> {
    out.write_value(header)
}

pub fn read_supplemental_header(input: &mut ChunkedReader<'_>) -> Result<SupplementalHeader> {
    input.read_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryRdb;

    #[test]
    fn blob_roundtrip_small() {
        let mut rdb = MemoryRdb::new();
        {
            let mut writer = ChunkedWriter::new(&mut rdb);
            writer.write_blob(b"hello").unwrap();
            writer.write_blob(b"").unwrap();
        }
        let mut reader = ChunkedReader::new(&mut rdb);
        assert_eq!(reader.read_blob().unwrap(), b"hello");
        assert_eq!(reader.read_blob().unwrap(), b"");
        assert!(reader.read_blob().is_err());
    }

    #[test]
    fn blob_roundtrip_spans_chunks() {
        let big = vec![0xabu8; CHUNK_SIZE * 2 + 17];
        let mut rdb = MemoryRdb::new();
        {
            let mut writer = ChunkedWriter::new(&mut rdb);
            writer.write_blob(&big).unwrap();
        }
        // length prefix + 3 chunks
        assert_eq!(rdb.chunk_count(), 4);
        let mut reader = ChunkedReader::new(&mut rdb);
        assert_eq!(reader.read_blob().unwrap(), big);
    }

    #[test]
    fn typed_value_roundtrip() {
        let header = SectionHeader {
            section_type: SectionType::IndexSchema,
            supplemental_count: 3,
            min_version: 10100,
        };
        let mut rdb = MemoryRdb::new();
        {
            let mut writer = ChunkedWriter::new(&mut rdb);
            write_section_header(&mut writer, &header).unwrap();
        }
        let mut reader = ChunkedReader::new(&mut rdb);
        assert_eq!(read_section_header(&mut reader).unwrap(), header);
    }

    #[test]
    fn validate_on_write_passes_for_stable_values() {
        let mut rdb = MemoryRdb::new();
        let mut writer = ChunkedWriter::with_validation(&mut rdb, true);
        writer
            .write_value(&SupplementalHeader {
                content_type: SupplementalType::IndexContent,
                attribute: "v".into(),
            })
            .unwrap();
    }
}
