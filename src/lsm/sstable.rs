//! SSTable builder and reader (§4.B).
//!
//! A block-based, immutable sorted file: a sequence of data blocks, each
//! independently CRC32C-checksummed and optionally compressed, followed by
//! a sparse index (one `(key, block_offset)` pair per block) and a fixed
//! footer carrying magic bytes, the smallest/largest key, entry count, and
//! the compression codec id. Readers verify the footer magic and every
//! block's CRC before trusting its contents (§4.B: "Readers must verify
//! footer magic and block CRCs").
//!
//! Block-level checksumming reuses the hardware-accelerated CRC32C already
//! in the storage module (`crate::storage::checksum::hardware_crc32c`);
//! per-block compression uses `flate2`, already part of the dependency
//! stack, rather than introducing a new codec crate for a single optional
//! codec.

use crate::error::{Result, TektiteError};
use crate::lsm::key::{Entry, LsmKey, LsmValue};
use crate::lsm::iterator::LsmIterator;
use crate::storage::checksum::hardware_crc32c;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

pub const MAGIC: u32 = 0x54_4B_54_42; // "TKTB"

/// Content-derived table ID (§3 "Identified by a content- or time-derived
/// ID"): the hex-encoded SHA-256 of the finished table bytes. Two uploads
/// of byte-identical content always land on the same ID, which is what
/// makes the pusher's "already exists with matching size" idempotency
/// check (§4.G step 2) sufficient rather than needing a dedicated
/// idempotency token.
pub fn content_table_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Codec {
    None = 0,
    Deflate = 1,
}

impl Codec {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Deflate),
            _ => Err(TektiteError::corrupt_table(
                "<unknown>",
                format!("unrecognized codec id {b}"),
            )),
        }
    }
}

struct Block {
    codec: Codec,
    payload: Vec<u8>,
}

impl Block {
    fn encode(&self) -> Vec<u8> {
        let crc = hardware_crc32c(&self.payload);
        let mut out = Vec::with_capacity(self.payload.len() + 9);
        out.push(self.codec as u8);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }
}

/// One `(key, value)` pair plus the encoded entry length, used while
/// accumulating a block during a build.
struct PendingEntry {
    key: LsmKey,
    sequence: u64,
    value: LsmValue,
}

/// Builds an SSTable from entries fed in strictly ascending key order
/// (ascending key, then descending sequence for equal keys — the same
/// order the merging iterator produces). The caller is responsible for
/// already having deduplicated/merged overlapping sources; the builder
/// does not re-sort.
pub struct SsTableBuilder {
    codec: Codec,
    block_size_target: usize,
    pending: Vec<PendingEntry>,
    blocks: Vec<Block>,
    index: Vec<(LsmKey, u64)>, // (first key of block, byte offset of block)
    smallest: Option<LsmKey>,
    largest: Option<LsmKey>,
    num_entries: u64,
    out: Vec<u8>,
}

impl SsTableBuilder {
    pub fn new(codec: Codec, block_size_target: usize) -> Self {
        Self {
            codec,
            block_size_target,
            pending: Vec::new(),
            blocks: Vec::new(),
            index: Vec::new(),
            smallest: None,
            largest: None,
            num_entries: 0,
            out: Vec::new(),
        }
    }

    pub fn add(&mut self, key: LsmKey, sequence: u64, value: LsmValue) {
        if self.smallest.is_none() {
            self.smallest = Some(key.clone());
        }
        self.largest = Some(key.clone());
        self.num_entries += 1;
        self.pending.push(PendingEntry {
            key,
            sequence,
            value,
        });

        let approx_size: usize = self
            .pending
            .iter()
            .map(|e| e.key.as_bytes().len() + 16)
            .sum();
        if approx_size >= self.block_size_target {
            self.flush_block();
        }
    }

    fn flush_block(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let first_key = self.pending[0].key.clone();
        let mut raw = Vec::new();
        for e in &self.pending {
            raw.extend_from_slice(&(e.key.as_bytes().len() as u32).to_be_bytes());
            raw.extend_from_slice(e.key.as_bytes());
            raw.extend_from_slice(&e.sequence.to_be_bytes());
            let encoded_value = e.value.encode();
            raw.extend_from_slice(&(encoded_value.len() as u32).to_be_bytes());
            raw.extend_from_slice(&encoded_value);
        }
        let payload = match self.codec {
            Codec::None => raw,
            Codec::Deflate => {
                let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
                enc.write_all(&raw).expect("in-memory writer cannot fail");
                enc.finish().expect("in-memory writer cannot fail")
            }
        };
        self.index.push((first_key, self.out.len() as u64));
        let block = Block {
            codec: self.codec,
            payload,
        };
        self.out.extend_from_slice(&block.encode());
        self.blocks.push(block);
        self.pending.clear();
    }

    /// Consume every entry from an iterator and add it, then finish.
    pub fn build_from_iterator(
        codec: Codec,
        block_size_target: usize,
        mut iter: Box<dyn LsmIterator>,
    ) -> Result<Vec<u8>> {
        let mut builder = Self::new(codec, block_size_target);
        while iter.is_valid()? {
            let e = iter.current().expect("is_valid just returned true").clone();
            builder.add(e.key, e.sequence, e.value);
            iter.next()?;
        }
        builder.finish()
    }

    /// Serialize the final file: data blocks, sparse index, footer.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.flush_block();

        let index_offset = self.out.len() as u64;
        self.out
            .extend_from_slice(&(self.index.len() as u32).to_be_bytes());
        for (key, offset) in &self.index {
            self.out
                .extend_from_slice(&(key.as_bytes().len() as u32).to_be_bytes());
            self.out.extend_from_slice(key.as_bytes());
            self.out.extend_from_slice(&offset.to_be_bytes());
        }

        let smallest = self.smallest.unwrap_or_else(|| LsmKey::new(Vec::new()));
        let largest = self.largest.unwrap_or_else(|| LsmKey::new(Vec::new()));
        self.out
            .extend_from_slice(&(smallest.as_bytes().len() as u32).to_be_bytes());
        self.out.extend_from_slice(smallest.as_bytes());
        self.out
            .extend_from_slice(&(largest.as_bytes().len() as u32).to_be_bytes());
        self.out.extend_from_slice(largest.as_bytes());
        self.out.extend_from_slice(&self.num_entries.to_be_bytes());
        self.out.extend_from_slice(&index_offset.to_be_bytes());
        self.out.extend_from_slice(&(self.codec as u8).to_be_bytes());
        self.out.extend_from_slice(&MAGIC.to_be_bytes());

        Ok(self.out)
    }
}

/// A parsed, immutable SSTable held in memory (the bytes themselves may be
/// backed by an `Arc<[u8]>` fetched from cache or object store — this type
/// only owns the parsed footer/index, not a copy of the data blocks, to
/// keep repeated opens of the same bytes cheap).
pub struct SsTableReader {
    data: Vec<u8>,
    index: Vec<(LsmKey, u64)>,
    smallest: LsmKey,
    largest: LsmKey,
    num_entries: u64,
    codec: Codec,
}

const FOOTER_FIXED_TAIL: usize = 8 + 8 + 1 + 4; // num_entries + index_offset + codec + magic

impl SsTableReader {
    pub fn open(table_id: &str, data: Vec<u8>) -> Result<Self> {
        if data.len() < FOOTER_FIXED_TAIL + 4 {
            return Err(TektiteError::corrupt_table(table_id, "file too small"));
        }
        let magic = u32::from_be_bytes(data[data.len() - 4..].try_into().unwrap());
        if magic != MAGIC {
            return Err(TektiteError::corrupt_table(table_id, "bad footer magic"));
        }
        let mut cursor = data.len() - 4;
        cursor -= 1;
        let codec = Codec::from_byte(data[cursor])?;
        cursor -= 8;
        let index_offset = u64::from_be_bytes(data[cursor..cursor + 8].try_into().unwrap());
        cursor -= 8;
        let num_entries = u64::from_be_bytes(data[cursor..cursor + 8].try_into().unwrap());
        let trailer_start = cursor;

        // The index and smallest/largest keys were all written forward,
        // starting at `index_offset`; parse them in the same order rather
        // than trying to walk backward through variable-length fields.
        let (index, pos) = parse_index(&data, index_offset as usize, table_id)?;
        let (smallest, pos) = read_len_prefixed_forward(&data, pos, table_id)?;
        let (largest, pos) = read_len_prefixed_forward(&data, pos, table_id)?;
        if pos != trailer_start {
            return Err(TektiteError::corrupt_table(table_id, "inconsistent footer"));
        }

        Ok(Self {
            data,
            index,
            smallest,
            largest,
            num_entries,
            codec,
        })
    }

    pub fn table_id_range(&self) -> (&LsmKey, &LsmKey) {
        (&self.smallest, &self.largest)
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn overlaps(&self, start: &LsmKey, end: &LsmKey) -> bool {
        !(self.largest < *start || self.smallest > *end)
    }

    /// Point lookup by exact key. Returns `None` if absent (the caller
    /// distinguishes "absent" from "present as tombstone").
    pub fn get(&self, key: &LsmKey) -> Result<Option<Entry>> {
        if key < &self.smallest || key > &self.largest {
            return Ok(None);
        }
        let block_offset = match self.find_block_offset(key) {
            Some(o) => o,
            None => return Ok(None),
        };
        let entries = self.decode_block_at(block_offset)?;
        Ok(entries.into_iter().find(|e| &e.key == key))
    }

    fn find_block_offset(&self, key: &LsmKey) -> Option<u64> {
        let mut candidate = None;
        for (first_key, offset) in &self.index {
            if first_key <= key {
                candidate = Some(*offset);
            } else {
                break;
            }
        }
        candidate
    }

    fn decode_block_at(&self, offset: u64) -> Result<Vec<Entry>> {
        let offset = offset as usize;
        if offset + 5 > self.data.len() {
            return Err(TektiteError::corrupt_table("<block>", "block header truncated"));
        }
        let codec_byte = self.data[offset];
        let codec = Codec::from_byte(codec_byte)?;
        let len =
            u32::from_be_bytes(self.data[offset + 1..offset + 5].try_into().unwrap()) as usize;
        let payload_start = offset + 5;
        let payload_end = payload_start
            .checked_add(len)
            .ok_or_else(|| TektiteError::corrupt_table("<block>", "block length overflow"))?;
        let crc_end = payload_end
            .checked_add(4)
            .ok_or_else(|| TektiteError::corrupt_table("<block>", "block length overflow"))?;
        if crc_end > self.data.len() {
            return Err(TektiteError::corrupt_table("<block>", "block payload truncated"));
        }
        let payload = &self.data[payload_start..payload_end];
        let crc_recorded =
            u32::from_be_bytes(self.data[payload_end..crc_end].try_into().unwrap());
        if hardware_crc32c(payload) != crc_recorded {
            return Err(TektiteError::corrupt_table("<block>", "CRC mismatch"));
        }
        let raw = match codec {
            Codec::None => payload.to_vec(),
            Codec::Deflate => {
                let mut dec = DeflateDecoder::new(payload);
                let mut out = Vec::new();
                dec.read_to_end(&mut out)?;
                out
            }
        };
        decode_block_entries(&raw)
    }

    /// Iterate the whole table in key order.
    pub fn iter(self: std::sync::Arc<Self>) -> Result<SsTableIterator> {
        let entries = self.decode_all()?;
        Ok(SsTableIterator { entries, pos: 0 })
    }

    fn decode_all(&self) -> Result<Vec<Entry>> {
        let mut all = Vec::new();
        for (_, offset) in &self.index {
            all.extend(self.decode_block_at(*offset)?);
        }
        Ok(all)
    }
}

fn decode_block_entries(raw: &[u8]) -> Result<Vec<Entry>> {
    fn take<'a>(raw: &'a [u8], pos: usize, len: usize) -> Result<&'a [u8]> {
        let end = pos
            .checked_add(len)
            .ok_or_else(|| TektiteError::corrupt_table("<block>", "entry length overflow"))?;
        if end > raw.len() {
            return Err(TektiteError::corrupt_table("<block>", "entry truncated"));
        }
        Ok(&raw[pos..end])
    }

    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < raw.len() {
        let key_len =
            u32::from_be_bytes(take(raw, pos, 4)?.try_into().unwrap()) as usize;
        pos += 4;
        let key = LsmKey::new(take(raw, pos, key_len)?.to_vec());
        pos += key_len;
        let sequence = u64::from_be_bytes(take(raw, pos, 8)?.try_into().unwrap());
        pos += 8;
        let value_len =
            u32::from_be_bytes(take(raw, pos, 4)?.try_into().unwrap()) as usize;
        pos += 4;
        let value = LsmValue::decode(take(raw, pos, value_len)?.to_vec())?;
        pos += value_len;
        entries.push(Entry::new(key, sequence, value));
    }
    Ok(entries)
}

fn parse_index(data: &[u8], offset: usize, table_id: &str) -> Result<(Vec<(LsmKey, u64)>, usize)> {
    fn take<'a>(data: &'a [u8], pos: usize, len: usize, table_id: &str) -> Result<&'a [u8]> {
        let end = pos
            .checked_add(len)
            .ok_or_else(|| TektiteError::corrupt_table(table_id, "index entry length overflow"))?;
        if end > data.len() {
            return Err(TektiteError::corrupt_table(table_id, "index entry truncated"));
        }
        Ok(&data[pos..end])
    }

    if offset + 4 > data.len() {
        return Err(TektiteError::corrupt_table(table_id, "index offset out of range"));
    }
    let count = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
    let mut pos = offset + 4;
    let mut index = Vec::with_capacity(count.min(data.len()));
    for _ in 0..count {
        let key_len =
            u32::from_be_bytes(take(data, pos, 4, table_id)?.try_into().unwrap()) as usize;
        pos += 4;
        let key = LsmKey::new(take(data, pos, key_len, table_id)?.to_vec());
        pos += key_len;
        let block_offset =
            u64::from_be_bytes(take(data, pos, 8, table_id)?.try_into().unwrap());
        pos += 8;
        index.push((key, block_offset));
    }
    Ok((index, pos))
}

/// Read a `u32`-length-prefixed key starting at `pos`, returning it and the
/// position immediately after it.
fn read_len_prefixed_forward(data: &[u8], pos: usize, table_id: &str) -> Result<(LsmKey, usize)> {
    if pos + 4 > data.len() {
        return Err(TektiteError::corrupt_table(table_id, "footer overrun"));
    }
    let len = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
    let start = pos + 4;
    if start + len > data.len() {
        return Err(TektiteError::corrupt_table(table_id, "footer overrun"));
    }
    Ok((LsmKey::new(data[start..start + len].to_vec()), start + len))
}

pub struct SsTableIterator {
    entries: Vec<Entry>,
    pos: usize,
}

impl LsmIterator for SsTableIterator {
    fn is_valid(&mut self) -> Result<bool> {
        Ok(self.pos < self.entries.len())
    }

    fn current(&self) -> Option<&Entry> {
        self.entries.get(self.pos)
    }

    fn next(&mut self) -> Result<()> {
        self.pos += 1;
        Ok(())
    }
}
