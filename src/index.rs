//! Disk-backed `hash -> (offset, length, kind)` map.
//!
//! The store consults it to dereference keys that carry no offset. On disk
//! it is an append-only log of fixed-width records hydrated into a
//! short-hash keyed table on open; a record whose tail was lost to a crash
//! is dropped, which the minimal indexing strategy is designed to survive
//! (commits are re-indexed, everything else is reachable through them).

use std::collections::HashMap;
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::append::{AppendOnlyFile, AutoFlushProcedure};
use crate::entry::Kind;
use crate::error::Result;
use crate::hash::{Hash, HASH_SIZE};
use crate::key::Span;

/// Which freshly appended entries get an index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexingStrategy {
    /// Index commits only. The one strategy compatible with GC.
    Minimal,
    /// Index every entry.
    Always,
}

impl IndexingStrategy {
    /// Decide whether an entry of the given length and kind is registered.
    pub fn applies(self, _value_length: u64, kind: Kind) -> bool {
        match self {
            IndexingStrategy::Always => true,
            IndexingStrategy::Minimal => kind.is_commit(),
        }
    }

    pub fn is_minimal(self) -> bool {
        self == IndexingStrategy::Minimal
    }
}

const RECORD_SIZE: usize = HASH_SIZE + 8 + 4 + 1;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    hash: Hash,
    offset: u64,
    length: u32,
    kind: Kind,
}

#[derive(Debug)]
pub struct Index {
    ao: AppendOnlyFile,
    /// Short-hash keyed; full-hash collisions chain in the bucket.
    table: HashMap<u64, Vec<IndexEntry>>,
    hydrated_end: u64,
}

impl Index {
    pub fn create_rw(path: &Path, overwrite: bool, log_size: usize) -> Result<Self> {
        let ao =
            AppendOnlyFile::create_rw(path, overwrite, log_size, AutoFlushProcedure::Internal)?;
        Ok(Self {
            ao,
            table: HashMap::new(),
            hydrated_end: 0,
        })
    }

    pub fn open_rw(path: &Path, log_size: usize) -> Result<Self> {
        let len = complete_records_end(path)?;
        let ao = AppendOnlyFile::open_rw(path, len, log_size, AutoFlushProcedure::Internal)?;
        let mut index = Self {
            ao,
            table: HashMap::new(),
            hydrated_end: 0,
        };
        index.hydrate(len)?;
        Ok(index)
    }

    pub fn open_ro(path: &Path) -> Result<Self> {
        let len = complete_records_end(path)?;
        let ao = AppendOnlyFile::open_ro(path, len)?;
        let mut index = Self {
            ao,
            table: HashMap::new(),
            hydrated_end: 0,
        };
        index.hydrate(len)?;
        Ok(index)
    }

    fn hydrate(&mut self, until: u64) -> Result<()> {
        let mut off = self.hydrated_end;
        let mut record = [0u8; RECORD_SIZE];
        while off + RECORD_SIZE as u64 <= until {
            self.ao.read_exn(off, &mut record)?;
            let hash = Hash::from_slice(&record[..HASH_SIZE]).expect("fixed width");
            let mut rest = &record[HASH_SIZE..];
            let offset = rest.read_u64::<BigEndian>().expect("fixed width");
            let length = rest.read_u32::<BigEndian>().expect("fixed width");
            let kind = Kind::from_u8(rest.read_u8().expect("fixed width"))?;
            self.insert_in_table(IndexEntry {
                hash,
                offset,
                length,
                kind,
            });
            off += RECORD_SIZE as u64;
        }
        self.hydrated_end = off;
        Ok(())
    }

    fn insert_in_table(&mut self, entry: IndexEntry) {
        let bucket = self.table.entry(entry.hash.short()).or_default();
        match bucket.iter_mut().find(|e| e.hash == entry.hash) {
            Some(existing) => *existing = entry,
            None => bucket.push(entry),
        }
    }

    /// Resolve a hash to its span and kind.
    pub fn find(&self, hash: &Hash) -> Option<(Span, Kind)> {
        self.table
            .get(&hash.short())?
            .iter()
            .find(|e| e.hash == *hash)
            .map(|e| (Span::new(e.offset, e.length), e.kind))
    }

    pub fn mem(&self, hash: &Hash) -> bool {
        self.find(hash).is_some()
    }

    /// Register an entry. `overcommit` lets the record ride in memory past
    /// the log threshold instead of blocking on a merge; the log-structured
    /// implementation behind this interface absorbs it either way.
    pub fn add(&mut self, hash: &Hash, span: Span, kind: Kind, _overcommit: bool) -> Result<()> {
        let mut record = Vec::with_capacity(RECORD_SIZE);
        record.extend_from_slice(hash.as_bytes());
        record.write_u64::<BigEndian>(span.offset).unwrap();
        record.write_u32::<BigEndian>(span.length).unwrap();
        record.push(kind.to_u8());
        self.ao.append_exn(&record)?;
        self.hydrated_end += RECORD_SIZE as u64;
        self.insert_in_table(IndexEntry {
            hash: *hash,
            offset: span.offset,
            length: span.length,
            kind,
        });
        Ok(())
    }

    pub fn flush(&mut self, with_fsync: bool) -> Result<()> {
        self.ao.flush()?;
        if with_fsync {
            self.ao.fsync()?;
        }
        Ok(())
    }

    /// RO side: pick up records the writer flushed since the last reload.
    pub fn reload(&mut self) -> Result<()> {
        let len = complete_records_end(self.ao.path())?;
        if len > self.hydrated_end {
            self.ao.refresh_end_poff(len)?;
            self.hydrate(len)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.table.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.ao.buffer_is_empty()
    }

    pub fn close(&mut self) -> Result<()> {
        self.ao.close()
    }
}

/// Byte length of the whole records at the head of the log; a torn tail is
/// cut off rather than reported.
fn complete_records_end(path: &Path) -> Result<u64> {
    let len = std::fs::metadata(path)?.len();
    Ok(len - len % RECORD_SIZE as u64)
}
