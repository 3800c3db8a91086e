//! The dict: an interned byte-string table with dense, stable ids.
//!
//! On disk it is a plain append-only sequence of `u32` length-prefixed
//! records; the id of a string is its position in that sequence. Ids are
//! handed out once and never reused, so encoders can embed them in pack
//! entries. Recovery replays the records up to the persisted end offset
//! from the control file and ignores any crash garbage past it.

use std::collections::HashMap;
use std::path::Path;

use byteorder::{BigEndian, WriteBytesExt};

use crate::append::{AppendOnlyFile, AutoFlushProcedure};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Dict {
    ao: AppendOnlyFile,
    entries: Vec<Vec<u8>>,
    ids: HashMap<Vec<u8>, u32>,
    /// File offset up to which `entries` mirrors the log.
    hydrated_end: u64,
}

impl Dict {
    pub fn create_rw(path: &Path, overwrite: bool, auto_flush_threshold: usize) -> Result<Self> {
        let ao = AppendOnlyFile::create_rw(
            path,
            overwrite,
            auto_flush_threshold,
            AutoFlushProcedure::External,
        )?;
        Ok(Self {
            ao,
            entries: Vec::new(),
            ids: HashMap::new(),
            hydrated_end: 0,
        })
    }

    pub fn open_rw(path: &Path, end_poff: u64, auto_flush_threshold: usize) -> Result<Self> {
        let ao = AppendOnlyFile::open_rw(
            path,
            end_poff,
            auto_flush_threshold,
            AutoFlushProcedure::External,
        )?;
        let mut dict = Self {
            ao,
            entries: Vec::new(),
            ids: HashMap::new(),
            hydrated_end: 0,
        };
        dict.hydrate(end_poff)?;
        Ok(dict)
    }

    pub fn open_ro(path: &Path, end_poff: u64) -> Result<Self> {
        let ao = AppendOnlyFile::open_ro(path, end_poff)?;
        let mut dict = Self {
            ao,
            entries: Vec::new(),
            ids: HashMap::new(),
            hydrated_end: 0,
        };
        dict.hydrate(end_poff)?;
        Ok(dict)
    }

    /// Replay records in `[hydrated_end, until)` into the in-memory view.
    fn hydrate(&mut self, until: u64) -> Result<()> {
        let mut off = self.hydrated_end;
        while off < until {
            let mut len_buf = [0u8; 4];
            self.ao.read_exn(off, &mut len_buf)?;
            let len = u32::from_be_bytes(len_buf) as u64;
            if off + 4 + len > until {
                return Err(Error::CorruptedStore(format!(
                    "dict record at {off} crosses the persisted end {until}"
                )));
            }
            let mut bytes = vec![0u8; len as usize];
            self.ao.read_exn(off + 4, &mut bytes)?;
            let id = self.entries.len() as u32;
            self.ids.insert(bytes.clone(), id);
            self.entries.push(bytes);
            off += 4 + len;
        }
        self.hydrated_end = until;
        Ok(())
    }

    /// Resolve an id.
    pub fn find(&self, id: u32) -> Option<&[u8]> {
        self.entries.get(id as usize).map(Vec::as_slice)
    }

    /// The id already assigned to `bytes`, if any.
    pub fn find_bytes(&self, bytes: &[u8]) -> Option<u32> {
        self.ids.get(bytes).copied()
    }

    /// Intern `bytes`, appending a new record if it was unknown.
    pub fn index(&mut self, bytes: &[u8]) -> Result<u32> {
        if let Some(id) = self.ids.get(bytes) {
            return Ok(*id);
        }
        let mut record = Vec::with_capacity(4 + bytes.len());
        record.write_u32::<BigEndian>(bytes.len() as u32).unwrap();
        record.extend_from_slice(bytes);
        self.ao.append_exn(&record)?;

        let id = self.entries.len() as u32;
        self.ids.insert(bytes.to_vec(), id);
        self.entries.push(bytes.to_vec());
        self.hydrated_end += record.len() as u64;
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn end_poff(&self) -> u64 {
        self.ao.end_poff()
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.ao.buffer_is_empty()
    }

    pub fn needs_external_flush(&self) -> bool {
        self.ao.needs_external_flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ao.flush()
    }

    pub fn fsync(&self) -> Result<()> {
        self.ao.fsync()
    }

    /// RO side: pick up records the writer persisted since the last reload.
    pub fn refresh_end_poff(&mut self, end_poff: u64) -> Result<()> {
        self.ao.refresh_end_poff(end_poff)?;
        self.hydrate(end_poff)
    }

    pub fn close(&mut self) -> Result<()> {
        self.ao.close()
    }
}
