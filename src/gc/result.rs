//! The GC worker's result record and statistics.
//!
//! The record is the only channel from the worker back to the orchestrator:
//! a bincode body framed by a length and a CRC32, written to
//! `store.gc_result.<generation>` once the prefix and mapping are complete.
//! A missing or unreadable record means the worker died mid-run.

use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::io::IoFile;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Counters the worker accumulates while marking and copying.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStats {
    /// Objects reached from the target commit.
    pub objects_traversed: u64,
    /// Coalesced live ranges copied into the prefix.
    pub live_ranges: u64,
    /// Bytes written to the prefix, placeholders included.
    pub copied_bytes: u64,
    /// Parent commits replaced by dangling placeholders.
    pub dangling_parents: u64,
    /// Suffix chunks that fell wholly below the new suffix start.
    pub removable_chunks: u32,
    pub elapsed_ms: u64,
}

/// The new suffix geometry the worker derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffixParamsRecord {
    /// Absolute offset where live suffix data will begin.
    pub start_offset: u64,
    /// First chunk of the surviving window.
    pub chunk_start_idx: u32,
    /// Leading bytes of that chunk below `start_offset`.
    pub dead_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcResult {
    pub generation: u64,
    pub suffix_params: SuffixParamsRecord,
    pub removable_chunk_idxs: Vec<u32>,
    pub stats: GcStats,
}

impl GcResult {
    /// Persist the record; the write is the worker's commit point, so the
    /// file is always fsynced.
    pub fn write(&self, path: &Path) -> Result<()> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(8 + body.len());
        out.write_u32::<BigEndian>(body.len() as u32).unwrap();
        out.extend_from_slice(&body);
        out.write_u32::<BigEndian>(CRC32.checksum(&body)).unwrap();

        let mut io = IoFile::create_rw(path, true)?;
        io.pwrite(0, &out)?;
        io.fsync()?;
        io.close()
    }

    /// Read a record back; any framing or decoding failure is a corrupted
    /// result file, a missing file stays `NoSuchFileOrDirectory` for the
    /// orchestrator to classify.
    pub fn read(path: &Path) -> Result<Self> {
        let io = IoFile::open_ro(path)?;
        let len = io.length()?;
        if len < 8 {
            return Err(Error::CorruptedGcResultFile(format!(
                "{} bytes is too short for a frame",
                len
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        io.pread_exact(0, &mut bytes)?;

        let mut head = &bytes[..];
        let body_len = head.read_u32::<BigEndian>().expect("sized above") as usize;
        if bytes.len() != 4 + body_len + 4 {
            return Err(Error::CorruptedGcResultFile(
                "frame length disagrees with the file".to_string(),
            ));
        }
        let body = &bytes[4..4 + body_len];
        let stored = (&bytes[4 + body_len..])
            .read_u32::<BigEndian>()
            .expect("sized above");
        if stored != CRC32.checksum(body) {
            return Err(Error::CorruptedGcResultFile("checksum mismatch".to_string()));
        }
        bincode::deserialize(body)
            .map_err(|e| Error::CorruptedGcResultFile(e.to_string()))
    }
}
