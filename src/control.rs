//! The control file: one small, versioned, atomically rewritten record that
//! anchors every other file in the store.
//!
//! # File format
//!
//! ```text
//! +------------------+
//! | magic (8 bytes)  |
//! +------------------+
//! | version (u32 BE) |
//! +------------------+
//! | payload body     |
//! +------------------+
//! | crc32 (u64 BE)   |
//! +------------------+
//! ```
//!
//! The payload body is a fixed-layout big-endian record (offsets, chunk
//! window, status). Readers re-derive all mutable state from this file on
//! `reload`; writers replace it with a write-to-temp-then-rename so a crash
//! never leaves a half-written control behind.

use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use crate::io::{self, IoFile};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MAGIC: &[u8; 8] = b"PACKSTOR";
/// Current major pack version.
pub const VERSION: u32 = 4;
/// Oldest major version this build still reads.
const MIN_VERSION: u32 = 3;

/// GC status recorded in the control payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The store was upgraded from the legacy monolithic layout; entries
    /// below the recorded offset use the legacy dead-header framing.
    FromV1V2PostUpgrade { entry_offset_at_upgrade: u64 },
    /// No GC has ever run.
    NoGcYet,
    /// An entry was indexed under a non-minimal strategy; GC is off the
    /// table for the store's remaining lifetime.
    UsedNonMinimalIndexingStrategy,
    /// At least one GC completed.
    Gced {
        suffix_start_offset: u64,
        generation: u64,
        latest_gc_target_offset: u64,
        suffix_dead_bytes: u64,
    },
    /// Forward-compatibility placeholder tags. Parsed, never interpreted;
    /// a store carrying one refuses to open read-write.
    Reserved(u8),
}

impl Status {
    pub fn generation(&self) -> u64 {
        match self {
            Status::Gced { generation, .. } => *generation,
            _ => 0,
        }
    }

    pub fn suffix_start_offset(&self) -> u64 {
        match self {
            Status::Gced {
                suffix_start_offset,
                ..
            } => *suffix_start_offset,
            _ => 0,
        }
    }

    pub fn suffix_dead_bytes(&self) -> u64 {
        match self {
            Status::Gced {
                suffix_dead_bytes, ..
            } => *suffix_dead_bytes,
            _ => 0,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Status::FromV1V2PostUpgrade {
                entry_offset_at_upgrade,
            } => {
                out.push(0);
                out.write_u64::<BigEndian>(entry_offset_at_upgrade).unwrap();
            }
            Status::NoGcYet => out.push(1),
            Status::UsedNonMinimalIndexingStrategy => out.push(2),
            Status::Gced {
                suffix_start_offset,
                generation,
                latest_gc_target_offset,
                suffix_dead_bytes,
            } => {
                out.push(3);
                out.write_u64::<BigEndian>(suffix_start_offset).unwrap();
                out.write_u64::<BigEndian>(generation).unwrap();
                out.write_u64::<BigEndian>(latest_gc_target_offset).unwrap();
                out.write_u64::<BigEndian>(suffix_dead_bytes).unwrap();
            }
            Status::Reserved(tag) => out.push(tag),
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        let tag = buf
            .read_u8()
            .map_err(|_| Error::CorruptedControlFile("truncated status".to_string()))?;
        let truncated = || Error::CorruptedControlFile("truncated status".to_string());
        Ok(match tag {
            0 => Status::FromV1V2PostUpgrade {
                entry_offset_at_upgrade: buf.read_u64::<BigEndian>().map_err(|_| truncated())?,
            },
            1 => Status::NoGcYet,
            2 => Status::UsedNonMinimalIndexingStrategy,
            3 => Status::Gced {
                suffix_start_offset: buf.read_u64::<BigEndian>().map_err(|_| truncated())?,
                generation: buf.read_u64::<BigEndian>().map_err(|_| truncated())?,
                latest_gc_target_offset: buf.read_u64::<BigEndian>().map_err(|_| truncated())?,
                suffix_dead_bytes: buf.read_u64::<BigEndian>().map_err(|_| truncated())?,
            },
            // T1..T15 reserved tags.
            tag @ 4..=18 => Status::Reserved(tag),
            other => {
                return Err(Error::CorruptedControlFile(format!(
                    "unknown status tag {other}"
                )))
            }
        })
    }
}

/// The control payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payload {
    pub dict_end_poff: u64,
    pub suffix_end_poff: u64,
    pub status: Status,
    pub upgraded_from_v3_to_v4: bool,
    pub chunk_start_idx: u32,
    pub chunk_num: u32,
    /// CRC over the encoded body; filled on write, verified on read.
    pub checksum: u64,
}

impl Payload {
    /// The payload a freshly created store starts with.
    pub fn initial() -> Self {
        Self {
            dict_end_poff: 0,
            suffix_end_poff: 0,
            status: Status::NoGcYet,
            upgraded_from_v3_to_v4: false,
            chunk_start_idx: 0,
            chunk_num: 1,
            checksum: 0,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.write_u64::<BigEndian>(self.dict_end_poff).unwrap();
        out.write_u64::<BigEndian>(self.suffix_end_poff).unwrap();
        out.push(u8::from(self.upgraded_from_v3_to_v4));
        out.write_u32::<BigEndian>(self.chunk_start_idx).unwrap();
        out.write_u32::<BigEndian>(self.chunk_num).unwrap();
        self.status.encode(&mut out);
        out
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self> {
        let truncated = || Error::CorruptedControlFile("truncated payload".to_string());
        let dict_end_poff = buf.read_u64::<BigEndian>().map_err(|_| truncated())?;
        let suffix_end_poff = buf.read_u64::<BigEndian>().map_err(|_| truncated())?;
        let upgraded = buf.read_u8().map_err(|_| truncated())? != 0;
        let chunk_start_idx = buf.read_u32::<BigEndian>().map_err(|_| truncated())?;
        let chunk_num = buf.read_u32::<BigEndian>().map_err(|_| truncated())?;
        let status = Status::decode(&mut buf)?;
        Ok(Self {
            dict_end_poff,
            suffix_end_poff,
            status,
            upgraded_from_v3_to_v4: upgraded,
            chunk_start_idx,
            chunk_num,
            checksum: 0,
        })
    }
}

/// Handle on the control file, caching the current payload.
#[derive(Debug)]
pub struct ControlFile {
    io: IoFile,
    path: PathBuf,
    payload: Payload,
    use_fsync: bool,
}

impl ControlFile {
    /// Create (or, with `overwrite`, truncate) a control file holding
    /// `payload`.
    pub fn create_rw(
        path: &Path,
        overwrite: bool,
        payload: Payload,
        use_fsync: bool,
    ) -> Result<Self> {
        let io = IoFile::create_rw(path, overwrite)?;
        let mut this = Self {
            io,
            path: path.to_path_buf(),
            payload,
            use_fsync,
        };
        // First write goes straight into the fresh file; no readers exist
        // before creation returns.
        let bytes = encode_file(&mut this.payload);
        this.io.pwrite(0, &bytes)?;
        if use_fsync {
            this.io.fsync()?;
        }
        Ok(this)
    }

    pub fn open_rw(path: &Path, use_fsync: bool) -> Result<Self> {
        let io = IoFile::open_rw(path)?;
        let payload = read_payload(&io)?;
        Ok(Self {
            io,
            path: path.to_path_buf(),
            payload,
            use_fsync,
        })
    }

    pub fn open_ro(path: &Path) -> Result<Self> {
        let io = IoFile::open_ro(path)?;
        let payload = read_payload(&io)?;
        Ok(Self {
            io,
            path: path.to_path_buf(),
            payload,
            use_fsync: false,
        })
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn readonly(&self) -> bool {
        self.io.readonly()
    }

    /// Atomically replace the payload: encode to a temp file, rename over
    /// the control, reopen the handle.
    pub fn set_payload(&mut self, mut payload: Payload) -> Result<()> {
        if self.io.readonly() {
            return Err(Error::RoNotAllowed);
        }
        let bytes = encode_file(&mut payload);

        let tmp = self.path.with_extension("control.tmp");
        let mut tmp_io = IoFile::create_rw(&tmp, true)?;
        tmp_io.pwrite(0, &bytes)?;
        if self.use_fsync {
            tmp_io.fsync()?;
        }
        tmp_io.close()?;

        io::rename(&tmp, &self.path)?;
        self.io.close()?;
        self.io = IoFile::open_rw(&self.path)?;
        if self.use_fsync {
            self.io.fsync()?;
        }
        self.payload = payload;
        Ok(())
    }

    /// Re-read the payload from disk. The file may have been replaced by
    /// the writer's rename, so the handle is reopened rather than reread.
    pub fn reload(&mut self) -> Result<()> {
        let reopened = if self.io.readonly() {
            IoFile::open_ro(&self.path)?
        } else {
            IoFile::open_rw(&self.path)?
        };
        self.payload = read_payload(&reopened)?;
        self.io.close()?;
        self.io = reopened;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.io.close()
    }
}

fn encode_file(payload: &mut Payload) -> Vec<u8> {
    let body = payload.encode_body();
    payload.checksum = u64::from(CRC32.checksum(&body));

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + body.len() + 8);
    out.extend_from_slice(MAGIC);
    out.write_u32::<BigEndian>(VERSION).unwrap();
    out.extend_from_slice(&body);
    out.write_u64::<BigEndian>(payload.checksum).unwrap();
    out
}

fn read_payload(io: &IoFile) -> Result<Payload> {
    let len = io.length()?;
    if len < (MAGIC.len() + 4 + 8) as u64 {
        return Err(Error::CorruptedControlFile("file too short".to_string()));
    }
    let mut bytes = vec![0u8; len as usize];
    io.pread_exact(0, &mut bytes)?;

    let (head, rest) = bytes.split_at(MAGIC.len());
    if head != MAGIC {
        return Err(Error::CorruptedControlFile("bad magic".to_string()));
    }
    let mut rest_r = rest;
    let version = rest_r
        .read_u32::<BigEndian>()
        .map_err(|_| Error::CorruptedControlFile("truncated version".to_string()))?;
    if version > VERSION {
        return Err(Error::V3StoreFromTheFuture);
    }
    if version < MIN_VERSION {
        return Err(Error::UnknownMajorPackVersion(version as u8));
    }

    let (body, crc_bytes) = rest_r.split_at(rest_r.len() - 8);
    let stored = (&crc_bytes[..])
        .read_u64::<BigEndian>()
        .map_err(|_| Error::CorruptedControlFile("truncated checksum".to_string()))?;
    let computed = u64::from(CRC32.checksum(body));
    if stored != computed {
        return Err(Error::CorruptedControlFile(format!(
            "checksum mismatch: stored {stored}, computed {computed}"
        )));
    }

    let mut payload = Payload::decode_body(body)?;
    payload.checksum = stored;
    Ok(payload)
}
