//! The chunked suffix: the open, appendable portion of the store.
//!
//! Logically the suffix is one byte stream addressed by absolute store
//! offsets. Physically it is a window of numbered chunk files
//! `store.<idx>.suffix`; only the last chunk accepts appends. `add_chunk`
//! seals the appendable chunk and opens the next one - the point a GC uses
//! to partition live history from bytes appended while it runs.
//!
//! After a GC the first chunk of the window may begin with bytes that are
//! already covered by the prefix; `dead_bytes` positions the chunk table so
//! those bytes are never addressable through the suffix.

use std::path::{Path, PathBuf};

use crate::append::{AppendOnlyFile, AutoFlushProcedure};
use crate::error::{Error, Result};
use crate::layout;

#[derive(Debug)]
struct Chunk {
    idx: u32,
    /// Absolute store offset of the chunk's first physical byte.
    start_off: u64,
    ao: AppendOnlyFile,
}

impl Chunk {
    fn end_off(&self) -> u64 {
        self.start_off + self.ao.end_poff()
    }
}

/// Parameters shared by the open paths, all taken from the control payload.
#[derive(Debug, Clone, Copy)]
pub struct SuffixParams {
    pub chunk_start_idx: u32,
    pub chunk_num: u32,
    /// End offset local to the last chunk.
    pub end_poff: u64,
    /// Absolute offset where live suffix data begins.
    pub start_offset: u64,
    /// Leading bytes of the first chunk below `start_offset`.
    pub dead_bytes: u64,
}

#[derive(Debug)]
pub struct Suffix {
    root: PathBuf,
    chunks: Vec<Chunk>,
    start_idx: u32,
    dead_bytes: u64,
    auto_flush_threshold: usize,
    readonly: bool,
}

impl Suffix {
    /// Create a fresh suffix: one empty chunk, index 0, starting at offset 0.
    pub fn create_rw(root: &Path, overwrite: bool, auto_flush_threshold: usize) -> Result<Self> {
        let ao = AppendOnlyFile::create_rw(
            &layout::suffix_path(root, 0),
            overwrite,
            auto_flush_threshold,
            AutoFlushProcedure::External,
        )?;
        Ok(Self {
            root: root.to_path_buf(),
            chunks: vec![Chunk {
                idx: 0,
                start_off: 0,
                ao,
            }],
            start_idx: 0,
            dead_bytes: 0,
            auto_flush_threshold,
            readonly: false,
        })
    }

    pub fn open_rw(root: &Path, params: SuffixParams, auto_flush_threshold: usize) -> Result<Self> {
        Self::open(root, params, auto_flush_threshold, false)
    }

    pub fn open_ro(root: &Path, params: SuffixParams) -> Result<Self> {
        Self::open(root, params, 0, true)
    }

    fn open(
        root: &Path,
        params: SuffixParams,
        auto_flush_threshold: usize,
        readonly: bool,
    ) -> Result<Self> {
        if params.chunk_num == 0 {
            return Err(Error::InvalidLayout("empty suffix chunk window".to_string()));
        }
        let mut chunks = Vec::with_capacity(params.chunk_num as usize);
        let mut start_off = params.start_offset - params.dead_bytes;
        let last_idx = params.chunk_start_idx + params.chunk_num - 1;
        for idx in params.chunk_start_idx..=last_idx {
            let path = layout::suffix_path(root, idx);
            let ao = if idx == last_idx {
                // The appendable chunk: its logical end comes from the
                // control, bytes past it are crash leftovers.
                if readonly {
                    AppendOnlyFile::open_ro(&path, params.end_poff)?
                } else {
                    AppendOnlyFile::open_rw(
                        &path,
                        params.end_poff,
                        auto_flush_threshold,
                        AutoFlushProcedure::External,
                    )?
                }
            } else {
                // Sealed chunks were flushed in full before the split that
                // retired them, so the file length is authoritative.
                let len = std::fs::metadata(&path)
                    .map_err(|_| Error::NoSuchFileOrDirectory)?
                    .len();
                AppendOnlyFile::open_ro(&path, len)?
            };
            let len = ao.end_poff();
            chunks.push(Chunk { idx, start_off, ao });
            start_off += len;
        }
        Ok(Self {
            root: root.to_path_buf(),
            chunks,
            start_idx: params.chunk_start_idx,
            dead_bytes: params.dead_bytes,
            auto_flush_threshold,
            readonly,
        })
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn chunk_start_idx(&self) -> u32 {
        self.start_idx
    }

    pub fn chunk_num(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn dead_bytes(&self) -> u64 {
        self.dead_bytes
    }

    /// Absolute offset of the first live suffix byte.
    pub fn start_offset(&self) -> u64 {
        self.chunks[0].start_off + self.dead_bytes
    }

    /// Absolute offset one past the last appended byte.
    pub fn end_offset(&self) -> u64 {
        self.chunks.last().expect("window is never empty").end_off()
    }

    /// End offset local to the appendable chunk, as persisted in the
    /// control payload.
    pub fn end_poff(&self) -> u64 {
        self.chunks.last().expect("window is never empty").ao.end_poff()
    }

    fn appendable(&mut self) -> &mut AppendOnlyFile {
        &mut self.chunks.last_mut().expect("window is never empty").ao
    }

    /// Append to the last chunk. Returns `true` when the owner must run the
    /// dependency-ordered flush.
    pub fn append_exn(&mut self, bytes: &[u8]) -> Result<bool> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        self.appendable().append_exn(bytes)
    }

    /// Read `buf.len()` bytes starting at absolute offset `offset`.
    ///
    /// Offsets below [`Self::start_offset`] belong to the prefix (or to a
    /// reclaimed region) and are refused here.
    pub fn read_exn(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset < self.start_offset() {
            return Err(Error::InvalidReadOfGcedObject(offset));
        }
        if offset + buf.len() as u64 > self.end_offset() {
            return Err(Error::ReadOutOfBounds);
        }
        // Locate the first chunk containing `offset`.
        let mut i = match self
            .chunks
            .binary_search_by(|c| c.start_off.cmp(&offset))
        {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        let mut off = offset;
        let mut filled = 0;
        while filled < buf.len() {
            let chunk = &self.chunks[i];
            let local = off - chunk.start_off;
            let available = (chunk.end_off() - off) as usize;
            let take = available.min(buf.len() - filled);
            chunk.ao.read_exn(local, &mut buf[filled..filled + take])?;
            filled += take;
            off += take as u64;
            i += 1;
        }
        Ok(())
    }

    /// Per-chunk `(idx, absolute start, absolute end)` rows, in window
    /// order. The GC worker partitions removable chunks with this.
    pub fn chunk_table(&self) -> Vec<(u32, u64, u64)> {
        self.chunks
            .iter()
            .map(|c| (c.idx, c.start_off, c.end_off()))
            .collect()
    }

    /// Seal the appendable chunk and start the next, empty one.
    pub fn add_chunk(&mut self) -> Result<()> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        self.appendable().flush()?;
        let last = self.chunks.last().expect("window is never empty");
        let next_idx = last.idx + 1;
        let next_start = last.end_off();
        let ao = AppendOnlyFile::create_rw(
            &layout::suffix_path(&self.root, next_idx),
            false,
            self.auto_flush_threshold,
            AutoFlushProcedure::External,
        )?;
        self.chunks.push(Chunk {
            idx: next_idx,
            start_off: next_start,
            ao,
        });
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        self.appendable().flush()
    }

    pub fn fsync(&self) -> Result<()> {
        self.chunks.last().expect("window is never empty").ao.fsync()
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.chunks
            .last()
            .expect("window is never empty")
            .ao
            .buffer_is_empty()
    }

    pub fn needs_external_flush(&self) -> bool {
        self.chunks
            .last()
            .expect("window is never empty")
            .ao
            .needs_external_flush()
    }

    /// RO side: adopt the writer's new end offset for the last chunk.
    pub fn refresh_end_poff(&mut self, end_poff: u64) -> Result<()> {
        let chunk = self.chunks.last_mut().expect("window is never empty");
        chunk.ao.refresh_end_poff(end_poff)
    }

    pub fn close(&mut self) -> Result<()> {
        for chunk in &mut self.chunks {
            chunk.ao.close()?;
        }
        self.chunks.clear();
        Ok(())
    }
}
