//! Buffered append-only files.
//!
//! The dict and every suffix chunk sit on one of these. Appends land in a
//! memory buffer; once the buffer crosses the configured threshold the file
//! either flushes itself (`Internal`) or reports the overflow to its owner
//! (`External`) so the file manager can flush dependencies in the required
//! order first. Reads are served from disk and, for the tail past the
//! persisted end, straight from the buffer, so a reference to a
//! just-appended entry resolves without forcing an early flush.

use std::path::Path;

use crate::error::{Error, Result};
use crate::io::IoFile;

/// What to do when the append buffer crosses the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoFlushProcedure {
    /// Flush this file's own buffer in place.
    Internal,
    /// Leave the buffer alone and signal the caller, which owns the
    /// dependency-ordered flush.
    External,
}

#[derive(Debug)]
pub struct AppendOnlyFile {
    io: IoFile,
    buf: Vec<u8>,
    /// End of the data already written to the OS, as an offset local to
    /// this file.
    persisted_end: u64,
    auto_flush_threshold: usize,
    auto_flush: AutoFlushProcedure,
}

impl AppendOnlyFile {
    pub fn create_rw(
        path: &Path,
        overwrite: bool,
        auto_flush_threshold: usize,
        auto_flush: AutoFlushProcedure,
    ) -> Result<Self> {
        let io = IoFile::create_rw(path, overwrite)?;
        Ok(Self {
            io,
            buf: Vec::new(),
            persisted_end: 0,
            auto_flush_threshold,
            auto_flush,
        })
    }

    /// Open read-write, trusting `end_poff` (from the control file) over the
    /// physical length: bytes past it are dead leftovers from a crash.
    pub fn open_rw(
        path: &Path,
        end_poff: u64,
        auto_flush_threshold: usize,
        auto_flush: AutoFlushProcedure,
    ) -> Result<Self> {
        let io = IoFile::open_rw(path)?;
        if io.length()? < end_poff {
            return Err(Error::InconsistentStore(format!(
                "{} shorter than its persisted end offset {end_poff}",
                path.display()
            )));
        }
        Ok(Self {
            io,
            buf: Vec::new(),
            persisted_end: end_poff,
            auto_flush_threshold,
            auto_flush,
        })
    }

    pub fn open_ro(path: &Path, end_poff: u64) -> Result<Self> {
        let io = IoFile::open_ro(path)?;
        if io.length()? < end_poff {
            return Err(Error::InconsistentStore(format!(
                "{} shorter than its persisted end offset {end_poff}",
                path.display()
            )));
        }
        Ok(Self {
            io,
            buf: Vec::new(),
            persisted_end: end_poff,
            // Readers never append, so the threshold is moot.
            auto_flush_threshold: usize::MAX,
            auto_flush: AutoFlushProcedure::Internal,
        })
    }

    pub fn readonly(&self) -> bool {
        self.io.readonly()
    }

    pub fn path(&self) -> &Path {
        self.io.path()
    }

    /// Logical end offset: persisted bytes plus whatever the buffer holds.
    pub fn end_poff(&self) -> u64 {
        self.persisted_end + self.buf.len() as u64
    }

    /// End offset of the data actually on disk.
    pub fn persisted_end_poff(&self) -> u64 {
        self.persisted_end
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether an `External` flush is overdue. The owner polls this after
    /// batched appends that bypass the per-append signal.
    pub fn needs_external_flush(&self) -> bool {
        self.auto_flush == AutoFlushProcedure::External && self.buf.len() >= self.auto_flush_threshold
    }

    /// Append bytes. Returns `true` when the buffer crossed the threshold
    /// and the procedure is `External`: the owner must now run its
    /// dependency-ordered flush. Under `Internal` the flush already
    /// happened.
    pub fn append_exn(&mut self, bytes: &[u8]) -> Result<bool> {
        if self.io.readonly() {
            return Err(Error::RoNotAllowed);
        }
        self.buf.extend_from_slice(bytes);
        if self.buf.len() < self.auto_flush_threshold {
            return Ok(false);
        }
        match self.auto_flush {
            AutoFlushProcedure::Internal => {
                self.flush()?;
                Ok(false)
            }
            AutoFlushProcedure::External => Ok(true),
        }
    }

    /// Write the buffer to the OS at the persisted end.
    pub fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.io.pwrite(self.persisted_end, &self.buf)?;
        self.persisted_end += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    pub fn fsync(&self) -> Result<()> {
        self.io.fsync()
    }

    /// Read `buf.len()` bytes at `offset`, stitching disk and buffer as
    /// needed. Reads past [`Self::end_poff`] are out of bounds.
    pub fn read_exn(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.end_poff() {
            return Err(Error::ReadOutOfBounds);
        }
        let split = self.persisted_end.clamp(offset, end);
        let disk_len = (split - offset) as usize;
        if disk_len > 0 {
            self.io.pread_exact(offset, &mut buf[..disk_len])?;
        }
        if disk_len < buf.len() {
            let from = (split - self.persisted_end) as usize;
            let len = buf.len() - disk_len;
            buf[disk_len..].copy_from_slice(&self.buf[from..from + len]);
        }
        Ok(())
    }

    /// RO side: adopt a new persisted end after a control reload.
    pub fn refresh_end_poff(&mut self, end_poff: u64) -> Result<()> {
        if self.io.length()? < end_poff {
            return Err(Error::InconsistentStore(format!(
                "{} shorter than its reloaded end offset {end_poff}",
                self.io.path().display()
            )));
        }
        self.persisted_end = end_poff;
        Ok(())
    }

    /// Close, refusing while appended bytes are still buffered.
    pub fn close(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(Error::PendingFlush);
        }
        self.io.close()
    }
}
