//! The prefix: the read-only, densely packed image of the live set
//! produced by the last GC. Addressed by prefix-local offsets handed out
//! by the mapping.

use std::path::Path;

use crate::error::{Error, Result};
use crate::io::IoFile;

#[derive(Debug)]
pub struct Prefix {
    io: IoFile,
    len: u64,
}

impl Prefix {
    pub fn open(path: &Path) -> Result<Self> {
        let io = IoFile::open_ro(path)?;
        let len = io.length()?;
        Ok(Self { io, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_exn(&self, dst_off: u64, buf: &mut [u8]) -> Result<()> {
        if dst_off + buf.len() as u64 > self.len {
            return Err(Error::ReadOutOfBounds);
        }
        self.io.pread_exact(dst_off, buf)
    }

    pub fn close(&mut self) -> Result<()> {
        self.io.close()
    }
}
