//! Typed wrapper over positional file I/O.
//!
//! Every on-disk structure in the store goes through this module: it is the
//! only place that touches `File` directly. Handles carry their open mode so
//! writes through a read-only handle fail with [`Error::RoNotAllowed`]
//! instead of surfacing as an OS error, and closing is explicit so a double
//! close is reported rather than silently ignored.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// What a path points at, for layout validation and cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
    Other,
    NoEnt,
}

/// Classify a path without following through errors.
pub fn classify_path(path: &Path) -> PathKind {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => PathKind::File,
        Ok(meta) if meta.is_dir() => PathKind::Directory,
        Ok(_) => PathKind::Other,
        Err(_) => PathKind::NoEnt,
    }
}

/// Remove a file.
pub fn unlink(path: &Path) -> Result<()> {
    fs::remove_file(path)?;
    Ok(())
}

/// Create a directory (parents included).
pub fn mkdir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Atomically replace `to` with `from`.
pub fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to)?;
    Ok(())
}

/// A positional file handle.
#[derive(Debug)]
pub struct IoFile {
    file: Option<File>,
    readonly: bool,
    path: PathBuf,
}

impl IoFile {
    /// Create a read-write file. Fails with [`Error::FileExists`] if the
    /// path is taken and `overwrite` is false.
    pub fn create_rw(path: &Path, overwrite: bool) -> Result<Self> {
        if !overwrite && classify_path(path) != PathKind::NoEnt {
            return Err(Error::FileExists);
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            file: Some(file),
            readonly: false,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing file read-write.
    pub fn open_rw(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: Some(file),
            readonly: false,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing file read-only.
    pub fn open_ro(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file: Some(file),
            readonly: true,
            path: path.to_path_buf(),
        })
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> Result<&File> {
        self.file.as_ref().ok_or(Error::Closed)
    }

    /// Read exactly `buf.len()` bytes at `offset`. A short read reports
    /// [`Error::ReadOutOfBounds`].
    pub fn pread_exact(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self.handle()?.read_exact_at(buf, offset) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::ReadOutOfBounds),
            Err(e) => Err(e.into()),
        }
    }

    /// Read up to `buf.len()` bytes at `offset`, returning the count.
    pub fn pread_at_most(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        let file = self.handle()?;
        while total < buf.len() {
            match file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Write all of `buf` at `offset`.
    pub fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        self.handle()?.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Current byte length of the file.
    pub fn length(&self) -> Result<u64> {
        Ok(self.handle()?.metadata()?.len())
    }

    /// Flush OS buffers to stable storage.
    pub fn fsync(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        self.handle()?.sync_all()?;
        Ok(())
    }

    /// Close the handle. A second close reports [`Error::DoubleClose`].
    pub fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => {
                drop(file);
                Ok(())
            }
            None => Err(Error::DoubleClose),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_pread_pwrite_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let file = IoFile::create_rw(&path, false).unwrap();

        file.pwrite(0, b"hello world").unwrap();
        file.pwrite(6, b"store").unwrap();

        let mut buf = [0u8; 11];
        file.pread_exact(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello store");
    }

    #[test]
    fn test_short_read_is_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let file = IoFile::create_rw(&path, false).unwrap();
        file.pwrite(0, b"abc").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(file.pread_exact(0, &mut buf), Err(Error::ReadOutOfBounds));
        assert_eq!(file.pread_at_most(0, &mut buf).unwrap(), 3);
    }

    #[test]
    fn test_readonly_rejects_mutation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        IoFile::create_rw(&path, false).unwrap().pwrite(0, b"x").unwrap();

        let ro = IoFile::open_ro(&path).unwrap();
        assert!(ro.readonly());
        assert_eq!(ro.pwrite(0, b"y"), Err(Error::RoNotAllowed));
        assert_eq!(ro.fsync(), Err(Error::RoNotAllowed));
    }

    #[test]
    fn test_double_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let mut file = IoFile::create_rw(&path, false).unwrap();
        file.close().unwrap();
        assert_eq!(file.close(), Err(Error::DoubleClose));
        assert_eq!(file.length(), Err(Error::Closed));
    }

    #[test]
    fn test_create_refuses_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        IoFile::create_rw(&path, false).unwrap();
        assert_eq!(
            IoFile::create_rw(&path, false).map(|_| ()),
            Err(Error::FileExists)
        );
        // Overwrite truncates.
        let file = IoFile::create_rw(&path, true).unwrap();
        assert_eq!(file.length().unwrap(), 0);
    }

    #[test]
    fn test_classify_path() {
        let dir = TempDir::new().unwrap();
        assert_eq!(classify_path(dir.path()), PathKind::Directory);
        let path = dir.path().join("f");
        IoFile::create_rw(&path, false).unwrap();
        assert_eq!(classify_path(&path), PathKind::File);
        assert_eq!(classify_path(&dir.path().join("missing")), PathKind::NoEnt);
    }
}
