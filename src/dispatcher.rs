//! Read dispatch: one façade resolving logical store offsets to the prefix
//! (through the mapping) or the suffix, opaque to callers.
//!
//! An [`Accessor`] is created first and validated once; `read_exn` then
//! moves the bytes. Offsets below the suffix start belong to the last GC's
//! live image: a miss in the mapping there means the object was reclaimed,
//! a hit that cannot satisfy the requested length means the caller is
//! reading across an entry boundary that no longer exists.

use crate::error::{Error, Result};
use crate::manager::FileManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Suffix,
    Prefix { dst_off: u64 },
}

/// A validated handle on `len` readable bytes at absolute offset `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accessor {
    off: u64,
    len: u64,
    loc: Location,
}

impl Accessor {
    pub fn offset(&self) -> u64 {
        self.off
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct Dispatcher<'a> {
    fm: &'a FileManager,
}

impl<'a> Dispatcher<'a> {
    pub fn new(fm: &'a FileManager) -> Self {
        Self { fm }
    }

    /// One past the last readable offset.
    pub fn end_offset(&self) -> u64 {
        self.fm.suffix().end_offset()
    }

    fn in_prefix(&self, off: u64) -> bool {
        self.fm.mapping().is_some() && off < self.fm.suffix_start_offset()
    }

    /// Accessor for exactly `len` bytes at `off`.
    pub fn create_accessor_exn(&self, off: u64, len: u64) -> Result<Accessor> {
        if self.in_prefix(off) {
            let mapping = self.fm.mapping().expect("checked in in_prefix");
            let resolved = mapping
                .lookup(off)
                .ok_or(Error::InvalidReadOfGcedObject(off))?;
            if len > resolved.available {
                return Err(Error::InvalidPrefixRead(off));
            }
            return Ok(Accessor {
                off,
                len,
                loc: Location::Prefix {
                    dst_off: resolved.dst_off,
                },
            });
        }
        if off + len > self.end_offset() {
            return Err(Error::ReadOutOfBounds);
        }
        Ok(Accessor {
            off,
            len,
            loc: Location::Suffix,
        })
    }

    /// Accessor for at least `min_len` and at most `max_len` bytes at
    /// `off`, clamped to what the containing region can serve. Entry-prefix
    /// reads use this: the full prefix width may hang over the end of a
    /// short entry or of the data itself.
    pub fn create_accessor_from_range_exn(
        &self,
        off: u64,
        min_len: u64,
        max_len: u64,
    ) -> Result<Accessor> {
        if self.in_prefix(off) {
            let mapping = self.fm.mapping().expect("checked in in_prefix");
            let resolved = mapping
                .lookup(off)
                .ok_or(Error::InvalidReadOfGcedObject(off))?;
            if resolved.available < min_len {
                return Err(Error::InvalidPrefixRead(off));
            }
            return Ok(Accessor {
                off,
                len: max_len.min(resolved.available),
                loc: Location::Prefix {
                    dst_off: resolved.dst_off,
                },
            });
        }
        let end = self.end_offset();
        if off >= end || end - off < min_len {
            return Err(Error::ReadOutOfBounds);
        }
        Ok(Accessor {
            off,
            len: max_len.min(end - off),
            loc: Location::Suffix,
        })
    }

    /// Fill `buf` (whose length must equal the accessor's) from the
    /// resolved location.
    pub fn read_exn(&self, accessor: &Accessor, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, accessor.len);
        match accessor.loc {
            Location::Suffix => self.fm.suffix().read_exn(accessor.off, buf),
            Location::Prefix { dst_off } => self
                .fm
                .prefix()
                .ok_or_else(|| {
                    Error::InconsistentStore("mapping present without a prefix".to_string())
                })?
                .read_exn(dst_off, buf),
        }
    }

    /// Convenience: validate and read exactly `buf.len()` bytes at `off`.
    pub fn read_exact_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let accessor = self.create_accessor_exn(off, buf.len() as u64)?;
        self.read_exn(&accessor, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::manager::FileManager;
    use crate::tmpfs::TempDir;

    fn fresh_fm(dir: &TempDir) -> FileManager {
        let cfg = Config::new(dir.path()).suffix_auto_flush_threshold(1024);
        FileManager::create_rw(&cfg, false).unwrap()
    }

    #[test]
    fn test_suffix_reads() {
        let dir = TempDir::new().unwrap();
        let mut fm = fresh_fm(&dir);
        fm.append_entry(b"0123456789").unwrap();

        let dispatcher = Dispatcher::new(&fm);
        let mut buf = [0u8; 4];
        dispatcher.read_exact_at(3, &mut buf).unwrap();
        assert_eq!(&buf, b"3456");

        assert_eq!(
            dispatcher.create_accessor_exn(8, 4).map(|_| ()),
            Err(Error::ReadOutOfBounds)
        );
    }

    #[test]
    fn test_range_accessor_clamps_to_end() {
        let dir = TempDir::new().unwrap();
        let mut fm = fresh_fm(&dir);
        fm.append_entry(b"0123456789").unwrap();

        let dispatcher = Dispatcher::new(&fm);
        let accessor = dispatcher.create_accessor_from_range_exn(6, 2, 100).unwrap();
        assert_eq!(accessor.len(), 4);

        assert_eq!(
            dispatcher.create_accessor_from_range_exn(9, 2, 100).map(|_| ()),
            Err(Error::ReadOutOfBounds)
        );
    }
}
