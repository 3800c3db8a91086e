//! The mapping: the GC-produced table redirecting live pre-GC offsets into
//! the prefix.
//!
//! ```text
//! +----------------+-----------+----------------+
//! | src_off (u64)  | len (u32) | dst_off (u64)  |   ... sorted by src_off
//! +----------------+-----------+----------------+
//! ```
//!
//! Rows are sorted, de-duplicated and non-overlapping; a read below the
//! suffix start binary-searches its row and lands in the prefix at
//! `dst_off + (off - src_off)`. Offsets between rows were reclaimed.

use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::append::{AppendOnlyFile, AutoFlushProcedure};
use crate::error::{Error, Result};
use crate::io::IoFile;

const ROW_SIZE: usize = 8 + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row {
    pub src_off: u64,
    pub len: u32,
    pub dst_off: u64,
}

impl Row {
    pub fn src_end(&self) -> u64 {
        self.src_off + u64::from(self.len)
    }
}

/// A resolved position inside the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// Prefix offset corresponding to the queried store offset.
    pub dst_off: u64,
    /// Bytes left in the row from the queried offset on.
    pub available: u64,
}

#[derive(Debug)]
pub struct Mapping {
    rows: Vec<Row>,
}

impl Mapping {
    /// Load and validate a mapping file.
    pub fn open(path: &Path) -> Result<Self> {
        let io = IoFile::open_ro(path)?;
        let len = io.length()?;
        if len % ROW_SIZE as u64 != 0 {
            return Err(Error::InvalidMappingRead(format!(
                "{} has a torn row: {len} bytes",
                path.display()
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        io.pread_exact(0, &mut bytes)?;

        let mut rows = Vec::with_capacity(len as usize / ROW_SIZE);
        let mut cursor = &bytes[..];
        while !cursor.is_empty() {
            let src_off = cursor.read_u64::<BigEndian>().expect("sized above");
            let len = cursor.read_u32::<BigEndian>().expect("sized above");
            let dst_off = cursor.read_u64::<BigEndian>().expect("sized above");
            rows.push(Row {
                src_off,
                len,
                dst_off,
            });
        }
        for pair in rows.windows(2) {
            if pair[1].src_off < pair[0].src_end() {
                return Err(Error::InvalidMappingRead(format!(
                    "rows out of order near src offset {}",
                    pair[1].src_off
                )));
            }
        }
        Ok(Self { rows })
    }

    /// Redirect a store offset into the prefix. `None` means the offset was
    /// reclaimed: no live row covers it.
    pub fn lookup(&self, off: u64) -> Option<Resolved> {
        let i = self.rows.partition_point(|row| row.src_end() <= off);
        match self.rows.get(i) {
            Some(row) if row.src_off <= off => Some(Resolved {
                dst_off: row.dst_off + (off - row.src_off),
                available: row.src_end() - off,
            }),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate rows in src order (the GC orchestrator samples these for
    /// sanity checks and stats).
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }
}

/// Streaming writer used by the GC worker while copying the live set.
#[derive(Debug)]
pub struct MappingWriter {
    ao: AppendOnlyFile,
    last_src_end: u64,
    rows: u64,
}

impl MappingWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let ao = AppendOnlyFile::create_rw(path, true, 64 * 1024, AutoFlushProcedure::Internal)?;
        Ok(Self {
            ao,
            last_src_end: 0,
            rows: 0,
        })
    }

    /// Append a row. Rows must arrive sorted and disjoint; the mark phase
    /// guarantees that and this enforces it.
    pub fn push(&mut self, row: Row) -> Result<()> {
        if row.src_off < self.last_src_end {
            return Err(Error::InvalidMappingRead(format!(
                "row at src offset {} overlaps its predecessor",
                row.src_off
            )));
        }
        self.last_src_end = row.src_end();
        let mut buf = Vec::with_capacity(ROW_SIZE);
        buf.write_u64::<BigEndian>(row.src_off).unwrap();
        buf.write_u32::<BigEndian>(row.len).unwrap();
        buf.write_u64::<BigEndian>(row.dst_off).unwrap();
        self.ao.append_exn(&buf)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    pub fn finish(mut self, with_fsync: bool) -> Result<()> {
        self.ao.flush()?;
        if with_fsync {
            self.ao.fsync()?;
        }
        self.ao.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn build(dir: &TempDir, rows: &[Row]) -> Mapping {
        let path = dir.file("store.mapping.1");
        let mut writer = MappingWriter::create(&path).unwrap();
        for row in rows {
            writer.push(*row).unwrap();
        }
        writer.finish(false).unwrap();
        Mapping::open(&path).unwrap()
    }

    #[test]
    fn test_lookup_inside_rows() {
        let dir = TempDir::new().unwrap();
        let mapping = build(
            &dir,
            &[
                Row { src_off: 100, len: 50, dst_off: 0 },
                Row { src_off: 200, len: 10, dst_off: 50 },
            ],
        );

        assert_eq!(
            mapping.lookup(100),
            Some(Resolved { dst_off: 0, available: 50 })
        );
        assert_eq!(
            mapping.lookup(130),
            Some(Resolved { dst_off: 30, available: 20 })
        );
        assert_eq!(
            mapping.lookup(205),
            Some(Resolved { dst_off: 55, available: 5 })
        );
    }

    #[test]
    fn test_lookup_outside_rows_misses() {
        let dir = TempDir::new().unwrap();
        let mapping = build(&dir, &[Row { src_off: 100, len: 50, dst_off: 0 }]);

        assert_eq!(mapping.lookup(99), None);
        assert_eq!(mapping.lookup(150), None);
        assert_eq!(mapping.lookup(0), None);
    }

    #[test]
    fn test_writer_rejects_overlap() {
        let dir = TempDir::new().unwrap();
        let mut writer = MappingWriter::create(&dir.file("m")).unwrap();
        writer.push(Row { src_off: 0, len: 10, dst_off: 0 }).unwrap();
        assert!(writer.push(Row { src_off: 5, len: 10, dst_off: 10 }).is_err());
    }

    #[test]
    fn test_open_rejects_torn_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.file("m");
        std::fs::write(&path, [0u8; ROW_SIZE + 3]).unwrap();
        assert!(matches!(
            Mapping::open(&path),
            Err(Error::InvalidMappingRead(_))
        ));
    }

    #[test]
    fn test_open_rejects_unsorted_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.file("m");
        // Hand-write two out-of-order rows.
        let mut bytes = Vec::new();
        for row in [
            Row { src_off: 100, len: 10, dst_off: 0 },
            Row { src_off: 50, len: 10, dst_off: 10 },
        ] {
            bytes.write_u64::<BigEndian>(row.src_off).unwrap();
            bytes.write_u32::<BigEndian>(row.len).unwrap();
            bytes.write_u64::<BigEndian>(row.dst_off).unwrap();
        }
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            Mapping::open(&path),
            Err(Error::InvalidMappingRead(_))
        ));
    }
}
