//! Writer exclusivity for a store root.
//!
//! A read-write open takes an exclusive advisory lock on `store.lock` and
//! keeps it for the life of the file manager. The file carries a stamp
//! naming the current writer, and contended opens read it back so the
//! error can say who owns the store instead of a bare `EWOULDBLOCK`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::layout;

#[derive(Debug)]
pub struct WriterLock {
    // Keeps the descriptor, and with it the lock, alive.
    _stamp: File,
    path: PathBuf,
}

impl WriterLock {
    /// Take the writer lock for `root`, failing fast when another process
    /// holds it. The refusal names the recorded owner.
    pub fn acquire(root: &Path) -> io::Result<Self> {
        let path = layout::lock_path(root);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = Self::try_exclusive(&file) {
            // The holder's stamp is only advisory; a failed read still
            // produces a usable refusal.
            let mut owner = String::new();
            let _ = file.read_to_string(&mut owner);
            return Err(io::Error::new(
                e.kind(),
                format!(
                    "store at {} is locked by [{}]",
                    root.display(),
                    owner.trim()
                ),
            ));
        }

        // The lock is ours: replace whatever stamp a previous (possibly
        // crashed) writer left behind.
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "pid {}", std::process::id())?;
        file.flush()?;

        Ok(Self { _stamp: file, path })
    }

    #[cfg(unix)]
    fn try_exclusive(file: &File) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_exclusive(_file: &File) -> io::Result<()> {
        // No advisory locking here; single-writer discipline falls to the
        // operator.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// The OS drops the lock when the stamp descriptor closes; the file itself
// stays behind (removing it would race a concurrent acquire).

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_acquire_stamps_owner() {
        let dir = TempDir::new().unwrap();
        let lock = WriterLock::acquire(dir.path()).expect("acquire");
        assert_eq!(lock.path(), layout::lock_path(dir.path()));
        let stamp = std::fs::read_to_string(lock.path()).unwrap();
        assert!(stamp.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_contended_acquire_names_owner() {
        let dir = TempDir::new().unwrap();
        let _held = WriterLock::acquire(dir.path()).expect("first acquire");

        let err = WriterLock::acquire(dir.path()).expect_err("second must fail");
        let msg = err.to_string();
        assert!(msg.contains("locked by"));
        assert!(msg.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _held = WriterLock::acquire(dir.path()).expect("first acquire");
        }
        WriterLock::acquire(dir.path()).expect("relock after drop");
    }

    #[test]
    fn test_reacquire_replaces_stale_stamp() {
        let dir = TempDir::new().unwrap();
        std::fs::write(layout::lock_path(dir.path()), "pid 424242 (crashed)\n").unwrap();

        let lock = WriterLock::acquire(dir.path()).expect("acquire over stale stamp");
        let stamp = std::fs::read_to_string(lock.path()).unwrap();
        assert!(!stamp.contains("424242"));
        assert!(stamp.contains(&std::process::id().to_string()));
    }
}
