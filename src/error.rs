use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Pack store errors.
///
/// The tag set is closed: every fallible public operation reports one of
/// these. Errors are serializable so the GC worker can hand them back
/// across the task boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    // File-level I/O.
    /// A file handle was closed twice.
    DoubleClose,
    /// Creation was requested for a path that already exists.
    FileExists,
    /// The path does not exist.
    NoSuchFileOrDirectory,
    /// Expected a regular file at this path.
    NotAFile,
    /// Expected a directory at this path.
    NotADirectory,
    /// A positional read ran past the end of the addressable data.
    ReadOutOfBounds,
    /// Any other I/O failure, with the OS message.
    IoMisc(String),

    // Control file.
    /// The control file header or payload failed to parse or checksum.
    CorruptedControlFile(String),
    /// The control file was written by a newer major version.
    V3StoreFromTheFuture,
    /// The store layout carries a major pack version this build cannot read.
    UnknownMajorPackVersion(u8),
    /// The files under the store root do not form a recognizable layout.
    InvalidLayout(String),
    /// A legacy layout was found and `no_migrate` forbids upgrading it.
    MigrationNeeded,

    // Indexing strategy.
    /// A GC has already run; only the minimal indexing strategy may open RW.
    OnlyMinimalIndexingStrategyAllowed,
    /// GC cannot run under the active configuration.
    GcDisallowed(String),
    /// GC cannot start while a batch is open.
    GcForbiddenDuringBatch,
    /// A suffix split cannot happen while a batch is open.
    SplitForbiddenDuringBatch,

    // Pack reads.
    /// The offset lies below the live window and was reclaimed by a GC.
    InvalidReadOfGcedObject(u64),
    /// The offset falls inside the prefix range but the mapping has no row for it.
    InvalidPrefixRead(u64),
    /// The mapping file itself is malformed.
    InvalidMappingRead(String),
    /// The key's hash is known to no store component.
    DanglingKey(String),
    /// The GC target commit resolves to no live entry.
    CommitKeyIsDangling(String),
    /// A commit parent surfaced as an indexed key where a direct key is required.
    CommitParentKeyIsIndexed(String),

    // GC lifecycle.
    /// The worker reported a failure of its own.
    GcProcessError(String),
    /// The worker's result file exists but does not decode.
    CorruptedGcResultFile(String),
    /// The worker finished without leaving a readable result file.
    GcProcessDiedWithoutResultFile,

    // Store lifecycle.
    /// `close` was called while an append buffer still holds bytes.
    PendingFlush,
    /// A mutation was attempted through a read-only instance.
    RoNotAllowed,
    /// The store or file manager has been closed.
    Closed,
    /// On-disk state contradicts itself beyond recovery.
    InconsistentStore(String),
    /// A read produced bytes whose hash or kind contradicts the key.
    CorruptedStore(String),
    /// Reserved: a chunk range with more than one empty chunk. Never raised.
    MultipleEmptyChunks,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::DoubleClose => write!(f, "file closed twice"),
            Error::FileExists => write!(f, "file already exists"),
            Error::NoSuchFileOrDirectory => write!(f, "no such file or directory"),
            Error::NotAFile => write!(f, "not a file"),
            Error::NotADirectory => write!(f, "not a directory"),
            Error::ReadOutOfBounds => write!(f, "read out of bounds"),
            Error::IoMisc(msg) => write!(f, "io error: {msg}"),
            Error::CorruptedControlFile(msg) => write!(f, "corrupted control file: {msg}"),
            Error::V3StoreFromTheFuture => write!(f, "control file written by a future version"),
            Error::UnknownMajorPackVersion(v) => write!(f, "unknown major pack version {v}"),
            Error::InvalidLayout(msg) => write!(f, "invalid store layout: {msg}"),
            Error::MigrationNeeded => write!(f, "legacy store requires migration"),
            Error::OnlyMinimalIndexingStrategyAllowed => {
                write!(f, "a gced store only opens with the minimal indexing strategy")
            }
            Error::GcDisallowed(msg) => write!(f, "gc disallowed: {msg}"),
            Error::GcForbiddenDuringBatch => write!(f, "gc forbidden during batch"),
            Error::SplitForbiddenDuringBatch => write!(f, "split forbidden during batch"),
            Error::InvalidReadOfGcedObject(off) => {
                write!(f, "read of gced object at offset {off}")
            }
            Error::InvalidPrefixRead(off) => write!(f, "unmapped prefix read at offset {off}"),
            Error::InvalidMappingRead(msg) => write!(f, "invalid mapping read: {msg}"),
            Error::DanglingKey(msg) => write!(f, "dangling key: {msg}"),
            Error::CommitKeyIsDangling(msg) => write!(f, "gc commit key is dangling: {msg}"),
            Error::CommitParentKeyIsIndexed(msg) => {
                write!(f, "commit parent key is indexed: {msg}")
            }
            Error::GcProcessError(msg) => write!(f, "gc process error: {msg}"),
            Error::CorruptedGcResultFile(msg) => write!(f, "corrupted gc result file: {msg}"),
            Error::GcProcessDiedWithoutResultFile => {
                write!(f, "gc process died without a result file")
            }
            Error::PendingFlush => write!(f, "close refused: unflushed append buffer"),
            Error::RoNotAllowed => write!(f, "mutation attempted on a read-only instance"),
            Error::Closed => write!(f, "operation on a closed store"),
            Error::InconsistentStore(msg) => write!(f, "inconsistent store: {msg}"),
            Error::CorruptedStore(msg) => write!(f, "corrupted store: {msg}"),
            Error::MultipleEmptyChunks => write!(f, "multiple empty suffix chunks"),
        }
    }
}

/// Constructs an `Error::CorruptedStore` for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::CorruptedStore(format!($($args)*)) };
}

/// A pack store Result returning [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Error::NoSuchFileOrDirectory,
            ErrorKind::AlreadyExists => Error::FileExists,
            ErrorKind::UnexpectedEof => Error::ReadOutOfBounds,
            _ => Error::IoMisc(err.to_string()),
        }
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::CorruptedStore(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IoMisc(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::GcProcessError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let nf = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(Error::from(nf), Error::NoSuchFileOrDirectory);

        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(Error::from(eof), Error::ReadOutOfBounds);

        let exists = std::io::Error::from(std::io::ErrorKind::AlreadyExists);
        assert_eq!(Error::from(exists), Error::FileExists);
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::InvalidReadOfGcedObject(4096);
        assert!(err.to_string().contains("4096"));

        let err = errcorrupt!("hash mismatch at {}", 17);
        assert!(err.to_string().contains("hash mismatch at 17"));
    }
}
