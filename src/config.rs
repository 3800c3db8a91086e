use std::path::PathBuf;

use crate::index::IndexingStrategy;

/// How `add` behaves when the index merge falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeThrottle {
    /// Block writers until the merge completes.
    BlockWrites,
    /// Keep accepting writes and let the index hold the overflow in memory.
    OvercommitMemory,
}

/// Whether contents entries carry a length header on disk.
///
/// Without one, a contents entry can only be sized through the index, which
/// rules out GC (the minimal strategy does not index contents).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentsLengthHeader {
    None,
    Varint,
}

/// Ordering applied to inode children before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeChildOrder {
    /// Order by the leading bits of the child hash.
    HashBits,
    /// Order by a seeded hash of the child hash.
    SeededHash,
    /// Caller-defined order, preserved as given.
    Custom,
}

/// Configuration for a pack store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding every store file.
    pub root: PathBuf,

    /// Create a fresh store (true) or open an existing one (false).
    pub fresh: bool,

    /// Which entries get registered in the index. GC requires `Minimal`.
    pub indexing_strategy: IndexingStrategy,

    /// Index merge back-pressure policy.
    pub merge_throttle: MergeThrottle,

    /// Entries per index log segment before a merge is scheduled.
    pub index_log_size: usize,

    /// Dict append buffer size before an automatic flush (default: 1MB).
    pub dict_auto_flush_threshold: usize,

    /// Suffix append buffer size before an automatic flush (default: 4MB).
    pub suffix_auto_flush_threshold: usize,

    /// Fsync files after every flush and control rewrite (default: false).
    pub use_fsync: bool,

    /// Refuse to upgrade a legacy monolithic pack layout (default: false).
    pub no_migrate: bool,

    /// Byte capacity of the offset-keyed read cache (default: 32MB).
    pub lru_capacity: usize,

    /// Inode branching factor (default: 32).
    pub entries: usize,

    /// Length-header policy for contents entries (default: varint).
    pub contents_length_header: ContentsLengthHeader,

    /// Refuse to persist inodes with zero children (default: false).
    pub forbid_empty_dir_persistence: bool,

    /// Child ordering applied when encoding inodes (default: hash bits).
    pub inode_child_order: InodeChildOrder,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./packstore"),
            fresh: false,
            indexing_strategy: IndexingStrategy::Minimal,
            merge_throttle: MergeThrottle::BlockWrites,
            index_log_size: 2_500_000,
            dict_auto_flush_threshold: 1024 * 1024,
            suffix_auto_flush_threshold: 4 * 1024 * 1024,
            use_fsync: false,
            no_migrate: false,
            lru_capacity: 32 * 1024 * 1024,
            entries: 32,
            contents_length_header: ContentsLengthHeader::Varint,
            forbid_empty_dir_persistence: false,
            inode_child_order: InodeChildOrder::HashBits,
        }
    }
}

impl Config {
    /// Create a new config rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Create the store from scratch instead of opening an existing one.
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    /// Set the indexing strategy.
    pub fn indexing_strategy(mut self, strategy: IndexingStrategy) -> Self {
        self.indexing_strategy = strategy;
        self
    }

    /// Set the index merge throttle policy.
    pub fn merge_throttle(mut self, throttle: MergeThrottle) -> Self {
        self.merge_throttle = throttle;
        self
    }

    /// Set the index log segment size.
    pub fn index_log_size(mut self, size: usize) -> Self {
        self.index_log_size = size;
        self
    }

    /// Set the dict auto-flush threshold.
    pub fn dict_auto_flush_threshold(mut self, bytes: usize) -> Self {
        self.dict_auto_flush_threshold = bytes;
        self
    }

    /// Set the suffix auto-flush threshold.
    pub fn suffix_auto_flush_threshold(mut self, bytes: usize) -> Self {
        self.suffix_auto_flush_threshold = bytes;
        self
    }

    /// Fsync after flushes and control rewrites.
    pub fn use_fsync(mut self, enabled: bool) -> Self {
        self.use_fsync = enabled;
        self
    }

    /// Refuse legacy-layout migration.
    pub fn no_migrate(mut self, enabled: bool) -> Self {
        self.no_migrate = enabled;
        self
    }

    /// Set the read-cache byte capacity.
    pub fn lru_capacity(mut self, bytes: usize) -> Self {
        self.lru_capacity = bytes;
        self
    }

    /// Set the inode branching factor.
    pub fn entries(mut self, entries: usize) -> Self {
        self.entries = entries;
        self
    }

    /// Set the contents length-header policy.
    pub fn contents_length_header(mut self, policy: ContentsLengthHeader) -> Self {
        self.contents_length_header = policy;
        self
    }

    /// Refuse to persist empty inodes.
    pub fn forbid_empty_dir_persistence(mut self, enabled: bool) -> Self {
        self.forbid_empty_dir_persistence = enabled;
        self
    }

    /// Set the inode child ordering.
    pub fn inode_child_order(mut self, order: InodeChildOrder) -> Self {
        self.inode_child_order = order;
        self
    }
}
