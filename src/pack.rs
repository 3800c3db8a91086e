//! The pack store: content-addressed `mem` / `find` / `add` over the file
//! manager.
//!
//! # Write path
//! `add` encodes the object into the suffix through the file manager,
//! registers commits (or everything, under the `Always` strategy) in the
//! index, and parks the decoded value in the staging table until the next
//! suffix flush persists its bytes.
//!
//! # Read path
//! `find` consults staging, then the offset-keyed LRU, then reads the pack
//! entry through the dispatcher - which transparently serves pre-GC
//! offsets from the prefix. Keys are promoted in place from hash-only to
//! offset-carrying on their first successful resolution.

use std::collections::HashMap;

use tracing::warn;

use crate::cache::Lru;
use crate::config::{Config, ContentsLengthHeader, InodeChildOrder};
use crate::dispatcher::Dispatcher;
use crate::entry::{self, EntryPrefix, Kind, PREFIX_MAX, PREFIX_MIN};
use crate::errcorrupt;
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::key::{PackKey, Span};
use crate::manager::FileManager;
use crate::object::Object;

/// Running totals the store keeps about itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub appended_entries: u64,
    pub appended_bytes: u64,
}

pub struct PackStore {
    fm: FileManager,
    staging: HashMap<Hash, (Object, Span)>,
    lru: Lru<Object>,
    check_integrity: bool,
    in_batch: bool,
    stats: StoreStats,
}

impl PackStore {
    /// Open per the config: `fresh` recreates the store, otherwise an
    /// existing layout is opened and a missing one created.
    pub fn open(config: &Config) -> Result<Self> {
        let fm = if config.fresh {
            FileManager::create_rw(config, true)?
        } else if crate::io::classify_path(&crate::layout::control_path(&config.root))
            == crate::io::PathKind::NoEnt
            && crate::io::classify_path(&crate::layout::legacy_pack_path(&config.root))
                == crate::io::PathKind::NoEnt
        {
            FileManager::create_rw(config, false)?
        } else {
            FileManager::open_rw(config)?
        };
        Ok(Self::with_fm(fm, config))
    }

    pub fn open_ro(config: &Config) -> Result<Self> {
        let fm = FileManager::open_ro(config)?;
        Ok(Self::with_fm(fm, config))
    }

    fn with_fm(fm: FileManager, config: &Config) -> Self {
        Self {
            fm,
            staging: HashMap::new(),
            lru: Lru::new(config.lru_capacity),
            check_integrity: false,
            in_batch: false,
            stats: StoreStats::default(),
        }
    }

    /// Verify decoded values against their key hash on every pack read.
    pub fn set_check_integrity(&mut self, enabled: bool) {
        self.check_integrity = enabled;
    }

    pub fn readonly(&self) -> bool {
        self.fm.readonly()
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn file_manager(&self) -> &FileManager {
        &self.fm
    }

    pub(crate) fn file_manager_mut(&mut self) -> &mut FileManager {
        &mut self.fm
    }

    pub(crate) fn in_batch(&self) -> bool {
        self.in_batch
    }

    fn contents_policy(&self) -> ContentsLengthHeader {
        self.fm.config().contents_length_header
    }

    // Reads.

    /// Decode the entry prefix at `off` into a key: direct when the kind
    /// carries a length header, indexed otherwise. A dangling-parent
    /// placeholder keeps its commit sizing so the key still spans it.
    pub fn key_of_offset(&self, off: u64) -> Result<PackKey> {
        let dispatcher = Dispatcher::new(&self.fm);
        let accessor =
            dispatcher.create_accessor_from_range_exn(off, PREFIX_MIN as u64, PREFIX_MAX as u64)?;
        let mut buf = vec![0u8; accessor.len() as usize];
        dispatcher.read_exn(&accessor, &mut buf)?;
        let prefix = EntryPrefix::decode(&buf, self.contents_policy())?;
        match prefix.total_length {
            Some(len) => Ok(PackKey::direct(prefix.hash, Span::new(off, len as u32))),
            None => Ok(PackKey::indexed(prefix.hash)),
        }
    }

    /// Resolve a key to its span, via the index when needed, promoting the
    /// key in place.
    fn resolve(&self, key: &PackKey) -> Result<Option<Span>> {
        if let Some(span) = key.span() {
            return Ok(Some(span));
        }
        match self.fm.index().find(&key.hash()) {
            Some((span, _kind)) => {
                key.promote(span);
                Ok(Some(span))
            }
            None => Ok(None),
        }
    }

    /// Read and decode the entry at `span`, expecting `expected` as its
    /// stored hash.
    fn read_entry(&self, span: Span, expected: &Hash) -> Result<Object> {
        let dispatcher = Dispatcher::new(&self.fm);
        let accessor = dispatcher.create_accessor_exn(span.offset, u64::from(span.length))?;
        let mut bytes = vec![0u8; span.length as usize];
        dispatcher.read_exn(&accessor, &mut bytes)?;

        let prefix = EntryPrefix::decode(&bytes, self.contents_policy())?;
        if prefix.hash != *expected {
            return Err(Error::CorruptedStore(format!(
                "entry at offset {} stores hash {}, key expects {}",
                span.offset, prefix.hash, expected
            )));
        }
        if let Some(total) = prefix.total_length {
            if total != u64::from(span.length) {
                return Err(Error::CorruptedStore(format!(
                    "entry at offset {} sized {total} but key spans {}",
                    span.offset, span.length
                )));
            }
        }
        let header_len = entry::header_len(&bytes, prefix.kind, self.contents_policy())?;
        let payload = &bytes[header_len..];

        let mut key_of_offset = |off: u64| self.key_of_offset(off);
        let object =
            Object::decode_payload(prefix.kind, payload, self.fm.dict(), &mut key_of_offset)?;
        if self.check_integrity && object.hash() != *expected {
            return Err(Error::CorruptedStore(format!(
                "value at offset {} re-hashes to {}, key expects {}",
                span.offset,
                object.hash(),
                expected
            )));
        }
        Ok(object)
    }

    /// Look a key up: staging, LRU, then the pack files.
    pub fn find(&mut self, key: &PackKey) -> Result<Option<Object>> {
        if let Some((object, span)) = self.staging.get(&key.hash()) {
            key.promote(*span);
            return Ok(Some(object.clone()));
        }
        if let Some(span) = key.span() {
            if let Some(object) = self.lru.get(span.offset) {
                return Ok(Some(object.clone()));
            }
        }
        let Some(span) = self.resolve(key)? else {
            return Ok(None);
        };
        let object = self.read_entry(span, &key.hash())?;
        self.lru.set(span.offset, object.clone(), object.weight());
        Ok(Some(object))
    }

    /// Membership test. Cheaper than `find`: a pack probe reads only the
    /// hash and kind bytes. Reclaimed offsets answer `false`.
    pub fn mem(&mut self, key: &PackKey) -> Result<bool> {
        if self.staging.contains_key(&key.hash()) {
            return Ok(true);
        }
        if let Some(span) = key.span() {
            if self.lru.get(span.offset).is_some() {
                return Ok(true);
            }
        }
        let Some(span) = self.resolve(key)? else {
            return Ok(false);
        };
        let dispatcher = Dispatcher::new(&self.fm);
        let accessor =
            match dispatcher.create_accessor_exn(span.offset, PREFIX_MIN as u64) {
                Ok(a) => a,
                Err(
                    Error::InvalidReadOfGcedObject(_)
                    | Error::InvalidPrefixRead(_)
                    | Error::ReadOutOfBounds,
                ) => return Ok(false),
                Err(e) => return Err(e),
            };
        let mut buf = [0u8; PREFIX_MIN];
        dispatcher.read_exn(&accessor, &mut buf)?;
        let kind = Kind::from_u8(buf[crate::hash::HASH_SIZE])?;
        if kind == Kind::DanglingParentCommit {
            return Ok(false);
        }
        let stored = Hash::from_slice(&buf[..crate::hash::HASH_SIZE]).expect("fixed width");
        if stored != key.hash() {
            return Err(errcorrupt!(
                "probe at offset {} found hash {stored}, key expects {}",
                span.offset,
                key.hash()
            ));
        }
        Ok(true)
    }

    /// The span the index registered for `hash`, if the indexing strategy
    /// elected to.
    pub fn index_direct(&self, hash: &Hash) -> Option<Span> {
        self.fm.index().find(hash).map(|(span, _)| span)
    }

    /// Verify the entry at `(offset, length)` stores a value hashing to
    /// `expected`.
    pub fn integrity_check(&self, offset: u64, length: u32, expected: &Hash) -> Result<()> {
        let object = self.read_entry(Span::new(offset, length), expected)?;
        if object.hash() != *expected {
            return Err(Error::CorruptedStore(format!(
                "value at offset {offset} re-hashes to {}, expected {expected}",
                object.hash()
            )));
        }
        Ok(())
    }

    // Writes.

    /// Content-addressed insert with deduplication.
    pub fn add(&mut self, object: &Object) -> Result<PackKey> {
        self.unsafe_append(object, true, false)
    }

    /// The raw append. `ensure_unique` dedups through staging and the
    /// index; `overcommit` is forwarded to the index.
    pub fn unsafe_append(
        &mut self,
        object: &Object,
        ensure_unique: bool,
        overcommit: bool,
    ) -> Result<PackKey> {
        if self.fm.readonly() {
            return Err(Error::RoNotAllowed);
        }
        let object = self.prepared(object)?;
        let kind = object.kind();
        let hash = object.hash();

        let strategy = self.fm.config().indexing_strategy;
        let use_index = strategy.applies(0, kind);
        if ensure_unique && use_index && self.mem(&PackKey::indexed(hash))? {
            return Ok(PackKey::indexed(hash));
        }

        let start = self.fm.suffix().end_offset();
        let payload = {
            let (dict, index) = self.fm.dict_and_index_mut();
            let mut offset_of_key = |key: &PackKey| -> Result<u64> {
                if let Some(span) = key.span() {
                    return Ok(span.offset);
                }
                match index.find(&key.hash()) {
                    Some((span, _)) => {
                        key.promote(span);
                        Ok(span.offset)
                    }
                    None => Err(Error::DanglingKey(format!(
                        "no offset for referenced hash {}",
                        key.hash()
                    ))),
                }
            };
            object.encode_payload(dict, &mut offset_of_key)?
        };
        let bytes = entry::encode_entry(&hash, kind, &payload, self.contents_policy());
        let flushed = self.fm.append_entry(&bytes)?;
        if flushed {
            // The flush covered everything staged, this entry included.
            self.staging.clear();
        }

        let length = (self.fm.suffix().end_offset() - start) as u32;
        let span = Span::new(start, length);
        let key = PackKey::direct(hash, span);

        if strategy.applies(u64::from(length), kind) {
            self.fm
                .index_mut()
                .add(&hash, span, kind, overcommit)?;
        }
        if !flushed {
            self.staging.insert(hash, (object.clone(), span));
        }
        self.lru.set(start, object.clone(), object.weight());

        self.stats.appended_entries += 1;
        self.stats.appended_bytes += u64::from(length);
        Ok(key)
    }

    /// Apply the configured child order and persistence rules before an
    /// object is hashed and encoded.
    fn prepared(&self, object: &Object) -> Result<Object> {
        match object {
            Object::Inode { root, children } => {
                if children.is_empty() && self.fm.config().forbid_empty_dir_persistence {
                    return Err(Error::InconsistentStore(
                        "refusing to persist an empty inode".to_string(),
                    ));
                }
                let mut children = children.clone();
                match self.fm.config().inode_child_order {
                    InodeChildOrder::HashBits => {
                        children.sort_by(|(_, a), (_, b)| a.hash().cmp(&b.hash()));
                    }
                    InodeChildOrder::SeededHash => {
                        children.sort_by_key(|(_, key)| splitmix64(key.hash().short()));
                    }
                    InodeChildOrder::Custom => {}
                }
                Ok(Object::Inode {
                    root: *root,
                    children,
                })
            }
            other => Ok(other.clone()),
        }
    }

    /// Run `f` against the store, flushing once at the end. A failing batch
    /// still attempts the flush so staged entries are not stranded.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.in_batch = true;
        let result = f(self);
        self.in_batch = false;
        match result {
            Ok(value) => {
                self.flush()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(flush_err) = self.flush() {
                    warn!(error = %flush_err, "flush after failed batch also failed");
                }
                Err(e)
            }
        }
    }

    /// Seal the appendable chunk (the next GC's split point).
    pub fn split(&mut self) -> Result<()> {
        if self.in_batch {
            return Err(Error::SplitForbiddenDuringBatch);
        }
        self.fm.split()?;
        // The split flushed every stage, so nothing staged is unpersisted.
        self.staging.clear();
        Ok(())
    }

    /// Stage-ordered flush of dict, suffix, control and index.
    pub fn flush(&mut self) -> Result<()> {
        self.fm.flush()?;
        self.staging.clear();
        Ok(())
    }

    /// Drop every cached decoded value.
    pub fn purge_lru(&mut self) {
        self.lru.clear();
    }

    /// RO side: re-derive state from the control file.
    pub fn reload(&mut self) -> Result<()> {
        let generation = self.fm.generation();
        self.fm.reload()?;
        if self.fm.generation() != generation {
            // Offsets below the new suffix start now resolve through a new
            // prefix; drop everything rather than chase stale entries.
            self.lru.clear();
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.fm.close()
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl std::fmt::Debug for PackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackStore")
            .field("fm", &self.fm)
            .field("staged", &self.staging.len())
            .field("cached", &self.lru.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexingStrategy;
    use crate::tmpfs::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config::new(dir.path())
            .dict_auto_flush_threshold(4096)
            .suffix_auto_flush_threshold(4096)
    }

    fn store(dir: &TempDir) -> PackStore {
        PackStore::open(&config(dir)).unwrap()
    }

    fn contents(byte: u8, len: usize) -> Object {
        Object::Contents(vec![byte; len])
    }

    #[test]
    fn test_add_find_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.set_check_integrity(true);

        let obj = contents(7, 100);
        let key = store.add(&obj).unwrap();
        assert!(key.is_direct());
        assert_eq!(store.find(&key).unwrap(), Some(obj));

        let missing = PackKey::indexed(Hash::digest(b"never added"));
        assert_eq!(store.find(&missing).unwrap(), None);
        store.flush().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_add_is_idempotent_for_indexed_kinds() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);

        let node = store.add(&Object::Inode { root: true, children: vec![] }).unwrap();
        let commit = Object::Commit {
            node: node.clone(),
            parents: vec![],
            message: b"first".to_vec(),
        };
        let k1 = store.add(&commit).unwrap();
        let before = store.stats().appended_entries;
        let k2 = store.add(&commit).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(store.stats().appended_entries, before);
        store.flush().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_find_through_graph() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.set_check_integrity(true);

        let file = store.add(&contents(1, 20)).unwrap();
        let node = store
            .add(&Object::Inode {
                root: true,
                children: vec![(b"file".to_vec(), file.clone())],
            })
            .unwrap();
        let commit_key = store
            .add(&Object::Commit {
                node: node.clone(),
                parents: vec![],
                message: b"c0".to_vec(),
            })
            .unwrap();
        store.flush().unwrap();

        let commit = store.find(&commit_key).unwrap().unwrap();
        let Object::Commit { node: found_node, .. } = commit else {
            panic!("expected a commit");
        };
        let inode = store.find(&found_node).unwrap().unwrap();
        let Object::Inode { children, .. } = inode else {
            panic!("expected an inode");
        };
        assert_eq!(children[0].0, b"file");
        let leaf = store.find(&children[0].1).unwrap().unwrap();
        assert_eq!(leaf, contents(1, 20));
        store.close().unwrap();
    }

    #[test]
    fn test_indexed_key_promotion() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);

        let node = store.add(&Object::Inode { root: true, children: vec![] }).unwrap();
        let commit = Object::Commit {
            node,
            parents: vec![],
            message: b"m".to_vec(),
        };
        let direct = store.add(&commit).unwrap();
        store.flush().unwrap();

        // A bare-hash key resolves through the index and is promoted in
        // place by the first find.
        let indexed = PackKey::indexed(commit.hash());
        assert!(!indexed.is_direct());
        assert!(store.find(&indexed).unwrap().is_some());
        assert!(indexed.is_direct());
        assert_eq!(indexed.span(), direct.span());
        store.close().unwrap();
    }

    #[test]
    fn test_mem_probe() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);

        let key = store.add(&contents(9, 10)).unwrap();
        store.flush().unwrap();
        store.purge_lru();

        assert!(store.mem(&key).unwrap());
        // Contents are not indexed under the minimal strategy, so a bare
        // hash cannot be resolved.
        assert!(!store.mem(&PackKey::indexed(key.hash())).unwrap());
        assert!(!store.mem(&PackKey::indexed(Hash::digest(b"other"))).unwrap());
        store.close().unwrap();
    }

    #[test]
    fn test_index_direct_respects_strategy() {
        let dir = TempDir::new().unwrap();

        let mut store = PackStore::open(&config(&dir)).unwrap();
        let leaf = store.add(&contents(3, 10)).unwrap();
        let node = store.add(&Object::Inode { root: true, children: vec![] }).unwrap();
        let commit = store
            .add(&Object::Commit {
                node: node.clone(),
                parents: vec![],
                message: vec![],
            })
            .unwrap();
        assert!(store.index_direct(&leaf.hash()).is_none());
        assert!(store.index_direct(&node.hash()).is_none());
        assert_eq!(store.index_direct(&commit.hash()), commit.span());
        store.flush().unwrap();
        store.close().unwrap();

        let dir2 = TempDir::new().unwrap();
        let cfg = config(&dir2).indexing_strategy(IndexingStrategy::Always);
        let mut store = PackStore::open(&cfg).unwrap();
        let leaf = store.add(&contents(3, 10)).unwrap();
        assert_eq!(store.index_direct(&leaf.hash()), leaf.span());
        store.flush().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_staging_serves_unflushed_entries() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);

        let key = store.add(&contents(5, 50)).unwrap();
        // Nothing flushed yet: the suffix file is empty on disk.
        assert_eq!(
            std::fs::metadata(crate::layout::suffix_path(dir.path(), 0))
                .unwrap()
                .len(),
            0
        );
        store.purge_lru();
        assert_eq!(store.find(&key).unwrap(), Some(contents(5, 50)));
        store.flush().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_auto_flush_clears_staging() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir).suffix_auto_flush_threshold(256);
        let mut store = PackStore::open(&cfg).unwrap();

        for i in 0..20 {
            store.add(&contents(i, 64)).unwrap();
        }
        // With a 256-byte threshold the suffix must have auto-flushed.
        assert!(store.file_manager().payload().suffix_end_poff > 0);
        assert!(store.staging.len() < 20);
        store.flush().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_batch_flushes_on_success() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);

        let key = store
            .batch(|s| {
                assert!(s.in_batch());
                s.add(&contents(1, 30))
            })
            .unwrap();
        // The batch flushed: control sees the bytes, staging is empty.
        assert!(store.file_manager().payload().suffix_end_poff > 0);
        assert!(store.staging.is_empty());
        assert!(store.find(&key).unwrap().is_some());

        let err = store.batch(|_| -> Result<()> { Err(Error::Closed) });
        assert_eq!(err, Err(Error::Closed));
        store.close().unwrap();
    }

    #[test]
    fn test_split_forbidden_during_batch() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let result = store.batch(|s| s.split());
        assert_eq!(result, Err(Error::SplitForbiddenDuringBatch));
        store.close().unwrap();
    }

    #[test]
    fn test_corrupted_entry_detected() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.set_check_integrity(true);

        let key = store.add(&contents(8, 40)).unwrap();
        store.flush().unwrap();
        store.purge_lru();
        store.close().unwrap();

        // Flip a payload byte on disk.
        let path = crate::layout::suffix_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let mut store = PackStore::open(&config(&dir)).unwrap();
        store.set_check_integrity(true);
        assert!(matches!(
            store.find(&key),
            Err(Error::CorruptedStore(_))
        ));
        store.close().unwrap();
    }

    #[test]
    fn test_integrity_check_entrypoint() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);

        let key = store.add(&contents(2, 25)).unwrap();
        store.flush().unwrap();
        let span = key.span().unwrap();
        store
            .integrity_check(span.offset, span.length, &key.hash())
            .unwrap();
        assert!(store
            .integrity_check(span.offset, span.length, &Hash::digest(b"wrong"))
            .is_err());
        store.close().unwrap();
    }

    #[test]
    fn test_ro_instance_reads_after_reload() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let mut writer = PackStore::open(&cfg).unwrap();
        writer.flush().unwrap();

        let mut reader = PackStore::open_ro(&cfg).unwrap();
        assert!(reader.readonly());

        let key = writer.add(&contents(4, 60)).unwrap();
        writer.flush().unwrap();

        reader.reload().unwrap();
        assert_eq!(reader.find(&key).unwrap(), Some(contents(4, 60)));
        assert_eq!(
            reader.add(&contents(0, 1)),
            Err(Error::RoNotAllowed)
        );

        writer.close().unwrap();
        reader.close().unwrap();
    }

    #[test]
    fn test_forbid_empty_inode() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir).forbid_empty_dir_persistence(true);
        let mut store = PackStore::open(&cfg).unwrap();
        assert!(matches!(
            store.add(&Object::Inode { root: true, children: vec![] }),
            Err(Error::InconsistentStore(_))
        ));
        store.close().unwrap();
    }

    #[test]
    fn test_find_on_pre_migration_key() {
        let dir = TempDir::new().unwrap();

        // A legacy monolithic pack: 16-byte header, then ordinary entries.
        // Keys minted before the migration carry offsets into this file.
        // A contents payload is its raw bytes, so the entry can be built
        // without a store.
        let payload = vec![0x5a; 40];
        let hash = Object::Contents(payload.clone()).hash();
        let entry_bytes =
            crate::entry::encode_entry(&hash, Kind::Contents, &payload, ContentsLengthHeader::Varint);
        let mut pack = vec![0u8; 16];
        pack.extend_from_slice(&entry_bytes);
        std::fs::write(crate::layout::legacy_pack_path(dir.path()), &pack).unwrap();

        let mut store = PackStore::open(&config(&dir)).unwrap();
        store.set_check_integrity(true);
        let key = PackKey::direct(hash, Span::new(16, entry_bytes.len() as u32));
        assert_eq!(store.find(&key).unwrap(), Some(Object::Contents(payload)));
        store.flush().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_inode_children_sorted_by_hash() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);

        let a = store.add(&contents(1, 5)).unwrap();
        let b = store.add(&contents(2, 5)).unwrap();
        let key = store
            .add(&Object::Inode {
                root: true,
                children: vec![(b"b".to_vec(), b.clone()), (b"a".to_vec(), a.clone())],
            })
            .unwrap();
        store.flush().unwrap();
        store.purge_lru();

        let Some(Object::Inode { children, .. }) = store.find(&key).unwrap() else {
            panic!("expected inode");
        };
        let decoded_order: Vec<Hash> = children.iter().map(|(_, k)| k.hash()).collect();
        let mut expected = vec![a.hash(), b.hash()];
        expected.sort();
        assert_eq!(decoded_order, expected);
        store.close().unwrap();
    }
}
