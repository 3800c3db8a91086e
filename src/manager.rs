//! The file manager: the single authority over every file of a store.
//!
//! It owns the control file, dict, chunked suffix, post-GC prefix and
//! mapping, and the index, and it is the only component allowed to
//! sequence operations across them. The contracts it enforces:
//!
//! * **Flush ordering.** Stage 1 persists the dict and records its end
//!   offset in the control; stage 2 persists the suffix on top of stage 1;
//!   stage 3 flushes the index on top of stage 2. A persisted suffix offset
//!   is therefore always backed by on-disk bytes, and an index record always
//!   points at a persisted suffix offset. Each stage is a no-op when its
//!   buffer is empty.
//! * **Swap ordering.** After a GC, the new prefix is opened before the
//!   mapping, both before the suffix window moves, and the control payload
//!   is rewritten last. A reader's reload mirrors this, so no reader ever
//!   observes a generation it cannot serve.
//! * **Single writer.** Read-write opens take an exclusive flock on
//!   `store.lock`; read-only instances never mutate anything.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control::{ControlFile, Payload, Status};
use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::flock::WriterLock;
use crate::index::Index;
use crate::io::{self, classify_path, PathKind};
use crate::layout::{self, FileKind};
use crate::mapping::Mapping;
use crate::prefix::Prefix;
use crate::suffix::{Suffix, SuffixParams};

/// Physical bytes occupied by the legacy monolithic pack header; entries
/// migrated from such a store keep their original offsets, so the first 16
/// bytes of `store.0.suffix` are never addressed by any key.
const LEGACY_HEADER_SIZE: u64 = 16;

/// Steps of the reload protocol, surfaced to the test hook so reload
/// stability is observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadEvent {
    IndexReloaded,
    ControlUnchanged,
    SuffixReopened,
    PrefixMappingReopened,
    OffsetsRefreshed,
}

type ReloadHook = Box<dyn FnMut(ReloadEvent) + Send>;
type DictConsumer = Box<dyn FnMut() + Send>;

pub struct FileManager {
    config: Config,
    control: ControlFile,
    dict: Dict,
    suffix: Suffix,
    prefix: Option<Prefix>,
    mapping: Option<Mapping>,
    index: Index,
    _lock: Option<WriterLock>,
    readonly: bool,
    dead_header_size: u64,
    dict_consumers: Vec<DictConsumer>,
    reload_hook: Option<ReloadHook>,
}

impl FileManager {
    /// Create a fresh store under `config.root`.
    pub fn create_rw(config: &Config, overwrite: bool) -> Result<Self> {
        let root = &config.root;
        match classify_path(root) {
            PathKind::NoEnt => io::mkdir(root)?,
            PathKind::Directory => {
                if !overwrite && classify_path(&layout::control_path(root)) != PathKind::NoEnt {
                    return Err(Error::FileExists);
                }
            }
            PathKind::File | PathKind::Other => return Err(Error::NotADirectory),
        }
        let lock = WriterLock::acquire(root)?;

        let control = ControlFile::create_rw(
            &layout::control_path(root),
            overwrite,
            Payload::initial(),
            config.use_fsync,
        )?;
        let dict = Dict::create_rw(
            &layout::dict_path(root),
            overwrite,
            config.dict_auto_flush_threshold,
        )?;
        let suffix = Suffix::create_rw(root, overwrite, config.suffix_auto_flush_threshold)?;
        let index = Index::create_rw(&layout::index_path(root), overwrite, config.index_log_size)?;

        info!(root = %root.display(), "created fresh store");
        let mut fm = Self {
            config: config.clone(),
            control,
            dict,
            suffix,
            prefix: None,
            mapping: None,
            index,
            _lock: Some(lock),
            readonly: false,
            dead_header_size: 0,
            dict_consumers: Vec::new(),
            reload_hook: None,
        };
        // Overwriting an older store may leave files from its wider chunk
        // window or a past generation behind.
        if overwrite {
            fm.cleanup()?;
        }
        Ok(fm)
    }

    /// Open an existing store read-write, migrating a legacy layout if one
    /// is found and migration is allowed.
    pub fn open_rw(config: &Config) -> Result<Self> {
        let root = &config.root;
        match classify_path(root) {
            PathKind::Directory => {}
            PathKind::NoEnt => return Err(Error::NoSuchFileOrDirectory),
            _ => return Err(Error::NotADirectory),
        }
        let lock = WriterLock::acquire(root)?;

        match classify_path(&layout::control_path(root)) {
            PathKind::File => {}
            PathKind::NoEnt => {
                if classify_path(&layout::legacy_pack_path(root)) == PathKind::NoEnt {
                    return Err(Error::InvalidLayout(
                        "no control file and no legacy pack".to_string(),
                    ));
                }
                if config.no_migrate {
                    return Err(Error::MigrationNeeded);
                }
                Self::migrate_legacy(config)?;
            }
            _ => return Err(Error::NotAFile),
        }

        let control = ControlFile::open_rw(&layout::control_path(root), config.use_fsync)?;
        let payload = *control.payload();
        Self::check_status_for_rw(config, &payload)?;

        let dead_header_size = match payload.status {
            Status::FromV1V2PostUpgrade { .. } => LEGACY_HEADER_SIZE,
            _ => 0,
        };

        let dict = Dict::open_rw(
            &layout::dict_path(root),
            payload.dict_end_poff,
            config.dict_auto_flush_threshold,
        )?;
        let suffix = Suffix::open_rw(
            root,
            suffix_params(&payload),
            config.suffix_auto_flush_threshold,
        )?;
        let (prefix, mapping) = Self::open_generation(root, &payload)?;
        let index = Index::open_rw(&layout::index_path(root), config.index_log_size)?;

        debug!(
            root = %root.display(),
            generation = payload.status.generation(),
            chunks = payload.chunk_num,
            "opened store read-write"
        );
        Ok(Self {
            config: config.clone(),
            control,
            dict,
            suffix,
            prefix,
            mapping,
            index,
            _lock: Some(lock),
            readonly: false,
            dead_header_size,
            dict_consumers: Vec::new(),
            reload_hook: None,
        })
    }

    /// Open an existing store read-only.
    pub fn open_ro(config: &Config) -> Result<Self> {
        let root = &config.root;
        match classify_path(root) {
            PathKind::Directory => {}
            PathKind::NoEnt => return Err(Error::NoSuchFileOrDirectory),
            _ => return Err(Error::NotADirectory),
        }
        match classify_path(&layout::control_path(root)) {
            PathKind::File => {}
            PathKind::NoEnt => {
                // A legacy layout needs the writer to migrate it first.
                if classify_path(&layout::legacy_pack_path(root)) != PathKind::NoEnt {
                    return Err(Error::MigrationNeeded);
                }
                return Err(Error::InvalidLayout(
                    "no control file and no legacy pack".to_string(),
                ));
            }
            _ => return Err(Error::NotAFile),
        }

        let control = ControlFile::open_ro(&layout::control_path(root))?;
        let payload = *control.payload();
        let dead_header_size = match payload.status {
            Status::FromV1V2PostUpgrade { .. } => LEGACY_HEADER_SIZE,
            _ => 0,
        };

        let dict = Dict::open_ro(&layout::dict_path(root), payload.dict_end_poff)?;
        let suffix = Suffix::open_ro(root, suffix_params(&payload))?;
        let (prefix, mapping) = Self::open_generation(root, &payload)?;
        let index = Index::open_ro(&layout::index_path(root))?;

        Ok(Self {
            config: config.clone(),
            control,
            dict,
            suffix,
            prefix,
            mapping,
            index,
            _lock: None,
            readonly: true,
            dead_header_size,
            dict_consumers: Vec::new(),
            reload_hook: None,
        })
    }

    fn check_status_for_rw(config: &Config, payload: &Payload) -> Result<()> {
        match payload.status {
            Status::Gced { .. } if !config.indexing_strategy.is_minimal() => {
                Err(Error::OnlyMinimalIndexingStrategyAllowed)
            }
            Status::Reserved(tag) => Err(Error::InvalidLayout(format!(
                "reserved control status tag {tag}"
            ))),
            _ => Ok(()),
        }
    }

    fn open_generation(
        root: &Path,
        payload: &Payload,
    ) -> Result<(Option<Prefix>, Option<Mapping>)> {
        match payload.status {
            Status::Gced { generation, .. } => {
                // Prefix strictly before mapping: a mapping must never
                // exist without the file it redirects into.
                let prefix = Prefix::open(&layout::prefix_path(root, generation))?;
                let mapping = Mapping::open(&layout::mapping_path(root, generation))?;
                Ok((Some(prefix), Some(mapping)))
            }
            _ => Ok((None, None)),
        }
    }

    /// Turn a legacy monolithic `store.pack` into a single-chunk suffix
    /// plus control file.
    fn migrate_legacy(config: &Config) -> Result<()> {
        let root = &config.root;
        let pack = layout::legacy_pack_path(root);
        let size = std::fs::metadata(&pack)?.len();

        info!(root = %root.display(), size, "migrating legacy pack layout");
        io::rename(&pack, &layout::suffix_path(root, 0))?;

        let dict_path = layout::dict_path(root);
        let dict_end = match classify_path(&dict_path) {
            PathKind::File => std::fs::metadata(&dict_path)?.len(),
            _ => {
                Dict::create_rw(&dict_path, false, config.dict_auto_flush_threshold)?;
                0
            }
        };
        if classify_path(&layout::index_path(root)) == PathKind::NoEnt {
            Index::create_rw(&layout::index_path(root), false, config.index_log_size)?;
        }

        let payload = Payload {
            dict_end_poff: dict_end,
            suffix_end_poff: size,
            status: Status::FromV1V2PostUpgrade {
                entry_offset_at_upgrade: size,
            },
            upgraded_from_v3_to_v4: true,
            chunk_start_idx: 0,
            chunk_num: 1,
            checksum: 0,
        };
        let mut control = ControlFile::create_rw(
            &layout::control_path(root),
            false,
            payload,
            config.use_fsync,
        )?;
        control.close()?;
        Ok(())
    }

    // Accessors.

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn payload(&self) -> &Payload {
        self.control.payload()
    }

    pub fn generation(&self) -> u64 {
        self.control.payload().status.generation()
    }

    /// Absolute offset where the suffix begins; everything below is served
    /// by prefix + mapping (or is gone).
    pub fn suffix_start_offset(&self) -> u64 {
        self.control.payload().status.suffix_start_offset()
    }

    pub fn dead_header_size(&self) -> u64 {
        self.dead_header_size
    }

    pub fn dict(&self) -> &Dict {
        &self.dict
    }

    pub fn suffix(&self) -> &Suffix {
        &self.suffix
    }

    pub fn prefix(&self) -> Option<&Prefix> {
        self.prefix.as_ref()
    }

    pub fn mapping(&self) -> Option<&Mapping> {
        self.mapping.as_ref()
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut Index {
        &mut self.index
    }

    /// Split borrow for encoders: the dict mutates (interning) while the
    /// index is only consulted.
    pub fn dict_and_index_mut(&mut self) -> (&mut Dict, &Index) {
        (&mut self.dict, &self.index)
    }

    /// Register a callback run after each reload that changed the dict.
    pub fn register_dict_consumer(&mut self, consumer: DictConsumer) {
        self.dict_consumers.push(consumer);
    }

    /// Test hook observing the reload protocol.
    pub fn set_reload_hook(&mut self, hook: ReloadHook) {
        self.reload_hook = Some(hook);
    }

    fn emit(&mut self, event: ReloadEvent) {
        if let Some(hook) = &mut self.reload_hook {
            hook(event);
        }
    }

    // Appends.

    /// Append one encoded entry to the suffix. Returns `true` when the
    /// append tripped the auto-flush threshold and the dependency-ordered
    /// flush ran (callers drop their staging for the flushed range).
    pub fn append_entry(&mut self, bytes: &[u8]) -> Result<bool> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        let suffix_due = self.suffix.append_exn(bytes)?;
        // The dict may have crossed its own threshold while the entry was
        // being encoded.
        if self.dict.needs_external_flush() {
            self.flush_dict()?;
        }
        if suffix_due {
            self.flush_suffix_and_its_deps()?;
            return Ok(true);
        }
        Ok(false)
    }

    // The three flush stages.

    /// Stage 1: persist the dict and record its end offset.
    pub fn flush_dict(&mut self) -> Result<()> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        if self.dict.buffer_is_empty() {
            return Ok(());
        }
        self.dict.flush()?;
        if self.config.use_fsync {
            self.dict.fsync()?;
        }
        let mut payload = *self.control.payload();
        payload.dict_end_poff = self.dict.end_poff();
        self.control.set_payload(payload)?;
        Ok(())
    }

    /// Stage 2: stage 1, then persist the suffix and record its end offset.
    /// Returns `true` if suffix bytes actually moved to disk.
    pub fn flush_suffix_and_its_deps(&mut self) -> Result<bool> {
        self.flush_dict()?;
        if self.suffix.buffer_is_empty() {
            return Ok(false);
        }
        self.suffix.flush()?;
        if self.config.use_fsync {
            self.suffix.fsync()?;
        }
        let mut payload = *self.control.payload();
        payload.suffix_end_poff = self.suffix.end_poff();
        if payload.status == Status::NoGcYet && !self.config.indexing_strategy.is_minimal() {
            // Once a non-minimal index record refers to this store, a GC
            // could no longer prove the index consistent; record that.
            payload.status = Status::UsedNonMinimalIndexingStrategy;
        }
        self.control.set_payload(payload)?;
        Ok(true)
    }

    /// Stage 3: the full flush.
    pub fn flush(&mut self) -> Result<bool> {
        let suffix_flushed = self.flush_suffix_and_its_deps()?;
        self.index.flush(self.config.use_fsync)?;
        Ok(suffix_flushed)
    }

    // Reload (read-only instances).

    /// Re-derive state from the control file. Only read-only instances
    /// have anything to pick up; the writer is the source of every change.
    pub fn reload(&mut self) -> Result<()> {
        if !self.readonly {
            return Ok(());
        }
        self.index.reload()?;
        self.emit(ReloadEvent::IndexReloaded);

        let previous = *self.control.payload();
        self.control.reload()?;
        let payload = *self.control.payload();
        if payload == previous {
            self.emit(ReloadEvent::ControlUnchanged);
            return Ok(());
        }

        let window_changed = payload.chunk_start_idx != previous.chunk_start_idx
            || payload.chunk_num != previous.chunk_num;
        let generation_changed =
            payload.status.generation() != previous.status.generation();

        if generation_changed {
            let (prefix, mapping) = Self::open_generation(&self.config.root, &payload)?;
            if let Some(mut old) = self.prefix.take() {
                old.close()?;
            }
            self.prefix = prefix;
            self.mapping = mapping;
            self.emit(ReloadEvent::PrefixMappingReopened);
        }
        if window_changed {
            let mut suffix = Suffix::open_ro(&self.config.root, suffix_params(&payload))?;
            std::mem::swap(&mut self.suffix, &mut suffix);
            suffix.close()?;
            self.emit(ReloadEvent::SuffixReopened);
        } else {
            self.suffix.refresh_end_poff(payload.suffix_end_poff)?;
        }
        self.dict.refresh_end_poff(payload.dict_end_poff)?;
        self.emit(ReloadEvent::OffsetsRefreshed);

        let mut consumers = std::mem::take(&mut self.dict_consumers);
        for consumer in &mut consumers {
            consumer();
        }
        self.dict_consumers = consumers;
        Ok(())
    }

    // GC support.

    /// Publish generation `generation`: adopt its prefix and mapping, move
    /// the suffix window, rewrite the control.
    #[allow(clippy::too_many_arguments)]
    pub fn swap(
        &mut self,
        generation: u64,
        suffix_start_offset: u64,
        chunk_start_idx: u32,
        chunk_num: u32,
        suffix_dead_bytes: u64,
        latest_gc_target_offset: u64,
    ) -> Result<()> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        // Nothing may sit half-written while files are being swapped out
        // under the store.
        self.flush()?;

        info!(
            generation,
            suffix_start_offset,
            chunk_start_idx,
            chunk_num,
            "swapping in gc generation"
        );

        // Prefix, then mapping, then the suffix window; control last.
        let prefix = Prefix::open(&layout::prefix_path(&self.config.root, generation))?;
        let mapping = Mapping::open(&layout::mapping_path(&self.config.root, generation))?;

        let mut payload = *self.control.payload();
        payload.status = Status::Gced {
            suffix_start_offset,
            generation,
            latest_gc_target_offset,
            suffix_dead_bytes,
        };
        payload.chunk_start_idx = chunk_start_idx;
        payload.chunk_num = chunk_num;

        let mut suffix = Suffix::open_rw(
            &self.config.root,
            suffix_params(&payload),
            self.config.suffix_auto_flush_threshold,
        )?;

        if let Some(mut old) = self.prefix.take() {
            old.close()?;
        }
        self.prefix = Some(prefix);
        self.mapping = Some(mapping);
        std::mem::swap(&mut self.suffix, &mut suffix);
        suffix.close()?;

        self.control.set_payload(payload)?;
        Ok(())
    }

    /// Seal the appendable chunk and open a fresh one; the next GC uses
    /// this boundary to partition live from newly appended bytes.
    pub fn split(&mut self) -> Result<()> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        // The sealed chunk's physical length becomes authoritative, so it
        // must be complete on disk first.
        self.flush()?;
        self.suffix.add_chunk()?;

        let mut payload = *self.control.payload();
        payload.chunk_num += 1;
        payload.suffix_end_poff = 0;
        self.control.set_payload(payload)?;

        debug!(
            chunk_num = payload.chunk_num,
            start_idx = payload.chunk_start_idx,
            "split suffix"
        );
        Ok(())
    }

    /// Remove residual files: retired generations, out-of-window chunks,
    /// worker scratch. Unknown files are preserved.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.readonly {
            return Err(Error::RoNotAllowed);
        }
        let payload = *self.control.payload();
        let generation = payload.status.generation();
        let window = payload.chunk_start_idx..payload.chunk_start_idx + payload.chunk_num;

        for entry in std::fs::read_dir(&self.config.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let stale = match layout::classify(name) {
                FileKind::Prefix { generation: g } | FileKind::Mapping { generation: g } => {
                    g != generation
                }
                FileKind::Suffix { idx } => !window.contains(&idx),
                FileKind::GcResult { .. } | FileKind::GcScratch { .. } => true,
                _ => false,
            };
            if stale {
                debug!(file = name, "cleanup: removing residual file");
                if let Err(e) = io::unlink(&entry.path()) {
                    warn!(file = name, error = %e, "cleanup: failed to remove residual file");
                }
            }
        }
        Ok(())
    }

    /// Close everything. Fails with [`Error::PendingFlush`] while any
    /// append buffer still holds bytes.
    pub fn close(&mut self) -> Result<()> {
        if !self.dict.buffer_is_empty() || !self.suffix.buffer_is_empty() {
            return Err(Error::PendingFlush);
        }
        self.dict.close()?;
        self.control.close()?;
        self.suffix.close()?;
        if let Some(mut prefix) = self.prefix.take() {
            prefix.close()?;
        }
        self.index.close()?;
        self._lock = None;
        Ok(())
    }
}

fn suffix_params(payload: &Payload) -> SuffixParams {
    SuffixParams {
        chunk_start_idx: payload.chunk_start_idx,
        chunk_num: payload.chunk_num,
        end_poff: payload.suffix_end_poff,
        start_offset: payload.status.suffix_start_offset(),
        dead_bytes: payload.status.suffix_dead_bytes(),
    }
}

impl std::fmt::Debug for FileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileManager")
            .field("root", &self.config.root)
            .field("readonly", &self.readonly)
            .field("payload", self.control.payload())
            .finish()
    }
}
