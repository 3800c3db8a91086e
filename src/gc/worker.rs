//! The GC worker: mark-and-copy over a frozen read-only view.
//!
//! The worker never touches a file the live store serves from; everything
//! it produces is suffixed with the generation it is building
//! (`store.prefix.<g>`, `store.mapping.<g>`, scratch, result). Crashing at
//! any point therefore leaves the store untouched, and the orchestrator
//! classifies the absent result file.
//!
//! Phases:
//! 1. **Mark** - walk the object graph from the target commit by reading
//!    entry prefixes, collecting `(offset, length)` ranges. The graph is a
//!    finite DAG; a visited-offset set breaks sharing.
//! 2. **Sort & coalesce** - order ranges by offset and merge the adjacent
//!    ones.
//! 3. **Copy** - stream the live ranges into the new prefix, emitting one
//!    mapping row per range. Parent commits of the target are not copied;
//!    each gets a dangling placeholder so a surviving commit still decodes.
//! 4. **Report** - write the result record; its presence is the commit
//!    point.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use byteorder::{BigEndian, WriteBytesExt};
use tracing::{debug, info};

use crate::append::{AppendOnlyFile, AutoFlushProcedure};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::entry::{self, EntryPrefix, Kind, PREFIX_MAX, PREFIX_MIN};
use crate::error::{Error, Result};
use crate::key::Span;
use crate::layout;
use crate::manager::FileManager;
use crate::mapping::{MappingWriter, Row};
use crate::object;

use super::result::{GcResult, GcStats, SuffixParamsRecord};

const COPY_CHUNK: u64 = 64 * 1024;

/// Live counters shared with the orchestrator while the worker runs.
#[derive(Debug, Default)]
pub struct PartialStats {
    pub objects: AtomicU64,
    pub copied_bytes: AtomicU64,
}

impl PartialStats {
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.objects.load(Ordering::Relaxed),
            self.copied_bytes.load(Ordering::Relaxed),
        )
    }
}

pub struct WorkerArgs {
    pub config: Config,
    pub generation: u64,
    pub commit_span: Span,
}

/// What the copy phase has to produce for one src range.
enum CopyItem {
    /// Verbatim bytes from the store.
    Live { src_off: u64, len: u32 },
    /// A synthesized dangling-parent placeholder.
    Placeholder { src_off: u64, bytes: Vec<u8> },
}

impl CopyItem {
    fn src_off(&self) -> u64 {
        match self {
            CopyItem::Live { src_off, .. } | CopyItem::Placeholder { src_off, .. } => *src_off,
        }
    }

    fn len(&self) -> u64 {
        match self {
            CopyItem::Live { len, .. } => u64::from(*len),
            CopyItem::Placeholder { bytes, .. } => bytes.len() as u64,
        }
    }
}

/// Run the whole worker. On success the result record is on disk.
pub fn run(args: &WorkerArgs, cancel: &AtomicBool, progress: &PartialStats) -> Result<()> {
    let started = Instant::now();
    let root = &args.config.root;
    let fm = FileManager::open_ro(&args.config)?;
    let policy = args.config.contents_length_header;
    let new_suffix_start = args.commit_span.end();

    info!(
        generation = args.generation,
        commit_offset = args.commit_span.offset,
        new_suffix_start,
        "gc worker started"
    );

    // Phase 1: mark.
    let dispatcher = Dispatcher::new(&fm);
    let read_prefix_at = |off: u64| -> Result<(EntryPrefix, u64)> {
        let accessor =
            dispatcher.create_accessor_from_range_exn(off, PREFIX_MIN as u64, PREFIX_MAX as u64)?;
        let mut buf = vec![0u8; accessor.len() as usize];
        dispatcher.read_exn(&accessor, &mut buf)?;
        let prefix = EntryPrefix::decode(&buf, policy)?;
        let total = match prefix.total_length {
            Some(total) => total,
            None => match fm.index().find(&prefix.hash) {
                Some((span, _)) => u64::from(span.length),
                None => {
                    return Err(Error::GcDisallowed(format!(
                        "entry at offset {off} has no length header and is not indexed"
                    )))
                }
            },
        };
        Ok((prefix, total))
    };
    let read_payload = |off: u64, total: u64, kind: Kind| -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; total as usize];
        dispatcher.read_exact_at(off, &mut bytes)?;
        let header = entry::header_len(&bytes, kind, policy)?;
        Ok(bytes[header..].to_vec())
    };

    let mut ranges: Vec<(u64, u32)> = Vec::new();
    let mut objects = 0u64;

    // The target commit itself.
    let (commit_prefix, commit_total) = read_prefix_at(args.commit_span.offset)?;
    if !commit_prefix.kind.is_commit() {
        return Err(Error::GcProcessError(format!(
            "target entry at offset {} is a {:?}, not a commit",
            args.commit_span.offset, commit_prefix.kind
        )));
    }
    ranges.push((args.commit_span.offset, commit_total as u32));
    objects += 1;
    let commit_payload = read_payload(args.commit_span.offset, commit_total, commit_prefix.kind)?;
    let commit_refs = object::child_offsets(commit_prefix.kind, &commit_payload)?;

    let mut visited: HashSet<u64> = HashSet::new();
    visited.insert(args.commit_span.offset);
    let mut stack: Vec<u64> = commit_refs.children.clone();

    while let Some(off) = stack.pop() {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::GcProcessError("cancelled during mark".to_string()));
        }
        if !visited.insert(off) {
            continue;
        }
        let (prefix, total) = read_prefix_at(off)?;
        ranges.push((off, total as u32));
        objects += 1;
        progress.objects.store(objects, Ordering::Relaxed);

        match prefix.kind {
            Kind::Contents => {}
            kind if kind.is_inode() => {
                let payload = read_payload(off, total, kind)?;
                let refs = object::child_offsets(kind, &payload)?;
                stack.extend(refs.children);
            }
            kind => {
                return Err(Error::CorruptedStore(format!(
                    "tree traversal reached a {kind:?} entry at offset {off}"
                )))
            }
        }
    }

    // Placeholders for the target's parents: their history is garbage but
    // the surviving commit must keep decoding.
    let mut parent_offs: Vec<u64> = commit_refs
        .parents
        .iter()
        .copied()
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    parent_offs.sort_unstable();
    let mut items: Vec<CopyItem> = ranges
        .iter()
        .map(|&(src_off, len)| CopyItem::Live { src_off, len })
        .collect();
    for &off in &parent_offs {
        let (prefix, _) = read_prefix_at(off)?;
        let bytes = entry::encode_entry(&prefix.hash, Kind::DanglingParentCommit, &[], policy);
        items.push(CopyItem::Placeholder {
            src_off: off,
            bytes,
        });
    }

    // Phase 2: sort and coalesce. Placeholders stay separate: their bytes
    // differ from what sits at the src offset.
    items.sort_by_key(CopyItem::src_off);
    let mut coalesced: Vec<CopyItem> = Vec::with_capacity(items.len());
    for item in items {
        let merged = match (coalesced.last_mut(), &item) {
            (
                Some(CopyItem::Live { src_off, len }),
                CopyItem::Live {
                    src_off: next_off,
                    len: next_len,
                },
            ) if *src_off + u64::from(*len) == *next_off => {
                *len += *next_len;
                true
            }
            _ => false,
        };
        if !merged {
            coalesced.push(item);
        }
    }
    write_reachable_scratch(root, args.generation, &coalesced)?;

    debug!(
        objects,
        ranges = coalesced.len(),
        parents = parent_offs.len(),
        "mark phase complete"
    );

    // Phase 3: copy.
    let mut prefix_file = AppendOnlyFile::create_rw(
        &layout::prefix_path(root, args.generation),
        true,
        COPY_CHUNK as usize,
        AutoFlushProcedure::Internal,
    )?;
    let mut mapping = MappingWriter::create(&layout::mapping_path(root, args.generation))?;
    let mut dst_off = 0u64;
    let mut copied_bytes = 0u64;
    let mut buf = vec![0u8; COPY_CHUNK as usize];

    for item in &coalesced {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::GcProcessError("cancelled during copy".to_string()));
        }
        let len = item.len();
        mapping.push(Row {
            src_off: item.src_off(),
            len: len as u32,
            dst_off,
        })?;
        match item {
            CopyItem::Live { src_off, .. } => {
                // Stream through the dispatcher: a range may straddle the
                // previous generation's prefix boundary.
                let mut cur = *src_off;
                let mut remaining = len;
                while remaining > 0 {
                    let accessor = dispatcher.create_accessor_from_range_exn(
                        cur,
                        1,
                        remaining.min(COPY_CHUNK),
                    )?;
                    let take = accessor.len() as usize;
                    dispatcher.read_exn(&accessor, &mut buf[..take])?;
                    prefix_file.append_exn(&buf[..take])?;
                    cur += take as u64;
                    remaining -= take as u64;
                }
            }
            CopyItem::Placeholder { bytes, .. } => {
                prefix_file.append_exn(bytes)?;
            }
        }
        dst_off += len;
        copied_bytes += len;
        progress.copied_bytes.store(copied_bytes, Ordering::Relaxed);
    }
    prefix_file.flush()?;
    prefix_file.fsync()?;
    prefix_file.close()?;
    mapping.finish(true)?;

    // Phase 4: report.
    let table = fm.suffix().chunk_table();
    let (appendable_idx, ..) = *table.last().expect("window is never empty");
    let removable_chunk_idxs: Vec<u32> = table
        .iter()
        .filter(|&&(idx, _, end)| idx != appendable_idx && end <= new_suffix_start)
        .map(|&(idx, ..)| idx)
        .collect();
    let &(first_kept_idx, first_kept_start, _) = table
        .iter()
        .find(|&&(idx, ..)| !removable_chunk_idxs.contains(&idx))
        .expect("the appendable chunk is never removable");

    let result = GcResult {
        generation: args.generation,
        suffix_params: SuffixParamsRecord {
            start_offset: new_suffix_start,
            chunk_start_idx: first_kept_idx,
            dead_bytes: new_suffix_start - first_kept_start,
        },
        stats: GcStats {
            objects_traversed: objects,
            live_ranges: coalesced.len() as u64,
            copied_bytes,
            dangling_parents: parent_offs.len() as u64,
            removable_chunks: removable_chunk_idxs.len() as u32,
            elapsed_ms: started.elapsed().as_millis() as u64,
        },
        removable_chunk_idxs,
    };
    result.write(&layout::gc_result_path(root, args.generation))?;

    info!(
        generation = args.generation,
        objects,
        copied_bytes,
        elapsed_ms = result.stats.elapsed_ms,
        "gc worker finished"
    );
    Ok(())
}

/// The mark phase's merged ranges, persisted for post-mortem inspection.
/// Removed by `cleanup` along with the other per-generation scratch.
fn write_reachable_scratch(
    root: &std::path::Path,
    generation: u64,
    items: &[CopyItem],
) -> Result<()> {
    let mut ao = AppendOnlyFile::create_rw(
        &layout::reachable_path(root, generation),
        true,
        64 * 1024,
        AutoFlushProcedure::Internal,
    )?;
    let mut row = Vec::with_capacity(12);
    for item in items {
        row.clear();
        row.write_u64::<BigEndian>(item.src_off()).unwrap();
        row.write_u32::<BigEndian>(item.len() as u32).unwrap();
        ao.append_exn(&row)?;
    }
    ao.flush()?;
    ao.close()
}

