//! Garbage collection: reclaim everything unreachable from a chosen commit.
//!
//! The orchestrator runs in the writer. `start` seals history behind a
//! fresh suffix chunk and spawns the worker; the worker copies the live
//! set into `store.prefix.<g>` + `store.mapping.<g>` and reports through a
//! result file; `finalise` swaps the new generation in, purges caches and
//! removes the retired files. Failures and cancellations funnel through
//! `cleanup` so a half-built generation never survives.

pub mod result;
pub mod task;
pub(crate) mod worker;

use std::path::PathBuf;

use tracing::{info, warn};

use crate::control::Status;
use crate::error::{Error, Result};
use crate::io::{classify_path, PathKind};
use crate::key::PackKey;
use crate::layout;
use crate::object::Object;
use crate::pack::PackStore;

pub use result::{GcResult, GcStats, SuffixParamsRecord};
use task::GcTask;
use worker::WorkerArgs;

/// What `finalise` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStatus {
    /// The worker is still going; call again later (or with `wait`).
    Running,
    /// The generation is live; stats from the worker.
    Finalised(GcStats),
}

/// A running (or finished) GC for one target commit.
pub struct Gc {
    root: PathBuf,
    generation: u64,
    commit_offset: u64,
    task: Option<GcTask>,
    resulting_stats: Option<GcStats>,
}

impl Gc {
    /// Launch a GC keeping exactly what the commit at `commit_key` reaches.
    ///
    /// Splits the suffix first so the worker sees a sealed, fully flushed
    /// snapshot, then spawns the worker task.
    pub fn start(store: &mut PackStore, commit_key: &PackKey) -> Result<Self> {
        if store.readonly() {
            return Err(Error::RoNotAllowed);
        }
        if store.in_batch() {
            return Err(Error::GcForbiddenDuringBatch);
        }
        let config = store.file_manager().config().clone();
        if !config.indexing_strategy.is_minimal() {
            return Err(Error::GcDisallowed(
                "the configured indexing strategy is not minimal".to_string(),
            ));
        }
        if config.contents_length_header == crate::config::ContentsLengthHeader::None {
            return Err(Error::GcDisallowed(
                "contents entries carry no length header".to_string(),
            ));
        }
        if store.file_manager().payload().status == Status::UsedNonMinimalIndexingStrategy {
            return Err(Error::GcDisallowed(
                "the store was written under a non-minimal indexing strategy".to_string(),
            ));
        }

        // Lift the key to direct form.
        let span = match commit_key.span() {
            Some(span) => span,
            None => match store.index_direct(&commit_key.hash()) {
                Some(span) => {
                    commit_key.promote(span);
                    span
                }
                None => {
                    return Err(Error::CommitKeyIsDangling(commit_key.hash().to_string()))
                }
            },
        };
        if !store.mem(commit_key)? {
            return Err(Error::CommitKeyIsDangling(commit_key.hash().to_string()));
        }

        // The worker sizes every parent of the target to write its
        // placeholder, so each parent key must be resolvable to an offset
        // up front. Legacy v1 parents decode as bare hashes and depend on
        // the index for this.
        let Some(Object::Commit { parents, .. }) = store.find(commit_key)? else {
            return Err(Error::CommitKeyIsDangling(commit_key.hash().to_string()));
        };
        for parent in &parents {
            if parent.span().is_none() && store.index_direct(&parent.hash()).is_none() {
                return Err(Error::CommitParentKeyIsIndexed(parent.hash().to_string()));
            }
        }

        let generation = store.file_manager().generation() + 1;
        let stale_result = layout::gc_result_path(&config.root, generation);
        if classify_path(&stale_result) != PathKind::NoEnt {
            crate::io::unlink(&stale_result)?;
        }

        // The split seals every byte the worker will read and flushes all
        // three stages.
        store.split()?;

        info!(
            generation,
            commit_offset = span.offset,
            "starting gc"
        );
        let task = GcTask::spawn(WorkerArgs {
            config: config.clone(),
            generation,
            commit_span: span,
        });
        Ok(Self {
            root: config.root,
            generation,
            commit_offset: span.offset,
            task: Some(task),
            resulting_stats: None,
        })
    }

    /// The generation this GC is producing.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the worker has stopped (not necessarily successfully).
    pub fn is_finished(&self) -> bool {
        match &self.task {
            Some(task) => task.is_finished(),
            None => true,
        }
    }

    /// Live `(objects traversed, bytes copied)` counters from the worker.
    pub fn partial_stats(&self) -> (u64, u64) {
        self.task.as_ref().map(GcTask::progress).unwrap_or((0, 0))
    }

    /// Adopt the worker's output. With `wait` the call blocks on the
    /// worker; otherwise a still-running worker answers
    /// [`GcStatus::Running`]. Idempotent after the first success.
    pub async fn finalise(&mut self, store: &mut PackStore, wait: bool) -> Result<GcStatus> {
        if let Some(stats) = self.resulting_stats {
            return Ok(GcStatus::Finalised(stats));
        }
        let Some(task) = self.task.take() else {
            return Err(Error::GcProcessError(
                "cancelled before finalisation".to_string(),
            ));
        };
        if !wait && !task.is_finished() {
            self.task = Some(task);
            return Ok(GcStatus::Running);
        }

        let worker_outcome = task.join().await;
        match self.adopt(store, worker_outcome) {
            Ok(stats) => {
                self.resulting_stats = Some(stats);
                Ok(GcStatus::Finalised(stats))
            }
            Err(e) => {
                warn!(generation = self.generation, error = %e, "gc failed, cleaning up");
                if let Err(cleanup_err) = store.file_manager_mut().cleanup() {
                    warn!(error = %cleanup_err, "cleanup after failed gc also failed");
                }
                Err(e)
            }
        }
    }

    fn adopt(&self, store: &mut PackStore, worker_outcome: Result<()>) -> Result<GcStats> {
        worker_outcome?;
        let result = match GcResult::read(&layout::gc_result_path(&self.root, self.generation)) {
            Ok(result) => result,
            Err(Error::NoSuchFileOrDirectory) => return Err(Error::GcProcessDiedWithoutResultFile),
            Err(e) => return Err(e),
        };

        // The writer may have split while the worker ran; the final window
        // is whatever exists now minus what the worker proved removable.
        // At least the appendable chunk always remains.
        let current_chunks = store.file_manager().suffix().chunk_num();
        let removed = result.removable_chunk_idxs.len() as u32;
        assert!(
            current_chunks > removed,
            "gc would remove all {current_chunks} chunks"
        );
        let chunk_num = current_chunks - removed;

        store.file_manager_mut().swap(
            result.generation,
            result.suffix_params.start_offset,
            result.suffix_params.chunk_start_idx,
            chunk_num,
            result.suffix_params.dead_bytes,
            self.commit_offset,
        )?;
        store.purge_lru();
        // Everything outside the new generation and window is residual
        // now, the adopted result file included.
        store.file_manager_mut().cleanup()?;

        info!(
            generation = result.generation,
            copied_bytes = result.stats.copied_bytes,
            removable_chunks = removed,
            "gc finalised"
        );
        Ok(result.stats)
    }

    /// Block until the worker is done and the generation is swapped in.
    pub async fn wait(&mut self, store: &mut PackStore) -> Result<GcStats> {
        match self.finalise(store, true).await? {
            GcStatus::Finalised(stats) => Ok(stats),
            GcStatus::Running => unreachable!("finalise(wait) never reports Running"),
        }
    }

    /// Ask the worker to stop and discard its output. Returns `false` when
    /// there is nothing left to cancel.
    pub async fn cancel(&mut self, store: &mut PackStore) -> Result<bool> {
        if self.resulting_stats.is_some() {
            return Ok(false);
        }
        let Some(task) = self.task.take() else {
            return Ok(false);
        };
        task.request_cancel();
        // The worker may have finished a moment before the flag landed;
        // either way its output is abandoned.
        let _ = task.join().await;
        store.file_manager_mut().cleanup()?;
        info!(generation = self.generation, "gc cancelled");
        Ok(true)
    }

    /// Absolute offset of the commit this GC keeps.
    pub fn target_offset(&self) -> u64 {
        self.commit_offset
    }
}
