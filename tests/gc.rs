//! End-to-end garbage collection scenarios: soundness of the live set,
//! generation swaps observed by readers, cancellation, and splits racing a
//! running worker.

use packstore::error::Error;
use packstore::gc::GcStatus;
use packstore::layout;
use packstore::tmpfs::TempDir;
use packstore::{Config, Gc, Hash, IndexingStrategy, Object, PackKey, PackStore};

fn config(dir: &TempDir) -> Config {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Config::new(dir.path())
        .dict_auto_flush_threshold(4096)
        .suffix_auto_flush_threshold(4096)
}

fn contents(tag: u64, len: usize) -> Object {
    let mut bytes = tag.to_be_bytes().to_vec();
    bytes.resize(len.max(8), 0xcd);
    Object::Contents(bytes)
}

/// Write one commit whose tree holds `files` fresh contents entries plus
/// the given shared children, chained onto `parent`.
fn write_commit(
    store: &mut PackStore,
    parent: Option<&PackKey>,
    tag: u64,
    files: usize,
    shared: &[(Vec<u8>, PackKey)],
) -> PackKey {
    let mut children: Vec<(Vec<u8>, PackKey)> = shared.to_vec();
    for i in 0..files {
        let key = store.add(&contents(tag * 1000 + i as u64, 48)).unwrap();
        children.push((format!("file-{tag}-{i}").into_bytes(), key));
    }
    let node = store
        .add(&Object::Inode {
            root: true,
            children,
        })
        .unwrap();
    let commit = Object::Commit {
        node,
        parents: parent.map(|p| vec![p.clone()]).unwrap_or_default(),
        message: format!("commit {tag}").into_bytes(),
    };
    store.add(&commit).unwrap()
}

#[tokio::test]
async fn test_gc_keeps_live_set_and_drops_history() {
    let dir = TempDir::new().unwrap();
    let mut store = PackStore::open(&config(&dir)).unwrap();
    store.set_check_integrity(true);

    let k1 = write_commit(&mut store, None, 1, 2, &[]);
    let k2 = write_commit(&mut store, Some(&k1), 2, 2, &[]);
    store.flush().unwrap();

    // Remember a piece of k1's tree so we can probe it after the GC.
    let Some(Object::Commit { node: n1, .. }) = store.find(&k1).unwrap() else {
        panic!("expected commit");
    };

    let mut gc = Gc::start(&mut store, &k2).unwrap();
    let stats = gc.wait(&mut store).await.unwrap();
    assert!(stats.copied_bytes > 0);
    assert_eq!(stats.dangling_parents, 1);

    // The target commit and its tree survive.
    let commit = store.find(&k2).unwrap().expect("live commit");
    let Object::Commit { node, parents, .. } = commit else {
        panic!("expected commit");
    };
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0].hash(), k1.hash());
    let inode = store.find(&node).unwrap().expect("live tree root");
    let Object::Inode { children, .. } = inode else {
        panic!("expected inode");
    };
    for (_, child) in &children {
        assert!(store.find(child).unwrap().is_some());
    }

    // The parent's history is gone: the commit answers mem = false (its
    // offset now holds a dangling placeholder), its tree reads as gced.
    assert!(!store.mem(&k1).unwrap());
    assert!(matches!(
        store.find(&n1),
        Err(Error::InvalidReadOfGcedObject(_))
    ));

    // Layout: generation 1 files exist, chunk 0 was retired.
    assert!(layout::prefix_path(dir.path(), 1).exists());
    assert!(layout::mapping_path(dir.path(), 1).exists());
    assert!(!layout::suffix_path(dir.path(), 0).exists());
    assert!(!layout::gc_result_path(dir.path(), 1).exists());

    store.close().unwrap();
}

#[tokio::test]
async fn test_gc_preserves_shared_objects_across_generations() {
    let dir = TempDir::new().unwrap();
    let mut store = PackStore::open(&config(&dir)).unwrap();
    store.set_check_integrity(true);

    // A blob shared by every commit's tree.
    let shared_key = store.add(&contents(77, 64)).unwrap();
    let shared = vec![(b"shared".to_vec(), shared_key.clone())];

    let k1 = write_commit(&mut store, None, 1, 1, &shared);
    store.flush().unwrap();
    let mut gc = Gc::start(&mut store, &k1).unwrap();
    gc.wait(&mut store).await.unwrap();

    // Second generation: the new commit still references the shared blob,
    // which now lives in the generation-1 prefix.
    let k2 = write_commit(&mut store, Some(&k1), 2, 1, &shared);
    store.flush().unwrap();
    let mut gc = Gc::start(&mut store, &k2).unwrap();
    gc.wait(&mut store).await.unwrap();

    assert_eq!(
        store.find(&shared_key).unwrap(),
        Some(contents(77, 64))
    );
    assert!(store.find(&k2).unwrap().is_some());
    // Generation 1 files were retired by the second swap.
    assert!(!layout::prefix_path(dir.path(), 1).exists());
    assert!(!layout::mapping_path(dir.path(), 1).exists());
    assert!(layout::prefix_path(dir.path(), 2).exists());

    store.close().unwrap();
}

#[tokio::test]
async fn test_reader_observes_generation_after_reload() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let mut writer = PackStore::open(&cfg).unwrap();

    let k1 = write_commit(&mut writer, None, 1, 2, &[]);
    let k2 = write_commit(&mut writer, Some(&k1), 2, 2, &[]);
    writer.flush().unwrap();

    let mut reader = PackStore::open_ro(&cfg).unwrap();
    assert!(reader.find(&k2).unwrap().is_some());

    let mut gc = Gc::start(&mut writer, &k2).unwrap();
    gc.wait(&mut writer).await.unwrap();

    // Until the reload the reader stays on the old generation.
    assert_eq!(reader.file_manager().generation(), 0);
    reader.reload().unwrap();
    assert_eq!(reader.file_manager().generation(), 1);

    // Live pre-GC offsets are served unchanged, through the new prefix.
    let commit = reader.find(&k2).unwrap().expect("live commit via reader");
    let Object::Commit { node, .. } = commit else {
        panic!("expected commit");
    };
    assert!(reader.find(&node).unwrap().is_some());
    assert!(!reader.mem(&k1).unwrap());

    writer.close().unwrap();
    reader.close().unwrap();
}

#[tokio::test]
async fn test_cancel_discards_generation_and_allows_retry() {
    let dir = TempDir::new().unwrap();
    let mut store = PackStore::open(&config(&dir)).unwrap();

    let k1 = write_commit(&mut store, None, 1, 4, &[]);
    store.flush().unwrap();

    let mut gc = Gc::start(&mut store, &k1).unwrap();
    let generation = gc.generation();
    assert!(gc.cancel(&mut store).await.unwrap());
    assert!(!gc.cancel(&mut store).await.unwrap());

    // Finalising a cancelled gc reports a process error; the store is
    // still on the previous generation and carries no gen files.
    match gc.finalise(&mut store, true).await {
        Err(Error::GcProcessError(msg)) => assert!(msg.contains("cancel")),
        other => panic!("expected a gc process error, got {other:?}"),
    }
    assert_eq!(store.file_manager().generation(), 0);
    assert!(!layout::prefix_path(dir.path(), generation).exists());
    assert!(!layout::mapping_path(dir.path(), generation).exists());
    assert!(!layout::gc_result_path(dir.path(), generation).exists());

    // The same commit gcs fine afterwards.
    let mut gc = Gc::start(&mut store, &k1).unwrap();
    gc.wait(&mut store).await.unwrap();
    assert_eq!(store.file_manager().generation(), generation);
    assert!(store.find(&k1).unwrap().is_some());

    store.close().unwrap();
}

#[tokio::test]
async fn test_split_while_worker_runs() {
    let dir = TempDir::new().unwrap();
    let mut store = PackStore::open(&config(&dir)).unwrap();

    let k1 = write_commit(&mut store, None, 1, 3, &[]);
    store.flush().unwrap();

    let mut gc = Gc::start(&mut store, &k1).unwrap();

    // The writer keeps going while the worker runs: new entries and an
    // extra split.
    let k2 = write_commit(&mut store, Some(&k1), 2, 3, &[]);
    store.split().unwrap();
    let chunks_before = store.file_manager().payload().chunk_num;

    let stats = gc.wait(&mut store).await.unwrap();
    let payload = store.file_manager().payload();
    // Reconciliation: whatever existed at finalise minus the removable
    // chunks, and always at least the appendable one.
    assert_eq!(
        payload.chunk_num,
        chunks_before - stats.removable_chunks
    );
    assert!(payload.chunk_num >= 1);

    // Data appended during the gc is intact.
    assert!(store.find(&k2).unwrap().is_some());
    store.close().unwrap();
}

#[tokio::test]
async fn test_periodic_gc_bounds_history() {
    let dir = TempDir::new().unwrap();
    let mut store = PackStore::open(&config(&dir)).unwrap();

    let mut head: Option<PackKey> = None;
    for tag in 0..120u64 {
        let key = write_commit(&mut store, head.as_ref(), tag, 2, &[]);
        head = Some(key.clone());
        if (tag + 1) % 40 == 0 {
            store.flush().unwrap();
            let mut gc = Gc::start(&mut store, &key).unwrap();
            gc.wait(&mut store).await.unwrap();
        }
    }
    store.flush().unwrap();

    let head = head.unwrap();
    assert!(store.find(&head).unwrap().is_some());
    assert_eq!(store.file_manager().generation(), 3);

    // Post-GC, the on-disk history is bounded: the suffix starts past the
    // latest target and the prefix holds one commit's worth of data, not
    // 120 commits' worth.
    let payload = store.file_manager().payload();
    assert!(payload.status.generation() == 3);
    let prefix_len = std::fs::metadata(layout::prefix_path(dir.path(), 3))
        .unwrap()
        .len();
    assert!(prefix_len > 0);
    assert!(prefix_len < store.stats().appended_bytes / 4);

    store.close().unwrap();
}

#[tokio::test]
async fn test_gc_from_indexed_key_promotes() {
    let dir = TempDir::new().unwrap();
    let mut store = PackStore::open(&config(&dir)).unwrap();

    let k1 = write_commit(&mut store, None, 1, 1, &[]);
    store.flush().unwrap();

    let bare = PackKey::indexed(k1.hash());
    let mut gc = Gc::start(&mut store, &bare).unwrap();
    assert!(bare.is_direct());
    gc.wait(&mut store).await.unwrap();
    assert!(store.find(&bare).unwrap().is_some());
    store.close().unwrap();
}

#[tokio::test]
async fn test_gc_refused_for_unknown_commit_and_bad_config() {
    let dir = TempDir::new().unwrap();
    let mut store = PackStore::open(&config(&dir)).unwrap();
    store.flush().unwrap();

    let unknown = PackKey::indexed(Hash::digest(b"no such commit"));
    assert!(matches!(
        Gc::start(&mut store, &unknown),
        Err(Error::CommitKeyIsDangling(_))
    ));
    store.close().unwrap();

    // Non-minimal indexing is incompatible with gc.
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir).indexing_strategy(IndexingStrategy::Always);
    let mut store = PackStore::open(&cfg).unwrap();
    let k1 = write_commit(&mut store, None, 1, 1, &[]);
    store.flush().unwrap();
    assert!(matches!(
        Gc::start(&mut store, &k1),
        Err(Error::GcDisallowed(_))
    ));
    store.close().unwrap();
}

#[tokio::test]
async fn test_gc_forbidden_during_batch() {
    let dir = TempDir::new().unwrap();
    let mut store = PackStore::open(&config(&dir)).unwrap();
    let k1 = write_commit(&mut store, None, 1, 1, &[]);
    store.flush().unwrap();

    let result = store.batch(|s| match Gc::start(s, &k1) {
        Err(e) => Err(e),
        Ok(_) => Ok(()),
    });
    assert_eq!(result, Err(Error::GcForbiddenDuringBatch));
    store.close().unwrap();
}

#[tokio::test]
async fn test_finalise_without_wait_reports_running_or_result() {
    let dir = TempDir::new().unwrap();
    let mut store = PackStore::open(&config(&dir)).unwrap();
    let k1 = write_commit(&mut store, None, 1, 3, &[]);
    store.flush().unwrap();

    let mut gc = Gc::start(&mut store, &k1).unwrap();
    // Poll until the worker lands; each poll is either Running or the
    // final answer, never an error.
    let stats = loop {
        match gc.finalise(&mut store, false).await.unwrap() {
            GcStatus::Running => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            GcStatus::Finalised(stats) => break stats,
        }
    };
    // Finalise is idempotent: the cached stats come back.
    let again = gc.wait(&mut store).await.unwrap();
    assert_eq!(stats, again);
    store.close().unwrap();
}

#[tokio::test]
async fn test_gced_store_requires_minimal_strategy_to_reopen() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    {
        let mut store = PackStore::open(&cfg).unwrap();
        let k1 = write_commit(&mut store, None, 1, 1, &[]);
        store.flush().unwrap();
        let mut gc = Gc::start(&mut store, &k1).unwrap();
        gc.wait(&mut store).await.unwrap();
        store.close().unwrap();
    }

    let always = cfg.clone().indexing_strategy(IndexingStrategy::Always);
    assert!(matches!(
        PackStore::open(&always),
        Err(Error::OnlyMinimalIndexingStrategyAllowed)
    ));
    // The minimal strategy still opens it.
    let mut store = PackStore::open(&cfg).unwrap();
    store.close().unwrap();
}

#[tokio::test]
async fn test_reopen_after_gc() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let (k1, k2) = {
        let mut store = PackStore::open(&cfg).unwrap();
        let k1 = write_commit(&mut store, None, 1, 2, &[]);
        let k2 = write_commit(&mut store, Some(&k1), 2, 2, &[]);
        store.flush().unwrap();
        let mut gc = Gc::start(&mut store, &k2).unwrap();
        gc.wait(&mut store).await.unwrap();
        store.close().unwrap();
        (k1, k2)
    };

    let mut store = PackStore::open(&cfg).unwrap();
    assert_eq!(store.file_manager().generation(), 1);
    assert!(store.find(&k2).unwrap().is_some());
    assert!(!store.mem(&k1).unwrap());
    store.close().unwrap();
}
