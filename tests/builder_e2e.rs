mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use common::{corpus, FakeGateway};
use ragdex::{
    BuildOptions, Document, Error, GatewayError, IndexBuilder, RetryPolicy, SearchConfig, SearchMode,
};
use ragdex_core::persist;

fn fast_options() -> BuildOptions {
    BuildOptions {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        },
        timeout: Duration::from_secs(5),
        ..BuildOptions::default()
    }
}

fn builder(gateway: &Arc<FakeGateway>, options: BuildOptions) -> IndexBuilder {
    IndexBuilder::new(gateway.clone(), options).unwrap()
}

#[tokio::test]
async fn test_second_build_on_unchanged_corpus_makes_no_gateway_calls() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    let docs = corpus(5);

    let first = builder(&gateway, fast_options()).build(&docs, &target).await.unwrap();
    assert!(!first.reused);
    assert_eq!(first.chunks, 5);
    assert_eq!(gateway.total_calls(), 5);

    let second = builder(&gateway, fast_options()).build(&docs, &target).await.unwrap();
    assert!(second.reused);
    assert_eq!(second.manifest, first.manifest);
    assert_eq!(gateway.total_calls(), 5, "unchanged corpus must not re-embed");

    // Document order does not matter for the corpus hash.
    let mut shuffled = docs.clone();
    shuffled.reverse();
    let third = builder(&gateway, fast_options()).build(&shuffled, &target).await.unwrap();
    assert!(third.reused);
    assert_eq!(gateway.total_calls(), 5);
}

#[tokio::test]
async fn test_changed_corpus_rebuilds_fully() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    let mut docs = corpus(3);

    builder(&gateway, fast_options()).build(&docs, &target).await.unwrap();
    docs.push(Document::new("doc-new", "freshly added"));
    let report = builder(&gateway, fast_options()).build(&docs, &target).await.unwrap();

    assert!(!report.reused);
    assert_eq!(report.manifest.chunk_count, 4);
    // No incremental diffing: every chunk is embedded again.
    assert_eq!(gateway.calls_for("text number 0"), 2);
    assert_eq!(gateway.calls_for("freshly added"), 1);

    let (index, store, _) = persist::load(&target).unwrap();
    assert_eq!(index.len(), 4);
    assert_eq!(store.len(), 4);
}

#[tokio::test]
async fn test_changed_chunking_profile_rebuilds() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    let docs = corpus(2);

    builder(&gateway, fast_options()).build(&docs, &target).await.unwrap();
    let options = BuildOptions {
        overlap: 100,
        ..fast_options()
    };
    let report = builder(&gateway, options).build(&docs, &target).await.unwrap();
    assert!(!report.reused);
    assert_eq!(report.manifest.embedding.overlap, 100);
    assert_eq!(gateway.total_calls(), 4);
}

#[tokio::test]
async fn test_second_chunk_fails_twice_then_succeeds() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    gateway.fail(
        "text number 1",
        2,
        GatewayError::Transient("429 rate limited".into()),
    );
    let docs = corpus(5);

    let report = builder(&gateway, fast_options()).build(&docs, &target).await.unwrap();

    assert_eq!(report.chunks, 5);
    assert_eq!(gateway.calls_for("text number 1"), 3);
    for i in [0, 2, 3, 4] {
        assert_eq!(gateway.calls_for(&format!("text number {i}")), 1);
    }
    let second_chunk = ragdex::chunker::Chunker::new(1024, 200)
        .unwrap()
        .chunk(&docs[1])
        .remove(0);
    assert_eq!(report.attempts.get(&second_chunk.id), Some(&3));
    assert_eq!(report.total_attempts(), 7);
    assert_eq!(persist::load(&target).unwrap().0.len(), 5);
}

#[tokio::test]
async fn test_exhausted_retries_abort_without_artifact() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    gateway.fail("text number 3", 10, GatewayError::Transient("503".into()));
    let options = BuildOptions {
        concurrency: 1,
        ..fast_options()
    };

    let err = builder(&gateway, options)
        .build(&corpus(5), &target)
        .await
        .unwrap_err();

    match err {
        Error::BuildFailed {
            attempts,
            succeeded,
            reason,
            ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(succeeded.len(), 3);
            assert!(reason.contains("503"), "{reason}");
        }
        other => panic!("expected BuildFailed, got {other:?}"),
    }
    assert_eq!(gateway.calls_for("text number 3"), 3);
    assert!(!target.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_failed_rebuild_keeps_previous_generation() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    let first = builder(&gateway, fast_options())
        .build(&corpus(2), &target)
        .await
        .unwrap();

    gateway.fail("text number 2", 10, GatewayError::Transient("down".into()));
    assert!(builder(&gateway, fast_options())
        .build(&corpus(3), &target)
        .await
        .is_err());

    let (index, _, manifest) = persist::load(&target).unwrap();
    assert_eq!(manifest, first.manifest);
    assert_eq!(index.len(), 2);
}

#[tokio::test]
async fn test_permanent_error_is_not_retried() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    gateway.fail("text number 0", 1, GatewayError::Permanent("401".into()));

    let err = builder(&gateway, fast_options())
        .build(&corpus(2), &target)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BuildFailed { attempts: 1, .. }), "{err}");
    assert_eq!(gateway.calls_for("text number 0"), 1);
}

#[tokio::test]
async fn test_timeout_counts_as_retryable_failure() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    gateway.stall("text number 0", 1, Duration::from_secs(10));
    let options = BuildOptions {
        timeout: Duration::from_millis(100),
        ..fast_options()
    };

    let started = Instant::now();
    let report = builder(&gateway, options).build(&corpus(2), &target).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.chunks, 2);
    assert_eq!(gateway.calls_for("text number 0"), 2);
}

#[tokio::test]
async fn test_cancellation_persists_nothing() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    gateway.stall("text number 1", 1, Duration::from_secs(30));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = builder(&gateway, fast_options())
        .build_with_cancel(&corpus(4), &target, cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!target.exists());
}

#[tokio::test]
async fn test_cancelled_before_start_makes_no_calls() {
    let dir = tempdir().unwrap();
    let gateway = Arc::new(FakeGateway::new(16));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = builder(&gateway, fast_options())
        .build_with_cancel(&corpus(3), &dir.path().join("index"), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(gateway.total_calls(), 0);
}

#[tokio::test]
async fn test_wrong_embedding_length_is_fatal() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::lying(16, 8));

    let err = builder(&gateway, fast_options())
        .build(&corpus(2), &target)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DimensionMismatch {
            expected: 16,
            actual: 8
        }
    ));
    assert!(!target.exists());
}

#[tokio::test]
async fn test_duplicate_document_ids_rejected() {
    let dir = tempdir().unwrap();
    let gateway = Arc::new(FakeGateway::new(16));
    let docs = vec![Document::new("same", "one"), Document::new("same", "two")];

    let err = builder(&gateway, fast_options())
        .build(&docs, &dir.path().join("index"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(gateway.total_calls(), 0);
}

#[tokio::test]
async fn test_overlap_not_below_chunk_size_is_config_error() {
    let gateway = Arc::new(FakeGateway::new(16));
    let options = BuildOptions {
        chunk_size: 50,
        overlap: 50,
        ..fast_options()
    };
    assert!(matches!(
        IndexBuilder::new(gateway, options),
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn test_unreadable_manifest_triggers_rebuild() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    let docs = corpus(2);
    builder(&gateway, fast_options()).build(&docs, &target).await.unwrap();

    std::fs::write(target.join(persist::MANIFEST_FILE), b"{ not json").unwrap();
    let report = builder(&gateway, fast_options()).build(&docs, &target).await.unwrap();
    assert!(!report.reused);
    assert_eq!(gateway.total_calls(), 4);
    assert!(persist::load(&target).is_ok());
}

#[tokio::test]
async fn test_batched_build_embeds_in_groups() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    let options = BuildOptions {
        batch_size: 2,
        ..fast_options()
    };

    let report = builder(&gateway, options).build(&corpus(5), &target).await.unwrap();
    assert_eq!(report.chunks, 5);
    assert_eq!(gateway.total_calls(), 5);

    let (index, store, _) = persist::load(&target).unwrap();
    for chunk in store.all() {
        assert!(index.contains(&chunk.id));
    }
}

#[tokio::test]
async fn test_changed_search_mode_rebuilds() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    let docs = corpus(3);

    builder(&gateway, fast_options()).build(&docs, &target).await.unwrap();
    let options = BuildOptions {
        search: SearchConfig {
            mode: SearchMode::Approximate,
            ..SearchConfig::default()
        },
        ..fast_options()
    };
    let report = builder(&gateway, options.clone()).build(&docs, &target).await.unwrap();
    assert!(!report.reused);
    assert_eq!(report.manifest.search.mode, SearchMode::Approximate);
    assert_eq!(gateway.total_calls(), 6);

    let (index, _, _) = persist::load(&target).unwrap();
    assert!(index.uses_graph());

    let again = builder(&gateway, options).build(&docs, &target).await.unwrap();
    assert!(again.reused);
    assert_eq!(gateway.total_calls(), 6);
}

#[tokio::test]
async fn test_short_batch_reply_fails_build_with_batch_named() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    gateway.short_batches();
    let docs = corpus(4);
    let options = BuildOptions {
        batch_size: 2,
        concurrency: 1,
        ..fast_options()
    };

    let err = builder(&gateway, options)
        .build(&docs, &target)
        .await
        .unwrap_err();

    let chunker = ragdex::chunker::Chunker::new(1024, 200).unwrap();
    let first = chunker.chunk(&docs[0]).remove(0);
    let second = chunker.chunk(&docs[1]).remove(0);
    match err {
        Error::BuildFailed {
            chunk_id,
            attempts,
            succeeded,
            reason,
        } => {
            assert_eq!(chunk_id, first.id);
            assert_eq!(attempts, 1, "a malformed reply is not retried");
            assert!(succeeded.is_empty());
            assert!(reason.contains("1 embeddings for 2 texts"), "{reason}");
            assert!(reason.contains(&second.id), "{reason}");
        }
        other => panic!("expected BuildFailed, got {other:?}"),
    }
    assert!(!target.exists());
}

#[tokio::test]
async fn test_generation_stranded_by_interrupted_save_is_restored_and_reused() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("index");
    let gateway = Arc::new(FakeGateway::new(16));
    let docs = corpus(3);
    let first = builder(&gateway, fast_options()).build(&docs, &target).await.unwrap();

    std::fs::rename(&target, dir.path().join(".index.old-00aa11bb22cc33dd")).unwrap();
    assert_eq!(persist::load(&target).unwrap().2, first.manifest);

    let report = builder(&gateway, fast_options()).build(&docs, &target).await.unwrap();
    assert!(report.reused);
    assert_eq!(report.manifest, first.manifest);
    assert_eq!(gateway.total_calls(), 3);
    assert!(target.is_dir());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}
