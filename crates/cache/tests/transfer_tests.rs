//! Scheduler behavior: coalescing on the wire, verification, retries,
//! deduplication, shutdown.

use std::time::Duration;

use mirror_cache::{FetchError, TransferConfig};
use mirror_primitives::Event;
use mirror_tree::StateTree;

mod common;

use common::{Fixture, MIB};

// ============================================================
// Materialization
// ============================================================

#[tokio::test]
async fn full_range_is_downloaded_verified_and_committed() {
    let fixture = Fixture::new("xfer-full", 8 * MIB);
    let manager = fixture.manager(TransferConfig::default());

    manager.ensure_range(0, 8 * MIB).await.unwrap();

    for k in 0..8 {
        assert!(fixture.state.is_valid(k), "leaf {k}");
    }
    assert_eq!(fixture.store.read(0, 8 * MIB).unwrap(), fixture.source);
    assert_eq!(
        fixture
            .sink
            .count(|event| matches!(event, Event::ChunkVerifyOk { .. })),
        8
    );
}

#[tokio::test]
async fn five_missing_leaves_coalesce_into_one_request() {
    let fixture = Fixture::new("xfer-coalesce", 16 * MIB);
    let manager = fixture.manager(TransferConfig::default());

    manager.ensure_range(2 * MIB, 7 * MIB).await.unwrap();

    assert_eq!(fixture.fetcher.requests(), vec![(2 * MIB, 7 * MIB)]);
}

#[tokio::test]
async fn requests_split_at_the_configured_ceiling() {
    let fixture = Fixture::new("xfer-split", 16 * MIB);
    let manager = fixture.manager(TransferConfig {
        max_xfer: 3 * MIB,
        ..TransferConfig::default()
    });

    manager.ensure_range(2 * MIB, 7 * MIB).await.unwrap();

    let mut requests = fixture.fetcher.requests();
    requests.sort_unstable();
    assert_eq!(requests, vec![(2 * MIB, 5 * MIB), (5 * MIB, 7 * MIB)]);
}

#[tokio::test]
async fn already_valid_leaves_are_not_refetched() {
    let fixture = Fixture::new("xfer-revisit", 8 * MIB);
    let manager = fixture.manager(TransferConfig::default());

    manager.ensure_range(0, 2 * MIB).await.unwrap();
    manager.ensure_range(MIB, 3 * MIB).await.unwrap();

    assert_eq!(
        fixture.fetcher.requests(),
        vec![(0, 2 * MIB), (2 * MIB, 3 * MIB)]
    );
}

#[tokio::test]
async fn concurrent_requests_share_one_download_per_leaf() {
    let fixture = Fixture::new("xfer-dedup", 4 * MIB);
    let manager = fixture.manager(TransferConfig::default());

    let (a, b) = tokio::join!(
        manager.ensure_range(0, MIB),
        manager.ensure_range(0, MIB),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(fixture.fetcher.requests(), vec![(0, MIB)]);
}

#[tokio::test]
async fn progress_survives_a_fresh_scheduler() {
    let fixture = Fixture::new("xfer-resume", 4 * MIB);

    let manager = fixture.manager(TransferConfig::default());
    manager.ensure_range(0, 2 * MIB).await.unwrap();
    drop(manager);

    // The bitmap was flushed word by word; a cold load sees it.
    let reloaded = StateTree::load(&fixture.root.join("artifact.bin.mrkl")).unwrap();
    assert_eq!(reloaded.valid_count(), 2);
}

// ============================================================
// Verification failures and retries
// ============================================================

#[tokio::test]
async fn corrupt_serving_is_retried_with_a_fresh_fetch() {
    let fixture = Fixture::new("xfer-retry", 8 * MIB);
    let manager = fixture.manager(TransferConfig {
        retry_backoff: Duration::from_millis(1),
        ..TransferConfig::default()
    });
    fixture.fetcher.corrupt_leaf(3, 1);

    manager.ensure_range(3 * MIB, 4 * MIB).await.unwrap();

    assert!(fixture.state.is_valid(3));
    assert_eq!(
        fixture.store.read(3 * MIB, 4 * MIB).unwrap(),
        &fixture.source[3 * MIB as usize..4 * MIB as usize]
    );
    assert_eq!(
        fixture
            .sink
            .count(|event| matches!(event, Event::ChunkVerifyFail { leaf_index: 3, .. })),
        1
    );
    assert_eq!(
        fixture
            .sink
            .count(|event| matches!(
                event,
                Event::ChunkVerifyRetry {
                    leaf_index: 3,
                    attempt: 1
                }
            )),
        1
    );
}

#[tokio::test]
async fn persistent_corruption_exhausts_only_that_leaf() {
    let fixture = Fixture::new("xfer-exhaust", 8 * MIB);
    let manager = fixture.manager(TransferConfig {
        max_retries: 2,
        retry_backoff: Duration::from_millis(1),
        ..TransferConfig::default()
    });
    fixture.fetcher.corrupt_leaf(2, 50);

    let err = manager.ensure_range(0, 4 * MIB).await.unwrap_err();
    assert!(matches!(
        err,
        FetchError::VerificationExhausted {
            leaf: 2,
            attempts: 3
        }
    ));

    // The poisoned leaf stays clear and untouched on disk; its
    // neighbors in the same transfer are unaffected.
    assert!(!fixture.state.is_valid(2));
    assert!(fixture
        .store
        .read(2 * MIB, 3 * MIB)
        .unwrap()
        .iter()
        .all(|&b| b == 0));
    for k in [0, 1, 3] {
        assert!(fixture.state.is_valid(k), "leaf {k}");
    }
}

#[tokio::test]
async fn transient_transport_errors_are_retried() {
    let fixture = Fixture::new("xfer-net-retry", 4 * MIB);
    let manager = fixture.manager(TransferConfig {
        retry_backoff: Duration::from_millis(1),
        ..TransferConfig::default()
    });
    fixture.fetcher.fail_next(2);

    manager.ensure_range(0, 4 * MIB).await.unwrap();

    assert!(fixture.state.is_complete());
    // Two failed servings plus the one that stuck.
    assert_eq!(fixture.fetcher.requests().len(), 3);
}

#[tokio::test]
async fn persistent_transport_errors_surface_after_the_budget() {
    let fixture = Fixture::new("xfer-net-exhaust", 4 * MIB);
    let manager = fixture.manager(TransferConfig {
        max_net_retries: 2,
        retry_backoff: Duration::from_millis(1),
        ..TransferConfig::default()
    });
    fixture.fetcher.fail_next(10);

    let err = manager.ensure_range(0, MIB).await.unwrap_err();
    assert!(matches!(err, FetchError::Transport(_)));
    assert!(!fixture.state.is_valid(0));
}

// ============================================================
// Shutdown
// ============================================================

#[tokio::test]
async fn close_walks_the_shutdown_ladder_in_order() {
    let fixture = Fixture::new("xfer-shutdown", 4 * MIB);
    let manager = fixture.manager(TransferConfig::default());

    manager.ensure_range(0, 4 * MIB).await.unwrap();
    manager.close().await;

    let shutdown: Vec<_> = fixture
        .sink
        .events()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                Event::ShutdownInit
                    | Event::ShutdownStopping
                    | Event::ShutdownHashing
                    | Event::ShutdownFlushing
                    | Event::ShutdownComplete
            )
        })
        .collect();
    assert_eq!(
        shutdown,
        vec![
            Event::ShutdownInit,
            Event::ShutdownStopping,
            Event::ShutdownHashing,
            Event::ShutdownFlushing,
            Event::ShutdownComplete,
        ]
    );

    // Idempotent: a second close emits nothing new.
    let before = fixture.sink.events().len();
    manager.close().await;
    assert_eq!(fixture.sink.events().len(), before);
}

#[tokio::test]
async fn close_flushes_recomputed_internals_to_disk() {
    let fixture = Fixture::new("xfer-flush", 4 * MIB);
    let manager = fixture.manager(TransferConfig::default());

    manager.ensure_range(0, 4 * MIB).await.unwrap();
    manager.close().await;

    let reloaded = StateTree::load(&fixture.root.join("artifact.bin.mrkl")).unwrap();
    assert!(reloaded.is_complete());
    assert_eq!(
        reloaded.hash_of_node(0).unwrap(),
        fixture.state.hash_of_node(0).unwrap()
    );
}

#[tokio::test]
async fn slow_transfers_trip_the_per_read_timeout() {
    let fixture = Fixture::new("xfer-timeout", 4 * MIB);
    let manager = fixture.manager(TransferConfig {
        read_timeout: Some(Duration::from_millis(20)),
        ..TransferConfig::default()
    });
    fixture.fetcher.set_delay(Duration::from_millis(500));

    let err = manager.ensure_range(0, MIB).await.unwrap_err();
    assert!(matches!(err, FetchError::Timeout));
}

#[tokio::test]
async fn requests_after_close_are_refused() {
    let fixture = Fixture::new("xfer-after-close", 4 * MIB);
    let manager = fixture.manager(TransferConfig::default());

    manager.close().await;

    assert!(matches!(
        manager.ensure_range(0, MIB).await,
        Err(FetchError::Cancelled)
    ));
}
