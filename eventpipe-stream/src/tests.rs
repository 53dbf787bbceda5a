// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use assert_matches::assert_matches;
use eventpipe_core::{Cursor, SourceId};
use eventpipe_store::{ItemStore, MemoryStore};
use tokio::time::timeout;

use crate::source::LONG_POLL_GRACE;
use crate::test_utils::{
    ATTEMPTS_KEY, CountingStage, FailingStage, MockFetcher, StallingFetcher, setup_logging,
    test_event,
};
use crate::{
    EventSourceManager, ManagerBuilder, PipelineError, SourceConfig, StageOptions, ValidationError,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn test_config(id: &str) -> SourceConfig {
    SourceConfig::new(id)
        .with_domain("billing")
        .with_event_type("invoice.created")
        .with_poll_interval(Duration::from_millis(10))
        .with_long_poll_timeout(Duration::from_secs(1))
}

async fn wait_until(condition: impl Fn() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

#[tokio::test]
async fn happy_path() {
    setup_logging();

    let fetcher = MockFetcher::new();
    fetcher.push_events(
        vec![test_event("a"), test_event("b"), test_event("c")],
        "cursor-1",
    );

    let manager = EventSourceManager::new(MemoryStore::new(), fetcher.clone());
    let mut source = manager.create_source(test_config("invoices")).unwrap();

    let validate = CountingStage::new();
    let enrich = CountingStage::new();
    source
        .add_stage(StageOptions::new("validate"), validate.clone())
        .unwrap();
    source
        .add_stage(StageOptions::new("enrich"), enrich.clone())
        .unwrap();

    timeout(TEST_TIMEOUT, source.run_until_drained())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(validate.total_calls(), 3);
    assert_eq!(enrich.total_calls(), 3);
    for uid in ["a", "b", "c"] {
        assert_eq!(validate.calls(uid), 1);
        assert_eq!(enrich.calls(uid), 1);
    }

    let storage = manager.storage();
    assert!(storage.get_items(source.id(), 0).await.unwrap().is_empty());
    assert_eq!(
        storage.get_cursor(source.id()).await.unwrap(),
        Some(Cursor::from("cursor-1"))
    );
    assert!(manager.cause().is_none());
}

#[tokio::test]
async fn bounded_retry() {
    setup_logging();

    let fetcher = MockFetcher::new();
    fetcher.push_events(vec![test_event("a"), test_event("b")], "cursor-1");

    let manager = EventSourceManager::new(MemoryStore::new(), fetcher);
    let mut source = manager.create_source(test_config("invoices")).unwrap();

    // Keeps every event pending twice before letting it pass.
    let flaky = CountingStage::retrying(2);
    let store = CountingStage::new();
    source
        .add_stage(StageOptions::new("flaky"), flaky.clone())
        .unwrap();
    source
        .add_stage(StageOptions::new("store"), store.clone())
        .unwrap();

    timeout(TEST_TIMEOUT, source.run_until_drained())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(flaky.total_calls(), 6);
    assert_eq!(store.total_calls(), 2);
    for uid in ["a", "b"] {
        assert_eq!(flaky.calls(uid), 3);
        assert_eq!(store.calls(uid), 1);

        // Context written by the first stage survived the retries.
        let context = store.last_context(uid).unwrap();
        assert_eq!(context.get::<u32>(ATTEMPTS_KEY).unwrap(), Some(3));
    }

    assert!(
        manager
            .storage()
            .get_items(source.id(), 0)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn pending_context_is_persisted() {
    let fetcher = MockFetcher::new();
    fetcher.push_events(vec![test_event("a")], "cursor-1");

    let manager = EventSourceManager::new(MemoryStore::new(), fetcher);
    let mut source = manager.create_source(test_config("invoices")).unwrap();
    source
        .add_stage(StageOptions::new("flaky"), CountingStage::retrying(100))
        .unwrap();

    let storage = manager.storage().clone();
    let source_id = source.id().clone();
    let handle = tokio::spawn(async move { source.run().await });

    // Wait until the event was attempted at least twice.
    timeout(TEST_TIMEOUT, async {
        loop {
            let items = storage.get_items(&source_id, 0).await.unwrap();
            let attempts = items
                .first()
                .and_then(|item| item.context.as_ref())
                .and_then(|context| context.get::<u32>(ATTEMPTS_KEY).unwrap());
            if attempts >= Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    manager.cancel();
    assert_matches!(handle.await.unwrap(), Ok(()));

    // Still pending after shutdown.
    let items = storage.get_items(&source_id, 0).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].event, test_event("a"));
}

#[tokio::test]
async fn remove_skips_remaining_stages() {
    let fetcher = MockFetcher::new();
    fetcher.push_events(vec![test_event("a"), test_event("b")], "cursor-1");

    let manager = EventSourceManager::new(MemoryStore::new(), fetcher);
    let mut source = manager.create_source(test_config("invoices")).unwrap();

    let filter = CountingStage::removing();
    let enrich = CountingStage::new();
    source
        .add_stage(StageOptions::new("filter"), filter.clone())
        .unwrap();
    source
        .add_stage(StageOptions::new("enrich"), enrich.clone())
        .unwrap();

    timeout(TEST_TIMEOUT, source.run_until_drained())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(filter.total_calls(), 2);
    assert_eq!(enrich.total_calls(), 0);
    assert!(
        manager
            .storage()
            .get_items(source.id(), 0)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn cursor_only_advances_with_events() {
    let fetcher = MockFetcher::new();
    fetcher.push_events(vec![test_event("a")], "cursor-1");
    fetcher.push_events(vec![], "cursor-ignored");
    fetcher.push_timeout();
    fetcher.push_events(vec![test_event("b"), test_event("c")], "cursor-2");

    let manager = EventSourceManager::new(MemoryStore::new(), fetcher.clone());
    let mut source = manager
        .create_source(test_config("invoices").with_since(1_600_000_000_000))
        .unwrap();
    source
        .add_stage(StageOptions::new("store"), CountingStage::new())
        .unwrap();

    let storage = manager.storage().clone();
    let source_id = source.id().clone();
    let handle = tokio::spawn(async move { source.run().await });

    wait_until(|| fetcher.requests().len() >= 6).await;
    manager.cancel();
    assert_matches!(handle.await.unwrap(), Ok(()));

    let cursors: Vec<Option<Cursor>> = fetcher
        .requests()
        .into_iter()
        .take(6)
        .map(|request| request.cursor)
        .collect();
    assert_eq!(
        cursors,
        vec![
            None,
            Some(Cursor::from("cursor-1")),
            Some(Cursor::from("cursor-1")),
            Some(Cursor::from("cursor-1")),
            Some(Cursor::from("cursor-2")),
            Some(Cursor::from("cursor-2")),
        ]
    );
    assert_eq!(
        storage.get_cursor(&source_id).await.unwrap(),
        Some(Cursor::from("cursor-2"))
    );

    let request = &fetcher.requests()[0];
    assert_eq!(request.domain, "billing");
    assert_eq!(request.event_type, "invoice.created");
    assert_eq!(request.since, 1_600_000_000_000);
    assert_eq!(request.limit, 100);
    assert_eq!(request.long_poll_timeout, Duration::from_secs(1));
}

#[tokio::test]
async fn redelivered_events_are_not_pushed_twice() {
    let fetcher = MockFetcher::new();
    fetcher.push_events(vec![test_event("a")], "cursor-1");
    // Upstream delivers the same event again while it is still pending.
    fetcher.push_events(vec![test_event("a")], "cursor-1");

    let manager = EventSourceManager::new(MemoryStore::new(), fetcher);
    let mut source = manager.create_source(test_config("invoices")).unwrap();

    let flaky = CountingStage::retrying(3).with_delay(Duration::from_millis(5));
    let store = CountingStage::new();
    source
        .add_stage(StageOptions::new("flaky"), flaky.clone())
        .unwrap();
    source
        .add_stage(StageOptions::new("store"), store.clone())
        .unwrap();

    timeout(TEST_TIMEOUT, source.run_until_drained())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(flaky.calls("a"), 4);
    assert_eq!(store.calls("a"), 1);
}

#[tokio::test]
async fn redelivered_events_beyond_reload_limit_are_skipped() {
    let fetcher = MockFetcher::new();
    // "b" is pending but not part of what a cycle reloads.
    fetcher.push_events(vec![test_event("b"), test_event("c")], "cursor-1");

    let manager = EventSourceManager::new(MemoryStore::new(), fetcher.clone());
    let mut source = manager
        .create_source(test_config("invoices").with_reload_limit(1))
        .unwrap();
    for uid in ["a", "b"] {
        manager
            .storage()
            .push(source.id(), &test_event(uid), None)
            .await
            .unwrap();
    }

    source
        .add_stage(StageOptions::new("stuck"), CountingStage::retrying(u32::MAX))
        .unwrap();

    let storage = manager.storage().clone();
    let source_id = source.id().clone();
    let handle = tokio::spawn(async move { source.run().await });

    wait_until(|| fetcher.requests().len() >= 3).await;
    manager.cancel();
    assert_matches!(handle.await.unwrap(), Ok(()));
    assert!(manager.cause().is_none());

    // The redelivered event was skipped, the new one persisted and the cursor advanced.
    let uids: Vec<String> = storage
        .get_items(&source_id, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|stored| stored.event.uid)
        .collect();
    assert_eq!(uids, vec!["a", "b", "c"]);
    assert_eq!(
        storage.get_cursor(&source_id).await.unwrap(),
        Some(Cursor::from("cursor-1"))
    );
    assert_eq!(fetcher.requests()[1].cursor, Some(Cursor::from("cursor-1")));
}

#[tokio::test(start_paused = true)]
async fn overdue_long_poll_is_abandoned() {
    let fetcher = StallingFetcher::new();
    let manager = EventSourceManager::new(MemoryStore::new(), fetcher.clone());
    let mut source = manager.create_source(test_config("invoices")).unwrap();
    source
        .add_stage(StageOptions::new("store"), CountingStage::new())
        .unwrap();

    let cursor = Cursor::from("cursor-7");
    let storage = manager.storage().clone();
    storage.update_cursor(source.id(), &cursor).await.unwrap();

    let source_id = source.id().clone();
    let long_poll_timeout = source.config().long_poll_timeout;
    let handle = tokio::spawn(async move { source.run().await });

    timeout(Duration::from_secs(60), async {
        while fetcher.requests().len() < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("producer did not poll again");
    manager.cancel();
    assert_matches!(handle.await.unwrap(), Ok(()));
    assert!(manager.cause().is_none());

    let requests = fetcher.requests();
    assert!(requests[1].0 - requests[0].0 >= long_poll_timeout + LONG_POLL_GRACE);
    assert_eq!(requests[0].1.cursor, Some(cursor.clone()));
    assert_eq!(requests[1].1.cursor, Some(cursor.clone()));
    assert_eq!(storage.get_cursor(&source_id).await.unwrap(), Some(cursor));
}

#[tokio::test]
async fn stage_concurrency_is_bounded() {
    let fetcher = MockFetcher::new();
    let events = (0..12).map(|index| test_event(&format!("evt-{index}"))).collect();
    fetcher.push_events(events, "cursor-1");

    let manager = EventSourceManager::new(MemoryStore::new(), fetcher);
    let mut source = manager.create_source(test_config("invoices")).unwrap();

    let slow = CountingStage::new().with_delay(Duration::from_millis(20));
    let store = CountingStage::new();
    source
        .add_stage(
            StageOptions::new("slow")
                .concurrency(3)
                .input_buffer_size(2),
            slow.clone(),
        )
        .unwrap();
    source
        .add_stage(StageOptions::new("store"), store.clone())
        .unwrap();

    timeout(TEST_TIMEOUT, source.run_until_drained())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(slow.total_calls(), 12);
    assert_eq!(store.total_calls(), 12);
    assert!(slow.max_running() <= 3);
    assert_eq!(store.max_running(), 1);
}

#[tokio::test]
async fn stage_error_cancels_manager() {
    setup_logging();

    let fetcher = MockFetcher::new();
    fetcher.push_events(vec![test_event("a")], "cursor-1");

    let manager = EventSourceManager::new(MemoryStore::new(), fetcher);
    let mut source = manager.create_source(test_config("invoices")).unwrap();
    source
        .add_stage(StageOptions::new("broken"), FailingStage)
        .unwrap();

    let result = timeout(TEST_TIMEOUT, source.run()).await.unwrap();
    assert_matches!(result, Err(PipelineError::Stage(name, _)) if name == "broken");

    assert!(manager.shutdown().is_cancelled());
    assert_matches!(manager.cause(), Some(PipelineError::Stage(name, _)) if name == "broken");

    // The event was not lost.
    let items = manager.storage().get_items(source.id(), 0).await.unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn upstream_error_is_fatal() {
    let fetcher = MockFetcher::new();
    fetcher.push_timeout();
    fetcher.push_error("connection reset");

    let manager = EventSourceManager::new(MemoryStore::new(), fetcher.clone());
    let mut source = manager.create_source(test_config("invoices")).unwrap();
    source
        .add_stage(StageOptions::new("store"), CountingStage::new())
        .unwrap();

    let result = timeout(TEST_TIMEOUT, source.run()).await.unwrap();
    assert_matches!(result, Err(PipelineError::Fetch(_)));
    assert_matches!(manager.cause(), Some(PipelineError::Fetch(_)));
    assert_eq!(fetcher.requests().len(), 2);
}

#[tokio::test]
async fn cancel_stops_source() {
    let manager = EventSourceManager::new(MemoryStore::new(), MockFetcher::new());
    let mut source = manager.create_source(test_config("invoices")).unwrap();
    source
        .add_stage(StageOptions::new("store"), CountingStage::new())
        .unwrap();

    let shutdown = manager.shutdown().clone();
    let handle = tokio::spawn(async move { source.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    assert_matches!(timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap(), Ok(()));
    assert!(manager.cause().is_none());
}

#[tokio::test]
async fn validation() {
    let manager = EventSourceManager::new(MemoryStore::new(), MockFetcher::new());

    assert_matches!(
        manager
            .create_source(SourceConfig::default().with_domain("billing"))
            .err(),
        Some(ValidationError::MissingSourceId)
    );
    assert_matches!(
        manager.create_source(SourceConfig::new("invoices")).err(),
        Some(ValidationError::MissingFilter)
    );

    let source = manager
        .create_source(
            SourceConfig::new("invoices")
                .with_address("0xabc")
                .with_long_poll_timeout(Duration::ZERO),
        )
        .unwrap();
    assert_eq!(source.config().long_poll_timeout, Duration::from_secs(60));

    let mut source = manager.create_source(test_config("invoices")).unwrap();
    assert_matches!(
        source.add_stage(StageOptions::new("store").concurrency(0), CountingStage::new()),
        Err(ValidationError::ZeroConcurrency(_))
    );
    assert_matches!(
        source.add_stage(
            StageOptions::new("store").input_buffer_size(0),
            CountingStage::new()
        ),
        Err(ValidationError::ZeroInputBufferSize(_))
    );

    // Running without any stage is a configuration error as well.
    assert_matches!(
        source.run().await,
        Err(PipelineError::Validation(ValidationError::NoStages))
    );
}

#[tokio::test]
async fn stats() {
    let manager = EventSourceManager::new(MemoryStore::new(), MockFetcher::new());
    let source = manager.create_source(test_config("invoices")).unwrap();

    for uid in ["a", "b", "c"] {
        manager
            .storage()
            .push(source.id(), &test_event(uid), None)
            .await
            .unwrap();
    }
    manager.storage().delete(source.id(), "a").await.unwrap();

    let stats = source.stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.last_index, 3);
}

#[tokio::test]
async fn crash_resume() {
    setup_logging();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline").join("events.sqlite");
    let path = path.to_str().unwrap().to_string();
    let config = SourceConfig::derived("billing", "", "invoice.created", 0)
        .with_poll_interval(Duration::from_millis(10));

    // Events were persisted but the process died before dispatching them.
    {
        let manager = ManagerBuilder::new()
            .storage_path(&path)
            .build(MockFetcher::new())
            .await
            .unwrap();
        let source = manager.create_source(config.clone()).unwrap();
        for uid in ["a", "b"] {
            manager
                .storage()
                .push(source.id(), &test_event(uid), None)
                .await
                .unwrap();
        }
        manager
            .storage()
            .update_cursor(source.id(), &Cursor::from("cursor-1"))
            .await
            .unwrap();
        manager.close().await.unwrap();
    }

    let fetcher = MockFetcher::new();
    let manager = ManagerBuilder::new()
        .storage_path(&path)
        .build(fetcher.clone())
        .await
        .unwrap();
    let mut source = manager.create_source(config).unwrap();
    assert_eq!(
        source.id(),
        &SourceId::derive("billing", "", "invoice.created", 0)
    );

    let pending = manager.storage().get_items(source.id(), 0).await.unwrap();
    assert_eq!(pending.len(), 2);

    let store = CountingStage::new();
    source
        .add_stage(StageOptions::new("store"), store.clone())
        .unwrap();
    timeout(TEST_TIMEOUT, source.run_until_drained())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(store.calls("a"), 1);
    assert_eq!(store.calls("b"), 1);
    assert!(
        manager
            .storage()
            .get_items(source.id(), 0)
            .await
            .unwrap()
            .is_empty()
    );

    // Upstream was asked to continue after the stored cursor.
    assert_eq!(fetcher.requests()[0].cursor, Some(Cursor::from("cursor-1")));

    manager.destroy().await.unwrap();
    assert!(!std::path::Path::new(&path).exists());
}

#[tokio::test]
async fn sources_share_storage() {
    let fetcher = MockFetcher::new();
    let manager = EventSourceManager::new(MemoryStore::new(), fetcher);

    let invoices = manager.create_source(test_config("invoices")).unwrap();
    let refunds = manager.create_source(test_config("refunds")).unwrap();

    manager
        .storage()
        .push(invoices.id(), &test_event("a"), None)
        .await
        .unwrap();

    assert_eq!(invoices.stats().await.unwrap().pending, 1);
    assert_eq!(refunds.stats().await.unwrap().pending, 0);
    assert!(
        manager
            .storage()
            .store()
            .get_items(refunds.id(), 0)
            .await
            .unwrap()
            .is_empty()
    );
}
