//! Integration Tests for Sync Module
//!
//! End-to-end flows across queue, network detector, remote store and engine:
//! - Priority-ordered processing
//! - Duplicate inserts settled without retry
//! - Network loss during a run
//! - Duplicate events from different sources
//! - Run reentrancy, pause/resume and stop

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::conflict::{ConflictResolver, ConflictResolverConfig};
    use crate::models::{DataSource, EVENTS_TABLE};
    use crate::network::{ConnectivityReport, NetworkDetector};
    use crate::queue::{
        OperationType, Priority, ProcessingResult, QueueFilter, QueueManager, QueueManagerConfig, QueueStatus,
    };
    use crate::remote::{MemoryRemoteStore, RemoteError, RemoteOp};
    use crate::test_support::{event_at, memory_storage, sample_event};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Harness {
        remote: Arc<MemoryRemoteStore>,
        network: NetworkDetector,
        queue: QueueManager,
        engine: SyncEngine,
    }

    fn harness(queue_config: QueueManagerConfig, engine_config: SyncEngineConfig) -> Harness {
        let remote = Arc::new(MemoryRemoteStore::new());
        let network = NetworkDetector::default();
        network.update(ConnectivityReport::wifi(Some(80)));

        let queue = QueueManager::new(memory_storage(), network.clone(), queue_config);
        let dispatcher = RemoteDispatcher::new(remote.clone());
        for op in OperationType::ALL {
            queue.register_processing_callback(op, Arc::new(dispatcher.clone()));
        }
        let resolver = Arc::new(ConflictResolver::new(remote.clone(), ConflictResolverConfig::default()));
        let engine = SyncEngine::new(queue.clone(), resolver, dispatcher, engine_config);

        Harness {
            remote,
            network,
            queue,
            engine,
        }
    }

    fn manual_queue() -> QueueManagerConfig {
        QueueManagerConfig {
            auto_process_on_enqueue: false,
            ..Default::default()
        }
    }

    /// Two items per batch, one batch at a time
    fn stepwise_engine() -> SyncEngineConfig {
        SyncEngineConfig {
            batch_size: 2,
            max_concurrent_batches: 1,
            inter_batch_delay_ms: 0,
            progress_callback_interval_ms: 0,
            network_retry_delay_ms: 1,
            ..Default::default()
        }
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn next_matching(events: &mut broadcast::Receiver<SyncEvent>, wanted: &SyncEvent) {
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if &event == wanted => return true,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await;
        assert_eq!(found, Ok(true), "expected {:?}", wanted);
    }

    // ========================================================================
    // Queue processing
    // ========================================================================

    #[tokio::test]
    async fn test_processing_follows_priority_order() {
        let h = harness(
            QueueManagerConfig {
                max_processing_concurrency: 1,
                ..manual_queue()
            },
            stepwise_engine(),
        );

        let order = Arc::new(StdMutex::new(Vec::new()));
        let seen = order.clone();
        h.queue.register_fn(OperationType::CreateEvent, move |item| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(item.priority);
                ProcessingResult::success()
            }
        });

        for priority in [Priority::Low, Priority::High, Priority::Normal] {
            h.queue.enqueue_event(sample_event("user-1"), priority).await.unwrap();
        }

        let result = h.queue.start_processing().await.unwrap();
        assert_eq!(result.successful, 3);
        assert_eq!(
            *order.lock().unwrap(),
            vec![Priority::High, Priority::Normal, Priority::Low]
        );
        assert_eq!(h.queue.get_stats().await.unwrap().queue_depth, 0);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_not_retried() {
        let h = harness(manual_queue(), stepwise_engine());
        let id = h.queue.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        h.remote.fail_next(
            RemoteOp::Insert,
            RemoteError::ConstraintViolation("events_pkey".into()),
        );

        let result = h.queue.start_processing().await.unwrap();
        assert_eq!(result.total_items, 1);
        let outcome = &result.results[0].result;
        assert!(!outcome.retry_recommended);
        assert!(outcome.conflict);

        assert!(h.queue.storage().retrieve(&id).await.unwrap().is_none());
        assert!(h.queue.storage().dead_letters(10).await.unwrap().is_empty());
        assert_eq!(h.remote.call_count(Some(RemoteOp::Insert)), 1);

        // Nothing left for a later run either
        let rerun = h.queue.start_processing().await.unwrap();
        assert_eq!(rerun.total_items, 0);
        assert_eq!(h.remote.call_count(Some(RemoteOp::Insert)), 1);
    }

    #[tokio::test]
    async fn test_engine_counts_duplicates_separately() {
        let h = harness(manual_queue(), stepwise_engine());
        let event = sample_event("user-1");
        h.remote
            .seed(EVENTS_TABLE, serde_json::to_value(&event).unwrap())
            .unwrap();
        h.queue.enqueue_event(event, Priority::Normal).await.unwrap();
        h.queue.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();

        let result = h.engine.start_sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.total_processed, 1);
        assert_eq!(result.duplicates_skipped, 1);
        assert_eq!(result.total_failed, 0);
        assert_eq!(h.remote.call_count(Some(RemoteOp::Insert)), 2);
    }

    // ========================================================================
    // Network-reactive runs
    // ========================================================================

    #[tokio::test]
    async fn test_network_loss_pauses_run_until_reconnect() {
        let h = harness(manual_queue(), stepwise_engine());
        for _ in 0..8 {
            h.queue.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        }
        h.remote.set_latency(Duration::from_millis(100));
        let mut events = h.engine.subscribe();

        let engine = h.engine.clone();
        let run = tokio::spawn(async move { engine.start_sync().await });

        let remote = h.remote.clone();
        wait_until("first insert", || remote.call_count(Some(RemoteOp::Insert)) > 0).await;
        h.network.update(ConnectivityReport::disconnected());

        next_matching(&mut events, &SyncEvent::Paused { auto: true }).await;
        assert_eq!(h.engine.state(), SyncState::Paused);
        h.queue.wait_for_idle().await;

        let calls_while_offline = h.remote.call_count(None);
        assert_eq!(calls_while_offline, 2, "only the in-flight batch reached the remote");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.remote.call_count(None), calls_while_offline);
        assert!(h.engine.is_syncing());

        h.network.update(ConnectivityReport::wifi(Some(80)));
        next_matching(&mut events, &SyncEvent::Resumed { auto: true }).await;

        let result = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.total_processed, 8);
        assert!(result.success);
        assert_eq!(h.remote.rows(EVENTS_TABLE).len(), 8);
    }

    #[tokio::test]
    async fn test_network_loss_hands_back_undispatched_items() {
        // One batch of six, dispatched one at a time
        let h = harness(
            manual_queue(),
            SyncEngineConfig {
                batch_size: 6,
                max_concurrent_items: 1,
                ..stepwise_engine()
            },
        );
        for _ in 0..6 {
            h.queue.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        }
        h.remote.set_latency(Duration::from_millis(50));
        let mut events = h.engine.subscribe();

        let engine = h.engine.clone();
        let run = tokio::spawn(async move { engine.start_sync().await });

        let remote = h.remote.clone();
        wait_until("first insert", || remote.call_count(Some(RemoteOp::Insert)) > 0).await;
        h.network.update(ConnectivityReport::disconnected());

        next_matching(&mut events, &SyncEvent::Paused { auto: true }).await;
        h.queue.wait_for_idle().await;

        assert_eq!(h.remote.call_count(Some(RemoteOp::Insert)), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.remote.call_count(Some(RemoteOp::Insert)), 1);

        let pending = h.queue.storage().retrieve_many(QueueFilter::pending(), 10).await.unwrap();
        assert_eq!(pending.len(), 5);
        for item in &pending {
            assert_eq!(item.status, QueueStatus::Pending);
            assert_eq!(item.metadata.retry_count, 0);
        }

        h.network.update(ConnectivityReport::wifi(Some(80)));
        next_matching(&mut events, &SyncEvent::Resumed { auto: true }).await;

        let result = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.success);
        assert_eq!(result.total_processed, 6);
        assert_eq!(result.total_failed, 0);
        assert_eq!(h.remote.rows(EVENTS_TABLE).len(), 6);
    }

    #[tokio::test]
    async fn test_offline_start_ends_run() {
        let h = harness(manual_queue(), stepwise_engine());
        for _ in 0..3 {
            h.queue.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        }
        h.network.update(ConnectivityReport::disconnected());

        let result = tokio::time::timeout(Duration::from_secs(3), h.engine.start_sync())
            .await
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert!(result.interrupted);
        assert_eq!(result.total_processed, 0);
        assert_eq!(h.engine.state(), SyncState::Idle);
        assert_eq!(h.remote.call_count(None), 0);
        assert_eq!(h.queue.get_stats().await.unwrap().queue_depth, 3);

        // A later run picks everything up once online
        h.network.update(ConnectivityReport::wifi(Some(80)));
        let rerun = h.engine.start_sync().await.unwrap();
        assert!(rerun.success);
        assert_eq!(rerun.total_processed, 3);
    }

    // ========================================================================
    // Conflict resolution
    // ========================================================================

    #[tokio::test]
    async fn test_cross_source_duplicate_keeps_carrier_record() {
        let h = harness(manual_queue(), stepwise_engine());
        let base = chrono::Utc::now();
        let carrier = event_at("user-1", DataSource::Carrier, base);
        let manual = event_at("user-1", DataSource::Manual, base + chrono::Duration::milliseconds(500));

        h.remote
            .seed(EVENTS_TABLE, serde_json::to_value(&carrier).unwrap())
            .unwrap();
        h.queue.enqueue_event(manual.clone(), Priority::Normal).await.unwrap();

        let result = h.engine.start_sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.total_processed, 1);
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.auto_resolved, 1);
        assert_eq!(result.manual_review_required, 0);

        assert!(h.remote.get(EVENTS_TABLE, &carrier.id).is_some());
        assert!(h.remote.get(EVENTS_TABLE, &manual.id).is_none());
    }

    // ========================================================================
    // Run control
    // ========================================================================

    #[tokio::test]
    async fn test_second_start_is_rejected_without_touching_progress() {
        let h = harness(manual_queue(), stepwise_engine());
        for _ in 0..4 {
            h.queue.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        }
        h.remote.set_latency(Duration::from_millis(150));

        let engine = h.engine.clone();
        let run = tokio::spawn(async move { engine.start_sync().await });
        let remote = h.remote.clone();
        wait_until("first insert", || remote.call_count(Some(RemoteOp::Insert)) > 0).await;

        let before = h.engine.get_progress();
        let second = h.engine.start_sync().await;
        assert!(matches!(second, Err(SyncError::AlreadySyncing)));

        let after = h.engine.get_progress();
        assert_eq!(after.started_at, before.started_at);
        assert_eq!(after.total_items, 4);
        assert!(h.engine.is_syncing());

        let result = run.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.total_processed, 4);
    }

    #[tokio::test]
    async fn test_manual_pause_and_resume() {
        let h = harness(manual_queue(), stepwise_engine());
        for _ in 0..6 {
            h.queue.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        }
        h.remote.set_latency(Duration::from_millis(50));
        let mut events = h.engine.subscribe();

        let engine = h.engine.clone();
        let run = tokio::spawn(async move { engine.start_sync().await });
        let remote = h.remote.clone();
        wait_until("first insert", || remote.call_count(Some(RemoteOp::Insert)) > 0).await;

        h.engine.pause_sync().await.unwrap();
        assert_eq!(h.engine.state(), SyncState::Paused);
        let inserts = h.remote.call_count(Some(RemoteOp::Insert));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.remote.call_count(Some(RemoteOp::Insert)), inserts);

        h.engine.resume_sync().unwrap();
        let result = run.await.unwrap().unwrap();
        assert_eq!(result.total_processed, 6);
        assert!(result.success);

        next_matching(&mut events, &SyncEvent::Paused { auto: false }).await;
        next_matching(&mut events, &SyncEvent::Resumed { auto: false }).await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_batch() {
        let h = harness(manual_queue(), stepwise_engine());
        for _ in 0..6 {
            h.queue.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        }
        h.remote.set_latency(Duration::from_millis(100));
        let mut events = h.engine.subscribe();

        let engine = h.engine.clone();
        let run = tokio::spawn(async move { engine.start_sync().await });
        let remote = h.remote.clone();
        wait_until("first insert", || remote.call_count(Some(RemoteOp::Insert)) > 0).await;

        h.engine.stop_sync().await;
        assert_eq!(h.queue.in_flight_count(), 0);

        let result = run.await.unwrap().unwrap();
        assert!(!result.success);
        assert!(result.interrupted);
        assert_eq!(result.total_processed, 2);
        assert_eq!(h.queue.get_stats().await.unwrap().queue_depth, 4);
        next_matching(&mut events, &SyncEvent::Stopped).await;

        // A new run picks up the rest
        let rest = h.engine.start_sync().await.unwrap();
        assert_eq!(rest.total_processed, 4);
        assert!(rest.success);
    }
}
