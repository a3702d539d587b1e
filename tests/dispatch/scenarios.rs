use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{small_config, start_dispatcher, wait_until},
    mock_store::{add, delete, update, Failure, RecordingStore, TestItem},
};
use anyhow::Result;
use spillway::{DispatchError, OperationKind, StopMode, WriteErrorState};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn three_small_adds_are_written_in_one_batch() -> Result<()> {
    let store = RecordingStore::new();
    let config = small_config()
        .min_bytes_per_batch(250)
        .max_bytes_per_batch(1_000)
        .build()?;
    let dispatcher = start_dispatcher(config, store.factory());

    let items: Vec<_> = (1..=3).map(TestItem::new).collect();
    let operations = items.iter().map(|item| add(item, 100)).collect();
    dispatcher.dispatch(operations, false).await?;

    wait_until(WAIT, "three completed adds", || {
        items.iter().all(|item| item.completed() == 1)
    })
    .await?;
    dispatcher.stop(StopMode::Graceful).await;

    assert_eq!(store.attempt_count(), 1);
    assert_eq!(store.written(), vec![vec![1, 2, 3]]);
    Ok(())
}

#[tokio::test]
async fn delete_before_write_cancels_the_pending_add() -> Result<()> {
    let store = RecordingStore::new();
    let dispatcher = start_dispatcher(small_config().build()?, store.factory());

    let item = TestItem::new(7);
    dispatcher.dispatch(vec![add(&item, 50)], false).await?;
    item.begin_removal();
    dispatcher.dispatch(vec![delete(&item)], false).await?;

    assert_eq!(item.begun(), 2);
    assert_eq!(item.cancelled(), 2);
    assert_eq!(item.completed(), 0);

    dispatcher.stop(StopMode::Graceful).await;
    assert!(store
        .attempts()
        .iter()
        .all(|attempt| !attempt.items.contains(&7)));
    assert_eq!(dispatcher.telemetry().operations_cancelled, 2);
    Ok(())
}

#[tokio::test]
async fn transient_failures_recover_one_operation_at_a_time() -> Result<()> {
    let store = RecordingStore::failing([Failure::Transient, Failure::Transient]);
    let dispatcher = start_dispatcher(small_config().build()?, store.factory());
    store.observe(&dispatcher);
    assert!(dispatcher.is_healthy());

    let items: Vec<_> = (0..5).map(TestItem::new).collect();
    let operations = items.iter().map(|item| add(item, 100)).collect();
    dispatcher.dispatch(operations, false).await?;

    wait_until(WAIT, "all five items written", || {
        items.iter().all(|item| item.completed() == 1)
    })
    .await?;
    wait_until(WAIT, "dispatcher health restored", || dispatcher.is_healthy()).await?;

    let attempts = store.attempts();
    let sizes: Vec<usize> = attempts.iter().map(|attempt| attempt.items.len()).collect();
    assert_eq!(sizes, vec![5, 1, 1, 1, 1, 1, 1]);
    assert_eq!(
        store.written(),
        vec![vec![0], vec![1], vec![2], vec![3], vec![4]]
    );

    let observed: Vec<Option<bool>> = attempts.iter().map(|attempt| attempt.healthy).collect();
    assert_eq!(
        observed,
        vec![
            Some(true),
            Some(true),
            Some(false),
            Some(false),
            Some(false),
            Some(false),
            Some(false),
        ]
    );
    assert_eq!(dispatcher.worker_stats()[0].error_state, WriteErrorState::Healthy);
    assert_eq!(dispatcher.telemetry().write_failures, 2);

    dispatcher.stop(StopMode::Graceful).await;
    Ok(())
}

#[tokio::test]
async fn parked_dispatch_returns_once_promoted() -> Result<()> {
    let store = RecordingStore::new();
    let config = small_config()
        .min_bytes_per_batch(100)
        .max_dispatched_bytes_per_worker(300)
        .build()?;
    let dispatcher = start_dispatcher(config, store.factory());

    let first = TestItem::new(1);
    let second = TestItem::new(2);
    dispatcher.dispatch(vec![add(&first, 250)], false).await?;
    timeout(WAIT, dispatcher.dispatch(vec![add(&second, 100)], false))
        .await
        .expect("parked dispatch should be released")?;

    wait_until(WAIT, "both items written", || {
        first.completed() == 1 && second.completed() == 1
    })
    .await?;
    assert_eq!(store.written(), vec![vec![1], vec![2]]);

    dispatcher.stop(StopMode::Graceful).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn operations_for_one_item_stay_in_order_across_workers() -> Result<()> {
    let store = RecordingStore::new();
    let config = small_config().worker_count(4).build()?;
    let dispatcher = start_dispatcher(config, store.factory());

    let items: Vec<_> = (0..12).map(TestItem::new).collect();
    let adds = items.iter().map(|item| add(item, 100)).collect();
    dispatcher.dispatch(adds, false).await?;
    let updates = items.iter().map(|item| update(item, 100)).collect();
    dispatcher.dispatch(updates, false).await?;

    wait_until(WAIT, "adds and updates written", || {
        items.iter().all(|item| item.completed() == 2)
    })
    .await?;

    let written = store.written_ops();
    for item in &items {
        let kinds: Vec<OperationKind> = written
            .iter()
            .filter(|(id, _)| *id == item.id())
            .map(|(_, kind)| *kind)
            .collect();
        assert_eq!(
            kinds,
            vec![OperationKind::Add, OperationKind::Update],
            "item {} written out of order",
            item.id()
        );
    }
    assert_eq!(dispatcher.worker_stats().len(), 4);

    dispatcher.stop(StopMode::Graceful).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_all_complete() -> Result<()> {
    let store = RecordingStore::new();
    let config = small_config()
        .worker_count(3)
        .max_dispatched_bytes_per_worker(400)
        .build()?;
    let dispatcher = start_dispatcher(config, store.factory());

    let items: Vec<_> = (0..30).map(TestItem::new).collect();
    let mut callers = Vec::new();
    for chunk in items.chunks(5) {
        let dispatcher = Arc::clone(&dispatcher);
        let operations = chunk.iter().map(|item| add(item, 100)).collect();
        callers.push(tokio::spawn(async move {
            dispatcher.dispatch(operations, true).await
        }));
    }
    for caller in callers {
        timeout(WAIT, caller)
            .await
            .expect("caller should finish")
            .expect("caller should not panic")?;
    }

    wait_until(WAIT, "every item written", || {
        items.iter().all(|item| item.completed() == 1)
    })
    .await?;
    assert!(dispatcher
        .worker_stats()
        .iter()
        .all(|stats| stats.dispatched_bytes == 0 && stats.waiting == 0));

    dispatcher.stop(StopMode::Graceful).await;
    Ok(())
}

#[tokio::test]
async fn invariant_violation_leaves_the_rest_of_the_call_unbegun() -> Result<()> {
    let store = RecordingStore::new();
    store.hang();
    let dispatcher = start_dispatcher(small_config().build()?, store.factory());

    let removed = TestItem::new(3);
    let bystander = TestItem::new(4);
    dispatcher.dispatch(vec![update(&removed, 100)], false).await?;
    wait_until(WAIT, "update in flight", || store.executing() == 1).await?;
    dispatcher.dispatch(vec![add(&removed, 10)], false).await?;
    removed.begin_removal();

    let err = dispatcher
        .dispatch(vec![delete(&removed), add(&bystander, 10)], false)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvariantViolation(_)));
    assert_eq!(removed.begun(), 3);
    assert_eq!(removed.cancelled(), 1);
    assert_eq!(bystander.begun(), 0);

    dispatcher.stop(StopMode::Immediate).await;
    Ok(())
}
