use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{init_tracing, small_config, start_dispatcher, wait_until},
    mock_store::{add, RecordingStore, TestItem},
};
use anyhow::Result;
use spillway::{DispatchError, DispatcherPhase, SpillDispatcher, StopMode};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn stop_is_idempotent() -> Result<()> {
    let store = RecordingStore::new();
    let dispatcher = start_dispatcher(small_config().worker_count(2).build()?, store.factory());

    dispatcher.stop(StopMode::Graceful).await;
    dispatcher.stop(StopMode::Graceful).await;
    dispatcher.stop(StopMode::Immediate).await;

    assert_eq!(dispatcher.health().phase(), DispatcherPhase::Stopped);
    assert_eq!(
        dispatcher.to_string(),
        "SpillDispatcher (STOP REQUESTED) (STOPPED)"
    );
    Ok(())
}

#[tokio::test]
async fn dispatch_outside_running_phase_is_refused() -> Result<()> {
    init_tracing();
    let store = RecordingStore::new();
    let item = TestItem::new(1);
    let dispatcher = Arc::new(SpillDispatcher::new(small_config().build()?, store.factory()));

    let err = dispatcher
        .dispatch(vec![add(&item, 100)], false)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotRunning));

    dispatcher.start()?;
    dispatcher.stop(StopMode::Graceful).await;

    let err = dispatcher
        .dispatch(vec![add(&item, 100)], false)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotRunning));
    assert_eq!(item.begun(), 0);
    Ok(())
}

#[tokio::test]
async fn stop_before_start_goes_straight_to_stopped() -> Result<()> {
    init_tracing();
    let store = RecordingStore::new();
    let dispatcher = SpillDispatcher::new(small_config().build()?, store.factory());

    dispatcher.stop(StopMode::Graceful).await;
    assert_eq!(dispatcher.health().phase(), DispatcherPhase::Stopped);

    let err = dispatcher.start().unwrap_err();
    assert!(matches!(err, DispatchError::InvariantViolation(_)));
    Ok(())
}

#[tokio::test]
async fn starting_twice_is_rejected() -> Result<()> {
    let store = RecordingStore::new();
    let dispatcher = start_dispatcher(small_config().build()?, store.factory());

    assert!(dispatcher.start().is_err());
    assert_eq!(dispatcher.health().phase(), DispatcherPhase::Running);

    dispatcher.stop(StopMode::Graceful).await;
    Ok(())
}

#[tokio::test]
async fn stop_releases_a_parked_rejectable_dispatch() -> Result<()> {
    let store = RecordingStore::new();
    store.hang();
    let config = small_config().max_dispatched_bytes_per_worker(300).build()?;
    let dispatcher = start_dispatcher(config, store.factory());

    let first = TestItem::new(1);
    let second = TestItem::new(2);
    dispatcher.dispatch(vec![add(&first, 250)], false).await?;

    let parked = {
        let dispatcher = dispatcher.clone();
        let second = second.clone();
        tokio::spawn(async move { dispatcher.dispatch(vec![add(&second, 100)], true).await })
    };
    wait_until(WAIT, "second dispatch parked", || {
        dispatcher.worker_stats()[0].waiting == 1
    })
    .await?;

    dispatcher.stop(StopMode::Graceful).await;

    timeout(WAIT, parked)
        .await??
        .expect("discarded dispatch returns normally even when it could be rejected");
    assert_eq!(second.completed(), 0);
    assert_eq!(second.cancelled(), 0);
    assert_eq!(dispatcher.worker_stats()[0].waiting, 0);
    Ok(())
}

#[tokio::test]
async fn stop_releases_a_parked_dispatch_that_cannot_be_rejected() -> Result<()> {
    let store = RecordingStore::new();
    store.hang();
    let config = small_config().max_dispatched_bytes_per_worker(300).build()?;
    let dispatcher = start_dispatcher(config, store.factory());

    let first = TestItem::new(1);
    let second = TestItem::new(2);
    dispatcher.dispatch(vec![add(&first, 250)], false).await?;

    let parked = {
        let dispatcher = dispatcher.clone();
        let second = second.clone();
        tokio::spawn(async move { dispatcher.dispatch(vec![add(&second, 100)], false).await })
    };
    wait_until(WAIT, "second dispatch parked", || {
        dispatcher.worker_stats()[0].waiting == 1
    })
    .await?;

    dispatcher.stop(StopMode::Immediate).await;

    timeout(WAIT, parked).await??.expect("non-rejectable dispatch is released");
    assert_eq!(second.completed(), 0);
    Ok(())
}

#[tokio::test]
async fn graceful_stop_aborts_workers_past_the_deadline() -> Result<()> {
    let store = RecordingStore::new();
    store.hang();
    let config = small_config()
        .worker_count(2)
        .stop_timeout(Duration::from_millis(50))
        .build()?;
    let dispatcher = start_dispatcher(config, store.factory());

    let item = TestItem::new(0);
    dispatcher.dispatch(vec![add(&item, 100)], false).await?;
    wait_until(WAIT, "write in flight", || store.executing() == 1).await?;

    timeout(WAIT, dispatcher.stop(StopMode::Graceful))
        .await
        .expect("stop honours its deadline");

    wait_until(WAIT, "dispatcher stopped", || {
        dispatcher.health().phase() == DispatcherPhase::Stopped
    })
    .await?;
    assert_eq!(item.completed(), 0);
    assert!(dispatcher.fatal_error().is_none());
    Ok(())
}

#[tokio::test]
async fn immediate_stop_reaches_stopped() -> Result<()> {
    let store = RecordingStore::new();
    let dispatcher = start_dispatcher(small_config().worker_count(3).build()?, store.factory());

    let items: Vec<_> = (0..6).map(TestItem::new).collect();
    let operations = items.iter().map(|item| add(item, 100)).collect();
    dispatcher.dispatch(operations, false).await?;

    dispatcher.stop(StopMode::Immediate).await;

    wait_until(WAIT, "dispatcher stopped", || {
        dispatcher.health().phase() == DispatcherPhase::Stopped
    })
    .await?;
    assert!(!dispatcher.health().running());
    assert!(dispatcher.fatal_error().is_none());
    Ok(())
}

#[tokio::test]
async fn stop_leaves_the_host_token_alone() -> Result<()> {
    init_tracing();
    let store = RecordingStore::new();
    let shutdown = tokio_util::sync::CancellationToken::new();
    let dispatcher = SpillDispatcher::with_shutdown_token(
        small_config().worker_count(2).build()?,
        store.factory(),
        shutdown.clone(),
    );
    dispatcher.start()?;
    dispatcher.stop(StopMode::Graceful).await;

    assert!(!shutdown.is_cancelled());
    assert_eq!(dispatcher.health().phase(), DispatcherPhase::Stopped);
    Ok(())
}
