use std::{collections::BTreeMap, sync::Arc, time::Duration};

use icm_relayer::{
    constants::{RESUBSCRIBE_TIMEOUT, WARP_PRECOMPILE_ADDRESS},
    health::HealthTracker,
    listener::{Listener, ListenerState},
    message::WarpBlockInfo,
};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

use crate::{
    blockchain_id,
    mocks::{MockSource, head, warp_log},
};

/// Receive `count` blocks, keyed by height. Panics if a height is received twice.
async fn receive(
    blocks: &mut mpsc::Receiver<WarpBlockInfo>,
    count: usize,
) -> BTreeMap<u64, WarpBlockInfo> {
    let mut received = BTreeMap::new();
    for _ in 0..count {
        let block = blocks.recv().await.unwrap();
        let height = block.block_number;
        assert!(
            received.insert(height, block).is_none(),
            "height {height} received twice"
        );
    }
    received
}

#[tokio::test(start_paused = true)]
async fn catches_up_before_first_live_block() {
    let source = MockSource::new(vec![warp_log(3, 0, b"historical")]);
    let heads = source.add_subscription();
    let health = Arc::new(HealthTracker::new());
    let (sink, mut blocks) = mpsc::channel(64);
    let listener = Listener::new(
        blockchain_id(),
        source.clone(),
        WARP_PRECOMPILE_ADDRESS,
        Some(1),
        Duration::from_secs(5),
        sink,
        health.clone(),
    );
    let mut state = listener.state();
    let (shutdown_sender, shutdown) = watch::channel(false);
    let listener = tokio::spawn(listener.run(shutdown));

    heads.send(head(10, false)).unwrap();
    let received = receive(&mut blocks, 10).await;
    assert_eq!(received.keys().copied().collect::<Vec<_>>(), (1..=10).collect::<Vec<_>>());
    assert!(received.range(1..10).all(|(_, b)| b.is_catchup));
    assert!(!received[&10].is_catchup);
    assert_eq!(received[&3].messages.len(), 1);
    assert_eq!(source.range_requests.lock().clone(), vec![(1, 9)]);

    state.wait_for(|s| *s == ListenerState::Live).await.unwrap();
    assert!(health.is_healthy(blockchain_id()));

    // Consecutive live blocks need no catchup.
    heads.send(head(11, false)).unwrap();
    let received = receive(&mut blocks, 1).await;
    assert!(!received[&11].is_catchup);
    assert_eq!(source.range_requests.lock().len(), 1);

    shutdown_sender.send(true).unwrap();
    listener.await.unwrap().unwrap();
    assert_eq!(*state.borrow(), ListenerState::Terminal);
    assert!(!health.is_healthy(blockchain_id()));
}

#[tokio::test(start_paused = true)]
async fn without_start_height_only_live_blocks_are_relayed() {
    let source = MockSource::new(vec![]);
    let heads = source.add_subscription();
    let health = Arc::new(HealthTracker::new());
    let (sink, mut blocks) = mpsc::channel(64);
    let listener = Listener::new(
        blockchain_id(),
        source.clone(),
        WARP_PRECOMPILE_ADDRESS,
        None,
        Duration::from_secs(5),
        sink,
        health,
    );
    let (_shutdown_sender, shutdown) = watch::channel(false);
    tokio::spawn(listener.run(shutdown));

    heads.send(head(500, false)).unwrap();
    let received = receive(&mut blocks, 1).await;
    assert!(!received[&500].is_catchup);
    assert!(source.range_requests.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn resubscribes_and_fills_the_gap() {
    let source = MockSource::new(vec![warp_log(13, 0, b"missed")]);
    let first = source.add_subscription();
    let second = source.add_subscription();
    let health = Arc::new(HealthTracker::new());
    let (sink, mut blocks) = mpsc::channel(64);
    let listener = Listener::new(
        blockchain_id(),
        source.clone(),
        WARP_PRECOMPILE_ADDRESS,
        None,
        Duration::from_secs(5),
        sink,
        health.clone(),
    );
    let mut state = listener.state();
    let (_shutdown_sender, shutdown) = watch::channel(false);
    tokio::spawn(listener.run(shutdown));

    first.send(head(10, false)).unwrap();
    first.send(head(11, false)).unwrap();
    drop(first);
    second.send(head(15, true)).unwrap();

    let received = receive(&mut blocks, 6).await;
    assert_eq!(
        received.keys().copied().collect::<Vec<_>>(),
        vec![10, 11, 12, 13, 14, 15]
    );
    for (height, block) in &received {
        assert_eq!(block.is_catchup, (12..=14).contains(height), "height {height}");
    }
    assert_eq!(received[&13].messages.len(), 1);
    assert_eq!(source.range_requests.lock().clone(), vec![(12, 14)]);

    state.wait_for(|s| *s == ListenerState::Live).await.unwrap();
    assert!(health.is_healthy(blockchain_id()));
}

#[tokio::test(start_paused = true)]
async fn gives_up_when_resubscription_times_out() {
    let source = MockSource::new(vec![]);
    let heads = source.add_subscription();
    let health = Arc::new(HealthTracker::new());
    let (sink, mut blocks) = mpsc::channel(64);
    let listener = Listener::new(
        blockchain_id(),
        source.clone(),
        WARP_PRECOMPILE_ADDRESS,
        None,
        Duration::from_secs(5),
        sink,
        health.clone(),
    );
    let state = listener.state();
    let (_shutdown_sender, shutdown) = watch::channel(false);
    let listener = tokio::spawn(listener.run(shutdown));

    heads.send(head(1, false)).unwrap();
    drop(heads);
    assert_eq!(blocks.recv().await.unwrap().block_number, 1);

    let start = Instant::now();
    assert!(listener.await.unwrap().is_err());
    assert!(start.elapsed() >= RESUBSCRIBE_TIMEOUT - Duration::from_secs(1));
    assert_eq!(*state.borrow(), ListenerState::Terminal);
    assert!(!health.is_healthy(blockchain_id()));
    assert_eq!(health.unhealthy(), vec![blockchain_id()]);
}

#[tokio::test(start_paused = true)]
async fn initial_subscription_failure_is_fatal() {
    let source = MockSource::new(vec![]);
    let health = Arc::new(HealthTracker::new());
    let (sink, _blocks) = mpsc::channel(64);
    let listener = Listener::new(
        blockchain_id(),
        source,
        WARP_PRECOMPILE_ADDRESS,
        Some(1),
        Duration::from_secs(5),
        sink,
        health.clone(),
    );
    let (_shutdown_sender, shutdown) = watch::channel(false);

    assert!(listener.run(shutdown).await.is_err());
    assert!(!health.is_healthy(blockchain_id()));
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_resubscription() {
    let source = MockSource::new(vec![]);
    let heads = source.add_subscription();
    let health = Arc::new(HealthTracker::new());
    let (sink, mut blocks) = mpsc::channel(64);
    let listener = Listener::new(
        blockchain_id(),
        source.clone(),
        WARP_PRECOMPILE_ADDRESS,
        None,
        Duration::from_secs(5),
        sink,
        health.clone(),
    );
    let mut state = listener.state();
    let (shutdown_sender, shutdown) = watch::channel(false);
    let listener = tokio::spawn(listener.run(shutdown));

    heads.send(head(1, false)).unwrap();
    drop(heads);
    assert_eq!(blocks.recv().await.unwrap().block_number, 1);
    state
        .wait_for(|s| *s == ListenerState::Reconnecting)
        .await
        .unwrap();

    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(2)).await;
    shutdown_sender.send(true).unwrap();
    listener.await.unwrap().unwrap();
    assert!(start.elapsed() < RESUBSCRIBE_TIMEOUT);
    assert_eq!(*state.borrow(), ListenerState::Terminal);
    assert!(!health.is_healthy(blockchain_id()));
}
