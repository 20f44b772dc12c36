use std::{collections::BTreeSet, sync::atomic::Ordering, time::Duration};

use icm_relayer::{
    constants::WARP_PRECOMPILE_ADDRESS,
    error::SubscriberError,
    message::WarpBlockInfo,
    subscriber::{Subscriber, chunk_range},
};

use crate::{
    blockchain_id,
    mocks::{MockSource, head, warp_log},
};

async fn drain(blocks: &mut tokio::sync::mpsc::Receiver<WarpBlockInfo>) -> Vec<WarpBlockInfo> {
    let mut drained = vec![];
    while let Some(block) = blocks.recv().await {
        drained.push(block);
    }
    drained
}

#[tokio::test(start_paused = true)]
async fn catchup_emits_every_height_exactly_once() {
    let source = MockSource::new(vec![
        warp_log(5, 1, b"second"),
        warp_log(5, 0, b"first"),
        warp_log(250, 3, b"middle"),
        warp_log(900, 0, b"out of range"),
    ]);
    source.failing_range_requests.store(2, Ordering::SeqCst);
    let (subscriber, mut outputs) =
        Subscriber::new(blockchain_id(), source.clone(), WARP_PRECOMPILE_ADDRESS);

    subscriber.process_from_height(1, 450).await.unwrap();
    drop(subscriber);
    let blocks = drain(&mut outputs.blocks).await;

    assert_eq!(blocks.len(), 450);
    let heights: BTreeSet<u64> = blocks.iter().map(|b| b.block_number).collect();
    assert_eq!(heights, (1..=450).collect());
    assert!(blocks.iter().all(|b| b.is_catchup));

    let block_5 = blocks.iter().find(|b| b.block_number == 5).unwrap();
    let payloads: Vec<&[u8]> = block_5
        .messages
        .iter()
        .map(|m| m.unsigned_message.as_ref())
        .collect();
    assert_eq!(payloads, vec![b"first".as_slice(), b"second".as_slice()]);
    let block_250 = blocks.iter().find(|b| b.block_number == 250).unwrap();
    assert_eq!(block_250.messages.len(), 1);
    assert_eq!(block_250.messages[0].log_index, 3);
    let with_messages = blocks.iter().filter(|b| !b.messages.is_empty()).count();
    assert_eq!(with_messages, 2);

    // One successful request per chunk, regardless of the failed attempts.
    let mut requests = source.range_requests.lock().clone();
    requests.sort();
    assert_eq!(requests, chunk_range(1, 450, 200));
    assert_eq!(requests, vec![(1, 200), (201, 400), (401, 450)]);
}

#[tokio::test(start_paused = true)]
async fn empty_range_is_a_no_op() {
    let source = MockSource::new(vec![]);
    let (subscriber, mut outputs) =
        Subscriber::new(blockchain_id(), source.clone(), WARP_PRECOMPILE_ADDRESS);

    subscriber.process_from_height(10, 9).await.unwrap();
    drop(subscriber);

    assert!(drain(&mut outputs.blocks).await.is_empty());
    assert!(source.range_requests.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn live_heads_are_converted_in_order() {
    let source = MockSource::new(vec![warp_log(11, 0, b"hello")]);
    let heads = source.add_subscription();
    let (mut subscriber, mut outputs) =
        Subscriber::new(blockchain_id(), source.clone(), WARP_PRECOMPILE_ADDRESS);
    subscriber.subscribe(Duration::from_secs(1)).await.unwrap();

    heads.send(head(10, false)).unwrap();
    heads.send(head(11, true)).unwrap();
    heads.send(head(12, true)).unwrap();

    let mut blocks = vec![];
    for _ in 0..3 {
        blocks.push(outputs.blocks.recv().await.unwrap());
    }
    let heights: Vec<u64> = blocks.iter().map(|b| b.block_number).collect();
    assert_eq!(heights, vec![10, 11, 12]);
    assert!(blocks.iter().all(|b| !b.is_catchup));
    assert!(blocks[0].messages.is_empty());
    assert_eq!(blocks[1].messages[0].unsigned_message.as_ref(), b"hello");
    // A bloom match with no logs is a false positive.
    assert!(blocks[2].messages.is_empty());

    // Blocks whose bloom cannot contain warp logs are never fetched.
    assert_eq!(source.block_requests.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn closed_subscription_is_reported_and_recoverable() {
    let source = MockSource::new(vec![]);
    let heads = source.add_subscription();
    let (mut subscriber, mut outputs) =
        Subscriber::new(blockchain_id(), source.clone(), WARP_PRECOMPILE_ADDRESS);
    subscriber.subscribe(Duration::from_secs(1)).await.unwrap();

    heads.send(head(1, false)).unwrap();
    drop(heads);
    assert_eq!(outputs.blocks.recv().await.unwrap().block_number, 1);
    outputs.subscription_errors.recv().await.unwrap();

    // With nothing to subscribe to, the attempt is retried until the timeout.
    let err = subscriber
        .subscribe(Duration::from_secs(3))
        .await
        .unwrap_err();
    assert!(matches!(err, SubscriberError::SubscribeExhausted { .. }));

    let heads = source.add_subscription();
    subscriber.subscribe(Duration::from_secs(3)).await.unwrap();
    heads.send(head(2, false)).unwrap();
    assert_eq!(outputs.blocks.recv().await.unwrap().block_number, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_conversion_is_fatal() {
    let source = MockSource::new(vec![warp_log(7, 0, b"lost")]);
    source.fail_block_requests.store(true, Ordering::SeqCst);
    let heads = source.add_subscription();
    let (mut subscriber, mut outputs) =
        Subscriber::new(blockchain_id(), source.clone(), WARP_PRECOMPILE_ADDRESS);
    subscriber.subscribe(Duration::from_secs(1)).await.unwrap();

    heads.send(head(7, true)).unwrap();
    let error = outputs.fatal_errors.recv().await.unwrap();
    assert!(matches!(error, SubscriberError::ConversionFailed { height: 7, .. }));
    assert!(source.block_requests.load(Ordering::SeqCst) > 1);
    assert!(outputs.blocks.try_recv().is_err());
}
