use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy::{
    primitives::{Address, B256, Bytes, address},
    signers::local::PrivateKeySigner,
};
use futures::future::join_all;
use icm_relayer::{
    constants::{RPC_MARGIN, SIGNER_CAPACITY},
    destination::{DestinationClient, DestinationSettings, fees::FeeConfig},
    error::SendTxError,
    health::HealthTracker,
    validators::PChainHeight,
};
use tokio::time::Instant;

use crate::{
    blockchain_id,
    mocks::{GWEI, MockDestination},
};

fn key(n: u8) -> PrivateKeySigner {
    PrivateKeySigner::from_bytes(&B256::repeat_byte(n)).unwrap()
}

fn settings(tx_inclusion_timeout: Duration) -> DestinationSettings {
    DestinationSettings {
        fees: FeeConfig {
            max_base_fee: None,
            suggested_priority_fee_buffer: GWEI,
            max_priority_fee: 10 * GWEI,
        },
        tx_inclusion_timeout,
    }
}

async fn client(
    rpc: &Arc<MockDestination>,
    keys: Vec<PrivateKeySigner>,
    tx_inclusion_timeout: Duration,
) -> DestinationClient {
    DestinationClient::new(
        blockchain_id(),
        rpc.clone(),
        keys,
        settings(tx_inclusion_timeout),
        None,
        Arc::new(HealthTracker::new()),
    )
    .await
    .unwrap()
}

const TO: Address = address!("2222222222222222222222222222222222222222");

#[tokio::test(start_paused = true)]
async fn nonces_are_sequential_with_out_of_order_receipts() {
    let signer = key(1);
    let rpc = MockDestination::new(
        HashMap::from([(signer.address(), 5)]),
        Some(Duration::from_secs(1)),
    );
    let client = client(&rpc, vec![signer], Duration::from_secs(30)).await;

    let message = [0x42; 100];
    let receipts = join_all(
        (0..6).map(|_| client.send_tx(&message, None, TO, 200_000, Bytes::from_static(b"call"))),
    )
    .await;

    let receipts: Vec<_> = receipts.into_iter().map(Result::unwrap).collect();
    assert!(receipts.iter().all(|r| r.success));
    let hashes: HashSet<_> = receipts.iter().map(|r| r.tx_hash).collect();
    assert_eq!(hashes.len(), 6);

    assert_eq!(rpc.nonces(), (5..11).collect::<Vec<_>>());
    let submitted = rpc.submitted.lock().clone();
    for tx in &submitted {
        // 100 bytes plus the delimiter, padded to four words.
        assert_eq!(tx.predicate_keys, 4);
        assert_eq!(tx.max_priority_fee_per_gas, 2 * GWEI);
        assert_eq!(tx.max_fee_per_gas, 77 * GWEI);
    }
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn receipt_timeout_releases_capacity() {
    let rpc = MockDestination::new(HashMap::new(), None);
    let tx_inclusion_timeout = Duration::from_secs(10);
    let client = client(&rpc, vec![key(1)], tx_inclusion_timeout).await;

    let start = Instant::now();
    let err = client
        .send_tx(&[1; 10], None, TO, 100_000, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SendTxError::ReceiptTimeout { .. }), "{err}");
    assert!(start.elapsed() <= tx_inclusion_timeout + RPC_MARGIN);
    assert_eq!(client.in_flight(), 0);

    // The nonce was consumed by the submitted transaction.
    let err = client
        .send_tx(&[1; 10], None, TO, 100_000, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SendTxError::ReceiptTimeout { .. }));
    assert_eq!(rpc.nonces(), vec![0, 1]);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_submission_reuses_nonce() {
    let signer = key(1);
    let rpc = MockDestination::new(
        HashMap::from([(signer.address(), 3)]),
        Some(Duration::from_millis(100)),
    );
    rpc.failing_submissions.store(1, Ordering::SeqCst);
    let client = client(&rpc, vec![signer], Duration::from_secs(30)).await;

    let err = client
        .send_tx(&[1; 10], None, TO, 100_000, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SendTxError::Submit { nonce: 3, .. }), "{err}");
    assert_eq!(client.in_flight(), 0);

    client
        .send_tx(&[1; 10], None, TO, 100_000, Bytes::new())
        .await
        .unwrap();
    assert_eq!(rpc.nonces(), vec![3]);
}

#[tokio::test(start_paused = true)]
async fn only_allowed_signers_are_used() {
    let (first, second) = (key(1), key(2));
    let (first_address, second_address) = (first.address(), second.address());
    // Distinct nonce ranges identify which signer sent each transaction.
    let rpc = MockDestination::new(
        HashMap::from([(first_address, 0), (second_address, 100)]),
        Some(Duration::from_millis(100)),
    );
    let client = client(&rpc, vec![first, second], Duration::from_secs(30)).await;
    assert_eq!(client.signer_addresses(), vec![first_address, second_address]);

    let allowed = HashSet::from([second_address]);
    for _ in 0..3 {
        client
            .send_tx(&[1; 10], Some(&allowed), TO, 100_000, Bytes::new())
            .await
            .unwrap();
    }
    assert_eq!(rpc.nonces(), vec![100, 101, 102]);

    let unknown = HashSet::from([Address::repeat_byte(0x99)]);
    let err = client
        .send_tx(&[1; 10], Some(&unknown), TO, 100_000, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SendTxError::NoEligibleSigner));
    assert_eq!(rpc.nonces().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn signing_height_defaults_to_current() {
    let rpc = MockDestination::new(HashMap::new(), None);
    let client = client(&rpc, vec![key(1)], Duration::from_secs(30)).await;
    assert_eq!(
        client.p_chain_height_for_signing().await.unwrap(),
        PChainHeight::Current
    );
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_transactions_are_bounded_by_capacity() {
    let rpc = MockDestination::new(HashMap::new(), Some(Duration::from_secs(1)));
    rpc.receipts_held.store(true, Ordering::SeqCst);
    let client = Arc::new(client(&rpc, vec![key(1)], Duration::from_secs(60)).await);

    let peak = Arc::new(AtomicUsize::new(0));
    let sampler = tokio::spawn({
        let (client, peak) = (client.clone(), peak.clone());
        async move {
            loop {
                peak.fetch_max(client.in_flight(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    });

    let sends: Vec<_> = (0..20)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_tx(&[1; 10], None, TO, 100_000, Bytes::new())
                    .await
            })
        })
        .collect();

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rpc.nonces().len(), SIGNER_CAPACITY);
        assert_eq!(client.in_flight(), SIGNER_CAPACITY);
    }

    rpc.receipts_held.store(false, Ordering::SeqCst);
    let released = Instant::now();
    for send in sends {
        assert!(send.await.unwrap().unwrap().success);
    }
    sampler.abort();

    assert_eq!(rpc.nonces(), (0..20).collect::<Vec<_>>());
    let submitted = rpc.submitted.lock().clone();
    assert!(
        submitted[SIGNER_CAPACITY..]
            .iter()
            .all(|tx| tx.submitted_at >= released)
    );
    assert_eq!(peak.load(Ordering::SeqCst), SIGNER_CAPACITY);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn waiting_for_a_free_slot_does_not_count_against_the_caller() {
    let rpc = MockDestination::new(HashMap::new(), Some(Duration::from_secs(20)));
    rpc.never_include.store(true, Ordering::SeqCst);
    let tx_inclusion_timeout = Duration::from_secs(30);
    let client = Arc::new(client(&rpc, vec![key(1)], tx_inclusion_timeout).await);

    let stuck: Vec<_> = (0..SIGNER_CAPACITY)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_tx(&[1; 10], None, TO, 100_000, Bytes::new())
                    .await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(rpc.nonces().len(), SIGNER_CAPACITY);

    // Included 20 seconds after it is submitted, which happens once the first slot frees up.
    rpc.never_include.store(false, Ordering::SeqCst);
    let start = Instant::now();
    let receipt = client
        .send_tx(&[1; 10], None, TO, 100_000, Bytes::new())
        .await
        .unwrap();

    let last = rpc.submitted.lock()[SIGNER_CAPACITY].clone();
    assert_eq!(receipt.tx_hash, last.hash);
    assert!(last.submitted_at >= start + tx_inclusion_timeout - Duration::from_secs(1));
    assert!(start.elapsed() > tx_inclusion_timeout + RPC_MARGIN);

    for send in stuck {
        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err, SendTxError::ReceiptTimeout { .. }), "{err}");
    }
    assert_eq!(rpc.nonces().len(), SIGNER_CAPACITY + 1);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn crashed_signer_marks_destination_unhealthy() {
    let rpc = MockDestination::new(HashMap::new(), Some(Duration::from_millis(100)));
    let health = Arc::new(HealthTracker::new());
    let client = DestinationClient::new(
        blockchain_id(),
        rpc.clone(),
        vec![key(1)],
        settings(Duration::from_secs(30)),
        None,
        health.clone(),
    )
    .await
    .unwrap();
    assert!(health.is_healthy(blockchain_id()));

    client
        .send_tx(&[1; 10], None, TO, 100_000, Bytes::new())
        .await
        .unwrap();
    assert!(health.is_healthy(blockchain_id()));

    rpc.crash_on_submit.store(true, Ordering::SeqCst);
    let err = client
        .send_tx(&[1; 10], None, TO, 100_000, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SendTxError::ResultDropped { .. }), "{err}");
    assert!(!health.is_healthy(blockchain_id()));

    let err = client
        .send_tx(&[1; 10], None, TO, 100_000, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SendTxError::SignerClosed), "{err}");
    assert_eq!(health.unhealthy(), vec![blockchain_id()]);
}
