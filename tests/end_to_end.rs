//! End-to-end scenarios from the specification's §8 "Concrete end-to-end
//! scenarios", driven through the public crate API rather than any single
//! module's internals.

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bson::doc;
use rand::RngCore;
use tokio_util::sync::CancellationToken;

use jarvist_sync_agent::broker::FakeBrokerClient;
use jarvist_sync_agent::ingest::{IdentityDefaults, IngestPipeline};
use jarvist_sync_agent::ledger::SqliteLedger;
use jarvist_sync_agent::{PublishQueue, Repository};

const KEY: [u8; 32] = [11u8; 32];

fn seal(plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new_from_slice(&KEY).unwrap();
    let mut nonce_bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext).unwrap();
    [nonce_bytes.to_vec(), ciphertext].concat()
}

async fn write_record(spool: &std::path::Path, folder: &str, filename: &str, in_count: i32, out_count: i32) {
    let dir = spool.join(folder);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let document = doc! {
        "id": format!("{folder}-{filename}"),
        "device_id": "dev-1",
        "in_count": in_count,
        "out_count": out_count,
    };
    let plaintext = bson::to_vec(&document).unwrap();
    tokio::fs::write(dir.join(filename), seal(&plaintext)).await.unwrap();
}

fn identity() -> IdentityDefaults {
    IdentityDefaults {
        tenant_id: "tenant-1".to_string(),
        site_id: "site-1".to_string(),
        client_id: "agent-1".to_string(),
    }
}

async fn wait_until_published_len(broker: &FakeBrokerClient, expected: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if broker.published().len() >= expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    broker.published().len() >= expected
}

async fn wait_until_pending_count(ledger: &dyn Repository, expected: i64, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let count = ledger.count_pending().await.unwrap_or(-1);
        if count == expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return count == expected;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Scenario 1 (§8 "Happy path"): a single valid record file is discovered,
/// decoded, recorded, and delivered while the broker is reachable.
#[tokio::test]
async fn happy_path_file_is_processed_and_delivered() {
    let spool = tempfile::tempdir().unwrap();
    write_record(spool.path(), "20240115", "evt1.json.bson", 3, 2).await;

    let ledger: Arc<dyn Repository> = Arc::new(SqliteLedger::open_in_memory().await.unwrap());
    let broker = Arc::new(FakeBrokerClient::new(true));
    let shutdown = CancellationToken::new();
    let queue = PublishQueue::new(
        ledger.clone(),
        broker.clone(),
        "jarvist".to_string(),
        "agent-1".to_string(),
        shutdown.clone(),
    );
    queue.spawn_workers();

    let pipeline = IngestPipeline::new(
        spool.path().to_path_buf(),
        KEY,
        ledger.clone(),
        queue.clone(),
        shutdown.clone(),
        Duration::from_secs(3600),
        identity(),
    );
    pipeline.spawn().await.unwrap();

    let delivered = wait_until_published_len(&broker, 1, Duration::from_secs(5)).await;
    assert!(delivered, "message should have been delivered within 5s");

    assert!(ledger
        .is_file_processed("20240115", "20240115/evt1.json.bson")
        .await
        .unwrap());

    let (topic, payload) = broker.published().into_iter().next().unwrap();
    assert_eq!(topic, "jarvist/data/20240115");
    let envelope: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(envelope["data"]["in_count"], 3);
    assert_eq!(envelope["data"]["out_count"], 2);
    assert_eq!(envelope["tenant_id"], "tenant-1");
    assert_eq!(envelope["site_id"], "site-1");

    queue.shutdown().await;
}

/// Scenario 2 (§8 "Broker outage"): files are ingested and recorded while
/// the broker is down, then delivered once it becomes reachable, with no
/// duplicate `processed_file` rows.
#[tokio::test]
async fn files_ingested_during_an_outage_deliver_once_broker_recovers() {
    let spool = tempfile::tempdir().unwrap();
    for i in 0..5 {
        write_record(spool.path(), "20240115", &format!("evt{i}.json.bson"), i, i).await;
    }

    let ledger: Arc<dyn Repository> = Arc::new(SqliteLedger::open_in_memory().await.unwrap());
    let broker = Arc::new(FakeBrokerClient::new(false));
    let shutdown = CancellationToken::new();
    let queue = PublishQueue::new(
        ledger.clone(),
        broker.clone(),
        "jarvist".to_string(),
        "agent-1".to_string(),
        shutdown.clone(),
    );
    queue.spawn_workers();

    let pipeline = IngestPipeline::new(
        spool.path().to_path_buf(),
        KEY,
        ledger.clone(),
        queue.clone(),
        shutdown.clone(),
        Duration::from_secs(3600),
        identity(),
    );
    pipeline.spawn().await.unwrap();

    let all_recorded = wait_until_pending_count(ledger.as_ref(), 5, Duration::from_secs(5)).await;
    assert!(all_recorded, "all 5 files should be recorded even with the broker down");
    assert!(broker.published().is_empty());

    for i in 0..5 {
        assert!(ledger
            .is_file_processed("20240115", &format!("20240115/evt{i}.json.bson"))
            .await
            .unwrap());
    }

    broker.set_connected(true);
    queue.trigger_pending_scan();

    let all_sent = wait_until_published_len(&broker, 5, Duration::from_secs(10)).await;
    assert!(all_sent, "all 5 messages should be delivered once the broker recovers");
    assert!(wait_until_pending_count(ledger.as_ref(), 0, Duration::from_secs(2)).await);

    queue.shutdown().await;
}
