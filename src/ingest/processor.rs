//! Processor worker (§4.5): pops paths from `pending_files`, decodes them,
//! records them in the ledger, and enqueues the outbound envelope on C4.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::FILE_PROCESSING_TIMEOUT;
use crate::decoder;
use crate::ingest::IdentityDefaults;
use crate::ledger::Repository;
use crate::queue::PublishQueue;

/// Owns the spool root and decryption key needed to turn a discovered
/// path into a ledger row and an outbound publish.
pub struct Processor {
    ledger: Arc<dyn Repository>,
    queue: Arc<PublishQueue>,
    spool_root: PathBuf,
    decryption_key: [u8; 32],
    identity_defaults: IdentityDefaults,
}

impl Processor {
    pub fn new(
        ledger: Arc<dyn Repository>,
        queue: Arc<PublishQueue>,
        spool_root: PathBuf,
        decryption_key: [u8; 32],
        identity_defaults: IdentityDefaults,
    ) -> Self {
        Self {
            ledger,
            queue,
            spool_root,
            decryption_key,
            identity_defaults,
        }
    }

    /// Read a `setting` row, falling back to the configured default when
    /// the external identity collaborator hasn't written one yet (§3).
    async fn identity_field(&self, key: &str, default: &str) -> String {
        match self.ledger.get_setting(key).await {
            Ok(Some(value)) => value,
            _ => default.to_string(),
        }
    }

    pub async fn run(self, mut pending_rx: mpsc::Receiver<PathBuf>, shutdown: CancellationToken) {
        loop {
            let path = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = pending_rx.recv() => match received {
                    Some(path) => path,
                    None => break,
                },
            };

            if let Err(err) =
                tokio::time::timeout(FILE_PROCESSING_TIMEOUT, self.process_one(&path)).await
            {
                log::error!("processing {path:?} exceeded its time budget: {err}");
            }
        }
    }

    async fn process_one(&self, path: &Path) -> Result<(), ()> {
        let Some((folder, filename)) = self.relative_key(path) else {
            log::warn!("{path:?} is not under the spool root, skipping");
            return Ok(());
        };

        if folder == "." {
            return Ok(());
        }

        // §8.1's ledger key is folder-prefixed (`20240115/evt1.json.bson`),
        // matching the `filename` field of the outbound envelope below
        // rather than the bare on-disk basename.
        let ledger_filename = format!("{folder}/{filename}");

        match self.ledger.is_file_processed(&folder, &ledger_filename).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => {
                log::error!("failed to check processed state for {folder}/{filename}: {err}");
                return Err(());
            }
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("failed to read {path:?}: {err}");
                return Err(());
            }
        };

        let entry = match decoder::decode(&bytes, &self.decryption_key) {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("failed to decode {folder}/{filename}: {err}");
                return Err(());
            }
        };

        let data_summary = json!({
            "id": entry.id,
            "cctv_id": entry.cctv_id,
            "device_id": entry.device_id,
            "device_timestamp": entry.device_timestamp,
            "device_timestamp_utc": entry.device_timestamp_utc,
            "in_count": entry.in_count,
            "out_count": entry.out_count,
            "start_time": entry.start_time,
            "sync_status": entry.sync_status,
        });

        let tenant_id = self
            .identity_field("tenant_id", &self.identity_defaults.tenant_id)
            .await;
        let client_id = self
            .identity_field("client_id", &self.identity_defaults.client_id)
            .await;
        let site_id = self
            .identity_field("site_id", &self.identity_defaults.site_id)
            .await;

        let envelope = json!({
            "filename": ledger_filename,
            "date_folder": folder,
            "tenant_id": tenant_id,
            "client_id": client_id,
            "site_id": site_id,
            "processed_at": chrono::Utc::now().to_rfc3339(),
            "data": data_summary,
        })
        .to_string();

        let topic = format!("jarvist/data/{folder}");

        let enqueue_result = self
            .ledger
            .record_processed_file_and_enqueue(
                &folder,
                &ledger_filename,
                &data_summary.to_string(),
                &topic,
                envelope.as_bytes(),
                self.queue.broker().is_connected(),
            )
            .await;

        match enqueue_result {
            Ok(_) => {}
            Err(crate::error::LedgerError::Duplicate { .. }) => {
                // Another path (watcher vs. rescan) already won the race.
            }
            Err(err) => {
                log::error!("failed to record {folder}/{filename}: {err}");
                return Err(());
            }
        }

        self.update_folder_summary(&folder).await;
        Ok(())
    }

    async fn update_folder_summary(&self, folder: &str) {
        let dir = self.spool_root.join(folder);
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return;
        };

        let mut total_files = 0i64;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if super::IngestPipeline::is_eligible_record_file(&entry.path()).await {
                total_files += 1;
            }
        }

        let processed_count = self
            .ledger
            .list_processed_filenames(folder)
            .await
            .map(|names| names.len() as i64)
            .unwrap_or(-1);

        if processed_count < 0 {
            return;
        }

        if let Err(err) = self
            .ledger
            .upsert_synced_folder(folder, total_files, total_files == processed_count)
            .await
        {
            log::error!("failed to update synced_folder for {folder}: {err}");
        }
    }

    fn relative_key(&self, path: &Path) -> Option<(String, String)> {
        let relative = path.strip_prefix(&self.spool_root).ok()?;
        let folder = relative.parent()?.file_name()?.to_str()?.to_string();
        let filename = relative.file_name()?.to_str()?.to_string();
        Some((folder, filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBrokerClient;
    use crate::ledger::SqliteLedger;
    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Nonce};
    use bson::doc;
    use rand::RngCore;
    use tokio_util::sync::CancellationToken;

    fn seal(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256Gcm::new_from_slice(key).unwrap();
        let mut nonce_bytes = [0u8; 12];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, plaintext).unwrap();
        [nonce_bytes.to_vec(), ciphertext].concat()
    }

    async fn setup() -> (tempfile::TempDir, Processor, Arc<dyn Repository>, Arc<FakeBrokerClient>) {
        let spool = tempfile::tempdir().unwrap();
        let ledger: Arc<dyn Repository> = Arc::new(SqliteLedger::open_in_memory().await.unwrap());
        let broker = Arc::new(FakeBrokerClient::new(true));
        let queue = PublishQueue::new(
            ledger.clone(),
            broker.clone(),
            "jarvist".to_string(),
            "agent".to_string(),
            CancellationToken::new(),
        );
        let processor = Processor::new(
            ledger.clone(),
            queue,
            spool.path().to_path_buf(),
            [7u8; 32],
            IdentityDefaults {
                tenant_id: "tenant".to_string(),
                site_id: "site".to_string(),
                client_id: "agent".to_string(),
            },
        );
        (spool, processor, ledger, broker)
    }

    #[tokio::test]
    async fn a_well_formed_file_is_recorded_and_enqueued() {
        let (spool, processor, ledger, _broker) = setup().await;
        let folder_path = spool.path().join("20240115");
        tokio::fs::create_dir_all(&folder_path).await.unwrap();

        let document = doc! { "id": "evt-1", "device_id": "dev-1", "in_count": 2i32 };
        let plaintext = bson::to_vec(&document).unwrap();
        let envelope = seal(&[7u8; 32], &plaintext);
        let file_path = folder_path.join("a.json.bson");
        tokio::fs::write(&file_path, &envelope).await.unwrap();

        processor.process_one(&file_path).await.unwrap();

        assert!(ledger
            .is_file_processed("20240115", "20240115/a.json.bson")
            .await
            .unwrap());
        assert_eq!(ledger.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn a_second_pass_over_the_same_file_is_idempotent() {
        let (spool, processor, ledger, _broker) = setup().await;
        let folder_path = spool.path().join("20240115");
        tokio::fs::create_dir_all(&folder_path).await.unwrap();

        let document = doc! { "id": "evt-1", "device_id": "dev-1" };
        let plaintext = bson::to_vec(&document).unwrap();
        let envelope = seal(&[7u8; 32], &plaintext);
        let file_path = folder_path.join("a.json.bson");
        tokio::fs::write(&file_path, &envelope).await.unwrap();

        processor.process_one(&file_path).await.unwrap();
        processor.process_one(&file_path).await.unwrap();

        assert_eq!(ledger.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_ciphertext_is_left_unprocessed() {
        let (spool, processor, ledger, _broker) = setup().await;
        let folder_path = spool.path().join("20240115");
        tokio::fs::create_dir_all(&folder_path).await.unwrap();

        let file_path = folder_path.join("broken.json.bson");
        tokio::fs::write(&file_path, vec![1, 2, 3, 4, 5]).await.unwrap();

        let result = processor.process_one(&file_path).await;
        assert!(result.is_err());
        assert!(!ledger
            .is_file_processed("20240115", "20240115/broken.json.bson")
            .await
            .unwrap());
    }
}
