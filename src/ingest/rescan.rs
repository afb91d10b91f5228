//! Periodic rescan discovery path (§4.5 path B).
//!
//! Backstops the watcher: every `Sync.Interval`, compares the on-disk
//! file set for each date folder against `processed_file` rows and
//! enqueues anything missing. A single-flight guard (`rescan_running`)
//! prevents overlapping passes if one rescan runs long.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::IngestPipeline;

impl IngestPipeline {
    pub(super) async fn run_rescan_loop(self: Arc<Self>, pending_tx: mpsc::Sender<PathBuf>) {
        let mut ticker = tokio::time::interval(self.sync_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self
                .rescan_running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                log::debug!("rescan already in progress, skipping this tick");
                continue;
            }

            self.rescan_once(&pending_tx).await;
            self.rescan_running.store(false, Ordering::SeqCst);
        }
    }

    async fn rescan_once(&self, pending_tx: &mpsc::Sender<PathBuf>) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.spool_root).await else {
            return;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if Self::parse_date_folder(&name).is_none() {
                continue;
            }
            if !path.is_dir() {
                continue;
            }

            self.rescan_folder(&name, &path, pending_tx).await;
        }
    }

    async fn rescan_folder(
        &self,
        folder: &str,
        path: &std::path::Path,
        pending_tx: &mpsc::Sender<PathBuf>,
    ) {
        let processed: HashSet<String> = match self.ledger.list_processed_filenames(folder).await {
            Ok(names) => names.into_iter().collect(),
            Err(err) => {
                log::error!("rescan failed to read processed files for {folder}: {err}");
                return;
            }
        };

        let Ok(mut entries) = tokio::fs::read_dir(path).await else {
            return;
        };

        let mut total_files = 0i64;
        let mut missing = 0usize;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_path = entry.path();
            if !super::IngestPipeline::is_eligible_record_file(&file_path).await {
                continue;
            }
            total_files += 1;

            let Some(name) = file_path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            // Folder-prefixed to match the `processed_file` key processor.rs
            // writes (§8.1: `(20240115, 20240115/evt1.json.bson)`).
            let key = format!("{folder}/{name}");
            if !processed.contains(&key) {
                missing += 1;
                if pending_tx.send(file_path).await.is_err() {
                    return;
                }
            }
        }

        if let Err(err) = self
            .ledger
            .upsert_synced_folder(folder, total_files, missing == 0)
            .await
        {
            log::error!("rescan failed to update synced_folder for {folder}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBrokerClient;
    use crate::ledger::SqliteLedger;
    use crate::queue::PublishQueue;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn rescan_finds_unprocessed_files_and_updates_folder_summary() {
        let spool = tempfile::tempdir().unwrap();
        let folder = spool.path().join("20240115");
        tokio::fs::create_dir_all(&folder).await.unwrap();
        tokio::fs::write(folder.join("a.json.bson"), vec![0u8; 128])
            .await
            .unwrap();

        let ledger: Arc<dyn crate::ledger::Repository> =
            Arc::new(SqliteLedger::open_in_memory().await.unwrap());
        let broker = Arc::new(FakeBrokerClient::new(false));
        let queue = PublishQueue::new(
            ledger.clone(),
            broker,
            "jarvist".to_string(),
            "agent".to_string(),
            CancellationToken::new(),
        );

        let pipeline = IngestPipeline::new(
            spool.path().to_path_buf(),
            [0u8; 32],
            ledger.clone(),
            queue,
            CancellationToken::new(),
            std::time::Duration::from_secs(60),
            super::IdentityDefaults {
                tenant_id: "tenant".to_string(),
                site_id: "site".to_string(),
                client_id: "agent".to_string(),
            },
        );

        let (tx, mut rx) = mpsc::channel(16);
        pipeline.rescan_once(&tx).await;
        drop(tx);

        let mut found = Vec::new();
        while let Some(path) = rx.recv().await {
            found.push(path);
        }
        assert_eq!(found.len(), 1);

        let folders = ledger.list_synced_folders().await.unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].total_files, 1);
        assert!(!folders[0].fully_synced);
    }

    #[tokio::test]
    async fn an_already_processed_file_is_not_rediscovered_as_missing() {
        let spool = tempfile::tempdir().unwrap();
        let folder_path = spool.path().join("20240115");
        tokio::fs::create_dir_all(&folder_path).await.unwrap();
        tokio::fs::write(folder_path.join("a.json.bson"), vec![0u8; 128])
            .await
            .unwrap();

        let ledger: Arc<dyn crate::ledger::Repository> =
            Arc::new(SqliteLedger::open_in_memory().await.unwrap());
        ledger
            .record_processed_file_and_enqueue("20240115", "20240115/a.json.bson", "{}", "t", b"p", false)
            .await
            .unwrap();

        let broker = Arc::new(FakeBrokerClient::new(false));
        let queue = PublishQueue::new(
            ledger.clone(),
            broker,
            "jarvist".to_string(),
            "agent".to_string(),
            CancellationToken::new(),
        );

        let pipeline = IngestPipeline::new(
            spool.path().to_path_buf(),
            [0u8; 32],
            ledger.clone(),
            queue,
            CancellationToken::new(),
            std::time::Duration::from_secs(60),
            super::IdentityDefaults {
                tenant_id: "tenant".to_string(),
                site_id: "site".to_string(),
                client_id: "agent".to_string(),
            },
        );

        let (tx, mut rx) = mpsc::channel(16);
        pipeline.rescan_once(&tx).await;
        drop(tx);

        let mut found = Vec::new();
        while let Some(path) = rx.recv().await {
            found.push(path);
        }
        assert!(
            found.is_empty(),
            "an already-processed file must not be requeued by rescan"
        );

        let folders = ledger.list_synced_folders().await.unwrap();
        assert!(folders[0].fully_synced);
    }
}
