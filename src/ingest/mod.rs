//! Ingest pipeline (C5): discover every `*.json.bson` file under
//! `<spool>/<YYYYMMDD>/` exactly once, decode it, and hand it to C4 (§4.5).

mod processor;
mod rescan;
mod watchdog;
mod watcher;

pub use processor::Processor;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::PENDING_FILES_CAPACITY;
use crate::ledger::Repository;
use crate::queue::PublishQueue;

/// Fallback identity fields used to tag outbound envelopes when the
/// `setting` table (written by the external identity collaborator, §3)
/// has no override yet — e.g. on a brand-new agent install.
#[derive(Debug, Clone)]
pub struct IdentityDefaults {
    pub tenant_id: String,
    pub site_id: String,
    pub client_id: String,
}

/// Ties the watcher, periodic rescan, watchdog and processor worker
/// together behind one spool root.
pub struct IngestPipeline {
    spool_root: PathBuf,
    decryption_key: [u8; 32],
    ledger: Arc<dyn Repository>,
    queue: Arc<PublishQueue>,
    shutdown: CancellationToken,
    sync_interval: std::time::Duration,
    rescan_running: std::sync::atomic::AtomicBool,
    identity_defaults: IdentityDefaults,
    /// Date folders the live `notify` watcher currently holds a
    /// subscription on, kept in sync by `watcher.rs` so the watchdog
    /// (`watchdog.rs`) can tell which folders need re-subscribing.
    watched_folders: Mutex<HashSet<String>>,
    /// Command channel into the watcher's blocking thread, used by the
    /// watchdog to ask it to subscribe to a folder it dropped. `None`
    /// while the watcher is between (re)starts.
    watch_commands: Mutex<Option<std::sync::mpsc::Sender<PathBuf>>>,
}

impl IngestPipeline {
    pub fn new(
        spool_root: PathBuf,
        decryption_key: [u8; 32],
        ledger: Arc<dyn Repository>,
        queue: Arc<PublishQueue>,
        shutdown: CancellationToken,
        sync_interval: std::time::Duration,
        identity_defaults: IdentityDefaults,
    ) -> Arc<Self> {
        Arc::new(Self {
            spool_root,
            decryption_key,
            ledger,
            queue,
            shutdown,
            sync_interval,
            rescan_running: std::sync::atomic::AtomicBool::new(false),
            identity_defaults,
            watched_folders: Mutex::new(HashSet::new()),
            watch_commands: Mutex::new(None),
        })
    }

    /// Create the spool root if missing (edge case, §4.5) and start the
    /// watcher, rescan, watchdog and processor tasks.
    pub async fn spawn(self: &Arc<Self>) -> std::io::Result<()> {
        if !self.spool_root.exists() {
            log::info!("spool root {:?} does not exist, creating it", self.spool_root);
            tokio::fs::create_dir_all(&self.spool_root).await?;
        }

        let (pending_tx, pending_rx) = mpsc::channel::<PathBuf>(PENDING_FILES_CAPACITY);

        tokio::spawn(self.clone().run_watcher(pending_tx.clone()));
        tokio::spawn(self.clone().run_rescan_loop(pending_tx.clone()));
        tokio::spawn(self.clone().run_watchdog());

        let processor = Processor::new(
            self.ledger.clone(),
            self.queue.clone(),
            self.spool_root.clone(),
            self.decryption_key,
            self.identity_defaults.clone(),
        );
        tokio::spawn(processor.run(pending_rx, self.shutdown.clone()));

        Ok(())
    }

    /// Validate a directory basename as a `YYYYMMDD` date folder (§6).
    pub(crate) fn parse_date_folder(name: &str) -> Option<chrono::NaiveDate> {
        if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        chrono::NaiveDate::parse_from_str(name, "%Y%m%d").ok()
    }

    /// Whether `path` is an eligible record file: name ends `.json.bson`
    /// and size is at least the minimum threshold (§6).
    pub(crate) async fn is_eligible_record_file(path: &std::path::Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if !name.ends_with(".json.bson") {
            return false;
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len() >= crate::constants::MIN_RECORD_FILE_SIZE,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_date_folders_parse() {
        assert!(IngestPipeline::parse_date_folder("20240115").is_some());
    }

    #[test]
    fn non_numeric_folder_is_rejected() {
        assert!(IngestPipeline::parse_date_folder("2024011x").is_none());
    }

    #[test]
    fn wrong_length_folder_is_rejected() {
        assert!(IngestPipeline::parse_date_folder("202401").is_none());
    }

    #[test]
    fn numeric_but_not_a_real_date_is_rejected() {
        // Matches `^\d{8}$` but month 13 doesn't exist.
        assert!(IngestPipeline::parse_date_folder("20241301").is_none());
    }

    #[tokio::test]
    async fn short_files_are_ineligible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evt.json.bson");
        tokio::fs::write(&path, vec![0u8; 10]).await.unwrap();
        assert!(!IngestPipeline::is_eligible_record_file(&path).await);
    }

    #[tokio::test]
    async fn large_enough_files_with_the_right_suffix_are_eligible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evt.json.bson");
        tokio::fs::write(&path, vec![0u8; 128]).await.unwrap();
        assert!(IngestPipeline::is_eligible_record_file(&path).await);
    }

    #[tokio::test]
    async fn wrong_suffix_is_ineligible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evt.txt");
        tokio::fs::write(&path, vec![0u8; 128]).await.unwrap();
        assert!(!IngestPipeline::is_eligible_record_file(&path).await);
    }
}
