//! Watchdog (§4.5 path C): re-subscribes date folders the watcher
//! silently dropped and recreates the spool root if an operator deleted
//! it, every `WATCHDOG_INTERVAL`.
//!
//! The watcher publishes the folders it currently holds a `notify`
//! subscription on into `watched_folders` (updated from its own blocking
//! thread) and a command channel the watchdog can push re-subscribe
//! requests into. If the watcher has crashed and is mid-restart, the
//! channel is `None` and this pass is a no-op — the watcher's own
//! recovery loop (`watcher.rs`) re-establishes everything on restart.

use std::sync::Arc;

use crate::constants::WATCHDOG_INTERVAL;

use super::IngestPipeline;

impl IngestPipeline {
    pub(super) async fn run_watchdog(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.spool_root.exists() {
                log::warn!("spool root {:?} missing, recreating it", self.spool_root);
                if let Err(err) = tokio::fs::create_dir_all(&self.spool_root).await {
                    log::error!("failed to recreate spool root: {err}");
                }
                continue;
            }

            self.resubscribe_dropped_folders().await;
        }
    }

    async fn resubscribe_dropped_folders(self: &Arc<Self>) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.spool_root).await else {
            return;
        };

        let mut date_folders = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if Self::parse_date_folder(&name).is_some() {
                date_folders.push((name, path));
            }
        }

        let watched = self.watched_folders.lock().unwrap().clone();
        let missing: Vec<_> = date_folders
            .into_iter()
            .filter(|(name, _)| !watched.contains(name))
            .collect();

        if missing.is_empty() {
            return;
        }

        let Some(sender) = self.watch_commands.lock().unwrap().clone() else {
            log::debug!("watcher not ready, deferring {} resubscription(s)", missing.len());
            return;
        };

        for (name, path) in missing {
            log::warn!("date folder {name} is not being watched, re-subscribing");
            if sender.send(path).is_err() {
                log::debug!("watcher command channel closed mid-resubscribe");
                break;
            }
        }
    }
}
