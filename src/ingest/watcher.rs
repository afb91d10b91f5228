//! Watcher discovery path (§4.5 path A).
//!
//! `notify`'s callback runs on its own OS thread; this module bridges it
//! into the async world via `spawn_blocking`, the way the teacher's
//! `FileWatcher` already isolates the OS watcher behind a channel, just
//! carried one step further so subscription changes (new date folders)
//! happen on that same thread instead of needing a shared `Mutex`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::{MIN_RECORD_FILE_SIZE, WATCHER_RECOVERY_RETRY};

use super::IngestPipeline;

impl IngestPipeline {
    /// Runs the watcher forever, restarting it on construction failure
    /// after `WATCHER_RECOVERY_RETRY` — meanwhile the periodic rescan
    /// still provides coverage (§4.5 edge-case policy).
    pub(super) async fn run_watcher(self: Arc<Self>, pending_tx: mpsc::Sender<PathBuf>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let spool_root = self.spool_root.clone();
            let shutdown = self.shutdown.clone();
            let tx = pending_tx.clone();
            let pipeline = self.clone();

            let result =
                tokio::task::spawn_blocking(move || watch_blocking(pipeline, spool_root, tx, shutdown))
                    .await;

            *self.watch_commands.lock().unwrap() = None;

            match result {
                Ok(Ok(())) => return,
                Ok(Err(err)) => {
                    log::error!(
                        "file watcher failed to start ({err}); retrying in {:?}",
                        WATCHER_RECOVERY_RETRY
                    );
                }
                Err(err) => {
                    log::error!("file watcher task panicked: {err}");
                }
            }

            tokio::time::sleep(WATCHER_RECOVERY_RETRY).await;
        }
    }
}

fn watch_blocking(
    pipeline: Arc<IngestPipeline>,
    spool_root: PathBuf,
    pending_tx: mpsc::Sender<PathBuf>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(&spool_root, RecursiveMode::NonRecursive)?;

    let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<PathBuf>();
    *pipeline.watch_commands.lock().unwrap() = Some(cmd_tx);

    if let Ok(entries) = std::fs::read_dir(&spool_root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if IngestPipeline::parse_date_folder(name).is_some() {
                        subscribe_folder(&pipeline, &mut watcher, &path, &pending_tx);
                    }
                }
            }
        }
    }

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        while let Ok(path) = cmd_rx.try_recv() {
            subscribe_folder(&pipeline, &mut watcher, &path, &pending_tx);
        }

        match rx.recv_timeout(std::time::Duration::from_millis(500)) {
            Ok(Ok(event)) => handle_event(&pipeline, &mut watcher, &event, &pending_tx),
            Ok(Err(err)) => log::warn!("file watcher reported an error: {err}"),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

/// Subscribes `path` (a date folder) with the watcher, records it in the
/// shared `watched_folders` set the watchdog consults, and scans its
/// existing contents once (§4.5 path A, `Create(dir)`).
fn subscribe_folder(
    pipeline: &Arc<IngestPipeline>,
    watcher: &mut RecommendedWatcher,
    path: &Path,
    pending_tx: &mpsc::Sender<PathBuf>,
) {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    if watcher.watch(path, RecursiveMode::NonRecursive).is_err() {
        return;
    }
    pipeline
        .watched_folders
        .lock()
        .unwrap()
        .insert(name.to_string());
    scan_directory(path, pending_tx);
}

fn handle_event(
    pipeline: &Arc<IngestPipeline>,
    watcher: &mut RecommendedWatcher,
    event: &notify::Event,
    pending_tx: &mpsc::Sender<PathBuf>,
) {
    for path in &event.paths {
        match event.kind {
            notify::EventKind::Create(_) if path.is_dir() => {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if IngestPipeline::parse_date_folder(name).is_some() {
                        subscribe_folder(pipeline, watcher, path, pending_tx);
                    }
                }
            }
            notify::EventKind::Create(_) | notify::EventKind::Modify(_) => {
                enqueue_if_eligible(path, pending_tx);
            }
            _ => {}
        }
    }
}

fn scan_directory(dir: &Path, pending_tx: &mpsc::Sender<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        enqueue_if_eligible(&entry.path(), pending_tx);
    }
}

fn enqueue_if_eligible(path: &Path, pending_tx: &mpsc::Sender<PathBuf>) {
    if !path.is_file() {
        return;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    if !name.ends_with(".json.bson") {
        return;
    }
    let Ok(meta) = std::fs::metadata(path) else {
        return;
    };
    if meta.len() >= MIN_RECORD_FILE_SIZE {
        let _ = pending_tx.blocking_send(path.to_path_buf());
    }
}
