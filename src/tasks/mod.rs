//! Background task management
//!
//! Single-flight per operation kind: at most one sync, one import, one
//! reindex, one process at a time. Every run opens an operation-log entry,
//! executes under its own cancellation token and streams progress to one
//! subscriber; missed events are simply lost.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{LifeQueryError, Result};
use crate::ingest::PipelineReport;
use crate::storage::{sync_log, Settings, Storage};
use crate::types::{OperationKind, ProgressEvent};

#[derive(Clone)]
pub struct TaskManager {
    storage: Storage,
    running: Arc<Mutex<HashMap<OperationKind, CancellationToken>>>,
}

impl TaskManager {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a background operation of the given kind.
    ///
    /// Returns the progress receiver, or `Conflict` when an operation of
    /// the same kind is already running. The spawned task finalizes the
    /// operation-log entry and emits the terminal event before exiting.
    pub fn start<F, Fut>(
        &self,
        kind: OperationKind,
        run: F,
    ) -> Result<mpsc::Receiver<ProgressEvent>>
    where
        F: FnOnce(CancellationToken, mpsc::Sender<ProgressEvent>) -> Fut + Send + 'static,
        Fut: Future<Output = PipelineReport> + Send + 'static,
    {
        let token = CancellationToken::new();
        {
            let mut running = self.running.lock();
            if running.contains_key(&kind) {
                return Err(LifeQueryError::Conflict(format!(
                    "{} is already running",
                    kind
                )));
            }
            running.insert(kind, token.clone());
        }

        let log_id = match self
            .storage
            .with_connection(|conn| sync_log::append_log(conn, kind))
        {
            Ok(id) => id,
            Err(e) => {
                self.running.lock().remove(&kind);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(100);
        let storage = self.storage.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            info!("{} started (log entry {})", kind, log_id);
            let report = run(token, tx.clone()).await;
            running.lock().remove(&kind);

            if let Err(e) = storage.with_connection(|conn| {
                sync_log::update_log(
                    conn,
                    log_id,
                    report.status,
                    &report.counters,
                    report.detail.as_deref(),
                )
            }) {
                error!("failed to finalize log entry {}: {}", log_id, e);
            }

            info!("{} finished: {}", kind, report.status);
            let _ = tx.send(report.terminal_event()).await;
        });

        Ok(rx)
    }

    /// Signal cancellation. Returns false when nothing of that kind runs.
    pub fn cancel(&self, kind: OperationKind) -> bool {
        match self.running.lock().get(&kind) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, kind: OperationKind) -> bool {
        self.running.lock().contains_key(&kind)
    }
}

/// Periodically enqueue a sync when `auto_sync_interval_minutes > 0`.
///
/// A tick that finds a sync already running is a no-op; the interval is
/// re-read every cycle so setting changes take effect without a restart.
pub fn spawn_auto_sync<F, Fut>(
    storage: Storage,
    manager: TaskManager,
    run_sync: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(CancellationToken, mpsc::Sender<ProgressEvent>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = PipelineReport> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let interval_minutes = storage
                .with_connection(Settings::load)
                .map(|s| s.auto_sync_interval_minutes)
                .unwrap_or(0);

            let sleep_for = if interval_minutes > 0 {
                Duration::from_secs(interval_minutes as u64 * 60)
            } else {
                // Disabled; poll the setting again in a minute
                Duration::from_secs(60)
            };
            tokio::time::sleep(sleep_for).await;

            if interval_minutes <= 0 {
                continue;
            }

            match manager.start(OperationKind::Sync, run_sync.clone()) {
                Ok(mut progress) => {
                    info!("auto-sync started");
                    while progress.recv().await.is_some() {}
                }
                Err(LifeQueryError::Conflict(_)) => {
                    info!("auto-sync skipped: sync already running");
                }
                Err(e) => error!("auto-sync failed to start: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationCounters, OperationStatus};

    fn report(status: OperationStatus) -> PipelineReport {
        PipelineReport {
            counters: OperationCounters::default(),
            status,
            detail: None,
        }
    }

    #[tokio::test]
    async fn test_single_flight_conflict() {
        let manager = TaskManager::new(Storage::open_in_memory().unwrap());

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let mut progress = manager
            .start(OperationKind::Sync, move |_cancel, _tx| async move {
                let _ = release_rx.await;
                report(OperationStatus::Success)
            })
            .unwrap();

        // Second sync of the same kind is rejected
        let second = manager.start(OperationKind::Sync, |_c, _t| async {
            report(OperationStatus::Success)
        });
        assert!(matches!(second, Err(LifeQueryError::Conflict(_))));

        // A different kind runs concurrently
        let mut other = manager
            .start(OperationKind::Reindex, |_c, _t| async {
                report(OperationStatus::Success)
            })
            .unwrap();
        assert!(matches!(other.recv().await, Some(ProgressEvent::Done { .. })));

        release_tx.send(()).unwrap();
        assert!(matches!(progress.recv().await, Some(ProgressEvent::Done { .. })));

        // Kind is free again once the task finished
        while manager.is_running(OperationKind::Sync) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let third = manager.start(OperationKind::Sync, |_c, _t| async {
            report(OperationStatus::Success)
        });
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_reaches_task() {
        let manager = TaskManager::new(Storage::open_in_memory().unwrap());

        let mut progress = manager
            .start(OperationKind::Sync, |cancel, _tx| async move {
                cancel.cancelled().await;
                report(OperationStatus::Cancelled)
            })
            .unwrap();

        assert!(manager.cancel(OperationKind::Sync));
        assert!(matches!(
            progress.recv().await,
            Some(ProgressEvent::Cancelled { .. })
        ));
        assert!(!manager.cancel(OperationKind::Import));
    }

    #[tokio::test]
    async fn test_log_entry_lifecycle() {
        let storage = Storage::open_in_memory().unwrap();
        let manager = TaskManager::new(storage.clone());

        let mut progress = manager
            .start(OperationKind::Import, |_c, _t| async {
                PipelineReport {
                    counters: OperationCounters {
                        messages_added: 7,
                        ..Default::default()
                    },
                    status: OperationStatus::Success,
                    detail: None,
                }
            })
            .unwrap();
        while progress.recv().await.is_some() {}

        let entries = storage
            .with_connection(|conn| sync_log::tail_log(conn, 1))
            .unwrap();
        assert_eq!(entries[0].operation, OperationKind::Import);
        assert_eq!(entries[0].status, OperationStatus::Success);
        assert_eq!(entries[0].counters.messages_added, 7);
    }
}
