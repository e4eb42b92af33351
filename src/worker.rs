use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::api::ReadingUploader;
use crate::network::NetworkStatus;
use crate::queue::ReadingQueue;
use crate::retry::RetryPolicy;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.attempted += other.attempted;
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

/// Clears the processing flag when a pass ends, even if it is dropped early.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct UploadWorker<U> {
    queue: Arc<Mutex<ReadingQueue>>,
    uploader: U,
    policy: RetryPolicy,
    processing: AtomicBool,
}

impl<U: ReadingUploader> UploadWorker<U> {
    pub fn new(queue: Arc<Mutex<ReadingQueue>>, uploader: U, policy: RetryPolicy) -> Self {
        Self {
            queue,
            uploader,
            policy,
            processing: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<Mutex<ReadingQueue>> {
        &self.queue
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// One pass over the readings that are pending when the pass starts.
    ///
    /// Returns an empty report if another pass is already running.
    pub async fn drain(&self) -> DrainReport {
        if self.processing.swap(true, Ordering::SeqCst) {
            log::debug!("Upload pass already running");
            return DrainReport::default();
        }
        let _guard = ProcessingGuard(&self.processing);

        let ids: Vec<String> = {
            let mut queue = self.queue.lock().await;
            queue.refresh();
            queue.pending().into_iter().map(|item| item.id).collect()
        };
        if ids.is_empty() {
            return DrainReport::default();
        }
        log::info!("Uploading {} pending readings", ids.len());

        let mut report = DrainReport::default();
        for id in ids {
            // Removed or retried out of turn since the pass started.
            let Some(item) = self.queue.lock().await.begin_upload(&id) else {
                continue;
            };
            report.attempted += 1;

            match self.uploader.upload(&item).await {
                Ok(()) => {
                    self.queue.lock().await.mark_completed(&id);
                    report.completed += 1;
                    log::info!("Uploaded reading {id}");
                }
                Err(e) => {
                    let kind = e.kind();
                    log::warn!(
                        "Upload of reading {id} failed, attempt {} ({}): {e}",
                        item.retry_count + 1,
                        kind.as_str()
                    );
                    self.queue.lock().await.mark_failed(&id, e.to_string(), kind);
                    report.failed += 1;
                }
            }
        }

        log::info!(
            "Upload pass finished: {} completed, {} failed",
            report.completed,
            report.failed
        );
        report
    }

    /// `None` when offline or while another pass is still running.
    pub async fn drain_if_online(&self, network: &NetworkStatus) -> Option<DrainReport> {
        if network.is_offline() {
            log::debug!("Offline, skipping upload pass");
            return None;
        }
        if self.is_processing() {
            return None;
        }
        Some(self.drain().await)
    }

    /// Moves failed readings whose backoff has elapsed back to pending.
    pub async fn requeue_due(&self) -> usize {
        let requeued = {
            let mut queue = self.queue.lock().await;
            queue.refresh();
            queue.requeue_due(&self.policy, Utc::now())
        };
        if requeued > 0 {
            log::info!("Automatically retrying {requeued} failed readings");
        }
        requeued
    }

    async fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.queue.lock().await.next_retry_at(&self.policy)
    }

    /// Drains the queue and keeps retrying transient failures until none is
    /// eligible for automatic retry any more.
    pub async fn sync_once(&self) -> DrainReport {
        let mut total = DrainReport::default();
        loop {
            self.requeue_due().await;
            total.merge(self.drain().await);

            let Some(at) = self.next_retry_at().await else {
                break;
            };
            tokio::time::sleep(until(at)).await;
        }
        total
    }

    /// Runs until `shutdown` resolves.
    ///
    /// A pass runs on every tick and whenever the network comes back; due
    /// automatic retries are re-queued and drained as they come up.
    pub async fn run(
        &self,
        network: &NetworkStatus,
        tick_interval: Duration,
        shutdown: impl Future<Output = ()>,
    ) {
        let mut offline_rx = network.subscribe();
        let mut ticker = tokio::time::interval(tick_interval);
        tokio::pin!(shutdown);

        log::info!(
            "Upload worker started (tick: {}s, max retries: {})",
            tick_interval.as_secs(),
            self.policy.max_retries
        );

        loop {
            let next_retry = self.next_retry_at().await;

            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Upload worker stopping");
                    break;
                }
                changed = offline_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let offline = *offline_rx.borrow_and_update();
                    if !offline {
                        self.drain().await;
                    }
                }
                _ = ticker.tick() => {
                    self.drain_if_online(network).await;
                }
                _ = wait_until(next_retry) => {
                    self.requeue_due().await;
                    self.drain_if_online(network).await;
                }
            }
        }
    }
}

fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

async fn wait_until(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => tokio::time::sleep(until(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    use reqwest::StatusCode;
    use tokio::sync::{Notify, oneshot};

    use super::*;
    use crate::api::UploadError;
    use crate::db::TempDb;
    use crate::queue::memory_queue;
    use crate::reading::{ErrorKind, QueuedReading, ReadingStatus, sample};

    // ── Mock uploaders ───────────────────────────────────────────────────

    /// Fails with the scripted statuses in order, then succeeds.
    #[derive(Default)]
    struct ScriptedUploader {
        failures: std::sync::Mutex<VecDeque<StatusCode>>,
        uploaded: std::sync::Mutex<Vec<(f64, f64)>>,
        calls: AtomicU32,
    }

    impl ScriptedUploader {
        fn failing(statuses: &[StatusCode]) -> Self {
            Self {
                failures: std::sync::Mutex::new(statuses.iter().copied().collect()),
                ..Default::default()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn uploaded(&self) -> Vec<(f64, f64)> {
            self.uploaded.lock().unwrap().clone()
        }
    }

    impl ReadingUploader for ScriptedUploader {
        async fn upload(&self, reading: &QueuedReading) -> Result<(), UploadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.failures.lock().unwrap().pop_front() {
                return Err(UploadError::Rejected {
                    status,
                    body: "scripted failure".to_string(),
                });
            }
            self.uploaded
                .lock()
                .unwrap()
                .push((reading.temperature, reading.humidity));
            Ok(())
        }
    }

    /// Blocks inside the upload until released.
    #[derive(Default)]
    struct GateUploader {
        started: Notify,
        release: Notify,
    }

    impl ReadingUploader for GateUploader {
        async fn upload(&self, _reading: &QueuedReading) -> Result<(), UploadError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn worker<U: ReadingUploader>(uploader: U) -> UploadWorker<U> {
        worker_with_policy(uploader, RetryPolicy::default())
    }

    fn worker_with_policy<U: ReadingUploader>(uploader: U, policy: RetryPolicy) -> UploadWorker<U> {
        UploadWorker::new(Arc::new(Mutex::new(memory_queue())), uploader, policy)
    }

    async fn enqueue(worker: &UploadWorker<impl ReadingUploader>, t: f64, h: f64) -> String {
        worker.queue().lock().await.enqueue(sample(t, h))
    }

    async fn item(worker: &UploadWorker<impl ReadingUploader>, id: &str) -> QueuedReading {
        worker.queue().lock().await.get(id).cloned().unwrap()
    }

    // ── Tests ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_drain_completes_pending_readings() {
        let worker = worker(ScriptedUploader::default());
        let a = enqueue(&worker, 70.0, 40.0).await;
        let b = enqueue(&worker, 72.0, 45.0).await;

        let report = worker.drain().await;
        assert_eq!(
            report,
            DrainReport {
                attempted: 2,
                completed: 2,
                failed: 0
            }
        );
        for id in [a, b] {
            let item = item(&worker, &id).await;
            assert_eq!(item.status, ReadingStatus::Completed);
            assert!(item.error.is_none());
        }
        assert!(!worker.is_processing());
    }

    #[tokio::test]
    async fn test_offline_enqueue_then_reconnect() {
        let worker = Arc::new(worker(ScriptedUploader::default()));
        let network = NetworkStatus::new();
        for (t, h) in [(70.0, 40.0), (72.0, 45.0), (68.0, 50.0)] {
            enqueue(&worker, t, h).await;
        }

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = {
            let worker = worker.clone();
            let network = network.clone();
            tokio::spawn(async move {
                let shutdown = async {
                    let _ = stop_rx.await;
                };
                worker.run(&network, Duration::from_secs(3600), shutdown).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.queue().lock().await.pending().len(), 3);
        assert_eq!(worker.uploader.calls(), 0);

        network.set_offline(false);
        tokio::time::timeout(Duration::from_secs(5), async {
            while worker.queue().lock().await.completed().len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("readings were not uploaded after reconnecting");

        assert_eq!(
            worker.uploader.uploaded(),
            vec![(70.0, 40.0), (72.0, 45.0), (68.0, 50.0)]
        );

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_if_online_skips_while_offline() {
        let worker = worker(ScriptedUploader::default());
        let network = NetworkStatus::new();
        let id = enqueue(&worker, 70.0, 40.0).await;

        assert_eq!(worker.drain_if_online(&network).await, None);
        assert_eq!(item(&worker, &id).await.status, ReadingStatus::Pending);

        network.set_offline(false);
        let report = worker.drain_if_online(&network).await.unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_failure_then_manual_retry() {
        let worker = worker(ScriptedUploader::failing(&[StatusCode::SERVICE_UNAVAILABLE]));
        let id = enqueue(&worker, 70.0, 40.0).await;

        worker.drain().await;
        let failed = item(&worker, &id).await;
        assert_eq!(failed.status, ReadingStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_kind, Some(ErrorKind::Transient));
        assert!(failed.error.unwrap().contains("503"));

        assert!(worker.queue().lock().await.retry(&id));
        worker.drain().await;
        let done = item(&worker, &id).await;
        assert_eq!(done.status, ReadingStatus::Completed);
        assert_eq!(done.retry_count, 1);
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn test_bulk_retry_affects_every_failed_reading() {
        let worker = worker(ScriptedUploader::failing(&[
            StatusCode::BAD_GATEWAY,
            StatusCode::BAD_REQUEST,
        ]));
        let a = enqueue(&worker, 70.0, 40.0).await;
        let b = enqueue(&worker, 72.0, 45.0).await;

        let report = worker.drain().await;
        assert_eq!(report.failed, 2);

        assert_eq!(worker.queue().lock().await.retry_all_failed(), 2);
        assert_eq!(worker.queue().lock().await.pending().len(), 2);

        let report = worker.drain().await;
        assert_eq!(report.completed, 2);
        for id in [a, b] {
            assert_eq!(item(&worker, &id).await.status, ReadingStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_removed_reading_is_never_uploaded() {
        let worker = worker(ScriptedUploader::default());
        let removed = enqueue(&worker, 70.0, 40.0).await;
        enqueue(&worker, 72.0, 45.0).await;

        assert!(worker.queue().lock().await.remove(&removed));
        assert!(
            worker
                .queue()
                .lock()
                .await
                .pending()
                .iter()
                .all(|item| item.id != removed)
        );

        worker.drain().await;
        assert_eq!(worker.uploader.calls(), 1);
        assert_eq!(worker.uploader.uploaded(), vec![(72.0, 45.0)]);
    }

    #[tokio::test]
    async fn test_sync_once_retries_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(5));
        let worker = worker_with_policy(
            ScriptedUploader::failing(&[StatusCode::SERVICE_UNAVAILABLE, StatusCode::BAD_GATEWAY]),
            policy,
        );
        let id = enqueue(&worker, 70.0, 40.0).await;

        let report = worker.sync_once().await;
        assert_eq!(report.attempted, 3);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 2);

        let item = item(&worker, &id).await;
        assert_eq!(item.status, ReadingStatus::Completed);
        assert_eq!(item.retry_count, 2);
    }

    #[tokio::test]
    async fn test_sync_once_stops_at_retry_cap() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let worker = worker_with_policy(
            ScriptedUploader::failing(&[StatusCode::SERVICE_UNAVAILABLE; 10]),
            policy,
        );
        let id = enqueue(&worker, 70.0, 40.0).await;

        worker.sync_once().await;
        assert_eq!(worker.uploader.calls(), 3);
        let item = item(&worker, &id).await;
        assert_eq!(item.status, ReadingStatus::Failed);
        assert_eq!(item.retry_count, 3);
    }

    #[tokio::test]
    async fn test_sync_once_does_not_retry_permanent_failures() {
        let worker = worker(ScriptedUploader::failing(&[StatusCode::UNPROCESSABLE_ENTITY]));
        let id = enqueue(&worker, 70.0, 40.0).await;

        worker.sync_once().await;
        assert_eq!(worker.uploader.calls(), 1);
        let item = item(&worker, &id).await;
        assert_eq!(item.status, ReadingStatus::Failed);
        assert_eq!(item.error_kind, Some(ErrorKind::Permanent));
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_rejected_while_processing() {
        let worker = Arc::new(worker(GateUploader::default()));
        let id = enqueue(&worker, 70.0, 40.0).await;

        let first = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.drain().await })
        };

        worker.uploader.started.notified().await;
        assert!(worker.is_processing());
        assert_eq!(item(&worker, &id).await.status, ReadingStatus::Uploading);
        assert_eq!(worker.drain().await, DrainReport::default());

        worker.uploader.release.notify_one();
        let report = first.await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(!worker.is_processing());
    }

    #[tokio::test]
    async fn test_run_retries_transient_failure_without_user_action() {
        let policy = RetryPolicy::new(3, Duration::from_millis(20));
        let worker = Arc::new(worker_with_policy(
            ScriptedUploader::failing(&[StatusCode::SERVICE_UNAVAILABLE]),
            policy,
        ));
        let network = NetworkStatus::new();
        network.set_offline(false);
        let id = enqueue(&worker, 70.0, 40.0).await;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = {
            let worker = worker.clone();
            let network = network.clone();
            tokio::spawn(async move {
                let shutdown = async {
                    let _ = stop_rx.await;
                };
                worker.run(&network, Duration::from_secs(3600), shutdown).await;
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while item(&worker, &id).await.status != ReadingStatus::Completed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("failed reading was not retried automatically");

        assert_eq!(worker.uploader.calls(), 2);
        let done = item(&worker, &id).await;
        assert_eq!(done.retry_count, 1);
        assert!(done.error.is_none());

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_automatic_retry_at_cap() {
        let policy = RetryPolicy::new(2, Duration::from_millis(5));
        let worker = Arc::new(worker_with_policy(
            ScriptedUploader::failing(&[StatusCode::SERVICE_UNAVAILABLE; 10]),
            policy,
        ));
        let network = NetworkStatus::new();
        network.set_offline(false);
        let id = enqueue(&worker, 70.0, 40.0).await;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = {
            let worker = worker.clone();
            let network = network.clone();
            tokio::spawn(async move {
                let shutdown = async {
                    let _ = stop_rx.await;
                };
                worker.run(&network, Duration::from_secs(3600), shutdown).await;
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while item(&worker, &id).await.retry_count < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("automatic retries did not run");

        // Well past every backoff: nothing else may be attempted.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(worker.uploader.calls(), 3);
        let failed = item(&worker, &id).await;
        assert_eq!(failed.status, ReadingStatus::Failed);
        assert_eq!(failed.retry_count, 3);

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_going_offline_does_not_cancel_upload_in_flight() {
        let worker = Arc::new(worker(GateUploader::default()));
        let network = NetworkStatus::new();
        network.set_offline(false);
        let id = enqueue(&worker, 70.0, 40.0).await;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = {
            let worker = worker.clone();
            let network = network.clone();
            tokio::spawn(async move {
                let shutdown = async {
                    let _ = stop_rx.await;
                };
                worker.run(&network, Duration::from_secs(3600), shutdown).await;
            })
        };

        worker.uploader.started.notified().await;
        network.set_offline(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(item(&worker, &id).await.status, ReadingStatus::Uploading);

        worker.uploader.release.notify_one();
        tokio::time::timeout(Duration::from_secs(5), async {
            while item(&worker, &id).await.status != ReadingStatus::Completed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("upload was cancelled when the network went away");
        assert!(network.is_offline());

        stop_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_follows_changes_made_by_another_process() {
        let file = TempDb::new();
        let queue = ReadingQueue::open(file.open()).unwrap();
        let worker = UploadWorker::new(
            Arc::new(Mutex::new(queue)),
            ScriptedUploader::default(),
            RetryPolicy::default(),
        );
        let removed = enqueue(&worker, 70.0, 40.0).await;

        assert!(ReadingQueue::load(file.open()).unwrap().remove(&removed));
        let added = ReadingQueue::load(file.open())
            .unwrap()
            .enqueue(sample(72.0, 45.0));

        let report = worker.drain().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(worker.uploader.uploaded(), vec![(72.0, 45.0)]);

        let stored = file.open().load_all().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, added);
        assert_eq!(stored[0].status, ReadingStatus::Completed);
    }

    #[tokio::test]
    async fn test_drain_if_online_skips_while_processing() {
        let worker = Arc::new(worker(GateUploader::default()));
        let network = NetworkStatus::new();
        network.set_offline(false);
        enqueue(&worker, 70.0, 40.0).await;

        let first = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.drain().await })
        };
        worker.uploader.started.notified().await;
        assert_eq!(worker.drain_if_online(&network).await, None);

        worker.uploader.release.notify_one();
        assert_eq!(first.await.unwrap().completed, 1);
    }
}
