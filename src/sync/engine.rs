use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::db::Database;

use super::endpoint::{SyncBatch, SyncEndpoint};

const STATUS_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
}

/// Progress of one sync attempt, in emission order: `Started`, then exactly
/// one terminal status.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    Started,
    UpToDate,
    Complete { records: u64 },
    Failed { records: u64, reason: String },
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatus::Started)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Started => write!(f, "Syncing..."),
            SyncStatus::UpToDate => write!(f, "Up to date"),
            SyncStatus::Complete { records } => write!(f, "Sync complete ({records} records)"),
            SyncStatus::Failed { reason, .. } => write!(f, "Sync failed: {reason}"),
        }
    }
}

struct SyncInner {
    db: Database,
    endpoint: Arc<dyn SyncEndpoint>,
    device_id: String,
    syncing: AtomicBool,
    last_sync_time: Mutex<Option<DateTime<Utc>>>,
    status_tx: broadcast::Sender<SyncStatus>,
}

/// Held for the duration of one attempt; releases the guard on drop.
struct SyncPermit {
    inner: Arc<SyncInner>,
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.inner.syncing.store(false, Ordering::Release);
    }
}

/// Moves unsynced rows to the endpoint. At most one attempt runs at a time;
/// a trigger arriving mid-attempt is dropped, not queued.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncInner>,
}

impl SyncEngine {
    pub fn new(db: Database, endpoint: Arc<dyn SyncEndpoint>, device_id: impl Into<String>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SyncInner {
                db,
                endpoint,
                device_id: device_id.into(),
                syncing: AtomicBool::new(false),
                last_sync_time: Mutex::new(None),
                status_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn state(&self) -> SyncState {
        if self.inner.syncing.load(Ordering::Acquire) {
            SyncState::Syncing
        } else {
            SyncState::Idle
        }
    }

    /// Time of the last successful delivery made by this engine.
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        match self.inner.last_sync_time.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Starts an attempt in the background. Returns `false` when one is
    /// already running and this trigger was dropped.
    pub fn trigger(&self) -> bool {
        let Some(permit) = self.try_begin() else {
            debug!("sync already in progress; trigger dropped");
            return false;
        };

        let engine = self.clone();
        tokio::spawn(async move {
            engine.sync(permit).await;
        });
        true
    }

    /// Runs one attempt to completion. `None` when another attempt holds the
    /// guard.
    pub async fn run_once(&self) -> Option<SyncStatus> {
        let Some(permit) = self.try_begin() else {
            debug!("sync already in progress; trigger dropped");
            return None;
        };
        Some(self.sync(permit).await)
    }

    /// Triggers a sync every `period` until `cancel` fires. The first
    /// attempt happens one period after the call.
    pub fn spawn_timer(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.trigger();
                    }
                    _ = cancel.cancelled() => {
                        info!("sync timer stopped");
                        break;
                    }
                }
            }
        })
    }

    fn try_begin(&self) -> Option<SyncPermit> {
        self.inner
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncPermit {
                inner: Arc::clone(&self.inner),
            })
    }

    fn emit(&self, status: SyncStatus) {
        // No subscribers is fine.
        let _ = self.inner.status_tx.send(status);
    }

    async fn sync(&self, _permit: SyncPermit) -> SyncStatus {
        info!("Starting data synchronization");
        self.emit(SyncStatus::Started);
        let status = self.attempt().await;
        self.emit(status.clone());
        status
    }

    async fn attempt(&self) -> SyncStatus {
        let records = match self.inner.db.collect_unsynced().await {
            Ok(records) => records,
            Err(err) => {
                error!("Failed to read unsynced records: {err:#}");
                return self.fail(0, format!("{err:#}")).await;
            }
        };

        if records.is_empty() {
            info!("No data to sync");
            return SyncStatus::UpToDate;
        }

        let batch = SyncBatch::new(self.inner.device_id.clone(), records);
        let count = batch.len() as u64;

        if let Err(err) = self.inner.endpoint.deliver(&batch).await {
            warn!("Sync of {count} records failed: {err:#}");
            return self.fail(count, format!("{err:#}")).await;
        }

        if let Err(err) = self.inner.db.mark_batch_synced(&batch.records).await {
            error!("Delivered {count} records but could not mark them synced: {err:#}");
            return self.fail(count, format!("{err:#}")).await;
        }

        let now = Utc::now();
        match self.inner.last_sync_time.lock() {
            Ok(mut guard) => *guard = Some(now),
            Err(poisoned) => *poisoned.into_inner() = Some(now),
        }
        self.log_attempt(count, true, None).await;
        info!("Successfully synced {count} records");
        SyncStatus::Complete { records: count }
    }

    async fn fail(&self, records: u64, reason: String) -> SyncStatus {
        self.log_attempt(records, false, Some(reason.clone())).await;
        SyncStatus::Failed { records, reason }
    }

    async fn log_attempt(&self, records: u64, success: bool, error_message: Option<String>) {
        if let Err(err) = self
            .inner
            .db
            .append_sync_log(records, success, error_message)
            .await
        {
            error!("Failed to append sync log: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use super::*;
    use crate::db::test_support::{metric_sample, temp_database};

    /// Answers from a script, defaulting to success, and can write a row to
    /// the store while a delivery is in flight.
    struct ScriptedEndpoint {
        delay: Duration,
        outcomes: Mutex<VecDeque<bool>>,
        deliveries: Mutex<Vec<usize>>,
        concurrent_writer: Option<Database>,
    }

    impl ScriptedEndpoint {
        fn new(outcomes: &[bool]) -> Self {
            Self {
                delay: Duration::ZERO,
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                deliveries: Mutex::new(Vec::new()),
                concurrent_writer: None,
            }
        }

        fn delivered(&self) -> Vec<usize> {
            self.deliveries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncEndpoint for ScriptedEndpoint {
        async fn deliver(&self, batch: &SyncBatch) -> Result<()> {
            self.deliveries.lock().unwrap().push(batch.len());
            if let Some(db) = &self.concurrent_writer {
                db.insert_metric_sample(&metric_sample("u1", 77.0)).await?;
            }
            tokio::time::sleep(self.delay).await;

            let ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
            if !ok {
                bail!("collector unreachable");
            }
            Ok(())
        }
    }

    async fn seed(db: &Database, n: usize) {
        for i in 0..n {
            db.insert_metric_sample(&metric_sample("u1", i as f64))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn nothing_to_sync_is_idempotent_and_unlogged() {
        let (_dir, db) = temp_database();
        let endpoint = Arc::new(ScriptedEndpoint::new(&[]));
        let engine = SyncEngine::new(db.clone(), endpoint.clone(), "dev");
        let mut statuses = engine.subscribe();

        for _ in 0..3 {
            assert_eq!(engine.run_once().await, Some(SyncStatus::UpToDate));
        }

        assert!(db.recent_sync_log(10).await.unwrap().is_empty());
        assert!(endpoint.delivered().is_empty());
        assert!(engine.last_sync_time().is_none());
        for _ in 0..3 {
            assert_eq!(statuses.recv().await.unwrap(), SyncStatus::Started);
            assert_eq!(statuses.recv().await.unwrap(), SyncStatus::UpToDate);
        }
    }

    #[tokio::test]
    async fn successful_sync_marks_rows_and_logs_once() {
        let (_dir, db) = temp_database();
        seed(&db, 4).await;
        let engine = SyncEngine::new(db.clone(), Arc::new(ScriptedEndpoint::new(&[true])), "dev");

        assert_eq!(
            engine.run_once().await,
            Some(SyncStatus::Complete { records: 4 })
        );
        assert_eq!(db.count_unsynced().await.unwrap(), 0);
        assert!(engine.last_sync_time().is_some());
        assert_eq!(engine.state(), SyncState::Idle);

        let log = db.recent_sync_log(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].success);
        assert_eq!(log[0].records_synced, 4);
    }

    #[tokio::test]
    async fn failed_delivery_leaves_rows_for_the_next_attempt() {
        let (_dir, db) = temp_database();
        seed(&db, 3).await;
        let endpoint = Arc::new(ScriptedEndpoint::new(&[false, true]));
        let engine = SyncEngine::new(db.clone(), endpoint.clone(), "dev");

        match engine.run_once().await {
            Some(SyncStatus::Failed { records, reason }) => {
                assert_eq!(records, 3);
                assert!(reason.contains("collector unreachable"));
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(db.count_unsynced().await.unwrap(), 3);
        assert!(engine.last_sync_time().is_none());

        let log = db.recent_sync_log(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(!log[0].success);
        assert_eq!(log[0].error_message.as_deref(), Some("collector unreachable"));

        // The next trigger retries the same rows.
        assert_eq!(
            engine.run_once().await,
            Some(SyncStatus::Complete { records: 3 })
        );
        assert_eq!(endpoint.delivered(), vec![3, 3]);
    }

    #[tokio::test]
    async fn overlapping_triggers_are_dropped() {
        let (_dir, db) = temp_database();
        seed(&db, 2).await;
        let mut endpoint = ScriptedEndpoint::new(&[]);
        endpoint.delay = Duration::from_millis(150);
        let endpoint = Arc::new(endpoint);
        let engine = SyncEngine::new(db.clone(), endpoint.clone(), "dev");

        let (first, second) = tokio::join!(engine.run_once(), engine.run_once());
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|o| o.is_none()).count(), 1);
        assert!(outcomes.contains(&Some(SyncStatus::Complete { records: 2 })));
        assert_eq!(endpoint.delivered().len(), 1);
        assert_eq!(db.recent_sync_log(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn background_trigger_holds_the_guard_until_done() {
        let (_dir, db) = temp_database();
        seed(&db, 1).await;
        let mut endpoint = ScriptedEndpoint::new(&[]);
        endpoint.delay = Duration::from_millis(100);
        let engine = SyncEngine::new(db.clone(), Arc::new(endpoint), "dev");
        let mut statuses = engine.subscribe();

        assert!(engine.trigger());
        assert!(!engine.trigger());
        assert_eq!(engine.state(), SyncState::Syncing);
        assert_eq!(engine.run_once().await, None);

        loop {
            let status = statuses.recv().await.unwrap();
            if status.is_terminal() {
                assert_eq!(status, SyncStatus::Complete { records: 1 });
                break;
            }
        }
        // The permit is dropped right after the terminal status is sent.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.state(), SyncState::Idle);
        assert_eq!(db.recent_sync_log(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rows_written_during_delivery_stay_unsynced() {
        let (_dir, db) = temp_database();
        seed(&db, 2).await;
        let mut endpoint = ScriptedEndpoint::new(&[]);
        endpoint.concurrent_writer = Some(db.clone());
        let engine = SyncEngine::new(db.clone(), Arc::new(endpoint), "dev");

        assert_eq!(
            engine.run_once().await,
            Some(SyncStatus::Complete { records: 2 })
        );
        assert_eq!(db.count_unsynced().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn timer_triggers_periodically_until_cancelled() {
        let (_dir, db) = temp_database();
        seed(&db, 1).await;
        let engine = SyncEngine::new(db.clone(), Arc::new(ScriptedEndpoint::new(&[])), "dev");
        let mut statuses = engine.subscribe();
        let cancel = CancellationToken::new();
        let timer = engine.spawn_timer(Duration::from_millis(50), cancel.clone());

        let completed = time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(SyncStatus::Complete { records }) = statuses.recv().await {
                    break records;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(completed, 1);

        cancel.cancel();
        timer.await.unwrap();
    }
}
