use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::{
    sync::{broadcast, mpsc, Mutex as AsyncMutex},
    task::{self, JoinHandle},
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{
    db::{Database, DatabaseStats, SyncLogEntry, UsageStats},
    sampler::Sampler,
    sensing::{BlinkSampler, BlinkSnapshot, BlinkView, CaptureDevice, NoCaptureDevice},
    settings::PipelineSettings,
    sync::{endpoint_from_settings, SyncEndpoint, SyncEngine, SyncStatus},
    telemetry::{HostMetrics, ReachabilityProbe, TcpProbe, TelemetrySampler, TelemetryView},
};

use super::{
    events::PipelineEvent,
    flush::{FlushStats, FlushTask},
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct ActiveMonitoring {
    user_id: String,
    session_id: Option<i64>,
    flush_cancel: CancellationToken,
    flush: JoinHandle<FlushStats>,
}

struct Background {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct CoordinatorInner {
    settings: PipelineSettings,
    db: Database,
    blink: Mutex<BlinkSampler>,
    telemetry: Mutex<TelemetrySampler>,
    blink_view: BlinkView,
    telemetry_view: TelemetryView,
    sync: SyncEngine,
    events_tx: broadcast::Sender<PipelineEvent>,
    monitoring: AsyncMutex<Option<ActiveMonitoring>>,
    background: AsyncMutex<Option<Background>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Owns both samplers, the store handle and the sync engine, and exposes
/// their snapshots. Cloning shares the same pipeline.
#[derive(Clone)]
pub struct PipelineCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl PipelineCoordinator {
    /// Wires the production collaborators. Failing to open the store is the
    /// only fatal error of the pipeline.
    pub fn open(settings: PipelineSettings) -> Result<Self> {
        let db = Database::new(settings.storage.database_path.clone()).with_context(|| {
            format!(
                "failed to open durable store at {}",
                settings.storage.database_path.display()
            )
        })?;
        let endpoint = endpoint_from_settings(&settings.sync)?;
        let probe = Arc::new(TcpProbe::from_settings(&settings.telemetry));
        Ok(Self::new(settings, db, endpoint, Arc::new(NoCaptureDevice), probe))
    }

    pub fn new(
        settings: PipelineSettings,
        db: Database,
        endpoint: Arc<dyn SyncEndpoint>,
        camera: Arc<dyn CaptureDevice>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        let stop_timeout = settings.stop_timeout();
        let blink = BlinkSampler::new(settings.blink.clone(), camera, stop_timeout);
        let telemetry = TelemetrySampler::new(settings.telemetry.clone(), probe, stop_timeout);
        let sync = SyncEngine::new(db.clone(), endpoint, settings.device_id.clone());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(CoordinatorInner {
                blink_view: blink.view(),
                telemetry_view: telemetry.view(),
                blink: Mutex::new(blink),
                telemetry: Mutex::new(telemetry),
                settings,
                db,
                sync,
                events_tx,
                monitoring: AsyncMutex::new(None),
                background: AsyncMutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.inner.sync
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Startup housekeeping and the periodic sync timer. Calling it again is
    /// a no-op.
    pub async fn start(&self) {
        let mut background = self.inner.background.lock().await;
        if background.is_some() {
            info!("pipeline already started");
            return;
        }

        // Only sessions from a previous process may be open at this point.
        if self.inner.monitoring.lock().await.is_some() {
            warn!("Monitoring already active; skipping open-session recovery");
        } else {
            match self.inner.db.recover_open_sessions().await {
                Ok(0) => {}
                Ok(recovered) => warn!("Closed {recovered} sessions left open by a previous run"),
                Err(err) => error!("Failed to recover open sessions: {err:#}"),
            }
        }

        let retention_days = self.inner.settings.storage.retention_days;
        if let Err(err) = self.inner.db.purge_synced_before(retention_days).await {
            error!("Retention purge failed: {err:#}");
        }

        let cancel = CancellationToken::new();
        let mut tasks = vec![self.spawn_status_forwarder(cancel.clone())];

        let sync_settings = &self.inner.settings.sync;
        if sync_settings.enabled {
            tasks.push(
                self.inner
                    .sync
                    .spawn_timer(sync_settings.interval(), cancel.clone()),
            );
            info!("Sync timer armed every {}s", sync_settings.interval().as_secs());
        } else {
            info!("Periodic sync disabled");
        }

        *background = Some(Background { cancel, tasks });
    }

    fn spawn_status_forwarder(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut statuses = self.inner.sync.subscribe();
        let events_tx = self.inner.events_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = statuses.recv() => match status {
                        Ok(status) => {
                            let _ = events_tx.send(PipelineEvent::Sync { status });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Sync status forwarder skipped {skipped} updates");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Opens a session for `user_id` and starts both samplers. Returns the
    /// session id, or `None` when the session row could not be written; the
    /// samplers run regardless. A call while monitoring is a no-op.
    pub async fn start_monitoring(&self, user_id: &str) -> Result<Option<i64>> {
        let mut monitoring = self.inner.monitoring.lock().await;
        if let Some(active) = monitoring.as_ref() {
            info!("Monitoring already active for {}", active.user_id);
            return Ok(active.session_id);
        }

        let session_id = match self.inner.db.open_session(user_id).await {
            Ok(id) => Some(id),
            Err(err) => {
                error!("Failed to open session for {user_id}: {err:#}");
                None
            }
        };

        let (events, rx) = mpsc::unbounded_channel();
        let flush_cancel = CancellationToken::new();
        let flush = FlushTask {
            db: self.inner.db.clone(),
            user_id: user_id.to_string(),
            session_id,
            interval: Duration::from_secs(self.inner.settings.storage.flush_interval_secs.max(1)),
            events_tx: self.inner.events_tx.clone(),
        }
        .spawn(rx, flush_cancel.clone());

        let inner = Arc::clone(&self.inner);
        let started = task::spawn_blocking(move || -> Result<()> {
            lock(&inner.blink).start(events.clone())?;
            if let Err(err) = lock(&inner.telemetry).start(events) {
                lock(&inner.blink).stop();
                return Err(err);
            }
            Ok(())
        })
        .await
        .context("sampler start task panicked")
        .and_then(|started| started);

        if let Err(err) = started {
            flush_cancel.cancel();
            let _ = flush.await;
            if let Some(id) = session_id {
                self.close_session(id, &self.inner.blink_view.current_data()).await;
            }
            return Err(err);
        }

        let source_mode = self.inner.blink_view.current_data().source_mode;
        info!("Monitoring started for {user_id} ({source_mode:?} blink source)");
        let _ = self.inner.events_tx.send(PipelineEvent::MonitoringStarted {
            user_id: user_id.to_string(),
            session_id,
            source_mode,
        });

        *monitoring = Some(ActiveMonitoring {
            user_id: user_id.to_string(),
            session_id,
            flush_cancel,
            flush,
        });
        Ok(session_id)
    }

    /// Stops both samplers, drains buffered rows and writes the session
    /// summary. Returns the final blink snapshot, or `None` when idle.
    pub async fn stop_monitoring(&self) -> Option<BlinkSnapshot> {
        let mut monitoring = self.inner.monitoring.lock().await;
        let Some(active) = monitoring.take() else {
            info!("Monitoring not active; stop ignored");
            return None;
        };

        let inner = Arc::clone(&self.inner);
        if let Err(err) = task::spawn_blocking(move || {
            lock(&inner.blink).stop();
            lock(&inner.telemetry).stop();
        })
        .await
        {
            error!("Sampler stop task panicked: {err}");
        }

        active.flush_cancel.cancel();
        let drain_timeout = self.inner.settings.stop_timeout() * 2;
        match time::timeout(drain_timeout, active.flush).await {
            Ok(Ok(stats)) if stats.dropped_rows > 0 => {
                warn!("{} buffered rows were lost", stats.dropped_rows)
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!("Flush task failed: {err}"),
            Err(_) => warn!("Flush task did not finish within {}ms", drain_timeout.as_millis()),
        }

        let summary = self.inner.blink_view.current_data();
        if let Some(session_id) = active.session_id {
            self.close_session(session_id, &summary).await;
        }

        info!(
            "Monitoring stopped for {}: {} blinks, {:.1} bpm",
            active.user_id, summary.total_blinks, summary.blinks_per_minute
        );
        let _ = self.inner.events_tx.send(PipelineEvent::MonitoringStopped {
            user_id: active.user_id,
            session_id: active.session_id,
            summary: summary.clone(),
        });
        Some(summary)
    }

    async fn close_session(&self, session_id: i64, summary: &BlinkSnapshot) {
        if let Err(err) = self
            .inner
            .db
            .close_session(session_id, summary.total_blinks, summary.blinks_per_minute)
            .await
        {
            error!("Failed to close session {session_id}: {err:#}");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.inner.monitoring.lock().await.is_some()
    }

    pub fn blink_data(&self) -> BlinkSnapshot {
        self.inner.blink_view.current_data()
    }

    pub fn host_data(&self) -> HostMetrics {
        self.inner.telemetry_view.current_data()
    }

    /// Empty stats when the store cannot answer.
    pub async fn stats(&self, user_id: &str, days: u32) -> UsageStats {
        self.inner
            .db
            .stats(user_id, days)
            .await
            .unwrap_or_else(|err| {
                error!("Failed to compute stats for {user_id}: {err:#}");
                UsageStats::default()
            })
    }

    pub async fn database_stats(&self) -> DatabaseStats {
        self.inner.db.database_stats().await.unwrap_or_else(|err| {
            error!("Failed to read database stats: {err:#}");
            DatabaseStats::default()
        })
    }

    pub async fn recent_sync_log(&self, limit: usize) -> Vec<SyncLogEntry> {
        self.inner
            .db
            .recent_sync_log(limit)
            .await
            .unwrap_or_else(|err| {
                error!("Failed to read sync log: {err:#}");
                Vec::new()
            })
    }

    /// Runs one sync attempt now. `None` when one is already in flight.
    pub async fn sync_now(&self) -> Option<SyncStatus> {
        self.inner.sync.run_once().await
    }

    /// Stops monitoring and the background tasks.
    pub async fn shutdown(&self) {
        self.stop_monitoring().await;

        let background = self.inner.background.lock().await.take();
        if let Some(background) = background {
            background.cancel.cancel();
            for handle in background.tasks {
                if let Err(err) = handle.await {
                    error!("Background task failed: {err}");
                }
            }
        }
        info!("Pipeline shut down");
    }
}
