//! Moves sampler events into the store in periodic batches.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::{
    sync::{broadcast, mpsc::UnboundedReceiver},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    db::{Database, NewBlinkEvent, NewMetricSample},
    sampler::SamplerEvent,
};

use super::events::PipelineEvent;

/// Rows kept in memory while the store keeps failing. Oldest go first.
const MAX_PENDING_ROWS: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub rows_written: usize,
    pub failed_flushes: usize,
    pub dropped_rows: usize,
}

pub(crate) struct FlushTask {
    pub db: Database,
    pub user_id: String,
    pub session_id: Option<i64>,
    pub interval: Duration,
    pub events_tx: broadcast::Sender<PipelineEvent>,
}

#[derive(Default)]
struct Pending {
    blinks: Vec<NewBlinkEvent>,
    samples: Vec<NewMetricSample>,
}

impl Pending {
    fn len(&self) -> usize {
        self.blinks.len() + self.samples.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn trim_to(&mut self, limit: usize) -> usize {
        let mut dropped = 0;
        while self.len() > limit {
            // Drop from whichever kind holds the older head.
            let drop_blink = match (self.blinks.first(), self.samples.first()) {
                (Some(blink), Some(sample)) => blink.timestamp <= sample.timestamp,
                (Some(_), None) => true,
                _ => false,
            };
            if drop_blink {
                self.blinks.remove(0);
            } else {
                self.samples.remove(0);
            }
            dropped += 1;
        }
        dropped
    }
}

impl FlushTask {
    pub(crate) fn spawn(
        self,
        rx: UnboundedReceiver<SamplerEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<FlushStats> {
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: UnboundedReceiver<SamplerEvent>, cancel: CancellationToken) -> FlushStats {
        let mut pending = Pending::default();
        let mut stats = FlushStats::default();

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.accept(event, &mut pending),
                    None => break,
                },
                _ = ticker.tick() => self.flush(&mut pending, &mut stats).await,
                _ = cancel.cancelled() => {
                    while let Ok(event) = rx.try_recv() {
                        self.accept(event, &mut pending);
                    }
                    break;
                }
            }
        }

        self.flush(&mut pending, &mut stats).await;
        if !pending.is_empty() {
            stats.dropped_rows += pending.len();
            warn!("Dropping {} rows that could not be stored", pending.len());
        }
        info!(
            "Flush task finished: {} rows written, {} failed flushes",
            stats.rows_written, stats.failed_flushes
        );
        stats
    }

    fn accept(&self, event: SamplerEvent, pending: &mut Pending) {
        let notification = match event {
            SamplerEvent::Blink(blink) => {
                pending.blinks.push(NewBlinkEvent {
                    user_id: self.user_id.clone(),
                    session_id: self.session_id,
                    timestamp: blink.timestamp,
                });
                PipelineEvent::BlinkDetected {
                    timestamp: blink.timestamp,
                    total_blinks: blink.total_blinks,
                }
            }
            SamplerEvent::Metrics(metrics) => {
                pending.samples.push(metrics.to_sample(&self.user_id));
                PipelineEvent::MetricsUpdated { metrics }
            }
        };
        let _ = self.events_tx.send(notification);
    }

    async fn flush(&self, pending: &mut Pending, stats: &mut FlushStats) {
        if pending.is_empty() {
            return;
        }

        let blinks = pending.blinks.clone();
        let samples = pending.samples.clone();
        match self.db.insert_pending(blinks, samples).await {
            Ok(written) => {
                debug!("Flushed {written} rows");
                stats.rows_written += written;
                pending.blinks.clear();
                pending.samples.clear();
            }
            Err(err) => {
                error!("Failed to flush {} rows: {err:#}", pending.len());
                stats.failed_flushes += 1;
                stats.dropped_rows += pending.trim_to(MAX_PENDING_ROWS);
            }
        }
    }
}
