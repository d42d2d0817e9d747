//! Lifecycle shape shared by the blink and host-telemetry samplers.
//!
//! Each sampler owns one named OS thread. `stop()` cancels cooperatively and
//! waits a bounded time for the loop to notice; an in-flight tick is never
//! interrupted.

use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, warn};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::telemetry::HostMetrics;

/// Slice used when sleeping so a cancelled loop exits promptly.
const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BlinkRecorded {
    pub timestamp: DateTime<Utc>,
    pub total_blinks: u64,
}

/// Emitted by sampler threads, in emission order, at most once per tick.
#[derive(Debug, Clone)]
pub enum SamplerEvent {
    Blink(BlinkRecorded),
    Metrics(HostMetrics),
}

pub type EventSink = UnboundedSender<SamplerEvent>;

pub trait Sampler {
    type Snapshot;

    /// Idle to running. Starting a running sampler is a no-op.
    fn start(&mut self, events: EventSink) -> Result<()>;

    /// Running to idle. Stopping an idle sampler is a no-op.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    fn current_data(&self) -> Self::Snapshot;
}

pub(crate) struct SamplerThread {
    name: String,
    cancel: CancellationToken,
    exited_rx: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

impl SamplerThread {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let (exited_tx, exited_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                body(token);
                let _ = exited_tx.send(());
            })
            .with_context(|| format!("failed to spawn {name} thread"))?;

        Ok(Self {
            name: name.to_string(),
            cancel,
            exited_rx,
            handle,
        })
    }

    /// Signals the loop and waits up to `timeout` for it to exit. Returns
    /// `false` if the loop was still inside a tick when the wait ran out; the
    /// thread is then left to finish on its own.
    pub(crate) fn stop(self, timeout: Duration) -> bool {
        self.cancel.cancel();

        match self.exited_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Err(join_err) = self.handle.join() {
                    error!("{} thread panicked: {join_err:?}", self.name);
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{} thread did not exit within {}ms; detaching",
                    self.name,
                    timeout.as_millis()
                );
                false
            }
        }
    }
}

/// Sleeps for `duration` unless cancelled first. Returns `true` when the
/// token was cancelled.
pub(crate) fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}
