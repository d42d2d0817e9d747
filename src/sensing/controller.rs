use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    db::StrainLevel,
    sampler::{sleep_or_cancel, BlinkRecorded, EventSink, Sampler, SamplerEvent, SamplerThread},
    settings::BlinkSettings,
};

use super::{
    aggregator::{format_elapsed, SessionAggregator},
    blink::{BlinkCounter, SimulatedSchedule},
    detector::{CaptureDevice, EyeStateDetector},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Live,
    Simulated,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BlinkSnapshot {
    pub total_blinks: u64,
    pub blinks_per_minute: f64,
    pub strain_level: StrainLevel,
    pub session_duration: String,
    pub elapsed_secs: i64,
    pub last_blink_time: Option<DateTime<Utc>>,
    pub recent_blinks: usize,
    pub recent_blinks_per_minute: f64,
    pub is_running: bool,
    pub source_mode: SourceMode,
}

#[derive(Debug, Clone)]
struct BlinkState {
    /// Run that owns this state; a detached loop from an earlier run must not publish.
    generation: u64,
    aggregator: SessionAggregator,
    running: bool,
    source_mode: SourceMode,
    stopped_at: Option<DateTime<Utc>>,
}

impl BlinkState {
    fn idle() -> Self {
        Self {
            generation: 0,
            aggregator: SessionAggregator::new(Utc::now()),
            running: false,
            source_mode: SourceMode::Simulated,
            stopped_at: None,
        }
    }

    fn snapshot(&self) -> BlinkSnapshot {
        // A stopped session's figures are frozen at the stop instant.
        let now = self.stopped_at.unwrap_or_else(Utc::now);
        let agg = &self.aggregator;
        let elapsed = agg.elapsed(now);

        BlinkSnapshot {
            total_blinks: agg.total_blinks(),
            blinks_per_minute: agg.blinks_per_minute(now),
            strain_level: agg.strain_level(now),
            session_duration: format_elapsed(elapsed),
            elapsed_secs: elapsed.num_seconds(),
            last_blink_time: agg.last_blink_time(),
            recent_blinks: agg.recent_blinks(now),
            recent_blinks_per_minute: agg.recent_blinks_per_minute(now),
            is_running: self.running,
            source_mode: self.source_mode,
        }
    }
}

/// Read-only handle on the latest blink state. Reads never wait on the loop.
#[derive(Clone)]
pub struct BlinkView {
    rx: watch::Receiver<BlinkState>,
}

impl BlinkView {
    pub fn current_data(&self) -> BlinkSnapshot {
        self.rx.borrow().snapshot()
    }

    pub fn recent_blink_timestamps(&self) -> Vec<DateTime<Utc>> {
        self.rx
            .borrow()
            .aggregator
            .recent_blink_timestamps()
            .copied()
            .collect()
    }
}

pub struct BlinkSampler {
    settings: BlinkSettings,
    device: Arc<dyn CaptureDevice>,
    stop_timeout: Duration,
    state: Arc<watch::Sender<BlinkState>>,
    worker: Option<SamplerThread>,
    generation: u64,
}

impl BlinkSampler {
    pub fn new(settings: BlinkSettings, device: Arc<dyn CaptureDevice>, stop_timeout: Duration) -> Self {
        let (state, _) = watch::channel(BlinkState::idle());
        Self {
            settings,
            device,
            stop_timeout,
            state: Arc::new(state),
            worker: None,
            generation: 0,
        }
    }

    pub fn view(&self) -> BlinkView {
        BlinkView {
            rx: self.state.subscribe(),
        }
    }

    pub fn source_mode(&self) -> SourceMode {
        self.state.borrow().source_mode
    }

    fn acquire_detector(&self) -> Option<Box<dyn EyeStateDetector>> {
        if self.settings.force_simulation {
            log_info!("simulation forced by settings; camera not opened");
            return None;
        }

        match self.device.acquire(self.settings.camera_index) {
            Ok(detector) => Some(detector),
            Err(err) => {
                log_info!("capture device unavailable ({err:#}); using simulation mode");
                None
            }
        }
    }
}

impl Sampler for BlinkSampler {
    type Snapshot = BlinkSnapshot;

    fn start(&mut self, events: EventSink) -> Result<()> {
        if self.worker.is_some() {
            log_info!("blink sampler already running");
            return Ok(());
        }

        let source = match self.acquire_detector() {
            Some(detector) => BlinkSource::Live {
                detector,
                counter: BlinkCounter::new(self.settings.closed_frames_threshold),
            },
            None => BlinkSource::simulated(&self.settings),
        };

        self.generation += 1;
        let started_at = Utc::now();
        self.state.send_replace(BlinkState {
            generation: self.generation,
            aggregator: SessionAggregator::new(started_at),
            running: true,
            source_mode: source.mode(),
            stopped_at: None,
        });

        let blink_loop = BlinkLoop {
            source,
            aggregator: SessionAggregator::new(started_at),
            state: Arc::clone(&self.state),
            generation: self.generation,
            events,
            settings: self.settings.clone(),
        };

        match SamplerThread::spawn("blinkwatch-blink", move |cancel| blink_loop.run(&cancel)) {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(err) => {
                self.state.send_modify(|state| state.running = false);
                Err(err)
            }
        }
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            log_debug!("blink sampler not running; stop ignored");
            return;
        };

        if !worker.stop(self.stop_timeout) {
            log_warn!("blink loop still inside a tick; camera is released when it exits");
        }

        let stopped_at = Utc::now();
        self.state.send_modify(|state| {
            state.running = false;
            state.stopped_at = Some(stopped_at);
        });
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    fn current_data(&self) -> BlinkSnapshot {
        self.state.borrow().snapshot()
    }
}

enum BlinkSource {
    Live {
        detector: Box<dyn EyeStateDetector>,
        counter: BlinkCounter,
    },
    Simulated(SimulatedSchedule),
}

impl BlinkSource {
    fn simulated(settings: &BlinkSettings) -> Self {
        BlinkSource::Simulated(SimulatedSchedule::new(
            Duration::from_millis(settings.simulated_min_interval_ms),
            Duration::from_millis(settings.simulated_max_interval_ms),
            Instant::now(),
        ))
    }

    fn mode(&self) -> SourceMode {
        match self {
            BlinkSource::Live { .. } => SourceMode::Live,
            BlinkSource::Simulated(_) => SourceMode::Simulated,
        }
    }
}

struct BlinkLoop {
    source: BlinkSource,
    aggregator: SessionAggregator,
    state: Arc<watch::Sender<BlinkState>>,
    generation: u64,
    events: EventSink,
    settings: BlinkSettings,
}

impl BlinkLoop {
    fn run(mut self, cancel: &CancellationToken) {
        log_info!("blink loop started in {:?} mode", self.source.mode());
        let tick_interval = self.settings.tick_interval();

        while !cancel.is_cancelled() {
            if self.tick(cancel) {
                self.record(Utc::now(), cancel);
            }
            if sleep_or_cancel(cancel, tick_interval) {
                break;
            }
        }

        if let BlinkSource::Live { detector, .. } = &mut self.source {
            detector.release();
        }
        log_info!(
            "blink loop stopped after {} blinks",
            self.aggregator.total_blinks()
        );
    }

    /// One observation. Returns `true` when a blink completed.
    fn tick(&mut self, cancel: &CancellationToken) -> bool {
        let failure = match &mut self.source {
            BlinkSource::Simulated(schedule) => return schedule.poll(Instant::now()),
            BlinkSource::Live { detector, counter } => match detector.eyes_open() {
                Ok(open) => return counter.observe(open),
                Err(err) => err,
            },
        };

        log_warn!("detector failed ({failure:#}); switching to simulation mode");
        if let BlinkSource::Live { detector, .. } = &mut self.source {
            detector.release();
        }
        self.source = BlinkSource::simulated(&self.settings);
        self.publish(cancel, |state| state.source_mode = SourceMode::Simulated);
        false
    }

    fn record(&mut self, at: DateTime<Utc>, cancel: &CancellationToken) {
        let total_blinks = self.aggregator.record_blink(at);
        let published = self.aggregator.clone();
        if !self.publish(cancel, |state| state.aggregator = published) {
            log_debug!("blink after stop discarded");
            return;
        }

        log_debug!("blink #{total_blinks} at {at}");
        let _ = self.events.send(SamplerEvent::Blink(BlinkRecorded {
            timestamp: at,
            total_blinks,
        }));
    }

    /// Applies `update` only while this loop still owns the shared state.
    fn publish(&self, cancel: &CancellationToken, update: impl FnOnce(&mut BlinkState)) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let generation = self.generation;
        self.state.send_if_modified(|state| {
            if state.generation != generation {
                return false;
            }
            update(state);
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
    };

    use anyhow::bail;
    use tokio::sync::mpsc;

    use super::*;
    use crate::sensing::NoCaptureDevice;

    struct ScriptedDetector {
        frames: VecDeque<Result<bool, &'static str>>,
        released: Arc<AtomicBool>,
    }

    impl EyeStateDetector for ScriptedDetector {
        fn eyes_open(&mut self) -> Result<bool> {
            match self.frames.pop_front() {
                Some(Ok(open)) => Ok(open),
                Some(Err(reason)) => bail!(reason),
                None => Ok(true),
            }
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedCamera {
        pattern: &'static str,
        released: Arc<AtomicBool>,
    }

    impl CaptureDevice for ScriptedCamera {
        fn acquire(&self, _camera_index: u32) -> Result<Box<dyn EyeStateDetector>> {
            let frames = self
                .pattern
                .chars()
                .filter_map(|c| match c {
                    'o' => Some(Ok(true)),
                    'c' => Some(Ok(false)),
                    'x' => Some(Err("camera unplugged")),
                    _ => None,
                })
                .collect();
            Ok(Box::new(ScriptedDetector {
                frames,
                released: Arc::clone(&self.released),
            }))
        }
    }

    fn fast_settings() -> BlinkSettings {
        BlinkSettings {
            closed_frames_threshold: 3,
            tick_interval_ms: 1,
            simulated_min_interval_ms: 20,
            simulated_max_interval_ms: 20,
            ..BlinkSettings::default()
        }
    }

    fn wait_for(sampler: &BlinkSampler, predicate: impl Fn(&BlinkSnapshot) -> bool) -> BlinkSnapshot {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let snapshot = sampler.current_data();
            if predicate(&snapshot) || Instant::now() > deadline {
                return snapshot;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn scripted(pattern: &'static str) -> (BlinkSampler, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let camera = ScriptedCamera {
            pattern,
            released: Arc::clone(&released),
        };
        let sampler = BlinkSampler::new(fast_settings(), Arc::new(camera), Duration::from_secs(2));
        (sampler, released)
    }

    #[test]
    fn live_detector_blinks_are_counted_and_emitted() {
        let (mut sampler, released) = scripted("ooo ccc o cc o cccc o");
        let (tx, mut rx) = mpsc::unbounded_channel();
        sampler.start(tx).unwrap();

        let snapshot = wait_for(&sampler, |s| s.total_blinks >= 2);
        assert_eq!(snapshot.total_blinks, 2);
        assert_eq!(snapshot.source_mode, SourceMode::Live);
        assert!(snapshot.is_running);

        sampler.stop();
        assert!(!sampler.is_running());
        assert!(released.load(Ordering::SeqCst));

        let mut totals = Vec::new();
        while let Ok(SamplerEvent::Blink(blink)) = rx.try_recv() {
            totals.push(blink.total_blinks);
        }
        assert_eq!(totals, vec![1, 2]);
    }

    #[test]
    fn missing_camera_falls_back_to_simulation() {
        let mut sampler =
            BlinkSampler::new(fast_settings(), Arc::new(NoCaptureDevice), Duration::from_secs(2));
        let (tx, _rx) = mpsc::unbounded_channel();
        sampler.start(tx).unwrap();
        assert_eq!(sampler.source_mode(), SourceMode::Simulated);

        let snapshot = wait_for(&sampler, |s| s.total_blinks >= 2);
        assert!(snapshot.total_blinks >= 2);
        assert!(snapshot.last_blink_time.is_some());

        sampler.stop();
        let frozen = sampler.current_data();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(sampler.current_data(), frozen);
        assert!(!frozen.is_running);
    }

    #[test]
    fn detector_failure_switches_to_simulation() {
        let (mut sampler, released) = scripted("ccc o x");
        let (tx, _rx) = mpsc::unbounded_channel();
        sampler.start(tx).unwrap();

        let snapshot = wait_for(&sampler, |s| {
            s.source_mode == SourceMode::Simulated && s.total_blinks >= 2
        });
        assert_eq!(snapshot.source_mode, SourceMode::Simulated);
        assert!(snapshot.total_blinks >= 2);
        assert!(released.load(Ordering::SeqCst));
        sampler.stop();
    }

    #[test]
    fn lifecycle_misuse_is_a_no_op() {
        let (mut sampler, _released) = scripted("");
        sampler.stop();
        assert!(!sampler.is_running());

        let (tx, _rx) = mpsc::unbounded_channel();
        sampler.start(tx.clone()).unwrap();
        sampler.start(tx).unwrap();
        assert!(sampler.is_running());
        sampler.stop();
        sampler.stop();
        assert!(!sampler.is_running());
    }

    /// Hands out the scripted detector once; later acquisitions fail.
    struct OneShotCamera {
        inner: ScriptedCamera,
        used: AtomicBool,
    }

    impl CaptureDevice for OneShotCamera {
        fn acquire(&self, camera_index: u32) -> Result<Box<dyn EyeStateDetector>> {
            if self.used.swap(true, Ordering::SeqCst) {
                bail!("camera busy");
            }
            self.inner.acquire(camera_index)
        }
    }

    #[test]
    fn restart_resets_session_counters() {
        let camera = OneShotCamera {
            inner: ScriptedCamera {
                pattern: "ccc o ccc o",
                released: Arc::new(AtomicBool::new(false)),
            },
            used: AtomicBool::new(false),
        };
        let settings = BlinkSettings {
            simulated_min_interval_ms: 60_000,
            simulated_max_interval_ms: 60_000,
            ..fast_settings()
        };
        let mut sampler = BlinkSampler::new(settings, Arc::new(camera), Duration::from_secs(2));
        let (tx, _rx) = mpsc::unbounded_channel();
        sampler.start(tx.clone()).unwrap();
        assert_eq!(wait_for(&sampler, |s| s.total_blinks >= 2).total_blinks, 2);
        sampler.stop();

        sampler.start(tx).unwrap();
        let fresh = sampler.current_data();
        assert_eq!(fresh.total_blinks, 0);
        assert!(fresh.last_blink_time.is_none());
        assert_eq!(fresh.source_mode, SourceMode::Simulated);
        sampler.stop();
    }

    /// Closed for three frames, then stalls on the frame that completes the blink.
    struct StallingDetector {
        calls: Arc<AtomicUsize>,
        stall: Duration,
    }

    impl EyeStateDetector for StallingDetector {
        fn eyes_open(&mut self) -> Result<bool> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 4 {
                return Ok(false);
            }
            if call == 4 {
                thread::sleep(self.stall);
            }
            Ok(true)
        }

        fn release(&mut self) {}
    }

    struct StallingCamera {
        calls: Arc<AtomicUsize>,
        used: AtomicBool,
    }

    impl CaptureDevice for StallingCamera {
        fn acquire(&self, _camera_index: u32) -> Result<Box<dyn EyeStateDetector>> {
            if self.used.swap(true, Ordering::SeqCst) {
                bail!("camera busy");
            }
            Ok(Box::new(StallingDetector {
                calls: Arc::clone(&self.calls),
                stall: Duration::from_millis(400),
            }))
        }
    }

    #[test]
    fn detached_loop_cannot_touch_the_next_session() {
        let calls = Arc::new(AtomicUsize::new(0));
        let camera = StallingCamera {
            calls: Arc::clone(&calls),
            used: AtomicBool::new(false),
        };
        let settings = BlinkSettings {
            simulated_min_interval_ms: 60_000,
            simulated_max_interval_ms: 60_000,
            ..fast_settings()
        };
        let mut sampler = BlinkSampler::new(settings, Arc::new(camera), Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();
        sampler.start(tx.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while calls.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(calls.load(Ordering::SeqCst) >= 4);

        // The loop is stuck in its stalled frame, so stop gives up waiting.
        sampler.stop();
        sampler.start(tx).unwrap();
        assert_eq!(sampler.current_data().total_blinks, 0);

        // Let the stalled frame finish and complete its blink.
        thread::sleep(Duration::from_millis(600));
        let snapshot = sampler.current_data();
        assert_eq!(snapshot.total_blinks, 0);
        assert!(snapshot.last_blink_time.is_none());
        assert_eq!(snapshot.source_mode, SourceMode::Simulated);
        assert!(snapshot.is_running);
        assert!(rx.try_recv().is_err());
        sampler.stop();
    }

    #[test]
    fn view_reads_the_same_state() {
        let (mut sampler, _released) = scripted("ccc o");
        let view = sampler.view();
        let (tx, _rx) = mpsc::unbounded_channel();
        sampler.start(tx).unwrap();
        wait_for(&sampler, |s| s.total_blinks >= 1);
        assert_eq!(view.current_data().total_blinks, 1);
        assert_eq!(view.recent_blink_timestamps().len(), 1);
        sampler.stop();
    }
}
