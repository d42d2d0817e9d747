use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use sysinfo::{Disks, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    sampler::{sleep_or_cancel, EventSink, Sampler, SamplerEvent, SamplerThread},
    settings::TelemetrySettings,
};

use super::{
    battery::read_power_status,
    probe::ReachabilityProbe,
    types::{HostMetrics, PowerImpact},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Reads every host metric once per call. Owned by the telemetry thread.
pub struct HostReader {
    system: System,
    disks: Disks,
    probe: Arc<dyn ReachabilityProbe>,
    settings: TelemetrySettings,
}

impl HostReader {
    pub fn new(settings: TelemetrySettings, probe: Arc<dyn ReachabilityProbe>) -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; take the baseline now.
        system.refresh_cpu_usage();

        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            probe,
            settings,
        }
    }

    /// Builds the next tick from `previous`. A metric whose read fails keeps
    /// its previous value; the others are still refreshed.
    pub fn read(&mut self, previous: &HostMetrics) -> HostMetrics {
        let mut next = previous.clone();
        next.sampled_at = Some(Utc::now());

        next.cpu_percent = self.read_cpu();

        match self.read_memory() {
            Ok((percent, used_mb, total_mb)) => {
                next.memory_percent = percent;
                next.memory_used_mb = used_mb;
                next.memory_total_mb = total_mb;
            }
            Err(err) => log_warn!("memory read failed: {err:#}"),
        }

        match self.read_disk() {
            Ok(percent) => next.disk_usage_percent = percent,
            Err(err) => log_warn!("disk read failed: {err:#}"),
        }

        next.network_available = self.settings.network_monitoring && self.probe.is_reachable();

        if self.settings.battery_monitoring {
            match read_power_status() {
                Ok(status) => {
                    next.battery_percent = status.battery_percent;
                    next.power_connected = status.power_connected;
                }
                Err(err) => log_warn!("battery read failed: {err:#}"),
            }
        } else {
            next.battery_percent = None;
            next.power_connected = None;
        }

        next.process_count = self.read_process_count();
        next.power_impact = PowerImpact::from_cpu(next.cpu_percent);
        next.boot_time = DateTime::from_timestamp(System::boot_time() as i64, 0);
        next.uptime_secs = System::uptime();
        next
    }

    fn read_cpu(&mut self) -> f64 {
        self.system.refresh_cpu_usage();
        f64::from(self.system.global_cpu_usage()).clamp(0.0, 100.0)
    }

    fn read_memory(&mut self) -> Result<(f64, f64, f64)> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            bail!("total memory reported as zero");
        }
        let used = self.system.used_memory();
        let percent = used as f64 / total as f64 * 100.0;
        Ok((percent, used as f64 / BYTES_PER_MB, total as f64 / BYTES_PER_MB))
    }

    fn read_disk(&mut self) -> Result<f64> {
        self.disks.refresh_list();
        let volumes: Vec<DiskVolume<'_>> = self
            .disks
            .list()
            .iter()
            .map(|disk| DiskVolume {
                mount_point: disk.mount_point(),
                total: disk.total_space(),
                available: disk.available_space(),
            })
            .collect();
        disk_usage_percent(&volumes, Path::new(&self.settings.disk_mount_point))
    }

    fn read_process_count(&mut self) -> usize {
        self.system.refresh_processes(ProcessesToUpdate::All);
        self.system.processes().len()
    }
}

pub(crate) struct DiskVolume<'a> {
    pub mount_point: &'a Path,
    pub total: u64,
    pub available: u64,
}

/// Usage of the volume holding `target`: the volume with the longest mount
/// point that prefixes it.
pub(crate) fn disk_usage_percent(volumes: &[DiskVolume<'_>], target: &Path) -> Result<f64> {
    let Some(volume) = volumes
        .iter()
        .filter(|volume| target.starts_with(volume.mount_point))
        .max_by_key(|volume| volume.mount_point.as_os_str().len())
    else {
        bail!("no mounted volume holds {}", target.display());
    };

    if volume.total == 0 {
        bail!("volume {} reports zero capacity", volume.mount_point.display());
    }
    let used = volume.total.saturating_sub(volume.available);
    Ok(used as f64 / volume.total as f64 * 100.0)
}

#[derive(Debug, Clone, Default)]
struct TelemetryState {
    metrics: HostMetrics,
    running: bool,
}

/// Read-only handle on the latest completed tick.
#[derive(Clone)]
pub struct TelemetryView {
    rx: watch::Receiver<TelemetryState>,
}

impl TelemetryView {
    pub fn current_data(&self) -> HostMetrics {
        self.rx.borrow().metrics.clone()
    }

    pub fn is_running(&self) -> bool {
        self.rx.borrow().running
    }
}

pub struct TelemetrySampler {
    settings: TelemetrySettings,
    probe: Arc<dyn ReachabilityProbe>,
    stop_timeout: Duration,
    state: Arc<watch::Sender<TelemetryState>>,
    worker: Option<SamplerThread>,
}

impl TelemetrySampler {
    pub fn new(
        settings: TelemetrySettings,
        probe: Arc<dyn ReachabilityProbe>,
        stop_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(TelemetryState::default());
        Self {
            settings,
            probe,
            stop_timeout,
            state: Arc::new(state),
            worker: None,
        }
    }

    pub fn view(&self) -> TelemetryView {
        TelemetryView {
            rx: self.state.subscribe(),
        }
    }
}

impl Sampler for TelemetrySampler {
    type Snapshot = HostMetrics;

    fn start(&mut self, events: EventSink) -> Result<()> {
        if self.worker.is_some() {
            log_info!("telemetry sampler already running");
            return Ok(());
        }

        self.state.send_modify(|state| state.running = true);

        let settings = self.settings.clone();
        let probe = Arc::clone(&self.probe);
        let state = Arc::clone(&self.state);
        let spawned = SamplerThread::spawn("blinkwatch-telemetry", move |cancel| {
            telemetry_loop(settings, probe, state, events, &cancel)
        });

        match spawned {
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
            log_debug!("telemetry sampler not running; stop ignored");
            return;
        };

        if !worker.stop(self.stop_timeout) {
            log_warn!("telemetry loop still inside a tick; its last sample may arrive late");
        }
        self.state.send_modify(|state| state.running = false);
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    fn current_data(&self) -> HostMetrics {
        self.state.borrow().metrics.clone()
    }
}

fn telemetry_loop(
    settings: TelemetrySettings,
    probe: Arc<dyn ReachabilityProbe>,
    state: Arc<watch::Sender<TelemetryState>>,
    events: EventSink,
    cancel: &CancellationToken,
) {
    let interval = settings.interval();
    let mut reader = HostReader::new(settings, probe);
    let mut latest = state.borrow().metrics.clone();
    log_info!("telemetry loop started ({}s interval)", interval.as_secs());

    while !cancel.is_cancelled() {
        let metrics = reader.read(&latest);
        state.send_modify(|state| state.metrics = metrics.clone());
        log_debug!(
            "tick: cpu {:.1}% mem {:.1}% disk {:.1}% net {}",
            metrics.cpu_percent,
            metrics.memory_percent,
            metrics.disk_usage_percent,
            metrics.network_available
        );
        let _ = events.send(SamplerEvent::Metrics(metrics.clone()));
        latest = metrics;

        if sleep_or_cancel(cancel, interval) {
            break;
        }
    }

    log_info!("telemetry loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use super::*;

    struct FixedProbe {
        reachable: bool,
        calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                reachable,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ReachabilityProbe for FixedProbe {
        fn is_reachable(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reachable
        }
    }

    fn volume(mount: &str, total: u64, available: u64) -> DiskVolume<'_> {
        DiskVolume {
            mount_point: Path::new(mount),
            total,
            available,
        }
    }

    #[test]
    fn reader_fills_every_metric() {
        let mut reader = HostReader::new(TelemetrySettings::default(), FixedProbe::new(true));
        let metrics = reader.read(&HostMetrics::default());

        assert!(metrics.sampled_at.is_some());
        assert!((0.0..=100.0).contains(&metrics.cpu_percent));
        assert!(metrics.memory_total_mb > 0.0);
        assert!(metrics.memory_used_mb <= metrics.memory_total_mb);
        assert!(metrics.process_count > 0);
        assert!(metrics.network_available);
        assert_eq!(metrics.power_impact, PowerImpact::from_cpu(metrics.cpu_percent));
    }

    #[test]
    fn unreachable_network_only_affects_its_own_field() {
        let probe = FixedProbe::new(false);
        let mut reader = HostReader::new(TelemetrySettings::default(), probe.clone());
        let first = reader.read(&HostMetrics::default());
        let second = reader.read(&first);

        for metrics in [&first, &second] {
            assert!(!metrics.network_available);
            assert!(metrics.memory_total_mb > 0.0);
            assert!(metrics.process_count > 0);
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn disabled_network_monitoring_skips_the_probe() {
        let probe = FixedProbe::new(true);
        let settings = TelemetrySettings {
            network_monitoring: false,
            battery_monitoring: false,
            ..TelemetrySettings::default()
        };
        let mut reader = HostReader::new(settings, probe.clone());
        let metrics = reader.read(&HostMetrics::default());
        assert!(!metrics.network_available);
        assert_eq!(metrics.battery_percent, None);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disk_usage_picks_the_deepest_mount() {
        let volumes = [
            volume("/", 1_000, 250),
            volume("/home", 400, 300),
            volume("/boot", 100, 0),
        ];
        let root = disk_usage_percent(&volumes, Path::new("/")).unwrap();
        assert!((root - 75.0).abs() < 1e-9);
        let home = disk_usage_percent(&volumes, Path::new("/home/alice")).unwrap();
        assert!((home - 25.0).abs() < 1e-9);
    }

    #[test]
    fn disk_usage_errors_without_a_volume() {
        assert!(disk_usage_percent(&[], Path::new("/")).is_err());
        assert!(disk_usage_percent(&[volume("/", 0, 0)], Path::new("/")).is_err());
        assert!(disk_usage_percent(&[volume("/data", 10, 5)], Path::new("/")).is_err());
    }

    #[test]
    fn sampler_publishes_whole_ticks() {
        let settings = TelemetrySettings {
            interval_secs: 1,
            ..TelemetrySettings::default()
        };
        let mut sampler =
            TelemetrySampler::new(settings, FixedProbe::new(false), Duration::from_secs(2));
        let view = sampler.view();
        assert!(view.current_data().sampled_at.is_none());

        let (tx, mut rx) = mpsc::unbounded_channel();
        sampler.start(tx).unwrap();
        assert!(view.is_running());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let first = loop {
            match rx.try_recv() {
                Ok(SamplerEvent::Metrics(metrics)) => break metrics,
                _ if std::time::Instant::now() > deadline => panic!("no telemetry tick"),
                _ => std::thread::sleep(Duration::from_millis(10)),
            }
        };

        assert!(!first.network_available);
        assert!(view.current_data().sampled_at.is_some());
        sampler.stop();
        assert!(!sampler.is_running());
        assert!(!view.is_running());
    }
}
