use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::RwLock,
    time::Duration,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BlinkSettings {
    /// Consecutive closed-eye ticks that, followed by an open tick, make a blink.
    pub closed_frames_threshold: u32,
    pub tick_interval_ms: u64,
    pub simulated_min_interval_ms: u64,
    pub simulated_max_interval_ms: u64,
    pub camera_index: u32,
    /// Skip device acquisition and go straight to simulation.
    pub force_simulation: bool,
}

impl Default for BlinkSettings {
    fn default() -> Self {
        Self {
            closed_frames_threshold: 5,
            tick_interval_ms: 33,
            simulated_min_interval_ms: 3_000,
            simulated_max_interval_ms: 8_000,
            camera_index: 0,
            force_simulation: false,
        }
    }
}

impl BlinkSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySettings {
    pub interval_secs: u64,
    pub probe_address: String,
    pub probe_timeout_ms: u64,
    pub disk_mount_point: String,
    pub battery_monitoring: bool,
    pub network_monitoring: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            interval_secs: 2,
            probe_address: "8.8.8.8:53".into(),
            probe_timeout_ms: 1_500,
            disk_mount_point: "/".into(),
            battery_monitoring: true,
            network_monitoring: true,
        }
    }
}

impl TelemetrySettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
    pub flush_interval_secs: u64,
    pub retention_days: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: data_dir().join("blinkwatch.sqlite3"),
            flush_interval_secs: 5,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Base URL of the collector. Without it (or without the `http-sync`
    /// feature) the simulated endpoint is used.
    pub endpoint_url: Option<String>,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
    pub simulated_latency_ms: u64,
    pub simulated_failure_rate: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            endpoint_url: None,
            api_token: None,
            request_timeout_secs: 30,
            simulated_latency_ms: 1_000,
            simulated_failure_rate: 0.1,
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    pub device_id: String,
    pub stop_timeout_ms: u64,
    pub blink: BlinkSettings,
    pub telemetry: TelemetrySettings,
    pub storage: StorageSettings,
    pub sync: SyncSettings,
    /// Username to password allow-list checked by the CLI before monitoring.
    /// Empty means no login is required.
    pub credentials: BTreeMap<String, String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            stop_timeout_ms: 2_000,
            blink: BlinkSettings::default(),
            telemetry: TelemetrySettings::default(),
            storage: StorageSettings::default(),
            sync: SyncSettings::default(),
            credentials: BTreeMap::new(),
        }
    }
}

impl PipelineSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blinkwatch")
}

pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blinkwatch")
        .join("settings.json")
}

/// Parses a settings file. The flag is set when the file carried no device id
/// and one was generated, so the caller stores it for the next load.
fn parse_settings(contents: &str) -> serde_json::Result<(PipelineSettings, bool)> {
    let raw: serde_json::Value = serde_json::from_str(contents)?;
    let has_device_id = raw
        .get("device_id")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|id| !id.trim().is_empty());

    let mut settings: PipelineSettings = serde_json::from_value(raw)?;
    if !has_device_id {
        settings.device_id = uuid::Uuid::new_v4().to_string();
    }
    Ok((settings, !has_device_id))
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<PipelineSettings>,
}

impl SettingsStore {
    /// Loads settings from `path`, filling missing keys with defaults. A
    /// missing file, or one without a device id, is written back so the
    /// generated id stays stable across runs.
    pub fn new(path: PathBuf) -> Result<Self> {
        let (data, needs_persist) = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match parse_settings(&contents) {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!("Ignoring unreadable settings at {}: {err}", path.display());
                    (PipelineSettings::default(), false)
                }
            }
        } else {
            (PipelineSettings::default(), true)
        };

        let store = Self {
            path,
            data: RwLock::new(data),
        };
        if needs_persist {
            store.persist(&store.get())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn get(&self) -> PipelineSettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update<F>(&self, apply: F) -> Result<PipelineSettings>
    where
        F: FnOnce(&mut PipelineSettings),
    {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard);
        self.persist(&guard)?;
        Ok(guard.clone())
    }

    fn persist(&self, data: &PipelineSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create settings directory {}", parent.display())
                })?;
            }
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
