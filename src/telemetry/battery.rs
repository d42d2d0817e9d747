//! Battery and AC state. Hosts without a battery report both as unavailable.

use std::{fs, path::Path};

use anyhow::{Context, Result};

#[cfg(target_os = "linux")]
const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerStatus {
    pub battery_percent: Option<f64>,
    pub power_connected: Option<bool>,
}

#[cfg(target_os = "linux")]
pub fn read_power_status() -> Result<PowerStatus> {
    read_power_supply_dir(Path::new(POWER_SUPPLY_ROOT))
}

#[cfg(not(target_os = "linux"))]
pub fn read_power_status() -> Result<PowerStatus> {
    Ok(PowerStatus::default())
}

fn read_attr(device: &Path, name: &str) -> Option<String> {
    fs::read_to_string(device.join(name))
        .ok()
        .map(|value| value.trim().to_string())
}

/// Reads a sysfs-style `power_supply` directory: one subdirectory per supply
/// with `type`, `capacity`, `status` and `online` attribute files.
pub(crate) fn read_power_supply_dir(root: &Path) -> Result<PowerStatus> {
    if !root.exists() {
        return Ok(PowerStatus::default());
    }

    let mut battery_percent = None;
    let mut battery_charging = None;
    let mut mains_online: Option<bool> = None;

    let entries = fs::read_dir(root)
        .with_context(|| format!("failed to list {}", root.display()))?;
    for entry in entries {
        let device = entry?.path();
        match read_attr(&device, "type").as_deref() {
            Some("Battery") => {
                if let Some(capacity) =
                    read_attr(&device, "capacity").and_then(|raw| raw.parse::<f64>().ok())
                {
                    battery_percent = Some(capacity.clamp(0.0, 100.0));
                }
                if let Some(status) = read_attr(&device, "status") {
                    battery_charging = Some(status != "Discharging");
                }
            }
            Some("Mains") | Some("USB") => {
                if let Some(online) = read_attr(&device, "online") {
                    mains_online = Some(mains_online.unwrap_or(false) || online == "1");
                }
            }
            _ => {}
        }
    }

    if battery_percent.is_none() {
        return Ok(PowerStatus::default());
    }

    Ok(PowerStatus {
        battery_percent,
        power_connected: mains_online.or(battery_charging),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supply(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (key, value) in attrs {
            fs::write(dir.join(key), format!("{value}\n")).unwrap();
        }
    }

    #[test]
    fn laptop_on_ac() {
        let root = tempfile::tempdir().unwrap();
        supply(root.path(), "BAT0", &[("type", "Battery"), ("capacity", "76"), ("status", "Charging")]);
        supply(root.path(), "AC", &[("type", "Mains"), ("online", "1")]);

        let status = read_power_supply_dir(root.path()).unwrap();
        assert_eq!(status.battery_percent, Some(76.0));
        assert_eq!(status.power_connected, Some(true));
    }

    #[test]
    fn laptop_on_battery_without_mains_entry() {
        let root = tempfile::tempdir().unwrap();
        supply(root.path(), "BAT1", &[("type", "Battery"), ("capacity", "40"), ("status", "Discharging")]);

        let status = read_power_supply_dir(root.path()).unwrap();
        assert_eq!(status.battery_percent, Some(40.0));
        assert_eq!(status.power_connected, Some(false));
    }

    #[test]
    fn desktop_reports_unavailable_not_zero() {
        let root = tempfile::tempdir().unwrap();
        supply(root.path(), "AC", &[("type", "Mains"), ("online", "1")]);

        assert_eq!(read_power_supply_dir(root.path()).unwrap(), PowerStatus::default());
        assert_eq!(
            read_power_supply_dir(&root.path().join("missing")).unwrap(),
            PowerStatus::default()
        );
    }
}
