//! NVIDIA GPU provider (spec §4.4 and §4.6): queries instantaneous power per device through
//! NVML and trapezoidally integrates it into joules, since NVML exposes power, not a
//! cumulative energy counter. One domain per device (`gpu0`, `gpu1`, ...).
//!
//! Power-sample history is bounded: once a device has accumulated 10,000 samples the oldest
//! half is dropped, so long-running sessions don't grow this state without bound (spec
//! §4.6). A device that fails five reads in a row is marked unavailable and stops
//! contributing to subsequent readings, mirroring the AMD GPU provider's failure budget.

use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, warn};
use nvml_wrapper::Nvml;

use crate::reading::{EnergyReading, HardwareClass, ProviderSpec, SourceKind};

use super::EnergyProvider;

const MAX_POWER_HISTORY: usize = 10_000;
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

struct PowerSample {
    at: Instant,
    watts: f64,
}

struct GpuDevice {
    index: u32,
    domain: String,
    integrated_joules: f64,
    history: VecDeque<PowerSample>,
    consecutive_failures: u32,
    unavailable: bool,
}

pub struct NvidiaGpuProvider {
    nvml: Option<Nvml>,
    devices: Vec<GpuDevice>,
    start: Instant,
}

impl NvidiaGpuProvider {
    pub fn new() -> NvidiaGpuProvider {
        NvidiaGpuProvider {
            nvml: None,
            devices: Vec::new(),
            start: Instant::now(),
        }
    }
}

impl Default for NvidiaGpuProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EnergyProvider for NvidiaGpuProvider {
    fn initialize(&mut self) -> bool {
        let nvml = match Nvml::init() {
            Ok(n) => n,
            Err(e) => {
                debug!("nvidia-gpu provider: NVML init failed: {e}");
                return false;
            }
        };
        let count = match nvml.device_count() {
            Ok(c) => c,
            Err(e) => {
                debug!("nvidia-gpu provider: device_count failed: {e}");
                return false;
            }
        };
        if count == 0 {
            return false;
        }
        self.devices = (0..count)
            .map(|index| GpuDevice {
                index,
                domain: format!("gpu{index}"),
                integrated_joules: 0.0,
                history: VecDeque::new(),
                consecutive_failures: 0,
                unavailable: false,
            })
            .collect();
        self.nvml = Some(nvml);
        self.start = Instant::now();
        true
    }

    fn get_reading(&mut self) -> EnergyReading {
        let Some(nvml) = &self.nvml else {
            return EnergyReading::failure("nvidia-gpu");
        };
        let now = Instant::now();
        let timestamp_ns = self.start.elapsed().as_nanos() as u64 + 1;

        let mut domain_energy = Vec::new();
        let mut domain_power = Vec::new();
        let mut any_ok = false;

        for device in &mut self.devices {
            if device.unavailable {
                continue;
            }
            let reading = nvml
                .device_by_index(device.index)
                .and_then(|handle| handle.power_usage());
            match reading {
                Ok(milliwatts) => {
                    device.consecutive_failures = 0;
                    any_ok = true;
                    let watts = milliwatts as f64 / 1000.0;

                    if let Some(last) = device.history.back() {
                        let dt = now.duration_since(last.at).as_secs_f64();
                        device.integrated_joules += (last.watts + watts) / 2.0 * dt;
                    }
                    device.history.push_back(PowerSample { at: now, watts });
                    if device.history.len() > MAX_POWER_HISTORY {
                        let keep = device.history.len() / 2;
                        while device.history.len() > keep {
                            device.history.pop_front();
                        }
                    }

                    domain_energy.push((device.domain.clone(), device.integrated_joules));
                    domain_power.push((device.domain.clone(), watts));
                }
                Err(e) => {
                    device.consecutive_failures += 1;
                    warn!("nvidia-gpu device {} power read failed: {e}", device.domain);
                    if device.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        device.unavailable = true;
                        debug!("nvidia-gpu device {} marked unavailable after {} failures", device.domain, device.consecutive_failures);
                    }
                }
            }
        }

        if !any_ok {
            return EnergyReading::failure("nvidia-gpu");
        }

        let aggregate_energy_joules = domain_energy.iter().map(|(_, v)| v).sum();
        let aggregate_power_watts = domain_power.iter().map(|(_, v)| v).sum();

        EnergyReading {
            provider_id: "nvidia-gpu".to_string(),
            timestamp_ns,
            domain_energy_joules: domain_energy,
            domain_power_watts: domain_power,
            aggregate_energy_joules,
            aggregate_power_watts,
            confidence: 0.98,
            uncertainty_percent: 2.0,
            source_kind: SourceKind::Integrated,
        }
    }

    fn get_spec(&self) -> ProviderSpec {
        ProviderSpec {
            name: "nvidia-gpu".to_string(),
            hardware_class: HardwareClass::Gpu,
            vendor: "nvidia".to_string(),
            domains: self.devices.iter().map(|d| d.domain.clone()).collect(),
            energy_resolution_joules: 1e-3,
            update_interval_ns: 10_000_000,
            counter_bits: 0,
            supports_power_limiting: true,
        }
    }

    fn is_available(&self) -> bool {
        self.nvml.is_some() && self.devices.iter().any(|d| !d.unavailable)
    }

    fn shutdown(&mut self) {
        self.devices.clear();
        self.nvml = None;
    }

    fn get_name(&self) -> &str {
        "nvidia-gpu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_halved_once_it_exceeds_the_cap() {
        let mut history = VecDeque::new();
        let base = Instant::now();
        for i in 0..(MAX_POWER_HISTORY + 1) {
            history.push_back(PowerSample { at: base, watts: i as f64 });
        }
        if history.len() > MAX_POWER_HISTORY {
            let keep = history.len() / 2;
            while history.len() > keep {
                history.pop_front();
            }
        }
        assert_eq!(history.len(), (MAX_POWER_HISTORY + 1) / 2);
    }

    #[test]
    fn no_nvml_means_unavailable() {
        let provider = NvidiaGpuProvider::new();
        assert!(!provider.is_available());
    }
}
