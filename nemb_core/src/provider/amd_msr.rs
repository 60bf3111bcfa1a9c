//! AMD native RAPL provider (spec §4.4): reads the AMD-specific package energy
//! model-specific register directly through `/dev/cpu/<n>/msr`, bypassing the kernel
//! powercap abstraction entirely. Ported from the teacher's `rapl_probes::msr` module,
//! narrowed to the single `package` domain AMD exposes reliably.

use std::fs::File;
use std::io;
use std::os::unix::prelude::FileExt;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context};
use log::debug;
use regex::Regex;

use crate::counter::{CounterAccumulator, CounterId};
use crate::reading::{EnergyReading, HardwareClass, ProviderSpec, SourceKind};

use super::EnergyProvider;

const MSR_RAPL_POWER_UNIT: u64 = 0xC001_0299;
const MSR_PKG_ENERGY_STATUS: u64 = 0xC001_029B;
const MSR_ENERGY_MASK: u64 = 0xFFFF_FFFF;
const MSR_COUNTER_BITS: u32 = 32;

fn read_msr(msr: &File, at: u64) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    msr.read_exact_at(&mut buf, at)?;
    Ok(u64::from_ne_bytes(buf))
}

fn read_energy_unit(msr: &File) -> io::Result<f64> {
    let value = read_msr(msr, MSR_RAPL_POWER_UNIT)?;
    let esu = (value & 0x1F00) >> 8;
    Ok(0.5_f64.powi(esu as i32))
}

fn is_amd() -> anyhow::Result<bool> {
    let child = Command::new("lscpu")
        .env("LC_ALL", "C")
        .stdout(Stdio::piped())
        .spawn()
        .context("lscpu should be executable")?;
    let out = child.wait_with_output()?;
    let stdout = std::str::from_utf8(&out.stdout)?;
    let re = Regex::new(r"Vendor ID:\s+(\w+)")?;
    let vendor = re
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| anyhow!("vendor id not found in lscpu output"))?;
    Ok(vendor == "AuthenticAMD")
}

pub struct AmdMsrProvider {
    msr: Option<File>,
    energy_unit: f64,
    counters: CounterAccumulator,
    counter_id: Option<CounterId>,
    previous: Option<(f64, u64)>,
    initialized: bool,
}

impl AmdMsrProvider {
    pub fn new() -> AmdMsrProvider {
        AmdMsrProvider {
            msr: None,
            energy_unit: 0.0,
            counters: CounterAccumulator::new(),
            counter_id: None,
            previous: None,
            initialized: false,
        }
    }
}

impl Default for AmdMsrProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EnergyProvider for AmdMsrProvider {
    fn initialize(&mut self) -> bool {
        if self.initialized {
            return true;
        }
        match is_amd() {
            Ok(true) => {}
            Ok(false) => {
                debug!("amd-msr provider: not an AMD CPU");
                return false;
            }
            Err(e) => {
                debug!("amd-msr provider: vendor detection failed: {e}");
                return false;
            }
        }
        let file = match File::open("/dev/cpu/0/msr") {
            Ok(f) => f,
            Err(e) => {
                debug!("amd-msr provider: cannot open /dev/cpu/0/msr: {e}");
                return false;
            }
        };
        let unit = match read_energy_unit(&file) {
            Ok(u) => u,
            Err(e) => {
                debug!("amd-msr provider: failed to read power unit register: {e}");
                return false;
            }
        };
        self.energy_unit = unit;
        self.counter_id = Some(self.counters.register("package", MSR_COUNTER_BITS, unit, "raw"));
        self.msr = Some(file);
        self.initialized = true;
        true
    }

    fn get_reading(&mut self) -> EnergyReading {
        let (Some(msr), Some(counter_id)) = (&self.msr, self.counter_id) else {
            return EnergyReading::failure("amd-msr");
        };
        let raw = match read_msr(msr, MSR_PKG_ENERGY_STATUS) {
            Ok(v) => v & MSR_ENERGY_MASK,
            Err(_) => return EnergyReading::failure("amd-msr"),
        };
        self.counters.bulk_update(&[(counter_id, raw)]);
        let joules = self.counters.get(counter_id).accumulated_joules();

        let timestamp_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);

        let power_watts = match self.previous {
            Some((prev_joules, prev_ts)) => {
                let dt = (timestamp_ns.saturating_sub(prev_ts)) as f64 / 1e9;
                if dt > 0.0 {
                    (joules - prev_joules).max(0.0) / dt
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.previous = Some((joules, timestamp_ns));

        EnergyReading {
            provider_id: "amd-msr".to_string(),
            timestamp_ns,
            domain_energy_joules: vec![("package".to_string(), joules)],
            domain_power_watts: vec![("package".to_string(), power_watts)],
            aggregate_energy_joules: joules,
            aggregate_power_watts: power_watts,
            confidence: 0.9,
            uncertainty_percent: 5.0,
            source_kind: SourceKind::HardwareCounter,
        }
    }

    fn get_spec(&self) -> ProviderSpec {
        ProviderSpec {
            name: "amd-msr".to_string(),
            hardware_class: HardwareClass::Cpu,
            vendor: "amd".to_string(),
            domains: vec!["package".to_string()],
            energy_resolution_joules: self.energy_unit,
            update_interval_ns: 1_000_000,
            counter_bits: MSR_COUNTER_BITS,
            supports_power_limiting: false,
        }
    }

    fn is_available(&self) -> bool {
        self.initialized && self.msr.is_some()
    }

    fn shutdown(&mut self) {
        self.msr = None;
        self.initialized = false;
    }

    fn get_name(&self) -> &str {
        "amd-msr"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_unit_bits_12_to_8() {
        // esu = 10 -> multiplier = 2^-10
        let value: u64 = 10 << 8;
        let esu = (value & 0x1F00) >> 8;
        assert_eq!(esu, 10);
        let multiplier = 0.5_f64.powi(esu as i32);
        assert!((multiplier - 2f64.powi(-10)).abs() < 1e-12);
    }
}
