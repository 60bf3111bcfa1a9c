//! The data model shared by every provider and the coordinator (spec §3).

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceKind {
    HardwareCounter,
    HardwarePower,
    Integrated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareClass {
    Cpu,
    Gpu,
    Soc,
    Platform,
}

/// A physically distinct region a provider reports energy for, e.g. `package`, `dram`,
/// `gpu0`. Kept as an owned string rather than a fixed enum because GPU providers mint a
/// domain per device at runtime (`gpu{i}`).
pub type DomainId = String;

/// Immutable descriptor of a provider (spec §3's `ProviderSpec`).
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub name: String,
    pub hardware_class: HardwareClass,
    pub vendor: String,
    pub domains: Vec<DomainId>,
    pub energy_resolution_joules: f64,
    pub update_interval_ns: u64,
    pub counter_bits: u32,
    pub supports_power_limiting: bool,
}

/// A single sample from one provider at one instant (spec §3's `EnergyReading`).
#[derive(Debug, Clone, Serialize)]
pub struct EnergyReading {
    pub provider_id: String,
    pub timestamp_ns: u64,
    pub domain_energy_joules: Vec<(DomainId, f64)>,
    pub domain_power_watts: Vec<(DomainId, f64)>,
    pub aggregate_energy_joules: f64,
    pub aggregate_power_watts: f64,
    pub confidence: f64,
    pub uncertainty_percent: f64,
    pub source_kind: SourceKind,
}

impl EnergyReading {
    /// A reading with an empty `provider_id` or zero timestamp denotes failure (spec §3).
    pub fn failure(provider_id: impl Into<String>) -> EnergyReading {
        EnergyReading {
            provider_id: provider_id.into(),
            timestamp_ns: 0,
            domain_energy_joules: Vec::new(),
            domain_power_watts: Vec::new(),
            aggregate_energy_joules: 0.0,
            aggregate_power_watts: 0.0,
            confidence: 0.0,
            uncertainty_percent: 100.0,
            source_kind: SourceKind::Integrated,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.provider_id.is_empty() || self.timestamp_ns == 0
    }

    pub fn domain_energy(&self, domain: &str) -> Option<f64> {
        self.domain_energy_joules.iter().find(|(d, _)| d == domain).map(|(_, v)| *v)
    }
}

/// The coordinator's bundled snapshot of all providers at a nominal common instant (spec
/// §3's `SynchronizedReading`).
#[derive(Debug, Clone)]
pub struct SynchronizedReading {
    pub common_timestamp_ns: u64,
    pub provider_readings: Vec<EnergyReading>,
    pub total_system_energy_joules: f64,
    pub total_system_power_watts: f64,
    pub providers_active: usize,
    pub providers_failed: usize,
    pub temporal_alignment_valid: bool,
    pub cross_validation_passed: bool,
    pub max_provider_deviation: f64,
    pub measurement_confidence: f64,
}

impl SynchronizedReading {
    pub fn empty(timestamp_ns: u64) -> SynchronizedReading {
        SynchronizedReading {
            common_timestamp_ns: timestamp_ns,
            provider_readings: Vec::new(),
            total_system_energy_joules: 0.0,
            total_system_power_watts: 0.0,
            providers_active: 0,
            providers_failed: 0,
            temporal_alignment_valid: true,
            cross_validation_passed: true,
            max_provider_deviation: 0.0,
            measurement_confidence: 0.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.providers_active > 0
    }
}
