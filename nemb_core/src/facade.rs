//! Public facade (spec §6): the sole crate-level entry point. `Meter` owns the clock, the
//! coordinator, and the marker list, and is the one type the C ABI (`crate::ffi`) and
//! foreign embedders are meant to touch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::PrecisionClock;
use crate::config::MeterConfig;
use crate::coordinator::MeasurementCoordinator;
use crate::correlator::{self, CorrelatedCheckpoint};
use crate::error::{NembError, NembResult};
use crate::marker::MarkerList;
use crate::reading::{EnergyReading, SourceKind};

/// Returned by `end_session` (spec §6).
#[derive(Debug, Clone)]
pub struct EnergyDifference {
    pub energy_joules: f64,
    pub average_power_watts: f64,
    pub duration_seconds: f64,
    pub per_component_energy: HashMap<String, f64>,
    pub valid: bool,
}

struct SessionStart {
    label: String,
    start_ns: u64,
    start_energy_joules: f64,
    start_per_component: HashMap<String, f64>,
}

pub struct Meter {
    clock: Arc<PrecisionClock>,
    coordinator: MeasurementCoordinator,
    markers: MarkerList,
    sessions: Mutex<HashMap<u64, SessionStart>>,
    next_session_id: AtomicU64,
}

/// Constructs and starts a `Meter` (spec §6's `new_meter(config)`). The coordinator
/// discovers and initializes providers as part of `start()`.
pub fn new_meter(config: MeterConfig) -> NembResult<Meter> {
    let clock = Arc::new(PrecisionClock::init_with_preference(config.force_clock_source)?);
    let coordinator = MeasurementCoordinator::new(config, Arc::clone(&clock));
    coordinator.start()?;
    Ok(Meter {
        clock,
        coordinator,
        markers: MarkerList::new(),
        sessions: Mutex::new(HashMap::new()),
        next_session_id: AtomicU64::new(1),
    })
}

impl Meter {
    pub fn is_available(&self) -> bool {
        self.coordinator.active_provider_count() > 0
    }

    pub fn providers(&self) -> Vec<String> {
        self.coordinator.provider_names()
    }

    /// An aggregate snapshot of the most recent `SynchronizedReading`, shaped as a single
    /// `EnergyReading` (spec §6: "an aggregate SynchronizedReading snapshot").
    pub fn read_instant(&self) -> EnergyReading {
        let snapshot = self.coordinator.ring().snapshot();
        match snapshot.last() {
            Some(latest) if latest.is_valid() => EnergyReading {
                provider_id: "aggregate".to_string(),
                timestamp_ns: latest.common_timestamp_ns,
                domain_energy_joules: component_energy_map(latest).into_iter().collect(),
                domain_power_watts: Vec::new(),
                aggregate_energy_joules: latest.total_system_energy_joules,
                aggregate_power_watts: latest.total_system_power_watts,
                confidence: latest.measurement_confidence,
                uncertainty_percent: if latest.cross_validation_passed { 1.0 } else { 5.0 },
                source_kind: SourceKind::Integrated,
            },
            _ => EnergyReading::failure("aggregate"),
        }
    }

    pub fn start_session(&self, label: impl Into<String>) -> u64 {
        let reading = self.read_instant();
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        sessions.insert(
            id,
            SessionStart {
                label: label.into(),
                start_ns: self.clock.now_ns(),
                start_energy_joules: reading.aggregate_energy_joules,
                start_per_component: reading.domain_energy_joules.into_iter().collect(),
            },
        );
        id
    }

    pub fn end_session(&self, session_id: u64) -> EnergyDifference {
        let start = self.sessions.lock().expect("session mutex poisoned").remove(&session_id);
        let Some(start) = start else {
            return EnergyDifference {
                energy_joules: 0.0,
                average_power_watts: 0.0,
                duration_seconds: 0.0,
                per_component_energy: HashMap::new(),
                valid: false,
            };
        };

        let end_reading = self.read_instant();
        let end_ns = self.clock.now_ns();
        let duration_seconds = (end_ns.saturating_sub(start.start_ns)) as f64 / 1e9;
        let energy_joules = (end_reading.aggregate_energy_joules - start.start_energy_joules).max(0.0);
        let average_power_watts = if duration_seconds > 0.0 { energy_joules / duration_seconds } else { 0.0 };

        let end_valid = !end_reading.is_failure();
        let end_per_component: HashMap<String, f64> = end_reading.domain_energy_joules.into_iter().collect();
        let mut per_component_energy = HashMap::new();
        for (domain, end_value) in &end_per_component {
            let start_value = start.start_per_component.get(domain).copied().unwrap_or(0.0);
            per_component_energy.insert(domain.clone(), (end_value - start_value).max(0.0));
        }

        log::debug!("session '{}' ended: {:.3} J over {:.3} s", start.label, energy_joules, duration_seconds);

        EnergyDifference {
            energy_joules,
            average_power_watts,
            duration_seconds,
            per_component_energy,
            valid: end_valid,
        }
    }

    /// Records a checkpoint. Must stay cheap (spec §4.6): a clock read and a mutex-guarded
    /// amortized append, no I/O.
    pub fn mark_checkpoint(&self, name: impl Into<String>) {
        self.markers.mark(&self.clock, name);
    }

    pub fn correlated_checkpoints(&self) -> Vec<CorrelatedCheckpoint> {
        let snapshot = self.coordinator.ring().snapshot();
        let markers = self.markers.sorted_snapshot();
        correlator::correlate(&snapshot, &markers)
    }

    pub fn self_test(&self) -> bool {
        self.coordinator.self_test()
    }

    pub fn diagnostics(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("clock_source".to_string(), self.clock.source_name().to_string());
        map.insert("clock_resolution_ns".to_string(), format!("{:.1}", self.clock.resolution_ns()));
        map.insert("ring_occupancy".to_string(), self.coordinator.ring().len().to_string());
        map.insert("ring_capacity".to_string(), self.coordinator.ring().capacity().to_string());
        map.insert("coordinator_state".to_string(), format!("{:?}", self.coordinator.state()));
        map.insert("providers_active".to_string(), self.coordinator.active_provider_count().to_string());

        let latest_cross_validation = self
            .coordinator
            .ring()
            .snapshot()
            .last()
            .map(|r| r.cross_validation_passed)
            .unwrap_or(true);
        map.insert("cross_validation_passed".to_string(), latest_cross_validation.to_string());

        for (name, failed) in self.coordinator.provider_states() {
            map.insert(format!("provider.{name}.failed"), failed.to_string());
        }
        map
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        self.coordinator.stop();
    }
}

fn component_energy_map(reading: &crate::reading::SynchronizedReading) -> HashMap<String, f64> {
    let mut map = HashMap::new();
    for provider_reading in &reading.provider_readings {
        for (domain, joules) in &provider_reading.domain_energy_joules {
            map.insert(domain.clone(), *joules);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_meter_fails_gracefully_without_any_hardware() {
        // In a sandbox with no RAPL/GPU/SoC interfaces, new_meter must return an error
        // rather than panic or hang.
        let mut config = MeterConfig::accuracy();
        config.timeout_ns = 50_000_000;
        let result = new_meter(config);
        if !std::path::Path::new("/sys/devices/virtual/powercap/intel-rapl").exists() {
            assert!(matches!(result, Err(NembError::Fatal(_))));
        }
    }
}
