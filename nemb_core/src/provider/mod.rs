//! Energy Provider family (spec §4.4): a polymorphic sensor abstraction over the
//! heterogeneous hardware that can report energy — CPU RAPL (Intel and AMD), a native AMD
//! MSR path, ARM SoC counters, and NVIDIA/AMD GPUs.

pub mod amd_gpu;
pub mod amd_msr;
pub mod arm_soc;
pub mod cpu_rapl;
#[cfg(feature = "nvidia_gpu")]
pub mod nvidia_gpu;
pub mod registry;

use crate::reading::{EnergyReading, ProviderSpec};

/// The capability interface every provider implements (spec §4.4 and §9: "polymorphism
/// across provider variants ... realized as a capability interface").
pub trait EnergyProvider: Send + Sync {
    /// Discovers hardware, registers counters, takes a baseline reading. Idempotent.
    fn initialize(&mut self) -> bool;

    /// Returns a fresh reading. Must complete within the coordinator's per-sample budget.
    fn get_reading(&mut self) -> EnergyReading;

    fn get_spec(&self) -> ProviderSpec;

    /// Takes two readings at least 100ms apart; passes iff both are valid and cumulative
    /// energy is non-decreasing.
    fn self_test(&mut self) -> bool {
        let r1 = self.get_reading();
        if r1.is_failure() {
            return false;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
        let r2 = self.get_reading();
        if r2.is_failure() {
            return false;
        }
        r2.aggregate_energy_joules >= r1.aggregate_energy_joules
    }

    fn is_available(&self) -> bool;

    /// Releases resources. Idempotent.
    fn shutdown(&mut self);

    fn get_name(&self) -> &str;
}
