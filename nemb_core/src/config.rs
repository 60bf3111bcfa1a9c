//! Meter configuration (spec §4.5, §6, §9): a plain record with `Default` plus the three
//! named presets spec.md §9 calls for instead of a general builder DSL.

use std::time::Duration;

use crate::clock::ClockSource;

#[derive(Debug, Clone)]
pub struct MeterConfig {
    pub sample_interval_ns: u64,
    pub ring_capacity: usize,
    pub temporal_alignment_tolerance_ns: u64,
    pub cross_validation_threshold: f64,
    pub auto_restart_failed_providers: bool,
    pub provider_restart_interval_ns: u64,
    pub enable_outlier_filter: bool,
    pub enable_ema_smoothing: bool,
    pub target_uncertainty_percent: f64,
    pub enable_cross_validation: bool,
    pub enable_outlier_detection: bool,
    pub enable_noise_filtering: bool,
    pub force_clock_source: Option<ClockSource>,
    pub timeout_ns: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        MeterConfig::balanced()
    }
}

impl MeterConfig {
    /// 1ms sampling, every cross-check on, tightest alignment tolerance.
    pub fn accuracy() -> MeterConfig {
        MeterConfig {
            sample_interval_ns: 1_000_000,
            ring_capacity: 100_000,
            temporal_alignment_tolerance_ns: 100_000,
            cross_validation_threshold: 0.05,
            auto_restart_failed_providers: true,
            provider_restart_interval_ns: 5_000_000_000,
            enable_outlier_filter: true,
            enable_ema_smoothing: false,
            target_uncertainty_percent: 1.0,
            enable_cross_validation: true,
            enable_outlier_detection: true,
            enable_noise_filtering: false,
            force_clock_source: None,
            timeout_ns: 5_000_000_000,
        }
    }

    /// 10ms sampling: the default. Matches spec.md §4.5's default values.
    pub fn balanced() -> MeterConfig {
        MeterConfig {
            sample_interval_ns: 10_000_000,
            ..MeterConfig::accuracy()
        }
    }

    /// 100ms sampling, smoothing on instead of outlier filtering, for long unattended runs.
    pub fn low_overhead() -> MeterConfig {
        MeterConfig {
            sample_interval_ns: 100_000_000,
            enable_outlier_filter: false,
            enable_ema_smoothing: true,
            enable_outlier_detection: false,
            enable_noise_filtering: true,
            target_uncertainty_percent: 5.0,
            ..MeterConfig::accuracy()
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_nanos(self.sample_interval_ns)
    }

    pub fn provider_restart_interval(&self) -> Duration {
        Duration::from_nanos(self.provider_restart_interval_ns)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_scale_sample_interval_as_documented() {
        assert_eq!(MeterConfig::accuracy().sample_interval_ns, 1_000_000);
        assert_eq!(MeterConfig::balanced().sample_interval_ns, 10_000_000);
        assert_eq!(MeterConfig::low_overhead().sample_interval_ns, 100_000_000);
    }

    #[test]
    fn default_matches_balanced() {
        assert_eq!(MeterConfig::default().sample_interval_ns, MeterConfig::balanced().sample_interval_ns);
    }
}
