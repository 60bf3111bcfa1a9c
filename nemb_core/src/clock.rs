//! Precision Clock (spec §4.1): monotonic nanosecond timestamps from the best available
//! source. Selection order: invariant TSC, `CLOCK_MONOTONIC_RAW`, `CLOCK_MONOTONIC`,
//! `CLOCK_REALTIME`.

use std::time::{Duration, Instant};

use log::{info, warn};
use nix::time::{clock_gettime, ClockId};

use crate::error::{NembError, NembResult};

/// The clock source actually selected by [`PrecisionClock::init`], or forced by
/// [`crate::config::MeterConfig::force_clock_source`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockSource {
    Tsc,
    MonotonicRaw,
    Monotonic,
    Realtime,
}

impl ClockSource {
    pub fn name(&self) -> &'static str {
        match self {
            ClockSource::Tsc => "tsc",
            ClockSource::MonotonicRaw => "monotonic_raw",
            ClockSource::Monotonic => "monotonic",
            ClockSource::Realtime => "realtime",
        }
    }
}

impl std::str::FromStr for ClockSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tsc" => Ok(ClockSource::Tsc),
            "monotonic_raw" => Ok(ClockSource::MonotonicRaw),
            "monotonic" => Ok(ClockSource::Monotonic),
            "realtime" => Ok(ClockSource::Realtime),
            _ => Err(format!("unknown clock source '{s}'")),
        }
    }
}

/// A calibrated TSC: `ticks_per_ns = frequency_hz / 1e9`, baseline tick and baseline
/// wall-clock instant captured together.
struct TscCalibration {
    baseline_ticks: u64,
    ns_per_tick: f64,
}

const MAX_ACCEPTABLE_RESOLUTION_NS: f64 = 1_000_000.0; // 1 ms

pub struct PrecisionClock {
    source: ClockSource,
    tsc: Option<TscCalibration>,
    resolution_ns: f64,
}

impl PrecisionClock {
    /// Tries each candidate source in order and keeps the first whose measured resolution
    /// is finite and better than 1 ms. Fails only if none qualifies.
    pub fn init() -> NembResult<PrecisionClock> {
        Self::init_with_preference(None)
    }

    pub fn init_with_preference(forced: Option<ClockSource>) -> NembResult<PrecisionClock> {
        let candidates: Vec<ClockSource> = match forced {
            Some(c) => vec![c],
            None => vec![
                ClockSource::Tsc,
                ClockSource::MonotonicRaw,
                ClockSource::Monotonic,
                ClockSource::Realtime,
            ],
        };

        for source in candidates {
            match Self::try_build(source) {
                Ok(clock) => {
                    info!(
                        "precision clock: selected {} (resolution {:.1} ns)",
                        clock.source.name(),
                        clock.resolution_ns
                    );
                    return Ok(clock);
                }
                Err(e) => warn!("precision clock: rejected {}: {e}", source.name()),
            }
        }

        Err(NembError::Fatal(
            "no clock source produced a resolution better than 1 ms".to_string(),
        ))
    }

    fn try_build(source: ClockSource) -> anyhow::Result<PrecisionClock> {
        match source {
            ClockSource::Tsc => Self::try_build_tsc(),
            ClockSource::MonotonicRaw => Self::try_build_clockid(ClockSource::MonotonicRaw, ClockId::CLOCK_MONOTONIC_RAW),
            ClockSource::Monotonic => Self::try_build_clockid(ClockSource::Monotonic, ClockId::CLOCK_MONOTONIC),
            ClockSource::Realtime => Self::try_build_clockid(ClockSource::Realtime, ClockId::CLOCK_REALTIME),
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn invariant_tsc_available() -> bool {
        // CPUID leaf 0x80000007, bit EDX[8] = invariant TSC.
        use std::arch::x86_64::__cpuid;
        // Querying an extended leaf requires that it exists; check the max extended leaf first.
        let max_ext = unsafe { __cpuid(0x8000_0000) }.eax;
        if max_ext < 0x8000_0007 {
            return false;
        }
        let leaf = unsafe { __cpuid(0x8000_0007) };
        (leaf.edx & (1 << 8)) != 0
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn invariant_tsc_available() -> bool {
        false
    }

    #[cfg(target_arch = "x86_64")]
    fn read_tsc() -> u64 {
        use std::arch::x86_64::_rdtsc;
        unsafe { _rdtsc() }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn read_tsc() -> u64 {
        0
    }

    fn try_build_tsc() -> anyhow::Result<PrecisionClock> {
        if !Self::invariant_tsc_available() {
            anyhow::bail!("invariant TSC not reported by CPUID leaf 0x80000007");
        }

        // Calibrate: read the TSC, sleep 100ms against a monotonic wall clock, read again.
        let wall_start = Instant::now();
        let tsc_start = Self::read_tsc();
        std::thread::sleep(Duration::from_millis(100));
        let tsc_end = Self::read_tsc();
        let elapsed_ns = wall_start.elapsed().as_nanos() as f64;

        if elapsed_ns <= 0.0 || tsc_end <= tsc_start {
            anyhow::bail!("TSC calibration produced a non-positive delta");
        }

        let freq_hz = (tsc_end - tsc_start) as f64 * 1e9 / elapsed_ns;
        let ns_per_tick = 1e9 / freq_hz;

        // A single TSC tick is the smallest representable quantum once converted to ns.
        let resolution_ns = ns_per_tick;
        if !resolution_ns.is_finite() || resolution_ns >= MAX_ACCEPTABLE_RESOLUTION_NS {
            anyhow::bail!("TSC calibrated resolution ({resolution_ns} ns) is too coarse");
        }

        Ok(PrecisionClock {
            source: ClockSource::Tsc,
            tsc: Some(TscCalibration {
                baseline_ticks: tsc_end,
                ns_per_tick,
            }),
            resolution_ns,
        })
    }

    fn try_build_clockid(source: ClockSource, id: ClockId) -> anyhow::Result<PrecisionClock> {
        // Measure the smallest observable delta between two back-to-back reads, a handful
        // of times, and keep the minimum as the resolution estimate.
        let mut min_delta_ns = u64::MAX;
        for _ in 0..16 {
            let a = clock_gettime(id)?;
            let b = clock_gettime(id)?;
            let a_ns = a.tv_sec() as i128 * 1_000_000_000 + a.tv_nsec() as i128;
            let b_ns = b.tv_sec() as i128 * 1_000_000_000 + b.tv_nsec() as i128;
            let delta = (b_ns - a_ns).max(0) as u64;
            if delta > 0 && delta < min_delta_ns {
                min_delta_ns = delta;
            }
        }
        if min_delta_ns == u64::MAX {
            min_delta_ns = 1; // Clock granularity finer than our measurement loop could see.
        }
        let resolution_ns = min_delta_ns as f64;
        if resolution_ns >= MAX_ACCEPTABLE_RESOLUTION_NS {
            anyhow::bail!("{} resolution ({resolution_ns} ns) is too coarse", source.name());
        }

        Ok(PrecisionClock {
            source,
            tsc: None,
            resolution_ns,
        })
    }

    /// Wait-free once initialized: either a TSC read + one multiply, or a `clock_gettime`.
    pub fn now_ns(&self) -> u64 {
        match &self.tsc {
            Some(cal) => {
                let ticks = Self::read_tsc();
                let delta_ticks = ticks.wrapping_sub(cal.baseline_ticks);
                (delta_ticks as f64 * cal.ns_per_tick) as u64
            }
            None => {
                let id = match self.source {
                    ClockSource::MonotonicRaw => ClockId::CLOCK_MONOTONIC_RAW,
                    ClockSource::Monotonic => ClockId::CLOCK_MONOTONIC,
                    ClockSource::Realtime => ClockId::CLOCK_REALTIME,
                    ClockSource::Tsc => unreachable!("tsc source always carries a calibration"),
                };
                // clock_gettime is not wait-free in the formal sense but never blocks; this
                // matches every other monotonic-clock-backed implementation of "now_ns".
                let ts = clock_gettime(id).expect("clock_gettime must not fail after init()");
                ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64
            }
        }
    }

    pub fn resolution_ns(&self) -> f64 {
        self.resolution_ns
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    pub fn source(&self) -> ClockSource {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_initializes_and_advances() {
        let clock = PrecisionClock::init().expect("some clock source must be available in CI");
        let t1 = clock.now_ns();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = clock.now_ns();
        assert!(t2 > t1, "monotonic clock must advance: {t1} -> {t2}");
        assert!(clock.resolution_ns() < MAX_ACCEPTABLE_RESOLUTION_NS);
    }

    #[test]
    fn forced_monotonic_source_is_honored() {
        let clock = PrecisionClock::init_with_preference(Some(ClockSource::Monotonic))
            .expect("CLOCK_MONOTONIC is always available on Linux");
        assert_eq!(clock.source(), ClockSource::Monotonic);
    }
}
