//! Wrap-Safe Counter Accumulator (spec §4.3): turns a stream of raw, fixed-width hardware
//! register values into an unbounded cumulative count.
//!
//! This factors out the single inline branch the teacher writes once per call site
//! (`EnergyMeasurements::push` in `rapl_probes::lib`) into an independently registered,
//! independently tested unit, because this spec requires the identical algorithm across
//! five different provider kinds instead of one.

use std::fmt;

/// Handle into a [`CounterAccumulator`], returned by [`CounterAccumulator::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterId(u16);

#[derive(Debug, Clone)]
pub struct CounterState {
    pub name: String,
    pub bits: u32,
    pub counter_mask: u64,
    pub conversion_factor_to_joules: f64,
    pub unit: String,
    pub active: bool,

    last_raw: Option<u64>,
    accumulated: u64,
    wraparound_count: u64,
}

impl CounterState {
    fn new(name: String, bits: u32, conversion_factor_to_joules: f64, unit: String) -> CounterState {
        let counter_mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        CounterState {
            name,
            bits,
            counter_mask,
            conversion_factor_to_joules,
            unit,
            active: true,
            last_raw: None,
            accumulated: 0,
            wraparound_count: 0,
        }
    }

    pub fn accumulated_raw(&self) -> u64 {
        self.accumulated
    }

    pub fn accumulated_joules(&self) -> f64 {
        self.accumulated as f64 * self.conversion_factor_to_joules
    }

    pub fn wraparound_count(&self) -> u64 {
        self.wraparound_count
    }

    /// Applies the update algorithm from spec §4.3 to one raw reading. Returns the new
    /// cumulative `accumulated` value.
    fn update(&mut self, raw: u64) -> u64 {
        let raw = raw & self.counter_mask;
        match self.last_raw {
            None => {
                self.accumulated = raw;
            }
            Some(last) => {
                if raw >= last {
                    self.accumulated += raw - last;
                } else {
                    // Wraparound: forward modular distance from `last` to `raw`. A jump
                    // bigger than half the range could mean more than one wrap happened,
                    // but that can never be distinguished from here, so only one is ever
                    // applied (see `wraparound_count` for the observed-anomaly statistic).
                    self.accumulated += (self.counter_mask - last) + raw;
                    self.wraparound_count += 1;
                }
            }
        }
        self.last_raw = Some(raw);
        self.accumulated
    }
}

impl fmt::Display for CounterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bits, {:.3e} J/unit): {} raw, {} J, {} wraps",
            self.name,
            self.bits,
            self.conversion_factor_to_joules,
            self.accumulated,
            self.accumulated_joules(),
            self.wraparound_count
        )
    }
}

/// Owns a set of [`CounterState`]s and applies updates to all of them atomically (spec
/// §4.3's "bulk update"): the whole batch is mutated under one `&mut self` borrow, so no
/// reader sharing the owning provider can ever observe a partially-updated set.
#[derive(Default)]
pub struct CounterAccumulator {
    counters: Vec<CounterState>,
}

impl CounterAccumulator {
    pub fn new() -> CounterAccumulator {
        CounterAccumulator { counters: Vec::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, bits: u32, conversion_factor_to_joules: f64, unit: impl Into<String>) -> CounterId {
        let id = CounterId(self.counters.len() as u16);
        self.counters.push(CounterState::new(name.into(), bits, conversion_factor_to_joules, unit.into()));
        id
    }

    pub fn get(&self, id: CounterId) -> &CounterState {
        &self.counters[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: CounterId) -> &mut CounterState {
        &mut self.counters[id.0 as usize]
    }

    pub fn set_active(&mut self, id: CounterId, active: bool) {
        self.counters[id.0 as usize].active = active;
    }

    pub fn iter(&self) -> impl Iterator<Item = (CounterId, &CounterState)> {
        self.counters
            .iter()
            .enumerate()
            .map(|(i, c)| (CounterId(i as u16), c))
    }

    /// Applies `(id, raw)` updates to every registered counter in one shot. Counters not
    /// present in `readings` are left untouched.
    pub fn bulk_update(&mut self, readings: &[(CounterId, u64)]) {
        for &(id, raw) in readings {
            self.counters[id.0 as usize].update(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_crossing_yields_exact_delta() {
        // Seed scenario from spec §8: 32-bit counter, conversion factor 1.0. Sequence
        // 4,294,967,290 -> 4,294,967,295 -> 3 -> 10 should wrap once and accumulate a
        // total delta of 15 raw units from the first reading to the last.
        let mut acc = CounterAccumulator::new();
        let id = acc.register("pkg", 32, 1.0, "J");

        acc.bulk_update(&[(id, 4_294_967_290)]);
        let baseline = acc.get(id).accumulated_raw();

        acc.bulk_update(&[(id, 4_294_967_295)]);
        acc.bulk_update(&[(id, 3)]);
        acc.bulk_update(&[(id, 10)]);

        assert_eq!(acc.get(id).accumulated_raw() - baseline, 15);
        assert_eq!(acc.get(id).wraparound_count(), 1);
    }

    #[test]
    fn boundary_counter_starting_near_max() {
        // spec §8 boundary scenario: start at max_raw - 10, then max_raw, 0, 5 => delta 15.
        let mut acc = CounterAccumulator::new();
        let id = acc.register("c", 32, 1.0, "J");
        let max_raw: u64 = (1u64 << 32) - 1;

        acc.bulk_update(&[(id, max_raw - 10)]);
        let start = acc.get(id).accumulated_raw();

        acc.bulk_update(&[(id, max_raw)]);
        acc.bulk_update(&[(id, 0)]);
        acc.bulk_update(&[(id, 5)]);

        let end = acc.get(id).accumulated_raw();
        assert_eq!(end - start, 15);
    }

    #[test]
    fn monotonic_non_decreasing_across_noisy_sequence() {
        let mut acc = CounterAccumulator::new();
        let id = acc.register("c", 32, 1.0, "J");
        let sequence = [0u64, 100, 250, 4_294_967_200, 4_294_967_290, 5, 4_000_000, 4_000_001];
        let mut prev = 0u64;
        let mut first = true;
        for raw in sequence {
            acc.bulk_update(&[(id, raw)]);
            let cur = acc.get(id).accumulated_raw();
            if !first {
                assert!(cur >= prev, "accumulated must never decrease: {prev} -> {cur}");
            }
            prev = cur;
            first = false;
        }
    }

    #[test]
    fn bulk_update_applies_to_every_registered_counter_at_once() {
        let mut acc = CounterAccumulator::new();
        let a = acc.register("a", 32, 1.0, "J");
        let b = acc.register("b", 32, 2.0, "J");
        acc.bulk_update(&[(a, 10), (b, 10)]);
        acc.bulk_update(&[(a, 20), (b, 25)]);
        assert_eq!(acc.get(a).accumulated_raw(), 20);
        assert_eq!(acc.get(b).accumulated_raw(), 25);
        assert_eq!(acc.get(b).accumulated_joules(), 50.0);
    }
}
