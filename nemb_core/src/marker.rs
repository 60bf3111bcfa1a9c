//! User checkpoints (spec §3, §4.6, §5): an append-only list guarded by a single mutex,
//! with pre-reserved capacity so `mark_checkpoint` does not allocate in the steady state.

use std::sync::Mutex;

use crate::clock::PrecisionClock;

const PREALLOCATED_MARKERS: usize = 4096;

#[derive(Debug, Clone)]
pub struct Marker {
    pub name: String,
    pub timestamp_ns: u64,
}

pub struct MarkerList {
    markers: Mutex<Vec<Marker>>,
}

impl MarkerList {
    pub fn new() -> MarkerList {
        MarkerList {
            markers: Mutex::new(Vec::with_capacity(PREALLOCATED_MARKERS)),
        }
    }

    /// Records `(name, clock.now_ns())`. Must stay cheap: a clock read and an amortized
    /// append under a mutex, no I/O (spec §4.6's ≤300ns budget).
    pub fn mark(&self, clock: &PrecisionClock, name: impl Into<String>) {
        let timestamp_ns = clock.now_ns();
        let mut markers = self.markers.lock().expect("marker mutex poisoned");
        markers.push(Marker {
            name: name.into(),
            timestamp_ns,
        });
    }

    /// Markers sorted by timestamp — insertion order may not match timestamp order across
    /// threads (spec §5), so the Correlator must sort before binary-searching.
    pub fn sorted_snapshot(&self) -> Vec<Marker> {
        let markers = self.markers.lock().expect("marker mutex poisoned");
        let mut snapshot: Vec<Marker> = markers.clone();
        snapshot.sort_by_key(|m| m.timestamp_ns);
        snapshot
    }

    pub fn len(&self) -> usize {
        self.markers.lock().expect("marker mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.markers.lock().expect("marker mutex poisoned").clear();
    }
}

impl Default for MarkerList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_appends_in_call_order() {
        let clock = PrecisionClock::init().expect("clock available in CI");
        let markers = MarkerList::new();
        markers.mark(&clock, "a");
        markers.mark(&clock, "b");
        markers.mark(&clock, "c");
        let snapshot = markers.sorted_snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.windows(2).all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
    }

    #[test]
    fn reset_clears_markers() {
        let clock = PrecisionClock::init().expect("clock available in CI");
        let markers = MarkerList::new();
        markers.mark(&clock, "a");
        markers.reset();
        assert!(markers.is_empty());
    }
}
