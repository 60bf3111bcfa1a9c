//! Fixed-capacity ring buffer of [`SynchronizedReading`]s (spec §4.5): one writer (the
//! sampling thread), many readers via a short mutex around a copy-out snapshot. The oldest
//! entry is dropped once `capacity` is exceeded; contents are returned in insertion order
//! regardless of internal wrap.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::reading::SynchronizedReading;

pub struct RingBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<SynchronizedReading>>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    pub fn push(&self, reading: SynchronizedReading) {
        let mut entries = self.entries.lock().expect("ring buffer mutex poisoned");
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(reading);
    }

    /// Copies out the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<SynchronizedReading> {
        let entries = self.entries.lock().expect("ring buffer mutex poisoned");
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("ring buffer mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(ts: u64) -> SynchronizedReading {
        SynchronizedReading::empty(ts)
    }

    #[test]
    fn drops_oldest_when_full() {
        let buf = RingBuffer::new(3);
        buf.push(reading(1));
        buf.push(reading(2));
        buf.push(reading(3));
        buf.push(reading(4));
        let snap = buf.snapshot();
        let timestamps: Vec<u64> = snap.iter().map(|r| r.common_timestamp_ns).collect();
        assert_eq!(timestamps, vec![2, 3, 4]);
    }

    #[test]
    fn never_exceeds_capacity() {
        let buf = RingBuffer::new(5);
        for i in 0..50 {
            buf.push(reading(i));
        }
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let buf = RingBuffer::new(10);
        for i in 0..10 {
            buf.push(reading(i));
        }
        let snap = buf.snapshot();
        for (i, r) in snap.iter().enumerate() {
            assert_eq!(r.common_timestamp_ns, i as u64);
        }
    }
}
