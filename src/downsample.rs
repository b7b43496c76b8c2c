use std::collections::HashMap;
use std::sync::Mutex;

/// Counters reset once they pass this bound so a device that reports for
/// months never grows an unbounded count.
const COUNTER_RESET_BOUND: u64 = 1_000_000;

/// Per-device sample counter deciding which accepted samples become raw
/// readings. With a factor of 6 and a 5 s reporting cadence this lands one
/// row every 30 s.
pub struct Downsampler {
    every_nth: u64,
    counters: Mutex<HashMap<String, u64>>,
}

impl Downsampler {
    pub fn new(every_nth: u32) -> Self {
        Self {
            every_nth: u64::from(every_nth.max(1)),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// True exactly on every Nth call for this device.
    pub fn should_persist(&self, device_id: &str) -> bool {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(device_id.to_string()).or_insert(0);
        *counter += 1;
        let persist = *counter % self.every_nth == 0;
        if *counter >= COUNTER_RESET_BOUND {
            *counter = 0;
        }
        persist
    }

    /// Drop the counter of an evicted device; its next sample starts a
    /// fresh cycle.
    pub fn forget(&self, device_id: &str) {
        self.counters.lock().unwrap().remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn every_sixth_sample_persists() {
        let ds = Downsampler::new(6);
        let decisions: Vec<bool> = (0..12).map(|_| ds.should_persist("plug-1")).collect();
        let expected: Vec<bool> = (1..=12).map(|i| i % 6 == 0).collect();
        assert_eq!(decisions, expected);
    }

    #[test]
    fn six_hundred_samples_keep_one_hundred() {
        let ds = Downsampler::new(6);
        let kept = (0..600).filter(|_| ds.should_persist("plug-1")).count();
        assert_eq!(kept, 100);
    }

    #[test]
    fn devices_count_independently() {
        let ds = Downsampler::new(3);
        ds.should_persist("a");
        ds.should_persist("a");
        // "b" is on its first sample while "a" is about to hit its third.
        assert!(!ds.should_persist("b"));
        assert!(ds.should_persist("a"));
    }

    #[test]
    fn forget_restarts_the_cycle() {
        let ds = Downsampler::new(4);
        for _ in 0..3 {
            ds.should_persist("plug-1");
        }
        ds.forget("plug-1");
        let decisions: Vec<bool> = (0..4).map(|_| ds.should_persist("plug-1")).collect();
        assert_eq!(decisions, vec![false, false, false, true]);
    }

    #[test]
    fn factor_of_one_keeps_everything() {
        let ds = Downsampler::new(1);
        assert!((0..5).all(|_| ds.should_persist("plug-1")));
    }
}
