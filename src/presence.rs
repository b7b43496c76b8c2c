//! Process-scoped live state for metering devices.
//!
//! Every mutation of a device's state goes through [`PresenceTracker::apply`],
//! which holds the map lock for the duration of the closure. Two samples from
//! the same device therefore integrate strictly one after the other and can
//! never read the same anchor.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::energy::EnergyAnchor;
use crate::models::ElectricalSnapshot;

#[derive(Debug, Clone)]
pub struct DeviceLiveState {
    /// Arrival time of the newest sample, whatever its clock said.
    pub last_seen_at: DateTime<Utc>,
    /// Time of the last sample that advanced the clock; integration anchor.
    pub last_sample_at: DateTime<Utc>,
    pub last_power_w: f64,
    /// Running integral on top of the device's stored baseline.
    pub energy_kwh: f64,
    pub sample_count: u64,
    pub snapshot: ElectricalSnapshot,
    /// Set once the sweep has reported this device offline; cleared on the
    /// next sample so each transition is stored exactly once.
    pub(crate) marked_offline: bool,
}

impl DeviceLiveState {
    /// First contact: the sample itself becomes the integration anchor.
    pub fn first_contact(
        at: DateTime<Utc>,
        power_w: f64,
        baseline_kwh: f64,
        snapshot: ElectricalSnapshot,
    ) -> Self {
        Self {
            last_seen_at: at,
            last_sample_at: at,
            last_power_w: power_w,
            energy_kwh: baseline_kwh,
            sample_count: 1,
            snapshot,
            marked_offline: false,
        }
    }

    pub fn anchor(&self) -> EnergyAnchor {
        EnergyAnchor {
            at: self.last_sample_at,
            power_w: self.last_power_w,
            energy_kwh: self.energy_kwh,
        }
    }

    /// Fold a new sample into the state. The caller integrates first and
    /// passes the updated counter; the anchor only moves when time advanced.
    pub fn record_sample(
        &mut self,
        at: DateTime<Utc>,
        power_w: f64,
        energy_kwh: f64,
        snapshot: ElectricalSnapshot,
    ) {
        self.last_seen_at = self.last_seen_at.max(at);
        if at > self.last_sample_at {
            self.last_sample_at = at;
            self.last_power_w = power_w;
        }
        self.energy_kwh = energy_kwh;
        self.sample_count = self.sample_count.saturating_add(1);
        self.snapshot = snapshot;
        self.marked_offline = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
    /// Never seen, or evicted after going idle.
    Unknown,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Presence::Online => f.write_str("online"),
            Presence::Offline => f.write_str("offline"),
            Presence::Unknown => f.write_str("unknown"),
        }
    }
}

/// What one sweep pass found. The caller owns the follow-up store writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Devices that crossed the online timeout this pass, with their actual
    /// last contact time.
    pub went_offline: Vec<(String, DateTime<Utc>)>,
    /// Devices dropped from the cache after the idle window.
    pub evicted: Vec<String>,
}

pub struct PresenceTracker {
    online_timeout: Duration,
    evict_after: Duration,
    devices: Mutex<HashMap<String, DeviceLiveState>>,
}

impl PresenceTracker {
    pub fn new(online_timeout_ms: u64, evict_after_ms: u64) -> Self {
        Self {
            online_timeout: Duration::milliseconds(online_timeout_ms as i64),
            evict_after: Duration::milliseconds(evict_after_ms as i64),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Run a closure against one device's slot while holding the state lock.
    /// `None` in the slot means the device is untracked; leaving `None`
    /// behind keeps it that way. The closure must not block.
    pub fn apply<R>(&self, device_id: &str, f: impl FnOnce(&mut Option<DeviceLiveState>) -> R) -> R {
        let mut devices = self.devices.lock().unwrap();
        let mut slot = devices.remove(device_id);
        let out = f(&mut slot);
        if let Some(state) = slot {
            devices.insert(device_id.to_string(), state);
        }
        out
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceLiveState> {
        self.devices.lock().unwrap().get(device_id).cloned()
    }

    pub fn presence(&self, device_id: &str, now: DateTime<Utc>) -> Presence {
        match self.devices.lock().unwrap().get(device_id) {
            None => Presence::Unknown,
            Some(state) if now - state.last_seen_at < self.online_timeout => Presence::Online,
            Some(_) => Presence::Offline,
        }
    }

    pub fn is_online(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        matches!(self.presence(device_id, now), Presence::Online)
    }

    pub fn tracked(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    /// One pass over every tracked device: report fresh offline transitions
    /// exactly once, and drop devices idle past the eviction window.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut devices = self.devices.lock().unwrap();
        devices.retain(|device_id, state| {
            let idle = now - state.last_seen_at;
            if idle >= self.online_timeout && !state.marked_offline {
                state.marked_offline = true;
                report
                    .went_offline
                    .push((device_id.clone(), state.last_seen_at));
            }
            if idle > self.evict_after {
                report.evicted.push(device_id.clone());
                return false;
            }
            true
        });
        report
    }
}
