//! Trapezoidal integration of instantaneous power into cumulative energy.

use chrono::{DateTime, Utc};

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Left edge of the next trapezoid: the last sample that advanced the
/// device's clock, together with the cumulative energy at that point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyAnchor {
    pub at: DateTime<Utc>,
    pub power_w: f64,
    pub energy_kwh: f64,
}

/// Advance the cumulative kWh counter by the trapezoid between the anchor
/// and the new sample.
///
/// Guards, in order:
/// - no anchor: nothing to integrate from, the counter starts at zero and
///   the caller owns any stored baseline;
/// - time did not advance (skewed or duplicated clock): counter unchanged;
/// - both edges at zero power: counter unchanged, so an idle device never
///   drifts upward on float noise.
pub fn integrate(prev: Option<&EnergyAnchor>, new_power_w: f64, new_time: DateTime<Utc>) -> f64 {
    let Some(prev) = prev else {
        return 0.0;
    };
    if new_time <= prev.at {
        return prev.energy_kwh;
    }
    let elapsed_ms = (new_time - prev.at).num_milliseconds();
    if elapsed_ms <= 0 {
        return prev.energy_kwh;
    }
    if prev.power_w == 0.0 && new_power_w == 0.0 {
        return prev.energy_kwh;
    }

    let elapsed_hours = elapsed_ms as f64 / MS_PER_HOUR;
    let avg_power_w = (prev.power_w + new_power_w) / 2.0;
    let increment_kwh = ((avg_power_w / 1000.0) * elapsed_hours).max(0.0);
    prev.energy_kwh + increment_kwh
}
