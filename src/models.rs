use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Midnight UTC of the given date.
pub fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// One telemetry push from a metering device, field names as the firmware
/// sends them. Absent fields deserialize to zero so a partial payload still
/// ingests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySample {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    /// The device's own cumulative counter. Only consulted as a baseline for
    /// devices we have never stored anything for.
    pub energy: f64,
    pub frequency: f64,
    pub power_factor: f64,
}

impl TelemetrySample {
    pub fn from_json(payload: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Coerce the values the way the devices are known to misbehave:
    /// non-finite numbers become zero, and power and the cumulative counter
    /// are clamped to non-negative.
    pub fn sanitized(mut self) -> Self {
        for v in [
            &mut self.voltage,
            &mut self.current,
            &mut self.power,
            &mut self.energy,
            &mut self.frequency,
            &mut self.power_factor,
        ] {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        if self.power < 0.0 {
            self.power = 0.0;
        }
        if self.energy < 0.0 {
            self.energy = 0.0;
        }
        self
    }
}

/// Latest electrical readings carried on the live state for presence
/// consumers. Power is tracked separately as the integration anchor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectricalSnapshot {
    pub voltage: f64,
    pub current: f64,
    pub frequency: f64,
    pub power_factor: f64,
}

impl From<&TelemetrySample> for ElectricalSnapshot {
    fn from(s: &TelemetrySample) -> Self {
        Self {
            voltage: s.voltage,
            current: s.current,
            frequency: s.frequency,
            power_factor: s.power_factor,
        }
    }
}

/// Downsampled measurement as persisted to `raw_readings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RawReading {
    pub device_id: String,
    pub ts: DateTime<Utc>,
    pub power_w: f64,
    pub energy_kwh: f64,
    pub voltage: f64,
    pub current: f64,
}

/// Registration row in `devices`, as read back by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: Option<String>,
    pub energy_kwh: f64,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Live snapshot written back to `devices` on every accepted sample from a
/// registered device. The store marks the row online as part of the upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLiveUpdate {
    pub device_id: String,
    pub ts: DateTime<Utc>,
    pub power_w: f64,
    pub energy_kwh: f64,
    pub voltage: f64,
    pub current: f64,
    pub frequency: f64,
    pub power_factor: f64,
}

/// Acknowledgement returned to the device after ingestion. Carries the
/// locally integrated energy even when store writes were skipped or failed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub energy_kwh: f64,
    pub online: bool,
    pub registered: bool,
    pub ts: DateTime<Utc>,
}

/// Per-device tally of one rollup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupOutcome {
    pub processed: usize,
    pub errors: usize,
}

impl RollupOutcome {
    pub fn absorb(&mut self, other: RollupOutcome) {
        self.processed += other.processed;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Hour,
    Day,
    Week,
    Month,
}

impl PeriodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodKind::Hour => "hour",
            PeriodKind::Day => "day",
            PeriodKind::Week => "week",
            PeriodKind::Month => "month",
        }
    }

    /// Start of the window containing `t`. Weeks start on Monday, all
    /// boundaries are UTC.
    pub fn start_of(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let day = day_start(t.date_naive());
        match self {
            PeriodKind::Hour => day + Duration::hours(t.hour() as i64),
            PeriodKind::Day => day,
            PeriodKind::Week => {
                day - Duration::days(t.date_naive().weekday().num_days_from_monday() as i64)
            }
            PeriodKind::Month => day - Duration::days(t.date_naive().day0() as i64),
        }
    }

    /// Exclusive end of the window beginning at `start`. `start` must be a
    /// window start as produced by [`PeriodKind::start_of`].
    pub fn end_of(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            PeriodKind::Hour => start + Duration::hours(1),
            PeriodKind::Day => start + Duration::days(1),
            PeriodKind::Week => start + Duration::days(7),
            PeriodKind::Month => {
                start + Duration::days(days_in_month(start.year(), start.month()) as i64)
            }
        }
    }

    /// Half-open `[start, end)` window containing `t`.
    pub fn window_containing(&self, t: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.start_of(t);
        (start, self.end_of(start))
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct UnknownPeriodKind(String);

impl fmt::Display for UnknownPeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown period kind: {:?}", self.0)
    }
}

impl std::error::Error for UnknownPeriodKind {}

impl FromStr for PeriodKind {
    type Err = UnknownPeriodKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(PeriodKind::Hour),
            "day" => Ok(PeriodKind::Day),
            "week" => Ok(PeriodKind::Week),
            "month" => Ok(PeriodKind::Month),
            other => Err(UnknownPeriodKind(other.to_string())),
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ => {
            if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
                29
            } else {
                28
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EfficiencyRating {
    High,
    Medium,
    Low,
    /// No usable data in the window.
    Unknown,
}

impl EfficiencyRating {
    /// Banding over the window's average power draw.
    pub fn from_avg_power(avg_power_w: f64) -> Self {
        if avg_power_w >= 100.0 {
            EfficiencyRating::High
        } else if avg_power_w >= 50.0 {
            EfficiencyRating::Medium
        } else {
            EfficiencyRating::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EfficiencyRating::High => "high",
            EfficiencyRating::Medium => "medium",
            EfficiencyRating::Low => "low",
            EfficiencyRating::Unknown => "unknown",
        }
    }

    /// Lossy parse for values read back from the store.
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "high" => EfficiencyRating::High,
            "medium" => EfficiencyRating::Medium,
            "low" => EfficiencyRating::Low,
            _ => EfficiencyRating::Unknown,
        }
    }
}

impl fmt::Display for EfficiencyRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `period_summaries`. Identified by (device, kind, start);
/// recomputing a window replaces every derived field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub device_id: String,
    pub kind: PeriodKind,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub energy_kwh: f64,
    pub peak_power_w: f64,
    pub avg_power_w: f64,
    pub active_hours: f64,
    pub est_cost: f64,
    pub efficiency: EfficiencyRating,
    pub reading_count: i64,
    pub has_data: bool,
}

impl PeriodSummary {
    /// Marker row for a window without enough data to aggregate.
    pub fn empty(
        device_id: &str,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        reading_count: i64,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            kind,
            period_start,
            period_end,
            energy_kwh: 0.0,
            peak_power_w: 0.0,
            avg_power_w: 0.0,
            active_hours: 0.0,
            est_cost: 0.0,
            efficiency: EfficiencyRating::Unknown,
            reading_count,
            has_data: false,
        }
    }
}
