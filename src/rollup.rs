//! Periodic aggregation of raw readings into `period_summaries` rows.
//!
//! A rollup recomputes a whole window from its source rows and overwrites
//! the summary keyed by (device, kind, period_start), so re-running any
//! window is safe. Hour and day windows read raw readings; week and month
//! windows fold the already-rolled daily rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::error::Result;
use crate::models::{
    EfficiencyRating, PeriodKind, PeriodSummary, RawReading, RollupOutcome,
};
use crate::store::TelemetryStore;

const MS_PER_HOUR: f64 = 3_600_000.0;
/// Hour and day windows never span more than a day of activity.
const MAX_ACTIVE_HOURS: f64 = 24.0;

pub struct RollupEngine {
    store: Arc<dyn TelemetryStore>,
    tariff_per_kwh: f64,
}

impl RollupEngine {
    pub fn new(store: Arc<dyn TelemetryStore>, tariff_per_kwh: f64) -> Self {
        Self {
            store,
            tariff_per_kwh,
        }
    }

    /// Roll one window for every listed device. A failing device is logged
    /// and counted; the rest of the list still runs.
    pub async fn run(
        &self,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        device_ids: &[String],
    ) -> RollupOutcome {
        let mut outcome = RollupOutcome::default();
        for device_id in device_ids {
            match self
                .rollup_device(kind, period_start, period_end, device_id)
                .await
            {
                Ok(()) => outcome.processed += 1,
                Err(e) => {
                    outcome.errors += 1;
                    error!(device_id = %device_id, kind = %kind, error = %e, "rollup failed for device");
                }
            }
        }
        info!(
            kind = %kind,
            period_start = %period_start,
            processed = outcome.processed,
            errors = outcome.errors,
            "rollup pass finished"
        );
        outcome
    }

    async fn rollup_device(
        &self,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        device_id: &str,
    ) -> Result<()> {
        let summary = match kind {
            PeriodKind::Hour | PeriodKind::Day => {
                let readings = self
                    .store
                    .raw_readings_in(device_id, period_start, period_end)
                    .await?;
                summarize(
                    device_id,
                    kind,
                    period_start,
                    period_end,
                    &readings,
                    self.tariff_per_kwh,
                )
            }
            PeriodKind::Week | PeriodKind::Month => {
                let dailies = self
                    .store
                    .period_summaries_in(device_id, PeriodKind::Day, period_start, period_end)
                    .await?;
                summarize_from_dailies(device_id, kind, period_start, period_end, &dailies)
            }
        };
        self.store.replace_period_summary(&summary).await
    }
}

/// Aggregate time-ordered raw readings into one summary row. Fewer than two
/// readings cannot give a consumption delta, so such windows produce a
/// no-data marker that still records how many readings were seen.
pub fn summarize(
    device_id: &str,
    kind: PeriodKind,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    readings: &[RawReading],
    tariff_per_kwh: f64,
) -> PeriodSummary {
    if readings.len() < 2 {
        return PeriodSummary::empty(
            device_id,
            kind,
            period_start,
            period_end,
            readings.len() as i64,
        );
    }

    let mut min_energy = f64::INFINITY;
    let mut max_energy = f64::NEG_INFINITY;
    let mut peak_power_w = 0.0f64;
    let mut power_sum = 0.0;
    for r in readings {
        min_energy = min_energy.min(r.energy_kwh);
        max_energy = max_energy.max(r.energy_kwh);
        peak_power_w = peak_power_w.max(r.power_w);
        power_sum += r.power_w;
    }

    let energy_kwh = max_energy - min_energy;
    let avg_power_w = power_sum / readings.len() as f64;
    let span_ms = (readings[readings.len() - 1].ts - readings[0].ts).num_milliseconds();
    let active_hours = (span_ms as f64 / MS_PER_HOUR).clamp(0.0, MAX_ACTIVE_HOURS);

    PeriodSummary {
        device_id: device_id.to_string(),
        kind,
        period_start,
        period_end,
        energy_kwh,
        peak_power_w,
        avg_power_w,
        active_hours,
        est_cost: energy_kwh * tariff_per_kwh,
        efficiency: EfficiencyRating::from_avg_power(avg_power_w),
        reading_count: readings.len() as i64,
        has_data: true,
    }
}

/// Fold a week or month out of its daily rows: sums for energy, cost, hours
/// and counts, max for peak, and an average power weighted by each day's
/// reading count. Days without data contribute only their reading count.
pub fn summarize_from_dailies(
    device_id: &str,
    kind: PeriodKind,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    dailies: &[PeriodSummary],
) -> PeriodSummary {
    let reading_count: i64 = dailies.iter().map(|d| d.reading_count).sum();

    let mut energy_kwh = 0.0;
    let mut est_cost = 0.0;
    let mut peak_power_w = 0.0f64;
    let mut active_hours = 0.0;
    let mut weighted_power = 0.0;
    let mut weight: i64 = 0;
    let mut days_with_data = 0;
    for d in dailies.iter().filter(|d| d.has_data) {
        energy_kwh += d.energy_kwh;
        est_cost += d.est_cost;
        peak_power_w = peak_power_w.max(d.peak_power_w);
        active_hours += d.active_hours;
        weighted_power += d.avg_power_w * d.reading_count as f64;
        weight += d.reading_count;
        days_with_data += 1;
    }

    if days_with_data == 0 {
        return PeriodSummary::empty(device_id, kind, period_start, period_end, reading_count);
    }

    let avg_power_w = if weight > 0 {
        weighted_power / weight as f64
    } else {
        0.0
    };

    PeriodSummary {
        device_id: device_id.to_string(),
        kind,
        period_start,
        period_end,
        energy_kwh,
        peak_power_w,
        avg_power_w,
        active_hours,
        est_cost,
        efficiency: EfficiencyRating::from_avg_power(avg_power_w),
        reading_count,
        has_data: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()
    }

    fn reading(ts: DateTime<Utc>, power_w: f64, energy_kwh: f64) -> RawReading {
        RawReading {
            device_id: "plug-1".into(),
            ts,
            power_w,
            energy_kwh,
            voltage: 230.0,
            current: power_w / 230.0,
        }
    }

    fn daily(
        start: DateTime<Utc>,
        energy_kwh: f64,
        peak_power_w: f64,
        avg_power_w: f64,
        active_hours: f64,
        est_cost: f64,
        reading_count: i64,
    ) -> PeriodSummary {
        PeriodSummary {
            device_id: "plug-1".into(),
            kind: PeriodKind::Day,
            period_start: start,
            period_end: start + Duration::days(1),
            energy_kwh,
            peak_power_w,
            avg_power_w,
            active_hours,
            est_cost,
            efficiency: EfficiencyRating::from_avg_power(avg_power_w),
            reading_count,
            has_data: true,
        }
    }

    #[test]
    fn empty_window_yields_a_no_data_marker() {
        let end = t0() + Duration::days(1);
        let summary = summarize("plug-1", PeriodKind::Day, t0(), end, &[], 0.30);
        assert!(!summary.has_data);
        assert_eq!(summary.energy_kwh, 0.0);
        assert_eq!(summary.est_cost, 0.0);
        assert_eq!(summary.efficiency, EfficiencyRating::Unknown);
        assert_eq!(summary.reading_count, 0);
        assert_eq!(summary.period_end, end);
    }

    #[test]
    fn single_reading_cannot_give_a_delta() {
        let end = t0() + Duration::days(1);
        let readings = [reading(t0(), 100.0, 5.0)];
        let summary = summarize("plug-1", PeriodKind::Day, t0(), end, &readings, 0.30);
        assert!(!summary.has_data);
        assert_eq!(summary.reading_count, 1);
    }

    #[test]
    fn window_stats_from_ordered_readings() {
        let end = t0() + Duration::days(1);
        let readings = [
            reading(t0(), 50.0, 1.0),
            reading(t0() + Duration::minutes(15), 150.0, 1.2),
            reading(t0() + Duration::minutes(30), 100.0, 1.5),
        ];
        let summary = summarize("plug-1", PeriodKind::Day, t0(), end, &readings, 0.30);
        assert!(summary.has_data);
        assert!((summary.energy_kwh - 0.5).abs() < 1e-12);
        assert_eq!(summary.peak_power_w, 150.0);
        assert!((summary.avg_power_w - 100.0).abs() < 1e-12);
        assert!((summary.active_hours - 0.5).abs() < 1e-12);
        assert!((summary.est_cost - 0.15).abs() < 1e-12);
        assert_eq!(summary.efficiency, EfficiencyRating::High);
        assert_eq!(summary.reading_count, 3);
    }

    #[test]
    fn active_hours_are_capped_at_a_day() {
        let end = t0() + Duration::days(2);
        let readings = [
            reading(t0(), 10.0, 0.0),
            reading(t0() + Duration::hours(30), 10.0, 0.3),
        ];
        let summary = summarize("plug-1", PeriodKind::Day, t0(), end, &readings, 0.30);
        assert_eq!(summary.active_hours, 24.0);
    }

    #[test]
    fn summarize_is_deterministic() {
        let end = t0() + Duration::days(1);
        let readings = [
            reading(t0(), 50.0, 1.0),
            reading(t0() + Duration::minutes(10), 80.0, 1.1),
        ];
        let a = summarize("plug-1", PeriodKind::Day, t0(), end, &readings, 0.30);
        let b = summarize("plug-1", PeriodKind::Day, t0(), end, &readings, 0.30);
        assert_eq!(a, b);
    }

    #[test]
    fn week_folds_daily_rows() {
        let end = t0() + Duration::days(7);
        let dailies = [
            daily(t0(), 1.0, 200.0, 120.0, 10.0, 0.2, 100),
            daily(t0() + Duration::days(1), 2.0, 150.0, 60.0, 12.0, 0.4, 50),
            // A day that never got enough readings.
            PeriodSummary::empty(
                "plug-1",
                PeriodKind::Day,
                t0() + Duration::days(2),
                t0() + Duration::days(3),
                1,
            ),
        ];
        let summary = summarize_from_dailies("plug-1", PeriodKind::Week, t0(), end, &dailies);
        assert!(summary.has_data);
        assert!((summary.energy_kwh - 3.0).abs() < 1e-12);
        assert_eq!(summary.peak_power_w, 200.0);
        assert!((summary.active_hours - 22.0).abs() < 1e-12);
        assert!((summary.est_cost - 0.6).abs() < 1e-12);
        // (120 * 100 + 60 * 50) / 150
        assert!((summary.avg_power_w - 100.0).abs() < 1e-12);
        assert_eq!(summary.efficiency, EfficiencyRating::High);
        assert_eq!(summary.reading_count, 151);
    }

    #[test]
    fn week_of_empty_days_is_a_marker_row() {
        let end = t0() + Duration::days(7);
        let dailies = [
            PeriodSummary::empty("plug-1", PeriodKind::Day, t0(), t0() + Duration::days(1), 1),
            PeriodSummary::empty(
                "plug-1",
                PeriodKind::Day,
                t0() + Duration::days(1),
                t0() + Duration::days(2),
                0,
            ),
        ];
        let summary = summarize_from_dailies("plug-1", PeriodKind::Week, t0(), end, &dailies);
        assert!(!summary.has_data);
        assert_eq!(summary.reading_count, 1);
        assert_eq!(summary.efficiency, EfficiencyRating::Unknown);
    }
}
