use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;

use meter_ingest::models::{EfficiencyRating, PeriodKind, PeriodSummary, RawReading};
use meter_ingest::retention::RetentionManager;
use meter_ingest::rollup::RollupEngine;
use meter_ingest::store::{MemoryStore, TelemetryStore};

const TARIFF: f64 = 0.30;

fn stack() -> (Arc<MemoryStore>, RollupEngine) {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn TelemetryStore> = store.clone();
    (store, RollupEngine::new(dyn_store, TARIFF))
}

fn day_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()
}

fn reading(device_id: &str, ts: DateTime<Utc>, power_w: f64, energy_kwh: f64) -> RawReading {
    RawReading {
        device_id: device_id.into(),
        ts,
        power_w,
        energy_kwh,
        voltage: 230.0,
        current: power_w / 230.0,
    }
}

fn daily(device_id: &str, start: DateTime<Utc>, energy_kwh: f64, avg_power_w: f64, count: i64) -> PeriodSummary {
    PeriodSummary {
        device_id: device_id.into(),
        kind: PeriodKind::Day,
        period_start: start,
        period_end: start + Duration::days(1),
        energy_kwh,
        peak_power_w: avg_power_w * 2.0,
        avg_power_w,
        active_hours: 12.0,
        est_cost: energy_kwh * TARIFF,
        efficiency: EfficiencyRating::from_avg_power(avg_power_w),
        reading_count: count,
        has_data: true,
    }
}

#[tokio::test]
async fn empty_window_still_gets_a_row() {
    let (store, engine) = stack();
    let end = day_start() + Duration::days(1);

    let outcome = engine
        .run(PeriodKind::Day, day_start(), end, &["plug-1".to_string()])
        .await;
    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.errors, 0);

    let summary = store
        .summary("plug-1", PeriodKind::Day, day_start())
        .unwrap();
    assert!(!summary.has_data);
    assert_eq!(summary.energy_kwh, 0.0);
    assert_eq!(summary.peak_power_w, 0.0);
    assert_eq!(summary.avg_power_w, 0.0);
    assert_eq!(summary.active_hours, 0.0);
    assert_eq!(summary.est_cost, 0.0);
    assert_eq!(summary.efficiency, EfficiencyRating::Unknown);
    assert_eq!(summary.reading_count, 0);
}

#[tokio::test]
async fn window_stats_cover_the_readings() {
    let (store, engine) = stack();
    store.push_raw(reading("plug-1", day_start() + Duration::hours(8), 50.0, 1.0));
    store.push_raw(reading(
        "plug-1",
        day_start() + Duration::hours(8) + Duration::minutes(15),
        150.0,
        1.2,
    ));
    store.push_raw(reading(
        "plug-1",
        day_start() + Duration::hours(8) + Duration::minutes(30),
        100.0,
        1.5,
    ));

    let end = day_start() + Duration::days(1);
    engine
        .run(PeriodKind::Day, day_start(), end, &["plug-1".to_string()])
        .await;

    let summary = store
        .summary("plug-1", PeriodKind::Day, day_start())
        .unwrap();
    assert!(summary.has_data);
    assert!((summary.energy_kwh - 0.5).abs() < 1e-12);
    assert_eq!(summary.peak_power_w, 150.0);
    assert!((summary.avg_power_w - 100.0).abs() < 1e-12);
    assert!((summary.active_hours - 0.5).abs() < 1e-12);
    assert!((summary.est_cost - 0.15).abs() < 1e-12);
    assert_eq!(summary.efficiency, EfficiencyRating::High);
    assert_eq!(summary.reading_count, 3);
}

#[tokio::test]
async fn rerunning_a_window_is_idempotent() {
    let (store, engine) = stack();
    store.push_raw(reading("plug-1", day_start() + Duration::hours(1), 80.0, 2.0));
    store.push_raw(reading("plug-1", day_start() + Duration::hours(2), 120.0, 2.4));

    let end = day_start() + Duration::days(1);
    let ids = ["plug-1".to_string()];
    engine.run(PeriodKind::Day, day_start(), end, &ids).await;
    let first = store
        .summary("plug-1", PeriodKind::Day, day_start())
        .unwrap();

    engine.run(PeriodKind::Day, day_start(), end, &ids).await;
    let second = store
        .summary("plug-1", PeriodKind::Day, day_start())
        .unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn one_failing_device_does_not_stop_the_batch() {
    let (store, engine) = stack();
    store.push_raw(reading("good", day_start() + Duration::hours(1), 80.0, 2.0));
    store.push_raw(reading("good", day_start() + Duration::hours(2), 120.0, 2.4));
    store.push_raw(reading("bad", day_start() + Duration::hours(1), 80.0, 2.0));
    store.fail_reads_for("bad");

    let end = day_start() + Duration::days(1);
    let ids = ["bad".to_string(), "good".to_string()];
    let outcome = engine.run(PeriodKind::Day, day_start(), end, &ids).await;

    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.errors, 1);
    assert!(store.summary("good", PeriodKind::Day, day_start()).is_some());
    assert!(store.summary("bad", PeriodKind::Day, day_start()).is_none());
}

#[tokio::test]
async fn week_folds_dailies_and_ignores_raw_rows() {
    let (store, engine) = stack();
    // 2024-03-11 is a Monday.
    let week_start = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap();
    store.push_summary(daily("plug-1", week_start, 1.0, 120.0, 100));
    store.push_summary(daily("plug-1", week_start + Duration::days(1), 2.0, 60.0, 50));

    // A wild raw row inside the week must not leak into the aggregate.
    store.push_raw(reading(
        "plug-1",
        week_start + Duration::hours(2),
        9_999.0,
        999.0,
    ));

    let week_end = week_start + Duration::days(7);
    let outcome = engine
        .run(
            PeriodKind::Week,
            week_start,
            week_end,
            &["plug-1".to_string()],
        )
        .await;
    assert_eq!(outcome.processed, 1);

    let summary = store
        .summary("plug-1", PeriodKind::Week, week_start)
        .unwrap();
    assert!(summary.has_data);
    assert!((summary.energy_kwh - 3.0).abs() < 1e-12);
    assert_eq!(summary.peak_power_w, 240.0);
    assert!((summary.est_cost - 3.0 * TARIFF).abs() < 1e-12);
    // (120 * 100 + 60 * 50) / 150
    assert!((summary.avg_power_w - 100.0).abs() < 1e-12);
    assert_eq!(summary.reading_count, 150);
    assert!((summary.active_hours - 24.0).abs() < 1e-12);
}

#[tokio::test]
async fn month_folds_its_dailies() {
    let (store, engine) = stack();
    let month_start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    for d in 0..3 {
        store.push_summary(daily(
            "plug-1",
            month_start + Duration::days(d),
            1.5,
            75.0,
            40,
        ));
    }

    let month_end = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    engine
        .run(
            PeriodKind::Month,
            month_start,
            month_end,
            &["plug-1".to_string()],
        )
        .await;

    let summary = store
        .summary("plug-1", PeriodKind::Month, month_start)
        .unwrap();
    assert!((summary.energy_kwh - 4.5).abs() < 1e-12);
    assert_eq!(summary.reading_count, 120);
    assert_eq!(summary.efficiency, EfficiencyRating::Medium);
    assert_eq!(summary.period_end, month_end);
}

#[tokio::test]
async fn retention_purges_only_rows_past_the_horizon() {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn TelemetryStore> = store.clone();
    let retention = RetentionManager::new(dyn_store, 48);

    let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
    store.push_raw(reading("plug-1", now - Duration::days(3), 100.0, 1.0));
    store.push_raw(reading("plug-1", now - Duration::hours(49), 100.0, 1.1));
    store.push_raw(reading("plug-1", now - Duration::hours(47), 100.0, 1.2));
    store.push_raw(reading("plug-1", now - Duration::hours(1), 100.0, 1.3));

    let deleted = retention.purge_older_than(now).await.unwrap();
    assert_eq!(deleted, 2);

    let remaining = store.raw_readings("plug-1");
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|r| r.ts >= now - Duration::hours(48)));

    // Nothing else crosses the horizon on a re-run.
    assert_eq!(retention.purge_older_than(now).await.unwrap(), 0);
}
