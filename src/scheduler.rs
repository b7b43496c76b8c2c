//! Wall-clock driven maintenance: the offline sweep, hour and day rollups
//! with their week/month chaining, and the retention purge.
//!
//! Every job can also be triggered directly (the `*_once`, `run_rollup` and
//! `run_daily_for` methods); recomputing a window is idempotent, so a timer
//! firing next to a manual trigger is harmless.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::downsample::Downsampler;
use crate::error::Result;
use crate::models::{day_start, PeriodKind, RollupOutcome};
use crate::presence::PresenceTracker;
use crate::retention::RetentionManager;
use crate::rollup::RollupEngine;
use crate::store::TelemetryStore;

pub struct Scheduler {
    store: Arc<dyn TelemetryStore>,
    presence: Arc<PresenceTracker>,
    downsampler: Arc<Downsampler>,
    rollup: Arc<RollupEngine>,
    retention: Arc<RetentionManager>,
    sweep_interval: StdDuration,
    daily_at: NaiveTime,
    purge_interval: StdDuration,
}

impl Scheduler {
    pub fn new(
        cfg: &Config,
        store: Arc<dyn TelemetryStore>,
        presence: Arc<PresenceTracker>,
        downsampler: Arc<Downsampler>,
        rollup: Arc<RollupEngine>,
        retention: Arc<RetentionManager>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            presence,
            downsampler,
            rollup,
            retention,
            sweep_interval: StdDuration::from_millis(cfg.presence.sweep_interval_ms),
            daily_at: cfg.rollup.daily_at_time()?,
            purge_interval: StdDuration::from_secs(
                u64::from(cfg.retention.purge_interval_hours) * 3600,
            ),
        })
    }

    pub fn spawn_all(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let sweep = {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move { scheduler.sweep_loop().await })
        };
        let hourly = {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move { scheduler.hourly_loop().await })
        };
        let daily = {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move { scheduler.daily_loop().await })
        };
        let purge = {
            let scheduler = self;
            tokio::spawn(async move { scheduler.purge_loop().await })
        };
        vec![sweep, hourly, daily, purge]
    }

    async fn sweep_loop(&self) {
        let mut ticker = interval(self.sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.sweep_once(Utc::now()).await;
        }
    }

    /// One presence pass: store writes for fresh offline transitions and
    /// local cleanup for evicted devices. Store failures are logged only;
    /// presence degradation never takes ingestion down.
    pub async fn sweep_once(&self, now: DateTime<Utc>) {
        let report = self.presence.sweep(now);
        for (device_id, last_seen) in &report.went_offline {
            match self.store.mark_device_offline(device_id, *last_seen).await {
                Ok(()) => info!(device_id = %device_id, "device went offline"),
                Err(e) => warn!(device_id = %device_id, error = %e, "offline mark failed"),
            }
        }
        for device_id in &report.evicted {
            self.downsampler.forget(device_id);
            info!(device_id = %device_id, "idle device evicted from live tracking");
        }
    }

    async fn hourly_loop(&self) {
        let now = Utc::now();
        let boundary = PeriodKind::Hour.end_of(PeriodKind::Hour.start_of(now));
        sleep(sleep_duration_until(boundary, now)).await;
        let mut ticker = interval(StdDuration::from_secs(3600));
        loop {
            ticker.tick().await;
            let start = PeriodKind::Hour.start_of(Utc::now()) - Duration::hours(1);
            self.run_rollup(PeriodKind::Hour, start).await;
        }
    }

    async fn daily_loop(&self) {
        let now = Utc::now();
        let first = next_daily_run(now, self.daily_at);
        info!(at = %first, "daily rollup scheduled");
        sleep(sleep_duration_until(first, now)).await;
        let mut ticker = interval(StdDuration::from_secs(24 * 3600));
        loop {
            ticker.tick().await;
            self.run_daily_for(Utc::now().date_naive()).await;
        }
    }

    async fn purge_loop(&self) {
        let mut ticker = interval(self.purge_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.retention.run().await {
                error!(error = %e, "retention purge failed");
            }
        }
    }

    /// Roll one window for every registered device. A failed device listing
    /// abandons the cycle; the next trigger retries the same window.
    pub async fn run_rollup(&self, kind: PeriodKind, period_start: DateTime<Utc>) -> RollupOutcome {
        let period_end = kind.end_of(period_start);
        let device_ids = match self.store.list_device_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(kind = %kind, error = %e, "device listing failed, skipping rollup cycle");
                return RollupOutcome::default();
            }
        };
        self.rollup
            .run(kind, period_start, period_end, &device_ids)
            .await
    }

    /// Roll the day preceding `day_after`, then any week or month that
    /// `day_after` just closed.
    pub async fn run_daily_for(&self, day_after: NaiveDate) -> RollupOutcome {
        let mut outcome = RollupOutcome::default();
        for (kind, start) in closed_windows(day_after) {
            outcome.absorb(self.run_rollup(kind, start).await);
        }
        outcome
    }

    /// Startup catch-up against the current wall clock.
    pub async fn catch_up(&self) -> RollupOutcome {
        self.catch_up_at(Utc::now()).await
    }

    /// Close out every day still backed by stored raw readings, oldest
    /// first, plus any week or month those days completed. Runs once at
    /// startup, before the timers, so a process that was down across one
    /// or more midnights rolls its whole backlog while the retention
    /// purge cannot yet reach the rows. With nothing stored it degrades
    /// to rolling yesterday once.
    pub async fn catch_up_at(&self, now: DateTime<Utc>) -> RollupOutcome {
        let today = now.date_naive();
        let yesterday = today - Duration::days(1);
        let first_day = match self.store.oldest_raw_reading_at().await {
            Ok(Some(ts)) => ts.date_naive().min(yesterday),
            Ok(None) => yesterday,
            Err(e) => {
                error!(error = %e, "oldest reading lookup failed, catching up on yesterday only");
                yesterday
            }
        };

        let mut outcome = RollupOutcome::default();
        let mut day_after = first_day + Duration::days(1);
        while day_after <= today {
            outcome.absorb(self.run_daily_for(day_after).await);
            day_after = day_after + Duration::days(1);
        }
        info!(
            from = %first_day,
            processed = outcome.processed,
            errors = outcome.errors,
            "startup catch-up rollup finished"
        );
        outcome
    }
}

/// Windows closed by the arrival of `day_after`: always the preceding day,
/// plus the preceding week on Mondays and the preceding month on the 1st.
fn closed_windows(day_after: NaiveDate) -> Vec<(PeriodKind, DateTime<Utc>)> {
    let day = day_after - Duration::days(1);
    let mut windows = vec![(PeriodKind::Day, day_start(day))];
    if day_after.weekday() == Weekday::Mon {
        windows.push((PeriodKind::Week, day_start(day_after - Duration::days(7))));
    }
    if day_after.day() == 1 {
        let month_first = day - Duration::days(i64::from(day.day0()));
        windows.push((PeriodKind::Month, day_start(month_first)));
    }
    windows
}

fn next_daily_run(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

fn sleep_duration_until(when: DateTime<Utc>, now: DateTime<Utc>) -> StdDuration {
    (when - now).to_std().unwrap_or(StdDuration::ZERO)
}
