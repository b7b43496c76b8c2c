use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::Result;
use crate::store::TelemetryStore;

/// Purges raw readings once every summary that could read them has had its
/// chance. Config validation keeps the minimum age at or above a full day,
/// so a reading always outlives the daily rollup of its window.
pub struct RetentionManager {
    store: Arc<dyn TelemetryStore>,
    min_age: Duration,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn TelemetryStore>, min_age_hours: u32) -> Self {
        Self {
            store,
            min_age: Duration::hours(i64::from(min_age_hours)),
        }
    }

    pub async fn purge_older_than(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - self.min_age;
        let deleted = self.store.delete_raw_readings_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "purged raw readings past retention");
        }
        Ok(deleted)
    }

    pub async fn run(&self) -> Result<u64> {
        self.purge_older_than(Utc::now()).await
    }
}
