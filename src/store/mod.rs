pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgTelemetryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{DeviceLiveUpdate, DeviceRecord, PeriodKind, PeriodSummary, RawReading};

/// Everything the pipeline and the background jobs need from the relational
/// store. The live cache never lives here; this is durable state only.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Registration row for a device, if it has one.
    async fn device_by_id(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Every registered device id, for the rollup fan-out.
    async fn list_device_ids(&self) -> Result<Vec<String>>;

    /// Write the live snapshot of a registered device and mark it online.
    async fn upsert_device_live(&self, live: &DeviceLiveUpdate) -> Result<()>;

    /// Flip a device's row to offline, keeping its true last contact time.
    async fn mark_device_offline(&self, device_id: &str, last_seen: DateTime<Utc>) -> Result<()>;

    /// Append one downsampled reading. Replaying the same (device, ts) pair
    /// must not duplicate the row.
    async fn append_raw_reading(&self, reading: &RawReading) -> Result<()>;

    /// Raw readings for a device in `[start, end)`, ordered by time.
    async fn raw_readings_in(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawReading>>;

    /// Timestamp of the oldest raw reading still stored, across all devices.
    /// Bounds the scheduler's startup catch-up range.
    async fn oldest_raw_reading_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Insert or fully overwrite the summary row keyed by
    /// (device, kind, period_start).
    async fn replace_period_summary(&self, summary: &PeriodSummary) -> Result<()>;

    /// Summaries of one kind for a device with `period_start` in
    /// `[start, end)`, ordered by period start.
    async fn period_summaries_in(
        &self,
        device_id: &str,
        kind: PeriodKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PeriodSummary>>;

    /// Purge raw readings strictly older than `cutoff`; returns rows removed.
    async fn delete_raw_readings_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
