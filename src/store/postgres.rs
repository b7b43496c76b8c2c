use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use crate::db::DbPool;
use crate::error::Result;
use crate::models::{
    DeviceLiveUpdate, DeviceRecord, EfficiencyRating, PeriodKind, PeriodSummary, RawReading,
};
use crate::store::TelemetryStore;

pub struct PgTelemetryStore {
    pool: DbPool,
}

impl PgTelemetryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl<'r> FromRow<'r, PgRow> for PeriodSummary {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let kind: String = row.try_get("period_kind")?;
        let kind = kind
            .parse::<PeriodKind>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "period_kind".into(),
                source: Box::new(e),
            })?;
        let efficiency: String = row.try_get("efficiency")?;
        Ok(Self {
            device_id: row.try_get("device_id")?,
            kind,
            period_start: row.try_get("period_start")?,
            period_end: row.try_get("period_end")?,
            energy_kwh: row.try_get("energy_kwh")?,
            peak_power_w: row.try_get("peak_power_w")?,
            avg_power_w: row.try_get("avg_power_w")?,
            active_hours: row.try_get("active_hours")?,
            est_cost: row.try_get("est_cost")?,
            efficiency: EfficiencyRating::from_db_str(&efficiency),
            reading_count: row.try_get("reading_count")?,
            has_data: row.try_get("has_data")?,
        })
    }
}

#[async_trait]
impl TelemetryStore for PgTelemetryStore {
    async fn device_by_id(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let record = sqlx::query_as::<_, DeviceRecord>(
            "SELECT device_id, name, energy_kwh, is_online, last_seen
             FROM devices
             WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_device_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>("SELECT device_id FROM devices ORDER BY device_id")
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    async fn upsert_device_live(&self, live: &DeviceLiveUpdate) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices
                 (device_id, is_online, last_seen, power_w, energy_kwh,
                  voltage, current, frequency, power_factor, updated_at)
             VALUES ($1, TRUE, $2, $3, $4, $5, $6, $7, $8, $2)
             ON CONFLICT (device_id) DO UPDATE SET
                 is_online = TRUE,
                 last_seen = EXCLUDED.last_seen,
                 power_w = EXCLUDED.power_w,
                 energy_kwh = EXCLUDED.energy_kwh,
                 voltage = EXCLUDED.voltage,
                 current = EXCLUDED.current,
                 frequency = EXCLUDED.frequency,
                 power_factor = EXCLUDED.power_factor,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&live.device_id)
        .bind(live.ts)
        .bind(live.power_w)
        .bind(live.energy_kwh)
        .bind(live.voltage)
        .bind(live.current)
        .bind(live.frequency)
        .bind(live.power_factor)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_device_offline(&self, device_id: &str, last_seen: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE devices
             SET is_online = FALSE, last_seen = $2, updated_at = $2
             WHERE device_id = $1",
        )
        .bind(device_id)
        .bind(last_seen)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_raw_reading(&self, reading: &RawReading) -> Result<()> {
        sqlx::query(
            "INSERT INTO raw_readings (device_id, ts, power_w, energy_kwh, voltage, current)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (device_id, ts) DO NOTHING",
        )
        .bind(&reading.device_id)
        .bind(reading.ts)
        .bind(reading.power_w)
        .bind(reading.energy_kwh)
        .bind(reading.voltage)
        .bind(reading.current)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn raw_readings_in(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawReading>> {
        let readings = sqlx::query_as::<_, RawReading>(
            "SELECT device_id, ts, power_w, energy_kwh, voltage, current
             FROM raw_readings
             WHERE device_id = $1 AND ts >= $2 AND ts < $3
             ORDER BY ts",
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(readings)
    }

    async fn oldest_raw_reading_at(&self) -> Result<Option<DateTime<Utc>>> {
        let oldest =
            sqlx::query_scalar::<_, Option<DateTime<Utc>>>("SELECT min(ts) FROM raw_readings")
                .fetch_one(&self.pool)
                .await?;

        Ok(oldest)
    }

    async fn replace_period_summary(&self, summary: &PeriodSummary) -> Result<()> {
        sqlx::query(
            "INSERT INTO period_summaries
                 (device_id, period_kind, period_start, period_end, energy_kwh,
                  peak_power_w, avg_power_w, active_hours, est_cost, efficiency,
                  reading_count, has_data)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (device_id, period_kind, period_start) DO UPDATE SET
                 period_end = EXCLUDED.period_end,
                 energy_kwh = EXCLUDED.energy_kwh,
                 peak_power_w = EXCLUDED.peak_power_w,
                 avg_power_w = EXCLUDED.avg_power_w,
                 active_hours = EXCLUDED.active_hours,
                 est_cost = EXCLUDED.est_cost,
                 efficiency = EXCLUDED.efficiency,
                 reading_count = EXCLUDED.reading_count,
                 has_data = EXCLUDED.has_data",
        )
        .bind(&summary.device_id)
        .bind(summary.kind.as_str())
        .bind(summary.period_start)
        .bind(summary.period_end)
        .bind(summary.energy_kwh)
        .bind(summary.peak_power_w)
        .bind(summary.avg_power_w)
        .bind(summary.active_hours)
        .bind(summary.est_cost)
        .bind(summary.efficiency.as_str())
        .bind(summary.reading_count)
        .bind(summary.has_data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn period_summaries_in(
        &self,
        device_id: &str,
        kind: PeriodKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PeriodSummary>> {
        let summaries = sqlx::query_as::<_, PeriodSummary>(
            "SELECT device_id, period_kind, period_start, period_end, energy_kwh,
                    peak_power_w, avg_power_w, active_hours, est_cost, efficiency,
                    reading_count, has_data
             FROM period_summaries
             WHERE device_id = $1 AND period_kind = $2
               AND period_start >= $3 AND period_start < $4
             ORDER BY period_start",
        )
        .bind(device_id)
        .bind(kind.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(summaries)
    }

    async fn delete_raw_readings_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM raw_readings WHERE ts < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
