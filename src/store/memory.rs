use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{DeviceLiveUpdate, DeviceRecord, PeriodKind, PeriodSummary, RawReading};
use crate::store::TelemetryStore;

/// In-memory [`TelemetryStore`] backing the test suite and ad-hoc local runs.
/// Individual devices can be flipped into error mode to exercise the
/// best-effort paths.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    devices: BTreeMap<String, DeviceRecord>,
    last_live: HashMap<String, DeviceLiveUpdate>,
    live_writes: HashMap<String, u64>,
    raw: Vec<RawReading>,
    summaries: HashMap<(String, PeriodKind, DateTime<Utc>), PeriodSummary>,
    fail_reads: HashSet<String>,
    fail_writes: HashSet<String>,
}

impl Inner {
    fn check_read(&self, device_id: &str) -> Result<()> {
        if self.fail_reads.contains(device_id) {
            return Err(anyhow!("injected read failure for {device_id}").into());
        }
        Ok(())
    }

    fn check_write(&self, device_id: &str) -> Result<()> {
        if self.fail_writes.contains(device_id) {
            return Err(anyhow!("injected write failure for {device_id}").into());
        }
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a registration row the way provisioning would.
    pub fn register_device(&self, device_id: &str, baseline_kwh: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.devices.insert(
            device_id.to_string(),
            DeviceRecord {
                device_id: device_id.to_string(),
                name: None,
                energy_kwh: baseline_kwh,
                is_online: false,
                last_seen: None,
            },
        );
    }

    pub fn fail_reads_for(&self, device_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_reads
            .insert(device_id.to_string());
    }

    pub fn fail_writes_for(&self, device_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_writes
            .insert(device_id.to_string());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_reads.clear();
        inner.fail_writes.clear();
    }

    /// Seed a raw reading directly, bypassing failure injection.
    pub fn push_raw(&self, reading: RawReading) {
        self.inner.lock().unwrap().raw.push(reading);
    }

    /// Seed a summary row directly, bypassing failure injection.
    pub fn push_summary(&self, summary: PeriodSummary) {
        let mut inner = self.inner.lock().unwrap();
        let key = (
            summary.device_id.clone(),
            summary.kind,
            summary.period_start,
        );
        inner.summaries.insert(key, summary);
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.inner.lock().unwrap().devices.get(device_id).cloned()
    }

    pub fn last_live(&self, device_id: &str) -> Option<DeviceLiveUpdate> {
        self.inner.lock().unwrap().last_live.get(device_id).cloned()
    }

    pub fn live_write_count(&self, device_id: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .live_writes
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn raw_readings(&self, device_id: &str) -> Vec<RawReading> {
        let inner = self.inner.lock().unwrap();
        let mut readings: Vec<RawReading> = inner
            .raw
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        readings.sort_by_key(|r| r.ts);
        readings
    }

    pub fn raw_len(&self) -> usize {
        self.inner.lock().unwrap().raw.len()
    }

    pub fn summary(
        &self,
        device_id: &str,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
    ) -> Option<PeriodSummary> {
        self.inner
            .lock()
            .unwrap()
            .summaries
            .get(&(device_id.to_string(), kind, period_start))
            .cloned()
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn device_by_id(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let inner = self.inner.lock().unwrap();
        inner.check_read(device_id)?;
        Ok(inner.devices.get(device_id).cloned())
    }

    async fn list_device_ids(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().devices.keys().cloned().collect())
    }

    async fn upsert_device_live(&self, live: &DeviceLiveUpdate) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_write(&live.device_id)?;

        let record = inner
            .devices
            .entry(live.device_id.clone())
            .or_insert_with(|| DeviceRecord {
                device_id: live.device_id.clone(),
                name: None,
                energy_kwh: 0.0,
                is_online: false,
                last_seen: None,
            });
        record.energy_kwh = live.energy_kwh;
        record.is_online = true;
        record.last_seen = Some(live.ts);

        inner.last_live.insert(live.device_id.clone(), live.clone());
        *inner.live_writes.entry(live.device_id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn mark_device_offline(&self, device_id: &str, last_seen: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_write(device_id)?;
        if let Some(record) = inner.devices.get_mut(device_id) {
            record.is_online = false;
            record.last_seen = Some(last_seen);
        }
        Ok(())
    }

    async fn append_raw_reading(&self, reading: &RawReading) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_write(&reading.device_id)?;
        let duplicate = inner
            .raw
            .iter()
            .any(|r| r.device_id == reading.device_id && r.ts == reading.ts);
        if !duplicate {
            inner.raw.push(reading.clone());
        }
        Ok(())
    }

    async fn raw_readings_in(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawReading>> {
        let inner = self.inner.lock().unwrap();
        inner.check_read(device_id)?;
        let mut readings: Vec<RawReading> = inner
            .raw
            .iter()
            .filter(|r| r.device_id == device_id && r.ts >= start && r.ts < end)
            .cloned()
            .collect();
        readings.sort_by_key(|r| r.ts);
        Ok(readings)
    }

    async fn oldest_raw_reading_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.lock().unwrap().raw.iter().map(|r| r.ts).min())
    }

    async fn replace_period_summary(&self, summary: &PeriodSummary) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_write(&summary.device_id)?;
        let key = (
            summary.device_id.clone(),
            summary.kind,
            summary.period_start,
        );
        inner.summaries.insert(key, summary.clone());
        Ok(())
    }

    async fn period_summaries_in(
        &self,
        device_id: &str,
        kind: PeriodKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PeriodSummary>> {
        let inner = self.inner.lock().unwrap();
        inner.check_read(device_id)?;
        let mut summaries: Vec<PeriodSummary> = inner
            .summaries
            .values()
            .filter(|s| {
                s.device_id == device_id
                    && s.kind == kind
                    && s.period_start >= start
                    && s.period_start < end
            })
            .cloned()
            .collect();
        summaries.sort_by_key(|s| s.period_start);
        Ok(summaries)
    }

    async fn delete_raw_readings_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.raw.len();
        inner.raw.retain(|r| r.ts >= cutoff);
        Ok((before - inner.raw.len()) as u64)
    }
}
