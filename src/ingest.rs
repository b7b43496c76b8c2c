//! The ingestion pipeline: one entry point per telemetry push.
//!
//! The critical section of each sample is the integration step inside
//! [`PresenceTracker::apply`]; everything touching the store happens outside
//! the lock and is best-effort. A device always gets an acknowledgement with
//! the locally integrated counter, even with the store down.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, warn};

use crate::downsample::Downsampler;
use crate::energy;
use crate::error::{AppError, Result};
use crate::models::{
    day_start, DeviceLiveUpdate, ElectricalSnapshot, IngestOutcome, PeriodKind, RawReading,
    TelemetrySample,
};
use crate::presence::{DeviceLiveState, PresenceTracker};
use crate::rollup::RollupEngine;
use crate::store::TelemetryStore;

pub struct Ingestor {
    store: Arc<dyn TelemetryStore>,
    presence: Arc<PresenceTracker>,
    downsampler: Arc<Downsampler>,
    rollup: Arc<RollupEngine>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        presence: Arc<PresenceTracker>,
        downsampler: Arc<Downsampler>,
        rollup: Arc<RollupEngine>,
    ) -> Self {
        Self {
            store,
            presence,
            downsampler,
            rollup,
        }
    }

    /// Ingest one sample, stamped with the arrival clock.
    pub async fn ingest(&self, device_id: &str, sample: TelemetrySample) -> Result<IngestOutcome> {
        self.ingest_at(device_id, sample, Utc::now()).await
    }

    pub async fn ingest_at(
        &self,
        device_id: &str,
        sample: TelemetrySample,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        if device_id.is_empty() {
            return Err(AppError::Validation("device id must not be empty".into()));
        }
        let sample = sample.sanitized();

        // A failed lookup downgrades the device to unregistered for this
        // sample; local tracking continues either way.
        let device = match self.store.device_by_id(device_id).await {
            Ok(device) => device,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "device lookup failed, treating as unregistered");
                None
            }
        };
        let registered = device.is_some();

        // Baseline for a device we are not yet tracking: the stored counter
        // when registered, otherwise whatever the device itself reports.
        let baseline_kwh = device
            .as_ref()
            .map(|d| d.energy_kwh)
            .unwrap_or(sample.energy);
        let snapshot = ElectricalSnapshot::from(&sample);

        let (state, completed_day) = self.presence.apply(device_id, |slot| match slot {
            None => {
                let state =
                    DeviceLiveState::first_contact(now, sample.power, baseline_kwh, snapshot);
                let copy = state.clone();
                *slot = Some(state);
                (copy, None)
            }
            Some(state) => {
                let previous_day = state.last_sample_at.date_naive();
                let energy_kwh = energy::integrate(Some(&state.anchor()), sample.power, now);
                state.record_sample(now, sample.power, energy_kwh, snapshot);
                let completed = now.date_naive() > previous_day;
                (state.clone(), completed.then_some(previous_day))
            }
        });

        // Close out the finished day before this sample's own writes so the
        // summary is in place before anything newer lands.
        if let Some(day) = completed_day {
            self.rollup_completed_day(device_id, day).await;
        }

        let persisted = self.downsampler.should_persist(device_id);
        if persisted {
            let reading = RawReading {
                device_id: device_id.to_string(),
                ts: now,
                power_w: sample.power,
                energy_kwh: state.energy_kwh,
                voltage: sample.voltage,
                current: sample.current,
            };
            if let Err(e) = self.store.append_raw_reading(&reading).await {
                warn!(device_id = %device_id, error = %e, "raw reading append failed");
            }
        }

        if registered {
            let live = DeviceLiveUpdate {
                device_id: device_id.to_string(),
                ts: now,
                power_w: sample.power,
                energy_kwh: state.energy_kwh,
                voltage: sample.voltage,
                current: sample.current,
                frequency: sample.frequency,
                power_factor: sample.power_factor,
            };
            if let Err(e) = self.store.upsert_device_live(&live).await {
                warn!(device_id = %device_id, error = %e, "live snapshot upsert failed");
            }
        }

        debug!(
            device_id = %device_id,
            power_w = sample.power,
            energy_kwh = state.energy_kwh,
            persisted,
            registered,
            "sample ingested"
        );

        Ok(IngestOutcome {
            energy_kwh: state.energy_kwh,
            online: true,
            registered,
            ts: now,
        })
    }

    async fn rollup_completed_day(&self, device_id: &str, day: NaiveDate) {
        let start = day_start(day);
        let end = PeriodKind::Day.end_of(start);
        let ids = [device_id.to_string()];
        let outcome = self.rollup.run(PeriodKind::Day, start, end, &ids).await;
        if outcome.errors > 0 {
            warn!(device_id = %device_id, day = %day, "day-boundary rollup failed");
        } else {
            debug!(device_id = %device_id, day = %day, "day-boundary rollup done");
        }
    }
}
