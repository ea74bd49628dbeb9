//! Upsert coordinator: owns the user's single live location record and
//! decides how each accepted sample reaches the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::error::{SyncError, SyncResult};
use crate::geo::PositionSample;
use crate::models::LiveLocationRecord;
use crate::store::RecordStore;

/// Result of one write tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Written {
        record_id: String,
    },
    /// Write failed; the next tick retries implicitly.
    Retrying {
        consecutive_failures: u32,
    },
    /// The failure threshold was just crossed. Emitted once; the degraded
    /// flag stays set until a write succeeds.
    Degraded {
        consecutive_failures: u32,
    },
}

pub struct UpsertCoordinator {
    store: Arc<dyn RecordStore>,
    collection: String,
    user_id: String,
    record_id: Option<String>,
    consecutive_failures: u32,
    failure_threshold: u32,
    degraded: bool,
    last_written_at: Option<DateTime<Utc>>,
}

impl UpsertCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        collection: impl Into<String>,
        user_id: impl Into<String>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            user_id: user_id.into(),
            record_id: None,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            degraded: false,
            last_written_at: None,
        }
    }

    pub fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }

    /// Adopt the id from a self-owned realtime event.
    pub fn adopt_record_id(&mut self, id: impl Into<String>) {
        self.record_id = Some(id.into());
    }

    /// Forget the held id, e.g. after a delete event for the own record.
    pub fn clear_record_id(&mut self) {
        self.record_id = None;
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn last_written_at(&self) -> Option<DateTime<Utc>> {
        self.last_written_at
    }

    /// Persist the most recent sample.
    ///
    /// Auth errors and cancellations propagate; everything else is absorbed
    /// into the failure counter so the next tick can retry.
    pub async fn flush(&mut self, sample: &PositionSample) -> SyncResult<FlushOutcome> {
        match self.write(sample).await {
            Ok(record_id) => {
                self.consecutive_failures = 0;
                if self.degraded {
                    tracing::info!("Location writes recovered for user {}", self.user_id);
                    self.degraded = false;
                }
                self.last_written_at = Some(Utc::now());
                Ok(FlushOutcome::Written { record_id })
            }
            Err(e) if e.is_auth() || e.is_cancelled() => Err(e),
            Err(e) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    "Location write failed for user {} ({} consecutive): {}",
                    self.user_id,
                    self.consecutive_failures,
                    e
                );
                if self.consecutive_failures >= self.failure_threshold && !self.degraded {
                    self.degraded = true;
                    Ok(FlushOutcome::Degraded {
                        consecutive_failures: self.consecutive_failures,
                    })
                } else {
                    Ok(FlushOutcome::Retrying {
                        consecutive_failures: self.consecutive_failures,
                    })
                }
            }
        }
    }

    async fn write(&mut self, sample: &PositionSample) -> SyncResult<String> {
        if self.record_id.is_none() {
            // Look up any record owned by this user before creating one;
            // reusing it is what keeps the one-record-per-owner invariant.
            match self
                .store
                .get_first_list_item(&self.collection, &self.owner_filter())
                .await
            {
                Ok(existing) => {
                    let record = LiveLocationRecord::from_value(&existing)?;
                    self.record_id = Some(record.id);
                }
                Err(e) if e.is_not_found() => return self.create_record(sample).await,
                Err(e) => return Err(e),
            }
        }

        let id = match self.record_id.clone() {
            Some(id) => id,
            None => return self.create_record(sample).await,
        };
        match self
            .store
            .update(&self.collection, &id, self.write_payload(sample))
            .await
        {
            Ok(_) => Ok(id),
            Err(e) if e.is_not_found() => {
                tracing::warn!("Live location record {} vanished, recreating", id);
                self.record_id = None;
                self.create_record(sample).await
            }
            Err(e) => Err(e),
        }
    }

    async fn create_record(&mut self, sample: &PositionSample) -> SyncResult<String> {
        let created = self
            .store
            .create(&self.collection, self.write_payload(sample))
            .await?;
        let record = LiveLocationRecord::from_value(&created)?;
        self.record_id = Some(record.id.clone());
        Ok(record.id)
    }

    /// Soft-delete the held record. The record itself is never hard-deleted
    /// on this path; the id stays adopted so a restart reuses it.
    pub async fn deactivate(&mut self) -> SyncResult<Option<String>> {
        let id = match &self.record_id {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        match self
            .store
            .update(&self.collection, &id, json!({ "isactive": false }))
            .await
        {
            Ok(_) => {
                self.last_written_at = None;
                Ok(Some(id))
            }
            Err(e) if e.is_not_found() => {
                self.record_id = None;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Adopt the user's active record after a reload, if one exists. Used to
    /// resume display only; sharing never restarts automatically.
    pub async fn resume_existing(&mut self) -> SyncResult<Option<LiveLocationRecord>> {
        let filter = format!("danuser = \"{}\" && isactive = true", self.user_id);
        match self
            .store
            .get_first_list_item(&self.collection, &filter)
            .await
        {
            Ok(value) => {
                let record = LiveLocationRecord::from_value(&value)?;
                self.record_id = Some(record.id.clone());
                Ok(Some(record))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn owner_filter(&self) -> String {
        format!("danuser = \"{}\"", self.user_id)
    }

    fn write_payload(&self, sample: &PositionSample) -> serde_json::Value {
        json!({
            "danuser": self.user_id,
            "location": { "lon": sample.coords.lon, "lat": sample.coords.lat },
            "isactive": true,
        })
    }
}
