//! Position acquisition and the permission gate.
//!
//! The browser's callback-style geolocation surface is re-expressed here as
//! explicit async streams: a watch is a stream of samples whose handle
//! cancels the watch on drop, and permission changes arrive over a `watch`
//! channel instead of an event listener.

pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::GeoConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::Coordinates;

pub use simulated::{ManualPermissionGate, SimulatedGps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
}

/// Gate over the platform's location permission.
///
/// Re-checking is a user-triggered action (`request`); the only automatic
/// path is the change feed, which the session uses to tear down sharing
/// when permission is revoked mid-session.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn query(&self) -> PermissionState;

    /// Prompt the user. Resolves to the resulting state.
    async fn request(&self) -> PermissionState;

    fn changes(&self) -> watch::Receiver<PermissionState>;
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Time allowed for each fix. Cached fixes are never accepted
    /// (maximum age is always zero).
    pub acquire_timeout: std::time::Duration,
}

impl From<&GeoConfig> for WatchOptions {
    fn from(config: &GeoConfig) -> Self {
        Self {
            high_accuracy: config.high_accuracy,
            acquire_timeout: config.acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub coords: Coordinates,
    /// Reported accuracy radius in meters, when the platform provides one.
    pub accuracy: Option<f64>,
    pub taken_at: DateTime<Utc>,
}

impl PositionSample {
    pub fn new(coords: Coordinates) -> Self {
        Self {
            coords,
            accuracy: None,
            taken_at: Utc::now(),
        }
    }
}

/// Continuous source of raw position samples.
///
/// At most one watch is open per source: opening a new one cancels the
/// previous watch first, and dropping the returned handle cancels
/// unconditionally.
pub trait PositionSource: Send + Sync {
    fn watch(&self, options: WatchOptions) -> SyncResult<PositionWatch>;
}

/// Handle to an open position watch. Errors are delivered in-stream; the
/// stream ends when the watch is cancelled or superseded.
pub struct PositionWatch {
    samples: mpsc::UnboundedReceiver<Result<PositionSample, SyncError>>,
    task: Option<JoinHandle<()>>,
}

impl PositionWatch {
    pub(crate) fn new(
        samples: mpsc::UnboundedReceiver<Result<PositionSample, SyncError>>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { samples, task }
    }

    /// Next raw sample or watch error; `None` once the watch is closed.
    pub async fn next_sample(&mut self) -> Option<Result<PositionSample, SyncError>> {
        self.samples.recv().await
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
