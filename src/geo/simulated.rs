//! Deterministic stand-ins for the platform location stack: a channel-fed
//! GPS and a manually switched permission gate. Used by the engine tests
//! and by the agent's demo mode (there is no native geolocation source in a
//! headless process).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{SyncError, SyncResult};
use crate::geo::{
    PermissionGate, PermissionState, PositionSample, PositionSource, PositionWatch, WatchOptions,
};
use crate::models::Coordinates;

/// A GPS whose fixes are pushed by the caller.
#[derive(Clone, Default)]
pub struct SimulatedGps {
    inner: Arc<Mutex<GpsInner>>,
}

#[derive(Default)]
struct GpsInner {
    /// Sender for the single open watch, if any. Replaced wholesale when a
    /// new watch opens, which closes the previous stream.
    active: Option<mpsc::UnboundedSender<Result<PositionSample, SyncError>>>,
}

impl SimulatedGps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a fix to the open watch. Dropped silently when no watch is
    /// open, like a platform callback firing after `clearWatch`.
    pub fn push(&self, sample: PositionSample) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = &inner.active {
            if tx.send(Ok(sample)).is_err() {
                inner.active = None;
            }
        }
    }

    /// Deliver a watch error to the open watch.
    pub fn push_error(&self, error: SyncError) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = &inner.active {
            if tx.send(Err(error)).is_err() {
                inner.active = None;
            }
        }
    }

    pub fn has_active_watch(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .active
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Spawn a random walk around `origin`, pushing one fix per `period`.
    pub fn spawn_random_walk(&self, origin: Coordinates, period: Duration) -> JoinHandle<()> {
        let gps = self.clone();
        tokio::spawn(async move {
            let mut coords = origin;
            loop {
                tokio::time::sleep(period).await;
                let (dlon, dlat) = {
                    let mut rng = rand::thread_rng();
                    (
                        rng.gen_range(-1.0e-4..1.0e-4),
                        rng.gen_range(-1.0e-4..1.0e-4),
                    )
                };
                coords.lon += dlon;
                coords.lat += dlat;
                gps.push(PositionSample::new(coords));
            }
        })
    }
}

impl PositionSource for SimulatedGps {
    fn watch(&self, _options: WatchOptions) -> SyncResult<PositionWatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        // Replacing the sender closes any previous watch's stream.
        inner.active = Some(tx);
        Ok(PositionWatch::new(rx, None))
    }
}

/// Permission gate switched by the test/demo harness.
pub struct ManualPermissionGate {
    state: watch::Sender<PermissionState>,
    request_outcome: Mutex<PermissionState>,
}

impl ManualPermissionGate {
    pub fn new(initial: PermissionState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state,
            request_outcome: Mutex::new(PermissionState::Granted),
        }
    }

    /// Flip the permission, notifying change subscribers.
    pub fn set(&self, state: PermissionState) {
        self.state.send_replace(state);
    }

    /// Configure what the user answers when prompted.
    pub fn set_request_outcome(&self, outcome: PermissionState) {
        *self.request_outcome.lock().unwrap() = outcome;
    }
}

#[async_trait]
impl PermissionGate for ManualPermissionGate {
    async fn query(&self) -> PermissionState {
        *self.state.borrow()
    }

    async fn request(&self) -> PermissionState {
        let current = *self.state.borrow();
        if current != PermissionState::Prompt {
            // Already decided; prompting again changes nothing.
            return current;
        }
        let outcome = *self.request_outcome.lock().unwrap();
        self.state.send_replace(outcome);
        outcome
    }

    fn changes(&self) -> watch::Receiver<PermissionState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_watch_supersedes_previous() {
        let gps = SimulatedGps::new();
        let options = WatchOptions {
            high_accuracy: true,
            acquire_timeout: Duration::from_secs(15),
        };

        let mut first = gps.watch(options).unwrap();
        let mut second = gps.watch(options).unwrap();

        gps.push(PositionSample::new(Coordinates::new(1.0, 2.0)));
        assert!(
            first.next_sample().await.is_none(),
            "superseded watch stream must end"
        );
        let sample = second.next_sample().await.unwrap().unwrap();
        assert_eq!(sample.coords, Coordinates::new(1.0, 2.0));
    }

    #[tokio::test]
    async fn dropping_watch_cancels_it() {
        let gps = SimulatedGps::new();
        let options = WatchOptions {
            high_accuracy: true,
            acquire_timeout: Duration::from_secs(15),
        };

        let watch = gps.watch(options).unwrap();
        assert!(gps.has_active_watch());
        drop(watch);
        assert!(!gps.has_active_watch());

        // Late fix after teardown is dropped, not an error.
        gps.push(PositionSample::new(Coordinates::new(1.0, 2.0)));
    }

    #[tokio::test]
    async fn errors_are_delivered_in_stream() {
        let gps = SimulatedGps::new();
        let options = WatchOptions {
            high_accuracy: true,
            acquire_timeout: Duration::from_secs(15),
        };

        let mut watch = gps.watch(options).unwrap();
        gps.push_error(SyncError::PermissionDenied);
        assert!(matches!(
            watch.next_sample().await,
            Some(Err(SyncError::PermissionDenied))
        ));
    }

    #[tokio::test]
    async fn prompt_resolves_to_configured_outcome() {
        let gate = ManualPermissionGate::new(PermissionState::Prompt);
        assert_eq!(gate.query().await, PermissionState::Prompt);

        gate.set_request_outcome(PermissionState::Denied);
        assert_eq!(gate.request().await, PermissionState::Denied);
        assert_eq!(gate.query().await, PermissionState::Denied);

        // A denied permission stays denied on re-request.
        gate.set_request_outcome(PermissionState::Granted);
        assert_eq!(gate.request().await, PermissionState::Denied);
    }

    #[tokio::test]
    async fn change_feed_sees_revocation() {
        let gate = ManualPermissionGate::new(PermissionState::Granted);
        let mut changes = gate.changes();

        gate.set(PermissionState::Denied);
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow(), PermissionState::Denied);
    }
}
