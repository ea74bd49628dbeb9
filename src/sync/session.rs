//! The sharing session state machine.
//!
//! A session is a background task driven entirely by channels: commands from
//! the owning handle, raw samples from the position watch, self-owned record
//! events from the presence feed, permission changes, the write tick and the
//! inactivity deadline. It is either `Idle` or `Sharing`; every path out of
//! `Sharing` funnels through the same teardown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::geo::{
    PermissionGate, PermissionState, PositionSample, PositionSource, PositionWatch, WatchOptions,
};
use crate::models::LiveLocationRecord;
use crate::store::RecordStore;
use crate::sync::coordinator::{FlushOutcome, UpsertCoordinator};
use crate::sync::presence::SelfRecordEvent;
use crate::sync::watchdog::InactivityWatchdog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingState {
    Idle,
    Sharing,
}

/// Why a sharing session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    UserRequest,
    Inactivity,
    PermissionRevoked,
    /// The write failure threshold was crossed.
    PersistentFailure,
    Unauthorized,
    Shutdown,
}

/// Notifications for observers (UI surfaces, the agent's log task).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started {
        /// The still-active record adopted from a previous run, if any.
        resumed_record: Option<LiveLocationRecord>,
    },
    PositionStored {
        record_id: String,
        at: DateTime<Utc>,
    },
    Degraded {
        consecutive_failures: u32,
    },
    Warning(String),
    Stopped {
        reason: StopReason,
    },
}

enum Command {
    Start(oneshot::Sender<SyncResult<()>>),
    Stop,
    Activity,
    Shutdown,
}

/// Owning handle to a spawned session. Dropping it aborts the task.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SharingState>,
    events: broadcast::Sender<SessionEvent>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Begin sharing. Resolves once the session is live (or refuses to be,
    /// e.g. permission denied). Starting an already-sharing session is ok.
    pub async fn start(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Start(tx))
            .map_err(|_| SyncError::Cancelled)?;
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    /// Stop sharing. Idempotent; a no-op when idle.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Report user interaction, resetting the inactivity deadline.
    pub fn activity(&self) {
        let _ = self.commands.send(Command::Activity);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn state(&self) -> SharingState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SharingState> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct SessionParams {
    users_collection: String,
    user_id: String,
    update_interval: Duration,
    inactivity_timeout: Duration,
    watch_options: WatchOptions,
}

pub struct LiveSession {
    store: Arc<dyn RecordStore>,
    gate: Arc<dyn PermissionGate>,
    source: Arc<dyn PositionSource>,
    params: SessionParams,
    coordinator: UpsertCoordinator,
    commands: mpsc::UnboundedReceiver<Command>,
    self_events: mpsc::UnboundedReceiver<SelfRecordEvent>,
    self_events_open: bool,
    state: watch::Sender<SharingState>,
    events: broadcast::Sender<SessionEvent>,
}

/// One resolved select arm of the sharing loop. Splitting selection from
/// handling keeps `&mut self` out of the select arms.
enum Step {
    Command(Option<Command>),
    Sample(Option<Result<PositionSample, SyncError>>),
    Tick,
    PermissionChanged(bool),
    SelfEvent(Option<SelfRecordEvent>),
    InactivityExpired,
}

impl LiveSession {
    /// Spawn the session task. `self_events` is the viewer's own record feed
    /// from the presence registry.
    pub fn spawn(
        store: Arc<dyn RecordStore>,
        gate: Arc<dyn PermissionGate>,
        source: Arc<dyn PositionSource>,
        self_events: mpsc::UnboundedReceiver<SelfRecordEvent>,
        config: &Config,
    ) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SharingState::Idle);
        let (events_tx, _) = broadcast::channel(32);

        let coordinator = UpsertCoordinator::new(
            store.clone(),
            config.backend.locations_collection.clone(),
            config.agent.user_id.clone(),
            config.sync.failure_threshold,
        );
        let session = LiveSession {
            store,
            gate,
            source,
            params: SessionParams {
                users_collection: config.backend.users_collection.clone(),
                user_id: config.agent.user_id.clone(),
                update_interval: config.sync.update_interval(),
                inactivity_timeout: config.sync.inactivity_timeout(),
                watch_options: WatchOptions::from(&config.geo),
            },
            coordinator,
            commands: commands_rx,
            self_events,
            self_events_open: true,
            state: state_tx,
            events: events_tx.clone(),
        };

        let task = tokio::spawn(session.run());
        SessionHandle {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
            task: Some(task),
        }
    }

    async fn run(mut self) {
        loop {
            let reply = match self.idle().await {
                Some(reply) => reply,
                None => break,
            };
            match self.begin_sharing().await {
                Ok((position_watch, resumed)) => {
                    self.state.send_replace(SharingState::Sharing);
                    self.emit(SessionEvent::Started {
                        resumed_record: resumed,
                    });
                    let _ = reply.send(Ok(()));

                    let reason = self.sharing_loop(position_watch).await;
                    self.finish_sharing(reason).await;
                    if reason == StopReason::Shutdown {
                        break;
                    }
                }
                Err(e) => {
                    tracing::info!("Sharing not started: {}", e);
                    let _ = reply.send(Err(e));
                }
            }
        }
        tracing::debug!("Live session task exited");
    }

    /// Wait for a start command, keeping the coordinator's record id in step
    /// with self-owned events meanwhile. `None` means shut down.
    async fn idle(&mut self) -> Option<oneshot::Sender<SyncResult<()>>> {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start(reply)) => return Some(reply),
                    Some(Command::Stop) | Some(Command::Activity) => {}
                    Some(Command::Shutdown) | None => return None,
                },
                event = self.self_events.recv(), if self.self_events_open => {
                    self.apply_self_event(event);
                }
            }
        }
    }

    /// Check permission, adopt any still-active record and open the position
    /// watch. Fails without side effects on the sharing state.
    async fn begin_sharing(
        &mut self,
    ) -> SyncResult<(PositionWatch, Option<LiveLocationRecord>)> {
        let mut permission = self.gate.query().await;
        if permission == PermissionState::Prompt {
            permission = self.gate.request().await;
        }
        if permission != PermissionState::Granted {
            return Err(SyncError::PermissionDenied);
        }

        let resumed = match self.coordinator.resume_existing().await {
            Ok(resumed) => resumed,
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                tracing::warn!("Could not look up existing live record: {}", e);
                self.emit(SessionEvent::Warning(format!(
                    "could not look up existing record: {e}"
                )));
                None
            }
        };

        let position_watch = self.source.watch(self.params.watch_options)?;
        self.set_live_flag(true).await;
        tracing::info!("Live sharing started for user {}", self.params.user_id);
        Ok((position_watch, resumed))
    }

    async fn sharing_loop(&mut self, mut position_watch: PositionWatch) -> StopReason {
        let mut latest: Option<PositionSample> = None;
        let mut watchdog = InactivityWatchdog::new(self.params.inactivity_timeout);
        // The first write waits a full interval; starting is not a fix.
        let mut ticks = time::interval_at(
            Instant::now() + self.params.update_interval,
            self.params.update_interval,
        );
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut permission = self.gate.changes();
        let mut permission_open = true;
        let mut watch_open = true;

        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                sample = position_watch.next_sample(), if watch_open => Step::Sample(sample),
                _ = ticks.tick() => Step::Tick,
                changed = permission.changed(), if permission_open => {
                    Step::PermissionChanged(changed.is_ok())
                }
                event = self.self_events.recv(), if self.self_events_open => {
                    Step::SelfEvent(event)
                }
                _ = watchdog.expired() => Step::InactivityExpired,
            };

            match step {
                Step::Command(Some(Command::Start(reply))) => {
                    // Already sharing.
                    let _ = reply.send(Ok(()));
                }
                Step::Command(Some(Command::Stop)) => return StopReason::UserRequest,
                Step::Command(Some(Command::Activity)) => watchdog.touch(),
                Step::Command(Some(Command::Shutdown)) | Step::Command(None) => {
                    return StopReason::Shutdown
                }

                Step::Sample(Some(Ok(sample))) => latest = Some(sample),
                Step::Sample(Some(Err(SyncError::PermissionDenied))) => {
                    return StopReason::PermissionRevoked
                }
                Step::Sample(Some(Err(e))) => {
                    // Transient fix errors; the watch keeps reporting.
                    tracing::warn!("Position watch error: {}", e);
                    self.emit(SessionEvent::Warning(e.to_string()));
                }
                Step::Sample(None) => {
                    tracing::warn!("Position stream ended");
                    watch_open = false;
                }

                Step::Tick => {
                    let sample = match &latest {
                        Some(sample) => *sample,
                        None => continue,
                    };
                    match self.coordinator.flush(&sample).await {
                        Ok(FlushOutcome::Written { record_id }) => {
                            self.emit(SessionEvent::PositionStored {
                                record_id,
                                at: Utc::now(),
                            });
                        }
                        Ok(FlushOutcome::Retrying { .. }) => {}
                        Ok(FlushOutcome::Degraded {
                            consecutive_failures,
                        }) => {
                            self.emit(SessionEvent::Degraded {
                                consecutive_failures,
                            });
                            return StopReason::PersistentFailure;
                        }
                        Err(e) if e.is_auth() => {
                            self.emit(SessionEvent::Warning(e.to_string()));
                            return StopReason::Unauthorized;
                        }
                        Err(_) => return StopReason::Shutdown,
                    }
                }

                Step::PermissionChanged(true) => {
                    let state = *permission.borrow_and_update();
                    if state != PermissionState::Granted {
                        return StopReason::PermissionRevoked;
                    }
                }
                Step::PermissionChanged(false) => permission_open = false,

                Step::SelfEvent(event) => self.apply_self_event(event),

                Step::InactivityExpired => return StopReason::Inactivity,
            }
        }
    }

    /// Common teardown for every exit from `Sharing`. The position watch is
    /// already dropped (cancelled) by the time this runs.
    async fn finish_sharing(&mut self, reason: StopReason) {
        match self.coordinator.deactivate().await {
            Ok(Some(id)) => tracing::info!("Deactivated live location record {}", id),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Could not deactivate live location record: {}", e);
                self.emit(SessionEvent::Warning(format!(
                    "could not deactivate record: {e}"
                )));
            }
        }
        self.set_live_flag(false).await;
        self.state.send_replace(SharingState::Idle);
        tracing::info!(
            "Live sharing stopped for user {} ({:?})",
            self.params.user_id,
            reason
        );
        self.emit(SessionEvent::Stopped { reason });
    }

    fn apply_self_event(&mut self, event: Option<SelfRecordEvent>) {
        match event {
            Some(SelfRecordEvent::Updated(id)) => self.coordinator.adopt_record_id(id),
            Some(SelfRecordEvent::Deleted) => self.coordinator.clear_record_id(),
            None => self.self_events_open = false,
        }
    }

    /// Mirror the sharing state onto the user record. Display-only and
    /// best-effort: a failure here never affects the session.
    async fn set_live_flag(&self, live: bool) {
        let result = self
            .store
            .update(
                &self.params.users_collection,
                &self.params.user_id,
                json!({ "islivesharing": live }),
            )
            .await;
        if let Err(e) = result {
            tracing::debug!("Could not update islivesharing flag: {}", e);
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
