use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use danusin_livesync::config::Config;
use danusin_livesync::geo::{ManualPermissionGate, PermissionState, SimulatedGps};
use danusin_livesync::models::{Coordinates, UserIdentity};
use danusin_livesync::store::{MemoryStore, PocketBaseStore, RecordStore};
use danusin_livesync::sync::{LiveSession, PresenceRegistry, SessionEvent, SharingState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "danusin_livesync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Danusin live sync agent");

    let store: Arc<dyn RecordStore> = if config.agent.offline {
        tracing::info!("Running against the in-memory store (offline demo)");
        Arc::new(MemoryStore::new())
    } else {
        tracing::info!("Connecting to backend at {}", config.backend.base_url);
        Arc::new(PocketBaseStore::new(&config.backend)?)
    };

    let display_name = match store
        .get_one(&config.backend.users_collection, &config.agent.user_id)
        .await
        .ok()
        .and_then(|value| serde_json::from_value::<UserIdentity>(value).ok())
    {
        Some(user) if !user.name.is_empty() => user.name,
        _ => config
            .agent
            .user_name
            .clone()
            .unwrap_or_else(|| config.agent.user_id.clone()),
    };
    tracing::info!("Acting as {} ({})", display_name, config.agent.user_id);

    // Presence first: the session routes its own record events through it.
    let (presence, self_events) = PresenceRegistry::spawn(
        store.clone(),
        &config.backend.locations_collection,
        &config.agent.user_id,
        config.sync.freshness_window(),
    )
    .await?;

    let mut snapshot_rx = presence.watch_snapshot();
    let presence_logger = tokio::spawn(async move {
        while snapshot_rx.changed().await.is_ok() {
            let names: Vec<String> = {
                let snapshot = snapshot_rx.borrow_and_update();
                snapshot
                    .values()
                    .map(|entry| {
                        entry
                            .name
                            .clone()
                            .unwrap_or_else(|| entry.record.danuser_id.clone())
                    })
                    .collect()
            };
            tracing::info!("{} user(s) sharing live: [{}]", names.len(), names.join(", "));
        }
    });

    // The agent is headless, so the platform location stack is simulated.
    let gate = Arc::new(ManualPermissionGate::new(PermissionState::Granted));
    let gps = SimulatedGps::new();
    let session = LiveSession::spawn(
        store.clone(),
        gate,
        Arc::new(gps.clone()),
        self_events,
        &config,
    );

    let mut events = session.subscribe_events();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Started { resumed_record }) => match resumed_record {
                    Some(record) => {
                        tracing::info!("Sharing started, resumed record {}", record.id)
                    }
                    None => tracing::info!("Sharing started"),
                },
                Ok(SessionEvent::PositionStored { record_id, at }) => {
                    tracing::info!("Position stored to {} at {}", record_id, at);
                }
                Ok(SessionEvent::Degraded {
                    consecutive_failures,
                }) => {
                    tracing::warn!(
                        "Location sync degraded after {} consecutive failures",
                        consecutive_failures
                    );
                }
                Ok(SessionEvent::Warning(message)) => tracing::warn!("{}", message),
                Ok(SessionEvent::Stopped { reason }) => {
                    tracing::info!("Sharing stopped: {:?}", reason);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event feed lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut walk = None;
    if config.agent.demo_share {
        tracing::info!("Demo share enabled, walking around Jakarta");
        session.start().await?;
        walk = Some(gps.spawn_random_walk(
            Coordinates::new(106.8456, -6.2088),
            Duration::from_secs(5),
        ));
    }

    // Wait for a shutdown signal.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    tracing::info!("Shutdown signal received, stopping session");
    session.shutdown();

    // Give the session time to deactivate its record before exiting.
    let mut state = session.watch_state();
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while *state.borrow() != SharingState::Idle {
            if state.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Timed out waiting for the session to stop");
    }

    if let Some(walk) = walk {
        walk.abort();
    }
    presence_logger.abort();
    event_logger.abort();
    drop(presence);

    tracing::info!("Shutdown complete");
    Ok(())
}
