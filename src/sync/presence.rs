//! Presence registry: the derived view of which *other* users currently
//! have a live location, built from one bulk fetch and patched by the
//! realtime change feed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::SyncResult;
use crate::models::{
    format_backend_timestamp, EventAction, LiveLocationRecord, PresenceEntry, RecordEvent,
};
use crate::store::{ListOptions, RecordStore};

/// Latest known entry per owner id. Never contains the viewer.
pub type PresenceSnapshot = HashMap<String, PresenceEntry>;

/// Events about the viewer's own record, routed to the session so the
/// coordinator can adopt or drop its record id. Self events never enter
/// the presence set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfRecordEvent {
    Updated(String),
    Deleted,
}

pub struct PresenceRegistry {
    snapshot_rx: watch::Receiver<PresenceSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl PresenceRegistry {
    /// Build the initial snapshot and start patching it from the realtime
    /// feed. The subscription is opened before the bulk fetch so changes
    /// landing during the fetch are not lost; per-owner last-write-wins
    /// makes the replay safe.
    pub async fn spawn(
        store: Arc<dyn RecordStore>,
        collection: &str,
        viewer_id: &str,
        freshness_window: Duration,
    ) -> SyncResult<(Self, mpsc::UnboundedReceiver<SelfRecordEvent>)> {
        let mut subscription = store.subscribe(collection).await?;

        let window = chrono::Duration::from_std(freshness_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let cutoff = format_backend_timestamp(Utc::now() - window);
        let filter = format!(
            "danuser != \"{viewer_id}\" && (isactive = true || updated >= \"{cutoff}\")"
        );
        let options = ListOptions::filtered(filter)
            .sorted_by("updated")
            .expanded("danuser");

        let items = store.get_full_list(collection, &options).await?;
        let mut snapshot = PresenceSnapshot::new();
        for item in &items {
            match PresenceEntry::from_value(item) {
                // Ascending `updated` sort: later items overwrite earlier
                // ones, so the newest record per owner wins.
                Ok(entry) => {
                    snapshot.insert(entry.record.danuser_id.clone(), entry);
                }
                Err(e) => {
                    tracing::warn!("Skipping malformed location record in bulk fetch: {}", e);
                }
            }
        }
        tracing::debug!(
            "Presence registry initialized with {} entr(ies)",
            snapshot.len()
        );

        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot);
        let (self_tx, self_rx) = mpsc::unbounded_channel();
        let viewer = viewer_id.to_string();

        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next_event().await {
                apply_event(&snapshot_tx, &self_tx, &viewer, event);
            }
            tracing::debug!("Presence feed closed");
        });

        Ok((
            Self {
                snapshot_rx,
                task: Some(task),
            },
            self_rx,
        ))
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<PresenceSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.snapshot_rx.borrow().clone()
    }
}

impl Drop for PresenceRegistry {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn apply_event(
    snapshot_tx: &watch::Sender<PresenceSnapshot>,
    self_tx: &mpsc::UnboundedSender<SelfRecordEvent>,
    viewer: &str,
    event: RecordEvent,
) {
    let record = match LiveLocationRecord::from_value(&event.record) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("Dropping malformed realtime record: {}", e);
            return;
        }
    };

    if record.danuser_id == viewer {
        let self_event = match event.action {
            EventAction::Delete => SelfRecordEvent::Deleted,
            EventAction::Create | EventAction::Update => SelfRecordEvent::Updated(record.id),
        };
        // Session gone is fine; presence keeps running for display.
        let _ = self_tx.send(self_event);
        return;
    }

    snapshot_tx.send_modify(|snapshot| match event.action {
        EventAction::Delete => {
            snapshot.remove(&record.danuser_id);
        }
        EventAction::Create | EventAction::Update => {
            if !record.is_active {
                snapshot.remove(&record.danuser_id);
                return;
            }
            let mut entry = PresenceEntry::from_value(&event.record).unwrap_or(PresenceEntry {
                record: record.clone(),
                name: None,
                avatar: None,
            });
            // Realtime events often arrive without the expand; keep the
            // display fields we already know for this owner.
            if let Some(previous) = snapshot.get(&record.danuser_id) {
                if entry.name.is_none() {
                    entry.name = previous.name.clone();
                }
                if entry.avatar.is_none() {
                    entry.avatar = previous.avatar.clone();
                }
            }
            snapshot.insert(record.danuser_id.clone(), entry);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};

    const COLLECTION: &str = "danusin_locations";
    const VIEWER: &str = "viewer";
    const WINDOW: Duration = Duration::from_secs(15 * 60);

    fn location(user: &str, lon: f64, active: bool) -> Value {
        json!({
            "danuser": user,
            "location": {"lon": lon, "lat": 0.0},
            "isactive": active,
        })
    }

    async fn spawn(
        store: &MemoryStore,
    ) -> (PresenceRegistry, mpsc::UnboundedReceiver<SelfRecordEvent>) {
        PresenceRegistry::spawn(Arc::new(store.clone()), COLLECTION, VIEWER, WINDOW)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn bulk_fetch_excludes_viewer_and_stale_records() {
        let store = MemoryStore::new();
        store.seed(COLLECTION, location(VIEWER, 1.0, true));
        store.seed(COLLECTION, location("u2", 2.0, true));
        let mut fresh_inactive = location("u3", 3.0, false);
        fresh_inactive["updated"] =
            json!(format_backend_timestamp(Utc::now() - chrono::Duration::minutes(5)));
        store.seed(COLLECTION, fresh_inactive);
        let mut stale_inactive = location("u4", 4.0, false);
        stale_inactive["updated"] =
            json!(format_backend_timestamp(Utc::now() - chrono::Duration::hours(2)));
        store.seed(COLLECTION, stale_inactive);

        let (registry, _self_events) = spawn(&store).await;
        let snapshot = registry.snapshot();
        assert!(!snapshot.contains_key(VIEWER), "viewer never enters presence");
        assert!(snapshot.contains_key("u2"));
        assert!(snapshot.contains_key("u3"), "fresh records count");
        assert!(!snapshot.contains_key("u4"), "stale inactive records do not");
    }

    #[tokio::test]
    async fn create_and_deactivate_events_patch_the_set() {
        let store = MemoryStore::new();
        let (registry, _self_events) = spawn(&store).await;
        let mut snapshot_rx = registry.watch_snapshot();

        let created = store
            .create(COLLECTION, location("u2", 2.0, true))
            .await
            .unwrap();
        let id = created.get("id").and_then(Value::as_str).unwrap().to_string();
        snapshot_rx.changed().await.unwrap();
        assert!(snapshot_rx.borrow().contains_key("u2"));

        store
            .update(COLLECTION, &id, json!({"isactive": false}))
            .await
            .unwrap();
        snapshot_rx.changed().await.unwrap();
        assert!(
            !snapshot_rx.borrow().contains_key("u2"),
            "inactive update removes the owner"
        );
    }

    #[tokio::test]
    async fn delete_event_removes_owner() {
        let store = MemoryStore::new();
        let id = store.seed(COLLECTION, location("u2", 2.0, true));
        let (registry, _self_events) = spawn(&store).await;
        let mut snapshot_rx = registry.watch_snapshot();
        assert!(registry.snapshot().contains_key("u2"));

        store.delete(COLLECTION, &id).await.unwrap();
        snapshot_rx.changed().await.unwrap();
        assert!(!snapshot_rx.borrow().contains_key("u2"));
    }

    #[tokio::test]
    async fn self_events_route_to_session_not_presence() {
        let store = MemoryStore::new();
        let (registry, mut self_events) = spawn(&store).await;

        let created = store
            .create(COLLECTION, location(VIEWER, 1.0, true))
            .await
            .unwrap();
        let id = created.get("id").and_then(Value::as_str).unwrap().to_string();
        assert_eq!(
            self_events.recv().await,
            Some(SelfRecordEvent::Updated(id.clone()))
        );

        store.delete(COLLECTION, &id).await.unwrap();
        assert_eq!(self_events.recv().await, Some(SelfRecordEvent::Deleted));
        assert!(!registry.snapshot().contains_key(VIEWER));
    }

    #[tokio::test]
    async fn last_write_wins_per_owner() {
        let store = MemoryStore::new();
        let (registry, _self_events) = spawn(&store).await;
        let mut snapshot_rx = registry.watch_snapshot();

        let created = store
            .create(COLLECTION, location("u2", 2.0, true))
            .await
            .unwrap();
        let id = created.get("id").and_then(Value::as_str).unwrap().to_string();
        snapshot_rx.changed().await.unwrap();

        store
            .update(COLLECTION, &id, json!({"location": {"lon": 9.0, "lat": 0.0}}))
            .await
            .unwrap();
        snapshot_rx.changed().await.unwrap();

        let snapshot = snapshot_rx.borrow();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("u2").unwrap().record.coordinates.lon, 9.0);
    }

    #[tokio::test]
    async fn display_fields_survive_events_without_expand() {
        let store = MemoryStore::new();
        let mut seeded = location("u2", 2.0, true);
        seeded["expand"] = json!({"danuser": {"name": "Budi", "avatar": "b.png"}});
        let id = store.seed(COLLECTION, seeded);

        let (registry, _self_events) = spawn(&store).await;
        let mut snapshot_rx = registry.watch_snapshot();
        assert_eq!(
            registry.snapshot().get("u2").unwrap().name.as_deref(),
            Some("Budi")
        );

        // MemoryStore events carry the stored record, which includes the
        // seeded expand; strip it first to model a bare realtime payload.
        store
            .update(COLLECTION, &id, json!({"expand": {}}))
            .await
            .unwrap();
        snapshot_rx.changed().await.unwrap();
        assert_eq!(
            snapshot_rx.borrow().get("u2").unwrap().name.as_deref(),
            Some("Budi"),
            "known display fields are retained"
        );
    }
}
