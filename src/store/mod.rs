//! Backend abstraction.
//!
//! The engine only assumes what the backing store actually guarantees:
//! records carry an `id`, list queries accept a string filter expression,
//! and subscriptions deliver `{action, record}` events. Everything else is
//! an implementation detail of the concrete store.

pub mod memory;
pub mod pocketbase;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SyncResult;
use crate::models::RecordEvent;

pub use memory::MemoryStore;
pub use pocketbase::PocketBaseStore;

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub filter: Option<String>,
    /// Sort expression, e.g. `updated` or `-updated`.
    pub sort: Option<String>,
    /// Relations to denormalize into the response, e.g. `danuser`.
    pub expand: Option<String>,
}

impl ListOptions {
    pub fn filtered(filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
            ..Self::default()
        }
    }

    pub fn sorted_by(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn expanded(mut self, expand: impl Into<String>) -> Self {
        self.expand = Some(expand.into());
        self
    }
}

/// Injected handle to the backing record store. Never a global singleton.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_one(&self, collection: &str, id: &str) -> SyncResult<Value>;

    /// First record matching `filter`, or `SyncError::NotFound`.
    async fn get_first_list_item(&self, collection: &str, filter: &str) -> SyncResult<Value>;

    async fn get_full_list(&self, collection: &str, options: &ListOptions)
        -> SyncResult<Vec<Value>>;

    async fn create(&self, collection: &str, data: Value) -> SyncResult<Value>;

    async fn update(&self, collection: &str, id: &str, data: Value) -> SyncResult<Value>;

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<()>;

    /// Open a realtime change feed for `topic` (a collection name).
    async fn subscribe(&self, topic: &str) -> SyncResult<Subscription>;
}

/// A live change feed. Dropping it tears the feed down; no dangling
/// subscriptions survive the consumer.
pub struct Subscription {
    events: mpsc::Receiver<RecordEvent>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(events: mpsc::Receiver<RecordEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { events, task }
    }

    /// Next event, or `None` once the feed is closed.
    pub async fn next_event(&mut self) -> Option<RecordEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
