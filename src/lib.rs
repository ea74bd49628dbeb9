//! Client-side live location sync engine for the Danusin platform.
//!
//! A user who opts in has their position persisted to a single backend
//! record on a fixed cadence while a presence registry mirrors everyone
//! else's live records in real time. The engine is headless: it exposes a
//! [`sync::SessionHandle`] plus event and snapshot channels, and leaves
//! rendering to whoever embeds it.

pub mod config;
pub mod error;
pub mod geo;
pub mod models;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use models::{Coordinates, LiveLocationRecord, PresenceEntry};
pub use store::{MemoryStore, PocketBaseStore, RecordStore};
pub use sync::{
    LiveSession, PresenceRegistry, SessionEvent, SessionHandle, SharingState, StopReason,
};
