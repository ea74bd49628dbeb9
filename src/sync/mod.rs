//! The sync engine: upsert coordination, presence, inactivity and the
//! session state machine tying them together.

pub mod coordinator;
pub mod presence;
pub mod session;
pub mod watchdog;

pub use coordinator::{FlushOutcome, UpsertCoordinator};
pub use presence::{PresenceRegistry, PresenceSnapshot, SelfRecordEvent};
pub use session::{LiveSession, SessionEvent, SessionHandle, SharingState, StopReason};
pub use watchdog::InactivityWatchdog;
