//! Typed views over the backend's record JSON.
//!
//! The backend SDK hands records back as loosely shaped JSON; everything the
//! engine consumes crosses the parsing boundary here, so malformed records
//! are rejected before they reach the sync state machine.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lon: f64,
    pub lat: f64,
}

impl Coordinates {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

/// The slice of the backend user record the engine reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default, rename = "islivesharing")]
    pub is_live_sharing: bool,
}

/// A persisted live location row.
///
/// Invariant: at most one *active* record exists per owner at a time. The
/// client enforces this by adopting an existing record before creating one.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveLocationRecord {
    pub id: String,
    /// Owner user id (`danuser` relation on the wire).
    pub danuser_id: String,
    pub coordinates: Coordinates,
    pub is_active: bool,
    pub updated: Option<DateTime<Utc>>,
}

impl LiveLocationRecord {
    /// Parse a backend record, rejecting anything without an id, an owner
    /// and numeric coordinates.
    pub fn from_value(value: &Value) -> SyncResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| SyncError::InvalidRecord("record is not an object".to_string()))?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::InvalidRecord("missing record id".to_string()))?;

        let danuser_id = obj
            .get("danuser")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::InvalidRecord("missing danuser owner".to_string()))?;

        let location = obj
            .get("location")
            .and_then(Value::as_object)
            .ok_or_else(|| SyncError::InvalidRecord("missing location".to_string()))?;
        let lon = location.get("lon").and_then(Value::as_f64);
        let lat = location.get("lat").and_then(Value::as_f64);
        let (lon, lat) = match (lon, lat) {
            (Some(lon), Some(lat)) => (lon, lat),
            _ => {
                return Err(SyncError::InvalidRecord(
                    "non-numeric coordinates".to_string(),
                ))
            }
        };

        Ok(LiveLocationRecord {
            id: id.to_string(),
            danuser_id: danuser_id.to_string(),
            coordinates: Coordinates::new(lon, lat),
            is_active: obj.get("isactive").and_then(Value::as_bool).unwrap_or(false),
            updated: obj
                .get("updated")
                .and_then(Value::as_str)
                .and_then(parse_backend_timestamp),
        })
    }
}

/// A presence set entry: the latest known record for one owner plus the
/// denormalized display fields pulled from the `danuser` expand.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub record: LiveLocationRecord,
    pub name: Option<String>,
    pub avatar: Option<String>,
}

impl PresenceEntry {
    pub fn from_value(value: &Value) -> SyncResult<Self> {
        let record = LiveLocationRecord::from_value(value)?;
        let expand = value.pointer("/expand/danuser");
        Ok(PresenceEntry {
            record,
            name: expand
                .and_then(|v| v.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            avatar: expand
                .and_then(|v| v.get("avatar"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

/// One realtime change feed event, `{action, record}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEvent {
    pub action: EventAction,
    pub record: Value,
}

/// Parse the backend's timestamp format (`2024-01-02 03:04:05.678Z`),
/// falling back to RFC 3339.
pub fn parse_backend_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.fZ") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn format_backend_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_record() {
        let value = json!({
            "id": "r1",
            "danuser": "u1",
            "location": {"lon": 10.0, "lat": 20.0},
            "isactive": true,
            "updated": "2024-01-02 03:04:05.678Z",
        });
        let record = LiveLocationRecord::from_value(&value).unwrap();
        assert_eq!(record.id, "r1");
        assert_eq!(record.danuser_id, "u1");
        assert_eq!(record.coordinates, Coordinates::new(10.0, 20.0));
        assert!(record.is_active);
        assert!(record.updated.is_some());
    }

    #[test]
    fn reject_malformed_records() {
        let missing_id = json!({"danuser": "u1", "location": {"lon": 1.0, "lat": 2.0}});
        assert!(LiveLocationRecord::from_value(&missing_id).is_err());

        let missing_owner = json!({"id": "r1", "location": {"lon": 1.0, "lat": 2.0}});
        assert!(LiveLocationRecord::from_value(&missing_owner).is_err());

        let bad_coords = json!({"id": "r1", "danuser": "u1", "location": {"lon": "x", "lat": 2.0}});
        assert!(LiveLocationRecord::from_value(&bad_coords).is_err());

        assert!(LiveLocationRecord::from_value(&json!("nope")).is_err());
    }

    #[test]
    fn missing_active_flag_defaults_to_inactive() {
        let value = json!({"id": "r1", "danuser": "u1", "location": {"lon": 1.0, "lat": 2.0}});
        let record = LiveLocationRecord::from_value(&value).unwrap();
        assert!(!record.is_active);
    }

    #[test]
    fn presence_entry_reads_expand() {
        let value = json!({
            "id": "r1",
            "danuser": "u1",
            "location": {"lon": 1.0, "lat": 2.0},
            "isactive": true,
            "expand": {"danuser": {"name": "Andi", "avatar": "a.png"}},
        });
        let entry = PresenceEntry::from_value(&value).unwrap();
        assert_eq!(entry.name.as_deref(), Some("Andi"));
        assert_eq!(entry.avatar.as_deref(), Some("a.png"));
    }

    #[test]
    fn timestamp_roundtrip() {
        let formatted = "2024-01-02 03:04:05.678Z";
        let parsed = parse_backend_timestamp(formatted).unwrap();
        assert_eq!(format_backend_timestamp(parsed), formatted);

        assert!(parse_backend_timestamp("2024-01-02T03:04:05.678+00:00").is_some());
        assert!(parse_backend_timestamp("yesterday").is_none());
    }

    #[test]
    fn event_action_wire_names() {
        let event: RecordEvent =
            serde_json::from_value(json!({"action": "create", "record": {"id": "r1"}})).unwrap();
        assert_eq!(event.action, EventAction::Create);
    }
}
