//! Typed event records.
//!
//! One line of `events.jsonl` is one [`EventRecord`]: a timestamp plus a
//! payload tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Discriminant of an [`EventRecord`], as written in the `type` field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CharacteristicChange,
    HomesUpdated,
    SceneTriggered,
    AccessoryControlled,
}

/// A characteristic value observed on, or written to, an accessory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessoryChange {
    pub accessory_id: String,
    pub accessory_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessory_type: Option<String>,
    pub characteristic: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventPayload {
    /// The platform reported a new value.
    CharacteristicChange(AccessoryChange),
    /// The home or accessory set changed.
    HomesUpdated {
        home_count: usize,
        accessory_count: usize,
    },
    SceneTriggered {
        scene_id: String,
        scene_name: String,
    },
    /// A client wrote a value.
    AccessoryControlled(AccessoryChange),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventRecord {
    pub fn new(timestamp: DateTime<Utc>, payload: EventPayload) -> Self {
        Self { timestamp, payload }
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::CharacteristicChange(_) => EventKind::CharacteristicChange,
            EventPayload::HomesUpdated { .. } => EventKind::HomesUpdated,
            EventPayload::SceneTriggered { .. } => EventKind::SceneTriggered,
            EventPayload::AccessoryControlled(_) => EventKind::AccessoryControlled,
        }
    }

    /// The accessory change carried by characteristic and control events.
    pub fn accessory_change(&self) -> Option<&AccessoryChange> {
        match &self.payload {
            EventPayload::CharacteristicChange(change)
            | EventPayload::AccessoryControlled(change) => Some(change),
            _ => None,
        }
    }

    /// Human readable one-line description.
    pub fn describe(&self) -> String {
        match &self.payload {
            EventPayload::CharacteristicChange(change) => {
                let mut text = format!(
                    "{} {} changed to {}",
                    located_name(change),
                    change.characteristic,
                    change.value
                );
                if let Some(old) = &change.old_value {
                    text.push_str(&format!(" (was {})", old));
                }
                text
            }
            EventPayload::AccessoryControlled(change) => format!(
                "{} {} set to {}",
                located_name(change),
                change.characteristic,
                change.value
            ),
            EventPayload::SceneTriggered { scene_name, .. } => {
                format!("Scene '{}' triggered", scene_name)
            }
            EventPayload::HomesUpdated {
                home_count,
                accessory_count,
            } => format!(
                "Home data updated: {} home(s), {} accessories",
                home_count, accessory_count
            ),
        }
    }
}

fn located_name(change: &AccessoryChange) -> String {
    match &change.room {
        Some(room) if !room.is_empty() => format!("{} ({})", change.accessory_name, room),
        _ => change.accessory_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn lamp_change() -> AccessoryChange {
        AccessoryChange {
            accessory_id: "lamp-1".into(),
            accessory_name: "Desk Lamp".into(),
            room: Some("Office".into()),
            accessory_type: None,
            characteristic: "power".into(),
            value: "true".into(),
            old_value: Some("false".into()),
        }
    }

    #[test]
    fn test_line_format_is_flat_and_tagged() {
        let record = EventRecord::new(
            "2025-01-02T03:04:05Z".parse().unwrap(),
            EventPayload::CharacteristicChange(lamp_change()),
        );
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();

        assert_eq!(json["type"], "characteristic_change");
        assert_eq!(json["accessoryId"], "lamp-1");
        assert_eq!(json["oldValue"], "false");
        assert!(json.get("accessoryType").is_none());
        assert!(json["timestamp"].as_str().unwrap().starts_with("2025-01-02T03:04:05"));
    }

    #[test]
    fn test_scene_line_parses() {
        let line = r#"{"timestamp":"2025-01-02T03:04:05Z","type":"scene_triggered","sceneId":"s1","sceneName":"Good Night"}"#;
        let record: EventRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.kind(), EventKind::SceneTriggered);
        assert_eq!(record.describe(), "Scene 'Good Night' triggered");
        assert!(record.accessory_change().is_none());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let line = r#"{"timestamp":"2025-01-02T03:04:05Z","type":"reboot"}"#;
        assert!(serde_json::from_str::<EventRecord>(line).is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EventKind::HomesUpdated.to_string(), "homes_updated");
        assert_eq!(
            EventKind::from_str("accessory_controlled").unwrap(),
            EventKind::AccessoryControlled
        );
        assert!(EventKind::from_str("nope").is_err());
    }

    #[test]
    fn test_describe_includes_room_and_previous_value() {
        let record = EventRecord::new(Utc::now(), EventPayload::CharacteristicChange(lamp_change()));
        assert_eq!(
            record.describe(),
            "Desk Lamp (Office) power changed to true (was false)"
        );

        let record = EventRecord::new(Utc::now(), EventPayload::AccessoryControlled(lamp_change()));
        assert_eq!(record.describe(), "Desk Lamp (Office) power set to true");
    }
}
