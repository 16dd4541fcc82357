//! Trigger rule evaluation and message rendering.

use crate::config::WebhookTrigger;
use crate::events::{EventPayload, EventRecord};

/// Treat blank strings from the config UI as unset.
fn condition(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Whether `trigger` fires for `record`.
///
/// Scene triggers (scene id or name) only consider `scene_triggered` events;
/// a scene id takes precedence over a scene name. Accessory triggers
/// (accessory id, characteristic, value) only consider characteristic and
/// control events, and every condition that is set must hold. A trigger with
/// none of those conditions never fires.
pub fn trigger_matches(trigger: &WebhookTrigger, record: &EventRecord) -> bool {
    if !trigger.enabled {
        return false;
    }

    let scene_id = condition(&trigger.scene_id);
    let scene_name = condition(&trigger.scene_name);
    if scene_id.is_some() || scene_name.is_some() {
        let EventPayload::SceneTriggered {
            scene_id: event_id,
            scene_name: event_name,
        } = &record.payload
        else {
            return false;
        };
        return match (scene_id, scene_name) {
            (Some(id), _) => event_id == id,
            (None, Some(name)) => event_name.to_lowercase() == name.to_lowercase(),
            (None, None) => false,
        };
    }

    let accessory_id = condition(&trigger.accessory_id);
    let characteristic = condition(&trigger.characteristic);
    let value = condition(&trigger.value);
    if accessory_id.is_none() && characteristic.is_none() && value.is_none() {
        return false;
    }

    let Some(change) = record.accessory_change() else {
        return false;
    };
    if accessory_id.is_some_and(|id| change.accessory_id != id) {
        return false;
    }
    if characteristic.is_some_and(|c| !change.characteristic.eq_ignore_ascii_case(c)) {
        return false;
    }
    if value.is_some_and(|v| !change.value.eq_ignore_ascii_case(v)) {
        return false;
    }
    if let Some(kind) = condition(&trigger.accessory_type) {
        return change
            .accessory_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(kind));
    }
    true
}

/// Message for a matched trigger: the custom template, or the event
/// description, prefixed with the trigger name.
pub fn trigger_message(trigger: &WebhookTrigger, record: &EventRecord) -> String {
    let body = match condition(&trigger.message) {
        Some(template) => render_template(template, record),
        None => record.describe(),
    };
    let label = trigger.name.trim();
    if label.is_empty() {
        body
    } else {
        format!("[{}] {}", label, body)
    }
}

/// Substitute `{accessory}`, `{room}`, `{characteristic}`, `{value}`,
/// `{oldValue}` and `{scene}`. Unknown placeholders are left alone.
pub fn render_template(template: &str, record: &EventRecord) -> String {
    let (accessory, room, characteristic, value, old_value, scene) = match &record.payload {
        EventPayload::CharacteristicChange(change) | EventPayload::AccessoryControlled(change) => (
            change.accessory_name.as_str(),
            change.room.as_deref().unwrap_or(""),
            change.characteristic.as_str(),
            change.value.as_str(),
            change.old_value.as_deref().unwrap_or(""),
            "",
        ),
        EventPayload::SceneTriggered { scene_name, .. } => ("", "", "", "", "", scene_name.as_str()),
        EventPayload::HomesUpdated { .. } => ("", "", "", "", "", ""),
    };

    template
        .replace("{accessory}", accessory)
        .replace("{room}", room)
        .replace("{characteristic}", characteristic)
        .replace("{value}", value)
        .replace("{oldValue}", old_value)
        .replace("{scene}", scene)
}
