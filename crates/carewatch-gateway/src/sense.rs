//! Presence-sensor ("Sense") events bridged from the device MQTT broker.
//!
//! Device topics look like `/devices/<device-id>/events/<event-type>`; the
//! message body carries the reading at `payload.event`.

use carewatch_core::types::SenseEvent;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Only devices of the current presence-sensor generation are bridged.
const PRESENCE_SENSOR_PREFIX: &str = "presence_sensor_";
const EVENTS_MESSAGE_TYPE: &str = "events";
const DEFAULT_DESCRIPTION: &str = "status";

/// Body of `POST /webhooks/sense/{site_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SenseIngest {
    /// MQTT topic as received by the bridge.
    pub topic: String,
    /// Raw MQTT message body.
    pub message: Value,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SenseRejection {
    #[error("not an events topic")]
    NotAnEvent,
    #[error("device {0} is not a presence sensor")]
    UnsupportedDevice(String),
    #[error("topic has no event type")]
    MissingEventType,
    #[error("message has no payload.event")]
    MissingValue,
}

#[derive(Debug, PartialEq, Eq)]
pub struct TopicParts<'a> {
    pub device_id: &'a str,
    pub message_type: &'a str,
    pub event_type: &'a str,
}

/// Split a device topic. Missing segments come back empty.
pub fn split_topic(topic: &str) -> TopicParts<'_> {
    let segments: Vec<&str> = topic.split('/').collect();
    let at = |i: usize| segments.get(i).copied().unwrap_or("");
    TopicParts {
        device_id: at(2),
        message_type: at(3),
        event_type: at(4),
    }
}

/// Turn one bridged MQTT message into a sensor event, or say why not.
pub fn parse_event(ingest: &SenseIngest) -> Result<SenseEvent, SenseRejection> {
    let parts = split_topic(&ingest.topic);

    if parts.message_type != EVENTS_MESSAGE_TYPE {
        return Err(SenseRejection::NotAnEvent);
    }
    if !parts.device_id.contains(PRESENCE_SENSOR_PREFIX) {
        return Err(SenseRejection::UnsupportedDevice(parts.device_id.to_string()));
    }
    if parts.event_type.is_empty() {
        return Err(SenseRejection::MissingEventType);
    }
    let value = ingest
        .message
        .pointer("/payload/event")
        .cloned()
        .ok_or(SenseRejection::MissingValue)?;

    Ok(SenseEvent {
        status: parts.event_type.to_string(),
        value,
        room: ingest
            .room
            .clone()
            .unwrap_or_else(|| parts.device_id.to_string()),
        zone: ingest.zone.clone().unwrap_or_default(),
        description: DEFAULT_DESCRIPTION.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ingest(topic: &str, message: Value) -> SenseIngest {
        SenseIngest {
            topic: topic.to_string(),
            message,
            room: None,
            zone: None,
        }
    }

    #[test]
    fn splits_device_topics() {
        let parts = split_topic("/devices/presence_sensor_fp2_8b53/events/presence");
        assert_eq!(
            parts,
            TopicParts {
                device_id: "presence_sensor_fp2_8b53",
                message_type: "events",
                event_type: "presence",
            }
        );
        assert_eq!(split_topic("/devices").event_type, "");
    }

    #[test]
    fn accepts_presence_sensor_events() {
        let msg = ingest(
            "/devices/presence_sensor_fp2_8b53/events/presence",
            json!({"payload": {"event": "occupied"}}),
        );
        let event = parse_event(&msg).unwrap();
        assert_eq!(event.status, "presence");
        assert_eq!(event.value, json!("occupied"));
        assert_eq!(event.room, "presence_sensor_fp2_8b53");
        assert_eq!(event.description, "status");
    }

    #[test]
    fn explicit_room_and_zone_win() {
        let mut msg = ingest(
            "/devices/presence_sensor_1/events/fall",
            json!({"payload": {"event": true}}),
        );
        msg.room = Some("Room 12".to_string());
        msg.zone = Some("1st Floor".to_string());

        let event = parse_event(&msg).unwrap();
        assert_eq!(event.room, "Room 12");
        assert_eq!(event.zone, "1st Floor");
    }

    #[test]
    fn rejects_other_traffic() {
        let body = json!({"payload": {"event": 1}});
        assert_eq!(
            parse_event(&ingest("/devices/presence_sensor_1/status/online", body.clone())),
            Err(SenseRejection::NotAnEvent)
        );
        assert_eq!(
            parse_event(&ingest("/devices/fp2/events/pull", body.clone())),
            Err(SenseRejection::UnsupportedDevice("fp2".to_string()))
        );
        assert_eq!(
            parse_event(&ingest("/devices/presence_sensor_1/events", body)),
            Err(SenseRejection::MissingEventType)
        );
        assert_eq!(
            parse_event(&ingest("/devices/presence_sensor_1/events/presence", json!({}))),
            Err(SenseRejection::MissingValue)
        );
    }
}
