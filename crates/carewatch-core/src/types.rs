use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Longest site id accepted from a client.
pub const MAX_SITE_ID_LEN: usize = 128;

/// Characters that would change the meaning of an upstream path or URL.
const FORBIDDEN_SITE_ID_CHARS: &[char] = &['/', '\\', '?', '#', '.', '[', ']', '$', '%'];

/// Facility identifier supplied by clients. Opaque and case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteId(pub String);

impl SiteId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `raw` can be used as a site id. Site ids become one segment
    /// of an upstream path, so separators, query and fragment markers, and
    /// the realtime database's reserved key characters are refused.
    pub fn is_valid(raw: &str) -> bool {
        !raw.is_empty()
            && raw.len() <= MAX_SITE_ID_LEN
            && !raw
                .chars()
                .any(|c| c.is_control() || FORBIDDEN_SITE_ID_CHARS.contains(&c))
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SiteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SiteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-connection identifier (random UUID, not persisted).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(pub String);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last-known materialized state of a watched site.
///
/// Held in memory only while the site has subscribers; never persisted and
/// never replayed to clients that join later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveState {
    /// Active calls keyed by call id, exactly as the upstream store holds them.
    pub live_calls: Map<String, Value>,
    pub feed: Vec<Value>,
    /// Most recent sensor readings, oldest first, at most
    /// [`MAX_SENSE_EVENTS`](crate::config::MAX_SENSE_EVENTS).
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub sense_events: VecDeque<SenseEvent>,
}

impl LiveState {
    /// Replace the live calls with a fresh upstream snapshot.
    ///
    /// `None`, `null` and non-object values all mean "no calls right now".
    pub fn replace_live_calls(&mut self, snapshot: Option<Value>) {
        self.live_calls = match snapshot {
            Some(Value::Object(calls)) => calls,
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                tracing::debug!(kind = value_kind(&other), "non-object live calls snapshot");
                Map::new()
            }
        };
    }

    /// Append a sensor reading, dropping the oldest once the history is full.
    pub fn record_sense_event(&mut self, event: SenseEvent) {
        while self.sense_events.len() >= crate::config::MAX_SENSE_EVENTS {
            self.sense_events.pop_front();
        }
        self.sense_events.push_back(event);
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One presence-sensor reading merged into a site's live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenseEvent {
    /// Event type taken from the device topic (e.g. `presence`, `fall`).
    pub status: String,
    pub value: Value,
    pub room: String,
    pub zone: String,
    pub description: String,
    /// RFC3339 time the event reached the gateway.
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_snapshot_normalizes_to_empty_calls() {
        let mut state = LiveState::default();
        state.replace_live_calls(Some(json!({"call1": {"room": "12"}})));
        assert_eq!(state.live_calls.len(), 1);

        state.replace_live_calls(Some(Value::Null));
        assert!(state.live_calls.is_empty());

        state.replace_live_calls(Some(json!({"call2": {}})));
        state.replace_live_calls(None);
        assert!(state.live_calls.is_empty());
    }

    #[test]
    fn scalar_snapshot_is_treated_as_no_calls() {
        let mut state = LiveState::default();
        state.replace_live_calls(Some(json!("garbage")));
        assert!(state.live_calls.is_empty());
    }

    #[test]
    fn empty_sense_events_are_omitted() {
        let state = LiveState::default();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json, json!({"liveCalls": {}, "feed": []}));
    }

    fn reading(n: usize) -> SenseEvent {
        SenseEvent {
            status: "presence".to_string(),
            value: json!(n),
            room: "Room 1".to_string(),
            zone: String::new(),
            description: "status".to_string(),
            timestamp: String::new(),
        }
    }

    #[test]
    fn sense_history_is_capped() {
        let max = crate::config::MAX_SENSE_EVENTS;
        let mut state = LiveState::default();
        for n in 0..max + 5 {
            state.record_sense_event(reading(n));
        }

        assert_eq!(state.sense_events.len(), max);
        assert_eq!(state.sense_events.front().map(|e| &e.value), Some(&json!(5)));
        assert_eq!(state.sense_events.back().map(|e| &e.value), Some(&json!(max + 4)));
    }

    #[test]
    fn site_id_validation() {
        for ok in ["SITE1", "sensetest", "north-wing_2", "Zoë House"] {
            assert!(SiteId::is_valid(ok), "{ok}");
        }
        let too_long = "x".repeat(MAX_SITE_ID_LEN + 1);
        for bad in [
            "",
            "users.json?x=",
            "a/b",
            "..",
            "site#frag",
            "site[0]",
            "$priority",
            "%2e%2e",
            "line\nbreak",
            too_long.as_str(),
        ] {
            assert!(!SiteId::is_valid(bad), "{bad}");
        }
    }

    #[test]
    fn site_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&SiteId::from("SITE1")).unwrap();
        assert_eq!(json, r#""SITE1""#);
    }
}
