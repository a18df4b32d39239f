use carewatch_core::error::{CarewatchError, Result};
use carewatch_core::types::{LiveState, SiteId};
use serde::{Deserialize, Serialize};

use crate::actions::{INVALID_MESSAGE_FORMAT, SUBSCRIBE, UNSUBSCRIBE};

/// Raw inbound control frame, before validation.
/// Wire: `{ "action": "subscribe", "siteId": "SITE1", "username": "alice" }`
///
/// Older dashboards send `sitecode` instead of `siteId`; both are accepted.
/// `username` is tolerated and ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, rename = "siteId", alias = "sitecode")]
    pub site_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Validated client → server control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Subscribe { site_id: SiteId },
    /// `site_id` may be omitted; the connection's current site is implied.
    Unsubscribe { site_id: Option<SiteId> },
}

impl ClientMessage {
    /// Decode one text frame. Any error here is reported to the client as
    /// `{ "error": "Invalid message format" }`.
    pub fn parse(text: &str) -> Result<Self> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        let site_id = match frame.site_id.filter(|s| !s.is_empty()) {
            Some(raw) if !SiteId::is_valid(&raw) => {
                return Err(CarewatchError::Protocol(format!("invalid siteId: {raw:?}")));
            }
            raw => raw.map(SiteId::from),
        };

        match frame.action.as_deref() {
            Some(SUBSCRIBE) => site_id
                .map(|site_id| ClientMessage::Subscribe { site_id })
                .ok_or_else(|| CarewatchError::Protocol("subscribe without siteId".to_string())),
            Some(UNSUBSCRIBE) => Ok(ClientMessage::Unsubscribe { site_id }),
            Some(other) => Err(CarewatchError::Protocol(format!("unknown action: {other}"))),
            None => Err(CarewatchError::Protocol("missing action".to_string())),
        }
    }
}

/// Server → client frame. Serialized without a type tag; the shape of the
/// object identifies the kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// `{ "message": "Subscribed to SITE1" }`
    Notice { message: String },
    /// `{ "error": "Invalid message format" }`
    Error { error: String },
    /// `{ "siteId": "SITE1", "update": { "liveCalls": {...}, "feed": [...] } }`
    Update {
        #[serde(rename = "siteId")]
        site_id: SiteId,
        update: LiveState,
    },
}

impl ServerMessage {
    pub fn subscribed(site_id: &SiteId) -> Self {
        ServerMessage::Notice {
            message: format!("Subscribed to {site_id}"),
        }
    }

    pub fn unsubscribed(site_id: &SiteId) -> Self {
        ServerMessage::Notice {
            message: format!("Unsubscribed from {site_id}"),
        }
    }

    pub fn invalid_format() -> Self {
        ServerMessage::Error {
            error: INVALID_MESSAGE_FORMAT.to_string(),
        }
    }

    /// Sent when the upstream watch for a site could not be established.
    pub fn subscription_failed(site_id: &SiteId) -> Self {
        ServerMessage::Error {
            error: format!("Subscription to {site_id} failed"),
        }
    }

    pub fn update(site_id: &SiteId, state: &LiveState) -> Self {
        ServerMessage::Update {
            site_id: site_id.clone(),
            update: state.clone(),
        }
    }

    /// Serialize for the wire. Fan-out serializes once and shares the text.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
