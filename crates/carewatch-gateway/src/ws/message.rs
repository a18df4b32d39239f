use carewatch_core::types::SiteId;
use carewatch_protocol::{ClientMessage, ServerMessage};
use tracing::{debug, info, warn};

use crate::registry::SiteRegistry;
use crate::ws::send::ConnectionHandle;

/// Per-connection protocol state.
///
/// A connection follows at most one site at a time. Subscribing to a second
/// site releases the first; the registry itself would allow more, but the
/// dashboard protocol never asks for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Subscribed(SiteId),
}

impl ConnState {
    pub fn site(&self) -> Option<&SiteId> {
        match self {
            ConnState::Idle => None,
            ConnState::Subscribed(site_id) => Some(site_id),
        }
    }
}

/// Process one inbound text frame. Returns the new connection state.
///
/// Never fails: malformed frames get `{ "error": "Invalid message format" }`
/// and leave the state unchanged.
pub async fn handle(
    text: &str,
    state: ConnState,
    conn: &ConnectionHandle,
    registry: &SiteRegistry,
) -> ConnState {
    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(conn_id = %conn.id, code = e.code(), error = %e, "malformed frame");
            conn.send(&ServerMessage::invalid_format());
            return state;
        }
    };

    match msg {
        ClientMessage::Subscribe { site_id } => subscribe(site_id, state, conn, registry).await,
        ClientMessage::Unsubscribe { site_id } => unsubscribe(site_id, state, conn, registry),
    }
}

async fn subscribe(
    site_id: SiteId,
    state: ConnState,
    conn: &ConnectionHandle,
    registry: &SiteRegistry,
) -> ConnState {
    if let Some(previous) = state.site().filter(|previous| **previous != site_id) {
        debug!(conn_id = %conn.id, site_id = %previous, "switching sites");
        registry.release(previous, &conn.id);
    }

    info!(conn_id = %conn.id, site_id = %site_id, "subscribe");
    match registry.attach(&site_id, conn).await {
        Ok(()) => ConnState::Subscribed(site_id),
        Err(e) => {
            warn!(conn_id = %conn.id, error = %e, "subscription failed");
            conn.send(&ServerMessage::subscription_failed(&site_id));
            ConnState::Idle
        }
    }
}

fn unsubscribe(
    requested: Option<SiteId>,
    state: ConnState,
    conn: &ConnectionHandle,
    registry: &SiteRegistry,
) -> ConnState {
    let Some(site_id) = requested.or_else(|| state.site().cloned()) else {
        debug!(conn_id = %conn.id, "unsubscribe while idle");
        return ConnState::Idle;
    };

    info!(conn_id = %conn.id, site_id = %site_id, "unsubscribe");
    registry.detach(&site_id, conn);

    match state {
        // Unsubscribing from some other site leaves the current one alone.
        ConnState::Subscribed(current) if current != site_id => ConnState::Subscribed(current),
        _ => ConnState::Idle,
    }
}

/// Transport closed: drop every subscription the connection holds.
pub fn close(conn: &ConnectionHandle, registry: &SiteRegistry) {
    registry.detach_all(&conn.id);
}
