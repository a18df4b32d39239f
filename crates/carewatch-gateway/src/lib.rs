//! Carewatch live-update gateway: WebSocket fan-out of per-site call state.

pub mod app;
pub mod error;
pub mod http;
pub mod registry;
pub mod sense;
pub mod ws;
