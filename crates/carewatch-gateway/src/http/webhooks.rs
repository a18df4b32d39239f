//! Sensor ingress endpoint: POST /webhooks/sense/{site_id}.
//!
//! The MQTT bridge forwards presence-sensor messages here. Requests are
//! authenticated according to `[sense].auth_mode`; accepted events are merged
//! into the site's live state and fanned out to its subscribers.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use carewatch_core::config::SenseAuthMode;
use carewatch_core::types::SiteId;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::sense::{self, SenseIngest};

type HmacSha256 = Hmac<Sha256>;

type HandlerError = (StatusCode, Json<Value>);

// ── Public handler ────────────────────────────────────────────────────────────

/// POST /webhooks/sense/{site_id}
///
/// 202 whether or not the event was used (`accepted` / `delivered` say which),
/// 400 on bad JSON, 401 on auth failure, 404 when sensor ingest is disabled.
pub async fn sense_handler(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), HandlerError> {
    let cfg = &state.config.sense;

    if !cfg.enabled {
        warn!(site_id = %site_id, "sense event received but ingest is disabled");
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "sense ingest is disabled"})),
        ));
    }

    match cfg.auth_mode {
        SenseAuthMode::HmacSha256 => {
            verify_hmac_sha256(&headers, &body, cfg.secret.as_deref())
                .map_err(|e| auth_error(&e))?;
        }
        SenseAuthMode::BearerToken => {
            verify_bearer_token(&headers, cfg.secret.as_deref()).map_err(|e| auth_error(&e))?;
        }
        SenseAuthMode::None => {}
    }

    let ingest: SenseIngest = serde_json::from_slice(&body).map_err(|e| {
        warn!(site_id = %site_id, error = %e, "invalid JSON in sense body");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid JSON body"})),
        )
    })?;

    let event = match sense::parse_event(&ingest) {
        Ok(event) => event,
        Err(reason) => {
            debug!(site_id = %site_id, topic = %ingest.topic, reason = %reason, "sense message ignored");
            return Ok((
                StatusCode::ACCEPTED,
                Json(json!({"accepted": false, "reason": reason.to_string()})),
            ));
        }
    };

    let site_id = SiteId::from(site_id);
    let status = event.status.clone();
    let delivered = state.registry.push_sense_event(&site_id, event);
    info!(site_id = %site_id, status = %status, delivered, "sense event");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"accepted": true, "delivered": delivered})),
    ))
}

// ── Auth helpers ──────────────────────────────────────────────────────────────

/// Verify HMAC-SHA256 of the body: `sha256=<hex>` in X-Hub-Signature-256.
fn verify_hmac_sha256(headers: &HeaderMap, body: &[u8], secret: Option<&str>) -> Result<(), String> {
    let secret = secret.ok_or_else(|| "no HMAC secret configured".to_string())?;

    let sig_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing X-Hub-Signature-256 header".to_string())?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| "malformed X-Hub-Signature-256 header".to_string())?;

    let expected =
        hex::decode(sig_hex).map_err(|_| "X-Hub-Signature-256 is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| "HMAC signature mismatch".to_string())
}

/// Verify a static token in `Authorization: Bearer <token>`.
fn verify_bearer_token(headers: &HeaderMap, secret: Option<&str>) -> Result<(), String> {
    let expected = secret.ok_or_else(|| "no bearer token configured".to_string())?;

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing Authorization header".to_string())?
        .strip_prefix("Bearer ")
        .ok_or_else(|| "Authorization header must use Bearer scheme".to_string())?;

    if constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err("bearer token mismatch".to_string())
    }
}

/// Compare secrets without leaking where they differ: both sides are
/// MACed under the expected value and the tags compared by `verify_slice`.
fn constant_time_eq(given: &[u8], expected: &[u8]) -> bool {
    let tag = |msg: &[u8]| {
        HmacSha256::new_from_slice(expected).map(|mut mac| {
            mac.update(msg);
            mac
        })
    };
    match (tag(given), tag(expected)) {
        (Ok(given), Ok(expected)) => given
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

fn auth_error(reason: &str) -> HandlerError {
    warn!(reason = %reason, "sense authentication failed");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "authentication failed", "reason": reason})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn hmac_accepts_matching_signature() {
        let body = br#"{"topic":"/devices/presence_sensor_1/events/presence"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            HeaderValue::from_str(&sign("s3cret", body)).unwrap(),
        );

        assert!(verify_hmac_sha256(&headers, body, Some("s3cret")).is_ok());
        assert!(verify_hmac_sha256(&headers, body, Some("other")).is_err());
        assert!(verify_hmac_sha256(&headers, b"tampered", Some("s3cret")).is_err());
    }

    #[test]
    fn hmac_requires_header_and_secret() {
        let headers = HeaderMap::new();
        assert!(verify_hmac_sha256(&headers, b"{}", Some("s3cret")).is_err());
        assert!(verify_hmac_sha256(&headers, b"{}", None).is_err());
    }

    #[test]
    fn bearer_token_checks() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        assert!(verify_bearer_token(&headers, Some("tok")).is_ok());
        assert!(verify_bearer_token(&headers, Some("nope")).is_err());

        headers.insert("authorization", HeaderValue::from_static("Basic tok"));
        assert!(verify_bearer_token(&headers, Some("tok")).is_err());
    }

    #[test]
    fn secret_comparison() {
        assert!(constant_time_eq(b"s3cret-token", b"s3cret-token"));
        assert!(!constant_time_eq(b"s3cret-tokem", b"s3cret-token"));
        assert!(!constant_time_eq(b"s3cret", b"s3cret-token"));
        assert!(!constant_time_eq(b"", b"s3cret-token"));
    }
}
