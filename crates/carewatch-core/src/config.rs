use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::SiteId;

pub const DEFAULT_PORT: u16 = 8189;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_WS_PATH: &str = "/ws";
pub const DEFAULT_PATH_TEMPLATE: &str = "{site}PhoneLiveCalls";
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024; // 64 KB hard cap per inbound frame
pub const CLIENT_CHANNEL_CAPACITY: usize = 256; // outbound frames buffered per connection
pub const MAX_SENSE_EVENTS: usize = 50; // sensor readings kept per watched site

/// Top-level config (carewatch.toml + CAREWATCH_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarewatchConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub sense: SenseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Browser origins allowed by CORS. Empty means any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            ws_path: DEFAULT_WS_PATH.to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Which realtime store feeds the per-site watches.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamKind {
    /// In-process source with no external store (development and tests).
    #[default]
    Memory,
    /// Firebase Realtime Database REST streaming.
    Firebase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub kind: UpstreamKind,
    /// e.g. `https://<project>.europe-west1.firebasedatabase.app`
    pub database_url: Option<String>,
    /// Database secret or ID token appended as `?auth=`.
    pub auth_token: Option<String>,
    /// Store path watched for a site; `{site}` is replaced by the site id.
    #[serde(default = "default_path_template")]
    pub path_template: String,
    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            kind: UpstreamKind::default(),
            database_url: None,
            auth_token: None,
            path_template: default_path_template(),
            reconnect_base_secs: default_reconnect_base_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

impl UpstreamConfig {
    /// Store path watched for `site_id`.
    pub fn path_for(&self, site_id: &SiteId) -> String {
        self.path_template.replace("{site}", site_id.as_str())
    }
}

/// Authentication mode for the sensor ingest webhook.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SenseAuthMode {
    /// HMAC-SHA256 over the raw request body (`X-Hub-Signature-256: sha256=<hex>`).
    HmacSha256,
    /// Static bearer token in the Authorization header.
    #[default]
    BearerToken,
    /// No authentication. Use only behind a trusted MQTT bridge.
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenseConfig {
    /// When false, POST /webhooks/sense/{site} returns 404.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auth_mode: SenseAuthMode,
    pub secret: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_ws_path() -> String {
    DEFAULT_WS_PATH.to_string()
}
fn default_path_template() -> String {
    DEFAULT_PATH_TEMPLATE.to_string()
}
fn default_reconnect_base_secs() -> u64 {
    2
}
fn default_reconnect_max_secs() -> u64 {
    60
}

impl CarewatchConfig {
    /// Load config from a TOML file with CAREWATCH_* env var overrides.
    ///
    /// Nested keys use a double underscore: `CAREWATCH_GATEWAY__PORT=9000`.
    /// Without an explicit path, `~/.carewatch/carewatch.toml` is used; a
    /// missing file just yields defaults plus env overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CarewatchError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CAREWATCH_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.carewatch/carewatch.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CarewatchConfig::default();
        assert_eq!(config.gateway.port, 8189);
        assert_eq!(config.gateway.ws_path, "/ws");
        assert_eq!(config.upstream.kind, UpstreamKind::Memory);
        assert!(!config.sense.enabled);
    }

    #[test]
    fn path_template_substitutes_site() {
        let upstream = UpstreamConfig::default();
        assert_eq!(
            upstream.path_for(&SiteId::from("sensetest")),
            "sensetestPhoneLiveCalls"
        );

        let custom = UpstreamConfig {
            path_template: "sites/{site}/calls".to_string(),
            ..UpstreamConfig::default()
        };
        assert_eq!(custom.path_for(&SiteId::from("SITE1")), "sites/SITE1/calls");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: CarewatchConfig = Figment::new()
            .merge(Toml::string(
                r#"
                [upstream]
                kind = "firebase"
                database_url = "https://example.firebasedatabase.app"

                [sense]
                enabled = true
                auth_mode = "hmac-sha256"
                secret = "s3cret"
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(config.upstream.kind, UpstreamKind::Firebase);
        assert_eq!(config.upstream.path_template, DEFAULT_PATH_TEMPLATE);
        assert_eq!(config.upstream.reconnect_max_secs, 60);
        assert_eq!(config.sense.auth_mode, SenseAuthMode::HmacSha256);
        assert_eq!(config.gateway.port, DEFAULT_PORT);
    }
}
