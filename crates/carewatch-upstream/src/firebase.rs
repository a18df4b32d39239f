//! Firebase Realtime Database source over the REST streaming API.
//!
//! `GET {database_url}/{path}.json` with `Accept: text/event-stream` yields
//! `put` / `patch` events relative to the watched location. Each event is
//! applied to a local [`JsonTree`] and the whole value is handed to the
//! watch callback, so callers always see a full snapshot.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header::ACCEPT, Client, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::UpstreamError;
use crate::source::{ChangeCallback, ChangeSource, WatchHandle};
use crate::sse::{parse_sse_line, LineBuffer, SseParsed};
use crate::tree::JsonTree;

/// Shortest delay between reconnect attempts, whatever the config says.
const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Characters the realtime database refuses in keys, plus URL delimiters.
const FORBIDDEN_KEY_CHARS: &[char] = &['.', '$', '#', '[', ']', '?', '\\', '%'];

#[derive(Debug, Clone)]
pub struct FirebaseOptions {
    pub database_url: String,
    pub auth_token: Option<String>,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

pub struct FirebaseSource {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
    reconnect_base: Duration,
    reconnect_max: Duration,
}

/// Body of a `put` or `patch` event.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    path: String,
    data: Value,
}

/// Why a single streaming connection ended.
enum StreamEnd {
    /// Connection dropped; reconnect.
    Disconnected,
    /// Server revoked the listen (`cancel` / `auth_revoked`); stop for good.
    Revoked,
}

impl FirebaseSource {
    pub fn new(options: FirebaseOptions) -> Result<Self, UpstreamError> {
        let base_url = Url::parse(options.database_url.trim_end_matches('/'))
            .map_err(|e| UpstreamError::Config(format!("invalid database_url: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(UpstreamError::Config(format!(
                "database_url must be http(s), got {}",
                base_url.scheme()
            )));
        }

        let reconnect_base = options.reconnect_base.max(MIN_RECONNECT_DELAY);
        Ok(Self {
            client: Client::new(),
            base_url,
            auth_token: options.auth_token,
            reconnect_base,
            reconnect_max: options.reconnect_max.max(reconnect_base),
        })
    }

    /// REST URL for a watched path, e.g. `.../sensetestPhoneLiveCalls.json`.
    ///
    /// Every `/`-separated part of `path` must be a plain database key; each
    /// is appended as its own percent-encoded segment, so nothing in `path`
    /// can reach the query string or climb out of the base URL.
    fn url_for(&self, path: &str) -> Result<Url, UpstreamError> {
        let rejected = |reason: String| UpstreamError::Rejected {
            path: path.to_string(),
            reason,
        };

        let keys: Vec<&str> = path.split('/').filter(|key| !key.is_empty()).collect();
        let Some((last, parents)) = keys.split_last() else {
            return Err(rejected("empty path".to_string()));
        };
        if let Some(bad) = keys.iter().find(|key| !is_database_key(key)) {
            return Err(rejected(format!("invalid key {bad:?}")));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| rejected("database_url cannot take a path".to_string()))?
            .pop_if_empty()
            .extend(parents)
            .push(&format!("{last}.json"));
        if let Some(token) = &self.auth_token {
            url.query_pairs_mut().append_pair("auth", token);
        }
        Ok(url)
    }
}

fn is_database_key(key: &str) -> bool {
    !key
        .chars()
        .any(|c| c.is_control() || FORBIDDEN_KEY_CHARS.contains(&c))
}

/// Next reconnect delay: doubled, capped at `max`.
fn next_delay(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

#[async_trait]
impl ChangeSource for FirebaseSource {
    fn name(&self) -> &str {
        "firebase"
    }

    async fn watch(
        &self,
        path: &str,
        on_change: ChangeCallback,
    ) -> Result<WatchHandle, UpstreamError> {
        let url = self.url_for(path)?;
        info!(path, "starting firebase listener");

        let task = tokio::spawn(listen(
            self.client.clone(),
            url,
            path.to_string(),
            on_change,
            self.reconnect_base,
            self.reconnect_max,
        ));

        let path = path.to_string();
        Ok(WatchHandle::new(move || {
            task.abort();
            info!(path = %path, "stopped firebase listener");
        }))
    }
}

/// Keep one streaming listen alive until revoked or aborted.
///
/// Reconnect delay starts at `reconnect_base`, doubles up to `reconnect_max`,
/// and resets after a successful connect.
async fn listen(
    client: Client,
    url: Url,
    path: String,
    on_change: ChangeCallback,
    reconnect_base: Duration,
    reconnect_max: Duration,
) {
    let mut delay = reconnect_base;

    loop {
        let response = client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                debug!(path = %path, "firebase stream connected");
                delay = reconnect_base;
                match consume(resp, &path, &on_change).await {
                    StreamEnd::Revoked => return,
                    StreamEnd::Disconnected => {
                        warn!(path = %path, "firebase stream disconnected");
                    }
                }
            }
            Ok(resp) => {
                warn!(path = %path, status = %resp.status(), "firebase stream refused");
            }
            Err(e) => {
                warn!(path = %path, error = %UpstreamError::from(e.without_url()), "firebase stream request failed");
            }
        }

        debug!(path = %path, retry_after_ms = delay.as_millis() as u64, "reconnecting");
        sleep(delay).await;
        delay = next_delay(delay, reconnect_max);
    }
}

async fn consume(resp: reqwest::Response, path: &str, on_change: &ChangeCallback) -> StreamEnd {
    let mut byte_stream = resp.bytes_stream();
    // A fresh stream starts with a root `put`, so local state restarts too.
    let mut decoder = StreamDecoder::default();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                warn!(path, error = %UpstreamError::from(e.without_url()), "firebase stream read failed");
                return StreamEnd::Disconnected;
            }
        };
        if let Some(end) = decoder.feed(&chunk, path, on_change) {
            return end;
        }
    }

    StreamEnd::Disconnected
}

/// Per-connection decoding state: partial lines, the pending event name
/// and the local copy of the watched value.
#[derive(Default)]
struct StreamDecoder {
    lines: LineBuffer,
    current_event: String,
    tree: JsonTree,
}

impl StreamDecoder {
    /// Feed one network chunk. Returns `Some` when the stream must end.
    fn feed(&mut self, chunk: &[u8], path: &str, on_change: &ChangeCallback) -> Option<StreamEnd> {
        for line in self.lines.push(chunk) {
            match parse_sse_line(&line) {
                Some(SseParsed::Event(ev)) => self.current_event = ev,
                Some(SseParsed::Data(data)) => {
                    let end = apply_event(&self.current_event, &data, path, &mut self.tree, on_change);
                    if end.is_some() {
                        return end;
                    }
                }
                None => {}
            }
        }
        None
    }
}

/// Apply one `event`/`data` pair. Returns `Some` when the stream must end.
fn apply_event(
    event: &str,
    data: &str,
    path: &str,
    tree: &mut JsonTree,
    on_change: &ChangeCallback,
) -> Option<StreamEnd> {
    match event {
        "put" | "patch" => {
            let parsed: StreamEvent = match serde_json::from_str(data) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(path, event, error = %UpstreamError::from(e), "skipping firebase event");
                    return None;
                }
            };
            if event == "put" {
                tree.put(&parsed.path, parsed.data);
            } else {
                tree.patch(&parsed.path, parsed.data);
            }
            on_change(tree.snapshot());
            None
        }
        "keep-alive" => None,
        "cancel" | "auth_revoked" => {
            warn!(path, event, reason = data, "firebase listen revoked");
            Some(StreamEnd::Revoked)
        }
        other => {
            debug!(path, event = other, "ignoring firebase event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Snapshot;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn options(url: &str) -> FirebaseOptions {
        FirebaseOptions {
            database_url: url.to_string(),
            auth_token: None,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(8),
        }
    }

    #[test]
    fn rejects_unusable_database_urls() {
        assert!(FirebaseSource::new(options("not a url")).is_err());
        assert!(FirebaseSource::new(options("ftp://db.example.com")).is_err());
    }

    #[test]
    fn builds_rest_url_with_auth() {
        let mut opts = options("https://db.example.com/");
        opts.auth_token = Some("tok".to_string());
        let source = FirebaseSource::new(opts).unwrap();

        let url = source.url_for("sensetestPhoneLiveCalls").unwrap();
        assert_eq!(
            url.as_str(),
            "https://db.example.com/sensetestPhoneLiveCalls.json?auth=tok"
        );
        assert!(source.url_for("/").is_err());
    }

    #[test]
    fn nested_paths_keep_base_prefix() {
        let source = FirebaseSource::new(options("https://db.example.com/tenant-a")).unwrap();
        let url = source.url_for("sites/SITE1/liveCalls").unwrap();
        assert_eq!(url.path(), "/tenant-a/sites/SITE1/liveCalls.json");
    }

    #[test]
    fn hostile_paths_never_reach_query_or_parent() {
        let mut opts = options("https://db.example.com");
        opts.auth_token = Some("SERVER_SECRET".to_string());
        let source = FirebaseSource::new(opts).unwrap();

        for path in [
            "users.json?x=PhoneLiveCalls",
            "../users/PhoneLiveCalls",
            "site#frag",
            "$priority",
            "a/[0]",
            "%2e%2e/users",
        ] {
            assert!(
                matches!(source.url_for(path), Err(UpstreamError::Rejected { .. })),
                "{path}"
            );
        }

        // Characters outside the forbidden set are escaped, never interpreted.
        let url = source.url_for("North Wing&x=1PhoneLiveCalls").unwrap();
        assert_eq!(url.path(), "/North%20Wing&x=1PhoneLiveCalls.json");
        assert_eq!(
            url.query_pairs().collect::<Vec<_>>(),
            vec![("auth".into(), "SERVER_SECRET".into())]
        );
    }

    #[test]
    fn reconnect_delay_is_clamped() {
        let mut opts = options("https://db.example.com");
        opts.reconnect_base = Duration::ZERO;
        opts.reconnect_max = Duration::ZERO;
        let source = FirebaseSource::new(opts).unwrap();
        assert_eq!(source.reconnect_base, MIN_RECONNECT_DELAY);
        assert_eq!(source.reconnect_max, MIN_RECONNECT_DELAY);

        assert_eq!(next_delay(Duration::from_secs(2), Duration::from_secs(60)), Duration::from_secs(4));
        assert_eq!(next_delay(Duration::from_secs(40), Duration::from_secs(60)), Duration::from_secs(60));
        assert_eq!(next_delay(Duration::MAX, Duration::MAX), Duration::MAX);
    }

    #[test]
    fn event_split_inside_a_character_is_still_applied() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let on_change: ChangeCallback = Arc::new(move |snap: Snapshot| sink.lock().unwrap().push(snap));

        let body = "event: put\ndata: {\"path\":\"/\",\"data\":{\"call1\":{\"carer\":\"Zoë\"}}}\n\n";
        let bytes = body.as_bytes();
        let split = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut decoder = StreamDecoder::default();
        assert!(decoder.feed(&bytes[..split], "p", &on_change).is_none());
        assert!(decoder.feed(&bytes[split..], "p", &on_change).is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], Some(json!({"call1": {"carer": "Zoë"}})));
    }

    #[test]
    fn put_and_patch_events_produce_full_snapshots() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let on_change: ChangeCallback = Arc::new(move |snap: Snapshot| sink.lock().unwrap().push(snap));
        let mut tree = JsonTree::default();

        let put = r#"{"path":"/","data":{"call1":{"room":"Room 1"}}}"#;
        assert!(apply_event("put", put, "p", &mut tree, &on_change).is_none());
        let patch = r#"{"path":"/call1","data":{"carer":"Sam"}}"#;
        assert!(apply_event("patch", patch, "p", &mut tree, &on_change).is_none());
        let clear = r#"{"path":"/","data":null}"#;
        assert!(apply_event("put", clear, "p", &mut tree, &on_change).is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], Some(json!({"call1": {"room": "Room 1", "carer": "Sam"}})));
        assert_eq!(seen[2], None);
    }

    #[test]
    fn keep_alive_and_cancel() {
        let on_change: ChangeCallback = Arc::new(|_: Snapshot| panic!("no snapshot expected"));
        let mut tree = JsonTree::default();

        assert!(apply_event("keep-alive", "null", "p", &mut tree, &on_change).is_none());
        assert!(matches!(
            apply_event("cancel", "permission denied", "p", &mut tree, &on_change),
            Some(StreamEnd::Revoked)
        ));
    }
}
