//! Site subscription registry.
//!
//! One entry per watched site: the connections interested in it, the single
//! upstream watch feeding it, and its last-known live state. An entry exists
//! exactly while it has at least one subscriber.
//!
//! All bookkeeping happens under one mutex and never across an `.await`.
//! The only suspension point is establishing the upstream watch, and the
//! entry is reserved before that starts, so concurrent first subscribers to
//! a site share one watch.

use carewatch_core::config::UpstreamConfig;
use carewatch_core::types::{ConnId, LiveState, SenseEvent, SiteId};
use carewatch_protocol::ServerMessage;
use carewatch_upstream::{ChangeCallback, ChangeSource, Snapshot, WatchHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::ws::send::ConnectionHandle;

struct SiteEntry {
    /// Distinguishes this entry from earlier entries for the same site, so a
    /// late callback or setup result from a torn-down watch is ignored.
    generation: u64,
    subscribers: HashMap<ConnId, ConnectionHandle>,
    /// `None` while the upstream watch is still being established.
    watch: Option<WatchHandle>,
    live_state: LiveState,
}

impl SiteEntry {
    fn new(generation: u64, first: &ConnectionHandle) -> Self {
        let mut subscribers = HashMap::new();
        subscribers.insert(first.id.clone(), first.clone());
        Self {
            generation,
            subscribers,
            watch: None,
            live_state: LiveState::default(),
        }
    }

    /// Push the current live state to every subscriber. Serialized once.
    fn broadcast(&self, site_id: &SiteId) {
        let frame = ServerMessage::update(site_id, &self.live_state).to_json();
        for conn in self.subscribers.values() {
            conn.send_raw(frame.clone());
        }
    }
}

struct Inner {
    source: Arc<dyn ChangeSource>,
    upstream: UpstreamConfig,
    sites: Mutex<HashMap<SiteId, SiteEntry>>,
    next_generation: AtomicU64,
}

impl Inner {
    fn sites(&self) -> MutexGuard<'_, HashMap<SiteId, SiteEntry>> {
        self.sites.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_snapshot(&self, site_id: &SiteId, generation: u64, snapshot: Snapshot) {
        let mut sites = self.sites();
        let Some(entry) = sites
            .get_mut(site_id)
            .filter(|entry| entry.generation == generation)
        else {
            debug!(site_id = %site_id, "push for unwatched site dropped");
            return;
        };

        entry.live_state.replace_live_calls(snapshot);
        debug!(
            site_id = %site_id,
            calls = entry.live_state.live_calls.len(),
            subscribers = entry.subscribers.len(),
            "fan-out"
        );
        entry.broadcast(site_id);
    }

    /// Remove an entry whose watch never got established.
    fn rollback(&self, site_id: &SiteId, generation: u64) -> Option<SiteEntry> {
        let mut sites = self.sites();
        let reserved = sites
            .get(site_id)
            .is_some_and(|entry| entry.generation == generation && entry.watch.is_none());
        if reserved {
            sites.remove(site_id)
        } else {
            None
        }
    }
}

/// Rolls the reserved entry back if `attach` is dropped mid-setup.
struct PendingWatch<'a> {
    inner: &'a Inner,
    site_id: &'a SiteId,
    generation: u64,
    armed: bool,
}

impl Drop for PendingWatch<'_> {
    fn drop(&mut self) {
        if self.armed && self.inner.rollback(self.site_id, self.generation).is_some() {
            debug!(site_id = %self.site_id, "watch setup abandoned, entry rolled back");
        }
    }
}

/// Process-wide site → subscribers map. Construct one per server (or test)
/// and share it behind an `Arc`.
pub struct SiteRegistry {
    inner: Arc<Inner>,
}

impl SiteRegistry {
    pub fn new(source: Arc<dyn ChangeSource>, upstream: UpstreamConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                upstream,
                sites: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Upstream path watched for `site_id`.
    pub fn path_for(&self, site_id: &SiteId) -> String {
        self.inner.upstream.path_for(site_id)
    }

    /// Add `conn` to the site's subscribers, creating the entry and its
    /// upstream watch on first use, then acknowledge with
    /// `{ "message": "Subscribed to <site>" }`.
    ///
    /// Adding a connection that is already subscribed is a no-op apart from
    /// the acknowledgement. If the watch cannot be established the entry is
    /// removed again and the error returned; the caller reports it.
    pub async fn attach(
        &self,
        site_id: &SiteId,
        conn: &ConnectionHandle,
    ) -> Result<(), RegistryError> {
        let generation = {
            let mut sites = self.inner.sites();
            if let Some(entry) = sites.get_mut(site_id) {
                entry.subscribers.insert(conn.id.clone(), conn.clone());
                drop(sites);
                debug!(conn_id = %conn.id, site_id = %site_id, "joined watched site");
                conn.send(&ServerMessage::subscribed(site_id));
                return Ok(());
            }

            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            sites.insert(site_id.clone(), SiteEntry::new(generation, conn));
            generation
        };

        let path = self.path_for(site_id);
        let mut pending = PendingWatch {
            inner: &self.inner,
            site_id,
            generation,
            armed: true,
        };
        let result = self
            .inner
            .source
            .watch(&path, self.fan_out(site_id.clone(), generation))
            .await;
        pending.armed = false;

        match result {
            Ok(watch) => {
                let stale = {
                    let mut sites = self.inner.sites();
                    match sites.get_mut(site_id) {
                        Some(entry) if entry.generation == generation => {
                            entry.watch = Some(watch);
                            None
                        }
                        _ => Some(watch),
                    }
                };
                if let Some(watch) = stale {
                    // Every subscriber left while the watch was being set up.
                    watch.unwatch();
                    debug!(site_id = %site_id, "site emptied during watch setup");
                    return Ok(());
                }

                info!(
                    site_id = %site_id,
                    path = %path,
                    source = self.inner.source.name(),
                    "watching site"
                );
                conn.send(&ServerMessage::subscribed(site_id));
                Ok(())
            }
            Err(source) => {
                if let Some(entry) = self.inner.rollback(site_id, generation) {
                    // Connections that joined while setup was in flight were
                    // already acknowledged; tell them it did not work out.
                    for (id, other) in &entry.subscribers {
                        if *id != conn.id {
                            other.send(&ServerMessage::subscription_failed(site_id));
                        }
                    }
                }
                warn!(site_id = %site_id, path = %path, error = %source, "upstream watch failed");
                Err(RegistryError::Watch {
                    site_id: site_id.clone(),
                    source,
                })
            }
        }
    }

    /// Explicit unsubscribe: remove `conn` from the site and acknowledge with
    /// `{ "message": "Unsubscribed from <site>" }` if the site was watched.
    pub fn detach(&self, site_id: &SiteId, conn: &ConnectionHandle) {
        if self.release(site_id, &conn.id) {
            conn.send(&ServerMessage::unsubscribed(site_id));
        }
    }

    /// Remove `conn_id` from one site without acknowledging.
    /// Returns whether the site had an entry.
    pub fn release(&self, site_id: &SiteId, conn_id: &ConnId) -> bool {
        let emptied = {
            let mut sites = self.inner.sites();
            let Some(entry) = sites.get_mut(site_id) else {
                return false;
            };
            entry.subscribers.remove(conn_id);
            if !entry.subscribers.is_empty() {
                return true;
            }
            sites.remove(site_id)
        };

        if let Some(entry) = emptied {
            teardown(site_id, entry);
        }
        true
    }

    /// Disconnect cleanup: remove `conn_id` from every site, silently.
    /// Safe to call any number of times.
    pub fn detach_all(&self, conn_id: &ConnId) {
        let emptied: Vec<(SiteId, SiteEntry)> = {
            let mut sites = self.inner.sites();
            let empty_ids: Vec<SiteId> = sites
                .iter_mut()
                .filter_map(|(site_id, entry)| {
                    let removed = entry.subscribers.remove(conn_id).is_some();
                    (removed && entry.subscribers.is_empty()).then(|| site_id.clone())
                })
                .collect();
            empty_ids
                .into_iter()
                .filter_map(|id| sites.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (site_id, entry) in emptied {
            teardown(&site_id, entry);
        }
    }

    /// Append a sensor event to a watched site's live state and fan out the
    /// whole state. Returns false (event dropped) if nobody watches the site.
    pub fn push_sense_event(&self, site_id: &SiteId, event: SenseEvent) -> bool {
        let mut sites = self.inner.sites();
        let Some(entry) = sites.get_mut(site_id) else {
            return false;
        };
        entry.live_state.record_sense_event(event);
        entry.broadcast(site_id);
        true
    }

    pub fn site_count(&self) -> usize {
        self.inner.sites().len()
    }

    pub fn subscriber_count(&self, site_id: &SiteId) -> usize {
        self.inner
            .sites()
            .get(site_id)
            .map_or(0, |entry| entry.subscribers.len())
    }

    pub fn is_watched(&self, site_id: &SiteId) -> bool {
        self.inner.sites().contains_key(site_id)
    }

    /// Upstream callback for one entry. Holds only a weak reference so a
    /// lingering watch never keeps the registry alive.
    fn fan_out(&self, site_id: SiteId, generation: u64) -> ChangeCallback {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |snapshot: Snapshot| {
            if let Some(inner) = inner.upgrade() {
                inner.apply_snapshot(&site_id, generation, snapshot);
            }
        })
    }
}

/// Cancel the upstream watch of an entry that just lost its last subscriber.
fn teardown(site_id: &SiteId, entry: SiteEntry) {
    match entry.watch {
        Some(watch) => watch.unwatch(),
        // Setup still in flight; `attach` cancels the watch when it lands.
        None => debug!(site_id = %site_id, "entry removed before watch was established"),
    }
    info!(site_id = %site_id, "stopped watching site");
}
