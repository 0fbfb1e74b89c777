//! The zone-aggregation bus: registry of backends, zone cache, prefix
//! routing, change token and activity log.
//!
//! The bus is the single serialization point between external surfaces (HTTP,
//! MQTT, MCP, hardware knobs) and the backend adapters. Writers snapshot the
//! registry and never hold the cache lock across a backend call.

pub mod activity;
pub mod error;
pub mod events;
pub mod types;

pub use activity::{ActivityEntry, ActivityKind, ActivityLog};
pub use error::BridgeError;
pub use events::{create_events, BridgeEvent, EventStream, SharedEvents};
pub use types::{
    CapabilityTag, ImageData, ImageQuery, NowPlaying, PlaybackState, VolumeControl, VolumeType,
    Zone, ZoneId,
};

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapters::traits::{Backend, Capabilities, ControlCommand};

/// Activity observer. Errors are caught and logged, never propagated.
pub type Observer = Box<dyn Fn(&ActivityEntry) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

struct BackendEntry {
    backend: Arc<dyn Backend>,
    capabilities: Capabilities,
}

struct CachedZone {
    zone: Zone,
    backend: Arc<dyn Backend>,
}

#[derive(Default)]
struct CacheState {
    zones: HashMap<String, CachedZone>,
    /// Lazily recomputed after invalidation.
    sha: Option<String>,
}

pub struct ZoneBus {
    backends: RwLock<HashMap<String, BackendEntry>>,
    cache: RwLock<CacheState>,
    activity: ActivityLog,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_observer_id: AtomicU64,
    events: SharedEvents,
}

impl ZoneBus {
    pub fn new(events: SharedEvents) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            cache: RwLock::new(CacheState::default()),
            activity: ActivityLog::new(),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            events,
        }
    }

    pub fn events(&self) -> &SharedEvents {
        &self.events
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Register a backend under its prefix without touching the cache (the
    /// backend may still be starting).
    pub async fn register_backend(
        &self,
        prefix: &str,
        backend: Arc<dyn Backend>,
    ) -> Result<(), BridgeError> {
        if prefix.is_empty() {
            return Err(BridgeError::BadRequest("backend prefix must be nonempty".into()));
        }
        if prefix.contains(':') {
            return Err(BridgeError::BadRequest(format!(
                "backend prefix '{}' must not contain ':'",
                prefix
            )));
        }
        if backend.prefix() != prefix {
            return Err(BridgeError::BadRequest(format!(
                "backend declares prefix '{}' but was registered as '{}'",
                backend.prefix(),
                prefix
            )));
        }

        let mut backends = self.backends.write().await;
        if backends.contains_key(prefix) {
            return Err(BridgeError::BadRequest(format!(
                "prefix '{}' already registered",
                prefix
            )));
        }
        let capabilities = backend.capabilities();
        backends.insert(prefix.to_string(), BackendEntry { backend, capabilities });
        info!("Registered backend: {}", prefix);
        Ok(())
    }

    /// Stop a backend, then flush every zone carrying its prefix.
    pub async fn unregister_backend(&self, prefix: &str) -> Result<(), BridgeError> {
        let entry = {
            let mut backends = self.backends.write().await;
            backends
                .remove(prefix)
                .ok_or_else(|| BridgeError::NoAdapter(prefix.to_string()))?
        };

        // Await shutdown with no locks held.
        entry.backend.stop().await;

        let removed = {
            let mut cache = self.cache.write().await;
            let ids: Vec<String> = cache
                .zones
                .keys()
                .filter(|id| ZoneId::from(id.as_str()).has_prefix(prefix))
                .cloned()
                .collect();
            for id in &ids {
                cache.zones.remove(id);
            }
            if !ids.is_empty() {
                cache.sha = None;
            }
            ids.len()
        };

        info!("Unregistered backend {} ({} zone(s) flushed)", prefix, removed);
        self.events.publish(BridgeEvent::ZoneSetChanged {
            prefix: prefix.to_string(),
        });
        Ok(())
    }

    /// Register, start, and pull the initial zone list. Start errors are
    /// logged but leave the registration in place so a configured-but-offline
    /// backend shows up as connecting rather than absent.
    pub async fn enable_backend(
        &self,
        prefix: &str,
        backend: Arc<dyn Backend>,
    ) -> Result<(), BridgeError> {
        self.register_backend(prefix, backend.clone()).await?;
        if let Err(e) = backend.start().await {
            warn!("Backend {} failed to start: {}", prefix, e);
        }
        self.refresh_zones(Some(prefix)).await;
        Ok(())
    }

    pub async fn registered_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.backends.read().await.keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    // =========================================================================
    // Zone cache
    // =========================================================================

    /// Re-pull zones for one prefix, or rebuild the whole cache when `None`.
    ///
    /// Backend calls happen with no lock held; the cache lock is taken only
    /// for the swap.
    pub async fn refresh_zones(&self, prefix: Option<&str>) {
        match prefix {
            Some(p) => {
                let backend = {
                    let backends = self.backends.read().await;
                    match backends.get(p) {
                        Some(entry) => entry.backend.clone(),
                        None => {
                            debug!("refresh_zones: no backend for prefix '{}'", p);
                            return;
                        }
                    }
                };
                let zones = Self::checked_zones(p, backend.get_zones().await);

                let mut cache = self.cache.write().await;
                let stale: Vec<String> = cache
                    .zones
                    .keys()
                    .filter(|id| ZoneId::from(id.as_str()).has_prefix(p))
                    .cloned()
                    .collect();
                for id in stale {
                    cache.zones.remove(&id);
                }
                for zone in zones {
                    cache.zones.insert(
                        zone.zone_id.as_str().to_string(),
                        CachedZone {
                            zone,
                            backend: backend.clone(),
                        },
                    );
                }
                cache.sha = None;
            }
            None => {
                let snapshot: Vec<(String, Arc<dyn Backend>)> = {
                    let backends = self.backends.read().await;
                    backends
                        .iter()
                        .map(|(p, e)| (p.clone(), e.backend.clone()))
                        .collect()
                };

                let mut fresh: Vec<(Zone, Arc<dyn Backend>)> = Vec::new();
                for (p, backend) in snapshot {
                    for zone in Self::checked_zones(&p, backend.get_zones().await) {
                        fresh.push((zone, backend.clone()));
                    }
                }

                let mut cache = self.cache.write().await;
                cache.zones.clear();
                for (zone, backend) in fresh {
                    cache
                        .zones
                        .insert(zone.zone_id.as_str().to_string(), CachedZone { zone, backend });
                }
                cache.sha = None;
            }
        }
    }

    /// Drop zones whose id does not carry the owning prefix.
    fn checked_zones(prefix: &str, zones: Vec<Zone>) -> Vec<Zone> {
        zones
            .into_iter()
            .filter(|z| {
                let ok = z.zone_id.has_prefix(prefix);
                if !ok {
                    warn!(
                        "Backend '{}' returned zone '{}' outside its prefix, dropping",
                        prefix, z.zone_id
                    );
                }
                ok
            })
            .collect()
    }

    /// All cached zones. When the cache is empty but backends are registered
    /// (late-pairing cores), a full refresh runs first.
    pub async fn get_zones(&self) -> Vec<Zone> {
        let needs_refresh = {
            let cache = self.cache.read().await;
            cache.zones.is_empty() && !self.backends.read().await.is_empty()
        };
        if needs_refresh {
            self.refresh_zones(None).await;
        }

        let cache = self.cache.read().await;
        let mut zones: Vec<Zone> = cache.zones.values().map(|c| c.zone.clone()).collect();
        zones.sort_by(|a, b| a.zone_id.as_str().cmp(b.zone_id.as_str()));
        zones
    }

    pub async fn get_zone(&self, zone_id: &str) -> Option<Zone> {
        self.cache.read().await.zones.get(zone_id).map(|c| c.zone.clone())
    }

    pub async fn zone_count(&self) -> usize {
        self.cache.read().await.zones.len()
    }

    /// First 8 hex chars of SHA-256 over the JSON-encoded sorted zone-id list.
    /// Stable while the id set is stable; recomputed lazily after changes.
    pub async fn get_zones_sha(&self) -> String {
        {
            let cache = self.cache.read().await;
            if let Some(ref sha) = cache.sha {
                return sha.clone();
            }
        }
        let mut cache = self.cache.write().await;
        if let Some(ref sha) = cache.sha {
            return sha.clone();
        }
        let sha = Self::compute_sha(cache.zones.keys());
        cache.sha = Some(sha.clone());
        sha
    }

    fn compute_sha<'a>(ids: impl Iterator<Item = &'a String>) -> String {
        let mut keys: Vec<&str> = ids.map(|s| s.as_str()).collect();
        keys.sort_unstable();
        let encoded = serde_json::to_string(&keys).unwrap_or_default();
        let digest = Sha256::digest(encoded.as_bytes());
        hex::encode(&digest[..4])
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Resolve a zone id to its owning backend: cached pairing first, then
    /// prefix fallback for zones a command reaches before discovery does.
    async fn resolve(&self, zone_id: &str) -> Result<Arc<dyn Backend>, BridgeError> {
        if let Some(cached) = self.cache.read().await.zones.get(zone_id) {
            return Ok(cached.backend.clone());
        }

        let id = ZoneId::from(zone_id);
        let prefix = id.prefix();
        if prefix.is_empty() || prefix == zone_id {
            return Err(BridgeError::ZoneNotFound(zone_id.to_string()));
        }
        let backends = self.backends.read().await;
        match backends.get(prefix) {
            Some(entry) => Ok(entry.backend.clone()),
            None => Err(BridgeError::NoAdapter(prefix.to_string())),
        }
    }

    /// Routed now-playing query. Exactly one activity entry per call.
    pub async fn get_now_playing(
        &self,
        zone_id: &str,
        sender: Option<&str>,
    ) -> Result<NowPlaying, BridgeError> {
        let mut entry = ActivityEntry::new(ActivityKind::GetNowPlaying, Some(zone_id)).with_sender(sender);

        let backend = match self.resolve(zone_id).await {
            Ok(b) => b,
            Err(e) => {
                entry = entry.with_error(e.kind()).with_result(false);
                self.record_and_notify(entry);
                return Err(e);
            }
        };

        let native = ZoneId::from(zone_id).native_id().to_string();
        match backend.get_now_playing(&native).await {
            Some(np) => {
                entry = entry.with_result(true);
                self.record_and_notify(entry);
                Ok(np)
            }
            None => {
                let e = BridgeError::ZoneNotFound(zone_id.to_string());
                entry = entry.with_error(e.kind()).with_result(false);
                self.record_and_notify(entry);
                Err(e)
            }
        }
    }

    /// Routed command. The activity entry is recorded before dispatch so a
    /// hung or failed backend still leaves a trace; the entry is amended with
    /// the outcome afterwards.
    pub async fn control(
        &self,
        zone_id: &str,
        action: &str,
        value: Option<&serde_json::Value>,
        sender: Option<&str>,
    ) -> Result<(), BridgeError> {
        let mut entry = ActivityEntry::new(ActivityKind::Control, Some(zone_id))
            .with_action(action, value)
            .with_sender(sender);
        let token = self.activity.record(entry.clone());

        let fail = |this: &Self, mut entry: ActivityEntry, e: BridgeError| {
            this.activity.mark_error(token, e.kind());
            entry = entry.with_error(e.kind()).with_result(false);
            this.notify_observers(&entry);
            Err(e)
        };

        let command = match ControlCommand::parse(action, value) {
            Ok(c) => c,
            Err(e) => return fail(self, entry, e),
        };

        let backend = match self.resolve(zone_id).await {
            Ok(b) => b,
            Err(e) => return fail(self, entry, e),
        };

        // Absolute volume is validated against the zone's declared range in
        // its own scale; -12 on a dB zone stays -12. Out of range is the
        // caller's mistake, clamping inside the range is the backend's job.
        if let ControlCommand::VolumeAbsolute(v) = command {
            if let Some(zone) = self.get_zone(zone_id).await {
                if let Some(ref vc) = zone.volume_control {
                    if v < vc.min || v > vc.max {
                        let e = BridgeError::BadRequest(format!(
                            "volume {} outside declared range {}..{}",
                            v, vc.min, vc.max
                        ));
                        return fail(self, entry, e);
                    }
                }
            }
        }

        let native = ZoneId::from(zone_id).native_id().to_string();
        match backend.control(&native, command).await {
            Ok(()) => {
                self.activity.mark_ok(token);
                entry = entry.with_result(true);
                self.notify_observers(&entry);
                Ok(())
            }
            Err(e) => fail(self, entry, e),
        }
    }

    /// Routed image fetch. `zone_id` is mandatory for routing; a backend
    /// without image capability answers `Unsupported`.
    pub async fn get_image(
        &self,
        image_key: &str,
        query: &ImageQuery,
        sender: Option<&str>,
    ) -> Result<ImageData, BridgeError> {
        let zone_id = query.zone_id.clone();
        let mut entry =
            ActivityEntry::new(ActivityKind::GetImage, zone_id.as_deref()).with_sender(sender);

        let finish_err = |this: &Self, mut entry: ActivityEntry, e: BridgeError| {
            entry = entry.with_error(e.kind()).with_result(false);
            this.record_and_notify(entry);
            Err(e)
        };

        let Some(zone_id) = zone_id else {
            return finish_err(
                self,
                entry,
                BridgeError::BadRequest("zone_id is required for image routing".into()),
            );
        };

        let backend = match self.resolve(&zone_id).await {
            Ok(b) => b,
            Err(e) => return finish_err(self, entry, e),
        };

        let prefix = ZoneId::from(zone_id.as_str()).prefix().to_string();
        let has_images = {
            let backends = self.backends.read().await;
            backends.get(&prefix).map(|e| e.capabilities.images).unwrap_or(false)
        };
        if !has_images {
            return finish_err(
                self,
                entry,
                BridgeError::Unsupported(format!("backend '{}' serves no images", prefix)),
            );
        }

        match backend.get_image(image_key, query).await {
            Ok(data) => {
                entry = entry.with_result(true);
                self.record_and_notify(entry);
                Ok(data)
            }
            Err(e) => finish_err(self, entry, e),
        }
    }

    /// Diagnostic status per registered backend.
    pub async fn get_status(&self) -> serde_json::Value {
        let snapshot: Vec<(String, Arc<dyn Backend>, Capabilities)> = {
            let backends = self.backends.read().await;
            backends
                .iter()
                .map(|(p, e)| (p.clone(), e.backend.clone(), e.capabilities))
                .collect()
        };

        let mut out = serde_json::Map::new();
        for (prefix, backend, caps) in snapshot {
            let status = backend.get_status().await;
            let zone_count = {
                let cache = self.cache.read().await;
                cache
                    .zones
                    .keys()
                    .filter(|id| ZoneId::from(id.as_str()).has_prefix(&prefix))
                    .count()
            };
            out.insert(
                prefix,
                serde_json::json!({
                    "status": status,
                    "images": caps.images,
                    "zone_count": zone_count,
                }),
            );
        }
        serde_json::Value::Object(out)
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Register an activity observer. Best-effort synchronous fan-out;
    /// observer errors are logged and never propagate.
    pub fn subscribe(&self, observer: Observer) -> ObserverId {
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut observers) = self.observers.lock() {
            observers.push((id, observer));
        }
        ObserverId(id)
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.retain(|(oid, _)| *oid != id.0);
        }
    }

    fn record_and_notify(&self, entry: ActivityEntry) {
        self.activity.record(entry.clone());
        self.notify_observers(&entry);
    }

    fn notify_observers(&self, entry: &ActivityEntry) {
        let Ok(observers) = self.observers.lock() else {
            return;
        };
        for (id, observer) in observers.iter() {
            if let Err(e) = observer(entry) {
                warn!("Activity observer {} failed: {}", id, e);
            }
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Listen for zone-set-change notifications from adapters and refresh the
    /// matching slice of the cache. Runs until `ShuttingDown`.
    pub async fn run_event_loop(self: Arc<Self>) {
        let mut rx = self.events.subscribe();
        info!("Zone bus event loop started");
        loop {
            match rx.recv().await {
                Ok(BridgeEvent::ZoneSetChanged { prefix }) => {
                    debug!("Zone set changed: {}", prefix);
                    self.refresh_zones(Some(&prefix)).await;
                }
                Ok(BridgeEvent::BackendDisconnected { prefix, .. }) => {
                    self.refresh_zones(Some(&prefix)).await;
                }
                Ok(BridgeEvent::ShuttingDown) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Bus event loop lagged by {} events, full refresh", n);
                    self.refresh_zones(None).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Zone bus event loop stopped");
    }
}
