//! Settings-driven backend lifecycle.
//!
//! The coordinator owns the catalog of constructible backends (prefix →
//! factory) and reconciles the set of registered backends against the user's
//! adapter toggles: disables unregister (flushing zones), enables register +
//! start + initial refresh. A backend that fails to start stays registered so
//! it shows up as connecting rather than absent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::adapters::traits::Backend;
use crate::bus::ZoneBus;
use crate::settings::AdapterToggles;

pub type BackendFactory = Box<dyn Fn() -> Arc<dyn Backend> + Send + Sync>;

pub struct AdapterCoordinator {
    bus: Arc<ZoneBus>,
    factories: HashMap<String, BackendFactory>,
    active: RwLock<HashSet<String>>,
}

impl AdapterCoordinator {
    pub fn new(bus: Arc<ZoneBus>) -> Self {
        Self {
            bus,
            factories: HashMap::new(),
            active: RwLock::new(HashSet::new()),
        }
    }

    /// Declare a constructible backend. Call before `start_all`.
    pub fn register_factory(&mut self, prefix: &str, factory: BackendFactory) {
        self.factories.insert(prefix.to_string(), factory);
    }

    pub fn known_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.factories.keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    pub async fn active_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.active.read().await.iter().cloned().collect();
        prefixes.sort();
        prefixes
    }

    /// Bring up every enabled backend from the catalog.
    pub async fn start_all(&self, toggles: &AdapterToggles) {
        for (prefix, factory) in &self.factories {
            if !toggles.enabled(prefix) {
                info!("Backend {} disabled", prefix);
                continue;
            }
            self.enable(prefix, factory).await;
        }
    }

    /// Reconcile running backends with new settings. Disables complete (zones
    /// flushed) before this returns; enables likewise register and start.
    pub async fn on_settings_changed(&self, toggles: &AdapterToggles) {
        let currently_active = self.active.read().await.clone();

        for prefix in &currently_active {
            if !toggles.enabled(prefix) {
                info!("Backend {} disabled by settings", prefix);
                if let Err(e) = self.bus.unregister_backend(prefix).await {
                    warn!("Failed to unregister {}: {}", prefix, e);
                }
                self.active.write().await.remove(prefix);
            }
        }

        for (prefix, factory) in &self.factories {
            if toggles.enabled(prefix) && !currently_active.contains(prefix) {
                info!("Backend {} enabled by settings", prefix);
                self.enable(prefix, factory).await;
            }
        }
    }

    async fn enable(&self, prefix: &str, factory: &BackendFactory) {
        match self.bus.enable_backend(prefix, factory()).await {
            Ok(()) => {
                self.active.write().await.insert(prefix.to_string());
            }
            Err(e) => warn!("Failed to enable backend {}: {}", prefix, e),
        }
    }

    /// Unregister every active backend (process shutdown).
    pub async fn shutdown(&self) {
        let active = self.active.read().await.clone();
        for prefix in active {
            if let Err(e) = self.bus.unregister_backend(&prefix).await {
                warn!("Shutdown of {} failed: {}", prefix, e);
            }
        }
        self.active.write().await.clear();
        info!("Coordinator shutdown complete");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::adapters::traits::{Capabilities, ControlCommand};
    use crate::bus::{create_events, BridgeError, NowPlaying, PlaybackState, Zone, ZoneId};
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    struct StaticBackend {
        prefix: String,
        zone_names: Vec<(String, String)>,
        fail_start: bool,
    }

    #[async_trait]
    impl Backend for StaticBackend {
        fn prefix(&self) -> &str {
            &self.prefix
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn start(&self) -> Result<(), BridgeError> {
            if self.fail_start {
                Err(BridgeError::Unreachable("simulated".into()))
            } else {
                Ok(())
            }
        }

        async fn stop(&self) {}

        async fn get_zones(&self) -> Vec<Zone> {
            self.zone_names
                .iter()
                .map(|(native, name)| Zone {
                    zone_id: ZoneId::join(&self.prefix, native),
                    zone_name: name.clone(),
                    state: PlaybackState::Stopped,
                    output_name: None,
                    device_name: None,
                    volume_control: None,
                    unsupported: BTreeSet::new(),
                })
                .collect()
        }

        async fn get_now_playing(&self, _native_id: &str) -> Option<NowPlaying> {
            None
        }

        async fn control(
            &self,
            _native_id: &str,
            _command: ControlCommand,
        ) -> Result<(), BridgeError> {
            Ok(())
        }

        async fn get_status(&self) -> serde_json::Value {
            serde_json::json!({})
        }
    }

    fn coordinator_with(
        bus: &Arc<ZoneBus>,
        specs: Vec<(&'static str, Vec<(&'static str, &'static str)>, bool)>,
    ) -> AdapterCoordinator {
        let mut coordinator = AdapterCoordinator::new(bus.clone());
        for (prefix, zones, fail_start) in specs {
            let zones: Vec<(String, String)> = zones
                .into_iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect();
            coordinator.register_factory(
                prefix,
                Box::new(move || -> Arc<dyn Backend> {
                    Arc::new(StaticBackend {
                        prefix: prefix.to_string(),
                        zone_names: zones.clone(),
                        fail_start,
                    })
                }),
            );
        }
        coordinator
    }

    #[tokio::test]
    async fn start_all_respects_toggles() {
        let bus = Arc::new(ZoneBus::new(create_events()));
        let coordinator = coordinator_with(
            &bus,
            vec![
                ("roon", vec![("z1", "Living Room")], false),
                ("lms", vec![("p1", "Kitchen")], false),
            ],
        );

        // Defaults: roon on, lms off.
        coordinator.start_all(&AdapterToggles::default()).await;
        assert_eq!(coordinator.active_prefixes().await, vec!["roon"]);
        let zones = bus.get_zones().await;
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].zone_id.as_str(), "roon:z1");
    }

    #[tokio::test]
    async fn disable_flushes_zones_and_changes_sha() {
        let bus = Arc::new(ZoneBus::new(create_events()));
        let coordinator = coordinator_with(
            &bus,
            vec![("roon", vec![("z1", "A"), ("z2", "B")], false)],
        );
        coordinator.start_all(&AdapterToggles::default()).await;
        assert_eq!(bus.zone_count().await, 2);
        let sha_before = bus.get_zones_sha().await;

        let mut toggles = AdapterToggles::default();
        toggles.roon = false;
        coordinator.on_settings_changed(&toggles).await;

        assert!(coordinator.active_prefixes().await.is_empty());
        assert!(bus.get_zones().await.is_empty());
        assert_ne!(bus.get_zones_sha().await, sha_before);
    }

    #[tokio::test]
    async fn enable_and_disable_in_one_change() {
        let bus = Arc::new(ZoneBus::new(create_events()));
        let coordinator = coordinator_with(
            &bus,
            vec![
                ("roon", vec![("z1", "A")], false),
                ("lms", vec![("p1", "Kitchen")], false),
            ],
        );
        coordinator.start_all(&AdapterToggles::default()).await;

        let mut toggles = AdapterToggles::default();
        toggles.roon = false;
        toggles.lms = true;
        coordinator.on_settings_changed(&toggles).await;

        assert_eq!(coordinator.active_prefixes().await, vec!["lms"]);
        let zones = bus.get_zones().await;
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].zone_id.as_str(), "lms:p1");
    }

    #[tokio::test]
    async fn start_failure_keeps_registration() {
        let bus = Arc::new(ZoneBus::new(create_events()));
        let coordinator = coordinator_with(&bus, vec![("roon", vec![], true)]);
        coordinator.start_all(&AdapterToggles::default()).await;

        // Registered but empty: visible as connecting, not absent.
        assert_eq!(coordinator.active_prefixes().await, vec!["roon"]);
        assert_eq!(bus.registered_prefixes().await, vec!["roon"]);
        assert!(bus.get_zones().await.is_empty());
    }
}
