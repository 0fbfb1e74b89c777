//! Zone-link service: maps a primary zone to the HQPlayer instance that
//! post-processes its audio.
//!
//! Links are persisted inside `settings.json` (`hqp.zoneLinks`). A zone may
//! only be linked to a currently configured instance; links that no longer
//! resolve are dropped with a warning on load. The bus never sees this
//! service: enrichment happens in the layer above (`api`), which attaches the
//! linked instance's pipeline under `backend_data.hqp`.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::bus::error::BridgeError;
use crate::hqp::client::PipelineSnapshot;
use crate::hqp::instances::HqpInstanceManager;
use crate::settings::SettingsStore;

#[derive(Debug, Clone, Serialize)]
pub struct ZoneLink {
    pub zone_id: String,
    pub instance: String,
}

pub struct HqpLinkService {
    links: RwLock<HashMap<String, String>>,
    instances: Arc<HqpInstanceManager>,
    settings: Arc<SettingsStore>,
}

impl HqpLinkService {
    /// Load links from settings, dropping any that point at an instance that
    /// is not currently configured.
    pub async fn load(instances: Arc<HqpInstanceManager>, settings: Arc<SettingsStore>) -> Self {
        let persisted = settings.get().hqp.zone_links;
        let mut links = HashMap::new();
        for (zone_id, instance) in persisted {
            if instances.is_configured(&instance).await {
                links.insert(zone_id, instance);
            } else {
                tracing::warn!(
                    "Dropping zone link {} -> {}: instance not configured",
                    zone_id,
                    instance
                );
            }
        }
        if !links.is_empty() {
            tracing::info!("HQPlayer: {} zone link(s) active", links.len());
        }
        Self {
            links: RwLock::new(links),
            instances,
            settings,
        }
    }

    async fn persist(&self) {
        let links = self.links.read().await.clone();
        self.settings.modify(|s| s.hqp.zone_links = links);
    }

    /// Link a zone to an instance. The instance must be configured.
    pub async fn link(&self, zone_id: &str, instance: &str) -> Result<(), BridgeError> {
        if !self.instances.is_configured(instance).await {
            return Err(BridgeError::BadRequest(format!(
                "unknown HQPlayer instance '{}'",
                instance
            )));
        }
        self.links
            .write()
            .await
            .insert(zone_id.to_string(), instance.to_string());
        self.persist().await;
        tracing::info!("Zone {} linked to HQPlayer instance {}", zone_id, instance);
        Ok(())
    }

    /// Remove a link; reports whether one existed.
    pub async fn unlink(&self, zone_id: &str) -> bool {
        let existed = self.links.write().await.remove(zone_id).is_some();
        if existed {
            self.persist().await;
            tracing::info!("Zone {} unlinked from HQPlayer", zone_id);
        }
        existed
    }

    pub async fn instance_for_zone(&self, zone_id: &str) -> Option<String> {
        self.links.read().await.get(zone_id).cloned()
    }

    pub async fn links(&self) -> Vec<ZoneLink> {
        let mut out: Vec<ZoneLink> = self
            .links
            .read()
            .await
            .iter()
            .map(|(zone_id, instance)| ZoneLink {
                zone_id: zone_id.clone(),
                instance: instance.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.zone_id.cmp(&b.zone_id));
        out
    }

    /// Live pipeline for a linked zone. Never raises: any failure (no link,
    /// unconfigured instance, unreachable engine) logs and returns `None`.
    pub async fn pipeline_for_zone(&self, zone_id: &str) -> Option<PipelineSnapshot> {
        let instance = self.instance_for_zone(zone_id).await?;
        let client = self.instances.get(&instance).await?;
        if !client.is_configured().await {
            return None;
        }
        match client.pipeline().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("HQP pipeline fetch failed for zone {}: {}", zone_id, e);
                None
            }
        }
    }

    /// Drop every link pointing at a removed instance.
    pub async fn remove_links_for_instance(&self, instance: &str) -> usize {
        let removed = {
            let mut links = self.links.write().await;
            let stale: Vec<String> = links
                .iter()
                .filter(|(_, inst)| inst.as_str() == instance)
                .map(|(zone, _)| zone.clone())
                .collect();
            for zone in &stale {
                links.remove(zone);
            }
            stale.len()
        };
        if removed > 0 {
            self.persist().await;
            tracing::info!("Removed {} zone link(s) for instance {}", removed, instance);
        }
        removed
    }
}
