//! Named HQPlayer instance manager with persisted configuration.
//!
//! `hqp-config.json` is an array of instance configs; the legacy single-object
//! form is migrated to the `default` instance on load.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{read_config_file, write_config_file};
use crate::hqp::client::{HqpClient, DEFAULT_PORT, DEFAULT_WEB_PORT};

const HQP_CONFIG_FILE: &str = "hqp-config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_web_port() -> u16 {
    DEFAULT_WEB_PORT
}

/// Pre-array config file layout.
#[derive(Debug, Deserialize)]
struct LegacyConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_web_port")]
    web_port: u16,
    username: Option<String>,
    password: Option<String>,
}

/// Parse either layout of `hqp-config.json`.
fn parse_configs(content: &str) -> Vec<InstanceConfig> {
    if let Ok(configs) = serde_json::from_str::<Vec<InstanceConfig>>(content) {
        return configs;
    }
    if let Ok(legacy) = serde_json::from_str::<LegacyConfig>(content) {
        return vec![InstanceConfig {
            name: "default".to_string(),
            host: legacy.host,
            port: legacy.port,
            web_port: legacy.web_port,
            username: legacy.username,
            password: legacy.password,
        }];
    }
    tracing::warn!("Failed to parse {}", HQP_CONFIG_FILE);
    Vec::new()
}

/// Instance summary for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub name: String,
    pub host: Option<String>,
    pub port: u16,
    pub connected: bool,
}

pub struct HqpInstanceManager {
    instances: RwLock<HashMap<String, Arc<HqpClient>>>,
}

impl Default for HqpInstanceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HqpInstanceManager {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Create clients for every persisted instance config.
    pub async fn load_from_config(&self) {
        let Some(content) = read_config_file(HQP_CONFIG_FILE) else {
            return;
        };
        for cfg in parse_configs(&content) {
            let client = Arc::new(HqpClient::new(&cfg.name));
            client
                .configure(
                    cfg.host,
                    Some(cfg.port),
                    Some(cfg.web_port),
                    cfg.username,
                    cfg.password,
                )
                .await;
            self.instances.write().await.insert(cfg.name, client);
        }
        let count = self.instances.read().await.len();
        if count > 0 {
            tracing::info!("HQPlayer: {} instance(s) loaded from config", count);
        }
    }

    /// Persist every configured instance (array layout).
    pub async fn save_to_config(&self) {
        let instances = self.instances.read().await;
        let mut configs = Vec::new();
        for (name, client) in instances.iter() {
            let cfg = client.config().await;
            if let Some(host) = cfg.host {
                configs.push(InstanceConfig {
                    name: name.clone(),
                    host,
                    port: cfg.port,
                    web_port: cfg.web_port,
                    username: cfg.username,
                    password: cfg.password,
                });
            }
        }
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        match serde_json::to_string_pretty(&configs) {
            Ok(json) => write_config_file(HQP_CONFIG_FILE, &json),
            Err(e) => tracing::error!("Failed to serialize HQP config: {}", e),
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<HqpClient>> {
        self.instances.read().await.get(name).cloned()
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<HqpClient> {
        if let Some(client) = self.get(name).await {
            return client;
        }
        let client = Arc::new(HqpClient::new(name));
        self.instances
            .write()
            .await
            .insert(name.to_string(), client.clone());
        client
    }

    pub async fn get_default(&self) -> Arc<HqpClient> {
        self.get_or_create("default").await
    }

    /// Whether a named instance exists and has a host.
    pub async fn is_configured(&self, name: &str) -> bool {
        match self.get(name).await {
            Some(client) => client.is_configured().await,
            None => false,
        }
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn list(&self) -> Vec<InstanceInfo> {
        let instances = self.instances.read().await;
        let mut out = Vec::new();
        for (name, client) in instances.iter() {
            let status = client.status().await;
            out.push(InstanceInfo {
                name: name.clone(),
                host: status.host,
                port: status.port,
                connected: status.connected,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Add or reconfigure a named instance and persist.
    pub async fn upsert(
        &self,
        name: &str,
        host: String,
        port: Option<u16>,
        web_port: Option<u16>,
        username: Option<String>,
        password: Option<String>,
    ) -> Arc<HqpClient> {
        let client = self.get_or_create(name).await;
        client
            .configure(host, port, web_port, username, password)
            .await;
        self.save_to_config().await;
        client
    }

    pub async fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut instances = self.instances.write().await;
            if let Some(client) = instances.remove(name) {
                client.disconnect().await;
                true
            } else {
                false
            }
        };
        if removed {
            self.save_to_config().await;
        }
        removed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn legacy_single_object_migrates_to_default() {
        let configs = parse_configs(r#"{"host":"10.0.0.9","port":4321,"web_port":8088,"username":"u","password":"p"}"#);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "default");
        assert_eq!(configs[0].host, "10.0.0.9");
        assert_eq!(configs[0].username.as_deref(), Some("u"));
    }

    #[test]
    fn array_form_parses_with_port_defaults() {
        let configs = parse_configs(r#"[{"name":"den","host":"10.0.0.9"},{"name":"office","host":"10.0.0.10","port":4322}]"#);
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].port, DEFAULT_PORT);
        assert_eq!(configs[0].web_port, DEFAULT_WEB_PORT);
        assert_eq!(configs[1].port, 4322);
    }

    #[test]
    fn garbage_yields_no_instances() {
        assert!(parse_configs("not json").is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn upsert_and_reload_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("CONFIG_DIR", tmp.path());

        let manager = HqpInstanceManager::new();
        manager
            .upsert("den", "10.0.0.9".into(), None, None, Some("u".into()), Some("p".into()))
            .await;
        assert!(manager.is_configured("den").await);
        assert!(!manager.is_configured("attic").await);

        let reloaded = HqpInstanceManager::new();
        reloaded.load_from_config().await;
        assert_eq!(reloaded.names().await, vec!["den".to_string()]);
        let cfg = reloaded.get("den").await.unwrap().config().await;
        assert_eq!(cfg.host.as_deref(), Some("10.0.0.9"));
        assert_eq!(cfg.username.as_deref(), Some("u"));

        std::env::remove_var("CONFIG_DIR");
    }
}
