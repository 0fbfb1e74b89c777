//! Registry of hardware knob devices.
//!
//! Knobs appear on first contact and are never deleted automatically. Each
//! carries a configuration (display rotations, power-mode timers, radio
//! options) plus an 8-hex-char `config_sha` the device compares on every
//! `/now_playing` poll: a mismatch makes it refetch `/config/{knob_id}`.
//! That sha is computed over the JSON serialization of `{…config, name}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{read_config_file, write_config_file};

const KNOBS_FILE: &str = "knobs.json";

/// One timeout-driven power state transition.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PowerTimer {
    pub enabled: bool,
    pub timeout_sec: u32,
}

impl PowerTimer {
    fn new(enabled: bool, timeout_sec: u32) -> Self {
        Self { enabled, timeout_sec }
    }
}

/// Device configuration synced via the config-SHA protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnobConfig {
    /// Display rotation in degrees while on the charger / on battery.
    pub rotation_charging: u16,
    pub rotation_not_charging: u16,

    pub art_mode_charging: PowerTimer,
    pub dim_charging: PowerTimer,
    pub sleep_charging: PowerTimer,
    pub deep_sleep_charging: PowerTimer,

    pub art_mode_battery: PowerTimer,
    pub dim_battery: PowerTimer,
    pub sleep_battery: PowerTimer,
    pub deep_sleep_battery: PowerTimer,

    pub wifi_power_save_enabled: bool,
    pub cpu_freq_scaling_enabled: bool,
    /// Poll interval while the zone is stopped.
    pub sleep_poll_stopped_sec: u32,
}

impl Default for KnobConfig {
    fn default() -> Self {
        Self {
            rotation_charging: 180,
            rotation_not_charging: 0,
            art_mode_charging: PowerTimer::new(true, 60),
            dim_charging: PowerTimer::new(true, 120),
            sleep_charging: PowerTimer::new(false, 0),
            deep_sleep_charging: PowerTimer::new(false, 0),
            art_mode_battery: PowerTimer::new(true, 30),
            dim_battery: PowerTimer::new(true, 30),
            sleep_battery: PowerTimer::new(true, 60),
            deep_sleep_battery: PowerTimer::new(true, 1200),
            wifi_power_save_enabled: false,
            cpu_freq_scaling_enabled: false,
            sleep_poll_stopped_sec: 60,
        }
    }
}

/// Runtime status reported alongside polls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnobStatus {
    pub battery_level: Option<u8>,
    pub battery_charging: Option<bool>,
    pub zone_id: Option<String>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnobRecord {
    pub name: String,
    pub last_seen: DateTime<Utc>,
    pub version: Option<String>,
    pub config: KnobConfig,
    pub config_sha: String,
    pub status: KnobStatus,
}

/// Summary shape for `/api/knobs`.
#[derive(Debug, Clone, Serialize)]
pub struct KnobSummary {
    pub knob_id: String,
    pub name: String,
    pub last_seen: DateTime<Utc>,
    pub version: Option<String>,
    pub status: KnobStatus,
}

/// Partial status update from request headers/query.
#[derive(Debug, Default)]
pub struct KnobStatusPatch {
    pub battery_level: Option<u8>,
    pub battery_charging: Option<bool>,
    pub zone_id: Option<String>,
    pub ip: Option<String>,
}

/// Partial config update from `PUT /config/{knob_id}`.
#[derive(Debug, Default, Deserialize)]
pub struct KnobConfigPatch {
    pub name: Option<String>,
    pub rotation_charging: Option<u16>,
    pub rotation_not_charging: Option<u16>,
    pub art_mode_charging: Option<PowerTimer>,
    pub art_mode_battery: Option<PowerTimer>,
    pub dim_charging: Option<PowerTimer>,
    pub dim_battery: Option<PowerTimer>,
    pub sleep_charging: Option<PowerTimer>,
    pub sleep_battery: Option<PowerTimer>,
    pub deep_sleep_charging: Option<PowerTimer>,
    pub deep_sleep_battery: Option<PowerTimer>,
    pub wifi_power_save_enabled: Option<bool>,
    pub cpu_freq_scaling_enabled: Option<bool>,
    pub sleep_poll_stopped_sec: Option<u32>,
}

/// First 8 hex chars of SHA-256 over `{…config, name}`. serde_json maps keep
/// sorted keys, so the encoding is deterministic.
fn compute_config_sha(config: &KnobConfig, name: &str) -> String {
    let mut doc = match serde_json::to_value(config) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    doc.insert("name".to_string(), serde_json::Value::String(name.to_string()));
    let encoded = serde_json::Value::Object(doc).to_string();
    let digest = Sha256::digest(encoded.as_bytes());
    hex::encode(&digest[..4])
}

#[derive(Clone)]
pub struct KnobRegistry {
    knobs: Arc<RwLock<HashMap<String, KnobRecord>>>,
}

impl Default for KnobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KnobRegistry {
    /// Load the registry from `knobs.json`.
    pub fn new() -> Self {
        let knobs = read_config_file(KNOBS_FILE)
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            knobs: Arc::new(RwLock::new(knobs)),
        }
    }

    async fn persist(&self) {
        let knobs = self.knobs.read().await;
        match serde_json::to_string_pretty(&*knobs) {
            Ok(json) => write_config_file(KNOBS_FILE, &json),
            Err(e) => tracing::error!("Failed to serialize knobs: {}", e),
        }
    }

    pub async fn get(&self, knob_id: &str) -> Option<KnobRecord> {
        self.knobs.read().await.get(knob_id).cloned()
    }

    /// Fetch or create a knob, bumping `last_seen` (and `version` when
    /// reported) either way.
    pub async fn get_or_create(&self, knob_id: &str, version: Option<&str>) -> KnobRecord {
        let record = {
            let mut knobs = self.knobs.write().await;
            if let Some(record) = knobs.get_mut(knob_id) {
                record.last_seen = Utc::now();
                if let Some(v) = version {
                    record.version = Some(v.to_string());
                }
                record.clone()
            } else {
                let config = KnobConfig::default();
                let name = String::new();
                let record = KnobRecord {
                    config_sha: compute_config_sha(&config, &name),
                    name,
                    last_seen: Utc::now(),
                    version: version.map(|s| s.to_string()),
                    config,
                    status: KnobStatus::default(),
                };
                knobs.insert(knob_id.to_string(), record.clone());
                tracing::info!("Registered new knob: {}", knob_id);
                record
            }
        };
        self.persist().await;
        record
    }

    /// Merge a status patch; unknown knobs are ignored.
    pub async fn update_status(&self, knob_id: &str, patch: KnobStatusPatch) {
        {
            let mut knobs = self.knobs.write().await;
            let Some(record) = knobs.get_mut(knob_id) else {
                return;
            };
            if let Some(level) = patch.battery_level {
                record.status.battery_level = Some(level);
            }
            if let Some(charging) = patch.battery_charging {
                record.status.battery_charging = Some(charging);
            }
            if let Some(zone_id) = patch.zone_id {
                record.status.zone_id = Some(zone_id);
            }
            if let Some(ip) = patch.ip {
                record.status.ip = Some(ip);
            }
            record.last_seen = Utc::now();
        }
        self.persist().await;
    }

    /// Merge a config patch and recompute the sha. `None` for unknown knobs.
    pub async fn update_config(&self, knob_id: &str, patch: KnobConfigPatch) -> Option<KnobRecord> {
        let record = {
            let mut knobs = self.knobs.write().await;
            let record = knobs.get_mut(knob_id)?;

            if let Some(name) = patch.name {
                record.name = name;
            }
            if let Some(v) = patch.rotation_charging {
                record.config.rotation_charging = v;
            }
            if let Some(v) = patch.rotation_not_charging {
                record.config.rotation_not_charging = v;
            }
            if let Some(v) = patch.art_mode_charging {
                record.config.art_mode_charging = v;
            }
            if let Some(v) = patch.art_mode_battery {
                record.config.art_mode_battery = v;
            }
            if let Some(v) = patch.dim_charging {
                record.config.dim_charging = v;
            }
            if let Some(v) = patch.dim_battery {
                record.config.dim_battery = v;
            }
            if let Some(v) = patch.sleep_charging {
                record.config.sleep_charging = v;
            }
            if let Some(v) = patch.sleep_battery {
                record.config.sleep_battery = v;
            }
            if let Some(v) = patch.deep_sleep_charging {
                record.config.deep_sleep_charging = v;
            }
            if let Some(v) = patch.deep_sleep_battery {
                record.config.deep_sleep_battery = v;
            }
            if let Some(v) = patch.wifi_power_save_enabled {
                record.config.wifi_power_save_enabled = v;
            }
            if let Some(v) = patch.cpu_freq_scaling_enabled {
                record.config.cpu_freq_scaling_enabled = v;
            }
            if let Some(v) = patch.sleep_poll_stopped_sec {
                record.config.sleep_poll_stopped_sec = v;
            }

            record.config_sha = compute_config_sha(&record.config, &record.name);
            record.last_seen = Utc::now();
            record.clone()
        };
        self.persist().await;
        tracing::info!("Updated knob {} (sha {})", knob_id, record.config_sha);
        Some(record)
    }

    pub async fn list(&self) -> Vec<KnobSummary> {
        let knobs = self.knobs.read().await;
        let mut out: Vec<KnobSummary> = knobs
            .iter()
            .map(|(id, record)| KnobSummary {
                knob_id: id.clone(),
                name: record.name.clone(),
                last_seen: record.last_seen,
                version: record.version.clone(),
                status: record.status.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.knob_id.cmp(&b.knob_id));
        out
    }

    pub async fn get_config_sha(&self, knob_id: &str) -> Option<String> {
        self.knobs
            .read()
            .await
            .get(knob_id)
            .map(|k| k.config_sha.clone())
    }

    pub async fn count(&self) -> usize {
        self.knobs.read().await.len()
    }
}
