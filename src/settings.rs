//! Persisted user choices: which adapters run, HQP zone links, UI flags.
//!
//! Stored as `settings.json` in the config directory. `POST /api/settings`
//! sends partial documents, merged field-by-field into the current state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::{read_config_file, write_config_file};

const SETTINGS_FILE: &str = "settings.json";

/// Which backends the coordinator should run. Roon is the only default-on
/// backend; everything else is opt-in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdapterToggles {
    pub roon: bool,
    pub lms: bool,
    pub openhome: bool,
    pub upnp: bool,
    pub hqplayer: bool,
}

impl Default for AdapterToggles {
    fn default() -> Self {
        Self {
            roon: true,
            lms: false,
            openhome: false,
            upnp: false,
            hqplayer: false,
        }
    }
}

impl AdapterToggles {
    pub fn enabled(&self, prefix: &str) -> bool {
        match prefix {
            "roon" => self.roon,
            "lms" => self.lms,
            "openhome" => self.openhome,
            "upnp" => self.upnp,
            "hqp" | "hqplayer" => self.hqplayer,
            _ => false,
        }
    }
}

/// HQPlayer-related settings: zone → instance links.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HqpSettings {
    #[serde(rename = "zoneLinks", default)]
    pub zone_links: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub adapters: AdapterToggles,
    pub hqp: HqpSettings,
    pub hide_knobs_page: bool,
    /// Unknown fields survive a round trip so older and newer UIs can share
    /// the same file.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Serialized access to the settings file. Writes go through `update` /
/// `replace`, which persist before returning.
pub struct SettingsStore {
    current: RwLock<AppSettings>,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::load()
    }
}

impl SettingsStore {
    /// Load from disk; missing or unparsable files fall back to defaults.
    pub fn load() -> Self {
        let current = read_config_file(SETTINGS_FILE)
            .and_then(|content| match serde_json::from_str(&content) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}", SETTINGS_FILE, e);
                    None
                }
            })
            .unwrap_or_default();
        Self {
            current: RwLock::new(current),
        }
    }

    pub fn get(&self) -> AppSettings {
        self.current
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Merge a partial JSON document into the current settings and persist.
    /// Returns the merged result.
    pub fn update(&self, patch: &Value) -> AppSettings {
        let merged = {
            let Ok(mut current) = self.current.write() else {
                return AppSettings::default();
            };
            let mut doc = serde_json::to_value(&*current).unwrap_or_else(|_| Value::Object(Default::default()));
            deep_merge(&mut doc, patch);
            match serde_json::from_value::<AppSettings>(doc) {
                Ok(settings) => {
                    *current = settings.clone();
                    settings
                }
                Err(e) => {
                    tracing::warn!("Rejected settings patch: {}", e);
                    current.clone()
                }
            }
        };
        self.persist(&merged);
        merged
    }

    /// Apply a closure to the settings and persist the result.
    pub fn modify(&self, f: impl FnOnce(&mut AppSettings)) -> AppSettings {
        let updated = {
            let Ok(mut current) = self.current.write() else {
                return AppSettings::default();
            };
            f(&mut current);
            current.clone()
        };
        self.persist(&updated);
        updated
    }

    fn persist(&self, settings: &AppSettings) {
        match serde_json::to_string_pretty(settings) {
            Ok(json) => write_config_file(SETTINGS_FILE, &json),
            Err(e) => tracing::error!("Failed to serialize settings: {}", e),
        }
    }
}

/// Recursive object merge; non-object values replace.
fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    fn with_temp_config_dir<T>(f: impl FnOnce() -> T) -> T {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("CONFIG_DIR", tmp.path());
        let result = f();
        std::env::remove_var("CONFIG_DIR");
        result
    }

    #[test]
    fn defaults_enable_only_roon() {
        let toggles = AdapterToggles::default();
        assert!(toggles.roon);
        assert!(!toggles.lms);
        assert!(!toggles.openhome);
        assert!(!toggles.upnp);
        assert!(!toggles.hqplayer);
        assert!(toggles.enabled("roon"));
        assert!(!toggles.enabled("sonos"));
    }

    #[test]
    #[serial]
    fn partial_update_merges_and_persists() {
        with_temp_config_dir(|| {
            let store = SettingsStore::load();
            let merged = store.update(&json!({ "adapters": { "lms": true } }));
            assert!(merged.adapters.lms);
            assert!(merged.adapters.roon, "untouched fields survive the merge");

            // A fresh load sees the persisted state.
            let reloaded = SettingsStore::load();
            assert!(reloaded.get().adapters.lms);
        })
    }

    #[test]
    #[serial]
    fn zone_links_round_trip_under_camel_case_key() {
        with_temp_config_dir(|| {
            let store = SettingsStore::load();
            store.modify(|s| {
                s.hqp
                    .zone_links
                    .insert("roon:z1".into(), "default".into());
            });
            let raw = read_config_file("settings.json").unwrap();
            let doc: Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(doc["hqp"]["zoneLinks"]["roon:z1"], "default");
        })
    }

    #[test]
    #[serial]
    fn unknown_fields_survive() {
        with_temp_config_dir(|| {
            let store = SettingsStore::load();
            store.update(&json!({ "theme": "dark" }));
            let reloaded = SettingsStore::load().get();
            assert_eq!(reloaded.extra.get("theme"), Some(&json!("dark")));
        })
    }

    #[test]
    fn deep_merge_replaces_scalars_and_merges_objects() {
        let mut target = json!({ "a": { "b": 1, "c": 2 }, "d": 3 });
        deep_merge(&mut target, &json!({ "a": { "b": 9 }, "d": 4 }));
        assert_eq!(target, json!({ "a": { "b": 9, "c": 2 }, "d": 4 }));
    }
}
