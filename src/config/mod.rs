//! Process configuration: listen port, config directory, backend seeds.
//!
//! Layering (lowest to highest): built-in defaults, `config.toml`/`config.json`
//! in the config directory, `HFB_*` environment variables, then the wire-stable
//! legacy names (`PORT`, `UHC_PORT`, `LMS_HOST`, `HQP_HOST`, ...).

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub lms: Option<LmsSeed>,

    #[serde(default)]
    pub hqplayer: Option<HqpSeed>,
}

fn default_port() -> u16 {
    3000
}

/// Seed config for LMS from file/env; the adapter persists its own copy once
/// configured through the API.
#[derive(Debug, Clone, Deserialize)]
pub struct LmsSeed {
    pub host: String,
    #[serde(default = "default_lms_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_lms_port() -> u16 {
    9000
}

/// Seed config for the default HQPlayer instance.
#[derive(Debug, Clone, Deserialize)]
pub struct HqpSeed {
    pub host: String,
    #[serde(default = "default_hqp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_hqp_port() -> u16 {
    4321
}

/// Resolve the configuration directory.
///
/// `CONFIG_DIR` wins outright (container deployments), then the platform
/// defaults under the user's config root.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/hifi-bridge");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("hifi-bridge");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config/hifi-bridge");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("hifi-bridge");
        }
    }

    PathBuf::from(".")
}

/// Path of a named file inside the config directory.
pub fn config_file_path(name: &str) -> PathBuf {
    config_dir().join(name)
}

/// Read a config file to a string, `None` when absent or unreadable.
pub fn read_config_file(name: &str) -> Option<String> {
    let path = config_file_path(name);
    std::fs::read_to_string(&path).ok()
}

/// Write a config file, creating the directory as needed. Failures are logged
/// rather than propagated; persisted state is best-effort.
pub fn write_config_file(name: &str, contents: &str) {
    let path = config_file_path(name);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&path, contents) {
        tracing::error!("Failed to write {}: {}", path.display(), e);
    }
}

pub fn load_config() -> Result<BridgeConfig> {
    let dir = config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("port", 3000)?
        .add_source(::config::File::with_name(&dir.join("config").to_string_lossy()).required(false))
        .add_source(
            ::config::Environment::with_prefix("HFB")
                .separator("__")
                .try_parsing(true),
        );

    // Wire-stable env names. UHC_PORT predates PORT in deployed compose files,
    // PORT is the documented name; newest wins.
    for name in ["UHC_PORT", "PORT"] {
        if let Ok(port) = std::env::var(name) {
            builder = builder.set_override("port", port)?;
        }
    }
    if let Ok(host) = std::env::var("LMS_HOST") {
        builder = builder.set_override("lms.host", host)?;
        if let Ok(port) = std::env::var("LMS_PORT") {
            builder = builder.set_override("lms.port", port)?;
        }
    }
    if let Ok(host) = std::env::var("HQP_HOST") {
        builder = builder.set_override("hqplayer.host", host)?;
        if let Ok(port) = std::env::var("HQP_PORT") {
            builder = builder.set_override("hqplayer.port", port)?;
        }
        if let Ok(user) = std::env::var("HQP_USER") {
            builder = builder.set_override("hqplayer.username", user)?;
        }
        if let Ok(pass) = std::env::var("HQP_PASS") {
            builder = builder.set_override("hqplayer.password", pass)?;
        }
    }

    Ok(builder.build()?.try_deserialize()?)
}

/// Log filter: `RUST_LOG` wins, legacy `LOG_LEVEL` is honored, then a default.
pub fn log_filter() -> String {
    std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "hifi_bridge=info,tower_http=info,roon_api=warn".into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn config_dir_honors_env() {
        std::env::set_var("CONFIG_DIR", "/tmp/hfb-test-config");
        assert_eq!(config_dir(), PathBuf::from("/tmp/hfb-test-config"));
        std::env::remove_var("CONFIG_DIR");
    }

    #[test]
    #[serial]
    fn port_env_aliases() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("CONFIG_DIR", tmp.path());
        std::env::set_var("UHC_PORT", "9001");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.port, 9001);

        // PORT wins over UHC_PORT
        std::env::set_var("PORT", "9002");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.port, 9002);

        std::env::remove_var("PORT");
        std::env::remove_var("UHC_PORT");
        std::env::remove_var("CONFIG_DIR");
    }

    #[test]
    #[serial]
    fn lms_seed_from_env() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("CONFIG_DIR", tmp.path());
        std::env::set_var("LMS_HOST", "10.0.0.5");
        std::env::set_var("LMS_PORT", "9100");
        let cfg = load_config().unwrap();
        let lms = cfg.lms.unwrap();
        assert_eq!(lms.host, "10.0.0.5");
        assert_eq!(lms.port, 9100);
        std::env::remove_var("LMS_HOST");
        std::env::remove_var("LMS_PORT");
        std::env::remove_var("CONFIG_DIR");
    }
}
