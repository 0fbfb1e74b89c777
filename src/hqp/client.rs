//! Dual-transport HQPlayer client.
//!
//! Two orthogonal surfaces against the same host:
//!
//! - the native XML-over-TCP protocol (default port 4321) for everything
//!   pipeline-related: mode/filter/shaper/rate, volume, transport, matrix
//!   profiles, product discovery;
//! - the web UI (default port 8088, HTTP Digest auth) strictly for
//!   configuration-profile switching, which the native protocol does not
//!   expose.
//!
//! The web form deals in option *values* while the native protocol wants list
//! *indices*; `apply_setting` translates via the fetched option lists
//! (`samplerate` is the exception, the UI already sends an index).

use quick_xml::events::{BytesStart, Event};
use quick_xml::Writer;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use crate::bus::error::BridgeError;

pub const DEFAULT_PORT: u16 = 4321;
pub const DEFAULT_WEB_PORT: u16 = 8088;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
const WEB_TIMEOUT: Duration = Duration::from_secs(5);
/// Reconnect attempts for a single native command before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_DELAY: Duration = Duration::from_millis(200);
const PROFILE_PATH: &str = "/config/profile/load";

#[derive(Debug, Error)]
pub enum HqpError {
    #[error("HQPlayer unreachable: {0}")]
    Unreachable(String),
    #[error("HQPlayer authentication failed")]
    Unauthorized,
    #[error("bad pipeline setting: {0}")]
    BadSetting(String),
    #[error("HQPlayer protocol error: {0}")]
    Protocol(String),
}

impl From<HqpError> for BridgeError {
    fn from(e: HqpError) -> Self {
        match e {
            HqpError::Unreachable(m) => BridgeError::Unreachable(m),
            HqpError::Unauthorized => BridgeError::Unauthorized("HQPlayer web UI".into()),
            HqpError::BadSetting(m) => BridgeError::BadRequest(m),
            HqpError::Protocol(m) => BridgeError::Internal(m),
        }
    }
}

impl From<reqwest::Error> for HqpError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unreachable(e.to_string())
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Product/version info from `GetInfo`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub product: String,
    pub version: String,
    pub platform: String,
}

/// Pipeline state from `State`.
#[derive(Debug, Clone, Default)]
pub struct NativeState {
    pub state: u8, // 0=stopped, 1=paused, 2=playing
    pub mode: u32,
    pub filter1x: Option<u32>,
    pub filter_nx: Option<u32>,
    pub filter: u32,
    pub shaper: u32,
    pub rate: u32,
    pub volume: i32,
    pub active_mode: i32,
    pub active_rate: u32,
    pub invert: bool,
    pub convolution: bool,
}

/// Playback counters from `Status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaybackStatus {
    pub state: u8,
    pub track: u32,
    pub position: u32,
    pub length: u32,
    pub volume: i32,
    pub active_mode: String,
    pub active_filter: String,
    pub active_shaper: String,
    pub active_rate: u32,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeRange {
    pub min: i32,
    pub max: i32,
    pub step: i32,
    pub enabled: bool,
}

/// Mode/shaper list entry; values can be negative (PCM mode is -1).
#[derive(Debug, Clone, Serialize)]
pub struct ListItem {
    pub index: u32,
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateItem {
    pub index: u32,
    pub rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixProfile {
    pub index: u32,
    pub name: String,
}

/// One profile option scraped from the web UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub value: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSetting {
    pub selected: SelectOption,
    pub options: Vec<SelectOption>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    pub mode: PipelineSetting,
    pub filter1x: PipelineSetting,
    #[serde(rename = "filterNx")]
    pub filter_nx: PipelineSetting,
    pub shaper: PipelineSetting,
    pub samplerate: PipelineSetting,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStateView {
    pub state: String,
    pub mode: String,
    pub active_mode: String,
    pub active_filter: String,
    pub active_shaper: String,
    pub active_rate: u32,
    pub convolution: bool,
    pub invert: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineVolume {
    pub value: i32,
    pub min: i32,
    pub max: i32,
    pub is_fixed: bool,
}

/// Live pipeline snapshot attached to enriched now-playing payloads and
/// served from `/hqp/pipeline`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub status: PipelineStateView,
    pub volume: PipelineVolume,
    pub settings: PipelineSettings,
}

/// Pipeline selects scraped from the web root (`dither` has no native
/// counterpart; the rest mirror the native lists).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebPipelineForm {
    pub mode: Vec<Profile>,
    pub samplerate: Vec<Profile>,
    pub filter1x: Vec<Profile>,
    #[serde(rename = "filterNx")]
    pub filter_nx: Vec<Profile>,
    pub shaper: Vec<Profile>,
    pub dither: Vec<Profile>,
    pub volume: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub host: Option<String>,
    pub port: u16,
    pub web_port: u16,
    pub info: Option<DeviceInfo>,
}

// =============================================================================
// Digest auth
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct DigestState {
    pub realm: String,
    pub nonce: String,
    pub qop: String,
    pub opaque: String,
    pub algorithm: String,
    pub nc: u32,
}

/// Parse a `WWW-Authenticate: Digest …` challenge.
pub(crate) fn parse_digest_challenge(header: &str) -> DigestState {
    let challenge = header
        .trim_start_matches("Digest ")
        .trim_start_matches("digest ");
    let mut state = DigestState {
        realm: String::new(),
        nonce: String::new(),
        qop: String::new(),
        opaque: String::new(),
        algorithm: "MD5".to_string(),
        nc: 0,
    };
    for part in challenge.split(',') {
        let part = part.trim();
        if let Some(eq) = part.find('=') {
            let key = part[..eq].trim();
            let value = part[eq + 1..].trim().trim_matches('"');
            match key {
                "realm" => state.realm = value.to_string(),
                "nonce" => state.nonce = value.to_string(),
                "qop" => state.qop = value.to_string(),
                "opaque" => state.opaque = value.to_string(),
                "algorithm" => state.algorithm = value.to_uppercase(),
                _ => {}
            }
        }
    }
    state
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Build the `Authorization` header for one request. Bumps the nonce count
/// (hex, zero-padded to 8); the caller supplies a fresh cnonce.
pub(crate) fn build_digest_header(
    digest: &mut DigestState,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    cnonce: &str,
) -> String {
    digest.nc += 1;
    let nc = format!("{:08x}", digest.nc);

    let ha1 = if digest.algorithm == "MD5-SESS" {
        let base = md5_hex(&format!("{}:{}:{}", username, digest.realm, password));
        md5_hex(&format!("{}:{}:{}", base, digest.nonce, cnonce))
    } else {
        md5_hex(&format!("{}:{}:{}", username, digest.realm, password))
    };
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    let qop_value = digest.qop.split(',').next().unwrap_or("auth").trim();
    let response = if digest.qop.is_empty() {
        md5_hex(&format!("{}:{}:{}", ha1, digest.nonce, ha2))
    } else {
        md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, digest.nonce, nc, cnonce, qop_value, ha2
        ))
    };

    let mut parts = vec![
        format!("Digest username=\"{}\"", username),
        format!("realm=\"{}\"", digest.realm),
        format!("nonce=\"{}\"", digest.nonce),
        format!("uri=\"{}\"", uri),
        format!("algorithm={}", digest.algorithm),
        format!("response=\"{}\"", response),
    ];
    if !digest.qop.is_empty() {
        parts.push(format!("qop={}", qop_value));
        parts.push(format!("nc={}", nc));
        parts.push(format!("cnonce=\"{}\"", cnonce));
    }
    if !digest.opaque.is_empty() {
        parts.push(format!("opaque=\"{}\"", digest.opaque));
    }
    parts.join(", ")
}

// =============================================================================
// HTML scraping (bounded inputs, small documented regexes)
// =============================================================================

/// Hidden form inputs (including `_xsrf`) keyed by name.
pub(crate) fn parse_hidden_inputs(html: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let (Ok(input_re), Ok(value_re), Ok(type_re)) = (
        Regex::new(r#"<input[^>]*name\s*=\s*["']([^"'>\s]+)["'][^>]*>"#),
        Regex::new(r#"value\s*=\s*["']([^"']*)["']"#),
        Regex::new(r#"type\s*=\s*["']([^"']*)["']"#),
    ) else {
        return fields;
    };

    for cap in input_re.captures_iter(html) {
        let tag = &cap[0];
        let name = &cap[1];
        let input_type = type_re
            .captures(tag)
            .map(|c| c[1].to_lowercase())
            .unwrap_or_default();
        if input_type == "hidden" || name == "_xsrf" {
            let value = value_re
                .captures(tag)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            fields.insert(name.to_string(), value);
        }
    }
    fields
}

/// Options of the `<select name="profile">` element. Empty values and the
/// literal `default` entry are dropped.
pub(crate) fn parse_profile_options(html: &str) -> Vec<Profile> {
    parse_select_options(html, "profile")
        .into_iter()
        .filter(|p| {
            let slug: String = p
                .value
                .to_lowercase()
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect();
            !p.value.is_empty() && !slug.is_empty() && slug != "default"
        })
        .collect()
}

/// Options (and selection marker) of an arbitrary named `<select>`.
pub(crate) fn parse_select_options(html: &str, name: &str) -> Vec<Profile> {
    let mut out = Vec::new();
    let Ok(select_re) = Regex::new(&format!(
        r#"<select[^>]*name\s*=\s*["']{}["'][^>]*>([\s\S]*?)</select>"#,
        regex::escape(name)
    )) else {
        return out;
    };
    let (Ok(option_re), Ok(value_re)) = (
        Regex::new(r#"<option([^>]*)>([\s\S]*?)</option>"#),
        Regex::new(r#"value\s*=\s*["']([^"']*)["']"#),
    ) else {
        return out;
    };

    if let Some(select_cap) = select_re.captures(html) {
        for opt in option_re.captures_iter(&select_cap[1]) {
            let attrs = &opt[1];
            let text = opt[2].trim();
            let value = value_re
                .captures(attrs)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| text.to_string());
            out.push(Profile {
                value: value.trim().to_string(),
                title: if text.is_empty() {
                    value.clone()
                } else {
                    text.to_string()
                },
            });
        }
    }
    out
}

/// Current volume from the `<input name="volume" …>` field on the web root.
pub(crate) fn parse_volume_input(html: &str) -> Option<i64> {
    let Ok(re) = Regex::new(r#"<input[^>]*name\s*=\s*["']volume["'][^>]*>"#) else {
        return None;
    };
    let Ok(value_re) = Regex::new(r#"value\s*=\s*["'](-?\d+)["']"#) else {
        return None;
    };
    re.find(html)
        .and_then(|m| value_re.captures(m.as_str()))
        .and_then(|c| c[1].parse().ok())
}

/// The current configuration title, `<input name="title" value="…">` on
/// `/config`.
pub(crate) fn parse_config_title(html: &str) -> Option<String> {
    let Ok(re) = Regex::new(r#"<input[^>]*name\s*=\s*["']title["'][^>]*>"#) else {
        return None;
    };
    let Ok(value_re) = Regex::new(r#"value\s*=\s*["']([^"']*)["']"#) else {
        return None;
    };
    re.find(html)
        .and_then(|m| value_re.captures(m.as_str()).map(|c| c[1].to_string()))
        .filter(|s| !s.is_empty())
}

/// Find the list index of an option by its declared value. The web form
/// speaks values, the native protocol speaks indices.
pub(crate) fn index_for_value(items: &[ListItem], value: i64) -> Option<u32> {
    items.iter().find(|i| i.value == value).map(|i| i.index)
}

// =============================================================================
// Persisted config
// =============================================================================

/// Per-instance connection config, persisted by the instance manager.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub host: Option<String>,
    pub port: u16,
    pub web_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

struct NativeConn {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

struct ClientState {
    instance_name: String,
    config: ClientConfig,
    connected: bool,
    info: Option<DeviceInfo>,
    modes: Vec<ListItem>,
    filters: Vec<ListItem>,
    shapers: Vec<ListItem>,
    rates: Vec<RateItem>,
    /// Last-good profile scrape; served while the web UI restarts.
    profiles: Vec<Profile>,
    hidden_fields: HashMap<String, String>,
    digest: Option<DigestState>,
}

pub struct HqpClient {
    state: RwLock<ClientState>,
    conn: Mutex<Option<NativeConn>>,
    http: Client,
}

impl HqpClient {
    pub fn new(instance_name: &str) -> Self {
        let http = Client::builder()
            .timeout(WEB_TIMEOUT)
            .cookie_store(true)
            .build()
            .unwrap_or_default();
        Self {
            state: RwLock::new(ClientState {
                instance_name: instance_name.to_string(),
                config: ClientConfig {
                    host: None,
                    port: DEFAULT_PORT,
                    web_port: DEFAULT_WEB_PORT,
                    username: None,
                    password: None,
                },
                connected: false,
                info: None,
                modes: Vec::new(),
                filters: Vec::new(),
                shapers: Vec::new(),
                rates: Vec::new(),
                profiles: Vec::new(),
                hidden_fields: HashMap::new(),
                digest: None,
            }),
            conn: Mutex::new(None),
            http,
        }
    }

    pub async fn instance_name(&self) -> String {
        self.state.read().await.instance_name.clone()
    }

    /// Point the client at a host. Resets auth state; an address change drops
    /// the native connection.
    pub async fn configure(
        &self,
        host: String,
        port: Option<u16>,
        web_port: Option<u16>,
        username: Option<String>,
        password: Option<String>,
    ) {
        let changed = {
            let mut state = self.state.write().await;
            let port = port.unwrap_or(DEFAULT_PORT);
            let changed = state.config.host.as_deref() != Some(host.as_str()) || state.config.port != port;
            state.config.host = Some(host);
            state.config.port = port;
            state.config.web_port = web_port.unwrap_or(DEFAULT_WEB_PORT);
            state.config.username = username;
            state.config.password = password;
            state.digest = None;
            if changed {
                state.connected = false;
            }
            changed
        };
        if changed {
            *self.conn.lock().await = None;
        }
    }

    pub async fn config(&self) -> ClientConfig {
        self.state.read().await.config.clone()
    }

    pub async fn is_configured(&self) -> bool {
        self.state.read().await.config.host.is_some()
    }

    pub async fn has_web_credentials(&self) -> bool {
        let state = self.state.read().await;
        state.config.host.is_some()
            && state.config.username.is_some()
            && state.config.password.is_some()
    }

    /// Profile switching needs the embedded flavor plus web credentials.
    pub async fn supports_profiles(&self) -> bool {
        let embedded = {
            let state = self.state.read().await;
            state
                .info
                .as_ref()
                .map(|i| i.product.to_lowercase().contains("embedded"))
                .unwrap_or(false)
        };
        embedded && self.has_web_credentials().await
    }

    pub async fn status(&self) -> ConnectionStatus {
        let state = self.state.read().await;
        ConnectionStatus {
            connected: state.connected,
            host: state.config.host.clone(),
            port: state.config.port,
            web_port: state.config.web_port,
            info: state.info.clone(),
        }
    }

    // =========================================================================
    // Native transport
    // =========================================================================

    async fn connect(&self) -> Result<(), HqpError> {
        let (host, port) = {
            let state = self.state.read().await;
            let host = state
                .config
                .host
                .clone()
                .ok_or_else(|| HqpError::Unreachable("host not configured".into()))?;
            (host, state.config.port)
        };

        let addr = format!("{}:{}", host, port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| HqpError::Unreachable(format!("{} connect timeout", addr)))?
            .map_err(|e| HqpError::Unreachable(format!("{}: {}", addr, e)))?;

        let (read_half, write_half) = stream.into_split();
        *self.conn.lock().await = Some(NativeConn {
            reader: BufReader::new(read_half),
            writer: write_half,
        });

        // Prime product info and option lists; everything downstream of the
        // value-to-index translation depends on them.
        let primed = async {
            let info = self.request_info().await?;
            let modes = self.request_list("GetModes", "ModesItem").await?;
            let filters = self.request_list("GetFilters", "FiltersItem").await?;
            let shapers = self.request_list("GetShapers", "ShapersItem").await?;
            let rates = self.request_rates().await?;
            Ok::<_, HqpError>((info, modes, filters, shapers, rates))
        }
        .await;
        let (info, modes, filters, shapers, rates) = match primed {
            Ok(primed) => primed,
            Err(e) => {
                self.mark_disconnected().await;
                return Err(e);
            }
        };

        {
            let mut state = self.state.write().await;
            state.connected = true;
            state.info = Some(info.clone());
            state.modes = modes;
            state.filters = filters;
            state.shapers = shapers;
            state.rates = rates;
        }
        tracing::info!("HQPlayer connected: {} {} v{}", info.name, info.product, info.version);
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), HqpError> {
        if self.conn.lock().await.is_some() {
            return Ok(());
        }
        self.connect().await
    }

    async fn mark_disconnected(&self) {
        self.state.write().await.connected = false;
        *self.conn.lock().await = None;
    }

    pub async fn disconnect(&self) {
        self.mark_disconnected().await;
    }

    /// Send one XML command, reconnecting up to the attempt cap.
    async fn send_command(&self, xml: &str) -> Result<String, HqpError> {
        let mut last_error = None;
        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            if let Err(e) = self.ensure_connected().await {
                last_error = Some(e);
            } else {
                match self.send_command_once(xml).await {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        self.mark_disconnected().await;
                        last_error = Some(e);
                    }
                }
            }
            if attempt < MAX_RECONNECT_ATTEMPTS - 1 {
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
        Err(last_error.unwrap_or_else(|| HqpError::Unreachable("send failed".into())))
    }

    async fn send_command_once(&self, xml: &str) -> Result<String, HqpError> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| HqpError::Unreachable("not connected".into()))?;

        conn.writer
            .write_all(xml.as_bytes())
            .await
            .map_err(|e| HqpError::Unreachable(e.to_string()))?;
        conn.writer
            .write_all(b"\n")
            .await
            .map_err(|e| HqpError::Unreachable(e.to_string()))?;
        conn.writer
            .flush()
            .await
            .map_err(|e| HqpError::Unreachable(e.to_string()))?;

        // Responses may span lines; complete on a self-closing or matched tag.
        let mut response = String::new();
        loop {
            let mut line = String::new();
            match timeout(RESPONSE_TIMEOUT, conn.reader.read_line(&mut line)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {
                    response.push_str(&line);
                    let trimmed = response.trim();
                    if trimmed.ends_with("/>") || (trimmed.contains("</") && trimmed.ends_with('>'))
                    {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(HqpError::Unreachable(e.to_string())),
                Err(_) => return Err(HqpError::Unreachable("response timeout".into())),
            }
        }
        Ok(response.trim().to_string())
    }

    fn build_request(element: &str, attrs: &[(&str, &str)]) -> String {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        let mut elem = BytesStart::new(element);
        for (key, value) in attrs {
            elem.push_attribute((*key, *value));
        }
        let _ = writer.write_event(Event::Empty(elem));
        let bytes = writer.into_inner().into_inner();
        format!("<?xml version=\"1.0\"?>{}", String::from_utf8_lossy(&bytes))
    }

    fn attr(xml: &str, name: &str) -> Option<String> {
        let pattern = format!("{}=\"", name);
        let start = xml.find(&pattern)?;
        let rest = &xml[start + pattern.len()..];
        rest.find('"').map(|end| rest[..end].to_string())
    }

    fn attr_i64(xml: &str, name: &str) -> i64 {
        Self::attr(xml, name).and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    fn attr_u32(xml: &str, name: &str) -> u32 {
        Self::attr(xml, name).and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    fn attr_bool(xml: &str, name: &str) -> bool {
        Self::attr(xml, name).map(|s| s == "1").unwrap_or(false)
    }

    fn split_items(response: &str, tag: &str) -> Vec<String> {
        let pattern = format!("<{}", tag);
        response
            .split(&pattern)
            .skip(1)
            .filter_map(|part| {
                part.find("/>")
                    .map(|end| format!("<{}{}", tag, &part[..end + 2]))
            })
            .collect()
    }

    async fn request_info(&self) -> Result<DeviceInfo, HqpError> {
        let response = self
            .send_command_once(&Self::build_request("GetInfo", &[]))
            .await?;
        Ok(DeviceInfo {
            name: Self::attr(&response, "name").unwrap_or_default(),
            product: Self::attr(&response, "product").unwrap_or_default(),
            version: Self::attr(&response, "version").unwrap_or_default(),
            platform: Self::attr(&response, "platform").unwrap_or_default(),
        })
    }

    async fn request_list(&self, command: &str, tag: &str) -> Result<Vec<ListItem>, HqpError> {
        let response = self
            .send_command_once(&Self::build_request(command, &[]))
            .await?;
        Ok(Self::split_items(&response, tag)
            .iter()
            .map(|item| ListItem {
                index: Self::attr_u32(item, "index"),
                name: Self::attr(item, "name").unwrap_or_default(),
                value: Self::attr_i64(item, "value"),
            })
            .collect())
    }

    async fn request_rates(&self) -> Result<Vec<RateItem>, HqpError> {
        let response = self
            .send_command_once(&Self::build_request("GetRates", &[]))
            .await?;
        Ok(Self::split_items(&response, "RatesItem")
            .iter()
            .map(|item| RateItem {
                index: Self::attr_u32(item, "index"),
                rate: Self::attr_u32(item, "rate"),
            })
            .collect())
    }

    pub async fn get_state(&self) -> Result<NativeState, HqpError> {
        let response = self.send_command(&Self::build_request("State", &[])).await?;
        Ok(NativeState {
            state: Self::attr_u32(&response, "state") as u8,
            mode: Self::attr_u32(&response, "mode"),
            filter1x: Self::attr(&response, "filter1x").and_then(|s| s.parse().ok()),
            filter_nx: Self::attr(&response, "filterNx").and_then(|s| s.parse().ok()),
            filter: Self::attr_u32(&response, "filter"),
            shaper: Self::attr_u32(&response, "shaper"),
            rate: Self::attr_u32(&response, "rate"),
            volume: Self::attr_i64(&response, "volume") as i32,
            active_mode: Self::attr_i64(&response, "active_mode") as i32,
            active_rate: Self::attr_u32(&response, "active_rate"),
            invert: Self::attr_bool(&response, "invert"),
            convolution: Self::attr_bool(&response, "convolution"),
        })
    }

    pub async fn get_playback_status(&self) -> Result<PlaybackStatus, HqpError> {
        let response = self
            .send_command(&Self::build_request("Status", &[("subscribe", "0")]))
            .await?;
        Ok(PlaybackStatus {
            state: Self::attr_u32(&response, "state") as u8,
            track: Self::attr_u32(&response, "track"),
            position: Self::attr_u32(&response, "position"),
            length: Self::attr_u32(&response, "length"),
            volume: Self::attr_i64(&response, "volume") as i32,
            active_mode: Self::attr(&response, "active_mode").unwrap_or_default(),
            active_filter: Self::attr(&response, "active_filter").unwrap_or_default(),
            active_shaper: Self::attr(&response, "active_shaper").unwrap_or_default(),
            active_rate: Self::attr_u32(&response, "active_rate"),
        })
    }

    pub async fn get_volume_range(&self) -> Result<VolumeRange, HqpError> {
        let response = self
            .send_command(&Self::build_request("VolumeRange", &[]))
            .await?;
        Ok(VolumeRange {
            min: Self::attr_i64(&response, "min") as i32,
            max: Self::attr_i64(&response, "max") as i32,
            step: (Self::attr_i64(&response, "step") as i32).max(1),
            enabled: Self::attr_bool(&response, "enabled"),
        })
    }

    pub async fn get_info(&self) -> Result<DeviceInfo, HqpError> {
        self.ensure_connected().await?;
        let state = self.state.read().await;
        state
            .info
            .clone()
            .ok_or_else(|| HqpError::Protocol("no product info".into()))
    }

    async fn set_indexed(&self, element: &str, index: u32) -> Result<(), HqpError> {
        self.send_command(&Self::build_request(element, &[("value", &index.to_string())]))
            .await?;
        Ok(())
    }

    pub async fn set_volume(&self, value: i32) -> Result<(), HqpError> {
        self.send_command(&Self::build_request("Volume", &[("value", &value.to_string())]))
            .await?;
        Ok(())
    }

    pub async fn transport(&self, action: &str) -> Result<(), HqpError> {
        let xml = match action {
            "play" => Self::build_request("Play", &[("last", "0")]),
            "pause" => Self::build_request("Pause", &[]),
            "stop" => Self::build_request("Stop", &[]),
            "next" => Self::build_request("Next", &[]),
            "previous" => Self::build_request("Previous", &[]),
            other => return Err(HqpError::BadSetting(format!("unknown action '{}'", other))),
        };
        self.send_command(&xml).await?;
        Ok(())
    }

    pub async fn seek(&self, position_sec: u32) -> Result<(), HqpError> {
        self.send_command(&Self::build_request(
            "Seek",
            &[("position", &position_sec.to_string())],
        ))
        .await?;
        Ok(())
    }

    // =========================================================================
    // Pipeline control (value → index translation)
    // =========================================================================

    /// Apply a UI-originated pipeline change. `value` is the option *value*
    /// the web form uses (e.g. mode -1/0/1); `samplerate` alone is already an
    /// index.
    pub async fn apply_setting(&self, name: &str, value: i64) -> Result<(), HqpError> {
        self.ensure_connected().await?;
        match name {
            "mode" => {
                let index = {
                    let state = self.state.read().await;
                    index_for_value(&state.modes, value)
                }
                .ok_or_else(|| HqpError::BadSetting(format!("mode value {} not offered", value)))?;
                self.set_indexed("SetMode", index).await
            }
            "filter1x" | "filterNx" | "filternx" | "filter" => {
                let index = {
                    let state = self.state.read().await;
                    index_for_value(&state.filters, value)
                }
                .ok_or_else(|| {
                    HqpError::BadSetting(format!("filter value {} not offered", value))
                })?;
                self.set_filter_pair(name, index).await
            }
            "shaper" => {
                let index = {
                    let state = self.state.read().await;
                    index_for_value(&state.shapers, value)
                }
                .ok_or_else(|| {
                    HqpError::BadSetting(format!("shaper value {} not offered", value))
                })?;
                self.set_indexed("SetShaping", index).await
            }
            "samplerate" | "rate" => {
                let index = u32::try_from(value)
                    .map_err(|_| HqpError::BadSetting(format!("bad rate index {}", value)))?;
                self.set_indexed("SetRate", index).await
            }
            other => Err(HqpError::BadSetting(format!("unknown setting '{}'", other))),
        }
    }

    /// SetFilter carries both halves; fetch current state to preserve the one
    /// not being changed.
    async fn set_filter_pair(&self, which: &str, index: u32) -> Result<(), HqpError> {
        let current = self.get_state().await?;
        let (nx, one_x) = match which {
            "filter1x" => (current.filter_nx.unwrap_or(current.filter), index),
            "filterNx" | "filternx" => (index, current.filter1x.unwrap_or(current.filter)),
            _ => (index, index),
        };
        self.send_command(&Self::build_request(
            "SetFilter",
            &[("value", &nx.to_string()), ("value1x", &one_x.to_string())],
        ))
        .await?;
        Ok(())
    }

    /// Live pipeline snapshot from native state plus the cached option lists.
    pub async fn pipeline(&self) -> Result<PipelineSnapshot, HqpError> {
        let state = self.get_state().await?;
        let range = self.get_volume_range().await?;
        let cached = self.state.read().await;

        let options = |items: &[ListItem]| -> Vec<SelectOption> {
            items
                .iter()
                .map(|i| SelectOption {
                    value: i.value.to_string(),
                    label: i.name.clone(),
                })
                .collect()
        };
        let by_index = |items: &[ListItem], index: u32| -> Option<ListItem> {
            items.iter().find(|i| i.index == index).cloned()
        };

        let mode = by_index(&cached.modes, state.mode);
        let filter1x = by_index(&cached.filters, state.filter1x.unwrap_or(state.filter));
        let filter_nx = by_index(&cached.filters, state.filter_nx.unwrap_or(state.filter));
        let shaper = by_index(&cached.shapers, state.shaper);

        let setting = |items: &[ListItem], selected: &Option<ListItem>, fallback: u32| {
            PipelineSetting {
                selected: SelectOption {
                    value: selected
                        .as_ref()
                        .map(|i| i.value.to_string())
                        .unwrap_or_else(|| fallback.to_string()),
                    label: selected.as_ref().map(|i| i.name.clone()).unwrap_or_default(),
                },
                options: options(items),
            }
        };

        let rate_label = |index: u32| -> String {
            if index == 0 {
                "Auto".to_string()
            } else {
                cached
                    .rates
                    .iter()
                    .find(|r| r.index == index)
                    .map(|r| r.rate.to_string())
                    .unwrap_or_else(|| "Auto".to_string())
            }
        };

        let state_label = match state.state {
            2 => "Playing",
            1 => "Paused",
            _ => "Stopped",
        };
        let active_mode = cached
            .modes
            .iter()
            .find(|m| m.value == state.active_mode as i64)
            .map(|m| m.name.clone())
            .unwrap_or_default();

        Ok(PipelineSnapshot {
            status: PipelineStateView {
                state: state_label.to_string(),
                mode: mode.as_ref().map(|m| m.name.clone()).unwrap_or_default(),
                active_mode,
                active_filter: filter1x.as_ref().map(|f| f.name.clone()).unwrap_or_default(),
                active_shaper: shaper.as_ref().map(|s| s.name.clone()).unwrap_or_default(),
                active_rate: state.active_rate,
                convolution: state.convolution,
                invert: state.invert,
            },
            volume: PipelineVolume {
                value: state.volume,
                min: range.min,
                max: range.max,
                is_fixed: !range.enabled,
            },
            settings: PipelineSettings {
                mode: setting(&cached.modes, &mode, state.mode),
                filter1x: setting(&cached.filters, &filter1x, state.filter1x.unwrap_or(0)),
                filter_nx: setting(&cached.filters, &filter_nx, state.filter_nx.unwrap_or(0)),
                shaper: setting(&cached.shapers, &shaper, state.shaper),
                samplerate: PipelineSetting {
                    selected: SelectOption {
                        value: state.rate.to_string(),
                        label: rate_label(state.rate),
                    },
                    options: cached
                        .rates
                        .iter()
                        .map(|r| SelectOption {
                            value: r.index.to_string(),
                            label: if r.index == 0 {
                                "Auto".to_string()
                            } else {
                                r.rate.to_string()
                            },
                        })
                        .collect(),
                },
            },
        })
    }

    // =========================================================================
    // Matrix profiles (native)
    // =========================================================================

    pub async fn matrix_profiles(&self) -> Result<Vec<MatrixProfile>, HqpError> {
        let response = self
            .send_command(&Self::build_request("MatrixListProfiles", &[]))
            .await?;
        Ok(Self::split_items(&response, "MatrixProfile")
            .iter()
            .map(|item| MatrixProfile {
                index: Self::attr_u32(item, "index"),
                name: Self::attr(item, "name").unwrap_or_default(),
            })
            .collect())
    }

    pub async fn current_matrix_profile(&self) -> Result<Option<MatrixProfile>, HqpError> {
        let response = self
            .send_command(&Self::build_request("MatrixGetProfile", &[]))
            .await?;
        let index = Self::attr_u32(&response, "index");
        let name = Self::attr(&response, "value").or_else(|| Self::attr(&response, "name"));
        Ok(name
            .filter(|n| !n.is_empty())
            .map(|name| MatrixProfile { index, name }))
    }

    pub async fn set_matrix_profile(&self, index: u32) -> Result<(), HqpError> {
        self.set_indexed("MatrixSetProfile", index).await
    }

    // =========================================================================
    // Web transport (profiles)
    // =========================================================================

    async fn web_base_url(&self) -> Result<String, HqpError> {
        let state = self.state.read().await;
        let host = state
            .config
            .host
            .as_ref()
            .ok_or_else(|| HqpError::Unreachable("host not configured".into()))?;
        Ok(format!("http://{}:{}", host, state.config.web_port))
    }

    async fn authorization_header(&self, method: &str, uri: &str) -> Option<String> {
        let mut state = self.state.write().await;
        let username = state.config.username.clone()?;
        let password = state.config.password.clone()?;
        let digest = state.digest.as_mut()?;
        let cnonce = format!("{:016x}", rand::random::<u64>());
        Some(build_digest_header(
            digest, &username, &password, method, uri, &cnonce,
        ))
    }

    /// One authenticated request with a single 401 challenge-retry.
    async fn web_request(
        &self,
        path: &str,
        method: &str,
        body: Option<String>,
    ) -> Result<String, HqpError> {
        let base = self.web_base_url().await?;
        let url = format!("{}{}", base, path);

        for attempt in 0..2 {
            let mut request = if method == "POST" {
                self.http
                    .post(&url)
                    .header("Origin", &base)
                    .header("Referer", &url)
            } else {
                self.http.get(&url)
            };
            if let Some(auth) = self.authorization_header(method, path).await {
                request = request.header("Authorization", auth);
            }
            if let Some(ref b) = body {
                request = request
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .body(b.clone());
            }

            let response = request.send().await?;
            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                if attempt == 1 {
                    return Err(HqpError::Unauthorized);
                }
                let challenge = response
                    .headers()
                    .get("www-authenticate")
                    .and_then(|v| v.to_str().ok())
                    .filter(|h| h.to_lowercase().starts_with("digest"))
                    .map(parse_digest_challenge);
                match challenge {
                    Some(digest) => {
                        self.state.write().await.digest = Some(digest);
                        continue;
                    }
                    None => return Err(HqpError::Unauthorized),
                }
            }
            if !response.status().is_success() {
                return Err(HqpError::Unreachable(format!(
                    "{} {} -> {}",
                    method,
                    path,
                    response.status()
                )));
            }
            return Ok(response.text().await?);
        }
        Err(HqpError::Unauthorized)
    }

    /// Fresh profile scrape; caches the hidden form fields and the last-good
    /// list.
    pub async fn fetch_profiles(&self) -> Result<Vec<Profile>, HqpError> {
        if !self.has_web_credentials().await {
            return Err(HqpError::Unauthorized);
        }
        let html = self.web_request(PROFILE_PATH, "GET", None).await?;
        let hidden = parse_hidden_inputs(&html);
        let profiles = parse_profile_options(&html);
        {
            let mut state = self.state.write().await;
            state.hidden_fields = hidden;
            state.profiles = profiles.clone();
        }
        Ok(profiles)
    }

    /// Profiles for display: fresh scrape when possible, last-good list while
    /// the web UI restarts.
    pub async fn profiles(&self) -> Result<Vec<Profile>, HqpError> {
        match self.fetch_profiles().await {
            Ok(profiles) => Ok(profiles),
            Err(e) => {
                let cached = self.state.read().await.profiles.clone();
                if cached.is_empty() {
                    Err(e)
                } else {
                    tracing::debug!("Serving cached HQP profiles after scrape failure: {}", e);
                    Ok(cached)
                }
            }
        }
    }

    /// Pipeline form scraped from the web root. The native transport is the
    /// authoritative source; this is the fallback during the restart window
    /// after a profile load, when the TCP side may be down.
    pub async fn fetch_web_pipeline(&self) -> Result<WebPipelineForm, HqpError> {
        if !self.has_web_credentials().await {
            return Err(HqpError::Unauthorized);
        }
        let html = self.web_request("/", "GET", None).await?;
        Ok(WebPipelineForm {
            mode: parse_select_options(&html, "mode"),
            samplerate: parse_select_options(&html, "samplerate"),
            filter1x: parse_select_options(&html, "filter1x"),
            filter_nx: parse_select_options(&html, "filterNx"),
            shaper: parse_select_options(&html, "shaper"),
            dither: parse_select_options(&html, "dither"),
            volume: parse_volume_input(&html),
        })
    }

    /// The currently loaded configuration title from `/config`.
    pub async fn current_config_title(&self) -> Result<Option<String>, HqpError> {
        if !self.has_web_credentials().await {
            return Err(HqpError::Unauthorized);
        }
        let html = self.web_request("/config", "GET", None).await?;
        Ok(parse_config_title(&html))
    }

    /// Load a configuration profile by value. HQPlayer restarts afterwards;
    /// callers get `Ok` when the POST lands and state converges after the
    /// restart window.
    pub async fn load_profile(&self, value: &str) -> Result<(), HqpError> {
        if value.is_empty() || value.eq_ignore_ascii_case("default") {
            return Err(HqpError::BadSetting("profile value is required".into()));
        }
        if !self.has_web_credentials().await {
            return Err(HqpError::Unauthorized);
        }

        let need_fetch = {
            let state = self.state.read().await;
            state.hidden_fields.is_empty() || state.profiles.is_empty()
        };
        if need_fetch {
            self.fetch_profiles().await?;
        }

        let body = {
            let state = self.state.read().await;
            let mut params: Vec<(String, String)> = state
                .hidden_fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            params.push(("profile".to_string(), value.to_string()));
            params
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&")
        };

        self.web_request(PROFILE_PATH, "POST", Some(body)).await?;
        tracing::info!("HQPlayer profile '{}' loaded (restart window follows)", value);
        Ok(())
    }
}

// =============================================================================
// UDP multicast discovery
// =============================================================================

const DISCOVERY_ADDR: Ipv4Addr = Ipv4Addr::new(239, 192, 0, 199);
const DISCOVERY_PORT: u16 = 4321;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredInstance {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub version: String,
    pub product: Option<String>,
}

/// Find HQPlayer instances on the local network via multicast probe.
pub async fn discover_instances(wait: Option<Duration>) -> Result<Vec<DiscoveredInstance>, HqpError> {
    let wait = wait.unwrap_or(DISCOVERY_TIMEOUT);
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| HqpError::Unreachable(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| HqpError::Unreachable(e.to_string()))?;

    let probe = b"<?xml version=\"1.0\"?><discover>hqplayer</discover>";
    let dest = SocketAddrV4::new(DISCOVERY_ADDR, DISCOVERY_PORT);
    socket
        .send_to(probe, dest)
        .await
        .map_err(|e| HqpError::Unreachable(e.to_string()))?;

    let mut found: HashMap<String, DiscoveredInstance> = HashMap::new();
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                let response = String::from_utf8_lossy(&buf[..len]);
                if response.contains("result=\"OK\"") || response.contains("result='OK'") {
                    let host = addr.ip().to_string();
                    found.insert(
                        host.clone(),
                        DiscoveredInstance {
                            host,
                            port: DISCOVERY_PORT,
                            name: HqpClient::attr(&response, "name")
                                .unwrap_or_else(|| "HQPlayer".to_string()),
                            version: HqpClient::attr(&response, "version")
                                .unwrap_or_else(|| "unknown".to_string()),
                            product: HqpClient::attr(&response, "product"),
                        },
                    );
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("HQP discovery recv error: {}", e);
                break;
            }
            Err(_) => break,
        }
    }
    Ok(found.into_values().collect())
}
