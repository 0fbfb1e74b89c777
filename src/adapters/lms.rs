//! Lyrion (LMS) backend: JSON-RPC over HTTP with fixed-interval polling.
//!
//! The server is polled at `LMS_POLL_INTERVAL` (default 2 s) for the player
//! list and per-player status. Overrunning polls skip the next tick rather
//! than queue it. Artwork goes through the server's image proxy with the
//! `cover_{w}x{h}` size suffix.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::traits::{Backend, Capabilities, ControlCommand};
use crate::bus::error::BridgeError;
use crate::bus::events::{BridgeEvent, SharedEvents};
use crate::bus::types::{
    ImageData, ImageQuery, NowPlaying, PlaybackState, VolumeControl, VolumeType, Zone, ZoneId,
};
use crate::config::{read_config_file, write_config_file};

pub const PREFIX: &str = "lms";

const LMS_CONFIG_FILE: &str = "lms-config.json";
const DEFAULT_PORT: u16 = 9000;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Request id surfaced in LMS server logs, handy when debugging against a
/// busy server.
const RPC_ID: i32 = 433;
/// Status tags: artist, album, duration, artwork ids and url.
const STATUS_TAGS: &str = "tags:aAdltKc";

fn poll_interval() -> Duration {
    std::env::var("LMS_POLL_INTERVAL")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_POLL_INTERVAL)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedConfig {
    host: String,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

/// One player as assembled from `players` + `status` responses.
#[derive(Debug, Clone, Default)]
pub struct Player {
    pub player_id: String,
    pub name: String,
    pub connected: bool,
    pub power: bool,
    pub mode: String,
    pub volume: i64,
    pub time: f64,
    pub duration: f64,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub cover_id: Option<String>,
    pub artwork_url: Option<String>,
}

impl Player {
    fn playback_state(&self) -> PlaybackState {
        match self.mode.as_str() {
            "play" => PlaybackState::Playing,
            "pause" => PlaybackState::Paused,
            _ => PlaybackState::Stopped,
        }
    }
}

struct LmsState {
    host: Option<String>,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    connected: bool,
    running: bool,
    players: HashMap<String, Player>,
}

impl Default for LmsState {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            username: None,
            password: None,
            connected: false,
            running: false,
            players: HashMap::new(),
        }
    }
}

#[derive(Clone)]
pub struct LmsBackend {
    state: Arc<RwLock<LmsState>>,
    http: Client,
    events: SharedEvents,
    /// Wrapped in a lock so restart gets a fresh token.
    shutdown: Arc<RwLock<CancellationToken>>,
}

impl LmsBackend {
    pub fn new(events: SharedEvents) -> Arc<Self> {
        let backend = Arc::new(Self {
            state: Arc::new(RwLock::new(LmsState::default())),
            http: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            events,
            shutdown: Arc::new(RwLock::new(CancellationToken::new())),
        });
        backend.load_config_sync();
        backend
    }

    fn load_config_sync(&self) {
        if let Some(content) = read_config_file(LMS_CONFIG_FILE) {
            match serde_json::from_str::<SavedConfig>(&content) {
                Ok(saved) => {
                    if let Ok(mut state) = self.state.try_write() {
                        info!("Loaded LMS config: {}:{}", saved.host, saved.port);
                        state.host = Some(saved.host);
                        state.port = saved.port;
                        state.username = saved.username;
                        state.password = saved.password;
                    }
                }
                Err(e) => warn!("Failed to parse {}: {}", LMS_CONFIG_FILE, e),
            }
        }
    }

    pub async fn configure(
        &self,
        host: String,
        port: Option<u16>,
        username: Option<String>,
        password: Option<String>,
    ) {
        let saved = {
            let mut state = self.state.write().await;
            state.host = Some(host.clone());
            state.port = port.unwrap_or(DEFAULT_PORT);
            state.username = username.clone();
            state.password = password.clone();
            state.connected = false;
            SavedConfig {
                host,
                port: state.port,
                username,
                password,
            }
        };
        match serde_json::to_string_pretty(&saved) {
            Ok(json) => write_config_file(LMS_CONFIG_FILE, &json),
            Err(e) => tracing::error!("Failed to serialize LMS config: {}", e),
        }
    }

    pub async fn is_configured(&self) -> bool {
        self.state.read().await.host.is_some()
    }

    async fn base_url(&self) -> Result<String> {
        let state = self.state.read().await;
        let host = state
            .host
            .as_ref()
            .ok_or_else(|| anyhow!("LMS host not configured"))?;
        Ok(format!("http://{}:{}", host, state.port))
    }

    /// One `slim.request` round trip.
    async fn rpc(&self, player_id: Option<&str>, params: Vec<Value>) -> Result<Value> {
        let url = format!("{}/jsonrpc.js", self.base_url().await?);
        let body = json!({
            "id": RPC_ID,
            "method": "slim.request",
            "params": [player_id.unwrap_or(""), params],
        });

        let mut request = self.http.post(&url).json(&body);
        {
            let state = self.state.read().await;
            if let (Some(user), Some(pass)) = (&state.username, &state.password) {
                request = request.basic_auth(user, Some(pass));
            }
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(anyhow!("unauthorized"));
        }
        if !response.status().is_success() {
            return Err(anyhow!("LMS request failed: {}", response.status()));
        }
        let data: Value = response.json().await?;
        if let Some(error) = data.get("error").filter(|e| !e.is_null()) {
            return Err(anyhow!("LMS error: {}", error));
        }
        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn fetch_players(&self) -> Result<Vec<Player>> {
        let result = self
            .rpc(None, vec![json!("players"), json!(0), json!(100)])
            .await?;
        let mut players = Vec::new();
        for entry in result
            .get("players_loop")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
        {
            let player_id = entry
                .get("playerid")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if player_id.is_empty() {
                continue;
            }
            players.push(Player {
                player_id,
                name: entry
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                connected: entry.get("connected").and_then(|v| v.as_i64()) == Some(1),
                power: entry.get("power").and_then(|v| v.as_i64()) == Some(1),
                ..Default::default()
            });
        }
        Ok(players)
    }

    async fn fetch_status(&self, player: &mut Player) -> Result<()> {
        let base_url = self.base_url().await?;
        let result = self
            .rpc(
                Some(&player.player_id),
                vec![json!("status"), json!("-"), json!(1), json!(STATUS_TAGS)],
            )
            .await?;

        player.mode = result
            .get("mode")
            .and_then(|v| v.as_str())
            .unwrap_or("stop")
            .to_string();
        player.volume = result.get("mixer volume").and_then(|v| v.as_i64()).unwrap_or(0);
        player.time = result.get("time").and_then(|v| v.as_f64()).unwrap_or(0.0);

        let track = result
            .get("playlist_loop")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or(Value::Null);
        player.duration = track.get("duration").and_then(|v| v.as_f64()).unwrap_or(0.0);
        player.title = track
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        player.artist = track
            .get("artist")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        player.album = track
            .get("album")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        player.cover_id = track
            .get("coverid")
            .or_else(|| track.get("artwork_track_id"))
            .or_else(|| track.get("id"))
            .and_then(|v| {
                v.as_str()
                    .map(|s| s.to_string())
                    .or_else(|| v.as_i64().map(|n| n.to_string()))
            });
        player.artwork_url = track
            .get("artwork_url")
            .and_then(|v| v.as_str())
            .map(|u| {
                if u.starts_with('/') {
                    format!("{}{}", base_url, u)
                } else {
                    u.to_string()
                }
            });
        Ok(())
    }

    /// One poll pass: player list + per-player status, then publish a
    /// zone-set notification when membership, names or states moved.
    async fn poll_once(&self) -> Result<()> {
        let mut players = self.fetch_players().await?;
        for player in &mut players {
            if let Err(e) = self.fetch_status(player).await {
                debug!("LMS status for {} failed: {}", player.player_id, e);
            }
        }

        let changed = {
            let mut state = self.state.write().await;
            let before: BTreeSet<(String, String, String)> = state
                .players
                .values()
                .map(|p| (p.player_id.clone(), p.name.clone(), p.mode.clone()))
                .collect();
            let after: BTreeSet<(String, String, String)> = players
                .iter()
                .map(|p| (p.player_id.clone(), p.name.clone(), p.mode.clone()))
                .collect();
            state.players = players
                .into_iter()
                .map(|p| (p.player_id.clone(), p))
                .collect();
            let was_connected = state.connected;
            state.connected = true;
            before != after || !was_connected
        };

        if changed {
            self.events.publish(BridgeEvent::ZoneSetChanged {
                prefix: PREFIX.to_string(),
            });
        }
        Ok(())
    }

    async fn poll_loop(self, shutdown: CancellationToken) {
        let mut ticker = interval(poll_interval());
        // A poll that overruns its interval drops the missed tick.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("LMS poll loop started ({:?} interval)", poll_interval());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        let flushed = {
                            let mut state = self.state.write().await;
                            let had = state.connected || !state.players.is_empty();
                            state.connected = false;
                            state.players.clear();
                            had
                        };
                        debug!("LMS poll failed: {}", e);
                        if flushed {
                            warn!("LMS unreachable, flushing players: {}", e);
                            self.events.publish(BridgeEvent::BackendDisconnected {
                                prefix: PREFIX.to_string(),
                                reason: Some(e.to_string()),
                            });
                        }
                    }
                }
            }
        }
        info!("LMS poll loop stopped");
    }

    fn player_to_zone(player: &Player) -> Zone {
        Zone {
            zone_id: ZoneId::join(PREFIX, &player.player_id),
            zone_name: player.name.clone(),
            state: player.playback_state(),
            output_name: None,
            device_name: Some(player.name.clone()),
            volume_control: Some(VolumeControl {
                volume_type: VolumeType::Number,
                min: 0.0,
                max: 100.0,
                step: 1.0,
                is_muted: false,
                value: Some(player.volume as f64),
            }),
            unsupported: BTreeSet::new(),
        }
    }
}

#[async_trait]
impl Backend for LmsBackend {
    fn prefix(&self) -> &str {
        PREFIX
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { images: true }
    }

    async fn start(&self) -> Result<(), BridgeError> {
        if !self.is_configured().await {
            return Err(BridgeError::BadRequest("LMS host not configured".into()));
        }
        {
            let mut state = self.state.write().await;
            if state.running {
                return Ok(());
            }
            state.running = true;
        }

        let shutdown = {
            let mut token = self.shutdown.write().await;
            *token = CancellationToken::new();
            token.clone()
        };

        tokio::spawn(self.clone().poll_loop(shutdown));
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.read().await.cancel();
        let mut state = self.state.write().await;
        state.running = false;
        state.connected = false;
        state.players.clear();
    }

    async fn get_zones(&self) -> Vec<Zone> {
        let state = self.state.read().await;
        let mut zones: Vec<Zone> = state.players.values().map(Self::player_to_zone).collect();
        zones.sort_by(|a, b| a.zone_name.cmp(&b.zone_name));
        zones
    }

    async fn get_now_playing(&self, native_id: &str) -> Option<NowPlaying> {
        let state = self.state.read().await;
        let player = state.players.get(native_id)?;
        let is_playing = player.mode == "play";
        Some(NowPlaying {
            line1: if player.title.is_empty() {
                "Idle".to_string()
            } else {
                player.title.clone()
            },
            line2: player.artist.clone(),
            line3: (!player.album.is_empty()).then(|| player.album.clone()),
            is_playing,
            volume: Some(player.volume as f64),
            volume_type: Some(VolumeType::Number),
            volume_step: Some(1.0),
            image_key: player.artwork_url.clone().or_else(|| player.cover_id.clone()),
            length_sec: (player.duration > 0.0).then_some(player.duration as u64),
            seek_position_sec: Some(player.time as i64),
            backend_data: Default::default(),
        })
    }

    async fn control(&self, native_id: &str, command: ControlCommand) -> Result<(), BridgeError> {
        let known = self.state.read().await.players.contains_key(native_id);
        if !known {
            return Err(BridgeError::ZoneNotFound(native_id.to_string()));
        }

        let params = match command {
            ControlCommand::Play => vec![json!("play")],
            ControlCommand::Pause => vec![json!("pause"), json!("1")],
            ControlCommand::PlayPause => vec![json!("pause")],
            ControlCommand::Stop => vec![json!("stop")],
            ControlCommand::Next => vec![json!("playlist"), json!("index"), json!("+1")],
            ControlCommand::Previous => vec![json!("playlist"), json!("index"), json!("-1")],
            ControlCommand::VolumeAbsolute(v) => {
                vec![json!("mixer"), json!("volume"), json!(v.round() as i64)]
            }
            ControlCommand::VolumeRelative(delta) => {
                let signed = if delta >= 0.0 {
                    format!("+{}", delta.round() as i64)
                } else {
                    format!("{}", delta.round() as i64)
                };
                vec![json!("mixer"), json!("volume"), json!(signed)]
            }
            ControlCommand::Seek(position) => vec![json!("time"), json!(position)],
        };

        self.rpc(Some(native_id), params)
            .await
            .map_err(map_lms_error)?;
        Ok(())
    }

    async fn get_status(&self) -> Value {
        let state = self.state.read().await;
        json!({
            "connected": state.connected,
            "host": state.host,
            "port": state.port,
            "player_count": state.players.len(),
        })
    }

    /// `image_key` is either an absolute artwork URL or a cover id for the
    /// server's image proxy.
    async fn get_image(&self, image_key: &str, query: &ImageQuery) -> Result<ImageData, BridgeError> {
        let url = if image_key.starts_with("http://") || image_key.starts_with("https://") {
            image_key.to_string()
        } else {
            let base = self
                .base_url()
                .await
                .map_err(|e| BridgeError::Unreachable(e.to_string()))?;
            let width = query.width.unwrap_or(300);
            let height = query.height.unwrap_or(300);
            format!("{}/music/{}/cover_{}x{}.jpg", base, image_key, width, height)
        };

        let mut request = self.http.get(&url);
        {
            let state = self.state.read().await;
            if let (Some(user), Some(pass)) = (&state.username, &state.password) {
                request = request.basic_auth(user, Some(pass));
            }
        }
        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BridgeError::Unreachable(format!(
                "artwork fetch failed: {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let data = response
            .bytes()
            .await
            .map_err(|e| BridgeError::Unreachable(e.to_string()))?
            .to_vec();
        Ok(ImageData { content_type, data })
    }
}

fn map_lms_error(e: anyhow::Error) -> BridgeError {
    let text = e.to_string();
    if text.contains("unauthorized") {
        BridgeError::Unauthorized("LMS".into())
    } else {
        BridgeError::Unreachable(text)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::bus::events::create_events;

    #[test]
    fn player_zone_mapping_declares_number_volume() {
        let player = Player {
            player_id: "00:04:20:aa:bb:cc".into(),
            name: "Kitchen".into(),
            mode: "play".into(),
            volume: 35,
            ..Default::default()
        };
        let zone = LmsBackend::player_to_zone(&player);
        assert_eq!(zone.zone_id.as_str(), "lms:00:04:20:aa:bb:cc");
        assert_eq!(zone.state, PlaybackState::Playing);
        let vc = zone.volume_control.unwrap();
        assert_eq!(vc.volume_type, VolumeType::Number);
        assert_eq!(vc.max, 100.0);
        assert!(zone.unsupported.is_empty());
    }

    #[tokio::test]
    async fn now_playing_defaults_idle_line() {
        let events = create_events();
        let backend = LmsBackend::new(events);
        backend.state.write().await.players.insert(
            "p1".into(),
            Player {
                player_id: "p1".into(),
                name: "Den".into(),
                mode: "stop".into(),
                ..Default::default()
            },
        );
        let np = backend.get_now_playing("p1").await.unwrap();
        assert_eq!(np.line1, "Idle");
        assert!(!np.is_playing);
        assert!(backend.get_now_playing("ghost").await.is_none());
    }

    #[tokio::test]
    async fn control_unknown_player_is_zone_not_found() {
        let events = create_events();
        let backend = LmsBackend::new(events);
        let err = backend.control("nope", ControlCommand::Play).await.unwrap_err();
        assert_eq!(err.kind(), "ZoneNotFound");
    }

    #[tokio::test]
    async fn start_requires_configuration() {
        let events = create_events();
        let backend = LmsBackend::new(events);
        // Freshly constructed backend in a sandboxed config dir has no host.
        if !backend.is_configured().await {
            let err = backend.start().await.unwrap_err();
            assert_eq!(err.kind(), "BadRequest");
        }
    }
}
