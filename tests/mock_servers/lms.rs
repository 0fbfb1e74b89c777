//! Mock LMS server speaking just enough JSON-RPC (`/jsonrpc.js`) for the
//! polling backend: `players`, `status`, transport and mixer commands.

use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockPlayer {
    pub player_id: String,
    pub name: String,
    pub mode: String,
    pub volume: i64,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration: f64,
    pub time: f64,
}

impl MockPlayer {
    fn new(player_id: &str, name: &str) -> Self {
        Self {
            player_id: player_id.to_string(),
            name: name.to_string(),
            mode: "stop".to_string(),
            volume: 50,
            title: String::new(),
            artist: String::new(),
            album: String::new(),
            duration: 0.0,
            time: 0.0,
        }
    }
}

struct ServerState {
    players: HashMap<String, MockPlayer>,
    /// Every non-status command received: (player_id, params).
    commands: Vec<(String, Vec<String>)>,
}

pub struct MockLmsServer {
    addr: SocketAddr,
    state: Arc<RwLock<ServerState>>,
    handle: JoinHandle<()>,
}

impl MockLmsServer {
    pub async fn start() -> Self {
        let state = Arc::new(RwLock::new(ServerState {
            players: HashMap::new(),
            commands: Vec::new(),
        }));

        let app = Router::new()
            .route("/jsonrpc.js", post(handle_rpc))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state, handle }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn add_player(&self, player_id: &str, name: &str) {
        self.state
            .write()
            .await
            .players
            .insert(player_id.to_string(), MockPlayer::new(player_id, name));
    }

    pub async fn remove_player(&self, player_id: &str) {
        self.state.write().await.players.remove(player_id);
    }

    pub async fn set_mode(&self, player_id: &str, mode: &str) {
        if let Some(player) = self.state.write().await.players.get_mut(player_id) {
            player.mode = mode.to_string();
        }
    }

    pub async fn set_now_playing(&self, player_id: &str, title: &str, artist: &str, album: &str) {
        if let Some(player) = self.state.write().await.players.get_mut(player_id) {
            player.title = title.to_string();
            player.artist = artist.to_string();
            player.album = album.to_string();
        }
    }

    /// Commands the server has received (excluding polls).
    pub async fn commands(&self) -> Vec<(String, Vec<String>)> {
        self.state.read().await.commands.clone()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_rpc(
    State(state): State<Arc<RwLock<ServerState>>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let params = body.get("params").cloned().unwrap_or(Value::Null);
    let player_id = params
        .get(0)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let command: Vec<String> = params
        .get(1)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .map(|v| {
                    v.as_str()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| v.to_string())
                })
                .collect()
        })
        .unwrap_or_default();

    let result = match command.first().map(String::as_str) {
        Some("players") => {
            let s = state.read().await;
            let players: Vec<Value> = s
                .players
                .values()
                .map(|p| {
                    json!({
                        "playerid": p.player_id,
                        "name": p.name,
                        "model": "mock",
                        "connected": 1,
                        "power": 1,
                    })
                })
                .collect();
            json!({ "players_loop": players })
        }
        Some("status") => {
            let s = state.read().await;
            match s.players.get(&player_id) {
                Some(p) => json!({
                    "mode": p.mode,
                    "mixer volume": p.volume,
                    "time": p.time,
                    "playlist_tracks": 1,
                    "playlist_loop": [{
                        "title": p.title,
                        "artist": p.artist,
                        "album": p.album,
                        "duration": p.duration,
                        "coverid": "17",
                    }],
                }),
                None => json!({}),
            }
        }
        _ => {
            let mut s = state.write().await;
            // Apply the side effects the backend expects to observe.
            match command.first().map(String::as_str) {
                Some("play") => {
                    if let Some(p) = s.players.get_mut(&player_id) {
                        p.mode = "play".into();
                    }
                }
                Some("pause") => {
                    if let Some(p) = s.players.get_mut(&player_id) {
                        p.mode = "pause".into();
                    }
                }
                Some("stop") => {
                    if let Some(p) = s.players.get_mut(&player_id) {
                        p.mode = "stop".into();
                    }
                }
                Some("mixer") => {
                    if let (Some(p), Some(value)) =
                        (s.players.get_mut(&player_id), command.get(2))
                    {
                        if let Some(stripped) = value.strip_prefix('+') {
                            p.volume += stripped.parse::<i64>().unwrap_or(0);
                        } else if let Ok(v) = value.parse::<i64>() {
                            if value.starts_with('-') {
                                p.volume += v;
                            } else {
                                p.volume = v;
                            }
                        }
                        p.volume = p.volume.clamp(0, 100);
                    }
                }
                _ => {}
            }
            s.commands.push((player_id.clone(), command.clone()));
            json!({})
        }
    };

    Json(json!({ "id": body.get("id"), "result": result }))
}
