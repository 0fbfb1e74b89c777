//! HQPlayer backend: surfaces every configured instance as a `hqp:` zone.
//!
//! Not a primary source in the link-service model, but useful when HQPlayer
//! is driven directly. Zone native ids are instance names; all control goes
//! through the native-protocol client.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adapters::traits::{Backend, Capabilities, ControlCommand};
use crate::bus::error::BridgeError;
use crate::bus::events::{BridgeEvent, SharedEvents};
use crate::bus::types::{
    CapabilityTag, NowPlaying, PlaybackState, VolumeControl, VolumeType, Zone, ZoneId,
};
use crate::hqp::instances::HqpInstanceManager;

pub const PREFIX: &str = "hqp";

const REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone)]
struct InstanceView {
    name: String,
    display_name: String,
    state: PlaybackState,
    volume: Option<VolumeControl>,
    position: u32,
    length: u32,
}

#[derive(Clone)]
pub struct HqpBackend {
    instances: Arc<HqpInstanceManager>,
    views: Arc<RwLock<Vec<InstanceView>>>,
    events: SharedEvents,
    shutdown: Arc<RwLock<CancellationToken>>,
}

impl HqpBackend {
    pub fn new(instances: Arc<HqpInstanceManager>, events: SharedEvents) -> Arc<Self> {
        Arc::new(Self {
            instances,
            views: Arc::new(RwLock::new(Vec::new())),
            events,
            shutdown: Arc::new(RwLock::new(CancellationToken::new())),
        })
    }

    async fn refresh_once(&self) {
        let mut fresh = Vec::new();
        for name in self.instances.names().await {
            let Some(client) = self.instances.get(&name).await else {
                continue;
            };
            if !client.is_configured().await {
                continue;
            }
            let Ok(status) = client.get_playback_status().await else {
                debug!("HQPlayer instance {} unreachable", name);
                continue;
            };
            let range = client.get_volume_range().await.unwrap_or_default();
            let info = client.status().await.info;

            fresh.push(InstanceView {
                name: name.clone(),
                display_name: info
                    .map(|i| i.name)
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| format!("HQPlayer {}", name)),
                state: match status.state {
                    2 => PlaybackState::Playing,
                    1 => PlaybackState::Paused,
                    _ => PlaybackState::Stopped,
                },
                volume: range.enabled.then(|| VolumeControl {
                    volume_type: VolumeType::Db,
                    min: range.min as f64,
                    max: range.max as f64,
                    step: range.step as f64,
                    is_muted: false,
                    value: Some(status.volume as f64),
                }),
                position: status.position,
                length: status.length,
            });
        }

        let changed = {
            let mut views = self.views.write().await;
            let before: Vec<(String, PlaybackState)> =
                views.iter().map(|v| (v.name.clone(), v.state)).collect();
            let after: Vec<(String, PlaybackState)> =
                fresh.iter().map(|v| (v.name.clone(), v.state)).collect();
            *views = fresh;
            before != after
        };
        if changed {
            self.events.publish(BridgeEvent::ZoneSetChanged {
                prefix: PREFIX.to_string(),
            });
        }
    }

    async fn refresh_loop(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.refresh_once().await,
            }
        }
        info!("HQPlayer zone loop stopped");
    }

    async fn view(&self, name: &str) -> Option<InstanceView> {
        self.views.read().await.iter().find(|v| v.name == name).cloned()
    }
}

#[async_trait]
impl Backend for HqpBackend {
    fn prefix(&self) -> &str {
        PREFIX
    }

    async fn start(&self) -> Result<(), BridgeError> {
        let shutdown = {
            let mut token = self.shutdown.write().await;
            *token = CancellationToken::new();
            token.clone()
        };
        tokio::spawn(self.clone().refresh_loop(shutdown));
        info!("HQPlayer zone backend started");
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.read().await.cancel();
        self.views.write().await.clear();
    }

    async fn get_zones(&self) -> Vec<Zone> {
        self.views
            .read()
            .await
            .iter()
            .map(|v| Zone {
                zone_id: ZoneId::join(PREFIX, &v.name),
                zone_name: v.display_name.clone(),
                state: v.state,
                output_name: None,
                device_name: Some("HQPlayer".into()),
                volume_control: v.volume.clone(),
                // HQPlayer reports stream counters, not library metadata.
                unsupported: [CapabilityTag::TrackMetadata, CapabilityTag::AlbumArt]
                    .into_iter()
                    .collect::<BTreeSet<_>>(),
            })
            .collect()
    }

    async fn get_now_playing(&self, native_id: &str) -> Option<NowPlaying> {
        let view = self.view(native_id).await?;
        Some(NowPlaying {
            line1: view.display_name.clone(),
            line2: "HQPlayer".into(),
            line3: None,
            is_playing: view.state == PlaybackState::Playing,
            volume: view.volume.as_ref().and_then(|v| v.value),
            volume_type: view.volume.as_ref().map(|v| v.volume_type),
            volume_step: view.volume.as_ref().map(|v| v.step),
            image_key: None,
            length_sec: (view.length > 0).then_some(view.length as u64),
            seek_position_sec: Some(view.position as i64),
            backend_data: Default::default(),
        })
    }

    async fn control(&self, native_id: &str, command: ControlCommand) -> Result<(), BridgeError> {
        let client = self
            .instances
            .get(native_id)
            .await
            .ok_or_else(|| BridgeError::ZoneNotFound(native_id.to_string()))?;

        match command {
            ControlCommand::Play => client.transport("play").await?,
            ControlCommand::Pause => client.transport("pause").await?,
            ControlCommand::PlayPause => {
                let status = client.get_playback_status().await?;
                let action = if status.state == 2 { "pause" } else { "play" };
                client.transport(action).await?
            }
            ControlCommand::Stop => client.transport("stop").await?,
            ControlCommand::Next => client.transport("next").await?,
            ControlCommand::Previous => client.transport("previous").await?,
            ControlCommand::Seek(position) => client.seek(position.max(0.0) as u32).await?,
            ControlCommand::VolumeAbsolute(v) => client.set_volume(v.round() as i32).await?,
            ControlCommand::VolumeRelative(delta) => {
                let status = client.get_playback_status().await?;
                client
                    .set_volume((status.volume as f64 + delta).round() as i32)
                    .await?
            }
        }
        Ok(())
    }

    async fn get_status(&self) -> Value {
        let views = self.views.read().await;
        json!({
            "instance_count": views.len(),
            "instances": views
                .iter()
                .map(|v| json!({ "name": v.name, "state": v.state.to_string() }))
                .collect::<Vec<_>>(),
        })
    }
}
