//! Roon backend: event-driven pairing with a Roon Core over SOOD discovery
//! and WebSocket, zones via the transport service, album art via the core's
//! image service.
//!
//! Pairing can take arbitrarily long (the user must authorize the extension
//! in Roon Settings), so the backend stays registered and empty until the
//! core shows up. Pairing state persists to `roon_state.json`.

use anyhow::Result;
use async_trait::async_trait;
use roon_api::{
    image::{Args as ImageArgs, Format as RoonImageFormat, Image, Scale, Scaling},
    status::{self, Status},
    transport::{volume, Control, Transport, Zone as RoonZone},
    CoreEvent, Info, Parsed, RoonApi, Services, Svc,
};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::traits::{Backend, Capabilities, ControlCommand};
use crate::bus::error::BridgeError;
use crate::bus::events::{BridgeEvent, SharedEvents};
use crate::bus::types::{
    ImageData, ImageQuery, NowPlaying, PlaybackState, VolumeControl, VolumeType, Zone, ZoneId,
};
use crate::config::config_file_path;

pub const PREFIX: &str = "roon";

const ROON_STATE_FILE: &str = "roon_state.json";
const EXTENSION_ID: &str = "com.hifi-bridge.control";
/// Relative volume steps are capped to keep a stuck knob from slamming an
/// amplifier.
const MAX_RELATIVE_STEP: f64 = 10.0;
const IMAGE_TIMEOUT: Duration = Duration::from_secs(10);
/// Wait between reconnect attempts after a lost core.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Snapshot of one Roon zone kept in adapter state.
#[derive(Debug, Clone)]
struct ZoneView {
    zone_id: String,
    display_name: String,
    state: String,
    is_next_allowed: bool,
    is_previous_allowed: bool,
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    image_key: Option<String>,
    seek_position: Option<i64>,
    length: Option<u32>,
    output_id: Option<String>,
    output_name: Option<String>,
    volume: Option<VolumeControl>,
}

type PendingImage = oneshot::Sender<Option<ImageData>>;

#[derive(Default)]
struct RoonState {
    connected: bool,
    core_name: Option<String>,
    core_version: Option<String>,
    zones: HashMap<String, ZoneView>,
    transport: Option<Transport>,
    image: Option<Image>,
    /// image_key -> waiting fetches
    pending_images: HashMap<String, Vec<PendingImage>>,
}

#[derive(Clone)]
pub struct RoonBackend {
    state: Arc<RwLock<RoonState>>,
    events: SharedEvents,
    shutdown: Arc<RwLock<CancellationToken>>,
    started: Arc<AtomicBool>,
    display_url: String,
}

impl RoonBackend {
    pub fn new(events: SharedEvents, display_url: String) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(RwLock::new(RoonState::default())),
            events,
            shutdown: Arc::new(RwLock::new(CancellationToken::new())),
            started: Arc::new(AtomicBool::new(false)),
            display_url,
        })
    }

    pub async fn core_status(&self) -> (bool, Option<String>, Option<String>) {
        let state = self.state.read().await;
        (state.connected, state.core_name.clone(), state.core_version.clone())
    }

    fn zone_view_to_zone(view: &ZoneView) -> Zone {
        Zone {
            zone_id: ZoneId::join(PREFIX, &view.zone_id),
            zone_name: view.display_name.clone(),
            state: PlaybackState::from(view.state.as_str()),
            output_name: view.output_name.clone(),
            device_name: None,
            volume_control: view.volume.clone(),
            unsupported: {
                let mut tags = BTreeSet::new();
                if !view.is_next_allowed {
                    tags.insert(crate::bus::types::CapabilityTag::Next);
                }
                if !view.is_previous_allowed {
                    tags.insert(crate::bus::types::CapabilityTag::Previous);
                }
                tags
            },
        }
    }

    fn convert_zone(roon_zone: &RoonZone) -> ZoneView {
        use roon_api::transport::State as RoonPlayState;

        let state = match roon_zone.state {
            RoonPlayState::Playing => "playing",
            RoonPlayState::Paused => "paused",
            RoonPlayState::Loading => "loading",
            RoonPlayState::Stopped => "stopped",
        };

        let output = roon_zone.outputs.first();
        // Scale inferred from the declared range: a non-positive max means dB.
        let volume = output.and_then(|o| o.volume.as_ref()).map(|v| {
            let min = v.min.unwrap_or(0.0) as f64;
            let max = v.max.unwrap_or(100.0) as f64;
            VolumeControl {
                volume_type: if max <= 0.0 { VolumeType::Db } else { VolumeType::Number },
                min,
                max,
                step: v.step.unwrap_or(1.0) as f64,
                is_muted: v.is_muted.unwrap_or(false),
                // Missing value reads as min: the safe end of either scale.
                value: Some(v.value.unwrap_or(v.min.unwrap_or(0.0)) as f64),
            }
        });

        ZoneView {
            zone_id: roon_zone.zone_id.clone(),
            display_name: roon_zone.display_name.clone(),
            state: state.to_string(),
            is_next_allowed: roon_zone.is_next_allowed,
            is_previous_allowed: roon_zone.is_previous_allowed,
            title: roon_zone
                .now_playing
                .as_ref()
                .map(|np| np.three_line.line1.clone()),
            artist: roon_zone
                .now_playing
                .as_ref()
                .map(|np| np.three_line.line2.clone()),
            album: roon_zone
                .now_playing
                .as_ref()
                .map(|np| np.three_line.line3.clone()),
            image_key: roon_zone.now_playing.as_ref().and_then(|np| np.image_key.clone()),
            seek_position: roon_zone.now_playing.as_ref().and_then(|np| np.seek_position),
            length: roon_zone.now_playing.as_ref().and_then(|np| np.length),
            output_id: output.map(|o| o.output_id.clone()),
            output_name: output.map(|o| o.display_name.clone()),
            volume,
        }
    }

    /// One discovery/pairing session. Returns `Err` when the core is lost so
    /// the outer loop reconnects.
    async fn run_session(&self, shutdown: CancellationToken) -> Result<()> {
        let state_path = config_file_path(ROON_STATE_FILE);
        if let Some(parent) = state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state_path = state_path.to_string_lossy().to_string();

        let info = Info::new(
            EXTENSION_ID.to_string(),
            "Hi-Fi Bridge",
            env!("CARGO_PKG_VERSION"),
            None,
            "",
            None,
        );
        let mut roon = RoonApi::new(info);
        let (svc, status) = Status::new(&roon);
        let services = vec![
            Services::Transport(Transport::new()),
            Services::Image(Image::new()),
            Services::Status(status),
        ];
        let mut provided: HashMap<String, Svc> = HashMap::new();
        provided.insert(status::SVCNAME.to_owned(), svc);

        let state_path_for_load = state_path.clone();
        let get_roon_state = move || RoonApi::load_roon_state(&state_path_for_load);

        let (mut handles, mut core_rx) = roon
            .start_discovery(Box::new(get_roon_state), provided, Some(services))
            .await
            .ok_or_else(|| anyhow::anyhow!("failed to start Roon discovery"))?;

        info!("Roon discovery armed; authorize in Roon Settings → Extensions");

        let core_lost = Arc::new(AtomicBool::new(false));
        let state = self.state.clone();
        let events = self.events.clone();
        let display_url = self.display_url.clone();
        let state_path_for_events = state_path.clone();
        let shutdown_for_events = shutdown.clone();
        let core_lost_for_events = core_lost.clone();

        handles.spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown_for_events.cancelled() => break,
                    result = core_rx.recv() => result,
                };
                let Some((event, msg)) = received else {
                    core_lost_for_events.store(true, Ordering::SeqCst);
                    break;
                };

                match event {
                    CoreEvent::Registered(mut core, _token) => {
                        let core_name = core.display_name.clone();
                        let core_version = core.display_version.clone();
                        info!("Roon Core paired: {} ({})", core_name, core_version);

                        if let Some(status) = core.get_status() {
                            status
                                .set_status(format!("Connected • {}", display_url), false)
                                .await;
                        }

                        let transport = core.get_transport().cloned();
                        let image = core.get_image().cloned();
                        if let Some(ref t) = transport {
                            t.subscribe_zones().await;
                        }

                        {
                            let mut s = state.write().await;
                            s.connected = true;
                            s.core_name = Some(core_name);
                            s.core_version = Some(core_version);
                            s.transport = transport;
                            s.image = image;
                        }
                        events.publish(BridgeEvent::BackendConnected {
                            prefix: PREFIX.to_string(),
                        });
                    }
                    CoreEvent::Lost(core) => {
                        warn!("Roon Core lost: {}", core.display_name);
                        {
                            let mut s = state.write().await;
                            s.connected = false;
                            s.core_name = None;
                            s.core_version = None;
                            s.zones.clear();
                            s.transport = None;
                            s.image = None;
                            s.pending_images.clear();
                        }
                        events.publish(BridgeEvent::BackendDisconnected {
                            prefix: PREFIX.to_string(),
                            reason: Some("core lost".into()),
                        });
                        events.publish(BridgeEvent::ZoneSetChanged {
                            prefix: PREFIX.to_string(),
                        });
                        core_lost_for_events.store(true, Ordering::SeqCst);
                        break;
                    }
                    _ => {}
                }

                let Some((_, parsed)) = msg else { continue };
                match parsed {
                    Parsed::RoonState(roon_state) => {
                        if let Err(e) = RoonApi::save_roon_state(&state_path_for_events, roon_state)
                        {
                            warn!("Failed to save Roon pairing state: {}", e);
                        }
                    }
                    Parsed::Zones(zones) => {
                        let set_changed = {
                            let mut s = state.write().await;
                            let mut changed = false;
                            for zone in zones {
                                let view = Self::convert_zone(&zone);
                                match s.zones.get(&zone.zone_id) {
                                    Some(old)
                                        if old.display_name == view.display_name
                                            && old.state == view.state
                                            && old.is_next_allowed == view.is_next_allowed
                                            && old.is_previous_allowed
                                                == view.is_previous_allowed => {}
                                    _ => changed = true,
                                }
                                s.zones.insert(zone.zone_id.clone(), view);
                            }
                            changed
                        };
                        if set_changed {
                            events.publish(BridgeEvent::ZoneSetChanged {
                                prefix: PREFIX.to_string(),
                            });
                        }
                    }
                    Parsed::ZonesSeek(seeks) => {
                        let mut s = state.write().await;
                        for seek in seeks {
                            if let Some(view) = s.zones.get_mut(&seek.zone_id) {
                                view.seek_position = seek.seek_position;
                            }
                        }
                    }
                    Parsed::ZonesRemoved(zone_ids) => {
                        {
                            let mut s = state.write().await;
                            for zone_id in &zone_ids {
                                debug!("Roon zone removed: {}", zone_id);
                                s.zones.remove(zone_id);
                            }
                        }
                        events.publish(BridgeEvent::ZoneSetChanged {
                            prefix: PREFIX.to_string(),
                        });
                    }
                    Parsed::Jpeg((image_key, data)) => {
                        Self::deliver_image(&state, &image_key, "image/jpeg", data).await;
                    }
                    Parsed::Png((image_key, data)) => {
                        Self::deliver_image(&state, &image_key, "image/png", data).await;
                    }
                    _ => {}
                }
            }
        });

        // Drive the session until shutdown or core loss.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    handles.abort_all();
                    break;
                }
                joined = handles.join_next() => {
                    if joined.is_none() || core_lost.load(Ordering::SeqCst) {
                        handles.abort_all();
                        break;
                    }
                }
            }
        }

        {
            let mut s = self.state.write().await;
            s.connected = false;
            s.transport = None;
            s.image = None;
            s.zones.clear();
            s.pending_images.clear();
        }

        if core_lost.load(Ordering::SeqCst) && !shutdown.is_cancelled() {
            Err(anyhow::anyhow!("Roon core lost"))
        } else {
            Ok(())
        }
    }

    async fn deliver_image(
        state: &Arc<RwLock<RoonState>>,
        image_key: &str,
        content_type: &str,
        data: Vec<u8>,
    ) {
        let mut s = state.write().await;
        if let Some(waiters) = s.pending_images.remove(image_key) {
            for waiter in waiters {
                let _ = waiter.send(Some(ImageData {
                    content_type: content_type.to_string(),
                    data: data.clone(),
                }));
            }
        }
    }
}

#[async_trait]
impl Backend for RoonBackend {
    fn prefix(&self) -> &str {
        PREFIX
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { images: true }
    }

    async fn start(&self) -> Result<(), BridgeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let shutdown = {
            let mut token = self.shutdown.write().await;
            *token = CancellationToken::new();
            token.clone()
        };

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match this.run_session(shutdown.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!("Roon session ended: {}; reconnecting in {:?}", e, RECONNECT_DELAY);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                }
                if shutdown.is_cancelled() {
                    break;
                }
            }
            info!("Roon backend loop exited");
        });
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.read().await.cancel();
        self.started.store(false, Ordering::SeqCst);
        let mut state = self.state.write().await;
        state.connected = false;
        state.zones.clear();
        state.transport = None;
        state.image = None;
        state.pending_images.clear();
    }

    async fn get_zones(&self) -> Vec<Zone> {
        let state = self.state.read().await;
        let mut zones: Vec<Zone> = state.zones.values().map(Self::zone_view_to_zone).collect();
        zones.sort_by(|a, b| a.zone_name.cmp(&b.zone_name));
        zones
    }

    async fn get_now_playing(&self, native_id: &str) -> Option<NowPlaying> {
        let state = self.state.read().await;
        let view = state.zones.get(native_id)?;
        Some(NowPlaying {
            line1: view.title.clone().filter(|t| !t.is_empty()).unwrap_or_else(|| "Idle".into()),
            line2: view.artist.clone().unwrap_or_default(),
            line3: view.album.clone().filter(|a| !a.is_empty()),
            is_playing: view.state == "playing",
            volume: view.volume.as_ref().and_then(|v| v.value),
            volume_type: view.volume.as_ref().map(|v| v.volume_type),
            volume_step: view.volume.as_ref().map(|v| v.step),
            image_key: view.image_key.clone(),
            length_sec: view.length.map(|l| l as u64),
            seek_position_sec: view.seek_position,
            backend_data: Default::default(),
        })
    }

    async fn control(&self, native_id: &str, command: ControlCommand) -> Result<(), BridgeError> {
        let (transport, view) = {
            let state = self.state.read().await;
            let transport = state
                .transport
                .clone()
                .ok_or_else(|| BridgeError::Unreachable("not paired with a Roon Core".into()))?;
            let view = state
                .zones
                .get(native_id)
                .cloned()
                .ok_or_else(|| BridgeError::ZoneNotFound(native_id.to_string()))?;
            (transport, view)
        };

        match command {
            ControlCommand::Play => {
                transport.control(native_id, &Control::Play).await;
            }
            ControlCommand::Pause => {
                transport.control(native_id, &Control::Pause).await;
            }
            ControlCommand::PlayPause => {
                transport.control(native_id, &Control::PlayPause).await;
            }
            ControlCommand::Stop => {
                transport.control(native_id, &Control::Stop).await;
            }
            ControlCommand::Next => {
                transport.control(native_id, &Control::Next).await;
            }
            ControlCommand::Previous => {
                transport.control(native_id, &Control::Previous).await;
            }
            ControlCommand::VolumeAbsolute(value) => {
                let output_id = view
                    .output_id
                    .ok_or_else(|| BridgeError::Unsupported("zone has no volume output".into()))?;
                // Clamp inside the zone's own declared range; never
                // reinterpret dB as percent.
                let (min, max) = view
                    .volume
                    .as_ref()
                    .map(|v| (v.min, v.max))
                    .unwrap_or((0.0, 100.0));
                let clamped = value.clamp(min, max);
                transport
                    .change_volume(&output_id, &volume::ChangeMode::Absolute, clamped)
                    .await;
            }
            ControlCommand::VolumeRelative(delta) => {
                let output_id = view
                    .output_id
                    .ok_or_else(|| BridgeError::Unsupported("zone has no volume output".into()))?;
                let step = delta.clamp(-MAX_RELATIVE_STEP, MAX_RELATIVE_STEP);
                transport
                    .change_volume(&output_id, &volume::ChangeMode::Relative, step)
                    .await;
            }
            ControlCommand::Seek(position) => {
                transport
                    .seek(native_id, &roon_api::transport::Seek::Absolute, position as i32)
                    .await;
            }
        }
        Ok(())
    }

    async fn get_status(&self) -> Value {
        let state = self.state.read().await;
        json!({
            "connected": state.connected,
            "core_name": state.core_name,
            "core_version": state.core_version,
            "zone_count": state.zones.len(),
        })
    }

    async fn get_image(&self, image_key: &str, query: &ImageQuery) -> Result<ImageData, BridgeError> {
        let image = {
            let state = self.state.read().await;
            state
                .image
                .clone()
                .ok_or_else(|| BridgeError::Unreachable("Roon image service unavailable".into()))?
        };

        let width = query.width.unwrap_or(300);
        let height = query.height.unwrap_or(width);
        let scaling = Some(Scaling::new(Scale::Fit, width, height));
        let args = ImageArgs::new(scaling, Some(RoonImageFormat::Jpeg));

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.write().await;
            state
                .pending_images
                .entry(image_key.to_string())
                .or_default()
                .push(tx);
        }
        let _ = image.get_image(image_key, args).await;

        let result = tokio::time::timeout(IMAGE_TIMEOUT, rx).await;
        if !matches!(result, Ok(Ok(Some(_)))) {
            // Drop any leftover waiter so the map does not accumulate.
            let mut state = self.state.write().await;
            state.pending_images.remove(image_key);
        }
        match result {
            Ok(Ok(Some(data))) => Ok(data),
            Ok(Ok(None)) => Err(BridgeError::ZoneNotFound(format!("image {}", image_key))),
            Ok(Err(_)) => Err(BridgeError::Internal("image request dropped".into())),
            Err(_) => Err(BridgeError::Unreachable("image request timed out".into())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn view(min: f64, max: f64, value: Option<f64>) -> ZoneView {
        ZoneView {
            zone_id: "z1".into(),
            display_name: "Living Room".into(),
            state: "playing".into(),
            is_next_allowed: true,
            is_previous_allowed: false,
            title: Some("Song".into()),
            artist: Some("Artist".into()),
            album: None,
            image_key: Some("img1".into()),
            seek_position: Some(10),
            length: Some(200),
            output_id: Some("o1".into()),
            output_name: Some("DAC".into()),
            volume: Some(VolumeControl {
                volume_type: if max <= 0.0 { VolumeType::Db } else { VolumeType::Number },
                min,
                max,
                step: 0.5,
                is_muted: false,
                value,
            }),
        }
    }

    #[test]
    fn db_zone_keeps_db_scale() {
        let zone = RoonBackend::zone_view_to_zone(&view(-80.0, 0.0, Some(-30.0)));
        assert_eq!(zone.zone_id.as_str(), "roon:z1");
        let vc = zone.volume_control.unwrap();
        assert_eq!(vc.volume_type, VolumeType::Db);
        assert_eq!(vc.min, -80.0);
        assert_eq!(vc.value, Some(-30.0));
    }

    #[test]
    fn disallowed_navigation_maps_to_unsupported_tags() {
        let zone = RoonBackend::zone_view_to_zone(&view(0.0, 100.0, Some(25.0)));
        assert!(!zone.unsupported.contains(&crate::bus::types::CapabilityTag::Next));
        assert!(zone
            .unsupported
            .contains(&crate::bus::types::CapabilityTag::Previous));
    }
}
