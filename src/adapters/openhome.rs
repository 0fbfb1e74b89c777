//! OpenHome backend: SSDP discovery of OpenHome sources and SOAP calls
//! against the Transport, Info and Volume services.
//!
//! Unlike plain DLNA, OpenHome devices carry playlist navigation, track
//! metadata (DIDL-Lite) and a declared volume limit, so zones come out
//! full-featured.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::traits::{Backend, Capabilities, ControlCommand};
use crate::adapters::upnp::{extract_tag, parse_hms, service_control_url};
use crate::bus::error::BridgeError;
use crate::bus::events::{BridgeEvent, SharedEvents};
use crate::bus::types::{
    ImageData, ImageQuery, NowPlaying, PlaybackState, VolumeControl, VolumeType, Zone, ZoneId,
};

pub const PREFIX: &str = "openhome";

const PRODUCT_URN: &str = "urn:av-openhome-org:service:Product:1";
const TRANSPORT_URN: &str = "urn:av-openhome-org:service:Transport:1";
const INFO_URN: &str = "urn:av-openhome-org:service:Info:1";
const VOLUME_URN: &str = "urn:av-openhome-org:service:Volume:1";
const SEARCH_INTERVAL: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const STALE_AFTER: Duration = Duration::from_secs(90);
const SOAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Track fields decoded from DIDL-Lite metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct TrackInfo {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub art_uri: Option<String>,
    pub duration_sec: Option<u64>,
}

#[derive(Debug, Clone)]
pub(crate) struct Device {
    pub uuid: String,
    pub name: String,
    pub state: String,
    pub track: TrackInfo,
    pub position_sec: Option<i64>,
    pub volume: Option<i64>,
    pub volume_limit: i64,
    pub muted: bool,
    pub last_seen: Instant,
    pub transport_url: Option<String>,
    pub info_url: Option<String>,
    pub volume_url: Option<String>,
}

struct OpenHomeState {
    devices: HashMap<String, Device>,
    running: bool,
}

#[derive(Clone)]
pub struct OpenHomeBackend {
    state: Arc<RwLock<OpenHomeState>>,
    http: Client,
    events: SharedEvents,
    shutdown: Arc<RwLock<CancellationToken>>,
}

impl OpenHomeBackend {
    pub fn new(events: SharedEvents) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(RwLock::new(OpenHomeState {
                devices: HashMap::new(),
                running: false,
            })),
            http: Client::builder()
                .timeout(SOAP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            events,
            shutdown: Arc::new(RwLock::new(CancellationToken::new())),
        })
    }

    async fn discovery_loop(self, shutdown: CancellationToken) {
        let mut ticker = interval(SEARCH_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.search_once().await {
                        debug!("OpenHome SSDP search failed: {}", e);
                    }
                    self.evict_stale().await;
                }
            }
        }
        info!("OpenHome discovery loop stopped");
    }

    async fn search_once(&self) -> Result<()> {
        let urn: ssdp_client::URN = PRODUCT_URN.parse()?;
        let responses = ssdp_client::search(
            &ssdp_client::SearchTarget::URN(urn),
            Duration::from_secs(3),
            2,
            None,
        )
        .await?;
        futures::pin_mut!(responses);

        let mut changed = false;
        while let Some(response) = responses.next().await {
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    debug!("OpenHome SSDP response error: {}", e);
                    continue;
                }
            };
            let location = response.location().to_string();
            let uuid = match response.usn().split("::").next() {
                Some(s) if s.starts_with("uuid:") => s.trim_start_matches("uuid:").to_string(),
                _ => continue,
            };

            {
                let mut state = self.state.write().await;
                if let Some(device) = state.devices.get_mut(&uuid) {
                    device.last_seen = Instant::now();
                    continue;
                }
            }

            match self.describe(&uuid, &location).await {
                Ok(device) => {
                    info!("Discovered OpenHome device: {} ({})", device.name, uuid);
                    self.state.write().await.devices.insert(uuid, device);
                    changed = true;
                }
                Err(e) => debug!("OpenHome description for {} failed: {}", location, e),
            }
        }

        if changed {
            self.events.publish(BridgeEvent::ZoneSetChanged {
                prefix: PREFIX.to_string(),
            });
        }
        Ok(())
    }

    async fn describe(&self, uuid: &str, location: &str) -> Result<Device> {
        let xml = self.http.get(location).send().await?.text().await?;
        let name = extract_tag(&xml, "friendlyName")
            .unwrap_or_else(|| format!("OpenHome {}", &uuid[..8.min(uuid.len())]));
        let base = url::Url::parse(location)?;
        let resolve = |control_url: Option<String>| -> Option<String> {
            control_url.and_then(|u| base.join(&u).ok().map(|abs| abs.to_string()))
        };

        Ok(Device {
            uuid: uuid.to_string(),
            name,
            state: "stopped".to_string(),
            track: TrackInfo::default(),
            position_sec: None,
            volume: None,
            volume_limit: 100,
            muted: false,
            last_seen: Instant::now(),
            transport_url: resolve(service_control_url(&xml, TRANSPORT_URN)),
            info_url: resolve(service_control_url(&xml, INFO_URN)),
            volume_url: resolve(service_control_url(&xml, VOLUME_URN)),
        })
    }

    async fn evict_stale(&self) {
        let evicted = {
            let mut state = self.state.write().await;
            let stale: Vec<String> = state
                .devices
                .iter()
                .filter(|(_, d)| d.last_seen.elapsed() > STALE_AFTER)
                .map(|(uuid, _)| uuid.clone())
                .collect();
            for uuid in &stale {
                warn!("OpenHome device {} went stale, removing", uuid);
                state.devices.remove(uuid);
            }
            !stale.is_empty()
        };
        if evicted {
            self.events.publish(BridgeEvent::ZoneSetChanged {
                prefix: PREFIX.to_string(),
            });
        }
    }

    async fn poll_loop(self, shutdown: CancellationToken) {
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.poll_once().await,
            }
        }
        info!("OpenHome poll loop stopped");
    }

    async fn poll_once(&self) {
        let targets: Vec<(String, Option<String>, Option<String>, Option<String>)> = {
            let state = self.state.read().await;
            state
                .devices
                .values()
                .map(|d| {
                    (
                        d.uuid.clone(),
                        d.transport_url.clone(),
                        d.info_url.clone(),
                        d.volume_url.clone(),
                    )
                })
                .collect()
        };

        let mut set_changed = false;
        for (uuid, transport, info, volume) in targets {
            let mut new_state = None;
            if let Some(ref url) = transport {
                if let Ok(body) = self.soap(url, TRANSPORT_URN, "TransportState", "").await {
                    new_state =
                        extract_tag(&body, "State").map(|s| openhome_state_label(&s).to_string());
                }
            }

            let mut track = None;
            if let Some(ref url) = info {
                if let Ok(body) = self.soap(url, INFO_URN, "Track", "").await {
                    let metadata = extract_tag(&body, "Metadata").unwrap_or_default();
                    track = Some(parse_didl(&xml_unescape(&metadata)));
                }
            }

            let mut vol = None;
            let mut limit = None;
            let mut muted = None;
            if let Some(ref url) = volume {
                if let Ok(body) = self.soap(url, VOLUME_URN, "Volume", "").await {
                    vol = extract_tag(&body, "Value").and_then(|v| v.parse::<i64>().ok());
                }
                if let Ok(body) = self.soap(url, VOLUME_URN, "VolumeLimit", "").await {
                    limit = extract_tag(&body, "Value").and_then(|v| v.parse::<i64>().ok());
                }
                if let Ok(body) = self.soap(url, VOLUME_URN, "Mute", "").await {
                    muted = extract_tag(&body, "Value").map(|v| v == "1" || v == "true");
                }
            }

            let mut state = self.state.write().await;
            if let Some(device) = state.devices.get_mut(&uuid) {
                if let Some(s) = new_state {
                    if device.state != s {
                        device.state = s;
                        set_changed = true;
                    }
                }
                if let Some(t) = track {
                    device.track = t;
                }
                if vol.is_some() {
                    device.volume = vol;
                }
                if let Some(l) = limit {
                    device.volume_limit = l.max(1);
                }
                if let Some(m) = muted {
                    device.muted = m;
                }
                device.last_seen = Instant::now();
            }
        }

        if set_changed {
            self.events.publish(BridgeEvent::ZoneSetChanged {
                prefix: PREFIX.to_string(),
            });
        }
    }

    async fn soap(&self, url: &str, urn: &str, action: &str, args: &str) -> Result<String> {
        let envelope = format!(
            r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body><u:{action} xmlns:u="{urn}">{args}</u:{action}></s:Body></s:Envelope>"#
        );
        let response = self
            .http
            .post(url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{}#{}\"", urn, action))
            .body(envelope)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("SOAP {} failed: {}", action, response.status()));
        }
        Ok(response.text().await?)
    }

    async fn device(&self, native_id: &str) -> Option<Device> {
        self.state.read().await.devices.get(native_id).cloned()
    }

    fn device_to_zone(device: &Device) -> Zone {
        Zone {
            zone_id: ZoneId::join(PREFIX, &device.uuid),
            zone_name: device.name.clone(),
            state: PlaybackState::from(device.state.as_str()),
            output_name: None,
            device_name: Some(device.name.clone()),
            volume_control: device.volume.map(|v| VolumeControl {
                volume_type: VolumeType::Number,
                min: 0.0,
                max: device.volume_limit as f64,
                step: 1.0,
                is_muted: device.muted,
                value: Some(v as f64),
            }),
            unsupported: BTreeSet::new(),
        }
    }
}

#[async_trait]
impl Backend for OpenHomeBackend {
    fn prefix(&self) -> &str {
        PREFIX
    }

    fn capabilities(&self) -> Capabilities {
        // Album art arrives as absolute URIs in the DIDL metadata.
        Capabilities { images: true }
    }

    async fn start(&self) -> Result<(), BridgeError> {
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
        tokio::spawn(self.clone().discovery_loop(shutdown.clone()));
        tokio::spawn(self.clone().poll_loop(shutdown));
        info!("OpenHome backend started");
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.read().await.cancel();
        let mut state = self.state.write().await;
        state.running = false;
        state.devices.clear();
    }

    async fn get_zones(&self) -> Vec<Zone> {
        let state = self.state.read().await;
        let mut zones: Vec<Zone> = state.devices.values().map(Self::device_to_zone).collect();
        zones.sort_by(|a, b| a.zone_name.cmp(&b.zone_name));
        zones
    }

    async fn get_now_playing(&self, native_id: &str) -> Option<NowPlaying> {
        let device = self.device(native_id).await?;
        let is_playing = device.state == "playing";
        Some(NowPlaying {
            line1: if device.track.title.is_empty() {
                "Idle".to_string()
            } else {
                device.track.title.clone()
            },
            line2: device.track.artist.clone(),
            line3: (!device.track.album.is_empty()).then(|| device.track.album.clone()),
            is_playing,
            volume: device.volume.map(|v| v as f64),
            volume_type: Some(VolumeType::Number),
            volume_step: Some(1.0),
            image_key: device.track.art_uri.clone(),
            length_sec: device.track.duration_sec,
            seek_position_sec: device.position_sec,
            backend_data: Default::default(),
        })
    }

    async fn control(&self, native_id: &str, command: ControlCommand) -> Result<(), BridgeError> {
        let device = self
            .device(native_id)
            .await
            .ok_or_else(|| BridgeError::ZoneNotFound(native_id.to_string()))?;

        let transport = |url: &Option<String>| -> Result<String, BridgeError> {
            url.clone()
                .ok_or_else(|| BridgeError::Unsupported("no Transport service".into()))
        };

        let result = match command {
            ControlCommand::Play => {
                self.soap(&transport(&device.transport_url)?, TRANSPORT_URN, "Play", "")
                    .await
            }
            ControlCommand::Pause => {
                self.soap(&transport(&device.transport_url)?, TRANSPORT_URN, "Pause", "")
                    .await
            }
            ControlCommand::PlayPause => {
                let action = if device.state == "playing" { "Pause" } else { "Play" };
                self.soap(&transport(&device.transport_url)?, TRANSPORT_URN, action, "")
                    .await
            }
            ControlCommand::Stop => {
                self.soap(&transport(&device.transport_url)?, TRANSPORT_URN, "Stop", "")
                    .await
            }
            ControlCommand::Next => {
                self.soap(&transport(&device.transport_url)?, TRANSPORT_URN, "SkipNext", "")
                    .await
            }
            ControlCommand::Previous => {
                self.soap(
                    &transport(&device.transport_url)?,
                    TRANSPORT_URN,
                    "SkipPrevious",
                    "",
                )
                .await
            }
            ControlCommand::Seek(position) => {
                self.soap(
                    &transport(&device.transport_url)?,
                    TRANSPORT_URN,
                    "SeekSecondAbsolute",
                    &format!("<StreamId>0</StreamId><SecondAbsolute>{}</SecondAbsolute>", position.max(0.0) as u64),
                )
                .await
            }
            ControlCommand::VolumeAbsolute(v) => {
                let url = device
                    .volume_url
                    .clone()
                    .ok_or_else(|| BridgeError::Unsupported("no Volume service".into()))?;
                let clamped = v.round().clamp(0.0, device.volume_limit as f64) as i64;
                self.soap(&url, VOLUME_URN, "SetVolume", &format!("<Value>{}</Value>", clamped))
                    .await
            }
            ControlCommand::VolumeRelative(delta) => {
                let url = device
                    .volume_url
                    .clone()
                    .ok_or_else(|| BridgeError::Unsupported("no Volume service".into()))?;
                let current = device.volume.unwrap_or(0) as f64;
                let clamped = (current + delta)
                    .round()
                    .clamp(0.0, device.volume_limit as f64) as i64;
                self.soap(&url, VOLUME_URN, "SetVolume", &format!("<Value>{}</Value>", clamped))
                    .await
            }
        };

        result.map_err(|e| BridgeError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn get_status(&self) -> Value {
        let state = self.state.read().await;
        json!({
            "running": state.running,
            "device_count": state.devices.len(),
            "devices": state
                .devices
                .values()
                .map(|d| json!({ "uuid": d.uuid, "name": d.name, "state": d.state }))
                .collect::<Vec<_>>(),
        })
    }

    /// `image_key` is the absolute album-art URI from the DIDL metadata.
    async fn get_image(&self, image_key: &str, _query: &ImageQuery) -> Result<ImageData, BridgeError> {
        if !(image_key.starts_with("http://") || image_key.starts_with("https://")) {
            return Err(BridgeError::BadRequest("expected absolute art URI".into()));
        }
        let response = self
            .http
            .get(image_key)
            .send()
            .await
            .map_err(|e| BridgeError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BridgeError::Unreachable(format!(
                "art fetch failed: {}",
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

fn openhome_state_label(raw: &str) -> &'static str {
    match raw {
        "Playing" => "playing",
        "Paused" => "paused",
        "Buffering" | "Waiting" => "buffering",
        _ => "stopped",
    }
}

/// Minimal XML entity decoding for DIDL payloads embedded in SOAP responses.
pub(crate) fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Pull track fields out of a DIDL-Lite document.
pub(crate) fn parse_didl(didl: &str) -> TrackInfo {
    let duration = regex::Regex::new(r#"duration="(\d+:\d{2}:\d{2})[^"]*""#)
        .ok()
        .and_then(|re| re.captures(didl).and_then(|c| parse_hms(&c[1])))
        .map(|s| s as u64);

    TrackInfo {
        title: extract_tag(didl, "dc:title").unwrap_or_default(),
        artist: extract_tag(didl, "upnp:artist")
            .or_else(|| extract_tag(didl, "dc:creator"))
            .unwrap_or_default(),
        album: extract_tag(didl, "upnp:album").unwrap_or_default(),
        art_uri: extract_tag(didl, "upnp:albumArtURI"),
        duration_sec: duration,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const DIDL: &str = r#"<DIDL-Lite xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/" xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/">
        <item id="1">
          <dc:title>Blue in Green</dc:title>
          <upnp:artist>Miles Davis</upnp:artist>
          <upnp:album>Kind of Blue</upnp:album>
          <upnp:albumArtURI>http://10.0.0.7/art/123.jpg</upnp:albumArtURI>
          <res duration="0:05:37.000">http://10.0.0.7/stream/123.flac</res>
        </item>
      </DIDL-Lite>"#;

    #[test]
    fn didl_parsing_extracts_track_fields() {
        let track = parse_didl(DIDL);
        assert_eq!(track.title, "Blue in Green");
        assert_eq!(track.artist, "Miles Davis");
        assert_eq!(track.album, "Kind of Blue");
        assert_eq!(track.art_uri.as_deref(), Some("http://10.0.0.7/art/123.jpg"));
        assert_eq!(track.duration_sec, Some(337));
    }

    #[test]
    fn didl_survives_escaped_embedding() {
        let escaped = DIDL
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        let track = parse_didl(&xml_unescape(&escaped));
        assert_eq!(track.title, "Blue in Green");
    }

    #[test]
    fn state_labels() {
        assert_eq!(openhome_state_label("Playing"), "playing");
        assert_eq!(openhome_state_label("Paused"), "paused");
        assert_eq!(openhome_state_label("Buffering"), "buffering");
        assert_eq!(openhome_state_label("Stopped"), "stopped");
    }

    #[test]
    fn zone_mapping_keeps_full_capability_set() {
        let device = Device {
            uuid: "u1".into(),
            name: "Office".into(),
            state: "playing".into(),
            track: TrackInfo::default(),
            position_sec: None,
            volume: Some(30),
            volume_limit: 100,
            muted: false,
            last_seen: Instant::now(),
            transport_url: None,
            info_url: None,
            volume_url: None,
        };
        let zone = OpenHomeBackend::device_to_zone(&device);
        assert_eq!(zone.zone_id.as_str(), "openhome:u1");
        assert!(zone.unsupported.is_empty());
        assert_eq!(zone.volume_control.unwrap().max, 100.0);
    }
}
