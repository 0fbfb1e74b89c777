//! Basic UPnP/DLNA backend: SSDP discovery of `MediaRenderer:1` devices and
//! AVTransport/RenderingControl SOAP calls.
//!
//! Plain DLNA renderers expose no playlist navigation and no reliable track
//! metadata, so zones declare `unsupported = {next, previous, track_metadata,
//! album_art}`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
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
use crate::bus::error::BridgeError;
use crate::bus::events::{BridgeEvent, SharedEvents};
use crate::bus::types::{
    CapabilityTag, NowPlaying, PlaybackState, VolumeControl, VolumeType, Zone, ZoneId,
};

pub const PREFIX: &str = "upnp";

const MEDIA_RENDERER_URN: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";
const AV_TRANSPORT_URN: &str = "urn:schemas-upnp-org:service:AVTransport:1";
const RENDERING_CONTROL_URN: &str = "urn:schemas-upnp-org:service:RenderingControl:1";
const SEARCH_INTERVAL: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// A renderer silent for this long is considered gone.
const STALE_AFTER: Duration = Duration::from_secs(90);
const SOAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub(crate) struct Renderer {
    pub uuid: String,
    pub name: String,
    pub model: Option<String>,
    pub state: String,
    pub volume: Option<i64>,
    pub muted: bool,
    pub position_sec: Option<i64>,
    pub duration_sec: Option<u64>,
    pub last_seen: Instant,
    pub av_transport_url: Option<String>,
    pub rendering_control_url: Option<String>,
}

struct UpnpState {
    renderers: HashMap<String, Renderer>,
    running: bool,
}

#[derive(Clone)]
pub struct UpnpBackend {
    state: Arc<RwLock<UpnpState>>,
    http: Client,
    events: SharedEvents,
    shutdown: Arc<RwLock<CancellationToken>>,
}

impl UpnpBackend {
    pub fn new(events: SharedEvents) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(RwLock::new(UpnpState {
                renderers: HashMap::new(),
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
                        debug!("SSDP search failed: {}", e);
                    }
                    self.evict_stale().await;
                }
            }
        }
        info!("UPnP discovery loop stopped");
    }

    async fn search_once(&self) -> Result<()> {
        let urn: ssdp_client::URN = MEDIA_RENDERER_URN.parse()?;
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
                    debug!("SSDP response error: {}", e);
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
                if let Some(renderer) = state.renderers.get_mut(&uuid) {
                    renderer.last_seen = Instant::now();
                    continue;
                }
            }

            match self.describe(&uuid, &location).await {
                Ok(renderer) => {
                    info!("Discovered DLNA renderer: {} ({})", renderer.name, uuid);
                    self.state.write().await.renderers.insert(uuid, renderer);
                    changed = true;
                }
                Err(e) => debug!("Description fetch for {} failed: {}", location, e),
            }
        }

        if changed {
            self.events.publish(BridgeEvent::ZoneSetChanged {
                prefix: PREFIX.to_string(),
            });
        }
        Ok(())
    }

    /// Fetch the device description and resolve control URLs.
    async fn describe(&self, uuid: &str, location: &str) -> Result<Renderer> {
        let xml = self.http.get(location).send().await?.text().await?;
        let name = extract_tag(&xml, "friendlyName")
            .unwrap_or_else(|| format!("Renderer {}", &uuid[..8.min(uuid.len())]));
        let model = extract_tag(&xml, "modelName");
        let base = url::Url::parse(location)?;

        let resolve = |control_url: Option<String>| -> Option<String> {
            control_url.and_then(|u| base.join(&u).ok().map(|abs| abs.to_string()))
        };

        Ok(Renderer {
            uuid: uuid.to_string(),
            name,
            model,
            state: "stopped".to_string(),
            volume: None,
            muted: false,
            position_sec: None,
            duration_sec: None,
            last_seen: Instant::now(),
            av_transport_url: resolve(service_control_url(&xml, AV_TRANSPORT_URN)),
            rendering_control_url: resolve(service_control_url(&xml, RENDERING_CONTROL_URN)),
        })
    }

    async fn evict_stale(&self) {
        let evicted = {
            let mut state = self.state.write().await;
            let stale: Vec<String> = state
                .renderers
                .iter()
                .filter(|(_, r)| r.last_seen.elapsed() > STALE_AFTER)
                .map(|(uuid, _)| uuid.clone())
                .collect();
            for uuid in &stale {
                warn!("DLNA renderer {} went stale, removing", uuid);
                state.renderers.remove(uuid);
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
        info!("UPnP poll loop stopped");
    }

    async fn poll_once(&self) {
        let targets: Vec<(String, Option<String>, Option<String>)> = {
            let state = self.state.read().await;
            state
                .renderers
                .values()
                .map(|r| {
                    (
                        r.uuid.clone(),
                        r.av_transport_url.clone(),
                        r.rendering_control_url.clone(),
                    )
                })
                .collect()
        };

        let mut state_changed = false;
        for (uuid, transport_url, rendering_url) in targets {
            let mut new_state = None;
            let mut position = None;
            if let Some(ref url) = transport_url {
                if let Ok(body) = self
                    .soap(url, AV_TRANSPORT_URN, "GetTransportInfo", "<InstanceID>0</InstanceID>")
                    .await
                {
                    new_state = extract_tag(&body, "CurrentTransportState")
                        .map(|s| transport_state_label(&s).to_string());
                }
                if let Ok(body) = self
                    .soap(url, AV_TRANSPORT_URN, "GetPositionInfo", "<InstanceID>0</InstanceID>")
                    .await
                {
                    position = Some((
                        extract_tag(&body, "RelTime").and_then(|t| parse_hms(&t)),
                        extract_tag(&body, "TrackDuration").and_then(|t| parse_hms(&t)),
                    ));
                }
            }

            let mut volume = None;
            let mut muted = None;
            if let Some(ref url) = rendering_url {
                if let Ok(body) = self
                    .soap(
                        url,
                        RENDERING_CONTROL_URN,
                        "GetVolume",
                        "<InstanceID>0</InstanceID><Channel>Master</Channel>",
                    )
                    .await
                {
                    volume = extract_tag(&body, "CurrentVolume").and_then(|v| v.parse::<i64>().ok());
                }
                if let Ok(body) = self
                    .soap(
                        url,
                        RENDERING_CONTROL_URN,
                        "GetMute",
                        "<InstanceID>0</InstanceID><Channel>Master</Channel>",
                    )
                    .await
                {
                    muted = extract_tag(&body, "CurrentMute").map(|v| v == "1");
                }
            }

            let mut state = self.state.write().await;
            if let Some(renderer) = state.renderers.get_mut(&uuid) {
                if let Some(s) = new_state {
                    if renderer.state != s {
                        renderer.state = s;
                        state_changed = true;
                    }
                }
                if let Some((pos, dur)) = position {
                    renderer.position_sec = pos;
                    renderer.duration_sec = dur.map(|d| d as u64);
                }
                if volume.is_some() {
                    renderer.volume = volume;
                }
                if let Some(m) = muted {
                    renderer.muted = m;
                }
                renderer.last_seen = Instant::now();
            }
        }

        if state_changed {
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

    async fn renderer(&self, native_id: &str) -> Option<Renderer> {
        self.state.read().await.renderers.get(native_id).cloned()
    }

    fn renderer_to_zone(renderer: &Renderer) -> Zone {
        let unsupported: BTreeSet<CapabilityTag> = [
            CapabilityTag::Next,
            CapabilityTag::Previous,
            CapabilityTag::TrackMetadata,
            CapabilityTag::AlbumArt,
        ]
        .into_iter()
        .collect();

        Zone {
            zone_id: ZoneId::join(PREFIX, &renderer.uuid),
            zone_name: renderer.name.clone(),
            state: PlaybackState::from(renderer.state.as_str()),
            output_name: None,
            device_name: renderer.model.clone(),
            volume_control: renderer.volume.map(|v| VolumeControl {
                volume_type: VolumeType::Number,
                min: 0.0,
                max: 100.0,
                step: 1.0,
                is_muted: renderer.muted,
                value: Some(v as f64),
            }),
            unsupported,
        }
    }
}

#[async_trait]
impl Backend for UpnpBackend {
    fn prefix(&self) -> &str {
        PREFIX
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
        info!("UPnP backend started");
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.read().await.cancel();
        let mut state = self.state.write().await;
        state.running = false;
        state.renderers.clear();
    }

    async fn get_zones(&self) -> Vec<Zone> {
        let state = self.state.read().await;
        let mut zones: Vec<Zone> = state.renderers.values().map(Self::renderer_to_zone).collect();
        zones.sort_by(|a, b| a.zone_name.cmp(&b.zone_name));
        zones
    }

    async fn get_now_playing(&self, native_id: &str) -> Option<NowPlaying> {
        let renderer = self.renderer(native_id).await?;
        let is_playing = renderer.state == "playing";
        Some(NowPlaying {
            // No track metadata on plain DLNA; show the device instead.
            line1: if is_playing { renderer.name.clone() } else { "Idle".into() },
            line2: renderer.model.clone().unwrap_or_default(),
            line3: None,
            is_playing,
            volume: renderer.volume.map(|v| v as f64),
            volume_type: Some(VolumeType::Number),
            volume_step: Some(1.0),
            image_key: None,
            length_sec: renderer.duration_sec,
            seek_position_sec: renderer.position_sec,
            backend_data: Default::default(),
        })
    }

    async fn control(&self, native_id: &str, command: ControlCommand) -> Result<(), BridgeError> {
        let renderer = self
            .renderer(native_id)
            .await
            .ok_or_else(|| BridgeError::ZoneNotFound(native_id.to_string()))?;
        let transport = renderer
            .av_transport_url
            .clone()
            .ok_or_else(|| BridgeError::Unsupported("no AVTransport service".into()))?;

        let result = match command {
            ControlCommand::Play => {
                self.soap(
                    &transport,
                    AV_TRANSPORT_URN,
                    "Play",
                    "<InstanceID>0</InstanceID><Speed>1</Speed>",
                )
                .await
            }
            ControlCommand::Pause => {
                self.soap(&transport, AV_TRANSPORT_URN, "Pause", "<InstanceID>0</InstanceID>")
                    .await
            }
            ControlCommand::PlayPause => {
                let action = if renderer.state == "playing" { "Pause" } else { "Play" };
                let args = if action == "Play" {
                    "<InstanceID>0</InstanceID><Speed>1</Speed>"
                } else {
                    "<InstanceID>0</InstanceID>"
                };
                self.soap(&transport, AV_TRANSPORT_URN, action, args).await
            }
            ControlCommand::Stop => {
                self.soap(&transport, AV_TRANSPORT_URN, "Stop", "<InstanceID>0</InstanceID>")
                    .await
            }
            // Plain UPnP renderers have no playlist to navigate.
            ControlCommand::Next | ControlCommand::Previous => {
                return Err(BridgeError::Unsupported(
                    "track navigation on basic UPnP".into(),
                ))
            }
            ControlCommand::Seek(position) => {
                let target = format_hms(position.max(0.0) as u64);
                self.soap(
                    &transport,
                    AV_TRANSPORT_URN,
                    "Seek",
                    &format!("<InstanceID>0</InstanceID><Unit>REL_TIME</Unit><Target>{}</Target>", target),
                )
                .await
            }
            ControlCommand::VolumeAbsolute(v) => {
                let rendering = renderer
                    .rendering_control_url
                    .clone()
                    .ok_or_else(|| BridgeError::Unsupported("no RenderingControl service".into()))?;
                self.soap(
                    &rendering,
                    RENDERING_CONTROL_URN,
                    "SetVolume",
                    &format!(
                        "<InstanceID>0</InstanceID><Channel>Master</Channel><DesiredVolume>{}</DesiredVolume>",
                        v.round().clamp(0.0, 100.0) as i64
                    ),
                )
                .await
            }
            ControlCommand::VolumeRelative(delta) => {
                let rendering = renderer
                    .rendering_control_url
                    .clone()
                    .ok_or_else(|| BridgeError::Unsupported("no RenderingControl service".into()))?;
                let current = renderer.volume.unwrap_or(0) as f64;
                self.soap(
                    &rendering,
                    RENDERING_CONTROL_URN,
                    "SetVolume",
                    &format!(
                        "<InstanceID>0</InstanceID><Channel>Master</Channel><DesiredVolume>{}</DesiredVolume>",
                        (current + delta).round().clamp(0.0, 100.0) as i64
                    ),
                )
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
            "renderer_count": state.renderers.len(),
            "renderers": state
                .renderers
                .values()
                .map(|r| json!({ "uuid": r.uuid, "name": r.name, "state": r.state }))
                .collect::<Vec<_>>(),
        })
    }
}

/// First `<tag>…</tag>` text content (namespace-insensitive enough for
/// device descriptions and SOAP bodies).
pub(crate) fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let Ok(re) = Regex::new(&format!(r"<{0}[^>]*>([^<]*)</{0}>", regex::escape(tag))) else {
        return None;
    };
    re.captures(xml).map(|c| c[1].trim().to_string()).filter(|s| !s.is_empty())
}

/// Control URL of the service block matching a URN.
pub(crate) fn service_control_url(xml: &str, urn: &str) -> Option<String> {
    let Ok(service_re) = Regex::new(r"<service>([\s\S]*?)</service>") else {
        return None;
    };
    for cap in service_re.captures_iter(xml) {
        let block = &cap[1];
        if block.contains(urn) {
            return extract_tag(block, "controlURL");
        }
    }
    None
}

/// `H:MM:SS[.fff]` to seconds.
pub(crate) fn parse_hms(value: &str) -> Option<i64> {
    let value = value.split('.').next()?;
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: i64 = parts[0].parse().ok()?;
    let minutes: i64 = parts[1].parse().ok()?;
    let seconds: i64 = parts[2].parse().ok()?;
    Some(hours * 3600 + minutes * 60 + seconds)
}

pub(crate) fn format_hms(total: u64) -> String {
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

fn transport_state_label(raw: &str) -> &'static str {
    match raw {
        "PLAYING" => "playing",
        "PAUSED_PLAYBACK" => "paused",
        "TRANSITIONING" => "buffering",
        _ => "stopped",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn description_parsing_resolves_service_urls() {
        let xml = r#"
            <root>
              <device>
                <friendlyName>Den Renderer</friendlyName>
                <modelName>StreamBox</modelName>
                <serviceList>
                  <service>
                    <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
                    <controlURL>/av/control</controlURL>
                  </service>
                  <service>
                    <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
                    <controlURL>/rc/control</controlURL>
                  </service>
                </serviceList>
              </device>
            </root>"#;
        assert_eq!(extract_tag(xml, "friendlyName").as_deref(), Some("Den Renderer"));
        assert_eq!(
            service_control_url(xml, AV_TRANSPORT_URN).as_deref(),
            Some("/av/control")
        );
        assert_eq!(
            service_control_url(xml, RENDERING_CONTROL_URN).as_deref(),
            Some("/rc/control")
        );
        assert_eq!(service_control_url(xml, "urn:none"), None);
    }

    #[test]
    fn hms_round_trip() {
        assert_eq!(parse_hms("0:03:25"), Some(205));
        assert_eq!(parse_hms("1:00:00.500"), Some(3600));
        assert_eq!(parse_hms("bogus"), None);
        assert_eq!(format_hms(205), "0:03:25");
        assert_eq!(format_hms(3661), "1:01:01");
    }

    #[test]
    fn zone_declares_unsupported_capabilities() {
        let renderer = Renderer {
            uuid: "abc".into(),
            name: "Den".into(),
            model: None,
            state: "playing".into(),
            volume: Some(40),
            muted: false,
            position_sec: None,
            duration_sec: None,
            last_seen: Instant::now(),
            av_transport_url: None,
            rendering_control_url: None,
        };
        let zone = UpnpBackend::renderer_to_zone(&renderer);
        assert_eq!(zone.zone_id.as_str(), "upnp:abc");
        assert!(zone.unsupported.contains(&CapabilityTag::Next));
        assert!(zone.unsupported.contains(&CapabilityTag::Previous));
        assert!(zone.unsupported.contains(&CapabilityTag::TrackMetadata));
        assert!(zone.unsupported.contains(&CapabilityTag::AlbumArt));
    }

    #[tokio::test]
    async fn next_is_unsupported() {
        let backend = UpnpBackend::new(crate::bus::events::create_events());
        backend.state.write().await.renderers.insert(
            "abc".into(),
            Renderer {
                uuid: "abc".into(),
                name: "Den".into(),
                model: None,
                state: "stopped".into(),
                volume: None,
                muted: false,
                position_sec: None,
                duration_sec: None,
                last_seen: Instant::now(),
                av_transport_url: Some("http://10.0.0.2/av".into()),
                rendering_control_url: None,
            },
        );
        let err = backend.control("abc", ControlCommand::Next).await.unwrap_err();
        assert_eq!(err.kind(), "Unsupported");
    }
}
