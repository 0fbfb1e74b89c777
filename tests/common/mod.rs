#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]
//! Shared fixtures for integration tests: a scriptable in-process backend and
//! an `AppState` builder wired to a sandboxed config directory.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use hifi_bridge::adapters::traits::{Backend, Capabilities, ControlCommand};
use hifi_bridge::api::AppState;
use hifi_bridge::bus::{
    create_events, BridgeError, ImageData, ImageQuery, NowPlaying, PlaybackState, SharedEvents,
    VolumeControl, VolumeType, Zone, ZoneBus, ZoneId,
};
use hifi_bridge::coordinator::AdapterCoordinator;
use hifi_bridge::hqp::{HqpInstanceManager, HqpLinkService};
use hifi_bridge::knobs::KnobRegistry;
use hifi_bridge::settings::SettingsStore;

/// In-process backend with scriptable zones; records every command.
pub struct StubBackend {
    prefix: String,
    zones: Mutex<Vec<Zone>>,
    pub commands: Arc<Mutex<Vec<(String, String)>>>,
    images: bool,
}

impl StubBackend {
    pub fn new(prefix: &str, images: bool) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.to_string(),
            zones: Mutex::new(Vec::new()),
            commands: Arc::new(Mutex::new(Vec::new())),
            images,
        })
    }

    pub fn add_zone(&self, native_id: &str, name: &str) {
        self.add_zone_with_volume(
            native_id,
            name,
            Some(VolumeControl {
                volume_type: VolumeType::Number,
                min: 0.0,
                max: 100.0,
                step: 1.0,
                is_muted: false,
                value: Some(25.0),
            }),
        );
    }

    pub fn add_db_zone(&self, native_id: &str, name: &str, min: f64, max: f64) {
        self.add_zone_with_volume(
            native_id,
            name,
            Some(VolumeControl {
                volume_type: VolumeType::Db,
                min,
                max,
                step: 0.5,
                is_muted: false,
                value: Some((min + max) / 2.0),
            }),
        );
    }

    pub fn add_zone_with_volume(&self, native_id: &str, name: &str, vc: Option<VolumeControl>) {
        self.zones.lock().unwrap().push(Zone {
            zone_id: ZoneId::join(&self.prefix, native_id),
            zone_name: name.to_string(),
            state: PlaybackState::Stopped,
            output_name: None,
            device_name: None,
            volume_control: vc,
            unsupported: BTreeSet::new(),
        });
    }
}

#[async_trait]
impl Backend for StubBackend {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { images: self.images }
    }

    async fn start(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn get_zones(&self) -> Vec<Zone> {
        self.zones.lock().unwrap().clone()
    }

    async fn get_now_playing(&self, native_id: &str) -> Option<NowPlaying> {
        let known = self
            .zones
            .lock()
            .unwrap()
            .iter()
            .any(|z| z.zone_id.native_id() == native_id);
        known.then(|| NowPlaying {
            line1: "So What".into(),
            line2: "Miles Davis".into(),
            line3: Some("Kind of Blue".into()),
            is_playing: true,
            volume: Some(25.0),
            volume_type: Some(VolumeType::Number),
            volume_step: Some(1.0),
            image_key: Some("art-1".into()),
            length_sec: Some(545),
            seek_position_sec: Some(120),
            backend_data: Default::default(),
        })
    }

    async fn control(&self, native_id: &str, command: ControlCommand) -> Result<(), BridgeError> {
        let known = self
            .zones
            .lock()
            .unwrap()
            .iter()
            .any(|z| z.zone_id.native_id() == native_id);
        if !known {
            return Err(BridgeError::ZoneNotFound(native_id.to_string()));
        }
        self.commands
            .lock()
            .unwrap()
            .push((native_id.to_string(), command.action().to_string()));
        Ok(())
    }

    async fn get_status(&self) -> serde_json::Value {
        serde_json::json!({ "connected": true })
    }

    async fn get_image(&self, _key: &str, _query: &ImageQuery) -> Result<ImageData, BridgeError> {
        if !self.images {
            return Err(BridgeError::Unsupported("album art".into()));
        }
        Ok(ImageData {
            content_type: "image/jpeg".into(),
            data: tiny_jpeg(),
        })
    }
}

/// A decodable 8x8 JPEG generated at runtime.
pub fn tiny_jpeg() -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(8, 8, image::Rgba([120, 40, 200, 255]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .to_rgb8()
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

/// Bus + AppState against a sandboxed CONFIG_DIR. Keep the TempDir alive for
/// the duration of the test.
pub async fn app_state(bus: Arc<ZoneBus>) -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("CONFIG_DIR", tmp.path());

    let settings = Arc::new(SettingsStore::load());
    let hqp_instances = Arc::new(HqpInstanceManager::new());
    let hqp_links = Arc::new(HqpLinkService::load(hqp_instances.clone(), settings.clone()).await);
    let coordinator = Arc::new(AdapterCoordinator::new(bus.clone()));

    (
        AppState {
            bus,
            knobs: KnobRegistry::new(),
            settings,
            hqp_instances,
            hqp_links,
            coordinator,
            started_at: Instant::now(),
        },
        tmp,
    )
}

pub fn new_bus() -> (Arc<ZoneBus>, SharedEvents) {
    let events = create_events();
    (Arc::new(ZoneBus::new(events.clone())), events)
}
