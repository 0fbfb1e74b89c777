//! Core data model shared by the bus and every backend adapter.
//!
//! Zone identifiers are the single namespace the bridge routes on: every id is
//! `"{prefix}:{native-id}"` where the prefix names the owning backend. The
//! `ZoneId` helpers keep the split/join logic in one place so adapters never
//! leak unprefixed ids into bus responses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A prefixed zone identifier (`"lms:00:04:20:aa:bb:cc"`, `"roon:1601bb…"`).
///
/// The prefix is everything before the first `:`; the remainder is the
/// backend's native id (which may itself contain colons, e.g. LMS MACs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(String);

impl ZoneId {
    /// Join a prefix and a native id.
    pub fn join(prefix: &str, native_id: &str) -> Self {
        Self(format!("{}:{}", prefix, native_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The adapter-identifying portion (empty when the id carries no colon).
    pub fn prefix(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    /// The backend-native remainder after the first colon.
    pub fn native_id(&self) -> &str {
        match self.0.find(':') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Whether this id belongs to the given prefix.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.len() > prefix.len()
            && self.0.starts_with(prefix)
            && self.0.as_bytes()[prefix.len()] == b':'
    }
}

impl From<String> for ZoneId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ZoneId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ZoneId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Playback state of a zone.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    #[default]
    Stopped,
    Buffering,
    Loading,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Buffering => "buffering",
            Self::Loading => "loading",
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for PlaybackState {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "playing" | "play" => Self::Playing,
            "paused" | "pause" => Self::Paused,
            "buffering" => Self::Buffering,
            "loading" => Self::Loading,
            _ => Self::Stopped,
        }
    }
}

/// Volume scale a zone declares.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    /// Plain numeric scale, typically 0..100.
    Number,
    /// Decibels, typically -80..0.
    Db,
    /// Only relative up/down steps are meaningful.
    Incremental,
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Number => "number",
            Self::Db => "db",
            Self::Incremental => "incremental",
        };
        write!(f, "{}", s)
    }
}

/// Volume control declaration for a zone. Absent means no volume control.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeControl {
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub is_muted: bool,
    /// Current value in the zone's own scale.
    pub value: Option<f64>,
}

/// Capability tags a backend may declare it does NOT support.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTag {
    Next,
    Previous,
    TrackMetadata,
    AlbumArt,
}

/// Uniform zone descriptor published into the bus cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Zone {
    pub zone_id: ZoneId,
    pub zone_name: String,
    pub state: PlaybackState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_control: Option<VolumeControl>,
    /// Empty means full support.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unsupported: BTreeSet<CapabilityTag>,
}

impl Zone {
    pub fn prefix(&self) -> &str {
        self.zone_id.prefix()
    }
}

/// Now-playing payload for one zone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NowPlaying {
    /// Track / artist / album display lines.
    pub line1: String,
    pub line2: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line3: Option<String>,
    pub is_playing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<VolumeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_step: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek_position_sec: Option<i64>,
    /// Opaque backend extras; the enrichment layer attaches `hqp` here.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub backend_data: serde_json::Map<String, serde_json::Value>,
}

/// Image bytes returned from a backend's art service.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Parameters for routed image fetches.
#[derive(Debug, Clone, Default)]
pub struct ImageQuery {
    pub zone_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn zone_id_split_and_join() {
        let id = ZoneId::join("roon", "1601bb42ed14");
        assert_eq!(id.as_str(), "roon:1601bb42ed14");
        assert_eq!(id.prefix(), "roon");
        assert_eq!(id.native_id(), "1601bb42ed14");
        assert!(id.has_prefix("roon"));
        assert!(!id.has_prefix("roo"));
        assert!(!id.has_prefix("lms"));
    }

    #[test]
    fn zone_id_native_keeps_embedded_colons() {
        let id = ZoneId::join("lms", "00:04:20:aa:bb:cc");
        assert_eq!(id.prefix(), "lms");
        assert_eq!(id.native_id(), "00:04:20:aa:bb:cc");
    }

    #[test]
    fn playback_state_round_trip() {
        assert_eq!(PlaybackState::from("PLAY"), PlaybackState::Playing);
        assert_eq!(PlaybackState::from("pause"), PlaybackState::Paused);
        assert_eq!(PlaybackState::from("anything"), PlaybackState::Stopped);
        assert_eq!(PlaybackState::Buffering.to_string(), "buffering");
    }

    #[test]
    fn zone_serializes_wire_shape() {
        let mut unsupported = BTreeSet::new();
        unsupported.insert(CapabilityTag::Next);
        unsupported.insert(CapabilityTag::AlbumArt);
        let zone = Zone {
            zone_id: ZoneId::join("upnp", "uuid-1"),
            zone_name: "Den".into(),
            state: PlaybackState::Stopped,
            output_name: None,
            device_name: Some("Renderer".into()),
            volume_control: Some(VolumeControl {
                volume_type: VolumeType::Number,
                min: 0.0,
                max: 100.0,
                step: 1.0,
                is_muted: false,
                value: Some(30.0),
            }),
            unsupported,
        };
        let json = serde_json::to_value(&zone).unwrap();
        assert_eq!(json["zone_id"], "upnp:uuid-1");
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["volume_control"]["type"], "number");
        assert_eq!(json["unsupported"][0], "album_art");
        assert!(json.get("output_name").is_none());
    }
}
