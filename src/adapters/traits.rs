//! Uniform contract every backend adapter implements.

use async_trait::async_trait;
use serde::Serialize;

use crate::bus::error::BridgeError;
use crate::bus::types::{ImageData, ImageQuery, NowPlaying, Zone};

/// Capabilities a backend declares at registration time.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Capabilities {
    /// Whether `get_image` is implemented.
    pub images: bool,
}

/// Transport/volume/seek command after action-string parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Play,
    Pause,
    PlayPause,
    Stop,
    Next,
    Previous,
    /// Absolute volume in the zone's own scale (never re-interpreted).
    VolumeAbsolute(f64),
    /// Relative volume delta in the zone's own units.
    VolumeRelative(f64),
    /// Seek to a position in seconds.
    Seek(f64),
}

impl ControlCommand {
    /// Parse the canonical action set. `prev` is a wire-stable alias.
    pub fn parse(action: &str, value: Option<&serde_json::Value>) -> Result<Self, BridgeError> {
        let numeric = |v: Option<&serde_json::Value>| -> Result<f64, BridgeError> {
            v.and_then(|v| v.as_f64())
                .ok_or_else(|| BridgeError::BadRequest(format!("action '{}' requires a numeric value", action)))
        };

        match action {
            "play" => Ok(Self::Play),
            "pause" => Ok(Self::Pause),
            "play_pause" => Ok(Self::PlayPause),
            "stop" => Ok(Self::Stop),
            "next" => Ok(Self::Next),
            "previous" | "prev" => Ok(Self::Previous),
            "vol_abs" => Ok(Self::VolumeAbsolute(numeric(value)?)),
            "vol_rel" => Ok(Self::VolumeRelative(numeric(value)?)),
            "seek" => Ok(Self::Seek(numeric(value)?)),
            other => Err(BridgeError::BadRequest(format!("unknown action '{}'", other))),
        }
    }

    /// Canonical action string for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::PlayPause => "play_pause",
            Self::Stop => "stop",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::VolumeAbsolute(_) => "vol_abs",
            Self::VolumeRelative(_) => "vol_rel",
            Self::Seek(_) => "seek",
        }
    }
}

/// The uniform backend contract.
///
/// Identifier discipline: `get_zones` returns zones whose `zone_id` already
/// carries this backend's prefix (built via `ZoneId::join`); the bus strips
/// the prefix again before calling `get_now_playing` / `control` /
/// `get_image`, so those receive the backend's native id.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Unique routing prefix. Must not contain `:`.
    fn prefix(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Arm discovery and return; discovery may keep running afterwards.
    async fn start(&self) -> Result<(), BridgeError>;

    /// Shut down cleanly: cancel loops, close sockets, await exit. Idempotent.
    async fn stop(&self);

    /// Current cached zones, prefixed. Empty is legal.
    async fn get_zones(&self) -> Vec<Zone>;

    /// Cached now-playing for a native id.
    async fn get_now_playing(&self, native_id: &str) -> Option<NowPlaying>;

    /// Execute a command against a native id. Backends must answer
    /// `Unsupported` for capabilities they lack rather than silently accept.
    async fn control(&self, native_id: &str, command: ControlCommand) -> Result<(), BridgeError>;

    /// Diagnostic snapshot (connected, host, counts).
    async fn get_status(&self) -> serde_json::Value;

    /// Album art by image key; default answers `Unsupported`.
    async fn get_image(&self, image_key: &str, query: &ImageQuery) -> Result<ImageData, BridgeError> {
        let _ = (image_key, query);
        Err(BridgeError::Unsupported("album art".into()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_canonical_actions() {
        assert_eq!(ControlCommand::parse("play", None).unwrap(), ControlCommand::Play);
        assert_eq!(
            ControlCommand::parse("prev", None).unwrap(),
            ControlCommand::Previous
        );
        assert_eq!(
            ControlCommand::parse("vol_abs", Some(&json!(-12))).unwrap(),
            ControlCommand::VolumeAbsolute(-12.0)
        );
        assert_eq!(
            ControlCommand::parse("seek", Some(&json!(42.5))).unwrap(),
            ControlCommand::Seek(42.5)
        );
    }

    #[test]
    fn rejects_unknown_and_valueless() {
        assert!(matches!(
            ControlCommand::parse("warp", None),
            Err(BridgeError::BadRequest(_))
        ));
        assert!(matches!(
            ControlCommand::parse("vol_abs", None),
            Err(BridgeError::BadRequest(_))
        ));
        assert!(matches!(
            ControlCommand::parse("vol_rel", Some(&json!("loud"))),
            Err(BridgeError::BadRequest(_))
        ));
    }
}
