//! HTTP surface over the bus: the wire-stable contract consumed by knobs,
//! web UIs, Home Assistant and the MCP layer.
//!
//! Handlers translate `BridgeError` kinds to status codes (400 BadRequest,
//! 404 NoAdapter/ZoneNotFound, 501 Unsupported, 502 Unreachable, 401
//! Unauthorized, 500 Internal) and never leak adapter internals.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::bus::{BridgeError, ImageQuery, NowPlaying, Zone, ZoneBus};
use crate::coordinator::AdapterCoordinator;
use crate::hqp::{HqpInstanceManager, HqpLinkService};
use crate::knobs::{image as knob_image, KnobConfigPatch, KnobRegistry, KnobStatusPatch};
use crate::settings::SettingsStore;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<ZoneBus>,
    pub knobs: KnobRegistry,
    pub settings: Arc<SettingsStore>,
    pub hqp_instances: Arc<HqpInstanceManager>,
    pub hqp_links: Arc<HqpLinkService>,
    pub coordinator: Arc<AdapterCoordinator>,
    pub started_at: Instant,
}

/// Build the full route table.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/events", get(events_handler))
        .route("/zones", get(zones_handler))
        .route("/now_playing", get(now_playing_handler))
        .route("/now_playing/image", get(now_playing_image_handler))
        .route("/control", post(control_handler))
        .route("/config/{knob_id}", get(knob_config_handler))
        .route("/config/{knob_id}", put(knob_config_update_handler))
        .route("/api/knobs", get(knobs_handler))
        .route("/api/settings", get(settings_get_handler))
        .route("/api/settings", post(settings_post_handler))
        .route("/admin/status.json", get(admin_status_handler))
        .route("/hqp/status", get(hqp_status_handler))
        .route("/hqp/profiles", get(hqp_profiles_handler))
        .route("/hqp/profiles/load", post(hqp_load_profile_handler))
        .route("/hqp/pipeline", get(hqp_pipeline_handler))
        .route("/hqp/pipeline", post(hqp_pipeline_update_handler))
        .route("/hqp/configure", post(hqp_configure_handler))
        .route("/hqp/instances", get(hqp_instances_handler))
        .route("/hqp/detect", post(hqp_detect_handler))
        .route("/hqp/zones/links", get(hqp_links_handler))
        .route("/hqp/zones/link", post(hqp_link_handler))
        .route("/hqp/zones/unlink", post(hqp_unlink_handler))
        .with_state(state)
}

fn error_body(e: &BridgeError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(json!({ "error": e.to_string(), "error_code": e.kind() })),
    )
}

// =============================================================================
// Knob identity
// =============================================================================

/// `X-Knob-Id` / `X-Device-Id` headers, falling back to a query/body value.
fn extract_knob_id(headers: &HeaderMap, fallback: Option<&str>) -> Option<String> {
    headers
        .get("x-knob-id")
        .or_else(|| headers.get("x-device-id"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| fallback.map(|s| s.to_string()))
}

fn extract_knob_version(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-knob-version")
        .or_else(|| headers.get("x-device-version"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

// =============================================================================
// Liveness
// =============================================================================

async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "hifi-bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_sec": state.started_at.elapsed().as_secs(),
    }))
}

// =============================================================================
// Event stream
// =============================================================================

/// Server-sent events mirroring the bus notification stream, for surfaces
/// that prefer push over polling `zones_sha`.
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.events().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => serde_json::to_string(&event)
            .ok()
            .map(|json| Ok(Event::default().data(json))),
        // Lagged receivers just skip; the client resyncs from /zones.
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

// =============================================================================
// Zones
// =============================================================================

#[derive(Serialize)]
struct ZonesResponse {
    zones: Vec<Zone>,
    zones_sha: String,
}

async fn zones_handler(State(state): State<AppState>) -> Json<ZonesResponse> {
    let zones = state.bus.get_zones().await;
    let zones_sha = state.bus.get_zones_sha().await;
    Json(ZonesResponse { zones, zones_sha })
}

// =============================================================================
// Now playing
// =============================================================================

#[derive(Deserialize)]
struct NowPlayingQuery {
    zone_id: Option<String>,
    knob_id: Option<String>,
    battery_level: Option<u8>,
    battery_charging: Option<String>,
}

#[derive(Serialize)]
struct NowPlayingResponse {
    zone_id: String,
    #[serde(flatten)]
    now_playing: NowPlaying,
    image_url: Option<String>,
    zones: Vec<Zone>,
    zones_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    config_sha: Option<String>,
}

async fn now_playing_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<NowPlayingQuery>,
) -> Result<Json<NowPlayingResponse>, (StatusCode, Json<Value>)> {
    let zones = state.bus.get_zones().await;
    let zones_sha = state.bus.get_zones_sha().await;

    let Some(zone_id) = params.zone_id else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "zone_id required",
                "error_code": "BadRequest",
                "zones": zones,
                "zones_sha": zones_sha,
            })),
        ));
    };

    // Knob bookkeeping: register contact, merge reported status, and echo the
    // current config sha so the device can detect config changes.
    let knob_id = extract_knob_id(&headers, params.knob_id.as_deref());
    let mut config_sha = None;
    if let Some(ref id) = knob_id {
        state
            .knobs
            .get_or_create(id, extract_knob_version(&headers).as_deref())
            .await;
        state
            .knobs
            .update_status(
                id,
                KnobStatusPatch {
                    battery_level: params.battery_level.filter(|&level| level <= 100),
                    battery_charging: params
                        .battery_charging
                        .as_deref()
                        .map(|c| c == "1" || c == "true"),
                    zone_id: Some(zone_id.clone()),
                    ip: None,
                },
            )
            .await;
        config_sha = state.knobs.get_config_sha(id).await;
    }

    match state.bus.get_now_playing(&zone_id, knob_id.as_deref()).await {
        Ok(mut now_playing) => {
            // DSP enrichment: the bus exposes the hook, policy lives here.
            if let Some(pipeline) = state.hqp_links.pipeline_for_zone(&zone_id).await {
                if let Ok(value) = serde_json::to_value(&pipeline) {
                    now_playing.backend_data.insert("hqp".to_string(), value);
                }
            }
            let image_url = now_playing.image_key.as_ref().map(|_| {
                format!("/now_playing/image?zone_id={}", urlencoding::encode(&zone_id))
            });
            Ok(Json(NowPlayingResponse {
                zone_id,
                now_playing,
                image_url,
                zones,
                zones_sha,
                config_sha,
            }))
        }
        Err(e) => {
            let (status, _) = error_body(&e);
            Err((
                status,
                Json(json!({
                    "error": e.to_string(),
                    "error_code": e.kind(),
                    "zones": zones,
                    "zones_sha": zones_sha,
                })),
            ))
        }
    }
}

// =============================================================================
// Image
// =============================================================================

#[derive(Deserialize)]
struct ImageParams {
    zone_id: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    format: Option<String>,
}

async fn now_playing_image_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ImageParams>,
) -> Response {
    let width = params.width.unwrap_or(240);
    let height = params.height.unwrap_or(width);
    let want_rgb565 = params.format.as_deref() == Some("rgb565");

    let image = fetch_zone_image(&state, &headers, &params).await;

    match image {
        Ok(data) if want_rgb565 => match knob_image::to_rgb565(&data.data, width, height) {
            Ok(packed) => rgb565_response(packed),
            Err(e) => {
                tracing::debug!("RGB565 conversion failed: {}", e);
                rgb565_response(knob_image::placeholder_rgb565(width, height))
            }
        },
        Ok(data) => {
            // Downscale oversized art; pass the original through when decode
            // fails (the client may handle formats we do not).
            let (content_type, body) = match knob_image::to_jpeg(&data.data, width, height, 85) {
                Ok(jpeg) => ("image/jpeg".to_string(), jpeg),
                Err(_) => (data.content_type, data.data),
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            tracing::debug!("Image fetch failed: {}", e);
            if want_rgb565 {
                rgb565_response(knob_image::placeholder_rgb565(width, height))
            } else {
                let svg = knob_image::placeholder_svg(width, height);
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "image/svg+xml")
                    .body(Body::from(svg))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
        }
    }
}

async fn fetch_zone_image(
    state: &AppState,
    headers: &HeaderMap,
    params: &ImageParams,
) -> Result<crate::bus::ImageData, BridgeError> {
    let zone_id = params
        .zone_id
        .clone()
        .ok_or_else(|| BridgeError::BadRequest("zone_id required".into()))?;
    let sender = extract_knob_id(headers, None);

    let now_playing = state.bus.get_now_playing(&zone_id, sender.as_deref()).await?;
    let image_key = now_playing
        .image_key
        .ok_or_else(|| BridgeError::ZoneNotFound("no album art".into()))?;

    state
        .bus
        .get_image(
            &image_key,
            &ImageQuery {
                zone_id: Some(zone_id),
                width: params.width,
                height: params.height,
                format: params.format.clone(),
            },
            sender.as_deref(),
        )
        .await
}

fn rgb565_response(packed: knob_image::Rgb565Image) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("X-Image-Width", packed.width.to_string())
        .header("X-Image-Height", packed.height.to_string())
        .header("X-Image-Format", "rgb565")
        .body(Body::from(packed.data))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// =============================================================================
// Control
// =============================================================================

#[derive(Deserialize)]
struct ControlRequest {
    zone_id: Option<String>,
    action: Option<String>,
    value: Option<Value>,
    knob_id: Option<String>,
}

async fn control_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ControlRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let (Some(zone_id), Some(action)) = (req.zone_id, req.action) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "zone_id and action required", "error_code": "BadRequest" })),
        ));
    };
    let sender = extract_knob_id(&headers, req.knob_id.as_deref());

    state
        .bus
        .control(&zone_id, &action, req.value.as_ref(), sender.as_deref())
        .await
        .map_err(|e| error_body(&e))?;
    Ok(Json(json!({ "status": "ok" })))
}

// =============================================================================
// Knob config
// =============================================================================

fn knob_config_body(knob_id: &str, record: &crate::knobs::KnobRecord) -> Value {
    let mut config = serde_json::to_value(&record.config)
        .unwrap_or_else(|_| Value::Object(Default::default()));
    if let Some(obj) = config.as_object_mut() {
        obj.insert("knob_id".into(), json!(knob_id));
        obj.insert("name".into(), json!(record.name));
    }
    json!({ "config": config, "config_sha": record.config_sha })
}

async fn knob_config_handler(
    State(state): State<AppState>,
    Path(knob_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.knobs.get(&knob_id).await {
        Some(record) => Ok(Json(knob_config_body(&knob_id, &record))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown knob {}", knob_id), "error_code": "ZoneNotFound" })),
        )),
    }
}

async fn knob_config_update_handler(
    State(state): State<AppState>,
    Path(knob_id): Path<String>,
    Json(patch): Json<KnobConfigPatch>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    // Admins may provision a knob before its first contact.
    state.knobs.get_or_create(&knob_id, None).await;
    match state.knobs.update_config(&knob_id, patch).await {
        Some(record) => Ok(Json(knob_config_body(&knob_id, &record))),
        None => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "update failed", "error_code": "Internal" })),
        )),
    }
}

async fn knobs_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "knobs": state.knobs.list().await }))
}

// =============================================================================
// Settings
// =============================================================================

async fn settings_get_handler(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.settings.get()).unwrap_or_default())
}

async fn settings_post_handler(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> Json<Value> {
    let merged = state.settings.update(&patch);
    // Settings may flip adapters on or off; reconcile before replying so a
    // follow-up /zones reflects the change.
    state.coordinator.on_settings_changed(&merged.adapters).await;
    Json(serde_json::to_value(merged).unwrap_or_default())
}

// =============================================================================
// Admin status
// =============================================================================

async fn admin_status_handler(State(state): State<AppState>) -> Json<Value> {
    let zones = state.bus.get_zones().await;
    let backends = state.bus.get_status().await;
    Json(json!({
        "zones": zones,
        "backends": backends,
        "bus": {
            "zones_sha": state.bus.get_zones_sha().await,
            "zone_count": zones.len(),
            "activity": state.bus.activity().snapshot(),
        },
        "knobs": state.knobs.list().await,
        "debug": {
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_sec": state.started_at.elapsed().as_secs(),
            "settings": serde_json::to_value(state.settings.get()).unwrap_or_default(),
        },
    }))
}

// =============================================================================
// HQPlayer
// =============================================================================

#[derive(Deserialize)]
struct HqpInstanceParam {
    instance: Option<String>,
    zone_id: Option<String>,
}

async fn hqp_client(
    state: &AppState,
    instance: Option<&str>,
) -> Arc<crate::hqp::HqpClient> {
    match instance {
        Some(name) => state.hqp_instances.get_or_create(name).await,
        None => state.hqp_instances.get_default().await,
    }
}

async fn hqp_status_handler(
    State(state): State<AppState>,
    Query(params): Query<HqpInstanceParam>,
) -> Json<Value> {
    let client = hqp_client(&state, params.instance.as_deref()).await;
    let status = client.status().await;
    let supports_profiles = client.supports_profiles().await;
    Json(json!({
        "configured": status.host.is_some(),
        "connected": status.connected,
        "host": status.host,
        "port": status.port,
        "web_port": status.web_port,
        "info": status.info,
        "supports_profiles": supports_profiles,
    }))
}

async fn hqp_profiles_handler(
    State(state): State<AppState>,
    Query(params): Query<HqpInstanceParam>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let client = hqp_client(&state, params.instance.as_deref()).await;
    let profiles = client
        .profiles()
        .await
        .map_err(|e| error_body(&BridgeError::from(e)))?;
    let current = client.current_config_title().await.ok().flatten();
    Ok(Json(json!({ "profiles": profiles, "current": current })))
}

#[derive(Deserialize)]
struct LoadProfileRequest {
    profile: String,
    instance: Option<String>,
}

async fn hqp_load_profile_handler(
    State(state): State<AppState>,
    Json(req): Json<LoadProfileRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let client = hqp_client(&state, req.instance.as_deref()).await;
    client
        .load_profile(&req.profile)
        .await
        .map_err(|e| error_body(&BridgeError::from(e)))?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn hqp_pipeline_handler(
    State(state): State<AppState>,
    Query(params): Query<HqpInstanceParam>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    // Zone-scoped lookups go through the link service and soft-fail to null;
    // instance lookups surface errors.
    if let Some(ref zone_id) = params.zone_id {
        let pipeline = state.hqp_links.pipeline_for_zone(zone_id).await;
        return Ok(Json(json!({ "pipeline": pipeline })));
    }
    let client = hqp_client(&state, params.instance.as_deref()).await;
    match client.pipeline().await {
        Ok(pipeline) => Ok(Json(json!({ "pipeline": pipeline }))),
        // During the restart window after a profile load the TCP side may be
        // down while the web UI already answers; fall back to the scrape.
        Err(native_err) => match client.fetch_web_pipeline().await {
            Ok(form) => Ok(Json(json!({ "pipeline": null, "web_form": form }))),
            Err(_) => Err(error_body(&BridgeError::from(native_err))),
        },
    }
}

#[derive(Deserialize)]
struct PipelineUpdateRequest {
    setting: String,
    value: Value,
    instance: Option<String>,
}

async fn hqp_pipeline_update_handler(
    State(state): State<AppState>,
    Json(req): Json<PipelineUpdateRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let value = req
        .value
        .as_i64()
        .or_else(|| req.value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| {
            error_body(&BridgeError::BadRequest(format!(
                "setting '{}' requires a numeric value",
                req.setting
            )))
        })?;

    let client = hqp_client(&state, req.instance.as_deref()).await;
    client
        .apply_setting(&req.setting, value)
        .await
        .map_err(|e| error_body(&BridgeError::from(e)))?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct HqpConfigureRequest {
    name: Option<String>,
    host: String,
    port: Option<u16>,
    web_port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
}

async fn hqp_configure_handler(
    State(state): State<AppState>,
    Json(req): Json<HqpConfigureRequest>,
) -> Json<Value> {
    let name = req.name.as_deref().unwrap_or("default");
    state
        .hqp_instances
        .upsert(name, req.host, req.port, req.web_port, req.username, req.password)
        .await;
    Json(json!({ "status": "ok", "instance": name }))
}

async fn hqp_instances_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "instances": state.hqp_instances.list().await }))
}

async fn hqp_detect_handler() -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let found = crate::hqp::discover_instances(None)
        .await
        .map_err(|e| error_body(&BridgeError::from(e)))?;
    Ok(Json(json!({ "instances": found })))
}

async fn hqp_links_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "links": state.hqp_links.links().await }))
}

#[derive(Deserialize)]
struct LinkRequest {
    zone_id: String,
    instance: String,
}

async fn hqp_link_handler(
    State(state): State<AppState>,
    Json(req): Json<LinkRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .hqp_links
        .link(&req.zone_id, &req.instance)
        .await
        .map_err(|e| error_body(&e))?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct UnlinkRequest {
    zone_id: String,
}

async fn hqp_unlink_handler(
    State(state): State<AppState>,
    Json(req): Json<UnlinkRequest>,
) -> Json<Value> {
    let existed = state.hqp_links.unlink(&req.zone_id).await;
    Json(json!({ "status": "ok", "was_linked": existed }))
}
