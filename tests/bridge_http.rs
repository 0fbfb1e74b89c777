#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! HTTP-contract tests: the wire surface knobs and UIs depend on, driven
//! through the real bus with stub backends.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use serial_test::serial;
use tower::ServiceExt;

use common::{app_state, new_bus, StubBackend};
use hifi_bridge::api::build_router;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
#[serial]
async fn control_routes_by_prefix_and_strips_it() {
    let (bus, _events) = new_bus();
    let roon = StubBackend::new("roon", true);
    roon.add_zone("zone_123", "Living Room");
    bus.register_backend("roon", roon.clone()).await.unwrap();
    bus.refresh_zones(Some("roon")).await;

    let (state, _tmp) = app_state(bus).await;
    let app = build_router(state);

    let response = app
        .clone()
        .oneshot(
            Request::post("/control")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "zone_id": "roon:zone_123", "action": "play" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
    assert_eq!(
        roon.commands.lock().unwrap().clone(),
        vec![("zone_123".to_string(), "play".to_string())]
    );

    // Unknown native id resolves to the adapter, which reports ZoneNotFound.
    let response = app
        .oneshot(
            Request::post("/control")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "zone_id": "roon:does-not-exist", "action": "play" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error_code"], "ZoneNotFound");

    std::env::remove_var("CONFIG_DIR");
}

#[tokio::test]
#[serial]
async fn volume_is_zone_scale_checked_not_percent_clamped() {
    let (bus, _events) = new_bus();
    let roon = StubBackend::new("roon", false);
    roon.add_db_zone("z", "Den", -80.0, 0.0);
    bus.register_backend("roon", roon.clone()).await.unwrap();
    bus.refresh_zones(Some("roon")).await;

    let (state, _tmp) = app_state(bus).await;
    let app = build_router(state);

    // -12 dB is valid and must reach the backend unchanged.
    let response = app
        .clone()
        .oneshot(
            Request::post("/control")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "zone_id": "roon:z", "action": "vol_abs", "value": -12 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // 50 is outside -80..0 and is a caller error, not something to clamp.
    let response = app
        .oneshot(
            Request::post("/control")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "zone_id": "roon:z", "action": "vol_abs", "value": 50 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error_code"], "BadRequest");

    std::env::remove_var("CONFIG_DIR");
}

#[tokio::test]
#[serial]
async fn image_endpoint_formats_and_placeholders() {
    let (bus, _events) = new_bus();
    let roon = StubBackend::new("roon", true);
    roon.add_zone("y", "Living Room");
    let upnp = StubBackend::new("upnp", false);
    upnp.add_zone("x", "Den");
    bus.register_backend("roon", roon).await.unwrap();
    bus.register_backend("upnp", upnp).await.unwrap();
    bus.refresh_zones(None).await;

    let (state, _tmp) = app_state(bus).await;
    let app = build_router(state);

    // Missing zone_id is a caller error; the handler still answers with a
    // placeholder document rather than breaking the knob's render loop.
    let response = app
        .clone()
        .oneshot(Request::get("/now_playing/image").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "image/svg+xml"
    );

    // JPEG round trip through the routed backend image.
    let response = app
        .clone()
        .oneshot(
            Request::get("/now_playing/image?zone_id=roon:y&width=16&height=16&format=jpeg")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "image/jpeg"
    );

    // RGB565 carries dimensions in headers and 2 bytes per pixel.
    let response = app
        .clone()
        .oneshot(
            Request::get("/now_playing/image?zone_id=roon:y&width=8&height=8&format=rgb565")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-image-width"].to_str().unwrap(), "8");
    assert_eq!(response.headers()["x-image-format"].to_str().unwrap(), "rgb565");
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    assert_eq!(bytes.len(), 8 * 8 * 2);

    // A backend without image capability degrades to the placeholder.
    let response = app
        .oneshot(
            Request::get("/now_playing/image?zone_id=upnp:x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "image/svg+xml"
    );

    std::env::remove_var("CONFIG_DIR");
}

#[tokio::test]
#[serial]
async fn config_sha_rollout_round_trip() {
    let (bus, _events) = new_bus();
    let lms = StubBackend::new("lms", false);
    lms.add_zone("p1", "Kitchen");
    bus.register_backend("lms", lms).await.unwrap();
    bus.refresh_zones(Some("lms")).await;

    let (state, _tmp) = app_state(bus).await;
    let app = build_router(state);

    // First poll registers the knob and returns its config sha.
    let response = app
        .clone()
        .oneshot(
            Request::get("/now_playing?zone_id=lms:p1&battery_level=77&battery_charging=1")
                .header("X-Knob-Id", "knob-a")
                .header("X-Knob-Version", "2.0.1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let sha_before = body["config_sha"].as_str().unwrap().to_string();
    assert_eq!(sha_before.len(), 8);
    assert_eq!(body["line1"], "So What");
    assert!(body["zones_sha"].as_str().unwrap().len() == 8);

    // Admin pushes a new config; the sha must change.
    let response = app
        .clone()
        .oneshot(
            Request::put("/config/knob-a")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "name": "Desk Knob" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated = body_json(response).await;
    let sha_after = updated["config_sha"].as_str().unwrap().to_string();
    assert_ne!(sha_before, sha_after);

    // Next poll advertises the new sha; the device would refetch its config.
    let response = app
        .clone()
        .oneshot(
            Request::get("/now_playing?zone_id=lms:p1")
                .header("X-Knob-Id", "knob-a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["config_sha"], sha_after.as_str());

    // The refetched config carries the same sha and the new name.
    let response = app
        .clone()
        .oneshot(Request::get("/config/knob-a").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let config = body_json(response).await;
    assert_eq!(config["config_sha"], sha_after.as_str());
    assert_eq!(config["config"]["name"], "Desk Knob");
    assert_eq!(config["config"]["knob_id"], "knob-a");

    // Battery status landed in the registry.
    let response = app
        .oneshot(Request::get("/api/knobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let knobs = body_json(response).await;
    let knob = &knobs["knobs"][0];
    assert_eq!(knob["knob_id"], "knob-a");
    assert_eq!(knob["status"]["battery_level"], 77);
    assert_eq!(knob["status"]["battery_charging"], true);
    assert_eq!(knob["status"]["zone_id"], "lms:p1");

    std::env::remove_var("CONFIG_DIR");
}

#[tokio::test]
#[serial]
async fn now_playing_without_zone_lists_zones() {
    let (bus, _events) = new_bus();
    let lms = StubBackend::new("lms", false);
    lms.add_zone("p1", "Kitchen");
    bus.register_backend("lms", lms).await.unwrap();
    bus.refresh_zones(Some("lms")).await;

    let (state, _tmp) = app_state(bus).await;
    let app = build_router(state);

    let response = app
        .oneshot(Request::get("/now_playing").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["zones"][0]["zone_id"], "lms:p1");

    std::env::remove_var("CONFIG_DIR");
}

#[tokio::test]
#[serial]
async fn admin_status_exposes_bus_and_activity() {
    let (bus, _events) = new_bus();
    let lms = StubBackend::new("lms", false);
    lms.add_zone("p1", "Kitchen");
    bus.register_backend("lms", lms).await.unwrap();
    bus.refresh_zones(Some("lms")).await;
    bus.control("lms:p1", "play", None, Some("test")).await.unwrap();

    let (state, _tmp) = app_state(bus).await;
    let app = build_router(state);

    let response = app
        .oneshot(Request::get("/admin/status.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["bus"]["zone_count"], 1);
    assert_eq!(body["bus"]["activity"][0]["kind"], "control");
    assert_eq!(body["bus"]["activity"][0]["sender"], "test");
    assert!(body["backends"]["lms"]["zone_count"].as_u64().unwrap() == 1);

    std::env::remove_var("CONFIG_DIR");
}

#[tokio::test]
#[serial]
async fn settings_merge_is_partial() {
    let (bus, _events) = new_bus();
    let (state, _tmp) = app_state(bus).await;
    let app = build_router(state);

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/settings")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "adapters": { "lms": true } }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let merged = body_json(response).await;
    assert_eq!(merged["adapters"]["lms"], true);
    assert_eq!(merged["adapters"]["roon"], true, "defaults survive merges");

    let response = app
        .oneshot(Request::get("/api/settings").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let persisted = body_json(response).await;
    assert_eq!(persisted["adapters"]["lms"], true);

    std::env::remove_var("CONFIG_DIR");
}
