#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! LMS backend against a mock JSON-RPC server, through the real bus.

mod mock_servers;

use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

use hifi_bridge::adapters::lms::LmsBackend;
use hifi_bridge::bus::{create_events, ZoneBus};
use mock_servers::MockLmsServer;

const PLAYER: &str = "aa:bb:cc:dd:ee:ff";

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
#[serial]
async fn discovers_players_and_routes_commands() {
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("CONFIG_DIR", tmp.path());
    std::env::set_var("LMS_POLL_INTERVAL", "1");

    let mock = MockLmsServer::start().await;
    mock.add_player(PLAYER, "Kitchen").await;
    mock.set_now_playing(PLAYER, "So What", "Miles Davis", "Kind of Blue")
        .await;
    mock.set_mode(PLAYER, "play").await;

    let events = create_events();
    let bus = Arc::new(ZoneBus::new(events.clone()));
    tokio::spawn(bus.clone().run_event_loop());

    let lms = LmsBackend::new(events);
    lms.configure(mock.addr().ip().to_string(), Some(mock.addr().port()), None, None)
        .await;
    bus.enable_backend("lms", lms.clone()).await.unwrap();

    // The poll loop discovers the player and the bus picks it up via the
    // zone-set-changed notification.
    let zone_id = format!("lms:{}", PLAYER);
    assert!(
        wait_for(|| {
            let bus = bus.clone();
            let zone_id = zone_id.clone();
            async move { bus.get_zone(&zone_id).await.is_some() }
        })
        .await,
        "player should appear as a bus zone"
    );

    let zone = bus.get_zone(&zone_id).await.unwrap();
    assert_eq!(zone.zone_name, "Kitchen");

    // Now-playing flows from the poll cache.
    let np = bus.get_now_playing(&zone_id, None).await.unwrap();
    assert_eq!(np.line1, "So What");
    assert_eq!(np.line2, "Miles Davis");
    assert!(np.is_playing);

    // Commands reach the server with the prefix stripped.
    bus.control(&zone_id, "pause", None, None).await.unwrap();
    bus.control(&zone_id, "vol_abs", Some(&serde_json::json!(40)), None)
        .await
        .unwrap();
    let commands = mock.commands().await;
    assert!(commands
        .iter()
        .any(|(id, cmd)| id == PLAYER && cmd.first().map(String::as_str) == Some("pause")));
    assert!(commands.iter().any(|(id, cmd)| {
        id == PLAYER
            && cmd.first().map(String::as_str) == Some("mixer")
            && cmd.get(2).map(String::as_str) == Some("40")
    }));

    // Removing the player shrinks the zone set and flips the sha.
    let sha_before = bus.get_zones_sha().await;
    mock.remove_player(PLAYER).await;
    assert!(
        wait_for(|| {
            let bus = bus.clone();
            let zone_id = zone_id.clone();
            async move { bus.get_zone(&zone_id).await.is_none() }
        })
        .await,
        "removed player should leave the cache"
    );
    assert_ne!(bus.get_zones_sha().await, sha_before);

    bus.unregister_backend("lms").await.unwrap();
    mock.stop();
    std::env::remove_var("LMS_POLL_INTERVAL");
    std::env::remove_var("CONFIG_DIR");
}
