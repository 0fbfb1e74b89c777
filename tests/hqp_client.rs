#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! HQPlayer native-protocol client against a mock TCP server.

mod mock_servers;

use mock_servers::MockHqpServer;

use hifi_bridge::hqp::HqpClient;

async fn connected_client(server: &MockHqpServer) -> HqpClient {
    let client = HqpClient::new("default");
    client
        .configure(
            server.addr().ip().to_string(),
            Some(server.addr().port()),
            None,
            None,
            None,
        )
        .await;
    client
}

#[tokio::test]
async fn connect_primes_info_and_option_lists() {
    let server = MockHqpServer::start().await;
    let client = connected_client(&server).await;

    let info = client.get_info().await.unwrap();
    assert_eq!(info.product, "HQPlayer Embedded");
    assert_eq!(info.version, "5.1.0");

    let status = client.status().await;
    assert!(status.connected);

    let playback = client.get_playback_status().await.unwrap();
    assert_eq!(playback.state, 2);
    assert_eq!(playback.position, 42);

    server.stop();
}

#[tokio::test]
async fn ui_value_translates_to_native_index() {
    let server = MockHqpServer::start().await;
    let client = connected_client(&server).await;

    // The web form sends mode *value* 1 ("Auto"); its native index is 2.
    client.apply_setting("mode", 1).await.unwrap();
    assert!(server
        .commands()
        .iter()
        .any(|c| c.contains("<SetMode") && c.contains(r#"value="2""#)));

    // Shaper value 1 ("ASDM7EC") also maps by value, not position.
    client.apply_setting("shaper", 1).await.unwrap();
    assert!(server
        .commands()
        .iter()
        .any(|c| c.contains("<SetShaping") && c.contains(r#"value="1""#)));

    // samplerate is the exception: the UI already sends an index.
    client.apply_setting("samplerate", 2).await.unwrap();
    assert!(server
        .commands()
        .iter()
        .any(|c| c.contains("<SetRate") && c.contains(r#"value="2""#)));

    // Unknown value is a BadSetting, no command sent.
    let before = server.commands().len();
    let err = client.apply_setting("mode", 42).await.unwrap_err();
    assert!(matches!(err, hifi_bridge::hqp::HqpError::BadSetting(_)));
    assert_eq!(server.commands().len(), before);

    server.stop();
}

#[tokio::test]
async fn filter_update_preserves_the_other_half() {
    let server = MockHqpServer::start().await;
    let client = connected_client(&server).await;

    // Setting the 1x filter to value 0 (index 0) must keep the current Nx
    // filter (index 1 per mock state).
    client.apply_setting("filter1x", 0).await.unwrap();
    assert!(server
        .commands()
        .iter()
        .any(|c| c.contains("<SetFilter") && c.contains(r#"value="1""#) && c.contains(r#"value1x="0""#)));

    server.stop();
}

#[tokio::test]
async fn pipeline_snapshot_resolves_names_from_lists() {
    let server = MockHqpServer::start().await;
    let client = connected_client(&server).await;

    let pipeline = client.pipeline().await.unwrap();
    assert_eq!(pipeline.status.state, "Playing");
    assert_eq!(pipeline.status.mode, "PCM");
    assert_eq!(pipeline.status.active_mode, "PCM");
    assert_eq!(pipeline.volume.value, -20);
    assert_eq!(pipeline.volume.min, -60);
    assert!(!pipeline.volume.is_fixed);
    assert_eq!(pipeline.settings.mode.options.len(), 3);
    assert_eq!(pipeline.settings.filter1x.selected.label, "poly-sinc-ext2");
    assert_eq!(pipeline.settings.samplerate.selected.label, "Auto");

    server.stop();
}

#[tokio::test]
async fn matrix_profiles_round_trip() {
    let server = MockHqpServer::start().await;
    let client = connected_client(&server).await;

    let profiles = client.matrix_profiles().await.unwrap();
    assert_eq!(profiles.len(), 2);
    assert_eq!(profiles[1].name, "Room EQ");

    let current = client.current_matrix_profile().await.unwrap().unwrap();
    assert_eq!(current.name, "Flat");

    client.set_matrix_profile(1).await.unwrap();
    assert!(server
        .commands()
        .iter()
        .any(|c| c.contains("<MatrixSetProfile") && c.contains(r#"value="1""#)));

    server.stop();
}

#[tokio::test]
async fn unreachable_host_reports_unreachable() {
    let client = HqpClient::new("default");
    client
        .configure("127.0.0.1".into(), Some(1), None, None, None)
        .await;
    let err = client.get_playback_status().await.unwrap_err();
    assert!(matches!(err, hifi_bridge::hqp::HqpError::Unreachable(_)));
}
