//! Process entry point: wire the bus, backends, HQPlayer services, knob
//! registry and HTTP server together, then run until SIGINT/SIGTERM.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hifi_bridge::adapters::{
    hqplayer::HqpBackend, lms::LmsBackend, openhome::OpenHomeBackend, roon::RoonBackend,
    upnp::UpnpBackend, Backend,
};
use hifi_bridge::api::{self, AppState};
use hifi_bridge::bus::{create_events, BridgeEvent, ZoneBus};
use hifi_bridge::config;
use hifi_bridge::coordinator::AdapterCoordinator;
use hifi_bridge::hqp::{HqpInstanceManager, HqpLinkService};
use hifi_bridge::knobs::KnobRegistry;
use hifi_bridge::settings::SettingsStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config::log_filter()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting hifi-bridge v{}", env!("CARGO_PKG_VERSION"));

    let cfg = config::load_config()?;
    tracing::info!("Listening port: {}", cfg.port);

    let events = create_events();
    let bus = Arc::new(ZoneBus::new(events.clone()));
    tokio::spawn(bus.clone().run_event_loop());

    let settings = Arc::new(SettingsStore::load());
    let knobs = KnobRegistry::new();

    // HQPlayer services: the DSP client is always available regardless of the
    // hqp zone-backend toggle.
    let hqp_instances = Arc::new(HqpInstanceManager::new());
    hqp_instances.load_from_config().await;
    if let Some(ref seed) = cfg.hqplayer {
        hqp_instances
            .upsert(
                "default",
                seed.host.clone(),
                Some(seed.port),
                None,
                seed.username.clone(),
                seed.password.clone(),
            )
            .await;
        tracing::info!("HQPlayer default instance seeded from env: {}", seed.host);
    }
    let hqp_links = Arc::new(HqpLinkService::load(hqp_instances.clone(), settings.clone()).await);

    // Backend catalog. Factories run when the coordinator enables a prefix.
    let display_url = format!(
        "http://{}:{}",
        gethostname::gethostname().to_string_lossy(),
        cfg.port
    );
    let lms = LmsBackend::new(events.clone());
    if let Some(ref seed) = cfg.lms {
        lms.configure(
            seed.host.clone(),
            Some(seed.port),
            seed.username.clone(),
            seed.password.clone(),
        )
        .await;
        tracing::info!("LMS seeded from env: {}:{}", seed.host, seed.port);
    }

    let mut coordinator = AdapterCoordinator::new(bus.clone());
    {
        let events = events.clone();
        let display_url = display_url.clone();
        coordinator.register_factory(
            "roon",
            Box::new(move || -> Arc<dyn Backend> { RoonBackend::new(events.clone(), display_url.clone()) }),
        );
    }
    {
        let lms = lms.clone();
        coordinator.register_factory("lms", Box::new(move || -> Arc<dyn Backend> { lms.clone() }));
    }
    {
        let events = events.clone();
        coordinator.register_factory(
            "openhome",
            Box::new(move || -> Arc<dyn Backend> { OpenHomeBackend::new(events.clone()) }),
        );
    }
    {
        let events = events.clone();
        coordinator
            .register_factory("upnp", Box::new(move || -> Arc<dyn Backend> { UpnpBackend::new(events.clone()) }));
    }
    {
        let events = events.clone();
        let instances = hqp_instances.clone();
        coordinator.register_factory(
            "hqp",
            Box::new(move || -> Arc<dyn Backend> { HqpBackend::new(instances.clone(), events.clone()) }),
        );
    }
    let coordinator = Arc::new(coordinator);
    coordinator.start_all(&settings.get().adapters).await;

    let state = AppState {
        bus: bus.clone(),
        knobs,
        settings,
        hqp_instances,
        hqp_links,
        coordinator: coordinator.clone(),
        started_at: Instant::now(),
    };

    let router = api::build_router(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down backends...");
    events.publish(BridgeEvent::ShuttingDown);
    coordinator.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
