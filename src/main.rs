use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;

use aux_sfu::config;
use aux_sfu::http_api;
use aux_sfu::logging;
use aux_sfu::metrics::register_metrics;
use aux_sfu::registry::RoomsRegistry;
use aux_sfu::signaling::{spawn_rejoin_watchdog, SignalingClient};
use aux_sfu::webrtc_session::WebRtcSessionFactory;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Validate environment variables before starting the server
    let cfg = config::validate_env().unwrap_or_else(|e| {
        eprintln!("Environment validation failed: {}", e);
        std::process::exit(1);
    });

    // Initialize tracing with validated RUST_LOG
    logging::init(&cfg.rust_log);

    // Initialize Metrics
    register_metrics();

    let cfg = Arc::new(cfg);
    let signaling = Arc::new(SignalingClient::new(cfg.logjam_base_url.clone()));
    let factory = Arc::new(WebRtcSessionFactory::new(cfg.clone()));

    let (rejoin_tx, rejoin_rx) = mpsc::unbounded_channel();
    let registry = RoomsRegistry::new(factory, signaling.clone(), rejoin_tx, cfg.split_sessions);
    let watchdog = spawn_rejoin_watchdog(registry.clone(), signaling, rejoin_rx);

    // Legacy: join the configured room right away.
    if let Some(room) = &cfg.target_room {
        registry.request_join(room.clone(), true);
    }

    let addr: SocketAddr = cfg.listen_addr.parse()?;
    info!("auxiliary SFU listening on {}", addr);

    let routes = http_api::routes(registry.clone());
    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal (SIGINT/SIGTERM)");
    });
    server.await;

    // Shutdown sequence
    info!("Shutting down - closing active rooms...");
    registry.shutdown().await;
    watchdog.abort();
    info!("Shutdown complete");

    Ok(())
}
