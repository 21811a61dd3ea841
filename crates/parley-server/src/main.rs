use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use parley_db::Database;
use parley_gateway::Hub;
use parley_media::{LocalMedia, MediaStore, RemoteMedia};
use parley_server::config::{Config, MediaBackend};
use parley_server::{ServerState, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Database::open(&config.db_path)?;

    // Media backend
    let media: Arc<dyn MediaStore> = match &config.media {
        MediaBackend::Local { dir, public_url } => {
            Arc::new(LocalMedia::new(dir.clone(), public_url.clone()).await?)
        }
        MediaBackend::Remote(remote) => {
            info!("Uploading media to {}", remote.storage_url);
            Arc::new(RemoteMedia::new(remote.clone()))
        }
    };
    let media_dir = match &config.media {
        MediaBackend::Local { dir, .. } => Some(dir.as_path()),
        MediaBackend::Remote(_) => None,
    };

    let hub = Hub::new(Arc::new(db), media, config.gateway.clone());
    info!(
        "Gateway using {} frames, group persistence {}",
        config.gateway.frame_format,
        if config.gateway.persist_group_before_broadcast { "before broadcast" } else { "in background" }
    );

    let state = ServerState {
        hub: hub.clone(),
        max_frame_bytes: config.max_frame_bytes,
    };
    let app = router(state, media_dir);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    Ok(())
}

async fn shutdown_signal(hub: Hub) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            },
            Err(e) => {
                warn!("SIGTERM handler unavailable ({}), waiting for Ctrl+C only", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }

    hub.shutdown().await;
}
