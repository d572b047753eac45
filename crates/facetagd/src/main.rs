use anyhow::Result;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod chat;
mod config;
mod cropper;
mod dbus_interface;
mod detector;
mod engine;
mod retry;
mod tagger;

use config::{Bus, Config};
use dbus_interface::{FaceTagService, BUS_NAME, OBJECT_PATH};
use engine::{Engine, EngineHandle};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facetagd starting");

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        storage = %config.storage_dir.display(),
        photos = %config.photos_bucket,
        faces = %config.faces_bucket,
        "configuration loaded"
    );

    let engine = EngineHandle::new(Engine::open(&config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = engine::spawn_queue_poller(engine.clone(), config.queue_poll, shutdown_rx);

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FaceTagService::new(engine))?
        .build()
        .await?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "facetagd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facetagd shutting down");

    let _ = shutdown_tx.send(true);
    poller.await?;

    Ok(())
}
