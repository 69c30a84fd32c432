use anyhow::{Context, Result};
use likeness_core::IdentityStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{Bus, Config};
use dbus_interface::{LikenessService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("likenessd starting");

    let config = Config::load()?;
    tracing::info!(?config, "configuration resolved");

    let store = Arc::new(
        IdentityStore::load(&config.store_path, config.embedding_dim)
            .context("failed to load identity store")?,
    );

    let engine = engine::spawn_engine(
        &config.detector_model_path(),
        &config.embedder_model_path(),
        config.detector_confidence,
        Arc::clone(&store),
        config.similarity_threshold,
    )
    .context("failed to start recognition engine")?;

    let service = LikenessService::new(engine, store, config.similarity_threshold);
    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "likenessd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("likenessd shutting down");

    Ok(())
}
