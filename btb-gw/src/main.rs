//! btb-gw - Tilda to Bitrix24 submission gateway
//!
//! Ingests Tilda form submissions, reconciles them into the Bitrix24
//! contact/deal graph, forwards selected Bitrix24 events to a third party,
//! and routes uploaded files into deal-attached Disk storage.

use anyhow::Result;
use btb_common::config::Settings;
use btb_gw::{api, build_router, AppState};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "btb-gw", about = "Tilda to Bitrix24 submission gateway")]
struct Args {
    /// Path to the TOML settings file
    #[arg(long, env = "BTB_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the settings file
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting btb-gw (Tilda to Bitrix24 gateway) v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        settings.listen_addr = listen;
    }
    info!("Mapping file: {}", settings.mapping_file.display());
    info!("Audit log: {}", settings.audit_log.display());

    let state = AppState::new(settings)?;

    // Startup prefetch of the deal field schema is best-effort; the cache
    // endpoint reports 503 until a snapshot exists.
    if let Err(e) = api::fields::cache_deal_fields(&state).await {
        warn!("failed to cache Bitrix24 deal fields at startup: {e}");
    }

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&state.settings.listen_addr).await?;
    info!("btb-gw listening on http://{}", state.settings.listen_addr);
    info!("Health check: http://{}/health", state.settings.listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
