use anyhow::{Context, Result};
use ofuton_store::{
    config::{AppConfig, RunMode},
    routes::routes,
    services::{metadata_index::MetadataIndex, reconcile},
    state::AppState,
};
use std::io::ErrorKind;
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting ofuton-store with config: {:?}", cfg);
    if cfg.access_key.is_empty() || cfg.secret_key.is_empty() {
        tracing::warn!("access key or secret key is empty; signed writes use empty credentials");
    }

    // --- Ensure storage directories exist ---
    for dir in [&cfg.storage_dir, &cfg.temp_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating directory {}", dir.display()))?;
            tracing::info!("Created directory at {}", dir.display());
        }
    }

    // --- Initialize SQLite metadata index ---
    let index = MetadataIndex::connect(&cfg.database_url)
        .await
        .with_context(|| format!("opening database {}", cfg.database_url))?;
    index.migrate().await.context("applying schema")?;

    match mode {
        RunMode::Migrate => {
            tracing::info!("Database migration complete.");
            return Ok(());
        }
        RunMode::CreateIndex => {
            let summary = reconcile::create_index(&index, &cfg.storage_dir).await?;
            tracing::info!(?summary, "Reconciliation finished.");
            return Ok(());
        }
        RunMode::Serve => {}
    }

    // --- Build router ---
    let state = AppState::new(cfg.clone(), index);
    let app = routes::app(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
