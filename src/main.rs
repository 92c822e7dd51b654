use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use config::DeletionThreshold;
use handlers::AppState;
use services::{
    blob_store::{LocalBlobStore, UrlSigner},
    deletion_worker::{DeletionWorker, deletion_queue, reconcile},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        storage_dir = %cfg.storage_dir,
        database_url = %cfg.database_url,
        public_url = %cfg.public_url,
        deletion_threshold = cfg.deletion_threshold,
        "starting flowstore"
    );

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // Create the database file's parent directory if needed
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(
        db::connect(&cfg.database_url)
            .await
            .with_context(|| format!("connecting to {}", cfg.database_url))?,
    );
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let secret = match &cfg.signing_secret {
        Some(secret) => secret.clone(),
        None => {
            tracing::warn!(
                "FLOWSTORE_SIGNING_SECRET is not set; presigned URLs will not survive a restart"
            );
            Uuid::new_v4().to_string()
        }
    };
    let blobs = Arc::new(LocalBlobStore::new(
        cfg.storage_dir.clone(),
        cfg.public_url.clone(),
        UrlSigner::new(secret),
    ));

    let (queue, rx) = deletion_queue();
    let state = AppState::new(
        db.clone(),
        blobs,
        Duration::from_secs(cfg.presign_ttl_secs),
        DeletionThreshold::new(cfg.deletion_threshold),
        queue.clone(),
    );

    let worker = DeletionWorker::new(db.clone(), state.segments.clone(), state.flows.clone(), rx);
    tokio::spawn(worker.run());
    reconcile(&db, &queue).await?;

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

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
