use anyhow::{Context, Result};
use clap::Parser;
use std::{
    env,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

const DEFAULT_DELETION_THRESHOLD: u64 = 100;
const DEFAULT_PRESIGN_TTL_SECS: u64 = 3600;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub public_url: String,
    pub signing_secret: Option<String>,
    pub presign_ttl_secs: u64,
    pub deletion_threshold: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Time-addressable media flow and segment store")]
pub struct Args {
    /// Host to bind to (overrides FLOWSTORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FLOWSTORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where segment payloads are stored (overrides FLOWSTORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides FLOWSTORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Origin used when building presigned blob URLs (overrides FLOWSTORE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Lifetime of presigned URLs in seconds (overrides FLOWSTORE_PRESIGN_TTL_SECS)
    #[arg(long)]
    pub presign_ttl_secs: Option<u64>,

    /// Segment count above which flow deletions are queued
    /// (overrides FLOWSTORE_DELETION_THRESHOLD)
    #[arg(long)]
    pub deletion_threshold: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("FLOWSTORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_number("FLOWSTORE_PORT", 3000)?;
        let env_storage =
            env::var("FLOWSTORE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("FLOWSTORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/flowstore.db".into());
        let env_public_url =
            env::var("FLOWSTORE_PUBLIC_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".into());
        let env_ttl = env_number("FLOWSTORE_PRESIGN_TTL_SECS", DEFAULT_PRESIGN_TTL_SECS)?;
        let env_threshold =
            env_number("FLOWSTORE_DELETION_THRESHOLD", DEFAULT_DELETION_THRESHOLD)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_url: args.public_url.unwrap_or(env_public_url),
            signing_secret: env::var("FLOWSTORE_SIGNING_SECRET").ok(),
            presign_ttl_secs: args.presign_ttl_secs.unwrap_or(env_ttl),
            deletion_threshold: args.deletion_threshold.unwrap_or(env_threshold),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read a numeric env var, falling back to `default` when unset.
fn env_number<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

/// Runtime-adjustable segment count above which deletions are queued.
///
/// Clones share the same cell, so an update is seen by every holder.
#[derive(Debug, Clone)]
pub struct DeletionThreshold(Arc<AtomicU64>);

impl DeletionThreshold {
    pub fn new(value: u64) -> Self {
        Self(Arc::new(AtomicU64::new(value)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

impl Default for DeletionThreshold {
    fn default() -> Self {
        Self::new(DEFAULT_DELETION_THRESHOLD)
    }
}
