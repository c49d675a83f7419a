use anyhow::{Context as _, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::storage::{BlobStore, Database};

/// Shared handles passed to every component. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    pub db: Database,
    pub http: reqwest::Client,
    pub blobs: BlobStore,
    pub hostname: Arc<str>,
    pub development: bool,
}

impl Context {
    pub fn new(
        db: Database,
        blobs: BlobStore,
        hostname: &str,
        development: bool,
        request_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            db,
            http: build_http_client(request_timeout)?,
            blobs,
            hostname: Arc::from(hostname),
            development,
        })
    }

    /// Open storage under the configured data directory and build the context.
    pub async fn from_config(config: &Config) -> Result<Self> {
        tokio::fs::create_dir_all(config.files_directory())
            .await
            .with_context(|| {
                format!(
                    "Failed to create data directory {}",
                    config.data_directory.display()
                )
            })?;

        let db_path = config.database_path();
        let db_path = db_path
            .to_str()
            .context("Database path is not valid UTF-8")?;
        let db = Database::open(db_path)
            .await
            .context("Failed to open database")?;

        Self::new(
            db,
            BlobStore::new(config.files_directory()),
            &config.hostname,
            config.is_development(),
            config.workers.request_timeout(),
        )
    }
}

fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("letterbox/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        // Subscriber callbacks are validated before use; don't follow them elsewhere
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("Failed to build HTTP client")
}
