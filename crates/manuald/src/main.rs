//! manuald - product-manual question answering daemon
//!
//! Answers questions about a product from its manual, falling back from a
//! precomputed snapshot to cached text to full-document analysis.

use anyhow::{Context, Result};
use manuald::clock::SystemClock;
use manuald::manuals::FsManualStore;
use manuald::ollama::OllamaClient;
use manuald::quota::UnlimitedQuota;
use manuald::server::{self, AppState};
use manuald::storage::Store;
use manuald::{Collaborators, Config, QaService};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("manuald v{} starting", manual_shared::VERSION);

    let config = Config::load();
    let store = Store::open(&config.storage.db_path)
        .await
        .with_context(|| format!("opening {}", config.storage.db_path.display()))?;
    info!("Manuals at {}", config.storage.manuals_dir.display());
    info!(
        "Models: answer={} classifier={}",
        config.llm.answer_model, config.llm.classifier_model
    );

    let service = QaService::new(
        &config,
        Collaborators {
            store,
            generator: Arc::new(OllamaClient::new(&config.llm)),
            manuals: Arc::new(FsManualStore::new(config.storage.manuals_dir.clone())),
            quota: Arc::new(UnlimitedQuota),
            clock: Arc::new(SystemClock),
        },
    );

    server::run(AppState::new(service), &config.server.bind).await
}
