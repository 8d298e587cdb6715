pub mod admin;
pub mod cache;
pub mod cli;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod settings;
pub mod store;

use anyhow::{Context, Result};
use tracing::{info, warn};

pub use cache::{CacheConfig, CacheOutcome, ResponseCache};
pub use protocol::{BodySink, CacheRequest, DispatchError, Handler, Response};

use crate::settings::Settings;

/// Opens the cache described by `settings` and hosts the admin endpoint
/// until interrupted. Embedders call [`ResponseCache::handle`] from their
/// own dispatch path.
pub async fn run(settings: Settings) -> Result<()> {
    let cache = ResponseCache::open(&settings).context("failed to open response cache")?;

    let admin = settings.admin_listen.map(|addr| {
        let cache = cache.clone();
        tokio::spawn(async move {
            if let Err(err) = admin::serve(addr, cache).await {
                tracing::error!(error = %err, "admin endpoint failed");
            }
        })
    });
    if admin.is_none() {
        warn!("admin_listen not set; cache is not reachable for management");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(stats = ?cache.stats(), "shutting down");
    if let Some(task) = admin {
        task.abort();
    }
    cache.clear();
    Ok(())
}
