//! Client orchestration: connects, seeds the full walk, starts the
//! watcher, and drives the 1s drain-tick loop for the process lifetime.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ClientConf;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::event::{EventPipeline, SyncOps};
use crate::reconcile::Reconciler;
use crate::watch;

/// Default number of concurrent `CHECK` dispatches per drain tick.
const DEFAULT_CHECK_PARALLELISM: usize = 20;

pub async fn run(conf: Arc<ClientConf>, host_name: Option<String>, check_parallelism: Option<usize>) -> Result<()> {
    let host = conf.select_host(host_name.as_deref())?.clone();
    let conn = Arc::new(ConnectionManager::new(host.clone()));
    conn.verify_version().await?;

    let pipeline = Arc::new(EventPipeline::new(
        conf.home.clone(),
        check_parallelism.unwrap_or(DEFAULT_CHECK_PARALLELISM),
    ));
    let reconciler: Arc<dyn SyncOps> = Arc::new(Reconciler::new(
        conn,
        conf.clone(),
        host.token.clone(),
        pipeline.clone(),
    ));

    tracing::info!(home = %conf.home.display(), "seeding full reconciliation walk");
    pipeline.seed_full_walk(&conf);

    let watch = watch::spawn_watcher(conf.home.clone(), conf.clone(), pipeline.clone())
        .map_err(|e| crate::error::HsyncError::Network(e.to_string()))?;

    tracing::info!(host = %host.host, "hsync client running");
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        pipeline.drain_tick(reconciler.clone(), watch.as_ref()).await;
    }
}
