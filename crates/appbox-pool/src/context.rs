use appbox_common::{RuntimePort, SnapshotStore};
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::pool::PoolManager;
use crate::router::Router;

/// Everything a host needs to serve applications: one pool and the router in
/// front of it. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub pool: Arc<PoolManager>,
    pub router: Arc<Router>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        runtime: Arc<dyn RuntimePort>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        info!(
            max_instances = config.pool.max_instances,
            max_memory_mb = config.pool.max_memory_mb,
            base_path = %config.router.base_path,
            default_app = %config.router.default_app,
            "Initializing app context"
        );
        let pool = PoolManager::new(config.pool, runtime, store);
        let router = Arc::new(Router::new(Arc::clone(&pool), config.router));
        Self { pool, router }
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        info!("App context shut down");
    }
}
