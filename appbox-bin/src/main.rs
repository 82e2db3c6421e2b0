use appbox_common::{RuntimePort, SnapshotStore};
use appbox_pool::{AppConfig, AppContext, FsSnapshotStore, LocalRuntime};
use color_eyre::eyre;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting appbox host...");

    let config = AppConfig::from_env();

    // Runtime directories are scratch space unless a location is given.
    let scratch = tempfile::tempdir()?;
    let runtime_dir = std::env::var("APPBOX_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| scratch.path().to_path_buf());
    let snapshot_dir = std::env::var("APPBOX_SNAPSHOT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".appbox/snapshots"));

    info!(
        runtime_dir = %runtime_dir.display(),
        snapshot_dir = %snapshot_dir.display(),
        "Using local runtime"
    );
    let runtime: Arc<dyn RuntimePort> = Arc::new(LocalRuntime::new(&runtime_dir));
    let store: Arc<dyn SnapshotStore> = Arc::new(FsSnapshotStore::new(&snapshot_dir).await?);

    let default_app = config.router.default_app.clone();
    let context = AppContext::new(config, runtime, store);

    for app_id in std::env::args().skip(1) {
        if let Err(e) = context.router.preload_app(&app_id, None).await {
            warn!(app_id = %app_id, error = %e, "Preload failed");
        }
    }

    context
        .router
        .register_app(&default_app, &default_app, None)
        .await;
    context.router.navigate_to_app(&default_app).await?;

    let stats = context.router.get_stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    info!("Host ready. Press Ctrl-C to shut down.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    context.shutdown().await;
    Ok(())
}
