use parking_lot::Mutex;
use std::sync::Arc;

use audiocast_lib::config::CacheConfig;
use audiocast_lib::database::Database;
use audiocast_lib::extractor::YtDlp;
use audiocast_lib::quota::spawn_eviction_task;
use audiocast_lib::server::{ApiServer, AppState};
use audiocast_lib::streaming::http_client;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = CacheConfig::from_env().expect("Invalid configuration");

    std::fs::create_dir_all(&config.cache_root).expect("Failed to create cache directory");
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let database = Database::new(&config.database_path).expect("Failed to initialize database");
    let extractor = Arc::new(YtDlp::new(&config));
    let http = http_client(&config).expect("Failed to build HTTP client");

    let bind_addr = config.bind_addr;
    let eviction_interval = config.eviction_interval();
    let config = Arc::new(config);

    let state = AppState::new(Arc::new(Mutex::new(database)), extractor, config, http);

    if let Err(e) = state.downloads.recover_interrupted() {
        log::error!("failed to recover interrupted downloads: {}", e);
    }

    let _eviction = spawn_eviction_task(state.quota.clone(), eviction_interval);

    let server = ApiServer::start(bind_addr, state)
        .await
        .expect("Failed to start HTTP server");

    tokio::signal::ctrl_c().await.ok();
    log::info!("shutting down");
    server.shutdown();
}
