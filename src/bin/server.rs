use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use warp::{self, Filter};

use rusty_gate::config::{GateConfig, RoomConfigTable};
use rusty_gate::core::LifecycleSupervisor;
use rusty_gate::events::EventRecorder;
use rusty_gate::handlers::{ws_routes, WsContext};
use rusty_gate::storage::{CounterStore, InMemoryCounterStore, TimeoutStore};

#[tokio::main]
async fn main() {
    // Initialize env
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    match dotenv_result {
        Ok(_) => info!("Environment variables loaded from .env file"),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Load config from environment
    let config = match GateConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: host={}, port={}, store={}, failure_policy={}",
        config.host, config.port, config.store_url, config.failure_policy
    );

    let store = match build_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to initialize counter store: {}", e);
            std::process::exit(1);
        }
    };

    let rooms = match RoomConfigTable::new(config.default_limits.clone()) {
        Ok(rooms) => rooms,
        Err(e) => {
            error!("Invalid default limits: {}", e);
            std::process::exit(1);
        }
    };

    let supervisor = LifecycleSupervisor::builder(
        store.clone(),
        Arc::new(rooms),
        Arc::new(EventRecorder::new()),
        config.failure_policy,
    )
    .heartbeat_timeout(config.heartbeat_timeout)
    .build();
    supervisor.start_reaper_task(config.reap_interval);

    let ws_route = ws_routes(WsContext {
        supervisor,
        idle_timeout: config.heartbeat_timeout,
    });

    // Create health check route
    let health_route = warp::path("health").and(warp::path::end()).and_then(move || {
        let store = store.clone();
        async move {
            match store.health_check().await {
                Ok(true) => Ok::<_, warp::Rejection>(warp::reply::with_status(
                    "OK",
                    warp::http::StatusCode::OK,
                )),
                _ => Ok(warp::reply::with_status(
                    "STORE UNAVAILABLE",
                    warp::http::StatusCode::SERVICE_UNAVAILABLE,
                )),
            }
        }
    });

    // Combine routes
    let routes = ws_route.or(health_route);

    // Build the server address
    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Rusty Gate on {}", addr);
    warp::serve(routes).run(addr).await;
}

async fn build_store(config: &GateConfig) -> rusty_gate::Result<Arc<dyn CounterStore>> {
    if config.store_url == "memory" {
        warn!("Using the in-memory counter store: limits are enforced per process only");
        let memory = Arc::new(InMemoryCounterStore::new());
        memory.clone().start_cleanup_task(Duration::from_secs(60));
        return Ok(Arc::new(TimeoutStore::new(memory, config.store_timeout)));
    }

    #[cfg(feature = "redis-store")]
    {
        use rusty_gate::storage::{RedisCounterStore, RedisStoreConfig};

        let redis = RedisCounterStore::connect_with_config(
            &config.store_url,
            RedisStoreConfig {
                key_prefix: config.key_prefix.clone(),
            },
        )
        .await?;
        info!("Connected to Redis counter store");
        Ok(Arc::new(TimeoutStore::new(redis, config.store_timeout)))
    }

    #[cfg(not(feature = "redis-store"))]
    {
        Err(rusty_gate::RustyGateError::ConfigError(format!(
            "Store URL '{}' requires the redis-store feature",
            config.store_url
        )))
    }
}
