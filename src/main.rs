//! DOTS server
//!
//! This is the main entry point for the DOTS mitigation server.
//! It wires the stores, blockers, selection service, orchestration engine
//! and lifetime sweeper together and starts the web server.

use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;

use dots_server::api::{self, ApiState};
use dots_server::config;
use dots_server::core::{
    AliasStore, BlockerRegistry, InMemoryAliasStore, InMemoryProtectionStore, InMemoryScopeStore,
    LowestLoadSelection, MitigationEngine, MitigationScopeStore, ProtectionStore, RedisAliasStore,
    RedisProtectionStore, RedisScopeStore, SelectionService,
};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting DOTS server...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;

    if config.metrics.enabled {
        let listen: SocketAddr = config
            .metrics
            .listen
            .parse()
            .with_context(|| format!("Invalid metrics listen address {}", config.metrics.listen))?;
        PrometheusBuilder::new()
            .with_http_listener(listen)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus exporter listening on {}", listen);
    }

    // Initialize stores
    let (store, protection_store, alias_store): (
        Arc<dyn MitigationScopeStore>,
        Arc<dyn ProtectionStore>,
        Arc<dyn AliasStore>,
    ) = if config.redis.enabled {
        let redis_client = redis::Client::open(config.redis.url.as_str())
            .context("Failed to create Redis client")?;
        let redis = redis_client
            .get_connection_manager()
            .await
            .context("Failed to connect to Redis")?;
        (
            Arc::new(RedisScopeStore::new(redis.clone())),
            Arc::new(RedisProtectionStore::new(redis.clone())),
            Arc::new(RedisAliasStore::new(redis)),
        )
    } else {
        warn!("Redis disabled, mitigation state is kept in memory only");
        (
            Arc::new(InMemoryScopeStore::new()),
            Arc::new(InMemoryProtectionStore::new()),
            Arc::new(InMemoryAliasStore::new()),
        )
    };

    // Initialize blockers
    let pool = BlockerRegistry::with_builtin()
        .build_pool(&config.blockers)
        .context("Failed to build blocker pool")?;
    info!("Configured {} blockers", pool.len());
    let selection = SelectionService::start(pool, Arc::new(LowestLoadSelection), config.selection.queue_size);

    // Initialize engine
    let engine = MitigationEngine::builder()
        .store(store.clone())
        .protection_store(protection_store)
        .alias_store(alias_store)
        .selection(Arc::new(selection))
        .lifetime(config.lifetime.clone())
        .build()
        .context("Failed to build mitigation engine")?;
    engine
        .registry()
        .init(store.as_ref())
        .await
        .context("Failed to load active mitigations")?;
    let sweeper = engine.start_sweeper();

    // Create API state
    let state = web::Data::new(ApiState {
        engine: engine.clone(),
    });

    // Start HTTP server
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))?
        .run()
        .await?;

    info!("Shutting down DOTS server...");
    sweeper.shutdown().await;
    engine.registry().shutdown().await;
    Ok(())
}
