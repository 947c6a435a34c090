use std::sync::Arc;

use tokio::net::TcpListener;

use bazaar_gateway::auth;
use bazaar_gateway::config::{generate_config_template, Config};
use bazaar_gateway::db::{self, SqliteStore};
use bazaar_gateway::presence::spawn_presence_sweeper;
use bazaar_gateway::routes;
use bazaar_gateway::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bazaar_gateway=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("bazaar gateway v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    let gateway = config.gateway.settings();
    tracing::info!(
        heartbeat_secs = gateway.heartbeat_interval.as_secs(),
        presence_ttl_secs = gateway.presence_ttl.as_secs(),
        media_base_url = %gateway.media_base_url,
        "Gateway settings loaded"
    );

    let app_state = AppState::new(Arc::new(SqliteStore::new(db)), jwt_secret, gateway);
    spawn_presence_sweeper(
        app_state.presence.clone(),
        app_state.gateway.presence_sweep_interval,
    );

    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
