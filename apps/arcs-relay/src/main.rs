use anyhow::{Context, Result};
use arcs_relay::audit::AuditLogger;
use arcs_relay::cli::{self, Cli, Commands};
use arcs_relay::config::Config;
use arcs_relay::jwt::JwtManager;
use arcs_relay::rate_limit::RateLimiter;
use arcs_relay::registry::DeviceRegistry;
use arcs_relay::sessions::SessionRegistry;
use arcs_relay::stream::StreamRouter;
use arcs_relay::websocket::{self, RelayState};
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    match cli.command {
        Some(Commands::RegisterDevice {
            store,
            device_id,
            secret,
            model,
            android_version,
        }) => {
            let store = store
                .or(config.device_store_path)
                .unwrap_or_else(|| "arcs_devices.json".to_string());
            if let Err(err) =
                cli::run_register_device(&store, &device_id, &secret, &model, android_version)
            {
                error!("register-device failed: {:#}", err);
                std::process::exit(1);
            }
        }
        Some(Commands::Ping { url }) => {
            if let Err(err) = cli::run_ping_client(url).await {
                error!("ping failed: {:#}", err);
                std::process::exit(1);
            }
        }
        None => {
            if let Err(err) = run_server(config).await {
                error!("server error: {:#}", err);
                std::process::exit(1);
            }
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    info!("Starting ARCS relay on port {}", config.port);
    info!(
        "Token TTL: {} hours, idle timeout: {} seconds",
        config.token_ttl_hours, config.idle_timeout_secs
    );

    let registry = Arc::new(DeviceRegistry::new());
    match &config.device_store_path {
        Some(path) => match registry.load_from_path(Path::new(path)) {
            Ok(count) => info!("Loaded {} device credentials from {}", count, path),
            Err(err) => warn!("Device store unavailable ({}); registry starts empty", err),
        },
        None => warn!("ARCS_DEVICE_STORE not set; no devices can authenticate"),
    }

    let audit = Arc::new(
        AuditLogger::open(&config.audit_log_path)
            .with_context(|| format!("opening audit log {}", config.audit_log_path))?,
    );

    let state = RelayState::new(
        registry,
        Arc::new(SessionRegistry::with_idle_timeout(Duration::from_secs(
            config.idle_timeout_secs,
        ))),
        Arc::new(StreamRouter::new()),
        Arc::new(JwtManager::with_ttl(
            &config.jwt_secret,
            chrono::Duration::hours(config.token_ttl_hours),
        )),
        Arc::new(RateLimiter::new()),
        audit.clone(),
    );

    let reaper = websocket::spawn_idle_reaper(
        state.clone(),
        Duration::from_secs(config.cleanup_interval_secs),
    );

    let app = websocket::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("ARCS relay listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving")?;

    reaper.abort();
    audit.flush();
    info!("ARCS relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to install ctrl-c handler: {}", err);
    }
}
