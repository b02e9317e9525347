use axum::routing::get;
use axum::Router;
use clap::Parser;
use mimalloc::MiMalloc;
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use autopost_internal::config_parser::{Config, EnvSettings};
use autopost_internal::error;
use autopost_internal::gateway_util::{self, AppStateData};
use autopost_internal::observability::{self, LogFormat};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the `autopost.toml` config file at the specified path. Defaults apply when omitted.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Sets the log format used for all gateway logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Set up logs and metrics immediately, so that we can use `tracing`.
    observability::setup_observability(args.log_format).expect_pretty("Failed to set up logs");

    tracing::info!("Starting AutoPost gateway {}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = observability::setup_metrics().expect_pretty("Failed to set up metrics");

    let config = match &args.config_file {
        Some(path) => Config::load_from_path(path)
            .await
            .expect_pretty("Failed to load config"),
        None => {
            tracing::info!("No config file provided, using default settings");
            Config::default()
        }
    };

    error::set_debug(config.gateway.debug).expect_pretty("Failed to set debug mode");

    let app_state = AppStateData::new(&config, EnvSettings::from_env())
        .await
        .expect_pretty("Failed to initialize AppState");

    let quota_tracking_pretty = if app_state.quota_tracker.is_metered() {
        format!("enabled ({})", app_state.quota_tracker.store().backend_name())
    } else {
        "disabled".to_string()
    };

    // The sports, generation and messaging proxies are mounted by embedders
    let router = gateway_util::build_router(app_state, Router::new())
        .route(
            "/metrics",
            get(move || std::future::ready(metrics_handle.render())),
        )
        // We log failed requests at 'DEBUG', since errors already log themselves on construction
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .layer(CorsLayer::permissive());

    // Bind to the socket address specified in the config, or default to 0.0.0.0:8000
    let bind_address = config
        .gateway
        .bind_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000)));

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to socket address {bind_address}: {e}. Tip: Ensure no other process is using port {} or try a different port.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to socket address {bind_address}: {e}");
            std::process::exit(1);
        }
    };
    // This will give us the chosen port if the user specified a port of 0
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    let config_path_pretty = if let Some(path) = &args.config_file {
        format!("config file `{}`", path.to_string_lossy())
    } else {
        "no config file".to_string()
    };

    tracing::info!(
        "AutoPost gateway is listening on {actual_bind_address} with {config_path_pretty} and quota tracking {quota_tracking_pretty}.",
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Failed to start server");
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
    };
}

/// `expect_pretty` is the only sanctioned way to bail out during startup.
/// It logs the error and exits with status 1. Code outside main.rs
/// propagates errors instead.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}
