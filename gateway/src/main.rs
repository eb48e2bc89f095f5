use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use axum::Router;
use clap::Parser;
use http::Method;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use voicebridge_gateway::errors::ErrorKind;
use voicebridge_gateway::{AppState, BridgeError, ServerConfig, config, routes};

/// Exit codes for the daemon.
const EXIT_CONFIG: u8 = 1;
const EXIT_CREDENTIALS: u8 = 2;
const EXIT_CACHE: u8 = 3;

/// Grace window for sessions to end naturally on SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Voicebridge Gateway - real-time voice-to-voice bridge between callers
/// and LLM agents
#[derive(Parser, Debug)]
#[command(name = "voicebridge-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before anything reads the environment.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let missing = config.missing_credentials();
    if !missing.is_empty() {
        error!("missing upstream credentials: {}", missing.join(", "));
        return ExitCode::from(EXIT_CREDENTIALS);
    }

    config::warn_on_unusual(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            let code = match e.kind {
                ErrorKind::Config => EXIT_CONFIG,
                ErrorKind::Upstream => EXIT_CACHE,
                _ => EXIT_CONFIG,
            };
            ExitCode::from(code)
        }
    }
}

fn load_config(cli: &Cli) -> Result<ServerConfig, BridgeError> {
    match &cli.config {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            ServerConfig::from_file(path)
        }
        None => ServerConfig::from_env(),
    }
}

async fn run(config: ServerConfig) -> Result<(), BridgeError> {
    let address = config.address();
    let cors_origins = config.cors_allowed_origins.clone();

    // AppState::new surfaces an unreachable shared cache as Upstream, which
    // maps to the dedicated startup exit code.
    let app_state = AppState::new(config).await?;

    let cors_layer = build_cors(cors_origins.as_deref());

    let app = Router::new()
        .merge(routes::create_api_router())
        .merge(routes::create_ws_router())
        .with_state(app_state.clone())
        .layer(cors_layer);

    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| BridgeError::config(format!("invalid server address '{address}': {e}")))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .map_err(|e| BridgeError::config(format!("cannot bind {socket_addr}: {e}")))?;
    info!("listening on http://{socket_addr}");

    let shutdown_state = app_state.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            shutdown_state.shutdown(SHUTDOWN_GRACE).await;
        })
        .await
        .map_err(|e| BridgeError::internal(format!("server error: {e}")))?;

    info!("server stopped");
    Ok(())
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let headers = [AUTHORIZATION, CONTENT_TYPE];

    match origins {
        Some("*") => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers),
        Some(list) => {
            let origins: Vec<_> = list
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(methods)
                .allow_headers(headers)
        }
        // No CORS configured: same-origin only.
        None => CorsLayer::new().allow_methods(methods).allow_headers(headers),
    }
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
            unreachable!();
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("ctrl-c handler failed: {e}");
            } else {
                info!("interrupt received");
            }
        }
    }
}
