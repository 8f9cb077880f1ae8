//! taskroom server
//!
//! Real-time project collaboration: clients join project rooms over
//! WebSocket, exchange chat messages, and broadcast task status changes.

mod access;
mod auth;
mod clock;
mod cmd_seed;
mod cmd_token;
mod dispatch;
mod error;
mod logging;
mod migration_runner;
mod paths;
mod persistence;
mod rooms;
mod session;
mod state;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::{Args, Parser, Subcommand};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::IdentityPolicy;
use crate::persistence::Store;
use crate::state::AppState;
use crate::websocket::ws_handler;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "taskroom", version, about = "Real-time project collaboration server")]
struct Cli {
    /// Data directory (database and logs)
    #[arg(long, global = true, env = "TASKROOM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Secret for signed handshake tokens. Without it, the handshake userId is trusted.
    #[arg(long, global = true, env = "TASKROOM_AUTH_SECRET", hide_env_values = true)]
    auth_secret: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    start: StartArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default)
    Start(StartArgs),
    /// Replace the database contents with demo users, projects and tasks
    Seed,
    /// Print a signed handshake token for a user
    Token {
        #[arg(long)]
        user_id: String,
    },
}

#[derive(Args, Clone)]
struct StartArgs {
    /// Address to listen on
    #[arg(long, env = "TASKROOM_BIND", default_value = "127.0.0.1:5000")]
    bind: SocketAddr,

    /// Allowed CORS origins, comma separated. Any origin when unset.
    #[arg(long = "cors-origin", env = "TASKROOM_CORS_ORIGINS", value_delimiter = ',')]
    cors_origins: Vec<String>,

    /// Close connections silent for this many seconds (0 disables)
    #[arg(long, env = "TASKROOM_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    idle_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    paths::init_data_dir(cli.data_dir.as_deref())?;

    match cli.command {
        Some(Command::Seed) => cmd_seed::run().await,
        Some(Command::Token { user_id }) => cmd_token::run(cli.auth_secret.as_deref(), &user_id),
        Some(Command::Start(args)) => serve(args, cli.auth_secret).await,
        None => serve(cli.start, cli.auth_secret).await,
    }
}

async fn serve(args: StartArgs, auth_secret: Option<String>) -> anyhow::Result<()> {
    paths::ensure_dirs()?;
    let logging = logging::init_logging()?;

    let store = Store::open(&paths::db_path())?;
    let identity = match auth_secret.as_deref().filter(|s| !s.is_empty()) {
        Some(secret) => IdentityPolicy::signed(secret),
        None => {
            warn!(
                component = "server",
                event = "server.auth.trust_claim",
                "No auth secret configured, trusting the handshake userId"
            );
            IdentityPolicy::TrustClaim
        }
    };
    let idle_timeout = (args.idle_timeout_secs > 0).then(|| Duration::from_secs(args.idle_timeout_secs));

    info!(
        component = "server",
        event = "server.starting",
        version = VERSION,
        run_id = %logging.run_id,
        bind = %args.bind,
        data_dir = %paths::data_dir().display(),
        identity_policy = identity.name(),
        idle_timeout_secs = args.idle_timeout_secs,
        "Starting taskroom server"
    );

    let state = Arc::new(AppState::new(store, identity, idle_timeout));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&args.cors_origins)?)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %args.bind,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(
        component = "server",
        event = "server.stopped",
        "Server stopped"
    );
    drop(logging);
    Ok(())
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .map(HeaderValue::from_str)
        .collect::<Result<_, _>>()?;

    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };
    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let timestamp = clock::now_rfc3339();
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "db": "connected",
                "timestamp": timestamp,
                "uptime": state.started_at.elapsed().as_secs_f64(),
                "connections": state.registry.connection_count(),
                "rooms": state.registry.room_count(),
            })),
        ),
        Err(e) => {
            warn!(
                component = "server",
                event = "server.health.db_unreachable",
                error = %e,
                "Health check failed"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "error",
                    "db": "disconnected",
                    "timestamp": timestamp,
                })),
            )
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(
                    component = "server",
                    event = "server.signal.unavailable",
                    error = %e,
                    "Could not install SIGTERM handler"
                );
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(
        component = "server",
        event = "server.shutdown_signal",
        "Shutdown signal received, draining connections"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_starts_with_defaults() {
        let cli = Cli::try_parse_from(["taskroom"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.start.bind, "127.0.0.1:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(cli.start.idle_timeout_secs, 120);
        assert!(cli.start.cors_origins.is_empty());
    }

    #[test]
    fn token_subcommand_takes_user_id() {
        let cli = Cli::try_parse_from([
            "taskroom",
            "--auth-secret",
            "s3cret",
            "token",
            "--user-id",
            "user-alice",
        ])
        .unwrap();
        assert_eq!(cli.auth_secret.as_deref(), Some("s3cret"));
        match cli.command {
            Some(Command::Token { user_id }) => assert_eq!(user_id, "user-alice"),
            _ => panic!("expected token subcommand"),
        }
    }

    #[test]
    fn cors_origins_split_on_commas() {
        let cli = Cli::try_parse_from([
            "taskroom",
            "start",
            "--cors-origin",
            "http://localhost:3000,https://app.example.com",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Start(args)) => {
                assert_eq!(args.cors_origins.len(), 2);
                assert!(cors_layer(&args.cors_origins).is_ok());
            }
            _ => panic!("expected start subcommand"),
        }
        assert!(cors_layer(&["bad\norigin".to_string()]).is_err());
    }

    #[test]
    fn global_flags_come_before_any_subcommand() {
        let cli = Cli::try_parse_from(["taskroom", "--data-dir", "/tmp/taskroom-data", "seed"])
            .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/taskroom-data")));
        assert!(matches!(cli.command, Some(Command::Seed)));

        let cli = Cli::try_parse_from([
            "taskroom",
            "--auth-secret",
            "s3cret",
            "start",
            "--bind",
            "0.0.0.0:6000",
        ])
        .unwrap();
        assert_eq!(cli.auth_secret.as_deref(), Some("s3cret"));
        match cli.command {
            Some(Command::Start(args)) => {
                assert_eq!(args.bind, "0.0.0.0:6000".parse::<SocketAddr>().unwrap())
            }
            _ => panic!("expected start subcommand"),
        }

        let cli = Cli::try_parse_from(["taskroom", "seed", "--data-dir", "/srv/taskroom"]).unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/srv/taskroom")));
    }

    #[tokio::test]
    async fn health_reports_db_and_uptime() {
        let store = Store::open_in_memory().unwrap();
        let state = Arc::new(AppState::new(store, IdentityPolicy::TrustClaim, None));

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["db"], "connected");
        assert!(health["uptime"].as_f64().is_some_and(|secs| secs >= 0.0));
        assert_eq!(health["connections"], 0);
    }
}
