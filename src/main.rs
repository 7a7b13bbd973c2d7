//! Shelley — a single-user, multi-conversation coding agent runtime.

mod api;
mod bus;
mod config;
mod db;
mod error;
mod git_status;
mod hot_restart;
mod llm;
mod runtime;
mod slug;
mod state_machine;
mod system_prompt;
mod templates;
mod tools;
mod version;
mod working_dir;

use api::{create_router, AppState};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use clap::{Parser, Subcommand};
use config::{CliOverrides, ServeConfig};
use db::Database;
use llm::{LlmConfig, ModelRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shelley", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the conversation engine and HTTP/SSE server.
    Serve {
        /// Listen on this port. Mutually exclusive with `--systemd-activation`.
        #[arg(long)]
        port: Option<u16>,
        /// Inherit a listening socket via `LISTEN_FDS`/`LISTEN_PID` instead
        /// of binding a port.
        #[arg(long, conflicts_with = "port")]
        systemd_activation: bool,
        /// Path to the SQLite database file.
        #[arg(long)]
        db: Option<PathBuf>,
        /// Default model id for new conversations.
        #[arg(long)]
        model: Option<String>,
        /// Optional TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Require this header to be present on every request.
        #[arg(long)]
        require_header: Option<String>,
    },
    /// Copy a built-in starter template into a directory.
    UnpackTemplate {
        /// Template name (currently only "starter").
        name: String,
        /// Destination directory; created if missing.
        dir: PathBuf,
    },
    /// Print build version information as JSON.
    Version,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shelley=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            let info = version::current();
            match serde_json::to_string(&info) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("failed to serialize version info: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::UnpackTemplate { name, dir } => {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                eprintln!("creating {}: {e}", dir.display());
                return ExitCode::FAILURE;
            }
            match templates::unpack(&name, &dir) {
                Ok(written) => {
                    for path in written {
                        println!("wrote {path}");
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{e}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Serve {
            port,
            systemd_activation,
            db,
            model,
            config: config_path,
            require_header,
        } => {
            init_logging();
            let cli_overrides = CliOverrides {
                db_path: db,
                port,
                systemd_activation,
                model,
                require_header,
            };
            match ServeConfig::resolve(cli_overrides, config_path.as_deref()) {
                Ok(config) => match serve(config).await {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(e) => {
                        tracing::error!(error = %e, "fatal error");
                        ExitCode::FAILURE
                    }
                },
                Err(e) => {
                    eprintln!("invalid configuration: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn serve(config: ServeConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "opening database");
    let db = Database::open(&config.db_path)?;

    let mut llm_config = LlmConfig::from_env();
    if let Some(model) = &config.default_model {
        llm_config.default_model = Some(model.clone());
    }
    let llm_registry = Arc::new(ModelRegistry::new(&llm_config));

    if llm_registry.has_models() {
        tracing::info!(
            models = ?llm_registry.available_models(),
            default = %llm_registry.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!("no LLM API keys configured");
    }

    let state = AppState::new(db, llm_registry).await;
    recover_interrupted_conversations(&state).await;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let mut app = create_router(state).layer(cors).layer(compression);

    if let Some(header_name) = config.require_header.clone() {
        app = app.layer(axum::middleware::from_fn_with_state(
            Arc::new(header_name),
            require_header_middleware,
        ));
    }

    let listener = if config.systemd_activation {
        systemd_listener()?
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = hot_restart::get_listener(addr).await?;
        hot_restart::store_listener_fd(&listener);
        listener
    };

    tracing::info!(addr = ?listener.local_addr()?, "shelley listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(hot_restart::shutdown_signal())
        .await?;

    hot_restart::maybe_perform_hot_restart();
    Ok(())
}

/// Scan for conversations left in `Working` state by a prior crash or
/// restart and start their runtimes now rather than waiting for the next
/// client to touch them; each one's own recovery logic decides whether to
/// re-issue the interrupted LLM call or settle back to idle.
async fn recover_interrupted_conversations(state: &AppState) {
    let stuck = match state.db.list_working_conversations() {
        Ok(conversations) => conversations,
        Err(e) => {
            tracing::warn!(error = %e, "failed to scan for interrupted conversations");
            return;
        }
    };
    for conv in stuck {
        tracing::info!(conv_id = %conv.id, "resuming conversation interrupted by restart");
        if let Err(e) = state.runtime.get_or_create(&conv.id).await {
            tracing::warn!(conv_id = %conv.id, error = %e, "failed to resume interrupted conversation");
        }
    }
}

/// Inherit the first listening socket passed via `LISTEN_FDS`/`LISTEN_PID`.
fn systemd_listener() -> std::io::Result<tokio::net::TcpListener> {
    let mut listenfd = listenfd::ListenFd::from_env();
    match listenfd.take_tcp_listener(0)? {
        Some(std_listener) => {
            std_listener.set_nonblocking(true)?;
            tokio::net::TcpListener::from_std(std_listener)
        }
        None => Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no socket passed via LISTEN_FDS/LISTEN_PID",
        )),
    }
}

async fn require_header_middleware(
    axum::extract::State(required): axum::extract::State<Arc<String>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    if !req.headers().contains_key(required.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(req).await
}
