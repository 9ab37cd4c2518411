#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # vibetunnel
//!
//! Terminal-multiplexing service: spawns interactive commands under PTYs,
//! persists their output as replayable recordings, and exposes each session
//! to remote clients over HTTP, SSE, and a binary WebSocket. In HQ mode one
//! node aggregates the sessions of many registered remotes behind a single
//! API surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use vibetunnel::auth::AuthPolicy;
use vibetunnel::config::{Config, HqConfig};
use vibetunnel::control::{ControlDir, ControlDirWatcher};
use vibetunnel::hq::{self, HqState};
use vibetunnel::routes;
use vibetunnel::sessions::{SessionDefaults, SessionManager};
use vibetunnel::state::AppState;
use vibetunnel::ws;

/// Terminal multiplexer with an HTTP/WebSocket API.
#[derive(Parser)]
#[command(name = "vibetunnel", version)]
struct Cli {
    /// Path to a TOML config file (default: ./vibetunnel.toml if present).
    #[arg(long)]
    config: Option<String>,
    /// Port to listen on.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
    /// Address to bind.
    #[arg(long)]
    bind: Option<String>,
    /// Control directory root.
    #[arg(long, env = "VIBETUNNEL_CONTROL_DIR")]
    control_dir: Option<String>,
    /// Disable authentication entirely.
    #[arg(long)]
    no_auth: bool,
    /// Advertise SSH-key authentication to clients.
    #[arg(long)]
    enable_ssh_keys: bool,
    /// Refuse password credentials (implies --enable-ssh-keys).
    #[arg(long)]
    disallow_user_password: bool,
    /// Accept unauthenticated connections from localhost.
    #[arg(long)]
    allow_local_bypass: bool,
    /// Bearer token accepted for authentication.
    #[arg(long)]
    local_auth_token: Option<String>,
    /// Run as HQ (aggregate registered remotes).
    #[arg(long)]
    hq: bool,
    /// Register with this HQ on startup.
    #[arg(long)]
    hq_url: Option<String>,
    /// Username for HQ registration.
    #[arg(long)]
    hq_username: Option<String>,
    /// Password for HQ registration.
    #[arg(long)]
    hq_password: Option<String>,
    /// Name to register under (must be unique across the HQ).
    #[arg(long)]
    name: Option<String>,
    /// Permit http:// (not https://) HQ URLs.
    #[arg(long)]
    allow_insecure_hq: bool,
    /// Verbose logging.
    #[arg(long)]
    debug: bool,
}

fn apply_cli(config: &mut Config, cli: &Cli) {
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref bind) = cli.bind {
        config.server.bind = bind.clone();
    }
    if let Some(ref dir) = cli.control_dir {
        config.server.control_dir = dir.clone();
    }
    if cli.no_auth {
        config.auth.enabled = false;
    }
    if cli.enable_ssh_keys || cli.disallow_user_password {
        config.auth.enable_ssh_keys = true;
    }
    if cli.disallow_user_password {
        config.auth.disallow_user_password = true;
    }
    if cli.allow_local_bypass {
        config.auth.allow_local_bypass = true;
    }
    if let Some(ref token) = cli.local_auth_token {
        config.auth.local_token = Some(token.clone());
    }

    if cli.hq || cli.hq_url.is_some() {
        let hq = config.hq.get_or_insert_with(HqConfig::default);
        if cli.hq {
            hq.enabled = true;
        }
        if let Some(ref url) = cli.hq_url {
            hq.url = Some(url.clone());
        }
        if let Some(ref username) = cli.hq_username {
            hq.username = Some(username.clone());
        }
        if let Some(ref password) = cli.hq_password {
            hq.password = Some(password.clone());
        }
        if let Some(ref name) = cli.name {
            hq.name = Some(name.clone());
        }
        if cli.allow_insecure_hq {
            hq.allow_insecure = true;
        }
    }
}

/// Best-effort URL remotes advertise to their HQ.
fn default_advertise_url(config: &Config) -> String {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("http://{hostname}:{}", config.server.port)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vibetunnel: {e}");
            std::process::exit(1);
        }
    };
    apply_cli(&mut config, &cli);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.debug {
            "debug".to_string()
        } else {
            config.logging.level.clone()
        }
    });
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("vibetunnel v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Control directory: {}", config.control_dir());
    info!("Listening on {}", config.listen_addr());
    if !config.auth.enabled {
        warn!("Authentication is DISABLED — every endpoint is open");
    }

    let control = match ControlDir::open(config.control_dir()) {
        Ok(control) => control,
        Err(e) => {
            error!("Control directory unusable: {e}");
            std::process::exit(1);
        }
    };

    let (session_events, _) = broadcast::channel(256);
    let session_manager = SessionManager::new(
        control.clone(),
        SessionDefaults {
            term: config.server.term.clone(),
            cols: config.server.default_cols,
            rows: config.server.default_rows,
            allow_column_resize: config.server.allow_column_resize,
            kill_grace_secs: config.server.kill_grace_secs,
        },
        session_events.clone(),
    );

    // Pick up sessions left on disk by a previous run or external writers.
    session_manager.adopt_existing().await;

    // Control-dir watcher → one-way channel → manager reconciliation.
    let (watch_tx, mut watch_rx) = tokio::sync::mpsc::unbounded_channel();
    let _watcher = match ControlDirWatcher::spawn(control.root(), watch_tx) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Control-dir watcher unavailable: {e}");
            None
        }
    };
    let reconcile_manager = session_manager.clone();
    let reconcile_task = tokio::spawn(async move {
        while let Some(event) = watch_rx.recv().await {
            reconcile_manager.handle_watch_event(event).await;
        }
    });

    let auth = AuthPolicy::from_config(&config.auth);
    let is_hq = config.hq.as_ref().is_some_and(|h| h.enabled);
    let hq_state = is_hq.then(HqState::new);

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        session_manager: session_manager.clone(),
        session_events: session_events.clone(),
        auth: auth.clone(),
        hq: hq_state.clone(),
    };

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/info", get(routes::info::info))
        .route("/api/events", get(routes::events::event_stream))
        .route(
            "/api/sessions",
            get(routes::sessions::list_sessions).post(routes::sessions::create_session),
        )
        .route(
            "/api/sessions/activity",
            get(routes::sessions::all_activity),
        )
        .route(
            "/api/sessions/{id}",
            get(routes::sessions::get_session)
                .delete(routes::sessions::kill_session)
                .patch(routes::sessions::patch_session),
        )
        .route(
            "/api/sessions/{id}/input",
            post(routes::sessions::send_input),
        )
        .route(
            "/api/sessions/{id}/resize",
            post(routes::sessions::resize_session),
        )
        .route(
            "/api/sessions/{id}/text",
            get(routes::sessions::session_text),
        )
        .route(
            "/api/sessions/{id}/buffer",
            get(routes::sessions::session_buffer),
        )
        .route(
            "/api/sessions/{id}/activity",
            get(routes::sessions::session_activity),
        )
        .route(
            "/api/sessions/{id}/stream",
            get(routes::stream::session_stream),
        )
        .route("/api/cleanup-exited", post(routes::sessions::cleanup_exited))
        .layer(middleware::from_fn(vibetunnel::auth::require_auth));

    // Registration uses Basic credentials, so these check auth themselves.
    let remote_routes = Router::new()
        .route(
            "/api/remotes",
            get(routes::remotes::list_remotes).post(routes::remotes::register_remote),
        )
        .route(
            "/api/remotes/{id}",
            delete(routes::remotes::unregister_remote),
        );

    let ws_route = Router::new().route("/buffers", get(ws::buffers_upgrade));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(remote_routes)
        .merge(ws_route)
        .layer(Extension(auth.clone()))
        .with_state(state.clone());

    // GUARD: .layer() only applies to routes merged BEFORE the call.
    let app = app.layer(cors).layer(TraceLayer::new_for_http()).layer(
        tower::limit::ConcurrencyLimitLayer::new(state.config.server.max_connections),
    );

    let listener = match TcpListener::bind(state.config.listen_addr()).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            error!("Port {} is already in use", state.config.server.port);
            std::process::exit(9);
        }
        Err(e) => {
            error!("Failed to bind {}: {e}", state.config.listen_addr());
            std::process::exit(1);
        }
    };

    info!("Server ready");

    // HQ: probe remote health, degrade and evict the unresponsive.
    let health_task = hq_state
        .as_ref()
        .map(|hq| hq.spawn_health_checker(session_events.clone()));

    // Remote: register with the HQ and keep the registration fresh.
    let registration_task = state.config.hq.as_ref().and_then(|hq_config| {
        hq_config.url.as_ref()?;
        let advertise = hq_config
            .advertise_url
            .clone()
            .unwrap_or_else(|| default_advertise_url(&state.config));
        info!(
            "Registering with HQ {} as '{}' ({advertise})",
            hq_config.url.as_deref().unwrap_or_default(),
            hq_config.name.as_deref().unwrap_or_default()
        );
        Some(hq::client::spawn(hq_config.clone(), advertise, auth))
    });

    // Periodic sweep: notice silently-died adopted sessions.
    let sweep_manager = session_manager.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            sweep_manager.sweep().await;
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    };

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!("Server error: {e}");
        std::process::exit(1);
    }

    info!("Shutting down...");
    sweep_task.abort();
    reconcile_task.abort();
    if let Some(task) = health_task {
        task.abort();
    }
    if let Some(task) = registration_task {
        task.abort();
    }
    session_manager.kill_all().await;
    info!("Goodbye");
}
