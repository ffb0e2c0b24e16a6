//! HTTP/SSE surface of the console.

use crate::{
    config::Config,
    control::{self, ControlError},
    daemon_conf::{self, ConfStore, ConfStoreError, ConfigDocument, ConfigPatch, Outcome},
    locales::{self, Language},
    metrics::Metrics,
    tail::{self, TailEvent},
    web_settings::Settings,
};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{sse::{Event, KeepAlive, Sse}, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{convert::Infallible, sync::Arc};
use tokio::{net::TcpListener, sync::RwLock};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

pub struct AppState {
    pub cfg: Config,
    pub store: ConfStore,
    /// Last known-good bind address, re-resolved after every update.
    pub settings: RwLock<Settings>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(cfg: Config, settings: Settings, metrics: Metrics) -> Self {
        let store = ConfStore::new(cfg.daemon_config.clone());
        Self { cfg, store, settings: RwLock::new(settings), metrics }
    }
}

type Shared = Arc<AppState>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    details: Option<String>,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: msg.into(), details: None }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, error: msg.into(), details: None }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.details {
            Some(details) => json!({ "error": self.error, "details": details }),
            None => json!({ "error": self.error }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ConfStoreError> for ApiError {
    fn from(e: ConfStoreError) -> Self {
        match e {
            ConfStoreError::BadPatch(_) => ApiError::bad_request(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::internal(format!("worker task failed: {e}"))
    }
}

pub fn router(state: Shared) -> Router {
    let api = Router::new()
        .route("/config", get(get_config).post(update_config))
        .route("/stats", get(get_stats))
        .route("/languages", get(get_languages))
        .route("/logs", get(stream_logs))
        .route("/reload", post(reload))
        .route("/restart", post(restart))
        .route("/command", post(command));

    let base = format!("/{}", state.cfg.base_path.trim_matches('/'));
    let mut app = if base == "/" {
        Router::new().merge(api)
    } else {
        Router::new().nest(&base, api)
    };
    app = app
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }));

    if state.cfg.has_static_dir() {
        app = app.fallback_service(ServeDir::new(&state.cfg.static_dir));
    }
    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Resolves the bind address from the daemon config and serves until Ctrl-C.
pub async fn serve(cfg: Config, metrics: Metrics) -> Result<()> {
    let mut settings = Settings::load(&cfg.daemon_config, &Settings::default());
    let addr = match settings.socket_addr().await {
        Ok(addr) => addr,
        Err(e) => {
            warn!("{e:#}; using defaults");
            settings = Settings::default();
            settings.socket_addr().await?
        }
    };
    let state = Arc::new(AppState::new(cfg, settings, metrics));

    let listener = TcpListener::bind(addr).await
        .with_context(|| format!("bind {addr}"))?;
    info!("console listening on http://{}/ (api under {})", addr, state.cfg.base_path);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("http server failed")?;
    Ok(())
}

async fn get_config(State(st): State<Shared>) -> Result<Json<ConfigDocument>, ApiError> {
    let store = st.store.clone();
    let out = tokio::task::spawn_blocking(move || store.load()).await??;
    Ok(Json(out.value))
}

async fn update_config(
    State(st): State<Shared>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|_| ApiError::bad_request("Invalid request format"))?;
    let Outcome { value: patch, mut warnings } = ConfigPatch::from_json(&body)?;

    let previous = st.settings.read().await.clone();
    let store = st.store.clone();
    let updated = tokio::task::spawn_blocking(move || {
        let out = store.update(&patch)?;
        let settings = Settings::load(store.path(), &previous);
        Ok::<_, ConfStoreError>((out, settings))
    })
    .await?;

    let (out, settings) = match updated {
        Ok(v) => v,
        Err(e) => {
            st.metrics.config_update_failures.inc();
            return Err(e.into());
        }
    };
    st.metrics.config_updates.inc();
    warnings.extend(out.warnings);

    let mut current = st.settings.write().await;
    if *current != settings {
        info!("bind address changed to {settings}; takes effect after restart");
    }
    *current = settings;

    let warnings: Vec<String> = warnings.iter().map(ToString::to_string).collect();
    Ok(Json(json!({
        "message": "Configuration updated successfully",
        "backup": out.value.display().to_string(),
        "warnings": warnings,
    })))
}

#[derive(Debug, Serialize)]
struct Stats {
    protection_count: usize,
    remaining_time: String,
}

async fn get_stats(State(st): State<Shared>) -> Result<Json<Stats>, ApiError> {
    let log = st.cfg.log_file.clone();
    let store = st.store.clone();
    let stats = tokio::task::spawn_blocking(move || {
        let protection_count = tail::count_lines(&log).map_err(|e| {
            ApiError::internal("Failed to count log lines").with_details(e.to_string())
        })?;
        let remaining_time = store
            .load()
            .ok()
            .and_then(|out| out.value.disable_remaining(daemon_conf::now_local()))
            .map(|r| r.to_string())
            .unwrap_or_default();
        Ok::<_, ApiError>(Stats { protection_count, remaining_time })
    })
    .await??;
    Ok(Json(stats))
}

async fn get_languages(State(st): State<Shared>) -> Result<Json<Vec<Language>>, ApiError> {
    let dir = st.cfg.locale_dir.clone();
    let langs = tokio::task::spawn_blocking(move || locales::list(&dir))
        .await?
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(langs))
}

async fn stream_logs(State(st): State<Shared>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = st.metrics.subscriber_guard();
    let (rx, _task) = tail::spawn(st.cfg.log_file.clone(), st.cfg.poll_interval());
    let stream = ReceiverStream::new(rx).map(move |ev| {
        let _open = &guard;
        Ok::<_, Infallible>(sse_event(ev))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(ev: TailEvent) -> Event {
    // SSE cannot carry bare carriage returns.
    match ev {
        TailEvent::Log(line) => Event::default().event("log").data(line.replace('\r', "")),
        TailEvent::Reset => Event::default().event("reset").data(""),
        TailEvent::Error(msg) => Event::default().event("error").data(msg.replace('\r', "")),
    }
}

async fn reload(State(st): State<Shared>) -> Result<Json<Value>, ApiError> {
    run_command(&st, &st.cfg.reload_command, "Configuration reloaded", "Failed to reload").await
}

async fn restart(State(st): State<Shared>) -> Result<Json<Value>, ApiError> {
    run_command(&st, &st.cfg.restart_command, "Service restarted", "Failed to restart").await
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    #[serde(default)]
    command: String,
}

async fn command(
    State(st): State<Shared>,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::bad_request("Invalid request"))?;
    if req.command.is_empty() {
        return Err(ApiError::bad_request("Command cannot be empty"));
    }
    let argv = control::split_command(&req.command)
        .map_err(|_| ApiError::bad_request("Invalid command"))?;
    run_command(&st, &argv, "Command executed", "Command failed").await
}

async fn run_command(st: &AppState, argv: &[String], ok: &str, failed: &str) -> Result<Json<Value>, ApiError> {
    st.metrics.commands.inc();
    match control::run(argv).await {
        Ok(output) => Ok(Json(json!({ "message": ok, "output": output }))),
        Err(e) => {
            st.metrics.command_failures.inc();
            warn!("{failed}: {e}");
            let details = match &e {
                ControlError::EmptyCommand => e.to_string(),
                _ => e.output(),
            };
            Err(ApiError::internal(failed).with_details(details))
        }
    }
}

async fn metrics_handler(State(st): State<Shared>) -> String {
    st.metrics.render()
}
