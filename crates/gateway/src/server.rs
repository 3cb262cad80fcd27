use std::sync::Arc;

use {
    axum::{
        Json, Router,
        extract::{Path, Query, State},
        http::StatusCode,
        response::{Html, IntoResponse, Response},
        routing::{delete, get},
    },
    serde::{Deserialize, Serialize},
    statusbot_config::StatusbotConfig,
    statusbot_whatsapp::{
        BridgeTransport, Identity, SessionManager, SessionOptions, SessionSnapshot,
    },
    tokio_util::sync::CancellationToken,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use crate::{error::ApiError, pages, state::GatewayState};

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/pair", get(pair_handler))
        .route("/health", get(health_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/sessions/{number}", delete(reset_session_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the session manager and serve HTTP until Ctrl-C.
pub async fn start_gateway(config: StatusbotConfig, bind: &str, port: u16) -> anyhow::Result<()> {
    let transport = Arc::new(BridgeTransport::new(config.whatsapp.bridge_url.clone()));
    let options = SessionOptions::from_config(&config.whatsapp);
    let data_dir = options.data_dir.clone();
    let manager = Arc::new(SessionManager::new(options, transport)?);

    let resumed = if config.whatsapp.resume_on_start {
        manager.resume_registered().await?.len()
    } else {
        0
    };

    let state = GatewayState::new(Arc::clone(&manager));
    let app = build_gateway_app(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind((bind, port)).await?;
    let addr = listener.local_addr()?;

    // Startup banner.
    let lines = [
        format!("statusbot v{}", state.version),
        format!("listening on http://{addr}"),
        format!("bridge: {}", config.whatsapp.bridge_url),
        format!("data: {}", data_dir.display()),
        format!("sessions resumed: {resumed}"),
    ];
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        signal.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    manager.shutdown().await;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NumberQuery {
    number: Option<String>,
}

/// One row of `/api/sessions`.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub number: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    pub epoch: u64,
    pub generation: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionSummary {
    fn new(identity: &Identity, snapshot: SessionSnapshot) -> Self {
        Self {
            number: identity.to_string(),
            state: snapshot.state.to_string(),
            pairing_code: snapshot.pairing_code,
            epoch: snapshot.epoch,
            generation: snapshot.generation,
            attempts: snapshot.attempts,
            last_error: snapshot.last_error,
        }
    }
}

async fn root_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<NumberQuery>,
) -> Response {
    let Some(number) = query.number else {
        return Html(pages::render_overview(&state.manager.sessions())).into_response();
    };
    match Identity::parse(&number) {
        Ok(identity) => {
            let view = state.manager.pairing_view(&identity);
            Html(pages::render_pairing(&identity, &view)).into_response()
        },
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Html(pages::render_error(&e.to_string())),
        )
            .into_response(),
    }
}

async fn pair_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<NumberQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let number = query.number.unwrap_or_default();
    let code = state.manager.pair(&number).await?;
    Ok(Json(serde_json::json!({ "code": code })))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "sessions": state.manager.sessions().len(),
        "uptime_secs": state.uptime_secs(),
    }))
}

async fn list_sessions_handler(State(state): State<Arc<GatewayState>>) -> Json<Vec<SessionSummary>> {
    Json(
        state
            .manager
            .sessions()
            .into_iter()
            .map(|(identity, snapshot)| SessionSummary::new(&identity, snapshot))
            .collect(),
    )
}

async fn reset_session_handler(
    State(state): State<Arc<GatewayState>>,
    Path(number): Path<String>,
) -> Result<StatusCode, ApiError> {
    let identity = Identity::parse(&number)?;
    state.manager.reset(&identity).await?;
    info!(identity = %identity, "session reset over http");
    Ok(StatusCode::NO_CONTENT)
}
