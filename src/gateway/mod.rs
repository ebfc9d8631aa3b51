// Webhook gateway — HTTP surface for pairing, health, and message dispatch.
//
// Endpoints:
//   GET  /health   — liveness snapshot (public)
//   GET  /ready    — readiness gate for load balancers (public)
//   POST /pair     — exchange one-time code for bearer token (X-Pairing-Code)
//   POST /webhook  — authorized message dispatch (JSON or multipart)

pub mod auth;
pub mod responses;

use crate::agent::{AgentProcessor, AgentRequest};
use crate::config::Config;
use crate::gateway::auth::AuthResolver;
use crate::gateway::responses::{PairResponse, StatusResponse, WebhookResponse};
use crate::health::HealthRegistry;
use crate::identity::AuthMethod;
use crate::security::jwt::JwtValidator;
use crate::security::pairing::{hash_token, PairError, PairingGuard};
use crate::state::StateManager;
use crate::util::truncate_with_ellipsis;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Body cap for JSON endpoints.
pub const MAX_BODY_SIZE: usize = 65_536;
/// Body cap for multipart uploads.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
/// Whole-request deadline, longer than the agent deadline so agent timeouts
/// surface as structured errors rather than connection cuts.
pub const REQUEST_TIMEOUT_SECS: u64 = 150;
/// How long one agent invocation may run.
pub const AGENT_TIMEOUT_SECS: u64 = 120;
/// How long shutdown waits for in-flight requests before aborting them.
pub const SHUTDOWN_DRAIN_SECS: u64 = 15;

/// Fixed conversational coordinates for webhook traffic.
const WEBHOOK_CHANNEL: &str = "api";
const WEBHOOK_CHAT_ID: &str = "mobile-client";

/// Stand-in message when a request carries files but no text.
const FILE_ONLY_PLACEHOLDER: &str = "Process the attached receipt";

/// Shared state for all gateway routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Mutex<Config>>,
    pub agent: Arc<dyn AgentProcessor>,
    pub model: String,
    pub pairing: Arc<PairingGuard>,
    pub auth: Arc<AuthResolver>,
    pub state: Arc<StateManager>,
    pub health: Arc<HealthRegistry>,
}

/// Wire up shared state from a loaded config and an agent implementation.
pub fn build_state(config: Config, agent: Arc<dyn AgentProcessor>) -> Result<AppState> {
    config.validate()?;

    let pairing = Arc::new(PairingGuard::new(
        config.gateway.require_pairing,
        &config.gateway.paired_tokens,
    ));
    let jwt = config
        .gateway
        .jwt_secret
        .as_deref()
        .map(|secret| Arc::new(JwtValidator::new(secret)));
    let auth = Arc::new(AuthResolver::new(pairing.clone(), jwt));
    let state = Arc::new(StateManager::new(&config.workspace_dir));
    let model = config.agent.model.clone();

    Ok(AppState {
        config: Arc::new(Mutex::new(config)),
        agent,
        model,
        pairing,
        auth,
        state,
        health: Arc::new(HealthRegistry::new()),
    })
}

/// Build the gateway router with per-route body limits and a global timeout.
pub fn build_router(state: AppState) -> Router {
    // Webhook accepts multipart uploads and needs a larger body limit. The
    // DefaultBodyLimit override is required on top of the layer: the
    // Multipart extractor enforces axum's built-in 2 MB cap independently of
    // tower-http's stream limit.
    let webhook_router = Router::new()
        .route("/webhook", post(handle_webhook))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES));

    Router::new()
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/pair", post(handle_pair))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .merge(webhook_router)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
        .with_state(state)
}

/// Run the gateway until Ctrl+C.
pub async fn run_gateway(
    host: &str,
    port: u16,
    config: Config,
    agent: Arc<dyn AgentProcessor>,
) -> Result<()> {
    let state = build_state(config, agent)?;

    let workspace = state.config.lock().workspace_dir.clone();
    state.health.register_check("workspace", || {
        match std::fs::create_dir_all(&workspace) {
            Ok(()) => (true, String::new()),
            Err(e) => (false, format!("workspace unavailable: {e}")),
        }
    });

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {addr}"))?;
    let local_addr = listener.local_addr().context("Failed to read bound address")?;

    println!("🦀 PicoClaw Gateway listening on http://{local_addr}");
    println!("  POST /pair      — pair a new client (X-Pairing-Code header)");
    println!("  POST /webhook   — {{\"message\": \"your prompt\"}}");
    println!("  GET  /health    — health check");
    println!("  GET  /ready     — readiness check");
    if let Some(code) = state.pairing.current_code() {
        println!();
        println!("  🔐 One-time pairing code:");
        println!("     ┌──────────────┐");
        println!("     │    {code}    │");
        println!("     └──────────────┘");
        println!("     Send: POST /pair with header X-Pairing-Code: {code}");
    }
    if state.pairing.require_pairing() {
        println!("  🔒 Pairing: ACTIVE (bearer token required)");
    } else {
        println!("  ⚠️  Pairing: OPTIONAL (open until first client pairs)");
    }
    println!("  Press Ctrl+C to stop.\n");

    state.health.set_ready(true);

    let health = state.health.clone();
    let app = build_router(state);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let mut server_task = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server_task => {
            return result
                .context("Gateway server task panicked")?
                .context("Gateway server error");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
        }
    }

    // Flip readiness first so load balancers stop routing new traffic while
    // in-flight requests drain.
    health.set_ready(false);
    tracing::info!("Shutdown signal received — draining in-flight requests");
    let _ = shutdown_tx.send(());

    tokio::select! {
        result = &mut server_task => {
            result.context("Gateway server task panicked")?
                .context("Gateway server error")?;
        }
        () = tokio::time::sleep(Duration::from_secs(SHUTDOWN_DRAIN_SECS)) => {
            tracing::warn!("Drain deadline reached — aborting remaining connections");
            server_task.abort();
        }
    }

    tracing::info!("Gateway stopped");
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════

/// GET /health — always public (no secrets leaked).
///
/// `paired` reflects this caller's standing: true when the request would be
/// authorized (including the bootstrap window) or any credential exists.
async fn handle_health(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let authorized = state.auth.authorize(&headers).is_ok();
    let body = StatusResponse {
        status: "ok".into(),
        uptime: Some(format!("{}s", state.health.uptime().as_secs())),
        paired: Some(authorized || state.pairing.is_paired()),
        checks: Some(state.health.checks_snapshot()),
    };
    Json(body)
}

/// GET /ready — 503 until the gateway is serving and all checks pass.
async fn handle_ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.health.is_ready() && state.health.all_passing();
    let body = StatusResponse {
        status: if ready { "ok" } else { "unavailable" }.into(),
        uptime: None,
        paired: None,
        checks: Some(state.health.checks_snapshot()),
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// POST /pair — exchange the one-time code for a bearer token.
async fn handle_pair(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let code = headers
        .get("X-Pairing-Code")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if code.is_empty() {
        let body = PairResponse {
            paired: false,
            token: None,
            message: None,
            error: Some("Missing X-Pairing-Code header".into()),
        };
        return (StatusCode::BAD_REQUEST, Json(body));
    }

    match state.pairing.try_pair(code) {
        Ok(token) => {
            tracing::info!("🔐 New client paired successfully");
            if let Err(err) = persist_token(state.config.clone(), &hash_token(&token)).await {
                tracing::error!("🔐 Pairing succeeded but token persistence failed: {err:#}");
                let body = PairResponse {
                    paired: true,
                    token: Some(token),
                    message: Some(
                        "Paired for this process, but failed to persist token to config.toml. \
                         Check config path and write permissions."
                            .into(),
                    ),
                    error: None,
                };
                return (StatusCode::OK, Json(body));
            }
            let body = PairResponse {
                paired: true,
                token: Some(token),
                message: Some("Save this token — use it as Authorization: Bearer <token>".into()),
                error: None,
            };
            (StatusCode::OK, Json(body))
        }
        Err(PairError::CodeUsed) => {
            // Each attempt against a dead code mints a replacement, so the
            // operator console always has a live code to hand out.
            if let Some(fresh) = state.pairing.reset_if_used() {
                tracing::warn!("🔐 Pairing attempt with consumed code — rotated");
                println!("  🔐 New one-time pairing code: {fresh}");
            }
            let body = PairResponse {
                paired: false,
                token: None,
                message: None,
                error: Some("Pairing code already used — a new code was issued to the operator console".into()),
            };
            (StatusCode::GONE, Json(body))
        }
        Err(PairError::CodeMismatch) => {
            tracing::warn!("🔐 Pairing attempt with invalid code");
            let body = PairResponse {
                paired: false,
                token: None,
                message: None,
                error: Some("Invalid pairing code".into()),
            };
            (StatusCode::FORBIDDEN, Json(body))
        }
    }
}

/// Persist a freshly issued credential hash to config.toml.
///
/// Clones under the lock, saves outside it, writes back on success. The
/// in-memory credential set already holds the hash either way, so a failed
/// save only costs durability across a restart.
async fn persist_token(config: Arc<Mutex<Config>>, hash: &str) -> Result<()> {
    let mut updated = { config.lock().clone() };
    if !updated.persist_token_hash(hash) {
        return Ok(());
    }
    updated
        .save()
        .await
        .context("Failed to persist paired token to config.toml")?;
    *config.lock() = updated;
    Ok(())
}

#[derive(serde::Deserialize)]
struct WebhookBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    business_id: Option<String>,
}

fn error_json(status: StatusCode, error: &str) -> Response {
    let body = WebhookResponse {
        response: None,
        model: None,
        error: Some(error.to_string()),
    };
    (status, Json(body)).into_response()
}

/// POST /webhook — authorize, parse (JSON or multipart), dispatch to agent.
async fn handle_webhook(State(state): State<AppState>, request: Request) -> Response {
    let headers = request.headers().clone();

    let mut identity = match state.auth.authorize(&headers) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!("Webhook rejected: {e}");
            return error_json(StatusCode::UNAUTHORIZED, &e.to_string());
        }
    };

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let parsed = if content_type.starts_with("multipart/form-data") {
        parse_multipart(&state, request).await
    } else {
        parse_json(request).await
    };
    let (mut message, business_id, media_paths) = match parsed {
        Ok(parts) => parts,
        Err(response) => return response,
    };

    if message.trim().is_empty() {
        if media_paths.is_empty() {
            return error_json(StatusCode::BAD_REQUEST, "Message must not be empty");
        }
        message = FILE_ONLY_PLACEHOLDER.to_string();
    }

    // Durable breadcrumbs for the heartbeat collaborator. Failure to persist
    // never fails the request.
    if let Err(e) = state.state.set_last_channel(WEBHOOK_CHANNEL) {
        tracing::warn!("Failed to persist last channel: {e}");
    }
    if let Err(e) = state.state.set_last_chat_id(WEBHOOK_CHAT_ID) {
        tracing::warn!("Failed to persist last chat id: {e}");
    }
    if identity.method == AuthMethod::Jwt {
        if let (Some(business_id), Some(jwt)) = (&business_id, &identity.jwt_token) {
            if let Err(e) =
                state
                    .state
                    .set_business_auth(business_id, jwt, WEBHOOK_CHANNEL, WEBHOOK_CHAT_ID)
            {
                tracing::warn!("Failed to persist business auth: {e}");
            }
        }
    }
    identity.business_id = business_id;

    tracing::info!(
        session = %identity.session_key,
        files = media_paths.len(),
        "Webhook message: {}",
        truncate_with_ellipsis(&message, 50)
    );

    let agent_request = AgentRequest {
        message,
        session_key: identity.session_key.clone(),
        channel: WEBHOOK_CHANNEL.into(),
        chat_id: WEBHOOK_CHAT_ID.into(),
        media_paths,
        identity,
    };

    let deadline = Duration::from_secs(AGENT_TIMEOUT_SECS);
    match tokio::time::timeout(deadline, state.agent.process(agent_request)).await {
        Ok(Ok(response)) => {
            let body = WebhookResponse {
                response: Some(response),
                model: Some(state.model.clone()),
                error: None,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("Webhook agent error: {e:#}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Agent processing failed")
        }
        Err(_) => {
            tracing::error!("Webhook agent timed out after {AGENT_TIMEOUT_SECS}s");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Agent processing timed out")
        }
    }
}

type ParsedBody = (String, Option<String>, Vec<PathBuf>);

async fn parse_json(request: Request) -> Result<ParsedBody, Response> {
    let bytes = axum::body::to_bytes(request.into_body(), MAX_UPLOAD_BYTES)
        .await
        .map_err(|e| {
            tracing::warn!("Webhook body read error: {e}");
            error_json(StatusCode::BAD_REQUEST, "Failed to read request body")
        })?;

    let body: WebhookBody = serde_json::from_slice(&bytes).map_err(|e| {
        tracing::warn!("Webhook JSON parse error: {e}");
        error_json(
            StatusCode::BAD_REQUEST,
            "Invalid JSON body. Expected: {\"message\": \"...\"}",
        )
    })?;
    Ok((body.message, body.business_id, Vec::new()))
}

/// Pull text fields and file parts out of a multipart body.
///
/// Any mid-stream read error rejects the whole request: proceeding with a
/// truncated part list would silently drop uploads (or the message itself)
/// and dispatch something the caller never sent.
async fn parse_multipart(state: &AppState, request: Request) -> Result<ParsedBody, Response> {
    let mut multipart = Multipart::from_request(request, state).await.map_err(|e| {
        tracing::warn!("Webhook multipart error: {e}");
        error_json(StatusCode::BAD_REQUEST, "Invalid multipart body")
    })?;

    let workspace = state.config.lock().workspace_dir.clone();
    let mut message = String::new();
    let mut business_id = None;
    let mut media_paths = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Webhook multipart stream error: {e}");
                return Err(error_json(
                    StatusCode::BAD_REQUEST,
                    "Malformed or truncated multipart body",
                ));
            }
        };

        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "message" => {
                message = field.text().await.map_err(|e| {
                    tracing::warn!("Webhook multipart message field error: {e}");
                    error_json(StatusCode::BAD_REQUEST, "Unreadable message field")
                })?;
            }
            "business_id" => {
                let text = field.text().await.map_err(|e| {
                    tracing::warn!("Webhook multipart business_id field error: {e}");
                    error_json(StatusCode::BAD_REQUEST, "Unreadable business_id field")
                })?;
                if !text.trim().is_empty() {
                    business_id = Some(text);
                }
            }
            _ => {
                let file_name = field.file_name().unwrap_or(&name).to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    tracing::warn!("Webhook multipart upload {file_name} error: {e}");
                    error_json(StatusCode::BAD_REQUEST, "Unreadable file upload")
                })?;
                if let Some(path) = crate::util::save_uploaded_file(&workspace, &file_name, &bytes)
                {
                    media_paths.push(path);
                }
            }
        }
    }

    Ok((message, business_id, media_paths))
}
