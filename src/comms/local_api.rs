use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::relay::config::{ConfigStore, RelaySettings};
use crate::relay::dispatcher::NotificationDispatcher;
use crate::relay::verification::CallbackChallenge;
use crate::security::audit_log::AuditLogger;
use crate::security::credential_cache::CredentialCache;
use crate::security::token_issuer::HttpTokenIssuer;

type SharedState = Arc<AppState>;

/// Same body for every failed challenge so callers cannot tell which check failed.
const CHALLENGE_REJECTED: &str = "Verify Error";

// Extract client IP from ConnectInfo, proxy headers, or fallback to 127.0.0.1
#[derive(Debug, Clone)]
struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Prefer the socket address from ConnectInfo over client-supplied headers
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(ClientIp(addr.ip().to_string()));
        }

        if let Some(forwarded) = parts.headers.get("x-forwarded-for") {
            if let Ok(s) = forwarded.to_str() {
                let ip = s.split(',').next().unwrap_or(s).trim().to_string();
                if !ip.is_empty() {
                    return Ok(ClientIp(ip));
                }
            }
        }
        if let Some(real_ip) = parts.headers.get("x-real-ip") {
            if let Ok(s) = real_ip.to_str() {
                let ip = s.trim().to_string();
                if !ip.is_empty() {
                    return Ok(ClientIp(ip));
                }
            }
        }

        // Fallback for tests or when info is unavailable
        Ok(ClientIp("127.0.0.1".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: ConfigStore,
    pub dispatcher: NotificationDispatcher,
    pub audit: AuditLogger,
}

impl AppState {
    pub fn new(config: ConfigStore, settings: RelaySettings) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .context("building HTTP client")?;
        let credentials = CredentialCache::new(
            HttpTokenIssuer::new(http_client.clone()),
            settings.refresh_policy,
        );

        Ok(Self {
            config,
            dispatcher: NotificationDispatcher::new(http_client, credentials),
            audit: AuditLogger::new(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ChallengeQuery {
    pub msg_signature: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub echostr: Option<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_json(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

// Health check
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// Callback URL verification (GET)
async fn verify_callback(
    State(state): State<SharedState>,
    ClientIp(client_ip): ClientIp,
    Query(query): Query<ChallengeQuery>,
) -> Response {
    let Some(signature) = query.msg_signature.filter(|s| !s.is_empty()) else {
        state.audit.challenge_malformed(&client_ip, "msg_signature");
        return (StatusCode::BAD_REQUEST, "Invalid Request").into_response();
    };

    let config = state.config.current().await;
    if !config.can_verify() {
        warn!("callback verification attempted before token/key were configured");
        state.audit.decrypt_failed(&client_ip, "not_configured", "missing token or key");
        return (StatusCode::FORBIDDEN, CHALLENGE_REJECTED).into_response();
    }

    let challenge = CallbackChallenge {
        shared_token: config.token.clone(),
        timestamp: query.timestamp.unwrap_or_default(),
        nonce: query.nonce.unwrap_or_default(),
        encrypted_echo: query.echostr.unwrap_or_default(),
        signature,
    };

    match challenge.answer(&config.encoding_aes_key) {
        Ok(plaintext) => {
            state.audit.challenge_verified(&client_ip, &challenge.nonce);
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                plaintext,
            )
                .into_response()
        }
        Err(RelayError::SignatureMismatch) => {
            state.audit.signature_invalid(&client_ip, &challenge.nonce);
            (StatusCode::FORBIDDEN, CHALLENGE_REJECTED).into_response()
        }
        Err(err) => {
            state
                .audit
                .decrypt_failed(&client_ip, err.kind(), &err.to_string());
            (StatusCode::FORBIDDEN, CHALLENGE_REJECTED).into_response()
        }
    }
}

// NAS event (POST); forwarding happens after the response is sent
async fn receive_event(
    State(state): State<SharedState>,
    ClientIp(client_ip): ClientIp,
    body: Bytes,
) -> Response {
    let event = match serde_json::from_slice::<Value>(&body) {
        Ok(event @ Value::Object(_)) => event,
        Ok(_) | Err(_) => {
            state.audit.event_rejected(&client_ip, "body is not a JSON object");
            return error_json(StatusCode::BAD_REQUEST, "JSON error");
        }
    };

    let config = state.config.current().await;
    if !config.is_ready() {
        state.audit.event_rejected(&client_ip, "not configured");
        return error_json(StatusCode::FORBIDDEN, "Not configured");
    }

    debug!(bytes = body.len(), "event accepted for forwarding");
    state.dispatcher.spawn(config, event);
    state.audit.event_accepted(&client_ip);

    Json(json!({"status": "success"})).into_response()
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(verify_callback).post(receive_event))
        .with_state(state)
}

pub async fn serve(config: ConfigStore, port: u16, settings: RelaySettings) -> Result<()> {
    let ready = config.current().await.is_ready();
    let state = Arc::new(AppState::new(config, settings)?);

    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    if ready {
        info!("relay starting on port {}", port);
    } else {
        info!("relay starting on port {} (unconfigured, events will be refused)", port);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).into_future().await?;
    Ok(())
}
