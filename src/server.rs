use crate::review::event::{EventError, EventKind, ReviewEvent};
use crate::review::orchestrator::Orchestrator;
use crate::review::prompts::PromptRegistry;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Shared state behind every route.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub prompts: Arc<PromptRegistry>,
    pub webhook_secret: Option<String>,
    pub started_at: Instant,
}

pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", host, port))?;

    let router = build_router(state);

    info!("webhook service listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/github-webhook", post(github_webhook))
        .route("/update-prompt", post(update_prompt))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// What a webhook delivery asks of us once normalized.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Run(ReviewEvent),
    Ignored(&'static str),
    Unsupported,
}

async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(secret.as_bytes(), &body, signature) {
            warn!("rejecting webhook delivery with missing or invalid signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "invalid signature" })),
            );
        }
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("ping");

    if event_type == "ping" {
        return (StatusCode::OK, Json(json!({ "message": "pong" })));
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid JSON payload: {}", err) })),
            )
        }
    };

    match normalize_event(event_type, &payload) {
        Ok(Dispatch::Run(event)) => {
            info!(
                kind = %event.event_kind,
                repo = %format!("{}/{}", event.repo_owner, event.repo_name),
                pull_number = event.pull_number,
                "webhook accepted, scheduling review"
            );
            let orchestrator = state.orchestrator.clone();
            tokio::spawn(async move {
                if let Err(err) = orchestrator.run(event).await {
                    error!(error = %err, "review run failed");
                }
            });
            (
                StatusCode::ACCEPTED,
                Json(json!({ "message": "review scheduled" })),
            )
        }
        Ok(Dispatch::Ignored(reason)) => {
            info!(event = event_type, reason, "ignoring webhook delivery");
            (StatusCode::OK, Json(json!({ "message": "ignored" })))
        }
        Ok(Dispatch::Unsupported) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unsupported event: {}", event_type) })),
        ),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
struct UpdatePromptRequest {
    prompt_name: Option<String>,
    new_prompt: Option<String>,
}

async fn update_prompt(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdatePromptRequest>,
) -> (StatusCode, Json<Value>) {
    let (Some(name), Some(new_prompt)) = (body.prompt_name, body.new_prompt) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing 'prompt_name' or 'new_prompt' in request body" })),
        );
    };

    let previous = state.prompts.update(&name, &new_prompt);
    info!(prompt = %name, created = previous.is_none(), "prompt template updated");
    (
        StatusCode::OK,
        Json(json!({ "updated": name, "created": previous.is_none() })),
    )
}

async fn healthz(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "prompts": state.prompts.names(),
    }))
}

/// Checks a `X-Hub-Signature-256` header value against the request body.
fn verify_signature(secret: &[u8], body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(claimed) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&claimed).is_ok()
}

/// Maps a raw GitHub payload onto a review trigger.
///
/// Event types we do not consume at all are `Unsupported`; known types whose
/// action does not call for a review are `Ignored`.
pub(crate) fn normalize_event(event_type: &str, payload: &Value) -> Result<Dispatch, EventError> {
    let action = payload["action"].as_str().unwrap_or_default();

    let (kind, comment) = match event_type {
        "pull_request" => match action {
            "opened" | "reopened" | "edited" => (EventKind::Opened, None),
            "synchronize" => (EventKind::Synchronize, None),
            _ => return Ok(Dispatch::Ignored("action does not trigger a review")),
        },
        "pull_request_review_comment" => match action {
            "created" | "edited" => (
                EventKind::ReviewComment,
                non_empty(&payload["comment"]["body"]),
            ),
            _ => return Ok(Dispatch::Ignored("action does not trigger a review")),
        },
        "pull_request_review" => match action {
            "submitted" | "edited" => (EventKind::Review, non_empty(&payload["review"]["body"])),
            _ => return Ok(Dispatch::Ignored("action does not trigger a review")),
        },
        "pull_request_review_thread" => match action {
            "resolved" | "unresolved" => (
                EventKind::ReviewThread,
                non_empty(&payload["thread"]["comments"][0]["body"]),
            ),
            _ => return Ok(Dispatch::Ignored("action does not trigger a review")),
        },
        _ => return Ok(Dispatch::Unsupported),
    };

    let (repo_owner, repo_name) = repo_slug(payload);
    let pull_number = payload["pull_request"]["number"]
        .as_u64()
        .or_else(|| payload["number"].as_u64())
        .unwrap_or(0);
    let head_sha = payload["pull_request"]["head"]["sha"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let event = ReviewEvent {
        event_kind: kind,
        repo_owner,
        repo_name,
        pull_number,
        head_sha,
        triggering_comment: comment,
    };
    event.validate()?;
    Ok(Dispatch::Run(event))
}

fn repo_slug(payload: &Value) -> (String, String) {
    if let Some(full) = payload["repository"]["full_name"].as_str() {
        if let Some((owner, name)) = full.split_once('/') {
            return (owner.to_string(), name.to_string());
        }
    }
    let owner = payload["repository"]["owner"]["login"]
        .as_str()
        .unwrap_or_default();
    let name = payload["repository"]["name"].as_str().unwrap_or_default();
    (owner.to_string(), name.to_string())
}

fn non_empty(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
