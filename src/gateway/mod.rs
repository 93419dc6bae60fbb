//! HTTP ingress: Slack Events API, interactive actions, generic
//! webhooks and a health probe.
//!
//! Event deliveries are verified against the Slack signing secret
//! (HMAC-SHA256 over `v0:{timestamp}:{body}` with a five minute replay
//! window) and acknowledged immediately; the actual work is spawned so
//! Slack never waits on an agent run.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Form, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus, EventMeta, UserMessageEvent, WebhookEvent};
use crate::rendezvous::PendingQuestions;

/// Replay window for signed Slack requests.
const MAX_SIGNATURE_AGE_SECS: u64 = 300;

pub struct AppState {
    pub bus: Arc<EventBus>,
    pub pending: Arc<PendingQuestions>,
    /// Empty disables signature verification (local development).
    pub signing_secret: String,
    pub webhook_secret: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/slack/events", post(slack_events))
        .route("/slack/actions", post(slack_actions))
        .route("/webhook/:provider", post(webhook))
        .with_state(state)
}

/// Serve until the cancellation token fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// -- Slack Events API -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventsPayload {
    #[serde(rename = "type")]
    payload_type: String,
    challenge: Option<String>,
    event: Option<MessageEvent>,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    #[serde(rename = "type")]
    event_type: String,
    user: Option<String>,
    channel: Option<String>,
    text: Option<String>,
    bot_id: Option<String>,
    subtype: Option<String>,
}

async fn slack_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.signing_secret.is_empty()
        && !verify_slack_signature(&headers, &body, &state.signing_secret)
    {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid signature" })))
            .into_response();
    }

    let payload: EventsPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid JSON" })))
                .into_response();
        }
    };

    if payload.payload_type == "url_verification" {
        if let Some(challenge) = payload.challenge {
            return Json(json!({ "challenge": challenge })).into_response();
        }
    }

    if payload.payload_type == "event_callback" {
        if let Some(event) = payload.event {
            // Bot echoes and edits are not user messages.
            if event.bot_id.is_some() || event.subtype.is_some() {
                return Json(json!({ "status": "ignored" })).into_response();
            }
            if event.event_type == "message" || event.event_type == "app_mention" {
                if let (Some(user), Some(channel), Some(text)) =
                    (event.user, event.channel, event.text)
                {
                    let bus = state.bus.clone();
                    // Acknowledge before the work; Slack retries slow
                    // responses.
                    tokio::spawn(async move {
                        bus.publish(Event::UserMessage(UserMessageEvent::new(
                            user, channel, text,
                        )))
                        .await;
                    });
                }
            }
        }
    }

    Json(json!({ "status": "ok" })).into_response()
}

// -- Slack interactive actions ----------------------------------------------

#[derive(Debug, Deserialize)]
struct ActionsForm {
    payload: String,
}

async fn slack_actions(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ActionsForm>,
) -> Response {
    let payload: Value = match serde_json::from_str(&form.payload) {
        Ok(p) => p,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid payload" })))
                .into_response();
        }
    };

    let mut resolved = 0usize;
    if let Some(actions) = payload["actions"].as_array() {
        for action in actions {
            let Some(action_id) = action["action_id"].as_str() else {
                continue;
            };
            let value = action["value"].as_str().unwrap_or_default();
            if state.pending.resolve(action_id, value) {
                resolved += 1;
            } else {
                // Stale click or a question that already timed out.
                debug!(action_id, "no pending question for action");
            }
        }
    }

    Json(json!({ "status": "ok", "resolved": resolved })).into_response()
}

// -- Generic webhooks -------------------------------------------------------

async fn webhook(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(expected) = &state.webhook_secret {
        if params.get("secret") != Some(expected) {
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid secret" })))
                .into_response();
        }
    }

    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let event_type_name = headers
        .get("x-github-event")
        .or_else(|| headers.get("x-event-type"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| payload["action"].as_str().map(str::to_string))
        .unwrap_or_else(|| "event".to_string());

    info!(provider = %provider, event_type = %event_type_name, "webhook received");

    let event = WebhookEvent {
        meta: EventMeta::new("webhook"),
        provider,
        event_type_name,
        payload,
    };
    let bus = state.bus.clone();
    tokio::spawn(async move {
        bus.publish(Event::Webhook(event)).await;
    });

    Json(json!({ "status": "accepted" })).into_response()
}

// -- Signature verification -------------------------------------------------

/// Verify `x-slack-signature` over `v0:{timestamp}:{body}`.
fn verify_slack_signature(headers: &HeaderMap, body: &[u8], signing_secret: &str) -> bool {
    use hmac::Mac;
    type HmacSha256 = hmac::Hmac<sha2::Sha256>;

    let Some(timestamp) = headers
        .get("x-slack-request-timestamp")
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    match timestamp.parse::<u64>() {
        Ok(ts) => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            if now.abs_diff(ts) > MAX_SIGNATURE_AGE_SECS {
                warn!("slack request outside replay window");
                return false;
            }
        }
        Err(_) => return false,
    }

    let Some(signature) = headers.get("x-slack-signature").and_then(|v| v.to_str().ok()) else {
        return false;
    };

    let basestring = format!("v0:{}:{}", timestamp, String::from_utf8_lossy(body));
    let Ok(mut mac) = HmacSha256::new_from_slice(signing_secret.as_bytes()) else {
        return false;
    };
    mac.update(basestring.as_bytes());
    let expected = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

    constant_time_eq(signature.as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
