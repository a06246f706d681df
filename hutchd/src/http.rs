//! HTTP surface: health probes, queue introspection and inbound delivery
//! from channel adapters.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use hutch_core::HutchConfig;
use hutch_store::{StateStore, now_timestamp};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::inbox::{ChatMessage, InboundItem, Inbox, trigger_regex};
use crate::queue::{GroupQueue, QueueSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub started_at: Instant,
    pub config: Arc<HutchConfig>,
    pub store: StateStore,
    pub queue: GroupQueue,
    pub inbox: Inbox,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/queue", get(queue_snapshot))
        .route("/v1/inbound", post(inbound))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    bind: String,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    registered_groups: usize,
    active_containers: usize,
    max_concurrent_containers: usize,
}

/// A message delivered by a channel adapter.
#[derive(Debug, Deserialize)]
pub struct InboundRequest {
    pub jid: String,
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Display name of the chat, kept for group registration.
    #[serde(default)]
    pub chat_name: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct InboundResponse {
    pub accepted: bool,
    pub triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "hutchd",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        bind: state.config.server.bind.clone(),
    })
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let max = state.config.orchestrator.max_concurrent_containers;
    let active = state.queue.active_count().await;
    match state.store.list_groups() {
        Ok(groups) => (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                registered_groups: groups.len(),
                active_containers: active,
                max_concurrent_containers: max,
            }),
        ),
        Err(e) => {
            error!(error = %e, "state store not readable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyResponse {
                    status: "store_unavailable",
                    registered_groups: 0,
                    active_containers: active,
                    max_concurrent_containers: max,
                }),
            )
        }
    }
}

async fn queue_snapshot(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(state.queue.snapshot().await)
}

async fn inbound(
    State(state): State<AppState>,
    Json(request): Json<InboundRequest>,
) -> Result<Json<InboundResponse>, (StatusCode, String)> {
    let timestamp = request.timestamp.clone().unwrap_or_else(now_timestamp);
    let internal = |e: hutch_store::StoreError| {
        error!(error = %e, "failed to record inbound message");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    };

    state
        .store
        .store_chat_metadata(
            &request.jid,
            &timestamp,
            request.chat_name.as_deref(),
            request.channel.as_deref(),
        )
        .map_err(internal)?;

    let group = state.store.get_group(&request.jid).map_err(internal)?;
    let Some(group) = group.filter(|g| !g.disbanded) else {
        debug!(group_jid = %request.jid, "message for unregistered chat, metadata only");
        return Ok(Json(InboundResponse {
            accepted: false,
            triggered: false,
            reason: Some("unregistered"),
        }));
    };

    let is_main =
        group.is_main || group.folder == state.config.orchestrator.main_group_folder;
    let triggered = is_main
        || !group.requires_trigger
        || trigger_regex(&group.trigger, &state.config.orchestrator.assistant_name)
            .is_some_and(|re| re.is_match(&request.content));

    state.inbox.push(
        &request.jid,
        InboundItem::Chat(ChatMessage {
            sender_name: request.sender_name.unwrap_or_else(|| request.sender.clone()),
            sender: request.sender,
            content: request.content,
            timestamp,
            triggered,
        }),
    );

    if triggered {
        state.queue.enqueue_message_check(&request.jid).await;
    } else {
        debug!(
            group_jid = %request.jid,
            buffered = state.inbox.len(&request.jid),
            "no trigger, buffered as context"
        );
    }

    Ok(Json(InboundResponse {
        accepted: true,
        triggered,
        reason: None,
    }))
}
