//! HTTP API handlers: status, latest-records reads, single-record lookup
//! and the diagnostic insert.

use crate::config::LIST_FEED_CLASS;
use crate::ranker::{encode_list_entry, FeedSource, RankedFeed};
use crate::subscription::validate_channel;
use crate::ws_server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{SecondsFormat, Utc};
use record_store::{Fields, UpstreamStatus, CREATED_AT_FIELD, PROGRESS_FIELD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

const SERVER_NAME: &str = "Feed Gateway";

// =============================================================================
// Response Types
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    pub upstream: UpstreamStatus,
    #[serde(rename = "upstreamConnected")]
    pub upstream_connected: bool,
    /// Record count per class.
    pub counts: BTreeMap<String, usize>,
    #[serde(rename = "liveConnections")]
    pub live_connections: usize,
    #[serde(rename = "activeChannels")]
    pub active_channels: Vec<String>,
    pub server: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct InsertResponse {
    success: bool,
    message: String,
    key: String,
    record: Fields,
}

#[derive(Serialize)]
struct PublishResponse {
    channel: String,
    receivers: usize,
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    limit: Option<usize>,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

// =============================================================================
// Handlers
// =============================================================================

/// Liveness probe; never touches the store.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "OK".to_string(),
        timestamp: now_iso(),
    })
}

/// Gather connectivity, per-class counts and connection stats. Store errors
/// are reported in the body, never raised.
pub async fn collect_status(state: &AppState) -> StatusResponse {
    let mut counts = BTreeMap::new();
    let mut failure = state.store.ping().await.err().map(|e| e.to_string());

    for class in state.translator.classes() {
        if failure.is_some() {
            break;
        }
        match state.store.keys(&class.key_prefix).await {
            Ok(keys) => {
                counts.insert(class.name.clone(), keys.len());
            }
            Err(e) => failure = Some(e.to_string()),
        }
    }

    if failure.is_none() {
        if let Some(list_key) = &state.config.feed_list_key {
            match state.store.list_range(list_key, None).await {
                Ok(entries) => {
                    counts.insert(LIST_FEED_CLASS.to_string(), entries.len());
                }
                Err(e) => failure = Some(e.to_string()),
            }
        }
    }

    let upstream = state.status.get();
    StatusResponse {
        connected: failure.is_none(),
        upstream_connected: upstream.is_connected(),
        upstream,
        counts: if failure.is_none() { counts } else { BTreeMap::new() },
        live_connections: state.registry.client_count(),
        active_channels: state.registry.active_channels().await,
        server: SERVER_NAME.to_string(),
        timestamp: now_iso(),
        error: failure,
    }
}

/// Server status. Always 200.
pub async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(collect_status(&state).await)
}

/// Store status. 503 with `connected: false` when the store is unreachable.
pub async fn store_status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = collect_status(&state).await;
    let code = if status.connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

/// Latest records of the default class, default K.
pub async fn latest_default_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(class) = state.translator.classes().first() else {
        return error_response(StatusCode::NOT_FOUND, "No record classes configured");
    };
    let source = FeedSource::Hashes {
        prefix: class.key_prefix.clone(),
    };
    let feed: RankedFeed = state.ranker.rank_latest(&source, state.config.latest_limit).await;
    Json(feed).into_response()
}

/// Latest records of any class, `?limit=K`.
pub async fn latest_for_class_handler(
    State(state): State<Arc<AppState>>,
    Path(class): Path<String>,
    Query(query): Query<LatestQuery>,
) -> Response {
    let Some(source) = resolve_source(&state, &class) else {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown class: {}", class));
    };

    let limit = query
        .limit
        .unwrap_or(state.config.latest_limit)
        .min(state.config.max_latest_limit);

    Json(state.ranker.rank_latest(&source, limit).await).into_response()
}

/// Full field map of one record. The key arrives percent-decoded.
pub async fn get_record_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    match state.store.get(&key).await {
        Ok(Some(fields)) => Json(fields).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Record not found"),
        Err(e) if e.is_unavailable() => {
            warn!("Lookup of {} failed, store unavailable: {}", key, e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => {
            error!("Lookup of {} failed: {}", key, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Insert one synthetic record into the default class (and the list feed,
/// when configured) for manual verification.
pub async fn test_record_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(class) = state.translator.classes().first() else {
        return error_response(StatusCode::NOT_FOUND, "No record classes configured");
    };

    let id = format!("TEST{}", Utc::now().timestamp_millis());
    let key = format!("{}{}", class.key_prefix, id);
    let record: Fields = [
        ("mint", id.as_str()),
        ("symbol", "TEST"),
        ("name", "Test Record"),
        (CREATED_AT_FIELD, now_iso().as_str()),
        (PROGRESS_FIELD, "0.25"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    if let Err(e) = state.store.insert(&key, &record).await {
        error!("Failed to add test record: {}", e);
        let code = if e.is_unavailable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        return error_response(code, e.to_string());
    }

    if let Some(list_key) = &state.config.feed_list_key {
        let pushed = match encode_list_entry(&key, &record) {
            Ok(entry) => state
                .store
                .push_bounded(list_key, &entry, state.config.feed_list_max_len)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = pushed {
            warn!("Test record {} not pushed to {}: {}", key, list_key, e);
        }
    }

    info!("Added test record {}", key);
    Json(InsertResponse {
        success: true,
        message: "Test record added".to_string(),
        key,
        record,
    })
    .into_response()
}

/// Publish the request body on a plain channel. Reaches every subscriber of
/// that channel across gateway instances.
pub async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    body: String,
) -> Response {
    if let Some(reason) = validate_channel(&channel) {
        return error_response(StatusCode::BAD_REQUEST, reason);
    }

    match state.store.publish(&channel, &body).await {
        Ok(receivers) => {
            info!("Published {} bytes on {} to {} receivers", body.len(), channel, receivers);
            Json(PublishResponse { channel, receivers }).into_response()
        }
        Err(e) => {
            error!("Publish on {} failed: {}", channel, e);
            let code = if e.is_unavailable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            error_response(code, e.to_string())
        }
    }
}

fn resolve_source(state: &AppState, class: &str) -> Option<FeedSource> {
    if class == LIST_FEED_CLASS {
        return state
            .config
            .feed_list_key
            .clone()
            .map(|key| FeedSource::List { key });
    }
    state
        .translator
        .class(class)
        .map(|c| FeedSource::Hashes {
            prefix: c.key_prefix.clone(),
        })
}
