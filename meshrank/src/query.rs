//! Read-only query API (`spec.md` §4.7), exposed over HTTP via `axum` —
//! the teacher's own web stack, wired the same way `sinyalist-ingest`
//! wires its ingest router: a cloneable `AppState` holding an `Arc` to
//! shared state, routes registered on a `Router`, `TraceLayer` for
//! request logging.

use crate::metrics;
use crate::observers;
use crate::store::Datastore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub datastore: Arc<Datastore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/observers/ranked", get(ranked_observers))
        .route("/messages/recent", get(recent_messages))
        .route("/nodes/:pub_key", get(get_node))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Deserialize)]
struct RankedObserversQuery {
    window_hours: Option<i64>,
}

async fn ranked_observers(
    State(state): State<AppState>,
    Query(q): Query<RankedObserversQuery>,
) -> impl IntoResponse {
    let window_hours = q.window_hours.unwrap_or(24);
    let conn = match state.datastore.read_only_connection() {
        Ok(c) => c,
        Err(e) => return internal_error(e),
    };
    let now_ms = chrono::Utc::now().timestamp_millis();
    match observers::ranked_observers(&conn, now_ms, window_hours) {
        Ok(ranked) => Json(ranked).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct RecentMessagesQuery {
    channel: Option<String>,
    limit: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
struct MessageSummary {
    message_hash: String,
    channel_name: Option<String>,
    sender: Option<String>,
    body: Option<String>,
    ts: i64,
    path_length: i64,
}

async fn recent_messages(
    State(state): State<AppState>,
    Query(q): Query<RecentMessagesQuery>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let conn = match state.datastore.read_only_connection() {
        Ok(c) => c,
        Err(e) => return internal_error(e),
    };

    let result = match &q.channel {
        Some(channel) => conn.prepare(
            "SELECT message_hash, channel_name, sender, body, ts, path_length
             FROM messages WHERE channel_name = ?1 ORDER BY ts DESC LIMIT ?2",
        ).and_then(|mut stmt| {
            stmt.query_map(rusqlite::params![channel, limit], map_message_row)?.collect::<rusqlite::Result<Vec<_>>>()
        }),
        None => conn.prepare(
            "SELECT message_hash, channel_name, sender, body, ts, path_length
             FROM messages ORDER BY ts DESC LIMIT ?1",
        ).and_then(|mut stmt| {
            stmt.query_map(rusqlite::params![limit], map_message_row)?.collect::<rusqlite::Result<Vec<_>>>()
        }),
    };

    match result {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => internal_error(e),
    }
}

fn map_message_row(row: &rusqlite::Row) -> rusqlite::Result<MessageSummary> {
    Ok(MessageSummary {
        message_hash: row.get(0)?,
        channel_name: row.get(1)?,
        sender: row.get(2)?,
        body: row.get(3)?,
        ts: row.get(4)?,
        path_length: row.get(5)?,
    })
}

#[derive(Clone, Debug, Serialize)]
struct Node {
    pub_key: String,
    name: Option<String>,
    role: String,
    is_repeater: bool,
    lat: Option<f64>,
    lon: Option<f64>,
    last_advert_heard_ms: i64,
    last_seen: i64,
}

async fn get_node(State(state): State<AppState>, Path(pub_key): Path<String>) -> impl IntoResponse {
    let conn = match state.datastore.read_only_connection() {
        Ok(c) => c,
        Err(e) => return internal_error(e),
    };
    let node = conn.query_row(
        "SELECT pub, name, role, is_repeater, lat, lon, last_advert_heard_ms, last_seen
         FROM devices WHERE pub = ?1",
        rusqlite::params![pub_key.to_uppercase()],
        |row| {
            Ok(Node {
                pub_key: row.get(0)?,
                name: row.get(1)?,
                role: row.get(2)?,
                is_repeater: row.get::<_, i64>(3)? != 0,
                lat: row.get(4)?,
                lon: row.get(5)?,
                last_advert_heard_ms: row.get(6)?,
                last_seen: row.get(7)?,
            })
        },
    );
    match node {
        Ok(node) => Json(node).into_response(),
        Err(rusqlite::Error::QueryReturnedNoRows) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let conn = match state.datastore.read_only_connection() {
        Ok(c) => c,
        Err(e) => return internal_error(e),
    };
    let now_ms = chrono::Utc::now().timestamp_millis();
    match metrics::health(&conn, state.datastore.db_path(), now_ms) {
        Ok(report) => Json(report).into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: impl std::fmt::Display) -> axum::response::Response {
    tracing::error!(error = %e, "query_api_datastore_error");
    (StatusCode::INTERNAL_SERVER_ERROR, "datastore error").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("meshrank.db");
        let datastore = Datastore::open(db_path.to_str().unwrap()).unwrap();
        (
            AppState {
                datastore: Arc::new(datastore),
            },
            dir,
        )
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok_on_empty_datastore() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_node_returns_404() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/nodes/{}", "AB".repeat(32)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ranked_observers_returns_empty_array_on_empty_datastore() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/observers/ranked")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
