//! Appservice transaction listener (4.H): the HTTP surface the homeserver
//! pushes events into. One axum router handles both the legacy
//! `/transactions/{id}` path and the `v1` prefixed one, since homeserver
//! implementations disagree on which they call.

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::put;
use axum::{Json, Router};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Receives one pushed transaction's events. Implemented by the bridge
/// controller; events within a transaction are awaited in order, but the
/// handler is free to let distinct transactions run concurrently (9, deviates
/// from fire-and-forget-everything to keep per-room ordering intact).
#[async_trait]
pub trait TransactionHandler: Send + Sync {
    async fn on_transaction(&self, events: Vec<Value>);
}

#[derive(Deserialize)]
struct TransactionBody {
    events: Vec<Value>,
}

#[derive(Deserialize)]
struct AuthQuery {
    access_token: Option<String>,
}

/// Bounds memory used to remember which transaction ids were already
/// processed (the homeserver may legitimately retry a transaction whose
/// response it never saw).
const SEEN_CAPACITY: usize = 1000;

struct AppState {
    hs_token: String,
    handler: Arc<dyn TransactionHandler>,
    seen: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl AppState {
    fn already_seen(&self, txn_id: &str) -> bool {
        let mut guard = self.seen.lock().unwrap();
        if guard.0.contains(txn_id) {
            return true;
        }
        guard.0.insert(txn_id.to_string());
        guard.1.push_back(txn_id.to_string());
        if guard.1.len() > SEEN_CAPACITY {
            if let Some(oldest) = guard.1.pop_front() {
                guard.0.remove(&oldest);
            }
        }
        false
    }
}

pub fn router(hs_token: String, handler: Arc<dyn TransactionHandler>) -> Router {
    let state = Arc::new(AppState {
        hs_token,
        handler,
        seen: Mutex::new((HashSet::new(), VecDeque::new())),
    });

    Router::new()
        .route("/transactions/:txn_id", put(handle_transaction))
        .route("/_matrix/app/v1/transactions/:txn_id", put(handle_transaction))
        .with_state(state)
}

async fn handle_transaction(
    State(state): State<Arc<AppState>>,
    Path(txn_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    Json(body): Json<TransactionBody>,
) -> impl IntoResponse {
    let token = bearer_token(&headers).or(query.access_token);
    if token.as_deref() != Some(state.hs_token.as_str()) {
        warn!("rejected transaction {txn_id}: bad or missing hs_token");
        return (StatusCode::FORBIDDEN, Json(serde_json::json!({"errcode": "M_FORBIDDEN"})));
    }

    if state.already_seen(&txn_id) {
        debug!("transaction {txn_id} already processed, replaying empty success");
        return (StatusCode::OK, Json(serde_json::json!({})));
    }

    debug!("transaction {txn_id}: {} events", body.events.len());
    state.handler.on_transaction(body.events).await;

    (StatusCode::OK, Json(serde_json::json!({})))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl TransactionHandler for CountingHandler {
        async fn on_transaction(&self, events: Vec<Value>) {
            self.0.fetch_add(events.len(), Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn rejects_wrong_token() {
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let app = router("correct-token".to_string(), handler.clone());

        let req = Request::builder()
            .method("PUT")
            .uri("/transactions/1?access_token=wrong")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"events": []}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn accepts_events_and_dedupes_repeated_transaction_id() {
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let app = router("correct-token".to_string(), handler.clone());

        let make_req = || {
            Request::builder()
                .method("PUT")
                .uri("/transactions/abc?access_token=correct-token")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"events": [{"type": "m.room.message"}]}"#))
                .unwrap()
        };

        let resp = app.clone().oneshot(make_req()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app.oneshot(make_req()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }
}
