//! HTTP API
//!
//! Public routes, served on the node's HTTP address:
//! - `GET /key/:key`: local read, `{key: value}` with `""` for a missing key
//! - `POST /key`: JSON object of key/value pairs, one `set` each
//! - `DELETE /key/:key`
//! - `POST /join`: `{"id": .., "addr": ..}`
//! - `GET /raft`: `{"State": .., "Node": ..}`
//! - `GET /health`
//!
//! Mutations on a non-leader answer 405. Internal replication routes live
//! in a separate router served on the raft address.

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::Error;
use crate::node::gateway::WriteGateway;
use crate::node::membership::MembershipManager;
use crate::raft::network::{APPEND_PATH, SNAPSHOT_PATH, VOTE_PATH};
use crate::raft::{ConsensusEngine, KvRaft, TypeConfig};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Largest accepted request body on the public API
const MAX_BODY_BYTES: usize = 1024 * 1024;
/// Snapshot chunks and entry batches on the raft router
const MAX_RAFT_BODY_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct NodeState {
    pub gateway: Arc<WriteGateway>,
    pub membership: Arc<MembershipManager>,
    pub engine: Arc<dyn ConsensusEngine>,
}

fn error_response(err: &Error) -> Response {
    (
        err.to_http_status(),
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn get_key(State(state): State<NodeState>, Path(key): Path<String>) -> impl IntoResponse {
    let value = state.gateway.read(&key).unwrap_or_default();
    Json(HashMap::from([(key, value)]))
}

async fn set_keys(State(state): State<NodeState>, body: Bytes) -> Response {
    if !state.gateway.is_leader() {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let pairs: BTreeMap<String, String> = match serde_json::from_slice(&body) {
        Ok(pairs) => pairs,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("expected a JSON object of strings: {}", e) })),
            )
                .into_response()
        }
    };
    match state.gateway.set_many(pairs).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_key(State(state): State<NodeState>, Path(key): Path<String>) -> Response {
    if !state.gateway.is_leader() {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    match state.gateway.delete(&key).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn join(State(state): State<NodeState>, body: Bytes) -> Response {
    let Ok(fields) = serde_json::from_slice::<HashMap<String, String>>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if fields.len() != 2 {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let (Some(addr), Some(id)) = (fields.get("addr"), fields.get("id")) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match state.membership.join(id, addr).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e @ Error::InvalidRequest(_)) => error_response(&e),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn raft_state(State(state): State<NodeState>) -> impl IntoResponse {
    Json(json!({
        "State": state.engine.state().to_string(),
        "Node": state.engine.local_id(),
    }))
}

async fn health(State(state): State<NodeState>) -> impl IntoResponse {
    let stats = state.engine.stats();
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "node": state.engine.local_id(),
        "state": state.engine.state().to_string(),
        "leader": state.engine.leader().map(|l| l.address),
        "term": stats.term,
        "last_log_index": stats.last_log_index,
        "last_applied": stats.last_applied,
        "last_snapshot_index": stats.last_snapshot_index,
    }))
}

/// Public API router.
pub fn create_router(state: NodeState) -> Router {
    Router::new()
        .route("/key", axum::routing::post(set_keys))
        .route(
            "/key/:key",
            axum::routing::get(get_key).delete(delete_key),
        )
        .route("/join", axum::routing::post(join))
        .route("/raft", axum::routing::get(raft_state))
        .route("/health", axum::routing::get(health))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn raft_append(
    State(raft): State<KvRaft>,
    Json(req): Json<openraft::raft::AppendEntriesRequest<TypeConfig>>,
) -> impl IntoResponse {
    Json(raft.append_entries(req).await)
}

async fn raft_vote(
    State(raft): State<KvRaft>,
    Json(req): Json<openraft::raft::VoteRequest<u64>>,
) -> impl IntoResponse {
    Json(raft.vote(req).await)
}

async fn raft_snapshot(
    State(raft): State<KvRaft>,
    Json(req): Json<openraft::raft::InstallSnapshotRequest<TypeConfig>>,
) -> impl IntoResponse {
    Json(raft.install_snapshot(req).await)
}

/// Internal replication router, served on the raft address. Each route
/// answers with openraft's own `Result` as JSON.
pub fn create_raft_router(raft: KvRaft) -> Router {
    Router::new()
        .route(APPEND_PATH, axum::routing::post(raft_append))
        .route(VOTE_PATH, axum::routing::post(raft_vote))
        .route(SNAPSHOT_PATH, axum::routing::post(raft_snapshot))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_RAFT_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(raft)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::scheduler::{SnapshotPolicy, SnapshotScheduler};
    use crate::raft::testing::single_node;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;
    use tracing::Span;

    async fn router(leader: bool) -> Router {
        let (engine, store) = single_node("n1", leader).await;
        let engine: Arc<dyn ConsensusEngine> = engine;
        let scheduler = Arc::new(SnapshotScheduler::new(
            engine.clone(),
            SnapshotPolicy {
                every_n_writes: 0,
                ..SnapshotPolicy::default()
            },
            &Span::none(),
        ));
        let gateway = Arc::new(WriteGateway::new(
            engine.clone(),
            store,
            scheduler,
            Duration::from_secs(5),
            &Span::none(),
        ));
        let membership = Arc::new(MembershipManager::new(engine.clone(), &Span::none()));
        create_router(NodeState {
            gateway,
            membership,
            engine,
        })
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let router = router(true).await;
        let resp = router
            .clone()
            .oneshot(post("/key", r#"{"user1": "batman"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder().uri("/key/user1").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(body_json(resp).await, json!({ "user1": "batman" }));
    }

    #[tokio::test]
    async fn test_non_leader_refuses_before_parsing() {
        let router = router(false).await;
        let resp = router
            .clone()
            .oneshot(post("/key", "definitely not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let req = Request::builder()
            .method("DELETE")
            .uri("/key/user1")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_raft_state_body() {
        let router = router(false).await;
        let req = Request::builder().uri("/raft").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({ "State": "Follower", "Node": "n1" }));
    }

    #[tokio::test]
    async fn test_join_on_follower_fails() {
        let router = router(false).await;
        let resp = router
            .oneshot(post("/join", r#"{"addr": "raft-n2", "id": "n2"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_request_id_echoed() {
        let router = router(true).await;
        let req = Request::builder()
            .uri("/health")
            .header("X-Request-ID", "abc")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.headers()["X-Request-ID"], "abc");
    }

    #[tokio::test]
    async fn test_raft_router_answers_vote() {
        let (engine, _) = single_node("n1", false).await;
        let router = create_raft_router(engine.raft().clone());
        let req = openraft::raft::VoteRequest::<u64> {
            vote: openraft::Vote::new(1, 99),
            last_log_id: None,
        };
        let resp = router
            .oneshot(post(VOTE_PATH, &serde_json::to_string(&req).unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body.get("Ok").is_some(), "{}", body);
    }
}
