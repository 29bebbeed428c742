use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use serde_json::json;

use mimir_types::JoinRequest;

use crate::AppState;

pub(crate) fn json_response(status: StatusCode, data: serde_json::Value) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .body(Body::from(data.to_string()))
        .expect("static response parts are valid")
}

pub(crate) fn json_ok(data: serde_json::Value) -> Response {
    json_response(StatusCode::OK, data)
}

/// Every failure leaves the server the same way: 500 with a JSON message.
pub(crate) fn json_error(err: impl std::fmt::Display) -> Response {
    json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": err.to_string() }))
}

pub(crate) async fn health() -> Response {
    json_ok(json!({ "hello": "world" }))
}

/// Raw value bytes; an absent key is an empty 200, never a 404.
pub(crate) async fn get_key(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.node.get(&key).await {
        Ok(value) => Response::builder()
            .status(StatusCode::OK)
            .body(Body::from(value))
            .expect("static response parts are valid"),
        Err(e) => json_error(e),
    }
}

pub(crate) async fn set_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    match state.node.set(&key, body.to_vec()).await {
        Ok(()) => json_ok(json!({ "status": "success" })),
        Err(e) => json_error(e),
    }
}

pub(crate) async fn delete_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    match state.node.delete(&key).await {
        Ok(()) => json_ok(json!({ "status": "success" })),
        Err(e) => json_error(e),
    }
}

/// Join endpoint: parse the announcement and admit the node as a voter.
/// Parsed by hand so malformed bodies get the same 500 shape as everything
/// else.
pub(crate) async fn add_node(State(state): State<AppState>, body: Bytes) -> Response {
    let req: JoinRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::error!(error = %e, "could not parse join request");
            return json_error(e);
        }
    };
    tracing::debug!(id = %req.id, address = %req.address, "join request received");
    match state.node.add_voter(&req.id, req.address, req.api_address).await {
        Ok(()) => json_ok(json!({ "status": "success" })),
        Err(e) => json_error(e),
    }
}
