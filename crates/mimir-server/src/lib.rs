//! HTTP surface of a node: the client-facing key API behind the
//! leader-forwarding middleware, and the consensus RPC endpoints served on
//! the raft listener.

mod forward;
mod handlers;
mod raft_rpc;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use mimir_consensus::ConsensusNode;

/// Shared handler state: the consensus handle plus the proxy HTTP client.
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<ConsensusNode>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(node: Arc<ConsensusNode>) -> Self {
        AppState { node, http: reqwest::Client::new() }
    }
}

/// Client-facing API: health, key operations, and the cluster-join endpoint.
/// Every route passes through the leader-forwarding middleware.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route(
            "/key/:key",
            get(handlers::get_key).post(handlers::set_key).delete(handlers::delete_key),
        )
        .route("/raft/add", post(handlers::add_node))
        .layer(middleware::from_fn_with_state(state.clone(), forward::forward_to_leader))
        .with_state(state)
}

/// Consensus RPC surface served on the raft listener.
pub fn rpc_router(state: AppState) -> Router {
    Router::new()
        .route("/raft/append_entries", post(raft_rpc::append_entries))
        .route("/raft/vote", post(raft_rpc::vote))
        .route("/raft/install_snapshot", post(raft_rpc::install_snapshot))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, router: Router) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "http server starting");
    axum::serve(listener, router).await.map_err(Into::into)
}
