//! Receiving side of the consensus transport. Each endpoint hands the
//! deserialized RPC to the local raft instance and serializes the whole
//! `Result` back, so the sending side can tell a raft-level error from an
//! unreachable peer.

use axum::extract::State;
use axum::Json;
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};

use mimir_consensus::{NodeId, TypeConfig};

use crate::AppState;

pub(crate) async fn append_entries(
    State(state): State<AppState>,
    Json(rpc): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    Json(state.node.raft().append_entries(rpc).await)
}

pub(crate) async fn vote(
    State(state): State<AppState>,
    Json(rpc): Json<VoteRequest<NodeId>>,
) -> Json<Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(state.node.raft().vote(rpc).await)
}

pub(crate) async fn install_snapshot(
    State(state): State<AppState>,
    Json(rpc): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>> {
    Json(state.node.raft().install_snapshot(rpc).await)
}
