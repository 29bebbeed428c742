use std::time::Duration;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use mimir_types::MimirError;

use crate::{Member, NodeId, TypeConfig};

/// Per-request bound on a consensus RPC.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on pooled connections per peer.
const RPC_MAX_IDLE: usize = 10;

/// Consensus transport: JSON over each peer's raft HTTP listener.
///
/// One shared client; connections are pooled per peer host.
#[derive(Debug, Clone)]
pub struct HttpNetworkFactory {
    client: reqwest::Client,
}

impl HttpNetworkFactory {
    pub fn new() -> Result<Self, MimirError> {
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .pool_max_idle_per_host(RPC_MAX_IDLE)
            .build()
            .map_err(|e| MimirError::Config(e.to_string()))?;
        Ok(HttpNetworkFactory { client })
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpConnection;

    async fn new_client(&mut self, target: NodeId, node: &Member) -> Self::Network {
        HttpConnection {
            client: self.client.clone(),
            target,
            base: format!("http://{}", node.rpc_addr),
        }
    }
}

/// A client handle for one peer.
pub struct HttpConnection {
    client: reqwest::Client,
    target: NodeId,
    base: String,
}

impl HttpConnection {
    // The receiving side serializes the whole `Result`, so a remote raft
    // error deserializes here and is reported distinctly from an unreachable
    // peer.
    async fn send<Req, Resp, E>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Resp, RPCError<NodeId, Member, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;
        let result: Result<Resp, E> = resp
            .json()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetwork<TypeConfig> for HttpConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, Member, RaftError<NodeId>>> {
        self.send("/raft/append_entries", &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, Member, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.send("/raft/install_snapshot", &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, Member, RaftError<NodeId>>> {
        self.send("/raft/vote", &rpc).await
    }
}
