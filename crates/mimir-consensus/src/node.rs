use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{Config, ServerState};
use tokio::time::timeout;

use mimir_types::{Command, JoinRequest, MimirError};

use crate::fsm::StateMachineStore;
use crate::log::LogStore;
use crate::network::HttpNetworkFactory;
use crate::{Member, NodeId, Raft};

/// Hard bound on waiting for a submitted command to commit. The entry may
/// still commit after this fires; callers must tolerate replays.
const COMMIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Hard bound on a membership change.
const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period before announcing ourselves to the leader, so its HTTP
/// listener and our own consensus runtime have settled.
const JOIN_DELAY: Duration = Duration::from_secs(10);
/// One in this many leadership acquisitions triggers a snapshot.
const SNAPSHOT_CHANCE: u32 = 10;

/// Where a node keeps its state and how peers reach it.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub storage_dir: PathBuf,
    /// host:port of the consensus RPC listener.
    pub rpc_addr: String,
    /// host:port of the client HTTP listener.
    pub api_addr: String,
}

/// Handle to this node's consensus state.
///
/// Owns the raft instance; the HTTP layer borrows it to inspect the local
/// role, submit mutations, serve local reads, and admit new members.
pub struct ConsensusNode {
    id: NodeId,
    urn: String,
    member: Member,
    raft: Raft,
    fsm: StateMachineStore,
    http: reqwest::Client,
}

impl ConsensusNode {
    /// Open the on-disk stores under `storage_dir`, mint a fresh identity,
    /// and start the consensus runtime. No cluster membership is touched
    /// here; call [`bootstrap_or_join`](Self::bootstrap_or_join) once the
    /// node's listeners are up.
    pub async fn new(opts: NodeOptions) -> Result<Arc<Self>, MimirError> {
        std::fs::create_dir_all(&opts.storage_dir)
            .map_err(|e| MimirError::Io(format!("setting up storage dir: {e}")))?;

        let fsm = StateMachineStore::open(
            &opts.storage_dir.join("data.json"),
            &opts.storage_dir.join("snaps"),
        )?;
        let log_store =
            LogStore::open(&opts.storage_dir.join("log"), &opts.storage_dir.join("stable"))?;

        // Fresh identity every process start. A restarted node is a new
        // member as far as its peers are concerned.
        let urn = uuid::Uuid::new_v4().urn().to_string();
        let id = node_id_from_urn(&urn)?;

        let config = Config {
            cluster_name: "mimir".to_string(),
            heartbeat_interval: 500,
            election_timeout_min: 1500,
            election_timeout_max: 3000,
            ..Default::default()
        };
        let config =
            Arc::new(config.validate().map_err(|e| MimirError::Config(e.to_string()))?);

        let network = HttpNetworkFactory::new()?;
        let raft = Raft::new(id, config, network, log_store, fsm.clone())
            .await
            .map_err(|e| MimirError::Consensus(e.to_string()))?;

        let node = Arc::new(ConsensusNode {
            id,
            urn,
            member: Member { rpc_addr: opts.rpc_addr, api_addr: opts.api_addr },
            raft,
            fsm,
            http: reqwest::Client::new(),
        });
        node.spawn_leadership_observer();
        tracing::info!(id = node.id, urn = %node.urn, "consensus node ready");
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The UUID-URN identity announced to peers.
    pub fn urn(&self) -> &str {
        &self.urn
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    /// Raw raft handle, for the consensus RPC endpoints.
    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    /// True when this node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().state == ServerState::Leader
    }

    /// The leader's client-facing address, when one is known.
    pub fn leader_api_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|member| member.api_addr.clone())
    }

    /// Submit a set through the consensus log. Leader only.
    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), MimirError> {
        self.submit(Command::set(key, value)).await
    }

    /// Submit a delete through the consensus log. Leader only.
    pub async fn delete(&self, key: &str) -> Result<(), MimirError> {
        self.submit(Command::delete(key)).await
    }

    /// Local read; bypasses consensus entirely. Stale values are permitted
    /// on followers, absent keys read as empty.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, MimirError> {
        let fsm = self.fsm.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || fsm.local_get(&key))
            .await
            .map_err(|e| MimirError::Io(e.to_string()))?
    }

    async fn submit(&self, cmd: Command) -> Result<(), MimirError> {
        if cmd.key.is_empty() {
            return Err(MimirError::InvalidArgument("key must not be empty".into()));
        }
        // The HTTP edge proxies follower traffic; at this layer a misrouted
        // write is simply refused with a hint.
        if !self.is_leader() {
            return Err(MimirError::NotLeader { leader: self.leader_api_addr() });
        }
        let response = match timeout(COMMIT_TIMEOUT, self.raft.client_write(cmd)).await {
            Err(_) => return Err(MimirError::CommitTimeout(COMMIT_TIMEOUT)),
            Ok(Err(e)) => {
                return Err(match e {
                    RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => {
                        MimirError::NotLeader {
                            leader: forward.leader_node.map(|member| member.api_addr),
                        }
                    }
                    other => MimirError::Consensus(other.to_string()),
                })
            }
            Ok(Ok(response)) => response,
        };
        match response.data.error {
            Some(message) => Err(MimirError::Io(message)),
            None => Ok(()),
        }
    }

    /// Bootstrap a fresh single-node cluster, or join the cluster behind
    /// `known_leader` when one is given.
    pub async fn bootstrap_or_join(&self, known_leader: &str) -> Result<(), MimirError> {
        if known_leader.is_empty() {
            self.bootstrap().await
        } else {
            self.join(known_leader).await
        }
    }

    /// Initialize a cluster whose only voter is this node. A node restarted
    /// on existing state keeps its persisted membership instead.
    pub async fn bootstrap(&self) -> Result<(), MimirError> {
        let mut members = BTreeMap::new();
        members.insert(self.id, self.member.clone());
        match self.raft.initialize(members).await {
            Ok(()) => {
                tracing::info!("bootstrapped single-node cluster");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                tracing::debug!("cluster already initialized; keeping persisted membership");
                Ok(())
            }
            Err(e) => Err(MimirError::Consensus(e.to_string())),
        }
    }

    async fn join(&self, leader: &str) -> Result<(), MimirError> {
        tokio::time::sleep(JOIN_DELAY).await;
        let body = JoinRequest {
            id: self.urn.clone(),
            address: self.member.rpc_addr.clone(),
            api_address: self.member.api_addr.clone(),
        };
        let url = format!("{}/raft/add", leader.trim_end_matches('/'));
        let resp = self.http.post(&url).json(&body).send().await.map_err(|e| {
            MimirError::Membership(format!("failed adding self to leader {leader:?}: {e}"))
        })?;
        if !resp.status().is_success() {
            return Err(MimirError::Membership(format!(
                "leader {leader:?} rejected join: {}",
                resp.status()
            )));
        }
        tracing::info!(leader, "joined cluster");
        Ok(())
    }

    /// Leader-side half of the join protocol: admit the announced node as a
    /// learner, wait for it to catch up, then promote it to voter.
    pub async fn add_voter(
        &self,
        urn: &str,
        rpc_addr: String,
        api_addr: String,
    ) -> Result<(), MimirError> {
        let id = node_id_from_urn(urn)?;
        let member = Member { rpc_addr, api_addr };
        let change = async {
            self.raft
                .add_learner(id, member, true)
                .await
                .map_err(|e| MimirError::Membership(e.to_string()))?;
            let mut voters: BTreeSet<NodeId> = {
                let metrics = self.raft.metrics().borrow().clone();
                metrics.membership_config.membership().voter_ids().collect()
            };
            voters.insert(id);
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(|e| MimirError::Membership(e.to_string()))?;
            Ok::<_, MimirError>(())
        };
        match timeout(MEMBERSHIP_TIMEOUT, change).await {
            Err(_) => {
                Err(MimirError::Membership(format!("membership change for {urn} timed out")))
            }
            Ok(result) => {
                result?;
                tracing::info!(urn, "voter added");
                Ok(())
            }
        }
    }

    /// Block until this node observes itself as leader. Bootstrap and test
    /// convenience.
    pub async fn await_leadership(&self, within: Duration) -> Result<(), MimirError> {
        self.raft
            .wait(Some(within))
            .state(ServerState::Leader, "leadership")
            .await
            .map(|_| ())
            .map_err(|e| MimirError::Consensus(e.to_string()))
    }

    /// Stop the consensus runtime. Used by tests; the process normally just
    /// exits.
    pub async fn shutdown(&self) -> Result<(), MimirError> {
        self.raft.shutdown().await.map_err(|e| MimirError::Consensus(e.to_string()))
    }

    // Watches role transitions forever. Each time leadership is acquired,
    // roll a d10 and opportunistically snapshot; amortizes log growth
    // without a dedicated scheduler.
    fn spawn_leadership_observer(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut metrics = node.raft.metrics();
            let mut was_leader = false;
            loop {
                let is_leader = metrics.borrow().state == ServerState::Leader;
                if is_leader && !was_leader {
                    tracing::info!("cluster leadership acquired");
                    if rand::random::<u32>() % SNAPSHOT_CHANCE == 0 {
                        if let Err(e) = node.raft.trigger().snapshot().await {
                            tracing::warn!(error = %e, "opportunistic snapshot failed");
                        }
                    }
                }
                was_leader = is_leader;
                if metrics.changed().await.is_err() {
                    break;
                }
            }
        });
    }
}

fn node_id_from_urn(urn: &str) -> Result<NodeId, MimirError> {
    let uuid = uuid::Uuid::parse_str(urn)
        .map_err(|e| MimirError::InvalidArgument(format!("bad node id {urn:?}: {e}")))?;
    // The consensus layer wants a small copyable id; fold the UUID down.
    // Both sides of the join protocol derive the same value from the URN.
    Ok(uuid.as_u128() as NodeId)
}
