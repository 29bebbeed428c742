//! Consensus integration: the openraft type configuration, the persistent
//! log and stable stores, the deterministic state machine over the on-disk
//! map, the HTTP transport between peers, and the per-node handle the rest
//! of the system talks to.
//!
//! The split of responsibilities follows openraft's storage-v2 shape: the
//! log store answers for durability of entries and votes, the state machine
//! answers for applied data and snapshots, and `ConsensusNode` is the only
//! type the HTTP layer needs to see.

pub mod fsm;
pub mod log;
pub mod network;
pub mod node;

use std::fmt;
use std::io::Cursor;

pub use mimir_types::NodeId;
use mimir_types::{Command, CommandOutcome};

/// Cluster member record kept in the consensus membership config.
///
/// Carries both endpoints a peer exposes: `rpc_addr` is where consensus
/// RPCs land, `api_addr` is the client HTTP listener the request router
/// proxies to when this member leads.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Member {
    pub rpc_addr: String,
    pub api_addr: String,
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member {{ rpc: {}, api: {} }}", self.rpc_addr, self.api_addr)
    }
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Command,
        R = CommandOutcome,
        Node = Member,
);

pub type Raft = openraft::Raft<TypeConfig>;

pub use fsm::StateMachineStore;
pub use log::LogStore;
pub use network::HttpNetworkFactory;
pub use node::{ConsensusNode, NodeOptions};
