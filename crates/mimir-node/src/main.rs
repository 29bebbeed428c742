use std::path::PathBuf;

use anyhow::Context;
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use mimir_consensus::{ConsensusNode, NodeOptions};
use mimir_server::{api_router, rpc_router, AppState};

/// Runtime configuration, read from the environment over these defaults.
#[derive(Debug, Serialize, Deserialize)]
struct Config {
    /// Client HTTP listen port (`PORT`).
    port: u16,
    /// Base directory for all on-disk state (`STORAGE_PATH`).
    storage_path: PathBuf,
    /// Host for the consensus transport (`RAFT_ADDRESS`).
    raft_address: String,
    /// Port for the consensus transport (`RAFT_PORT`).
    raft_port: u16,
    /// Base URL of a known leader to join; empty bootstraps a new cluster
    /// (`RAFT_LEADER`).
    raft_leader: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8080,
            storage_path: PathBuf::from("./tmp/kv"),
            raft_address: "localhost".to_string(),
            raft_port: 8081,
            raft_leader: String::new(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config: Config = Figment::from(Serialized::defaults(Config::default()))
        .merge(Env::raw().only(&["port", "storage_path", "raft_address", "raft_port", "raft_leader"]))
        .extract()
        .context("failed to load configuration")?;

    tracing::info!("starting up on http://localhost:{}", config.port);

    let rpc_addr = format!("{}:{}", config.raft_address, config.raft_port);
    let advertised_api = format!("{}:{}", config.raft_address, config.port);

    // Both listeners come up before the node announces itself anywhere, so
    // peers can reach us the moment membership changes.
    let api_listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding client listener on port {}", config.port))?;
    let rpc_listener = TcpListener::bind(&rpc_addr)
        .await
        .with_context(|| format!("binding consensus listener on {rpc_addr}"))?;

    let node = ConsensusNode::new(NodeOptions {
        storage_dir: config.storage_path.clone(),
        rpc_addr,
        api_addr: advertised_api,
    })
    .await
    .context("couldn't set up consensus")?;

    let state = AppState::new(node.clone());
    let rpc_server = tokio::spawn(mimir_server::serve(rpc_listener, rpc_router(state.clone())));
    let api_server = tokio::spawn(mimir_server::serve(api_listener, api_router(state)));

    node.bootstrap_or_join(&config.raft_leader)
        .await
        .context("cluster setup failed")?;

    let (rpc_result, api_result) =
        tokio::try_join!(rpc_server, api_server).context("server task panicked")?;
    rpc_result?;
    api_result?;
    Ok(())
}
