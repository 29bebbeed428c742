use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mimir_consensus::{ConsensusNode, NodeOptions};
use mimir_types::MimirError;

async fn start_node(dir: &Path) -> Arc<ConsensusNode> {
    ConsensusNode::new(NodeOptions {
        storage_dir: dir.to_path_buf(),
        rpc_addr: "127.0.0.1:0".to_string(),
        api_addr: "127.0.0.1:0".to_string(),
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn write_read_delete_on_bootstrap_leader() {
    let dir = tempfile::tempdir().unwrap();
    let node = start_node(dir.path()).await;
    node.bootstrap().await.unwrap();
    node.await_leadership(Duration::from_secs(10)).await.unwrap();

    node.set("foo", b"bar".to_vec()).await.unwrap();
    assert_eq!(node.get("foo").await.unwrap(), b"bar");

    node.delete("foo").await.unwrap();
    assert!(node.get("foo").await.unwrap().is_empty());

    // Absent keys and deleted keys are indistinguishable.
    assert!(node.get("never-written").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_without_leadership_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let node = start_node(dir.path()).await;

    // No bootstrap: the node is a bare follower with no cluster.
    let err = node.set("k", b"v".to_vec()).await.unwrap_err();
    assert!(matches!(err, MimirError::NotLeader { .. }));

    // Reads still work from local state.
    assert!(node.get("k").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let node = start_node(dir.path()).await;
    node.bootstrap().await.unwrap();
    node.await_leadership(Duration::from_secs(10)).await.unwrap();

    let err = node.set("", b"v".to_vec()).await.unwrap_err();
    assert!(matches!(err, MimirError::InvalidArgument(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn values_survive_process_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let node = start_node(dir.path()).await;
        node.bootstrap().await.unwrap();
        node.await_leadership(Duration::from_secs(10)).await.unwrap();
        for i in 0..100 {
            node.set(&format!("key-{i:03}"), format!("value-{i}").into_bytes())
                .await
                .unwrap();
        }
        node.shutdown().await.unwrap();
    }

    // A restarted process gets a fresh identity but the same on-disk map;
    // every key reads back without any leader involvement.
    let reborn = start_node(dir.path()).await;
    for i in 0..100 {
        assert_eq!(
            reborn.get(&format!("key-{i:03}")).await.unwrap(),
            format!("value-{i}").into_bytes(),
        );
    }
}
