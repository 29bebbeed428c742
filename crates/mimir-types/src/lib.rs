use std::collections::BTreeMap;
use std::time::Duration;

/// Raft node id. The consensus layer requires a small copyable id; the
/// UUID-URN identity a node announces is folded into this deterministically
/// (see `mimir-consensus`).
pub type NodeId = u64;

/// The replicated map: UTF-8 keys to arbitrary byte values. A `BTreeMap` so
/// the on-disk JSON encoding is key-sorted and byte-identical across nodes.
pub type KvMap = BTreeMap<String, Vec<u8>>;

pub const ACTION_SET: &str = "set";
pub const ACTION_DELETE: &str = "delete";

/// A mutation carried through the consensus log.
///
/// `action` is deliberately a free-form string rather than an enum: an entry
/// written by a newer binary with an action this one does not know must still
/// decode, so the state machine can drop it as a no-op instead of diverging.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Command {
    pub action: String,
    pub key: String,
    #[serde(default)]
    pub value: Vec<u8>,
}

impl Command {
    pub fn set(key: impl Into<String>, value: Vec<u8>) -> Self {
        Command { action: ACTION_SET.to_string(), key: key.into(), value }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Command { action: ACTION_DELETE.to_string(), key: key.into(), value: Vec::new() }
    }
}

/// What applying one committed command produced. The leader's submit path
/// observes this; apply itself never fails on a bad payload.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CommandOutcome {
    pub error: Option<String>,
}

/// Body of `POST /raft/add`. Field names are part of the wire contract.
///
/// `ApiAddress` is the joiner's client HTTP endpoint; the leader records it
/// in the membership config so follower nodes can proxy client traffic to
/// whoever leads.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "ApiAddress", default)]
    pub api_address: String,
}

#[derive(thiserror::Error, Debug)]
pub enum MimirError {
    #[error("i/o: {0}")]
    Io(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("file lock: {0}")]
    Lock(String),
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("command not committed within {0:?}")]
    CommitTimeout(Duration),
    #[error("membership change rejected: {0}")]
    Membership(String),
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_json_round_trip() {
        let cmd = Command::set("foo", b"\x00\xffbar".to_vec());
        let raw = serde_json::to_vec(&cmd).unwrap();
        let back: Command = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back.action, ACTION_SET);
        assert_eq!(back.key, "foo");
        assert_eq!(back.value, b"\x00\xffbar");
    }

    #[test]
    fn command_with_unknown_action_still_decodes() {
        let raw = br#"{"action":"compact","key":"k"}"#;
        let cmd: Command = serde_json::from_slice(raw).unwrap();
        assert_eq!(cmd.action, "compact");
        assert!(cmd.value.is_empty());
    }

    #[test]
    fn join_request_wire_field_names() {
        let req = JoinRequest {
            id: "urn:uuid:00000000-0000-0000-0000-000000000000".into(),
            address: "127.0.0.1:8081".into(),
            api_address: "127.0.0.1:8080".into(),
        };
        let raw = serde_json::to_string(&req).unwrap();
        assert!(raw.contains(r#""ID""#));
        assert!(raw.contains(r#""Address""#));
        assert!(raw.contains(r#""ApiAddress""#));

        // ApiAddress is optional on the way in.
        let legacy: JoinRequest =
            serde_json::from_str(r#"{"ID":"x","Address":"y:1"}"#).unwrap();
        assert!(legacy.api_address.is_empty());
    }
}
