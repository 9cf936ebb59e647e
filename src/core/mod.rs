//! Domain types shared by the server and the stores.

mod limits;
mod proto;
mod subject;

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use limits::{ChannelLimits, LimitsError, StoreLimits};
pub use proto::{
    AckProto, ConnectRequest, ConnectResponse, MsgProto, StartPosition, SubscribeRequest,
    SubscribeResponse, SubscriptionConfig, UnsubscribeRequest,
};
pub use subject::{validate_channel_name, validate_client_id, SubjectError};

/// Protocol revision persisted with the server identity. A store written by a
/// newer revision refuses to load under an older binary.
pub const PROTOCOL_VERSION: u32 = 1;

/// Broker identity and the request subjects the transport layer serves.
///
/// Exactly one of these is persisted per store; the cluster id must match on
/// every subsequent start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub cluster_id: String,
    pub discover_prefix: String,
    pub publish_prefix: String,
    pub subscribe_subj: String,
    pub unsub_subj: String,
    pub close_subj: String,
    pub proto_version: u32,
}

impl ServerInfo {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        let cluster_id = cluster_id.into();
        Self {
            discover_prefix: "_DISCOVER".to_string(),
            publish_prefix: format!("_PUB.{cluster_id}"),
            subscribe_subj: format!("_SUB.{cluster_id}"),
            unsub_subj: format!("_UNSUB.{cluster_id}"),
            close_subj: format!("_CLOSE.{cluster_id}"),
            proto_version: PROTOCOL_VERSION,
            cluster_id,
        }
    }
}

/// A registered client as persisted by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub heartbeat_inbox: String,
}

/// One message in a channel's sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// 1-based, dense per channel.
    pub seq: u64,
    /// Broker wall clock at store time.
    pub timestamp_ns: u64,
    /// 0 when the channel has no age limit, else `timestamp_ns + max_age`.
    pub expiration_ns: u64,
    pub data: Bytes,
}

/// Wall clock in nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_info_derives_subjects_from_cluster_id() {
        let info = ServerInfo::new("swamp");
        assert_eq!(info.cluster_id, "swamp");
        assert_eq!(info.publish_prefix, "_PUB.swamp");
        assert_eq!(info.proto_version, PROTOCOL_VERSION);
    }

    #[test]
    fn now_ns_is_monotonic_enough() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
