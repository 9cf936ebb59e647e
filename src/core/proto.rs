//! Typed request/response payloads exchanged with the RPC layer.
//!
//! The wire framing (length prefixes, reply subjects) belongs to the
//! transport; these are the payloads it decodes for the broker core.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Where a new subscription starts in the channel's sequence, resolved
/// against the message store at subscribe time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "position", rename_all = "snake_case")]
pub enum StartPosition {
    /// Only messages published after the subscription exists.
    NewOnly,
    /// The most recently stored message, then everything newer.
    LastReceived,
    /// The oldest available message onward.
    AllAvailable,
    /// A specific sequence. Fails if `seq > last_seq + 1`.
    SequenceStart { seq: u64 },
    /// Messages no older than `delta_ns` before now.
    TimeDeltaStart { delta_ns: u64 },
}

impl Default for StartPosition {
    fn default() -> Self {
        StartPosition::NewOnly
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub client_id: String,
    pub heartbeat_inbox: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub publish_prefix: String,
    pub subscribe_subj: String,
    pub unsub_subj: String,
    pub close_subj: String,
}

/// Delivery tuning for one subscription. Defaults come from the server
/// options when a field is `None`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub durable_name: Option<String>,
    pub queue_group: Option<String>,
    pub ack_wait_ns: Option<u64>,
    pub max_in_flight: Option<u32>,
    pub manual_ack: bool,
    pub start: StartPosition,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub client_id: String,
    pub channel: String,
    /// Subject the broker publishes deliveries on.
    pub inbox: String,
    #[serde(default)]
    pub config: SubscriptionConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeResponse {
    /// Subject acks for this subscription must be sent to.
    pub ack_inbox: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub client_id: String,
    pub channel: String,
    pub ack_inbox: String,
    /// Present when removing a durable for good rather than detaching.
    #[serde(default)]
    pub durable_name: Option<String>,
}

/// A delivered message as published on a subscription inbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgProto {
    pub channel: String,
    pub seq: u64,
    pub timestamp_ns: u64,
    pub data: Bytes,
    pub redelivered: bool,
    pub redelivery_count: u32,
}

/// Client acknowledgement for one delivered sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckProto {
    pub seq: u64,
}
