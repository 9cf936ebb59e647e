//! The durable store contract and its two back-ends.
//!
//! A [`Store`] owns broker identity, clients, and channels; each channel
//! hands out a [`MessageStore`] (the sequence of published messages) and a
//! [`SubStore`] (subscription state and pending-ack rows). Back-ends must
//! guarantee that no partial write is visible after recovery.

pub mod file;
pub mod sql;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ClientInfo, LimitsError, Message, ServerInfo, StoreLimits};
use crate::error::Transience;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("store corrupt: {reason}")]
    Corrupt { reason: String },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store proto version {stored} is newer than supported {supported}")]
    VersionMismatch { stored: u32, supported: u32 },
    #[error("store belongs to cluster {stored:?}, not {configured:?}")]
    ClusterIdMismatch { stored: String, configured: String },
    #[error("channel limit reached ({max})")]
    ChannelLimitReached { max: i64 },
    #[error("subscription limit reached ({max})")]
    SubscriptionLimitReached { max: i64 },
    #[error(transparent)]
    BadLimits(#[from] LimitsError),
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Unavailable { .. } | StoreError::Sqlite(_) => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: Some(path.into()),
            source,
        }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            reason: reason.into(),
        }
    }
}

/// The persisted shape of one subscription. `sub_id` 0 means "not yet
/// assigned"; [`SubStore::create_sub`] fills it in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubState {
    pub sub_id: u64,
    pub client_id: String,
    pub inbox: String,
    pub ack_inbox: String,
    #[serde(default)]
    pub durable_name: Option<String>,
    #[serde(default)]
    pub queue_group: Option<String>,
    pub ack_wait_ns: u64,
    pub max_in_flight: u32,
    pub manual_ack: bool,
    pub is_durable: bool,
    pub last_sent: u64,
}

/// The stores backing one channel, plus its stable id.
#[derive(Clone)]
pub struct ChannelStores {
    pub id: u64,
    pub msgs: Arc<dyn MessageStore>,
    pub subs: Arc<dyn SubStore>,
}

impl std::fmt::Debug for ChannelStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStores").field("id", &self.id).finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct RecoveredSubscription {
    pub state: SubState,
    /// Sequences delivered but unacked at shutdown.
    pub pending: BTreeSet<u64>,
}

pub struct RecoveredChannel {
    pub stores: ChannelStores,
    pub subscriptions: Vec<RecoveredSubscription>,
    pub first_seq: u64,
    pub last_seq: u64,
}

pub struct RecoveredState {
    pub info: ServerInfo,
    pub clients: Vec<ClientInfo>,
    pub channels: BTreeMap<String, RecoveredChannel>,
}

pub trait Store: Send + Sync {
    /// Persist the server identity, or compare against the stored one.
    /// Idempotent under changed non-identity fields.
    fn init(&self, info: &ServerInfo) -> Result<(), StoreError>;

    /// Rebuild persisted state. `None` means the store is empty (first
    /// start). Corrupt payloads fail recovery.
    fn recover(&self) -> Result<Option<RecoveredState>, StoreError>;

    /// Get or create a channel. Enforces `max_channels` on creation.
    fn create_channel(&self, name: &str) -> Result<ChannelStores, StoreError>;

    fn add_client(&self, client: &ClientInfo) -> Result<(), StoreError>;

    fn delete_client(&self, client_id: &str) -> Result<(), StoreError>;

    fn set_limits(&self, limits: &StoreLimits) -> Result<(), StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}

pub trait MessageStore: Send + Sync {
    /// Append a message: assigns the next sequence, stamps the wall clock,
    /// applies count/byte caps and the age limit, persists atomically.
    fn store(&self, data: Bytes) -> Result<u64, StoreError>;

    /// Fetch by sequence. Returns `None` for unknown sequences and for
    /// messages whose expiration has passed, whether or not the sweeper has
    /// deleted them yet.
    fn lookup(&self, seq: u64) -> Result<Option<Message>, StoreError>;

    fn first_seq(&self) -> u64;

    fn last_seq(&self) -> u64;

    fn first_msg(&self) -> Result<Option<Message>, StoreError>;

    fn last_msg(&self) -> Result<Option<Message>, StoreError>;

    /// Smallest sequence with `timestamp_ns >= ts_ns`, or `last_seq + 1`
    /// if no stored message is that new.
    fn seq_for_timestamp(&self, ts_ns: u64) -> Result<u64, StoreError>;

    /// Delete everything with `expiration_ns <= now_ns`; returns the next
    /// expiration deadline among the remaining messages, if any.
    fn expire(&self, now_ns: u64) -> Result<Option<u64>, StoreError>;

    fn flush(&self) -> Result<(), StoreError>;
}

pub trait SubStore: Send + Sync {
    /// Persist a new subscription, assigning `sub_id` if zero. Enforces
    /// `max_subscriptions` (channel overrides included). Sub ids are never
    /// reused, deleted rows included.
    fn create_sub(&self, state: &mut SubState) -> Result<(), StoreError>;

    fn update_sub(&self, state: &SubState) -> Result<(), StoreError>;

    /// Soft delete: the row is marked deleted so its id stays reserved, and
    /// the sub's remaining pending rows are cleared, atomically.
    fn delete_sub(&self, sub_id: u64) -> Result<(), StoreError>;

    fn add_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError>;

    fn ack_seq_pending(&self, sub_id: u64, seq: u64) -> Result<(), StoreError>;

    fn flush(&self) -> Result<(), StoreError>;
}
