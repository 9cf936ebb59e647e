#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod server;
pub mod store;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types the RPC layer needs at crate root.
pub use crate::core::{
    validate_channel_name, validate_client_id, AckProto, ChannelLimits, ClientInfo,
    ConnectRequest, ConnectResponse, Message, MsgProto, ServerInfo, StartPosition, StoreLimits,
    SubscribeRequest, SubscribeResponse, SubscriptionConfig, UnsubscribeRequest,
};
pub use crate::server::{InMemoryTransport, Server, ServerOpts, Transport};
pub use crate::store::{file::FileStore, sql::SqlStore, Store};
