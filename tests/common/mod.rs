//! Shared harness: a broker over the in-process transport with fast timers.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::Receiver;

use relaymq::{
    AckProto, ConnectRequest, FileStore, InMemoryTransport, MsgProto, Server, ServerOpts,
    SqlStore, StoreLimits, SubscribeRequest, SubscriptionConfig,
};

pub fn fast_opts() -> ServerOpts {
    ServerOpts {
        cluster_id: "test".to_string(),
        hb_interval: Duration::from_millis(50),
        hb_timeout: Duration::from_millis(25),
        max_failed_hb: 2,
        dup_cid_timeout: Duration::from_millis(60),
        dup_max_cid_probes: 4,
        default_ack_wait: Duration::from_millis(200),
        default_max_in_flight: 1024,
        grace_shutdown: Duration::from_millis(1_000),
        expiration_error_backoff: Duration::from_millis(100),
    }
}

pub fn file_server(dir: &Path, transport: &Arc<InMemoryTransport>, limits: StoreLimits) -> Server {
    let store = Arc::new(FileStore::open(dir, limits, 1024 * 1024).unwrap());
    let transport: Arc<InMemoryTransport> = Arc::clone(transport);
    Server::start(fast_opts(), store, transport).unwrap()
}

pub fn sql_server(path: &Path, transport: &Arc<InMemoryTransport>, limits: StoreLimits) -> Server {
    let store = Arc::new(SqlStore::open(path, limits).unwrap());
    let transport: Arc<InMemoryTransport> = Arc::clone(transport);
    Server::start(fast_opts(), store, transport).unwrap()
}

/// Register a client whose heartbeat inbox answers probes.
pub fn connect(server: &Server, transport: &InMemoryTransport, client_id: &str) -> String {
    let hb_inbox = format!("_HB.{client_id}.{}", nonce());
    transport.respond_with(&hb_inbox, Bytes::new());
    server
        .client_connect(ConnectRequest {
            client_id: client_id.to_string(),
            heartbeat_inbox: hb_inbox.clone(),
        })
        .unwrap();
    hb_inbox
}

pub struct TestSub {
    pub inbox: String,
    pub ack_inbox: String,
    pub rx: Receiver<Bytes>,
}

pub fn subscribe(
    server: &Server,
    transport: &InMemoryTransport,
    client_id: &str,
    channel: &str,
    config: SubscriptionConfig,
) -> TestSub {
    let inbox = format!("_INBOX.{}", nonce());
    let rx = transport.subscribe(&inbox);
    let resp = server
        .subscribe(SubscribeRequest {
            client_id: client_id.to_string(),
            channel: channel.to_string(),
            inbox: inbox.clone(),
            config,
        })
        .unwrap();
    TestSub {
        inbox,
        ack_inbox: resp.ack_inbox,
        rx,
    }
}

impl TestSub {
    /// Re-register this inbox on a fresh transport, as a client outliving a
    /// broker restart would.
    pub fn rebind(&mut self, transport: &InMemoryTransport) {
        self.rx = transport.subscribe(&self.inbox);
    }

    pub fn recv(&self, timeout: Duration) -> Option<MsgProto> {
        self.rx
            .recv_timeout(timeout)
            .ok()
            .map(|bytes| serde_json::from_slice(&bytes).unwrap())
    }

    pub fn recv_expected(&self, timeout: Duration) -> MsgProto {
        self.recv(timeout).expect("expected a delivery")
    }

    pub fn expect_silence(&self, window: Duration) {
        if let Some(msg) = self.recv(window) {
            panic!("unexpected delivery: seq {} on {}", msg.seq, msg.channel);
        }
    }

    pub fn ack(&self, server: &Server, seq: u64) {
        server.ack(&self.ack_inbox, AckProto { seq }).unwrap();
    }
}

pub fn manual_ack(start: relaymq::StartPosition, ack_wait: Duration) -> SubscriptionConfig {
    SubscriptionConfig {
        manual_ack: true,
        ack_wait_ns: Some(ack_wait.as_nanos() as u64),
        start,
        ..SubscriptionConfig::default()
    }
}

fn nonce() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
