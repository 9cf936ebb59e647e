//! Crash recovery: an ungraceful kill followed by a restart over the same
//! data directory must bring back clients, channels, subscriptions, and
//! pending sets.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use common::{connect, file_server, sql_server, subscribe};
use relaymq::{InMemoryTransport, StartPosition, StoreLimits, SubscriptionConfig};

const RECV: Duration = Duration::from_secs(2);

#[test]
fn file_store_recovers_subscriptions_after_ungraceful_kill() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());

    let server = file_server(dir.path(), &transport, StoreLimits::default());
    connect(&server, &transport, "me");

    let mut plain = subscribe(
        &server,
        &transport,
        "me",
        "work",
        SubscriptionConfig::default(),
    );
    let mut durable = subscribe(
        &server,
        &transport,
        "me",
        "work",
        SubscriptionConfig {
            durable_name: Some("dur".to_string()),
            ..SubscriptionConfig::default()
        },
    );
    let queue_config = SubscriptionConfig {
        queue_group: Some("g".to_string()),
        ..SubscriptionConfig::default()
    };
    let mut q1 = subscribe(&server, &transport, "me", "work", queue_config.clone());
    let mut q2 = subscribe(&server, &transport, "me", "work", queue_config);

    for i in 0..6u64 {
        server.publish("work", Bytes::from(format!("m{i}"))).unwrap();
    }
    // Everything is auto-ack: drain the first round of deliveries.
    for expected in 1..=6u64 {
        assert_eq!(plain.recv_expected(RECV).seq, expected);
        assert_eq!(durable.recv_expected(RECV).seq, expected);
    }
    let mut queue_total = 0;
    let drain_deadline = std::time::Instant::now() + Duration::from_secs(5);
    while queue_total < 6 && std::time::Instant::now() < drain_deadline {
        if q1.recv(Duration::from_millis(50)).is_some() {
            queue_total += 1;
        }
        if q2.recv(Duration::from_millis(50)).is_some() {
            queue_total += 1;
        }
    }
    assert_eq!(queue_total, 6);

    // Kill without shutdown: no flush hooks, no store close. The restarted
    // broker gets its own transport so nothing leaks over from the old
    // instance's still-forgotten threads.
    std::mem::forget(server);
    let transport = Arc::new(InMemoryTransport::new());
    for sub in [&mut plain, &mut durable, &mut q1, &mut q2] {
        sub.rebind(&transport);
    }

    let restarted = file_server(dir.path(), &transport, StoreLimits::default());

    // Surviving subscriptions get exactly one copy of a new publish, and
    // none of it is a redelivery.
    restarted
        .publish("work", Bytes::from_static(b"after"))
        .unwrap();

    let plain_msg = plain.recv_expected(RECV);
    assert_eq!(plain_msg.seq, 7);
    assert!(!plain_msg.redelivered);
    plain.expect_silence(Duration::from_millis(200));

    let durable_msg = durable.recv_expected(RECV);
    assert_eq!(durable_msg.seq, 7);
    assert!(!durable_msg.redelivered);
    durable.expect_silence(Duration::from_millis(200));

    let queue_hits: Vec<_> = [
        q1.recv(Duration::from_millis(500)),
        q2.recv(Duration::from_millis(500)),
    ]
    .into_iter()
    .flatten()
    .collect();
    assert_eq!(queue_hits.len(), 1, "queue message must go to exactly one member");
    assert_eq!(queue_hits[0].seq, 7);
    assert!(!queue_hits[0].redelivered);
    q1.expect_silence(Duration::from_millis(200));
    q2.expect_silence(Duration::from_millis(200));

    restarted.shutdown();
}

#[test]
fn pending_acks_survive_restart_and_redeliver() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());

    let server = file_server(dir.path(), &transport, StoreLimits::default());
    connect(&server, &transport, "me");
    let mut sub = subscribe(
        &server,
        &transport,
        "me",
        "foo",
        SubscriptionConfig {
            manual_ack: true,
            ack_wait_ns: Some(Duration::from_millis(200).as_nanos() as u64),
            ..SubscriptionConfig::default()
        },
    );
    server.publish("foo", Bytes::from_static(b"keep")).unwrap();
    assert_eq!(sub.recv_expected(RECV).seq, 1);

    std::mem::forget(server);
    let transport = Arc::new(InMemoryTransport::new());
    sub.rebind(&transport);

    let restarted = file_server(dir.path(), &transport, StoreLimits::default());
    // The unacked message comes back as a redelivery once the (restarted)
    // ack wait elapses.
    let again = sub.recv_expected(RECV);
    assert_eq!(again.seq, 1);
    assert!(again.redelivered);
    sub.ack(&restarted, 1);
    restarted.shutdown();
}

#[test]
fn durable_resumes_after_crash_and_reconnect() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());

    let server = file_server(dir.path(), &transport, StoreLimits::default());
    connect(&server, &transport, "me");
    let durable_config = SubscriptionConfig {
        durable_name: Some("dur".to_string()),
        manual_ack: true,
        ack_wait_ns: Some(Duration::from_secs(30).as_nanos() as u64),
        ..SubscriptionConfig::default()
    };
    let sub = subscribe(&server, &transport, "me", "foo", durable_config.clone());
    server.publish("foo", Bytes::from_static(b"msg1")).unwrap();
    assert_eq!(sub.recv_expected(RECV).seq, 1);
    sub.ack(&server, 1);

    std::mem::forget(server);
    let transport = Arc::new(InMemoryTransport::new());

    // The client outlived the crash and reconnects under its recovered id;
    // the durable must take the resume path, not report a duplicate.
    let restarted = file_server(dir.path(), &transport, StoreLimits::default());
    connect(&restarted, &transport, "me");
    let resumed = subscribe(&restarted, &transport, "me", "foo", durable_config);

    restarted
        .publish("foo", Bytes::from_static(b"msg2"))
        .unwrap();
    let msg = resumed.recv_expected(RECV);
    assert_eq!(msg.seq, 2);
    assert!(!msg.redelivered);
    // The acked message stays acked across the crash and the reconnect.
    resumed.expect_silence(Duration::from_millis(200));
    restarted.shutdown();
}

#[test]
fn cluster_id_mismatch_refuses_to_start() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let server = file_server(dir.path(), &transport, StoreLimits::default());
    server.shutdown();

    let store = Arc::new(
        relaymq::FileStore::open(dir.path(), StoreLimits::default(), 1024 * 1024).unwrap(),
    );
    let mut opts = common::fast_opts();
    opts.cluster_id = "other".to_string();
    let transport2: Arc<InMemoryTransport> = Arc::clone(&transport);
    let err = relaymq::Server::start(opts, store, transport2).unwrap_err();
    assert!(matches!(
        err,
        relaymq::server::BrokerError::Store(relaymq::store::StoreError::ClusterIdMismatch { .. })
    ));
}

#[test]
fn sql_store_round_trips_a_full_workload() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("broker.sqlite");
    let transport = Arc::new(InMemoryTransport::new());

    let server = sql_server(&db, &transport, StoreLimits::default());
    connect(&server, &transport, "me");
    let durable = subscribe(
        &server,
        &transport,
        "me",
        "events",
        SubscriptionConfig {
            durable_name: Some("d".to_string()),
            start: StartPosition::AllAvailable,
            ..SubscriptionConfig::default()
        },
    );
    for i in 0..3u64 {
        server
            .publish("events", Bytes::from(format!("e{i}")))
            .unwrap();
    }
    for expected in 1..=3u64 {
        assert_eq!(durable.recv_expected(RECV).seq, expected);
    }
    server.shutdown();

    let restarted = sql_server(&db, &transport, StoreLimits::default());
    restarted
        .publish("events", Bytes::from_static(b"e3"))
        .unwrap();
    let msg = durable.recv_expected(RECV);
    assert_eq!(msg.seq, 4);
    assert!(!msg.redelivered);
    restarted.shutdown();
}
