//! Delivery semantics: basic pub/sub, start positions, redelivery timing,
//! queue-group distribution.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tempfile::TempDir;

use common::{connect, fast_opts, file_server, manual_ack, subscribe};
use relaymq::{InMemoryTransport, StartPosition, StoreLimits, SubscriptionConfig};

const RECV: Duration = Duration::from_secs(2);

#[test]
fn new_only_subscriber_gets_first_publish() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let server = file_server(dir.path(), &transport, StoreLimits::default());
    connect(&server, &transport, "me");

    let sub = subscribe(
        &server,
        &transport,
        "me",
        "foo",
        SubscriptionConfig::default(),
    );
    assert_eq!(server.publish("foo", Bytes::from_static(b"hello")).unwrap(), 1);

    let msg = sub.recv_expected(RECV);
    assert_eq!(msg.seq, 1);
    assert_eq!(msg.data.as_ref(), b"hello");
    assert_eq!(msg.channel, "foo");
    assert!(!msg.redelivered);
    server.shutdown();
}

#[test]
fn start_positions_resolve_against_existing_messages() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let server = file_server(dir.path(), &transport, StoreLimits::default());
    connect(&server, &transport, "me");

    for payload in [b"a" as &[u8], b"b", b"c"] {
        server.publish("foo", Bytes::copy_from_slice(payload)).unwrap();
    }

    let all = subscribe(
        &server,
        &transport,
        "me",
        "foo",
        SubscriptionConfig {
            start: StartPosition::AllAvailable,
            ..SubscriptionConfig::default()
        },
    );
    for expected in 1..=3u64 {
        assert_eq!(all.recv_expected(RECV).seq, expected);
    }

    let last = subscribe(
        &server,
        &transport,
        "me",
        "foo",
        SubscriptionConfig {
            start: StartPosition::LastReceived,
            ..SubscriptionConfig::default()
        },
    );
    assert_eq!(last.recv_expected(RECV).seq, 3);
    last.expect_silence(Duration::from_millis(100));

    let from_two = subscribe(
        &server,
        &transport,
        "me",
        "foo",
        SubscriptionConfig {
            start: StartPosition::SequenceStart { seq: 2 },
            ..SubscriptionConfig::default()
        },
    );
    assert_eq!(from_two.recv_expected(RECV).seq, 2);
    assert_eq!(from_two.recv_expected(RECV).seq, 3);

    let recent = subscribe(
        &server,
        &transport,
        "me",
        "foo",
        SubscriptionConfig {
            start: StartPosition::TimeDeltaStart {
                delta_ns: Duration::from_secs(60).as_nanos() as u64,
            },
            ..SubscriptionConfig::default()
        },
    );
    assert_eq!(recent.recv_expected(RECV).seq, 1);
    server.shutdown();
}

#[test]
fn sequence_start_beyond_next_is_rejected() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let server = file_server(dir.path(), &transport, StoreLimits::default());
    connect(&server, &transport, "me");
    server.publish("foo", Bytes::from_static(b"a")).unwrap();

    let inbox_rx = transport.subscribe("_INBOX.oob");
    let err = server
        .subscribe(relaymq::SubscribeRequest {
            client_id: "me".to_string(),
            channel: "foo".to_string(),
            inbox: "_INBOX.oob".to_string(),
            config: SubscriptionConfig {
                start: StartPosition::SequenceStart { seq: 5 },
                ..SubscriptionConfig::default()
            },
        })
        .unwrap_err();
    assert!(matches!(
        err,
        relaymq::server::BrokerError::StartSequenceOutOfRange { seq: 5, last: 1 }
    ));
    drop(inbox_rx);
    server.shutdown();
}

#[test]
fn unacked_messages_are_redelivered_until_acked() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let server = file_server(dir.path(), &transport, StoreLimits::default());
    connect(&server, &transport, "me");

    let ack_wait = Duration::from_millis(200);
    let sub = subscribe(
        &server,
        &transport,
        "me",
        "foo",
        manual_ack(StartPosition::NewOnly, ack_wait),
    );

    let t0 = Instant::now();
    server.publish("foo", Bytes::from_static(b"m1")).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    server.publish("foo", Bytes::from_static(b"m2")).unwrap();

    let first = sub.recv_expected(RECV);
    let second = sub.recv_expected(RECV);
    assert_eq!((first.seq, second.seq), (1, 2));
    assert!(!first.redelivered && !second.redelivered);

    // Both come around again once their ack wait elapses.
    let mut redelivered = BTreeSet::new();
    while redelivered.len() < 2 {
        let msg = sub.recv_expected(RECV);
        assert!(msg.redelivered, "expected a redelivery, got seq {}", msg.seq);
        assert!(msg.redelivery_count >= 1);
        assert!(
            t0.elapsed() >= ack_wait,
            "redelivered before the ack wait elapsed"
        );
        redelivered.insert(msg.seq);
    }
    assert_eq!(redelivered, BTreeSet::from([1, 2]));

    sub.ack(&server, 1);
    sub.ack(&server, 2);
    // Drain anything already in flight, then expect quiet.
    while sub.recv(Duration::from_millis(300)).is_some() {}
    sub.expect_silence(Duration::from_millis(500));
    server.shutdown();
}

#[test]
fn stalled_subscription_resumes_after_ack() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let server = file_server(dir.path(), &transport, StoreLimits::default());
    connect(&server, &transport, "me");

    let sub = subscribe(
        &server,
        &transport,
        "me",
        "foo",
        SubscriptionConfig {
            manual_ack: true,
            ack_wait_ns: Some(Duration::from_secs(30).as_nanos() as u64),
            max_in_flight: Some(2),
            ..SubscriptionConfig::default()
        },
    );
    for i in 0..4 {
        server
            .publish("foo", Bytes::from(format!("m{i}")))
            .unwrap();
    }

    assert_eq!(sub.recv_expected(RECV).seq, 1);
    assert_eq!(sub.recv_expected(RECV).seq, 2);
    // Window full: nothing else arrives.
    sub.expect_silence(Duration::from_millis(200));

    sub.ack(&server, 1);
    assert_eq!(sub.recv_expected(RECV).seq, 3);
    sub.expect_silence(Duration::from_millis(200));

    sub.ack(&server, 2);
    sub.ack(&server, 3);
    assert_eq!(sub.recv_expected(RECV).seq, 4);
    server.shutdown();
}

#[test]
fn queue_group_splits_the_stream_disjointly() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let server = file_server(dir.path(), &transport, StoreLimits::default());
    connect(&server, &transport, "me");

    let group = SubscriptionConfig {
        queue_group: Some("g".to_string()),
        ..SubscriptionConfig::default()
    };
    let first = subscribe(&server, &transport, "me", "bar", group.clone());
    let second = subscribe(&server, &transport, "me", "bar", group);

    const N: u64 = 100;
    for i in 0..N {
        server.publish("bar", Bytes::from(format!("m{i}"))).unwrap();
    }

    let mut seen_first = Vec::new();
    let mut seen_second = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while (seen_first.len() + seen_second.len()) < N as usize && Instant::now() < deadline {
        if let Some(msg) = first.recv(Duration::from_millis(20)) {
            seen_first.push(msg.seq);
        }
        if let Some(msg) = second.recv(Duration::from_millis(20)) {
            seen_second.push(msg.seq);
        }
    }

    assert!(!seen_first.is_empty() && !seen_second.is_empty());
    // Ascending within each member.
    assert!(seen_first.windows(2).all(|w| w[0] < w[1]));
    assert!(seen_second.windows(2).all(|w| w[0] < w[1]));
    // Disjoint union of 1..=N.
    let union: BTreeSet<u64> = seen_first.iter().chain(seen_second.iter()).copied().collect();
    assert_eq!(seen_first.len() + seen_second.len(), N as usize);
    assert_eq!(union, (1..=N).collect::<BTreeSet<u64>>());
    server.shutdown();
}

#[test]
fn publish_rejects_wildcard_subjects() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let server = file_server(dir.path(), &transport, StoreLimits::default());

    for bad in ["", "foo.*", "foo.>", "no space", "a..b"] {
        let err = server.publish(bad, Bytes::from_static(b"x")).unwrap_err();
        assert!(
            matches!(err, relaymq::server::BrokerError::InvalidSubject { .. }),
            "{bad}"
        );
    }
    server.shutdown();
}

#[test]
fn channel_limit_applies_to_new_channels() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let mut limits = StoreLimits::default();
    limits.max_channels = 1;
    let server = file_server(dir.path(), &transport, limits);

    server.publish("one", Bytes::from_static(b"x")).unwrap();
    let err = server.publish("two", Bytes::from_static(b"x")).unwrap_err();
    assert!(matches!(
        err,
        relaymq::server::BrokerError::Store(relaymq::store::StoreError::ChannelLimitReached {
            max: 1
        })
    ));
    server.shutdown();
}

#[test]
fn opts_default_uses_config_defaults() {
    let opts = fast_opts();
    assert!(opts.hb_interval < Duration::from_secs(1));
    let defaults = relaymq::ServerOpts::default();
    assert_eq!(defaults.cluster_id, "relaymq");
}
