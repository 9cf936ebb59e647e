//! Age-based expiration: swept messages disappear from delivery and from
//! lookup, and the channel's sequence counter never rewinds.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use common::{connect, file_server, subscribe};
use relaymq::{InMemoryTransport, StartPosition, StoreLimits, SubscriptionConfig};

const RECV: Duration = Duration::from_secs(2);

fn aging_limits(max_age: Duration) -> StoreLimits {
    let mut limits = StoreLimits::default();
    limits.channel.max_age_ns = max_age.as_nanos() as i64;
    limits
}

#[test]
fn expired_messages_are_not_delivered_to_late_subscribers() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let server = file_server(
        dir.path(),
        &transport,
        aging_limits(Duration::from_millis(100)),
    );
    connect(&server, &transport, "me");

    server.publish("feed", Bytes::from_static(b"stale")).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let sub = subscribe(
        &server,
        &transport,
        "me",
        "feed",
        SubscriptionConfig {
            start: StartPosition::AllAvailable,
            ..SubscriptionConfig::default()
        },
    );
    sub.expect_silence(Duration::from_millis(300));

    // New traffic keeps the original numbering.
    server.publish("feed", Bytes::from_static(b"fresh")).unwrap();
    let msg = sub.recv_expected(RECV);
    assert_eq!(msg.seq, 2);
    assert_eq!(msg.data.as_ref(), b"fresh");
    server.shutdown();
}

#[test]
fn sweeper_keeps_running_as_messages_age_out() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let server = file_server(
        dir.path(),
        &transport,
        aging_limits(Duration::from_millis(80)),
    );
    connect(&server, &transport, "me");

    server.publish("feed", Bytes::from_static(b"a")).unwrap();
    std::thread::sleep(Duration::from_millis(40));
    server.publish("feed", Bytes::from_static(b"b")).unwrap();
    // After both age out, a catch-up subscriber sees nothing at all.
    std::thread::sleep(Duration::from_millis(250));

    let sub = subscribe(
        &server,
        &transport,
        "me",
        "feed",
        SubscriptionConfig {
            start: StartPosition::AllAvailable,
            ..SubscriptionConfig::default()
        },
    );
    sub.expect_silence(Duration::from_millis(200));
    server.shutdown();
}

#[test]
fn per_channel_override_shortens_the_age_limit() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    let mut limits = StoreLimits::default();
    limits.overrides.insert(
        "ephemeral".to_string(),
        relaymq::ChannelLimits {
            max_age_ns: Duration::from_millis(80).as_nanos() as i64,
            ..relaymq::ChannelLimits::default()
        },
    );
    let server = file_server(dir.path(), &transport, limits);
    connect(&server, &transport, "me");

    server
        .publish("ephemeral", Bytes::from_static(b"short"))
        .unwrap();
    server.publish("lasting", Bytes::from_static(b"long")).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let gone = subscribe(
        &server,
        &transport,
        "me",
        "ephemeral",
        SubscriptionConfig {
            start: StartPosition::AllAvailable,
            ..SubscriptionConfig::default()
        },
    );
    gone.expect_silence(Duration::from_millis(200));

    let kept = subscribe(
        &server,
        &transport,
        "me",
        "lasting",
        SubscriptionConfig {
            start: StartPosition::AllAvailable,
            ..SubscriptionConfig::default()
        },
    );
    assert_eq!(kept.recv_expected(RECV).seq, 1);
    server.shutdown();
}
