//! End-to-end tests: a host and a guest bridge talking over real transports.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tether_bridge::{
    Bridge, BridgeConfig, BridgeError, BridgeStatus, ErrorBody, MethodRegistry, SessionId,
    parse_arg,
};
use tether_channel::{DebugChannel, DebugLogger, Realm, RealmChannel, StreamChannel};
use tether_core::Envelope;
use tether_core::errors::PANIC;

const HOST_ORIGIN: &str = "https://host.example";
const GUEST_ORIGIN: &str = "https://guest.example";

fn host_methods() -> MethodRegistry {
    MethodRegistry::new()
        .with_fn("add", |args| {
            let a: i64 = parse_arg(&args, 0)?;
            let b: i64 = parse_arg(&args, 1)?;
            Ok(json!(a + b))
        })
        .with_fn("fail", |_| Err(ErrorBody::message("boom")))
        .with_fn("explode", |_| panic!("host method blew up"))
        .with_async("slow", |_| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(json!("late"))
        })
        .with_async("hang", |_| async {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        })
}

struct Pair {
    host: Bridge,
    guest: Bridge,
    host_realm: Realm,
    guest_realm: Realm,
}

fn realm_pair(host_config: BridgeConfig, guest_config: BridgeConfig) -> Pair {
    let host_realm = Realm::new(HOST_ORIGIN);
    let guest_realm = Realm::new(GUEST_ORIGIN);
    let host_channel = RealmChannel::new(host_realm.clone(), guest_realm.clone())
        .with_expected_origin(GUEST_ORIGIN);
    let guest_channel = RealmChannel::new(guest_realm.clone(), host_realm.clone())
        .with_expected_origin(HOST_ORIGIN);
    Pair {
        host: Bridge::host(host_channel, host_config, host_methods()),
        guest: Bridge::guest(guest_channel, guest_config, MethodRegistry::new()),
        host_realm,
        guest_realm,
    }
}

fn fast_config() -> BridgeConfig {
    BridgeConfig::default().with_handshake_interval(Duration::from_millis(10))
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

async fn connect(pair: &Pair) {
    let (host, guest) = tokio::join!(pair.host.connect(), pair.guest.connect());
    assert_eq!(host, Ok(()));
    assert_eq!(guest, Ok(()));
}

fn recorder(bridge: &Bridge, event: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _ = bridge.listen(event, move |payload| s.lock().push(payload.clone()));
    seen
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ── Handshake ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn both_sides_connect() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;

    assert!(pair.host.is_connected());
    assert!(pair.guest.is_connected());
    assert_eq!(pair.host.session_id(), pair.guest.session_id());
    assert_eq!(pair.guest.session_id(), SessionId::new(1));
}

#[tokio::test]
async fn guest_may_connect_before_host_listens() {
    let pair = realm_pair(fast_config(), fast_config());
    let guest = pair.guest.connect();
    settle().await;
    assert_eq!(pair.guest.status(), BridgeStatus::Connecting);

    let host = pair.host.connect();
    assert_eq!(within(guest).await, Ok(()));
    assert_eq!(within(host).await, Ok(()));
}

#[tokio::test]
async fn wrong_origin_never_connects() {
    let host_realm = Realm::new(HOST_ORIGIN);
    let guest_realm = Realm::new(GUEST_ORIGIN);
    let host_channel = RealmChannel::new(host_realm.clone(), guest_realm.clone())
        .with_expected_origin("https://someone-else.example");
    let guest_channel = RealmChannel::new(guest_realm, host_realm);
    let host = Bridge::host(host_channel, fast_config(), MethodRegistry::new());
    let guest = Bridge::guest(
        guest_channel,
        fast_config().with_handshake_max_attempts(Some(5)),
        MethodRegistry::new(),
    );

    let _host_waiting = host.connect();
    let outcome = within(guest.connect()).await;
    assert_eq!(outcome, Err(BridgeError::HandshakeExhausted { attempts: 5 }));
    assert_eq!(host.status(), BridgeStatus::Connecting);
    assert_eq!(guest.status(), BridgeStatus::Idle);
}

#[tokio::test]
async fn foreign_traffic_is_ignored() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;
    let ticks = recorder(&pair.guest, "tick");

    for junk in [json!("hello"), json!({"action": "event"}), json!({"type": "@bridge"})] {
        let _ = pair
            .guest_realm
            .post_message(junk, &pair.host_realm, GUEST_ORIGIN)
            .unwrap();
    }
    pair.host.broadcast("tick", json!(1)).unwrap();
    settle().await;

    assert_eq!(*ticks.lock(), vec![json!(1)]);
    assert!(pair.guest.is_connected());
}

// ── Calls ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn call_returns_remote_value() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;

    let sum = within(pair.guest.call("add", vec![json!(2), json!(3)])).await;
    assert_eq!(sum, Ok(json!(5)));

    let typed: i64 = within(pair.guest.call_as("add", vec![json!(-4), json!(1)]))
        .await
        .unwrap();
    assert_eq!(typed, -3);
    assert_eq!(pair.guest.pending_calls(), 0);
}

#[tokio::test]
async fn remote_error_carries_message() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;

    let err = within(pair.guest.call("fail", vec![])).await.unwrap_err();
    assert_matches!(&err, BridgeError::Remote { message, .. } if message == "boom");
    assert!(err.to_string().contains("boom"));
}

#[tokio::test]
async fn remote_panic_is_answered() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;

    let err = within(pair.guest.call("explode", vec![])).await.unwrap_err();
    assert_matches!(err, BridgeError::Remote { name, message } if name == PANIC && message.contains("blew up"));

    // The host keeps serving after a panic.
    let sum = within(pair.guest.call("add", vec![json!(1), json!(1)])).await;
    assert_eq!(sum, Ok(json!(2)));
}

#[tokio::test]
async fn unknown_method_is_reported() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;

    let err = within(pair.guest.call("missing", vec![])).await.unwrap_err();
    assert_matches!(err, BridgeError::UnknownMethod { method } if method == "missing");
}

#[tokio::test]
async fn bad_arguments_are_reported() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;

    let err = within(pair.guest.call("add", vec![json!("two")])).await.unwrap_err();
    assert_matches!(err, BridgeError::Remote { name, .. } if name == "TypeError");
}

#[tokio::test]
async fn call_times_out_and_late_answer_is_dropped() {
    let pair = realm_pair(
        fast_config(),
        fast_config().with_call_timeout(Duration::from_millis(50)),
    );
    within(connect(&pair)).await;

    let err = within(pair.guest.call("slow", vec![])).await.unwrap_err();
    assert_matches!(err, BridgeError::CallTimeout { method, timeout_ms: 50 } if method == "slow");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pair.guest.pending_calls(), 0);
    assert!(pair.guest.is_connected());
}

#[tokio::test]
async fn close_rejects_in_flight_calls() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;

    let call = pair.guest.call("hang", vec![]);
    settle().await;
    assert_eq!(pair.guest.pending_calls(), 1);

    pair.guest.close();
    assert_eq!(within(call).await, Err(BridgeError::Closed));
    assert_eq!(pair.guest.status(), BridgeStatus::Idle);
}

#[tokio::test]
async fn enforced_bridge_refuses_calls_before_connect() {
    let pair = realm_pair(fast_config(), fast_config().with_enforce_connected(true));

    let err = within(pair.guest.call("add", vec![json!(1), json!(2)])).await.unwrap_err();
    assert_matches!(
        err,
        BridgeError::InvalidState { expected: BridgeStatus::Connected, actual: BridgeStatus::Idle }
    );

    within(connect(&pair)).await;
    let sum = within(pair.guest.call("add", vec![json!(1), json!(2)])).await;
    assert_eq!(sum, Ok(json!(3)));
}

// ── Events ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_reaches_current_listeners_only() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;

    let early = recorder(&pair.guest, "status");
    pair.host.broadcast("status", json!({"ready": true, "items": [1, 2]})).unwrap();
    settle().await;
    let late = recorder(&pair.guest, "status");
    settle().await;

    assert_eq!(*early.lock(), vec![json!({"ready": true, "items": [1, 2]})]);
    assert!(late.lock().is_empty());
}

#[tokio::test]
async fn once_resolves_with_next_payload() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;

    let next = pair.host.once("progress");
    pair.guest.broadcast("progress", json!(0.5)).unwrap();
    pair.guest.broadcast("progress", json!(1.0)).unwrap();

    assert_eq!(within(next).await, Some(json!(0.5)));
    assert_eq!(pair.host.listener_count("progress"), 0);
}

#[tokio::test]
async fn off_stops_delivery() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;

    let seen = Arc::new(Mutex::new(0));
    let s = Arc::clone(&seen);
    let listener = pair.guest.listen("ping", move |_| *s.lock() += 1);
    pair.host.broadcast("ping", Value::Null).unwrap();
    settle().await;
    assert!(pair.guest.off("ping", &listener));
    pair.host.broadcast("ping", Value::Null).unwrap();
    settle().await;

    assert_eq!(*seen.lock(), 1);
}

// ── Reconnect ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn reconnect_uses_new_session_and_drops_stale_traffic() {
    let pair = realm_pair(fast_config(), fast_config());
    within(connect(&pair)).await;
    let first = pair.guest.session_id();

    pair.guest.close();
    assert_eq!(within(pair.guest.connect()).await, Ok(()));
    let second = pair.guest.session_id();
    assert!(second > first);
    settle().await;
    assert!(pair.host.is_connected());
    assert_eq!(pair.host.session_id(), second);

    let ticks = recorder(&pair.guest, "tick");
    let stale = Envelope::event(first, "tick", json!("stale")).to_value().unwrap();
    let _ = pair
        .guest_realm
        .post_message(stale, &pair.host_realm, GUEST_ORIGIN)
        .unwrap();
    pair.host.broadcast("tick", json!("fresh")).unwrap();
    settle().await;

    assert_eq!(*ticks.lock(), vec![json!("fresh")]);
}

// ── Other transports ───────────────────────────────────────────────────────

#[tokio::test]
async fn bridge_over_byte_stream() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let host = Bridge::host(StreamChannel::connect(a), fast_config(), host_methods());
    let guest = Bridge::guest(StreamChannel::connect(b), fast_config(), MethodRegistry::new());

    let (h, g) = within(async { tokio::join!(host.connect(), guest.connect()) }).await;
    assert_eq!((h, g), (Ok(()), Ok(())));

    let sum = within(guest.call("add", vec![json!(40), json!(2)])).await;
    assert_eq!(sum, Ok(json!(42)));
}

#[tokio::test]
async fn debug_channel_logs_both_directions() {
    let lines: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
    let l = Arc::clone(&lines);
    let logger: DebugLogger = Arc::new(move |direction: &str, message: &Value| {
        let action = message["action"].as_str().unwrap_or_default().to_owned();
        l.lock().push((direction.to_owned(), action));
    });

    let host_realm = Realm::new(HOST_ORIGIN);
    let guest_realm = Realm::new(GUEST_ORIGIN);
    let host = Bridge::host(
        RealmChannel::new(host_realm.clone(), guest_realm.clone()),
        fast_config(),
        host_methods(),
    );
    let guest = Bridge::guest(
        DebugChannel::with_logger(RealmChannel::new(guest_realm, host_realm), logger),
        fast_config(),
        MethodRegistry::new(),
    );

    let (h, g) = within(async { tokio::join!(host.connect(), guest.connect()) }).await;
    assert_eq!((h, g), (Ok(()), Ok(())));

    let lines = lines.lock();
    let has = |direction: &str, action: &str| {
        lines.iter().any(|(d, a)| d == direction && a == action)
    };
    assert!(has("outgoing message", "handshake-request"));
    assert!(has("incoming message", "handshake-response"));
    assert!(has("outgoing message", "handshake-ack"));
}
