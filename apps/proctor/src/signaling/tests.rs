use super::*;
use crate::config::TransportConfigBuilder;
use crate::transport::mock::{MockDialer, MockPeer};
use crate::transport::{OutboundFrame, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL};
use proctor_wire::RawMessage;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

fn transport_with(builder: TransportConfigBuilder) -> (SignalingTransport, MockDialer) {
    let dialer = MockDialer::new();
    let config = builder.url("ws://127.0.0.1:8000/ws").build().unwrap();
    let transport = SignalingTransport::new(config, Arc::new(dialer.clone()));
    (transport, dialer)
}

fn transport() -> (SignalingTransport, MockDialer) {
    transport_with(TransportConfigBuilder::new())
}

fn primary(session: &str) -> ConnectParams {
    ConnectParams::session(EndpointPath::new(Role::Primary, "7", session, "9").unwrap())
}

fn secondary(session: &str) -> ConnectParams {
    ConnectParams::session(EndpointPath::new(Role::Secondary, "7", session, "9").unwrap())
}

async fn expect_close(peer: &mut MockPeer) -> u16 {
    loop {
        match peer.recv_frame().await {
            Some(OutboundFrame::Close { code, .. }) => return code,
            Some(OutboundFrame::Text(_)) => continue,
            None => panic!("socket dropped without a close frame"),
        }
    }
}

fn recorder(transport: &SignalingTransport) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    transport.on_message(move |message| sink.lock().push(message.kind().to_string()));
    seen
}

#[test]
fn endpoint_url_joins_segments_under_the_base() {
    let base = Url::parse("ws://127.0.0.1:8000/ws/?stale=1").unwrap();
    let url = primary("42").endpoint_url(&base).unwrap();
    assert_eq!(url.as_str(), "ws://127.0.0.1:8000/ws/primary/7/42/9");

    let url = ConnectParams::fixed("/status").endpoint_url(&base).unwrap();
    assert_eq!(url.as_str(), "ws://127.0.0.1:8000/ws/status");
}

#[test]
fn handshake_depends_on_role_and_credential() {
    assert_eq!(
        primary("42").handshake(),
        vec![SignalMessage::from(ControlMessage::StatusRequest)]
    );
    assert!(secondary("42").handshake().is_empty());
    assert!(ConnectParams::fixed("/status").handshake().is_empty());

    let token = PairingToken::from_string("abc");
    let frames = secondary("42")
        .with_credential(Credential {
            passcode: "1234".into(),
            pairing_token: Some(token.clone()),
        })
        .handshake();
    assert_eq!(
        frames,
        vec![SignalMessage::from(ControlMessage::Verify {
            passcode: "1234".into(),
            pairing_token: Some(token),
        })]
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_connect_with_same_params_dials_once() {
    let (transport, dialer) = transport();
    transport.connect(primary("42"));
    transport.connect(primary("42"));

    let peer = dialer.next_peer().await;
    assert_eq!(peer.url.path(), "/ws/primary/7/42/9");
    transport.wait_for(LinkState::Open).await;

    transport.connect(primary("42"));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(transport.state(), LinkState::Open);
}

#[tokio::test(start_paused = true)]
async fn new_params_supersede_the_running_socket() {
    let (transport, dialer) = transport();
    transport.connect(primary("42"));
    let mut first = dialer.next_peer().await;
    transport.wait_for(LinkState::Open).await;

    transport.connect(primary("43"));
    assert_eq!(expect_close(&mut first).await, CLOSE_NORMAL);

    let second = dialer.next_peer().await;
    assert_eq!(second.url.path(), "/ws/primary/7/43/9");
    transport.wait_for(LinkState::Open).await;
    assert_eq!(dialer.dial_count(), 2);
    assert_eq!(transport.params(), Some(primary("43")));
}

#[tokio::test(start_paused = true)]
async fn queued_messages_follow_the_handshake_in_order() {
    let (transport, dialer) = transport();
    transport.send(ControlMessage::StartMonitoring {
        task_id: Some("7".into()),
    });
    transport.send(RawMessage::new("answer").with_field("sdp", "v=0"));
    assert_eq!(transport.status().queued, 2);

    transport.connect(primary("42"));
    let mut peer = dialer.next_peer().await;

    let kinds = [
        peer.recv_non_heartbeat().await.unwrap(),
        peer.recv_non_heartbeat().await.unwrap(),
        peer.recv_non_heartbeat().await.unwrap(),
    ]
    .map(|message| message.kind().to_string());
    assert_eq!(kinds, ["status_request", "start_monitoring", "answer"]);

    transport.send(RawMessage::new("candidate"));
    assert_eq!(peer.recv_non_heartbeat().await.unwrap().kind(), "candidate");
    assert_eq!(transport.status().queued, 0);
}

#[tokio::test(start_paused = true)]
async fn silent_server_trips_the_watchdog_and_reconnects() {
    let (transport, dialer) = transport();
    transport.connect(secondary("42"));
    let mut peer = dialer.next_peer().await;
    let opened = Instant::now();

    for expected in [5, 10] {
        let beat = peer.recv_message().await.unwrap();
        assert_eq!(beat.kind(), "heartbeat");
        assert_eq!(opened.elapsed(), Duration::from_secs(expected));
    }

    assert_eq!(expect_close(&mut peer).await, CLOSE_HEARTBEAT_TIMEOUT);
    assert_eq!(opened.elapsed(), Duration::from_secs(15));

    let _again = dialer.next_peer().await;
    assert_eq!(opened.elapsed(), Duration::from_millis(15_500));
    assert_eq!(dialer.dial_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn inbound_traffic_keeps_the_link_alive() {
    let (transport, dialer) = transport();
    transport.connect(secondary("42"));
    let mut peer = dialer.next_peer().await;

    for _ in 0..6 {
        let beat = peer.recv_message().await.unwrap();
        assert_eq!(beat.kind(), "heartbeat");
        peer.send_json(json!({ "type": "heartbeat_ack" }));
    }
    assert_eq!(transport.state(), LinkState::Open);
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_dials_back_off_exponentially() {
    let (transport, dialer) = transport();
    dialer.fail_next(4);
    transport.connect(secondary("42"));

    let _peer = dialer.next_peer().await;
    let log = dialer.dial_log();
    assert_eq!(log.len(), 5);
    let gaps: Vec<Duration> = log.windows(2).map(|pair| pair[1].0 - pair[0].0).collect();
    assert_eq!(
        gaps,
        [500, 1_000, 2_000, 4_000].map(Duration::from_millis).to_vec()
    );

    transport.wait_for(LinkState::Open).await;
    assert_eq!(transport.status().attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_socket_reconnects_and_repeats_the_handshake() {
    let (transport, dialer) = transport();
    transport.connect(primary("42"));
    let mut first = dialer.next_peer().await;
    assert_eq!(first.recv_message().await.unwrap().kind(), "status_request");

    first.close(1006);
    let mut second = dialer.next_peer().await;
    assert_eq!(second.recv_message().await.unwrap().kind(), "status_request");
    assert_eq!(dialer.dial_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn attempt_limit_stops_reconnecting() {
    let (transport, dialer) = transport_with(TransportConfigBuilder::new().max_attempts(2));
    dialer.fail_next(10);
    transport.connect(secondary("42"));

    sleep(Duration::from_secs(30)).await;
    assert_eq!(dialer.dial_count(), 3);
    let status = transport.status();
    assert!(status.exhausted);
    assert_eq!(status.state, LinkState::Closed);
    assert_eq!(status.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn ping_is_answered_before_handlers_run() {
    let (transport, dialer) = transport();
    let first = recorder(&transport);
    let second = recorder(&transport);
    transport.connect(secondary("42"));
    let mut peer = dialer.next_peer().await;

    peer.send_json(json!({ "type": "ping", "timestamp": 1 }));
    let reply = peer.recv_message().await.unwrap();
    match reply.as_control() {
        Some(ControlMessage::Pong { timestamp }) => assert!(timestamp.is_some()),
        other => panic!("expected pong, got {other:?}"),
    }
    assert_eq!(*first.lock(), vec!["ping".to_string()]);
    assert_eq!(*second.lock(), vec!["ping".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn server_heartbeat_gets_an_ack() {
    let (transport, dialer) = transport();
    transport.connect(secondary("42"));
    let mut peer = dialer.next_peer().await;

    peer.send_json(json!({ "type": "heartbeat" }));
    assert_eq!(peer.recv_message().await.unwrap().kind(), "heartbeat_ack");
}

#[tokio::test(start_paused = true)]
async fn malformed_payloads_are_dropped() {
    let (transport, dialer) = transport();
    let seen = recorder(&transport);
    transport.connect(ConnectParams::fixed("/status"));
    let peer = dialer.next_peer().await;

    peer.send_text("not json");
    peer.send_text("[1, 2]");
    peer.send_json(json!({ "event_id": 3 }));
    peer.send_json(json!({ "type": "event_status", "event_id": 3, "status": 1 }));
    peer.send_json(json!({ "type": "offer", "sdp": "v=0" }));
    sleep(Duration::from_millis(10)).await;

    assert_eq!(*seen.lock(), vec!["event_status".to_string(), "offer".to_string()]);
    assert_eq!(transport.state(), LinkState::Open);
    assert!(transport.status().last_message_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn replaced_and_removed_handlers() {
    let (transport, dialer) = transport();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&hits);
    let id = transport.on_message(move |_| sink.lock().push("old"));
    transport.connect(secondary("42"));
    let peer = dialer.next_peer().await;

    peer.send_json(json!({ "type": "phone_status", "started": true }));
    sleep(Duration::from_millis(10)).await;

    let sink = Arc::clone(&hits);
    assert!(transport.replace_handler(id, move |_| sink.lock().push("new")));
    peer.send_json(json!({ "type": "phone_status", "started": false }));
    sleep(Duration::from_millis(10)).await;

    assert!(transport.remove_handler(id));
    assert!(!transport.remove_handler(id));
    peer.send_json(json!({ "type": "phone_status", "started": true }));
    sleep(Duration::from_millis(10)).await;

    assert_eq!(*hits.lock(), vec!["old", "new"]);
}

#[tokio::test(start_paused = true)]
async fn server_disconnect_is_terminal() {
    let (transport, dialer) = transport();
    let seen = recorder(&transport);
    transport.connect(secondary("42"));
    let mut peer = dialer.next_peer().await;

    peer.send_json(json!({ "type": "disconnect", "reason": "session ended" }));
    assert_eq!(expect_close(&mut peer).await, CLOSE_NORMAL);
    sleep(Duration::from_secs(60)).await;

    assert_eq!(*seen.lock(), vec!["disconnect".to_string()]);
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(transport.state(), LinkState::Closed);
}

#[tokio::test(start_paused = true)]
async fn close_is_final() {
    let (transport, dialer) = transport();
    transport.connect(secondary("42"));
    let mut peer = dialer.next_peer().await;
    transport.wait_for(LinkState::Open).await;

    transport.send(RawMessage::new("late"));
    transport.close();
    assert_eq!(transport.state(), LinkState::Closed);

    let mut texts = Vec::new();
    let code = loop {
        match peer.recv_frame().await {
            Some(OutboundFrame::Text(text)) => texts.push(text),
            Some(OutboundFrame::Close { code, .. }) => break code,
            None => panic!("socket dropped without a close frame"),
        }
    };
    assert_eq!(code, CLOSE_NORMAL);

    sleep(Duration::from_secs(60)).await;
    assert!(peer.recv_frame().await.is_none());
    assert_eq!(dialer.dial_count(), 1);
    let status = transport.status();
    assert!(status.manually_closed);
    assert_eq!(status.state, LinkState::Closed);
    assert_eq!(status.queued, 0);
}

#[tokio::test(start_paused = true)]
async fn sends_after_close_do_not_leak_into_the_next_session() {
    let (transport, dialer) = transport();
    transport.connect(secondary("42"));
    let mut peer = dialer.next_peer().await;
    transport.wait_for(LinkState::Open).await;
    transport.close();
    assert_eq!(expect_close(&mut peer).await, CLOSE_NORMAL);

    transport.send(RawMessage::new("stale"));
    assert_eq!(transport.status().queued, 0);

    transport.connect(secondary("43"));
    let mut peer = dialer.next_peer().await;
    transport.wait_for(LinkState::Open).await;
    transport.send(RawMessage::new("fresh"));
    let first = peer.recv_non_heartbeat().await.unwrap();
    assert_eq!(first.kind(), "fresh");
}

#[tokio::test(start_paused = true)]
async fn is_running_tracks_the_driver() {
    let (transport, dialer) = transport();
    assert!(!transport.is_running());
    transport.connect(secondary("42"));
    assert!(transport.is_running());

    let peer = dialer.next_peer().await;
    peer.send_json(json!({ "type": "disconnect" }));
    sleep(Duration::from_millis(10)).await;
    assert!(!transport.is_running());
    assert_eq!(transport.state(), LinkState::Closed);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_last_handle_closes_the_socket() {
    let (transport, dialer) = transport();
    transport.connect(secondary("42"));
    let mut peer = dialer.next_peer().await;
    let clone = transport.clone();

    drop(transport);
    sleep(Duration::from_millis(10)).await;
    assert!(peer.try_recv_frame().is_none());

    drop(clone);
    assert_eq!(expect_close(&mut peer).await, CLOSE_NORMAL);
}
