use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use proctor_core::config::{TransportConfig, TransportConfigBuilder};
use proctor_core::signaling::{ConnectParams, Credential, SignalingTransport};
use proctor_core::transport::websocket::WebSocketDialer;
use proctor_core::transport::LinkState;
use proctor_core::wire::{EndpointPath, PairingToken, RawMessage, Role};

const STEP: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum ServerEvent {
    Opened {
        path: String,
        outbound: mpsc::UnboundedSender<WsMessage>,
    },
    Text(Value),
    Closed(Option<u16>),
}

type Events = mpsc::UnboundedSender<ServerEvent>;

async fn upgrade(
    ws: WebSocketUpgrade,
    Path(rest): Path<String>,
    State(events): State<Events>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve(socket, rest, events))
}

async fn serve(socket: WebSocket, path: String, events: Events) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let _ = events.send(ServerEvent::Opened { path, outbound });
    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
                    let _ = events.send(ServerEvent::Text(value));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let _ = events.send(ServerEvent::Closed(frame.map(|frame| frame.code)));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    let _ = events.send(ServerEvent::Closed(None));
                    break;
                }
            }
        }
    }
}

struct Server {
    base: String,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Server {
    async fn start() -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/ws/*rest", get(upgrade))
            .with_state(events_tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("ws://{addr}/ws"),
            events,
        }
    }

    fn config(&self) -> TransportConfig {
        TransportConfigBuilder::new()
            .url(self.base.clone())
            .heartbeat_interval(Duration::from_secs(30))
            .reconnect_base(Duration::from_millis(50))
            .reconnect_max(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    async fn next(&mut self) -> ServerEvent {
        timeout(STEP, self.events.recv())
            .await
            .expect("server event within timeout")
            .expect("server still running")
    }

    async fn opened(&mut self) -> (String, mpsc::UnboundedSender<WsMessage>) {
        loop {
            match self.next().await {
                ServerEvent::Opened { path, outbound } => return (path, outbound),
                ServerEvent::Closed(_) | ServerEvent::Text(_) => continue,
            }
        }
    }

    async fn text(&mut self) -> Value {
        loop {
            match self.next().await {
                ServerEvent::Text(value) if value["type"] == "heartbeat" => continue,
                ServerEvent::Text(value) => return value,
                // Close echo from a socket already replaced.
                ServerEvent::Closed(_) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    async fn closed(&mut self) -> Option<u16> {
        loop {
            match self.next().await {
                ServerEvent::Closed(code) => return code,
                ServerEvent::Text(_) => continue,
                other => panic!("expected a close, got {other:?}"),
            }
        }
    }
}

fn connect(server: &Server) -> SignalingTransport {
    SignalingTransport::new(server.config(), Arc::new(WebSocketDialer::default()))
}

fn path(role: Role) -> EndpointPath {
    EndpointPath::new(role, "7", "42", "9").unwrap()
}

fn text(value: Value) -> WsMessage {
    WsMessage::Text(value.to_string())
}

#[tokio::test]
async fn primary_handshake_then_ping_pong_over_a_real_socket() {
    let mut server = Server::start().await;
    let transport = connect(&server);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    transport.on_message(move |message| sink.lock().push(message.kind().to_string()));

    transport.connect(ConnectParams::session(path(Role::Primary)));
    let (route, outbound) = server.opened().await;
    assert_eq!(route, "primary/7/42/9");
    assert_eq!(server.text().await["type"], "status_request");
    timeout(STEP, transport.wait_for(LinkState::Open)).await.unwrap();

    outbound.send(text(json!({ "type": "ping", "timestamp": 1 }))).unwrap();
    assert_eq!(server.text().await["type"], "pong");

    transport.send(RawMessage::new("answer").with_field("sdp", "v=0"));
    let answer = server.text().await;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["sdp"], "v=0");
    assert_eq!(seen.lock().as_slice(), ["ping"]);

    transport.close();
    assert_eq!(server.closed().await, Some(1000));
    timeout(STEP, transport.wait_for(LinkState::Closed)).await.unwrap();
}

#[tokio::test]
async fn secondary_presents_its_credential_first() {
    let mut server = Server::start().await;
    let transport = connect(&server);
    transport.connect(
        ConnectParams::session(path(Role::Secondary)).with_credential(Credential {
            passcode: "1234".into(),
            pairing_token: Some(PairingToken::from_string("tok")),
        }),
    );

    let (route, _outbound) = server.opened().await;
    assert_eq!(route, "secondary/7/42/9");
    let verify = server.text().await;
    assert_eq!(verify["type"], "verify");
    assert_eq!(verify["passcode"], "1234");
    assert_eq!(verify["pairing_token"], "tok");
    transport.close();
}

#[tokio::test]
async fn dropped_socket_is_redialed_with_the_same_handshake() {
    let mut server = Server::start().await;
    let transport = connect(&server);
    transport.connect(ConnectParams::session(path(Role::Primary)));

    let (_, outbound) = server.opened().await;
    assert_eq!(server.text().await["type"], "status_request");
    outbound.send(WsMessage::Close(None)).unwrap();
    drop(outbound);

    let (route, _outbound) = server.opened().await;
    assert_eq!(route, "primary/7/42/9");
    assert_eq!(server.text().await["type"], "status_request");
    timeout(STEP, transport.wait_for(LinkState::Open)).await.unwrap();
    assert_eq!(transport.status().attempts, 0);
    transport.close();
}

#[tokio::test]
async fn server_disconnect_is_not_redialed() {
    let mut server = Server::start().await;
    let transport = connect(&server);
    transport.connect(ConnectParams::session(path(Role::Primary)));

    let (_, outbound) = server.opened().await;
    assert_eq!(server.text().await["type"], "status_request");
    outbound
        .send(text(json!({ "type": "disconnect", "reason": "session ended" })))
        .unwrap();

    assert_eq!(server.closed().await, Some(1000));
    timeout(STEP, transport.wait_for(LinkState::Closed)).await.unwrap();
    assert!(
        timeout(Duration::from_millis(500), server.events.recv())
            .await
            .is_err(),
        "no redial after a server disconnect"
    );
}
