//! In-process dialer. Every successful dial hands the test a [`MockPeer`]
//! standing in for the server end of the socket.

use async_trait::async_trait;
use parking_lot::Mutex;
use proctor_wire::SignalMessage;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use url::Url;

use super::{Dialer, OutboundFrame, SocketEvent, SocketLink, TransportError};

#[derive(Clone)]
pub struct MockDialer {
    state: Arc<Mutex<MockState>>,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<MockPeer>>>,
}

#[derive(Default)]
struct MockState {
    dials: Vec<(Instant, Url)>,
    failures_remaining: u32,
}

impl MockDialer {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            peers_tx,
            peers_rx: Arc::new(AsyncMutex::new(peers_rx)),
        }
    }

    /// The next `count` dials fail with a connect error.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures_remaining = count;
    }

    pub fn dial_count(&self) -> usize {
        self.state.lock().dials.len()
    }

    pub fn dial_log(&self) -> Vec<(Instant, Url)> {
        self.state.lock().dials.clone()
    }

    /// Waits for the next successful dial.
    pub async fn next_peer(&self) -> MockPeer {
        self.peers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("mock dialer owns the peer sender")
    }
}

impl Default for MockDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, url: &Url) -> Result<SocketLink, TransportError> {
        {
            let mut state = self.state.lock();
            state.dials.push((Instant::now(), url.clone()));
            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                return Err(TransportError::Connect("connection refused".into()));
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer = MockPeer {
            url: url.clone(),
            from_client: outbound_rx,
            to_client: inbound_tx,
        };
        self.peers_tx
            .send(peer)
            .map_err(|_| TransportError::ChannelClosed)?;
        Ok(SocketLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Server side of a mock socket.
pub struct MockPeer {
    pub url: Url,
    from_client: mpsc::UnboundedReceiver<OutboundFrame>,
    to_client: mpsc::UnboundedSender<SocketEvent>,
}

impl MockPeer {
    pub async fn recv_frame(&mut self) -> Option<OutboundFrame> {
        self.from_client.recv().await
    }

    pub fn try_recv_frame(&mut self) -> Option<OutboundFrame> {
        self.from_client.try_recv().ok()
    }

    /// Next text frame, decoded. `None` once the client closes.
    pub async fn recv_message(&mut self) -> Option<SignalMessage> {
        match self.from_client.recv().await? {
            OutboundFrame::Text(text) => SignalMessage::decode(&text).ok(),
            OutboundFrame::Close { .. } => None,
        }
    }

    /// Like [`MockPeer::recv_message`], skipping periodic heartbeats.
    pub async fn recv_non_heartbeat(&mut self) -> Option<SignalMessage> {
        loop {
            let message = self.recv_message().await?;
            if message.kind() != "heartbeat" {
                return Some(message);
            }
        }
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.to_client.send(SocketEvent::Text(text.into()));
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(value.to_string());
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(SocketEvent::Closed {
            code: Some(code),
            reason: String::new(),
        });
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.to_client.send(SocketEvent::Error(reason.to_string()));
    }
}
