use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use super::{Dialer, OutboundFrame, SocketEvent, SocketLink, TransportError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials real WebSocket endpoints through tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    connect_timeout: Duration,
}

impl WebSocketDialer {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WebSocketDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, url: &Url) -> Result<SocketLink, TransportError> {
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                TransportError::Connect(format!("timed out after {:?}", self.connect_timeout))
            })?
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (mut ws_write, mut ws_read) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SocketEvent>();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let writer_events = inbound_tx.clone();
        tokio::spawn(async move {
            // Reader stops when this task drops `stop_tx`.
            let _stop = stop_tx;
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if let Err(err) = ws_write.send(Message::Text(text)).await {
                            let _ = writer_events.send(SocketEvent::Error(err.to_string()));
                            break;
                        }
                    }
                    OutboundFrame::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(err) = ws_write.send(Message::Close(Some(frame))).await {
                            debug!(target: "signaling", error = %err, "close frame not delivered");
                        }
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = &mut stop_rx => break,
                    next = ws_read.next() => next,
                };
                let event = match next {
                    Some(Ok(Message::Text(text))) => SocketEvent::Text(text),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => SocketEvent::Text(text),
                        Err(_) => {
                            debug!(target: "signaling", "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|frame| (Some(u16::from(frame.code)), frame.reason.into_owned()))
                            .unwrap_or((None, String::new()));
                        let _ = inbound_tx.send(SocketEvent::Closed { code, reason });
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(target: "signaling", error = %err, "websocket read failed");
                        let _ = inbound_tx.send(SocketEvent::Error(err.to_string()));
                        break;
                    }
                    None => {
                        let _ = inbound_tx.send(SocketEvent::Closed {
                            code: None,
                            reason: "stream ended".into(),
                        });
                        break;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(SocketLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
