use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod backoff;
pub mod mock;
pub mod websocket;

/// Normal closure, sent when the caller tears a connection down.
pub const CLOSE_NORMAL: u16 = 1000;
/// Application close code used when the heartbeat watchdog fires.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("socket channel closed")]
    ChannelClosed,
}

/// Lifecycle of one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl LinkState {
    pub fn is_live(self) -> bool {
        matches!(self, LinkState::Connecting | LinkState::Open)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// One open socket, seen as a pair of channels. Dropping `outbound` tears
/// the socket down.
#[derive(Debug)]
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, url: &Url) -> Result<SocketLink, TransportError>;
}
