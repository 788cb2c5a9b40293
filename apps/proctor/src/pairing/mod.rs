//! Tracks whether the secondary device has joined a session.
//!
//! The join signal arrives as `phone_status` on the session's own
//! signaling connection. Getting the device there at all is an external
//! concern: we only ask the backend to send it a link.

use async_trait::async_trait;
use parking_lot::Mutex;
use proctor_wire::{ControlMessage, EndpointPath, PairingToken};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::signaling::{HandlerId, SignalingTransport};

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing link request failed: {0}")]
    Link(String),
}

/// Body of the "send the secondary device a link" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingLinkRequest {
    pub task_id: String,
    pub session_id: String,
    pub user_id: String,
    pub token: PairingToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

#[async_trait]
pub trait PairingLinkSender: Send + Sync {
    async fn send_pairing_link(&self, request: &PairingLinkRequest) -> Result<(), PairingError>;
}

pub struct PairingCoordinator {
    transport: SignalingTransport,
    path: EndpointPath,
    sender: Arc<dyn PairingLinkSender>,
    token: PairingToken,
    status: Arc<watch::Sender<bool>>,
    handler: Mutex<Option<HandlerId>>,
}

impl PairingCoordinator {
    /// Starts listening on `transport`. The join flag flips inside the
    /// dispatch callback, before any later message is delivered.
    pub fn attach(
        transport: &SignalingTransport,
        path: EndpointPath,
        sender: Arc<dyn PairingLinkSender>,
    ) -> Self {
        let (status_tx, _) = watch::channel(false);
        let status = Arc::new(status_tx);
        let sink = Arc::clone(&status);
        let handler = transport.on_message(move |message| {
            if let Some(ControlMessage::PhoneStatus { started }) = message.as_control() {
                let previous = sink.send_replace(*started);
                if previous != *started {
                    info!(target: "pairing", paired = *started, "secondary device status changed");
                }
            }
        });

        Self {
            transport: transport.clone(),
            path,
            sender,
            token: PairingToken::mint(),
            status,
            handler: Mutex::new(Some(handler)),
        }
    }

    pub fn is_paired(&self) -> bool {
        *self.status.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    pub async fn wait_paired(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|paired| *paired).await;
    }

    pub fn token(&self) -> &PairingToken {
        &self.token
    }

    pub fn path(&self) -> &EndpointPath {
        &self.path
    }

    /// Asks the backend to send the pairing link. Failures are logged and
    /// otherwise ignored; the join itself is observed via `phone_status`.
    pub fn request_link(&self, recipient: Option<String>) -> JoinHandle<()> {
        let request = PairingLinkRequest {
            task_id: self.path.task_id().to_string(),
            session_id: self.path.session_id().to_string(),
            user_id: self.path.user_id().to_string(),
            token: self.token.clone(),
            recipient,
        };
        let sender = Arc::clone(&self.sender);
        debug!(target: "pairing", session = %request.session_id, "requesting pairing link");
        tokio::spawn(async move {
            if let Err(err) = sender.send_pairing_link(&request).await {
                warn!(target: "pairing", session = %request.session_id, error = %err, "pairing link not sent");
            }
        })
    }

    pub fn detach(&self) {
        if let Some(handler) = self.handler.lock().take() {
            self.transport.remove_handler(handler);
        }
    }
}

impl Drop for PairingCoordinator {
    fn drop(&mut self) {
        self.detach();
    }
}
