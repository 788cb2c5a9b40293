//! Reconnecting, heartbeat-monitored signaling connection.
//!
//! A [`SignalingTransport`] is a cheap handle. The socket itself is owned
//! by a driver task spawned on `connect`; the handle and the driver share
//! the outbound queue, the handler slots and the published link state.
//! At most one driver is live per handle: a new `connect` with different
//! parameters shuts the previous driver down and waits for it to finish
//! before dialing.

use parking_lot::{Mutex, RwLock};
use proctor_wire::{ControlMessage, EndpointPath, PairingToken, Role, SignalMessage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::TransportConfig;
use crate::transport::{Dialer, LinkState, TransportError};

mod driver;

use driver::Driver;

pub type MessageHandler = Arc<dyn Fn(&SignalMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Where a connection is pointed, relative to the configured base url.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Session(EndpointPath),
    Fixed(String),
}

/// Presented in a `verify` frame as soon as the socket opens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    pub passcode: String,
    pub pairing_token: Option<PairingToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectParams {
    pub route: Route,
    pub credential: Option<Credential>,
}

impl ConnectParams {
    pub fn session(path: EndpointPath) -> Self {
        Self {
            route: Route::Session(path),
            credential: None,
        }
    }

    pub fn fixed(path: impl Into<String>) -> Self {
        Self {
            route: Route::Fixed(path.into()),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn role(&self) -> Option<Role> {
        match &self.route {
            Route::Session(path) => Some(path.role()),
            Route::Fixed(_) => None,
        }
    }

    /// Frames sent ahead of anything queued, in order.
    pub(crate) fn handshake(&self) -> Vec<SignalMessage> {
        let mut frames = Vec::new();
        if let Some(credential) = &self.credential {
            frames.push(SignalMessage::from(ControlMessage::Verify {
                passcode: credential.passcode.clone(),
                pairing_token: credential.pairing_token.clone(),
            }));
        }
        if self.role() == Some(Role::Primary) {
            frames.push(SignalMessage::from(ControlMessage::StatusRequest));
        }
        frames
    }

    pub fn endpoint_url(&self, base: &Url) -> Result<Url, TransportError> {
        let mut url = base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TransportError::InvalidUrl(format!("{base} cannot be a base")))?;
            segments.pop_if_empty();
            match &self.route {
                Route::Session(path) => {
                    segments.extend(path.segments());
                }
                Route::Fixed(path) => {
                    segments.extend(path.split('/').filter(|segment| !segment.is_empty()));
                }
            }
        }
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatus {
    pub state: LinkState,
    pub attempts: u32,
    pub last_message_at: Option<Instant>,
    pub exhausted: bool,
    pub manually_closed: bool,
    pub queued: usize,
}

#[derive(Clone)]
pub struct SignalingTransport {
    inner: Arc<Handle>,
}

/// Owned by the handles only; the driver holds `Shared` directly, so the
/// last handle going away closes the connection.
struct Handle {
    shared: Arc<Shared>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

pub(crate) struct Shared {
    config: TransportConfig,
    dialer: Arc<dyn Dialer>,
    handlers: RwLock<Vec<(HandlerId, MessageHandler)>>,
    next_handler: AtomicU64,
    outbound: Mutex<VecDeque<SignalMessage>>,
    outbound_ready: Notify,
    state_tx: watch::Sender<LinkState>,
    control: Mutex<Control>,
}

struct Control {
    params: Option<ConnectParams>,
    generation: u64,
    driver: Option<DriverHandle>,
    manually_closed: bool,
    attempts: u32,
    last_message_at: Option<Instant>,
    exhausted: bool,
}

struct DriverHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SignalingTransport {
    pub fn new(config: TransportConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Closed);
        let shared = Arc::new(Shared {
            config,
            dialer,
            handlers: RwLock::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            outbound: Mutex::new(VecDeque::new()),
            outbound_ready: Notify::new(),
            state_tx,
            control: Mutex::new(Control {
                params: None,
                generation: 0,
                driver: None,
                manually_closed: false,
                attempts: 0,
                last_message_at: None,
                exhausted: false,
            }),
        });
        Self {
            inner: Arc::new(Handle { shared }),
        }
    }

    /// Opens the connection. Identical params while connecting or open are
    /// a no-op; different params supersede the running socket. Must be
    /// called from within a tokio runtime.
    pub fn connect(&self, params: ConnectParams) {
        let mut control = self.inner.shared.control.lock();
        let state = *self.inner.shared.state_tx.borrow();
        if control.params.as_ref() == Some(&params)
            && state.is_live()
            && control.driver.is_some()
        {
            debug!(target: "signaling", ?state, "connect ignored; already live");
            return;
        }

        let url = match params.endpoint_url(&self.inner.shared.config.base_url) {
            Ok(url) => url,
            Err(err) => {
                warn!(target: "signaling", error = %err, "cannot build endpoint url");
                return;
            }
        };

        let previous = control.driver.take().map(|driver| {
            let _ = driver.shutdown.send(());
            driver.task
        });
        control.generation += 1;
        control.params = Some(params.clone());
        control.manually_closed = false;
        control.exhausted = false;
        control.attempts = 0;
        let generation = control.generation;
        self.inner.shared.state_tx.send_replace(LinkState::Connecting);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = Driver::new(
            Arc::clone(&self.inner.shared),
            generation,
            url.clone(),
            params,
            shutdown_rx,
            previous,
        );
        let task = tokio::spawn(driver.run());
        control.driver = Some(DriverHandle {
            shutdown: shutdown_tx,
            task,
        });
        info!(target: "signaling", url = %url, generation, "connecting");
    }

    /// Queues a message; it goes out immediately when the link is open and
    /// in order right after the next open otherwise.
    /// Dropped once `close` has been called, until the next `connect`.
    pub fn send(&self, message: impl Into<SignalMessage>) {
        let message = message.into();
        let control = self.inner.shared.control.lock();
        if control.manually_closed {
            debug!(target: "signaling", kind = message.kind(), "dropping send on closed connection");
            return;
        }
        debug!(target: "signaling", kind = message.kind(), "queueing message");
        self.inner.shared.outbound.lock().push_back(message);
        drop(control);
        self.inner.shared.outbound_ready.notify_one();
    }

    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&SignalMessage) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.shared.next_handler.fetch_add(1, Ordering::SeqCst));
        self.inner.shared.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Swaps the callback behind `id`; the next dispatch sees the new one.
    pub fn replace_handler<F>(&self, id: HandlerId, handler: F) -> bool
    where
        F: Fn(&SignalMessage) + Send + Sync + 'static,
    {
        let mut handlers = self.inner.shared.handlers.write();
        match handlers.iter_mut().find(|(slot, _)| *slot == id) {
            Some((_, current)) => {
                *current = Arc::new(handler);
                true
            }
            None => false,
        }
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.shared.handlers.write();
        let before = handlers.len();
        handlers.retain(|(slot, _)| *slot != id);
        handlers.len() != before
    }

    /// Tears the connection down for good: timers stop, the socket gets a
    /// normal closure, nothing reconnects and pending sends are dropped.
    pub fn close(&self) {
        self.inner.shared.shutdown();
    }

    pub fn state(&self) -> LinkState {
        *self.inner.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.inner.shared.state_tx.subscribe()
    }

    /// Resolves once the link reports `target`.
    pub async fn wait_for(&self, target: LinkState) {
        let mut rx = self.inner.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// True while a driver is dialing, connected or waiting to redial.
    /// False after `close`, a server disconnect or exhausted retries.
    pub fn is_running(&self) -> bool {
        self.inner.shared.control.lock().driver.is_some()
    }

    pub fn params(&self) -> Option<ConnectParams> {
        self.inner.shared.control.lock().params.clone()
    }

    pub fn status(&self) -> TransportStatus {
        let control = self.inner.shared.control.lock();
        TransportStatus {
            state: *self.inner.shared.state_tx.borrow(),
            attempts: control.attempts,
            last_message_at: control.last_message_at,
            exhausted: control.exhausted,
            manually_closed: control.manually_closed,
            queued: self.inner.shared.outbound.lock().len(),
        }
    }
}

impl Shared {
    fn shutdown(&self) {
        let mut control = self.control.lock();
        control.manually_closed = true;
        control.generation += 1;
        if let Some(driver) = control.driver.take() {
            let _ = driver.shutdown.send(());
            info!(target: "signaling", "connection closed by caller");
        }
        self.outbound.lock().clear();
        self.state_tx.send_replace(LinkState::Closed);
    }

    /// Publishes `state` unless the driver at `generation` was superseded.
    fn publish_state(&self, generation: u64, state: LinkState) -> bool {
        let control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        self.state_tx.send_replace(state);
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.control.lock().generation == generation
    }

    fn record_attempts(&self, generation: u64, attempts: u32) {
        let mut control = self.control.lock();
        if control.generation == generation {
            control.attempts = attempts;
        }
    }

    fn record_inbound(&self, generation: u64, at: Instant) {
        let mut control = self.control.lock();
        if control.generation == generation {
            control.last_message_at = Some(at);
        }
    }

    fn mark_exhausted(&self, generation: u64) {
        let mut control = self.control.lock();
        if control.generation == generation {
            control.exhausted = true;
            control.driver = None;
            self.state_tx.send_replace(LinkState::Closed);
        }
    }

    /// Terminal close initiated by the server.
    fn mark_terminated(&self, generation: u64) {
        let mut control = self.control.lock();
        if control.generation == generation {
            control.driver = None;
            self.state_tx.send_replace(LinkState::Closed);
        }
    }

    fn pop_outbound(&self) -> Option<SignalMessage> {
        self.outbound.lock().pop_front()
    }

    fn requeue_front(&self, message: SignalMessage) {
        self.outbound.lock().push_front(message);
    }

    fn dispatch(&self, message: &SignalMessage) {
        let handlers: Vec<MessageHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(message);
        }
    }
}

#[cfg(test)]
mod tests;
