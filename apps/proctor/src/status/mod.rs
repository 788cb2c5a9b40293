//! One shared signaling connection fanned out to any number of status
//! subscribers.
//!
//! The registry is the only thing that decides whether the shared socket
//! should be open: a reference taken while the socket is down connects it,
//! and the last release arms a single grace timer that closes it if nobody
//! comes back in time. Cached statuses are forgotten on teardown.

use async_trait::async_trait;
use parking_lot::Mutex;
use proctor_wire::{ControlMessage, EntityId, EventStatus, SignalMessage, StatusUpdate, WireError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::signaling::{ConnectParams, HandlerId, SignalingTransport};
use crate::transport::Dialer;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status fetch failed: {0}")]
    Fetch(String),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Authoritative request/response lookup for one entity.
#[async_trait]
pub trait StatusFetcher: Send + Sync {
    async fn fetch_status(&self, id: &EntityId) -> Result<StatusUpdate, StatusError>;
}

pub type StatusCallback = Arc<dyn Fn(&StatusUpdate) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSettings {
    pub path: String,
    pub grace: Duration,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            path: "/status".to_string(),
            grace: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct StatusChannel {
    inner: Arc<Inner>,
}

struct Inner {
    transport: SignalingTransport,
    fetcher: Arc<dyn StatusFetcher>,
    settings: StatusSettings,
    registry: Mutex<Registry>,
}

struct Subscriber {
    filter: Option<EntityId>,
    callback: StatusCallback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: BTreeMap<u64, Subscriber>,
    refs: usize,
    teardown: Option<JoinHandle<()>>,
    teardown_epoch: u64,
    last_known: HashMap<EntityId, EventStatus>,
    // Bumped on every push so a pull can tell it was overtaken.
    versions: HashMap<EntityId, u64>,
    handler: Option<HandlerId>,
}

impl Registry {
    fn has_filter(&self, id: &EntityId) -> bool {
        self.subscribers
            .values()
            .any(|subscriber| subscriber.filter.as_ref() == Some(id))
    }

    fn callbacks(&self) -> Vec<StatusCallback> {
        self.subscribers
            .values()
            .map(|subscriber| Arc::clone(&subscriber.callback))
            .collect()
    }

    fn forget_entities(&mut self) {
        self.last_known.clear();
        self.versions.clear();
    }

    fn cancel_teardown(&mut self) {
        self.teardown_epoch += 1;
        if let Some(timer) = self.teardown.take() {
            timer.abort();
        }
    }
}

impl StatusChannel {
    pub fn new(
        config: TransportConfig,
        dialer: Arc<dyn Dialer>,
        fetcher: Arc<dyn StatusFetcher>,
        settings: StatusSettings,
    ) -> Self {
        let inner = Arc::new(Inner {
            transport: SignalingTransport::new(config, dialer),
            fetcher,
            settings,
            registry: Mutex::new(Registry {
                next_id: 1,
                ..Registry::default()
            }),
        });

        let weak = Arc::downgrade(&inner);
        let handler = inner.transport.on_message(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_push(message);
            }
        });
        inner.registry.lock().handler = Some(handler);
        Self { inner }
    }

    /// Registers `callback` for updates about `filter`, or for every
    /// entity when `filter` is `None`. A cached value is delivered before
    /// this returns; an id nobody else watches also triggers a pull.
    pub fn subscribe<F>(&self, filter: Option<EntityId>, callback: F) -> StatusSubscription
    where
        F: Fn(&StatusUpdate) + Send + Sync + 'static,
    {
        let wanted = filter.clone();
        let callback: StatusCallback = Arc::new(move |update: &StatusUpdate| {
            if wanted.as_ref().map_or(true, |id| *id == update.entity_id) {
                callback(update);
            }
        });

        let (id, cached, pull) = {
            let mut registry = self.inner.registry.lock();
            let is_new = filter
                .as_ref()
                .map_or(false, |entity| !registry.has_filter(entity));
            let id = registry.next_id;
            registry.next_id += 1;
            registry.subscribers.insert(
                id,
                Subscriber {
                    filter: filter.clone(),
                    callback: Arc::clone(&callback),
                },
            );
            self.inner.acquire_locked(&mut registry);

            let cached = filter.as_ref().and_then(|entity| {
                registry
                    .last_known
                    .get(entity)
                    .map(|status| StatusUpdate::new(entity.clone(), *status))
            });
            let pull = if is_new {
                filter.map(|entity| {
                    let version = registry.versions.get(&entity).copied().unwrap_or(0);
                    (entity, version)
                })
            } else {
                None
            };
            (id, cached, pull)
        };
        debug!(target: "status", subscriber = id, "subscribed");

        if let Some(update) = cached {
            callback(&update);
        }
        if let Some((entity, version)) = pull {
            Inner::spawn_pull(&self.inner, entity, version);
        }

        StatusSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
            active: true,
        }
    }

    /// Takes a bare reference on the shared connection.
    pub fn acquire(&self) {
        let mut registry = self.inner.registry.lock();
        self.inner.acquire_locked(&mut registry);
    }

    pub fn release(&self) {
        Inner::release(&self.inner);
    }

    /// Closes the shared connection now and forgets every subscriber.
    pub fn dispose(&self) {
        let mut registry = self.inner.registry.lock();
        registry.cancel_teardown();
        registry.subscribers.clear();
        registry.refs = 0;
        registry.forget_entities();
        self.inner.transport.close();
        info!(target: "status", "status channel disposed");
    }

    pub fn last_known(&self, id: &EntityId) -> Option<EventStatus> {
        self.inner.registry.lock().last_known.get(id).copied()
    }

    pub fn ref_count(&self) -> usize {
        self.inner.registry.lock().refs
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.lock().subscribers.len()
    }

    /// True while the shared connection is open or being (re)established.
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_running()
    }

    pub fn transport(&self) -> &SignalingTransport {
        &self.inner.transport
    }
}

impl Inner {
    fn acquire_locked(&self, registry: &mut Registry) {
        registry.refs += 1;
        registry.cancel_teardown();
        // Also covers a socket that stopped on its own while referenced.
        if !self.transport.is_running() {
            info!(target: "status", path = %self.settings.path, "opening shared status connection");
            self.transport
                .connect(ConnectParams::fixed(self.settings.path.clone()));
        }
    }

    fn release(this: &Arc<Self>) {
        let mut registry = this.registry.lock();
        if registry.refs == 0 {
            return;
        }
        registry.refs -= 1;
        if registry.refs > 0 {
            return;
        }
        if !this.transport.is_running() {
            registry.forget_entities();
            return;
        }

        registry.cancel_teardown();
        let epoch = registry.teardown_epoch;
        let weak = Arc::downgrade(this);
        let grace = this.settings.grace;
        debug!(target: "status", grace_ms = grace.as_millis() as u64, "arming teardown");
        registry.teardown = Some(tokio::spawn(async move {
            sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                inner.teardown(epoch);
            }
        }));
    }

    fn teardown(&self, epoch: u64) {
        let mut registry = self.registry.lock();
        if registry.teardown_epoch != epoch || registry.refs > 0 {
            return;
        }
        registry.teardown = None;
        registry.forget_entities();
        self.transport.close();
        info!(target: "status", "closed idle status connection");
    }

    fn unsubscribe(this: &Arc<Self>, id: u64) {
        let removed = this.registry.lock().subscribers.remove(&id).is_some();
        if removed {
            debug!(target: "status", subscriber = id, "unsubscribed");
            Inner::release(this);
        }
    }

    fn on_push(&self, message: &SignalMessage) {
        let Some(ControlMessage::EventStatus { event_id, status }) = message.as_control() else {
            return;
        };
        let update = match StatusUpdate::from_code(event_id.clone(), *status) {
            Ok(update) => update,
            Err(err) => {
                debug!(target: "status", error = %err, "ignoring status push");
                return;
            }
        };

        let callbacks = {
            let mut registry = self.registry.lock();
            registry
                .last_known
                .insert(update.entity_id.clone(), update.status);
            *registry
                .versions
                .entry(update.entity_id.clone())
                .or_insert(0) += 1;
            registry.callbacks()
        };
        for callback in callbacks {
            callback(&update);
        }
    }

    fn spawn_pull(this: &Arc<Self>, entity: EntityId, version: u64) {
        let weak = Arc::downgrade(this);
        let fetcher = Arc::clone(&this.fetcher);
        tokio::spawn(async move {
            let result = fetcher.fetch_status(&entity).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(update) => inner.seed(entity, version, update),
                Err(err) => {
                    warn!(target: "status", entity = %entity, error = %err, "status pull failed");
                }
            }
        });
    }

    fn seed(&self, entity: EntityId, version: u64, update: StatusUpdate) {
        let callbacks: Vec<StatusCallback> = {
            let mut registry = self.registry.lock();
            if registry.versions.get(&entity).copied().unwrap_or(0) != version {
                debug!(target: "status", entity = %entity, "pull overtaken by push");
                return;
            }
            if !registry.has_filter(&entity) {
                debug!(target: "status", entity = %entity, "pull outlived its subscribers");
                return;
            }
            registry.last_known.insert(entity.clone(), update.status);
            registry
                .subscribers
                .values()
                .filter(|subscriber| subscriber.filter.as_ref() == Some(&entity))
                .map(|subscriber| Arc::clone(&subscriber.callback))
                .collect()
        };
        let seeded = StatusUpdate::new(entity, update.status);
        for callback in callbacks {
            callback(&seeded);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        if let Some(timer) = registry.teardown.take() {
            timer.abort();
        }
        if let Some(handler) = registry.handler.take() {
            self.transport.remove_handler(handler);
        }
    }
}

/// Releases its slot in the registry when dropped.
pub struct StatusSubscription {
    inner: Weak<Inner>,
    id: u64,
    active: bool,
}

impl StatusSubscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            Inner::unsubscribe(&inner, self.id);
        }
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
