use proctor_wire::{now_millis, ControlMessage, SignalMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use super::{ConnectParams, Shared};
use crate::transport::backoff::Backoff;
use crate::transport::{
    LinkState, OutboundFrame, SocketEvent, SocketLink, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL,
};

/// How one socket lifetime ended.
enum SocketEnd {
    /// The caller shut the connection down.
    Shutdown,
    /// The server asked us to go away; no reconnect.
    Terminal,
    /// Anything recoverable: errors, abnormal closes, heartbeat timeout.
    Dropped,
}

pub(super) struct Driver {
    shared: Arc<Shared>,
    generation: u64,
    url: Url,
    params: ConnectParams,
    shutdown: oneshot::Receiver<()>,
    previous: Option<JoinHandle<()>>,
}

impl Driver {
    pub(super) fn new(
        shared: Arc<Shared>,
        generation: u64,
        url: Url,
        params: ConnectParams,
        shutdown: oneshot::Receiver<()>,
        previous: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            shared,
            generation,
            url,
            params,
            shutdown,
            previous,
        }
    }

    pub(super) async fn run(mut self) {
        if let Some(previous) = self.previous.take() {
            // The superseded driver closes its socket before we dial.
            let _ = previous.await;
        }

        let policy = self.shared.config.backoff;
        let mut backoff = Backoff::initial(&policy);
        loop {
            if !self.shared.publish_state(self.generation, LinkState::Connecting) {
                return;
            }

            let dialed = tokio::select! {
                _ = &mut self.shutdown => return,
                dialed = self.shared.dialer.dial(&self.url) => dialed,
            };

            let end = match dialed {
                Ok(link) => {
                    backoff = Backoff::initial(&policy);
                    self.shared.record_attempts(self.generation, 0);
                    self.run_socket(link).await
                }
                Err(err) => {
                    warn!(
                        target: "signaling",
                        url = %self.url,
                        error = %err,
                        attempt = backoff.attempts,
                        "dial failed"
                    );
                    SocketEnd::Dropped
                }
            };

            match end {
                SocketEnd::Shutdown => return,
                SocketEnd::Terminal => {
                    self.shared.mark_terminated(self.generation);
                    return;
                }
                SocketEnd::Dropped => {}
            }

            if policy.exhausted(backoff.attempts) {
                warn!(
                    target: "signaling",
                    attempts = backoff.attempts,
                    "reconnect attempts exhausted"
                );
                self.shared.mark_exhausted(self.generation);
                return;
            }

            let delay = backoff.next_delay;
            backoff = backoff.after_failure(&policy);
            self.shared.record_attempts(self.generation, backoff.attempts);
            if !self.shared.publish_state(self.generation, LinkState::Closed) {
                return;
            }
            info!(
                target: "signaling",
                attempt = backoff.attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = &mut self.shutdown => return,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn run_socket(&mut self, link: SocketLink) -> SocketEnd {
        let SocketLink {
            outbound,
            mut inbound,
        } = link;

        if !self.shared.publish_state(self.generation, LinkState::Open) {
            let _ = outbound.send(close_frame(CLOSE_NORMAL, "superseded"));
            return SocketEnd::Shutdown;
        }
        let mut last_inbound = Instant::now();
        self.shared.record_inbound(self.generation, last_inbound);
        info!(target: "signaling", url = %self.url, "link open");

        for message in self.params.handshake() {
            if write(&outbound, &message).is_err() {
                return SocketEnd::Dropped;
            }
        }
        if self.flush(&outbound).is_err() {
            return SocketEnd::Dropped;
        }

        let period = self.shared.config.heartbeat_interval;
        let liveness = self.shared.config.liveness_timeout();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => {
                    let _ = outbound.send(close_frame(CLOSE_NORMAL, "client closed"));
                    return SocketEnd::Shutdown;
                }
                event = inbound.recv() => {
                    match event {
                        Some(SocketEvent::Text(text)) => {
                            last_inbound = Instant::now();
                            self.shared.record_inbound(self.generation, last_inbound);
                            let message = match SignalMessage::decode(&text) {
                                Ok(message) => message,
                                Err(err) => {
                                    debug!(target: "signaling", error = %err, "dropping malformed payload");
                                    continue;
                                }
                            };
                            if answer_keepalive(&outbound, &message).is_err() {
                                return SocketEnd::Dropped;
                            }
                            if !self.shared.is_current(self.generation) {
                                continue;
                            }
                            self.shared.dispatch(&message);
                            if matches!(message.as_control(), Some(ControlMessage::Disconnect { .. })) {
                                info!(target: "signaling", "server requested disconnect");
                                let _ = outbound.send(close_frame(CLOSE_NORMAL, "server disconnect"));
                                return SocketEnd::Terminal;
                            }
                        }
                        Some(SocketEvent::Closed { code, reason }) => {
                            info!(target: "signaling", ?code, reason = %reason, "link closed by peer");
                            return SocketEnd::Dropped;
                        }
                        Some(SocketEvent::Error(err)) => {
                            warn!(target: "signaling", error = %err, "link error");
                            return SocketEnd::Dropped;
                        }
                        None => return SocketEnd::Dropped,
                    }
                }
                _ = self.shared.outbound_ready.notified() => {
                    if self.flush(&outbound).is_err() {
                        return SocketEnd::Dropped;
                    }
                }
                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() >= liveness {
                        warn!(
                            target: "signaling",
                            silent_ms = last_inbound.elapsed().as_millis() as u64,
                            "heartbeat timeout; forcing close"
                        );
                        self.shared.publish_state(self.generation, LinkState::Closing);
                        let _ = outbound.send(close_frame(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout"));
                        return SocketEnd::Dropped;
                    }
                    let beat = SignalMessage::from(ControlMessage::Heartbeat {
                        timestamp: Some(now_millis()),
                    });
                    if write(&outbound, &beat).is_err() {
                        return SocketEnd::Dropped;
                    }
                }
            }
        }
    }

    /// Drains the shared queue in order. A message that cannot be written
    /// goes back to the head of the queue.
    fn flush(&self, outbound: &mpsc::UnboundedSender<OutboundFrame>) -> Result<(), ()> {
        while let Some(message) = self.shared.pop_outbound() {
            if write(outbound, &message).is_err() {
                self.shared.requeue_front(message);
                return Err(());
            }
        }
        Ok(())
    }
}

fn write(outbound: &mpsc::UnboundedSender<OutboundFrame>, message: &SignalMessage) -> Result<(), ()> {
    let text = match message.encode() {
        Ok(text) => text,
        Err(err) => {
            warn!(target: "signaling", kind = message.kind(), error = %err, "cannot encode message");
            return Ok(());
        }
    };
    outbound.send(OutboundFrame::Text(text)).map_err(|_| ())
}

fn answer_keepalive(
    outbound: &mpsc::UnboundedSender<OutboundFrame>,
    message: &SignalMessage,
) -> Result<(), ()> {
    let reply = match message.kind() {
        "ping" => ControlMessage::Pong {
            timestamp: Some(now_millis()),
        },
        "heartbeat" => ControlMessage::HeartbeatAck {
            timestamp: Some(now_millis()),
        },
        _ => return Ok(()),
    };
    write(outbound, &SignalMessage::from(reply))
}

fn close_frame(code: u16, reason: &str) -> OutboundFrame {
    OutboundFrame::Close {
        code,
        reason: reason.to_string(),
    }
}
