//! Pre-task session gate: consent, fullscreen lockdown, identity check,
//! device and media permissions, then a countdown into the timed task.
//!
//! Every step that suspends captures the attempt epoch first. `cancel`
//! bumps the epoch before anything else, so a completion that lands
//! afterwards is dropped instead of moving the gate.

mod capability;
mod consent;
mod state;

pub use capability::{
    Capabilities, CaptureError, ExitAttempt, ExitDecision, Fullscreen, FullscreenDenied,
    GateNotice, GateSettings, IdentityVerifier, LaunchHandoff, MediaGrant, MediaPermissions,
    TaskConfig, TaskDescriptor, VerificationOutcome,
};
pub use consent::ConsentFlow;
pub use state::GateState;

use parking_lot::Mutex;
use proctor_wire::{ControlMessage, EndpointPath, Role, WireError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::pairing::{PairingCoordinator, PairingLinkSender};
use crate::signaling::{ConnectParams, SignalingTransport};
use crate::transport::{Dialer, LinkState};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: GateState,
    },
    #[error("no transition from {from} to {to}")]
    IllegalTransition { from: GateState, to: GateState },
    #[error("consent pages have not all been read")]
    ConsentIncomplete,
    #[error("consent has not been acknowledged")]
    ConsentNotAcknowledged,
    #[error("countdown needs a paired device and full media access")]
    NotReady,
    #[error("step was cancelled")]
    Superseded,
    #[error("another step is still running")]
    StepInFlight,
    #[error("invalid task: {0}")]
    InvalidTask(#[from] WireError),
}

struct Session {
    task: TaskDescriptor,
    transport: SignalingTransport,
    pairing: PairingCoordinator,
}

struct GateCore {
    state: GateState,
    epoch: u64,
    session: Option<Session>,
    consent: ConsentFlow,
    media: MediaGrant,
    notice: Option<GateNotice>,
    enforce_fullscreen: bool,
    fullscreen_entered: bool,
    trapped_exits: u32,
    in_flight: bool,
}

impl GateCore {
    fn require(&self, operation: &'static str, expected: GateState) -> Result<(), GateError> {
        if self.state != expected {
            return Err(GateError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn paired(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |session| session.pairing.is_paired())
    }

    fn ready_for_countdown(&self) -> bool {
        self.state == GateState::PermissionPending && self.media.is_complete() && self.paired()
    }

    /// What is still blocking the countdown, if anything.
    fn blocking_notice(&self) -> Option<GateNotice> {
        if !self.media.is_complete() {
            Some(GateNotice::MissingPermissions {
                camera: !self.media.camera,
                microphone: !self.media.microphone,
            })
        } else if !self.paired() {
            Some(GateNotice::AwaitingPairing)
        } else {
            None
        }
    }
}

/// Leftovers of a rollback that must be finished outside the lock.
struct Rollback {
    session: Option<Session>,
    exit_fullscreen: bool,
}

#[derive(Clone)]
pub struct SessionGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    settings: GateSettings,
    transport_config: TransportConfig,
    dialer: Arc<dyn Dialer>,
    link_sender: Arc<dyn PairingLinkSender>,
    capabilities: Capabilities,
    core: Mutex<GateCore>,
    state_tx: watch::Sender<GateState>,
    countdown_tx: watch::Sender<Option<u32>>,
    cancelled: Notify,
}

impl GateInner {
    fn transition(&self, core: &mut GateCore, to: GateState) -> Result<(), GateError> {
        if !core.state.can_transition(to) {
            return Err(GateError::IllegalTransition {
                from: core.state,
                to,
            });
        }
        debug!(target: "gate", from = %core.state, to = %to, "transition");
        core.state = to;
        self.state_tx.send_replace(to);
        Ok(())
    }

    fn clear_steps(&self, core: &mut GateCore) {
        core.consent = ConsentFlow::new(self.settings.consent_pages);
        core.media = MediaGrant::default();
        core.enforce_fullscreen = false;
        core.in_flight = false;
    }

    /// Invalidates in-flight steps and closes the session connection.
    fn rollback(&self, core: &mut GateCore) -> Rollback {
        core.epoch += 1;
        let session = core.session.take();
        if let Some(session) = &session {
            session.transport.close();
        }
        let exit_fullscreen = std::mem::take(&mut core.fullscreen_entered);
        self.clear_steps(core);
        self.countdown_tx.send_replace(None);
        self.cancelled.notify_waiters();
        Rollback {
            session,
            exit_fullscreen,
        }
    }

    async fn finish_rollback(&self, rollback: Rollback) {
        drop(rollback.session);
        let fullscreen = &self.capabilities.fullscreen;
        if rollback.exit_fullscreen || fullscreen.is_active() {
            fullscreen.exit().await;
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.core.lock().epoch == epoch
    }
}

impl SessionGate {
    pub fn new(
        settings: GateSettings,
        transport_config: TransportConfig,
        dialer: Arc<dyn Dialer>,
        link_sender: Arc<dyn PairingLinkSender>,
        capabilities: Capabilities,
    ) -> Self {
        let (state_tx, _) = watch::channel(GateState::Idle);
        let (countdown_tx, _) = watch::channel(None);
        let consent = ConsentFlow::new(settings.consent_pages);
        Self {
            inner: Arc::new(GateInner {
                settings,
                transport_config,
                dialer,
                link_sender,
                capabilities,
                core: Mutex::new(GateCore {
                    state: GateState::Idle,
                    epoch: 0,
                    session: None,
                    consent,
                    media: MediaGrant::default(),
                    notice: None,
                    enforce_fullscreen: false,
                    fullscreen_entered: false,
                    trapped_exits: 0,
                    in_flight: false,
                }),
                state_tx,
                countdown_tx,
                cancelled: Notify::new(),
            }),
        }
    }

    /// Opens the primary connection for `task` and shows the consent flow.
    /// Also accepted after an abort or a launch, which reset to idle first.
    pub fn start(&self, task: TaskDescriptor) -> Result<GateState, GateError> {
        let path = EndpointPath::new(
            Role::Primary,
            task.task_id.as_str(),
            task.session_id.as_str(),
            task.user_id.as_str(),
        )?;

        let mut core = self.inner.core.lock();
        match core.state {
            GateState::Idle => {}
            GateState::Aborted | GateState::Launched => {
                self.inner.transition(&mut core, GateState::Idle)?;
            }
            state => {
                return Err(GateError::InvalidState {
                    operation: "start",
                    state,
                })
            }
        }

        let transport = SignalingTransport::new(
            self.inner.transport_config.clone(),
            Arc::clone(&self.inner.dialer),
        );
        let pairing = PairingCoordinator::attach(
            &transport,
            path.clone(),
            Arc::clone(&self.inner.link_sender),
        );
        transport.connect(ConnectParams::session(path));

        core.epoch += 1;
        self.inner.clear_steps(&mut core);
        core.notice = None;
        core.trapped_exits = 0;
        info!(
            target: "gate",
            task = %task.task_id,
            session = %task.session_id,
            "starting session gate"
        );
        core.session = Some(Session {
            task,
            transport,
            pairing,
        });
        self.inner.transition(&mut core, GateState::ConsentPending)?;
        Ok(core.state)
    }

    pub fn next_consent_page(&self) -> Result<usize, GateError> {
        let mut core = self.inner.core.lock();
        core.require("next_consent_page", GateState::ConsentPending)?;
        Ok(core.consent.next())
    }

    pub fn previous_consent_page(&self) -> Result<usize, GateError> {
        let mut core = self.inner.core.lock();
        core.require("previous_consent_page", GateState::ConsentPending)?;
        Ok(core.consent.previous())
    }

    pub fn set_acknowledged(&self, acknowledged: bool) -> Result<(), GateError> {
        let mut core = self.inner.core.lock();
        core.require("set_acknowledged", GateState::ConsentPending)?;
        core.consent.set_acknowledged(acknowledged)
    }

    /// Accepts consent and asks for fullscreen. A denial aborts the attempt
    /// with a notice; the user retries by starting again.
    pub async fn accept_consent(&self) -> Result<GateState, GateError> {
        let epoch = {
            let mut core = self.inner.core.lock();
            core.require("accept_consent", GateState::ConsentPending)?;
            core.consent.check_accept()?;
            self.inner.transition(&mut core, GateState::FullscreenEntering)?;
            core.in_flight = true;
            core.epoch
        };

        let result = self.inner.capabilities.fullscreen.request().await;

        let rollback = {
            let mut core = self.inner.core.lock();
            if core.epoch != epoch {
                None
            } else {
                core.in_flight = false;
                match &result {
                    Ok(()) => {
                        core.enforce_fullscreen = true;
                        core.fullscreen_entered = true;
                        core.notice = None;
                        self.inner
                            .transition(&mut core, GateState::IdentityVerifying)?;
                        return Ok(core.state);
                    }
                    Err(denied) => {
                        warn!(target: "gate", reason = %denied.reason, "fullscreen denied; aborting");
                        let rollback = self.inner.rollback(&mut core);
                        core.notice = Some(GateNotice::FullscreenDenied(denied.reason.clone()));
                        self.inner.transition(&mut core, GateState::Aborted)?;
                        Some(rollback)
                    }
                }
            }
        };

        match rollback {
            Some(rollback) => {
                self.inner.finish_rollback(rollback).await;
                Ok(GateState::Aborted)
            }
            None => {
                // Cancelled while the prompt was up; undo a late grant.
                if result.is_ok() {
                    self.inner.capabilities.fullscreen.exit().await;
                }
                Err(GateError::Superseded)
            }
        }
    }

    /// Runs one capture-and-verify round. Anything but a match keeps the
    /// gate here with a notice so the user can try again.
    pub async fn verify_identity(&self) -> Result<GateState, GateError> {
        let (epoch, task) = {
            let mut core = self.inner.core.lock();
            core.require("verify_identity", GateState::IdentityVerifying)?;
            if core.in_flight {
                return Err(GateError::StepInFlight);
            }
            let task = match &core.session {
                Some(session) => session.task.clone(),
                None => {
                    return Err(GateError::InvalidState {
                        operation: "verify_identity",
                        state: core.state,
                    })
                }
            };
            core.in_flight = true;
            (core.epoch, task)
        };

        let result = self
            .inner
            .capabilities
            .verifier
            .capture_and_verify(&task)
            .await;

        let mut core = self.inner.core.lock();
        if core.epoch != epoch {
            debug!(target: "gate", "discarding late verification result");
            return Err(GateError::Superseded);
        }
        core.in_flight = false;
        let notice = match result {
            Ok(VerificationOutcome::Match) => {
                self.inner
                    .transition(&mut core, GateState::PermissionPending)?;
                info!(target: "gate", task = %task.task_id, "identity verified");
                None
            }
            Ok(VerificationOutcome::NoMatch) => Some(GateNotice::NoMatch),
            Ok(VerificationOutcome::NoFaceDetected) => Some(GateNotice::NoFaceDetected),
            Ok(VerificationOutcome::ReferenceMissing) => Some(GateNotice::ReferenceMissing),
            Err(err) => {
                warn!(target: "gate", error = %err, "verification round failed");
                Some(GateNotice::VerificationFailed(err.to_string()))
            }
        };
        core.notice = notice;
        Ok(core.state)
    }

    /// Asks the host for camera and microphone. A partial grant stays here
    /// and names what is missing.
    pub async fn request_media(&self) -> Result<GateState, GateError> {
        let epoch = {
            let mut core = self.inner.core.lock();
            core.require("request_media", GateState::PermissionPending)?;
            if core.in_flight {
                return Err(GateError::StepInFlight);
            }
            core.in_flight = true;
            core.epoch
        };

        let grant = self.inner.capabilities.media.request().await;

        let mut core = self.inner.core.lock();
        if core.epoch != epoch {
            return Err(GateError::Superseded);
        }
        core.in_flight = false;
        core.media = grant;
        core.notice = core.blocking_notice();
        debug!(
            target: "gate",
            camera = grant.camera,
            microphone = grant.microphone,
            "media permissions answered"
        );
        Ok(core.state)
    }

    /// Fire-and-forget request for the secondary device link.
    pub fn send_pairing_link(&self, recipient: Option<String>) -> Result<(), GateError> {
        let core = self.inner.core.lock();
        match &core.session {
            Some(session) => {
                drop(session.pairing.request_link(recipient));
                Ok(())
            }
            None => Err(GateError::InvalidState {
                operation: "send_pairing_link",
                state: core.state,
            }),
        }
    }

    pub fn can_begin_countdown(&self) -> bool {
        self.inner.core.lock().ready_for_countdown()
    }

    /// Runs the countdown and, at expiry, hands the session to the caller.
    /// A cancel during the countdown resolves this with `Superseded`.
    pub async fn begin_countdown(&self) -> Result<LaunchHandoff, GateError> {
        let epoch = {
            let mut core = self.inner.core.lock();
            core.require("begin_countdown", GateState::PermissionPending)?;
            if !core.ready_for_countdown() {
                core.notice = core.blocking_notice();
                return Err(GateError::NotReady);
            }
            self.inner.transition(&mut core, GateState::Countdown)?;
            core.notice = None;
            if let Some(session) = &core.session {
                if session.transport.state() == LinkState::Open {
                    session.transport.send(ControlMessage::StartMonitoring {
                        task_id: Some(session.task.task_id.clone()),
                    });
                }
            }
            core.epoch
        };

        let tick = self.inner.settings.tick;
        let mut left = self.inner.settings.countdown;
        let ticks = countdown_ticks(left, tick);
        info!(target: "gate", ticks, "countdown started");

        for remaining in (1..=ticks).rev() {
            // The last tick only sleeps what is left of the countdown.
            let step = if tick.is_zero() { left } else { left.min(tick) };
            left = left.saturating_sub(step);
            self.inner.countdown_tx.send_replace(Some(remaining));
            let cancelled = self.inner.cancelled.notified();
            tokio::pin!(cancelled);
            cancelled.as_mut().enable();
            if !self.inner.is_current(epoch) {
                return Err(GateError::Superseded);
            }
            tokio::select! {
                _ = &mut cancelled => return Err(GateError::Superseded),
                _ = sleep(step) => {}
            }
        }

        let session = {
            let mut core = self.inner.core.lock();
            if core.epoch != epoch {
                return Err(GateError::Superseded);
            }
            let Some(session) = core.session.take() else {
                return Err(GateError::Superseded);
            };
            self.inner.transition(&mut core, GateState::Launched)?;
            core.epoch += 1;
            core.fullscreen_entered = false;
            self.inner.clear_steps(&mut core);
            self.inner.countdown_tx.send_replace(Some(0));
            session
        };
        info!(target: "gate", task = %session.task.task_id, "launching task");

        let Session {
            task,
            transport,
            pairing,
        } = session;
        drop(pairing);
        Ok(LaunchHandoff {
            config: task.config.clone(),
            task,
            transport,
        })
    }

    /// Abandons the attempt from any live state: fullscreen is exited if it
    /// was entered and the session connection is closed.
    pub async fn cancel(&self) -> Result<GateState, GateError> {
        let rollback = {
            let mut core = self.inner.core.lock();
            if core.state == GateState::Aborted {
                return Ok(GateState::Aborted);
            }
            if !core.state.can_transition(GateState::Aborted) {
                return Err(GateError::InvalidState {
                    operation: "cancel",
                    state: core.state,
                });
            }
            info!(target: "gate", from = %core.state, "cancelling");
            let rollback = self.inner.rollback(&mut core);
            core.notice = None;
            self.inner.transition(&mut core, GateState::Aborted)?;
            rollback
        };
        self.inner.finish_rollback(rollback).await;
        Ok(GateState::Aborted)
    }

    /// While fullscreen is enforced, leaving is refused and fullscreen is
    /// requested again. The gate does not move either way.
    pub async fn on_exit_attempt(&self, attempt: ExitAttempt) -> ExitDecision {
        let epoch = {
            let mut core = self.inner.core.lock();
            if !core.enforce_fullscreen {
                return ExitDecision::Allowed;
            }
            core.trapped_exits += 1;
            warn!(target: "gate", ?attempt, state = %core.state, "exit attempt trapped");
            core.epoch
        };

        if let Err(denied) = self.inner.capabilities.fullscreen.request().await {
            debug!(target: "gate", reason = %denied.reason, "fullscreen re-request refused");
            let mut core = self.inner.core.lock();
            if core.epoch == epoch {
                core.notice = Some(GateNotice::FullscreenRequired);
            }
        }
        ExitDecision::Trapped
    }

    pub fn state(&self) -> GateState {
        self.inner.core.lock().state
    }

    pub fn watch_state(&self) -> watch::Receiver<GateState> {
        self.inner.state_tx.subscribe()
    }

    /// Remaining countdown ticks; `None` outside a countdown.
    pub fn watch_countdown(&self) -> watch::Receiver<Option<u32>> {
        self.inner.countdown_tx.subscribe()
    }

    pub fn notice(&self) -> Option<GateNotice> {
        self.inner.core.lock().notice.clone()
    }

    pub fn consent(&self) -> ConsentFlow {
        self.inner.core.lock().consent.clone()
    }

    pub fn media_grant(&self) -> MediaGrant {
        self.inner.core.lock().media
    }

    pub fn is_paired(&self) -> bool {
        self.inner.core.lock().paired()
    }

    pub fn enforce_fullscreen(&self) -> bool {
        self.inner.core.lock().enforce_fullscreen
    }

    pub fn trapped_exits(&self) -> u32 {
        self.inner.core.lock().trapped_exits
    }

    pub fn transport(&self) -> Option<SignalingTransport> {
        self.inner
            .core
            .lock()
            .session
            .as_ref()
            .map(|session| session.transport.clone())
    }

    pub fn pairing_token(&self) -> Option<proctor_wire::PairingToken> {
        self.inner
            .core
            .lock()
            .session
            .as_ref()
            .map(|session| session.pairing.token().clone())
    }
}

/// Number of published ticks, rounding a partial last tick up.
fn countdown_ticks(countdown: Duration, tick: Duration) -> u32 {
    if countdown.is_zero() {
        return 0;
    }
    if tick.is_zero() {
        return 1;
    }
    let ticks = countdown.as_nanos().div_ceil(tick.as_nanos());
    u32::try_from(ticks).unwrap_or(u32::MAX)
}
