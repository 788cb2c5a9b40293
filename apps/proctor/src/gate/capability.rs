//! Host-provided capabilities the gate drives. A browser shell, a kiosk
//! wrapper or a test double implements these; the gate only ever sees the
//! named outcomes.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::signaling::SignalingTransport;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fullscreen denied: {reason}")]
pub struct FullscreenDenied {
    pub reason: String,
}

#[async_trait]
pub trait Fullscreen: Send + Sync {
    async fn request(&self) -> Result<(), FullscreenDenied>;
    async fn exit(&self);
    fn is_active(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Match,
    NoMatch,
    NoFaceDetected,
    ReferenceMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("verification service failed: {0}")]
    Service(String),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn capture_and_verify(
        &self,
        task: &TaskDescriptor,
    ) -> Result<VerificationOutcome, CaptureError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaGrant {
    pub camera: bool,
    pub microphone: bool,
}

impl MediaGrant {
    pub const FULL: MediaGrant = MediaGrant {
        camera: true,
        microphone: true,
    };

    pub fn is_complete(self) -> bool {
        self.camera && self.microphone
    }
}

#[async_trait]
pub trait MediaPermissions: Send + Sync {
    async fn request(&self) -> MediaGrant;
}

/// What the three capabilities bundle into for [`super::SessionGate::new`].
#[derive(Clone)]
pub struct Capabilities {
    pub fullscreen: Arc<dyn Fullscreen>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub media: Arc<dyn MediaPermissions>,
}

/// Opaque task settings handed to the timed task on launch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskConfig {
    pub time_limit: Option<Duration>,
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub session_id: String,
    pub user_id: String,
    pub config: TaskConfig,
}

impl TaskDescriptor {
    pub fn new(
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            config: TaskConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }
}

/// Inline message for the user. Never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateNotice {
    FullscreenDenied(String),
    FullscreenRequired,
    NoMatch,
    NoFaceDetected,
    ReferenceMissing,
    VerificationFailed(String),
    /// `true` marks a permission that is still missing.
    MissingPermissions { camera: bool, microphone: bool },
    AwaitingPairing,
}

impl fmt::Display for GateNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateNotice::FullscreenDenied(reason) => {
                write!(f, "Fullscreen is required to continue ({reason}).")
            }
            GateNotice::FullscreenRequired => {
                f.write_str("Please stay in fullscreen until the task begins.")
            }
            GateNotice::NoMatch => f.write_str("Your face did not match the reference photo. Try again."),
            GateNotice::NoFaceDetected => f.write_str("No face was detected. Center your face and try again."),
            GateNotice::ReferenceMissing => {
                f.write_str("No reference photo is on file. Contact the organizer or try again later.")
            }
            GateNotice::VerificationFailed(reason) => write!(f, "Verification failed: {reason}"),
            GateNotice::MissingPermissions { camera, microphone } => match (camera, microphone) {
                (true, true) => f.write_str("Camera and microphone access are still missing."),
                (true, false) => f.write_str("Camera access is still missing."),
                (false, true) => f.write_str("Microphone access is still missing."),
                (false, false) => f.write_str("All permissions granted."),
            },
            GateNotice::AwaitingPairing => f.write_str("Waiting for your phone to join the session."),
        }
    }
}

/// Something the user did that would leave the locked-down view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAttempt {
    BackNavigation,
    Escape,
    FullscreenChange,
    TabHidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Trapped,
    Allowed,
}

/// Ownership of the session passes to the timed task.
pub struct LaunchHandoff {
    pub task: TaskDescriptor,
    pub config: TaskConfig,
    pub transport: SignalingTransport,
}

impl fmt::Debug for LaunchHandoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchHandoff")
            .field("task", &self.task)
            .field("link", &self.transport.state())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSettings {
    pub countdown: Duration,
    pub tick: Duration,
    pub consent_pages: usize,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(5),
            tick: Duration::from_secs(1),
            consent_pages: 3,
        }
    }
}
