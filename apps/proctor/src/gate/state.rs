use std::fmt;

/// Where one exam attempt stands in the pre-task sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateState {
    Idle,
    ConsentPending,
    FullscreenEntering,
    IdentityVerifying,
    PermissionPending,
    Countdown,
    Launched,
    Aborted,
}

impl GateState {
    /// The complete transition table. Nothing else may move the gate.
    pub fn can_transition(self, to: GateState) -> bool {
        use GateState::*;
        matches!(
            (self, to),
            (Idle, ConsentPending)
                | (ConsentPending, FullscreenEntering)
                | (FullscreenEntering, IdentityVerifying)
                | (IdentityVerifying, PermissionPending)
                | (PermissionPending, Countdown)
                | (Countdown, Launched)
                | (Launched, Idle)
                | (Aborted, Idle)
                | (
                    Idle | ConsentPending
                        | FullscreenEntering
                        | IdentityVerifying
                        | PermissionPending
                        | Countdown,
                    Aborted
                )
        )
    }

    /// States in which a session connection exists.
    pub fn has_session(self) -> bool {
        matches!(
            self,
            GateState::ConsentPending
                | GateState::FullscreenEntering
                | GateState::IdentityVerifying
                | GateState::PermissionPending
                | GateState::Countdown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GateState::Idle => "idle",
            GateState::ConsentPending => "consent_pending",
            GateState::FullscreenEntering => "fullscreen_entering",
            GateState::IdentityVerifying => "identity_verifying",
            GateState::PermissionPending => "permission_pending",
            GateState::Countdown => "countdown",
            GateState::Launched => "launched",
            GateState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
