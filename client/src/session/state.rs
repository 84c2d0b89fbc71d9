use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingPartner,
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

impl SessionState {
    /// States in which a pairing with a partner exists.
    pub fn is_paired(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingPartner => "awaiting-partner",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
