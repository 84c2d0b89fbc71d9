use std::fmt;

use roulette_model::{ClientId, Role};

/// User-facing progress of the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Searching,
    PartnerFound { partner: ClientId, role: Role },
    Checking,
    Connected,
    RemoteMedia { kind: String },
    IceRestart,
    Retrying { attempt: u32 },
    Failed,
    PartnerLeft,
    MediaDenied(String),
    ServerLost,
}

impl SessionStatus {
    /// Statuses that need the user to act before anything else happens.
    pub fn is_blocking(&self) -> bool {
        matches!(self, SessionStatus::Failed | SessionStatus::MediaDenied(_))
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Searching => f.write_str("Looking for a partner..."),
            SessionStatus::PartnerFound { partner, role } => {
                write!(f, "Partner {} found, connecting as {role}", partner.short())
            }
            SessionStatus::Checking => f.write_str("Checking network paths..."),
            SessionStatus::Connected => f.write_str("Connected"),
            SessionStatus::RemoteMedia { kind } => write!(f, "Receiving remote {kind}"),
            SessionStatus::IceRestart => f.write_str("Connection stalled, restarting ICE"),
            SessionStatus::Retrying { attempt } => {
                write!(f, "Connection failed, retrying (attempt {attempt})")
            }
            SessionStatus::Failed => f.write_str("Connection failed. Type `next` to find someone else"),
            SessionStatus::PartnerLeft => f.write_str("Partner left"),
            SessionStatus::MediaDenied(reason) => write!(f, "Camera/microphone unavailable: {reason}"),
            SessionStatus::ServerLost => f.write_str("Lost connection to the signaling server"),
        }
    }
}
