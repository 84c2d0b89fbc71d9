use std::fmt;

use roulette_model::ServerMessage;

use super::TimerKind;
use crate::transport::TransportEvent;

/// Everything that can change a session, funnelled through one mailbox.
#[derive(Debug)]
pub enum SessionEvent {
    MediaReady,
    MediaDenied(String),
    ServerConnected,
    ServerDisconnected,
    Relay(ServerMessage),
    Transport { epoch: u64, event: TransportEvent },
    TimerFired { epoch: u64, kind: TimerKind },
    RequestNext,
    Shutdown,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::MediaReady => f.write_str("MediaReady"),
            SessionEvent::MediaDenied(_) => f.write_str("MediaDenied"),
            SessionEvent::ServerConnected => f.write_str("ServerConnected"),
            SessionEvent::ServerDisconnected => f.write_str("ServerDisconnected"),
            SessionEvent::Relay(message) => write!(f, "Relay({message:?})"),
            SessionEvent::Transport { epoch, event } => write!(f, "Transport(#{epoch}, {event})"),
            SessionEvent::TimerFired { epoch, kind } => write!(f, "TimerFired(#{epoch}, {kind:?})"),
            SessionEvent::RequestNext => f.write_str("RequestNext"),
            SessionEvent::Shutdown => f.write_str("Shutdown"),
        }
    }
}
