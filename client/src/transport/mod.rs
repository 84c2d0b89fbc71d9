//! Seam between the session state machine and the peer-to-peer stack.

mod errors;
mod peer_connection;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::session::SessionEvent;

pub use peer_connection::{candidate_kind, WebrtcTransport, WebrtcTransportFactory};
pub use errors::TransportErrors;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Something the peer stack reported through one of its callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(Value),
    GatheringComplete,
    RemoteTrack { kind: String },
    IceState(IceState),
    ConnectionState(ConnectionState),
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LocalCandidate(_) => f.write_str("LocalCandidate"),
            TransportEvent::GatheringComplete => f.write_str("GatheringComplete"),
            TransportEvent::RemoteTrack { kind } => write!(f, "RemoteTrack({kind})"),
            TransportEvent::IceState(state) => write!(f, "IceState({state:?})"),
            TransportEvent::ConnectionState(state) => write!(f, "ConnectionState({state:?})"),
        }
    }
}

/// Forwards callbacks into the session mailbox, tagged with the pairing
/// epoch the transport was created for.
#[derive(Clone)]
pub struct TransportEventSink {
    epoch: u64,
    mailbox: mpsc::UnboundedSender<SessionEvent>,
}

impl TransportEventSink {
    pub fn new(epoch: u64, mailbox: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { epoch, mailbox }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn emit(&self, event: TransportEvent) {
        if self
            .mailbox
            .send(SessionEvent::Transport {
                epoch: self.epoch,
                event,
            })
            .is_err()
        {
            tracing::debug!("Session mailbox closed, transport event dropped");
        }
    }
}

/// One peer connection. Descriptions and candidates are the opaque JSON
/// values carried by the signaling relay.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<Value, TransportErrors>;
    async fn create_answer(&self) -> Result<Value, TransportErrors>;
    async fn set_local_description(&self, description: Value) -> Result<(), TransportErrors>;
    async fn set_remote_description(&self, description: Value) -> Result<(), TransportErrors>;
    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), TransportErrors>;
    async fn close(&self) -> Result<(), TransportErrors>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    type Transport: PeerTransport + 'static;

    /// Creates a connection with local media attached and callbacks wired to `events`.
    async fn create(&self, events: TransportEventSink) -> Result<Self::Transport, TransportErrors>;
}
