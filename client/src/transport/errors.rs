use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportErrors {
    #[error("Peer connection error: {0}")]
    Webrtc(#[from] webrtc::Error),
    #[error("Malformed signaling payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("No peer connection for the current pairing")]
    NoConnection,
    #[error("Negotiation cancelled")]
    Cancelled,
}
