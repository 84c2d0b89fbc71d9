#[derive(thiserror::Error, Debug)]
pub enum SignalingErrors {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection attempt timed out")]
    ConnectTimeout,
    #[error("Gave up after {0} failed connection attempts")]
    ReconnectExhausted(u32),
    #[error("Failed to send message")]
    SendFailed,
    #[error("Failed to (de)serialize message")]
    Serde(#[from] serde_json::Error),
}
