#[derive(thiserror::Error, Debug)]
pub enum MediaErrors {
    #[error("Media access denied: {0}")]
    Denied(String),
}
