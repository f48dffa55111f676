use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifelineError {
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("credential expired")]
    CredentialExpired,
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("location permission denied: {0}")]
    PermissionDenied(String),
}
