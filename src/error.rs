//! Error taxonomy for the session client

use thiserror::Error;

/// Registration request failures (network or service)
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("matching service unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid matching service url: {0}")]
    Url(#[from] url::ParseError),
}

/// Matching or signaling channel failures
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("channel closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid channel url: {0}")]
    Url(#[from] url::ParseError),
}

/// Local media acquisition failures
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("camera/microphone permission denied")]
    Denied,
    #[error("media unavailable: {0}")]
    Unavailable(String),
}

/// Peer negotiation object failures
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("negotiation backend error: {0}")]
    Backend(String),
    #[error("malformed negotiation payload: {0}")]
    Protocol(String),
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        NegotiationError::Backend(err.to_string())
    }
}

/// Errors returned to callers of the session handle
#[derive(Debug, Error)]
pub enum Error {
    #[error("display name must not be empty")]
    EmptyName,
    #[error("session orchestrator has stopped")]
    Stopped,
    #[error(transparent)]
    Register(#[from] RegisterError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
