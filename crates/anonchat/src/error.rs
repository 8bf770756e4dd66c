//! Proxy error types

use thiserror::Error;

/// Error kind reported to clients when an upstream call fails.
pub const UPSTREAM_ERROR: &str = "upstream error";

/// Error kind reported to clients when the response could not be composed.
pub const COMPOSE_ERROR: &str = "compose response to client error";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("invalid chat requirements response: {0}")]
    InvalidRequirements(String),

    #[error("failed to compose response: {0}")]
    Compose(String),

    #[error("upstream stream error: {0}")]
    Stream(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// The `error` field written into the client-facing error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upstream(_) | Self::UpstreamStatus { .. } | Self::InvalidRequirements(_) => {
                UPSTREAM_ERROR
            }
            Self::Compose(_) | Self::Stream(_) | Self::Config(_) => COMPOSE_ERROR,
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Compose(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
