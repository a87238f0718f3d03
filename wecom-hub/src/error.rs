//! Crate-wide error type.

use thiserror::Error;

use crate::wecom::crypto::CryptoError;

pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Envelope error: {0}")]
    Envelope(#[from] CryptoError),
    #[error("Invalid payload: {0}")]
    Payload(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Upstream error: {0}")]
    Upstream(String),
    #[error("Outbound delivery failed: {0}")]
    Outbound(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidCommand(String),
    #[error("Background queue is full")]
    Busy,
    #[error("Scheduler error: {0}")]
    Scheduler(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serde(String),
}

impl From<std::io::Error> for HubError {
    fn from(e: std::io::Error) -> Self {
        HubError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Serde(e.to_string())
    }
}

impl From<quick_xml::DeError> for HubError {
    fn from(e: quick_xml::DeError) -> Self {
        HubError::Payload(e.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(e: reqwest::Error) -> Self {
        HubError::Http(e.to_string())
    }
}

impl From<toml::de::Error> for HubError {
    fn from(e: toml::de::Error) -> Self {
        HubError::Config(e.to_string())
    }
}
