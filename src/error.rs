//! Error types for tracelens

use thiserror::Error;

/// Errors that can occur while tracking
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Subscriber failed on '{topic}': {message}")]
    HandlerError { topic: String, message: String },

    #[error("Transport failed: {0}")]
    TransportError(String),

    #[error("Analyzer '{name}' failed to stop: {message}")]
    AnalyzerStopError { name: String, message: String },
}
