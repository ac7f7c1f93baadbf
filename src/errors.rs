use std::time::Duration;

use thiserror::Error;

/// Convenience alias for fallible bridge results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unified error type surfaced by the bridge.
///
/// Errors raised inside a turn's producer path never escape as panics; the
/// adapter converts them into a single `error` stream event followed by
/// `finish(error)`. Errors outside the stream (missing session id, bad
/// configuration) surface synchronously from the call that detected them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Config(String),

    #[error("no workflow session id in provider options or request headers")]
    MissingSessionId,

    #[error("not connected to the workflow service")]
    NotConnected,

    #[error("socket connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("socket connect failed: {0}")]
    ConnectFailed(String),

    #[error("workflow create failed: {0}")]
    WorkflowCreate(String),

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
