//! Broker error types.

use thiserror::Error;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised inside the broker core.
///
/// None of these are fatal; the policy for each (drop, skip, retry) is
/// applied at the call site. The only conditions that abort the process
/// are a failed endpoint bind at startup and an explicit shutdown.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A frame part contained a forbidden separator byte.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// A backend stdout line carried no client-id separator.
    #[error("malformed frame from backend")]
    MalformedFrame,

    /// Spawning a backend process failed.
    #[error("failed to spawn backend '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A reply was addressed to a client that is no longer connected.
    #[error("unknown client '{0}'")]
    UnknownClient(String),

    /// An init handshake named a profile with no backend mapping.
    #[error("unknown profile id '{0}'")]
    UnknownProfile(String),
}
