use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("election timeout window is inverted: min={min_ms}ms max={max_ms}ms")]
    InvertedElectionWindow { min_ms: u64, max_ms: u64 },
    #[error(
        "heartbeat interval {heartbeat_ms}ms must be strictly shorter than the minimum election timeout {election_min_ms}ms"
    )]
    HeartbeatTooSlow {
        heartbeat_ms: u64,
        election_min_ms: u64,
    },
    #[error("snapshot chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("max log size must be greater than zero")]
    ZeroMaxLogBytes,
}

/// Umbrella error for engine operations that touch durable state.
#[derive(Debug, Error)]
pub enum ReplicorError {
    #[error(transparent)]
    Log(#[from] crate::storage::LogError),
    #[error(transparent)]
    Metadata(#[from] crate::context::MetadataError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ReplicorError {
    fn from(err: serde_json::Error) -> Self {
        ReplicorError::Serialization(SerializationError::from(err))
    }
}
