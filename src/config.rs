use crate::error::ConfigError;
use std::time::Duration;

/// Core engine knobs. Construction validates the invariants between them;
/// a config that exists is a config the engine can run with.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    max_log_bytes: u64,
    snapshot_chunk_bytes: usize,
    election_timeout_min: Duration,
    election_timeout_max: Duration,
    heartbeat_interval: Duration,
    session_timeout: Duration,
}

impl EngineConfig {
    pub const DEFAULT_MAX_LOG_BYTES: u64 = 32 * 1024 * 1024;
    pub const DEFAULT_SNAPSHOT_CHUNK_BYTES: usize = 4096;
    pub const DEFAULT_ELECTION_MIN_MS: u64 = 150;
    pub const DEFAULT_ELECTION_MAX_MS: u64 = 300;
    pub const DEFAULT_HEARTBEAT_MS: u64 = 50;
    pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 5_000;

    pub fn new(
        max_log_bytes: u64,
        election_timeout_min: Duration,
        election_timeout_max: Duration,
        heartbeat_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            max_log_bytes,
            snapshot_chunk_bytes: Self::DEFAULT_SNAPSHOT_CHUNK_BYTES,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            session_timeout: Duration::from_millis(Self::DEFAULT_SESSION_TIMEOUT_MS),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_snapshot_chunk_bytes(mut self, bytes: usize) -> Result<Self, ConfigError> {
        self.snapshot_chunk_bytes = bytes;
        self.validate()?;
        Ok(self)
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn max_log_bytes(&self) -> u64 {
        self.max_log_bytes
    }

    pub fn snapshot_chunk_bytes(&self) -> usize {
        self.snapshot_chunk_bytes
    }

    pub fn election_timeout(&self) -> (Duration, Duration) {
        (self.election_timeout_min, self.election_timeout_max)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Client-side keep-alive cadence: half the session timeout.
    pub fn keep_alive_interval(&self) -> Duration {
        self.session_timeout / 2
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min > self.election_timeout_max {
            return Err(ConfigError::InvertedElectionWindow {
                min_ms: self.election_timeout_min.as_millis() as u64,
                max_ms: self.election_timeout_max.as_millis() as u64,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat_ms: self.heartbeat_interval.as_millis() as u64,
                election_min_ms: self.election_timeout_min.as_millis() as u64,
            });
        }
        if self.snapshot_chunk_bytes == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.max_log_bytes == 0 {
            return Err(ConfigError::ZeroMaxLogBytes);
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_log_bytes: Self::DEFAULT_MAX_LOG_BYTES,
            snapshot_chunk_bytes: Self::DEFAULT_SNAPSHOT_CHUNK_BYTES,
            election_timeout_min: Duration::from_millis(Self::DEFAULT_ELECTION_MIN_MS),
            election_timeout_max: Duration::from_millis(Self::DEFAULT_ELECTION_MAX_MS),
            heartbeat_interval: Duration::from_millis(Self::DEFAULT_HEARTBEAT_MS),
            session_timeout: Duration::from_millis(Self::DEFAULT_SESSION_TIMEOUT_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.heartbeat_interval() < config.election_timeout().0);
        assert_eq!(
            config.snapshot_chunk_bytes(),
            EngineConfig::DEFAULT_SNAPSHOT_CHUNK_BYTES
        );
    }

    #[test]
    fn heartbeat_must_beat_election_floor() {
        let err = EngineConfig::new(
            1024,
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::HeartbeatTooSlow { .. }));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let err = EngineConfig::new(
            1024,
            Duration::from_millis(300),
            Duration::from_millis(150),
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvertedElectionWindow { .. }));
    }

    #[test]
    fn chunk_size_cannot_be_zero() {
        let err = EngineConfig::default()
            .with_snapshot_chunk_bytes(0)
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroChunkSize));
    }

    #[test]
    fn keep_alive_is_half_session_timeout() {
        let config =
            EngineConfig::default().with_session_timeout(Duration::from_millis(3_000));
        assert_eq!(config.keep_alive_interval(), Duration::from_millis(1_500));
    }
}
