use thiserror::Error;

/// Errors that can occur in the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// IO error occurred (file operations, sockets, pipes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (connection failed, peer hung up, etc.)
    #[error("Network error: {0}")]
    Network(String),

    /// Not enough device or host memory for the KV cache or runtime buffers.
    ///
    /// Fatal at startup: it reflects a static resource shortfall and is never retried.
    #[error("Insufficient memory: {0}")]
    InsufficientMemory(String),

    /// Operation attempted in the wrong lifecycle state (e.g. forward after close)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The step barrier was aborted while this rank was waiting on it
    #[error("Barrier aborted")]
    BarrierAborted,

    /// Process group join or collective failure
    #[error("Process group error: {0}")]
    Group(String),

    /// Error raised by the compute backend
    #[error("Backend error: {0}")]
    Backend(String),

    /// Error raised by the cache engine
    #[error("Cache error: {0}")]
    Cache(String),

    /// A subordinate worker process could not be launched
    #[error("Worker spawn error: {0}")]
    WorkerSpawn(String),
}

impl AgentError {
    /// Whether this error is the clean-shutdown signal rather than a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, AgentError::BarrierAborted)
    }
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<toml::ser::Error> for AgentError {
    fn from(e: toml::ser::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for AgentError {
    fn from(e: toml::de::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::Config("tp must be at least 1".to_string());
        assert_eq!(err.to_string(), "Configuration error: tp must be at least 1");

        let err = AgentError::InsufficientMemory("No enough gpu memory for kv cache.".into());
        assert_eq!(
            err.to_string(),
            "Insufficient memory: No enough gpu memory for kv cache."
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let agent_err: AgentError = io_err.into();
        assert!(agent_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_is_abort() {
        assert!(AgentError::BarrierAborted.is_abort());
        assert!(!AgentError::Group("rank mismatch".into()).is_abort());
    }

    #[test]
    fn test_toml_error_conversion() {
        let parse: std::result::Result<toml::Value, _> = toml::from_str("not = [valid");
        let err: AgentError = parse.unwrap_err().into();
        assert!(matches!(err, AgentError::Serialization(_)));
    }
}
