//! Error types for quorumd

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Leadership Errors ===
    #[error("Not leader: current leader is {}", .0.as_deref().unwrap_or("unknown"))]
    NotLeader(Option<String>),

    // === Capacity Errors ===
    #[error("Insufficient capacity: requested {requested}, available {available}")]
    InsufficientCapacity { requested: u64, available: u64 },

    // === Membership Errors ===
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node already exists: {0}")]
    AlreadyExists(String),

    // === Wire Errors ===
    #[error("Corrupted frame: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// `NotLeader` is retryable against the actual leader, `ConnectionFailed`
    /// against the same peer once it is reachable again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotLeader(_) | Error::ConnectionFailed(_))
    }

    /// Leader hint carried by a `NotLeader` error
    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            Error::NotLeader(leader) => leader.as_deref(),
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_leader_display() {
        let err = Error::NotLeader(Some("node-c".into()));
        assert_eq!(err.to_string(), "Not leader: current leader is node-c");
        assert_eq!(err.leader_hint(), Some("node-c"));

        let err = Error::NotLeader(None);
        assert_eq!(err.to_string(), "Not leader: current leader is unknown");
        assert_eq!(err.leader_hint(), None);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::NotLeader(None).is_retryable());
        assert!(Error::ConnectionFailed("n1".into()).is_retryable());
        assert!(!Error::UnknownNode("n1".into()).is_retryable());
        assert!(!Error::InsufficientCapacity {
            requested: 5,
            available: 1
        }
        .is_retryable());
    }
}
