//! Error types for prefork.

use thiserror::Error;

/// Main error type for prefork.
#[derive(Error, Debug)]
pub enum PreforkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Signal channel protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to map heartbeat page for worker {index}: {source}")]
    Heartbeat {
        index: usize,
        source: nix::errno::Errno,
    },
}

/// Result type alias for prefork operations.
pub type Result<T> = std::result::Result<T, PreforkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use std::io;

    #[test]
    fn test_invalid_signal_error_message() {
        let err = PreforkError::InvalidSignal("SIGBOGUS".to_string());
        let msg = err.to_string();
        assert!(msg.contains("SIGBOGUS"));
        assert!(msg.contains("Invalid signal"));
    }

    #[test]
    fn test_protocol_error_message() {
        let err = PreforkError::Protocol("short read of 3 bytes".to_string());
        assert!(err.to_string().contains("3 bytes"));
        assert!(err.to_string().contains("protocol violation"));
    }

    #[test]
    fn test_heartbeat_error_message() {
        let err = PreforkError::Heartbeat {
            index: 7,
            source: Errno::ENOMEM,
        };
        let msg = err.to_string();
        assert!(msg.contains("worker 7"));
        assert!(msg.contains("heartbeat"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PreforkError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_errno_conversion() {
        let err: PreforkError = Errno::EMFILE.into();
        assert!(matches!(err, PreforkError::Sys(Errno::EMFILE)));
        assert!(err.to_string().starts_with("System call failed"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_err() -> Result<()> {
            Err(PreforkError::Config("zero slots".into()))
        }
        assert!(returns_err().is_err());
    }
}
