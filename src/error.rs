//! Custom error types for the application.
//!
//! This module defines the primary error type, `CamError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of errors that can occur,
//! from socket setup failures to snapshot parsing problems.
//!
//! A few variants double as control-flow signals rather than faults:
//!
//! - **`Timeout`**: returned by `TimestampListener::get` when no timing event
//!   arrives within the wait window. This is expected steady-state behavior
//!   for the acquisition loop and is never treated as an error by callers.
//! - **`TypeMismatch`**: raised per snapshot entry during restore; the entry
//!   is skipped and restoration continues with the remaining values.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::store::ParamType;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CamError>;

#[derive(Error, Debug)]
pub enum CamError {
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Unsupported camera model: {0}")]
    UnknownModel(String),

    #[error("Failed to bind multicast socket {group}:{port}: {source}")]
    Bind {
        group: Ipv4Addr,
        port: u16,
        source: std::io::Error,
    },

    #[error("Timed out after {0:.2} s waiting for a timing event")]
    Timeout(f64),

    #[error("Timestamp listener queue is closed")]
    ListenerStopped,

    #[error("Malformed timing datagram: {0}")]
    Decode(String),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Parameter {name} expects {expected:?}, got {actual:?}")]
    TypeMismatch {
        name: String,
        expected: ParamType,
        actual: ParamType,
    },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Reconfiguration failed: {0}")]
    Reconfigure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CamError {
    /// True for the expected no-event-arrived signal from `get`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CamError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinguishable() {
        assert!(CamError::Timeout(1.5).is_timeout());
        assert!(!CamError::ListenerStopped.is_timeout());
        assert!(!CamError::Decode("short".into()).is_timeout());
    }

    #[test]
    fn bind_error_names_the_endpoint() {
        let err = CamError::Bind {
            group: Ipv4Addr::new(239, 255, 16, 16),
            port: 10150,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        let msg = err.to_string();
        assert!(msg.contains("239.255.16.16"));
        assert!(msg.contains("10150"));
    }
}
