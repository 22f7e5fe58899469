//! Bridge error types.
//!
//! Failures fall into the categories the bridge acts on internally:
//! transient conditions are retried, handshake failures abort startup,
//! protocol violations and peer death disable the bridge. Errors reported
//! by the transported API itself are not represented here; they ride
//! through `Response` payloads untouched.

use std::fmt;
use std::io;

/// Result alias used throughout the bridge crates.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug)]
pub enum BridgeError {
    /// Queue full or semaphore timeout while the peer is believed alive.
    /// Retryable per the configured budget.
    Timeout {
        what: &'static str,
    },
    /// Startup handshake failed (version mismatch, missing Syn/Ack/Continue).
    Handshake {
        detail: String,
    },
    /// Protocol invariant broken: oversized batch, overlapping command
    /// scopes, unknown shadow handle. Not recoverable.
    Protocol {
        detail: String,
    },
    /// The peer process exited while the bridge was running.
    PeerDied,
    /// The bridge was already disabled when the operation was attempted.
    Disabled {
        what: &'static str,
    },
    /// Underlying OS failure (mapping, semaphore, spawn).
    Os(io::Error),
}

impl BridgeError {
    pub fn handshake(detail: impl Into<String>) -> Self {
        BridgeError::Handshake {
            detail: detail.into(),
        }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        BridgeError::Protocol {
            detail: detail.into(),
        }
    }

    /// True for conditions worth retrying under the configured budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }

    /// True for conditions that must disable the bridge.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Protocol { .. } | BridgeError::PeerDied
        )
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Timeout { what } => write!(f, "timed out waiting for {what}"),
            BridgeError::Handshake { detail } => write!(f, "handshake failed: {detail}"),
            BridgeError::Protocol { detail } => write!(f, "protocol violation: {detail}"),
            BridgeError::PeerDied => write!(f, "peer process exited unexpectedly"),
            BridgeError::Disabled { what } => {
                write!(f, "bridge disabled, dropping {what}")
            }
            BridgeError::Os(err) => write!(f, "os error: {err}"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Os(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        BridgeError::Os(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert!(BridgeError::Timeout { what: "x" }.is_transient());
        assert!(!BridgeError::Timeout { what: "x" }.is_fatal());
        assert!(BridgeError::protocol("nested scopes").is_fatal());
        assert!(BridgeError::PeerDied.is_fatal());
        assert!(!BridgeError::handshake("version").is_fatal());
        assert!(!BridgeError::handshake("version").is_transient());
    }

    #[test]
    fn display_names_the_dropped_operation() {
        let err = BridgeError::Disabled { what: "present" };
        assert!(err.to_string().contains("present"));
    }

    #[test]
    fn os_error_source() {
        use std::error::Error;
        let err = BridgeError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.source().is_some());
    }
}
