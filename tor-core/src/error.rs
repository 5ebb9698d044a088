//! Error taxonomy shared across the protocol core.
//!
//! Kinds follow the propagation policy used by the rest of the client:
//! `Parse` and `Transport` failures are locally recoverable (retry with a
//! different source/relay), `Protocol`/`Crypto`/`Expired` are fatal for the
//! affected circuit or link, `Timeout` is retried at the pool layer, and
//! `Cancelled`/`Closed` are always surfaced untouched.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

#[derive(Error, Debug, Clone)]
pub enum TorError {
    /// Malformed on-wire or on-disk data. Caller should retry with another source.
    #[error("parse error: {0}")]
    Parse(String),

    /// Peer violated the protocol (unknown command, negative window, bad digest).
    /// Fatal for the affected circuit or link.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Signature mismatch or failed handshake authentication. Fatal for the
    /// affected object; the relay that caused it should be demoted.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A specified deadline elapsed. Retried at the pool layer with a
    /// different relay.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Network-level I/O failure. Recovered by reconnecting the transport
    /// session once, then surfaced.
    #[error("transport error: {0}")]
    Transport(String),

    /// A cert or consensus document is past its `notAfter`/`valid-until`.
    /// Treated as a `Protocol` failure by callers that don't care about the
    /// distinction.
    #[error("expired: {0}")]
    Expired(String),

    /// The consumer requested cancellation. Always surfaced, never retried.
    #[error("cancelled")]
    Cancelled,

    /// Operation attempted on a disposed resource. Always surfaced.
    #[error("closed: {0}")]
    Closed(String),
}

impl TorError {
    pub fn parse(msg: impl Into<String>) -> Self {
        TorError::Parse(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        TorError::Protocol(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        TorError::Crypto(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        TorError::Transport(msg.into())
    }

    /// Classification used by the resource pool to decide whether a failure
    /// should count against the relay set that produced it, the directory
    /// source, or is merely transient.
    pub fn pool_class(&self) -> PoolFailureClass {
        match self {
            TorError::Timeout(_) | TorError::Crypto(_) | TorError::Protocol(_) | TorError::Expired(_) => {
                PoolFailureClass::RelayBad
            }
            TorError::Parse(_) => PoolFailureClass::SourceBad,
            TorError::Transport(_) => PoolFailureClass::Transient,
            TorError::Cancelled | TorError::Closed(_) => PoolFailureClass::Terminal,
        }
    }

    /// Whether this error indicates a security problem: the affected
    /// circuit/link/document must not be trusted going forward.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorError::Crypto(_) | TorError::Protocol(_) | TorError::Expired(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::Timeout(_) | TorError::Transport(_) | TorError::Parse(_)
        )
    }
}

/// How the resource pool should account for a build failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureClass {
    /// Blame the relay set used for this attempt.
    RelayBad,
    /// Blame the directory source that served bad data.
    SourceBad,
    /// Likely transient network trouble; don't blame anyone.
    Transient,
    /// Cancellation or use of a disposed resource; not a failure to record.
    Terminal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_classification() {
        assert_eq!(TorError::Timeout("x".into()).pool_class(), PoolFailureClass::RelayBad);
        assert_eq!(TorError::Parse("x".into()).pool_class(), PoolFailureClass::SourceBad);
        assert_eq!(TorError::Transport("x".into()).pool_class(), PoolFailureClass::Transient);
        assert_eq!(TorError::Cancelled.pool_class(), PoolFailureClass::Terminal);
    }

    #[test]
    fn fatal_errors() {
        assert!(TorError::crypto("bad auth").is_fatal());
        assert!(TorError::protocol("bad cell").is_fatal());
        assert!(!TorError::Timeout("x".into()).is_fatal());
    }

    #[test]
    fn retryable_errors() {
        assert!(TorError::Timeout("x".into()).is_retryable());
        assert!(TorError::transport("reset").is_retryable());
        assert!(!TorError::crypto("bad auth").is_retryable());
    }
}
