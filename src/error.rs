//! JavaScript-facing error presentation: wraps `torclient_core::TorError`
//! with the user-readable strings and `JsValue` conversion the bindings
//! layer needs, without re-deriving the error taxonomy itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wasm_bindgen::JsValue;

pub use torclient_core::error::{PoolFailureClass, TorError as CoreError};

pub type Result<T> = std::result::Result<T, TorError>;

/// Error codes for programmatic handling on the JS side. Numbered by the
/// core `pool_class()` plus a bucket for cancellation/closed so callers can
/// switch without matching on message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    RelayBad = 100,
    SourceBad = 200,
    Transient = 300,
    Terminal = 400,
}

/// Thin wrapper so this crate can add an "uninitialized client" case the
/// core error taxonomy has no business knowing about, while delegating
/// everything else to `torclient_core::TorError`.
#[derive(Error, Debug, Clone)]
pub enum TorError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("client not bootstrapped")]
    NotBootstrapped,
}

impl TorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TorError::Core(e) => match e.pool_class() {
                PoolFailureClass::RelayBad => ErrorCode::RelayBad,
                PoolFailureClass::SourceBad => ErrorCode::SourceBad,
                PoolFailureClass::Transient => ErrorCode::Transient,
                PoolFailureClass::Terminal => ErrorCode::Terminal,
            },
            TorError::NotBootstrapped => ErrorCode::Terminal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TorError::Core(e) if e.is_fatal())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TorError::Core(e) if e.is_retryable())
    }

    pub fn user_message(&self) -> String {
        match self {
            TorError::NotBootstrapped => {
                "The Tor client has not been initialized. Please call bootstrap() first.".into()
            }
            TorError::Core(e) if e.is_fatal() => format!(
                "Security error: {e}. Do not continue without investigating."
            ),
            TorError::Core(e) if e.is_retryable() => {
                format!("Temporary error: {e}. Retrying with a different relay.")
            }
            TorError::Core(e) => format!("Tor client error: {e}"),
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            TorError::NotBootstrapped => {
                "Call `bootstrap()` to initialize the Tor client before making requests.".into()
            }
            TorError::Core(e) if e.is_fatal() => {
                "This is a security error. Close the client and do not continue until investigated.".into()
            }
            TorError::Core(e) if e.is_retryable() => {
                "This error is usually temporary. Please wait a moment and try again.".into()
            }
            _ => "Please try again. If the problem persists, report a bug.".into(),
        }
    }
}

impl From<TorError> for JsValue {
    fn from(err: TorError) -> Self {
        JsValue::from_str(&err.to_string())
    }
}

/// Error information for JavaScript consumption.
#[derive(Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
    pub user_message: String,
    pub recovery_suggestion: String,
    pub is_fatal: bool,
    pub is_retryable: bool,
}

impl From<&TorError> for ErrorInfo {
    fn from(err: &TorError) -> Self {
        ErrorInfo {
            code: err.code() as u32,
            message: err.to_string(),
            user_message: err.user_message(),
            recovery_suggestion: err.recovery_suggestion(),
            is_fatal: err.is_fatal(),
            is_retryable: err.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_are_classified_from_core() {
        assert!(TorError::Core(CoreError::crypto("bad auth")).is_fatal());
        assert!(TorError::Core(CoreError::protocol("bad cell")).is_fatal());
        assert!(!TorError::Core(CoreError::Timeout("slow".into())).is_fatal());
        assert!(!TorError::NotBootstrapped.is_fatal());
    }

    #[test]
    fn retryable_errors_are_classified_from_core() {
        assert!(TorError::Core(CoreError::Timeout("slow".into())).is_retryable());
        assert!(TorError::Core(CoreError::transport("reset")).is_retryable());
        assert!(!TorError::Core(CoreError::crypto("bad auth")).is_retryable());
    }

    #[test]
    fn error_info_carries_code_and_messages() {
        let err = TorError::NotBootstrapped;
        let info = ErrorInfo::from(&err);
        assert_eq!(info.code, ErrorCode::Terminal as u32);
        assert!(!info.user_message.is_empty());
    }
}
