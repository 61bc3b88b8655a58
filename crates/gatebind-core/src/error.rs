//! Caller-facing error type.

use std::fmt;

use thiserror::Error;

use crate::payload::PayloadError;
use crate::protocol::FrameError;
use crate::radio::RadioError;

/// Error kinds reported to callers.
///
/// The numeric codes match the codes the gateway companion apps use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    NotFound,
    Disconnected,
    NotAvailable,
    InProgress,
    /// Malformed input or configuration.
    Invalid,
}

impl ErrorKind {
    pub fn code(&self) -> u16 {
        match self {
            ErrorKind::Timeout => 0x0001,
            ErrorKind::NotFound => 0x0002,
            ErrorKind::Disconnected => 0x0003,
            ErrorKind::NotAvailable => 0x0004,
            ErrorKind::InProgress => 0x0005,
            ErrorKind::Invalid => 0x0006,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::Disconnected => write!(f, "disconnected"),
            ErrorKind::NotAvailable => write!(f, "not available"),
            ErrorKind::InProgress => write!(f, "in progress"),
            ErrorKind::Invalid => write!(f, "invalid"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Command 0x{command:02X} timed out after {timeout_ms}ms")]
    Timeout { command: u8, timeout_ms: u64 },

    #[error("No matching device found within {timeout_ms}ms")]
    DeviceNotFound { timeout_ms: u64 },

    #[error("Device rejected the {step} token")]
    TokenRejected { step: &'static str },

    #[error("Link is not connected")]
    Disconnected,

    #[error("Bluetooth adapter not available: {0}")]
    NotAvailable(String),

    #[error("Command 0x{command:02X} already in progress")]
    InProgress { command: u8 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Timeout { .. } => ErrorKind::Timeout,
            ProvisionError::DeviceNotFound { .. } | ProvisionError::TokenRejected { .. } => {
                ErrorKind::NotFound
            }
            ProvisionError::Disconnected => ErrorKind::Disconnected,
            ProvisionError::NotAvailable(_) => ErrorKind::NotAvailable,
            ProvisionError::InProgress { .. } => ErrorKind::InProgress,
            ProvisionError::Radio(e) => match e {
                RadioError::AdapterUnavailable(_) => ErrorKind::NotAvailable,
                RadioError::Timeout { .. } => ErrorKind::Timeout,
                RadioError::NotConnected | RadioError::ConnectFailed(_) => ErrorKind::Disconnected,
                RadioError::ServiceNotFound(_)
                | RadioError::CharacteristicNotFound(_)
                | RadioError::WriteFailed(_)
                | RadioError::Backend(_) => ErrorKind::NotAvailable,
            },
            ProvisionError::InvalidConfig(_)
            | ProvisionError::Frame(_)
            | ProvisionError::Payload(_) => ErrorKind::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        assert_eq!(ErrorKind::Timeout.code(), 1);
        assert_eq!(ErrorKind::InProgress.code(), 5);
    }

    #[test]
    fn test_token_rejection_is_not_found() {
        let err = ProvisionError::TokenRejected { step: "verify" };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "Device rejected the verify token");
    }

    #[test]
    fn test_radio_errors_map_to_kinds() {
        let err: ProvisionError = RadioError::AdapterUnavailable("off".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotAvailable);
        let err: ProvisionError = RadioError::NotConnected.into();
        assert_eq!(err.kind(), ErrorKind::Disconnected);
    }
}
