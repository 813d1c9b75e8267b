//! The closed error taxonomy of the emulator.
//!
//! Every failure the engine can produce is one variant of [`SimulatorError`].
//! The status catalog in [`crate::status`] maps each variant to exactly one
//! status word, so nothing leaves the command channel unencoded.

use alloc::{string::String, vec::Vec};
use core::{fmt, time::Duration};

use crate::{bytes2hex, resilience::CorrelationId};

/// Broad class of a [`SimulatorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed or missing document fields, or malformed command payloads.
    Validation,
    /// The underlying contactless transport is unavailable or went away.
    Channel,
    /// Illegal state transitions, rejected commands and failed authentications.
    Protocol,
    /// Uninitialised dependencies and unexpected internal faults.
    System,
}

impl ErrorCategory {
    /// Lower-case name used in structured log context.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Channel => "channel",
            Self::Protocol => "protocol",
            Self::System => "system",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SimulatorError {
    InvalidDocument {
        field: &'static str,
        value: String,
    },
    WrongLength {
        operation: &'static str,
        expected: usize,
        found: usize,
    },
    InvalidData {
        operation: &'static str,
        reason: &'static str,
    },
    NfcUnavailable,
    ConnectionLost {
        reason: String,
    },
    Timeout {
        operation: String,
        after: Duration,
    },
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    SecurityStatusNotSatisfied {
        operation: &'static str,
    },
    FileNotFound {
        identifier: Vec<u8>,
    },
    UnsupportedInstruction {
        ins: u8,
    },
    UnsupportedClass {
        cla: u8,
    },
    BacAuthenticationFailed {
        reason: &'static str,
    },
    PaceAuthenticationFailed {
        step: u8,
        reason: &'static str,
    },
    CryptoFailure {
        operation: &'static str,
        reason: String,
    },
    NotInitialized {
        component: &'static str,
    },
    CircuitOpen {
        operation: String,
    },
    Cancelled {
        correlation_id: CorrelationId,
    },
    Internal {
        reason: String,
    },
}

impl SimulatorError {
    /// Returns the category this error belongs to.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match *self {
            Self::InvalidDocument { .. } | Self::WrongLength { .. } | Self::InvalidData { .. } => {
                ErrorCategory::Validation
            }
            Self::NfcUnavailable | Self::ConnectionLost { .. } | Self::Timeout { .. } => {
                ErrorCategory::Channel
            }
            Self::InvalidState { .. }
            | Self::SecurityStatusNotSatisfied { .. }
            | Self::FileNotFound { .. }
            | Self::UnsupportedInstruction { .. }
            | Self::UnsupportedClass { .. }
            | Self::BacAuthenticationFailed { .. }
            | Self::PaceAuthenticationFailed { .. }
            | Self::CryptoFailure { .. } => ErrorCategory::Protocol,
            Self::NotInitialized { .. }
            | Self::CircuitOpen { .. }
            | Self::Cancelled { .. }
            | Self::Internal { .. } => ErrorCategory::System,
        }
    }
}

impl fmt::Display for SimulatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::InvalidDocument { field, ref value } => {
                write!(f, "Document field {field} is invalid: {value}")
            }
            Self::WrongLength {
                operation,
                expected,
                found,
            } => write!(
                f,
                "Wrong data length during {operation}, expected: {expected}, found: {found}"
            ),
            Self::InvalidData { operation, reason } => {
                write!(f, "Invalid data during {operation}: {reason}")
            }
            Self::NfcUnavailable => write!(f, "NFC is not available on this device"),
            Self::ConnectionLost { ref reason } => {
                write!(f, "Connection to the terminal was lost: {reason}")
            }
            Self::Timeout {
                ref operation,
                after,
            } => write!(f, "{operation} did not complete within {after:?}"),
            Self::InvalidState { operation, state } => {
                write!(f, "{operation} is not allowed in state {state}")
            }
            Self::SecurityStatusNotSatisfied { operation } => {
                write!(f, "{operation} requires an authenticated session")
            }
            Self::FileNotFound { ref identifier } => {
                write!(f, "File or application not found: {}", bytes2hex(identifier))
            }
            Self::UnsupportedInstruction { ins } => {
                write!(f, "Instruction {ins:02X} is not supported")
            }
            Self::UnsupportedClass { cla } => write!(f, "Class {cla:02X} is not supported"),
            Self::BacAuthenticationFailed { reason } => {
                write!(f, "BAC authentication failed: {reason}")
            }
            Self::PaceAuthenticationFailed { step, reason } => {
                write!(f, "PACE authentication failed at step {step}: {reason}")
            }
            Self::CryptoFailure {
                operation,
                ref reason,
            } => write!(f, "Cryptographic failure during {operation}: {reason}"),
            Self::NotInitialized { component } => write!(f, "{component} is not initialized"),
            Self::CircuitOpen { ref operation } => {
                write!(f, "Circuit breaker for {operation} is open")
            }
            Self::Cancelled { ref correlation_id } => {
                write!(f, "Operation {correlation_id} was cancelled")
            }
            Self::Internal { ref reason } => write!(f, "Internal error: {reason}"),
        }
    }
}

impl std::error::Error for SimulatorError {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_category_groups() {
        assert_eq!(
            SimulatorError::WrongLength {
                operation: "EXTERNAL AUTHENTICATE",
                expected: 40,
                found: 3
            }
            .category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            SimulatorError::NfcUnavailable.category(),
            ErrorCategory::Channel
        );
        assert_eq!(
            SimulatorError::BacAuthenticationFailed { reason: "MAC" }.category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            SimulatorError::CircuitOpen {
                operation: "pace.key_agreement".into()
            }
            .category(),
            ErrorCategory::System
        );
    }

    #[test]
    fn test_display() {
        let err = SimulatorError::FileNotFound {
            identifier: vec![0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x02],
        };
        assert_eq!(
            err.to_string(),
            "File or application not found: A0000002471002"
        );
        let err = SimulatorError::UnsupportedInstruction { ins: 0xCA };
        assert_eq!(err.to_string(), "Instruction CA is not supported");
    }
}
