//! ISO/IEC 7816-4 status words and the status catalog.
//!
//! [`map`] is the only place where an error is turned into a status word.
//! The state machines return [`SimulatorError`] values and never pick status
//! words themselves.

use alloc::{collections::BTreeMap, format, string::String, vec::Vec};
use core::{fmt, time::Duration};

use tracing::Level;

use crate::{bytes2hex, error::SimulatorError};

/// Status word (SW1-SW2) appended to every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusWord(u16);

impl StatusWord {
    pub const SUCCESS: Self = Self(0x9000);
    pub const BAC_AUTHENTICATION_FAILED: Self = Self(0x6300);
    pub const PACE_AUTHENTICATION_FAILED: Self = Self(0x6301);
    pub const WRONG_LENGTH: Self = Self(0x6700);
    pub const SECURITY_STATUS_NOT_SATISFIED: Self = Self(0x6982);
    pub const CONDITIONS_NOT_SATISFIED: Self = Self(0x6985);
    pub const WRONG_DATA: Self = Self(0x6A80);
    pub const FILE_NOT_FOUND: Self = Self(0x6A82);
    pub const INS_NOT_SUPPORTED: Self = Self(0x6D00);
    pub const CLA_NOT_SUPPORTED: Self = Self(0x6E00);
    pub const NO_PRECISE_DIAGNOSIS: Self = Self(0x6F00);

    #[must_use]
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self(((sw1 as u16) << 8) | sw2 as u16)
    }

    #[must_use]
    pub const fn from_u16(status: u16) -> Self {
        Self(status)
    }

    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn sw1(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[must_use]
    pub const fn sw2(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Big-endian encoding, as it appears on the wire.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }

    /// Tracing level a response with this status word is logged at.
    #[must_use]
    pub const fn tracing_level(self) -> Level {
        if self.is_success() {
            Level::DEBUG
        } else if self.sw1() == 0x63 {
            Level::INFO
        } else {
            Level::WARN
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match (self.sw1(), self.sw2()) {
            (0x90, 0x00) => "Success",
            (0x63, 0x00) => "BAC authentication failed",
            (0x63, 0x01) => "PACE authentication failed",
            (0x67, 0x00) => "Wrong length",
            (0x69, 0x82) => "Security status not satisfied",
            (0x69, 0x85) => "Conditions of use not satisfied",
            (0x6A, 0x80) => "Incorrect parameters in the data field",
            (0x6A, 0x82) => "File not found",
            (0x6D, 0x00) => "Instruction not supported",
            (0x6E, 0x00) => "Class not supported",
            (0x6F, 0x00) => "No precise diagnosis",
            _ => "Unknown status",
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X} ({})", self.0, self.description())
    }
}

/// The encoded form of an outcome: status word plus everything a
/// surrounding application needs to present or log it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub status_word: StatusWord,
    /// Stable machine readable code, e.g. `WRONG_LENGTH`.
    pub error_code: &'static str,
    pub message: String,
    pub recoverable: bool,
    /// Set for transient failures only.
    pub retry_after: Option<Duration>,
    pub context: BTreeMap<&'static str, String>,
}

impl StatusResponse {
    /// Response bytes for this outcome: `payload || SW1 SW2`.
    #[must_use]
    pub fn to_bytes(&self, payload: &[u8]) -> Vec<u8> {
        encode(payload, self.status_word)
    }

    /// Whether the error may be retried after `retry_after`.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.retry_after.is_some()
    }
}

impl From<&SimulatorError> for StatusResponse {
    fn from(error: &SimulatorError) -> Self {
        map(error)
    }
}

/// Catalog entry: status word, error code, recoverable, retry delay in milliseconds.
type Policy = (StatusWord, &'static str, bool, Option<u64>);

/// Maps an error onto its fixed status policy.
///
/// # Examples
///
/// ```
/// use emrtd_emulator::{status::{map, StatusWord}, SimulatorError};
///
/// let response = map(&SimulatorError::UnsupportedClass { cla: 0x80 });
/// assert_eq!(response.status_word, StatusWord::CLA_NOT_SUPPORTED);
/// assert_eq!(response.error_code, "CLA_NOT_SUPPORTED");
/// assert!(!response.recoverable);
/// ```
#[must_use]
pub fn map(error: &SimulatorError) -> StatusResponse {
    let mut context = BTreeMap::new();
    context.insert("category", String::from(error.category().as_str()));

    let (status_word, error_code, recoverable, retry_ms): Policy = match *error {
        SimulatorError::InvalidDocument { field, ref value } => {
            context.insert("field", String::from(field));
            context.insert("value", value.clone());
            (StatusWord::WRONG_DATA, "INVALID_DOCUMENT_DATA", true, None)
        }
        SimulatorError::WrongLength {
            operation,
            expected,
            found,
        } => {
            context.insert("operation", String::from(operation));
            context.insert("expected", format!("{expected}"));
            context.insert("found", format!("{found}"));
            (StatusWord::WRONG_LENGTH, "WRONG_LENGTH", true, None)
        }
        SimulatorError::InvalidData { operation, reason } => {
            context.insert("operation", String::from(operation));
            context.insert("reason", String::from(reason));
            (StatusWord::WRONG_DATA, "WRONG_DATA", true, None)
        }
        SimulatorError::NfcUnavailable => (
            StatusWord::CONDITIONS_NOT_SATISFIED,
            "NFC_UNAVAILABLE",
            true,
            Some(1000),
        ),
        SimulatorError::ConnectionLost { ref reason } => {
            context.insert("reason", reason.clone());
            (
                StatusWord::CONDITIONS_NOT_SATISFIED,
                "CONNECTION_LOST",
                true,
                Some(500),
            )
        }
        SimulatorError::Timeout {
            ref operation,
            after,
        } => {
            context.insert("operation", operation.clone());
            context.insert("after_ms", format!("{}", after.as_millis()));
            (
                StatusWord::CONDITIONS_NOT_SATISFIED,
                "OPERATION_TIMEOUT",
                true,
                Some(250),
            )
        }
        SimulatorError::InvalidState { operation, state } => {
            context.insert("operation", String::from(operation));
            context.insert("state", String::from(state));
            (
                StatusWord::CONDITIONS_NOT_SATISFIED,
                "INVALID_STATE",
                true,
                None,
            )
        }
        SimulatorError::SecurityStatusNotSatisfied { operation } => {
            context.insert("operation", String::from(operation));
            (
                StatusWord::SECURITY_STATUS_NOT_SATISFIED,
                "SECURITY_STATUS_NOT_SATISFIED",
                true,
                None,
            )
        }
        SimulatorError::FileNotFound { ref identifier } => {
            context.insert("identifier", bytes2hex(identifier));
            (StatusWord::FILE_NOT_FOUND, "FILE_NOT_FOUND", true, None)
        }
        SimulatorError::UnsupportedInstruction { ins } => {
            context.insert("ins", format!("{ins:02X}"));
            (StatusWord::INS_NOT_SUPPORTED, "INS_NOT_SUPPORTED", false, None)
        }
        SimulatorError::UnsupportedClass { cla } => {
            context.insert("cla", format!("{cla:02X}"));
            (StatusWord::CLA_NOT_SUPPORTED, "CLA_NOT_SUPPORTED", false, None)
        }
        SimulatorError::BacAuthenticationFailed { reason } => {
            context.insert("reason", String::from(reason));
            (
                StatusWord::BAC_AUTHENTICATION_FAILED,
                "BAC_AUTHENTICATION_FAILED",
                true,
                Some(1000),
            )
        }
        SimulatorError::PaceAuthenticationFailed { step, reason } => {
            context.insert("step", format!("{step}"));
            context.insert("reason", String::from(reason));
            (
                StatusWord::PACE_AUTHENTICATION_FAILED,
                "PACE_AUTHENTICATION_FAILED",
                true,
                Some(1000),
            )
        }
        SimulatorError::CryptoFailure {
            operation,
            ref reason,
        } => {
            context.insert("operation", String::from(operation));
            context.insert("reason", reason.clone());
            (
                StatusWord::CONDITIONS_NOT_SATISFIED,
                "CRYPTO_FAILURE",
                true,
                Some(500),
            )
        }
        SimulatorError::NotInitialized { component } => {
            context.insert("component", String::from(component));
            (
                StatusWord::CONDITIONS_NOT_SATISFIED,
                "NOT_INITIALIZED",
                false,
                None,
            )
        }
        SimulatorError::CircuitOpen { ref operation } => {
            context.insert("operation", operation.clone());
            (
                StatusWord::CONDITIONS_NOT_SATISFIED,
                "CIRCUIT_OPEN",
                false,
                None,
            )
        }
        SimulatorError::Cancelled { ref correlation_id } => {
            context.insert("correlation_id", format!("{correlation_id}"));
            (
                StatusWord::CONDITIONS_NOT_SATISFIED,
                "OPERATION_CANCELLED",
                true,
                None,
            )
        }
        SimulatorError::Internal { ref reason } => {
            context.insert("reason", reason.clone());
            (
                StatusWord::NO_PRECISE_DIAGNOSIS,
                "INTERNAL_ERROR",
                false,
                None,
            )
        }
    };

    StatusResponse {
        status_word,
        error_code,
        message: format!("{error}"),
        recoverable,
        retry_after: retry_ms.map(Duration::from_millis),
        context,
    }
}

/// Concatenates `data` with the big-endian status word.
///
/// # Examples
///
/// ```
/// use emrtd_emulator::status::{encode, StatusWord};
///
/// assert_eq!(encode(&[0x01, 0x02], StatusWord::SUCCESS), vec![0x01, 0x02, 0x90, 0x00]);
/// assert_eq!(encode(&[], StatusWord::FILE_NOT_FOUND), vec![0x6A, 0x82]);
/// ```
#[must_use]
pub fn encode(data: &[u8], status_word: StatusWord) -> Vec<u8> {
    let mut response = Vec::with_capacity(data.len() + 2);
    response.extend_from_slice(data);
    response.extend_from_slice(&status_word.to_bytes());
    response
}

/// Appends the success status word to `data`.
#[must_use]
pub fn encode_success(data: &[u8]) -> Vec<u8> {
    encode(data, StatusWord::SUCCESS)
}

/// Encodes an error as a payload-less response.
#[must_use]
pub fn encode_error(error: &SimulatorError) -> Vec<u8> {
    map(error).to_bytes(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorCategory, resilience::CorrelationId};

    fn every_variant() -> Vec<SimulatorError> {
        vec![
            SimulatorError::InvalidDocument {
                field: "Document number",
                value: String::new(),
            },
            SimulatorError::WrongLength {
                operation: "GET CHALLENGE",
                expected: 8,
                found: 16,
            },
            SimulatorError::InvalidData {
                operation: "MSE:SET AT",
                reason: "empty",
            },
            SimulatorError::NfcUnavailable,
            SimulatorError::ConnectionLost {
                reason: "field lost".into(),
            },
            SimulatorError::Timeout {
                operation: "pace.key_agreement".into(),
                after: Duration::from_millis(5),
            },
            SimulatorError::InvalidState {
                operation: "GET CHALLENGE",
                state: "AUTHENTICATED",
            },
            SimulatorError::SecurityStatusNotSatisfied {
                operation: "READ BINARY",
            },
            SimulatorError::FileNotFound {
                identifier: vec![0x01],
            },
            SimulatorError::UnsupportedInstruction { ins: 0xCA },
            SimulatorError::UnsupportedClass { cla: 0x0C },
            SimulatorError::BacAuthenticationFailed { reason: "MAC" },
            SimulatorError::PaceAuthenticationFailed {
                step: 5,
                reason: "token",
            },
            SimulatorError::CryptoFailure {
                operation: "ECDH",
                reason: "point".into(),
            },
            SimulatorError::NotInitialized {
                component: "BAC session",
            },
            SimulatorError::CircuitOpen {
                operation: "bac".into(),
            },
            SimulatorError::Cancelled {
                correlation_id: CorrelationId::new(),
            },
            SimulatorError::Internal {
                reason: "join".into(),
            },
        ]
    }

    #[test]
    fn test_map_is_total_and_consistent() {
        for error in every_variant() {
            let response = map(&error);
            assert!(!response.status_word.is_success(), "{error}");
            assert_eq!(
                response.context.get("category").map(String::as_str),
                Some(error.category().as_str())
            );
            assert_eq!(response.message, format!("{error}"));
            // Transient categories carry a delay.
            if matches!(error.category(), ErrorCategory::Channel)
                || matches!(
                    error,
                    SimulatorError::CryptoFailure { .. }
                        | SimulatorError::BacAuthenticationFailed { .. }
                        | SimulatorError::PaceAuthenticationFailed { .. }
                )
            {
                assert!(response.retry_after.is_some_and(|d| !d.is_zero()), "{error}");
            }
        }
    }

    #[test]
    fn test_map_status_words() {
        let cases = [
            (
                SimulatorError::WrongLength {
                    operation: "x",
                    expected: 1,
                    found: 0,
                },
                0x6700,
            ),
            (
                SimulatorError::SecurityStatusNotSatisfied { operation: "x" },
                0x6982,
            ),
            (
                SimulatorError::InvalidState {
                    operation: "x",
                    state: "y",
                },
                0x6985,
            ),
            (SimulatorError::FileNotFound { identifier: vec![] }, 0x6A82),
            (
                SimulatorError::InvalidData {
                    operation: "x",
                    reason: "y",
                },
                0x6A80,
            ),
            (SimulatorError::UnsupportedInstruction { ins: 0 }, 0x6D00),
            (SimulatorError::UnsupportedClass { cla: 0 }, 0x6E00),
            (SimulatorError::BacAuthenticationFailed { reason: "x" }, 0x6300),
            (
                SimulatorError::PaceAuthenticationFailed {
                    step: 1,
                    reason: "x",
                },
                0x6301,
            ),
        ];
        for (error, sw) in cases {
            assert_eq!(map(&error).status_word.to_u16(), sw, "{error}");
        }
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode_success(&[0xAB]), vec![0xAB, 0x90, 0x00]);
        assert_eq!(
            encode_error(&SimulatorError::UnsupportedClass { cla: 0x80 }),
            vec![0x6E, 0x00]
        );
        assert_eq!(StatusWord::new(0x6A, 0x82), StatusWord::FILE_NOT_FOUND);
        assert_eq!(StatusWord::FILE_NOT_FOUND.sw1(), 0x6A);
        assert_eq!(StatusWord::FILE_NOT_FOUND.sw2(), 0x82);
    }
}
