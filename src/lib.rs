//! A library that emulates the chip of an eMRTD.
//!
//! A library that emulates the contactless chip of an eMRTD (Electronic
//! Machine Readable Travel Document) for testing NFC readers and terminal
//! software.
//!
//! The `emrtd-emulator` crate answers command APDUs the way an ICAO Doc 9303
//! passport chip does: it selects the eMRTD application, runs Basic Access
//! Control (BAC) or Password Authenticated Connection Establishment (PACE)
//! with the terminal and serves elementary files once access control
//! completed. Every failure is answered with an ISO/IEC 7816-4 status word.
//!
//! **NOTE:**
//! Please note that this crate is provided 'as is' and is not considered production-ready. Use at your own risk.
//!
//! Secure messaging, Active Authentication (AA), Chip Authentication (CA) and
//! EAC are **not** emulated. PACE runs an ephemeral ECDH key agreement bound to
//! the encrypted nonce, on the NIST P-256 curve only.
//!
//! # Quick Start
//!
//! ```
//! use emrtd_emulator::{bytes2hex, DocumentRecord, EmulatorConfig, PassportEmulator, SimulatorError};
//! use tracing::info;
//!
//! fn main() -> Result<(), SimulatorError> {
//!     let _ = tracing_subscriber::fmt()
//!         .with_max_level(tracing::Level::TRACE)
//!         .try_init();
//!
//!     let config = EmulatorConfig::default().with_file(0x1E, b"\x60\x16\x5F\x01\x04\x30\x31\x30\x37".to_vec());
//!     let mut emulator = PassportEmulator::new(config);
//!     emulator.load_document(&DocumentRecord {
//!         document_number: "L898902C<".into(),
//!         date_of_birth: "690806".into(),
//!         date_of_expiry: "940623".into(),
//!         ..DocumentRecord::default()
//!     })?;
//!
//!     // The host's card emulation service delivers APDUs one at a time.
//!     emulator.on_connected();
//!
//!     // Select eMRTD application
//!     let response = emulator.process_apdu(b"\x00\xA4\x04\x0C\x07\xA0\x00\x00\x02\x47\x10\x01");
//!     info!("SELECT: {}", bytes2hex(&response));
//!
//!     // Request an 8 byte random number
//!     let response = emulator.process_apdu(b"\x00\x84\x00\x00\x08");
//!     info!("GET CHALLENGE: {}", bytes2hex(&response));
//!
//!     // Files stay protected until BAC or PACE completed
//!     let response = emulator.process_apdu(b"\x00\xB0\x9E\x00\x04");
//!     assert_eq!(response, b"\x69\x82");
//!
//!     emulator.on_deactivated("field off");
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

extern crate alloc;
use alloc::string::String;
use core::fmt::Write;

pub mod apdu;
pub mod bac;
pub mod config;
pub mod crypto;
pub mod document;
pub mod emulator;
pub mod error;
pub mod events;
pub mod pace;
pub mod resilience;
pub mod session;
pub mod status;
pub mod tlv;

pub use config::{EmulatorConfig, SupportedProtocols};
pub use document::{DocumentRecord, Sex};
pub use emulator::PassportEmulator;
pub use error::{ErrorCategory, SimulatorError};
pub use events::{EventSink, SimulatorEvent, TracingEventSink};
pub use session::{HandshakeSession, Protocol, SessionHandle};
pub use status::{StatusResponse, StatusWord};

/// Helper function that converts a byte slice into a hex string.
///
/// # Arguments
///
/// * `bytes` - Bytes to be converted to a hex string.
///
/// # Returns
///
/// A hex string representation of the input bytes.
///
/// # Example
///
/// ```
/// use emrtd_emulator::bytes2hex;
/// let bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
/// let hex_string = bytes2hex(&bytes);
/// assert_eq!(hex_string, "DEADBEEF");
/// ```
#[must_use]
pub fn bytes2hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, &byte| {
        // Writing to a `String` cannot fail.
        let _ = write!(&mut acc, "{byte:02X}");
        acc
    })
}
