//! Decoding of command APDUs received from the terminal.
//!
//! Only short-length APDUs (ISO/IEC 7816-4 cases 1 to 4) with the
//! interindustry class byte `00` are accepted. Every rejection carries the
//! status response it will be answered with.

use alloc::vec::Vec;
use core::fmt;

use tracing::{error, trace};

use crate::{
    bytes2hex,
    error::SimulatorError,
    status::{map, StatusResponse, StatusWord},
};

/// Application identifier of the LDS1 eMRTD application.
pub const EMRTD_AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];
/// The only class byte accepted.
pub const SUPPORTED_CLA: u8 = 0x00;
/// Length of the BAC challenge requested by GET CHALLENGE.
pub const CHALLENGE_LEN: usize = 8;
/// P1/P2 of MSE:SET AT selecting mutual authentication (PACE).
pub const MSE_SET_AT_P1P2: (u8, u8) = (0xC1, 0xA4);

pub const INS_SELECT: u8 = 0xA4;
pub const INS_READ_BINARY: u8 = 0xB0;
pub const INS_GET_CHALLENGE: u8 = 0x84;
pub const INS_EXTERNAL_AUTHENTICATE: u8 = 0x82;
pub const INS_INTERNAL_AUTHENTICATE: u8 = 0x88;
pub const INS_MSE: u8 = 0x22;
pub const INS_GENERAL_AUTHENTICATE: u8 = 0x86;

/// Closed set of command kinds the emulator distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApduCommandKind {
    Select,
    ReadBinary,
    GetChallenge,
    ExternalAuthenticate,
    InternalAuthenticate,
    MseSetAt,
    GeneralAuthenticate,
    Unsupported,
    Invalid,
}

impl ApduCommandKind {
    /// Classifies a command by its instruction byte (and P1/P2 for MSE).
    #[must_use]
    pub const fn classify(ins: u8, p1: u8, p2: u8) -> Self {
        match ins {
            INS_SELECT => Self::Select,
            INS_READ_BINARY => Self::ReadBinary,
            INS_GET_CHALLENGE => Self::GetChallenge,
            INS_EXTERNAL_AUTHENTICATE => Self::ExternalAuthenticate,
            INS_INTERNAL_AUTHENTICATE => Self::InternalAuthenticate,
            INS_MSE if p1 == MSE_SET_AT_P1P2.0 && p2 == MSE_SET_AT_P1P2.1 => Self::MseSetAt,
            INS_GENERAL_AUTHENTICATE => Self::GeneralAuthenticate,
            _ => Self::Unsupported,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::ReadBinary => "READ BINARY",
            Self::GetChallenge => "GET CHALLENGE",
            Self::ExternalAuthenticate => "EXTERNAL AUTHENTICATE",
            Self::InternalAuthenticate => "INTERNAL AUTHENTICATE",
            Self::MseSetAt => "MSE:SET AT",
            Self::GeneralAuthenticate => "GENERAL AUTHENTICATE",
            Self::Unsupported => "UNSUPPORTED",
            Self::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for ApduCommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded command Application Protocol Data Unit (APDU).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    /// Class byte of the APDU
    pub cla: u8,
    /// Instruction byte of the APDU
    pub ins: u8,
    /// Parameter 1 byte of the APDU
    pub p1: u8,
    /// Parameter 2 byte of the APDU
    pub p2: u8,
    /// Command data field of the APDU
    pub data: Option<Vec<u8>>,
    /// Expected length of the response data field (Le), `00` decodes to 256
    pub le: Option<usize>,
}

impl ApduCommand {
    /// Retrieves the command header of the APDU.
    ///
    /// # Examples
    ///
    /// ```
    /// use emrtd_emulator::apdu::{decode, ParseOutcome};
    /// use hex_literal::hex;
    ///
    /// let ParseOutcome::Command(parsed) = decode(&hex!("0084000008")) else {
    ///     panic!("GET CHALLENGE must decode");
    /// };
    /// assert_eq!(parsed.command.header(), hex!("00840000"));
    /// ```
    #[must_use]
    pub const fn header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    /// Command data, empty if the APDU carried none.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    /// Re-serializes the command in short form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header().to_vec();
        if let Some(ref data) = self.data {
            // Lc was a single byte on the way in.
            bytes.push(data.len() as u8);
            bytes.extend_from_slice(data);
        }
        if let Some(le) = self.le {
            bytes.push(if le == 256 { 0 } else { le as u8 });
        }
        bytes
    }
}

/// A command of a known kind that passed every codec check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub kind: ApduCommandKind,
    pub command: ApduCommand,
}

/// A command the codec refused, with the response it must be answered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: ApduCommandKind,
    pub error: SimulatorError,
    pub response: StatusResponse,
    /// Offending bytes kept for diagnostics, e.g. an unknown AID.
    pub data: Vec<u8>,
}

impl Rejection {
    fn new(kind: ApduCommandKind, error: SimulatorError, data: Vec<u8>) -> Self {
        let response = map(&error);
        Self {
            kind,
            error,
            response,
            data,
        }
    }
}

/// Result of [`decode`]: either a validated command or a rejection, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Command(ParsedCommand),
    Rejected(Rejection),
}

impl ParseOutcome {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Command(_))
    }

    #[must_use]
    pub const fn kind(&self) -> ApduCommandKind {
        match self {
            Self::Command(parsed) => parsed.kind,
            Self::Rejected(rejection) => rejection.kind,
        }
    }

    /// `9000` for accepted commands, otherwise the precomputed status word.
    #[must_use]
    pub const fn status_word(&self) -> StatusWord {
        match self {
            Self::Command(_) => StatusWord::SUCCESS,
            Self::Rejected(rejection) => rejection.response.status_word,
        }
    }

    /// The extracted command data, or the offending data of a rejection.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Command(parsed) => parsed.command.data(),
            Self::Rejected(rejection) => &rejection.data,
        }
    }
}

/// Splits the body after the header into `(data, le)`.
///
/// Lc must announce exactly the data that follows, optionally followed by a
/// single Le byte. Extended lengths are not supported.
fn split_body(body: &[u8]) -> Result<(Option<Vec<u8>>, Option<usize>), SimulatorError> {
    let le_of = |b: u8| if b == 0 { 256 } else { usize::from(b) };
    match body {
        [] => Ok((None, None)),
        [le] => Ok((None, Some(le_of(*le)))),
        [lc, rest @ ..] => {
            let lc = usize::from(*lc);
            if lc == 0 {
                error!("Extended length APDUs are not supported");
                return Err(SimulatorError::WrongLength {
                    operation: "APDU decoding",
                    expected: 1,
                    found: 0,
                });
            }
            match rest.len().checked_sub(lc) {
                Some(0) => Ok((Some(rest.to_vec()), None)),
                Some(1) => Ok((Some(rest[..lc].to_vec()), Some(le_of(rest[lc])))),
                Some(_) | None => {
                    error!(
                        "Lc announces {lc} bytes of data, but {} bytes follow the Lc byte",
                        rest.len()
                    );
                    Err(SimulatorError::WrongLength {
                        operation: "APDU decoding",
                        expected: lc,
                        found: rest.len(),
                    })
                }
            }
        }
    }
}

/// Decodes raw command bytes into a [`ParseOutcome`].
///
/// # Examples
///
/// ```
/// use emrtd_emulator::apdu::{decode, ApduCommandKind};
/// use hex_literal::hex;
///
/// let outcome = decode(&hex!("00A4040C07A0000002471001"));
/// assert!(outcome.is_valid());
/// assert_eq!(outcome.kind(), ApduCommandKind::Select);
///
/// let outcome = decode(&hex!("0084000010"));
/// assert!(!outcome.is_valid());
/// assert_eq!(outcome.status_word().to_u16(), 0x6700);
/// ```
#[must_use]
pub fn decode(bytes: &[u8]) -> ParseOutcome {
    trace!("Decoding APDU: {}", bytes2hex(bytes));

    let [cla, ins, p1, p2, body @ ..] = bytes else {
        error!("APDU must be at least 4 bytes long, found {}", bytes.len());
        return ParseOutcome::Rejected(Rejection::new(
            ApduCommandKind::Invalid,
            SimulatorError::WrongLength {
                operation: "APDU decoding",
                expected: 4,
                found: bytes.len(),
            },
            bytes.to_vec(),
        ));
    };
    let (cla, ins, p1, p2) = (*cla, *ins, *p1, *p2);

    if cla != SUPPORTED_CLA {
        error!("Unsupported class byte: {cla:02X}");
        return ParseOutcome::Rejected(Rejection::new(
            ApduCommandKind::Invalid,
            SimulatorError::UnsupportedClass { cla },
            Vec::new(),
        ));
    }

    let (data, le) = match split_body(body) {
        Ok(split) => split,
        Err(err) => {
            return ParseOutcome::Rejected(Rejection::new(
                ApduCommandKind::Invalid,
                err,
                body.to_vec(),
            ))
        }
    };
    let command = ApduCommand {
        cla,
        ins,
        p1,
        p2,
        data,
        le,
    };

    let kind = ApduCommandKind::classify(ins, p1, p2);
    match kind {
        ApduCommandKind::Unsupported => {
            error!("Unsupported instruction {ins:02X} (P1 {p1:02X}, P2 {p2:02X})");
            ParseOutcome::Rejected(Rejection::new(
                kind,
                SimulatorError::UnsupportedInstruction { ins },
                Vec::new(),
            ))
        }
        ApduCommandKind::Select if command.data() != EMRTD_AID => {
            error!(
                "SELECT for unknown application: {}",
                bytes2hex(command.data())
            );
            let identifier = command.data().to_vec();
            ParseOutcome::Rejected(Rejection::new(
                kind,
                SimulatorError::FileNotFound {
                    identifier: identifier.clone(),
                },
                identifier,
            ))
        }
        ApduCommandKind::GetChallenge if command.le != Some(CHALLENGE_LEN) => {
            error!(
                "GET CHALLENGE must request exactly {CHALLENGE_LEN} bytes, requested {:?}",
                command.le
            );
            ParseOutcome::Rejected(Rejection::new(
                kind,
                SimulatorError::WrongLength {
                    operation: "GET CHALLENGE",
                    expected: CHALLENGE_LEN,
                    found: command.le.unwrap_or_default(),
                },
                Vec::new(),
            ))
        }
        _ => {
            trace!("Decoded {kind}: {command:02X?}");
            ParseOutcome::Command(ParsedCommand { kind, command })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_decode_select_aid() {
        let outcome = decode(&hex!("00A4040007A0000002471001"));
        assert!(outcome.is_valid());
        assert_eq!(outcome.kind(), ApduCommandKind::Select);
        assert_eq!(outcome.payload(), EMRTD_AID);
        assert_eq!(outcome.status_word(), StatusWord::SUCCESS);
    }

    #[test]
    fn test_decode_select_unknown_aid() {
        let outcome = decode(&hex!("00A4040007A0000002471002"));
        assert!(!outcome.is_valid());
        assert_eq!(outcome.kind(), ApduCommandKind::Select);
        assert_eq!(outcome.status_word().to_u16(), 0x6A82);
        assert_eq!(outcome.payload(), hex!("A0000002471002"));
    }

    #[test]
    fn test_decode_get_challenge() {
        let outcome = decode(&hex!("0084000008"));
        assert!(outcome.is_valid());
        assert_eq!(outcome.kind(), ApduCommandKind::GetChallenge);

        let outcome = decode(&hex!("0084000010"));
        assert!(!outcome.is_valid());
        assert_eq!(outcome.status_word().to_u16(), 0x6700);

        // Le missing altogether.
        let outcome = decode(&hex!("00840000"));
        assert_eq!(outcome.status_word().to_u16(), 0x6700);
    }

    #[test]
    fn test_decode_too_short() {
        for bytes in [&[][..], &hex!("00"), &hex!("0084"), &hex!("008400")] {
            let outcome = decode(bytes);
            assert_eq!(outcome.kind(), ApduCommandKind::Invalid);
            assert_eq!(outcome.status_word(), StatusWord::WRONG_LENGTH);
        }
    }

    #[test]
    fn test_decode_lc_mismatch() {
        // Lc announces 8 bytes, only 4 follow.
        let outcome = decode(&hex!("0082000008 01020304"));
        assert_eq!(outcome.status_word(), StatusWord::WRONG_LENGTH);
        // Two trailing bytes after data cannot be a short Le.
        let outcome = decode(&hex!("0082000002 0102 0000"));
        assert_eq!(outcome.status_word(), StatusWord::WRONG_LENGTH);
    }

    #[test]
    fn test_decode_class_not_supported() {
        let outcome = decode(&hex!("0C84000008"));
        assert_eq!(outcome.status_word(), StatusWord::CLA_NOT_SUPPORTED);
        let outcome = decode(&hex!("1086000002 7C00"));
        assert_eq!(outcome.status_word(), StatusWord::CLA_NOT_SUPPORTED);
    }

    #[test]
    fn test_decode_mse_set_at() {
        let outcome = decode(&hex!("0022C1A40F 800A04007F00070202040202 830101"));
        assert!(outcome.is_valid());
        assert_eq!(outcome.kind(), ApduCommandKind::MseSetAt);

        let outcome = decode(&hex!("002241A403 830101"));
        assert_eq!(outcome.kind(), ApduCommandKind::Unsupported);
        assert_eq!(outcome.status_word(), StatusWord::INS_NOT_SUPPORTED);
    }

    #[test]
    fn test_decode_unsupported_instruction() {
        let outcome = decode(&hex!("00CA010000"));
        assert_eq!(outcome.kind(), ApduCommandKind::Unsupported);
        assert_eq!(outcome.status_word().to_u16(), 0x6D00);
    }

    #[test]
    fn test_decode_kinds() {
        let cases = [
            (&hex!("00B0810000")[..], ApduCommandKind::ReadBinary),
            (
                &hex!("0082000028 72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F25F1448EEA8AD90A7 28"),
                ApduCommandKind::ExternalAuthenticate,
            ),
            (&hex!("0088000002 0102 00"), ApduCommandKind::InternalAuthenticate),
            (&hex!("0086000002 7C00 00"), ApduCommandKind::GeneralAuthenticate),
        ];
        for (bytes, kind) in cases {
            let outcome = decode(bytes);
            assert!(outcome.is_valid(), "{}", bytes2hex(bytes));
            assert_eq!(outcome.kind(), kind);
        }
    }

    #[test]
    fn test_reserialize_accepted_commands() {
        let commands: [&[u8]; 6] = [
            &hex!("00A4040C07A0000002471001"),
            &hex!("0084000008"),
            &hex!("0082000028 72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F25F1448EEA8AD90A7 28"),
            &hex!("0022C1A40F 800A04007F00070202040202 830101"),
            &hex!("00B0810000"),
            &hex!("00860000"),
        ];
        for bytes in commands {
            let ParseOutcome::Command(parsed) = decode(bytes) else {
                panic!("{} must decode", bytes2hex(bytes));
            };
            assert_eq!(parsed.command.header(), bytes[..4]);
            assert_eq!(parsed.command.to_bytes(), bytes);
        }
    }
}
