//! The emulated chip: routes each command APDU to SELECT or READ BINARY
//! handling or to the BAC or PACE handshake, and always answers with
//! `data || SW1 SW2`.

use alloc::{string::String, sync::Arc, vec::Vec};
use core::fmt;

use tracing::{error, info, trace, warn};

use crate::{
    apdu::{self, ApduCommand, ApduCommandKind, ParseOutcome},
    bac::{BacSession, BacState},
    bytes2hex,
    config::EmulatorConfig,
    crypto::{CryptoProvider, Icao9303Crypto},
    document::DocumentRecord,
    error::SimulatorError,
    events::{EventSink, SimulatorEvent, TracingEventSink},
    pace::{PaceSession, PaceState},
    session::{HandshakeSession, Protocol, SessionHandle},
    status, tlv,
};

const TAG_ENCRYPTED_NONCE: u8 = 0x80;
const TAG_MAPPING_DATA: u8 = 0x81;
const TAG_TERMINAL_PUBLIC_KEY: u8 = 0x83;
const TAG_CARD_PUBLIC_KEY: u8 = 0x84;
const TAG_TERMINAL_TOKEN: u8 = 0x85;
const TAG_CARD_TOKEN: u8 = 0x86;

/// Bit 8 of P1 in READ BINARY marks a short EF identifier in bits 1 to 5.
const READ_BINARY_SFI_FLAG: u8 = 0x80;

/// A passport chip answering one terminal.
///
/// # Examples
///
/// ```
/// use emrtd_emulator::{DocumentRecord, EmulatorConfig, PassportEmulator};
/// use hex_literal::hex;
///
/// let mut emulator = PassportEmulator::new(EmulatorConfig::default());
/// emulator.load_document(&DocumentRecord {
///     document_number: "L898902C<".into(),
///     date_of_birth: "690806".into(),
///     date_of_expiry: "940623".into(),
///     ..DocumentRecord::default()
/// })?;
///
/// assert_eq!(emulator.process_apdu(&hex!("00A4040C07A0000002471001")), hex!("9000"));
/// let challenge = emulator.process_apdu(&hex!("0084000008"));
/// assert_eq!(challenge.len(), 10);
/// assert_eq!(challenge[8..], hex!("9000"));
/// # Ok::<(), emrtd_emulator::SimulatorError>(())
/// ```
pub struct PassportEmulator<C: CryptoProvider = Icao9303Crypto> {
    config: EmulatorConfig,
    bac: SessionHandle<BacSession<C>>,
    pace: SessionHandle<PaceSession<C>>,
    current: Option<Protocol>,
    sink: Arc<dyn EventSink>,
}

impl PassportEmulator {
    #[must_use]
    pub fn new(config: EmulatorConfig) -> Self {
        Self::with_crypto(config, Icao9303Crypto::new(), Icao9303Crypto::new())
    }
}

impl<C: CryptoProvider> PassportEmulator<C> {
    /// Creates an emulator whose BAC and PACE sessions use the given providers.
    pub fn with_crypto(config: EmulatorConfig, bac_crypto: C, pace_crypto: C) -> Self {
        Self {
            config,
            bac: SessionHandle::new(BacSession::with_crypto(bac_crypto)),
            pace: SessionHandle::new(PaceSession::with_crypto(pace_crypto)),
            current: None,
            sink: Arc::new(TracingEventSink),
        }
    }

    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// The BAC session, shared with the caller.
    #[must_use]
    pub const fn bac_session(&self) -> &SessionHandle<BacSession<C>> {
        &self.bac
    }

    /// The PACE session, shared with the caller.
    #[must_use]
    pub const fn pace_session(&self) -> &SessionHandle<PaceSession<C>> {
        &self.pace
    }

    /// The handshake the terminal started last, if any.
    #[must_use]
    pub const fn current_protocol(&self) -> Option<Protocol> {
        self.current
    }

    /// Whether the current handshake completed.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        match self.current {
            Some(Protocol::Bac) => self.bac.with(|session| session.is_authenticated()),
            Some(Protocol::Pace) => self.pace.with(|session| session.is_authenticated()),
            None => false,
        }
    }

    /// Binds both handshakes to `document`.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::InvalidDocument` if the record does not conform.
    pub fn load_document(&mut self, document: &DocumentRecord) -> Result<(), SimulatorError> {
        self.current = None;
        let result = self
            .bac
            .with(|session| session.initialize(document))
            .and_then(|()| self.pace.with(|session| session.initialize(document)));
        match result {
            Ok(()) => {
                info!("Loaded document {}", document.document_number);
                Ok(())
            }
            Err(err) => {
                self.emit(SimulatorEvent::Error { error: err.clone() });
                Err(err)
            }
        }
    }

    /// A terminal entered the field.
    pub fn on_connected(&mut self) {
        self.emit(SimulatorEvent::ConnectionEstablished);
    }

    /// The terminal left the field or the link was deactivated; both
    /// handshakes start over.
    pub fn on_deactivated(&mut self, reason: impl Into<String>) {
        self.reset_sessions();
        self.emit(SimulatorEvent::ConnectionLost {
            reason: reason.into(),
        });
    }

    /// Answers one command APDU. Every outcome, including malformed input,
    /// is encoded as a response.
    pub fn process_apdu(&mut self, bytes: &[u8]) -> Vec<u8> {
        let response = match apdu::decode(bytes) {
            ParseOutcome::Rejected(rejection) => {
                self.emit(SimulatorEvent::Error {
                    error: rejection.error,
                });
                rejection.response.to_bytes(&[])
            }
            ParseOutcome::Command(parsed) => match self.dispatch(parsed.kind, &parsed.command) {
                Ok(data) => status::encode_success(&data),
                Err(err) => {
                    self.report(parsed.kind, &err);
                    status::encode_error(&err)
                }
            },
        };
        trace!("Response: {}", bytes2hex(&response));
        response
    }

    fn emit(&self, event: SimulatorEvent) {
        self.sink.emit(&event);
    }

    fn reset_sessions(&mut self) {
        self.bac.with(|session| session.reset());
        self.pace.with(|session| session.reset());
        self.current = None;
    }

    /// Emits the event describing a failed command.
    fn report(&self, kind: ApduCommandKind, err: &SimulatorError) {
        let protocol = match kind {
            ApduCommandKind::GetChallenge | ApduCommandKind::ExternalAuthenticate => {
                Some(Protocol::Bac)
            }
            ApduCommandKind::MseSetAt | ApduCommandKind::GeneralAuthenticate => Some(Protocol::Pace),
            _ => None,
        };
        let failed = match protocol {
            Some(Protocol::Bac) => self.bac.with(|session| session.state() == BacState::Failed),
            Some(Protocol::Pace) => self.pace.with(|session| session.state() == PaceState::Failed),
            None => false,
        };
        let event = match protocol {
            Some(protocol) if failed => SimulatorEvent::AuthenticationFailed {
                protocol,
                error: err.clone(),
            },
            _ => SimulatorEvent::Error { error: err.clone() },
        };
        self.emit(event);
    }

    fn dispatch(&mut self, kind: ApduCommandKind, command: &ApduCommand) -> Result<Vec<u8>, SimulatorError> {
        match kind {
            ApduCommandKind::Select => {
                info!("eMRTD application selected");
                self.reset_sessions();
                Ok(Vec::new())
            }
            ApduCommandKind::ReadBinary => self.read_binary(command),
            ApduCommandKind::GetChallenge => {
                self.require_enabled(Protocol::Bac, command.ins)?;
                self.start(Protocol::Bac);
                self.step_started(Protocol::Bac, 1, kind);
                let challenge = self.bac.with(|session| session.generate_challenge())?;
                Ok(challenge.to_vec())
            }
            ApduCommandKind::ExternalAuthenticate => {
                self.require_enabled(Protocol::Bac, command.ins)?;
                self.require_current(Protocol::Bac, kind)?;
                self.step_started(Protocol::Bac, 2, kind);
                let response = self
                    .bac
                    .with(|session| session.process_external_authenticate(command.data()))?;
                self.emit(SimulatorEvent::AuthenticationSucceeded {
                    protocol: Protocol::Bac,
                });
                Ok(response)
            }
            ApduCommandKind::MseSetAt => {
                self.require_enabled(Protocol::Pace, command.ins)?;
                self.start(Protocol::Pace);
                self.step_started(Protocol::Pace, 1, kind);
                self.pace
                    .with(|session| session.process_mse_set_at(command.data()))?;
                Ok(Vec::new())
            }
            ApduCommandKind::GeneralAuthenticate => {
                self.require_enabled(Protocol::Pace, command.ins)?;
                self.require_current(Protocol::Pace, kind)?;
                let step = self.pace.with(|session| session.completed_steps()) + 1;
                self.step_started(Protocol::Pace, step, kind);
                let (response, authenticated) = self.pace.with(|session| {
                    let response = general_authenticate(session, command.data())?;
                    Ok::<_, SimulatorError>((response, session.is_authenticated()))
                })?;
                if authenticated {
                    self.emit(SimulatorEvent::AuthenticationSucceeded {
                        protocol: Protocol::Pace,
                    });
                }
                Ok(response)
            }
            ApduCommandKind::InternalAuthenticate
            | ApduCommandKind::Unsupported
            | ApduCommandKind::Invalid => {
                error!("{kind} is not emulated");
                Err(SimulatorError::UnsupportedInstruction { ins: command.ins })
            }
        }
    }

    fn require_enabled(&self, protocol: Protocol, ins: u8) -> Result<(), SimulatorError> {
        if self.config.protocols.allows(protocol) {
            Ok(())
        } else {
            error!("{protocol} is disabled, rejecting instruction {ins:02X}");
            Err(SimulatorError::UnsupportedInstruction { ins })
        }
    }

    fn require_current(&self, protocol: Protocol, kind: ApduCommandKind) -> Result<(), SimulatorError> {
        match self.current {
            Some(current) if current == protocol => Ok(()),
            current => {
                error!("{kind} continues {protocol}, but the current handshake is {current:?}");
                Err(SimulatorError::InvalidState {
                    operation: kind.name(),
                    state: current.map_or("NO_HANDSHAKE", Protocol::name),
                })
            }
        }
    }

    /// Makes `protocol` current, discarding the other handshake.
    fn start(&mut self, protocol: Protocol) {
        if self.current == Some(protocol) {
            return;
        }
        match protocol {
            Protocol::Bac => self.pace.with(|session| session.reset()),
            Protocol::Pace => self.bac.with(|session| session.reset()),
        }
        info!("Terminal started {protocol}");
        self.current = Some(protocol);
    }

    fn step_started(&self, protocol: Protocol, step: u8, kind: ApduCommandKind) {
        self.emit(SimulatorEvent::HandshakeStepStarted {
            protocol,
            step,
            command: kind.name(),
        });
    }

    fn read_binary(&self, command: &ApduCommand) -> Result<Vec<u8>, SimulatorError> {
        if command.p1 & READ_BINARY_SFI_FLAG == 0 {
            error!(
                "READ BINARY without short EF identifier (P1 {:02X}, P2 {:02X}) is not supported",
                command.p1, command.p2
            );
            return Err(SimulatorError::FileNotFound {
                identifier: Vec::from([command.p1, command.p2]),
            });
        }
        if !self.is_authenticated() {
            error!("READ BINARY before access control completed");
            return Err(SimulatorError::SecurityStatusNotSatisfied {
                operation: "READ BINARY",
            });
        }

        let sfi = command.p1 & 0x1F;
        let Some(file) = self.config.file(sfi) else {
            error!("No elementary file with short identifier {sfi:02X}");
            return Err(SimulatorError::FileNotFound {
                identifier: Vec::from([sfi]),
            });
        };
        let offset = usize::from(command.p2);
        if offset > file.len() {
            error!(
                "READ BINARY offset {offset} is beyond the end of EF {sfi:02X} ({} bytes)",
                file.len()
            );
            return Err(SimulatorError::WrongLength {
                operation: "READ BINARY",
                expected: file.len(),
                found: offset,
            });
        }

        let len = command
            .le
            .unwrap_or(self.config.max_read_len)
            .min(self.config.max_read_len);
        let end = file.len().min(offset.saturating_add(len));
        trace!("READ BINARY EF {sfi:02X} [{offset}..{end}]");
        Ok(file[offset..end].to_vec())
    }
}

/// Runs the PACE step announced by the session state on a GENERAL
/// AUTHENTICATE data field and wraps the answer in a `7C` template.
fn general_authenticate<C: CryptoProvider>(
    session: &mut PaceSession<C>,
    data: &[u8],
) -> Result<Vec<u8>, SimulatorError> {
    // Wrong-state calls leave the session as it is, so the state is checked
    // before the data field is looked at.
    let state = session.state();
    if matches!(state, PaceState::Initial | PaceState::Authenticated | PaceState::Failed) {
        return Err(wrong_general_authenticate_state(state));
    }

    let objects = match tlv::unwrap_dynamic_auth_data(data).and_then(tlv::parse_objects) {
        Ok(objects) => objects,
        Err(err) => {
            error!("Malformed GENERAL AUTHENTICATE data: {}", bytes2hex(data));
            session.abort();
            return Err(err);
        }
    };
    let find = |tags: &[u8]| {
        objects
            .iter()
            .find(|(tag, _)| tags.contains(tag))
            .map(|(_, value)| *value)
    };

    match state {
        PaceState::MseSetAtProcessed => {
            let step = session.generate_encrypted_nonce()?;
            Ok(tlv::dynamic_auth_data(&[(TAG_ENCRYPTED_NONCE, step.data.as_slice())]))
        }
        PaceState::NonceGenerated => {
            let Some(public_key) = find(&[TAG_TERMINAL_PUBLIC_KEY, TAG_MAPPING_DATA]) else {
                error!("GENERAL AUTHENTICATE carries no terminal public key");
                session.abort();
                return Err(SimulatorError::InvalidData {
                    operation: "GENERAL AUTHENTICATE",
                    reason: "missing terminal public key",
                });
            };
            let step = session.process_terminal_public_key(public_key)?;
            Ok(tlv::dynamic_auth_data(&[(TAG_CARD_PUBLIC_KEY, step.data.as_slice())]))
        }
        PaceState::KeyAgreementInProgress => {
            let step = session.perform_key_agreement()?;
            Ok(tlv::dynamic_auth_data(&[(TAG_CARD_TOKEN, step.data.as_slice())]))
        }
        PaceState::MutualAuthentication => {
            let token = find(&[TAG_TERMINAL_TOKEN]).unwrap_or_default();
            session.verify_terminal_authentication(token)?;
            Ok(tlv::dynamic_auth_data(&[]))
        }
        PaceState::Initial | PaceState::Authenticated | PaceState::Failed => {
            Err(wrong_general_authenticate_state(state))
        }
    }
}

fn wrong_general_authenticate_state(state: PaceState) -> SimulatorError {
    warn!("GENERAL AUTHENTICATE received in PACE state {state}");
    SimulatorError::InvalidState {
        operation: "GENERAL AUTHENTICATE",
        state: state.name(),
    }
}

impl<C: CryptoProvider> fmt::Debug for PassportEmulator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassportEmulator")
            .field("config", &self.config)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}
