//! Card side of Password Authenticated Connection Establishment.
//!
//! The handshake runs in five steps after initialization. The card answers
//! MSE:SET AT, issues an encrypted nonce, exchanges ephemeral keys, sends its
//! authentication token and finally verifies the terminal's token. Session
//! keys are derived from the ephemeral shared secret and the nonce, so only a
//! terminal that knows the password derives the same keys.

use alloc::{string::String, vec, vec::Vec};
use core::fmt;

use tracing::{error, info, trace, warn};

use crate::{
    bytes2hex,
    crypto::{
        CryptoProvider, EncryptionAlgorithm, EphemeralKey, Icao9303Crypto, SessionKeys,
        EC_POINT_LEN, PACE_NONCE_LEN,
    },
    document::DocumentRecord,
    error::SimulatorError,
    session::{HandshakeSession, Protocol},
    tlv,
};

/// id-PACE-ECDH-GM-AES-CBC-CMAC-128
pub const ID_PACE_ECDH_GM_AES_CBC_CMAC_128: [u8; 10] =
    [0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02, 0x02];
/// id-PACE-ECDH-GM-AES-CBC-CMAC-192
pub const ID_PACE_ECDH_GM_AES_CBC_CMAC_192: [u8; 10] =
    [0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02, 0x03];
/// id-PACE-ECDH-GM-AES-CBC-CMAC-256
pub const ID_PACE_ECDH_GM_AES_CBC_CMAC_256: [u8; 10] =
    [0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02, 0x04];
/// Standardized domain parameters: NIST P-256.
pub const DOMAIN_PARAMETER_P256: u8 = 12;
/// Password reference for the MRZ.
pub const PASSWORD_MRZ: u8 = 1;

const TAG_PROTOCOL: u8 = 0x80;
const TAG_PASSWORD: u8 = 0x83;
const TAG_DOMAIN_PARAMETERS: u8 = 0x84;

/// Number of advancing operations in a complete handshake.
pub const PACE_STEPS: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaceState {
    Initial,
    MseSetAtProcessed,
    NonceGenerated,
    KeyAgreementInProgress,
    MutualAuthentication,
    Authenticated,
    Failed,
}

impl PaceState {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::MseSetAtProcessed => "MSE_SET_AT_PROCESSED",
            Self::NonceGenerated => "NONCE_GENERATED",
            Self::KeyAgreementInProgress => "KEY_AGREEMENT_IN_PROGRESS",
            Self::MutualAuthentication => "MUTUAL_AUTHENTICATION",
            Self::Authenticated => "AUTHENTICATED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters selected by MSE:SET AT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaceParameters {
    pub protocol_oid: Vec<u8>,
    pub cipher: EncryptionAlgorithm,
    pub password_reference: u8,
    pub domain_parameter_id: u8,
}

impl Default for PaceParameters {
    fn default() -> Self {
        Self {
            protocol_oid: ID_PACE_ECDH_GM_AES_CBC_CMAC_128.to_vec(),
            cipher: EncryptionAlgorithm::AES128,
            password_reference: PASSWORD_MRZ,
            domain_parameter_id: DOMAIN_PARAMETER_P256,
        }
    }
}

impl PaceParameters {
    /// Reads the MSE:SET AT data objects. Anything unknown or malformed falls
    /// back to the defaults.
    #[must_use]
    pub fn from_mse_data(data: &[u8]) -> Self {
        let mut parameters = Self::default();
        let objects = match tlv::parse_objects(data) {
            Ok(objects) => objects,
            Err(err) => {
                warn!(
                    "Malformed MSE:SET AT data {}, using default parameters: {err}",
                    bytes2hex(data)
                );
                return parameters;
            }
        };

        for (tag, value) in objects {
            match tag {
                TAG_PROTOCOL => match cipher_for_oid(value) {
                    Some(cipher) => {
                        parameters.protocol_oid = value.to_vec();
                        parameters.cipher = cipher;
                    }
                    None => warn!("Unsupported PACE protocol {}", bytes2hex(value)),
                },
                TAG_PASSWORD => {
                    if value != [PASSWORD_MRZ] {
                        warn!("Unsupported PACE password reference {}, using MRZ", bytes2hex(value));
                    }
                }
                TAG_DOMAIN_PARAMETERS => {
                    if value != [DOMAIN_PARAMETER_P256] {
                        warn!(
                            "Unsupported PACE domain parameters {}, using NIST P-256",
                            bytes2hex(value)
                        );
                    }
                }
                other => trace!("Ignoring MSE:SET AT data object {other:02X}"),
            }
        }
        parameters
    }
}

fn cipher_for_oid(oid: &[u8]) -> Option<EncryptionAlgorithm> {
    match oid {
        o if o == ID_PACE_ECDH_GM_AES_CBC_CMAC_128 => Some(EncryptionAlgorithm::AES128),
        o if o == ID_PACE_ECDH_GM_AES_CBC_CMAC_192 => Some(EncryptionAlgorithm::AES192),
        o if o == ID_PACE_ECDH_GM_AES_CBC_CMAC_256 => Some(EncryptionAlgorithm::AES256),
        _ => None,
    }
}

/// Outcome of an advancing PACE operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    /// Number of the step the terminal should perform next.
    pub next_step: u8,
    pub data: Vec<u8>,
}

/// One PACE handshake attempt.
#[derive(Debug)]
pub struct PaceSession<C: CryptoProvider = Icao9303Crypto> {
    crypto: C,
    document: Option<DocumentRecord>,
    secret: Option<String>,
    state: PaceState,
    completed_steps: u8,
    parameters: Option<PaceParameters>,
    nonce: Option<Vec<u8>>,
    terminal_public_key: Option<Vec<u8>>,
    card_key: Option<EphemeralKey>,
    keys: Option<SessionKeys>,
}

impl PaceSession {
    #[must_use]
    pub fn new() -> Self {
        Self::with_crypto(Icao9303Crypto::new())
    }
}

impl Default for PaceSession {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CryptoProvider> PaceSession<C> {
    pub fn with_crypto(crypto: C) -> Self {
        Self {
            crypto,
            document: None,
            secret: None,
            state: PaceState::Initial,
            completed_steps: 0,
            parameters: None,
            nonce: None,
            terminal_public_key: None,
            card_key: None,
            keys: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> PaceState {
        self.state
    }

    /// Progress indicator, 0 to 5.
    #[must_use]
    pub const fn completed_steps(&self) -> u8 {
        self.completed_steps
    }

    #[must_use]
    pub fn document(&self) -> Option<&DocumentRecord> {
        self.document.as_ref()
    }

    #[must_use]
    pub fn parameters(&self) -> Option<&PaceParameters> {
        self.parameters.as_ref()
    }

    /// The card's ephemeral public key, once step 3 completed.
    #[must_use]
    pub fn card_public_key(&self) -> Option<&[u8]> {
        self.card_key.as_ref().map(|key| key.public.as_slice())
    }

    /// Session keys, available once key agreement completed.
    #[must_use]
    pub fn session_keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    fn clear_context(&mut self) {
        self.completed_steps = 0;
        self.parameters = None;
        self.nonce = None;
        self.terminal_public_key = None;
        self.card_key = None;
        self.keys = None;
    }

    /// Binds the session to `document`.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::InvalidDocument` if the record does not conform, the
    ///   session is then FAILED.
    pub fn initialize(&mut self, document: &DocumentRecord) -> Result<(), SimulatorError> {
        self.clear_context();
        match document.validate().and_then(|()| document.mrz_key()) {
            Ok(secret) => {
                self.document = Some(document.clone());
                self.secret = Some(secret);
                self.state = PaceState::Initial;
                trace!("PACE session initialized");
                Ok(())
            }
            Err(err) => {
                error!("Can not initialize PACE session: {err}");
                self.document = None;
                self.secret = None;
                self.state = PaceState::Failed;
                Err(err)
            }
        }
    }

    /// Checks the state and document before an advancing operation.
    fn expect(&self, operation: &'static str, state: PaceState) -> Result<(), SimulatorError> {
        if self.state != state {
            error!("{operation} is not allowed in PACE state {}", self.state);
            return Err(SimulatorError::InvalidState {
                operation,
                state: self.state.name(),
            });
        }
        if self.secret.is_none() {
            error!("{operation} received before a document was loaded");
            return Err(SimulatorError::NotInitialized {
                component: "PACE session",
            });
        }
        Ok(())
    }

    /// Drives the session to FAILED and hands `err` back.
    fn fail(&mut self, err: SimulatorError) -> SimulatorError {
        error!("PACE handshake failed in state {}: {err}", self.state);
        self.state = PaceState::Failed;
        err
    }

    /// Records a provider failure at `step` as an authentication failure.
    fn fail_step(&mut self, step: u8, err: SimulatorError) -> SimulatorError {
        let err = match err {
            SimulatorError::CryptoFailure { .. } => SimulatorError::PaceAuthenticationFailed {
                step,
                reason: "cryptographic failure",
            },
            other => other,
        };
        self.fail(err)
    }

    fn advance(&mut self, state: PaceState, step: u8, data: Vec<u8>) -> StepResult {
        self.state = state;
        self.completed_steps = step;
        trace!("PACE step {step} completed, state {state}");
        StepResult {
            next_step: step + 1,
            data,
        }
    }

    fn cipher(&self) -> EncryptionAlgorithm {
        self.parameters
            .as_ref()
            .map_or(EncryptionAlgorithm::AES128, |parameters| parameters.cipher)
    }

    fn protocol_oid(&self) -> Vec<u8> {
        self.parameters.as_ref().map_or_else(
            || ID_PACE_ECDH_GM_AES_CBC_CMAC_128.to_vec(),
            |parameters| parameters.protocol_oid.clone(),
        )
    }

    /// Step 1: MSE:SET AT selects the protocol and domain parameters.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::InvalidState` outside INITIAL, state is unchanged.
    /// * `SimulatorError::InvalidData` for empty data, the session is then FAILED.
    pub fn process_mse_set_at(&mut self, data: &[u8]) -> Result<StepResult, SimulatorError> {
        self.expect("MSE:SET AT", PaceState::Initial)?;
        if data.is_empty() {
            return Err(self.fail(SimulatorError::InvalidData {
                operation: "MSE:SET AT",
                reason: "empty parameter selection",
            }));
        }

        let parameters = PaceParameters::from_mse_data(data);
        trace!("PACE parameters: {parameters:02X?}");
        self.parameters = Some(parameters);
        Ok(self.advance(PaceState::MseSetAtProcessed, 1, Vec::new()))
    }

    /// Step 2: generates the nonce `s` and returns it encrypted under `K_π`.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::InvalidState` outside MSE_SET_AT_PROCESSED, state is unchanged.
    /// * `SimulatorError::PaceAuthenticationFailed` if encryption fails, the session is then FAILED.
    pub fn generate_encrypted_nonce(&mut self) -> Result<StepResult, SimulatorError> {
        self.expect("GENERAL AUTHENTICATE (encrypted nonce)", PaceState::MseSetAtProcessed)?;

        let mut nonce = vec![0; PACE_NONCE_LEN];
        self.crypto.fill_random(&mut nonce);
        let secret = self.secret.as_deref().unwrap_or_default();
        match self
            .crypto
            .pace_encrypt_nonce(secret.as_bytes(), self.cipher(), &nonce)
        {
            Ok(encrypted) => {
                self.nonce = Some(nonce);
                Ok(self.advance(PaceState::NonceGenerated, 2, encrypted))
            }
            Err(err) => Err(self.fail_step(2, err)),
        }
    }

    /// Step 3: takes the terminal's ephemeral public key and returns the card's.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::InvalidState` outside NONCE_GENERATED, state is unchanged.
    /// * `SimulatorError::WrongLength` or `SimulatorError::InvalidData` if the
    ///   key is not a 65 byte uncompressed point, the session is then FAILED.
    /// * `SimulatorError::PaceAuthenticationFailed` if the point is not on the
    ///   curve, the session is then FAILED.
    pub fn process_terminal_public_key(&mut self, data: &[u8]) -> Result<StepResult, SimulatorError> {
        self.expect("GENERAL AUTHENTICATE (map nonce)", PaceState::NonceGenerated)?;
        if data.len() != EC_POINT_LEN {
            return Err(self.fail(SimulatorError::WrongLength {
                operation: "PACE terminal public key",
                expected: EC_POINT_LEN,
                found: data.len(),
            }));
        }
        if data[0] != 0x04 {
            return Err(self.fail(SimulatorError::InvalidData {
                operation: "PACE terminal public key",
                reason: "not an uncompressed point",
            }));
        }
        trace!("Terminal ephemeral public key: {}", bytes2hex(data));

        match self.crypto.pace_ephemeral_key(data) {
            Ok(card_key) => {
                let public = card_key.public.clone();
                self.terminal_public_key = Some(data.to_vec());
                self.card_key = Some(card_key);
                Ok(self.advance(PaceState::KeyAgreementInProgress, 3, public))
            }
            Err(err) => Err(self.fail_step(3, err)),
        }
    }

    /// Step 4: derives the session keys and returns the card's token.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::InvalidState` outside KEY_AGREEMENT_IN_PROGRESS, state is unchanged.
    /// * `SimulatorError::PaceAuthenticationFailed` if key agreement fails, the session is then FAILED.
    pub fn perform_key_agreement(&mut self) -> Result<StepResult, SimulatorError> {
        self.expect("GENERAL AUTHENTICATE (key agreement)", PaceState::KeyAgreementInProgress)?;
        let (Some(card_key), Some(terminal_key), Some(nonce)) = (
            self.card_key.as_ref(),
            self.terminal_public_key.as_deref(),
            self.nonce.as_deref(),
        ) else {
            return Err(self.fail(SimulatorError::Internal {
                reason: "PACE key material missing".into(),
            }));
        };

        let cipher = self.cipher();
        let oid = self.protocol_oid();
        let result = self
            .crypto
            .pace_key_agreement(cipher, card_key, terminal_key, nonce)
            .and_then(|keys| {
                let token = self.crypto.pace_token(cipher, &keys, &oid, terminal_key)?;
                Ok((keys, token))
            });
        match result {
            Ok((keys, token)) => {
                self.keys = Some(keys);
                Ok(self.advance(PaceState::MutualAuthentication, 4, token))
            }
            Err(err) => Err(self.fail_step(4, err)),
        }
    }

    /// Step 5: verifies the terminal's token over the card's public key.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::InvalidState` outside MUTUAL_AUTHENTICATION, state is unchanged.
    /// * `SimulatorError::InvalidData` for an empty token, the session is then FAILED.
    /// * `SimulatorError::PaceAuthenticationFailed` if the token does not
    ///   verify, the session is then FAILED.
    pub fn verify_terminal_authentication(&mut self, token: &[u8]) -> Result<StepResult, SimulatorError> {
        self.expect("GENERAL AUTHENTICATE (mutual authentication)", PaceState::MutualAuthentication)?;
        if token.is_empty() {
            return Err(self.fail(SimulatorError::InvalidData {
                operation: "PACE mutual authentication",
                reason: "empty authentication token",
            }));
        }
        let (Some(keys), Some(card_key)) = (self.keys.as_ref(), self.card_key.as_ref()) else {
            return Err(self.fail(SimulatorError::Internal {
                reason: "PACE session keys missing".into(),
            }));
        };

        let oid = self.protocol_oid();
        match self
            .crypto
            .pace_verify_token(self.cipher(), keys, &oid, &card_key.public, token)
        {
            Ok(true) => {
                info!("PACE authentication succeeded");
                Ok(self.advance(PaceState::Authenticated, 5, Vec::new()))
            }
            Ok(false) => Err(self.fail(SimulatorError::PaceAuthenticationFailed {
                step: 5,
                reason: "authentication token mismatch",
            })),
            Err(err) => Err(self.fail_step(5, err)),
        }
    }
}

impl<C: CryptoProvider> HandshakeSession for PaceSession<C> {
    fn protocol(&self) -> Protocol {
        Protocol::Pace
    }

    fn state_name(&self) -> &'static str {
        self.state.name()
    }

    fn is_authenticated(&self) -> bool {
        self.state == PaceState::Authenticated
    }

    fn reset(&mut self) {
        self.clear_context();
        self.state = PaceState::Initial;
    }

    fn abort(&mut self) {
        self.state = PaceState::Failed;
    }
}
