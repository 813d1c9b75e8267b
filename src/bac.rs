//! Card side of Basic Access Control.
//!
//! See ICAO Doc 9303-11 Section 4.3:
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use alloc::{string::String, vec::Vec};
use core::fmt;

use tracing::{error, info, trace, warn};

use crate::{
    apdu::CHALLENGE_LEN,
    bytes2hex,
    crypto::{CryptoProvider, Icao9303Crypto, SessionKeys, BAC_CMD_LEN},
    document::DocumentRecord,
    error::SimulatorError,
    session::{HandshakeSession, Protocol},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BacState {
    Initial,
    ChallengeGenerated,
    Authenticated,
    Failed,
}

impl BacState {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::ChallengeGenerated => "CHALLENGE_GENERATED",
            Self::Authenticated => "AUTHENTICATED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BacState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Initial,
    ChallengeGenerated { rnd_ic: [u8; CHALLENGE_LEN] },
    Authenticated { keys: SessionKeys },
    Failed,
}

/// One BAC handshake attempt.
#[derive(Debug)]
pub struct BacSession<C: CryptoProvider = Icao9303Crypto> {
    crypto: C,
    document: Option<DocumentRecord>,
    secret: Option<String>,
    phase: Phase,
}

impl BacSession {
    #[must_use]
    pub fn new() -> Self {
        Self::with_crypto(Icao9303Crypto::new())
    }
}

impl Default for BacSession {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CryptoProvider> BacSession<C> {
    pub fn with_crypto(crypto: C) -> Self {
        Self {
            crypto,
            document: None,
            secret: None,
            phase: Phase::Initial,
        }
    }

    #[must_use]
    pub const fn state(&self) -> BacState {
        match self.phase {
            Phase::Initial => BacState::Initial,
            Phase::ChallengeGenerated { .. } => BacState::ChallengeGenerated,
            Phase::Authenticated { .. } => BacState::Authenticated,
            Phase::Failed => BacState::Failed,
        }
    }

    #[must_use]
    pub fn document(&self) -> Option<&DocumentRecord> {
        self.document.as_ref()
    }

    /// The challenge issued by the last GET CHALLENGE, until authentication.
    #[must_use]
    pub const fn challenge(&self) -> Option<[u8; CHALLENGE_LEN]> {
        match self.phase {
            Phase::ChallengeGenerated { rnd_ic } => Some(rnd_ic),
            _ => None,
        }
    }

    #[must_use]
    pub fn session_keys(&self) -> Option<&SessionKeys> {
        match self.phase {
            Phase::Authenticated { ref keys } => Some(keys),
            _ => None,
        }
    }

    /// Binds the session to `document`.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::InvalidDocument` if the record does not conform, the
    ///   session is then FAILED.
    pub fn initialize(&mut self, document: &DocumentRecord) -> Result<(), SimulatorError> {
        match document.validate().and_then(|()| document.mrz_key()) {
            Ok(secret) => {
                self.document = Some(document.clone());
                self.secret = Some(secret);
                self.phase = Phase::Initial;
                trace!("BAC session initialized");
                Ok(())
            }
            Err(err) => {
                error!("Can not initialize BAC session: {err}");
                self.document = None;
                self.secret = None;
                self.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    fn wrong_state(&self, operation: &'static str) -> SimulatorError {
        error!("{operation} is not allowed in BAC state {}", self.state());
        SimulatorError::InvalidState {
            operation,
            state: self.state().name(),
        }
    }

    /// Issues a fresh challenge `RND.IC`.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::InvalidState` outside INITIAL, state is unchanged.
    /// * `SimulatorError::NotInitialized` if no document was loaded.
    pub fn generate_challenge(&mut self) -> Result<[u8; CHALLENGE_LEN], SimulatorError> {
        if !matches!(self.phase, Phase::Initial) {
            return Err(self.wrong_state("GET CHALLENGE"));
        }
        if self.secret.is_none() {
            error!("GET CHALLENGE received before a document was loaded");
            return Err(SimulatorError::NotInitialized {
                component: "BAC session",
            });
        }

        let mut rnd_ic = [0; CHALLENGE_LEN];
        self.crypto.fill_random(&mut rnd_ic);
        trace!("RND.IC: {}", bytes2hex(&rnd_ic));
        self.phase = Phase::ChallengeGenerated { rnd_ic };
        Ok(rnd_ic)
    }

    /// Verifies `E.IFD || M.IFD` and answers with `E.IC || M.IC`.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::InvalidState` outside CHALLENGE_GENERATED, state is unchanged.
    /// * `SimulatorError::WrongLength` for fewer than 40 bytes, the session is then FAILED.
    /// * `SimulatorError::BacAuthenticationFailed` if the cryptogram does not
    ///   verify, the session is then FAILED.
    pub fn process_external_authenticate(&mut self, data: &[u8]) -> Result<Vec<u8>, SimulatorError> {
        let Phase::ChallengeGenerated { rnd_ic } = self.phase else {
            return Err(self.wrong_state("EXTERNAL AUTHENTICATE"));
        };
        let Some(secret) = self.secret.as_deref() else {
            return Err(SimulatorError::NotInitialized {
                component: "BAC session",
            });
        };

        if data.len() < BAC_CMD_LEN {
            error!(
                "EXTERNAL AUTHENTICATE data must be at least {BAC_CMD_LEN} bytes, found {}",
                data.len()
            );
            self.phase = Phase::Failed;
            return Err(SimulatorError::WrongLength {
                operation: "EXTERNAL AUTHENTICATE",
                expected: BAC_CMD_LEN,
                found: data.len(),
            });
        }
        if data.len() > BAC_CMD_LEN {
            warn!(
                "Ignoring {} trailing bytes of EXTERNAL AUTHENTICATE data",
                data.len() - BAC_CMD_LEN
            );
        }

        match self
            .crypto
            .bac_authenticate(secret.as_bytes(), &rnd_ic, &data[..BAC_CMD_LEN])
        {
            Ok(authentication) => {
                info!("BAC authentication succeeded");
                self.phase = Phase::Authenticated {
                    keys: authentication.keys,
                };
                Ok(authentication.response)
            }
            Err(err) => {
                error!("BAC authentication failed: {err}");
                self.phase = Phase::Failed;
                Err(match err {
                    SimulatorError::CryptoFailure { .. } => {
                        SimulatorError::BacAuthenticationFailed {
                            reason: "cryptographic failure",
                        }
                    }
                    other => other,
                })
            }
        }
    }
}

impl<C: CryptoProvider> HandshakeSession for BacSession<C> {
    fn protocol(&self) -> Protocol {
        Protocol::Bac
    }

    fn state_name(&self) -> &'static str {
        self.state().name()
    }

    fn is_authenticated(&self) -> bool {
        self.state() == BacState::Authenticated
    }

    fn reset(&mut self) {
        self.phase = Phase::Initial;
    }

    fn abort(&mut self) {
        self.phase = Phase::Failed;
    }
}
