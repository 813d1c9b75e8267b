//! Cryptographic primitives and the injectable capability the handshake
//! state machines call through.
//!
//! [`Icao9303Crypto`] performs the card side of BAC and PACE as described in
//! ICAO Doc 9303-11: <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>.
//! [`DeterministicCrypto`] returns fixed values so that state transitions can
//! be tested without any real cryptography.

use alloc::{format, string::ToString, vec, vec::Vec};
use core::iter;

use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cmac::{Cmac, Mac};
use constant_time_eq::constant_time_eq;
use p256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::{rngs::OsRng, CryptoRng, RngCore};
use sha1_checked::Sha1;
use sha2::{Digest, Sha256};
use tracing::{error, trace};

use crate::{bytes2hex, error::SimulatorError, tlv::public_key_data_object};

/// Length of E.IFD plus M.IFD in an EXTERNAL AUTHENTICATE command.
pub const BAC_CMD_LEN: usize = 40;
/// Length of an uncompressed P-256 point.
pub const EC_POINT_LEN: usize = 65;
/// Length of the PACE nonce `s`.
pub const PACE_NONCE_LEN: usize = 16;
/// Length of a PACE authentication token.
pub const PACE_TOKEN_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Encryption,
    Mac,
    /// Password key `K_π` derived from the MRZ information.
    Pace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    DES3,
    AES128,
    AES192,
    AES256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    DES,
    AESCMAC,
}

/// Session keys established by a successful handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub enc: Vec<u8>,
    pub mac: Vec<u8>,
    /// Send sequence counter, if the protocol defines an initial value.
    pub ssc: Option<Vec<u8>>,
}

impl core::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("enc", &"<redacted>")
            .field("mac", &"<redacted>")
            .field("ssc", &self.ssc.as_deref().map(bytes2hex))
            .finish()
    }
}

/// Card answer to EXTERNAL AUTHENTICATE and the keys it established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacAuthentication {
    /// `E.IC || M.IC`
    pub response: Vec<u8>,
    pub keys: SessionKeys,
}

/// An ephemeral key pair of the card.
#[derive(Clone, PartialEq, Eq)]
pub struct EphemeralKey {
    /// Uncompressed SEC1 encoding.
    pub public: Vec<u8>,
    pub secret: Vec<u8>,
}

impl core::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("public", &bytes2hex(&self.public))
            .finish_non_exhaustive()
    }
}

/// The narrow cryptographic interface the handshakes are written against.
///
/// `secret` is always the MRZ information of the document, see
/// [`crate::DocumentRecord::mrz_key`].
pub trait CryptoProvider {
    /// Fills `dest` with random bytes.
    fn fill_random(&mut self, dest: &mut [u8]);

    /// Verifies `E.IFD || M.IFD` against the challenge `rnd_ic` and answers
    /// with `E.IC || M.IC`.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::BacAuthenticationFailed` if the cryptogram does not verify.
    fn bac_authenticate(
        &mut self,
        secret: &[u8],
        rnd_ic: &[u8],
        cmd_data: &[u8],
    ) -> Result<BacAuthentication, SimulatorError>;

    /// Encrypts the PACE nonce under the password key.
    ///
    /// # Errors
    ///
    /// * `SimulatorError` if the key cannot be derived or the cipher fails.
    fn pace_encrypt_nonce(
        &self,
        secret: &[u8],
        cipher: EncryptionAlgorithm,
        nonce: &[u8],
    ) -> Result<Vec<u8>, SimulatorError>;

    /// Validates the terminal's ephemeral public key and generates the card's
    /// ephemeral key pair.
    ///
    /// # Errors
    ///
    /// * `SimulatorError` if the terminal key is not a valid point.
    fn pace_ephemeral_key(
        &mut self,
        terminal_public_key: &[u8],
    ) -> Result<EphemeralKey, SimulatorError>;

    /// Completes the key agreement and derives the session keys.
    ///
    /// # Errors
    ///
    /// * `SimulatorError` if a key is invalid.
    fn pace_key_agreement(
        &self,
        cipher: EncryptionAlgorithm,
        card_key: &EphemeralKey,
        terminal_public_key: &[u8],
        nonce: &[u8],
    ) -> Result<SessionKeys, SimulatorError>;

    /// Computes the authentication token over `public_key`.
    ///
    /// # Errors
    ///
    /// * `SimulatorError` if the MAC cannot be computed.
    fn pace_token(
        &self,
        cipher: EncryptionAlgorithm,
        keys: &SessionKeys,
        protocol_oid: &[u8],
        public_key: &[u8],
    ) -> Result<Vec<u8>, SimulatorError>;

    /// Checks a token received from the terminal.
    ///
    /// # Errors
    ///
    /// * `SimulatorError` if the expected token cannot be computed.
    fn pace_verify_token(
        &self,
        cipher: EncryptionAlgorithm,
        keys: &SessionKeys,
        protocol_oid: &[u8],
        public_key: &[u8],
        token: &[u8],
    ) -> Result<bool, SimulatorError>;
}

/// Card-side BAC and PACE per ICAO Doc 9303-11.
#[derive(Debug, Clone, Default)]
pub struct Icao9303Crypto<R: RngCore + CryptoRng + Default = OsRng> {
    rng: R,
}

impl<R: RngCore + CryptoRng + Default> Icao9303Crypto<R> {
    #[must_use]
    pub fn new() -> Self {
        Self { rng: R::default() }
    }

    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: RngCore + CryptoRng + Default> CryptoProvider for Icao9303Crypto<R> {
    fn fill_random(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }

    fn bac_authenticate(
        &mut self,
        secret: &[u8],
        rnd_ic: &[u8],
        cmd_data: &[u8],
    ) -> Result<BacAuthentication, SimulatorError> {
        if cmd_data.len() < BAC_CMD_LEN {
            error!(
                "EXTERNAL AUTHENTICATE data must be at least {BAC_CMD_LEN} bytes, found {}",
                cmd_data.len()
            );
            return Err(SimulatorError::WrongLength {
                operation: "EXTERNAL AUTHENTICATE",
                expected: BAC_CMD_LEN,
                found: cmd_data.len(),
            });
        }
        let ba_key_seed = &generate_key_seed(secret)?[..16];

        trace!("Computing basic access keys...");
        let ba_key_enc = compute_key(
            ba_key_seed,
            KeyType::Encryption,
            EncryptionAlgorithm::DES3,
        )?;
        let ba_key_mac = compute_key(ba_key_seed, KeyType::Mac, EncryptionAlgorithm::DES3)?;

        let (e_ifd, m_ifd) = (&cmd_data[..32], &cmd_data[32..BAC_CMD_LEN]);
        let expected_mac = compute_mac(
            &ba_key_mac,
            &padding_method_2(e_ifd, 8)?,
            MacAlgorithm::DES,
        )?;
        if !constant_time_eq(&expected_mac, m_ifd) {
            error!("MAC verification of EXTERNAL AUTHENTICATE data failed");
            return Err(SimulatorError::BacAuthenticationFailed {
                reason: "MAC verification failed",
            });
        }

        let s = decrypt::<cbc::Decryptor<des::TdesEde3>>(&ba_key_enc, Some(&[0; 8]), e_ifd)?;
        let (rnd_ifd, received_rnd_ic, k_ifd) = (&s[..8], &s[8..16], &s[16..32]);
        if !constant_time_eq(received_rnd_ic, rnd_ic) {
            error!(
                "Terminal answered challenge {}, expected {}",
                bytes2hex(received_rnd_ic),
                bytes2hex(rnd_ic)
            );
            return Err(SimulatorError::BacAuthenticationFailed {
                reason: "challenge mismatch",
            });
        }

        let mut k_ic = [0_u8; 16];
        self.rng.fill_bytes(&mut k_ic);

        let e_ic = encrypt::<cbc::Encryptor<des::TdesEde3>>(
            &ba_key_enc,
            Some(&[0; 8]),
            &[rnd_ic, rnd_ifd, &k_ic[..]].concat(),
        )?;
        let m_ic = compute_mac(&ba_key_mac, &padding_method_2(&e_ic, 8)?, MacAlgorithm::DES)?;

        trace!("Establishing session keys...");
        let ses_key_seed = xor_slices(k_ifd, &k_ic)?;
        let keys = SessionKeys {
            enc: compute_key(
                &ses_key_seed,
                KeyType::Encryption,
                EncryptionAlgorithm::DES3,
            )?,
            mac: compute_key(&ses_key_seed, KeyType::Mac, EncryptionAlgorithm::DES3)?,
            ssc: Some([&rnd_ic[4..], &rnd_ifd[4..]].concat()),
        };

        Ok(BacAuthentication {
            response: [e_ic, m_ic].concat(),
            keys,
        })
    }

    fn pace_encrypt_nonce(
        &self,
        secret: &[u8],
        cipher: EncryptionAlgorithm,
        nonce: &[u8],
    ) -> Result<Vec<u8>, SimulatorError> {
        let k_pi = compute_key(&generate_key_seed(secret)?, KeyType::Pace, cipher)?;
        let iv = [0_u8; 16];
        match cipher {
            EncryptionAlgorithm::AES128 => {
                encrypt::<cbc::Encryptor<aes::Aes128>>(&k_pi, Some(&iv), nonce)
            }
            EncryptionAlgorithm::AES192 => {
                encrypt::<cbc::Encryptor<aes::Aes192>>(&k_pi, Some(&iv), nonce)
            }
            EncryptionAlgorithm::AES256 => {
                encrypt::<cbc::Encryptor<aes::Aes256>>(&k_pi, Some(&iv), nonce)
            }
            EncryptionAlgorithm::DES3 => {
                error!("3DES is not supported for PACE nonce encryption");
                Err(SimulatorError::CryptoFailure {
                    operation: "PACE nonce encryption",
                    reason: "3DES is not supported".to_string(),
                })
            }
        }
    }

    fn pace_ephemeral_key(
        &mut self,
        terminal_public_key: &[u8],
    ) -> Result<EphemeralKey, SimulatorError> {
        parse_public_key(terminal_public_key)?;
        let secret = SecretKey::random(&mut self.rng);
        let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        trace!("Card ephemeral public key: {}", bytes2hex(&public));
        Ok(EphemeralKey {
            public,
            secret: secret.to_bytes().to_vec(),
        })
    }

    fn pace_key_agreement(
        &self,
        cipher: EncryptionAlgorithm,
        card_key: &EphemeralKey,
        terminal_public_key: &[u8],
        nonce: &[u8],
    ) -> Result<SessionKeys, SimulatorError> {
        let secret = SecretKey::from_slice(&card_key.secret).map_err(|err| {
            error!("Invalid card ephemeral secret key: {err}");
            SimulatorError::CryptoFailure {
                operation: "PACE key agreement",
                reason: err.to_string(),
            }
        })?;
        let terminal_key = parse_public_key(terminal_public_key)?;
        let shared =
            p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), terminal_key.as_affine());

        // The nonce is bound into the key seed so only a terminal that
        // decrypted it derives the same keys.
        let seed = [shared.raw_secret_bytes().as_slice(), nonce].concat();
        Ok(SessionKeys {
            enc: compute_key(&seed, KeyType::Encryption, cipher)?,
            mac: compute_key(&seed, KeyType::Mac, cipher)?,
            ssc: Some(vec![0; 16]),
        })
    }

    fn pace_token(
        &self,
        cipher: EncryptionAlgorithm,
        keys: &SessionKeys,
        protocol_oid: &[u8],
        public_key: &[u8],
    ) -> Result<Vec<u8>, SimulatorError> {
        if cipher == EncryptionAlgorithm::DES3 {
            error!("3DES is not supported for PACE authentication tokens");
            return Err(SimulatorError::CryptoFailure {
                operation: "PACE token",
                reason: "3DES is not supported".to_string(),
            });
        }
        let data = public_key_data_object(protocol_oid, public_key);
        let mut token = compute_mac(&keys.mac, &data, MacAlgorithm::AESCMAC)?;
        token.truncate(PACE_TOKEN_LEN);
        Ok(token)
    }

    fn pace_verify_token(
        &self,
        cipher: EncryptionAlgorithm,
        keys: &SessionKeys,
        protocol_oid: &[u8],
        public_key: &[u8],
        token: &[u8],
    ) -> Result<bool, SimulatorError> {
        let expected = self.pace_token(cipher, keys, protocol_oid, public_key)?;
        Ok(constant_time_eq(&expected, token))
    }
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, SimulatorError> {
    PublicKey::from_sec1_bytes(bytes).map_err(|err| {
        error!("Invalid P-256 public key {}: {err}", bytes2hex(bytes));
        SimulatorError::CryptoFailure {
            operation: "PACE public key",
            reason: err.to_string(),
        }
    })
}

/// Fixed, input-independent answers for exercising state machines.
///
/// Every non-empty terminal token is accepted.
#[derive(Debug, Clone, Default)]
pub struct DeterministicCrypto {
    counter: u8,
}

impl DeterministicCrypto {
    pub const PUBLIC_KEY: [u8; EC_POINT_LEN] = {
        let mut key = [0x11; EC_POINT_LEN];
        key[0] = 0x04;
        key
    };
    pub const TOKEN: [u8; PACE_TOKEN_LEN] = [0x55; PACE_TOKEN_LEN];
}

impl CryptoProvider for DeterministicCrypto {
    fn fill_random(&mut self, dest: &mut [u8]) {
        for byte in dest.iter_mut() {
            *byte = self.counter;
            self.counter = self.counter.wrapping_add(1);
        }
    }

    fn bac_authenticate(
        &mut self,
        _secret: &[u8],
        rnd_ic: &[u8],
        _cmd_data: &[u8],
    ) -> Result<BacAuthentication, SimulatorError> {
        Ok(BacAuthentication {
            response: vec![0xA5; BAC_CMD_LEN],
            keys: SessionKeys {
                enc: vec![0x01; 24],
                mac: vec![0x02; 16],
                ssc: Some(rnd_ic.iter().copied().chain(iter::repeat(0)).take(8).collect()),
            },
        })
    }

    fn pace_encrypt_nonce(
        &self,
        _secret: &[u8],
        _cipher: EncryptionAlgorithm,
        nonce: &[u8],
    ) -> Result<Vec<u8>, SimulatorError> {
        Ok(vec![0x3C; nonce.len()])
    }

    fn pace_ephemeral_key(
        &mut self,
        _terminal_public_key: &[u8],
    ) -> Result<EphemeralKey, SimulatorError> {
        Ok(EphemeralKey {
            public: Self::PUBLIC_KEY.to_vec(),
            secret: vec![0x22; 32],
        })
    }

    fn pace_key_agreement(
        &self,
        _cipher: EncryptionAlgorithm,
        _card_key: &EphemeralKey,
        _terminal_public_key: &[u8],
        _nonce: &[u8],
    ) -> Result<SessionKeys, SimulatorError> {
        Ok(SessionKeys {
            enc: vec![0x33; 16],
            mac: vec![0x44; 16],
            ssc: Some(vec![0; 16]),
        })
    }

    fn pace_token(
        &self,
        _cipher: EncryptionAlgorithm,
        _keys: &SessionKeys,
        _protocol_oid: &[u8],
        _public_key: &[u8],
    ) -> Result<Vec<u8>, SimulatorError> {
        Ok(Self::TOKEN.to_vec())
    }

    fn pace_verify_token(
        &self,
        _cipher: EncryptionAlgorithm,
        _keys: &SessionKeys,
        _protocol_oid: &[u8],
        _public_key: &[u8],
        token: &[u8],
    ) -> Result<bool, SimulatorError> {
        Ok(!token.is_empty())
    }
}

/// Generates a key seed from the given secret.
///
/// Calculates the SHA-1 of `secret` and returns the result.
///
/// Calculation is explained at ICAO Doc 9303-11 Section 4.3.2:
/// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
///
/// # Errors
///
/// `SimulatorError` if 'SHA1' detects a collision attack.
pub fn generate_key_seed(secret: &[u8]) -> Result<Vec<u8>, SimulatorError> {
    let hash_result = Sha1::try_digest(secret);
    if hash_result.has_collision() {
        error!("SHA1 hash calculation during generate_key_seed had collision");
        return Err(SimulatorError::CryptoFailure {
            operation: "key seed generation",
            reason: "SHA1 collision detected".to_string(),
        });
    }
    Ok(hash_result.hash().as_slice().to_vec())
}

fn check_key_size(operation: &'static str, expected: usize, found: usize) -> Result<(), SimulatorError> {
    if expected != found {
        error!("Wrong key size for {operation}, expected {expected}, found {found}");
        return Err(SimulatorError::CryptoFailure {
            operation,
            reason: format!("wrong key size, expected {expected}, found {found}"),
        });
    }
    Ok(())
}

fn check_data_size(operation: &'static str, block_size: usize, found: usize) -> Result<(), SimulatorError> {
    if found % block_size != 0 {
        error!("Wrong data size for {operation}, expected a multiple of {block_size}, found {found}");
        return Err(SimulatorError::CryptoFailure {
            operation,
            reason: format!("data length {found} is not a multiple of {block_size}"),
        });
    }
    Ok(())
}

fn check_iv_size(operation: &'static str, iv: Option<&[u8]>, expected: usize) -> Result<(), SimulatorError> {
    match iv {
        Some(iv) if iv.len() != expected => {
            error!(
                "Wrong IV size for {operation}, expected {expected}, found {}",
                iv.len()
            );
            Err(SimulatorError::CryptoFailure {
                operation,
                reason: format!("wrong IV size, expected {expected}, found {}", iv.len()),
            })
        }
        _ => Ok(()),
    }
}

/// Encrypts block aligned data using the specified block cipher and mode.
///
/// # Errors
///
/// `SimulatorError` if the key, IV or data size is wrong.
pub(crate) fn encrypt<CM>(key: &[u8], iv: Option<&[u8]>, data: &[u8]) -> Result<Vec<u8>, SimulatorError>
where
    CM: BlockEncryptMut + KeyIvInit,
{
    check_key_size("cipher encryption", CM::key_size(), key.len())?;
    check_iv_size("cipher encryption", iv, CM::iv_size())?;
    check_data_size("cipher encryption", CM::block_size(), data.len())?;

    Ok(CM::new(key.into(), iv.unwrap_or_default().into())
        .encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

/// Encrypts block aligned data in Electronic Codebook (ECB) mode.
///
/// # Errors
///
/// `SimulatorError` if the key or data size is wrong.
pub(crate) fn encrypt_ecb<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SimulatorError>
where
    CM: BlockEncryptMut + KeyInit,
{
    check_key_size("cipher encryption", CM::key_size(), key.len())?;
    check_data_size("cipher encryption", CM::block_size(), data.len())?;

    Ok(CM::new(key.into()).encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

/// Decrypts block aligned data using the specified block cipher and mode.
///
/// # Errors
///
/// `SimulatorError` if the key, IV or data size is wrong.
pub(crate) fn decrypt<CM>(key: &[u8], iv: Option<&[u8]>, data: &[u8]) -> Result<Vec<u8>, SimulatorError>
where
    CM: BlockDecryptMut + KeyIvInit,
{
    check_key_size("cipher decryption", CM::key_size(), key.len())?;
    check_iv_size("cipher decryption", iv, CM::iv_size())?;
    check_data_size("cipher decryption", CM::block_size(), data.len())?;

    CM::new(key.into(), iv.unwrap_or_default().into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(|err| SimulatorError::CryptoFailure {
            operation: "cipher decryption",
            reason: err.to_string(),
        })
}

/// Decrypts block aligned data in Electronic Codebook (ECB) mode.
///
/// # Errors
///
/// `SimulatorError` if the key or data size is wrong.
pub(crate) fn decrypt_ecb<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SimulatorError>
where
    CM: BlockDecryptMut + KeyInit,
{
    check_key_size("cipher decryption", CM::key_size(), key.len())?;
    check_data_size("cipher decryption", CM::block_size(), data.len())?;

    CM::new(key.into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(|err| SimulatorError::CryptoFailure {
            operation: "cipher decryption",
            reason: err.to_string(),
        })
}

/// Computes a key based on the given key seed, key type, and encryption algorithm.
///
/// For calculation examples see ICAO Doc 9303-11 Appendix D.1 and G.1:
/// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
///
/// # Errors
///
/// `SimulatorError` if the hash calculation fails.
pub fn compute_key(
    key_seed: &[u8],
    key_type: KeyType,
    alg: EncryptionAlgorithm,
) -> Result<Vec<u8>, SimulatorError> {
    let c: &[u8] = match key_type {
        KeyType::Encryption => b"\x00\x00\x00\x01",
        KeyType::Mac => b"\x00\x00\x00\x02",
        KeyType::Pace => b"\x00\x00\x00\x03",
    };

    let mut d = key_seed.to_vec();
    d.extend_from_slice(c);

    match alg {
        EncryptionAlgorithm::DES3 => {
            let hash_bytes = generate_key_seed(&d)?;
            let key_1_2 = des3_adjust_parity_bits(hash_bytes.iter().copied().take(16).collect());
            match key_type {
                KeyType::Encryption => Ok([&key_1_2[..], &key_1_2[..8]].concat()),
                KeyType::Mac | KeyType::Pace => Ok(key_1_2),
            }
        }
        EncryptionAlgorithm::AES128 => Ok(generate_key_seed(&d)?.into_iter().take(16).collect()),
        EncryptionAlgorithm::AES192 => Ok(Sha256::digest(&d).iter().copied().take(24).collect()),
        EncryptionAlgorithm::AES256 => Ok(Sha256::digest(&d).to_vec()),
    }
}

/// Computes a MAC of data using the given key and MAC algorithm.
///
/// `DES` is the ISO/IEC 9797-1 MAC algorithm 3 over already padded data;
/// `AESCMAC` is AES-CMAC (RFC 4493) and pads internally.
///
/// # Errors
///
/// * `SimulatorError` if `key` or `data` length is wrong or cipher operation fails.
pub fn compute_mac(key: &[u8], data: &[u8], alg: MacAlgorithm) -> Result<Vec<u8>, SimulatorError> {
    match alg {
        MacAlgorithm::DES => {
            check_key_size("retail MAC", 16, key.len())?;
            check_data_size("retail MAC", 8, data.len())?;
            if data.is_empty() {
                error!("Can not compute retail MAC over empty data");
                return Err(SimulatorError::CryptoFailure {
                    operation: "retail MAC",
                    reason: "empty data".to_string(),
                });
            }

            let key1 = &key[..8];
            let key2 = &key[8..];

            let mut h = encrypt_ecb::<ecb::Encryptor<des::Des>>(key1, &data[..8])?;
            for block in data[8..].chunks(8) {
                h = encrypt_ecb::<ecb::Encryptor<des::Des>>(key1, &xor_slices(&h, block)?)?;
            }

            encrypt_ecb::<ecb::Encryptor<des::Des>>(
                key1,
                &decrypt_ecb::<ecb::Decryptor<des::Des>>(key2, &h)?,
            )
        }
        MacAlgorithm::AESCMAC => aes_cmac(key, data),
    }
}

fn aes_cmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SimulatorError> {
    match key.len() {
        16 => compute_cmac::<Cmac<aes::Aes128>>(key, data),
        24 => compute_cmac::<Cmac<aes::Aes192>>(key, data),
        32 => compute_cmac::<Cmac<aes::Aes256>>(key, data),
        n => {
            error!("AES-CMAC key must be 16, 24 or 32 bytes, found {n}");
            Err(SimulatorError::CryptoFailure {
                operation: "AES-CMAC",
                reason: format!("invalid key length {n}"),
            })
        }
    }
}

fn compute_cmac<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SimulatorError> {
    let mut mac = <M as Mac>::new_from_slice(key).map_err(|err| SimulatorError::CryptoFailure {
        operation: "AES-CMAC",
        reason: err.to_string(),
    })?;
    Mac::update(&mut mac, data);
    Ok(Mac::finalize(mac).into_bytes().to_vec())
}

/// XORs two byte slices of equal length.
///
/// # Errors
///
/// * `SimulatorError` if input `a` and `b` have different lengths.
pub(crate) fn xor_slices(a: &[u8], b: &[u8]) -> Result<Vec<u8>, SimulatorError> {
    if a.len() == b.len() {
        return Ok(a.iter().zip(b.iter()).map(|(&x, &y)| x ^ y).collect());
    }
    error!(
        "XORed slices must have the same length, found {}, {}",
        a.len(),
        b.len()
    );
    Err(SimulatorError::Internal {
        reason: format!(
            "XORed slices must have the same length, found {}, {}",
            a.len(),
            b.len()
        ),
    })
}

/// Pads the input data using padding method 2.
///
/// <https://en.wikipedia.org/wiki/ISO/IEC_9797-1#Padding_method_2>
///
/// # Errors
///
/// * `SimulatorError` if `pad_to` is 0.
pub(crate) fn padding_method_2(data: &[u8], pad_to: usize) -> Result<Vec<u8>, SimulatorError> {
    if pad_to == 0 {
        error!("pad_to must be greater than 0, found {}", pad_to);
        return Err(SimulatorError::Internal {
            reason: "pad_to must be greater than 0".to_string(),
        });
    }

    let mut data = data.to_vec();
    data.push(0x80);
    if data.len() % pad_to != 0 {
        let padding_len = pad_to - (data.len() % pad_to);
        data.extend(iter::repeat(0).take(padding_len));
    }
    Ok(data)
}

/// Adjusts the parity bits of a 3DES key.
fn des3_adjust_parity_bits(mut key: Vec<u8>) -> Vec<u8> {
    for byte in &mut key {
        let mut bitmask = 1;
        let mut b = *byte;
        for _ in 0..8 {
            bitmask ^= b & 0x1;
            b >>= 1;
        }
        *byte ^= bitmask;
    }
    key
}
