//! A terminal talking to the emulator with real cryptography, following
//! ICAO Doc 9303-11 sections 4.3 (BAC) and 4.4 (PACE).

use cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use constant_time_eq::constant_time_eq;
use emrtd_emulator::{
    crypto::{
        compute_key, compute_mac, generate_key_seed, EncryptionAlgorithm, KeyType, MacAlgorithm,
    },
    pace::ID_PACE_ECDH_GM_AES_CBC_CMAC_128,
    tlv, DocumentRecord, EmulatorConfig, PassportEmulator, SimulatorError,
};
use hex_literal::hex;
use p256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::{rngs::OsRng, RngCore};

const SELECT: [u8; 12] = hex!("00A4040C07A0000002471001");
const EF_COM: [u8; 24] = hex!("60165F0104303130375F36063034303030305C046175636C");

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn document() -> DocumentRecord {
    DocumentRecord {
        document_number: "L898902C<".into(),
        date_of_birth: "690806".into(),
        date_of_expiry: "940623".into(),
        ..DocumentRecord::default()
    }
}

fn emulator() -> Result<PassportEmulator, SimulatorError> {
    init_logging();
    let mut emulator = PassportEmulator::new(EmulatorConfig::default().with_file(0x1E, EF_COM));
    emulator.load_document(&document())?;
    assert_eq!(emulator.process_apdu(&SELECT), hex!("9000"));
    Ok(emulator)
}

/// Splits a response into data and status word.
fn split(response: &[u8]) -> (&[u8], [u8; 2]) {
    let (data, sw) = response.split_at(response.len() - 2);
    (data, [sw[0], sw[1]])
}

fn command(header: [u8; 4], data: &[u8], le: u8) -> Vec<u8> {
    let mut apdu = header.to_vec();
    apdu.push(data.len() as u8);
    apdu.extend_from_slice(data);
    apdu.push(le);
    apdu
}

fn pad(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    padded.push(0x80);
    while padded.len() % 8 != 0 {
        padded.push(0x00);
    }
    padded
}

fn tdes_encrypt(key: &[u8], data: &[u8]) -> Vec<u8> {
    cbc::Encryptor::<des::TdesEde3>::new_from_slices(key, &[0; 8])
        .map(|encryptor| encryptor.encrypt_padded_vec_mut::<NoPadding>(data))
        .unwrap_or_default()
}

fn tdes_decrypt(key: &[u8], data: &[u8]) -> Vec<u8> {
    cbc::Decryptor::<des::TdesEde3>::new_from_slices(key, &[0; 8])
        .ok()
        .and_then(|decryptor| decryptor.decrypt_padded_vec_mut::<NoPadding>(data).ok())
        .unwrap_or_default()
}

/// Runs BAC as the terminal with the MRZ information `secret`, returning the
/// status word of EXTERNAL AUTHENTICATE.
fn terminal_bac(emulator: &mut PassportEmulator, secret: &[u8]) -> Result<[u8; 2], SimulatorError> {
    let ba_key_seed = &generate_key_seed(secret)?[..16];
    let ba_key_enc = compute_key(ba_key_seed, KeyType::Encryption, EncryptionAlgorithm::DES3)?;
    let ba_key_mac = compute_key(ba_key_seed, KeyType::Mac, EncryptionAlgorithm::DES3)?;

    let response = emulator.process_apdu(&hex!("0084000008"));
    let (rnd_ic, sw) = split(&response);
    assert_eq!(sw, hex!("9000"));
    let rnd_ic = rnd_ic.to_vec();

    let mut rnd_ifd = [0_u8; 8];
    OsRng.fill_bytes(&mut rnd_ifd);
    let mut k_ifd = [0_u8; 16];
    OsRng.fill_bytes(&mut k_ifd);

    let e_ifd = tdes_encrypt(&ba_key_enc, &[&rnd_ifd[..], rnd_ic.as_slice(), &k_ifd[..]].concat());
    let m_ifd = compute_mac(&ba_key_mac, &pad(&e_ifd), MacAlgorithm::DES)?;
    let response = emulator.process_apdu(&command(
        hex!("00820000"),
        &[e_ifd, m_ifd].concat(),
        0x28,
    ));
    let (resp_data, sw) = split(&response);
    if sw != hex!("9000") {
        return Ok(sw);
    }

    assert_eq!(resp_data.len(), 40);
    let (e_ic, m_ic) = resp_data.split_at(32);
    let expected_mac = compute_mac(&ba_key_mac, &pad(e_ic), MacAlgorithm::DES)?;
    assert!(constant_time_eq(&expected_mac, m_ic));

    let s = tdes_decrypt(&ba_key_enc, e_ic);
    assert_eq!(s[..8], rnd_ic[..]);
    assert_eq!(s[8..16], rnd_ifd);
    Ok(sw)
}

#[test]
fn test_bac() -> Result<(), SimulatorError> {
    let mut emulator = emulator()?;
    let secret = document().mrz_key()?;
    assert_eq!(secret, "L898902C<369080619406236");

    assert_eq!(emulator.process_apdu(&hex!("00B09E0004")), hex!("6982"));
    assert_eq!(terminal_bac(&mut emulator, secret.as_bytes())?, hex!("9000"));
    assert!(emulator.is_authenticated());
    assert!(emulator
        .bac_session()
        .with(|session| session.session_keys().is_some()));

    let response = emulator.process_apdu(&hex!("00B09E0004"));
    assert_eq!(response, hex!("60165F019000"));
    Ok(())
}

#[test]
fn test_bac_wrong_mrz() -> Result<(), SimulatorError> {
    let mut emulator = emulator()?;
    let wrong = DocumentRecord {
        document_number: "L898902D<".into(),
        ..document()
    }
    .mrz_key()?;

    assert_eq!(terminal_bac(&mut emulator, wrong.as_bytes())?, hex!("6300"));
    assert!(!emulator.is_authenticated());
    assert_eq!(emulator.process_apdu(&hex!("00B09E0004")), hex!("6982"));
    Ok(())
}

struct PaceTerminal {
    secret: SecretKey,
    public: Vec<u8>,
}

impl PaceTerminal {
    fn new() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        Self { secret, public }
    }

    fn session_mac_key(&self, card_public: &[u8], nonce: &[u8]) -> Result<Vec<u8>, SimulatorError> {
        let card_public = PublicKey::from_sec1_bytes(card_public).map_err(|err| {
            SimulatorError::CryptoFailure {
                operation: "terminal key agreement",
                reason: err.to_string(),
            }
        })?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), card_public.as_affine());
        let seed = [shared.raw_secret_bytes().as_slice(), nonce].concat();
        compute_key(&seed, KeyType::Mac, EncryptionAlgorithm::AES128)
    }
}

fn token(mac_key: &[u8], public_key: &[u8]) -> Result<Vec<u8>, SimulatorError> {
    let data = tlv::public_key_data_object(&ID_PACE_ECDH_GM_AES_CBC_CMAC_128, public_key);
    let mut token = compute_mac(mac_key, &data, MacAlgorithm::AESCMAC)?;
    token.truncate(8);
    Ok(token)
}

/// Runs PACE as the terminal, optionally corrupting its token, and returns the
/// final status word.
fn terminal_pace(emulator: &mut PassportEmulator, secret: &[u8], corrupt: bool) -> Result<[u8; 2], SimulatorError> {
    let k_pi = compute_key(&generate_key_seed(secret)?, KeyType::Pace, EncryptionAlgorithm::AES128)?;

    let response = emulator.process_apdu(&hex!("0022C1A412800A04007F0007020204020283010184010C"));
    assert_eq!(response, hex!("9000"));

    // Encrypted nonce
    let response = emulator.process_apdu(&command(hex!("10860000"), &hex!("7C00"), 0x00));
    assert_eq!(response, hex!("6E00"));
    let response = emulator.process_apdu(&command(hex!("00860000"), &hex!("7C00"), 0x00));
    let (data, sw) = split(&response);
    assert_eq!(sw, hex!("9000"));
    assert_eq!(data[..4], hex!("7C128010"));
    let nonce = cbc::Decryptor::<aes::Aes128>::new_from_slices(&k_pi, &[0; 16])
        .ok()
        .and_then(|decryptor| decryptor.decrypt_padded_vec_mut::<NoPadding>(&data[4..20]).ok())
        .unwrap_or_default();
    assert_eq!(nonce.len(), 16);

    // Ephemeral keys
    let terminal = PaceTerminal::new();
    let response = emulator.process_apdu(&command(
        hex!("00860000"),
        &tlv::dynamic_auth_data(&[(0x83, terminal.public.as_slice())]),
        0x00,
    ));
    let (data, sw) = split(&response);
    assert_eq!(sw, hex!("9000"));
    assert_eq!(data[..4], hex!("7C438441"));
    let card_public = data[4..69].to_vec();
    let mac_key = terminal.session_mac_key(&card_public, &nonce)?;

    // Card token over the terminal's key
    let response = emulator.process_apdu(&command(hex!("00860000"), &hex!("7C00"), 0x00));
    let (data, sw) = split(&response);
    assert_eq!(sw, hex!("9000"));
    assert_eq!(data[..4], hex!("7C0A8608"));
    assert_eq!(data[4..12], token(&mac_key, &terminal.public)?[..]);

    // Terminal token over the card's key
    let mut terminal_token = token(&mac_key, &card_public)?;
    if corrupt {
        terminal_token[0] ^= 0xFF;
    }
    let response = emulator.process_apdu(&command(
        hex!("00860000"),
        &tlv::dynamic_auth_data(&[(0x85, terminal_token.as_slice())]),
        0x00,
    ));
    let (data, sw) = split(&response);
    if sw == hex!("9000") {
        assert_eq!(data, hex!("7C00"));
    }
    Ok(sw)
}

#[test]
fn test_pace() -> Result<(), SimulatorError> {
    let mut emulator = emulator()?;
    let secret = document().mrz_key()?;
    assert_eq!(terminal_pace(&mut emulator, secret.as_bytes(), false)?, hex!("9000"));
    assert!(emulator.is_authenticated());
    assert_eq!(emulator.pace_session().with(|session| session.completed_steps()), 5);

    let response = emulator.process_apdu(&hex!("00B09E0000"));
    let (data, sw) = split(&response);
    assert_eq!(sw, hex!("9000"));
    assert_eq!(data, EF_COM);

    // SELECT starts over.
    emulator.process_apdu(&SELECT);
    assert!(!emulator.is_authenticated());
    assert_eq!(emulator.process_apdu(&hex!("00B09E0004")), hex!("6982"));
    Ok(())
}

#[test]
fn test_pace_wrong_token() -> Result<(), SimulatorError> {
    let mut emulator = emulator()?;
    let secret = document().mrz_key()?;
    assert_eq!(terminal_pace(&mut emulator, secret.as_bytes(), true)?, hex!("6301"));
    assert!(!emulator.is_authenticated());
    assert_eq!(emulator.process_apdu(&hex!("00B09E0004")), hex!("6982"));
    Ok(())
}

#[test]
fn test_pace_invalid_point() -> Result<(), SimulatorError> {
    let mut emulator = emulator()?;
    emulator.process_apdu(&hex!("0022C1A40F800A04007F00070202040202830101"));
    emulator.process_apdu(&command(hex!("00860000"), &hex!("7C00"), 0x00));

    let mut not_on_curve = [0x00; 65];
    not_on_curve[0] = 0x04;
    let response = emulator.process_apdu(&command(
        hex!("00860000"),
        &tlv::dynamic_auth_data(&[(0x83, not_on_curve.as_slice())]),
        0x00,
    ));
    assert_eq!(response, hex!("6301"));
    assert_eq!(
        emulator.pace_session().with(|session| session.state().name()),
        "FAILED"
    );
    Ok(())
}
