use std::env;

use cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use emrtd_emulator::{
    bytes2hex,
    crypto::{compute_key, compute_mac, generate_key_seed, EncryptionAlgorithm, KeyType, MacAlgorithm},
    pace::ID_PACE_ECDH_GM_AES_CBC_CMAC_128,
    tlv, DocumentRecord, EmulatorConfig, PassportEmulator, SimulatorError,
};
use p256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::{rngs::OsRng, RngCore};
use tracing::{error, info};

/// Sends `apdu` to the emulator and splits the answer into data and status word.
fn transmit(emulator: &mut PassportEmulator, name: &str, apdu: &[u8]) -> (Vec<u8>, [u8; 2]) {
    info!("> {name}: {}", bytes2hex(apdu));
    let mut response = emulator.process_apdu(apdu);
    let sw = response.split_off(response.len() - 2);
    info!("< {} {}", bytes2hex(&response), bytes2hex(&sw));
    (response, [sw[0], sw[1]])
}

fn command(header: [u8; 4], data: &[u8], le: u8) -> Vec<u8> {
    [&header[..], &[data.len() as u8], data, &[le]].concat()
}

fn padding_method_2(data: &[u8]) -> Vec<u8> {
    let mut padded = [data, &[0x80]].concat();
    padded.resize(padded.len().div_ceil(8) * 8, 0x00);
    padded
}

fn crypto_error(operation: &'static str, reason: impl ToString) -> SimulatorError {
    SimulatorError::CryptoFailure {
        operation,
        reason: reason.to_string(),
    }
}

fn run_bac(emulator: &mut PassportEmulator, secret: &[u8]) -> Result<[u8; 2], SimulatorError> {
    let ba_key_seed = &generate_key_seed(secret)?[..16];
    let ba_key_enc = compute_key(ba_key_seed, KeyType::Encryption, EncryptionAlgorithm::DES3)?;
    let ba_key_mac = compute_key(ba_key_seed, KeyType::Mac, EncryptionAlgorithm::DES3)?;

    let (rnd_ic, _) = transmit(emulator, "GET CHALLENGE", b"\x00\x84\x00\x00\x08");
    let mut rnd_ifd_k_ifd = [0_u8; 24];
    OsRng.fill_bytes(&mut rnd_ifd_k_ifd);
    let s = [&rnd_ifd_k_ifd[..8], rnd_ic.as_slice(), &rnd_ifd_k_ifd[8..]].concat();

    let e_ifd = cbc::Encryptor::<des::TdesEde3>::new_from_slices(&ba_key_enc, &[0; 8])
        .map_err(|err| crypto_error("3DES", err))?
        .encrypt_padded_vec_mut::<NoPadding>(&s);
    let m_ifd = compute_mac(&ba_key_mac, &padding_method_2(&e_ifd), MacAlgorithm::DES)?;
    let (_, sw) = transmit(
        emulator,
        "EXTERNAL AUTHENTICATE",
        &command(*b"\x00\x82\x00\x00", &[e_ifd, m_ifd].concat(), 0x28),
    );
    Ok(sw)
}

fn run_pace(emulator: &mut PassportEmulator, secret: &[u8]) -> Result<[u8; 2], SimulatorError> {
    let general_authenticate = *b"\x00\x86\x00\x00";
    let mse_data = [
        tlv::build_tlv(&[0x80], &ID_PACE_ECDH_GM_AES_CBC_CMAC_128),
        tlv::build_tlv(&[0x83], &[0x01]),
        tlv::build_tlv(&[0x84], &[0x0C]),
    ]
    .concat();
    transmit(emulator, "MSE:SET AT", &[&b"\x00\x22\xC1\xA4"[..], &[mse_data.len() as u8], mse_data.as_slice()].concat());

    let (data, _) = transmit(emulator, "GENERAL AUTHENTICATE", &command(general_authenticate, b"\x7C\x00", 0));
    let encrypted_nonce = tlv::find_in_dynamic_auth_data(&data, &[0x80])?.unwrap_or_default();
    let k_pi = compute_key(&generate_key_seed(secret)?, KeyType::Pace, EncryptionAlgorithm::AES128)?;
    let nonce = cbc::Decryptor::<aes::Aes128>::new_from_slices(&k_pi, &[0; 16])
        .map_err(|err| crypto_error("AES", err))?
        .decrypt_padded_vec_mut::<NoPadding>(encrypted_nonce)
        .map_err(|err| crypto_error("AES", err))?;
    info!("Decrypted nonce: {}", bytes2hex(&nonce));

    let terminal_key = SecretKey::random(&mut OsRng);
    let terminal_public = terminal_key.public_key().to_encoded_point(false).as_bytes().to_vec();
    let (data, _) = transmit(
        emulator,
        "GENERAL AUTHENTICATE",
        &command(general_authenticate, &tlv::dynamic_auth_data(&[(0x83, terminal_public.as_slice())]), 0),
    );
    let card_public = tlv::find_in_dynamic_auth_data(&data, &[0x84])?
        .unwrap_or_default()
        .to_vec();
    let card_key = PublicKey::from_sec1_bytes(&card_public).map_err(|err| crypto_error("P-256", err))?;
    let shared = p256::ecdh::diffie_hellman(terminal_key.to_nonzero_scalar(), card_key.as_affine());
    let ks_mac = compute_key(
        &[shared.raw_secret_bytes().as_slice(), nonce.as_slice()].concat(),
        KeyType::Mac,
        EncryptionAlgorithm::AES128,
    )?;

    transmit(emulator, "GENERAL AUTHENTICATE", &command(general_authenticate, b"\x7C\x00", 0));
    let token_data = tlv::public_key_data_object(&ID_PACE_ECDH_GM_AES_CBC_CMAC_128, &card_public);
    let mac = compute_mac(&ks_mac, &token_data, MacAlgorithm::AESCMAC)?;
    let token = &mac[..8];
    let (_, sw) = transmit(
        emulator,
        "GENERAL AUTHENTICATE",
        &command(general_authenticate, &tlv::dynamic_auth_data(&[(0x85, token)]), 0),
    );
    Ok(sw)
}

fn main() -> Result<(), SimulatorError> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .try_init();

    let mut args = env::args().skip(1);
    let document = DocumentRecord {
        document_number: args.next().unwrap_or_else(|| "L898902C<".to_string()),
        date_of_birth: args.next().unwrap_or_else(|| "690806".to_string()),
        date_of_expiry: args.next().unwrap_or_else(|| "940623".to_string()),
        ..DocumentRecord::default()
    };
    let secret = document.mrz_key()?;

    let config = EmulatorConfig::default()
        .with_file(0x1E, b"\x60\x16\x5F\x01\x04\x30\x31\x30\x37\x5F\x36\x06\x30\x34\x30\x30\x30\x30\x5C\x04\x61\x75\x63\x6C".to_vec());
    let mut emulator = PassportEmulator::new(config);
    emulator.load_document(&document)?;
    emulator.on_connected();

    // Select eMRTD application
    transmit(&mut emulator, "SELECT", b"\x00\xA4\x04\x0C\x07\xA0\x00\x00\x02\x47\x10\x01");
    match run_bac(&mut emulator, secret.as_bytes())? {
        [0x90, 0x00] => info!("BAC established"),
        [sw1, sw2] => error!("BAC failed: {sw1:02X} {sw2:02X}"),
    }
    transmit(&mut emulator, "READ BINARY EF.COM", b"\x00\xB0\x9E\x00\x00");

    // Start over with PACE
    transmit(&mut emulator, "SELECT", b"\x00\xA4\x04\x0C\x07\xA0\x00\x00\x02\x47\x10\x01");
    match run_pace(&mut emulator, secret.as_bytes())? {
        [0x90, 0x00] => info!("PACE established"),
        [sw1, sw2] => error!("PACE failed: {sw1:02X} {sw2:02X}"),
    }
    transmit(&mut emulator, "READ BINARY EF.COM", b"\x00\xB0\x9E\x00\x00");

    emulator.on_deactivated("terminal removed");
    Ok(())
}
