//! BER-TLV helpers for the data objects exchanged during PACE.

use alloc::{vec, vec::Vec};
use core::mem;

use tracing::error;

use crate::{bytes2hex, error::SimulatorError};

/// Dynamic authentication data template of GENERAL AUTHENTICATE.
pub const TAG_DYNAMIC_AUTH_DATA: u8 = 0x7C;
/// Public key data object tag (two bytes).
pub const TAG_PUBLIC_KEY: [u8; 2] = [0x7F, 0x49];
pub const TAG_OID: u8 = 0x06;
pub const TAG_EC_POINT: u8 = 0x86;

/// Parses the ASN.1 length field.
///
/// Returns the index of the first value byte and the length value.
/// For example, if `tag_len` is 1 and the length field is `81 FF`,
/// the returned value will be (3, 255).
///
/// # Errors
///
/// * `SimulatorError` if the data is too short to read the length value.
pub(crate) fn len2int(data: &[u8], tag_len: usize) -> Result<(usize, usize), SimulatorError> {
    if data.len() < tag_len + 1 {
        error!(
            "Error during len2int, `data.len()`: `{}` is less than `tag_len + 1`: `{}`",
            data.len(),
            tag_len + 1
        );
        return Err(SimulatorError::WrongLength {
            operation: "TLV decoding",
            expected: tag_len + 1,
            found: data.len(),
        });
    }

    if data[tag_len] & 0x80 == 0 {
        return Ok((tag_len + 1, data[tag_len] as usize));
    }

    let length_of_length = ((1 << 7) ^ data[tag_len]) as usize;
    if length_of_length == 0 || length_of_length > mem::size_of::<usize>() {
        error!("Error during len2int, unsupported length of length: {length_of_length}");
        return Err(SimulatorError::InvalidData {
            operation: "TLV decoding",
            reason: "unsupported length encoding",
        });
    }
    if data.len() < tag_len + 1 + length_of_length {
        error!(
            "Error during len2int, `data.len()`: `{}` is less than `tag_len + 1 + length_of_length`: `{}`",
            data.len(),
            tag_len + 1 + length_of_length
        );
        return Err(SimulatorError::WrongLength {
            operation: "TLV decoding",
            expected: tag_len + 1 + length_of_length,
            found: data.len(),
        });
    }

    let mut buf = [0_u8; mem::size_of::<usize>()];
    buf[mem::size_of::<usize>() - length_of_length..]
        .copy_from_slice(&data[tag_len + 1..tag_len + 1 + length_of_length]);

    Ok((tag_len + 1 + length_of_length, usize::from_be_bytes(buf)))
}

/// Encodes the length field in ASN.1 format.
///
/// # Examples
///
/// ```
/// use emrtd_emulator::tlv::int2asn1len;
/// use hex_literal::hex;
///
/// assert_eq!(int2asn1len(0x41), hex!("41").to_vec());
/// assert_eq!(int2asn1len(2024), hex!("8207E8").to_vec());
/// ```
#[must_use]
pub fn int2asn1len(length: usize) -> Vec<u8> {
    if length < 128 {
        return vec![length as u8];
    }
    let octets: Vec<u8> = length
        .to_be_bytes()
        .into_iter()
        .skip_while(|&b| b == 0)
        .collect();
    let mut length_bytes = Vec::with_capacity(octets.len() + 1);
    length_bytes.push(0x80 | octets.len() as u8);
    length_bytes.extend(octets);
    length_bytes
}

/// Retrieves the value of the first data object and the data after it.
///
/// # Errors
///
/// * `SimulatorError` if the data is incomplete.
pub(crate) fn get_asn1_child(data: &[u8], tag_len: usize) -> Result<(&[u8], &[u8]), SimulatorError> {
    let (tl, v) = len2int(data, tag_len)?;
    let end = match tl.checked_add(v) {
        Some(end) if end <= data.len() => end,
        _ => {
            error!(
                "Error during get_asn1_child, `data.len()`: `{}` is less than `tl + v`: `{tl}` + `{v}`",
                data.len()
            );
            return Err(SimulatorError::WrongLength {
                operation: "TLV decoding",
                expected: tl.saturating_add(v),
                found: data.len(),
            });
        }
    };
    Ok((&data[tl..end], &data[end..]))
}

/// Builds a data object with a one or two byte tag.
#[must_use]
pub fn build_tlv(tag: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = tag.to_vec();
    out.extend(int2asn1len(value.len()));
    out.extend_from_slice(value);
    out
}

/// Iterates the single-byte-tag data objects in `data` as `(tag, value)` pairs.
///
/// # Errors
///
/// * `SimulatorError` if any object is truncated.
pub fn parse_objects(mut data: &[u8]) -> Result<Vec<(u8, &[u8])>, SimulatorError> {
    let mut objects = Vec::new();
    while let Some(&tag) = data.first() {
        let (value, rest) = get_asn1_child(data, 1)?;
        objects.push((tag, value));
        data = rest;
    }
    Ok(objects)
}

/// Unwraps the `7C` template of a GENERAL AUTHENTICATE command.
///
/// # Errors
///
/// * `SimulatorError` if the template tag is missing or truncated.
pub fn unwrap_dynamic_auth_data(data: &[u8]) -> Result<&[u8], SimulatorError> {
    if data.first() != Some(&TAG_DYNAMIC_AUTH_DATA) {
        error!(
            "Expected dynamic authentication data template, found: {}",
            bytes2hex(data)
        );
        return Err(SimulatorError::InvalidData {
            operation: "GENERAL AUTHENTICATE",
            reason: "missing dynamic authentication data template",
        });
    }
    let (inner, _) = get_asn1_child(data, 1)?;
    Ok(inner)
}

/// Finds the first object with one of `tags` inside a `7C` template.
///
/// # Errors
///
/// * `SimulatorError` if the template is malformed.
pub fn find_in_dynamic_auth_data<'a>(
    data: &'a [u8],
    tags: &[u8],
) -> Result<Option<&'a [u8]>, SimulatorError> {
    let inner = unwrap_dynamic_auth_data(data)?;
    Ok(parse_objects(inner)?
        .into_iter()
        .find(|(tag, _)| tags.contains(tag))
        .map(|(_, value)| value))
}

/// Wraps response objects in a `7C` template.
#[must_use]
pub fn dynamic_auth_data(objects: &[(u8, &[u8])]) -> Vec<u8> {
    let inner: Vec<u8> = objects
        .iter()
        .flat_map(|(tag, value)| build_tlv(&[*tag], value))
        .collect();
    build_tlv(&[TAG_DYNAMIC_AUTH_DATA], &inner)
}

/// Encodes the public key data object `7F49 { 06 oid, 86 point }` that
/// PACE authentication tokens are computed over.
#[must_use]
pub fn public_key_data_object(oid: &[u8], point: &[u8]) -> Vec<u8> {
    let inner = [build_tlv(&[TAG_OID], oid), build_tlv(&[TAG_EC_POINT], point)].concat();
    build_tlv(&TAG_PUBLIC_KEY, &inner)
}
