//! The travel document record a session is initialized with.

use alloc::{borrow::ToOwned, collections::BTreeMap, format, string::String};
use core::fmt;

use tracing::error;

use crate::error::SimulatorError;

const MRZ_CHARSET: &str = "0123456789<ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Sex marker as printed in the MRZ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sex {
    Male,
    Female,
    #[default]
    Unspecified,
}

impl Sex {
    #[must_use]
    pub const fn mrz_char(self) -> char {
        match self {
            Self::Male => 'M',
            Self::Female => 'F',
            Self::Unspecified => '<',
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mrz_char())
    }
}

/// Document data supplied by the surrounding application.
///
/// Dates are `YYMMDD` strings, as printed in the MRZ. The record is treated
/// as immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentRecord {
    pub document_number: String,
    pub date_of_birth: String,
    pub date_of_expiry: String,
    pub issuing_state: String,
    pub nationality: String,
    pub surname: String,
    pub given_names: String,
    pub sex: Sex,
}

/// A calendar date resolved from a `YYMMDD` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Date {
    year: u16,
    month: u8,
    day: u8,
}

const fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 => 29,
        2 => 28,
        _ => 0,
    }
}

/// Splits a `YYMMDD` field into its numeric parts.
fn parse_yymmdd(field: &'static str, value: &str) -> Result<(u16, u8, u8), SimulatorError> {
    let invalid = || {
        error!("Error while parsing {field}, expected YYMMDD, received {value}");
        SimulatorError::InvalidDocument {
            field,
            value: value.to_owned(),
        }
    };
    if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let number = |range: core::ops::Range<usize>| value[range].parse::<u8>().map_err(|_| invalid());
    let (yy, mm, dd) = (number(0..2)?, number(2..4)?, number(4..6)?);
    if !(1..=12).contains(&mm) || dd == 0 {
        return Err(invalid());
    }
    Ok((u16::from(yy), mm, dd))
}

fn resolve_date(
    field: &'static str,
    value: &str,
    (yy, month, day): (u16, u8, u8),
    century: u16,
) -> Result<Date, SimulatorError> {
    let year = century + yy;
    if day > days_in_month(year, month) {
        error!("Error while parsing {field}, {value} is not a calendar date");
        return Err(SimulatorError::InvalidDocument {
            field,
            value: value.to_owned(),
        });
    }
    Ok(Date { year, month, day })
}

impl DocumentRecord {
    /// The conformance predicate a record must pass before a handshake may
    /// be initialized with it.
    ///
    /// The document number must be 1 to 22 MRZ characters. Both dates must be
    /// real calendar dates and the birth date must precede the expiry date.
    /// The expiry year is read as 20YY; the birth year as 20YY unless that
    /// would be after the expiry year, in which case 19YY.
    ///
    /// # Errors
    ///
    /// * `SimulatorError::InvalidDocument` naming the first offending field.
    pub fn validate(&self) -> Result<(), SimulatorError> {
        if self.document_number.is_empty()
            || self.document_number.len() > 22
            || self
                .document_number
                .chars()
                .any(|c| !MRZ_CHARSET.contains(c))
        {
            error!(
                "Document number must be 1 to 22 MRZ characters, received {}",
                self.document_number
            );
            return Err(SimulatorError::InvalidDocument {
                field: "Document number",
                value: self.document_number.clone(),
            });
        }

        let expiry_parts = parse_yymmdd("Expiry date", &self.date_of_expiry)?;
        let birth_parts = parse_yymmdd("Birth date", &self.date_of_birth)?;
        let expiry = resolve_date("Expiry date", &self.date_of_expiry, expiry_parts, 2000)?;
        let birth_century = if 2000 + birth_parts.0 <= expiry.year {
            2000
        } else {
            1900
        };
        let birth = resolve_date("Birth date", &self.date_of_birth, birth_parts, birth_century)?;

        if birth >= expiry {
            error!(
                "Birth date {} is not before expiry date {}",
                self.date_of_birth, self.date_of_expiry
            );
            return Err(SimulatorError::InvalidDocument {
                field: "Birth date",
                value: self.date_of_birth.clone(),
            });
        }
        Ok(())
    }

    /// The MRZ information used as the BAC key seed input and the PACE
    /// password: document number, birth date and expiry date, each followed
    /// by its check digit.
    ///
    /// # Errors
    ///
    /// * `SimulatorError` if a field contains characters outside the MRZ set.
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_emulator::SimulatorError;
    /// #
    /// # fn main() -> Result<(), SimulatorError> {
    /// use emrtd_emulator::DocumentRecord;
    ///
    /// let document = DocumentRecord {
    ///     document_number: "L898902C3".into(),
    ///     date_of_birth: "740812".into(),
    ///     date_of_expiry: "120415".into(),
    ///     ..DocumentRecord::default()
    /// };
    /// assert_eq!(document.mrz_key()?, "L898902C3674081221204159");
    /// #     Ok(())
    /// # }
    /// ```
    pub fn mrz_key(&self) -> Result<String, SimulatorError> {
        other_mrz(
            &self.document_number,
            &self.date_of_birth,
            &self.date_of_expiry,
        )
    }
}

/// Calculates the check digit of an MRZ field.
/// Calculation is explained at ICAO Doc 9303-3 Section 4.9:
/// <https://www.icao.int/publications/Documents/9303_p3_cons_en.pdf>
///
/// # Errors
///
/// * `SimulatorError` if an invalid character is given.
pub(crate) fn calculate_check_digit(data: &str) -> Result<char, SimulatorError> {
    #[rustfmt::skip]
    let values: BTreeMap<char, u32> = [
        ('0', 0), ('1', 1), ('2', 2), ('3', 3), ('4', 4), ('5', 5), ('6', 6), ('7', 7),
        ('8', 8), ('9', 9), ('<', 0), ('A', 10), ('B', 11), ('C', 12), ('D', 13), ('E', 14),
        ('F', 15), ('G', 16), ('H', 17), ('I', 18), ('J', 19), ('K', 20), ('L', 21), ('M', 22),
        ('N', 23), ('O', 24), ('P', 25), ('Q', 26), ('R', 27), ('S', 28), ('T', 29), ('U', 30),
        ('V', 31), ('W', 32), ('X', 33), ('Y', 34), ('Z', 35),
    ]
    .iter()
    .copied()
    .collect();

    let weights = [7, 3, 1];
    let mut total = 0;

    for (counter, value) in data.chars().enumerate() {
        if let Some(weighted_value) = values.get(&value).copied() {
            total += weights[counter % 3] * weighted_value;
        } else {
            error!("Can not calculate check digit for invalid character: `{value}`");
            return Err(SimulatorError::InvalidDocument {
                field: "MRZ character",
                value: format!("{value}"),
            });
        }
    }

    char::from_digit(total % 10, 10).ok_or_else(|| SimulatorError::Internal {
        reason: format!("check digit {} out of range", total % 10),
    })
}

/// Formats the MRZ information from its three fields.
fn other_mrz(doc_no: &str, birthdate: &str, expirydate: &str) -> Result<String, SimulatorError> {
    // Document number can be up to 9 characters on TD3, 14 on TD2 and 22 on TD1 sized eMRTDs.
    if doc_no.is_empty() || doc_no.len() > 22 || doc_no.chars().any(|c| !MRZ_CHARSET.contains(c))
    {
        error!("Error during other_mrz, document number length must be 1 to 22 and should not contain illegal characters, received {doc_no}");
        return Err(SimulatorError::InvalidDocument {
            field: "Document number",
            value: doc_no.to_owned(),
        });
    }
    if birthdate.len() != 6 || birthdate.chars().any(|c| !MRZ_CHARSET.contains(c)) {
        error!("Error during other_mrz, birth date length must be 6 and should not contain illegal characters, received {birthdate}");
        return Err(SimulatorError::InvalidDocument {
            field: "Birth date",
            value: birthdate.to_owned(),
        });
    }
    if expirydate.len() != 6 || expirydate.chars().any(|c| !MRZ_CHARSET.contains(c)) {
        error!("Error during other_mrz, expiry date length must be 6 and should not contain illegal characters, received {expirydate}");
        return Err(SimulatorError::InvalidDocument {
            field: "Expiry date",
            value: expirydate.to_owned(),
        });
    }

    Ok(format!(
        "{:<9}{}{}{}{}{}",
        doc_no,
        calculate_check_digit(doc_no)?,
        birthdate,
        calculate_check_digit(birthdate)?,
        expirydate,
        calculate_check_digit(expirydate)?
    ))
}
