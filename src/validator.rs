use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A phone number that has passed [`validate`]. The inner string is in
/// normalized form: optional leading `+` followed by digits only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidNumber {
    #[error("empty phone number")]
    Empty,
    #[error("phone number contains invalid characters")]
    BadCharacter,
    #[error("phone number must be 2 to 15 digits")]
    BadLength,
    #[error("phone number cannot start with zero")]
    LeadingZero,
}

/// Validate a raw phone number string.
///
/// Strips whitespace, hyphens and parentheses, accepts an optional leading
/// `+`, and requires 2 to 15 digits with no leading zero.
pub fn validate(raw: &str) -> Result<PhoneNumber, InvalidNumber> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '\t' | '\r' | '\n' | '-' | '(' | ')'))
        .collect();

    if cleaned.is_empty() {
        return Err(InvalidNumber::Empty);
    }

    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if digits.is_empty() {
        return Err(InvalidNumber::Empty);
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(InvalidNumber::BadCharacter);
    }
    if digits.starts_with('0') {
        return Err(InvalidNumber::LeadingZero);
    }
    if digits.len() < 2 || digits.len() > 15 {
        return Err(InvalidNumber::BadLength);
    }
    Ok(PhoneNumber(cleaned))
}

/// Split raw text on commas, semicolons and newlines and keep the entries
/// that validate. This is the output contract of the file-import layer: an
/// ordered list of validated numbers, in input order.
pub fn parse_number_list(raw: &str) -> Vec<PhoneNumber> {
    raw.split([',', ';', '\n'])
        .filter_map(|entry| validate(entry).ok())
        .collect()
}

impl PhoneNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PhoneNumber {
    type Err = InvalidNumber;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate(s)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = InvalidNumber;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}
