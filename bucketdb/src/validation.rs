//! Record validation: key grammar, reserved keys and scalar values.
//!
//! Raw records are validated before they are parsed into [`crate::Record`]s. Validation walks the
//! fields in input order and reports the first offending field only.
use serde_json::Value as Json;

use crate::{
    error::{BucketError, Result},
    record::RawRecord,
};

/// Outcome of validating a record or a set of request arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(String),
}

impl ValidationResult {
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        ValidationResult::Invalid(message.into())
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ValidationResult::Valid => None,
            ValidationResult::Invalid(message) => Some(message),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            ValidationResult::Valid => Ok(()),
            ValidationResult::Invalid(message) => Err(BucketError::Validation(message)),
        }
    }
}

/// Keys start with a letter, digit or underscore, followed by letters, digits, underscores,
/// hyphens or parentheses.
pub fn key_is_valid(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first.is_alphanumeric() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '(' | ')'))
}

pub fn key_is_reserved(key: &str) -> bool {
    key.starts_with('_')
}

/// Reserved keys a client may send.
pub fn key_is_internal(key: &str) -> bool {
    matches!(key, "_timestamp" | "_id")
}

pub fn value_is_valid(value: &Json) -> bool {
    matches!(value, Json::String(_) | Json::Number(_) | Json::Bool(_))
}

pub fn value_is_valid_id(value: &Json) -> bool {
    match value {
        Json::String(s) => !s.is_empty() && !s.chars().any(char::is_whitespace),
        _ => false,
    }
}

/// `YYYY-MM-DDTHH:MM:SS` followed by `Z`, `+HH:MM`, `-HH:MM`, `+HHMM` or `-HHMM`.
pub fn value_is_valid_datetime_string(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() < 20 || !matches_pattern(&bytes[..19], b"dddd-dd-ddTdd:dd:dd") {
        return false;
    }
    match &bytes[19..] {
        b"Z" => true,
        [sign, offset @ ..] if matches!(*sign, b'+' | b'-') => {
            matches_pattern(offset, b"dd:dd") || matches_pattern(offset, b"dddd")
        }
        _ => false,
    }
}

// `d` in the pattern stands for an ASCII digit, every other byte must match literally.
pub(crate) fn matches_pattern(input: &[u8], pattern: &[u8]) -> bool {
    input.len() == pattern.len()
        && input.iter().zip(pattern).all(|(c, p)| match *p {
            b'd' => c.is_ascii_digit(),
            _ => c == p,
        })
}

fn value_is_valid_timestamp(value: &Json) -> bool {
    match value {
        Json::String(s) => {
            value_is_valid_datetime_string(s) && crate::period::parse_grammar_checked(s).is_some()
        }
        _ => false,
    }
}

/// Validates a raw record field by field, in input order, stopping at the first failure.
pub fn validate_record_data(record: &RawRecord) -> ValidationResult {
    for (key, value) in record {
        if !key_is_valid(key) {
            return ValidationResult::invalid(format!("{key} is not a valid key"));
        }
        if !value_is_valid(value) {
            return ValidationResult::invalid(format!("{key} has an invalid value"));
        }
        if key_is_reserved(key) {
            match key.as_str() {
                "_timestamp" => {
                    if !value_is_valid_timestamp(value) {
                        return ValidationResult::invalid(format!(
                            "{key} is not a valid datetime object"
                        ));
                    }
                }
                "_id" => {
                    if !value_is_valid_id(value) {
                        return ValidationResult::invalid(format!("{key} is not a valid id"));
                    }
                }
                _ => {
                    return ValidationResult::invalid(format!(
                        "{key} is not a recognised internal field"
                    ))
                }
            }
        }
    }
    ValidationResult::Valid
}
