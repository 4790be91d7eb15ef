//! Channel metadata and the entries stored per channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timestamp::Timestamp;

/// Upper bound for channel and credential identifiers, in bytes.
pub const MAX_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Numeric,
    Text,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_value_type(input: &str) -> Option<ValueType> {
    match input {
        "numeric" => Some(ValueType::Numeric),
        "text" => Some(ValueType::Text),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Numeric(f64),
    Text(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Numeric(_) => ValueType::Numeric,
            Self::Text(_) => ValueType::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Numeric(v) => Some(*v),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "{v}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Numeric(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub description: String,
    pub value_type: ValueType,
    pub encrypted: bool,
}

impl Channel {
    pub fn numeric(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            value_type: ValueType::Numeric,
            encrypted: false,
        }
    }

    pub fn text(id: impl Into<String>, description: impl Into<String>, encrypted: bool) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            value_type: ValueType::Text,
            encrypted,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("channel id", &self.id)
    }
}

/// Conventional `{source}::{token}` channel id.
pub fn channel_id(source: &str, token: &str) -> String {
    format!("{source}::{token}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Entry {
    pub fn new(timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} must not be empty")]
    EmptyIdentifier { kind: &'static str },
    #[error("{kind} '{id}' is {len} bytes long; at most {max} bytes are allowed")]
    IdentifierTooLong {
        kind: &'static str,
        id: String,
        len: usize,
        max: usize,
    },
    #[error("channel {channel} stores {expected} values, got {found}")]
    ValueTypeMismatch {
        channel: String,
        expected: ValueType,
        found: ValueType,
    },
    #[error("channel {channel} got a non-finite value at {timestamp}")]
    NonFiniteValue { channel: String, timestamp: String },
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
}

pub fn validate_identifier(kind: &'static str, id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyIdentifier { kind });
    }
    if id.len() > MAX_ID_LEN {
        return Err(ValidationError::IdentifierTooLong {
            kind,
            id: id.to_string(),
            len: id.len(),
            max: MAX_ID_LEN,
        });
    }
    Ok(())
}

pub(crate) fn validate_entry(channel: &Channel, entry: &Entry) -> Result<(), ValidationError> {
    let found = entry.value.value_type();
    if found != channel.value_type {
        return Err(ValidationError::ValueTypeMismatch {
            channel: channel.id.clone(),
            expected: channel.value_type,
            found,
        });
    }
    if let Value::Numeric(v) = &entry.value {
        if !v.is_finite() {
            return Err(ValidationError::NonFiniteValue {
                channel: channel.id.clone(),
                timestamp: entry.timestamp.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Granularity;

    #[test]
    fn identifiers_are_length_checked_not_truncated() {
        assert!(validate_identifier("channel id", "CryptoCompare::BTC").is_ok());
        assert_eq!(
            validate_identifier("channel id", ""),
            Err(ValidationError::EmptyIdentifier { kind: "channel id" })
        );

        let long = "x".repeat(MAX_ID_LEN + 1);
        assert!(matches!(
            validate_identifier("credential id", &long),
            Err(ValidationError::IdentifierTooLong { len: 65, .. })
        ));
        assert!(validate_identifier("channel id", &"x".repeat(MAX_ID_LEN)).is_ok());
    }

    #[test]
    fn entries_must_match_channel_type() {
        let ts = Timestamp::new("2017-04-21 12:00", Granularity::Hour).unwrap();
        let numeric = Channel::numeric(channel_id("Test", "ETH"), "Ethereum course");
        let text = Channel::text(channel_id("Test", "Twitter::ETH"), "Twitter", true);

        assert!(validate_entry(&numeric, &Entry::new(ts, 234.32)).is_ok());
        assert!(validate_entry(&text, &Entry::new(ts, "hello")).is_ok());
        assert!(matches!(
            validate_entry(&numeric, &Entry::new(ts, "oops")),
            Err(ValidationError::ValueTypeMismatch {
                expected: ValueType::Numeric,
                found: ValueType::Text,
                ..
            })
        ));
        assert!(matches!(
            validate_entry(&numeric, &Entry::new(ts, f64::NAN)),
            Err(ValidationError::NonFiniteValue { .. })
        ));
    }

    #[test]
    fn value_types_round_trip_through_their_names() {
        for value_type in [ValueType::Numeric, ValueType::Text] {
            assert_eq!(parse_value_type(value_type.as_str()), Some(value_type));
        }
        assert_eq!(parse_value_type("float"), None);
    }
}
