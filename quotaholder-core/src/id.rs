use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

use crate::error::QuotaError;

// Serial uniquely identifies a commission. Serials are handed out in
// increasing order by the store and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Serial(u64);

impl Serial {
    /// Largest serial a commission may carry (2^63 - 1)
    pub const MAX: Serial = Serial(i64::MAX as u64);

    /// The first serial a fresh store allocates
    pub const FIRST: Serial = Serial(1);

    pub fn new(value: u64) -> Result<Self, QuotaError> {
        if value == 0 || value > Self::MAX.0 {
            return Err(QuotaError::InvalidData(format!(
                "serial {} outside 1..={}",
                value,
                Self::MAX.0
            )));
        }
        Ok(Serial(value))
    }

    /// Get the raw value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Value as a signed 64-bit integer, for storage columns
    pub fn as_i64(&self) -> i64 {
        // Always fits: the constructor caps at i64::MAX
        self.0 as i64
    }

    pub fn from_i64(value: i64) -> Result<Self, QuotaError> {
        if value < 0 {
            return Err(QuotaError::Corrupted(format!("negative serial {}", value)));
        }
        Self::new(value as u64)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "commission:{}", self.0)
    }
}

impl Deref for Serial {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for Serial {
    type Error = QuotaError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Serial::new(value)
    }
}

impl From<Serial> for u64 {
    fn from(serial: Serial) -> Self {
        serial.0
    }
}

/// Checks that a name used as an entity, resource or policy key is canonical:
/// non-empty, no surrounding whitespace, no control characters.
pub fn validate_name(kind: &str, name: &str) -> Result<(), QuotaError> {
    if name.is_empty() {
        return Err(QuotaError::InvalidData(format!("empty {} name", kind)));
    }
    if name.trim() != name || name.chars().any(char::is_control) {
        return Err(QuotaError::InvalidData(format!(
            "non-canonical {} name {:?}",
            kind, name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_bounds() {
        assert!(Serial::new(0).is_err());
        assert!(Serial::new(1).is_ok());
        assert!(Serial::new(i64::MAX as u64).is_ok());
        assert!(Serial::new(i64::MAX as u64 + 1).is_err());
    }

    #[test]
    fn test_serial_serde_rejects_out_of_range() {
        let serial: Serial = serde_json::from_str("42").unwrap();
        assert_eq!(*serial, 42);
        assert_eq!(serde_json::to_string(&serial).unwrap(), "42");

        assert!(serde_json::from_str::<Serial>("0").is_err());
        assert!(serde_json::from_str::<Serial>("9223372036854775808").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("entity", "alice").is_ok());
        assert!(validate_name("entity", "").is_err());
        assert!(validate_name("entity", " alice").is_err());
        assert!(validate_name("resource", "cpu\n").is_err());
    }
}
