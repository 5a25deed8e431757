use serde::{Deserialize, Serialize};
use thiserror::Error;

const FLAG_LOWERCASE: u16 = 0x0001;
const FLAG_UPPERCASE: u16 = 0x0002;
const FLAG_DIGITS: u16 = 0x0004;
const FLAG_SYMBOLS: u16 = 0x0008;
const FLAG_HEX_ONLY: u16 = 0x0010;
const FLAG_EASY_VISION: u16 = 0x0020;
const FLAG_PRONOUNCEABLE: u16 = 0x0040;
const KNOWN_FLAGS: u16 = 0x007f;

const ENCODED_CHARS: usize = 4 + 3 + 4 * 3;
const MAX_GENERATED_LENGTH: u16 = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy descriptor must be {ENCODED_CHARS} hex characters")]
    WrongDescriptorLength,
    #[error("invalid hex in policy {0}")]
    InvalidHex(&'static str),
    #[error("unknown policy flag bits: {0:#06x}")]
    UnknownFlags(u16),
    #[error("hex-only policies cannot combine with other character classes")]
    ConflictingClasses,
    #[error("policy selects no character classes")]
    NoClasses,
    #[error("policy length {length} cannot satisfy minimum counts totalling {minimum}")]
    LengthTooShort { length: u16, minimum: u16 },
}

/// Rules for generating a password: which character classes to draw from,
/// the target length, and per-class minimum counts. Stored inline on a
/// record or under a name in the store's policy table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordPolicy {
    pub use_lowercase: bool,
    pub use_uppercase: bool,
    pub use_digits: bool,
    pub use_symbols: bool,
    pub use_hex_only: bool,
    pub easy_vision: bool,
    pub pronounceable: bool,
    pub length: u16,
    pub min_lowercase: u16,
    pub min_uppercase: u16,
    pub min_digits: u16,
    pub min_symbols: u16,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            use_lowercase: true,
            use_uppercase: true,
            use_digits: true,
            use_symbols: true,
            use_hex_only: false,
            easy_vision: false,
            pronounceable: false,
            length: 12,
            min_lowercase: 1,
            min_uppercase: 1,
            min_digits: 1,
            min_symbols: 1,
        }
    }
}

impl PasswordPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.use_hex_only {
            if self.use_lowercase
                || self.use_uppercase
                || self.use_digits
                || self.use_symbols
                || self.easy_vision
                || self.pronounceable
            {
                return Err(PolicyError::ConflictingClasses);
            }
        } else if !self.use_lowercase && !self.use_uppercase && !self.use_digits && !self.use_symbols
        {
            return Err(PolicyError::NoClasses);
        }
        let minimum = self
            .min_lowercase
            .saturating_add(self.min_uppercase)
            .saturating_add(self.min_digits)
            .saturating_add(self.min_symbols);
        if self.length == 0 || self.length > MAX_GENERATED_LENGTH || self.length < minimum {
            return Err(PolicyError::LengthTooShort {
                length: self.length,
                minimum,
            });
        }
        Ok(())
    }

    /// Compact hex wire form: 4 hex chars of flags, 3 of length, then 3 each
    /// for the four minimum counts.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut flags = 0_u16;
        if self.use_lowercase {
            flags |= FLAG_LOWERCASE;
        }
        if self.use_uppercase {
            flags |= FLAG_UPPERCASE;
        }
        if self.use_digits {
            flags |= FLAG_DIGITS;
        }
        if self.use_symbols {
            flags |= FLAG_SYMBOLS;
        }
        if self.use_hex_only {
            flags |= FLAG_HEX_ONLY;
        }
        if self.easy_vision {
            flags |= FLAG_EASY_VISION;
        }
        if self.pronounceable {
            flags |= FLAG_PRONOUNCEABLE;
        }
        format!(
            "{flags:04x}{:03x}{:03x}{:03x}{:03x}{:03x}",
            self.length, self.min_lowercase, self.min_uppercase, self.min_digits, self.min_symbols
        )
    }

    pub fn decode(encoded: &str) -> Result<Self, PolicyError> {
        let bytes = encoded.as_bytes();
        if bytes.len() != ENCODED_CHARS {
            return Err(PolicyError::WrongDescriptorLength);
        }
        let flags = parse_hex(&bytes[0..4], "flags")?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(PolicyError::UnknownFlags(flags & !KNOWN_FLAGS));
        }
        let policy = Self {
            use_lowercase: flags & FLAG_LOWERCASE != 0,
            use_uppercase: flags & FLAG_UPPERCASE != 0,
            use_digits: flags & FLAG_DIGITS != 0,
            use_symbols: flags & FLAG_SYMBOLS != 0,
            use_hex_only: flags & FLAG_HEX_ONLY != 0,
            easy_vision: flags & FLAG_EASY_VISION != 0,
            pronounceable: flags & FLAG_PRONOUNCEABLE != 0,
            length: parse_hex(&bytes[4..7], "length")?,
            min_lowercase: parse_hex(&bytes[7..10], "minimum lowercase")?,
            min_uppercase: parse_hex(&bytes[10..13], "minimum uppercase")?,
            min_digits: parse_hex(&bytes[13..16], "minimum digits")?,
            min_symbols: parse_hex(&bytes[16..19], "minimum symbols")?,
        };
        policy.validate()?;
        Ok(policy)
    }
}

fn parse_hex(bytes: &[u8], what: &'static str) -> Result<u16, PolicyError> {
    let text = std::str::from_utf8(bytes).map_err(|_| PolicyError::InvalidHex(what))?;
    u16::from_str_radix(text, 16).map_err(|_| PolicyError::InvalidHex(what))
}

#[cfg(test)]
mod tests {
    use super::{PasswordPolicy, PolicyError};

    #[test]
    fn default_policy_is_valid_and_roundtrips() {
        let policy = PasswordPolicy::default();
        policy.validate().expect("valid");
        assert_eq!(policy.encode(), "000f00c001001001001");
        assert_eq!(
            PasswordPolicy::decode(&policy.encode()).expect("decode"),
            policy
        );
    }

    #[test]
    fn hex_only_roundtrips() {
        let policy = PasswordPolicy {
            use_lowercase: false,
            use_uppercase: false,
            use_digits: false,
            use_symbols: false,
            use_hex_only: true,
            length: 20,
            min_lowercase: 0,
            min_uppercase: 0,
            min_digits: 0,
            min_symbols: 0,
            ..PasswordPolicy::default()
        };
        let decoded = PasswordPolicy::decode(&policy.encode()).expect("decode");
        assert!(decoded.use_hex_only);
        assert_eq!(decoded.length, 20);
    }

    #[test]
    fn rejects_hex_mixed_with_other_classes() {
        let policy = PasswordPolicy {
            use_hex_only: true,
            ..PasswordPolicy::default()
        };
        assert_eq!(policy.validate(), Err(PolicyError::ConflictingClasses));
    }

    #[test]
    fn rejects_length_below_minimum_counts() {
        let policy = PasswordPolicy {
            length: 3,
            ..PasswordPolicy::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyError::LengthTooShort {
                length: 3,
                minimum: 4
            })
        );
    }

    #[test]
    fn rejects_bad_descriptors() {
        assert_eq!(
            PasswordPolicy::decode("000f"),
            Err(PolicyError::WrongDescriptorLength)
        );
        assert_eq!(
            PasswordPolicy::decode("zzzz00c001001001001"),
            Err(PolicyError::InvalidHex("flags"))
        );
        assert_eq!(
            PasswordPolicy::decode("800f00c001001001001"),
            Err(PolicyError::UnknownFlags(0x8000))
        );
    }
}
