// ── Controller identifiers ──
//
// The controller addresses devices and state channels with 128-bit
// identifiers, but neither of its encodings is standard: the wire packs
// the first three groups little-endian, and the string form swallows the
// final dash. Both conversions live here; nothing else in the workspace
// touches the raw layouts, and no general-purpose UUID parser is involved
// (one would reject the missing-dash form).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

/// Length of the packed wire form.
pub const PACKED_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("expected 32 hex digits, got {0}")]
    Length(usize),

    #[error("invalid hex digit in identifier")]
    Hex,
}

/// 128-bit handle for a device or a state channel.
///
/// Backed by a [`Uuid`] for storage and canonical display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(Uuid);

impl Identifier {
    /// Parse either the canonical hyphenated form or the controller's
    /// missing-last-dash form. Dashes are positional noise in both.
    pub fn parse(s: &str) -> Result<Self, IdentifierError> {
        let digits: String = s.chars().filter(|c| *c != '-').collect();
        if digits.len() != 2 * PACKED_LEN {
            return Err(IdentifierError::Length(digits.len()));
        }
        let mut bytes = [0u8; PACKED_LEN];
        hex::decode_to_slice(&digits, &mut bytes).map_err(|_| IdentifierError::Hex)?;
        Ok(Self(Uuid::from_bytes(bytes)))
    }

    /// Decode the packed wire layout: a little-endian u32, two
    /// little-endian u16s, then eight bytes in network order.
    pub fn from_packed(raw: &[u8; PACKED_LEN]) -> Self {
        let ordered = [
            raw[3], raw[2], raw[1], raw[0], // u32, little-endian
            raw[5], raw[4], // u16, little-endian
            raw[7], raw[6], // u16, little-endian
            raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15],
        ];
        Self(Uuid::from_bytes(ordered))
    }

    /// Re-encode into the packed wire layout. Exact inverse of
    /// [`from_packed`](Self::from_packed).
    pub fn to_packed(self) -> [u8; PACKED_LEN] {
        let b = self.0.as_bytes();
        [
            b[3], b[2], b[1], b[0], //
            b[5], b[4], //
            b[7], b[6], //
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        ]
    }

    /// The controller's string form: the canonical form with the last
    /// dash absorbed into the final group. Action URLs embed this
    /// verbatim, so the convention must be reproduced exactly.
    pub fn to_controller_string(self) -> String {
        let s = self.0.hyphenated().to_string();
        match s.rfind('-') {
            Some(i) => format!("{}{}", &s[..i], &s[i + 1..]),
            None => s,
        }
    }
}

impl fmt::Display for Identifier {
    /// Canonical hyphenated form, used in bus topics.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROLLER_FORM: &str = "0f86a2fe-0378-3632-ffff112233445566";
    const CANONICAL_FORM: &str = "0f86a2fe-0378-3632-ffff-112233445566";

    #[test]
    fn parses_the_controller_form() {
        let id = Identifier::parse(CONTROLLER_FORM).unwrap();
        assert_eq!(id.to_string(), CANONICAL_FORM);
    }

    #[test]
    fn controller_string_round_trips() {
        let id = Identifier::parse(CONTROLLER_FORM).unwrap();
        assert_eq!(id.to_controller_string(), CONTROLLER_FORM);
    }

    #[test]
    fn canonical_and_controller_forms_agree() {
        let a = Identifier::parse(CONTROLLER_FORM).unwrap();
        let b = Identifier::parse(CANONICAL_FORM).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn packed_layout_round_trips() {
        let packed: [u8; PACKED_LEN] = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, //
            0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
        ];
        let id = Identifier::from_packed(&packed);
        assert_eq!(id.to_packed(), packed);
    }

    #[test]
    fn packed_layout_reorders_the_first_three_groups() {
        let packed: [u8; PACKED_LEN] = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, //
            0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
        ];
        let id = Identifier::from_packed(&packed);
        assert_eq!(id.to_string(), "33221100-5544-7766-8899-aabbccddeeff");
        assert_eq!(id.to_controller_string(), "33221100-5544-7766-8899aabbccddeeff");
    }

    #[test]
    fn string_and_packed_agree() {
        let id = Identifier::parse("33221100-5544-7766-8899aabbccddeeff").unwrap();
        assert_eq!(
            id.to_packed(),
            [
                0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, //
                0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
            ]
        );
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(
            Identifier::parse("0f86a2fe"),
            Err(IdentifierError::Length(8))
        );
    }

    #[test]
    fn rejects_non_hex() {
        assert_eq!(
            Identifier::parse("zf86a2fe-0378-3632-ffff112233445566"),
            Err(IdentifierError::Hex)
        );
    }

    #[test]
    fn from_str_parses() {
        let id: Identifier = CANONICAL_FORM.parse().unwrap();
        assert_eq!(id.to_controller_string(), CONTROLLER_FORM);
    }
}
