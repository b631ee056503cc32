//! # Transaction Information Flags (TIF)
//!
//! The 9-bit result mask returned to the client in every response. The TIF
//! is never persisted as authoritative state — it is computed fresh per
//! request from nonce state, identity state, and signature outcomes, then
//! rendered as uppercase hex in the `tif` response field.
//!
//! ## Bit Assignments
//!
//! | Bit                      | Hex   | Meaning                              |
//! |--------------------------|-------|--------------------------------------|
//! | `ID_MATCH`               | 0x01  | current identity recognized          |
//! | `PREVIOUS_ID_MATCH`      | 0x02  | previous identity recognized         |
//! | `IP_MATCH`               | 0x04  | current IP matches the nut's IP      |
//! | `SQRL_DISABLED`          | 0x08  | identity locked                      |
//! | `FUNCTION_NOT_SUPPORTED` | 0x10  | verb unsupported in this context     |
//! | `TRANSIENT_ERROR`        | 0x20  | retry with the fresh nut             |
//! | `COMMAND_FAILED`         | 0x40  | no state changed this request        |
//! | `CLIENT_FAILURE`         | 0x80  | client-side protocol error           |
//! | `BAD_ID_ASSOCIATION`     | 0x100 | nut/identity association mismatch    |
//!
//! These values are wire-facing and must stay bit-exact. Deployed clients
//! hard-code them.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Mask of all defined bits. Anything outside this range is not a TIF.
const ALL_BITS: u16 = 0x1FF;

/// The transaction-status bitfield.
///
/// A thin newtype over `u16` with const bits and set/test operations. We
/// deliberately don't pull in a flags macro crate for nine bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tif(u16);

impl Tif {
    /// The empty mask.
    pub const NONE: Tif = Tif(0);

    /// Current identity recognized.
    pub const ID_MATCH: Tif = Tif(0x01);
    /// Previous identity recognized.
    pub const PREVIOUS_ID_MATCH: Tif = Tif(0x02);
    /// Current IP matches the IP recorded when the nut was minted.
    pub const IP_MATCH: Tif = Tif(0x04);
    /// Identity is locked.
    pub const SQRL_DISABLED: Tif = Tif(0x08);
    /// The requested verb is unsupported in this context.
    pub const FUNCTION_NOT_SUPPORTED: Tif = Tif(0x10);
    /// Transient failure — the client should retry with the fresh nut.
    pub const TRANSIENT_ERROR: Tif = Tif(0x20);
    /// No state was changed by this request.
    pub const COMMAND_FAILED: Tif = Tif(0x40);
    /// The client violated the protocol.
    pub const CLIENT_FAILURE: Tif = Tif(0x80);
    /// The nut is associated with a different identity key.
    pub const BAD_ID_ASSOCIATION: Tif = Tif(0x100);

    /// Construct from raw bits, masking off anything undefined.
    pub const fn from_bits_truncate(bits: u16) -> Tif {
        Tif(bits & ALL_BITS)
    }

    /// The raw bit value.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True when no bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(self, other: Tif) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set every bit of `other`.
    pub fn insert(&mut self, other: Tif) {
        self.0 |= other.0;
    }

    /// The wire form: uppercase hex, no leading zeros (`0xC0` → `"C0"`).
    pub fn as_hex(self) -> String {
        format!("{:X}", self.0)
    }

    /// Parse the wire form. Case-insensitive; rejects undefined bits.
    pub fn from_hex(s: &str) -> Option<Tif> {
        let bits = u16::from_str_radix(s, 16).ok()?;
        if bits & !ALL_BITS != 0 {
            return None;
        }
        Some(Tif(bits))
    }
}

impl BitOr for Tif {
    type Output = Tif;

    fn bitor(self, rhs: Tif) -> Tif {
        Tif(self.0 | rhs.0)
    }
}

impl BitOrAssign for Tif {
    fn bitor_assign(&mut self, rhs: Tif) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Tif {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u16, &str); 9] = [
            (0x01, "ID_MATCH"),
            (0x02, "PREVIOUS_ID_MATCH"),
            (0x04, "IP_MATCH"),
            (0x08, "SQRL_DISABLED"),
            (0x10, "FUNCTION_NOT_SUPPORTED"),
            (0x20, "TRANSIENT_ERROR"),
            (0x40, "COMMAND_FAILED"),
            (0x80, "CLIENT_FAILURE"),
            (0x100, "BAD_ID_ASSOCIATION"),
        ];
        if self.0 == 0 {
            return write!(f, "Tif(0)");
        }
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Tif(0x{:X}: {})", self.0, set.join("|"))
    }
}

impl fmt::Display for Tif {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values_are_wire_exact() {
        // Deployed clients hard-code these. Never renumber.
        assert_eq!(Tif::ID_MATCH.bits(), 0x01);
        assert_eq!(Tif::PREVIOUS_ID_MATCH.bits(), 0x02);
        assert_eq!(Tif::IP_MATCH.bits(), 0x04);
        assert_eq!(Tif::SQRL_DISABLED.bits(), 0x08);
        assert_eq!(Tif::FUNCTION_NOT_SUPPORTED.bits(), 0x10);
        assert_eq!(Tif::TRANSIENT_ERROR.bits(), 0x20);
        assert_eq!(Tif::COMMAND_FAILED.bits(), 0x40);
        assert_eq!(Tif::CLIENT_FAILURE.bits(), 0x80);
        assert_eq!(Tif::BAD_ID_ASSOCIATION.bits(), 0x100);
    }

    #[test]
    fn test_hex_is_uppercase_without_padding() {
        assert_eq!((Tif::COMMAND_FAILED | Tif::CLIENT_FAILURE).as_hex(), "C0");
        assert_eq!(Tif::ID_MATCH.as_hex(), "1");
        assert_eq!(Tif::NONE.as_hex(), "0");
        assert_eq!(Tif::BAD_ID_ASSOCIATION.as_hex(), "100");
    }

    #[test]
    fn test_from_hex_roundtrip() {
        let tif = Tif::ID_MATCH | Tif::IP_MATCH | Tif::SQRL_DISABLED;
        assert_eq!(Tif::from_hex(&tif.as_hex()), Some(tif));
        // Lowercase input is accepted; we only ever emit uppercase.
        assert_eq!(Tif::from_hex("c0"), Some(Tif::COMMAND_FAILED | Tif::CLIENT_FAILURE));
    }

    #[test]
    fn test_from_hex_rejects_undefined_bits() {
        assert_eq!(Tif::from_hex("200"), None);
        assert_eq!(Tif::from_hex("zz"), None);
    }

    #[test]
    fn test_contains_and_insert() {
        let mut tif = Tif::NONE;
        assert!(!tif.contains(Tif::ID_MATCH));
        tif |= Tif::ID_MATCH;
        tif.insert(Tif::IP_MATCH);
        assert!(tif.contains(Tif::ID_MATCH));
        assert!(tif.contains(Tif::ID_MATCH | Tif::IP_MATCH));
        assert!(!tif.contains(Tif::COMMAND_FAILED));
    }

    #[test]
    fn test_debug_names_set_bits() {
        let tif = Tif::COMMAND_FAILED | Tif::CLIENT_FAILURE;
        let dbg = format!("{:?}", tif);
        assert!(dbg.contains("COMMAND_FAILED"));
        assert!(dbg.contains("CLIENT_FAILURE"));
        assert!(!dbg.contains("ID_MATCH"));
    }

    #[test]
    fn test_from_bits_truncate_masks() {
        assert_eq!(Tif::from_bits_truncate(0xFFFF).bits(), 0x1FF);
    }
}
