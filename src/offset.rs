//! Bit-precise cursor positions inside the input buffer.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A position in the input: whole bytes plus a bit index inside the next byte.
///
/// `bit` is always normalized into `0..8`; any overflow is carried into `byte`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Offset {
    byte: i64,
    bit: u8,
}

impl Offset {
    pub const ZERO: Offset = Offset { byte: 0, bit: 0 };

    pub fn new(byte: i64, bit: i64) -> Self {
        Offset::ZERO.add(byte, bit)
    }

    pub fn from_bytes(byte: i64) -> Self {
        Offset { byte, bit: 0 }
    }

    /// Inverse of [`Offset::to_bits`].
    pub fn from_bits(bits: i64) -> Self {
        Offset {
            byte: bits.div_euclid(8),
            bit: bits.rem_euclid(8) as u8,
        }
    }

    pub fn byte(&self) -> i64 {
        self.byte
    }

    pub fn bit(&self) -> u8 {
        self.bit
    }

    /// Absolute position in bits (`byte * 8 + bit`).
    pub fn to_bits(&self) -> i64 {
        self.byte * 8 + self.bit as i64
    }

    /// Returns a new offset moved by `byte_delta` bytes and `bit_delta` bits.
    pub fn add(&self, byte_delta: i64, bit_delta: i64) -> Offset {
        let bits = self.bit as i64 + bit_delta;
        Offset {
            byte: self.byte + byte_delta + bits.div_euclid(8),
            bit: bits.rem_euclid(8) as u8,
        }
    }

    /// Byte index one past the last byte touched by a range ending here.
    pub fn ceil_byte(&self) -> i64 {
        if self.bit == 0 {
            self.byte
        } else {
            self.byte + 1
        }
    }
}

impl Ord for Offset {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.byte, self.bit).cmp(&(other.byte, other.bit))
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bit == 0 {
            write!(f, "{}", self.byte)
        } else {
            write!(f, "{}.{}", self.byte, self.bit)
        }
    }
}

/// Accepts the [`Display`](fmt::Display) forms: `"5"` or `"5.3"` (bit below 8).
impl FromStr for Offset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (byte, bit) = s.trim().split_once('.').unwrap_or((s.trim(), "0"));
        let byte: i64 = byte.parse().map_err(|_| format!("invalid offset: {}", s))?;
        let bit: u8 = bit.parse().map_err(|_| format!("invalid offset: {}", s))?;
        if bit >= 8 {
            return Err(format!("bit index out of range: {}", s));
        }
        Ok(Offset { byte, bit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_normalizes_bits() {
        let o = Offset::from_bytes(3).add(0, 13);
        assert_eq!(o.byte(), 4);
        assert_eq!(o.bit(), 5);
        let back = o.add(0, -6);
        assert_eq!((back.byte(), back.bit()), (3, 7));
    }

    #[test]
    fn add_splits_like_chained_add() {
        for start_bit in 0..8 {
            let o = Offset::new(10, start_bit);
            for db in -3..4 {
                for bb in 0..8 {
                    let joined = o.add(db, bb);
                    assert!(joined.bit() < 8);
                    assert_eq!(o.add(db, 0).add(0, bb), joined);
                }
            }
        }
    }

    #[test]
    fn ordering_is_byte_then_bit() {
        assert!(Offset::new(1, 7) < Offset::new(2, 0));
        assert!(Offset::new(2, 1) > Offset::new(2, 0));
        assert_eq!(Offset::new(0, 16), Offset::from_bytes(2));
    }

    #[test]
    fn bits_round_trip_through_integers() {
        let o = Offset::new(5, 3);
        assert_eq!(o.to_bits(), 43);
        assert_eq!(Offset::from_bits(43), o);
        assert_eq!(o.to_string(), "5.3");
        assert_eq!(o.ceil_byte(), 6);
        assert_eq!("5.3".parse::<Offset>(), Ok(o));
        assert_eq!("12".parse::<Offset>(), Ok(Offset::from_bytes(12)));
        assert!("1.8".parse::<Offset>().is_err());
    }
}
