use rand::Rng as _;
use std::fmt;

use super::error::DhtError;
use crate::constants::{NODE_ID_BITS, NODE_ID_LENGTH};

/// A 48-byte (384-bit) identifier: a node id or a blob hash.
///
/// Bit 0 is the most significant bit of the first byte. Ordering is
/// lexicographic over the raw bytes, which is numeric ordering of the
/// big-endian integer — the property the XOR metric relies on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bitmap([u8; NODE_ID_LENGTH]);

impl Bitmap {
    /// Generates a uniformly random id.
    pub fn random() -> Self {
        let mut id = [0u8; NODE_ID_LENGTH];
        rand::rng().fill(&mut id[..]);
        Self(id)
    }

    /// Creates an id from a slice, which must be exactly 48 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != NODE_ID_LENGTH {
            return Err(DhtError::InvalidIdLength(bytes.len()));
        }
        let mut id = [0u8; NODE_ID_LENGTH];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Parses an id from a 96-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        if s.len() != NODE_ID_LENGTH * 2 {
            return Err(DhtError::InvalidHexId);
        }
        let mut id = [0u8; NODE_ID_LENGTH];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DhtError::InvalidHexId)?;
        }
        Ok(Self(id))
    }

    /// Lowercase hex rendering, always 96 characters.
    pub fn to_hex(&self) -> String {
        self.0.iter().fold(
            String::with_capacity(NODE_ID_LENGTH * 2),
            |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{:02x}", b);
                s
            },
        )
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &Bitmap) -> Bitmap {
        let mut out = [0u8; NODE_ID_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Bitmap(out)
    }

    /// Number of leading zero bits; 384 for the zero id.
    pub fn leading_zeros(&self) -> usize {
        for (i, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        NODE_ID_BITS
    }

    /// Length of the common high-order prefix with `other`, in bits.
    ///
    /// This is the bucket index of `other` relative to `self`; it is 384
    /// only when the ids are equal.
    pub fn prefix_len(&self, other: &Bitmap) -> usize {
        self.distance(other).leading_zeros()
    }

    /// Returns a copy with the first `n` bits forced to `bit`.
    pub fn prefix(&self, n: usize, bit: bool) -> Bitmap {
        let mut out = self.0;
        set_bit_run(&mut out, 0, n.min(NODE_ID_BITS), bit);
        Bitmap(out)
    }

    /// Returns a copy with the last `n` bits forced to `bit`.
    pub fn suffix(&self, n: usize, bit: bool) -> Bitmap {
        let n = n.min(NODE_ID_BITS);
        let mut out = self.0;
        set_bit_run(&mut out, NODE_ID_BITS - n, NODE_ID_BITS, bit);
        Bitmap(out)
    }

    /// Whether `self` is strictly closer to `target` than `other` is.
    /// Equal distances mean equal ids, so ties cannot arise between
    /// distinct contacts.
    pub fn closer_to(&self, other: &Bitmap, target: &Bitmap) -> bool {
        self.distance(target) < other.distance(target)
    }
}

/// Sets bits `[start, end)` of `bytes` (big-endian bit order) to `bit`.
fn set_bit_run(bytes: &mut [u8], start: usize, end: usize, bit: bool) {
    for i in start..end {
        let mask = 0x80u8 >> (i % 8);
        if bit {
            bytes[i / 8] |= mask;
        } else {
            bytes[i / 8] &= !mask;
        }
    }
}

impl From<[u8; NODE_ID_LENGTH]> for Bitmap {
    fn from(bytes: [u8; NODE_ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bitmap({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
