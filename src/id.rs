//! 160-bit node/key identifiers and the XOR distance metric.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Width of an [`Id`] in bits.
pub const ID_BITS: usize = 160;
/// Width of an [`Id`] in bytes.
pub const ID_BYTES: usize = ID_BITS / 8;

/// A 160-bit identifier, stored big-endian, used both for node IDs and for
/// lookup/storage keys. Comparisons and arithmetic treat the bytes as one
/// unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id(#[serde(with = "hex_bytes")] pub [u8; ID_BYTES]);

mod hex_bytes {
    use super::ID_BYTES;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; ID_BYTES], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; ID_BYTES], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let mut out = [0u8; ID_BYTES];
        if v.len() != ID_BYTES {
            return Err(serde::de::Error::custom(format!(
                "expected {ID_BYTES} bytes, got {}",
                v.len()
            )));
        }
        out.copy_from_slice(&v);
        Ok(out)
    }
}

impl Id {
    pub const ZERO: Id = Id([0u8; ID_BYTES]);
    pub const MAX: Id = Id([0xffu8; ID_BYTES]);

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Id(bytes)
    }

    /// A cryptographically random identifier, uniform over `[0, 2^160)`.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Id(bytes)
    }

    /// A random identifier uniformly distributed within `[low, high]`
    /// (inclusive on both ends), used to seed bucket-refresh lookups.
    pub fn random_in_range(low: Id, high: Id) -> Self {
        debug_assert!(low <= high);
        let span = high.sub(low);
        if span == Id::ZERO {
            return low;
        }
        // Reject-free scaling: pick a random value in [0, span] by masking
        // to span's bit width and retrying on overflow, which keeps the
        // distribution uniform without needing a bigint modulo.
        loop {
            let candidate = Id::random().and(&span.next_pow2_mask());
            if candidate <= span {
                return low.add(candidate);
            }
        }
    }

    pub fn xor(&self, other: &Id) -> Id {
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        Id(out)
    }

    fn and(&self, mask: &Id) -> Id {
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = self.0[i] & mask.0[i];
        }
        Id(out)
    }

    /// Smallest `2^n - 1` mask that is `>= self`, used by `random_in_range`.
    fn next_pow2_mask(&self) -> Id {
        match self.leading_zero_bits() {
            ID_BITS => Id::ZERO,
            lz => {
                let significant_bits = ID_BITS - lz;
                let mut out = [0u8; ID_BYTES];
                let full_bytes = significant_bits / 8;
                let rem_bits = significant_bits % 8;
                for b in out.iter_mut().skip(ID_BYTES - full_bytes) {
                    *b = 0xff;
                }
                if rem_bits > 0 {
                    let idx = ID_BYTES - full_bytes - 1;
                    out[idx] = (1u16.wrapping_shl(rem_bits as u32) - 1) as u8;
                }
                Id(out)
            }
        }
    }

    /// Number of leading zero bits, counting from the most significant bit.
    pub fn leading_zero_bits(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    /// Length of the bit, matching `leading_zero_bits` semantics used for
    /// bucket-index selection: the position of the highest differing bit.
    pub fn bucket_index_for(&self, other: &Id) -> usize {
        let d = self.xor(other);
        let lz = d.leading_zero_bits();
        if lz >= ID_BITS {
            0
        } else {
            ID_BITS - 1 - lz
        }
    }

    fn add(&self, other: Id) -> Id {
        let mut out = [0u8; ID_BYTES];
        let mut carry = 0u16;
        for i in (0..ID_BYTES).rev() {
            let sum = self.0[i] as u16 + other.0[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        Id(out)
    }

    fn sub(&self, other: Id) -> Id {
        let mut out = [0u8; ID_BYTES];
        let mut borrow = 0i16;
        for i in (0..ID_BYTES).rev() {
            let diff = self.0[i] as i16 - other.0[i] as i16 - borrow;
            if diff < 0 {
                out[i] = (diff + 256) as u8;
                borrow = 1;
            } else {
                out[i] = diff as u8;
                borrow = 0;
            }
        }
        Id(out)
    }

    /// Midpoint of `[low, high]`, computed as `low + (high - low) / 2`.
    pub fn midpoint(low: Id, high: Id) -> Id {
        let span = high.sub(low);
        low.add(span.shr1())
    }

    fn shr1(&self) -> Id {
        let mut out = [0u8; ID_BYTES];
        let mut carry = 0u8;
        for i in 0..ID_BYTES {
            out[i] = (self.0[i] >> 1) | (carry << 7);
            carry = self.0[i] & 1;
        }
        Id(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.to_hex())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn xor_is_self_inverse() {
        let a = Id::random();
        let b = Id::random();
        assert_eq!(a.xor(&b).xor(&b), a);
    }

    #[test]
    fn xor_with_self_is_zero() {
        let a = Id::random();
        assert_eq!(a.xor(&a), Id::ZERO);
    }

    #[test]
    fn ordering_matches_byte_order() {
        let a = Id([0u8; ID_BYTES]);
        let mut hi = [0u8; ID_BYTES];
        hi[0] = 1;
        let b = Id(hi);
        assert!(a < b);
    }

    #[test]
    fn midpoint_is_between_bounds() {
        let low = Id::ZERO;
        let high = Id::MAX;
        let mid = Id::midpoint(low, high);
        assert!(mid > low && mid < high);
    }

    #[test]
    fn random_in_range_stays_within_bounds() {
        let low = Id::ZERO;
        let mut high_bytes = [0u8; ID_BYTES];
        high_bytes[ID_BYTES - 1] = 0xff;
        let high = Id(high_bytes);
        for _ in 0..50 {
            let r = Id::random_in_range(low, high);
            assert!(r >= low && r <= high);
        }
    }

    #[test]
    fn bucket_index_for_self_xor_is_zero_distance() {
        let a = Id::random();
        assert_eq!(a.xor(&a).leading_zero_bits(), ID_BITS);
    }

    proptest! {
        /// XOR distance is an ultrametric: `d(a, c) <= max(d(a, b), d(b, c))`,
        /// the strong form of the triangle inequality the router relies on
        /// when it reasons about a candidate "moving the frontier inward".
        #[test]
        fn xor_distance_satisfies_the_ultrametric_inequality(
            a in proptest::array::uniform20(any::<u8>()),
            b in proptest::array::uniform20(any::<u8>()),
            c in proptest::array::uniform20(any::<u8>()),
        ) {
            let (a, b, c) = (Id(a), Id(b), Id(c));
            let d_ac = a.xor(&c);
            let d_ab = a.xor(&b);
            let d_bc = b.xor(&c);
            prop_assert!(d_ac <= d_ab.max(d_bc));
        }

        /// `random_in_range` never escapes its bounds, whatever the bounds.
        #[test]
        fn random_in_range_always_within_bounds(
            low in proptest::array::uniform20(any::<u8>()),
            high_offset in proptest::array::uniform20(any::<u8>()),
        ) {
            let low = Id(low);
            // Derive a `high >= low` by OR-ing in the offset bits, so the
            // pair is always well-formed without rejecting samples.
            let mut high_bytes = low.0;
            for i in 0..ID_BYTES {
                high_bytes[i] |= high_offset[i];
            }
            let high = Id(high_bytes);
            let r = Id::random_in_range(low, high);
            prop_assert!(r >= low);
            prop_assert!(r <= high);
        }

        /// XOR is its own inverse for arbitrary operands, not just random ones.
        #[test]
        fn xor_round_trips_for_any_pair(
            a in proptest::array::uniform20(any::<u8>()),
            b in proptest::array::uniform20(any::<u8>()),
        ) {
            let (a, b) = (Id(a), Id(b));
            prop_assert_eq!(a.xor(&b).xor(&b), a);
        }
    }
}
