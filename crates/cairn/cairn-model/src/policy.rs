//! The policy record and its fixed 32-byte wire codec.
//!
//! Wire format, little-endian:
//!
//! ```text
//! offset  size  field
//!      0     4  policy_id (u32)
//!      4     1  age (u8)
//!      5     1  gender tag (0 = male, 1 = female)
//!      6     2  padding
//!      8     8  sum_assured (f64)
//!     16     8  premium (f64)
//!     24     1  term_years (u8)
//!     25     1  product tag (0 = term, 1 = whole life, 2 = endowment)
//!     26     6  padding
//! ```
//!
//! The byte layout is the source of truth: the bus round-trip tests compare
//! decoded values field-for-field, not struct memory.

use serde::{Deserialize, Serialize};

/// Size of one serialized policy record.
pub const POLICY_RECORD_BYTES: usize = 32;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("record is {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },

    #[error("unknown gender tag {tag}")]
    BadGender { tag: u8 },

    #[error("unknown product tag {tag}")]
    BadProduct { tag: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn tag(self) -> u8 {
        match self {
            Gender::Male => 0,
            Gender::Female => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Gender::Male),
            1 => Ok(Gender::Female),
            _ => Err(CodecError::BadGender { tag }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    Term,
    WholeLife,
    Endowment,
}

impl ProductType {
    pub fn tag(self) -> u8 {
        match self {
            ProductType::Term => 0,
            ProductType::WholeLife => 1,
            ProductType::Endowment => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(ProductType::Term),
            1 => Ok(ProductType::WholeLife),
            2 => Ok(ProductType::Endowment),
            _ => Err(CodecError::BadProduct { tag }),
        }
    }
}

/// One insured policy. Immutable after load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: u32,
    pub age: u8,
    pub gender: Gender,
    pub sum_assured: f64,
    pub premium: f64,
    pub term_years: u8,
    pub product_type: ProductType,
}

impl Policy {
    /// Serialize into the 32-byte wire form.
    pub fn encode_into(&self, out: &mut [u8; POLICY_RECORD_BYTES]) {
        out.fill(0);
        out[0..4].copy_from_slice(&self.policy_id.to_le_bytes());
        out[4] = self.age;
        out[5] = self.gender.tag();
        out[8..16].copy_from_slice(&self.sum_assured.to_le_bytes());
        out[16..24].copy_from_slice(&self.premium.to_le_bytes());
        out[24] = self.term_years;
        out[25] = self.product_type.tag();
    }

    pub fn encode(&self) -> [u8; POLICY_RECORD_BYTES] {
        let mut out = [0u8; POLICY_RECORD_BYTES];
        self.encode_into(&mut out);
        out
    }

    /// Decode from a 32-byte wire record.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != POLICY_RECORD_BYTES {
            return Err(CodecError::WrongLength {
                expected: POLICY_RECORD_BYTES,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            policy_id: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            age: bytes[4],
            gender: Gender::from_tag(bytes[5])?,
            sum_assured: f64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            premium: f64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            term_years: bytes[24],
            product_type: ProductType::from_tag(bytes[25])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Policy {
        Policy {
            policy_id: 1001,
            age: 42,
            gender: Gender::Female,
            sum_assured: 250_000.0,
            premium: 1_200.50,
            term_years: 20,
            product_type: ProductType::Endowment,
        }
    }

    #[test]
    fn codec_roundtrip_preserves_every_field() {
        let p = sample();
        let bytes = p.encode();
        assert_eq!(Policy::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn wire_layout_is_stable() {
        let bytes = sample().encode();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 1001);
        assert_eq!(bytes[4], 42);
        assert_eq!(bytes[5], 1); // female
        assert_eq!(&bytes[6..8], &[0, 0]);
        assert_eq!(
            f64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            250_000.0
        );
        assert_eq!(bytes[24], 20);
        assert_eq!(bytes[25], 2); // endowment
        assert_eq!(&bytes[26..32], &[0; 6]);
    }

    #[test]
    fn bad_tags_are_rejected() {
        let mut bytes = sample().encode();
        bytes[5] = 9;
        assert!(matches!(
            Policy::decode(&bytes),
            Err(CodecError::BadGender { tag: 9 })
        ));
        bytes[5] = 0;
        bytes[25] = 7;
        assert!(matches!(
            Policy::decode(&bytes),
            Err(CodecError::BadProduct { tag: 7 })
        ));
    }

    #[test]
    fn short_record_is_rejected() {
        assert!(matches!(
            Policy::decode(&[0u8; 16]),
            Err(CodecError::WrongLength { actual: 16, .. })
        ));
    }

    #[test]
    fn enum_tags_are_stable() {
        assert_eq!(Gender::Male.tag(), 0);
        assert_eq!(Gender::Female.tag(), 1);
        assert_eq!(ProductType::Term.tag(), 0);
        assert_eq!(ProductType::WholeLife.tag(), 1);
        assert_eq!(ProductType::Endowment.tag(), 2);
    }
}
