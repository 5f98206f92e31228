//! Bitcoin's variable-length integer ("CompactSize") encoding.
//!
//! First byte < 0xFD encodes that value directly; 0xFD/0xFE/0xFF prefix a
//! 2/4/8-byte little-endian value respectively. Canonical encoding (the
//! shortest form for a given value) is required on output; we do not
//! enforce it on input, matching spec §4.1.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A Bitcoin variable-length integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompactInt(u64);

impl CompactInt {
    /// The zero-valued `CompactInt`.
    pub fn new() -> CompactInt {
        CompactInt(0)
    }

    /// Build a `CompactInt` from a `usize` length.
    pub fn from(value: usize) -> CompactInt {
        CompactInt(value as u64)
    }

    /// The decoded value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The number of bytes a `CompactInt` encoding `value` would occupy.
    pub fn size(value: usize) -> usize {
        if value < 0xFD {
            1
        } else if value <= u16::MAX as usize {
            3
        } else if value <= u32::MAX as usize {
            5
        } else {
            9
        }
    }
}

impl Default for CompactInt {
    fn default() -> Self {
        CompactInt::new()
    }
}

impl From<u64> for CompactInt {
    fn from(value: u64) -> Self {
        CompactInt(value)
    }
}

impl BitcoinSerialize for CompactInt {
    fn bitcoin_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        if self.0 < 0xFD {
            target.write_all(&[self.0 as u8])
        } else if self.0 <= u16::MAX as u64 {
            target.write_all(&[0xFD])?;
            target.write_u16::<LittleEndian>(self.0 as u16)
        } else if self.0 <= u32::MAX as u64 {
            target.write_all(&[0xFE])?;
            target.write_u32::<LittleEndian>(self.0 as u32)
        } else {
            target.write_all(&[0xFF])?;
            target.write_u64::<LittleEndian>(self.0)
        }
    }
}

impl BitcoinDeserialize for CompactInt {
    fn bitcoin_deserialize<R: std::io::Read>(
        mut reader: R,
    ) -> Result<CompactInt, SerializationError> {
        let first = reader.read_u8()?;
        Ok(match first {
            0xFD => CompactInt(reader.read_u16::<LittleEndian>()? as u64),
            0xFE => CompactInt(reader.read_u32::<LittleEndian>()? as u64),
            0xFF => CompactInt(reader.read_u64::<LittleEndian>()?),
            n => CompactInt(n as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::BitcoinDeserializeInto;

    #[test]
    fn round_trip_boundaries() {
        for value in [0u64, 1, 252, 253, 0xFFFF, 0x1_0000, u32::MAX as u64, u32::MAX as u64 + 1] {
            let bytes = CompactInt::from(value as usize).bitcoin_serialize_to_vec().unwrap();
            let decoded: CompactInt = bytes.as_slice().bitcoin_deserialize_into().unwrap();
            assert_eq!(decoded.value(), value);
        }
    }

    #[test]
    fn size_matches_encoded_length() {
        for value in [0usize, 252, 253, 0xFFFF, 0x1_0000, u32::MAX as usize] {
            let bytes = CompactInt::from(value).bitcoin_serialize_to_vec().unwrap();
            assert_eq!(bytes.len(), CompactInt::size(value));
        }
    }
}
