//! Double-SHA256, used for message checksums and block/transaction hashing.

use sha2::{Digest, Sha256};

/// The first four bytes of `SHA256(SHA256(payload))`, used as a message
/// envelope checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum(pub [u8; 4]);

impl<'a> From<&'a [u8]> for Checksum {
    fn from(bytes: &'a [u8]) -> Self {
        let hash = double_sha256(bytes);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash[0..4]);
        Checksum(checksum)
    }
}

/// Compute `SHA256(SHA256(data))`.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// An incremental double-SHA256 writer, for hashing a serialized value
/// without first materializing it into a `Vec<u8>`.
#[derive(Default)]
pub struct Writer(Vec<u8>);

impl Writer {
    /// The double-SHA256 digest of everything written so far, in natural
    /// (non-reversed) byte order.
    pub fn finish(self) -> [u8; 32] {
        double_sha256(&self.0)
    }
}

impl std::io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_first_four_bytes_of_double_sha256() {
        let payload = b"hello world";
        let full = double_sha256(payload);
        let checksum = Checksum::from(&payload[..]);
        assert_eq!(&checksum.0[..], &full[0..4]);
    }
}
