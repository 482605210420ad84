//! Table-driven CRC-64/ECMA (XZ parameters)

use crate::params::CrcParams;

/// Reflected form of the ECMA-182 polynomial 0x42F0E1EBA9EA3693
const POLY_REFLECTED: u64 = 0xC96C_5795_D787_0F42;

static TABLE: [u64; 256] = build_table();

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Streaming CRC-64/ECMA hasher
///
/// Matches the `crc64ecma` value object stores attach to objects and parts.
///
/// # Example
///
/// ```
/// use ossx_core_crc::Crc64;
///
/// let mut hasher = Crc64::new();
/// hasher.update(b"12345");
/// hasher.update(b"6789");
/// assert_eq!(hasher.finish(), 0x995D_C9BB_DF19_39FA);
/// assert_eq!(hasher.len(), 9);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Crc64 {
    register: u64,
    len: u64,
}

impl Crc64 {
    pub fn new() -> Self {
        Self {
            register: u64::MAX,
            len: 0,
        }
    }

    /// One-shot checksum
    pub fn checksum(data: &[u8]) -> u64 {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finish()
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut reg = self.register;
        for &byte in data {
            reg = TABLE[((reg ^ u64::from(byte)) & 0xFF) as usize] ^ (reg >> 8);
        }
        self.register = reg;
        self.len += data.len() as u64;
    }

    /// Current checksum; the hasher can keep accepting data afterwards
    pub fn finish(&self) -> u64 {
        self.register ^ u64::MAX
    }

    /// Bytes fed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorthand for [`CrcParams::combine`] with CRC-64/ECMA parameters
pub fn crc64_combine(crc_a: u64, crc_b: u64, len_b: u64) -> u64 {
    CrcParams::CRC64_XZ.combine(crc_a, crc_b, len_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_check_value() {
        assert_eq!(Crc64::checksum(b"123456789"), 0x995D_C9BB_DF19_39FA);
    }

    #[test]
    fn test_empty() {
        let hasher = Crc64::new();
        assert!(hasher.is_empty());
        assert_eq!(hasher.finish(), 0);
    }

    #[test]
    fn test_table_matches_bitwise_engine() {
        let mut rng = rand::rng();
        for _ in 0..16 {
            let len = rng.random_range(0..1024);
            let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            assert_eq!(Crc64::checksum(&data), CrcParams::CRC64_XZ.checksum(&data));
        }
    }

    #[test]
    fn test_crc64_combine() {
        let whole = Crc64::checksum(b"hello world");
        let a = Crc64::checksum(b"hello ");
        let b = Crc64::checksum(b"world");
        assert_eq!(crc64_combine(a, b, 5), whole);
    }
}
