//! CRC combination over GF(2)
//!
//! For any parameter set, with `R(m)` the MSB-first register after feeding
//! message `m` and `I` the initial register:
//!
//! ```text
//! R(a || b) = x^(8·len(b)) · (R(a) + I) + R(b)   (mod P)
//! ```
//!
//! Reflected checksums are mapped into the MSB-first domain, combined, and
//! mapped back. `x^(8n) mod P` is computed by square-and-multiply, so the cost
//! is logarithmic in the length of the second block.

use crate::params::{reflect, CrcParams};

impl CrcParams {
    /// Checksum of `a || b` given `crc(a)`, `crc(b)` and `len(b)` in bytes
    pub fn combine(&self, crc_a: u64, crc_b: u64, len_b: u64) -> u64 {
        let mask = self.mask();
        if len_b == 0 {
            return crc_a & mask;
        }

        let reg_a = self.to_register(crc_a);
        let reg_b = self.to_register(crc_b);
        let shifted = self.mul_mod(reg_a ^ self.init(), self.x_pow_8n(len_b));

        self.from_register(shifted ^ reg_b)
    }

    /// Fold a sequence of `(crc, len)` blocks, in order, into one checksum
    ///
    /// An empty sequence yields the checksum of the empty message.
    pub fn combine_all<I>(&self, blocks: I) -> u64
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        blocks
            .into_iter()
            .fold(self.checksum(&[]), |acc, (crc, len)| {
                self.combine(acc, crc, len)
            })
    }

    fn to_register(&self, crc: u64) -> u64 {
        let raw = (crc ^ self.xor_out()) & self.mask();
        if self.reflected() {
            reflect(raw, self.width())
        } else {
            raw
        }
    }

    fn from_register(&self, register: u64) -> u64 {
        let out = if self.reflected() {
            reflect(register, self.width())
        } else {
            register
        };
        (out ^ self.xor_out()) & self.mask()
    }

    fn times_x(&self, value: u64) -> u64 {
        let top = 1u64 << (self.width() - 1);
        let shifted = (value << 1) & self.mask();
        if value & top != 0 {
            shifted ^ self.poly()
        } else {
            shifted
        }
    }

    /// `a · b mod P`, Horner over the bits of `a` from the top
    fn mul_mod(&self, a: u64, b: u64) -> u64 {
        let mut product = 0u64;
        for bit in (0..self.width()).rev() {
            product = self.times_x(product);
            if (a >> bit) & 1 == 1 {
                product ^= b;
            }
        }
        product
    }

    /// `x^(8n) mod P`
    fn x_pow_8n(&self, n: u64) -> u64 {
        let mut base = (0..8).fold(1u64, |acc, _| self.times_x(acc));
        let mut result = 1u64;
        let mut n = n;
        while n > 0 {
            if n & 1 == 1 {
                result = self.mul_mod(result, base);
            }
            base = self.mul_mod(base, base);
            n >>= 1;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const ALL: [CrcParams; 4] = [
        CrcParams::CRC64_XZ,
        CrcParams::CRC64_WE,
        CrcParams::CRC32_ISO_HDLC,
        CrcParams::CRC32_BZIP2,
    ];

    #[test]
    fn test_combine_check_string_every_split() {
        let data = b"123456789";
        for params in ALL {
            let whole = params.checksum(data);
            for split in 0..=data.len() {
                let (a, b) = data.split_at(split);
                let combined =
                    params.combine(params.checksum(a), params.checksum(b), b.len() as u64);
                assert_eq!(combined, whole, "{params:?} split at {split}");
            }
        }
    }

    #[test]
    fn test_combine_random_blocks() {
        let mut rng = rand::rng();
        for params in ALL {
            for _ in 0..20 {
                let len_a = rng.random_range(0..2048);
                let len_b = rng.random_range(1..4096);
                let a: Vec<u8> = (0..len_a).map(|_| rng.random()).collect();
                let b: Vec<u8> = (0..len_b).map(|_| rng.random()).collect();

                let mut whole = a.clone();
                whole.extend_from_slice(&b);

                let combined =
                    params.combine(params.checksum(&a), params.checksum(&b), len_b as u64);
                assert_eq!(combined, params.checksum(&whole));
            }
        }
    }

    #[test]
    fn test_combine_with_empty_second_block() {
        let params = CrcParams::CRC64_XZ;
        let crc = params.checksum(b"abc");
        assert_eq!(params.combine(crc, params.checksum(&[]), 0), crc);
    }

    #[test]
    fn test_combine_all_matches_whole() {
        let mut rng = rand::rng();
        let data: Vec<u8> = (0..5130).map(|_| rng.random()).collect();
        let params = CrcParams::CRC64_XZ;

        let blocks = data
            .chunks(500)
            .map(|chunk| (params.checksum(chunk), chunk.len() as u64));

        assert_eq!(params.combine_all(blocks), params.checksum(&data));
    }

    #[test]
    fn test_combine_all_empty() {
        let params = CrcParams::CRC32_ISO_HDLC;
        assert_eq!(params.combine_all(std::iter::empty()), 0);
    }

    #[test]
    fn test_custom_width_combine() {
        // CRC-16/XMODEM and CRC-8/SMBUS
        let crc16 = CrcParams::new(16, 0x1021, 0, false, 0).unwrap();
        let crc8 = CrcParams::new(8, 0x07, 0, false, 0).unwrap();
        let data = b"hello, multipart world";
        for params in [crc16, crc8] {
            let (a, b) = data.split_at(7);
            assert_eq!(
                params.combine(params.checksum(a), params.checksum(b), b.len() as u64),
                params.checksum(data)
            );
        }
    }
}
