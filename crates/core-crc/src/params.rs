//! Generic bitwise CRC engine described by Rocksoft-style parameters.

use thiserror::Error;

/// Errors raised when building a custom parameter set
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrcError {
    #[error("CRC width must be between 8 and 64 bits, got {0}")]
    UnsupportedWidth(u32),

    #[error("{field} 0x{value:x} does not fit in {width} bits")]
    ValueTooWide {
        field: &'static str,
        value: u64,
        width: u32,
    },
}

/// A CRC parameter set
///
/// `poly`, `init` and `xor_out` are given in normal (MSB-first) form, without
/// the implicit top bit of the polynomial. `reflected` covers both input and
/// output reflection; the object-storage checksums this crate cares about
/// never reflect one without the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcParams {
    width: u32,
    poly: u64,
    init: u64,
    reflected: bool,
    xor_out: u64,
}

impl CrcParams {
    /// CRC-64/XZ, also published as CRC-64/GO-ECMA. This is what object
    /// stores report as `crc64ecma`.
    pub const CRC64_XZ: CrcParams = CrcParams {
        width: 64,
        poly: 0x42F0_E1EB_A9EA_3693,
        init: u64::MAX,
        reflected: true,
        xor_out: u64::MAX,
    };

    /// CRC-64/WE: same polynomial as [`Self::CRC64_XZ`], MSB-first.
    pub const CRC64_WE: CrcParams = CrcParams {
        width: 64,
        poly: 0x42F0_E1EB_A9EA_3693,
        init: u64::MAX,
        reflected: false,
        xor_out: u64::MAX,
    };

    /// CRC-32/ISO-HDLC (zlib, PNG, Ethernet)
    pub const CRC32_ISO_HDLC: CrcParams = CrcParams {
        width: 32,
        poly: 0x04C1_1DB7,
        init: 0xFFFF_FFFF,
        reflected: true,
        xor_out: 0xFFFF_FFFF,
    };

    /// CRC-32/BZIP2
    pub const CRC32_BZIP2: CrcParams = CrcParams {
        width: 32,
        poly: 0x04C1_1DB7,
        init: 0xFFFF_FFFF,
        reflected: false,
        xor_out: 0xFFFF_FFFF,
    };

    /// Build a custom parameter set
    pub fn new(
        width: u32,
        poly: u64,
        init: u64,
        reflected: bool,
        xor_out: u64,
    ) -> Result<Self, CrcError> {
        if !(8..=64).contains(&width) {
            return Err(CrcError::UnsupportedWidth(width));
        }
        let mask = width_mask(width);
        for (field, value) in [("poly", poly), ("init", init), ("xor_out", xor_out)] {
            if value & !mask != 0 {
                return Err(CrcError::ValueTooWide {
                    field,
                    value,
                    width,
                });
            }
        }
        Ok(Self {
            width,
            poly,
            init,
            reflected,
            xor_out,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn poly(&self) -> u64 {
        self.poly
    }

    pub fn init(&self) -> u64 {
        self.init
    }

    pub fn reflected(&self) -> bool {
        self.reflected
    }

    pub fn xor_out(&self) -> u64 {
        self.xor_out
    }

    pub(crate) fn mask(&self) -> u64 {
        width_mask(self.width)
    }

    /// Checksum of a complete message
    pub fn checksum(&self, data: &[u8]) -> u64 {
        self.finish(self.update(self.initial_register(), data))
    }

    /// Register value before any data has been fed
    pub fn initial_register(&self) -> u64 {
        if self.reflected {
            reflect(self.init, self.width)
        } else {
            self.init
        }
    }

    /// Feed `data` into a running register
    pub fn update(&self, register: u64, data: &[u8]) -> u64 {
        let mask = self.mask();
        let mut reg = register & mask;

        if self.reflected {
            let poly = reflect(self.poly, self.width);
            for &byte in data {
                reg ^= u64::from(byte);
                for _ in 0..8 {
                    reg = if reg & 1 != 0 {
                        (reg >> 1) ^ poly
                    } else {
                        reg >> 1
                    };
                }
            }
        } else {
            let top = 1u64 << (self.width - 1);
            for &byte in data {
                reg ^= u64::from(byte) << (self.width - 8);
                for _ in 0..8 {
                    reg = if reg & top != 0 {
                        (reg << 1) ^ self.poly
                    } else {
                        reg << 1
                    } & mask;
                }
            }
        }

        reg
    }

    /// Turn a running register into the published checksum
    pub fn finish(&self, register: u64) -> u64 {
        (register ^ self.xor_out) & self.mask()
    }
}

pub(crate) fn width_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Reverse the low `width` bits of `value`
pub(crate) fn reflect(value: u64, width: u32) -> u64 {
    value.reverse_bits() >> (64 - width)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: &[u8] = b"123456789";

    #[test]
    fn test_standard_check_values() {
        assert_eq!(CrcParams::CRC32_ISO_HDLC.checksum(CHECK), 0xCBF4_3926);
        assert_eq!(CrcParams::CRC32_BZIP2.checksum(CHECK), 0xFC89_1918);
        assert_eq!(CrcParams::CRC64_WE.checksum(CHECK), 0x62EC_59E3_F1A4_F00A);
        assert_eq!(CrcParams::CRC64_XZ.checksum(CHECK), 0x995D_C9BB_DF19_39FA);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(CrcParams::CRC64_XZ.checksum(&[]), 0);
        assert_eq!(CrcParams::CRC32_ISO_HDLC.checksum(&[]), 0);
    }

    #[test]
    fn test_incremental_update_matches_one_shot() {
        let params = CrcParams::CRC64_WE;
        let mut reg = params.initial_register();
        for chunk in CHECK.chunks(2) {
            reg = params.update(reg, chunk);
        }
        assert_eq!(params.finish(reg), params.checksum(CHECK));
    }

    #[test]
    fn test_new_rejects_bad_width() {
        assert_eq!(
            CrcParams::new(4, 0x3, 0, false, 0),
            Err(CrcError::UnsupportedWidth(4))
        );
        assert_eq!(
            CrcParams::new(65, 0x3, 0, false, 0),
            Err(CrcError::UnsupportedWidth(65))
        );
    }

    #[test]
    fn test_new_rejects_wide_values() {
        let err = CrcParams::new(16, 0x1_1021, 0, false, 0).unwrap_err();
        assert!(matches!(err, CrcError::ValueTooWide { field: "poly", .. }));
    }

    #[test]
    fn test_custom_crc16_xmodem() {
        // CRC-16/XMODEM check value
        let params = CrcParams::new(16, 0x1021, 0, false, 0).unwrap();
        assert_eq!(params.checksum(CHECK), 0x31C3);
    }

    #[test]
    fn test_reflect() {
        assert_eq!(reflect(0b0000_0001, 8), 0b1000_0000);
        assert_eq!(reflect(0x42F0_E1EB_A9EA_3693, 64), 0xC96C_5795_D787_0F42);
    }
}
