//! ossx Core CRC: checksum arithmetic for multipart transfers
//!
//! # Overview
//!
//! Object storage services that expose a CRC64 of every object let a client
//! verify a multipart transfer end to end without re-reading the data. Each
//! part is hashed while it streams, and the per-part values are merged into
//! the checksum of the whole object using CRC linearity.
//!
//! This crate provides:
//!
//! - **[`Crc64`]**: table-driven streaming CRC-64/ECMA (the `CRC-64/XZ`
//!   parameter set used by object stores for `x-*-hash-crc64ecma`)
//! - **[`CrcParams`]**: a generic bitwise CRC engine for any width from 8 to 64
//!   bits, in both the reflected and the non-reflected bit order
//! - **[`CrcParams::combine`]**: `crc(a || b)` from `crc(a)`, `crc(b)` and
//!   `len(b)` over GF(2), without touching the data
//!
//! # Key Principles
//!
//! Pure functions only. No I/O, no allocation on the hot path.
//!
//! # Example
//!
//! ```
//! use ossx_core_crc::{Crc64, CrcParams};
//!
//! let a = b"12345";
//! let b = b"67890";
//!
//! let crc_a = Crc64::checksum(a);
//! let crc_b = Crc64::checksum(b);
//!
//! let combined = CrcParams::CRC64_XZ.combine(crc_a, crc_b, b.len() as u64);
//! assert_eq!(combined, Crc64::checksum(b"1234567890"));
//! ```

mod combine;
mod crc64;
mod params;

pub use crc64::{crc64_combine, Crc64};
pub use params::{CrcError, CrcParams};
