//! # Steppulse MCU Protocol
//!
//! Encoding of host command words into the compact byte form understood by
//! the microcontroller, plus the message-block framing used by frame-level
//! transports.
//!
//! ## Key Components
//!
//! - **[`vlq`]**: Variable-length encoding of 32-bit command words. Each
//!   word is emitted most-significant group first, seven bits per byte,
//!   with sign folding so small negative values stay short.
//! - **[`frame`]**: Message-block assembly and validation — length byte,
//!   sequence byte, payload, CRC-16-CCITT, sync byte.
//! - **[`crc`]**: A `const fn` implementation of the CRC-16-CCITT algorithm
//!   used for message integrity.
//!
//! The compression core only deals in encoded payloads; framing is applied
//! by whichever transport ultimately owns the wire.

pub mod crc;
pub mod frame;
pub mod vlq;

pub use crc::crc16_ccitt;
pub use frame::{build_frame, check_frame, MESSAGE_MAX, MESSAGE_SYNC};
pub use vlq::{decode_words, encode_words};

use thiserror::Error;

/// Common error type for the protocol crate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// An encoded integer ran past the end of its payload.
    #[error("encoded integer runs past the end of the payload")]
    Truncated,
    /// The payload does not fit in a single message block.
    #[error("payload of {0} bytes does not fit in a message block")]
    PayloadTooLarge(usize),
    /// A message block had a bad length, sequence, or sync byte.
    #[error("message block framing is invalid")]
    InvalidFrame,
    /// The CRC-16 checksum of a message block did not match.
    #[error("message block crc mismatch (expected {expected:#06x}, got {found:#06x})")]
    CrcMismatch { expected: u16, found: u16 },
}
