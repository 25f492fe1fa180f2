//! Message-block framing.
//!
//! A block on the wire is `len, seq, payload.., crc_hi, crc_lo, sync` where
//! `len` counts the whole block, `seq` carries a 4-bit sequence number in
//! its low nibble with the destination bits 0x10 in the high nibble, and
//! the CRC-16-CCITT covers everything before itself.

use crate::crc::crc16_ccitt;
use crate::Error;
use bytes::{BufMut, Bytes, BytesMut};

/// Largest block the MCU will accept.
pub const MESSAGE_MAX: usize = 64;
/// Trailing byte marking the end of every block.
pub const MESSAGE_SYNC: u8 = 0x7e;

const MESSAGE_HEADER_SIZE: usize = 2;
const MESSAGE_TRAILER_SIZE: usize = 3;
const MESSAGE_MIN: usize = MESSAGE_HEADER_SIZE + MESSAGE_TRAILER_SIZE;
const MESSAGE_DEST: u8 = 0x10;
const MESSAGE_SEQ_MASK: u8 = 0x0f;

/// Wrap an encoded payload in a message block.
pub fn build_frame(seq: u8, payload: &[u8]) -> Result<Bytes, Error> {
    let len = MESSAGE_MIN + payload.len();
    if len > MESSAGE_MAX {
        return Err(Error::PayloadTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u8(len as u8);
    buf.put_u8(MESSAGE_DEST | (seq & MESSAGE_SEQ_MASK));
    buf.put_slice(payload);
    let crc = crc16_ccitt(&buf);
    buf.put_u16(crc);
    buf.put_u8(MESSAGE_SYNC);
    Ok(buf.freeze())
}

/// Validate a message block and return its payload slice.
pub fn check_frame(block: &[u8]) -> Result<&[u8], Error> {
    if block.len() < MESSAGE_MIN || block.len() > MESSAGE_MAX {
        return Err(Error::InvalidFrame);
    }
    let len = block[0] as usize;
    if len != block.len()
        || (block[1] & !MESSAGE_SEQ_MASK) != MESSAGE_DEST
        || block[len - 1] != MESSAGE_SYNC
    {
        return Err(Error::InvalidFrame);
    }
    let expected = crc16_ccitt(&block[..len - MESSAGE_TRAILER_SIZE]);
    let found = u16::from_be_bytes([block[len - 3], block[len - 2]]);
    if expected != found {
        return Err(Error::CrcMismatch { expected, found });
    }
    Ok(&block[MESSAGE_HEADER_SIZE..len - MESSAGE_TRAILER_SIZE])
}
