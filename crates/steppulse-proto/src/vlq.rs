//! Variable-length encoding of 32-bit command words.
//!
//! The MCU wire form packs each word seven bits per byte, most significant
//! group first, with the high bit of every byte except the last set as a
//! continuation marker. Values are treated as signed for sizing, so small
//! negative quantities (a negative `add`, for example) encode in one byte.

use crate::Error;
use bytes::{BufMut, Bytes, BytesMut};

/// Append one word to `dst` in variable-length form.
pub fn put_word(dst: &mut BytesMut, v: u32) {
    let sv = v as i32;
    if !(-(1 << 26)..3 << 26).contains(&sv) {
        dst.put_u8(((v >> 28) & 0x7f) as u8 | 0x80);
    }
    if !(-(1 << 19)..3 << 19).contains(&sv) {
        dst.put_u8(((v >> 21) & 0x7f) as u8 | 0x80);
    }
    if !(-(1 << 12)..3 << 12).contains(&sv) {
        dst.put_u8(((v >> 14) & 0x7f) as u8 | 0x80);
    }
    if !(-(1 << 5)..3 << 5).contains(&sv) {
        dst.put_u8(((v >> 7) & 0x7f) as u8 | 0x80);
    }
    dst.put_u8((v & 0x7f) as u8);
}

/// Pull one word off the front of `src`.
///
/// The sign of the value is folded into the first byte: a leading byte with
/// bits 5 and 6 both set marks a negative value.
pub fn get_word(src: &mut &[u8]) -> Result<u32, Error> {
    let (&first, rest) = src.split_first().ok_or(Error::Truncated)?;
    *src = rest;
    let mut c = first;
    let mut v = (c & 0x7f) as u32;
    if c & 0x60 == 0x60 {
        v |= 0xffff_ffe0;
    }
    while c & 0x80 != 0 {
        let (&next, rest) = src.split_first().ok_or(Error::Truncated)?;
        *src = rest;
        c = next;
        v = (v << 7) | (c & 0x7f) as u32;
    }
    Ok(v)
}

/// Encode a command-word tuple into its opaque payload form.
pub fn encode_words(words: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(words.len() * 5);
    for &w in words {
        put_word(&mut buf, w);
    }
    buf.freeze()
}

/// Decode an entire payload back into command words.
pub fn decode_words(payload: &[u8]) -> Result<Vec<u32>, Error> {
    let mut src = payload;
    let mut words = Vec::new();
    while !src.is_empty() {
        words.push(get_word(&mut src)?);
    }
    Ok(words)
}
