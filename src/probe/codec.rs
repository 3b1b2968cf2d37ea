//! Bounds-checked wire primitives shared by every adapter.
//!
//! Decoding goes through [`Reader`], a cursor over a borrowed buffer. Every
//! accessor checks the remaining length first and returns
//! [`CodecError::Short`] instead of indexing past the end. Encoding uses
//! `bytes::BufMut` helpers so builders stay allocation-friendly.

use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};

use crate::probe::error::CodecError;

/// Upper bound accepted for any length field before allocating.
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! fixed_int {
    ($name:ident, $ty:ty, $conv:ident) => {
        pub fn $name(&mut self) -> Result<$ty, CodecError> {
            const N: usize = std::mem::size_of::<$ty>();
            let bytes = self.take(N)?;
            let mut arr = [0u8; N];
            arr.copy_from_slice(bytes);
            Ok(<$ty>::$conv(arr))
        }
    };
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unconsumed bytes, without advancing.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::Short {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.take(n).map(|_| ())
    }

    pub fn peek_u8(&self) -> Result<u8, CodecError> {
        self.buf.get(self.pos).copied().ok_or(CodecError::Short {
            offset: self.pos,
            needed: 1,
            available: 0,
        })
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.u8()? as i8)
    }

    fixed_int!(u16_be, u16, from_be_bytes);
    fixed_int!(u16_le, u16, from_le_bytes);
    fixed_int!(i16_be, i16, from_be_bytes);
    fixed_int!(i16_le, i16, from_le_bytes);
    fixed_int!(u32_be, u32, from_be_bytes);
    fixed_int!(u32_le, u32, from_le_bytes);
    fixed_int!(i32_be, i32, from_be_bytes);
    fixed_int!(i32_le, i32, from_le_bytes);
    fixed_int!(u64_be, u64, from_be_bytes);
    fixed_int!(u64_le, u64, from_le_bytes);
    fixed_int!(i64_be, i64, from_be_bytes);
    fixed_int!(i64_le, i64, from_le_bytes);

    /// Three-byte little-endian integer (MySQL packet lengths).
    pub fn u24_le(&mut self) -> Result<u32, CodecError> {
        let b = self.take(3)?;
        Ok(u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16))
    }

    /// NUL-terminated string. The terminator is consumed but not returned.
    pub fn cstr(&mut self) -> Result<String, CodecError> {
        let rest = self.rest();
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodecError::Malformed("missing NUL terminator"))?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }

    pub fn u8_prefixed(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    pub fn u16_be_prefixed(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u16_be()? as usize;
        self.take(len)
    }

    pub fn u32_be_prefixed(&mut self) -> Result<&'a [u8], CodecError> {
        let len = checked_len(self.u32_be()? as usize)?;
        self.take(len)
    }

    pub fn u8_prefixed_str(&mut self) -> Result<String, CodecError> {
        Ok(String::from_utf8_lossy(self.u8_prefixed()?).into_owned())
    }

    pub fn u16_be_prefixed_str(&mut self) -> Result<String, CodecError> {
        Ok(String::from_utf8_lossy(self.u16_be_prefixed()?).into_owned())
    }

    pub fn u32_be_prefixed_str(&mut self) -> Result<String, CodecError> {
        Ok(String::from_utf8_lossy(self.u32_be_prefixed()?).into_owned())
    }

    /// LEB128 / protobuf / Minecraft VarInt, at most 5 bytes.
    pub fn varint_u32(&mut self) -> Result<u32, CodecError> {
        let mut value: u32 = 0;
        for i in 0..5 {
            let byte = self.u8()?;
            value |= u32::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::Malformed("varint longer than 5 bytes"))
    }

    /// LEB128, at most 10 bytes.
    pub fn varint_u64(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        for i in 0..10 {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::Malformed("varint longer than 10 bytes"))
    }

    /// Bitcoin CompactSize.
    pub fn compact_size(&mut self) -> Result<u64, CodecError> {
        match self.u8()? {
            0xfd => Ok(u64::from(self.u16_le()?)),
            0xfe => Ok(u64::from(self.u32_le()?)),
            0xff => self.u64_le(),
            n => Ok(u64::from(n)),
        }
    }

    pub fn xdr_u32(&mut self) -> Result<u32, CodecError> {
        self.u32_be()
    }

    pub fn xdr_bool(&mut self) -> Result<bool, CodecError> {
        match self.u32_be()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::Malformed("XDR boolean out of range")),
        }
    }

    /// Variable-length XDR opaque: u32 length, data, zero padding to 4 bytes.
    pub fn xdr_opaque(&mut self) -> Result<&'a [u8], CodecError> {
        let len = checked_len(self.u32_be()? as usize)?;
        let data = self.take(len)?;
        self.skip(xdr_pad(len))?;
        Ok(data)
    }

    pub fn xdr_string(&mut self) -> Result<String, CodecError> {
        Ok(String::from_utf8_lossy(self.xdr_opaque()?).into_owned())
    }
}

fn checked_len(len: usize) -> Result<usize, CodecError> {
    if len > MAX_FIELD_LEN {
        Err(CodecError::Malformed("length field exceeds sanity limit"))
    } else {
        Ok(len)
    }
}

/// Padding needed to bring `len` up to a multiple of four.
pub fn xdr_pad(len: usize) -> usize {
    (4 - len % 4) % 4
}

pub fn put_varint(dst: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Encodes a signed 32-bit VarInt the way Minecraft does (two's complement, 5 bytes for negatives).
pub fn put_varint_i32(dst: &mut BytesMut, value: i32) {
    put_varint(dst, u64::from(value as u32));
}

pub fn put_compact_size(dst: &mut BytesMut, value: u64) {
    match value {
        0..=0xfc => dst.put_u8(value as u8),
        0xfd..=0xffff => {
            dst.put_u8(0xfd);
            dst.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            dst.put_u8(0xfe);
            dst.put_u32_le(value as u32);
        }
        _ => {
            dst.put_u8(0xff);
            dst.put_u64_le(value);
        }
    }
}

pub fn put_cstr(dst: &mut BytesMut, s: &str) {
    dst.extend_from_slice(s.as_bytes());
    dst.put_u8(0);
}

/// Writes `s` into a fixed-width field, NUL padded. Longer input is truncated.
pub fn put_padded_ascii(dst: &mut BytesMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    dst.extend_from_slice(&bytes[..n]);
    dst.put_bytes(0, width - n);
}

pub fn put_xdr_opaque(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u32(data.len() as u32);
    dst.extend_from_slice(data);
    dst.put_bytes(0, xdr_pad(data.len()));
}

pub fn put_xdr_string(dst: &mut BytesMut, s: &str) {
    put_xdr_opaque(dst, s.as_bytes());
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// First four bytes of the double SHA-256 of `payload`.
pub fn checksum4(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

/// True when every byte is printable ASCII or common whitespace.
pub fn is_text(bytes: &[u8]) -> bool {
    !bytes.is_empty()
        && bytes
            .iter()
            .all(|&b| b == b'\r' || b == b'\n' || b == b'\t' || (0x20..0x7f).contains(&b))
}

/// Strips a trailing CRLF or LF.
pub fn trim_line(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_rejects_reads_past_end() {
        let mut r = Reader::new(&[0x01, 0x02, 0x03]);
        assert_eq!(r.u16_be().unwrap(), 0x0102);
        let err = r.u32_le().unwrap_err();
        assert_eq!(
            err,
            CodecError::Short {
                offset: 2,
                needed: 4,
                available: 1
            }
        );
        // A failed read does not advance the cursor.
        assert_eq!(r.u8().unwrap(), 0x03);
        assert!(r.is_empty());
    }

    #[test]
    fn test_cstr_requires_terminator() {
        let mut r = Reader::new(b"8.0.36\0rest");
        assert_eq!(r.cstr().unwrap(), "8.0.36");
        assert_eq!(r.rest(), b"rest");
        assert!(Reader::new(b"no terminator").cstr().is_err());
    }

    #[test]
    fn test_varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 25565, u64::from(u32::MAX)] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            let mut r = Reader::new(&buf);
            assert_eq!(r.varint_u64().unwrap(), value);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn test_negative_minecraft_varint_is_five_bytes() {
        let mut buf = BytesMut::new();
        put_varint_i32(&mut buf, -1);
        assert_eq!(&buf[..], &[0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert_eq!(Reader::new(&buf).varint_u32().unwrap() as i32, -1);
    }

    #[test]
    fn test_overlong_varint_is_malformed() {
        let bytes = [0x80u8; 6];
        assert!(matches!(
            Reader::new(&bytes).varint_u32(),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_compact_size_boundaries() {
        for value in [0xfcu64, 0xfd, 0xffff, 0x1_0000, 0x1_0000_0000] {
            let mut buf = BytesMut::new();
            put_compact_size(&mut buf, value);
            assert_eq!(Reader::new(&buf).compact_size().unwrap(), value);
        }
    }

    #[test]
    fn test_xdr_opaque_padding() {
        let mut buf = BytesMut::new();
        put_xdr_opaque(&mut buf, b"tcp");
        put_xdr_string(&mut buf, "nfs4");
        assert_eq!(buf.len(), 4 + 4 + 4 + 4);
        let mut r = Reader::new(&buf);
        assert_eq!(r.xdr_opaque().unwrap(), b"tcp");
        assert_eq!(r.xdr_string().unwrap(), "nfs4");
        assert!(r.is_empty());
    }

    #[test]
    fn test_xdr_opaque_rejects_huge_length() {
        let bytes = [0xff, 0xff, 0xff, 0xff, 0x00];
        assert!(Reader::new(&bytes).xdr_opaque().is_err());
    }

    #[test]
    fn test_checksum4_matches_known_vector() {
        // Checksum of an empty payload, as seen in every verack header.
        assert_eq!(checksum4(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_padded_ascii() {
        let mut buf = BytesMut::new();
        put_padded_ascii(&mut buf, "version", 12);
        assert_eq!(&buf[..], b"version\0\0\0\0\0");
    }

    #[test]
    fn test_hex_and_text_helpers() {
        assert_eq!(to_hex(&[0x00, 0xab, 0xff]), "00abff");
        assert!(is_text(b"Monday, January 1\r\n"));
        assert!(!is_text(&[0x16, 0x03, 0x01]));
        assert_eq!(trim_line(b"PONG\r\n"), b"PONG");
    }
}
