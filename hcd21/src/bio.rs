//!
//! # Binary Encoding Primitives
//!
//! Extension traits on [Read] and [Write], in the manner of [byteorder]'s `ReadBytesExt` and `WriteBytesExt`,
//! for the encodings shared by digest files, instance-list segments, and attribute payloads:
//!
//! * Unsigned integers: seven bits per byte, least-significant group first,
//!   high bit set on every byte but the last.
//!   Encodings longer than five bytes (32-bit) or ten bytes (64-bit),
//!   or whose final byte carries bits beyond the type's width, are rejected.
//! * Signed integers: zig-zag mapped onto the unsigned encoding, so small magnitudes of either sign stay short.
//! * Reals: eight-byte little-endian IEEE754.
//! * Strings and blobs: unsigned length, then bytes. A zero length denotes absence or end-of-list.
//!

// Std-Lib
use std::io::{Read, Write};

// Crates.io
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

// Local imports
use crate::error::{HcdError, HcdResult};

/// Largest string or blob accepted when reading
pub const MAX_BLOB_LEN: u64 = 1 << 30;

/// Zig-zag map a signed 32-bit value onto unsigned
#[inline]
pub fn zigzag32(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}
/// Inverse of [zigzag32]
#[inline]
pub fn unzigzag32(u: u32) -> i32 {
    ((u >> 1) as i32) ^ -((u & 1) as i32)
}
/// Zig-zag map a signed 64-bit value onto unsigned
#[inline]
pub fn zigzag64(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}
/// Inverse of [zigzag64]
#[inline]
pub fn unzigzag64(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}
/// Number of bytes in the varint encoding of `v`
pub fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// # Reading Extensions
pub trait ReadHcdExt: Read {
    /// Read a single byte
    fn read_byte(&mut self) -> HcdResult<u8> {
        Ok(self.read_u8()?)
    }
    /// Read an unsigned 32-bit varint
    fn read_u32v(&mut self) -> HcdResult<u32> {
        let mut val: u32 = 0;
        for k in 0..5 {
            let b = self.read_u8()?;
            if k == 4 && b > 0x0F {
                return Err(HcdError::format("Varint overflows 32 bits"));
            }
            val |= ((b & 0x7F) as u32) << (7 * k);
            if b & 0x80 == 0 {
                return Ok(val);
            }
        }
        Err(HcdError::format("Varint overflows 32 bits"))
    }
    /// Read an unsigned 64-bit varint
    fn read_u64v(&mut self) -> HcdResult<u64> {
        let mut val: u64 = 0;
        for k in 0..10 {
            let b = self.read_u8()?;
            if k == 9 && b > 0x01 {
                return Err(HcdError::format("Varint overflows 64 bits"));
            }
            val |= ((b & 0x7F) as u64) << (7 * k);
            if b & 0x80 == 0 {
                return Ok(val);
            }
        }
        Err(HcdError::format("Varint overflows 64 bits"))
    }
    /// Read a signed (zig-zag) 32-bit varint
    fn read_i32v(&mut self) -> HcdResult<i32> {
        Ok(unzigzag32(self.read_u32v()?))
    }
    /// Read a signed (zig-zag) 64-bit varint
    fn read_i64v(&mut self) -> HcdResult<i64> {
        Ok(unzigzag64(self.read_u64v()?))
    }
    /// Read an eight-byte little-endian IEEE real
    fn read_real(&mut self) -> HcdResult<f64> {
        Ok(self.read_f64::<LittleEndian>()?)
    }
    /// Read a four-byte little-endian unsigned integer
    fn read_u32le(&mut self) -> HcdResult<u32> {
        Ok(self.read_u32::<LittleEndian>()?)
    }
    /// Read a length-prefixed blob. Zero-length blobs are returned empty.
    fn read_blob(&mut self) -> HcdResult<Vec<u8>> {
        let len = self.read_u64v()?;
        if len > MAX_BLOB_LEN {
            return Err(HcdError::format(format!("Invalid blob length {}", len)));
        }
        let mut rv = Vec::new();
        (&mut *self).take(len).read_to_end(&mut rv)?;
        if rv.len() as u64 != len {
            return Err(HcdError::format("Unexpected end of data"));
        }
        Ok(rv)
    }
    /// Read a length-prefixed string. Zero length, denoting absence or end-of-list, reads as `None`.
    fn read_string(&mut self) -> HcdResult<Option<String>> {
        let bytes = self.read_blob()?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8(bytes)?))
    }
}
impl<R: Read + ?Sized> ReadHcdExt for R {}

/// # Writing Extensions
pub trait WriteHcdExt: Write {
    /// Write a single byte
    fn write_byte(&mut self, b: u8) -> HcdResult<()> {
        Ok(self.write_u8(b)?)
    }
    /// Write an unsigned 32-bit varint
    fn write_u32v(&mut self, v: u32) -> HcdResult<()> {
        self.write_u64v(v as u64)
    }
    /// Write an unsigned 64-bit varint
    fn write_u64v(&mut self, mut v: u64) -> HcdResult<()> {
        let mut buf = [0u8; 10];
        let mut n = 0;
        while v >= 0x80 {
            buf[n] = (v as u8 & 0x7F) | 0x80;
            v >>= 7;
            n += 1;
        }
        buf[n] = v as u8;
        self.write_all(&buf[..n + 1])?;
        Ok(())
    }
    /// Write a signed (zig-zag) 32-bit varint
    fn write_i32v(&mut self, v: i32) -> HcdResult<()> {
        self.write_u32v(zigzag32(v))
    }
    /// Write a signed (zig-zag) 64-bit varint
    fn write_i64v(&mut self, v: i64) -> HcdResult<()> {
        self.write_u64v(zigzag64(v))
    }
    /// Write an eight-byte little-endian IEEE real
    fn write_real(&mut self, v: f64) -> HcdResult<()> {
        Ok(self.write_f64::<LittleEndian>(v)?)
    }
    /// Write a four-byte little-endian unsigned integer
    fn write_u32le(&mut self, v: u32) -> HcdResult<()> {
        Ok(self.write_u32::<LittleEndian>(v)?)
    }
    /// Write a length-prefixed blob
    fn write_blob(&mut self, bytes: &[u8]) -> HcdResult<()> {
        self.write_u64v(bytes.len() as u64)?;
        self.write_all(bytes)?;
        Ok(())
    }
    /// Write a length-prefixed string. Empty strings are not representable; they read back as end-of-list.
    fn write_string(&mut self, s: &str) -> HcdResult<()> {
        if s.is_empty() {
            return Err(HcdError::msg("Cannot encode an empty string"));
        }
        self.write_blob(s.as_bytes())
    }
    /// Write the end-of-list marker, a zero length
    fn write_end(&mut self) -> HcdResult<()> {
        self.write_byte(0)
    }
}
impl<W: Write + ?Sized> WriteHcdExt for W {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_lengths() -> HcdResult<()> {
        for (val, len) in [(0u64, 1), (127, 1), (128, 2), (16383, 2), (16384, 3)] {
            let mut buf = Vec::new();
            buf.write_u64v(val)?;
            assert_eq!(buf.len(), len);
            assert_eq!(varint_len(val), len);
            assert_eq!((&buf[..]).read_u64v()?, val);
        }
        let mut buf = Vec::new();
        buf.write_u32v(u32::MAX)?;
        assert_eq!(buf, vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        assert_eq!((&buf[..]).read_u32v()?, u32::MAX);
        Ok(())
    }
    #[test]
    fn varint_overflow() {
        // Six bytes can never be a 32-bit varint
        let six: &[u8] = &[0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!((&six[..]).read_u32v().unwrap_err().is_format());
        // Five bytes, but with bits beyond 32 set in the last
        let wide: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0x1F];
        assert!((&wide[..]).read_u32v().unwrap_err().is_format());
        // Eleven bytes can never be a 64-bit varint
        let eleven = [0x80u8; 10].iter().chain([0x01u8].iter()).copied().collect::<Vec<_>>();
        assert!((&eleven[..]).read_u64v().unwrap_err().is_format());
        // Short reads are format errors too
        let short: &[u8] = &[0x80];
        assert!((&short[..]).read_u32v().unwrap_err().is_format());
    }
    #[test]
    fn signed_values() -> HcdResult<()> {
        assert_eq!(zigzag32(0), 0);
        assert_eq!(zigzag32(-1), 1);
        assert_eq!(zigzag32(1), 2);
        assert_eq!(zigzag32(63), 126);
        assert_eq!(zigzag32(-64), 127);
        let mut buf = Vec::new();
        for v in [i32::MIN, -64, -1, 0, 63, i32::MAX] {
            buf.write_i32v(v)?;
        }
        buf.write_i64v(i64::MIN)?;
        let mut rdr = &buf[..];
        for v in [i32::MIN, -64, -1, 0, 63, i32::MAX] {
            assert_eq!(rdr.read_i32v()?, v);
        }
        assert_eq!(rdr.read_i64v()?, i64::MIN);
        assert!(rdr.is_empty());
        Ok(())
    }
    #[test]
    fn strings_and_reals() -> HcdResult<()> {
        let mut buf = Vec::new();
        buf.write_string("inv_x1")?;
        buf.write_end()?;
        buf.write_real(-0.125)?;
        let mut rdr = &buf[..];
        assert_eq!(rdr.read_string()?, Some("inv_x1".to_string()));
        assert_eq!(rdr.read_string()?, None);
        assert_eq!(rdr.read_real()?, -0.125);
        // Truncated string payloads are rejected
        let short: &[u8] = &[5, b'a', b'b'];
        assert!((&short[..]).read_string().unwrap_err().is_format());
        Ok(())
    }
}
