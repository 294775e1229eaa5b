//! SSH wire-format primitives (RFC 4251 Section 5).
//!
//! All multi-byte integers are big-endian. A `string` is a uint32 length
//! prefix followed by that many bytes. An `mpint` is a two's-complement
//! big-endian integer with a leading zero byte when the high bit of the first
//! byte would otherwise be set. A `name-list` is a `string` containing
//! comma-separated, order-significant ASCII names.
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use skiff_proto::ssh::wire;
//!
//! let mut buf = BytesMut::new();
//! wire::put_string(&mut buf, b"ssh-userauth");
//!
//! let mut offset = 0;
//! let name = wire::get_string(&buf, &mut offset).unwrap();
//! assert_eq!(name, b"ssh-userauth");
//! ```

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

/// Writes a `string` (uint32 length + bytes).
pub fn put_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Writes a `string` from UTF-8 text.
pub fn put_str(buf: &mut BytesMut, s: &str) {
    put_string(buf, s.as_bytes());
}

/// Writes a `boolean` (single byte, 0 or 1).
pub fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(v as u8);
}

/// Writes an `mpint` (RFC 4251 Section 5).
///
/// Leading zero bytes are stripped; a zero byte is prepended when the high
/// bit of the leading byte is set so the value stays non-negative.
pub fn put_mpint(buf: &mut BytesMut, data: &[u8]) {
    let stripped: &[u8] = {
        let mut s = data;
        while !s.is_empty() && s[0] == 0 {
            s = &s[1..];
        }
        s
    };

    if stripped.is_empty() {
        buf.put_u32(0);
    } else if stripped[0] & 0x80 != 0 {
        buf.put_u32(stripped.len() as u32 + 1);
        buf.put_u8(0);
        buf.put_slice(stripped);
    } else {
        buf.put_u32(stripped.len() as u32);
        buf.put_slice(stripped);
    }
}

/// Writes a `name-list` (comma-separated names as a `string`).
pub fn put_name_list(buf: &mut BytesMut, names: &[String]) {
    put_str(buf, &names.join(","));
}

/// Reads a `u8`, advancing `offset`.
pub fn get_u8(data: &[u8], offset: &mut usize) -> SkiffResult<u8> {
    if *offset >= data.len() {
        return Err(SkiffError::Wire("Truncated u8".to_string()));
    }
    let v = data[*offset];
    *offset += 1;
    Ok(v)
}

/// Reads a `boolean`, advancing `offset`.
pub fn get_bool(data: &[u8], offset: &mut usize) -> SkiffResult<bool> {
    Ok(get_u8(data, offset)? != 0)
}

/// Reads a big-endian `uint32`, advancing `offset`.
pub fn get_u32(data: &[u8], offset: &mut usize) -> SkiffResult<u32> {
    if *offset + 4 > data.len() {
        return Err(SkiffError::Wire("Truncated u32".to_string()));
    }
    let v = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;
    Ok(v)
}

/// Reads a `string`, advancing `offset`.
pub fn get_string<'a>(data: &'a [u8], offset: &mut usize) -> SkiffResult<&'a [u8]> {
    let len = get_u32(data, offset)? as usize;
    if *offset + len > data.len() {
        return Err(SkiffError::Wire(format!(
            "Truncated string: declared {} bytes, {} remain",
            len,
            data.len() - *offset
        )));
    }
    let s = &data[*offset..*offset + len];
    *offset += len;
    Ok(s)
}

/// Reads a `string` and validates it as UTF-8, advancing `offset`.
pub fn get_str<'a>(data: &'a [u8], offset: &mut usize) -> SkiffResult<&'a str> {
    let raw = get_string(data, offset)?;
    std::str::from_utf8(raw).map_err(|_| SkiffError::Wire("String is not UTF-8".to_string()))
}

/// Reads an `mpint`, advancing `offset`.
///
/// Returns the magnitude bytes with any leading zero stripped. Negative
/// values are rejected; SSH never transmits them in the fields we parse.
pub fn get_mpint<'a>(data: &'a [u8], offset: &mut usize) -> SkiffResult<&'a [u8]> {
    let raw = get_string(data, offset)?;
    if !raw.is_empty() && raw[0] & 0x80 != 0 {
        return Err(SkiffError::Wire("Negative mpint".to_string()));
    }
    let mut s = raw;
    while !s.is_empty() && s[0] == 0 {
        s = &s[1..];
    }
    Ok(s)
}

/// Reads a `name-list`, advancing `offset`.
pub fn get_name_list(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<String>> {
    let raw = get_str(data, offset)?;
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    if !raw.is_ascii() {
        return Err(SkiffError::Wire("Name-list is not ASCII".to_string()));
    }
    Ok(raw.split(',').map(String::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, b"hello");

        let mut offset = 0;
        assert_eq!(get_string(&buf, &mut offset).unwrap(), b"hello");
        assert_eq!(offset, 9);
    }

    #[test]
    fn test_string_truncated() {
        let data = [0, 0, 0, 10, b'x'];
        let mut offset = 0;
        assert!(get_string(&data, &mut offset).is_err());
    }

    #[test]
    fn test_mpint_high_bit_prefixed() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x80, 0x01]);
        assert_eq!(&buf[..], &[0, 0, 0, 3, 0x00, 0x80, 0x01]);

        let mut offset = 0;
        assert_eq!(get_mpint(&buf, &mut offset).unwrap(), &[0x80, 0x01]);
    }

    #[test]
    fn test_mpint_leading_zeros_stripped() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x00, 0x00, 0x12]);
        assert_eq!(&buf[..], &[0, 0, 0, 1, 0x12]);
    }

    #[test]
    fn test_mpint_zero() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x00]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_name_list_round_trip() {
        let names = vec!["curve25519-sha256".to_string(), "ssh-ed25519".to_string()];
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &names);

        let mut offset = 0;
        assert_eq!(get_name_list(&buf, &mut offset).unwrap(), names);
    }

    #[test]
    fn test_name_list_empty() {
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &[]);

        let mut offset = 0;
        assert!(get_name_list(&buf, &mut offset).unwrap().is_empty());
    }

    #[test]
    fn test_get_u32_order() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut offset = 0;
        assert_eq!(get_u32(&data, &mut offset).unwrap(), 0x01020304);
    }
}
