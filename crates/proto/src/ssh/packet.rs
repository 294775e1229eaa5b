//! SSH binary packet framing (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac or AEAD tag (m depends on the active security context)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does NOT include the MAC or the length field itself
//! - `padding_length` is between 4 and 255 bytes
//! - the padded region is a multiple of max(8, cipher block size); for
//!   classic ciphers the 4-byte length field is part of that region, for
//!   AEAD and encrypt-then-MAC contexts it is not
//! - `packet_length` must not exceed 35000 bytes (DoS limit)
//!
//! This module does the cleartext framing arithmetic only; encryption, MAC
//! and sequence numbers live in [`crate::ssh::codec`].

use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

/// Maximum value of `packet_length` (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Computes the padding length for a payload.
///
/// The total of (`4-byte length if covered` + 1 + payload + padding) must be
/// a multiple of `block`, with at least [`MIN_PADDING_LEN`] bytes of padding.
///
/// `length_covered` is true for classic ciphers where the length field is
/// encrypted along with the rest of the packet, false for AEAD and
/// encrypt-then-MAC contexts where the length is excluded from alignment.
pub fn padding_len(payload_len: usize, block: usize, length_covered: bool) -> u8 {
    let covered = if length_covered { 4 + 1 } else { 1 } + payload_len;
    let mut pad = MIN_PADDING_LEN as usize;
    let rem = (covered + pad) % block;
    if rem != 0 {
        pad += block - rem;
    }
    pad as u8
}

/// Frames a payload into `packet_length || padding_length || payload ||
/// random padding`, without MAC.
///
/// # Errors
///
/// Returns [`SkiffError::Wire`] if the framed packet would exceed
/// [`MAX_PACKET_SIZE`].
pub fn frame(payload: &[u8], block: usize, length_covered: bool) -> SkiffResult<Vec<u8>> {
    let pad_len = padding_len(payload.len(), block, length_covered);
    let packet_length = 1 + payload.len() + pad_len as usize;

    if packet_length > MAX_PACKET_SIZE {
        return Err(SkiffError::Wire(format!(
            "Packet length {} exceeds maximum {}",
            packet_length, MAX_PACKET_SIZE
        )));
    }

    let mut out = Vec::with_capacity(4 + packet_length);
    out.extend_from_slice(&(packet_length as u32).to_be_bytes());
    out.push(pad_len);
    out.extend_from_slice(payload);

    let pad_start = out.len();
    out.resize(pad_start + pad_len as usize, 0);
    rand::thread_rng().fill_bytes(&mut out[pad_start..]);

    Ok(out)
}

/// Validates a received `packet_length` against the transport limits and the
/// alignment of the active cipher.
pub fn check_packet_length(
    packet_length: usize,
    block: usize,
    length_covered: bool,
) -> SkiffResult<()> {
    if packet_length > MAX_PACKET_SIZE {
        return Err(SkiffError::Wire(format!(
            "Packet too large: {} bytes (maximum {})",
            packet_length, MAX_PACKET_SIZE
        )));
    }

    // padding_length byte + at least minimum padding
    if packet_length < 1 + MIN_PADDING_LEN as usize {
        return Err(SkiffError::Wire(format!(
            "Packet too small: {} bytes",
            packet_length
        )));
    }

    let covered = if length_covered {
        packet_length + 4
    } else {
        packet_length
    };
    if covered % block != 0 {
        return Err(SkiffError::Wire(format!(
            "Packet length {} not aligned to cipher block {}",
            packet_length, block
        )));
    }

    Ok(())
}

/// Extracts the payload from a decrypted `padding_length || payload ||
/// padding` region.
pub fn extract_payload(plain: &[u8]) -> SkiffResult<Vec<u8>> {
    if plain.is_empty() {
        return Err(SkiffError::Wire("Empty packet body".to_string()));
    }

    let pad_len = plain[0] as usize;
    if pad_len < MIN_PADDING_LEN as usize {
        return Err(SkiffError::Wire(format!(
            "Padding too short: {} bytes (minimum {})",
            pad_len, MIN_PADDING_LEN
        )));
    }
    if 1 + pad_len > plain.len() {
        return Err(SkiffError::Wire(format!(
            "Padding {} exceeds packet body {}",
            pad_len,
            plain.len()
        )));
    }

    Ok(plain[1..plain.len() - pad_len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_minimum() {
        // All padding lengths must be >= 4 regardless of alignment
        for len in 0..64 {
            for block in [8usize, 16] {
                for covered in [true, false] {
                    let pad = padding_len(len, block, covered);
                    assert!(pad >= MIN_PADDING_LEN, "len={} block={}", len, block);
                }
            }
        }
    }

    #[test]
    fn test_frame_alignment_classic() {
        let framed = frame(b"test payload", 16, true).unwrap();
        assert_eq!(framed.len() % 16, 0);
    }

    #[test]
    fn test_frame_alignment_aead() {
        // Length excluded: (framed - 4) must be block aligned
        let framed = frame(b"test payload", 8, false).unwrap();
        assert_eq!((framed.len() - 4) % 8, 0);
    }

    #[test]
    fn test_frame_extract_round_trip() {
        let payload = b"round trip payload";
        let framed = frame(payload, 8, true).unwrap();

        let packet_length = u32::from_be_bytes(framed[0..4].try_into().unwrap()) as usize;
        check_packet_length(packet_length, 8, true).unwrap();

        let extracted = extract_payload(&framed[4..]).unwrap();
        assert_eq!(extracted, payload);
    }

    #[test]
    fn test_check_rejects_oversize() {
        assert!(check_packet_length(MAX_PACKET_SIZE + 1, 8, true).is_err());
    }

    #[test]
    fn test_check_rejects_misaligned() {
        assert!(check_packet_length(13, 8, true).is_err());
    }

    #[test]
    fn test_extract_rejects_short_padding() {
        // padding_length = 2 < 4
        let body = [2u8, b'h', b'i', 0, 0];
        assert!(extract_payload(&body).is_err());
    }

    #[test]
    fn test_extract_rejects_padding_overrun() {
        let body = [200u8, b'h', b'i'];
        assert!(extract_payload(&body).is_err());
    }

    #[test]
    fn test_frame_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PACKET_SIZE + 10];
        assert!(frame(&payload, 8, true).is_err());
    }
}
