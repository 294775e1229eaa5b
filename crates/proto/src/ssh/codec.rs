//! Encrypting packet codec: framing plus the directional security contexts.
//!
//! One [`PacketEncoder`] and one [`PacketDecoder`] exist per session, each
//! owning its direction's security context, 32-bit sequence number and
//! rekey counters. Sequence numbers are implicit (never transmitted), wrap
//! modulo 2^32, and are not reset across rekeys; under strict KEX both
//! sides reset them to zero at NEWKEYS instead.
//!
//! Context swaps happen at a packet boundary: the encoder swaps right after
//! sealing NEWKEYS, the decoder right after opening it. [`PacketEncoder`]
//! and [`PacketDecoder`] expose [`PacketEncoder::activate`] /
//! [`PacketDecoder::activate`] for exactly that moment; the session
//! supervisor serializes encoder access behind its outbound mutex.

use tokio::io::{AsyncRead, AsyncReadExt};

use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::crypto::{OpenContext, SealContext};
use crate::ssh::packet;

/// Outbound half of the packet codec.
#[derive(Debug)]
pub struct PacketEncoder {
    ctx: SealContext,
    seq: u32,
    bytes_since_rekey: u64,
    packets_since_rekey: u64,
}

impl PacketEncoder {
    /// Creates an encoder with the cleartext context.
    pub fn new() -> Self {
        Self {
            ctx: SealContext::plaintext(),
            seq: 0,
            bytes_since_rekey: 0,
            packets_since_rekey: 0,
        }
    }

    /// Seals a payload into its wire form and advances the sequence number.
    pub fn encode(&mut self, payload: &[u8]) -> SkiffResult<Vec<u8>> {
        let framed = packet::frame(
            payload,
            self.ctx.block_size(),
            self.ctx.length_covered(),
        )?;
        let wire = self.ctx.seal(self.seq, framed)?;

        self.seq = self.seq.wrapping_add(1);
        self.bytes_since_rekey += wire.len() as u64;
        self.packets_since_rekey += 1;
        Ok(wire)
    }

    /// Swaps in a freshly keyed context. Called immediately after NEWKEYS
    /// has been sealed; resets the rekey counters.
    pub fn activate(&mut self, ctx: SealContext, reset_seq: bool) {
        self.ctx = ctx;
        self.bytes_since_rekey = 0;
        self.packets_since_rekey = 0;
        if reset_seq {
            self.seq = 0;
        }
    }

    /// Current outbound sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Bytes sealed since the last context swap.
    pub fn bytes_since_rekey(&self) -> u64 {
        self.bytes_since_rekey
    }
}

impl Default for PacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound half of the packet codec.
#[derive(Debug)]
pub struct PacketDecoder {
    ctx: OpenContext,
    seq: u32,
    bytes_since_rekey: u64,
    packets_since_rekey: u64,
}

impl PacketDecoder {
    /// Creates a decoder with the cleartext context.
    pub fn new() -> Self {
        Self {
            ctx: OpenContext::plaintext(),
            seq: 0,
            bytes_since_rekey: 0,
            packets_since_rekey: 0,
        }
    }

    /// Reads, decrypts and verifies one packet from the stream, returning
    /// its payload. Cancel-safe only at the first read.
    pub async fn read_packet<R: AsyncRead + Unpin>(&mut self, r: &mut R) -> SkiffResult<Vec<u8>> {
        let mut prefix = vec![0u8; self.ctx.prefix_len()];
        r.read_exact(&mut prefix).await?;

        let packet_length = self.ctx.decode_length(self.seq, &mut prefix)?;
        packet::check_packet_length(
            packet_length,
            self.ctx.block_size(),
            self.ctx.length_covered(),
        )?;

        let mut tail = vec![0u8; self.ctx.tail_len(packet_length)];
        r.read_exact(&mut tail).await?;

        let wire_len = prefix.len() + tail.len();
        let plain = self.ctx.open(self.seq, &prefix, tail)?;
        let payload = packet::extract_payload(&plain)?;

        self.seq = self.seq.wrapping_add(1);
        self.bytes_since_rekey += wire_len as u64;
        self.packets_since_rekey += 1;
        Ok(payload)
    }

    /// Decrypts one packet from a byte slice. Test and in-memory helper;
    /// the slice must contain exactly one packet.
    pub fn decode(&mut self, wire: &[u8]) -> SkiffResult<Vec<u8>> {
        let prefix_len = self.ctx.prefix_len();
        if wire.len() < prefix_len {
            return Err(SkiffError::Wire("Truncated packet prefix".to_string()));
        }
        let mut prefix = wire[..prefix_len].to_vec();

        let packet_length = self.ctx.decode_length(self.seq, &mut prefix)?;
        packet::check_packet_length(
            packet_length,
            self.ctx.block_size(),
            self.ctx.length_covered(),
        )?;

        let tail_len = self.ctx.tail_len(packet_length);
        if wire.len() != prefix_len + tail_len {
            return Err(SkiffError::Wire(format!(
                "Packet size mismatch: expected {}, got {}",
                prefix_len + tail_len,
                wire.len()
            )));
        }
        let tail = wire[prefix_len..].to_vec();

        let plain = self.ctx.open(self.seq, &prefix, tail)?;
        let payload = packet::extract_payload(&plain)?;

        self.seq = self.seq.wrapping_add(1);
        self.bytes_since_rekey += wire.len() as u64;
        self.packets_since_rekey += 1;
        Ok(payload)
    }

    /// Swaps in a freshly keyed context. Called immediately after NEWKEYS
    /// has been opened; resets the rekey counters.
    pub fn activate(&mut self, ctx: OpenContext, reset_seq: bool) {
        self.ctx = ctx;
        self.bytes_since_rekey = 0;
        self.packets_since_rekey = 0;
        if reset_seq {
            self.seq = 0;
        }
    }

    /// Current inbound sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Bytes opened since the last context swap.
    pub fn bytes_since_rekey(&self) -> u64 {
        self.bytes_since_rekey
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};

    fn keyed_pair(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) -> (PacketEncoder, PacketDecoder) {
        let key = vec![0x42u8; cipher.key_size()];
        let iv = vec![0x17u8; cipher.iv_size().max(1)];
        let mac_key = vec![0x55u8; 64];
        let seal_mac = mac.map(|m| (m, &mac_key[..]));
        let open_mac = mac.map(|m| (m, &mac_key[..]));

        let mut enc = PacketEncoder::new();
        enc.activate(
            SealContext::new(cipher, &key, &iv, seal_mac).unwrap(),
            false,
        );
        let mut dec = PacketDecoder::new();
        dec.activate(
            OpenContext::new(cipher, &key, &iv, open_mac).unwrap(),
            false,
        );
        (enc, dec)
    }

    #[test]
    fn test_plaintext_round_trip() {
        let mut enc = PacketEncoder::new();
        let mut dec = PacketDecoder::new();

        let wire = enc.encode(b"hello transport").unwrap();
        let payload = dec.decode(&wire).unwrap();
        assert_eq!(payload, b"hello transport");
        assert_eq!(enc.seq(), 1);
        assert_eq!(dec.seq(), 1);
    }

    #[test]
    fn test_round_trip_every_cipher_mac_pair() {
        let aead = [
            CipherAlgorithm::ChaCha20Poly1305,
            CipherAlgorithm::Aes128Gcm,
            CipherAlgorithm::Aes256Gcm,
        ];
        let classic = [
            CipherAlgorithm::Aes128Ctr,
            CipherAlgorithm::Aes256Ctr,
            CipherAlgorithm::Aes128Cbc,
            CipherAlgorithm::Aes256Cbc,
        ];
        let macs = [
            MacAlgorithm::HmacSha256,
            MacAlgorithm::HmacSha512,
            MacAlgorithm::HmacSha256Etm,
            MacAlgorithm::HmacSha512Etm,
        ];

        let payloads: Vec<Vec<u8>> = vec![
            vec![21],
            b"some channel data".to_vec(),
            vec![0xab; 4000],
        ];

        for cipher in aead {
            let (mut enc, mut dec) = keyed_pair(cipher, None);
            for payload in &payloads {
                let wire = enc.encode(payload).unwrap();
                assert_eq!(&dec.decode(&wire).unwrap(), payload, "{}", cipher.name());
            }
            assert_eq!(enc.seq(), dec.seq());
        }

        for cipher in classic {
            for mac in macs {
                let (mut enc, mut dec) = keyed_pair(cipher, Some(mac));
                for payload in &payloads {
                    let wire = enc.encode(payload).unwrap();
                    assert_eq!(
                        &dec.decode(&wire).unwrap(),
                        payload,
                        "{} / {}",
                        cipher.name(),
                        mac.name()
                    );
                }
                assert_eq!(enc.seq(), dec.seq());
            }
        }
    }

    #[test]
    fn test_sequence_advances_per_packet() {
        let (mut enc, mut dec) = keyed_pair(CipherAlgorithm::ChaCha20Poly1305, None);
        for i in 0..5u8 {
            let wire = enc.encode(&[i]).unwrap();
            assert_eq!(dec.decode(&wire).unwrap(), vec![i]);
        }
        assert_eq!(enc.seq(), 5);
        assert_eq!(dec.seq(), 5);
    }

    #[test]
    fn test_bad_mac_detected() {
        let (mut enc, mut dec) = keyed_pair(
            CipherAlgorithm::Aes256Ctr,
            Some(MacAlgorithm::HmacSha256),
        );
        let mut wire = enc.encode(b"payload under test").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let err = dec.decode(&wire).unwrap_err();
        assert!(matches!(err, SkiffError::Crypto(_)), "got {:?}", err);
    }

    #[test]
    fn test_bad_tag_detected_aead() {
        let (mut enc, mut dec) = keyed_pair(CipherAlgorithm::Aes128Gcm, None);
        let mut wire = enc.encode(b"aead payload").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x80;

        assert!(matches!(dec.decode(&wire), Err(SkiffError::Crypto(_))));
    }

    #[test]
    fn test_tampered_length_rejected() {
        let (mut enc, mut dec) = keyed_pair(CipherAlgorithm::ChaCha20Poly1305, None);
        let mut wire = enc.encode(b"x").unwrap();
        // Flip a bit in the encrypted length field
        wire[0] ^= 0x01;
        assert!(dec.decode(&wire).is_err());
    }

    #[test]
    fn test_seq_mismatch_fails_decryption() {
        let (mut enc, mut dec) = keyed_pair(CipherAlgorithm::ChaCha20Poly1305, None);
        let w1 = enc.encode(b"first").unwrap();
        let w2 = enc.encode(b"second").unwrap();

        // Dropping the first packet desynchronizes the sequence numbers
        let _ = w1;
        assert!(dec.decode(&w2).is_err());
    }

    #[test]
    fn test_activate_resets_counters_keeps_seq() {
        let (mut enc, _) = keyed_pair(CipherAlgorithm::ChaCha20Poly1305, None);
        enc.encode(b"data").unwrap();
        assert!(enc.bytes_since_rekey() > 0);
        let seq = enc.seq();

        let key = vec![9u8; 64];
        enc.activate(
            SealContext::new(CipherAlgorithm::ChaCha20Poly1305, &key, &[], None).unwrap(),
            false,
        );
        assert_eq!(enc.bytes_since_rekey(), 0);
        assert_eq!(enc.seq(), seq);
    }

    #[test]
    fn test_activate_strict_resets_seq() {
        let (mut enc, _) = keyed_pair(CipherAlgorithm::ChaCha20Poly1305, None);
        enc.encode(b"data").unwrap();

        let key = vec![9u8; 64];
        enc.activate(
            SealContext::new(CipherAlgorithm::ChaCha20Poly1305, &key, &[], None).unwrap(),
            true,
        );
        assert_eq!(enc.seq(), 0);
    }

    #[tokio::test]
    async fn test_read_packet_from_stream() {
        let (mut enc, mut dec) = keyed_pair(
            CipherAlgorithm::Aes128Ctr,
            Some(MacAlgorithm::HmacSha256Etm),
        );
        let mut stream = Vec::new();
        stream.extend_from_slice(&enc.encode(b"one").unwrap());
        stream.extend_from_slice(&enc.encode(b"two").unwrap());

        let mut cursor = std::io::Cursor::new(stream);
        assert_eq!(dec.read_packet(&mut cursor).await.unwrap(), b"one");
        assert_eq!(dec.read_packet(&mut cursor).await.unwrap(), b"two");
    }
}
