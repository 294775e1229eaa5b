//! SSH cryptographic primitives: cipher and MAC registries plus the
//! directional security contexts used by the packet codec.
//!
//! Algorithm classes:
//! - `chacha20-poly1305@openssh.com` - AEAD, two-key construction with the
//!   packet length encrypted under a dedicated length key
//! - `aes128-gcm@openssh.com`, `aes256-gcm@openssh.com` - AEAD (RFC 5647),
//!   packet length authenticated as associated data
//! - `aes128-ctr`, `aes256-ctr` - stream ciphers with a separate MAC
//! - `aes128-cbc`, `aes256-cbc` - block ciphers with a separate MAC
//! - MACs: `hmac-sha2-256`, `hmac-sha2-512` and their `-etm@openssh.com`
//!   encrypt-then-MAC variants
//! - the cleartext context, valid only before the first NEWKEYS
//!
//! A [`SealContext`] encrypts outbound packets and an [`OpenContext`]
//! decrypts inbound packets. The codec installs a fresh pair at each
//! NEWKEYS boundary; a context never outlives one key exchange epoch.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes::cipher::generic_array::GenericArray;
use aes::{Aes128, Aes256};
use chacha20::cipher::StreamCipherSeek;
use chacha20::ChaCha20;
use hmac::{Hmac, Mac};
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use sha2::{Sha256, Sha512};
use skiff_platform::{SkiffError, SkiffResult};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

/// Length of the AEAD authentication tag for all supported AEAD ciphers.
pub const TAG_LEN: usize = 16;

type Ctr128Aes128 = ctr::Ctr128BE<Aes128>;
type Ctr128Aes256 = ctr::Ctr128BE<Aes256>;
type CbcEncAes128 = cbc::Encryptor<Aes128>;
type CbcEncAes256 = cbc::Encryptor<Aes256>;
type CbcDecAes128 = cbc::Decryptor<Aes128>;
type CbcDecAes256 = cbc::Decryptor<Aes256>;

/// Cipher algorithm registry, keyed by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305 AEAD cipher (OpenSSH variant)
    ChaCha20Poly1305,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// AES-128-CTR stream cipher (requires separate MAC)
    Aes128Ctr,
    /// AES-256-CTR stream cipher (requires separate MAC)
    Aes256Ctr,
    /// AES-128-CBC block cipher (requires separate MAC)
    Aes128Cbc,
    /// AES-256-CBC block cipher (requires separate MAC)
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// Returns the algorithm's wire name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
        }
    }

    /// Parses a cipher algorithm from its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            "aes256-cbc" => Some(CipherAlgorithm::Aes256Cbc),
            _ => None,
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 64,
            CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes256Gcm => 32,
            CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes256Ctr => 32,
            CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes256Cbc => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
            CipherAlgorithm::Aes128Ctr
            | CipherAlgorithm::Aes256Ctr
            | CipherAlgorithm::Aes128Cbc
            | CipherAlgorithm::Aes256Cbc => 16,
        }
    }

    /// Returns the block size used for padding alignment.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Returns true if this is an AEAD cipher (no separate MAC).
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
        )
    }
}

/// All cipher names skiff can negotiate, in default preference order.
pub fn supported_ciphers() -> Vec<String> {
    [
        "chacha20-poly1305@openssh.com",
        "aes256-gcm@openssh.com",
        "aes128-gcm@openssh.com",
        "aes256-ctr",
        "aes128-ctr",
        "aes256-cbc",
        "aes128-cbc",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// MAC algorithm registry, keyed by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256, MAC-then-encrypt
    HmacSha256,
    /// HMAC-SHA512, MAC-then-encrypt
    HmacSha512,
    /// HMAC-SHA256, encrypt-then-MAC
    HmacSha256Etm,
    /// HMAC-SHA512, encrypt-then-MAC
    HmacSha512Etm,
}

impl MacAlgorithm {
    /// Returns the algorithm's wire name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacSha256Etm => "hmac-sha2-256-etm@openssh.com",
            MacAlgorithm::HmacSha512Etm => "hmac-sha2-512-etm@openssh.com",
        }
    }

    /// Parses a MAC algorithm from its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            "hmac-sha2-256-etm@openssh.com" => Some(MacAlgorithm::HmacSha256Etm),
            "hmac-sha2-512-etm@openssh.com" => Some(MacAlgorithm::HmacSha512Etm),
            _ => None,
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => 32,
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => 64,
        }
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        self.key_size()
    }

    /// Returns true for encrypt-then-MAC variants.
    pub fn is_etm(&self) -> bool {
        matches!(
            self,
            MacAlgorithm::HmacSha256Etm | MacAlgorithm::HmacSha512Etm
        )
    }
}

/// All MAC names skiff can negotiate, in default preference order.
pub fn supported_macs() -> Vec<String> {
    [
        "hmac-sha2-256-etm@openssh.com",
        "hmac-sha2-512-etm@openssh.com",
        "hmac-sha2-256",
        "hmac-sha2-512",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Keyed HMAC state for one direction.
struct MacState {
    algorithm: MacAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

impl MacState {
    fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> SkiffResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(SkiffError::Crypto(format!(
                "Insufficient MAC key material: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }
        Ok(Self {
            algorithm,
            key: Zeroizing::new(key_material[..algorithm.key_size()].to_vec()),
        })
    }

    /// Computes HMAC over `seq || parts...`.
    fn compute(&self, seq: u32, parts: &[&[u8]]) -> Vec<u8> {
        match self.algorithm {
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key length");
                mac.update(&seq.to_be_bytes());
                for part in parts {
                    mac.update(part);
                }
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key length");
                mac.update(&seq.to_be_bytes());
                for part in parts {
                    mac.update(part);
                }
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Verifies a received MAC in constant time.
    fn verify(&self, seq: u32, parts: &[&[u8]], received: &[u8]) -> bool {
        let expected = self.compute(seq, parts);
        expected.len() == received.len() && expected.ct_eq(received).into()
    }
}

/// `chacha20-poly1305@openssh.com` cipher state.
///
/// The 64-byte key splits into a main key (first 32 bytes) and a length key
/// (last 32 bytes). The 4-byte packet length is encrypted under the length
/// key; the body is encrypted under the main key with the block counter
/// starting at 1, block 0 of the same keystream keying Poly1305. The packet
/// sequence number is the nonce.
struct ChaPoly {
    /// Length key
    k_len: [u8; 32],
    /// Main key
    k_main: [u8; 32],
}

impl Drop for ChaPoly {
    fn drop(&mut self) {
        self.k_len.zeroize();
        self.k_main.zeroize();
    }
}

impl ChaPoly {
    fn new(key: &[u8]) -> SkiffResult<Self> {
        if key.len() != 64 {
            return Err(SkiffError::Crypto(format!(
                "chacha20-poly1305 needs 64 key bytes, got {}",
                key.len()
            )));
        }
        let mut k_main = [0u8; 32];
        let mut k_len = [0u8; 32];
        k_main.copy_from_slice(&key[..32]);
        k_len.copy_from_slice(&key[32..64]);
        Ok(Self { k_len, k_main })
    }

    fn keystream(key: &[u8; 32], seq: u32) -> ChaCha20 {
        let mut nonce = [0u8; 12];
        nonce[8..].copy_from_slice(&seq.to_be_bytes());
        ChaCha20::new(key.into(), (&nonce).into())
    }

    /// Decrypts the 4-byte packet length without touching cipher state.
    fn decrypt_length(&self, seq: u32, encrypted: &[u8; 4]) -> u32 {
        let mut buf = *encrypted;
        Self::keystream(&self.k_len, seq).apply_keystream(&mut buf);
        u32::from_be_bytes(buf)
    }

    /// Encrypts `length || body` in place and returns the Poly1305 tag.
    fn seal(&self, seq: u32, packet: &mut [u8]) -> [u8; TAG_LEN] {
        let (len_part, body) = packet.split_at_mut(4);
        Self::keystream(&self.k_len, seq).apply_keystream(len_part);

        let mut main = Self::keystream(&self.k_main, seq);
        let mut poly_key = [0u8; 32];
        main.apply_keystream(&mut poly_key);
        main.seek(64u32);
        main.apply_keystream(body);

        let poly = Poly1305::new((&poly_key).into());
        let tag = poly.compute_unpadded(packet);
        poly_key.zeroize();

        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(tag.as_slice());
        out
    }

    /// Verifies the tag over the still-encrypted `length || body`, then
    /// decrypts the body in place.
    fn open(&self, seq: u32, packet: &mut [u8], tag: &[u8]) -> SkiffResult<()> {
        let mut main = Self::keystream(&self.k_main, seq);
        let mut poly_key = [0u8; 32];
        main.apply_keystream(&mut poly_key);

        let poly = Poly1305::new((&poly_key).into());
        let expected = poly.compute_unpadded(packet);
        poly_key.zeroize();

        let good: bool = expected.as_slice().ct_eq(tag).into();
        if !good {
            return Err(SkiffError::Crypto("Poly1305 tag mismatch".to_string()));
        }

        let (_, body) = packet.split_at_mut(4);
        main.seek(64u32);
        main.apply_keystream(body);
        Ok(())
    }
}

/// AES-GCM per-direction state (RFC 5647 nonce layout: 4 fixed bytes from
/// the IV plus a 64-bit invocation counter incremented per packet).
struct GcmState {
    key: LessSafeKey,
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmState {
    fn new(algorithm: &'static ring::aead::Algorithm, key: &[u8], iv: &[u8]) -> SkiffResult<Self> {
        if iv.len() < 12 {
            return Err(SkiffError::Crypto(format!(
                "AES-GCM needs a 12-byte IV, got {}",
                iv.len()
            )));
        }
        let unbound = UnboundKey::new(algorithm, key)
            .map_err(|_| SkiffError::Crypto("Failed to create AES-GCM key".to_string()))?;
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let invocation = u64::from_be_bytes(iv[4..12].try_into().expect("checked length"));
        Ok(Self {
            key: LessSafeKey::new(unbound),
            fixed,
            invocation,
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed);
        nonce[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::assume_unique_for_key(nonce)
    }
}

enum SealCipher {
    Plain,
    ChaPoly(ChaPoly),
    Gcm(GcmState),
    Ctr128(Ctr128Aes128),
    Ctr256(Ctr128Aes256),
    Cbc128(CbcEncAes128),
    Cbc256(CbcEncAes256),
}

enum OpenCipher {
    Plain,
    ChaPoly(ChaPoly),
    Gcm(GcmState),
    Ctr128(Ctr128Aes128),
    Ctr256(Ctr128Aes256),
    Cbc128(CbcDecAes128),
    Cbc256(CbcDecAes256),
}

fn check_key_iv(cipher: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SkiffResult<()> {
    if key.len() < cipher.key_size() {
        return Err(SkiffError::Crypto(format!(
            "Insufficient key material for {}: expected {}, got {}",
            cipher.name(),
            cipher.key_size(),
            key.len()
        )));
    }
    if iv.len() < cipher.iv_size() {
        return Err(SkiffError::Crypto(format!(
            "Insufficient IV material for {}: expected {}, got {}",
            cipher.name(),
            cipher.iv_size(),
            iv.len()
        )));
    }
    Ok(())
}

fn encrypt_cbc_blocks<C: BlockEncryptMut>(enc: &mut C, data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(16) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

fn decrypt_cbc_blocks<C: BlockDecryptMut>(dec: &mut C, data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(16) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

/// Outbound (sealing) security context for one direction.
pub struct SealContext {
    cipher: SealCipher,
    algorithm: Option<CipherAlgorithm>,
    mac: Option<MacState>,
}

impl SealContext {
    /// Creates the cleartext context used before the first NEWKEYS.
    pub fn plaintext() -> Self {
        Self {
            cipher: SealCipher::Plain,
            algorithm: None,
            mac: None,
        }
    }

    /// Creates a sealing context from a negotiated cipher, key material and
    /// (for non-AEAD ciphers) a MAC.
    pub fn new(
        cipher: CipherAlgorithm,
        key: &[u8],
        iv: &[u8],
        mac: Option<(MacAlgorithm, &[u8])>,
    ) -> SkiffResult<Self> {
        check_key_iv(cipher, key, iv)?;

        let bad_key = || SkiffError::Crypto(format!("Bad key material for {}", cipher.name()));
        let cipher_state = match cipher {
            CipherAlgorithm::ChaCha20Poly1305 => SealCipher::ChaPoly(ChaPoly::new(&key[..64])?),
            CipherAlgorithm::Aes128Gcm => {
                SealCipher::Gcm(GcmState::new(&AES_128_GCM, &key[..16], iv)?)
            }
            CipherAlgorithm::Aes256Gcm => {
                SealCipher::Gcm(GcmState::new(&AES_256_GCM, &key[..32], iv)?)
            }
            CipherAlgorithm::Aes128Ctr => SealCipher::Ctr128(
                Ctr128Aes128::new_from_slices(&key[..16], &iv[..16]).map_err(|_| bad_key())?,
            ),
            CipherAlgorithm::Aes256Ctr => SealCipher::Ctr256(
                Ctr128Aes256::new_from_slices(&key[..32], &iv[..16]).map_err(|_| bad_key())?,
            ),
            CipherAlgorithm::Aes128Cbc => SealCipher::Cbc128(
                CbcEncAes128::new_from_slices(&key[..16], &iv[..16]).map_err(|_| bad_key())?,
            ),
            CipherAlgorithm::Aes256Cbc => SealCipher::Cbc256(
                CbcEncAes256::new_from_slices(&key[..32], &iv[..16]).map_err(|_| bad_key())?,
            ),
        };

        let mac_state = match (cipher.is_aead(), mac) {
            (true, _) => None,
            (false, Some((alg, key_material))) => Some(MacState::new(alg, key_material)?),
            (false, None) => {
                return Err(SkiffError::Crypto(format!(
                    "Cipher {} requires a MAC",
                    cipher.name()
                )))
            }
        };

        Ok(Self {
            cipher: cipher_state,
            algorithm: Some(cipher),
            mac: mac_state,
        })
    }

    /// Returns the padding alignment block size.
    pub fn block_size(&self) -> usize {
        self.algorithm.map_or(8, |a| a.block_size())
    }

    /// Returns true when the 4-byte length field is part of the padded,
    /// encrypted region (classic ciphers and the cleartext context).
    pub fn length_covered(&self) -> bool {
        match &self.cipher {
            SealCipher::Plain => true,
            SealCipher::ChaPoly(_) | SealCipher::Gcm(_) => false,
            _ => !self.mac.as_ref().map_or(false, |m| m.algorithm.is_etm()),
        }
    }

    /// Seals a framed packet (`length || padding_length || payload ||
    /// padding`) into its wire form, appending MAC or tag.
    pub fn seal(&mut self, seq: u32, mut framed: Vec<u8>) -> SkiffResult<Vec<u8>> {
        match &mut self.cipher {
            SealCipher::Plain => return Ok(framed),
            SealCipher::ChaPoly(chapoly) => {
                let tag = chapoly.seal(seq, &mut framed);
                framed.extend_from_slice(&tag);
                return Ok(framed);
            }
            SealCipher::Gcm(gcm) => {
                let nonce = gcm.next_nonce();
                let (head, body) = framed.split_at_mut(4);
                let tag = gcm
                    .key
                    .seal_in_place_separate_tag(nonce, Aad::from(&*head), body)
                    .map_err(|_| SkiffError::Crypto("AES-GCM seal failed".to_string()))?;
                framed.extend_from_slice(tag.as_ref());
                return Ok(framed);
            }
            _ => {}
        }

        // Classic cipher + HMAC
        let etm = self.mac.as_ref().map_or(false, |m| m.algorithm.is_etm());
        if etm {
            // Encrypt the body, MAC over seq || cleartext length || ciphertext
            {
                let (_, body) = framed.split_at_mut(4);
                self.encrypt_classic(body);
            }
            let tag = self
                .mac
                .as_ref()
                .expect("classic cipher has MAC")
                .compute(seq, &[&framed]);
            framed.extend_from_slice(&tag);
        } else {
            // MAC over seq || plaintext packet, then encrypt it all
            let tag = self
                .mac
                .as_ref()
                .expect("classic cipher has MAC")
                .compute(seq, &[&framed]);
            self.encrypt_classic(&mut framed);
            framed.extend_from_slice(&tag);
        }
        Ok(framed)
    }

    fn encrypt_classic(&mut self, data: &mut [u8]) {
        match &mut self.cipher {
            SealCipher::Ctr128(c) => c.apply_keystream(data),
            SealCipher::Ctr256(c) => c.apply_keystream(data),
            SealCipher::Cbc128(c) => encrypt_cbc_blocks(c, data),
            SealCipher::Cbc256(c) => encrypt_cbc_blocks(c, data),
            _ => unreachable!("not a classic cipher"),
        }
    }
}

impl std::fmt::Debug for SealContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealContext")
            .field("algorithm", &self.algorithm.map(|a| a.name()))
            .field("mac", &self.mac.as_ref().map(|m| m.algorithm.name()))
            .finish()
    }
}

/// Inbound (opening) security context for one direction.
pub struct OpenContext {
    cipher: OpenCipher,
    algorithm: Option<CipherAlgorithm>,
    mac: Option<MacState>,
}

impl OpenContext {
    /// Creates the cleartext context used before the first NEWKEYS.
    pub fn plaintext() -> Self {
        Self {
            cipher: OpenCipher::Plain,
            algorithm: None,
            mac: None,
        }
    }

    /// Creates an opening context from a negotiated cipher, key material and
    /// (for non-AEAD ciphers) a MAC.
    pub fn new(
        cipher: CipherAlgorithm,
        key: &[u8],
        iv: &[u8],
        mac: Option<(MacAlgorithm, &[u8])>,
    ) -> SkiffResult<Self> {
        check_key_iv(cipher, key, iv)?;

        let bad_key = || SkiffError::Crypto(format!("Bad key material for {}", cipher.name()));
        let cipher_state = match cipher {
            CipherAlgorithm::ChaCha20Poly1305 => OpenCipher::ChaPoly(ChaPoly::new(&key[..64])?),
            CipherAlgorithm::Aes128Gcm => {
                OpenCipher::Gcm(GcmState::new(&AES_128_GCM, &key[..16], iv)?)
            }
            CipherAlgorithm::Aes256Gcm => {
                OpenCipher::Gcm(GcmState::new(&AES_256_GCM, &key[..32], iv)?)
            }
            CipherAlgorithm::Aes128Ctr => OpenCipher::Ctr128(
                Ctr128Aes128::new_from_slices(&key[..16], &iv[..16]).map_err(|_| bad_key())?,
            ),
            CipherAlgorithm::Aes256Ctr => OpenCipher::Ctr256(
                Ctr128Aes256::new_from_slices(&key[..32], &iv[..16]).map_err(|_| bad_key())?,
            ),
            CipherAlgorithm::Aes128Cbc => OpenCipher::Cbc128(
                CbcDecAes128::new_from_slices(&key[..16], &iv[..16]).map_err(|_| bad_key())?,
            ),
            CipherAlgorithm::Aes256Cbc => OpenCipher::Cbc256(
                CbcDecAes256::new_from_slices(&key[..32], &iv[..16]).map_err(|_| bad_key())?,
            ),
        };

        let mac_state = match (cipher.is_aead(), mac) {
            (true, _) => None,
            (false, Some((alg, key_material))) => Some(MacState::new(alg, key_material)?),
            (false, None) => {
                return Err(SkiffError::Crypto(format!(
                    "Cipher {} requires a MAC",
                    cipher.name()
                )))
            }
        };

        Ok(Self {
            cipher: cipher_state,
            algorithm: Some(cipher),
            mac: mac_state,
        })
    }

    /// Returns the padding alignment block size.
    pub fn block_size(&self) -> usize {
        self.algorithm.map_or(8, |a| a.block_size())
    }

    /// Returns true when the length field is part of the padded region.
    pub fn length_covered(&self) -> bool {
        match &self.cipher {
            OpenCipher::Plain => true,
            OpenCipher::ChaPoly(_) | OpenCipher::Gcm(_) => false,
            _ => !self.mac.as_ref().map_or(false, |m| m.algorithm.is_etm()),
        }
    }

    /// Returns the number of bytes needed from the wire to learn the packet
    /// length: one cipher block for classic ciphers, 4 bytes otherwise.
    pub fn prefix_len(&self) -> usize {
        if self.length_covered() && self.algorithm.is_some() {
            self.block_size()
        } else {
            4
        }
    }

    /// Decodes the packet length from the wire prefix.
    ///
    /// For classic ciphers the prefix block is decrypted in place (and must
    /// be passed unchanged to [`OpenContext::open`]); for
    /// `chacha20-poly1305` the prefix stays encrypted and a throwaway copy
    /// is decrypted under the length key.
    pub fn decode_length(&mut self, seq: u32, prefix: &mut [u8]) -> SkiffResult<usize> {
        debug_assert_eq!(prefix.len(), self.prefix_len());
        let etm = self.mac.as_ref().map_or(false, |m| m.algorithm.is_etm());

        match &mut self.cipher {
            OpenCipher::Plain | OpenCipher::Gcm(_) => {}
            OpenCipher::ChaPoly(chapoly) => {
                let encrypted: [u8; 4] = prefix[..4].try_into().expect("4-byte prefix");
                return Ok(chapoly.decrypt_length(seq, &encrypted) as usize);
            }
            OpenCipher::Ctr128(c) if !etm => c.apply_keystream(prefix),
            OpenCipher::Ctr256(c) if !etm => c.apply_keystream(prefix),
            OpenCipher::Cbc128(c) if !etm => decrypt_cbc_blocks(c, prefix),
            OpenCipher::Cbc256(c) if !etm => decrypt_cbc_blocks(c, prefix),
            // EtM: the 4-byte length travels in cleartext
            _ => {}
        }

        Ok(u32::from_be_bytes(prefix[..4].try_into().expect("length prefix")) as usize)
    }

    /// Returns how many bytes follow the prefix on the wire for a packet of
    /// `packet_length`: remaining ciphertext plus MAC or tag.
    pub fn tail_len(&self, packet_length: usize) -> usize {
        let mac_len = match &self.cipher {
            OpenCipher::Plain => 0,
            OpenCipher::ChaPoly(_) | OpenCipher::Gcm(_) => TAG_LEN,
            _ => self.mac.as_ref().map_or(0, |m| m.algorithm.mac_size()),
        };

        if self.length_covered() && self.algorithm.is_some() {
            // prefix consumed one whole block of length + body
            packet_length + 4 - self.block_size() + mac_len
        } else {
            packet_length + mac_len
        }
    }

    /// Verifies and decrypts one packet, given the wire prefix (as left by
    /// [`OpenContext::decode_length`]) and the tail bytes.
    ///
    /// Returns the plaintext `padding_length || payload || padding` region.
    pub fn open(
        &mut self,
        seq: u32,
        prefix: &[u8],
        mut tail: Vec<u8>,
    ) -> SkiffResult<Vec<u8>> {
        match &mut self.cipher {
            OpenCipher::Plain => {
                // prefix was the cleartext length; tail is the body
                Ok(tail)
            }
            OpenCipher::ChaPoly(chapoly) => {
                if tail.len() < TAG_LEN {
                    return Err(SkiffError::Wire("Truncated AEAD tag".to_string()));
                }
                let tag = tail.split_off(tail.len() - TAG_LEN);
                let mut packet = Vec::with_capacity(4 + tail.len());
                packet.extend_from_slice(prefix);
                packet.extend_from_slice(&tail);
                chapoly.open(seq, &mut packet, &tag)?;
                Ok(packet[4..].to_vec())
            }
            OpenCipher::Gcm(gcm) => {
                if tail.len() < TAG_LEN {
                    return Err(SkiffError::Wire("Truncated AEAD tag".to_string()));
                }
                let nonce = gcm.next_nonce();
                let plain_len = {
                    let plain = gcm
                        .key
                        .open_in_place(nonce, Aad::from(prefix), &mut tail)
                        .map_err(|_| {
                            SkiffError::Crypto("AES-GCM tag mismatch".to_string())
                        })?;
                    plain.len()
                };
                tail.truncate(plain_len);
                Ok(tail)
            }
            _ => self.open_classic(seq, prefix, tail),
        }
    }

    /// Classic cipher path: HMAC verify plus CTR/CBC decrypt, in the order
    /// the MAC mode dictates.
    fn open_classic(
        &mut self,
        seq: u32,
        prefix: &[u8],
        mut tail: Vec<u8>,
    ) -> SkiffResult<Vec<u8>> {
        let (mac_len, etm) = {
            let mac = self.mac.as_ref().expect("classic cipher has MAC");
            (mac.algorithm.mac_size(), mac.algorithm.is_etm())
        };
        if tail.len() < mac_len {
            return Err(SkiffError::Wire("Truncated MAC".to_string()));
        }
        let received_mac = tail.split_off(tail.len() - mac_len);

        if etm {
            // MAC over seq || cleartext length || ciphertext, verify first
            let ok = self
                .mac
                .as_ref()
                .expect("classic cipher has MAC")
                .verify(seq, &[prefix, &tail], &received_mac);
            if !ok {
                return Err(SkiffError::Crypto("HMAC mismatch".to_string()));
            }
            self.decrypt_classic(&mut tail);
            Ok(tail)
        } else {
            // prefix is the already-decrypted first block; decrypt the rest,
            // then MAC over seq || plaintext packet
            self.decrypt_classic(&mut tail);
            let ok = self
                .mac
                .as_ref()
                .expect("classic cipher has MAC")
                .verify(seq, &[prefix, &tail], &received_mac);
            if !ok {
                return Err(SkiffError::Crypto("HMAC mismatch".to_string()));
            }
            let mut plain = Vec::with_capacity(prefix.len() - 4 + tail.len());
            plain.extend_from_slice(&prefix[4..]);
            plain.extend_from_slice(&tail);
            Ok(plain)
        }
    }

    fn decrypt_classic(&mut self, data: &mut [u8]) {
        match &mut self.cipher {
            OpenCipher::Ctr128(c) => c.apply_keystream(data),
            OpenCipher::Ctr256(c) => c.apply_keystream(data),
            OpenCipher::Cbc128(c) => decrypt_cbc_blocks(c, data),
            OpenCipher::Cbc256(c) => decrypt_cbc_blocks(c, data),
            _ => unreachable!("not a classic cipher"),
        }
    }
}

impl std::fmt::Debug for OpenContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenContext")
            .field("algorithm", &self.algorithm.map(|a| a.name()))
            .field("mac", &self.mac.as_ref().map(|m| m.algorithm.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_names_round_trip() {
        for name in supported_ciphers() {
            let alg = CipherAlgorithm::from_name(&name).unwrap();
            assert_eq!(alg.name(), name);
        }
        assert_eq!(CipherAlgorithm::from_name("rot13"), None);
    }

    #[test]
    fn test_mac_names_round_trip() {
        for name in supported_macs() {
            let alg = MacAlgorithm::from_name(&name).unwrap();
            assert_eq!(alg.name(), name);
        }
    }

    #[test]
    fn test_etm_flag() {
        assert!(MacAlgorithm::HmacSha256Etm.is_etm());
        assert!(!MacAlgorithm::HmacSha256.is_etm());
    }

    #[test]
    fn test_classic_cipher_requires_mac() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        assert!(SealContext::new(CipherAlgorithm::Aes256Ctr, &key, &iv, None).is_err());
    }

    #[test]
    fn test_chapoly_length_decryption() {
        let key = [0x42u8; 64];
        let chapoly = ChaPoly::new(&key).unwrap();

        let mut packet = Vec::new();
        packet.extend_from_slice(&28u32.to_be_bytes());
        packet.extend_from_slice(&[0u8; 28]);

        let tag = chapoly.seal(7, &mut packet);
        let encrypted_len: [u8; 4] = packet[..4].try_into().unwrap();
        assert_eq!(chapoly.decrypt_length(7, &encrypted_len), 28);

        // and the tag verifies
        let mut body = packet.clone();
        chapoly.open(7, &mut body, &tag).unwrap();
        assert_eq!(&body[4..], &[0u8; 28]);
    }

    #[test]
    fn test_chapoly_rejects_wrong_seq() {
        let key = [0x42u8; 64];
        let chapoly = ChaPoly::new(&key).unwrap();

        let mut packet = Vec::new();
        packet.extend_from_slice(&12u32.to_be_bytes());
        packet.extend_from_slice(&[1u8; 12]);
        let tag = chapoly.seal(3, &mut packet);

        let mut tampered = packet.clone();
        assert!(chapoly.open(4, &mut tampered, &tag).is_err());
    }

    #[test]
    fn test_mac_verify_rejects_flipped_bit() {
        let mac = MacState::new(MacAlgorithm::HmacSha256, &[5u8; 32]).unwrap();
        let mut tag = mac.compute(1, &[b"data"]);
        assert!(mac.verify(1, &[b"data"], &tag));

        tag[0] ^= 0x01;
        assert!(!mac.verify(1, &[b"data"], &tag));
    }

    #[test]
    fn test_gcm_nonce_increments() {
        let key = [3u8; 16];
        let iv = [0u8; 12];
        let mut gcm = GcmState::new(&AES_128_GCM, &key, &iv).unwrap();

        let n1 = gcm.next_nonce();
        let n2 = gcm.next_nonce();
        assert_ne!(n1.as_ref(), n2.as_ref());
    }
}
