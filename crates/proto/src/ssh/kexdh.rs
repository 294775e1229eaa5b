//! Key agreement methods and key derivation (RFC 4253 Section 8, RFC 8268,
//! RFC 8731).
//!
//! Implements:
//! - `curve25519-sha256` / `curve25519-sha256@libssh.org` via X25519
//! - `diffie-hellman-group14-sha256` (2048-bit MODP group)
//! - the exchange hash H over the version lines, KEXINIT payloads, host key
//!   blob, ephemeral publics and shared secret
//! - the six-key derivation `HASH(K || H || X || session_id)` with the
//!   running-concatenation extension until enough key material exists
//!
//! All private key material is zeroized on drop.

use bytes::BytesMut;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroize;

use crate::ssh::crypto::{OpenContext, SealContext};
use crate::ssh::kex::Negotiated;
use crate::ssh::wire;

/// Diffie-Hellman Group 14 parameters (RFC 3526): a 2048-bit MODP group.
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    /// DH Group 14 prime (2048-bit)
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                 29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                 EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                 E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                 EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
                 C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
                 83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                 670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                 E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
                 DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
                 15728E5A8AACAA68FFFFFFFFFFFFFFFF",
            )
            .expect("valid hex constant"),
        )
    });

    /// DH Group 14 generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Key exchange method registry, keyed by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexAlgorithm {
    /// curve25519-sha256 (and the libssh.org alias)
    Curve25519Sha256,
    /// diffie-hellman-group14-sha256
    DhGroup14Sha256,
}

impl KexAlgorithm {
    /// Parses a kex method from its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => {
                Some(KexAlgorithm::Curve25519Sha256)
            }
            "diffie-hellman-group14-sha256" => Some(KexAlgorithm::DhGroup14Sha256),
            _ => None,
        }
    }

    /// Returns the hash output length (all methods here use SHA-256).
    pub fn hash_len(&self) -> usize {
        32
    }

    /// Returns true when the ephemeral publics are hashed as `string`
    /// (ECDH) rather than `mpint` (classic DH).
    pub fn is_ecdh(&self) -> bool {
        matches!(self, KexAlgorithm::Curve25519Sha256)
    }
}

/// Curve25519 ephemeral key exchange (RFC 8731).
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a fresh ephemeral key pair.
    pub fn new() -> SkiffResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| SkiffError::Crypto("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key
            .compute_public_key()
            .map_err(|_| SkiffError::Crypto("Failed to compute Curve25519 public key".to_string()))?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns the 32-byte public value.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret K, consuming the ephemeral key.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> SkiffResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(SkiffError::Protocol(format!(
                "Curve25519 public value must be 32 bytes, got {}",
                peer_public.len()
            )));
        }
        let peer = UnparsedPublicKey::new(&X25519, peer_public);
        agree_ephemeral(self.private_key, &peer, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| SkiffError::Crypto("Curve25519 key agreement failed".to_string()))
    }
}

/// Diffie-Hellman Group 14 ephemeral exchange (RFC 8268).
pub struct DhGroup14Exchange {
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a fresh ephemeral key pair.
    pub fn new() -> Self {
        use num_bigint::{BigUint, RandBigInt};

        let mut rng = rand::thread_rng();
        let p_minus_one = dh_group14::P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = dh_group14::G.modpow(&x, &dh_group14::P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Returns the public value `g^x mod p` in big-endian bytes.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret K, validating the peer value range.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> SkiffResult<Vec<u8>> {
        use num_bigint::BigUint;

        let y_peer = BigUint::from_bytes_be(peer_public);
        if y_peer <= BigUint::from(1u32) || y_peer >= *dh_group14::P {
            return Err(SkiffError::Protocol(
                "Invalid DH peer public key: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = y_peer.modpow(&x, &dh_group14::P);
        Ok(k.to_bytes_be())
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Inputs to the exchange hash H (RFC 4253 Section 8).
pub struct ExchangeHashParams<'a> {
    /// Client version line, without CR LF.
    pub client_version: &'a str,
    /// Server version line, without CR LF.
    pub server_version: &'a str,
    /// Client KEXINIT payload (I_C), message number included.
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload (I_S).
    pub server_kexinit: &'a [u8],
    /// Server host key blob (K_S).
    pub host_key_blob: &'a [u8],
    /// Client ephemeral public value.
    pub client_public: &'a [u8],
    /// Server ephemeral public value.
    pub server_public: &'a [u8],
    /// Shared secret K (raw big-endian magnitude).
    pub shared_secret: &'a [u8],
    /// Method that produced the publics (selects string vs mpint hashing).
    pub algorithm: KexAlgorithm,
}

/// Computes the exchange hash H with SHA-256.
pub fn compute_exchange_hash(params: &ExchangeHashParams<'_>) -> Vec<u8> {
    let mut buf = BytesMut::new();

    wire::put_str(&mut buf, params.client_version);
    wire::put_str(&mut buf, params.server_version);
    wire::put_string(&mut buf, params.client_kexinit);
    wire::put_string(&mut buf, params.server_kexinit);
    wire::put_string(&mut buf, params.host_key_blob);

    if params.algorithm.is_ecdh() {
        wire::put_string(&mut buf, params.client_public);
        wire::put_string(&mut buf, params.server_public);
    } else {
        wire::put_mpint(&mut buf, params.client_public);
        wire::put_mpint(&mut buf, params.server_public);
    }
    wire::put_mpint(&mut buf, params.shared_secret);

    let mut hasher = Sha256::new();
    hasher.update(&buf);
    hasher.finalize().to_vec()
}

/// SSH_MSG_KEXDH_INIT / SSH_MSG_KEX_ECDH_INIT (message number 30).
///
/// Carries the client's ephemeral public value: an `mpint` for classic DH,
/// a `string` for ECDH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhInit {
    /// Client ephemeral public value (raw bytes).
    pub public: Vec<u8>,
}

impl KexDhInit {
    /// Serializes to bytes for the given method.
    pub fn to_bytes(&self, algorithm: KexAlgorithm) -> Vec<u8> {
        let mut buf = BytesMut::new();
        use bytes::BufMut;
        buf.put_u8(crate::ssh::message::MessageType::KexdhInit as u8);
        if algorithm.is_ecdh() {
            wire::put_string(&mut buf, &self.public);
        } else {
            wire::put_mpint(&mut buf, &self.public);
        }
        buf.to_vec()
    }

    /// Parses from bytes for the given method.
    pub fn from_bytes(data: &[u8], algorithm: KexAlgorithm) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != crate::ssh::message::MessageType::KexdhInit as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_KEXDH_INIT".to_string(),
            ));
        }
        let mut offset = 1;
        let public = if algorithm.is_ecdh() {
            wire::get_string(data, &mut offset)?.to_vec()
        } else {
            wire::get_mpint(data, &mut offset)?.to_vec()
        };
        Ok(Self { public })
    }
}

/// SSH_MSG_KEXDH_REPLY / SSH_MSG_KEX_ECDH_REPLY (message number 31).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhReply {
    /// Server host key blob (K_S).
    pub host_key_blob: Vec<u8>,
    /// Server ephemeral public value (raw bytes).
    pub public: Vec<u8>,
    /// Signature blob over the exchange hash.
    pub signature: Vec<u8>,
}

impl KexDhReply {
    /// Serializes to bytes for the given method.
    pub fn to_bytes(&self, algorithm: KexAlgorithm) -> Vec<u8> {
        let mut buf = BytesMut::new();
        use bytes::BufMut;
        buf.put_u8(crate::ssh::message::MessageType::KexdhReply as u8);
        wire::put_string(&mut buf, &self.host_key_blob);
        if algorithm.is_ecdh() {
            wire::put_string(&mut buf, &self.public);
        } else {
            wire::put_mpint(&mut buf, &self.public);
        }
        wire::put_string(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses from bytes for the given method.
    pub fn from_bytes(data: &[u8], algorithm: KexAlgorithm) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != crate::ssh::message::MessageType::KexdhReply as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_KEXDH_REPLY".to_string(),
            ));
        }
        let mut offset = 1;
        let host_key_blob = wire::get_string(data, &mut offset)?.to_vec();
        let public = if algorithm.is_ecdh() {
            wire::get_string(data, &mut offset)?.to_vec()
        } else {
            wire::get_mpint(data, &mut offset)?.to_vec()
        };
        let signature = wire::get_string(data, &mut offset)?.to_vec();
        Ok(Self {
            host_key_blob,
            public,
            signature,
        })
    }
}

/// Derives one directional key (RFC 4253 Section 7.2).
///
/// First block is `HASH(K || H || key_type || session_id)`; while more
/// material is needed, `HASH(K || H || accumulated)` is appended.
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let mut k_mpint = BytesMut::new();
    wire::put_mpint(&mut k_mpint, shared_secret);

    let mut hasher = Sha256::new();
    hasher.update(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update([key_type]);
    hasher.update(session_id);
    let mut key: Vec<u8> = hasher.finalize().to_vec();

    while key.len() < key_length {
        let mut hasher = Sha256::new();
        hasher.update(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key);
        key.extend_from_slice(&hasher.finalize());
    }

    key.truncate(key_length);
    key
}

/// Builds the freshly keyed seal and open contexts for one side.
///
/// Key letters are fixed by direction (A/C/E client-to-server, B/D/F
/// server-to-client); `is_client` decides which direction this side seals.
pub fn build_contexts(
    negotiated: &Negotiated,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    is_client: bool,
) -> SkiffResult<(SealContext, OpenContext)> {
    let derive = |key_type: u8, len: usize| {
        derive_key(shared_secret, exchange_hash, session_id, key_type, len)
    };

    let (iv_out, key_out, mac_out, cipher_out, mac_alg_out) = if is_client {
        (b'A', b'C', b'E', negotiated.cipher_c2s, negotiated.mac_c2s)
    } else {
        (b'B', b'D', b'F', negotiated.cipher_s2c, negotiated.mac_s2c)
    };
    let (iv_in, key_in, mac_in, cipher_in, mac_alg_in) = if is_client {
        (b'B', b'D', b'F', negotiated.cipher_s2c, negotiated.mac_s2c)
    } else {
        (b'A', b'C', b'E', negotiated.cipher_c2s, negotiated.mac_c2s)
    };

    let mut seal_iv = derive(iv_out, cipher_out.iv_size().max(1));
    let mut seal_key = derive(key_out, cipher_out.key_size());
    let seal_mac_key = mac_alg_out.map(|m| derive(mac_out, m.key_size()));
    let seal = SealContext::new(
        cipher_out,
        &seal_key,
        &seal_iv,
        match (mac_alg_out, &seal_mac_key) {
            (Some(alg), Some(key)) => Some((alg, key.as_slice())),
            _ => None,
        },
    )?;
    seal_iv.zeroize();
    seal_key.zeroize();

    let mut open_iv = derive(iv_in, cipher_in.iv_size().max(1));
    let mut open_key = derive(key_in, cipher_in.key_size());
    let open_mac_key = mac_alg_in.map(|m| derive(mac_in, m.key_size()));
    let open = OpenContext::new(
        cipher_in,
        &open_key,
        &open_iv,
        match (mac_alg_in, &open_mac_key) {
            (Some(alg), Some(key)) => Some((alg, key.as_slice())),
            _ => None,
        },
    )?;
    open_iv.zeroize();
    open_key.zeroize();

    Ok((seal, open))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::config::SshConfig;
    use crate::ssh::kex::{negotiate, KexInit};

    #[test]
    fn test_curve25519_agreement() {
        let client = Curve25519Exchange::new().unwrap();
        let server = Curve25519Exchange::new().unwrap();

        let client_public = *client.public_key();
        let server_public = *server.public_key();

        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();
        assert_eq!(client_secret, server_secret);
        assert_eq!(client_secret.len(), 32);
    }

    #[test]
    fn test_curve25519_rejects_bad_length() {
        let exchange = Curve25519Exchange::new().unwrap();
        assert!(exchange.compute_shared_secret(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_dh_group14_agreement() {
        let client = DhGroup14Exchange::new();
        let server = DhGroup14Exchange::new();

        let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
        let server_secret = server.compute_shared_secret(client.public_key()).unwrap();
        assert_eq!(client_secret, server_secret);
    }

    #[test]
    fn test_dh_group14_rejects_out_of_range() {
        let exchange = DhGroup14Exchange::new();
        assert!(exchange.compute_shared_secret(&[1]).is_err());
        assert!(exchange.compute_shared_secret(&[0]).is_err());
    }

    #[test]
    fn test_kex_algorithm_names() {
        assert_eq!(
            KexAlgorithm::from_name("curve25519-sha256"),
            Some(KexAlgorithm::Curve25519Sha256)
        );
        assert_eq!(
            KexAlgorithm::from_name("curve25519-sha256@libssh.org"),
            Some(KexAlgorithm::Curve25519Sha256)
        );
        assert_eq!(
            KexAlgorithm::from_name("diffie-hellman-group14-sha256"),
            Some(KexAlgorithm::DhGroup14Sha256)
        );
        assert_eq!(KexAlgorithm::from_name("kex-strict-c-v00@openssh.com"), None);
    }

    #[test]
    fn test_exchange_hash_is_sha256_sized_and_stable() {
        let params = ExchangeHashParams {
            client_version: "SSH-2.0-Skiff_0.4.0",
            server_version: "SSH-2.0-Peer_1.0",
            client_kexinit: &[20, 1, 2, 3],
            server_kexinit: &[20, 4, 5, 6],
            host_key_blob: &[7; 51],
            client_public: &[8; 32],
            server_public: &[9; 32],
            shared_secret: &[10; 32],
            algorithm: KexAlgorithm::Curve25519Sha256,
        };
        let h1 = compute_exchange_hash(&params);
        let h2 = compute_exchange_hash(&params);
        assert_eq!(h1.len(), 32);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_exchange_hash_differs_between_methods() {
        let mk = |algorithm| ExchangeHashParams {
            client_version: "SSH-2.0-A",
            server_version: "SSH-2.0-B",
            client_kexinit: &[20],
            server_kexinit: &[20],
            host_key_blob: &[1],
            client_public: &[0x80; 32],
            server_public: &[0x80; 32],
            shared_secret: &[3; 32],
            algorithm,
        };
        // mpint encoding pads high-bit values, string encoding does not
        assert_ne!(
            compute_exchange_hash(&mk(KexAlgorithm::Curve25519Sha256)),
            compute_exchange_hash(&mk(KexAlgorithm::DhGroup14Sha256))
        );
    }

    #[test]
    fn test_kexdh_messages_round_trip_ecdh() {
        let init = KexDhInit {
            public: vec![0x80; 32],
        };
        let parsed =
            KexDhInit::from_bytes(&init.to_bytes(KexAlgorithm::Curve25519Sha256), KexAlgorithm::Curve25519Sha256)
                .unwrap();
        assert_eq!(parsed, init);

        let reply = KexDhReply {
            host_key_blob: vec![1; 51],
            public: vec![0x80; 32],
            signature: vec![2; 83],
        };
        let parsed = KexDhReply::from_bytes(
            &reply.to_bytes(KexAlgorithm::Curve25519Sha256),
            KexAlgorithm::Curve25519Sha256,
        )
        .unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn test_kexdh_init_round_trip_dh_mpint() {
        // Classic DH carries the public as an mpint; a high-bit value
        // round-trips without the sign byte leaking into the payload
        let init = KexDhInit {
            public: vec![0x80, 0x01, 0x02],
        };
        let bytes = init.to_bytes(KexAlgorithm::DhGroup14Sha256);
        let parsed = KexDhInit::from_bytes(&bytes, KexAlgorithm::DhGroup14Sha256).unwrap();
        assert_eq!(parsed, init);
    }

    #[test]
    fn test_derive_key_lengths() {
        let k = vec![0x42; 32];
        let h = vec![0x01; 32];
        let sid = vec![0x02; 32];

        for len in [16usize, 32, 48, 64, 96] {
            let key = derive_key(&k, &h, &sid, b'C', len);
            assert_eq!(key.len(), len);
        }
    }

    #[test]
    fn test_derive_key_extension_is_prefix_consistent() {
        let k = vec![0x42; 32];
        let h = vec![0x01; 32];
        let sid = vec![0x02; 32];

        let short = derive_key(&k, &h, &sid, b'D', 24);
        let long = derive_key(&k, &h, &sid, b'D', 64);
        assert_eq!(&long[..24], &short[..]);
    }

    #[test]
    fn test_derive_key_differs_per_letter() {
        let k = vec![0x42; 32];
        let h = vec![0x01; 32];
        let sid = vec![0x02; 32];
        assert_ne!(
            derive_key(&k, &h, &sid, b'A', 32),
            derive_key(&k, &h, &sid, b'B', 32)
        );
    }

    #[test]
    fn test_build_contexts_pair_interoperates() {
        let config = SshConfig::default();
        let client_init = KexInit::from_config(&config, true);
        let server_init = KexInit::from_config(&config, false);
        let negotiated = negotiate(&client_init, &server_init).unwrap();

        let k = vec![0x42; 32];
        let h = vec![0x07; 32];

        let (mut client_seal, _client_open) =
            build_contexts(&negotiated, &k, &h, &h, true).unwrap();
        let (_server_seal, mut server_open) =
            build_contexts(&negotiated, &k, &h, &h, false).unwrap();

        // Client-sealed packet opens on the server side
        let framed = crate::ssh::packet::frame(
            b"cross check",
            client_seal.block_size(),
            client_seal.length_covered(),
        )
        .unwrap();
        let wire_bytes = client_seal.seal(0, framed).unwrap();

        let prefix_len = server_open.prefix_len();
        let mut prefix = wire_bytes[..prefix_len].to_vec();
        let packet_length = server_open.decode_length(0, &mut prefix).unwrap();
        let tail = wire_bytes[prefix_len..].to_vec();
        assert_eq!(server_open.tail_len(packet_length), tail.len());

        let plain = server_open.open(0, &prefix, tail).unwrap();
        let payload = crate::ssh::packet::extract_payload(&plain).unwrap();
        assert_eq!(payload, b"cross check");
    }
}
