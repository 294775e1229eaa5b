//! SSH key exchange negotiation (RFC 4253 Section 7).
//!
//! This module carries the SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS codecs and
//! the algorithm negotiation rule: for every field, take the client's list
//! and pick the first entry that also appears on the server's list. A
//! mismatch on the kex or host key field is fatal.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let kexinit = KexInit::new_default();
//! assert!(kexinit
//!     .kex_algorithms()
//!     .contains(&"curve25519-sha256".to_string()));
//!
//! let newkeys = NewKeys::new();
//! assert_eq!(newkeys.to_bytes(), vec![21]);
//! ```

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::config::SshConfig;
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::message::MessageType;
use crate::ssh::wire;

/// Strict KEX marker a client places in its kex list (OpenSSH extension).
pub const STRICT_KEX_CLIENT: &str = "kex-strict-c-v00@openssh.com";

/// Strict KEX marker a server places in its kex list.
pub const STRICT_KEX_SERVER: &str = "kex-strict-s-v00@openssh.com";

/// Marker-only pseudo-algorithms that must never win negotiation.
const MARKER_ONLY: &[&str] = &[STRICT_KEX_CLIENT, STRICT_KEX_SERVER, "ext-info-c", "ext-info-s"];

/// Key exchange method names skiff implements, in preference order.
pub fn supported_kex_algorithms() -> Vec<String> {
    [
        "curve25519-sha256",
        "curve25519-sha256@libssh.org",
        "diffie-hellman-group14-sha256",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// A 16-byte random cookie followed by ten name-lists, a guess flag and a
/// reserved field. The exact payload bytes are hashed into the exchange
/// hash, so [`KexInit::to_bytes`] output must be kept for later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT from an endpoint configuration.
    ///
    /// `is_client` selects which strict-kex marker is appended when the
    /// `strict-kex` feature is enabled.
    pub fn from_config(config: &SshConfig, is_client: bool) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        #[allow(unused_mut)]
        let mut kex_algorithms = config.kex_algorithms.clone();
        #[cfg(feature = "strict-kex")]
        kex_algorithms.push(
            if is_client {
                STRICT_KEX_CLIENT
            } else {
                STRICT_KEX_SERVER
            }
            .to_string(),
        );
        #[cfg(not(feature = "strict-kex"))]
        let _ = is_client;

        Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms: config.host_key_algorithms.clone(),
            encryption_algorithms_client_to_server: config.ciphers.clone(),
            encryption_algorithms_server_to_client: config.ciphers.clone(),
            mac_algorithms_client_to_server: config.macs.clone(),
            mac_algorithms_server_to_client: config.macs.clone(),
            compression_algorithms_client_to_server: config.compressions.clone(),
            compression_algorithms_server_to_client: config.compressions.clone(),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Creates a KEXINIT with the default algorithm sets.
    pub fn new_default() -> Self {
        Self::from_config(&SshConfig::default(), true)
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the kex algorithm list.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the host key algorithm list.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the client-to-server cipher list.
    pub fn ciphers_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the server-to-client cipher list.
    pub fn ciphers_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns whether the peer announced a guessed first kex packet.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Returns true if the list carries the given strict-kex marker.
    pub fn has_strict_marker(&self, marker: &str) -> bool {
        self.kex_algorithms.iter().any(|a| a == marker)
    }

    /// Serializes to the full message payload (starting with the message
    /// number). These exact bytes enter the exchange hash as I_C or I_S.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        wire::put_name_list(&mut buf, &self.kex_algorithms);
        wire::put_name_list(&mut buf, &self.server_host_key_algorithms);
        wire::put_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        wire::put_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        wire::put_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        wire::put_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        wire::put_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        wire::put_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        wire::put_name_list(&mut buf, &self.languages_client_to_server);
        wire::put_name_list(&mut buf, &self.languages_server_to_client);

        wire::put_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0); // reserved

        buf.to_vec()
    }

    /// Parses a KEXINIT message payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::KexInit as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_KEXINIT".to_string(),
            ));
        }

        let mut offset = 1;
        if data.len() < offset + 16 {
            return Err(SkiffError::Wire("Truncated KEXINIT cookie".to_string()));
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[offset..offset + 16]);
        offset += 16;

        let kex_algorithms = wire::get_name_list(data, &mut offset)?;
        let server_host_key_algorithms = wire::get_name_list(data, &mut offset)?;
        let encryption_algorithms_client_to_server = wire::get_name_list(data, &mut offset)?;
        let encryption_algorithms_server_to_client = wire::get_name_list(data, &mut offset)?;
        let mac_algorithms_client_to_server = wire::get_name_list(data, &mut offset)?;
        let mac_algorithms_server_to_client = wire::get_name_list(data, &mut offset)?;
        let compression_algorithms_client_to_server = wire::get_name_list(data, &mut offset)?;
        let compression_algorithms_server_to_client = wire::get_name_list(data, &mut offset)?;
        let languages_client_to_server = wire::get_name_list(data, &mut offset)?;
        let languages_server_to_client = wire::get_name_list(data, &mut offset)?;

        let first_kex_packet_follows = wire::get_bool(data, &mut offset)?;
        let _reserved = wire::get_u32(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a NEWKEYS message.
    pub fn new() -> Self {
        Self
    }

    /// Serializes to bytes (single message number byte).
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message payload.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data != [MessageType::NewKeys as u8] {
            return Err(SkiffError::Protocol("Expected SSH_MSG_NEWKEYS".to_string()));
        }
        Ok(Self)
    }
}

impl Default for NewKeys {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of algorithm negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Chosen key exchange method name.
    pub kex: String,
    /// Chosen host key algorithm name.
    pub host_key: String,
    /// Cipher, client to server.
    pub cipher_c2s: CipherAlgorithm,
    /// Cipher, server to client.
    pub cipher_s2c: CipherAlgorithm,
    /// MAC, client to server (None for AEAD ciphers).
    pub mac_c2s: Option<MacAlgorithm>,
    /// MAC, server to client (None for AEAD ciphers).
    pub mac_s2c: Option<MacAlgorithm>,
    /// Compression, client to server (only "none" is shipped).
    pub compression_c2s: String,
    /// Compression, server to client.
    pub compression_s2c: String,
    /// Both sides advertised strict KEX.
    pub strict_kex: bool,
}

/// Picks the first client entry that also appears on the server's list.
fn first_match(client: &[String], server: &[String], what: &str) -> SkiffResult<String> {
    client
        .iter()
        .find(|c| !MARKER_ONLY.contains(&c.as_str()) && server.contains(c))
        .cloned()
        .ok_or_else(|| {
            SkiffError::Negotiation(format!(
                "No common {}: client offers [{}], server offers [{}]",
                what,
                client.join(","),
                server.join(",")
            ))
        })
}

/// Runs the negotiation rule over a client and a server KEXINIT.
///
/// The kex and host key fields are fatal on mismatch; a missing MAC match
/// is tolerated when the direction's cipher is AEAD.
pub fn negotiate(client: &KexInit, server: &KexInit) -> SkiffResult<Negotiated> {
    let kex = first_match(
        &client.kex_algorithms,
        &server.kex_algorithms,
        "key exchange algorithm",
    )?;
    let host_key = first_match(
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
        "host key algorithm",
    )?;

    let cipher_c2s_name = first_match(
        &client.encryption_algorithms_client_to_server,
        &server.encryption_algorithms_client_to_server,
        "client-to-server cipher",
    )?;
    let cipher_s2c_name = first_match(
        &client.encryption_algorithms_server_to_client,
        &server.encryption_algorithms_server_to_client,
        "server-to-client cipher",
    )?;

    let cipher_c2s = CipherAlgorithm::from_name(&cipher_c2s_name).ok_or_else(|| {
        SkiffError::Negotiation(format!("Unsupported cipher '{}'", cipher_c2s_name))
    })?;
    let cipher_s2c = CipherAlgorithm::from_name(&cipher_s2c_name).ok_or_else(|| {
        SkiffError::Negotiation(format!("Unsupported cipher '{}'", cipher_s2c_name))
    })?;

    let mac_c2s = negotiate_mac(
        cipher_c2s,
        &client.mac_algorithms_client_to_server,
        &server.mac_algorithms_client_to_server,
        "client-to-server MAC",
    )?;
    let mac_s2c = negotiate_mac(
        cipher_s2c,
        &client.mac_algorithms_server_to_client,
        &server.mac_algorithms_server_to_client,
        "server-to-client MAC",
    )?;

    let compression_c2s = first_match(
        &client.compression_algorithms_client_to_server,
        &server.compression_algorithms_client_to_server,
        "client-to-server compression",
    )?;
    let compression_s2c = first_match(
        &client.compression_algorithms_server_to_client,
        &server.compression_algorithms_server_to_client,
        "server-to-client compression",
    )?;

    let strict_kex = client.has_strict_marker(STRICT_KEX_CLIENT)
        && server.has_strict_marker(STRICT_KEX_SERVER);

    Ok(Negotiated {
        kex,
        host_key,
        cipher_c2s,
        cipher_s2c,
        mac_c2s,
        mac_s2c,
        compression_c2s,
        compression_s2c,
        strict_kex,
    })
}

fn negotiate_mac(
    cipher: CipherAlgorithm,
    client: &[String],
    server: &[String],
    what: &str,
) -> SkiffResult<Option<MacAlgorithm>> {
    if cipher.is_aead() {
        // MAC lists still travel in KEXINIT but the AEAD tag replaces them
        return Ok(None);
    }
    let name = first_match(client, server, what)?;
    let mac = MacAlgorithm::from_name(&name)
        .ok_or_else(|| SkiffError::Negotiation(format!("Unsupported MAC '{}'", name)))?;
    Ok(Some(mac))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kexinit_round_trip() {
        let kexinit = KexInit::new_default();
        let bytes = kexinit.to_bytes();
        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, kexinit);
    }

    #[test]
    fn test_kexinit_payload_starts_with_msg_number() {
        let bytes = KexInit::new_default().to_bytes();
        assert_eq!(bytes[0], 20);
        assert!(bytes.len() > 17);
    }

    #[test]
    fn test_newkeys_round_trip() {
        let bytes = NewKeys::new().to_bytes();
        assert_eq!(bytes, vec![21]);
        NewKeys::from_bytes(&bytes).unwrap();
        assert!(NewKeys::from_bytes(&[20]).is_err());
    }

    #[test]
    fn test_negotiate_defaults_succeed() {
        let config = SshConfig::default();
        let client = KexInit::from_config(&config, true);
        let server = KexInit::from_config(&config, false);

        let negotiated = negotiate(&client, &server).unwrap();
        assert_eq!(negotiated.kex, "curve25519-sha256");
        assert_eq!(negotiated.host_key, "ssh-ed25519");
        assert_eq!(
            negotiated.cipher_c2s,
            CipherAlgorithm::ChaCha20Poly1305
        );
        assert!(negotiated.mac_c2s.is_none());
        assert_eq!(negotiated.compression_c2s, "none");
    }

    #[test]
    fn test_negotiate_prefers_client_order() {
        let mut client_cfg = SshConfig::default();
        client_cfg.ciphers = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
        let mut server_cfg = SshConfig::default();
        server_cfg.ciphers = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];

        let client = KexInit::from_config(&client_cfg, true);
        let server = KexInit::from_config(&server_cfg, false);
        let negotiated = negotiate(&client, &server).unwrap();

        // Client's first preference wins
        assert_eq!(negotiated.cipher_c2s, CipherAlgorithm::Aes256Ctr);
        assert!(negotiated.mac_c2s.is_some());
    }

    #[test]
    fn test_negotiate_disjoint_ciphers_fails() {
        let mut client_cfg = SshConfig::default();
        client_cfg.ciphers = vec!["aes128-cbc".to_string()];
        let mut server_cfg = SshConfig::default();
        server_cfg.ciphers = vec!["aes256-ctr".to_string()];

        let client = KexInit::from_config(&client_cfg, true);
        let server = KexInit::from_config(&server_cfg, false);

        let err = negotiate(&client, &server).unwrap_err();
        assert!(matches!(err, SkiffError::Negotiation(_)));
    }

    #[test]
    fn test_negotiate_disjoint_kex_fails() {
        let mut client_cfg = SshConfig::default();
        client_cfg.kex_algorithms = vec!["curve25519-sha256".to_string()];
        let mut server_cfg = SshConfig::default();
        server_cfg.kex_algorithms = vec!["diffie-hellman-group14-sha256".to_string()];

        let client = KexInit::from_config(&client_cfg, true);
        let server = KexInit::from_config(&server_cfg, false);
        assert!(negotiate(&client, &server).is_err());
    }

    #[test]
    fn test_strict_marker_never_wins() {
        let mut client_cfg = SshConfig::default();
        client_cfg.kex_algorithms = vec![
            STRICT_KEX_CLIENT.to_string(),
            "curve25519-sha256".to_string(),
        ];
        let mut server_cfg = SshConfig::default();
        server_cfg.kex_algorithms = vec![
            STRICT_KEX_CLIENT.to_string(),
            "curve25519-sha256".to_string(),
        ];

        let client = KexInit::from_config(&client_cfg, true);
        let server = KexInit::from_config(&server_cfg, false);
        let negotiated = negotiate(&client, &server).unwrap();
        assert_eq!(negotiated.kex, "curve25519-sha256");
    }

    #[cfg(feature = "strict-kex")]
    #[test]
    fn test_strict_kex_detected_when_both_advertise() {
        let config = SshConfig::default();
        let client = KexInit::from_config(&config, true);
        let server = KexInit::from_config(&config, false);
        let negotiated = negotiate(&client, &server).unwrap();
        assert!(negotiated.strict_kex);
    }
}
