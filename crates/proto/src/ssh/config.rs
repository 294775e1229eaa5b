//! Transport configuration shared by client and server sessions.

use crate::ssh::crypto;
use crate::ssh::kex;
use crate::ssh::version::Version;

/// Configuration for one SSH endpoint.
///
/// Field defaults follow common OpenSSH practice: 32 KiB packets, 2 MiB
/// channel windows, rekey after 1 GiB or one hour, 120 s to authenticate,
/// at most 20 authentication attempts.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Our version string sent during version exchange.
    pub version: Version,

    /// Maximum channel packet size we advertise (default 32768).
    pub max_packet_size: u32,

    /// Initial channel window size we advertise (default 2 MiB).
    pub initial_window_size: u32,

    /// Bytes transferred on one key before rekeying (default 1 GiB).
    pub rekey_bytes: u64,

    /// Seconds on one key before rekeying (default 3600).
    pub rekey_time_seconds: u64,

    /// Seconds a connection may spend unauthenticated (default 120).
    pub auth_timeout_seconds: u64,

    /// Seconds of silence before the session is torn down; 0 disables
    /// (default 0).
    pub idle_timeout_seconds: u64,

    /// Maximum failed authentication attempts (default 20).
    pub max_auth_requests: u32,

    /// Key exchange algorithms in preference order.
    pub kex_algorithms: Vec<String>,

    /// Host key algorithms in preference order.
    pub host_key_algorithms: Vec<String>,

    /// Cipher names in preference order (both directions).
    pub ciphers: Vec<String>,

    /// MAC names in preference order (both directions).
    pub macs: Vec<String>,

    /// Compression names in preference order (both directions).
    pub compressions: Vec<String>,

    /// Depth of the outbound packet queue (default 64).
    pub out_queue_depth: usize,

    /// Seconds a graceful close waits for the queue to drain before
    /// escalating to an immediate close (default 5).
    pub close_grace_seconds: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            version: Version::default_skiff(),
            max_packet_size: 32768,
            initial_window_size: 2 * 1024 * 1024,
            rekey_bytes: 1024 * 1024 * 1024,
            rekey_time_seconds: 3600,
            auth_timeout_seconds: 120,
            idle_timeout_seconds: 0,
            max_auth_requests: 20,
            kex_algorithms: kex::supported_kex_algorithms(),
            host_key_algorithms: vec!["ssh-ed25519".to_string()],
            ciphers: crypto::supported_ciphers(),
            macs: crypto::supported_macs(),
            compressions: vec!["none".to_string()],
            out_queue_depth: 64,
            close_grace_seconds: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SshConfig::default();
        assert_eq!(config.max_packet_size, 32768);
        assert_eq!(config.initial_window_size, 2 * 1024 * 1024);
        assert_eq!(config.rekey_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.rekey_time_seconds, 3600);
        assert_eq!(config.max_auth_requests, 20);
        assert_eq!(config.idle_timeout_seconds, 0);
        assert!(!config.ciphers.is_empty());
        assert_eq!(config.compressions, vec!["none".to_string()]);
    }
}
