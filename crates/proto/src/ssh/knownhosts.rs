//! Client-side server key policy.
//!
//! The transport never decides on its own whether a host key is acceptable;
//! it hands `(remote address, public blob)` to an injected
//! [`ServerKeyVerifier`]. Three stock policies ship here: accept-all (tests
//! and tooling), reject-all, and an in-memory trust-on-first-use store.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::ssh::hostkey;

/// Verdict of a [`ServerKeyVerifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyVerdict {
    /// The key is known and trusted.
    Accept,
    /// The key is unacceptable; key exchange fails.
    Reject,
    /// The key is new; trust it and record it (trust on first use).
    Tofu,
}

/// Policy object judging server host keys.
pub trait ServerKeyVerifier: Send + Sync {
    /// Judges the server's public key blob for the given remote address.
    fn verify(&self, remote: &str, public_blob: &[u8]) -> KeyVerdict;
}

/// Accepts every key. Integration tests and throwaway tooling only.
#[derive(Debug, Default)]
pub struct AcceptAllVerifier;

impl ServerKeyVerifier for AcceptAllVerifier {
    fn verify(&self, remote: &str, public_blob: &[u8]) -> KeyVerdict {
        warn!(
            remote = remote,
            fingerprint = %hostkey::fingerprint(public_blob),
            "Accepting server key without verification"
        );
        KeyVerdict::Accept
    }
}

/// Rejects every key.
#[derive(Debug, Default)]
pub struct RejectAllVerifier;

impl ServerKeyVerifier for RejectAllVerifier {
    fn verify(&self, _remote: &str, _public_blob: &[u8]) -> KeyVerdict {
        KeyVerdict::Reject
    }
}

/// In-memory trust-on-first-use key store.
///
/// The first key seen for an address is recorded and later connections must
/// present the same key. Persistence to a known_hosts file is the host
/// application's concern; it can pre-seed the store with
/// [`MemoryKeyStore::insert`].
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    known: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds the store with a trusted key for an address.
    pub fn insert(&self, remote: &str, public_blob: Vec<u8>) {
        self.known
            .lock()
            .expect("known-hosts lock")
            .insert(remote.to_string(), public_blob);
    }

    /// Returns the recorded key for an address, if any.
    pub fn get(&self, remote: &str) -> Option<Vec<u8>> {
        self.known
            .lock()
            .expect("known-hosts lock")
            .get(remote)
            .cloned()
    }
}

impl ServerKeyVerifier for MemoryKeyStore {
    fn verify(&self, remote: &str, public_blob: &[u8]) -> KeyVerdict {
        let mut known = self.known.lock().expect("known-hosts lock");
        match known.get(remote) {
            Some(recorded) if recorded == public_blob => KeyVerdict::Accept,
            Some(_) => {
                warn!(
                    remote = remote,
                    fingerprint = %hostkey::fingerprint(public_blob),
                    "Server key changed since first contact"
                );
                KeyVerdict::Reject
            }
            None => {
                info!(
                    remote = remote,
                    fingerprint = %hostkey::fingerprint(public_blob),
                    "Recording server key on first use"
                );
                known.insert(remote.to_string(), public_blob.to_vec());
                KeyVerdict::Tofu
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_all() {
        assert_eq!(
            AcceptAllVerifier.verify("example:22", &[1, 2, 3]),
            KeyVerdict::Accept
        );
    }

    #[test]
    fn test_reject_all() {
        assert_eq!(
            RejectAllVerifier.verify("example:22", &[1, 2, 3]),
            KeyVerdict::Reject
        );
    }

    #[test]
    fn test_tofu_then_accept() {
        let store = MemoryKeyStore::new();
        assert_eq!(store.verify("h:22", &[1, 2, 3]), KeyVerdict::Tofu);
        assert_eq!(store.verify("h:22", &[1, 2, 3]), KeyVerdict::Accept);
    }

    #[test]
    fn test_changed_key_rejected() {
        let store = MemoryKeyStore::new();
        store.insert("h:22", vec![1, 2, 3]);
        assert_eq!(store.verify("h:22", &[9, 9, 9]), KeyVerdict::Reject);
    }

    #[test]
    fn test_addresses_are_independent() {
        let store = MemoryKeyStore::new();
        store.insert("a:22", vec![1]);
        assert_eq!(store.verify("b:22", &[2]), KeyVerdict::Tofu);
        assert_eq!(store.verify("a:22", &[1]), KeyVerdict::Accept);
    }
}
