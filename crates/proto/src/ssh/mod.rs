//! SSH (Secure Shell, protocol version 2) endpoint library.
//!
//! The core is the transport and connection layer state machine defined by
//! RFC 4250-4254: binary packet framing, the key exchange handshake, the
//! encrypted and authenticated record layer, service multiplexing over the
//! authenticated pipe, and flow-controlled channels multiplexed over one
//! transport.
//!
//! # Architecture
//!
//! Layered, leaf-first:
//!
//! 1. **Wire & packet** ([`wire`], [`packet`], [`codec`]) - binary packet
//!    protocol with per-direction sequence numbers (RFC 4253 Section 6)
//! 2. **Security contexts** ([`crypto`]) - cipher/MAC registries and the
//!    directional seal/open contexts swapped at NEWKEYS
//! 3. **Key exchange** ([`kex`], [`kexdh`]) - negotiation, curve25519 and
//!    DH group14 agreement, key derivation, the frozen session identifier
//! 4. **Transport** ([`transport`], [`service`]) - the wire state machine
//!    and service routing (RFC 4253)
//! 5. **Authentication** ([`auth`]) - the `ssh-userauth` engine with an
//!    injected credential policy (RFC 4252)
//! 6. **Connection** ([`connection`], [`channel`], [`mux`]) - channels,
//!    windows, half-close, the request catalog (RFC 4254)
//! 7. **Supervision** ([`session`]) - per-session read/write tasks,
//!    timers, rekeying under live traffic, orderly shutdown
//! 8. **Endpoints** ([`client`], [`server`]) - the public APIs
//!
//! # Security Considerations
//!
//! - **Input validation**: packet sizes capped at 35000 bytes, window and
//!   packet limits enforced per channel
//! - **Constant-time comparisons**: MAC verification and password checks
//! - **Memory hygiene**: key material and passwords zeroized on drop
//! - **Modern algorithms first**: ChaCha20-Poly1305, Curve25519, Ed25519
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::client::SshClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SshClient::connect("203.0.113.7:22").await?;
//! client.authenticate_password("alice", "hunter2").await?;
//! let output = client.execute("hostname").await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kexdh;
pub mod knownhosts;
pub mod message;
pub mod mux;
pub mod packet;
pub mod server;
pub mod service;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{
    AuthEngine, AuthMethod, AuthOutcome, AuthRequest, Authenticator, StaticAuthenticator,
};
pub use channel::{ChannelEvent, ChannelState, RemoteWindow};
pub use client::{CommandOutput, SshClient, SshClientConfig};
pub use codec::{PacketDecoder, PacketEncoder};
pub use config::SshConfig;
pub use connection::{ChannelRequestType, ChannelType, GlobalRequestType};
pub use crypto::{CipherAlgorithm, MacAlgorithm, OpenContext, SealContext};
pub use hostkey::{Ed25519HostKey, HostKeyProvider};
pub use kex::{negotiate, KexInit, Negotiated, NewKeys};
pub use kexdh::{derive_key, Curve25519Exchange, DhGroup14Exchange, KexAlgorithm};
pub use knownhosts::{AcceptAllVerifier, KeyVerdict, MemoryKeyStore, ServerKeyVerifier};
pub use message::{DisconnectReason, MessageType};
pub use mux::{ChannelMux, InboundOpen};
pub use server::{ExecOutcome, ServerSession, SessionHandler, SshServer};
pub use session::{ChannelHandle, Session, SessionEvents};
pub use transport::{Disconnect, State, TransportState};
pub use version::Version;
