//! Protocol implementations for the skiff workspace.
//!
//! Currently one protocol ships here:
//!
//! - **SSH** (Secure Shell) - an RFC 4250-4254 transport and connection
//!   layer with client and server endpoints
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support (client + server)
//! - `strict-kex` - advertise and honor the strict key exchange extension
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
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! Cryptographic operations use vetted libraries (`ring`, `ed25519-dalek`,
//! the RustCrypto cipher crates); authentication paths compare secrets in
//! constant time; key material is zeroized on drop.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
