//! SSH client endpoint.
//!
//! Connection lifecycle: TCP connect, version exchange, first key exchange
//! (with host key verification through the injected policy), user
//! authentication, then the session supervisor takes over the socket and
//! channels become available.
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
//! let output = client.execute("uname -a").await?;
//! println!("{}", String::from_utf8_lossy(&output.stdout));
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::auth::{
    AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest, InfoRequest, InfoResponse, Prompt,
    construct_signature_data,
};
use crate::ssh::channel::ChannelEvent;
use crate::ssh::codec::{PacketDecoder, PacketEncoder};
use crate::ssh::config::SshConfig;
use crate::ssh::connection::{ChannelRequestType, ChannelType, EXTENDED_DATA_STDERR};
use crate::ssh::hostkey::{self, Ed25519HostKey, HostKeyProvider};
use crate::ssh::kex::{negotiate, KexInit};
use crate::ssh::kexdh::{
    build_contexts, compute_exchange_hash, Curve25519Exchange, DhGroup14Exchange,
    ExchangeHashParams, KexAlgorithm, KexDhInit, KexDhReply,
};
use crate::ssh::knownhosts::{KeyVerdict, MemoryKeyStore, ServerKeyVerifier};
use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::mux::InboundOpen;
use crate::ssh::service::{ServiceAccept, ServiceRequest, SSH_CONNECTION, SSH_USERAUTH};
use crate::ssh::session::{ChannelHandle, NullEvents, Session, SessionParams};
use crate::ssh::transport::{Disconnect, State, TransportState};
use crate::ssh::version::Version;

/// Client configuration: transport settings plus the server key policy.
pub struct SshClientConfig {
    /// Transport configuration.
    pub ssh: SshConfig,
    /// Server host key policy.
    pub verifier: Arc<dyn ServerKeyVerifier>,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            ssh: SshConfig::default(),
            verifier: Arc::new(MemoryKeyStore::new()),
        }
    }
}

impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("ssh", &self.ssh)
            .field("verifier", &"<dyn ServerKeyVerifier>")
            .finish()
    }
}

/// Output of one executed command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Collected stdout bytes.
    pub stdout: Vec<u8>,
    /// Collected stderr bytes.
    pub stderr: Vec<u8>,
    /// Exit status, if the server reported one.
    pub exit_status: Option<u32>,
}

/// Pre-session connection state, consumed when the supervisor starts.
struct Handshaked {
    stream: TcpStream,
    encoder: PacketEncoder,
    decoder: PacketDecoder,
    transport: TransportState,
}

/// SSH client endpoint.
pub struct SshClient {
    server_address: String,
    config: SshClientConfig,
    client_version: String,
    server_version: String,
    server_host_blob: Vec<u8>,
    session_id: Vec<u8>,
    username: Option<String>,
    userauth_requested: bool,
    handshaked: Option<Handshaked>,
    session: Option<Arc<Session>>,
    inbound_opens: Option<mpsc::UnboundedReceiver<InboundOpen>>,
}

impl SshClient {
    /// Connects with the default configuration (trust-on-first-use host
    /// key policy).
    pub async fn connect(addr: &str) -> SkiffResult<Self> {
        Self::connect_with_config(addr, SshClientConfig::default()).await
    }

    /// Connects and runs version exchange plus the first key exchange.
    pub async fn connect_with_config(addr: &str, config: SshClientConfig) -> SkiffResult<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        info!(addr, "connected, starting version exchange");

        let our_version = config.ssh.version.clone();
        our_version.write_to(&mut stream).await?;
        let peer_version = Version::read_from(&mut stream, true).await?;
        debug!(software = peer_version.software(), "server version");

        let mut transport = TransportState::new(true);
        let mut encoder = PacketEncoder::new();
        let mut decoder = PacketDecoder::new();

        let client_version = our_version.line();
        let server_version = peer_version.line();

        // KEXINIT exchange
        let our_kexinit = KexInit::from_config(&config.ssh, true);
        let our_kexinit_bytes = our_kexinit.to_bytes();
        send_packet(&mut stream, &mut encoder, &our_kexinit_bytes).await?;
        transport.transition(State::KexInitSent)?;

        let peer_kexinit_bytes = read_handshake_packet(&mut stream, &mut decoder).await?;
        let peer_kexinit = KexInit::from_bytes(&peer_kexinit_bytes)?;
        transport.transition(State::KexInProgress)?;

        let negotiated = match negotiate(&our_kexinit, &peer_kexinit) {
            Ok(n) => n,
            Err(e) => {
                // We are the initiator of the failure report
                let disconnect =
                    Disconnect::new(DisconnectReason::KeyExchangeFailed, &e.to_string());
                let _ = send_packet(&mut stream, &mut encoder, &disconnect.to_bytes()).await;
                return Err(e);
            }
        };
        transport.set_strict_kex(negotiated.strict_kex);

        let algorithm = KexAlgorithm::from_name(&negotiated.kex).ok_or_else(|| {
            SkiffError::Negotiation(format!("Unimplemented kex method '{}'", negotiated.kex))
        })?;

        // Wrong guesses from the server are discarded below
        let skip_guess = peer_kexinit.first_kex_packet_follows()
            && peer_kexinit.kex_algorithms().first().map(String::as_str)
                != Some(negotiated.kex.as_str());

        // Key agreement
        let (client_public, reply) = match algorithm {
            KexAlgorithm::Curve25519Sha256 => {
                let exchange = Curve25519Exchange::new()?;
                let public = exchange.public_key().to_vec();
                let init = KexDhInit {
                    public: public.clone(),
                };
                send_packet(&mut stream, &mut encoder, &init.to_bytes(algorithm)).await?;

                let reply_bytes =
                    read_kex_reply(&mut stream, &mut decoder, skip_guess).await?;
                let reply = KexDhReply::from_bytes(&reply_bytes, algorithm)?;
                let secret = exchange.compute_shared_secret(&reply.public)?;
                (public, (reply, secret))
            }
            KexAlgorithm::DhGroup14Sha256 => {
                let exchange = DhGroup14Exchange::new();
                let public = exchange.public_key().to_vec();
                let init = KexDhInit {
                    public: public.clone(),
                };
                send_packet(&mut stream, &mut encoder, &init.to_bytes(algorithm)).await?;

                let reply_bytes =
                    read_kex_reply(&mut stream, &mut decoder, skip_guess).await?;
                let reply = KexDhReply::from_bytes(&reply_bytes, algorithm)?;
                let secret = exchange.compute_shared_secret(&reply.public)?;
                (public, (reply, secret))
            }
        };
        let (reply, shared_secret) = reply;

        // Judge the host key through the injected policy
        match config.verifier.verify(addr, &reply.host_key_blob) {
            KeyVerdict::Accept | KeyVerdict::Tofu => {}
            KeyVerdict::Reject => {
                let disconnect = Disconnect::new(
                    DisconnectReason::HostKeyNotVerifiable,
                    "Server key rejected by policy",
                );
                let _ = send_packet(&mut stream, &mut encoder, &disconnect.to_bytes()).await;
                return Err(SkiffError::Crypto(format!(
                    "Server key rejected: {}",
                    hostkey::fingerprint(&reply.host_key_blob)
                )));
            }
        }

        let exchange_hash = compute_exchange_hash(&ExchangeHashParams {
            client_version: &client_version,
            server_version: &server_version,
            client_kexinit: &our_kexinit_bytes,
            server_kexinit: &peer_kexinit_bytes,
            host_key_blob: &reply.host_key_blob,
            client_public: &client_public,
            server_public: &reply.public,
            shared_secret: &shared_secret,
            algorithm,
        });
        hostkey::verify_signature(&reply.host_key_blob, &exchange_hash, &reply.signature)?;

        transport.freeze_session_id(&exchange_hash);
        let session_id = exchange_hash.clone();
        transport.transition(State::NewKeysPending)?;

        // NEWKEYS: swap outbound right after sending, inbound right after
        // receiving
        let (seal, open) = build_contexts(
            &negotiated,
            &shared_secret,
            &exchange_hash,
            &session_id,
            true,
        )?;
        send_packet(&mut stream, &mut encoder, &[MessageType::NewKeys as u8]).await?;
        encoder.activate(seal, negotiated.strict_kex);

        let newkeys = read_handshake_packet(&mut stream, &mut decoder).await?;
        if newkeys != [MessageType::NewKeys as u8] {
            return Err(SkiffError::Protocol("Expected SSH_MSG_NEWKEYS".to_string()));
        }
        decoder.activate(open, negotiated.strict_kex);
        transport.mark_kex_complete();
        transport.transition(State::Auth)?;

        info!(
            fingerprint = %hostkey::fingerprint(&reply.host_key_blob),
            "key exchange complete"
        );

        Ok(Self {
            server_address: addr.to_string(),
            config,
            client_version,
            server_version,
            server_host_blob: reply.host_key_blob,
            session_id,
            username: None,
            userauth_requested: false,
            handshaked: Some(Handshaked {
                stream,
                encoder,
                decoder,
                transport,
            }),
            session: None,
            inbound_opens: None,
        })
    }

    /// Returns the remote address.
    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    /// Returns the session identifier (first exchange hash).
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// Returns the server's host key blob.
    pub fn server_host_key(&self) -> &[u8] {
        &self.server_host_blob
    }

    /// Returns the server host key fingerprint (OpenSSH SHA256 form).
    pub fn server_host_key_fingerprint(&self) -> String {
        hostkey::fingerprint(&self.server_host_blob)
    }

    /// Returns the authenticated username.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns true after successful authentication.
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    /// Returns the running session, for channel work and rekey requests.
    pub fn session(&self) -> SkiffResult<&Arc<Session>> {
        self.session
            .as_ref()
            .ok_or_else(|| SkiffError::Protocol("Not authenticated".to_string()))
    }

    /// Stream of server-initiated channel opens. Empty unless the client
    /// was configured to accept forwarded channel types.
    pub fn inbound_opens(&mut self) -> Option<&mut mpsc::UnboundedReceiver<InboundOpen>> {
        self.inbound_opens.as_mut()
    }

    /// Requests the `ssh-userauth` service. Sent once per transport; auth
    /// retries reuse the accepted service.
    async fn request_userauth(&mut self) -> SkiffResult<()> {
        if self.userauth_requested {
            return Ok(());
        }
        let hs = self.pre_session()?;
        let request = ServiceRequest::new(SSH_USERAUTH);
        send_packet(&mut hs.stream, &mut hs.encoder, &request.to_bytes()).await?;
        let reply = read_handshake_packet(&mut hs.stream, &mut hs.decoder).await?;
        let accept = ServiceAccept::from_bytes(&reply)?;
        if accept.service != SSH_USERAUTH {
            return Err(SkiffError::Protocol(format!(
                "Service accept for '{}'",
                accept.service
            )));
        }
        self.userauth_requested = true;
        Ok(())
    }

    fn pre_session(&mut self) -> SkiffResult<&mut Handshaked> {
        self.handshaked
            .as_mut()
            .ok_or_else(|| SkiffError::Protocol("Session already started".to_string()))
    }

    /// Authenticates with a password.
    pub async fn authenticate_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> SkiffResult<()> {
        self.request_userauth().await?;
        let request = AuthRequest::new(
            username,
            SSH_CONNECTION,
            AuthMethod::Password(password.to_string()),
        );
        let hs = self.pre_session()?;
        send_packet(&mut hs.stream, &mut hs.encoder, &request.to_bytes()).await?;
        self.await_auth_verdict(username).await
    }

    /// Authenticates with an Ed25519 user key: key query, then the signed
    /// request bound to the session identifier.
    pub async fn authenticate_publickey(
        &mut self,
        username: &str,
        key: &Ed25519HostKey,
    ) -> SkiffResult<()> {
        self.request_userauth().await?;
        let blob = key.public_blob();

        // Phase 1: is this key acceptable at all
        let query = AuthRequest::new(
            username,
            SSH_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: key.algorithm().to_string(),
                public_key: blob.clone(),
                signature: None,
            },
        );
        {
            let hs = self.pre_session()?;
            send_packet(&mut hs.stream, &mut hs.encoder, &query.to_bytes()).await?;
            let reply = read_handshake_packet(&mut hs.stream, &mut hs.decoder).await?;
            match reply.first().copied() {
                Some(60) => {
                    let pk_ok = AuthPkOk::from_bytes(&reply)?;
                    debug!(algorithm = %pk_ok.algorithm, "server accepted key query");
                }
                Some(51) => {
                    let failure = AuthFailure::from_bytes(&reply)?;
                    return Err(SkiffError::Auth(format!(
                        "Key not acceptable; methods that can continue: {}",
                        failure.methods.join(",")
                    )));
                }
                _ => {
                    return Err(SkiffError::Protocol(
                        "Unexpected reply to publickey query".to_string(),
                    ))
                }
            }
        }

        // Phase 2: sign session_id || request prefix
        let signed_data = construct_signature_data(
            &self.session_id,
            username,
            SSH_CONNECTION,
            key.algorithm(),
            &blob,
        );
        let signature = key.sign(&signed_data)?;
        let request = AuthRequest::new(
            username,
            SSH_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: key.algorithm().to_string(),
                public_key: blob,
                signature: Some(signature),
            },
        );
        let hs = self.pre_session()?;
        send_packet(&mut hs.stream, &mut hs.encoder, &request.to_bytes()).await?;
        self.await_auth_verdict(username).await
    }

    /// Authenticates with keyboard-interactive; `responder` answers each
    /// round of prompts.
    pub async fn authenticate_keyboard_interactive<F>(
        &mut self,
        username: &str,
        mut responder: F,
    ) -> SkiffResult<()>
    where
        F: FnMut(&str, &str, &[Prompt]) -> Vec<String> + Send,
    {
        self.request_userauth().await?;
        let request = AuthRequest::new(
            username,
            SSH_CONNECTION,
            AuthMethod::KeyboardInteractive {
                submethods: String::new(),
            },
        );
        {
            let hs = self.pre_session()?;
            send_packet(&mut hs.stream, &mut hs.encoder, &request.to_bytes()).await?;
        }

        loop {
            let reply = {
                let hs = self.pre_session()?;
                read_handshake_packet(&mut hs.stream, &mut hs.decoder).await?
            };
            match reply.first().copied() {
                Some(60) => {
                    let info = InfoRequest::from_bytes(&reply)?;
                    let responses = responder(&info.name, &info.instruction, &info.prompts);
                    let response = InfoResponse { responses };
                    let hs = self.pre_session()?;
                    send_packet(&mut hs.stream, &mut hs.encoder, &response.to_bytes()).await?;
                }
                Some(52) => {
                    return self.finish_auth(username).await;
                }
                Some(51) => {
                    let failure = AuthFailure::from_bytes(&reply)?;
                    return Err(SkiffError::Auth(format!(
                        "Authentication failed; methods that can continue: {}",
                        failure.methods.join(",")
                    )));
                }
                Some(53) => {
                    let banner = AuthBanner::from_bytes(&reply)?;
                    info!(banner = %banner.message, "server banner");
                }
                _ => {
                    return Err(SkiffError::Protocol(
                        "Unexpected packet during authentication".to_string(),
                    ))
                }
            }
        }
    }

    async fn await_auth_verdict(&mut self, username: &str) -> SkiffResult<()> {
        loop {
            let reply = {
                let hs = self.pre_session()?;
                read_handshake_packet(&mut hs.stream, &mut hs.decoder).await?
            };
            match reply.first().copied() {
                Some(52) => return self.finish_auth(username).await,
                Some(51) => {
                    let failure = AuthFailure::from_bytes(&reply)?;
                    let what = if failure.partial_success {
                        "Partial success"
                    } else {
                        "Authentication failed"
                    };
                    return Err(SkiffError::Auth(format!(
                        "{}; methods that can continue: {}",
                        what,
                        failure.methods.join(",")
                    )));
                }
                Some(53) => {
                    let banner = AuthBanner::from_bytes(&reply)?;
                    info!(banner = %banner.message, "server banner");
                }
                _ => {
                    return Err(SkiffError::Protocol(
                        "Unexpected packet during authentication".to_string(),
                    ))
                }
            }
        }
    }

    /// Transitions to `Running` and hands the socket to the supervisor.
    async fn finish_auth(&mut self, username: &str) -> SkiffResult<()> {
        let mut hs = self
            .handshaked
            .take()
            .ok_or_else(|| SkiffError::Protocol("Session already started".to_string()))?;
        hs.transport.transition(State::Running)?;
        self.username = Some(username.to_string());
        info!(username, "authenticated");

        let params = SessionParams {
            config: self.config.ssh.clone(),
            transport: hs.transport,
            client_version: self.client_version.clone(),
            server_version: self.server_version.clone(),
            host_key: None,
            expected_host_blob: Some(self.server_host_blob.clone()),
            accepted_channel_types: Vec::new(),
        };
        let (session, opens) = Session::start(
            hs.stream,
            hs.encoder,
            hs.decoder,
            params,
            Arc::new(NullEvents),
        );
        self.session = Some(session);
        self.inbound_opens = Some(opens);
        Ok(())
    }

    /// Opens a session channel for streaming use.
    pub async fn open_session(&self) -> SkiffResult<ChannelHandle> {
        self.session()?.open_channel(ChannelType::Session).await
    }

    /// Executes a command on a fresh session channel and collects its
    /// output until the channel closes.
    pub async fn execute(&mut self, command: &str) -> SkiffResult<CommandOutput> {
        let mut channel = self.open_session().await?;
        channel
            .send_request(
                ChannelRequestType::Exec {
                    command: command.to_string(),
                },
                true,
            )
            .await?;

        let mut output = CommandOutput::default();
        let mut accepted = false;

        while let Some(event) = channel.next_event().await {
            match event {
                ChannelEvent::ReplySuccess => accepted = true,
                ChannelEvent::ReplyFailure => {
                    let _ = channel.close().await;
                    return Err(SkiffError::Channel {
                        id: channel.local_id(),
                        reason: format!("Server refused exec of '{}'", command),
                    });
                }
                ChannelEvent::Data(data) => output.stdout.extend_from_slice(&data),
                ChannelEvent::ExtendedData { data_type, data } => {
                    if data_type == EXTENDED_DATA_STDERR {
                        output.stderr.extend_from_slice(&data);
                    }
                }
                ChannelEvent::Request { request, want_reply } => {
                    match request {
                        ChannelRequestType::ExitStatus { status } => {
                            output.exit_status = Some(status);
                        }
                        ChannelRequestType::ExitSignal { name, .. } => {
                            warn!(signal = %name, "remote command killed by signal");
                        }
                        _ => {}
                    }
                    if want_reply {
                        let _ = channel.reply(false).await;
                    }
                }
                ChannelEvent::Eof => {
                    let _ = channel.close().await;
                }
                ChannelEvent::Closed => break,
                ChannelEvent::Opened | ChannelEvent::OpenFailed { .. } => {}
            }
        }

        if !accepted {
            debug!("channel closed before exec was acknowledged");
        }
        Ok(output)
    }

    /// Asks the transport to rekey now.
    pub async fn request_rekey(&self) -> SkiffResult<()> {
        self.session()?.request_rekey().await
    }

    /// Sends DISCONNECT and tears the session down.
    pub async fn disconnect(&mut self) -> SkiffResult<()> {
        if let Some(session) = self.session.take() {
            let disconnect =
                Disconnect::new(DisconnectReason::ByApplication, "Client disconnecting");
            let _ = session.send(disconnect.to_bytes()).await;
            session.close_gracefully().await;
        } else if let Some(mut hs) = self.handshaked.take() {
            let disconnect =
                Disconnect::new(DisconnectReason::ByApplication, "Client disconnecting");
            let _ = send_packet(&mut hs.stream, &mut hs.encoder, &disconnect.to_bytes()).await;
        }
        Ok(())
    }
}

async fn send_packet(
    stream: &mut TcpStream,
    encoder: &mut PacketEncoder,
    payload: &[u8],
) -> SkiffResult<()> {
    let wire = encoder.encode(payload)?;
    stream.write_all(&wire).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the next substantive handshake packet, tolerating IGNORE and
/// DEBUG and surfacing DISCONNECT as the transport-closed error.
async fn read_handshake_packet(
    stream: &mut TcpStream,
    decoder: &mut PacketDecoder,
) -> SkiffResult<Vec<u8>> {
    loop {
        let payload = decoder.read_packet(stream).await?;
        match payload.first().copied() {
            Some(m) if m == MessageType::Ignore as u8 || m == MessageType::Debug as u8 => continue,
            Some(m) if m == MessageType::Disconnect as u8 => {
                return Err(Disconnect::from_bytes(&payload)?.into_error());
            }
            Some(_) => return Ok(payload),
            None => return Err(SkiffError::Wire("Empty packet payload".to_string())),
        }
    }
}

/// Like [`read_handshake_packet`], additionally discarding one guessed
/// kex packet the negotiation invalidated.
async fn read_kex_reply(
    stream: &mut TcpStream,
    decoder: &mut PacketDecoder,
    mut skip_guess: bool,
) -> SkiffResult<Vec<u8>> {
    loop {
        let payload = read_handshake_packet(stream, decoder).await?;
        if skip_guess && payload.first().map_or(false, |m| (30..=49).contains(m)) {
            skip_guess = false;
            continue;
        }
        return Ok(payload);
    }
}
