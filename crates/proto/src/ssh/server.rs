//! SSH server endpoint.
//!
//! [`SshServer`] binds a listener; each accepted connection becomes a
//! [`ServerSession`] that runs version exchange, the first key exchange
//! (signing with the injected host key), then the authentication engine
//! against the injected [`Authenticator`]. Once a user is in, the session
//! supervisor takes over and inbound session channels are driven against a
//! [`SessionHandler`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use skiff_proto::ssh::auth::StaticAuthenticator;
//! use skiff_proto::ssh::hostkey::Ed25519HostKey;
//! use skiff_proto::ssh::server::{ExecOutcome, SessionHandler, SshServer};
//! use skiff_platform::SkiffResult;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl SessionHandler for Echo {
//!     async fn handle_exec(&self, command: &str) -> SkiffResult<ExecOutcome> {
//!         Ok(ExecOutcome::success(format!("ran: {}", command).into_bytes()))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let host_key = Arc::new(Ed25519HostKey::generate());
//! let auth = Arc::new(StaticAuthenticator::new().with_password("alice", "hunter2"));
//! let server = SshServer::bind("127.0.0.1:2222", host_key, auth).await?;
//! loop {
//!     let mut session = server.accept().await?;
//!     tokio::spawn(async move {
//!         let _ = session.run(Arc::new(Echo)).await;
//!     });
//! }
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::auth::{AuthAction, AuthEngine, Authenticator, InfoResponse, AuthRequest};
use crate::ssh::channel::ChannelEvent;
use crate::ssh::codec::{PacketDecoder, PacketEncoder};
use crate::ssh::config::SshConfig;
use crate::ssh::connection::{ChannelRequestType, ChannelType, EXTENDED_DATA_STDERR};
use crate::ssh::hostkey::HostKeyProvider;
use crate::ssh::kex::{negotiate, KexInit};
use crate::ssh::kexdh::{
    build_contexts, compute_exchange_hash, Curve25519Exchange, DhGroup14Exchange,
    ExchangeHashParams, KexAlgorithm, KexDhInit, KexDhReply,
};
use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::service::{ServiceAccept, ServiceRequest, SSH_USERAUTH};
use crate::ssh::session::{ChannelHandle, NullEvents, Session, SessionParams};
use crate::ssh::transport::{Disconnect, State, TransportState};
use crate::ssh::version::Version;

/// Result of a handled exec or shell request.
#[derive(Debug, Default, Clone)]
pub struct ExecOutcome {
    /// Bytes for the client's stdout.
    pub stdout: Vec<u8>,
    /// Bytes for the client's stderr.
    pub stderr: Vec<u8>,
    /// Exit status reported to the client.
    pub exit_status: u32,
}

impl ExecOutcome {
    /// Builds a zero-status outcome with stdout only.
    pub fn success(stdout: Vec<u8>) -> Self {
        Self {
            stdout,
            stderr: Vec::new(),
            exit_status: 0,
        }
    }
}

/// Application contract for session channels.
///
/// The transport accepts the channel and the request catalog; what exec,
/// shell and subsystems actually do is the host application's business.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Handles an exec request. The outcome is written back, exit-status
    /// reported, then the channel half-closes.
    async fn handle_exec(&self, command: &str) -> SkiffResult<ExecOutcome>;

    /// Handles a shell request; return false to refuse.
    async fn handle_shell(&self) -> SkiffResult<bool> {
        Ok(false)
    }

    /// Handles a subsystem request (e.g., "sftp"); return false to refuse.
    async fn handle_subsystem(&self, _name: &str) -> SkiffResult<bool> {
        Ok(false)
    }

    /// Judges a pty-req; default accepts.
    fn handle_pty_request(&self, _term: &str) -> bool {
        true
    }

    /// Receives channel data (stdin for exec/shell models).
    async fn handle_data(&self, _data: &[u8]) -> SkiffResult<()> {
        Ok(())
    }
}

/// SSH server: a listener plus the injected host key and credential
/// policy shared by all accepted sessions.
pub struct SshServer {
    listener: TcpListener,
    config: SshConfig,
    host_key: Arc<dyn HostKeyProvider>,
    authenticator: Arc<dyn Authenticator>,
}

impl SshServer {
    /// Binds with the default configuration.
    pub async fn bind(
        addr: &str,
        host_key: Arc<dyn HostKeyProvider>,
        authenticator: Arc<dyn Authenticator>,
    ) -> SkiffResult<Self> {
        Self::bind_with_config(addr, SshConfig::default(), host_key, authenticator).await
    }

    /// Binds with an explicit configuration.
    pub async fn bind_with_config(
        addr: &str,
        config: SshConfig,
        host_key: Arc<dyn HostKeyProvider>,
        authenticator: Arc<dyn Authenticator>,
    ) -> SkiffResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening");
        Ok(Self {
            listener,
            config,
            host_key,
            authenticator,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one connection and drives it through version exchange, key
    /// exchange and authentication, bounded by the auth timeout.
    pub async fn accept(&self) -> SkiffResult<ServerSession> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(peer = %peer, "connection accepted");

        let auth_budget = Duration::from_secs(self.config.auth_timeout_seconds.max(1));
        match timeout(
            auth_budget,
            ServerSession::establish(
                stream,
                peer.to_string(),
                self.config.clone(),
                Arc::clone(&self.host_key),
                Arc::clone(&self.authenticator),
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SkiffError::Timeout(format!(
                "Connection from {} did not authenticate within {}s",
                peer, self.config.auth_timeout_seconds
            ))),
        }
    }
}

/// One authenticated server-side session.
pub struct ServerSession {
    peer_address: String,
    username: String,
    session: Arc<Session>,
    inbound_opens: tokio::sync::mpsc::UnboundedReceiver<crate::ssh::mux::InboundOpen>,
}

impl ServerSession {
    /// Full pre-session pipeline: version exchange, KEX, authentication.
    async fn establish(
        mut stream: TcpStream,
        peer_address: String,
        config: SshConfig,
        host_key: Arc<dyn HostKeyProvider>,
        authenticator: Arc<dyn Authenticator>,
    ) -> SkiffResult<Self> {
        // Version exchange: our line first, no preamble from the client
        let our_version = config.version.clone();
        our_version.write_to(&mut stream).await?;
        let peer_version = Version::read_from(&mut stream, false).await?;
        debug!(software = peer_version.software(), "client version");

        let mut transport = TransportState::new(false);
        let mut encoder = PacketEncoder::new();
        let mut decoder = PacketDecoder::new();

        let server_version = our_version.line();
        let client_version = peer_version.line();

        // KEXINIT exchange
        let our_kexinit = KexInit::from_config(&config, false);
        let our_kexinit_bytes = our_kexinit.to_bytes();
        send_packet(&mut stream, &mut encoder, &our_kexinit_bytes).await?;
        transport.transition(State::KexInitSent)?;

        let peer_kexinit_bytes = read_handshake_packet(&mut stream, &mut decoder).await?;
        let peer_kexinit = KexInit::from_bytes(&peer_kexinit_bytes)?;
        transport.transition(State::KexInProgress)?;

        let negotiated = match negotiate(&peer_kexinit, &our_kexinit) {
            Ok(n) => n,
            Err(e) => {
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
        let skip_guess = peer_kexinit.first_kex_packet_follows()
            && peer_kexinit.kex_algorithms().first().map(String::as_str)
                != Some(negotiated.kex.as_str());

        // Key agreement: wait for the client's ephemeral value
        let init_bytes = read_kex_init_packet(&mut stream, &mut decoder, skip_guess).await?;
        let dh_init = KexDhInit::from_bytes(&init_bytes, algorithm)?;

        let (server_public, shared_secret) = match algorithm {
            KexAlgorithm::Curve25519Sha256 => {
                let exchange = Curve25519Exchange::new()?;
                let public = exchange.public_key().to_vec();
                let secret = exchange.compute_shared_secret(&dh_init.public)?;
                (public, secret)
            }
            KexAlgorithm::DhGroup14Sha256 => {
                let exchange = DhGroup14Exchange::new();
                let public = exchange.public_key().to_vec();
                let secret = exchange.compute_shared_secret(&dh_init.public)?;
                (public, secret)
            }
        };

        let host_blob = host_key.public_blob();
        let exchange_hash = compute_exchange_hash(&ExchangeHashParams {
            client_version: &client_version,
            server_version: &server_version,
            client_kexinit: &peer_kexinit_bytes,
            server_kexinit: &our_kexinit_bytes,
            host_key_blob: &host_blob,
            client_public: &dh_init.public,
            server_public: &server_public,
            shared_secret: &shared_secret,
            algorithm,
        });
        let signature = host_key.sign(&exchange_hash)?;

        let reply = KexDhReply {
            host_key_blob: host_blob.clone(),
            public: server_public,
            signature,
        };
        send_packet(&mut stream, &mut encoder, &reply.to_bytes(algorithm)).await?;

        transport.freeze_session_id(&exchange_hash);
        let session_id = exchange_hash.clone();
        transport.transition(State::NewKeysPending)?;

        let (seal, open) = build_contexts(
            &negotiated,
            &shared_secret,
            &exchange_hash,
            &session_id,
            false,
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
        debug!("key exchange complete, entering authentication");

        // Authentication
        let username = run_auth(
            &mut stream,
            &mut encoder,
            &mut decoder,
            &config,
            authenticator,
            &session_id,
        )
        .await?;
        transport.transition(State::Running)?;
        info!(peer = %peer_address, user = %username, "session authenticated");

        let params = SessionParams {
            config,
            transport,
            client_version,
            server_version,
            host_key: Some(host_key),
            expected_host_blob: None,
            accepted_channel_types: vec!["session".to_string()],
        };
        let (session, inbound_opens) =
            Session::start(stream, encoder, decoder, params, Arc::new(NullEvents));

        Ok(Self {
            peer_address,
            username,
            session,
            inbound_opens,
        })
    }

    /// Returns the peer's address.
    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Returns the authenticated username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the running session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Drives the session until the transport closes, dispatching each
    /// accepted session channel against the handler.
    pub async fn run(&mut self, handler: Arc<dyn SessionHandler>) -> SkiffResult<()> {
        loop {
            tokio::select! {
                inbound = self.inbound_opens.recv() => {
                    match inbound {
                        Some(open) => {
                            if !matches!(open.channel_type, ChannelType::Session) {
                                continue;
                            }
                            let channel = self.session.attach(open);
                            let handler = Arc::clone(&handler);
                            tokio::spawn(async move {
                                if let Err(e) = drive_session_channel(channel, handler).await {
                                    warn!(error = %e, "session channel failed");
                                }
                            });
                        }
                        None => break,
                    }
                }
                _ = self.session.closed() => break,
            }
        }
        Ok(())
    }
}

/// Runs the AUTH service until success, budget exhaustion or error.
async fn run_auth(
    stream: &mut TcpStream,
    encoder: &mut PacketEncoder,
    decoder: &mut PacketDecoder,
    config: &SshConfig,
    authenticator: Arc<dyn Authenticator>,
    session_id: &[u8],
) -> SkiffResult<String> {
    // SERVICE_REQUEST(ssh-userauth) comes first
    let request_bytes = read_handshake_packet(stream, decoder).await?;
    let service_request = ServiceRequest::from_bytes(&request_bytes)?;
    if let Err(e) = service_request.check(false) {
        let disconnect = Disconnect::new(DisconnectReason::ServiceNotAvailable, &e.to_string());
        let _ = send_packet(stream, encoder, &disconnect.to_bytes()).await;
        return Err(e);
    }
    send_packet(
        stream,
        encoder,
        &ServiceAccept::new(SSH_USERAUTH).to_bytes(),
    )
    .await?;

    let mut engine = AuthEngine::new(authenticator, config.max_auth_requests);

    loop {
        let payload = read_handshake_packet(stream, decoder).await?;
        let actions = match payload.first().copied() {
            Some(50) => {
                let request = AuthRequest::from_bytes(&payload)?;
                engine.handle_request(request, session_id).await?
            }
            Some(61) => {
                let response = InfoResponse::from_bytes(&payload)?;
                engine.handle_info_response(response, session_id).await?
            }
            Some(other) => {
                return Err(SkiffError::Protocol(format!(
                    "Message {} illegal during authentication",
                    other
                )))
            }
            None => return Err(SkiffError::Wire("Empty packet payload".to_string())),
        };

        for action in actions {
            match action {
                AuthAction::Banner(banner) => {
                    send_packet(stream, encoder, &banner.to_bytes()).await?;
                }
                AuthAction::Success => {
                    send_packet(stream, encoder, &[MessageType::UserauthSuccess as u8]).await?;
                    return Ok(engine
                        .user_name()
                        .expect("authenticated engine has a user")
                        .to_string());
                }
                AuthAction::Failure(failure) => {
                    send_packet(stream, encoder, &failure.to_bytes()).await?;
                }
                AuthAction::PkOk(pk_ok) => {
                    send_packet(stream, encoder, &pk_ok.to_bytes()).await?;
                }
                AuthAction::Info(info_request) => {
                    send_packet(stream, encoder, &info_request.to_bytes()).await?;
                }
                AuthAction::Exhausted => {
                    let disconnect = Disconnect::new(
                        DisconnectReason::NoMoreAuthMethodsAvailable,
                        "Too many authentication failures",
                    );
                    let _ = send_packet(stream, encoder, &disconnect.to_bytes()).await;
                    return Err(SkiffError::Auth(
                        "Authentication budget exhausted".to_string(),
                    ));
                }
            }
        }
    }
}

/// Drives one session channel against the handler until it closes.
async fn drive_session_channel(
    mut channel: ChannelHandle,
    handler: Arc<dyn SessionHandler>,
) -> SkiffResult<()> {
    while let Some(event) = channel.next_event().await {
        match event {
            ChannelEvent::Request {
                request,
                want_reply,
            } => match request {
                ChannelRequestType::Exec { command } => {
                    debug!(command = %command, "exec request");
                    match handler.handle_exec(&command).await {
                        Ok(outcome) => {
                            if want_reply {
                                channel.reply(true).await?;
                            }
                            finish_exec(&channel, outcome).await?;
                        }
                        Err(e) => {
                            warn!(error = %e, "exec handler failed");
                            if want_reply {
                                channel.reply(false).await?;
                            }
                        }
                    }
                }
                ChannelRequestType::Shell => {
                    let accepted = handler.handle_shell().await.unwrap_or(false);
                    if want_reply {
                        channel.reply(accepted).await?;
                    }
                }
                ChannelRequestType::Subsystem { name } => {
                    let accepted = handler.handle_subsystem(&name).await.unwrap_or(false);
                    if want_reply {
                        channel.reply(accepted).await?;
                    }
                }
                ChannelRequestType::PtyReq { term, .. } => {
                    let accepted = handler.handle_pty_request(&term);
                    if want_reply {
                        channel.reply(accepted).await?;
                    }
                }
                ChannelRequestType::Env { .. } | ChannelRequestType::WindowChange { .. } => {
                    if want_reply {
                        channel.reply(true).await?;
                    }
                }
                ChannelRequestType::Signal { name } => {
                    debug!(signal = %name, "signal request");
                }
                other => {
                    debug!(request = %other.name(), "refusing channel request");
                    if want_reply {
                        channel.reply(false).await?;
                    }
                }
            },
            ChannelEvent::Data(data) => {
                handler.handle_data(&data).await?;
            }
            ChannelEvent::ExtendedData { .. } => {}
            ChannelEvent::Eof => {}
            ChannelEvent::Closed => break,
            ChannelEvent::Opened
            | ChannelEvent::OpenFailed { .. }
            | ChannelEvent::ReplySuccess
            | ChannelEvent::ReplyFailure => {}
        }
    }
    Ok(())
}

/// Writes an exec outcome back: output, exit-status, EOF, close.
async fn finish_exec(channel: &ChannelHandle, outcome: ExecOutcome) -> SkiffResult<()> {
    if !outcome.stdout.is_empty() {
        channel.send_data(&outcome.stdout).await?;
    }
    if !outcome.stderr.is_empty() {
        channel
            .send_extended_data(EXTENDED_DATA_STDERR, &outcome.stderr)
            .await?;
    }
    channel
        .send_request(
            ChannelRequestType::ExitStatus {
                status: outcome.exit_status,
            },
            false,
        )
        .await?;
    channel.send_eof().await?;
    channel.close().await?;
    Ok(())
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

/// Reads the client's kex-method packet, discarding one invalidated guess.
async fn read_kex_init_packet(
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
