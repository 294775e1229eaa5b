//! Session supervisor: owns the socket, the codec and the per-session
//! tasks.
//!
//! Two tasks run per session: a read task that deframes, checks legality
//! against the transport state and dispatches, and a write task that
//! drains a bounded outbound queue through the packet encoder. A third,
//! lightweight maintenance task drives the timers (rekey thresholds, idle
//! keepalive).
//!
//! The encoder mutex is the single lock guarding the outbound security
//! context and sequence number; the NEWKEYS context swap happens inside
//! the write task under that lock, immediately after NEWKEYS itself is
//! sealed, so the swap lands exactly at the packet boundary. The inbound
//! swap happens on the read task right after NEWKEYS is opened.
//!
//! Rekeys are driven entirely by the read task (with the maintenance task
//! only enqueueing the initial KEXINIT), so channel traffic keeps flowing
//! while the new keys are agreed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::channel::{ChannelEvent, RemoteWindow};
use crate::ssh::codec::{PacketDecoder, PacketEncoder};
use crate::ssh::config::SshConfig;
use crate::ssh::connection::{ChannelData, ChannelExtendedData, ChannelRequestType, ChannelType, GlobalRequest, GlobalRequestType};
use crate::ssh::crypto::{OpenContext, SealContext};
use crate::ssh::hostkey::HostKeyProvider;
use crate::ssh::kex::{negotiate, KexInit, Negotiated};
use crate::ssh::kexdh::{
    build_contexts, compute_exchange_hash, Curve25519Exchange, DhGroup14Exchange,
    ExchangeHashParams, KexAlgorithm, KexDhInit, KexDhReply,
};
use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::mux::{ChannelMux, InboundOpen};
use crate::ssh::transport::{self, Disconnect, State, TransportState};

/// Event callbacks invoked from the read task. Implementations must be
/// quick; they may enqueue writes but must not block.
pub trait SessionEvents: Send + Sync {
    /// A non-channel packet arrived that the supervisor does not consume
    /// (global request replies and the like).
    fn on_packet(&self, _payload: &[u8]) {}

    /// A global request arrived; return true to answer REQUEST_SUCCESS.
    fn on_global_request(&self, _request: &GlobalRequestType) -> bool {
        false
    }

    /// The session hit an error (channel-level or fatal).
    fn on_error(&self, _error: &SkiffError) {}

    /// The session reached its terminal state.
    fn on_closed(&self) {}
}

/// No-op event sink.
#[derive(Debug, Default)]
pub struct NullEvents;

impl SessionEvents for NullEvents {}

/// Everything the supervisor needs from the finished handshake.
pub struct SessionParams {
    /// Endpoint configuration.
    pub config: SshConfig,
    /// Transport state machine, already in `Running`.
    pub transport: TransportState,
    /// Client version line (exchange hash input for rekeys).
    pub client_version: String,
    /// Server version line.
    pub server_version: String,
    /// Host key, server side only (signs rekeys).
    pub host_key: Option<Arc<dyn HostKeyProvider>>,
    /// Host key blob pinned at the first KEX, client side only; rekeys
    /// must present the same key.
    pub expected_host_blob: Option<Vec<u8>>,
    /// Channel types we confirm when the peer opens them.
    pub accepted_channel_types: Vec<String>,
}

pub(crate) enum Outbound {
    /// Seal and write one packet.
    Packet(Vec<u8>),
    /// Seal and write NEWKEYS, then swap the outbound context before the
    /// next packet.
    NewKeys {
        ctx: SealContext,
        reset_seq: bool,
    },
    /// Ack once everything enqueued before this marker hit the socket.
    Drain(oneshot::Sender<()>),
}

enum RekeySlot {
    Idle,
    OursSent { our_kexinit: Vec<u8> },
}

struct Shared {
    config: SshConfig,
    transport: StdMutex<TransportState>,
    encoder: Mutex<PacketEncoder>,
    mux: Mutex<ChannelMux>,
    rekey: Mutex<RekeySlot>,
    last_read: StdMutex<Instant>,
    closed: watch::Sender<bool>,
    closed_flag: AtomicBool,
    events: Arc<dyn SessionEvents>,
    client_version: String,
    server_version: String,
    host_key: Option<Arc<dyn HostKeyProvider>>,
    expected_host_blob: Option<Vec<u8>>,
    session_id: Vec<u8>,
    is_client: bool,
}

impl Shared {
    async fn teardown(&self, error: Option<&SkiffError>) {
        if self.closed_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(e) = error {
            self.events.on_error(e);
        }
        {
            let mut transport = self.transport.lock().expect("transport lock");
            let _ = transport.transition(State::Closed);
        }
        self.mux.lock().await.close_all();
        self.events.on_closed();
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::SeqCst)
    }
}

/// A running SSH session: the authenticated transport plus its channels.
pub struct Session {
    shared: Arc<Shared>,
    out_tx: mpsc::Sender<Outbound>,
    read_task: StdMutex<Option<JoinHandle<()>>>,
    write_task: StdMutex<Option<JoinHandle<()>>>,
    maintenance_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Spawns the read, write and maintenance tasks over an authenticated
    /// transport and returns the session plus the stream of inbound
    /// channel opens.
    pub fn start(
        stream: TcpStream,
        encoder: PacketEncoder,
        decoder: PacketDecoder,
        params: SessionParams,
        events: Arc<dyn SessionEvents>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundOpen>) {
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel(params.config.out_queue_depth);
        let (closed_tx, _) = watch::channel(false);

        let session_id = params
            .transport
            .session_id()
            .expect("session started before first KEX")
            .to_vec();
        let is_client = params.transport.is_client();

        let (mux, inbound_opens) = ChannelMux::new(
            params.config.initial_window_size,
            params.config.max_packet_size,
            params.accepted_channel_types,
        );

        let shared = Arc::new(Shared {
            config: params.config,
            transport: StdMutex::new(params.transport),
            encoder: Mutex::new(encoder),
            mux: Mutex::new(mux),
            rekey: Mutex::new(RekeySlot::Idle),
            last_read: StdMutex::new(Instant::now()),
            closed: closed_tx,
            closed_flag: AtomicBool::new(false),
            events,
            client_version: params.client_version,
            server_version: params.server_version,
            host_key: params.host_key,
            expected_host_blob: params.expected_host_blob,
            session_id,
            is_client,
        });

        let write_task = tokio::spawn(write_loop(
            Arc::clone(&shared),
            write_half,
            out_rx,
        ));
        let read_task = tokio::spawn(read_loop(
            Arc::clone(&shared),
            read_half,
            decoder,
            out_tx.clone(),
        ));
        let maintenance_task = tokio::spawn(maintenance_loop(
            Arc::clone(&shared),
            out_tx.clone(),
        ));

        let session = Arc::new(Self {
            shared,
            out_tx,
            read_task: StdMutex::new(Some(read_task)),
            write_task: StdMutex::new(Some(write_task)),
            maintenance_task: StdMutex::new(Some(maintenance_task)),
        });
        (session, inbound_opens)
    }

    /// Returns the immutable session identifier.
    pub fn session_id(&self) -> &[u8] {
        &self.shared.session_id
    }

    /// Returns true once the session reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Waits until the session reaches its terminal state.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Enqueues a raw packet. Suspends when the outbound queue is full.
    pub async fn send(&self, payload: Vec<u8>) -> SkiffResult<()> {
        self.out_tx
            .send(Outbound::Packet(payload))
            .await
            .map_err(|_| SkiffError::Disconnected {
                code: DisconnectReason::ConnectionLost as u32,
                message: "Session closed".to_string(),
            })
    }

    /// Requests an immediate rekey.
    pub async fn request_rekey(&self) -> SkiffResult<()> {
        ensure_kexinit_sent(&self.shared, &self.out_tx).await?;
        Ok(())
    }

    /// Opens an outbound channel and waits for the peer's verdict.
    pub async fn open_channel(&self, channel_type: ChannelType) -> SkiffResult<ChannelHandle> {
        let (local_id, mut events, open_packet) = {
            let mut mux = self.shared.mux.lock().await;
            mux.open_channel(channel_type)
        };
        self.send(open_packet).await?;

        match events.recv().await {
            Some(ChannelEvent::Opened) => {
                let (remote_id, remote_window, remote_max_packet) = self
                    .shared
                    .mux
                    .lock()
                    .await
                    .channel_info(local_id)
                    .ok_or(SkiffError::Channel {
                        id: local_id,
                        reason: "Channel vanished during open".to_string(),
                    })?;
                Ok(ChannelHandle {
                    local_id,
                    remote_id,
                    remote_window,
                    remote_max_packet,
                    events,
                    out_tx: self.out_tx.clone(),
                    shared: Arc::clone(&self.shared),
                })
            }
            Some(ChannelEvent::OpenFailed {
                reason,
                description,
            }) => Err(SkiffError::Channel {
                id: local_id,
                reason: format!("Open failed ({}): {}", reason, description),
            }),
            _ => Err(SkiffError::Channel {
                id: local_id,
                reason: "Session closed during open".to_string(),
            }),
        }
    }

    /// Wraps an accepted inbound channel into a handle.
    pub fn attach(&self, inbound: InboundOpen) -> ChannelHandle {
        ChannelHandle {
            local_id: inbound.local_id,
            remote_id: inbound.remote_id,
            remote_window: inbound.remote_window,
            remote_max_packet: inbound.remote_max_packet,
            events: inbound.events,
            out_tx: self.out_tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drains the outbound queue (bounded by the configured grace period),
    /// then closes.
    pub async fn close_gracefully(&self) {
        let grace = Duration::from_secs(self.shared.config.close_grace_seconds);
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.out_tx.send(Outbound::Drain(ack_tx)).await.is_ok()
            && timeout(grace, ack_rx).await.is_err()
        {
            warn!("graceful close timed out, escalating");
        }
        self.close_immediately().await;
    }

    /// Cancels the tasks, drops the queue and moves to `Closed`.
    pub async fn close_immediately(&self) {
        self.shared.teardown(None).await;
        for slot in [&self.read_task, &self.write_task, &self.maintenance_task] {
            if let Some(handle) = slot.lock().expect("task slot lock").take() {
                handle.abort();
            }
        }
    }
}

/// Application handle to one channel.
pub struct ChannelHandle {
    local_id: u32,
    remote_id: u32,
    remote_window: Arc<RemoteWindow>,
    remote_max_packet: u32,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    out_tx: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
}

impl ChannelHandle {
    /// Returns the local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Receives the next channel event in wire order.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    fn chunk_cap(&self) -> u32 {
        self.remote_max_packet.min(32768).max(1)
    }

    /// Sends data, chunked to the peer's maximum packet size and parked
    /// while the remote window is empty. Blocked sends on this channel do
    /// not block other channels.
    pub async fn send_data(&self, data: &[u8]) -> SkiffResult<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            let want = self.chunk_cap().min((data.len() - offset) as u32);
            let take = self
                .remote_window
                .reserve(want)
                .await
                .ok_or(SkiffError::Channel {
                    id: self.local_id,
                    reason: "Channel closed while sending".to_string(),
                })? as usize;

            let packet = ChannelData::new(
                self.remote_id,
                data[offset..offset + take].to_vec(),
            )
            .to_bytes();
            self.enqueue(packet).await?;
            offset += take;
        }
        Ok(())
    }

    /// Sends extended (stderr) data under the same flow control.
    pub async fn send_extended_data(&self, data_type: u32, data: &[u8]) -> SkiffResult<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            let want = self.chunk_cap().min((data.len() - offset) as u32);
            let take = self
                .remote_window
                .reserve(want)
                .await
                .ok_or(SkiffError::Channel {
                    id: self.local_id,
                    reason: "Channel closed while sending".to_string(),
                })? as usize;

            let packet = ChannelExtendedData {
                recipient_channel: self.remote_id,
                data_type,
                data: data[offset..offset + take].to_vec(),
            }
            .to_bytes();
            self.enqueue(packet).await?;
            offset += take;
        }
        Ok(())
    }

    /// Sends a channel request.
    pub async fn send_request(
        &self,
        request: ChannelRequestType,
        want_reply: bool,
    ) -> SkiffResult<()> {
        let packet = {
            let mut mux = self.shared.mux.lock().await;
            mux.request(self.local_id, request, want_reply)?
        };
        self.enqueue(packet).await
    }

    /// Replies to a peer request on this channel.
    pub async fn reply(&self, success: bool) -> SkiffResult<()> {
        let packet = if success {
            crate::ssh::connection::ChannelSuccess {
                recipient_channel: self.remote_id,
            }
            .to_bytes()
        } else {
            crate::ssh::connection::ChannelFailure {
                recipient_channel: self.remote_id,
            }
            .to_bytes()
        };
        self.enqueue(packet).await
    }

    /// Signals end of data in our direction. The other direction stays
    /// usable.
    pub async fn send_eof(&self) -> SkiffResult<()> {
        let packet = {
            let mut mux = self.shared.mux.lock().await;
            mux.eof(self.local_id)?
        };
        self.enqueue(packet).await
    }

    /// Initiates channel teardown.
    pub async fn close(&self) -> SkiffResult<()> {
        let packet = {
            let mut mux = self.shared.mux.lock().await;
            mux.close(self.local_id)?
        };
        match packet {
            Some(p) => self.enqueue(p).await,
            None => Ok(()),
        }
    }

    async fn enqueue(&self, packet: Vec<u8>) -> SkiffResult<()> {
        self.out_tx
            .send(Outbound::Packet(packet))
            .await
            .map_err(|_| SkiffError::Channel {
                id: self.local_id,
                reason: "Session closed".to_string(),
            })
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Outbound>,
) {
    let mut closed_rx = shared.closed.subscribe();
    loop {
        let command = tokio::select! {
            biased;
            command = out_rx.recv() => match command {
                Some(c) => c,
                None => break,
            },
            _ = closed_rx.changed() => break,
        };

        let result = match command {
            Outbound::Packet(payload) => {
                let wire = {
                    let mut encoder = shared.encoder.lock().await;
                    encoder.encode(&payload)
                };
                match wire {
                    Ok(bytes) => write_half.write_all(&bytes).await.map_err(SkiffError::from),
                    Err(e) => Err(e),
                }
            }
            Outbound::NewKeys { ctx, reset_seq } => {
                // Seal NEWKEYS and swap under one lock so the context
                // changes exactly at the packet boundary
                let wire = {
                    let mut encoder = shared.encoder.lock().await;
                    let wire = encoder.encode(&[MessageType::NewKeys as u8]);
                    if wire.is_ok() {
                        encoder.activate(ctx, reset_seq);
                    }
                    wire
                };
                match wire {
                    Ok(bytes) => write_half.write_all(&bytes).await.map_err(SkiffError::from),
                    Err(e) => Err(e),
                }
            }
            Outbound::Drain(ack) => {
                let _ = write_half.flush().await;
                let _ = ack.send(());
                continue;
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "write task failed");
            shared.teardown(Some(&e)).await;
            break;
        }
    }
}

async fn maintenance_loop(shared: Arc<Shared>, out_tx: mpsc::Sender<Outbound>) {
    let idle = shared.config.idle_timeout_seconds;
    let tick = Duration::from_secs(if idle > 0 { (idle / 4).clamp(1, 10) } else { 10 });
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_keepalive = Instant::now();

    loop {
        interval.tick().await;
        if shared.is_closed() {
            break;
        }

        // Rekey thresholds
        let bytes = {
            let encoder = shared.encoder.lock().await;
            encoder.bytes_since_rekey()
        };
        let due = {
            let transport = shared.transport.lock().expect("transport lock");
            transport.needs_rekey(
                bytes,
                shared.config.rekey_bytes,
                Duration::from_secs(shared.config.rekey_time_seconds),
            )
        };
        if due {
            debug!("rekey threshold reached");
            let _ = ensure_kexinit_sent(&shared, &out_tx).await;
        }

        // Idle handling
        if idle > 0 {
            let silent = shared
                .last_read
                .lock()
                .expect("last_read lock")
                .elapsed();
            if silent >= Duration::from_secs(idle) {
                warn!(idle_seconds = silent.as_secs(), "idle timeout exceeded");
                let disconnect = Disconnect::new(
                    DisconnectReason::ConnectionLost,
                    "Idle timeout",
                );
                let _ = out_tx.send(Outbound::Packet(disconnect.to_bytes())).await;
                shared
                    .teardown(Some(&SkiffError::Timeout("Idle timeout".to_string())))
                    .await;
                break;
            }
            if silent >= Duration::from_secs(idle / 2)
                && last_keepalive.elapsed() >= Duration::from_secs((idle / 2).max(1))
            {
                last_keepalive = Instant::now();
                let _ = out_tx
                    .send(Outbound::Packet(transport::ignore_message(b"keepalive")))
                    .await;
            }
        }
    }
}

/// Sends our KEXINIT if no rekey is in flight; returns its payload bytes.
async fn ensure_kexinit_sent(
    shared: &Arc<Shared>,
    out_tx: &mpsc::Sender<Outbound>,
) -> SkiffResult<Vec<u8>> {
    let mut slot = shared.rekey.lock().await;
    if let RekeySlot::OursSent { our_kexinit } = &*slot {
        return Ok(our_kexinit.clone());
    }

    let kexinit = KexInit::from_config(&shared.config, shared.is_client);
    let bytes = kexinit.to_bytes();
    {
        let mut transport = shared.transport.lock().expect("transport lock");
        transport.transition(State::Rekey)?;
    }
    out_tx
        .send(Outbound::Packet(bytes.clone()))
        .await
        .map_err(|_| SkiffError::Disconnected {
            code: DisconnectReason::ConnectionLost as u32,
            message: "Session closed".to_string(),
        })?;
    *slot = RekeySlot::OursSent {
        our_kexinit: bytes.clone(),
    };
    info!("rekey initiated");
    Ok(bytes)
}

enum Exchange {
    Curve(Curve25519Exchange, [u8; 32]),
    Dh(DhGroup14Exchange),
}

struct KexFlight {
    negotiated: Negotiated,
    algorithm: KexAlgorithm,
    client_kexinit: Vec<u8>,
    server_kexinit: Vec<u8>,
    exchange: Option<Exchange>,
    sent_newkeys: bool,
    received_newkeys: bool,
    pending_open: Option<OpenContext>,
    skip_next_kex_packet: bool,
}

async fn read_loop(
    shared: Arc<Shared>,
    mut read_half: OwnedReadHalf,
    mut decoder: PacketDecoder,
    out_tx: mpsc::Sender<Outbound>,
) {
    let mut flight: Option<KexFlight> = None;

    loop {
        let payload = match decoder.read_packet(&mut read_half).await {
            Ok(p) => p,
            Err(e) => {
                let error = normalize_read_error(e);
                if !shared.is_closed() {
                    warn!(error = %error, "read task failed");
                    fatal(&shared, &out_tx, &error).await;
                }
                break;
            }
        };

        *shared.last_read.lock().expect("last_read lock") = Instant::now();

        let Some(&msg) = payload.first() else {
            let error = SkiffError::Wire("Empty packet payload".to_string());
            fatal(&shared, &out_tx, &error).await;
            break;
        };

        // Unknown message numbers get UNIMPLEMENTED, never a disconnect
        if MessageType::from_u8(msg).is_none() {
            debug!(msg, "unknown message number");
            let reply = transport::unimplemented_message(decoder.seq().wrapping_sub(1));
            if out_tx.send(Outbound::Packet(reply)).await.is_err() {
                break;
            }
            continue;
        }

        // Guessed-and-wrong first kex packet is discarded
        if let Some(f) = flight.as_mut() {
            if f.skip_next_kex_packet && (30..=49).contains(&msg) {
                f.skip_next_kex_packet = false;
                continue;
            }
        }

        let legal = {
            let transport = shared.transport.lock().expect("transport lock");
            transport.check_packet_legal(msg)
        };
        if let Err(e) = legal {
            fatal(&shared, &out_tx, &e).await;
            break;
        }

        let step = handle_packet(&shared, &out_tx, &mut decoder, &mut flight, &payload).await;
        match step {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => {
                if let SkiffError::Channel { id, .. } = &e {
                    // Channel errors kill the channel, not the transport
                    shared.events.on_error(&e);
                    let close_packet = shared.mux.lock().await.force_close(*id);
                    if let Some(p) = close_packet {
                        let _ = out_tx.send(Outbound::Packet(p)).await;
                    }
                    continue;
                }
                fatal(&shared, &out_tx, &e).await;
                break;
            }
        }
    }
}

/// Handles one legal packet. Returns Ok(false) to stop the read loop.
async fn handle_packet(
    shared: &Arc<Shared>,
    out_tx: &mpsc::Sender<Outbound>,
    decoder: &mut PacketDecoder,
    flight: &mut Option<KexFlight>,
    payload: &[u8],
) -> SkiffResult<bool> {
    let msg = MessageType::from_u8(payload[0]).expect("checked by caller");

    match msg {
        MessageType::Disconnect => {
            let disconnect = Disconnect::from_bytes(payload)?;
            info!(
                reason = disconnect.reason_code,
                description = %disconnect.description,
                "peer disconnected"
            );
            shared.teardown(Some(&disconnect.into_error())).await;
            Ok(false)
        }
        MessageType::Ignore | MessageType::Debug | MessageType::ExtInfo => Ok(true),
        MessageType::Unimplemented => {
            // Tolerable in general; fatal when it rejects one of our kex
            // packets, which the peer must implement
            if flight.is_some() {
                return Err(SkiffError::Protocol(
                    "Peer cannot continue key exchange".to_string(),
                ));
            }
            warn!("peer rejected one of our packets as unimplemented");
            Ok(true)
        }
        MessageType::KexInit => {
            let our_kexinit = ensure_kexinit_sent(shared, out_tx).await?;
            let flight_state = begin_kex(shared, out_tx, our_kexinit, payload).await?;
            *flight = Some(flight_state);
            Ok(true)
        }
        MessageType::KexdhInit => {
            let f = flight
                .as_mut()
                .ok_or_else(|| SkiffError::Protocol("KEXDH_INIT outside key exchange".to_string()))?;
            server_kexdh_reply(shared, out_tx, f, payload).await?;
            Ok(true)
        }
        MessageType::KexdhReply => {
            let f = flight
                .as_mut()
                .ok_or_else(|| SkiffError::Protocol("KEXDH_REPLY outside key exchange".to_string()))?;
            client_finish_kex(shared, out_tx, f, payload).await?;
            Ok(true)
        }
        MessageType::NewKeys => {
            let f = flight
                .as_mut()
                .ok_or_else(|| SkiffError::Protocol("NEWKEYS outside key exchange".to_string()))?;
            let open = f
                .pending_open
                .take()
                .ok_or_else(|| SkiffError::Protocol("NEWKEYS before key derivation".to_string()))?;
            let strict = {
                let transport = shared.transport.lock().expect("transport lock");
                transport.strict_kex()
            };
            decoder.activate(open, strict);
            f.received_newkeys = true;
            finish_kex_if_done(shared, flight).await;
            Ok(true)
        }
        MessageType::ServiceRequest => {
            // Post-auth, ssh-connection is confirmable; anything else is
            // SERVICE_NOT_AVAILABLE
            let request = crate::ssh::service::ServiceRequest::from_bytes(payload)?;
            match request.check(true) {
                Ok(()) => {
                    let accept =
                        crate::ssh::service::ServiceAccept::new(&request.service).to_bytes();
                    let _ = out_tx.send(Outbound::Packet(accept)).await;
                    Ok(true)
                }
                Err(e) => {
                    let disconnect =
                        Disconnect::new(DisconnectReason::ServiceNotAvailable, &e.to_string());
                    let _ = out_tx.send(Outbound::Packet(disconnect.to_bytes())).await;
                    shared.teardown(Some(&e)).await;
                    Ok(false)
                }
            }
        }
        MessageType::GlobalRequest => {
            let request = GlobalRequest::from_bytes(payload)?;
            let granted = shared.events.on_global_request(&request.request);
            debug!(request = %request.request.name(), granted, "global request");
            if request.want_reply {
                let reply = if granted {
                    vec![MessageType::RequestSuccess as u8]
                } else {
                    vec![MessageType::RequestFailure as u8]
                };
                let _ = out_tx.send(Outbound::Packet(reply)).await;
            }
            Ok(true)
        }
        MessageType::RequestSuccess | MessageType::RequestFailure => {
            shared.events.on_packet(payload);
            Ok(true)
        }
        MessageType::ChannelOpen
        | MessageType::ChannelOpenConfirmation
        | MessageType::ChannelOpenFailure
        | MessageType::ChannelWindowAdjust
        | MessageType::ChannelData
        | MessageType::ChannelExtendedData
        | MessageType::ChannelEof
        | MessageType::ChannelClose
        | MessageType::ChannelRequest
        | MessageType::ChannelSuccess
        | MessageType::ChannelFailure => {
            let packets = {
                let mut mux = shared.mux.lock().await;
                mux.handle_message(payload)?
            };
            for packet in packets {
                out_tx
                    .send(Outbound::Packet(packet))
                    .await
                    .map_err(|_| SkiffError::Disconnected {
                        code: DisconnectReason::ConnectionLost as u32,
                        message: "Session closed".to_string(),
                    })?;
            }
            Ok(true)
        }
        _ => Err(SkiffError::Protocol(format!(
            "Unhandled message {} in running session",
            msg
        ))),
    }
}

/// Negotiates the rekey and, on the client side, fires KEXDH_INIT.
async fn begin_kex(
    shared: &Arc<Shared>,
    out_tx: &mpsc::Sender<Outbound>,
    our_kexinit: Vec<u8>,
    peer_kexinit: &[u8],
) -> SkiffResult<KexFlight> {
    let (client_bytes, server_bytes) = if shared.is_client {
        (our_kexinit.clone(), peer_kexinit.to_vec())
    } else {
        (peer_kexinit.to_vec(), our_kexinit.clone())
    };

    let client_init = KexInit::from_bytes(&client_bytes)?;
    let server_init = KexInit::from_bytes(&server_bytes)?;
    let negotiated = negotiate(&client_init, &server_init)?;
    let algorithm = KexAlgorithm::from_name(&negotiated.kex).ok_or_else(|| {
        SkiffError::Negotiation(format!("Unimplemented kex method '{}'", negotiated.kex))
    })?;

    let peer_init = if shared.is_client {
        &server_init
    } else {
        &client_init
    };
    // A wrong guess from the peer means its next kex packet is garbage
    let skip_next_kex_packet = peer_init.first_kex_packet_follows()
        && peer_init.kex_algorithms().first().map(String::as_str)
            != Some(negotiated.kex.as_str());

    let mut flight = KexFlight {
        negotiated,
        algorithm,
        client_kexinit: client_bytes,
        server_kexinit: server_bytes,
        exchange: None,
        sent_newkeys: false,
        received_newkeys: false,
        pending_open: None,
        skip_next_kex_packet,
    };

    if shared.is_client {
        let (public, exchange) = match algorithm {
            KexAlgorithm::Curve25519Sha256 => {
                let e = Curve25519Exchange::new()?;
                let public = *e.public_key();
                (public.to_vec(), Exchange::Curve(e, public))
            }
            KexAlgorithm::DhGroup14Sha256 => {
                let e = DhGroup14Exchange::new();
                (e.public_key().to_vec(), Exchange::Dh(e))
            }
        };
        flight.exchange = Some(exchange);
        let init = KexDhInit { public };
        out_tx
            .send(Outbound::Packet(init.to_bytes(algorithm)))
            .await
            .map_err(|_| SkiffError::Disconnected {
                code: DisconnectReason::ConnectionLost as u32,
                message: "Session closed".to_string(),
            })?;
    }

    Ok(flight)
}

/// Server side of the agreement: answer KEXDH_INIT, derive, send NEWKEYS.
async fn server_kexdh_reply(
    shared: &Arc<Shared>,
    out_tx: &mpsc::Sender<Outbound>,
    flight: &mut KexFlight,
    payload: &[u8],
) -> SkiffResult<()> {
    if shared.is_client {
        return Err(SkiffError::Protocol(
            "KEXDH_INIT received by client".to_string(),
        ));
    }
    let init = KexDhInit::from_bytes(payload, flight.algorithm)?;

    let (server_public, shared_secret) = match flight.algorithm {
        KexAlgorithm::Curve25519Sha256 => {
            let exchange = Curve25519Exchange::new()?;
            let public = exchange.public_key().to_vec();
            let secret = exchange.compute_shared_secret(&init.public)?;
            (public, secret)
        }
        KexAlgorithm::DhGroup14Sha256 => {
            let exchange = DhGroup14Exchange::new();
            let public = exchange.public_key().to_vec();
            let secret = exchange.compute_shared_secret(&init.public)?;
            (public, secret)
        }
    };

    let host_key = shared
        .host_key
        .as_ref()
        .ok_or_else(|| SkiffError::Config("Server session without host key".to_string()))?;
    let host_blob = host_key.public_blob();

    let exchange_hash = compute_exchange_hash(&ExchangeHashParams {
        client_version: &shared.client_version,
        server_version: &shared.server_version,
        client_kexinit: &flight.client_kexinit,
        server_kexinit: &flight.server_kexinit,
        host_key_blob: &host_blob,
        client_public: &init.public,
        server_public: &server_public,
        shared_secret: &shared_secret,
        algorithm: flight.algorithm,
    });
    let signature = host_key.sign(&exchange_hash)?;

    let reply = KexDhReply {
        host_key_blob: host_blob,
        public: server_public,
        signature,
    };
    out_tx
        .send(Outbound::Packet(reply.to_bytes(flight.algorithm)))
        .await
        .map_err(|_| SkiffError::Disconnected {
            code: DisconnectReason::ConnectionLost as u32,
            message: "Session closed".to_string(),
        })?;

    install_new_keys(shared, out_tx, flight, &shared_secret, &exchange_hash).await
}

/// Client side of the agreement: verify KEXDH_REPLY, derive, send NEWKEYS.
async fn client_finish_kex(
    shared: &Arc<Shared>,
    out_tx: &mpsc::Sender<Outbound>,
    flight: &mut KexFlight,
    payload: &[u8],
) -> SkiffResult<()> {
    if !shared.is_client {
        return Err(SkiffError::Protocol(
            "KEXDH_REPLY received by server".to_string(),
        ));
    }
    let reply = KexDhReply::from_bytes(payload, flight.algorithm)?;

    // Rekeys must present the key pinned at first contact
    if let Some(expected) = &shared.expected_host_blob {
        if *expected != reply.host_key_blob {
            return Err(SkiffError::Crypto(
                "Host key changed during rekey".to_string(),
            ));
        }
    }

    let (client_public, shared_secret) = match flight.exchange.take() {
        Some(Exchange::Curve(exchange, public)) => {
            let secret = exchange.compute_shared_secret(&reply.public)?;
            (public.to_vec(), secret)
        }
        Some(Exchange::Dh(exchange)) => {
            let public = exchange.public_key().to_vec();
            let secret = exchange.compute_shared_secret(&reply.public)?;
            (public, secret)
        }
        None => {
            return Err(SkiffError::Protocol(
                "KEXDH_REPLY without outstanding KEXDH_INIT".to_string(),
            ))
        }
    };

    let exchange_hash = compute_exchange_hash(&ExchangeHashParams {
        client_version: &shared.client_version,
        server_version: &shared.server_version,
        client_kexinit: &flight.client_kexinit,
        server_kexinit: &flight.server_kexinit,
        host_key_blob: &reply.host_key_blob,
        client_public: &client_public,
        server_public: &reply.public,
        shared_secret: &shared_secret,
        algorithm: flight.algorithm,
    });
    crate::ssh::hostkey::verify_signature(&reply.host_key_blob, &exchange_hash, &reply.signature)?;

    install_new_keys(shared, out_tx, flight, &shared_secret, &exchange_hash).await
}

/// Derives both directions and queues the NEWKEYS-plus-swap command.
async fn install_new_keys(
    shared: &Arc<Shared>,
    out_tx: &mpsc::Sender<Outbound>,
    flight: &mut KexFlight,
    shared_secret: &[u8],
    exchange_hash: &[u8],
) -> SkiffResult<()> {
    let (seal, open) = build_contexts(
        &flight.negotiated,
        shared_secret,
        exchange_hash,
        &shared.session_id,
        shared.is_client,
    )?;

    let strict = {
        let transport = shared.transport.lock().expect("transport lock");
        transport.strict_kex()
    };

    out_tx
        .send(Outbound::NewKeys {
            ctx: seal,
            reset_seq: strict,
        })
        .await
        .map_err(|_| SkiffError::Disconnected {
            code: DisconnectReason::ConnectionLost as u32,
            message: "Session closed".to_string(),
        })?;

    flight.sent_newkeys = true;
    flight.pending_open = Some(open);
    Ok(())
}

async fn finish_kex_if_done(shared: &Arc<Shared>, flight: &mut Option<KexFlight>) {
    let done = flight
        .as_ref()
        .map(|f| f.sent_newkeys && f.received_newkeys)
        .unwrap_or(false);
    if !done {
        return;
    }
    *flight = None;
    {
        let mut transport = shared.transport.lock().expect("transport lock");
        let _ = transport.transition(State::Running);
        transport.mark_kex_complete();
    }
    *shared.rekey.lock().await = RekeySlot::Idle;
    info!("rekey complete");
}

async fn fatal(shared: &Arc<Shared>, out_tx: &mpsc::Sender<Outbound>, error: &SkiffError) {
    let reason = disconnect_reason_for(error);
    let disconnect = Disconnect::new(reason, &error.to_string());
    // Best effort: give the writer a moment to flush the disconnect
    let _ = out_tx.send(Outbound::Packet(disconnect.to_bytes())).await;
    let (ack_tx, ack_rx) = oneshot::channel();
    if out_tx.send(Outbound::Drain(ack_tx)).await.is_ok() {
        let _ = timeout(Duration::from_millis(500), ack_rx).await;
    }
    shared.teardown(Some(error)).await;
}

fn disconnect_reason_for(error: &SkiffError) -> DisconnectReason {
    match error {
        SkiffError::Crypto(_) => DisconnectReason::MacError,
        SkiffError::Wire(_) | SkiffError::Protocol(_) => DisconnectReason::ProtocolError,
        SkiffError::Negotiation(_) => DisconnectReason::KeyExchangeFailed,
        SkiffError::Auth(_) => DisconnectReason::NoMoreAuthMethodsAvailable,
        SkiffError::Timeout(_) => DisconnectReason::ConnectionLost,
        _ => DisconnectReason::ProtocolError,
    }
}

fn normalize_read_error(error: SkiffError) -> SkiffError {
    match error {
        SkiffError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            SkiffError::Disconnected {
                code: DisconnectReason::ConnectionLost as u32,
                message: "Connection closed by peer".to_string(),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_mapping() {
        assert_eq!(
            disconnect_reason_for(&SkiffError::Crypto("tag".into())),
            DisconnectReason::MacError
        );
        assert_eq!(
            disconnect_reason_for(&SkiffError::Wire("len".into())),
            DisconnectReason::ProtocolError
        );
        assert_eq!(
            disconnect_reason_for(&SkiffError::Negotiation("none".into())),
            DisconnectReason::KeyExchangeFailed
        );
    }

    #[test]
    fn test_normalize_eof_becomes_disconnected() {
        let eof = SkiffError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        ));
        assert!(matches!(
            normalize_read_error(eof),
            SkiffError::Disconnected { .. }
        ));
    }
}
