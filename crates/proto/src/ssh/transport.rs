//! Transport layer state machine (RFC 4253) and the transport-generic
//! messages: DISCONNECT, IGNORE, DEBUG, UNIMPLEMENTED.
//!
//! The machine is the single source of truth for wire state:
//!
//! ```text
//! VersionExchange -> KexInitSent -> KexInProgress -> NewKeysPending -> Auth -> Running
//!                                                           ^                    |
//!                                                           +------ Rekey <------+
//! ```
//!
//! `Closed` is terminal and reachable from everywhere. Transitions are
//! packet-driven; a packet illegal in the current state is fatal. The first
//! exchange hash is frozen here as the session identifier and never
//! replaced by later rekeys.

use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};
use tracing::debug;

use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::wire;

/// Transport layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Version lines being exchanged; no binary packets yet.
    VersionExchange,
    /// Our KEXINIT is out; waiting for the peer's.
    KexInitSent,
    /// Key agreement messages in flight.
    KexInProgress,
    /// Keys derived; waiting for NEWKEYS.
    NewKeysPending,
    /// Authenticated service negotiation (`ssh-userauth`).
    Auth,
    /// Steady state; connection service running.
    Running,
    /// Rekey in progress while the connection service stays up.
    Rekey,
    /// Terminal.
    Closed,
}

/// Transport layer state machine.
#[derive(Debug)]
pub struct TransportState {
    state: State,
    is_client: bool,
    session_id: Option<Vec<u8>>,
    strict_kex: bool,
    last_kex: Instant,
}

impl TransportState {
    /// Creates a state machine in `VersionExchange`.
    pub fn new(is_client: bool) -> Self {
        Self {
            state: State::VersionExchange,
            is_client,
            session_id: None,
            strict_kex: false,
            last_kex: Instant::now(),
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> State {
        self.state
    }

    /// Returns true for the client side.
    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Returns the frozen session identifier, if the first KEX completed.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Freezes the session identifier. Only the first call takes effect.
    pub fn freeze_session_id(&mut self, exchange_hash: &[u8]) {
        if self.session_id.is_none() {
            self.session_id = Some(exchange_hash.to_vec());
        }
    }

    /// Returns true once both sides agreed on strict KEX semantics.
    pub fn strict_kex(&self) -> bool {
        self.strict_kex
    }

    /// Records the strict KEX agreement from the first negotiation.
    pub fn set_strict_kex(&mut self, strict: bool) {
        self.strict_kex = strict;
    }

    /// Moves to a new state, validating the edge.
    pub fn transition(&mut self, next: State) -> SkiffResult<()> {
        let valid = matches!(
            (self.state, next),
            (State::VersionExchange, State::KexInitSent)
                | (State::KexInitSent, State::KexInProgress)
                | (State::KexInProgress, State::NewKeysPending)
                | (State::NewKeysPending, State::Auth)
                | (State::NewKeysPending, State::Running)
                | (State::Auth, State::Running)
                | (State::Running, State::Rekey)
                | (State::Rekey, State::Running)
                | (_, State::Closed)
        ) || self.state == next;

        if !valid {
            return Err(SkiffError::Protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self.state, next
            )));
        }

        if self.state != next {
            debug!(from = ?self.state, to = ?next, "transport state transition");
        }
        self.state = next;
        Ok(())
    }

    /// Validates that a message number is legal in the current state.
    ///
    /// DISCONNECT is always legal. IGNORE and DEBUG are legal in any
    /// post-version state except, under strict KEX, between KEXINIT and
    /// NEWKEYS where any unexpected packet is fatal.
    pub fn check_packet_legal(&self, msg: u8) -> SkiffResult<()> {
        use MessageType::*;

        let msg_type = MessageType::from_u8(msg);
        if msg_type == Some(Disconnect) {
            return Ok(());
        }

        let in_kex = matches!(
            self.state,
            State::KexInitSent | State::KexInProgress | State::NewKeysPending
        );
        if !self.strict_kex || !in_kex {
            if matches!(msg_type, Some(Ignore) | Some(Debug) | Some(Unimplemented)) {
                return Ok(());
            }
        }

        let legal = match self.state {
            State::VersionExchange | State::Closed => false,
            State::KexInitSent => msg_type == Some(KexInit),
            State::KexInProgress => matches!(msg_type, Some(KexdhInit) | Some(KexdhReply)),
            State::NewKeysPending => msg_type == Some(NewKeys),
            State::Auth => matches!(
                msg_type,
                Some(ServiceRequest)
                    | Some(ServiceAccept)
                    | Some(ExtInfo)
                    | Some(UserauthRequest)
                    | Some(UserauthFailure)
                    | Some(UserauthSuccess)
                    | Some(UserauthBanner)
                    | Some(UserauthPkOk)
                    | Some(UserauthInfoResponse)
            ),
            State::Running => matches!(
                msg_type,
                Some(KexInit)
                    | Some(ServiceRequest)
                    | Some(GlobalRequest)
                    | Some(RequestSuccess)
                    | Some(RequestFailure)
                    | Some(ChannelOpen)
                    | Some(ChannelOpenConfirmation)
                    | Some(ChannelOpenFailure)
                    | Some(ChannelWindowAdjust)
                    | Some(ChannelData)
                    | Some(ChannelExtendedData)
                    | Some(ChannelEof)
                    | Some(ChannelClose)
                    | Some(ChannelRequest)
                    | Some(ChannelSuccess)
                    | Some(ChannelFailure)
            ),
            // During rekey, kex messages plus already-running connection
            // traffic may interleave
            State::Rekey => matches!(
                msg_type,
                Some(KexInit)
                    | Some(KexdhInit)
                    | Some(KexdhReply)
                    | Some(NewKeys)
                    | Some(GlobalRequest)
                    | Some(RequestSuccess)
                    | Some(RequestFailure)
                    | Some(ChannelOpen)
                    | Some(ChannelOpenConfirmation)
                    | Some(ChannelOpenFailure)
                    | Some(ChannelWindowAdjust)
                    | Some(ChannelData)
                    | Some(ChannelExtendedData)
                    | Some(ChannelEof)
                    | Some(ChannelClose)
                    | Some(ChannelRequest)
                    | Some(ChannelSuccess)
                    | Some(ChannelFailure)
            ),
        };

        if legal {
            Ok(())
        } else {
            Err(SkiffError::Protocol(format!(
                "Message {} illegal in state {:?}",
                msg, self.state
            )))
        }
    }

    /// Marks a completed key exchange for rekey bookkeeping.
    pub fn mark_kex_complete(&mut self) {
        self.last_kex = Instant::now();
    }

    /// Returns true when a rekey is due by byte count or elapsed time.
    pub fn needs_rekey(&self, bytes_since_rekey: u64, rekey_bytes: u64, rekey_time: Duration) -> bool {
        if self.state != State::Running {
            return false;
        }
        bytes_since_rekey >= rekey_bytes || self.last_kex.elapsed() >= rekey_time
    }
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code.
    pub reason_code: u32,
    /// UTF-8 description.
    pub description: String,
    /// Language tag (usually empty).
    pub language: String,
}

impl Disconnect {
    /// Creates a DISCONNECT with a known reason.
    pub fn new(reason: DisconnectReason, description: &str) -> Self {
        Self {
            reason_code: reason as u32,
            description: description.to_string(),
            language: String::new(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason_code);
        wire::put_str(&mut buf, &self.description);
        wire::put_str(&mut buf, &self.language);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::Disconnect as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_DISCONNECT".to_string(),
            ));
        }
        let mut offset = 1;
        let reason_code = wire::get_u32(data, &mut offset)?;
        let description = wire::get_str(data, &mut offset)?.to_string();
        let language = wire::get_str(data, &mut offset).unwrap_or_default().to_string();
        Ok(Self {
            reason_code,
            description,
            language,
        })
    }

    /// Converts into the error surfaced to the application.
    pub fn into_error(self) -> SkiffError {
        SkiffError::Disconnected {
            code: self.reason_code,
            message: self.description,
        }
    }
}

/// SSH_MSG_IGNORE (RFC 4253 Section 11.2). Payload is arbitrary.
pub fn ignore_message(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::Ignore as u8);
    wire::put_string(&mut buf, data);
    buf.to_vec()
}

/// SSH_MSG_UNIMPLEMENTED (RFC 4253 Section 11.4), echoing the rejected
/// packet's sequence number.
pub fn unimplemented_message(rejected_seq: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(rejected_seq);
    buf.to_vec()
}

/// SSH_MSG_DEBUG (RFC 4253 Section 11.3).
pub fn debug_message(always_display: bool, message: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::Debug as u8);
    wire::put_bool(&mut buf, always_display);
    wire::put_str(&mut buf, message);
    wire::put_str(&mut buf, "");
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(state: State) -> TransportState {
        let mut t = TransportState::new(true);
        let path: &[State] = match state {
            State::VersionExchange => &[],
            State::KexInitSent => &[State::KexInitSent],
            State::KexInProgress => &[State::KexInitSent, State::KexInProgress],
            State::NewKeysPending => &[
                State::KexInitSent,
                State::KexInProgress,
                State::NewKeysPending,
            ],
            State::Auth => &[
                State::KexInitSent,
                State::KexInProgress,
                State::NewKeysPending,
                State::Auth,
            ],
            State::Running => &[
                State::KexInitSent,
                State::KexInProgress,
                State::NewKeysPending,
                State::Auth,
                State::Running,
            ],
            State::Rekey => &[
                State::KexInitSent,
                State::KexInProgress,
                State::NewKeysPending,
                State::Auth,
                State::Running,
                State::Rekey,
            ],
            State::Closed => &[State::Closed],
        };
        for s in path {
            t.transition(*s).unwrap();
        }
        t
    }

    #[test]
    fn test_normal_progression() {
        let t = machine_in(State::Running);
        assert_eq!(t.current(), State::Running);
    }

    #[test]
    fn test_rekey_cycle() {
        let mut t = machine_in(State::Running);
        t.transition(State::Rekey).unwrap();
        t.transition(State::Running).unwrap();
    }

    #[test]
    fn test_invalid_jump_rejected() {
        let mut t = TransportState::new(true);
        let err = t.transition(State::Running).unwrap_err();
        assert!(matches!(err, SkiffError::Protocol(_)));
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut t = machine_in(State::Closed);
        assert!(t.transition(State::Running).is_err());
        assert!(t.transition(State::Closed).is_ok());
    }

    #[test]
    fn test_session_id_freezes_once() {
        let mut t = TransportState::new(true);
        t.freeze_session_id(&[1; 32]);
        t.freeze_session_id(&[2; 32]);
        assert_eq!(t.session_id(), Some(&[1u8; 32][..]));
    }

    #[test]
    fn test_packet_legality_auth_state() {
        let t = machine_in(State::Auth);
        assert!(t.check_packet_legal(MessageType::UserauthRequest as u8).is_ok());
        assert!(t.check_packet_legal(MessageType::ChannelData as u8).is_err());
    }

    #[test]
    fn test_packet_legality_running_state() {
        let t = machine_in(State::Running);
        assert!(t.check_packet_legal(MessageType::ChannelData as u8).is_ok());
        assert!(t.check_packet_legal(MessageType::KexInit as u8).is_ok());
        assert!(t.check_packet_legal(MessageType::KexdhInit as u8).is_err());
    }

    #[test]
    fn test_ignore_debug_tolerated_everywhere_post_version() {
        for state in [State::KexInitSent, State::Auth, State::Running, State::Rekey] {
            let t = machine_in(state);
            assert!(t.check_packet_legal(MessageType::Ignore as u8).is_ok());
            assert!(t.check_packet_legal(MessageType::Debug as u8).is_ok());
        }
    }

    #[test]
    fn test_strict_kex_rejects_ignore_during_kex() {
        let mut t = machine_in(State::KexInProgress);
        t.set_strict_kex(true);
        assert!(t.check_packet_legal(MessageType::Ignore as u8).is_err());
        assert!(t.check_packet_legal(MessageType::KexdhReply as u8).is_ok());
    }

    #[test]
    fn test_disconnect_always_legal() {
        for state in [State::KexInitSent, State::NewKeysPending, State::Running] {
            let t = machine_in(state);
            assert!(t.check_packet_legal(MessageType::Disconnect as u8).is_ok());
        }
    }

    #[test]
    fn test_disconnect_round_trip() {
        let msg = Disconnect::new(DisconnectReason::KeyExchangeFailed, "no common cipher");
        let parsed = Disconnect::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.reason_code, 3);
        assert_eq!(parsed.description, "no common cipher");
    }

    #[test]
    fn test_needs_rekey_by_bytes() {
        let mut t = machine_in(State::Running);
        t.mark_kex_complete();
        assert!(!t.needs_rekey(10, 100, Duration::from_secs(3600)));
        assert!(t.needs_rekey(100, 100, Duration::from_secs(3600)));
    }

    #[test]
    fn test_needs_rekey_only_when_running() {
        let t = machine_in(State::Auth);
        assert!(!t.needs_rekey(u64::MAX, 1, Duration::from_secs(0)));
    }

    #[test]
    fn test_unimplemented_message_layout() {
        let bytes = unimplemented_message(77);
        assert_eq!(bytes[0], 3);
        assert_eq!(u32::from_be_bytes(bytes[1..5].try_into().unwrap()), 77);
    }
}
