//! Per-channel state: lifecycle, half-close flags and flow-control windows.
//!
//! A channel is a flow-controlled logical byte pipe identified by a
//! `(local_id, remote_id)` pair. Each direction has an independent credit
//! counter: we may not send more than the remote window allows, and we
//! track the local window we granted to detect peer overruns. Writers out
//! of credit park on a [`tokio::sync::Notify`] until a WINDOW_ADJUST
//! arrives; a parked channel never blocks its siblings.
//!
//! Lifecycle:
//!
//! ```text
//! Opening -> Open -> { EofSent | EofReceived | BothEof } -> Closing -> Closed
//! ```
//!
//! The channel is destroyed once close has been both sent and received;
//! the multiplexer then reclaims the local id.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use skiff_platform::{SkiffError, SkiffResult};
use tokio::sync::Notify;

use crate::ssh::connection::ChannelRequestType;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent or received; no confirmation yet.
    Opening,
    /// Fully open, both directions flowing.
    Open,
    /// We sent EOF; peer may still send.
    EofSent,
    /// Peer sent EOF; we may still send.
    EofReceived,
    /// Both directions have seen EOF.
    BothEof,
    /// CLOSE sent or received, waiting for the counterpart.
    Closing,
    /// Terminal; the slot may be reused.
    Closed,
}

/// Sender-side credit for one channel, shared between the application
/// handle (which spends it) and the read task (which grants it on
/// WINDOW_ADJUST).
#[derive(Debug)]
pub struct RemoteWindow {
    credit: AtomicU32,
    closed: std::sync::atomic::AtomicBool,
    notify: Notify,
}

impl RemoteWindow {
    /// Creates a window with the peer's initial credit.
    pub fn new(initial: u32) -> Self {
        Self {
            credit: AtomicU32::new(initial),
            closed: std::sync::atomic::AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Returns the current credit.
    pub fn available(&self) -> u32 {
        self.credit.load(Ordering::Acquire)
    }

    /// Grants additional credit (WINDOW_ADJUST received). Strictly
    /// additive; saturates rather than wraps on a hostile peer.
    pub fn grant(&self, bytes: u32) {
        let mut current = self.credit.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            match self.credit.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.notify.notify_waiters();
    }

    /// Marks the channel closed and wakes all parked writers so they
    /// observe it. Used at teardown.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Returns true once the channel was torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reserves up to `want` bytes of credit, waiting while the window is
    /// empty. Returns the number of bytes reserved (at least 1), or `None`
    /// once the channel closed.
    pub async fn reserve(&self, want: u32) -> Option<u32> {
        debug_assert!(want > 0);
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return None;
            }
            let mut current = self.credit.load(Ordering::Acquire);
            while current > 0 {
                let take = want.min(current);
                match self.credit.compare_exchange_weak(
                    current,
                    current - take,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(take),
                    Err(actual) => current = actual,
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`RemoteWindow::reserve`].
    pub fn try_reserve(&self, want: u32) -> Option<u32> {
        let mut current = self.credit.load(Ordering::Acquire);
        while current > 0 {
            let take = want.min(current);
            match self.credit.compare_exchange_weak(
                current,
                current - take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(take),
                Err(actual) => current = actual,
            }
        }
        None
    }
}

/// Events delivered to the application side of a channel, in wire order.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The open handshake completed.
    Opened,
    /// The peer refused our open.
    OpenFailed {
        /// Failure reason code
        reason: u32,
        /// Human-readable description
        description: String,
    },
    /// Data received.
    Data(Vec<u8>),
    /// Extended (stderr) data received.
    ExtendedData {
        /// Data type code
        data_type: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// The peer sent EOF for its direction.
    Eof,
    /// The channel is fully closed.
    Closed,
    /// A channel request arrived (exec, pty-req, exit-status, ...).
    Request {
        /// The request
        request: ChannelRequestType,
        /// Whether the peer wants a reply
        want_reply: bool,
    },
    /// The peer answered one of our want-reply requests.
    ReplySuccess,
    /// The peer refused one of our want-reply requests.
    ReplyFailure,
}

/// One channel's bookkeeping, owned by the multiplexer.
#[derive(Debug)]
pub struct Channel {
    local_id: u32,
    remote_id: u32,
    type_name: String,
    state: ChannelState,

    // Inbound credit we granted to the peer
    local_window: u32,
    local_window_initial: u32,
    local_max_packet: u32,

    // Outbound credit the peer granted us
    remote_window: Arc<RemoteWindow>,
    remote_max_packet: u32,

    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,
}

impl Channel {
    /// Creates a channel in `Opening`.
    ///
    /// `remote_id`, `remote_window` and `remote_max_packet` carry the
    /// peer's values once known; an outbound open starts with zeros and
    /// fills them in at confirmation time.
    pub fn new(
        local_id: u32,
        type_name: &str,
        local_window_initial: u32,
        local_max_packet: u32,
    ) -> Self {
        Self {
            local_id,
            remote_id: 0,
            type_name: type_name.to_string(),
            state: ChannelState::Opening,
            local_window: local_window_initial,
            local_window_initial,
            local_max_packet,
            remote_window: Arc::new(RemoteWindow::new(0)),
            remote_max_packet: 0,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
        }
    }

    /// Completes the open handshake with the peer's parameters.
    pub fn confirm(&mut self, remote_id: u32, remote_window: u32, remote_max_packet: u32) {
        self.remote_id = remote_id;
        self.remote_window.grant(remote_window);
        self.remote_max_packet = remote_max_packet;
        self.state = ChannelState::Open;
    }

    /// Returns the local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the peer's channel id.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Returns the channel type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Returns the shared outbound window.
    pub fn remote_window(&self) -> Arc<RemoteWindow> {
        Arc::clone(&self.remote_window)
    }

    /// Returns the peer's maximum packet size.
    pub fn remote_max_packet(&self) -> u32 {
        self.remote_max_packet
    }

    /// Returns the local maximum packet size we advertised.
    pub fn local_max_packet(&self) -> u32 {
        self.local_max_packet
    }

    /// Returns true when both close flags are set.
    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// Returns true if we may still send data (no EOF or close sent).
    pub fn can_send(&self) -> bool {
        !self.eof_sent
            && !self.close_sent
            && matches!(
                self.state,
                ChannelState::Open | ChannelState::EofReceived
            )
    }

    /// Validates and accounts an inbound data packet of `len` bytes.
    ///
    /// Data after the peer's EOF and window overruns are protocol errors
    /// on this channel.
    pub fn accept_data(&mut self, len: usize) -> SkiffResult<()> {
        if self.eof_received || self.close_received {
            return Err(SkiffError::Channel {
                id: self.local_id,
                reason: "Data received after EOF".to_string(),
            });
        }
        if len > self.local_max_packet as usize {
            return Err(SkiffError::Channel {
                id: self.local_id,
                reason: format!(
                    "Packet of {} bytes exceeds advertised maximum {}",
                    len, self.local_max_packet
                ),
            });
        }
        let len = len as u32;
        if len > self.local_window {
            return Err(SkiffError::Channel {
                id: self.local_id,
                reason: format!(
                    "Window overrun: {} bytes with {} remaining",
                    len, self.local_window
                ),
            });
        }
        self.local_window -= len;
        Ok(())
    }

    /// Returns the number of bytes to grant back once local consumption
    /// drops the window below half its initial size, and applies the
    /// grant locally.
    pub fn take_window_adjustment(&mut self) -> Option<u32> {
        if self.local_window < self.local_window_initial / 2 {
            let grant = self.local_window_initial - self.local_window;
            self.local_window = self.local_window_initial;
            Some(grant)
        } else {
            None
        }
    }

    /// Records that we sent EOF.
    pub fn mark_eof_sent(&mut self) {
        self.eof_sent = true;
        self.state = match self.state {
            ChannelState::Open => ChannelState::EofSent,
            ChannelState::EofReceived => ChannelState::BothEof,
            other => other,
        };
    }

    /// Records the peer's EOF.
    pub fn mark_eof_received(&mut self) {
        self.eof_received = true;
        self.state = match self.state {
            ChannelState::Open => ChannelState::EofReceived,
            ChannelState::EofSent => ChannelState::BothEof,
            other => other,
        };
    }

    /// Records that we sent CLOSE. Returns true when the channel reached
    /// its terminal state.
    pub fn mark_close_sent(&mut self) -> bool {
        self.close_sent = true;
        self.advance_close()
    }

    /// Records the peer's CLOSE. Returns true when the channel reached its
    /// terminal state.
    pub fn mark_close_received(&mut self) -> bool {
        self.close_received = true;
        self.advance_close()
    }

    fn advance_close(&mut self) -> bool {
        if self.close_sent && self.close_received {
            self.state = ChannelState::Closed;
            self.remote_window.close();
            true
        } else {
            self.state = ChannelState::Closing;
            false
        }
    }

    /// Half-close query: we sent EOF.
    pub fn eof_sent(&self) -> bool {
        self.eof_sent
    }

    /// Half-close query: peer sent EOF.
    pub fn eof_received(&self) -> bool {
        self.eof_received
    }

    /// Teardown query: we sent CLOSE.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Teardown query: peer sent CLOSE.
    pub fn close_received(&self) -> bool {
        self.close_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_channel() -> Channel {
        let mut ch = Channel::new(0, "session", 1024, 256);
        ch.confirm(7, 2048, 512);
        ch
    }

    #[test]
    fn test_open_handshake() {
        let ch = open_channel();
        assert_eq!(ch.state(), ChannelState::Open);
        assert_eq!(ch.remote_id(), 7);
        assert_eq!(ch.remote_window().available(), 2048);
        assert_eq!(ch.remote_max_packet(), 512);
    }

    #[test]
    fn test_half_close_eof_sent_first() {
        let mut ch = open_channel();
        ch.mark_eof_sent();
        assert_eq!(ch.state(), ChannelState::EofSent);
        // Other direction still open
        assert!(!ch.can_send());
        assert!(ch.accept_data(10).is_ok());

        ch.mark_eof_received();
        assert_eq!(ch.state(), ChannelState::BothEof);
    }

    #[test]
    fn test_half_close_eof_received_keeps_sending() {
        let mut ch = open_channel();
        ch.mark_eof_received();
        assert_eq!(ch.state(), ChannelState::EofReceived);
        assert!(ch.can_send());
        assert!(ch.accept_data(1).is_err());
    }

    #[test]
    fn test_close_requires_both_sides() {
        let mut ch = open_channel();
        assert!(!ch.mark_close_sent());
        assert_eq!(ch.state(), ChannelState::Closing);
        assert!(ch.mark_close_received());
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(ch.is_closed());
    }

    #[test]
    fn test_data_after_eof_rejected() {
        let mut ch = open_channel();
        ch.mark_eof_received();
        let err = ch.accept_data(4).unwrap_err();
        assert!(matches!(err, SkiffError::Channel { id: 0, .. }));
    }

    #[test]
    fn test_window_overrun_rejected() {
        let mut ch = open_channel();
        assert!(ch.accept_data(1000).is_ok());
        let err = ch.accept_data(100).unwrap_err();
        assert!(matches!(err, SkiffError::Channel { .. }));
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut ch = open_channel();
        assert!(ch.accept_data(257).is_err());
    }

    #[test]
    fn test_window_adjustment_below_half() {
        let mut ch = open_channel();
        assert!(ch.take_window_adjustment().is_none());

        ch.accept_data(256).unwrap();
        ch.accept_data(256).unwrap();
        ch.accept_data(128).unwrap();
        // 384 remaining < 512 (half of 1024)
        let grant = ch.take_window_adjustment().unwrap();
        assert_eq!(grant, 640);
        assert!(ch.take_window_adjustment().is_none());
    }

    #[tokio::test]
    async fn test_remote_window_reserve_caps_at_credit() {
        let window = RemoteWindow::new(8);
        assert_eq!(window.reserve(4).await, Some(4));
        assert_eq!(window.reserve(100).await, Some(4));
        assert_eq!(window.available(), 0);
        assert_eq!(window.try_reserve(1), None);
    }

    #[tokio::test]
    async fn test_remote_window_parks_until_grant() {
        let window = Arc::new(RemoteWindow::new(0));
        let waiter = Arc::clone(&window);

        let task = tokio::spawn(async move { waiter.reserve(10).await });
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        window.grant(6);
        assert_eq!(task.await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_remote_window_close_releases_parked_writer() {
        let window = Arc::new(RemoteWindow::new(0));
        let waiter = Arc::clone(&window);

        let task = tokio::spawn(async move { waiter.reserve(10).await });
        tokio::task::yield_now().await;

        window.close();
        assert_eq!(task.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remote_window_grant_saturates() {
        let window = RemoteWindow::new(u32::MAX - 1);
        window.grant(100);
        assert_eq!(window.available(), u32::MAX);
    }
}
