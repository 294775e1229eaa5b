//! Channel multiplexer: the table of open channels on one transport.
//!
//! The mux owns every [`Channel`] record, allocates local ids (lowest free
//! slot; ids are reused once a channel reaches its terminal state),
//! dispatches inbound connection-protocol messages in wire order, and
//! enforces per-channel flow control. It is synchronous and returns the
//! packets to transmit; the session supervisor feeds it from the read task
//! and forwards its output to the write task.
//!
//! Channel-level failures surface as [`SkiffError::Channel`] carrying the
//! local id; the session force-closes that one channel and the transport
//! survives.

use std::sync::Arc;

use skiff_platform::{SkiffError, SkiffResult};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ssh::channel::{Channel, ChannelEvent, RemoteWindow};
use crate::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest, ChannelRequestType,
    ChannelSuccess, ChannelType, ChannelWindowAdjust, OpenFailureReason,
};
use crate::ssh::message::MessageType;

/// A newly accepted inbound channel, handed to the session owner so a
/// handler can be attached.
#[derive(Debug)]
pub struct InboundOpen {
    /// Local id assigned by the mux.
    pub local_id: u32,
    /// Peer's channel id.
    pub remote_id: u32,
    /// The requested channel type with its payload.
    pub channel_type: ChannelType,
    /// Event stream for this channel.
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
    /// Outbound credit shared handle.
    pub remote_window: Arc<RemoteWindow>,
    /// Peer's maximum packet size.
    pub remote_max_packet: u32,
}

struct Entry {
    channel: Channel,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

/// The set of channels multiplexed over one transport.
pub struct ChannelMux {
    slots: Vec<Option<Entry>>,
    initial_window: u32,
    max_packet: u32,
    accepted_types: Vec<String>,
    inbound_opens: mpsc::UnboundedSender<InboundOpen>,
}

impl ChannelMux {
    /// Creates an empty mux.
    ///
    /// `accepted_types` names the channel types we confirm when the peer
    /// opens them (a server accepts "session"; a client typically accepts
    /// none, or "forwarded-tcpip"/"x11" when it asked for forwarding).
    pub fn new(
        initial_window: u32,
        max_packet: u32,
        accepted_types: Vec<String>,
    ) -> (Self, mpsc::UnboundedReceiver<InboundOpen>) {
        let (inbound_opens, rx) = mpsc::unbounded_channel();
        (
            Self {
                slots: Vec::new(),
                initial_window,
                max_packet,
                accepted_types,
                inbound_opens,
            },
            rx,
        )
    }

    fn allocate_slot(&mut self) -> u32 {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_none() {
                return i as u32;
            }
        }
        self.slots.push(None);
        (self.slots.len() - 1) as u32
    }

    fn entry(&mut self, local_id: u32) -> SkiffResult<&mut Entry> {
        self.slots
            .get_mut(local_id as usize)
            .and_then(|s| s.as_mut())
            .ok_or(SkiffError::Channel {
                id: local_id,
                reason: "Unknown channel id".to_string(),
            })
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Returns true when no channels are open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a channel's peer-facing parameters.
    pub fn channel_info(&self, local_id: u32) -> Option<(u32, Arc<RemoteWindow>, u32)> {
        self.slots
            .get(local_id as usize)
            .and_then(|s| s.as_ref())
            .map(|e| {
                (
                    e.channel.remote_id(),
                    e.channel.remote_window(),
                    e.channel.remote_max_packet(),
                )
            })
    }

    /// Opens an outbound channel: allocates a slot and returns the id, the
    /// event stream, and the CHANNEL_OPEN packet to send.
    pub fn open_channel(
        &mut self,
        channel_type: ChannelType,
    ) -> (u32, mpsc::UnboundedReceiver<ChannelEvent>, Vec<u8>) {
        let local_id = self.allocate_slot();
        let (tx, rx) = mpsc::unbounded_channel();

        let channel = Channel::new(
            local_id,
            channel_type.name(),
            self.initial_window,
            self.max_packet,
        );
        self.slots[local_id as usize] = Some(Entry {
            channel,
            events: tx,
        });

        let open = ChannelOpen::new(
            channel_type,
            local_id,
            self.initial_window,
            self.max_packet,
        );
        debug!(local_id, "opening outbound channel");
        (local_id, rx, open.to_bytes())
    }

    /// Builds the EOF packet for a channel and records the half-close.
    pub fn eof(&mut self, local_id: u32) -> SkiffResult<Vec<u8>> {
        let entry = self.entry(local_id)?;
        if entry.channel.eof_sent() {
            return Err(SkiffError::Channel {
                id: local_id,
                reason: "EOF already sent".to_string(),
            });
        }
        entry.channel.mark_eof_sent();
        Ok(ChannelEof {
            recipient_channel: entry.channel.remote_id(),
        }
        .to_bytes())
    }

    /// Builds the CLOSE packet for a channel and records it. Frees the
    /// slot when the peer's close was already seen.
    pub fn close(&mut self, local_id: u32) -> SkiffResult<Option<Vec<u8>>> {
        let entry = self.entry(local_id)?;
        if entry.channel.close_sent() {
            return Ok(None);
        }
        let packet = ChannelClose {
            recipient_channel: entry.channel.remote_id(),
        }
        .to_bytes();
        if entry.channel.mark_close_sent() {
            self.release(local_id);
        }
        Ok(Some(packet))
    }

    /// Builds a CHANNEL_REQUEST packet for a channel.
    pub fn request(
        &mut self,
        local_id: u32,
        request: ChannelRequestType,
        want_reply: bool,
    ) -> SkiffResult<Vec<u8>> {
        let entry = self.entry(local_id)?;
        Ok(ChannelRequest::new(entry.channel.remote_id(), want_reply, request).to_bytes())
    }

    /// Force-closes one channel after a channel-level error: notifies the
    /// handler, emits a best-effort CLOSE, reclaims the slot.
    pub fn force_close(&mut self, local_id: u32) -> Option<Vec<u8>> {
        let entry = self.slots.get_mut(local_id as usize)?.take()?;
        let _ = entry.events.send(ChannelEvent::Closed);
        entry.channel.remote_window().close();
        if entry.channel.close_sent() {
            None
        } else {
            Some(
                ChannelClose {
                    recipient_channel: entry.channel.remote_id(),
                }
                .to_bytes(),
            )
        }
    }

    /// Tears down every channel (transport is closing).
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(entry) = slot.take() {
                let _ = entry.events.send(ChannelEvent::Closed);
                entry.channel.remote_window().close();
            }
        }
    }

    fn release(&mut self, local_id: u32) {
        if let Some(slot) = self.slots.get_mut(local_id as usize) {
            *slot = None;
            debug!(local_id, "channel slot released");
        }
    }

    /// Dispatches one inbound connection-protocol message.
    ///
    /// Returns the packets to transmit in reaction (confirmations, window
    /// adjusts, close echoes). Events are delivered to the channel's
    /// handler in wire order.
    pub fn handle_message(&mut self, payload: &[u8]) -> SkiffResult<Vec<Vec<u8>>> {
        let msg_type = payload
            .first()
            .copied()
            .and_then(MessageType::from_u8)
            .ok_or_else(|| SkiffError::Protocol("Empty connection message".to_string()))?;

        match msg_type {
            MessageType::ChannelOpen => self.on_open(payload),
            MessageType::ChannelOpenConfirmation => self.on_open_confirmation(payload),
            MessageType::ChannelOpenFailure => self.on_open_failure(payload),
            MessageType::ChannelWindowAdjust => self.on_window_adjust(payload),
            MessageType::ChannelData => self.on_data(payload),
            MessageType::ChannelExtendedData => self.on_extended_data(payload),
            MessageType::ChannelEof => self.on_eof(payload),
            MessageType::ChannelClose => self.on_close(payload),
            MessageType::ChannelRequest => self.on_request(payload),
            MessageType::ChannelSuccess => self.on_reply(payload, true),
            MessageType::ChannelFailure => self.on_reply(payload, false),
            other => Err(SkiffError::Protocol(format!(
                "Message {} is not a channel message",
                other
            ))),
        }
    }

    fn on_open(&mut self, payload: &[u8]) -> SkiffResult<Vec<Vec<u8>>> {
        let open = ChannelOpen::from_bytes(payload)?;
        let type_name = open.channel_type.name().to_string();

        if !self.accepted_types.iter().any(|t| t == &type_name) {
            warn!(channel_type = %type_name, "rejecting channel open");
            return Ok(vec![ChannelOpenFailure::new(
                open.sender_channel,
                OpenFailureReason::UnknownChannelType,
                &format!("Channel type '{}' not supported", type_name),
            )
            .to_bytes()]);
        }

        let local_id = self.allocate_slot();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut channel = Channel::new(local_id, &type_name, self.initial_window, self.max_packet);
        channel.confirm(
            open.sender_channel,
            open.initial_window_size,
            open.maximum_packet_size,
        );
        let remote_window = channel.remote_window();
        let remote_max_packet = channel.remote_max_packet();

        let confirmation = ChannelOpenConfirmation {
            recipient_channel: open.sender_channel,
            sender_channel: local_id,
            initial_window_size: self.initial_window,
            maximum_packet_size: self.max_packet,
        };

        self.slots[local_id as usize] = Some(Entry {
            channel,
            events: tx,
        });

        debug!(local_id, remote_id = open.sender_channel, channel_type = %type_name, "inbound channel accepted");

        if self
            .inbound_opens
            .send(InboundOpen {
                local_id,
                remote_id: open.sender_channel,
                channel_type: open.channel_type,
                events: rx,
                remote_window,
                remote_max_packet,
            })
            .is_err()
        {
            // Session owner is gone; refuse the open
            self.release(local_id);
            return Ok(vec![ChannelOpenFailure::new(
                open.sender_channel,
                OpenFailureReason::ResourceShortage,
                "No channel acceptor",
            )
            .to_bytes()]);
        }

        Ok(vec![confirmation.to_bytes()])
    }

    fn on_open_confirmation(&mut self, payload: &[u8]) -> SkiffResult<Vec<Vec<u8>>> {
        let confirmation = ChannelOpenConfirmation::from_bytes(payload)?;
        let entry = self.entry(confirmation.recipient_channel)?;
        entry.channel.confirm(
            confirmation.sender_channel,
            confirmation.initial_window_size,
            confirmation.maximum_packet_size,
        );
        let _ = entry.events.send(ChannelEvent::Opened);
        Ok(Vec::new())
    }

    fn on_open_failure(&mut self, payload: &[u8]) -> SkiffResult<Vec<Vec<u8>>> {
        let failure = ChannelOpenFailure::from_bytes(payload)?;
        let local_id = failure.recipient_channel;
        let entry = self.entry(local_id)?;
        let _ = entry.events.send(ChannelEvent::OpenFailed {
            reason: failure.reason as u32,
            description: failure.description,
        });
        self.release(local_id);
        Ok(Vec::new())
    }

    fn on_window_adjust(&mut self, payload: &[u8]) -> SkiffResult<Vec<Vec<u8>>> {
        let adjust = ChannelWindowAdjust::from_bytes(payload)?;
        let entry = self.entry(adjust.recipient_channel)?;
        entry.channel.remote_window().grant(adjust.bytes_to_add);
        Ok(Vec::new())
    }

    fn on_data(&mut self, payload: &[u8]) -> SkiffResult<Vec<Vec<u8>>> {
        let data = ChannelData::from_bytes(payload)?;
        let local_id = data.recipient_channel;
        let entry = self.entry(local_id)?;

        entry.channel.accept_data(data.data.len())?;
        let _ = entry.events.send(ChannelEvent::Data(data.data));

        Ok(self.window_adjust_packet(local_id))
    }

    fn on_extended_data(&mut self, payload: &[u8]) -> SkiffResult<Vec<Vec<u8>>> {
        let data = ChannelExtendedData::from_bytes(payload)?;
        let local_id = data.recipient_channel;
        let entry = self.entry(local_id)?;

        entry.channel.accept_data(data.data.len())?;
        let _ = entry.events.send(ChannelEvent::ExtendedData {
            data_type: data.data_type,
            data: data.data,
        });

        Ok(self.window_adjust_packet(local_id))
    }

    fn window_adjust_packet(&mut self, local_id: u32) -> Vec<Vec<u8>> {
        let entry = match self.slots.get_mut(local_id as usize).and_then(|s| s.as_mut()) {
            Some(e) => e,
            None => return Vec::new(),
        };
        match entry.channel.take_window_adjustment() {
            Some(grant) => vec![ChannelWindowAdjust {
                recipient_channel: entry.channel.remote_id(),
                bytes_to_add: grant,
            }
            .to_bytes()],
            None => Vec::new(),
        }
    }

    fn on_eof(&mut self, payload: &[u8]) -> SkiffResult<Vec<Vec<u8>>> {
        let eof = ChannelEof::from_bytes(payload)?;
        let entry = self.entry(eof.recipient_channel)?;
        entry.channel.mark_eof_received();
        let _ = entry.events.send(ChannelEvent::Eof);
        Ok(Vec::new())
    }

    fn on_close(&mut self, payload: &[u8]) -> SkiffResult<Vec<Vec<u8>>> {
        let close = ChannelClose::from_bytes(payload)?;
        let local_id = close.recipient_channel;
        let entry = self.entry(local_id)?;

        let mut packets = Vec::new();
        let done = if entry.channel.close_sent() {
            entry.channel.mark_close_received()
        } else {
            // Echo the close for our side
            packets.push(
                ChannelClose {
                    recipient_channel: entry.channel.remote_id(),
                }
                .to_bytes(),
            );
            entry.channel.mark_close_sent();
            entry.channel.mark_close_received()
        };

        if done {
            let _ = entry.events.send(ChannelEvent::Closed);
            self.release(local_id);
        }
        Ok(packets)
    }

    fn on_request(&mut self, payload: &[u8]) -> SkiffResult<Vec<Vec<u8>>> {
        let request = ChannelRequest::from_bytes(payload)?;
        let entry = self.entry(request.recipient_channel)?;
        let _ = entry.events.send(ChannelEvent::Request {
            request: request.request,
            want_reply: request.want_reply,
        });
        Ok(Vec::new())
    }

    fn on_reply(&mut self, payload: &[u8], success: bool) -> SkiffResult<Vec<Vec<u8>>> {
        let local_id = if success {
            ChannelSuccess::from_bytes(payload)?.recipient_channel
        } else {
            ChannelFailure::from_bytes(payload)?.recipient_channel
        };
        let entry = self.entry(local_id)?;
        let event = if success {
            ChannelEvent::ReplySuccess
        } else {
            ChannelEvent::ReplyFailure
        };
        let _ = entry.events.send(event);
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_mux() -> (ChannelMux, mpsc::UnboundedReceiver<InboundOpen>) {
        ChannelMux::new(1024, 256, vec!["session".to_string()])
    }

    fn client_mux() -> (ChannelMux, mpsc::UnboundedReceiver<InboundOpen>) {
        ChannelMux::new(1024, 256, Vec::new())
    }

    #[test]
    fn test_outbound_open_confirm_flow() {
        let (mut mux, _opens) = client_mux();
        let (local_id, mut events, open_packet) = mux.open_channel(ChannelType::Session);
        assert_eq!(local_id, 0);
        assert_eq!(open_packet[0], 90);

        // Peer confirms with its own id 5
        let confirmation = ChannelOpenConfirmation {
            recipient_channel: local_id,
            sender_channel: 5,
            initial_window_size: 4096,
            maximum_packet_size: 512,
        };
        let out = mux.handle_message(&confirmation.to_bytes()).unwrap();
        assert!(out.is_empty());
        assert!(matches!(events.try_recv().unwrap(), ChannelEvent::Opened));

        let (remote_id, window, max_packet) = mux.channel_info(local_id).unwrap();
        assert_eq!(remote_id, 5);
        assert_eq!(window.available(), 4096);
        assert_eq!(max_packet, 512);
    }

    #[test]
    fn test_inbound_open_accepted_for_session() {
        let (mut mux, mut opens) = server_mux();
        let open = ChannelOpen::new(ChannelType::Session, 9, 8192, 1024);

        let out = mux.handle_message(&open.to_bytes()).unwrap();
        assert_eq!(out.len(), 1);
        let confirmation = ChannelOpenConfirmation::from_bytes(&out[0]).unwrap();
        assert_eq!(confirmation.recipient_channel, 9);
        assert_eq!(confirmation.initial_window_size, 1024);

        let inbound = opens.try_recv().unwrap();
        assert_eq!(inbound.remote_id, 9);
        assert_eq!(inbound.remote_max_packet, 1024);
        assert_eq!(inbound.remote_window.available(), 8192);
    }

    #[test]
    fn test_inbound_open_rejected_for_unknown_type() {
        let (mut mux, _opens) = client_mux();
        let open = ChannelOpen::new(ChannelType::Session, 9, 8192, 1024);

        let out = mux.handle_message(&open.to_bytes()).unwrap();
        assert_eq!(out.len(), 1);
        let failure = ChannelOpenFailure::from_bytes(&out[0]).unwrap();
        assert_eq!(failure.reason, OpenFailureReason::UnknownChannelType);
        assert!(mux.is_empty());
    }

    #[test]
    fn test_data_delivery_and_window_accounting() {
        let (mut mux, mut opens) = server_mux();
        let open = ChannelOpen::new(ChannelType::Session, 0, 8192, 1024);
        mux.handle_message(&open.to_bytes()).unwrap();
        let mut inbound = opens.try_recv().unwrap();

        let data = ChannelData::new(inbound.local_id, vec![7u8; 100]);
        let out = mux.handle_message(&data.to_bytes()).unwrap();
        assert!(out.is_empty()); // window still above half

        match inbound.events.try_recv().unwrap() {
            ChannelEvent::Data(d) => assert_eq!(d.len(), 100),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_window_adjust_emitted_below_half() {
        let (mut mux, mut opens) = server_mux();
        let open = ChannelOpen::new(ChannelType::Session, 0, 8192, 1024);
        mux.handle_message(&open.to_bytes()).unwrap();
        let inbound = opens.try_recv().unwrap();

        // Local window is 1024; drain 768 bytes in chunks of 256
        let mut adjusts = Vec::new();
        for _ in 0..3 {
            let data = ChannelData::new(inbound.local_id, vec![0u8; 256]);
            adjusts.extend(mux.handle_message(&data.to_bytes()).unwrap());
        }
        assert_eq!(adjusts.len(), 1);
        let adjust = ChannelWindowAdjust::from_bytes(&adjusts[0]).unwrap();
        assert_eq!(adjust.bytes_to_add, 768);
    }

    #[test]
    fn test_data_after_eof_is_channel_error() {
        let (mut mux, mut opens) = server_mux();
        let open = ChannelOpen::new(ChannelType::Session, 0, 8192, 1024);
        mux.handle_message(&open.to_bytes()).unwrap();
        let inbound = opens.try_recv().unwrap();

        mux.handle_message(
            &ChannelEof {
                recipient_channel: inbound.local_id,
            }
            .to_bytes(),
        )
        .unwrap();

        let data = ChannelData::new(inbound.local_id, vec![1]);
        let err = mux.handle_message(&data.to_bytes()).unwrap_err();
        assert!(matches!(err, SkiffError::Channel { .. }));
    }

    #[test]
    fn test_close_echo_and_slot_reuse() {
        let (mut mux, mut opens) = server_mux();
        let open = ChannelOpen::new(ChannelType::Session, 0, 8192, 1024);
        mux.handle_message(&open.to_bytes()).unwrap();
        let inbound = opens.try_recv().unwrap();
        let local_id = inbound.local_id;

        // Peer closes first; we echo and the slot frees
        let out = mux
            .handle_message(
                &ChannelClose {
                    recipient_channel: local_id,
                }
                .to_bytes(),
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][0], 97);
        assert!(mux.is_empty());

        // The freed local id is allocated again
        let (new_id, _events, _packet) = mux.open_channel(ChannelType::Session);
        assert_eq!(new_id, local_id);
    }

    #[test]
    fn test_unknown_channel_id_is_channel_error() {
        let (mut mux, _opens) = server_mux();
        let data = ChannelData::new(41, vec![1]);
        let err = mux.handle_message(&data.to_bytes()).unwrap_err();
        assert!(matches!(err, SkiffError::Channel { id: 41, .. }));
    }

    #[test]
    fn test_request_events_in_fifo_order() {
        let (mut mux, mut opens) = server_mux();
        let open = ChannelOpen::new(ChannelType::Session, 0, 8192, 1024);
        mux.handle_message(&open.to_bytes()).unwrap();
        let mut inbound = opens.try_recv().unwrap();

        for command in ["first", "second"] {
            let request = ChannelRequest::new(
                inbound.local_id,
                true,
                ChannelRequestType::Exec {
                    command: command.to_string(),
                },
            );
            mux.handle_message(&request.to_bytes()).unwrap();
        }

        for expected in ["first", "second"] {
            match inbound.events.try_recv().unwrap() {
                ChannelEvent::Request {
                    request: ChannelRequestType::Exec { command },
                    want_reply: true,
                } => assert_eq!(command, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_force_close_notifies_handler() {
        let (mut mux, mut opens) = server_mux();
        let open = ChannelOpen::new(ChannelType::Session, 0, 8192, 1024);
        mux.handle_message(&open.to_bytes()).unwrap();
        let mut inbound = opens.try_recv().unwrap();

        let close_packet = mux.force_close(inbound.local_id);
        assert!(close_packet.is_some());
        assert!(matches!(
            inbound.events.try_recv().unwrap(),
            ChannelEvent::Closed
        ));
        assert!(mux.is_empty());
    }

    #[test]
    fn test_reply_events() {
        let (mut mux, _opens) = client_mux();
        let (local_id, mut events, _open) = mux.open_channel(ChannelType::Session);
        let confirmation = ChannelOpenConfirmation {
            recipient_channel: local_id,
            sender_channel: 3,
            initial_window_size: 1024,
            maximum_packet_size: 256,
        };
        mux.handle_message(&confirmation.to_bytes()).unwrap();
        let _ = events.try_recv();

        mux.handle_message(
            &ChannelSuccess {
                recipient_channel: local_id,
            }
            .to_bytes(),
        )
        .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            ChannelEvent::ReplySuccess
        ));
    }
}
