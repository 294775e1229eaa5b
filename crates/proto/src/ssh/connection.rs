//! Connection protocol message codecs (RFC 4254).
//!
//! Channels multiplex logical streams over one transport. This module
//! holds the wire codecs only: open/confirm/failure handshakes, window
//! adjustment, data and extended data, EOF/close, the channel request
//! catalog (pty-req, env, shell, exec, subsystem, window-change, signal,
//! exit-status, exit-signal), and global requests. Channel bookkeeping
//! lives in [`crate::ssh::channel`] and [`crate::ssh::mux`].

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::message::MessageType;
use crate::ssh::wire;

/// Upper bound we accept for a peer's initial window (16 MiB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Upper bound we accept for a peer's maximum packet size (256 KiB).
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Extended data type code for stderr (RFC 4254 Section 5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel type with its type-specific open payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Interactive session (exec, shell, subsystem).
    Session,
    /// Outbound TCP forwarding.
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Inbound (reverse) TCP forwarding.
    ForwardedTcpip {
        /// Address that was connected to
        connected_address: String,
        /// Port that was connected to
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// X11 display forwarding.
    X11 {
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
}

impl ChannelType {
    /// Returns the channel type's wire name.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::X11 { .. } => "x11",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type and type-specific data.
    pub channel_type: ChannelType,
    /// Sender's channel id.
    pub sender_channel: u32,
    /// Sender's initial window size.
    pub initial_window_size: u32,
    /// Sender's maximum packet size.
    pub maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a channel open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        wire::put_str(&mut buf, self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);

        match &self.channel_type {
            ChannelType::Session => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                wire::put_str(&mut buf, host);
                buf.put_u32(*port);
                wire::put_str(&mut buf, originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                wire::put_str(&mut buf, connected_address);
                buf.put_u32(*connected_port);
                wire::put_str(&mut buf, originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                wire::put_str(&mut buf, originator_address);
                buf.put_u32(*originator_port);
            }
        }

        buf.to_vec()
    }

    /// Parses from bytes, validating window and packet limits.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelOpen as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_CHANNEL_OPEN".to_string(),
            ));
        }
        let mut offset = 1;
        let type_name = wire::get_str(data, &mut offset)?.to_string();
        let sender_channel = wire::get_u32(data, &mut offset)?;
        let initial_window_size = wire::get_u32(data, &mut offset)?;
        let maximum_packet_size = wire::get_u32(data, &mut offset)?;

        if initial_window_size > MAX_WINDOW_SIZE {
            return Err(SkiffError::Protocol(format!(
                "Initial window size {} exceeds maximum {}",
                initial_window_size, MAX_WINDOW_SIZE
            )));
        }
        if maximum_packet_size > MAX_PACKET_SIZE {
            return Err(SkiffError::Protocol(format!(
                "Maximum packet size {} exceeds maximum {}",
                maximum_packet_size, MAX_PACKET_SIZE
            )));
        }

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: wire::get_str(data, &mut offset)?.to_string(),
                port: wire::get_u32(data, &mut offset)?,
                originator_address: wire::get_str(data, &mut offset)?.to_string(),
                originator_port: wire::get_u32(data, &mut offset)?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: wire::get_str(data, &mut offset)?.to_string(),
                connected_port: wire::get_u32(data, &mut offset)?,
                originator_address: wire::get_str(data, &mut offset)?.to_string(),
                originator_port: wire::get_u32(data, &mut offset)?,
            },
            "x11" => ChannelType::X11 {
                originator_address: wire::get_str(data, &mut offset)?.to_string(),
                originator_port: wire::get_u32(data, &mut offset)?,
            },
            other => {
                return Err(SkiffError::Channel {
                    id: sender_channel,
                    reason: format!("Unknown channel type '{}'", other),
                })
            }
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Opener's channel id.
    pub recipient_channel: u32,
    /// Confirmer's channel id.
    pub sender_channel: u32,
    /// Confirmer's initial window size.
    pub initial_window_size: u32,
    /// Confirmer's maximum packet size.
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelOpenConfirmation as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_CHANNEL_OPEN_CONFIRMATION".to_string(),
            ));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::get_u32(data, &mut offset)?,
            sender_channel: wire::get_u32(data, &mut offset)?,
            initial_window_size: wire::get_u32(data, &mut offset)?,
            maximum_packet_size: wire::get_u32(data, &mut offset)?,
        })
    }
}

/// CHANNEL_OPEN_FAILURE reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpenFailureReason {
    /// Administratively prohibited.
    AdministrativelyProhibited = 1,
    /// Connect failed (forwarding targets).
    ConnectFailed = 2,
    /// Unknown channel type.
    UnknownChannelType = 3,
    /// Resource shortage.
    ResourceShortage = 4,
}

impl OpenFailureReason {
    /// Converts a wire code, defaulting unknown codes to
    /// `AdministrativelyProhibited`.
    pub fn from_u32(code: u32) -> Self {
        match code {
            2 => Self::ConnectFailed,
            3 => Self::UnknownChannelType,
            4 => Self::ResourceShortage,
            _ => Self::AdministrativelyProhibited,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Opener's channel id.
    pub recipient_channel: u32,
    /// Failure reason.
    pub reason: OpenFailureReason,
    /// Human-readable description.
    pub description: String,
}

impl ChannelOpenFailure {
    /// Creates an open failure.
    pub fn new(recipient_channel: u32, reason: OpenFailureReason, description: &str) -> Self {
        Self {
            recipient_channel,
            reason,
            description: description.to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason as u32);
        wire::put_str(&mut buf, &self.description);
        wire::put_str(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelOpenFailure as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_CHANNEL_OPEN_FAILURE".to_string(),
            ));
        }
        let mut offset = 1;
        let recipient_channel = wire::get_u32(data, &mut offset)?;
        let reason = OpenFailureReason::from_u32(wire::get_u32(data, &mut offset)?);
        let description = wire::get_str(data, &mut offset)?.to_string();
        Ok(Self {
            recipient_channel,
            reason,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Receiver's channel id.
    pub recipient_channel: u32,
    /// Bytes to add to the window. Strictly additive.
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelWindowAdjust as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_CHANNEL_WINDOW_ADJUST".to_string(),
            ));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::get_u32(data, &mut offset)?,
            bytes_to_add: wire::get_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Receiver's channel id.
    pub recipient_channel: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Creates a data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        wire::put_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelData as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_CHANNEL_DATA".to_string(),
            ));
        }
        let mut offset = 1;
        let recipient_channel = wire::get_u32(data, &mut offset)?;
        let payload = wire::get_string(data, &mut offset)?.to_vec();
        Ok(Self {
            recipient_channel,
            data: payload,
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA (stderr).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Receiver's channel id.
    pub recipient_channel: u32,
    /// Data type code ([`EXTENDED_DATA_STDERR`]).
    pub data_type: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type);
        wire::put_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelExtendedData as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_CHANNEL_EXTENDED_DATA".to_string(),
            ));
        }
        let mut offset = 1;
        let recipient_channel = wire::get_u32(data, &mut offset)?;
        let data_type = wire::get_u32(data, &mut offset)?;
        let payload = wire::get_string(data, &mut offset)?.to_vec();
        Ok(Self {
            recipient_channel,
            data_type,
            data: payload,
        })
    }
}

/// SSH_MSG_CHANNEL_EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEof {
    /// Receiver's channel id.
    pub recipient_channel: u32,
}

impl ChannelEof {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelEof as u8);
        buf.put_u32(self.recipient_channel);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelEof as u8 {
            return Err(SkiffError::Protocol("Expected SSH_MSG_CHANNEL_EOF".to_string()));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::get_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClose {
    /// Receiver's channel id.
    pub recipient_channel: u32,
}

impl ChannelClose {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelClose as u8);
        buf.put_u32(self.recipient_channel);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelClose as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_CHANNEL_CLOSE".to_string(),
            ));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::get_u32(data, &mut offset)?,
        })
    }
}

/// The channel request catalog (RFC 4254 Sections 6.2-6.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Allocate a pseudo-terminal.
    PtyReq {
        /// TERM environment value
        term: String,
        /// Terminal width, characters
        width_chars: u32,
        /// Terminal height, rows
        height_rows: u32,
        /// Terminal width, pixels
        width_px: u32,
        /// Terminal height, pixels
        height_px: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Pass an environment variable.
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Start the user's shell.
    Shell,
    /// Execute a command.
    Exec {
        /// Command line
        command: String,
    },
    /// Start a named subsystem.
    Subsystem {
        /// Subsystem name (e.g., "sftp")
        name: String,
    },
    /// Terminal dimensions changed.
    WindowChange {
        /// Terminal width, characters
        width_chars: u32,
        /// Terminal height, rows
        height_rows: u32,
        /// Terminal width, pixels
        width_px: u32,
        /// Terminal height, pixels
        height_px: u32,
    },
    /// Deliver a signal to the remote process.
    Signal {
        /// Signal name without the SIG prefix
        name: String,
    },
    /// Report the remote process exit status.
    ExitStatus {
        /// Exit status
        status: u32,
    },
    /// Report the remote process termination by signal.
    ExitSignal {
        /// Signal name without the SIG prefix
        name: String,
        /// Whether a core was dumped
        core_dumped: bool,
        /// Error message
        message: String,
    },
    /// A request type we do not recognize; carried opaquely so the
    /// handler can refuse it.
    Unknown {
        /// Request type name
        name: String,
        /// Raw type-specific payload
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type's wire name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Unknown { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Receiver's channel id.
    pub recipient_channel: u32,
    /// Whether a SUCCESS/FAILURE reply is expected.
    pub want_reply: bool,
    /// The request itself.
    pub request: ChannelRequestType,
}

impl ChannelRequest {
    /// Creates a channel request.
    pub fn new(recipient_channel: u32, want_reply: bool, request: ChannelRequestType) -> Self {
        Self {
            recipient_channel,
            want_reply,
            request,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        wire::put_str(&mut buf, self.request.name());
        wire::put_bool(&mut buf, self.want_reply);

        match &self.request {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_px,
                height_px,
                modes,
            } => {
                wire::put_str(&mut buf, term);
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_px);
                buf.put_u32(*height_px);
                wire::put_string(&mut buf, modes);
            }
            ChannelRequestType::Env { name, value } => {
                wire::put_str(&mut buf, name);
                wire::put_str(&mut buf, value);
            }
            ChannelRequestType::Shell => {}
            ChannelRequestType::Exec { command } => wire::put_str(&mut buf, command),
            ChannelRequestType::Subsystem { name } => wire::put_str(&mut buf, name),
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_px,
                height_px,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_px);
                buf.put_u32(*height_px);
            }
            ChannelRequestType::Signal { name } => wire::put_str(&mut buf, name),
            ChannelRequestType::ExitStatus { status } => buf.put_u32(*status),
            ChannelRequestType::ExitSignal {
                name,
                core_dumped,
                message,
            } => {
                wire::put_str(&mut buf, name);
                wire::put_bool(&mut buf, *core_dumped);
                wire::put_str(&mut buf, message);
                wire::put_str(&mut buf, "");
            }
            ChannelRequestType::Unknown { data, .. } => buf.put_slice(data),
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelRequest as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_CHANNEL_REQUEST".to_string(),
            ));
        }
        let mut offset = 1;
        let recipient_channel = wire::get_u32(data, &mut offset)?;
        let type_name = wire::get_str(data, &mut offset)?.to_string();
        let want_reply = wire::get_bool(data, &mut offset)?;

        let request = match type_name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: wire::get_str(data, &mut offset)?.to_string(),
                width_chars: wire::get_u32(data, &mut offset)?,
                height_rows: wire::get_u32(data, &mut offset)?,
                width_px: wire::get_u32(data, &mut offset)?,
                height_px: wire::get_u32(data, &mut offset)?,
                modes: wire::get_string(data, &mut offset)?.to_vec(),
            },
            "env" => ChannelRequestType::Env {
                name: wire::get_str(data, &mut offset)?.to_string(),
                value: wire::get_str(data, &mut offset)?.to_string(),
            },
            "shell" => ChannelRequestType::Shell,
            "exec" => ChannelRequestType::Exec {
                command: wire::get_str(data, &mut offset)?.to_string(),
            },
            "subsystem" => ChannelRequestType::Subsystem {
                name: wire::get_str(data, &mut offset)?.to_string(),
            },
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: wire::get_u32(data, &mut offset)?,
                height_rows: wire::get_u32(data, &mut offset)?,
                width_px: wire::get_u32(data, &mut offset)?,
                height_px: wire::get_u32(data, &mut offset)?,
            },
            "signal" => ChannelRequestType::Signal {
                name: wire::get_str(data, &mut offset)?.to_string(),
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                status: wire::get_u32(data, &mut offset)?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                name: wire::get_str(data, &mut offset)?.to_string(),
                core_dumped: wire::get_bool(data, &mut offset)?,
                message: wire::get_str(data, &mut offset)?.to_string(),
            },
            _ => ChannelRequestType::Unknown {
                name: type_name,
                data: data[offset..].to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            want_reply,
            request,
        })
    }
}

/// SSH_MSG_CHANNEL_SUCCESS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSuccess {
    /// Receiver's channel id.
    pub recipient_channel: u32,
}

impl ChannelSuccess {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelSuccess as u8);
        buf.put_u32(self.recipient_channel);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelSuccess as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_CHANNEL_SUCCESS".to_string(),
            ));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::get_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFailure {
    /// Receiver's channel id.
    pub recipient_channel: u32,
}

impl ChannelFailure {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelFailure as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_CHANNEL_FAILURE".to_string(),
            ));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::get_u32(data, &mut offset)?,
        })
    }
}

/// Global request catalog (RFC 4254 Section 4, Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestType {
    /// Ask the peer to listen for forwarded connections.
    TcpipForward {
        /// Address to bind
        address: String,
        /// Port to bind (0 lets the peer pick)
        port: u32,
    },
    /// Cancel an earlier forward.
    CancelTcpipForward {
        /// Bound address
        address: String,
        /// Bound port
        port: u32,
    },
    /// A request type we do not recognize.
    Unknown {
        /// Request name
        name: String,
        /// Raw payload
        data: Vec<u8>,
    },
}

impl GlobalRequestType {
    /// Returns the request's wire name.
    pub fn name(&self) -> &str {
        match self {
            GlobalRequestType::TcpipForward { .. } => "tcpip-forward",
            GlobalRequestType::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            GlobalRequestType::Unknown { name, .. } => name,
        }
    }
}

/// SSH_MSG_GLOBAL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Whether a reply is expected.
    pub want_reply: bool,
    /// The request itself.
    pub request: GlobalRequestType,
}

impl GlobalRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        wire::put_str(&mut buf, self.request.name());
        wire::put_bool(&mut buf, self.want_reply);
        match &self.request {
            GlobalRequestType::TcpipForward { address, port }
            | GlobalRequestType::CancelTcpipForward { address, port } => {
                wire::put_str(&mut buf, address);
                buf.put_u32(*port);
            }
            GlobalRequestType::Unknown { data, .. } => buf.put_slice(data),
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::GlobalRequest as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_GLOBAL_REQUEST".to_string(),
            ));
        }
        let mut offset = 1;
        let name = wire::get_str(data, &mut offset)?.to_string();
        let want_reply = wire::get_bool(data, &mut offset)?;

        let request = match name.as_str() {
            "tcpip-forward" => GlobalRequestType::TcpipForward {
                address: wire::get_str(data, &mut offset)?.to_string(),
                port: wire::get_u32(data, &mut offset)?,
            },
            "cancel-tcpip-forward" => GlobalRequestType::CancelTcpipForward {
                address: wire::get_str(data, &mut offset)?.to_string(),
                port: wire::get_u32(data, &mut offset)?,
            },
            _ => GlobalRequestType::Unknown {
                name,
                data: data[offset..].to_vec(),
            },
        };

        Ok(Self {
            want_reply,
            request,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_session_round_trip() {
        let open = ChannelOpen::new(ChannelType::Session, 0, 2 * 1024 * 1024, 32768);
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
    }

    #[test]
    fn test_open_direct_tcpip_round_trip() {
        let open = ChannelOpen::new(
            ChannelType::DirectTcpip {
                host: "internal.example".to_string(),
                port: 8080,
                originator_address: "10.0.0.1".to_string(),
                originator_port: 52100,
            },
            3,
            65536,
            16384,
        );
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
    }

    #[test]
    fn test_open_rejects_oversized_window() {
        let open = ChannelOpen::new(ChannelType::Session, 0, MAX_WINDOW_SIZE, 32768);
        let mut bytes = open.to_bytes();
        // Window field sits after type name string and sender id
        let window_offset = 1 + 4 + 7 + 4;
        bytes[window_offset..window_offset + 4]
            .copy_from_slice(&(MAX_WINDOW_SIZE + 1).to_be_bytes());
        assert!(ChannelOpen::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_open_unknown_type_carries_channel_id() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        wire::put_str(&mut buf, "tunnel@example.org");
        buf.put_u32(42);
        buf.put_u32(1024);
        buf.put_u32(1024);

        match ChannelOpen::from_bytes(&buf) {
            Err(SkiffError::Channel { id, .. }) => assert_eq!(id, 42),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_confirmation_round_trip() {
        let msg = ChannelOpenConfirmation {
            recipient_channel: 1,
            sender_channel: 2,
            initial_window_size: 1024,
            maximum_packet_size: 512,
        };
        assert_eq!(ChannelOpenConfirmation::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_open_failure_round_trip() {
        let msg = ChannelOpenFailure::new(7, OpenFailureReason::UnknownChannelType, "no such type");
        let parsed = ChannelOpenFailure::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_data_round_trip() {
        let msg = ChannelData::new(5, b"stream bytes".to_vec());
        assert_eq!(ChannelData::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_extended_data_round_trip() {
        let msg = ChannelExtendedData {
            recipient_channel: 5,
            data_type: EXTENDED_DATA_STDERR,
            data: b"error text".to_vec(),
        };
        assert_eq!(ChannelExtendedData::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_request_catalog_round_trips() {
        let requests = vec![
            ChannelRequestType::PtyReq {
                term: "xterm-256color".to_string(),
                width_chars: 80,
                height_rows: 24,
                width_px: 0,
                height_px: 0,
                modes: vec![0],
            },
            ChannelRequestType::Env {
                name: "LANG".to_string(),
                value: "C.UTF-8".to_string(),
            },
            ChannelRequestType::Shell,
            ChannelRequestType::Exec {
                command: "uname -a".to_string(),
            },
            ChannelRequestType::Subsystem {
                name: "sftp".to_string(),
            },
            ChannelRequestType::WindowChange {
                width_chars: 120,
                height_rows: 40,
                width_px: 0,
                height_px: 0,
            },
            ChannelRequestType::Signal {
                name: "TERM".to_string(),
            },
            ChannelRequestType::ExitStatus { status: 0 },
            ChannelRequestType::ExitSignal {
                name: "KILL".to_string(),
                core_dumped: false,
                message: "killed".to_string(),
            },
        ];

        for request in requests {
            let msg = ChannelRequest::new(3, true, request.clone());
            let parsed = ChannelRequest::from_bytes(&msg.to_bytes()).unwrap();
            assert_eq!(parsed, msg, "request {}", request.name());
        }
    }

    #[test]
    fn test_unknown_request_preserved() {
        let msg = ChannelRequest::new(
            1,
            true,
            ChannelRequestType::Unknown {
                name: "auth-agent-req@openssh.com".to_string(),
                data: vec![],
            },
        );
        let parsed = ChannelRequest::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.request.name(), "auth-agent-req@openssh.com");
    }

    #[test]
    fn test_global_request_round_trip() {
        let msg = GlobalRequest {
            want_reply: true,
            request: GlobalRequestType::TcpipForward {
                address: "0.0.0.0".to_string(),
                port: 2222,
            },
        };
        assert_eq!(GlobalRequest::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_eof_close_success_failure_round_trips() {
        assert_eq!(
            ChannelEof::from_bytes(&ChannelEof { recipient_channel: 9 }.to_bytes()).unwrap(),
            ChannelEof { recipient_channel: 9 }
        );
        assert_eq!(
            ChannelClose::from_bytes(&ChannelClose { recipient_channel: 9 }.to_bytes()).unwrap(),
            ChannelClose { recipient_channel: 9 }
        );
        assert_eq!(
            ChannelSuccess::from_bytes(&ChannelSuccess { recipient_channel: 9 }.to_bytes())
                .unwrap(),
            ChannelSuccess { recipient_channel: 9 }
        );
        assert_eq!(
            ChannelFailure::from_bytes(&ChannelFailure { recipient_channel: 9 }.to_bytes())
                .unwrap(),
            ChannelFailure { recipient_channel: 9 }
        );
    }

    #[test]
    fn test_window_adjust_round_trip() {
        let msg = ChannelWindowAdjust {
            recipient_channel: 2,
            bytes_to_add: 4096,
        };
        assert_eq!(ChannelWindowAdjust::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }
}
