//! SSH protocol message numbers and disconnect reason codes (RFC 4250).
//!
//! # Message Categories
//!
//! - **Transport layer generic** (1-19): disconnect, ignore, debug, service requests
//! - **Algorithm negotiation** (20-29): key exchange initialization
//! - **Key exchange method** (30-49): method-specific messages
//! - **User authentication generic** (50-79): authentication protocol
//! - **Connection protocol generic** (80-127): channel management
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! ```

/// SSH message types as defined in RFC 4250 Section 4.1.
///
/// Each message type has a unique numeric identifier used in the binary
/// protocol. Number 60 is method-specific in the userauth range: it carries
/// SSH_MSG_USERAUTH_PK_OK for "publickey" and SSH_MSG_USERAUTH_INFO_REQUEST
/// for "keyboard-interactive"; the variant here is named for the former.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to an unknown message number.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,
    /// Extension info (RFC 8308).
    ExtInfo = 7,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - marks the switch to freshly derived keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// DH/ECDH key exchange init (group14 and curve25519 share the number).
    KexdhInit = 30,
    /// DH/ECDH key exchange reply.
    KexdhReply = 31,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Public key OK / keyboard-interactive info request (method-specific).
    UserauthPkOk = 60,
    /// Keyboard-interactive info response.
    UserauthInfoResponse = 61,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Global request success.
    RequestSuccess = 81,
    /// Global request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            7 => Some(MessageType::ExtInfo),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::KexInit.name(), "SSH_MSG_KEXINIT");
    /// ```
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::ExtInfo => "SSH_MSG_EXT_INFO",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// SSH disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect.
    HostNotAllowedToConnect = 1,
    /// Protocol error.
    ProtocolError = 2,
    /// Key exchange failed.
    KeyExchangeFailed = 3,
    /// Reserved.
    Reserved = 4,
    /// MAC error.
    MacError = 5,
    /// Compression error.
    CompressionError = 6,
    /// Service not available.
    ServiceNotAvailable = 7,
    /// Protocol version not supported.
    ProtocolVersionNotSupported = 8,
    /// Host key not verifiable.
    HostKeyNotVerifiable = 9,
    /// Connection lost.
    ConnectionLost = 10,
    /// Disconnect by application.
    ByApplication = 11,
    /// Too many connections.
    TooManyConnections = 12,
    /// Auth cancelled by user.
    AuthCancelledByUser = 13,
    /// No more authentication methods available.
    NoMoreAuthMethodsAvailable = 14,
    /// Illegal user name.
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts a wire code to a reason, if known.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::HostNotAllowedToConnect),
            2 => Some(Self::ProtocolError),
            3 => Some(Self::KeyExchangeFailed),
            4 => Some(Self::Reserved),
            5 => Some(Self::MacError),
            6 => Some(Self::CompressionError),
            7 => Some(Self::ServiceNotAvailable),
            8 => Some(Self::ProtocolVersionNotSupported),
            9 => Some(Self::HostKeyNotVerifiable),
            10 => Some(Self::ConnectionLost),
            11 => Some(Self::ByApplication),
            12 => Some(Self::TooManyConnections),
            13 => Some(Self::AuthCancelledByUser),
            14 => Some(Self::NoMoreAuthMethodsAvailable),
            15 => Some(Self::IllegalUserName),
            _ => None,
        }
    }

    /// Returns the reason name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HostNotAllowedToConnect => "SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT",
            Self::ProtocolError => "SSH_DISCONNECT_PROTOCOL_ERROR",
            Self::KeyExchangeFailed => "SSH_DISCONNECT_KEY_EXCHANGE_FAILED",
            Self::Reserved => "SSH_DISCONNECT_RESERVED",
            Self::MacError => "SSH_DISCONNECT_MAC_ERROR",
            Self::CompressionError => "SSH_DISCONNECT_COMPRESSION_ERROR",
            Self::ServiceNotAvailable => "SSH_DISCONNECT_SERVICE_NOT_AVAILABLE",
            Self::ProtocolVersionNotSupported => "SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED",
            Self::HostKeyNotVerifiable => "SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE",
            Self::ConnectionLost => "SSH_DISCONNECT_CONNECTION_LOST",
            Self::ByApplication => "SSH_DISCONNECT_BY_APPLICATION",
            Self::TooManyConnections => "SSH_DISCONNECT_TOO_MANY_CONNECTIONS",
            Self::AuthCancelledByUser => "SSH_DISCONNECT_AUTH_CANCELLED_BY_USER",
            Self::NoMoreAuthMethodsAvailable => "SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE",
            Self::IllegalUserName => "SSH_DISCONNECT_ILLEGAL_USER_NAME",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(21), Some(MessageType::NewKeys));
        assert_eq!(MessageType::from_u8(61), Some(MessageType::UserauthInfoResponse));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Disconnect as u8, 1);
        assert_eq!(MessageType::KexInit as u8, 20);
        assert_eq!(MessageType::ChannelData as u8, 94);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_disconnect_reason_round_trip() {
        for code in 1..=15u32 {
            let reason = DisconnectReason::from_u32(code).unwrap();
            assert_eq!(reason as u32, code);
        }
        assert_eq!(DisconnectReason::from_u32(0), None);
        assert_eq!(DisconnectReason::from_u32(99), None);
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(
            format!("{}", DisconnectReason::KeyExchangeFailed),
            "SSH_DISCONNECT_KEY_EXCHANGE_FAILED(3)"
        );
    }
}
