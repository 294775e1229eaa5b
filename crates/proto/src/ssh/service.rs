//! Service negotiation (RFC 4253 Section 10).
//!
//! After NEWKEYS the client asks for a named service. Before
//! authentication only `ssh-userauth` is acceptable; `ssh-connection` is
//! granted through USERAUTH rather than a second SERVICE_REQUEST in the
//! common path, but the request form is answered here too. Unknown names
//! disconnect with SERVICE_NOT_AVAILABLE.

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::message::MessageType;
use crate::ssh::wire;

/// The user authentication service name.
pub const SSH_USERAUTH: &str = "ssh-userauth";

/// The connection service name.
pub const SSH_CONNECTION: &str = "ssh-connection";

/// SSH_MSG_SERVICE_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Requested service name.
    pub service: String,
}

impl ServiceRequest {
    /// Creates a request for a service.
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ServiceRequest as u8);
        wire::put_str(&mut buf, &self.service);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ServiceRequest as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_SERVICE_REQUEST".to_string(),
            ));
        }
        let mut offset = 1;
        let service = wire::get_str(data, &mut offset)?.to_string();
        Ok(Self { service })
    }

    /// Validates the request against the authentication state.
    ///
    /// Pre-auth, only `ssh-userauth` may be requested; unknown names fail
    /// with a negotiation error mapped to SERVICE_NOT_AVAILABLE.
    pub fn check(&self, authenticated: bool) -> SkiffResult<()> {
        match self.service.as_str() {
            SSH_USERAUTH => Ok(()),
            SSH_CONNECTION if authenticated => Ok(()),
            SSH_CONNECTION => Err(SkiffError::Protocol(
                "ssh-connection requested before authentication".to_string(),
            )),
            other => Err(SkiffError::Negotiation(format!(
                "Unknown service '{}'",
                other
            ))),
        }
    }
}

/// SSH_MSG_SERVICE_ACCEPT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    /// Accepted service name.
    pub service: String,
}

impl ServiceAccept {
    /// Creates an accept for a service.
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ServiceAccept as u8);
        wire::put_str(&mut buf, &self.service);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::ServiceAccept as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_SERVICE_ACCEPT".to_string(),
            ));
        }
        let mut offset = 1;
        let service = wire::get_str(data, &mut offset)?.to_string();
        Ok(Self { service })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let req = ServiceRequest::new(SSH_USERAUTH);
        let parsed = ServiceRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(parsed.service, "ssh-userauth");
    }

    #[test]
    fn test_accept_round_trip() {
        let acc = ServiceAccept::new(SSH_CONNECTION);
        let parsed = ServiceAccept::from_bytes(&acc.to_bytes()).unwrap();
        assert_eq!(parsed.service, "ssh-connection");
    }

    #[test]
    fn test_userauth_allowed_pre_auth() {
        assert!(ServiceRequest::new(SSH_USERAUTH).check(false).is_ok());
    }

    #[test]
    fn test_connection_requires_auth() {
        assert!(ServiceRequest::new(SSH_CONNECTION).check(false).is_err());
        assert!(ServiceRequest::new(SSH_CONNECTION).check(true).is_ok());
    }

    #[test]
    fn test_unknown_service_rejected() {
        let err = ServiceRequest::new("ssh-telepathy").check(false).unwrap_err();
        assert!(matches!(err, SkiffError::Negotiation(_)));
    }
}
