//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and
//! server send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The server may send other CRLF-terminated lines before its version line
//! (a preamble); the client must not. The client side therefore skips
//! non-`SSH-` lines, up to a bounded count.
//!
//! # Security
//!
//! - Maximum line length: 255 bytes (DoS prevention)
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in the version string
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::version::Version;
//!
//! let version = Version::new("Skiff_0.4.0", Some("portable"));
//! assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.4.0 portable");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_9.6").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_9.6");
//! ```

use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum length of an SSH version line (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of preamble lines tolerated before the server's version
/// line. Bounds a hostile peer that never sends one.
pub const MAX_PREAMBLE_LINES: usize = 64;

/// SSH protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (e.g., "2.0")
    proto_version: String,
    /// Software version (e.g., "Skiff_0.4.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH version string with protocol version "2.0".
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Skiff_0.4.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.4.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default skiff version string.
    pub fn default_skiff() -> Self {
        Self::new(&format!("Skiff_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH version line (with or without trailing CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if:
    /// - the line is longer than 255 bytes
    /// - the line does not start with "SSH-"
    /// - the protocol version is not "2.0" or "1.99"
    /// - the line contains null bytes
    pub fn parse(line: &str) -> SkiffResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.len() > MAX_VERSION_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "Version line too long: {} bytes (maximum {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(SkiffError::Protocol(
                "Version line contains null byte".to_string(),
            ));
        }

        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            SkiffError::Protocol(format!("Version line does not start with SSH-: '{}'", line))
        })?;

        let (proto, software_and_comments) = rest.split_once('-').ok_or_else(|| {
            SkiffError::Protocol(format!("Version line missing software id: '{}'", line))
        })?;

        if proto != "2.0" && proto != "1.99" {
            return Err(SkiffError::Protocol(format!(
                "Unsupported protocol version: '{}'",
                proto
            )));
        }

        let (software, comments) = match software_and_comments.split_once(' ') {
            Some((sw, cm)) => (sw.to_string(), Some(cm.to_string())),
            None => (software_and_comments.to_string(), None),
        };

        if software.is_empty() {
            return Err(SkiffError::Protocol(
                "Empty software version".to_string(),
            ));
        }

        Ok(Self {
            proto_version: proto.to_string(),
            software_version: software,
            comments,
        })
    }

    /// Returns the protocol version ("2.0" or "1.99").
    pub fn protocol(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if present.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Returns the version line as sent on the wire, without CR LF.
    ///
    /// This is the exact byte string hashed into the KEX exchange hash.
    pub fn line(&self) -> String {
        self.to_string()
    }

    /// Writes the version line (with CR LF) to the stream.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> SkiffResult<()> {
        let line = format!("{}\r\n", self);
        w.write_all(line.as_bytes()).await?;
        w.flush().await?;
        Ok(())
    }

    /// Reads the peer's version line from the stream.
    ///
    /// When `allow_preamble` is true (client reading from a server), lines
    /// not starting with "SSH-" are skipped up to [`MAX_PREAMBLE_LINES`].
    /// Reads one byte at a time so no bytes past the CR LF are consumed;
    /// everything after the version line already belongs to the binary
    /// packet protocol.
    pub async fn read_from<R: AsyncRead + Unpin>(
        r: &mut R,
        allow_preamble: bool,
    ) -> SkiffResult<Self> {
        let mut preamble = 0usize;

        loop {
            let line = read_line(r).await?;

            if line.starts_with("SSH-") {
                return Self::parse(&line);
            }

            if !allow_preamble {
                return Err(SkiffError::Protocol(format!(
                    "Expected version line, got '{}'",
                    line.escape_default()
                )));
            }

            preamble += 1;
            if preamble > MAX_PREAMBLE_LINES {
                return Err(SkiffError::Protocol(
                    "Too many preamble lines before version line".to_string(),
                ));
            }
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Reads a single CRLF- or LF-terminated line, bounded at the maximum
/// version line length.
async fn read_line<R: AsyncRead + Unpin>(r: &mut R) -> SkiffResult<String> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        r.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_VERSION_LENGTH {
            return Err(SkiffError::Protocol(
                "Identification line too long".to_string(),
            ));
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }

    String::from_utf8(line)
        .map_err(|_| SkiffError::Protocol("Identification line is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        let version = Version::new("Skiff_0.4.0", None);
        assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.4.0");

        let version = Version::new("Skiff_0.4.0", Some("portable"));
        assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.4.0 portable");
    }

    #[test]
    fn test_parse_plain() {
        let version = Version::parse("SSH-2.0-OpenSSH_9.6\r\n").unwrap();
        assert_eq!(version.protocol(), "2.0");
        assert_eq!(version.software(), "OpenSSH_9.6");
        assert_eq!(version.comments(), None);
    }

    #[test]
    fn test_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_9.6 Ubuntu-3ubuntu13").unwrap();
        assert_eq!(version.software(), "OpenSSH_9.6");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu13"));
    }

    #[test]
    fn test_parse_legacy_199() {
        let version = Version::parse("SSH-1.99-OldServer").unwrap();
        assert_eq!(version.protocol(), "1.99");
    }

    #[test]
    fn test_parse_rejects_v1() {
        assert!(Version::parse("SSH-1.5-Ancient").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Version::parse("HTTP/1.1 200 OK").is_err());
        assert!(Version::parse("SSH-2.0-").is_err());
    }

    #[test]
    fn test_parse_rejects_too_long() {
        let line = format!("SSH-2.0-{}", "x".repeat(300));
        assert!(Version::parse(&line).is_err());
    }

    #[tokio::test]
    async fn test_read_skips_server_preamble() {
        let data = b"Welcome to the machine\r\nSSH-2.0-Skiff_0.4.0\r\n";
        let mut cursor = std::io::Cursor::new(&data[..]);
        let version = Version::read_from(&mut cursor, true).await.unwrap();
        assert_eq!(version.software(), "Skiff_0.4.0");
    }

    #[tokio::test]
    async fn test_read_rejects_client_preamble() {
        let data = b"hello\r\nSSH-2.0-Client\r\n";
        let mut cursor = std::io::Cursor::new(&data[..]);
        assert!(Version::read_from(&mut cursor, false).await.is_err());
    }

    #[tokio::test]
    async fn test_read_leaves_following_bytes() {
        let data = b"SSH-2.0-Peer\r\n\x00\x00\x00\x0c";
        let mut cursor = std::io::Cursor::new(&data[..]);
        let version = Version::read_from(&mut cursor, true).await.unwrap();
        assert_eq!(version.software(), "Peer");

        let mut rest = Vec::new();
        use tokio::io::AsyncReadExt;
        cursor.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, vec![0, 0, 0, 0x0c]);
    }
}
