//! Control-channel wire protocol and signaling vocabulary.
//!
//! Every tag and string field on the control channel is framed as a u16
//! big-endian length followed by that many UTF-8 bytes; file sizes travel as a
//! u64 big-endian. Signaling shares the `MSG` channel with ordinary chat: an
//! envelope is just a message whose content starts with a reserved,
//! pipe-delimited vocabulary. Envelopes are decoded into [`Signal`] right at
//! the transport boundary so the state machine never matches on raw strings.

use std::io;
use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame tag for chat and signaling payloads.
pub const TAG_MSG: &str = "MSG";

/// Frame tag for file transfers.
pub const TAG_FILE: &str = "FILE";

/// Upper bound on a single framed string field, enforced on both ends of the
/// wire.
pub const MAX_FIELD_BYTES: usize = 8 * 1024;

/// Write one length-prefixed string field. An over-long field fails before
/// anything is written.
pub async fn write_field<W>(writer: &mut W, field: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = field.as_bytes();
    if bytes.len() > MAX_FIELD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "field exceeds maximum length",
        ));
    }
    writer.write_u16(bytes.len() as u16).await?;
    writer.write_all(bytes).await
}

/// Read one length-prefixed string field.
pub async fn read_field<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    if len > MAX_FIELD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "field exceeds maximum length",
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "field is not valid UTF-8"))
}

/// Encode a discovery announcement: `HELLO|<name>|<port>`.
pub fn encode_announcement(name: &str, control_port: u16) -> String {
    format!("HELLO|{}|{}", name, control_port)
}

/// Parse a discovery announcement; anything else yields `None`.
pub fn parse_announcement(datagram: &str) -> Option<(String, u16)> {
    let parts: Vec<&str> = datagram.split('|').collect();
    if parts.len() != 3 || parts[0] != "HELLO" || parts[1].is_empty() {
        return None;
    }
    let port: u16 = parts[2].parse().ok()?;
    Some((parts[1].to_string(), port))
}

/// A decoded signaling envelope.
///
/// Fields must not contain `|`; the vocabulary below is reserved and chat
/// content that happens to match it will be interpreted as signaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// `CALL_REQUEST|caller|callerIp|callerVoicePort`
    CallRequest {
        caller: String,
        ip: IpAddr,
        voice_port: u16,
    },

    /// `CALL_REQUEST_VIDEO|caller|callerIp|callerVoicePort|callerVideoPort`
    CallRequestVideo {
        caller: String,
        ip: IpAddr,
        voice_port: u16,
        video_port: u16,
    },

    /// `CALL_ACCEPT|accepter|accepterIp|accepterVoicePort`
    CallAccept {
        accepter: String,
        ip: IpAddr,
        voice_port: u16,
    },

    /// `CALL_ACCEPT_VIDEO|accepter|accepterIp|accepterVoicePort|accepterVideoPort`
    CallAcceptVideo {
        accepter: String,
        ip: IpAddr,
        voice_port: u16,
        video_port: u16,
    },

    /// `CALL_END|ender`
    CallEnd { peer: String },

    /// `CALL_REJECT|rejecter`
    CallReject { peer: String },

    /// `SYSTEM|OFFLINE|peerName`
    Offline { peer: String },
}

impl Signal {
    /// Encode into the pipe-delimited wire form.
    pub fn encode(&self) -> String {
        match self {
            Signal::CallRequest {
                caller,
                ip,
                voice_port,
            } => format!("CALL_REQUEST|{}|{}|{}", caller, ip, voice_port),
            Signal::CallRequestVideo {
                caller,
                ip,
                voice_port,
                video_port,
            } => format!(
                "CALL_REQUEST_VIDEO|{}|{}|{}|{}",
                caller, ip, voice_port, video_port
            ),
            Signal::CallAccept {
                accepter,
                ip,
                voice_port,
            } => format!("CALL_ACCEPT|{}|{}|{}", accepter, ip, voice_port),
            Signal::CallAcceptVideo {
                accepter,
                ip,
                voice_port,
                video_port,
            } => format!(
                "CALL_ACCEPT_VIDEO|{}|{}|{}|{}",
                accepter, ip, voice_port, video_port
            ),
            Signal::CallEnd { peer } => format!("CALL_END|{}", peer),
            Signal::CallReject { peer } => format!("CALL_REJECT|{}", peer),
            Signal::Offline { peer } => format!("SYSTEM|OFFLINE|{}", peer),
        }
    }

    /// Decode a message payload; `None` means ordinary chat text (or a
    /// malformed envelope, which the caller logs and discards).
    pub fn parse(content: &str) -> Option<Signal> {
        let parts: Vec<&str> = content.split('|').collect();
        match (parts[0], parts.len()) {
            ("CALL_REQUEST", 4) => Some(Signal::CallRequest {
                caller: parts[1].to_string(),
                ip: parts[2].parse().ok()?,
                voice_port: parts[3].parse().ok()?,
            }),
            ("CALL_REQUEST_VIDEO", 5) => Some(Signal::CallRequestVideo {
                caller: parts[1].to_string(),
                ip: parts[2].parse().ok()?,
                voice_port: parts[3].parse().ok()?,
                video_port: parts[4].parse().ok()?,
            }),
            ("CALL_ACCEPT", 4) => Some(Signal::CallAccept {
                accepter: parts[1].to_string(),
                ip: parts[2].parse().ok()?,
                voice_port: parts[3].parse().ok()?,
            }),
            ("CALL_ACCEPT_VIDEO", 5) => Some(Signal::CallAcceptVideo {
                accepter: parts[1].to_string(),
                ip: parts[2].parse().ok()?,
                voice_port: parts[3].parse().ok()?,
                video_port: parts[4].parse().ok()?,
            }),
            ("CALL_END", 2) => Some(Signal::CallEnd {
                peer: parts[1].to_string(),
            }),
            ("CALL_REJECT", 2) => Some(Signal::CallReject {
                peer: parts[1].to_string(),
            }),
            ("SYSTEM", 3) if parts[1] == "OFFLINE" => Some(Signal::Offline {
                peer: parts[2].to_string(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_signal_round_trips() {
        let signals = vec![
            Signal::CallRequest {
                caller: "alice".to_string(),
                ip: ip(10, 0, 0, 5),
                voice_port: 5000,
            },
            Signal::CallRequestVideo {
                caller: "alice".to_string(),
                ip: ip(10, 0, 0, 5),
                voice_port: 5000,
                video_port: 5001,
            },
            Signal::CallAccept {
                accepter: "bob".to_string(),
                ip: ip(10, 0, 0, 6),
                voice_port: 6000,
            },
            Signal::CallAcceptVideo {
                accepter: "bob".to_string(),
                ip: ip(10, 0, 0, 6),
                voice_port: 6000,
                video_port: 6001,
            },
            Signal::CallEnd {
                peer: "alice".to_string(),
            },
            Signal::CallReject {
                peer: "bob".to_string(),
            },
            Signal::Offline {
                peer: "carol".to_string(),
            },
        ];

        for signal in signals {
            let encoded = signal.encode();
            let decoded = Signal::parse(&encoded).expect("round trip failed");
            assert_eq!(decoded, signal, "mismatch for {}", encoded);
        }
    }

    #[test]
    fn test_request_wire_shape() {
        let signal = Signal::CallRequest {
            caller: "A".to_string(),
            ip: ip(10, 0, 0, 5),
            voice_port: 5000,
        };
        assert_eq!(signal.encode(), "CALL_REQUEST|A|10.0.0.5|5000");
    }

    #[test]
    fn test_plain_chat_is_not_signaling() {
        assert_eq!(Signal::parse("hello there"), None);
        assert_eq!(Signal::parse(""), None);
        assert_eq!(Signal::parse("see you at 5|6"), None);
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        assert_eq!(Signal::parse("CALL_REQUEST|alice|10.0.0.5"), None);
        assert_eq!(Signal::parse("CALL_REQUEST|alice|10.0.0.5|5000|extra"), None);
        assert_eq!(Signal::parse("CALL_END"), None);
        assert_eq!(Signal::parse("SYSTEM|SOMETHING|bob"), None);
    }

    #[test]
    fn test_bad_numeric_fields_rejected() {
        assert_eq!(Signal::parse("CALL_REQUEST|alice|not-an-ip|5000"), None);
        assert_eq!(Signal::parse("CALL_REQUEST|alice|10.0.0.5|notaport"), None);
        assert_eq!(Signal::parse("CALL_REQUEST_VIDEO|alice|10.0.0.5|5000|99999999"), None);
    }

    #[tokio::test]
    async fn test_field_limit_enforced_on_write() {
        let mut buf = Vec::new();
        let too_long = "x".repeat(MAX_FIELD_BYTES + 1);
        assert!(write_field(&mut buf, &too_long).await.is_err());
        assert!(buf.is_empty());

        // A field at exactly the limit survives the round trip.
        let at_limit = "x".repeat(MAX_FIELD_BYTES);
        write_field(&mut buf, &at_limit).await.unwrap();
        let mut cursor = buf.as_slice();
        assert_eq!(read_field(&mut cursor).await.unwrap(), at_limit);
    }

    #[test]
    fn test_announcement_round_trip() {
        let encoded = encode_announcement("alice", 40123);
        assert_eq!(encoded, "HELLO|alice|40123");
        assert_eq!(
            parse_announcement(&encoded),
            Some(("alice".to_string(), 40123))
        );
    }

    #[test]
    fn test_announcement_rejects_garbage() {
        assert_eq!(parse_announcement("HELLO|alice"), None);
        assert_eq!(parse_announcement("HELLO||9000"), None);
        assert_eq!(parse_announcement("GOODBYE|alice|9000"), None);
        assert_eq!(parse_announcement("HELLO|alice|bogus"), None);
        assert_eq!(parse_announcement("HELLO|ali|ce|9000"), None);
    }
}
