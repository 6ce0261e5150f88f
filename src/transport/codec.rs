//! IPMSG packet encoding and decoding.
//!
//! Every packet is a single datagram of the form
//! `1:<packet_no>:<user>:<host>:<flags>:<message>\0<extension>\0`. The header
//! fields are plain ASCII; user, host, message and extension are transcoded
//! into the character set the destination peer expects.

use crate::transport::protocol::{option, CommandFlags, MAX_UDP_BUFFER, PROTOCOL_VERSION};
use crate::utils::{IpmsgError, ProtocolError, Result};
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

/// Packet number meaning "allocate one for me"
pub const AUTO_PACKET_NO: u32 = 0;

const FIELD_DELIMITER: u8 = b':';
const MESSAGE_TERMINATOR: u8 = 0;
const HEADER_FIELDS: usize = 5;
const PACKET_NO_MODULUS: i64 = 100_000;

/// Converts text to and from the external character encoding of a peer.
///
/// `peer` is the peer's IP address, or `None` for broadcast traffic.
pub trait Transcoder: Send + Sync {
    /// Encode outgoing text for `peer`
    fn encode(&self, peer: Option<&str>, text: &str) -> Result<Vec<u8>>;

    /// Decode incoming bytes from `peer`
    fn decode(&self, peer: Option<&str>, bytes: &[u8]) -> Result<String>;
}

/// UTF-8 on the wire for every peer
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Transcoder;

impl Transcoder for Utf8Transcoder {
    fn encode(&self, _peer: Option<&str>, text: &str) -> Result<Vec<u8>> {
        Ok(text.as_bytes().to_vec())
    }

    fn decode(&self, peer: Option<&str>, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| IpmsgError::Encoding {
            reason: format!("{} from {}", e, peer.unwrap_or("broadcast")),
        })
    }
}

/// Where an encoded packet is going
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A broadcast address (LAN-wide)
    Broadcast(SocketAddr),
    /// A single peer
    Peer(SocketAddr),
}

impl Destination {
    /// Socket address to hand to the transport
    pub fn addr(&self) -> SocketAddr {
        match self {
            Self::Broadcast(addr) | Self::Peer(addr) => *addr,
        }
    }

    /// Key used for peer-specific transcoding
    pub fn transcoding_key(&self) -> Option<String> {
        match self {
            Self::Broadcast(_) => None,
            Self::Peer(addr) => Some(addr.ip().to_string()),
        }
    }
}

/// A decoded IPMSG packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version (always 1)
    pub version: u32,
    /// Sender-chosen packet number
    pub packet_no: u32,
    /// Sender login name
    pub user: String,
    /// Sender host name
    pub host: String,
    /// Command and options
    pub flags: CommandFlags,
    /// Message field (may be empty)
    pub message: String,
    /// Extension field after the NUL (may be empty)
    pub extension: String,
}

/// A packet ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    /// Packet number actually used
    pub packet_no: u32,
    /// Wire bytes
    pub bytes: Vec<u8>,
}

/// Hands out packet numbers: a counter offset by wall-clock seconds.
#[derive(Debug, Default)]
pub struct PacketNumberAllocator {
    counter: Mutex<u32>,
}

impl PacketNumberAllocator {
    /// Create an allocator starting from zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Next packet number; never [`AUTO_PACKET_NO`]
    pub fn next(&self) -> u32 {
        let mut counter = self.counter.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            *counter = counter.wrapping_add(1);
            let secs = chrono::Utc::now().timestamp().rem_euclid(PACKET_NO_MODULUS);
            let candidate = counter.wrapping_add(u32::try_from(secs).unwrap_or(0));
            if candidate != AUTO_PACKET_NO {
                return candidate;
            }
        }
    }
}

/// Builds packets on behalf of the local user
pub struct PacketCodec {
    user: String,
    host: String,
    packet_numbers: PacketNumberAllocator,
    transcoder: std::sync::Arc<dyn Transcoder>,
}

impl std::fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCodec")
            .field("user", &self.user)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl PacketCodec {
    /// Create a codec for `user@host`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if either name is empty or contains the
    /// field delimiter.
    pub fn new(
        user: impl Into<String>,
        host: impl Into<String>,
        transcoder: std::sync::Arc<dyn Transcoder>,
    ) -> Result<Self> {
        let user = user.into();
        let host = host.into();
        for (name, value) in [("user", &user), ("host", &host)] {
            if value.is_empty() || value.contains(':') || value.contains('\0') {
                return Err(IpmsgError::invalid_argument(format!(
                    "{name} name {value:?} is empty or contains a delimiter"
                )));
            }
        }
        Ok(Self {
            user,
            host,
            packet_numbers: PacketNumberAllocator::new(),
            transcoder,
        })
    }

    /// Local user name
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Local host name
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The transcoding hook shared with the rest of the engine
    pub fn transcoder(&self) -> &std::sync::Arc<dyn Transcoder> {
        &self.transcoder
    }

    /// Allocate a fresh packet number
    pub fn next_packet_no(&self) -> u32 {
        self.packet_numbers.next()
    }

    /// Build the wire bytes for one packet.
    ///
    /// `packet_no` of [`AUTO_PACKET_NO`] allocates a fresh number.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the destination does not fit the command,
    /// `EncodingError` when transcoding fails, `PacketTooLarge` when the
    /// result exceeds a datagram.
    pub fn encode_packet(
        &self,
        dest: &Destination,
        packet_no: u32,
        flags: CommandFlags,
        message: Option<&str>,
        extension: Option<&str>,
    ) -> Result<EncodedPacket> {
        match dest {
            Destination::Broadcast(_) => {
                if !flags.kind().is_broadcast() && !flags.has(option::BROADCASTOPT) {
                    return Err(IpmsgError::invalid_argument(format!(
                        "{} cannot be broadcast",
                        flags.kind()
                    )));
                }
            }
            Destination::Peer(addr) => {
                if addr.port() == 0 || addr.ip().is_unspecified() {
                    return Err(IpmsgError::invalid_argument(format!(
                        "{} has no usable address {addr}",
                        flags.kind()
                    )));
                }
            }
        }

        let packet_no = if packet_no == AUTO_PACKET_NO {
            self.next_packet_no()
        } else {
            packet_no
        };
        let key = dest.transcoding_key();
        let key = key.as_deref();

        let common = format!(
            "{}:{}:{}:{}:{}:",
            PROTOCOL_VERSION,
            packet_no,
            self.user,
            self.host,
            flags.raw()
        );
        let common = self.transcoder.encode(key, &common)?;
        let message = self.transcoder.encode(key, message.unwrap_or(""))?;
        let extension = self.transcoder.encode(key, extension.unwrap_or(""))?;

        let mut bytes = Vec::new();
        bytes.try_reserve(common.len() + message.len() + extension.len() + 2)?;
        bytes.extend_from_slice(&common);
        bytes.extend_from_slice(&message);
        bytes.push(MESSAGE_TERMINATOR);
        if !extension.is_empty() {
            bytes.extend_from_slice(&extension);
            bytes.push(MESSAGE_TERMINATOR);
        }

        if bytes.len() > MAX_UDP_BUFFER {
            return Err(ProtocolError::PacketTooLarge {
                size: bytes.len(),
                max: MAX_UDP_BUFFER,
            }
            .into());
        }

        Ok(EncodedPacket { packet_no, bytes })
    }
}

/// Parse one datagram received from `peer`.
///
/// # Errors
///
/// `Malformed` when the five header fields are missing or unparseable,
/// `EncodingError` when the transcoder rejects a text field.
pub fn decode_packet(bytes: &[u8], transcoder: &dyn Transcoder, peer: Option<&str>) -> Result<Packet> {
    let mut fields = Vec::with_capacity(HEADER_FIELDS);
    let mut rest = bytes;
    for _ in 0..HEADER_FIELDS {
        let end = rest
            .iter()
            .position(|&b| b == FIELD_DELIMITER)
            .ok_or_else(|| IpmsgError::malformed(format!("only {} header fields", fields.len())))?;
        fields.push(&rest[..end]);
        rest = &rest[end + 1..];
    }

    let version = std::str::from_utf8(fields[0]).map_err(|_| IpmsgError::malformed("version"))?;
    if !version.starts_with('1') {
        return Err(IpmsgError::malformed(format!("unsupported version {version:?}")));
    }
    let packet_no = parse_number(fields[1]).ok_or_else(|| IpmsgError::malformed("packet number"))?;
    let flags = parse_number(fields[4]).ok_or_else(|| IpmsgError::malformed("flags"))?;

    let (message, extension) = match rest.iter().position(|&b| b == MESSAGE_TERMINATOR) {
        Some(end) => {
            let tail = &rest[end + 1..];
            let ext_end = tail
                .iter()
                .position(|&b| b == MESSAGE_TERMINATOR)
                .unwrap_or(tail.len());
            (&rest[..end], &tail[..ext_end])
        }
        None => (rest, &rest[rest.len()..]),
    };

    Ok(Packet {
        version: PROTOCOL_VERSION,
        packet_no,
        user: transcoder.decode(peer, fields[2])?,
        host: transcoder.decode(peer, fields[3])?,
        flags: CommandFlags::from_raw(flags),
        message: transcoder.decode(peer, message)?,
        extension: transcoder.decode(peer, extension)?,
    })
}

/// Decimal, or hexadecimal with a `0x` prefix
fn parse_number(field: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(field).ok()?.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text
            .parse::<u64>()
            .ok()
            .map(|n| (n & u64::from(u32::MAX)) as u32),
    }
}

/// Lower-case hex encoding
pub fn bin_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Hex decoding that scans byte pairs.
///
/// A trailing odd nibble is dropped rather than rejected; older clients rely
/// on this leniency.
///
/// # Errors
///
/// `InvalidArgument` on a non-hex digit.
pub fn hex_to_bin(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let even = bytes.len() & !1;
    hex::decode(&bytes[..even])
        .map_err(|e| IpmsgError::invalid_argument(format!("bad hex string: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protocol::command;
    use std::sync::Arc;

    fn codec() -> PacketCodec {
        PacketCodec::new("alice", "h1", Arc::new(Utf8Transcoder)).unwrap()
    }

    fn peer_dest() -> Destination {
        Destination::Peer("10.0.0.2:2425".parse().unwrap())
    }

    #[test]
    fn test_packet_roundtrip() {
        let codec = codec();
        let flags = CommandFlags::new(command::SENDMSG, option::SENDCHECKOPT | option::SECRETOPT);
        let encoded = codec
            .encode_packet(&peer_dest(), 4242, flags, Some("hello: world"), Some("file ext"))
            .unwrap();
        assert_eq!(encoded.packet_no, 4242);

        let packet = decode_packet(&encoded.bytes, &Utf8Transcoder, Some("10.0.0.1")).unwrap();
        assert_eq!(packet.version, 1);
        assert_eq!(packet.packet_no, 4242);
        assert_eq!(packet.user, "alice");
        assert_eq!(packet.host, "h1");
        assert_eq!(packet.flags, flags);
        assert_eq!(packet.message, "hello: world");
        assert_eq!(packet.extension, "file ext");
    }

    #[test]
    fn test_wire_layout() {
        let codec = codec();
        let flags = CommandFlags::new(command::BR_ENTRY, 0);
        let dest = Destination::Broadcast("255.255.255.255:2425".parse().unwrap());
        let encoded = codec
            .encode_packet(&dest, 7, flags, Some("Alice"), Some("dev"))
            .unwrap();
        assert_eq!(encoded.bytes, b"1:7:alice:h1:1:Alice\0dev\0".to_vec());
    }

    #[test]
    fn test_absent_message_and_extension() {
        let codec = codec();
        let flags = CommandFlags::new(command::GETINFO, 0);
        let encoded = codec.encode_packet(&peer_dest(), 0, flags, None, None).unwrap();
        assert_ne!(encoded.packet_no, AUTO_PACKET_NO);

        let packet = decode_packet(&encoded.bytes, &Utf8Transcoder, None).unwrap();
        assert_eq!(packet.message, "");
        assert_eq!(packet.extension, "");
    }

    #[test]
    fn test_broadcast_of_unicast_command_rejected() {
        let codec = codec();
        let dest = Destination::Broadcast("255.255.255.255:2425".parse().unwrap());
        let err = codec
            .encode_packet(&dest, 0, CommandFlags::new(command::ANSENTRY, 0), None, None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::utils::ErrorKind::InvalidArgument);

        let ok = codec.encode_packet(
            &dest,
            0,
            CommandFlags::new(command::SENDMSG, option::BROADCASTOPT),
            Some("all"),
            None,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_unaddressed_peer_rejected() {
        let codec = codec();
        let dest = Destination::Peer("0.0.0.0:0".parse().unwrap());
        let err = codec
            .encode_packet(&dest, 0, CommandFlags::new(command::ANSENTRY, 0), None, None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::utils::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_decode_malformed() {
        for bad in [&b""[..], b"1:2:bob", b"1:2:bob:h2", b"1:x:bob:h2:32:", b"2:1:bob:h2:32:"] {
            let err = decode_packet(bad, &Utf8Transcoder, None).unwrap_err();
            assert_eq!(err.kind(), crate::utils::ErrorKind::Malformed, "{bad:?}");
        }
    }

    #[test]
    fn test_decode_without_terminator_and_hex_flags() {
        let packet = decode_packet(b"1:9:bob:h2:0x20:hi", &Utf8Transcoder, None).unwrap();
        assert_eq!(packet.flags.command(), command::SENDMSG);
        assert_eq!(packet.message, "hi");
        assert_eq!(packet.extension, "");
    }

    #[test]
    fn test_decode_rejects_bad_encoding() {
        let err = decode_packet(b"1:9:bob:h2:32:\xff\xfe\0", &Utf8Transcoder, None).unwrap_err();
        assert_eq!(err.kind(), crate::utils::ErrorKind::EncodingError);
    }

    #[test]
    fn test_codec_rejects_delimiter_in_names() {
        assert!(PacketCodec::new("a:b", "h", Arc::new(Utf8Transcoder)).is_err());
        assert!(PacketCodec::new("a", "", Arc::new(Utf8Transcoder)).is_err());
    }

    #[test]
    fn test_packet_numbers_never_auto() {
        let allocator = PacketNumberAllocator::new();
        let mut previous = allocator.next();
        for _ in 0..1000 {
            let n = allocator.next();
            assert_ne!(n, AUTO_PACKET_NO);
            assert_ne!(n, previous);
            previous = n;
        }
    }

    #[test]
    fn test_hex_roundtrip() {
        let samples: [&[u8]; 4] = [b"", b"\x00", b"\x00\x7f\x80\xff", b"hello world"];
        for bytes in samples {
            let hex = bin_to_hex(bytes);
            assert_eq!(hex, hex.to_lowercase());
            assert_eq!(hex_to_bin(&hex).unwrap(), bytes);
        }
    }

    #[test]
    fn test_hex_accepts_upper_case() {
        assert_eq!(hex_to_bin("DEADbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_hex_odd_nibble_is_dropped() {
        // Documented quirk: the trailing unpaired digit is ignored.
        assert_eq!(hex_to_bin("abc").unwrap(), vec![0xab]);
        assert_eq!(hex_to_bin("f").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_hex_rejects_non_hex() {
        let err = hex_to_bin("zz").unwrap_err();
        assert_eq!(err.kind(), crate::utils::ErrorKind::InvalidArgument);
    }
}
