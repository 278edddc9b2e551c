//! Typed message envelope for the overlay wire protocol.
//!
//! A [`Parcel`] is one framed message: a [`Header`] carrying the network
//! identifier, the parcel type tag and a payload checksum, followed by an
//! opaque payload. The overlay never interprets `Message` payloads; they are
//! handed to the application verbatim.
//!
//! This module also implements the compact peer-share payload carried by
//! `PeerResponse` parcels (see [`PeerShareEntry`]).

use crate::{NetworkId, OverlayError, Result};

/// Type tag of a parcel, `u16` on the wire.
///
/// `MessagePart` and `Heartbeat` remain in the protocol for backwards
/// compatibility: they must parse, but they perform no action and are never
/// emitted. Tags this node does not recognize decode to [`ParcelType::Unknown`]
/// so that newer protocol revisions do not get their senders banned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParcelType {
    /// Application message, forwarded to the controller.
    Message,
    /// Deprecated multi-part application message.
    MessagePart,
    /// Deprecated keepalive.
    Heartbeat,
    /// Keepalive probe; the receiver answers with `Pong`.
    Ping,
    /// Keepalive answer.
    Pong,
    /// Request for a share of the receiver's known peers.
    PeerRequest,
    /// Peer-share payload (see [`PeerShareEntry`]).
    PeerResponse,
    /// Operator notice; logged and otherwise ignored.
    Alert,
    /// A tag this node does not recognize.
    Unknown(u16),
}

impl ParcelType {
    /// Decodes a wire tag. Never fails; unrecognized tags are preserved.
    pub fn from_u16(tag: u16) -> Self {
        match tag {
            0 => ParcelType::Message,
            1 => ParcelType::MessagePart,
            2 => ParcelType::Heartbeat,
            3 => ParcelType::Ping,
            4 => ParcelType::Pong,
            5 => ParcelType::PeerRequest,
            6 => ParcelType::PeerResponse,
            7 => ParcelType::Alert,
            other => ParcelType::Unknown(other),
        }
    }

    /// Returns the wire tag for this type.
    pub fn to_u16(self) -> u16 {
        match self {
            ParcelType::Message => 0,
            ParcelType::MessagePart => 1,
            ParcelType::Heartbeat => 2,
            ParcelType::Ping => 3,
            ParcelType::Pong => 4,
            ParcelType::PeerRequest => 5,
            ParcelType::PeerResponse => 6,
            ParcelType::Alert => 7,
            ParcelType::Unknown(tag) => tag,
        }
    }

    /// Returns true for types kept only for backwards compatibility.
    pub fn is_deprecated(self) -> bool {
        matches!(self, ParcelType::MessagePart | ParcelType::Heartbeat)
    }

    /// Returns a human-readable name for the parcel type.
    ///
    /// Useful for logging and debugging.
    pub fn name(self) -> &'static str {
        match self {
            ParcelType::Message => "MESSAGE",
            ParcelType::MessagePart => "MESSAGE_PART",
            ParcelType::Heartbeat => "HEARTBEAT",
            ParcelType::Ping => "PING",
            ParcelType::Pong => "PONG",
            ParcelType::PeerRequest => "PEER_REQUEST",
            ParcelType::PeerResponse => "PEER_RESPONSE",
            ParcelType::Alert => "ALERT",
            ParcelType::Unknown(_) => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ParcelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParcelType::Unknown(tag) => write!(f, "UNKNOWN({})", tag),
            other => f.write_str(other.name()),
        }
    }
}

/// Frame header preceding every payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Network the sender believes it is on. Enforced by the manager.
    pub network: NetworkId,
    /// Type tag of the payload.
    pub parcel_type: ParcelType,
    /// IEEE CRC-32 of the payload.
    pub crc: u32,
}

/// One framed message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parcel {
    /// Frame header.
    pub header: Header,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Parcel {
    /// Creates a parcel for the given network, stamping the payload checksum.
    pub fn new(network: NetworkId, parcel_type: ParcelType, payload: Vec<u8>) -> Self {
        let crc = crc32(&payload);
        Self {
            header: Header {
                network,
                parcel_type,
                crc,
            },
            payload,
        }
    }

    /// Creates an application message parcel.
    pub fn message(network: NetworkId, payload: Vec<u8>) -> Self {
        Self::new(network, ParcelType::Message, payload)
    }

    /// Creates an empty-bodied control parcel of the given type.
    pub fn control(network: NetworkId, parcel_type: ParcelType) -> Self {
        Self::new(network, parcel_type, Vec::new())
    }

    /// Returns true if the stored checksum matches the payload.
    pub fn crc_ok(&self) -> bool {
        crc32(&self.payload) == self.header.crc
    }
}

/// Computes the IEEE CRC-32 checksum of `data`.
///
/// Bitwise implementation; parcels are checksummed once per send and once
/// per receive, which keeps this well off any hot path.
pub fn crc32(data: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// One entry of a peer-share payload.
///
/// The wire representation is length-prefixed:
///
/// ```text
///  u8 AddrLen;  [AddrLen] u8 Address     // UTF-8 host literal or DNS name
///  u8 PortLen;  [PortLen] u8 ListenPort  // ASCII decimal
///  i32 QualityScore                      // big-endian
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerShareEntry {
    /// Host the peer can be dialed at.
    pub address: String,
    /// Advertised listening port. 0 means the port is unknown.
    pub listen_port: u16,
    /// Sender's quality assessment of the peer.
    pub quality_score: i32,
}

/// Encodes a peer-share list to its canonical byte representation.
///
/// Layout: `u32 Count` followed by `Count` entries as described on
/// [`PeerShareEntry`]. All integers are big-endian.
pub fn encode_peer_share(entries: &[PeerShareEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + entries.len() * 16);
    buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in entries {
        let addr = entry.address.as_bytes();
        let port = entry.listen_port.to_string();
        buf.push(addr.len().min(u8::MAX as usize) as u8);
        buf.extend_from_slice(&addr[..addr.len().min(u8::MAX as usize)]);
        buf.push(port.len() as u8);
        buf.extend_from_slice(port.as_bytes());
        buf.extend_from_slice(&entry.quality_score.to_be_bytes());
    }
    buf
}

/// Decodes a peer-share payload.
///
/// Bytes after the final entry are tolerated so that future protocol
/// revisions can append fields without breaking older nodes. Any truncation
/// or field that fails to parse yields [`OverlayError::Malformed`].
pub fn decode_peer_share(payload: &[u8]) -> Result<Vec<PeerShareEntry>> {
    let mut cursor = Cursor::new(payload);
    let count = cursor.read_u32()?;
    let mut entries = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let address = String::from_utf8(cursor.read_prefixed()?.to_vec())
            .map_err(|_| OverlayError::Malformed("peer share address is not UTF-8".into()))?;
        let port_text = cursor.read_prefixed()?;
        let listen_port = std::str::from_utf8(port_text)
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| OverlayError::Malformed("peer share port is not decimal".into()))?;
        let quality_score = cursor.read_i32()?;
        entries.push(PeerShareEntry {
            address,
            listen_port,
            quality_score,
        });
    }
    Ok(entries)
}

/// Minimal forward-only reader over a byte slice.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(OverlayError::Malformed(format!(
                "peer share truncated at offset {}",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.take(1)?[0] as usize;
        self.take(len)
    }
}
