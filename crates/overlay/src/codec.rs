//! Parcel codec for the overlay wire protocol.
//!
//! This module implements the framing layer for overlay parcels. Each
//! message on the wire is a fixed header followed by the payload:
//!
//! ```text
//! +-------------+----------+----------------+-----------+------------------+
//! | Network u32 | Type u16 | PayloadLen u32 | Crc32 u32 | Payload [u8; N]  |
//! +-------------+----------+----------------+-----------+------------------+
//! ```
//!
//! All integers are big-endian.
//!
//! # Validation
//!
//! The codec enforces the payload size cap and the payload checksum; a
//! violation of either kills the connection. The network tag is *not*
//! checked here: the manager compares it against the local network and bans
//! the sender on mismatch, so the tag must survive decoding intact.

use crate::{
    parcel::{crc32, Header, Parcel, ParcelType},
    NetworkId, OverlayError, Result,
};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum payload size (32 MiB) - prevents memory exhaustion.
pub const DEFAULT_MAX_PARCEL_SIZE: usize = 32 * 1024 * 1024;

/// Fixed wire size of the frame header.
pub const HEADER_SIZE: usize = 14;

/// Codec for encoding and decoding overlay parcels.
///
/// Implements tokio's `Encoder` and `Decoder` traits for use with framed
/// TCP streams. Handles the header-prefixed framing protocol automatically.
///
/// # Usage
///
/// ```rust,ignore
/// use tokio_util::codec::Framed;
/// use courier_overlay::ParcelCodec;
///
/// let framed = Framed::new(tcp_stream, ParcelCodec::new(max_parcel_size));
/// ```
#[derive(Debug)]
pub struct ParcelCodec {
    /// Current state of the decoder state machine.
    decode_state: DecodeState,
    /// Maximum accepted payload length.
    max_parcel_size: usize,
}

/// Internal state machine for streaming parcel decoding.
#[derive(Debug)]
enum DecodeState {
    /// Waiting for the fixed-size header.
    ReadingHeader,
    /// Have the header, waiting for the payload.
    ReadingPayload {
        /// Decoded header.
        header: Header,
        /// Expected payload length.
        len: usize,
    },
}

impl ParcelCodec {
    /// Creates a new parcel codec with the given payload cap.
    pub fn new(max_parcel_size: usize) -> Self {
        Self {
            decode_state: DecodeState::ReadingHeader,
            max_parcel_size,
        }
    }

    /// Encodes a parcel to its wire representation.
    pub fn encode_parcel(parcel: &Parcel) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + parcel.payload.len());
        buf.extend_from_slice(&parcel.header.network.0.to_be_bytes());
        buf.extend_from_slice(&parcel.header.parcel_type.to_u16().to_be_bytes());
        buf.extend_from_slice(&(parcel.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&parcel.header.crc.to_be_bytes());
        buf.extend_from_slice(&parcel.payload);
        buf
    }
}

impl Default for ParcelCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARCEL_SIZE)
    }
}

impl Decoder for ParcelCodec {
    type Item = Parcel;
    type Error = OverlayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Parcel>> {
        loop {
            match self.decode_state {
                DecodeState::ReadingHeader => {
                    if src.len() < HEADER_SIZE {
                        // Need more data for the header
                        return Ok(None);
                    }

                    let network = NetworkId(u32::from_be_bytes([src[0], src[1], src[2], src[3]]));
                    let parcel_type = ParcelType::from_u16(u16::from_be_bytes([src[4], src[5]]));
                    let len = u32::from_be_bytes([src[6], src[7], src[8], src[9]]) as usize;
                    let crc = u32::from_be_bytes([src[10], src[11], src[12], src[13]]);

                    if len > self.max_parcel_size {
                        return Err(OverlayError::Oversized {
                            got: len,
                            limit: self.max_parcel_size,
                        });
                    }

                    src.advance(HEADER_SIZE);
                    src.reserve(len);

                    self.decode_state = DecodeState::ReadingPayload {
                        header: Header {
                            network,
                            parcel_type,
                            crc,
                        },
                        len,
                    };
                }
                DecodeState::ReadingPayload { header, len } => {
                    if src.len() < len {
                        // Need more data for the payload
                        return Ok(None);
                    }

                    let payload = src.split_to(len).to_vec();
                    self.decode_state = DecodeState::ReadingHeader;

                    let actual = crc32(&payload);
                    if actual != header.crc {
                        return Err(OverlayError::CrcMismatch {
                            expected: header.crc,
                            actual,
                        });
                    }

                    return Ok(Some(Parcel { header, payload }));
                }
            }
        }
    }
}

impl Encoder<Parcel> for ParcelCodec {
    type Error = OverlayError;

    fn encode(&mut self, parcel: Parcel, dst: &mut BytesMut) -> Result<()> {
        if parcel.payload.len() > self.max_parcel_size {
            return Err(OverlayError::Oversized {
                got: parcel.payload.len(),
                limit: self.max_parcel_size,
            });
        }

        dst.reserve(HEADER_SIZE + parcel.payload.len());
        dst.put_u32(parcel.header.network.0);
        dst.put_u16(parcel.header.parcel_type.to_u16());
        dst.put_u32(parcel.payload.len() as u32);
        dst.put_u32(parcel.header.crc);
        dst.extend_from_slice(&parcel.payload);

        Ok(())
    }
}
