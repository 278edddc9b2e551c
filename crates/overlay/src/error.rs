//! Error types for overlay operations.
//!
//! Defines the [`OverlayError`] enum which covers all error conditions that
//! can occur during overlay network operations, including:
//!
//! - Connection failures and timeouts
//! - Frame and payload decoding errors
//! - Protocol violations (wrong network, checksum mismatch, oversize)
//! - Peer management errors
//! - Internal errors

use thiserror::Error;

/// Errors that can occur during overlay network operations.
///
/// This enum covers all error conditions from connection establishment
/// through parcel exchange and peer management.
#[derive(Debug, Error)]
pub enum OverlayError {
    // ===== Connection Errors =====
    /// TCP connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection attempt or receive operation timed out.
    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),

    /// The peer closed the connection.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    // ===== Protocol Errors =====
    /// A frame or payload could not be decoded.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// A frame declared a payload larger than the configured cap.
    #[error("oversized parcel: {got} bytes (limit: {limit})")]
    Oversized {
        /// Declared payload length.
        got: usize,
        /// Configured maximum payload length.
        limit: usize,
    },

    /// The payload checksum did not match the header.
    #[error("crc mismatch: header declares {expected:#010x}, payload hashes to {actual:#010x}")]
    CrcMismatch {
        /// Checksum carried in the frame header.
        expected: u32,
        /// Checksum computed over the received payload.
        actual: u32,
    },

    /// Peer is on a different network (network ID doesn't match).
    #[error("network ID mismatch")]
    WrongNetwork,

    // ===== Peer Management Errors =====
    /// Cannot accept more connections (limit reached).
    #[error("peer limit reached")]
    PeerLimitReached,

    /// The specified peer was not found.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// The peer has been banned and connections are rejected.
    #[error("peer is banned: {0}")]
    PeerBanned(String),

    /// Already have an active connection to this peer.
    #[error("already connected to peer")]
    AlreadyConnected,

    // ===== State Errors =====
    /// Operation requires the overlay to be running.
    #[error("overlay not started")]
    NotStarted,

    /// Cannot start because overlay is already running.
    #[error("overlay already started")]
    AlreadyStarted,

    /// Operation rejected because overlay is shutting down.
    #[error("overlay is shutting down")]
    ShuttingDown,

    // ===== Address Errors =====
    /// Invalid peer address format.
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    // ===== Configuration Errors =====
    /// Invalid configuration detected at startup.
    #[error("config error: {0}")]
    Config(String),

    // ===== Seed Errors =====
    /// The seed endpoint returned a non-success status.
    #[error("seed fetch failed: {url} returned status {status}")]
    SeedStatus {
        /// Seed URL that was queried.
        url: String,
        /// HTTP status code returned.
        status: u16,
    },

    // ===== Wrapped Errors =====
    /// Low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error during seed discovery.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // ===== Internal Errors =====
    /// Internal channel send failed (receiver dropped).
    #[error("channel closed")]
    ChannelClosed,
}

impl OverlayError {
    /// Returns true if this error is transient and the operation could succeed on retry.
    ///
    /// Connection failures, timeouts, and I/O errors are typically retriable;
    /// the dial sweep will pick the peer up again on a later pass.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            OverlayError::ConnectionFailed(_)
                | OverlayError::ConnectionTimeout(_)
                | OverlayError::Io(_)
        )
    }

    /// Returns true if this error is a protocol violation.
    ///
    /// Violations are never retried: the sending peer is removed and its
    /// hash is refused for the rest of the session.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            OverlayError::WrongNetwork
                | OverlayError::CrcMismatch { .. }
                | OverlayError::Oversized { .. }
                | OverlayError::Malformed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(OverlayError::ConnectionFailed("x".into()).is_retriable());
        assert!(OverlayError::ConnectionTimeout("x".into()).is_retriable());
        assert!(!OverlayError::WrongNetwork.is_retriable());
        assert!(!OverlayError::PeerBanned("x".into()).is_retriable());
    }

    #[test]
    fn test_violation_classification() {
        assert!(OverlayError::WrongNetwork.is_violation());
        assert!(OverlayError::CrcMismatch {
            expected: 1,
            actual: 2
        }
        .is_violation());
        assert!(OverlayError::Oversized { got: 10, limit: 1 }.is_violation());
        assert!(!OverlayError::ConnectionFailed("x".into()).is_violation());
    }
}
