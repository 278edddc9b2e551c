//! P2P networking for the courier node.
//!
//! This crate implements the courier overlay network: it discovers, dials,
//! admits, scores, selects, and drops peers, and routes application parcels
//! between the local node and its peer set. It provides:
//!
//! - **Peer discovery and connection management** - Seed bootstrap over HTTP,
//!   peer-share exchange with connected nodes, and automatic redialing with
//!   connection limits
//! - **Prefix-bucketed outgoing selection** - Dial targets are spread over
//!   the IPv4 address space to resist Sybil clustering
//! - **Broadcast policies** - Full broadcast or random fanout, with trusted
//!   peers always included
//! - **Session bans** - Peers violating the wire protocol are removed and
//!   refused for the rest of the session
//!
//! # Architecture
//!
//! The crate is organized around these key components:
//!
//! - [`PeerManager`] - Central coordinator that owns the control loops,
//!   admission, selection, broadcast, and the peer-share protocol
//! - [`Peer`] - State machine around a single remote endpoint with a bounded
//!   send mailbox and per-connection reader/writer tasks
//! - [`PeerStore`] - Concurrent indices over the known peer set
//! - [`Connection`] - One TCP-framed reader/writer pair
//!
//! # Protocol Overview
//!
//! Peers exchange [`Parcel`]s over TCP: a fixed header (network id, type
//! tag, payload length, payload checksum) followed by an opaque payload.
//! Application `Message` parcels flow through untouched; control parcels
//! (`Ping`/`Pong`, `PeerRequest`/`PeerResponse`, `Alert`) are consumed by
//! the manager itself. A parcel tagged for a different network gets its
//! sender banned immediately.
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_overlay::{OverlayConfig, PeerManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = OverlayConfig::main_network();
//! config.seed_url = "https://seeds.courier.example/main.txt".to_string();
//!
//! let (manager, mut controller) = PeerManager::new(config);
//! manager.start().await?;
//!
//! // Receive application messages from the network
//! while let Some(msg) = controller.inbound.recv().await {
//!     println!("message from {}", msg.peer.hash());
//! }
//! # Ok(())
//! # }
//! ```

mod codec;
mod connection;
mod error;
mod manager;
mod metrics;
mod parcel;
mod peer;
mod peer_store;
mod seed;

pub use codec::{ParcelCodec, DEFAULT_MAX_PARCEL_SIZE, HEADER_SIZE};
pub use connection::{
    Connection, ConnectionDirection, ConnectionReceiver, ConnectionSender, Listener,
};
pub use error::OverlayError;
pub use manager::{Controller, OutboundParcel, OutboundTarget, OverlayStats, PeerManager};
pub use metrics::{Counter, MetricsSnapshot, OverlayMetrics};
pub use parcel::{
    crc32, decode_peer_share, encode_peer_share, Header, Parcel, ParcelType, PeerShareEntry,
};
pub use peer::{location_of, peer_hash, Peer, PeerInfo, PeerParcel, PeerState};
pub use peer_store::PeerStore;
pub use seed::{fetch_seed_list, parse_seed_body, SeedEndpoint};

use std::time::Duration;

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Network identity enforced on every parcel.
///
/// Nodes only talk to peers carrying the same tag; a parcel with a foreign
/// tag gets its sender banned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkId(pub u32);

impl NetworkId {
    /// The production network.
    pub const MAIN: NetworkId = NetworkId(0xFA92);
    /// The public test network.
    pub const TEST: NetworkId = NetworkId(0x54E7);
}

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Configuration for the overlay network.
///
/// Controls peer counts, cadences, admission policy, and network identity.
/// Use [`OverlayConfig::main_network()`] or [`OverlayConfig::test_network()`]
/// for pre-configured settings.
///
/// # Example
///
/// ```rust
/// use courier_overlay::OverlayConfig;
///
/// let mut config = OverlayConfig::test_network();
/// config.outgoing = 8;
/// config.special_peers.push("validator.example.com:8108".to_string());
/// ```
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Human-readable tag used in logs.
    pub node_name: String,

    /// Network identity enforced on every parcel.
    pub network: NetworkId,

    /// Interface to bind the inbound listener to.
    pub bind_ip: String,

    /// Inbound TCP listen port.
    pub listen_port: u16,

    /// Bootstrap peer list URL. Empty disables seed discovery.
    pub seed_url: String,

    /// Target outbound peer count.
    ///
    /// The redial sweep dials until this many peers are online or
    /// connecting.
    pub outgoing: usize,

    /// Maximum inbound peers.
    ///
    /// When this limit is reached, new incoming connections from
    /// non-special addresses are rejected.
    pub incoming: usize,

    /// Peers per fanout (non-full) broadcast.
    pub fanout: usize,

    /// Idle interval before sending a `Ping` to an online peer.
    ///
    /// A peer that stays silent for three times this interval is
    /// disconnected.
    pub ping_interval: Duration,

    /// Minimum spacing for peer-share exchanges, in both directions.
    pub peer_request_interval: Duration,

    /// Minimum spacing between outgoing-dial sweeps.
    pub redial_interval: Duration,

    /// Only dial special peers.
    pub trusted_only: bool,

    /// Reject all inbound connections.
    pub refuse_incoming: bool,

    /// Reject inbound connections from IPs not already in the known set.
    pub refuse_unknown: bool,

    /// Threshold to include a peer in shared lists.
    pub minimum_quality_score: i32,

    /// Bounded queue size for peer mailboxes and the internal data channel.
    pub channel_capacity: usize,

    /// Maximum accepted parcel payload, in bytes.
    pub max_parcel_size: usize,

    /// TCP dial timeout.
    pub dial_timeout: Duration,

    /// Trusted peers, `"host:port"` entries: always dialed, always broadcast
    /// to, never shared.
    pub special_peers: Vec<String>,

    /// Seed for the manager's RNG. `None` seeds from the OS; tests set this
    /// for reproducible selection.
    pub rng_seed: Option<u64>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            node_name: "courier".to_string(),
            network: NetworkId::MAIN,
            bind_ip: "0.0.0.0".to_string(),
            listen_port: 8108,
            seed_url: String::new(),
            outgoing: 32,
            incoming: 150,
            fanout: 8,
            ping_interval: Duration::from_secs(15),
            peer_request_interval: Duration::from_secs(60),
            redial_interval: Duration::from_secs(20),
            trusted_only: false,
            refuse_incoming: false,
            refuse_unknown: false,
            minimum_quality_score: 0,
            channel_capacity: 5000,
            max_parcel_size: DEFAULT_MAX_PARCEL_SIZE,
            dial_timeout: Duration::from_secs(15),
            special_peers: Vec::new(),
            rng_seed: None,
        }
    }
}

impl OverlayConfig {
    /// Configuration for the production network.
    pub fn main_network() -> Self {
        Self::default()
    }

    /// Configuration for the public test network.
    ///
    /// Smaller peer counts and a higher listen port so a test node can run
    /// alongside a production one.
    pub fn test_network() -> Self {
        Self {
            network: NetworkId::TEST,
            listen_port: 8118,
            outgoing: 8,
            incoming: 32,
            ..Self::default()
        }
    }

    /// Creates an application message parcel stamped with this network.
    pub fn message_parcel(&self, payload: Vec<u8>) -> Parcel {
        Parcel::message(self.network, payload)
    }
}
