//! Single-peer lifecycle and framed I/O.
//!
//! A [`Peer`] is the manager's record of a remote endpoint, with or without
//! a live connection. The peer owns its state machine:
//!
//! ```text
//! Offline ──start_to_dial──▶ Connecting ──attach──▶ Online
//!    ▲                           │                    │
//!    └────────── go_offline ◀────┴──── Stopping ◀─────┘
//! ```
//!
//! While `Online`, two tasks are bound to the connection lifetime: a reader
//! delivering every received parcel to the manager's data channel, and a
//! writer draining the peer's bounded mailbox in FIFO order. Either task
//! exiting takes the peer offline; outgoing dialable peers are picked up
//! again by the manager's redial sweep.

use crate::{
    connection::{Connection, ConnectionReceiver, ConnectionSender},
    metrics::OverlayMetrics,
    OverlayConfig, OverlayError, Parcel, ParcelType, Result,
};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace, warn};

/// Lifecycle state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    /// No connection, no connection attempt in flight.
    Offline = 0,
    /// A dial or inbound attach is in progress.
    Connecting = 1,
    /// Connected; reader and writer tasks are running.
    Online = 2,
    /// Winding down the connection tasks.
    Stopping = 3,
}

impl PeerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PeerState::Connecting,
            2 => PeerState::Online,
            3 => PeerState::Stopping,
            _ => PeerState::Offline,
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PeerState::Offline => "offline",
            PeerState::Connecting => "connecting",
            PeerState::Online => "online",
            PeerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// A parcel paired with the peer it was read from.
#[derive(Debug, Clone)]
pub struct PeerParcel {
    /// The peer that sent the parcel.
    pub peer: Arc<Peer>,
    /// The parcel as read off the wire.
    pub parcel: Parcel,
}

/// Event delivered to the manager's data loop.
///
/// Mostly parcels; the reader also reports codec-level protocol violations
/// (checksum mismatch, oversize frame) so the manager can ban the sender.
#[derive(Debug)]
pub(crate) enum DataEvent {
    /// A parcel read from a peer.
    Parcel(PeerParcel),
    /// The peer's byte stream violated the framing protocol.
    Violation {
        /// The offending peer.
        peer: Arc<Peer>,
        /// What the codec rejected.
        error: OverlayError,
    },
}

/// Point-in-time view of a peer, taken without holding any locks afterwards.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Stable lookup key, `"address:listen_port"`.
    pub hash: String,
    /// Remote IP or hostname.
    pub address: String,
    /// Ephemeral port of the current connection (0 when not connected yet).
    pub port: u16,
    /// Advertised listening port (0 when not learned).
    pub listen_port: u16,
    /// True if the local node initiated the connection.
    pub outgoing: bool,
    /// Trusted peer: always dialed, never shared.
    pub special: bool,
    /// Lifecycle state at snapshot time.
    pub state: PeerState,
    /// Reputation score.
    pub quality_score: i32,
}

/// The manager's record of a remote endpoint.
///
/// Shared as `Arc<Peer>` between the store, the manager loops, and the
/// connection tasks. All mutable state is behind atomics or short-lived
/// locks; the manager only ever observes, the peer transitions itself.
pub struct Peer {
    hash: String,
    address: String,
    listen_port: u16,
    outgoing: bool,
    special: bool,
    dialable: bool,
    location: u32,
    config: Arc<OverlayConfig>,
    data_tx: mpsc::Sender<DataEvent>,
    metrics: Arc<OverlayMetrics>,

    state: AtomicU8,
    quality_score: AtomicI32,
    port: RwLock<u16>,
    last_seen: RwLock<Instant>,
    last_peer_request: RwLock<Option<Instant>>,
    last_peer_send: RwLock<Option<Instant>>,

    /// Outbound parcel queue, drained FIFO by the writer task. Bounded at
    /// `channel_capacity` by the eviction policy in [`Peer::send`].
    mailbox: Mutex<VecDeque<Parcel>>,
    /// Wakes the writer when the mailbox goes non-empty.
    mailbox_notify: Notify,
    /// Bumped on every attach; a replaced connection's tasks find a newer
    /// epoch on exit and leave the live state alone.
    epoch: AtomicU64,
    stop_tx: Mutex<watch::Sender<bool>>,
}

impl Peer {
    /// Creates a peer record in `Offline`.
    ///
    /// `listen_port == 0` marks an inbound peer whose advertised port has
    /// not been learned; such a peer is never dialable.
    pub(crate) fn new(
        address: impl Into<String>,
        outgoing: bool,
        listen_port: u16,
        special: bool,
        dialable: bool,
        config: Arc<OverlayConfig>,
        data_tx: mpsc::Sender<DataEvent>,
        metrics: Arc<OverlayMetrics>,
    ) -> Arc<Self> {
        let address = address.into();
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            hash: peer_hash(&address, listen_port),
            location: location_of(&address),
            address,
            listen_port,
            outgoing,
            special,
            dialable,
            config,
            data_tx,
            metrics,
            state: AtomicU8::new(PeerState::Offline as u8),
            quality_score: AtomicI32::new(0),
            port: RwLock::new(0),
            last_seen: RwLock::new(Instant::now()),
            last_peer_request: RwLock::new(None),
            last_peer_send: RwLock::new(None),
            mailbox: Mutex::new(VecDeque::new()),
            mailbox_notify: Notify::new(),
            epoch: AtomicU64::new(0),
            stop_tx: Mutex::new(stop_tx),
        })
    }

    // ===== Identity =====

    /// Stable lookup key, `"address:listen_port"`.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Remote IP or hostname.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Advertised listening port (0 when not learned).
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Ephemeral port of the current connection.
    pub fn port(&self) -> u16 {
        *self.port.read()
    }

    /// 32-bit bucketing key derived from the address.
    pub fn location(&self) -> u32 {
        self.location
    }

    /// The endpoint a dial would target.
    pub fn connect_address(&self) -> String {
        format!("{}:{}", self.address, self.listen_port)
    }

    // ===== Predicates =====

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while reader and writer tasks are bound to a live connection.
    pub fn is_online(&self) -> bool {
        self.state() == PeerState::Online
    }

    /// True when no connection or attempt exists.
    pub fn is_offline(&self) -> bool {
        self.state() == PeerState::Offline
    }

    /// True if the local node initiated this peer.
    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    /// Trusted peer: always dialed, broadcast to, never shared.
    pub fn is_special(&self) -> bool {
        self.special
    }

    /// True if the peer has a usable listen endpoint.
    pub fn can_dial(&self) -> bool {
        self.dialable && self.listen_port != 0
    }

    // ===== Scoring and timestamps =====

    /// Current reputation score.
    pub fn quality_score(&self) -> i32 {
        self.quality_score.load(Ordering::Relaxed)
    }

    /// Adjusts the reputation score by `delta` (negative to punish).
    pub fn adjust_quality(&self, delta: i32) {
        self.quality_score.fetch_add(delta, Ordering::Relaxed);
    }

    /// Time of the last parcel read from this peer.
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.read()
    }

    fn touch_last_seen(&self) {
        *self.last_seen.write() = Instant::now();
    }

    pub(crate) fn touch_last_peer_send(&self) {
        *self.last_peer_send.write() = Some(Instant::now());
    }

    /// True if nothing has been written to this peer for at least `interval`.
    ///
    /// Gates both the ping cadence and replies to `PeerRequest`.
    pub fn send_quiet_for(&self, interval: Duration) -> bool {
        match *self.last_peer_send.read() {
            None => true,
            Some(t) => t.elapsed() >= interval,
        }
    }

    /// True if this peer has not been asked for a peer share for `interval`.
    pub fn peer_request_due(&self, interval: Duration) -> bool {
        match *self.last_peer_request.read() {
            None => true,
            Some(t) => t.elapsed() >= interval,
        }
    }

    /// Records that a peer-share exchange was initiated or accepted.
    pub fn mark_peer_request(&self) {
        *self.last_peer_request.write() = Some(Instant::now());
    }

    /// Compares two records of the same endpoint for duplicate resolution.
    ///
    /// Higher quality score wins, then the longer-known record, then an
    /// outgoing record over an incoming one.
    pub fn better(&self, other: &Peer) -> bool {
        let (a, b) = (self.quality_score(), other.quality_score());
        if a != b {
            return a > b;
        }
        let (la, lb) = (self.last_seen(), other.last_seen());
        if la != lb {
            return la < lb;
        }
        self.outgoing && !other.outgoing
    }

    /// Snapshot of the peer for introspection.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            hash: self.hash.clone(),
            address: self.address.clone(),
            port: self.port(),
            listen_port: self.listen_port,
            outgoing: self.outgoing,
            special: self.special,
            state: self.state(),
            quality_score: self.quality_score(),
        }
    }

    // ===== Sending =====

    /// Enqueues a parcel on the peer's mailbox. Never blocks.
    ///
    /// When the mailbox is full, `Message` and other non-critical parcels
    /// are dropped (drop-newest); a `Ping`/`Pong` instead evicts the oldest
    /// non-critical parcel to make room and is never dropped itself.
    /// Sending to an offline peer returns immediately.
    pub fn send(&self, parcel: Parcel) -> Result<()> {
        if self.is_offline() {
            trace!("not sending {} to offline peer {}", parcel.header.parcel_type, self.hash);
            return Ok(());
        }

        let keepalive = matches!(
            parcel.header.parcel_type,
            ParcelType::Ping | ParcelType::Pong
        );
        {
            let mut mailbox = self.mailbox.lock();
            if mailbox.len() >= self.config.channel_capacity {
                if !keepalive {
                    trace!("mailbox full, dropped parcel for {}", self.hash);
                    self.metrics.mailbox_drops.inc();
                    return Ok(());
                }
                // Evict the oldest non-critical parcel to make room. With a
                // mailbox of nothing but keepalives there is nothing safe to
                // evict; the queue then exceeds its bound by the keepalive,
                // which the ping cadence keeps to a handful at worst.
                if let Some(evict) = mailbox
                    .iter()
                    .position(|p| !matches!(p.header.parcel_type, ParcelType::Ping | ParcelType::Pong))
                {
                    mailbox.remove(evict);
                    warn!("mailbox full, evicted a queued parcel for keepalive to {}", self.hash);
                    self.metrics.mailbox_drops.inc();
                }
            }
            mailbox.push_back(parcel);
        }
        self.mailbox_notify.notify_one();
        Ok(())
    }

    // ===== Lifecycle =====

    /// Starts a dial attempt. Valid only in `Offline`; a no-op otherwise.
    ///
    /// The dial runs on its own task: on success the connection is attached
    /// and the peer goes `Online`, on failure it returns to `Offline` and
    /// waits for the next redial sweep.
    pub fn start_to_dial(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                PeerState::Offline as u8,
                PeerState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            trace!("not dialing {}: not offline", self.hash);
            return;
        }

        let peer = Arc::clone(self);
        tokio::spawn(async move {
            let addr = peer.connect_address();
            debug!("dialing {}", addr);
            match Connection::connect(
                &addr,
                peer.config.dial_timeout,
                peer.config.max_parcel_size,
            )
            .await
            {
                Ok(conn) => peer.attach(conn),
                Err(e) => {
                    debug!("dial {} failed: {}", addr, e);
                    peer.state
                        .store(PeerState::Offline as u8, Ordering::Release);
                }
            }
        });
    }

    /// Attaches an already-accepted inbound connection and goes `Online`.
    pub(crate) fn start_with_active_connection(self: &Arc<Self>, conn: Connection) {
        if self
            .state
            .compare_exchange(
                PeerState::Offline as u8,
                PeerState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("discarding inbound connection for {}: peer already active", self.hash);
            return;
        }
        self.attach(conn);
    }

    /// Binds reader and writer tasks to `conn` and promotes to `Online`.
    fn attach(self: &Arc<Self>, conn: Connection) {
        // A fresh stop signal per connection; the previous connection's
        // tasks hold receivers of the old channel.
        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock() = stop_tx;

        *self.port.write() = conn.remote_addr().port();

        if self
            .state
            .compare_exchange(
                PeerState::Connecting as u8,
                PeerState::Online as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("discarding connection for {}: peer went offline while connecting", self.hash);
            return;
        }

        self.touch_last_seen();
        debug!("peer {} is online ({})", self.hash, if self.outgoing { "outgoing" } else { "incoming" });

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let (sender, receiver) = conn.split();
        tokio::spawn(run_reader(Arc::clone(self), receiver, stop_rx.clone(), epoch));
        tokio::spawn(run_writer(Arc::clone(self), sender, stop_rx, epoch));
    }

    /// Takes the peer offline. Idempotent; never blocks.
    ///
    /// Signals the connection tasks to stop; the writer drains what is left
    /// of the mailbox on its way out.
    pub fn go_offline(&self) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current == PeerState::Offline as u8 {
                return;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    PeerState::Stopping as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        let _ = self.stop_tx.lock().send(true);
        self.state
            .store(PeerState::Offline as u8, Ordering::Release);
        debug!("peer {} is offline", self.hash);
    }

    /// Winds the peer down when a connection task of `epoch` exits.
    ///
    /// A stale task whose connection has already been replaced finds a newer
    /// epoch and returns without touching the live state.
    fn finish_connection(&self, epoch: u64, drain_mailbox: bool) {
        if self.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        if drain_mailbox {
            self.mailbox.lock().clear();
        }
        self.go_offline();
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn drain_mailbox(&self) -> Vec<Parcel> {
        self.mailbox.lock().drain(..).collect()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("hash", &self.hash)
            .field("state", &self.state())
            .field("outgoing", &self.outgoing)
            .field("special", &self.special)
            .field("quality_score", &self.quality_score())
            .finish()
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hash)
    }
}

/// Builds the stable lookup key for an endpoint.
pub fn peer_hash(address: &str, listen_port: u16) -> String {
    format!("{}:{}", address, listen_port)
}

/// Derives the 32-bit bucketing key for an address.
///
/// IPv4 addresses map to their big-endian integer value so that shared
/// prefixes land in nearby buckets; IPv6 addresses and hostnames are folded
/// through SHA-256.
pub fn location_of(address: &str) -> u32 {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => u32::from_be_bytes(v4.octets()),
        _ => {
            let digest = Sha256::digest(address.as_bytes());
            u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
        }
    }
}

/// Reader task: delivers every received parcel to the manager's data
/// channel. Exits on remote close, read error, idle timeout, or stop
/// signal; always takes the peer offline on the way out.
async fn run_reader(
    peer: Arc<Peer>,
    mut conn: ConnectionReceiver,
    mut stop: watch::Receiver<bool>,
    epoch: u64,
) {
    let idle_timeout = peer.config.ping_interval * 3;
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            result = tokio::time::timeout(idle_timeout, conn.recv()) => match result {
                Err(_) => {
                    debug!("peer {} idle for {:?}, disconnecting", peer.hash, idle_timeout);
                    break;
                }
                Ok(Ok(Some(parcel))) => {
                    peer.touch_last_seen();
                    peer.metrics.parcels_received.inc();
                    let event = DataEvent::Parcel(PeerParcel {
                        peer: Arc::clone(&peer),
                        parcel,
                    });
                    if peer.data_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Ok(None)) => {
                    debug!("peer {} closed the connection", peer.hash);
                    break;
                }
                Ok(Err(e)) if e.is_violation() => {
                    warn!("protocol violation from {}: {}", peer.hash, e);
                    let event = DataEvent::Violation {
                        peer: Arc::clone(&peer),
                        error: e,
                    };
                    let _ = peer.data_tx.send(event).await;
                    break;
                }
                Ok(Err(e)) => {
                    debug!("read error from {}: {}", peer.hash, e);
                    break;
                }
            }
        }
    }
    peer.finish_connection(epoch, false);
}

/// Writer task: drains the peer's mailbox into the connection in FIFO
/// order, sleeping on the mailbox notifier while the queue is empty.
async fn run_writer(
    peer: Arc<Peer>,
    mut conn: ConnectionSender,
    mut stop: watch::Receiver<bool>,
    epoch: u64,
) {
    'connection: loop {
        // Drain everything queued. The lock is never held across the write.
        loop {
            let parcel = peer.mailbox.lock().pop_front();
            let Some(parcel) = parcel else { break };
            if let Err(e) = conn.send(parcel).await {
                debug!("write to {} failed: {}", peer.hash, e);
                break 'connection;
            }
            peer.metrics.parcels_sent.inc();
            peer.touch_last_peer_send();
        }

        tokio::select! {
            _ = stop.changed() => break,
            _ = peer.mailbox_notify.notified() => {}
        }
    }

    // The connection is gone; whatever is still queued has nowhere to go.
    peer.finish_connection(epoch, true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Listener;
    use crate::NetworkId;

    fn test_setup(capacity: usize) -> (Arc<OverlayConfig>, mpsc::Sender<DataEvent>, mpsc::Receiver<DataEvent>, Arc<OverlayMetrics>) {
        let config = Arc::new(OverlayConfig {
            channel_capacity: capacity,
            ..OverlayConfig::test_network()
        });
        let (tx, rx) = mpsc::channel(capacity.max(16));
        (config, tx, rx, Arc::new(OverlayMetrics::new()))
    }

    fn make_peer(address: &str, outgoing: bool, listen_port: u16) -> Arc<Peer> {
        let (config, tx, rx, metrics) = test_setup(8);
        std::mem::forget(rx); // keep the data channel open
        Peer::new(address, outgoing, listen_port, false, true, config, tx, metrics)
    }

    #[test]
    fn test_hash_and_connect_address() {
        let peer = make_peer("10.0.0.1", true, 8108);
        assert_eq!(peer.hash(), "10.0.0.1:8108");
        assert_eq!(peer.connect_address(), "10.0.0.1:8108");
        assert!(peer.can_dial());
        assert!(peer.is_offline());
    }

    #[test]
    fn test_inbound_peer_not_dialable() {
        let peer = make_peer("10.0.0.1", false, 0);
        assert_eq!(peer.hash(), "10.0.0.1:0");
        assert!(!peer.can_dial());
    }

    #[test]
    fn test_location_ipv4_big_endian() {
        assert_eq!(location_of("1.2.3.4"), 0x0102_0304);
        assert_eq!(location_of("255.255.255.255"), u32::MAX);
        assert_eq!(location_of("0.0.0.1"), 1);
    }

    #[test]
    fn test_location_non_ipv4_is_stable() {
        let a = location_of("::1");
        let b = location_of("::1");
        assert_eq!(a, b);
        // Distinct inputs should not trivially collide.
        assert_ne!(location_of("node-a.example.com"), location_of("node-b.example.com"));
    }

    #[test]
    fn test_better_prefers_quality_then_age_then_outgoing() {
        let high = make_peer("10.0.0.1", false, 8108);
        let low = make_peer("10.0.0.1", true, 8108);
        high.adjust_quality(10);
        low.adjust_quality(5);
        assert!(high.better(&low));
        assert!(!low.better(&high));

        // Equal scores: the longer-known (earlier last_seen) record wins.
        let older = make_peer("10.0.0.2", false, 8108);
        std::thread::sleep(Duration::from_millis(5));
        let newer = make_peer("10.0.0.2", false, 8108);
        assert!(older.better(&newer));
        assert!(!newer.better(&older));

        // Everything equal but direction: outgoing wins.
        let outgoing = make_peer("10.0.0.3", true, 8108);
        let incoming = make_peer("10.0.0.3", false, 8108);
        {
            // Pin last_seen to the same instant for a deterministic tie.
            let t = Instant::now();
            *outgoing.last_seen.write() = t;
            *incoming.last_seen.write() = t;
        }
        assert!(outgoing.better(&incoming));
        assert!(!incoming.better(&outgoing));
    }

    #[test]
    fn test_cadence_gates_start_open() {
        let peer = make_peer("10.0.0.1", true, 8108);
        assert!(peer.send_quiet_for(Duration::from_secs(1)));
        assert!(peer.peer_request_due(Duration::from_secs(1)));

        peer.touch_last_peer_send();
        peer.mark_peer_request();
        assert!(!peer.send_quiet_for(Duration::from_secs(1)));
        assert!(!peer.peer_request_due(Duration::from_secs(1)));
    }

    #[test]
    fn test_send_to_offline_peer_returns_immediately() {
        let peer = make_peer("10.0.0.1", true, 8108);
        let start = Instant::now();
        peer.send(Parcel::message(NetworkId::TEST, b"x".to_vec()))
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        // Nothing was queued.
        assert!(peer.mailbox.lock().is_empty());
    }

    #[test]
    fn test_mailbox_overflow_policy() {
        let (config, tx, _rx, metrics) = test_setup(1);
        let peer = Peer::new("10.0.0.1", true, 8108, false, true, config, tx, Arc::clone(&metrics));
        peer.force_state(PeerState::Online);

        // First parcel fills the single-slot mailbox.
        peer.send(Parcel::message(NetworkId::TEST, b"one".to_vec()))
            .unwrap();
        // Second application message is dropped (drop-newest).
        peer.send(Parcel::message(NetworkId::TEST, b"two".to_vec()))
            .unwrap();
        assert_eq!(metrics.mailbox_drops.get(), 1);
        assert_eq!(peer.mailbox.lock().len(), 1);

        // A keepalive evicts the oldest non-critical parcel instead of being
        // dropped itself.
        peer.send(Parcel::control(NetworkId::TEST, ParcelType::Ping))
            .unwrap();
        assert_eq!(metrics.mailbox_drops.get(), 2);
        {
            let mailbox = peer.mailbox.lock();
            assert_eq!(mailbox.len(), 1);
            assert_eq!(mailbox[0].header.parcel_type, ParcelType::Ping);
        }

        // With only keepalives queued there is nothing to evict; the second
        // keepalive is queued anyway rather than dropped.
        peer.send(Parcel::control(NetworkId::TEST, ParcelType::Pong))
            .unwrap();
        assert_eq!(metrics.mailbox_drops.get(), 2);
        let queued = peer.drain_mailbox();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].header.parcel_type, ParcelType::Ping);
        assert_eq!(queued[1].header.parcel_type, ParcelType::Pong);
    }

    #[test]
    fn test_go_offline_idempotent() {
        let peer = make_peer("10.0.0.1", true, 8108);
        peer.force_state(PeerState::Online);
        peer.go_offline();
        assert!(peer.is_offline());
        peer.go_offline();
        assert!(peer.is_offline());
    }

    #[tokio::test]
    async fn test_inbound_attach_and_reader_delivers() {
        let (config, tx, mut data_rx, metrics) = test_setup(8);
        let max = config.max_parcel_size;

        let listener = Listener::bind("127.0.0.1", 0, max).await.unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            let mut conn = Connection::connect(&addr.to_string(), Duration::from_secs(5), max)
                .await
                .unwrap();
            conn.send(Parcel::message(NetworkId::TEST, b"hello".to_vec()))
                .await
                .unwrap();
            // Hold the socket open until the test is done with it.
            let _ = conn.recv().await;
        });

        let inbound = listener.accept().await.unwrap();
        let peer = Peer::new(
            inbound.remote_addr().ip().to_string(),
            false,
            0,
            false,
            false,
            config,
            tx,
            metrics,
        );
        peer.start_with_active_connection(inbound);
        assert!(peer.is_online());

        let event = tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            DataEvent::Parcel(pp) => {
                assert_eq!(pp.parcel.payload, b"hello".to_vec());
                assert!(Arc::ptr_eq(&pp.peer, &peer));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        peer.go_offline();
        assert!(peer.is_offline());
        client.abort();
    }

    #[tokio::test]
    async fn test_writer_sends_mailbox_in_order() {
        let (config, tx, _data_rx, metrics) = test_setup(8);
        let max = config.max_parcel_size;

        let listener = Listener::bind("127.0.0.1", 0, max).await.unwrap();
        let addr = listener.local_addr();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let conn = Connection::connect(&addr.to_string(), Duration::from_secs(5), max)
            .await
            .unwrap();
        let mut server_side = accept.await.unwrap();

        let peer = Peer::new("127.0.0.1", true, addr.port(), false, true, config, tx, metrics);
        peer.force_state(PeerState::Connecting);
        peer.attach(conn);
        assert!(peer.is_online());

        for i in 0..3u8 {
            peer.send(Parcel::message(NetworkId::TEST, vec![i])).unwrap();
        }
        for i in 0..3u8 {
            let parcel = tokio::time::timeout(Duration::from_secs(2), server_side.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(parcel.payload, vec![i]);
        }

        peer.go_offline();
    }
}
