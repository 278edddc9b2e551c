//! Peer manager: control loops, admission, selection, broadcast, and bans.
//!
//! The [`PeerManager`] is the primary interface for the overlay subsystem.
//! It handles all aspects of peer-to-peer networking:
//!
//! - **Connection Management**: Dials outgoing peers on a redial cadence and
//!   admits inbound connections against the configured limits
//!
//! - **Peer Discovery**: Bootstraps from a seed URL and learns about new
//!   peers through the peer-share protocol
//!
//! - **Parcel Routing**: Dispatches every received parcel by type, forwarding
//!   application messages to the controller and answering control traffic
//!   itself
//!
//! - **Sybil-resistant selection**: Dial targets are chosen with
//!   prefix-bucketing over the IPv4 address space so that a single /8 cannot
//!   dominate the outgoing peer set
//!
//! # Architecture
//!
//! The manager runs four background tasks:
//!
//! 1. **Listener task**: Accepts incoming connections
//! 2. **Data task**: Consumes every parcel read by any peer's reader
//! 3. **Peer task**: Once-a-second bookkeeping (redial sweep, duplicate
//!    detection, peer-request and ping cadences)
//! 4. **Outbound task**: Consumes the controller's outbound channel
//!
//! plus ad-hoc tasks for peer-share side effects, one dial task per
//! connection attempt, and a reader/writer pair per live connection.

use crate::{
    connection::{Connection, Listener},
    parcel::{decode_peer_share, encode_peer_share, Parcel, ParcelType, PeerShareEntry},
    peer::{peer_hash, DataEvent, Peer, PeerInfo, PeerParcel},
    peer_store::PeerStore,
    seed::fetch_seed_list,
    metrics::{MetricsSnapshot, OverlayMetrics},
    OverlayConfig, OverlayError, Result,
};
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Addressing mode for a parcel handed to the manager by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundTarget {
    /// Send to every peer (`full`) or to a random fanout subset.
    Broadcast {
        /// True for a full broadcast, false for fanout.
        full: bool,
    },
    /// Send to the peer with this hash.
    Peer(String),
    /// Send to one random online peer.
    RandomPeer,
}

/// A parcel the application wants sent, with its addressing.
#[derive(Debug, Clone)]
pub struct OutboundParcel {
    /// Where to send it.
    pub target: OutboundTarget,
    /// What to send.
    pub parcel: Parcel,
}

/// The application's half of the overlay boundary.
///
/// Application messages read off the wire arrive on `inbound` in the order
/// they were read, per peer. Parcels to send go out through `outbound`.
/// The manager never drops an inbound application message: when the channel
/// is full it blocks until the application catches up or shutdown is
/// signalled.
pub struct Controller {
    /// Application messages from the network.
    pub inbound: mpsc::Receiver<PeerParcel>,
    /// Parcels for the network.
    pub outbound: mpsc::Sender<OutboundParcel>,
}

/// Summary statistics for the overlay.
#[derive(Debug, Clone)]
pub struct OverlayStats {
    /// Peers in the store, online or not.
    pub known_peers: usize,
    /// Non-offline inbound peers.
    pub incoming: usize,
    /// Non-offline outbound peers.
    pub outgoing: usize,
    /// Hashes banned this session.
    pub banned: usize,
    /// Counter snapshot.
    pub metrics: MetricsSnapshot,
}

/// Central coordinator for the overlay network.
///
/// Owns the peer store, the control loops, and the session ban list. Shared
/// as `Arc<PeerManager>`; all methods take `&self`.
///
/// # Usage
///
/// ```rust,ignore
/// let (manager, mut controller) = PeerManager::new(config);
/// manager.start().await?;
///
/// // Receive application messages
/// while let Some(msg) = controller.inbound.recv().await {
///     handle_message(msg);
/// }
///
/// // Shutdown
/// manager.stop().await;
/// ```
pub struct PeerManager {
    config: Arc<OverlayConfig>,
    store: Arc<PeerStore>,
    /// IPs of configured special peers; read-only after construction.
    special_ips: HashSet<String>,
    /// Hashes banned this session.
    banned: RwLock<HashSet<String>>,
    metrics: Arc<OverlayMetrics>,
    /// Seeded RNG for selection and shuffles; owned by the manager so tests
    /// can make selection reproducible.
    rng: Mutex<StdRng>,

    data_tx: mpsc::Sender<DataEvent>,
    data_rx: Mutex<Option<mpsc::Receiver<DataEvent>>>,
    inbound_tx: mpsc::Sender<PeerParcel>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundParcel>>>,

    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    listen_addr: Mutex<Option<SocketAddr>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerManager {
    /// Creates a manager and the controller handed to the application.
    pub fn new(config: OverlayConfig) -> (Arc<Self>, Controller) {
        let special_ips = config
            .special_peers
            .iter()
            .filter_map(|entry| entry.rsplit_once(':').map(|(host, _)| host.to_string()))
            .collect();

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let (data_tx, data_rx) = mpsc::channel(config.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, _) = broadcast::channel(4);

        let manager = Arc::new(Self {
            config: Arc::new(config),
            store: Arc::new(PeerStore::new()),
            special_ips,
            banned: RwLock::new(HashSet::new()),
            metrics: Arc::new(OverlayMetrics::new()),
            rng: Mutex::new(rng),
            data_tx,
            data_rx: Mutex::new(Some(data_rx)),
            inbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            running: AtomicBool::new(false),
            shutdown_tx,
            listen_addr: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        });

        let controller = Controller {
            inbound: inbound_rx,
            outbound: outbound_tx,
        };

        (manager, controller)
    }

    /// Starts the manager: binds the listener and launches the control loops,
    /// special-peer dialing, and seed discovery.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(OverlayError::AlreadyStarted);
        }

        if !self.config.seed_url.is_empty() {
            if let Err(e) = self.config.seed_url.parse::<reqwest::Url>() {
                self.running.store(false, Ordering::Release);
                return Err(OverlayError::Config(format!(
                    "invalid seed URL {}: {}",
                    self.config.seed_url, e
                )));
            }
        }

        info!(
            node = %self.config.node_name,
            network = %self.config.network,
            port = self.config.listen_port,
            "starting the peer manager"
        );

        let listener = match Listener::bind(
            &self.config.bind_ip,
            self.config.listen_port,
            self.config.max_parcel_size,
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        *self.listen_addr.lock() = Some(listener.local_addr());

        let mut handles = Vec::new();

        // Listener task
        {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        result = listener.accept() => match result {
                            Ok(conn) => manager.handle_incoming(conn),
                            Err(e) => error!("accept error: {}", e),
                        }
                    }
                }
                debug!("listener loop done");
            }));
        }

        // Data task
        {
            let manager = Arc::clone(self);
            let shutdown = self.shutdown_tx.subscribe();
            let data_rx = self
                .data_rx
                .lock()
                .take()
                .expect("data receiver already taken");
            handles.push(tokio::spawn(manager.manage_data(data_rx, shutdown)));
        }

        // Peer bookkeeping task
        {
            let manager = Arc::clone(self);
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(manager.manage_peers(shutdown)));
        }

        // Outbound task
        {
            let manager = Arc::clone(self);
            let shutdown = self.shutdown_tx.subscribe();
            let outbound_rx = self
                .outbound_rx
                .lock()
                .take()
                .expect("outbound receiver already taken");
            handles.push(tokio::spawn(manager.manage_outbound(outbound_rx, shutdown)));
        }

        self.spawn_special_peers();

        // One-shot seed discovery
        if !self.config.seed_url.is_empty() {
            let manager = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                manager.discover_seeds().await;
            }));
        }

        self.handles.lock().extend(handles);
        Ok(())
    }

    /// Stops the manager and takes every peer offline. Idempotent; completes
    /// in bounded time even if peers are unresponsive.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(node = %self.config.node_name, "stopping the peer manager");

        let _ = self.shutdown_tx.send(());
        for peer in self.store.snapshot() {
            peer.go_offline();
        }

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!(node = %self.config.node_name, "peer manager stopped");
    }

    /// True between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The bound listen address, once started. Useful when the configured
    /// port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    // ===== Introspection =====

    /// Looks up a peer record by hash.
    pub fn get_peer(&self, hash: &str) -> Option<Arc<Peer>> {
        self.store.get(hash)
    }

    /// Number of known peers, online or not.
    pub fn peer_count(&self) -> usize {
        self.store.len()
    }

    /// Number of peers with a live connection.
    pub fn online_count(&self) -> usize {
        self.store.snapshot().iter().filter(|p| p.is_online()).count()
    }

    /// Snapshots every known peer.
    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.store.snapshot().iter().map(|p| p.info()).collect()
    }

    /// Summary statistics.
    pub fn stats(&self) -> OverlayStats {
        let (incoming, outgoing) = self.store.counts();
        OverlayStats {
            known_peers: self.store.len(),
            incoming,
            outgoing,
            banned: self.banned.read().len(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Hashes banned this session.
    pub fn banned_hashes(&self) -> Vec<String> {
        self.banned.read().iter().cloned().collect()
    }

    /// True if the hash is banned.
    pub fn is_banned(&self, hash: &str) -> bool {
        self.banned.read().contains(hash)
    }

    /// Lifts a session ban. Returns true if the hash was banned.
    pub fn unban(&self, hash: &str) -> bool {
        self.banned.write().remove(hash)
    }

    // ===== Peer lifecycle =====

    /// Creates a peer record in `Offline` and inserts it into the store.
    ///
    /// Idempotent: an existing record for the same hash is returned as is.
    /// Banned hashes are refused for the rest of the session.
    pub fn spawn_peer(
        &self,
        address: &str,
        outgoing: bool,
        listen_port: u16,
        special: bool,
    ) -> Result<Arc<Peer>> {
        let hash = peer_hash(address, listen_port);
        if self.banned.read().contains(&hash) {
            return Err(OverlayError::PeerBanned(hash));
        }
        if let Some(existing) = self.store.get(&hash) {
            return Ok(existing);
        }

        let dialable = listen_port != 0;
        let peer = Peer::new(
            address,
            outgoing,
            listen_port,
            special,
            dialable,
            Arc::clone(&self.config),
            self.data_tx.clone(),
            Arc::clone(&self.metrics),
        );
        if self.store.add(Arc::clone(&peer)) {
            debug!(
                "spawned peer {} (outgoing: {}, special: {})",
                peer, outgoing, special
            );
            Ok(peer)
        } else {
            // Lost a race with a concurrent spawn for the same hash.
            Ok(self.store.get(&hash).unwrap_or(peer))
        }
    }

    /// Removes a peer from the store and takes it offline.
    pub fn remove_peer(&self, peer: &Arc<Peer>) {
        peer.go_offline();
        self.store.remove(peer);
    }

    /// Bans a peer: removed from the store, refused on respawn for the rest
    /// of the session.
    pub fn ban_peer(&self, peer: &Arc<Peer>) {
        info!("banning peer {}", peer);
        self.banned.write().insert(peer.hash().to_string());
        self.metrics.bans.inc();
        self.remove_peer(peer);
    }

    // ===== Admission =====

    /// Admission control for an inbound connection.
    ///
    /// Special IPs are always admitted. Everyone else is checked against the
    /// inbound cap, `refuse_incoming`, and `refuse_unknown`. An admitted
    /// connection attaches to the (possibly fresh) record keyed
    /// `"ip:0"`; a second live connection from the same IP is dropped.
    fn handle_incoming(&self, conn: Connection) {
        let ip = conn.remote_addr().ip().to_string();
        let special = self.special_ips.contains(&ip);

        if !special {
            let (incoming, _) = self.store.counts();
            if incoming >= self.config.incoming {
                info!("rejecting inbound connection from {}: inbound limit reached", ip);
                return;
            }
            if self.config.refuse_incoming {
                info!("rejecting inbound connection from {}: refuse_incoming is set", ip);
                return;
            }
            if self.config.refuse_unknown && !self.store.knows_ip(&ip) {
                info!("rejecting inbound connection from {}: unknown address", ip);
                return;
            }
        }

        let hash = peer_hash(&ip, 0);
        if self.banned.read().contains(&hash) {
            warn!("rejecting inbound connection from banned {}", hash);
            return;
        }

        let peer = match self.store.get(&hash) {
            Some(existing) => {
                if !existing.is_offline() {
                    debug!("rejecting inbound connection from {}: already connected", ip);
                    return;
                }
                existing
            }
            None => match self.spawn_peer(&ip, false, 0, special) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!("could not admit {}: {}", ip, e);
                    return;
                }
            },
        };

        peer.start_with_active_connection(conn);
    }

    // ===== Data loop =====

    async fn manage_data(
        self: Arc<Self>,
        mut data_rx: mpsc::Receiver<DataEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = data_rx.recv() => match event {
                    None => break,
                    Some(DataEvent::Violation { peer, error }) => {
                        warn!("peer {} violated the wire protocol: {}", peer, error);
                        self.ban_peer(&peer);
                    }
                    Some(DataEvent::Parcel(pp)) => self.dispatch(pp, &mut shutdown).await,
                }
            }
        }
        debug!("data loop done");
    }

    /// Dispatches one received parcel by type.
    async fn dispatch(
        self: &Arc<Self>,
        pp: PeerParcel,
        shutdown: &mut broadcast::Receiver<()>,
    ) {
        let PeerParcel { peer, parcel } = pp;

        if parcel.header.network != self.config.network {
            warn!(
                "peer {} sent a parcel for network {}, disconnecting",
                peer, parcel.header.network
            );
            self.ban_peer(&peer);
            return;
        }

        trace!("{} from {}", parcel.header.parcel_type, peer);

        match parcel.header.parcel_type {
            ParcelType::Message => {
                self.metrics.application_messages.inc();
                let pp = PeerParcel { peer, parcel };
                // Application parcels are never dropped: block until the
                // controller catches up or shutdown is signalled.
                tokio::select! {
                    result = self.inbound_tx.send(pp) => {
                        if result.is_err() {
                            warn!("controller inbound channel closed, dropping message");
                        }
                    }
                    _ = shutdown.recv() => {}
                }
            }

            ParcelType::PeerRequest => {
                if peer.send_quiet_for(self.config.peer_request_interval) {
                    peer.touch_last_peer_send();
                    let manager = Arc::clone(self);
                    tokio::spawn(async move {
                        manager.share_peers(&peer);
                    });
                } else {
                    warn!("peer {} requested a peer share sooner than expected", peer);
                    self.metrics.rate_violations.inc();
                }
            }

            ParcelType::PeerResponse => {
                if peer.peer_request_due(self.config.peer_request_interval) {
                    peer.mark_peer_request();
                    let manager = Arc::clone(self);
                    tokio::spawn(async move {
                        manager.process_peers(&peer, &parcel);
                    });
                } else {
                    warn!("peer {} sent an unprompted peer share", peer);
                    self.metrics.rate_violations.inc();
                }
            }

            ParcelType::Ping => {
                let pong = Parcel::control(self.config.network, ParcelType::Pong);
                let _ = peer.send(pong);
            }

            // The reader already refreshed last_seen.
            ParcelType::Pong => {}

            ParcelType::Alert => {
                info!(
                    "alert from {}: {}",
                    peer,
                    String::from_utf8_lossy(&parcel.payload)
                );
            }

            ParcelType::MessagePart | ParcelType::Heartbeat => {
                trace!(
                    "ignoring deprecated {} from {}",
                    parcel.header.parcel_type,
                    peer
                );
            }

            ParcelType::Unknown(tag) => {
                warn!("peer {} sent unknown parcel type {}", peer, tag);
                self.metrics.unknown_parcel_types.inc();
            }
        }
    }

    // ===== Peer bookkeeping loop =====

    async fn manage_peers(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        // Once a second normally; faster when the ping cadence demands it.
        let tick = self.config.ping_interval.min(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_dial: Option<Instant> = None;
        let mut last_duplicate_check: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            if last_dial.map_or(true, |t| t.elapsed() >= self.config.redial_interval) {
                last_dial = Some(Instant::now());
                self.dial_outgoing();
            }

            if last_duplicate_check.map_or(true, |t| t.elapsed() >= self.config.redial_interval) {
                last_duplicate_check = Some(Instant::now());
                self.detect_duplicates();
            }

            for peer in self.store.snapshot() {
                if !peer.is_online() {
                    continue;
                }

                if peer.peer_request_due(self.config.peer_request_interval) {
                    peer.mark_peer_request();
                    let request = Parcel::control(self.config.network, ParcelType::PeerRequest);
                    let _ = peer.send(request);
                }

                if peer.send_quiet_for(self.config.ping_interval) {
                    let ping = Parcel::control(self.config.network, ParcelType::Ping);
                    let _ = peer.send(ping);
                }
            }
        }
        debug!("peer loop done");
    }

    /// Dial sweep: tops the outgoing peer set up to the configured target.
    fn dial_outgoing(&self) {
        let (_, outgoing) = self.store.counts();
        let want = self.config.outgoing.saturating_sub(outgoing);
        if want == 0 {
            return;
        }

        let filtered = self.filtered_outgoing();
        if filtered.is_empty() {
            return;
        }

        let picked = {
            let mut rng = self.rng.lock();
            select_outgoing(filtered, want, &mut rng)
        };
        debug!("dialing {} peers", picked.len());
        for peer in picked {
            peer.start_to_dial();
        }
    }

    /// Peers eligible for an outgoing dial: offline, dialable, and special
    /// when only trusted peers may be dialed.
    fn filtered_outgoing(&self) -> Vec<Arc<Peer>> {
        self.store
            .snapshot()
            .into_iter()
            .filter(|p| {
                p.is_offline()
                    && p.can_dial()
                    && (!self.config.trusted_only || p.is_special())
            })
            .collect()
    }

    /// One pass of duplicate detection: for every connect address with more
    /// than one record, the better record stays.
    fn detect_duplicates(&self) {
        let snapshot = self.store.snapshot();
        for peer in resolve_duplicates(&snapshot) {
            info!("removing duplicate peer {}", peer);
            self.remove_peer(&peer);
        }
    }

    // ===== Broadcast =====

    /// Sends a parcel to the peer set.
    ///
    /// `full` reaches every known peer; otherwise a random fanout subset of
    /// the online peers. Special peers receive every broadcast either way.
    /// After shutdown this returns immediately.
    pub fn broadcast(&self, parcel: Parcel, full: bool) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        if full {
            for peer in self.store.snapshot() {
                let _ = peer.send(parcel.clone());
            }
            return;
        }

        let selection = self.select_random_peers(self.config.fanout);
        let mut reached: HashSet<String> = HashSet::with_capacity(selection.len());
        for peer in &selection {
            reached.insert(peer.hash().to_string());
            let _ = peer.send(parcel.clone());
        }

        // Special peers are never left out of a broadcast.
        for peer in self.store.snapshot() {
            if peer.is_special() && !reached.contains(peer.hash()) {
                let _ = peer.send(parcel.clone());
            }
        }
    }

    /// Picks up to `count` random online peers.
    ///
    /// The store is snapshotted under the read lock; the shuffle happens
    /// after the lock is released.
    pub fn select_random_peers(&self, count: usize) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|p| p.is_online())
            .collect();

        // Not enough to randomize
        if peers.len() <= count {
            return peers;
        }

        {
            // Partial Fisher-Yates: only the returned prefix needs shuffling.
            let mut rng = self.rng.lock();
            for i in 0..count {
                let j = rng.gen_range(i..peers.len());
                peers.swap(i, j);
            }
        }
        peers.truncate(count);
        peers
    }

    /// Sends a parcel to a single peer, specified by hash.
    ///
    /// An empty hash picks one random online peer. After shutdown this
    /// returns immediately.
    pub fn to_peer(&self, hash: &str, parcel: Parcel) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        if hash.is_empty() {
            if let Some(peer) = self.select_random_peers(1).into_iter().next() {
                let _ = peer.send(parcel);
            }
        } else if let Some(peer) = self.store.get(hash) {
            let _ = peer.send(parcel);
        }
    }

    // ===== Outbound loop =====

    async fn manage_outbound(
        self: Arc<Self>,
        mut outbound_rx: mpsc::Receiver<OutboundParcel>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                item = outbound_rx.recv() => match item {
                    None => break,
                    Some(OutboundParcel { target, parcel }) => match target {
                        OutboundTarget::Broadcast { full } => self.broadcast(parcel, full),
                        OutboundTarget::Peer(hash) => self.to_peer(&hash, parcel),
                        OutboundTarget::RandomPeer => self.to_peer("", parcel),
                    }
                }
            }
        }
        debug!("outbound loop done");
    }

    // ===== Peer share =====

    /// Answers a `PeerRequest` with the shareable subset of the store.
    fn share_peers(&self, peer: &Arc<Peer>) {
        let entries = self.filtered_sharing();
        debug!("sharing {} peers with {}", entries.len(), peer);
        let payload = encode_peer_share(&entries);
        let parcel = Parcel::new(self.config.network, ParcelType::PeerResponse, payload);
        self.metrics.shares_sent.inc();
        let _ = peer.send(parcel);
    }

    /// Peers eligible for sharing: not special, scored at or above the
    /// configured threshold, and with a usable listen endpoint.
    fn filtered_sharing(&self) -> Vec<PeerShareEntry> {
        self.store
            .snapshot()
            .iter()
            .filter(|p| {
                !p.is_special()
                    && p.quality_score() >= self.config.minimum_quality_score
                    && p.listen_port() != 0
            })
            .map(|p| PeerShareEntry {
                address: p.address().to_string(),
                listen_port: p.listen_port(),
                quality_score: p.quality_score(),
            })
            .collect()
    }

    /// Merges a `PeerResponse` into the store.
    ///
    /// Candidates already known by connect address are skipped; a payload
    /// that fails to decode costs the sender a quality point.
    fn process_peers(&self, peer: &Arc<Peer>, parcel: &Parcel) {
        let entries = match decode_peer_share(&parcel.payload) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to decode peer share from {}: {}", peer, e);
                peer.adjust_quality(-1);
                return;
            }
        };
        self.metrics.shares_processed.inc();

        let known: HashSet<String> = self
            .store
            .snapshot()
            .iter()
            .map(|p| p.connect_address())
            .collect();

        let mut added = 0usize;
        for entry in entries {
            // Entries without a usable listen endpoint cannot be dialed.
            if entry.address.is_empty() || entry.listen_port == 0 {
                continue;
            }
            if known.contains(&peer_hash(&entry.address, entry.listen_port)) {
                continue;
            }
            if self
                .spawn_peer(&entry.address, true, entry.listen_port, false)
                .is_ok()
            {
                added += 1;
            }
        }
        debug!("peer share from {} added {} new peers", peer, added);
    }

    // ===== Discovery =====

    /// Spawns the configured special peers: dialed always, never shared.
    fn spawn_special_peers(&self) {
        for entry in &self.config.special_peers {
            let parsed = entry
                .rsplit_once(':')
                .and_then(|(host, port)| port.parse::<u16>().ok().map(|p| (host, p)));
            match parsed {
                Some((host, port)) => {
                    let _ = self.spawn_peer(host, true, port, true);
                }
                None => warn!("bad special peer entry [{}]", entry),
            }
        }
    }

    /// One-shot seed discovery: fetches the seed list and spawns each entry
    /// as an offline, dialable, outgoing peer.
    pub async fn discover_seeds(&self) {
        if self.config.seed_url.is_empty() {
            return;
        }
        info!("contacting seed URL to get peers");
        match fetch_seed_list(&self.config.seed_url).await {
            Ok(seeds) => {
                let mut spawned = 0usize;
                for seed in &seeds {
                    if self.spawn_peer(&seed.host, true, seed.port, false).is_ok() {
                        spawned += 1;
                    }
                }
                info!("seed discovery yielded {} peers", spawned);
            }
            Err(e) => {
                warn!(
                    "seed discovery from {} failed: {}",
                    self.config.seed_url, e
                );
            }
        }
    }
}

/// Chooses `wanted` dial targets from `filtered`, maximising address-prefix
/// diversity.
///
/// The IPv4 space is cut into `wanted` equal buckets; each peer lands in the
/// bucket covering its location. Buckets are then visited round-robin from a
/// random offset, taking one random member per non-empty bucket, until
/// enough peers are picked. A clustered set (one /8, say) collapses into few
/// buckets and cannot crowd out the rest of the address space.
pub(crate) fn select_outgoing(
    filtered: Vec<Arc<Peer>>,
    wanted: usize,
    rng: &mut StdRng,
) -> Vec<Arc<Peer>> {
    if wanted == 0 {
        return Vec::new();
    }
    // we have just enough
    if filtered.len() <= wanted {
        return filtered;
    }

    // 64-bit arithmetic: for wanted == 1 the bucket spans the whole space
    // and the size would not fit in u32.
    let bucket_size = (u32::MAX as u64 / wanted as u64) + 1;
    let mut buckets: Vec<Vec<Arc<Peer>>> = vec![Vec::new(); wanted];
    for peer in filtered {
        let index = (peer.location() as u64 / bucket_size) as usize;
        buckets[index].push(peer);
    }

    let mut picked = Vec::with_capacity(wanted);
    while picked.len() < wanted {
        // start at a random point in the bucket array
        let offset = rng.gen_range(0..buckets.len());
        for i in 0..buckets.len() {
            let index = (i + offset) % buckets.len();
            let bucket = &mut buckets[index];
            if !bucket.is_empty() {
                let member = rng.gen_range(0..bucket.len());
                picked.push(bucket.swap_remove(member));
                if picked.len() == wanted {
                    break;
                }
            }
        }
    }
    picked
}

/// Groups peers by connect address and returns the records to remove: for
/// every address with multiple records, all but the best one.
pub(crate) fn resolve_duplicates(peers: &[Arc<Peer>]) -> Vec<Arc<Peer>> {
    let mut keep: HashMap<String, Arc<Peer>> = HashMap::new();
    let mut remove = Vec::new();
    for peer in peers {
        match keep.entry(peer.connect_address()) {
            Entry::Occupied(mut entry) => {
                if peer.better(entry.get()) {
                    remove.push(Arc::clone(entry.get()));
                    entry.insert(Arc::clone(peer));
                } else {
                    remove.push(Arc::clone(peer));
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(peer));
            }
        }
    }
    remove
}
