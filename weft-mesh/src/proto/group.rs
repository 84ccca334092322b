//! The peer-group membership state machine.
//!
//! All IO is mediated by [`InEvent`]/[`OutEvent`]: the driver feeds in
//! transport, secure-channel and peer-source events, and executes the dial,
//! accept, send and timer requests the machine emits. Time enters only
//! through the `now` argument of [`PeerGroupState::handle`], which keeps the
//! whole protocol runnable against a simulated network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use indexmap::IndexMap;
use lru::LruCache;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use weft_base::Hash;

use super::{ConnId, Endpoint, InstanceId, PeerGroupId, PeerInfo};

/// How many candidates to ask the peer source for per discovery round,
/// relative to the minimum mesh size.
const DISCOVERY_CANDIDATE_FACTOR: usize = 5;
/// Window after startup during which rate limits are boosted while the mesh
/// is still below the minimum.
const BOOTSTRAP_WINDOW: Duration = Duration::from_secs(20);
/// Interval multiplier applied during the bootstrap window.
const BOOTSTRAP_FACTOR: f64 = 0.05;
/// Bound on the recently-queried endpoint cache.
const ONLINE_QUERY_CACHE_SIZE: usize = 128;

/// Peer-group agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Keep dialing until this many endpoints are connected.
    pub min_peers: usize,
    /// Never hold connections to more endpoints than this.
    pub max_peers: usize,
    /// Non-ready connections older than this are dropped.
    pub peer_connection_timeout: Duration,
    /// Do not redial an endpoint more often than this.
    pub peer_connection_attempt_interval: Duration,
    /// Do not query the peer source more often than this.
    pub peer_discovery_attempt_interval: Duration,
    /// Cadence of the maintenance tick.
    pub tick_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_peers: 3,
            max_peers: 12,
            peer_connection_timeout: Duration::from_secs(20),
            peer_connection_attempt_interval: Duration::from_secs(10),
            peer_discovery_attempt_interval: Duration::from_secs(15),
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// Wire messages exchanged between peer-group agents.
///
/// Peering offers and replies travel on the plain channel; connection
/// choice and peer messages only ever travel on the secure channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Ask the remote agent to peer within a group.
    PeeringOffer {
        /// The group being joined.
        peer_group_id: PeerGroupId,
        /// Identity hash of the offering side.
        local_identity_hash: Hash,
    },
    /// Answer to a peering offer.
    PeeringOfferReply {
        /// The group the offer was for.
        peer_group_id: PeerGroupId,
        /// Identity hash of the replying side.
        local_identity_hash: Hash,
        /// Whether the offer was accepted.
        accepted: bool,
    },
    /// Propose the connection this message travels on as the one to keep.
    ChooseConnection {
        /// The group the connection belongs to.
        peer_group_id: PeerGroupId,
    },
    /// Confirm the connection this message travels on as the chosen one.
    ConfirmChosenConnection {
        /// The group the connection belongs to.
        peer_group_id: PeerGroupId,
    },
    /// Application payload for another agent at the remote peer.
    PeerMessage {
        /// The group the connection belongs to.
        peer_group_id: PeerGroupId,
        /// The destination agent.
        agent_id: String,
        /// Opaque payload.
        content: Bytes,
    },
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// We initiated; the transport is dialing.
    Connecting,
    /// The remote initiated; accepted, transport not up yet.
    ReceivingConnection,
    /// Transport up, we are the acceptor, no offer seen yet.
    WaitingForOffer,
    /// Transport up, our offer is out.
    OfferSent,
    /// Peering agreed; waiting for the secure channel to authenticate.
    OfferAccepted,
    /// Authenticated both ways; the peer is live.
    Ready,
}

/// Input event to the state handler.
#[derive(Debug, Clone)]
pub enum InEvent {
    /// A previously scheduled timer fired.
    TimerExpired(Timer),
    /// A connection we initiated or accepted is up.
    ConnectionEstablished {
        /// The connection.
        conn_id: ConnId,
        /// Remote process instance, when the transport reports one.
        remote_instance: Option<InstanceId>,
    },
    /// A remote peer wants to connect to us.
    IncomingConnection {
        /// Connection id allocated by the initiator.
        conn_id: ConnId,
        /// The initiator's endpoint.
        remote_endpoint: Endpoint,
        /// Remote process instance, when the transport reports one.
        remote_instance: Option<InstanceId>,
    },
    /// The transport lost a connection.
    ConnectionClosed {
        /// The connection.
        conn_id: ConnId,
    },
    /// A plain (unsecured) message arrived.
    MessageReceived {
        /// The connection it arrived on.
        conn_id: ConnId,
        /// The message.
        message: Message,
    },
    /// A message arrived on the secure channel.
    SecureMessageReceived {
        /// The connection it arrived on.
        conn_id: ConnId,
        /// Authenticated sender identity hash.
        sender: Hash,
        /// Recipient identity hash.
        recipient: Hash,
        /// The message.
        message: Message,
    },
    /// The secure channel authenticated an identity on a connection.
    IdentityAuthenticated {
        /// The connection.
        conn_id: ConnId,
        /// The authenticated identity.
        identity_hash: Hash,
    },
    /// An endpoint we asked about is listening.
    RemoteAddressListening {
        /// The endpoint.
        endpoint: Endpoint,
    },
    /// The peer source answered a discovery query.
    PeersDiscovered {
        /// Candidate peers.
        peers: Vec<PeerInfo>,
    },
    /// The peer source answered a membership check for one endpoint.
    PeerCheckResult {
        /// The endpoint asked about.
        endpoint: Endpoint,
        /// The peer, if the source still recognizes the endpoint.
        peer: Option<PeerInfo>,
    },
}

/// An output event from the state handler.
#[derive(Debug, Clone)]
pub enum OutEvent {
    /// Dial a remote endpoint.
    Connect {
        /// Connection id allocated for the dial.
        conn_id: ConnId,
        /// Our endpoint.
        local: Endpoint,
        /// The endpoint to dial.
        remote: Endpoint,
    },
    /// Accept an incoming connection.
    AcceptConnection {
        /// The connection.
        conn_id: ConnId,
    },
    /// Release a connection.
    ReleaseConnection {
        /// The connection.
        conn_id: ConnId,
    },
    /// Ask the transport whether a connection is still alive; a dead one
    /// comes back as [`InEvent::ConnectionClosed`].
    CheckConnection {
        /// The connection.
        conn_id: ConnId,
    },
    /// Send a plain message.
    SendMessage {
        /// The connection to send on.
        conn_id: ConnId,
        /// The message.
        message: Message,
    },
    /// Ask the secure channel to receive as the given identity.
    SecureListen {
        /// The connection.
        conn_id: ConnId,
        /// Our identity.
        identity_hash: Hash,
    },
    /// Ask the secure channel to send towards the given remote identity.
    SecureExpect {
        /// The connection.
        conn_id: ConnId,
        /// The expected remote identity.
        identity_hash: Hash,
    },
    /// Send a message over the secure channel.
    SecureSend {
        /// The connection to send on.
        conn_id: ConnId,
        /// Sender identity hash.
        sender: Hash,
        /// Recipient identity hash.
        recipient: Hash,
        /// The message.
        message: Message,
    },
    /// Ask the peer source for candidates.
    QueryPeers {
        /// Maximum number of candidates.
        count: usize,
    },
    /// Ask the peer source whether an endpoint still belongs to the group.
    CheckPeer {
        /// The endpoint.
        endpoint: Endpoint,
    },
    /// Ask the transport which of these endpoints are listening.
    QueryOnlineStatus {
        /// The endpoints.
        endpoints: Vec<Endpoint>,
    },
    /// Schedule a timer. The runtime must feed back
    /// [`InEvent::TimerExpired`] after the delay.
    ScheduleTimer {
        /// The delay.
        delay: Duration,
        /// The timer payload.
        timer: Timer,
    },
    /// Emit an event to the application.
    EmitEvent(Event),
}

/// Timers the machine schedules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    /// The periodic maintenance tick.
    Tick,
}

/// Events emitted to the application.
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer reached the ready state.
    NewPeer {
        /// The peer.
        peer: PeerInfo,
    },
    /// The last ready connection to a peer went away.
    LostPeer {
        /// The peer.
        peer: PeerInfo,
    },
    /// An application payload arrived from a ready peer.
    PeerMessage {
        /// The sending peer.
        peer: PeerInfo,
        /// The destination agent.
        agent_id: String,
        /// Opaque payload.
        content: Bytes,
    },
}

/// Cumulative counters.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Connections we initiated.
    pub connections_initiated: u64,
    /// Connections we accepted.
    pub connections_accepted: u64,
    /// Connections dropped for spending too long in a non-ready state.
    pub timeouts: u64,
}

/// One row of [`PeerGroupState::get_state`].
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    /// The connection.
    pub conn_id: ConnId,
    /// The remote endpoint.
    pub endpoint: Endpoint,
    /// Current lifecycle state.
    pub state: ConnectionState,
}

#[derive(Debug, Clone)]
struct Connection {
    endpoint: Endpoint,
    identity_hash: Hash,
    state: ConnectionState,
    timestamp: Instant,
    local_auth: bool,
    remote_auth: bool,
}

/// The membership state machine for one peer group.
pub struct PeerGroupState {
    group_id: PeerGroupId,
    local: PeerInfo,
    local_instance: InstanceId,
    config: Config,
    started_at: Option<Instant>,
    connections: BTreeMap<ConnId, Connection>,
    per_endpoint: HashMap<Endpoint, Vec<ConnId>>,
    instance_per_endpoint: HashMap<Endpoint, InstanceId>,
    attempt_timestamps: HashMap<Endpoint, Instant>,
    online_queries: LruCache<Endpoint, Instant>,
    chosen: HashMap<Endpoint, ConnId>,
    /// Discovery results, in the order the peer source produced them.
    known_peers: IndexMap<Endpoint, PeerInfo>,
    pending_accepts: HashMap<Endpoint, Vec<(ConnId, Option<InstanceId>)>>,
    last_discovery: Option<Instant>,
    ticking: bool,
    shut_down: bool,
    conn_counter: u64,
    rng: StdRng,
    stats: Stats,
    outbox: VecDeque<OutEvent>,
}

impl std::fmt::Debug for PeerGroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerGroupState")
            .field("group_id", &self.group_id)
            .field("endpoint", &self.local.endpoint)
            .field("connections", &self.connections.len())
            .field("ready_peers", &self.get_peers().len())
            .finish()
    }
}

impl PeerGroupState {
    /// Create the state machine for a group.
    pub fn new(
        group_id: PeerGroupId,
        local: PeerInfo,
        local_instance: InstanceId,
        config: Config,
    ) -> Self {
        Self::with_rng(
            group_id,
            local,
            local_instance,
            config,
            StdRng::from_entropy(),
        )
    }

    /// Create the state machine with a caller-provided random number
    /// generator, for deterministic candidate selection in tests.
    pub fn with_rng(
        group_id: PeerGroupId,
        local: PeerInfo,
        local_instance: InstanceId,
        config: Config,
        rng: StdRng,
    ) -> Self {
        PeerGroupState {
            group_id,
            local,
            local_instance,
            config,
            started_at: None,
            connections: BTreeMap::new(),
            per_endpoint: HashMap::new(),
            instance_per_endpoint: HashMap::new(),
            attempt_timestamps: HashMap::new(),
            online_queries: LruCache::new(
                NonZeroUsize::new(ONLINE_QUERY_CACHE_SIZE).expect("nonzero"),
            ),
            chosen: HashMap::new(),
            known_peers: IndexMap::new(),
            pending_accepts: HashMap::new(),
            last_discovery: None,
            ticking: false,
            shut_down: false,
            conn_counter: 0,
            rng,
            stats: Stats::default(),
            outbox: VecDeque::new(),
        }
    }

    /// The group this machine maintains.
    pub fn group_id(&self) -> &PeerGroupId {
        &self.group_id
    }

    /// Our own peer info.
    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    /// The process instance the transport should announce for us.
    pub fn local_instance(&self) -> &InstanceId {
        &self.local_instance
    }

    /// Mark the start of operation and schedule the first tick.
    pub fn start(&mut self, now: Instant) -> impl Iterator<Item = OutEvent> + '_ {
        self.started_at = Some(now);
        self.outbox.push_back(OutEvent::ScheduleTimer {
            delay: Duration::ZERO,
            timer: Timer::Tick,
        });
        self.outbox.drain(..)
    }

    /// Handle an input event; returns the effects to execute.
    pub fn handle(&mut self, event: InEvent, now: Instant) -> impl Iterator<Item = OutEvent> + '_ {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if !self.shut_down {
            trace!(endpoint = %self.local.endpoint, ?event, "handling");
            match event {
                InEvent::TimerExpired(Timer::Tick) => self.tick(now),
                InEvent::ConnectionEstablished {
                    conn_id,
                    remote_instance,
                } => self.on_established(conn_id, remote_instance, now),
                InEvent::IncomingConnection {
                    conn_id,
                    remote_endpoint,
                    remote_instance,
                } => self.on_incoming(conn_id, remote_endpoint, remote_instance, now),
                InEvent::ConnectionClosed { conn_id } => self.on_closed(conn_id),
                InEvent::MessageReceived { conn_id, message } => {
                    self.on_message(conn_id, message, now)
                }
                InEvent::SecureMessageReceived {
                    conn_id,
                    sender,
                    recipient,
                    message,
                } => self.on_secure_message(conn_id, sender, recipient, message, now),
                InEvent::IdentityAuthenticated {
                    conn_id,
                    identity_hash,
                } => self.on_identity_authenticated(conn_id, identity_hash, now),
                InEvent::RemoteAddressListening { endpoint } => self.on_listening(endpoint, now),
                InEvent::PeersDiscovered { peers } => self.on_peers_discovered(peers, now),
                InEvent::PeerCheckResult { endpoint, peer } => {
                    self.on_peer_check(endpoint, peer, now)
                }
            }
        }
        self.outbox.drain(..)
    }

    /// Drain queued effects without feeding an event (used after the direct
    /// send operations below).
    pub fn drain(&mut self) -> impl Iterator<Item = OutEvent> + '_ {
        self.outbox.drain(..)
    }

    // ---- public operations ----

    /// Send a payload to the agent `agent_id` at a ready peer. Returns
    /// whether a ready connection was available.
    pub fn send_to_peer(&mut self, endpoint: &Endpoint, agent_id: &str, content: Bytes) -> bool {
        let Some(conn_id) = self.ready_connection(endpoint) else {
            return false;
        };
        let Some(conn) = self.connections.get(&conn_id) else {
            return false;
        };
        let message = Message::PeerMessage {
            peer_group_id: self.group_id,
            agent_id: agent_id.to_string(),
            content,
        };
        self.outbox.push_back(OutEvent::SecureSend {
            conn_id,
            sender: self.local.identity_hash,
            recipient: conn.identity_hash,
            message,
        });
        true
    }

    /// Send a payload to every ready peer; returns how many were reached.
    pub fn send_to_all_peers(&mut self, agent_id: &str, content: Bytes) -> usize {
        let endpoints: Vec<Endpoint> = self.ready_endpoints();
        let mut sent = 0;
        for endpoint in endpoints {
            if self.send_to_peer(&endpoint, agent_id, content.clone()) {
                sent += 1;
            }
        }
        sent
    }

    /// The ready peers, one entry per endpoint.
    pub fn get_peers(&self) -> Vec<PeerInfo> {
        self.ready_endpoints()
            .into_iter()
            .filter_map(|endpoint| self.peer_info_for(&endpoint))
            .collect()
    }

    /// Cumulative counters.
    pub fn get_stats(&self) -> &Stats {
        &self.stats
    }

    /// Snapshot of all connections.
    pub fn get_state(&self) -> Vec<ConnectionSummary> {
        self.connections
            .iter()
            .map(|(conn_id, conn)| ConnectionSummary {
                conn_id: conn_id.clone(),
                endpoint: conn.endpoint.clone(),
                state: conn.state,
            })
            .collect()
    }

    /// Release every connection and stop scheduling ticks.
    pub fn shutdown(&mut self) -> impl Iterator<Item = OutEvent> + '_ {
        self.shut_down = true;
        let conn_ids: Vec<ConnId> = self.connections.keys().cloned().collect();
        for conn_id in conn_ids {
            self.outbox.push_back(OutEvent::ReleaseConnection {
                conn_id: conn_id.clone(),
            });
            self.remove_connection(&conn_id, false);
        }
        self.outbox.drain(..)
    }

    // ---- tick ----

    fn tick(&mut self, now: Instant) {
        // a tick arriving while one is being expanded is skipped
        if !self.ticking {
            self.ticking = true;
            self.cleanup(now);
            self.run_discovery(now);
            self.deduplicate(now);
            self.validate_peers();
            self.ticking = false;
        }
        self.outbox.push_back(OutEvent::ScheduleTimer {
            delay: self.boosted(self.config.tick_interval, now),
            timer: Timer::Tick,
        });
    }

    fn cleanup(&mut self, now: Instant) {
        let mut stale: Vec<ConnId> = Vec::new();
        for (conn_id, conn) in &self.connections {
            match conn.state {
                ConnectionState::Ready => {
                    self.outbox.push_back(OutEvent::CheckConnection {
                        conn_id: conn_id.clone(),
                    });
                }
                _ => {
                    if now.duration_since(conn.timestamp) > self.config.peer_connection_timeout {
                        stale.push(conn_id.clone());
                    }
                }
            }
        }
        for conn_id in stale {
            debug!(endpoint = %self.local.endpoint, %conn_id, "connection timed out");
            self.stats.timeouts += 1;
            self.teardown(&conn_id);
        }
        let attempt_interval = self.config.peer_connection_attempt_interval;
        self.attempt_timestamps
            .retain(|_, t| now.duration_since(*t) <= attempt_interval);
    }

    fn run_discovery(&mut self, now: Instant) {
        if self.per_endpoint.len() >= self.config.min_peers {
            return;
        }
        let interval = self.boosted(self.config.peer_discovery_attempt_interval, now);
        let due = self
            .last_discovery
            .map_or(true, |t| now.duration_since(t) >= interval);
        if due {
            self.last_discovery = Some(now);
            self.outbox.push_back(OutEvent::QueryPeers {
                count: self.config.min_peers * DISCOVERY_CANDIDATE_FACTOR,
            });
        }
    }

    fn deduplicate(&mut self, _now: Instant) {
        let endpoints: Vec<Endpoint> = self
            .per_endpoint
            .iter()
            .filter(|(_, conns)| conns.len() > 1)
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        for endpoint in endpoints {
            if let Some(chosen) = self.chosen.get(&endpoint) {
                if self
                    .connections
                    .get(chosen)
                    .is_some_and(|c| c.state == ConnectionState::Ready)
                {
                    continue;
                }
            }
            let Some(smallest) = self.smallest_ready_conn(&endpoint) else {
                continue;
            };
            debug!(endpoint = %self.local.endpoint, remote = %endpoint, conn = %smallest, "proposing connection choice");
            self.chosen.insert(endpoint.clone(), smallest.clone());
            self.secure_control(
                &smallest,
                Message::ChooseConnection {
                    peer_group_id: self.group_id,
                },
            );
        }
    }

    fn validate_peers(&mut self) {
        for endpoint in self.per_endpoint.keys() {
            self.outbox.push_back(OutEvent::CheckPeer {
                endpoint: endpoint.clone(),
            });
        }
    }

    /// Apply the bootstrap boost to an interval: within the first moments
    /// of operation, while the mesh is still below the minimum, rate
    /// limits shrink so the mesh forms quickly.
    fn boosted(&self, interval: Duration, now: Instant) -> Duration {
        let bootstrapping = self
            .started_at
            .is_some_and(|start| now.duration_since(start) < BOOTSTRAP_WINDOW)
            && self.per_endpoint.len() < self.config.min_peers;
        if bootstrapping {
            interval.mul_f64(BOOTSTRAP_FACTOR)
        } else {
            interval
        }
    }

    // ---- discovery & dialing ----

    fn on_peers_discovered(&mut self, peers: Vec<PeerInfo>, now: Instant) {
        for peer in peers {
            if peer.endpoint != self.local.endpoint {
                self.known_peers.insert(peer.endpoint.clone(), peer);
            }
        }
        let missing = self
            .config
            .min_peers
            .saturating_sub(self.per_endpoint.len());
        if missing == 0 {
            return;
        }
        let attempt_interval = self.boosted(self.config.peer_connection_attempt_interval, now);
        let mut fresh: Vec<Endpoint> = self
            .known_peers
            .keys()
            .filter(|endpoint| !self.per_endpoint.contains_key(*endpoint))
            .filter(|endpoint| {
                self.online_queries
                    .peek(*endpoint)
                    .map_or(true, |t| now.duration_since(*t) >= attempt_interval)
            })
            .filter(|endpoint| {
                self.attempt_timestamps
                    .get(*endpoint)
                    .map_or(true, |t| now.duration_since(*t) >= attempt_interval)
            })
            .cloned()
            .collect();
        // if the rate limits left us short, retry recently attempted peers
        if fresh.is_empty() {
            fresh = self
                .known_peers
                .keys()
                .filter(|endpoint| !self.per_endpoint.contains_key(*endpoint))
                .cloned()
                .collect();
        }
        // sample rather than always taking the head of the list, so rounds
        // of rejected candidates cannot starve the rest
        fresh.shuffle(&mut self.rng);
        let candidates: Vec<Endpoint> = fresh.into_iter().take(missing).collect();
        if candidates.is_empty() {
            return;
        }
        for endpoint in &candidates {
            self.online_queries.put(endpoint.clone(), now);
        }
        self.outbox.push_back(OutEvent::QueryOnlineStatus {
            endpoints: candidates,
        });
    }

    fn on_listening(&mut self, endpoint: Endpoint, now: Instant) {
        let Some(peer) = self.known_peers.get(&endpoint).cloned() else {
            return;
        };
        if self.should_connect_to_peer(&peer, now) {
            self.connect_to(&peer, now);
        }
    }

    fn should_connect_to_peer(&self, peer: &PeerInfo, now: Instant) -> bool {
        peer.endpoint != self.local.endpoint
            && self.per_endpoint.len() < self.config.min_peers
            && !self.per_endpoint.contains_key(&peer.endpoint)
            && self
                .attempt_timestamps
                .get(&peer.endpoint)
                .map_or(true, |t| {
                    now.duration_since(*t)
                        >= self.boosted(self.config.peer_connection_attempt_interval, now)
                })
    }

    fn should_accept_connection(&self, peer: &PeerInfo) -> bool {
        let new_endpoint = usize::from(!self.per_endpoint.contains_key(&peer.endpoint));
        peer.endpoint != self.local.endpoint
            && self.per_endpoint.len() + new_endpoint <= self.config.max_peers
            && self.ready_connection(&peer.endpoint).is_none()
    }

    fn connect_to(&mut self, peer: &PeerInfo, now: Instant) {
        let conn_id = self.allocate_conn_id(&peer.endpoint);
        debug!(endpoint = %self.local.endpoint, remote = %peer.endpoint, %conn_id, "dialing");
        self.track_connection(
            conn_id.clone(),
            Connection {
                endpoint: peer.endpoint.clone(),
                identity_hash: peer.identity_hash,
                state: ConnectionState::Connecting,
                timestamp: now,
                local_auth: false,
                remote_auth: false,
            },
        );
        self.attempt_timestamps.insert(peer.endpoint.clone(), now);
        self.stats.connections_initiated += 1;
        self.outbox.push_back(OutEvent::Connect {
            conn_id,
            local: self.local.endpoint.clone(),
            remote: peer.endpoint.clone(),
        });
    }

    fn allocate_conn_id(&mut self, remote: &Endpoint) -> ConnId {
        let id = ConnId(format!(
            "conn/{}/{}/{:08x}",
            self.local.endpoint, remote, self.conn_counter
        ));
        self.conn_counter += 1;
        id
    }

    // ---- incoming connections ----

    fn on_incoming(
        &mut self,
        conn_id: ConnId,
        remote_endpoint: Endpoint,
        remote_instance: Option<InstanceId>,
        now: Instant,
    ) {
        match self.known_peers.get(&remote_endpoint).cloned() {
            Some(peer) => self.try_accept(conn_id, &peer, remote_instance, now),
            None => {
                self.pending_accepts
                    .entry(remote_endpoint.clone())
                    .or_default()
                    .push((conn_id, remote_instance));
                self.outbox.push_back(OutEvent::CheckPeer {
                    endpoint: remote_endpoint,
                });
            }
        }
    }

    fn on_peer_check(&mut self, endpoint: Endpoint, peer: Option<PeerInfo>, now: Instant) {
        let pending = self.pending_accepts.remove(&endpoint).unwrap_or_default();
        match peer {
            Some(peer) => {
                self.known_peers.insert(endpoint, peer.clone());
                for (conn_id, remote_instance) in pending {
                    self.try_accept(conn_id, &peer, remote_instance, now);
                }
            }
            None => {
                // the peer source no longer recognizes this endpoint
                for (conn_id, _) in pending {
                    self.outbox
                        .push_back(OutEvent::ReleaseConnection { conn_id });
                }
                self.release_all_for_endpoint(&endpoint);
                self.known_peers.shift_remove(&endpoint);
            }
        }
    }

    fn try_accept(
        &mut self,
        conn_id: ConnId,
        peer: &PeerInfo,
        remote_instance: Option<InstanceId>,
        now: Instant,
    ) {
        if !self.should_accept_connection(peer)
            || !self.instance_pin_ok(&peer.endpoint, remote_instance.as_ref())
        {
            debug!(endpoint = %self.local.endpoint, remote = %peer.endpoint, %conn_id, "refusing incoming connection");
            self.outbox
                .push_back(OutEvent::ReleaseConnection { conn_id });
            return;
        }
        self.pin_instance(&peer.endpoint, remote_instance);
        self.track_connection(
            conn_id.clone(),
            Connection {
                endpoint: peer.endpoint.clone(),
                identity_hash: peer.identity_hash,
                state: ConnectionState::ReceivingConnection,
                timestamp: now,
                local_auth: false,
                remote_auth: false,
            },
        );
        self.stats.connections_accepted += 1;
        self.outbox.push_back(OutEvent::AcceptConnection { conn_id });
    }

    fn on_established(
        &mut self,
        conn_id: ConnId,
        remote_instance: Option<InstanceId>,
        now: Instant,
    ) {
        let Some(conn) = self.connections.get(&conn_id).cloned() else {
            return;
        };
        if !self.instance_pin_ok(&conn.endpoint, remote_instance.as_ref()) {
            debug!(endpoint = %self.local.endpoint, %conn_id, "instance pin mismatch");
            self.teardown(&conn_id);
            return;
        }
        self.pin_instance(&conn.endpoint, remote_instance);
        match conn.state {
            ConnectionState::Connecting => {
                self.update_connection(&conn_id, ConnectionState::OfferSent, now);
                self.outbox.push_back(OutEvent::SendMessage {
                    conn_id,
                    message: Message::PeeringOffer {
                        peer_group_id: self.group_id,
                        local_identity_hash: self.local.identity_hash,
                    },
                });
            }
            ConnectionState::ReceivingConnection => {
                self.update_connection(&conn_id, ConnectionState::WaitingForOffer, now);
            }
            _ => {}
        }
    }

    // ---- offer negotiation ----

    fn on_message(&mut self, conn_id: ConnId, message: Message, now: Instant) {
        match message {
            Message::PeeringOffer {
                peer_group_id,
                local_identity_hash: remote_identity,
            } => self.on_offer(conn_id, peer_group_id, remote_identity, now),
            Message::PeeringOfferReply {
                peer_group_id,
                local_identity_hash: remote_identity,
                accepted,
            } => self.on_offer_reply(conn_id, peer_group_id, remote_identity, accepted, now),
            // control and application messages are only valid on the secure
            // channel
            _ => {}
        }
    }

    fn on_offer(
        &mut self,
        conn_id: ConnId,
        peer_group_id: PeerGroupId,
        remote_identity: Hash,
        now: Instant,
    ) {
        let group_matches = peer_group_id == self.group_id;
        let valid = group_matches
            && self.connections.get(&conn_id).is_some_and(|conn| {
                matches!(
                    conn.state,
                    ConnectionState::WaitingForOffer | ConnectionState::OfferSent
                ) && conn.identity_hash == remote_identity
            });
        if valid {
            self.update_connection(&conn_id, ConnectionState::OfferAccepted, now);
            self.outbox.push_back(OutEvent::SendMessage {
                conn_id: conn_id.clone(),
                message: Message::PeeringOfferReply {
                    peer_group_id: self.group_id,
                    local_identity_hash: self.local.identity_hash,
                    accepted: true,
                },
            });
            self.request_secure_channel(&conn_id);
        } else {
            if group_matches {
                self.outbox.push_back(OutEvent::SendMessage {
                    conn_id: conn_id.clone(),
                    message: Message::PeeringOfferReply {
                        peer_group_id: self.group_id,
                        local_identity_hash: self.local.identity_hash,
                        accepted: false,
                    },
                });
            }
            self.teardown(&conn_id);
        }
    }

    fn on_offer_reply(
        &mut self,
        conn_id: ConnId,
        peer_group_id: PeerGroupId,
        remote_identity: Hash,
        accepted: bool,
        now: Instant,
    ) {
        let valid = accepted
            && peer_group_id == self.group_id
            && self.connections.get(&conn_id).is_some_and(|conn| {
                conn.state == ConnectionState::OfferSent && conn.identity_hash == remote_identity
            });
        if valid {
            self.update_connection(&conn_id, ConnectionState::OfferAccepted, now);
            self.request_secure_channel(&conn_id);
        } else {
            self.teardown(&conn_id);
        }
    }

    fn request_secure_channel(&mut self, conn_id: &ConnId) {
        let Some(conn) = self.connections.get(conn_id) else {
            return;
        };
        self.outbox.push_back(OutEvent::SecureListen {
            conn_id: conn_id.clone(),
            identity_hash: self.local.identity_hash,
        });
        self.outbox.push_back(OutEvent::SecureExpect {
            conn_id: conn_id.clone(),
            identity_hash: conn.identity_hash,
        });
    }

    fn on_identity_authenticated(&mut self, conn_id: ConnId, identity_hash: Hash, now: Instant) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        if conn.state != ConnectionState::OfferAccepted {
            return;
        }
        if identity_hash == self.local.identity_hash {
            conn.local_auth = true;
        }
        if identity_hash == conn.identity_hash {
            conn.remote_auth = true;
        }
        if conn.local_auth && conn.remote_auth {
            let endpoint = conn.endpoint.clone();
            let was_reachable = self.has_ready_connection(&endpoint);
            self.update_connection(&conn_id, ConnectionState::Ready, now);
            debug!(endpoint = %self.local.endpoint, remote = %endpoint, %conn_id, "peer ready");
            if !was_reachable {
                if let Some(peer) = self.peer_info_for(&endpoint) {
                    self.outbox
                        .push_back(OutEvent::EmitEvent(Event::NewPeer { peer }));
                }
            }
        }
    }

    // ---- secure messages ----

    fn on_secure_message(
        &mut self,
        conn_id: ConnId,
        sender: Hash,
        recipient: Hash,
        message: Message,
        _now: Instant,
    ) {
        let (endpoint, conn_identity, conn_state) = match self.connections.get(&conn_id) {
            Some(conn) => (conn.endpoint.clone(), conn.identity_hash, conn.state),
            None => return,
        };
        if recipient != self.local.identity_hash || sender != conn_identity {
            return;
        }
        match message {
            Message::ChooseConnection { peer_group_id } if peer_group_id == self.group_id => {
                self.on_choose_connection(conn_id);
            }
            Message::ConfirmChosenConnection { peer_group_id }
                if peer_group_id == self.group_id =>
            {
                self.chosen.insert(endpoint.clone(), conn_id.clone());
                self.release_losers(&endpoint, &conn_id);
            }
            Message::PeerMessage {
                peer_group_id,
                agent_id,
                content,
            } if peer_group_id == self.group_id => {
                if conn_state == ConnectionState::Ready {
                    if let Some(peer) = self.peer_info_for(&endpoint) {
                        self.outbox.push_back(OutEvent::EmitEvent(Event::PeerMessage {
                            peer,
                            agent_id,
                            content,
                        }));
                    }
                }
            }
            _ => {}
        }
    }

    /// Converge on one connection per endpoint: keep our prior choice if it
    /// still works, otherwise the lexicographically smallest candidate, and
    /// confirm it to the proposing side.
    fn on_choose_connection(&mut self, proposed: ConnId) {
        let Some(conn) = self.connections.get(&proposed) else {
            return;
        };
        let endpoint = conn.endpoint.clone();
        let winner = match self.chosen.get(&endpoint) {
            Some(prior)
                if self
                    .connections
                    .get(prior)
                    .is_some_and(|c| c.state == ConnectionState::Ready) =>
            {
                prior.clone()
            }
            _ => {
                let mut winner = proposed.clone();
                if let Some(smallest) = self.smallest_ready_conn(&endpoint) {
                    winner = winner.min(smallest);
                }
                winner
            }
        };
        self.chosen.insert(endpoint.clone(), winner.clone());
        self.release_losers(&endpoint, &winner);
        self.secure_control(
            &winner,
            Message::ConfirmChosenConnection {
                peer_group_id: self.group_id,
            },
        );
    }

    fn release_losers(&mut self, endpoint: &Endpoint, winner: &ConnId) {
        let losers: Vec<ConnId> = self
            .per_endpoint
            .get(endpoint)
            .map(|conns| conns.iter().filter(|c| *c != winner).cloned().collect())
            .unwrap_or_default();
        for conn_id in losers {
            debug!(endpoint = %self.local.endpoint, remote = %endpoint, %conn_id, "releasing duplicate connection");
            self.teardown(&conn_id);
        }
    }

    fn secure_control(&mut self, conn_id: &ConnId, message: Message) {
        let Some(conn) = self.connections.get(conn_id) else {
            return;
        };
        self.outbox.push_back(OutEvent::SecureSend {
            conn_id: conn_id.clone(),
            sender: self.local.identity_hash,
            recipient: conn.identity_hash,
            message,
        });
    }

    // ---- connection bookkeeping ----

    fn on_closed(&mut self, conn_id: ConnId) {
        self.remove_connection(&conn_id, true);
    }

    /// Release a connection on the transport and drop our record of it.
    fn teardown(&mut self, conn_id: &ConnId) {
        self.outbox.push_back(OutEvent::ReleaseConnection {
            conn_id: conn_id.clone(),
        });
        self.remove_connection(conn_id, true);
    }

    fn track_connection(&mut self, conn_id: ConnId, conn: Connection) {
        self.per_endpoint
            .entry(conn.endpoint.clone())
            .or_default()
            .push(conn_id.clone());
        self.connections.insert(conn_id, conn);
    }

    fn update_connection(&mut self, conn_id: &ConnId, state: ConnectionState, now: Instant) {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.state = state;
            conn.timestamp = now;
        }
    }

    fn remove_connection(&mut self, conn_id: &ConnId, emit_lost: bool) {
        let Some(conn) = self.connections.remove(conn_id) else {
            return;
        };
        let endpoint = conn.endpoint.clone();
        if let Some(conns) = self.per_endpoint.get_mut(&endpoint) {
            conns.retain(|c| c != conn_id);
            if conns.is_empty() {
                self.per_endpoint.remove(&endpoint);
            }
        }
        if self.chosen.get(&endpoint) == Some(conn_id) {
            self.chosen.remove(&endpoint);
        }
        if conn.state == ConnectionState::Ready
            && emit_lost
            && !self.has_ready_connection(&endpoint)
        {
            debug!(endpoint = %self.local.endpoint, remote = %endpoint, "lost peer");
            if let Some(peer) = self.peer_info_for(&endpoint) {
                self.outbox
                    .push_back(OutEvent::EmitEvent(Event::LostPeer { peer }));
            }
        }
    }

    fn release_all_for_endpoint(&mut self, endpoint: &Endpoint) {
        let conns: Vec<ConnId> = self
            .per_endpoint
            .get(endpoint)
            .cloned()
            .unwrap_or_default();
        for conn_id in conns {
            self.teardown(&conn_id);
        }
    }

    fn instance_pin_ok(&self, endpoint: &Endpoint, instance: Option<&InstanceId>) -> bool {
        // an unreported instance matches anything
        match (self.instance_per_endpoint.get(endpoint), instance) {
            (Some(pinned), Some(instance)) => pinned == instance,
            _ => true,
        }
    }

    fn pin_instance(&mut self, endpoint: &Endpoint, instance: Option<InstanceId>) {
        if let Some(instance) = instance {
            self.instance_per_endpoint
                .entry(endpoint.clone())
                .or_insert(instance);
        }
    }

    fn has_ready_connection(&self, endpoint: &Endpoint) -> bool {
        self.per_endpoint
            .get(endpoint)
            .map_or(false, |conns| {
                conns.iter().any(|conn_id| {
                    self.connections
                        .get(conn_id)
                        .is_some_and(|c| c.state == ConnectionState::Ready)
                })
            })
    }

    /// The connection used for sending to an endpoint: the chosen one when
    /// it is ready, else the smallest ready one.
    pub fn ready_connection(&self, endpoint: &Endpoint) -> Option<ConnId> {
        if let Some(chosen) = self.chosen.get(endpoint) {
            if self
                .connections
                .get(chosen)
                .is_some_and(|c| c.state == ConnectionState::Ready)
            {
                return Some(chosen.clone());
            }
        }
        self.smallest_ready_conn(endpoint)
    }

    fn smallest_ready_conn(&self, endpoint: &Endpoint) -> Option<ConnId> {
        self.per_endpoint
            .get(endpoint)?
            .iter()
            .filter(|conn_id| {
                self.connections
                    .get(*conn_id)
                    .is_some_and(|c| c.state == ConnectionState::Ready)
            })
            .min()
            .cloned()
    }

    fn ready_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .per_endpoint
            .keys()
            .filter(|endpoint| self.has_ready_connection(endpoint))
            .cloned()
            .collect();
        endpoints.sort();
        endpoints
    }

    fn peer_info_for(&self, endpoint: &Endpoint) -> Option<PeerInfo> {
        if let Some(peer) = self.known_peers.get(endpoint) {
            return Some(peer.clone());
        }
        self.per_endpoint.get(endpoint).and_then(|conns| {
            conns.first().and_then(|conn_id| {
                self.connections
                    .get(conn_id)
                    .map(|c| PeerInfo::new(endpoint.clone(), c.identity_hash))
            })
        })
    }
}
