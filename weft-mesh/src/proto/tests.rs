//! Simulation framework for testing the protocol implementation
//!
//! Agents run against an in-memory transport, secure channel and peer
//! directory. Events are delivered with a fixed latency and timers are
//! checked on every simulated tick, so whole peering lifecycles run in
//! microseconds and deterministically.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;
use weft_base::Hash;

use super::group::{
    Config, ConnectionState, Event, InEvent, Message, OutEvent, PeerGroupState, Timer,
};
use super::{ConnId, Endpoint, PeerGroupId, PeerInfo};

const SIM_TICK: Duration = Duration::from_millis(100);
const LATENCY: Duration = Duration::from_millis(150);

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

fn test_config() -> Config {
    Config {
        min_peers: 3,
        max_peers: 12,
        peer_connection_timeout: Duration::from_secs(5),
        peer_connection_attempt_interval: Duration::from_secs(3),
        peer_discovery_attempt_interval: Duration::from_secs(3),
        tick_interval: Duration::from_secs(1),
    }
}

fn endpoint(i: usize) -> Endpoint {
    format!("peer-{i}")
}

fn identity_hash(endpoint: &str) -> Hash {
    Hash::new(endpoint.as_bytes())
}

#[derive(Debug)]
struct SimConn {
    initiator: Endpoint,
    acceptor: Endpoint,
    released: bool,
    established: bool,
    /// (secure listen requested, secure expect requested) per side.
    secure_setup: HashMap<Endpoint, (bool, bool)>,
    authenticated: bool,
}

impl SimConn {
    fn other_side(&self, me: &Endpoint) -> Endpoint {
        if *me == self.initiator {
            self.acceptor.clone()
        } else {
            self.initiator.clone()
        }
    }
}

struct Simulator {
    time: Instant,
    agents: Vec<PeerGroupState>,
    by_endpoint: HashMap<Endpoint, usize>,
    alive: Vec<bool>,
    inqueues: Vec<VecDeque<InEvent>>,
    pending: BTreeMap<Instant, Vec<(usize, InEvent)>>,
    conns: HashMap<ConnId, SimConn>,
    events: Vec<(Endpoint, Event)>,
}

impl Simulator {
    fn new(count: usize, config: Config) -> Self {
        setup_logging();
        let group = PeerGroupId::from_name("simulated-group");
        let time = Instant::now();
        let mut sim = Simulator {
            time,
            agents: Vec::new(),
            by_endpoint: HashMap::new(),
            alive: Vec::new(),
            inqueues: Vec::new(),
            pending: BTreeMap::new(),
            conns: HashMap::new(),
            events: Vec::new(),
        };
        for i in 0..count {
            let endpoint = endpoint(i);
            let local = PeerInfo::new(endpoint.clone(), identity_hash(&endpoint));
            let instance = format!("{endpoint}/instance-0");
            let mut agent = PeerGroupState::with_rng(
                group,
                local,
                instance,
                config.clone(),
                StdRng::seed_from_u64(i as u64),
            );
            let outs: Vec<OutEvent> = agent.start(time).collect();
            sim.by_endpoint.insert(endpoint, i);
            sim.agents.push(agent);
            sim.alive.push(true);
            sim.inqueues.push(VecDeque::new());
            for out in outs {
                sim.process_out(i, out);
            }
        }
        sim
    }

    fn directory(&self, asking: usize) -> Vec<PeerInfo> {
        self.agents
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != asking && self.alive[*i])
            .map(|(_, agent)| agent.local_peer().clone())
            .collect()
    }

    fn schedule(&mut self, idx: usize, delay: Duration, event: InEvent) {
        self.pending
            .entry(self.time + delay)
            .or_default()
            .push((idx, event));
    }

    fn kill(&mut self, endpoint: &str) {
        let idx = self.by_endpoint[endpoint];
        self.alive[idx] = false;
        self.inqueues[idx].clear();
    }

    fn run_for(&mut self, duration: Duration) {
        let steps = (duration.as_millis() / SIM_TICK.as_millis()).max(1) as usize;
        for _ in 0..steps {
            self.step();
        }
    }

    fn step(&mut self) {
        self.time += SIM_TICK;
        // deliver everything that is due
        let due: Vec<Instant> = self
            .pending
            .keys()
            .copied()
            .take_while(|t| *t <= self.time)
            .collect();
        for t in due {
            for (idx, event) in self.pending.remove(&t).unwrap_or_default() {
                if self.alive[idx] {
                    self.inqueues[idx].push_back(event);
                }
            }
        }
        // let every agent process its queue
        for idx in 0..self.agents.len() {
            while let Some(event) = self.inqueues[idx].pop_front() {
                let outs: Vec<OutEvent> = self.agents[idx].handle(event, self.time).collect();
                for out in outs {
                    self.process_out(idx, out);
                }
            }
        }
    }

    fn process_out(&mut self, idx: usize, out: OutEvent) {
        let me = self.agents[idx].local_peer().endpoint.clone();
        debug!(peer = %me, ?out, "sim out");
        match out {
            OutEvent::Connect {
                conn_id,
                local,
                remote,
            } => {
                let Some(&remote_idx) = self.by_endpoint.get(&remote) else {
                    return;
                };
                if !self.alive[remote_idx] {
                    return;
                }
                self.conns.insert(
                    conn_id.clone(),
                    SimConn {
                        initiator: local.clone(),
                        acceptor: remote.clone(),
                        released: false,
                        established: false,
                        secure_setup: HashMap::new(),
                        authenticated: false,
                    },
                );
                let instance = format!("{local}/instance-0");
                self.schedule(
                    remote_idx,
                    LATENCY,
                    InEvent::IncomingConnection {
                        conn_id,
                        remote_endpoint: local,
                        remote_instance: Some(instance),
                    },
                );
            }
            OutEvent::AcceptConnection { conn_id } => {
                let Some(conn) = self.conns.get_mut(&conn_id) else {
                    return;
                };
                conn.established = true;
                let initiator = conn.initiator.clone();
                let acceptor = conn.acceptor.clone();
                for (side, other) in [(initiator.clone(), acceptor.clone()), (acceptor, initiator)]
                {
                    if let Some(&side_idx) = self.by_endpoint.get(&side) {
                        self.schedule(
                            side_idx,
                            LATENCY,
                            InEvent::ConnectionEstablished {
                                conn_id: conn_id.clone(),
                                remote_instance: Some(format!("{other}/instance-0")),
                            },
                        );
                    }
                }
            }
            OutEvent::ReleaseConnection { conn_id } => {
                let Some(conn) = self.conns.get_mut(&conn_id) else {
                    return;
                };
                if conn.released {
                    return;
                }
                conn.released = true;
                let other = conn.other_side(&me);
                if let Some(&other_idx) = self.by_endpoint.get(&other) {
                    self.schedule(other_idx, LATENCY, InEvent::ConnectionClosed { conn_id });
                }
            }
            OutEvent::CheckConnection { conn_id } => {
                let dead = match self.conns.get(&conn_id) {
                    Some(conn) => {
                        let other = conn.other_side(&me);
                        conn.released
                            || self
                                .by_endpoint
                                .get(&other)
                                .map_or(true, |other_idx| !self.alive[*other_idx])
                    }
                    None => true,
                };
                if dead {
                    self.schedule(idx, LATENCY, InEvent::ConnectionClosed { conn_id });
                }
            }
            OutEvent::SendMessage { conn_id, message } => {
                self.deliver(&me, conn_id, |conn_id| InEvent::MessageReceived {
                    conn_id,
                    message,
                });
            }
            OutEvent::SecureSend {
                conn_id,
                sender,
                recipient,
                message,
            } => {
                self.deliver(&me, conn_id, |conn_id| InEvent::SecureMessageReceived {
                    conn_id,
                    sender,
                    recipient,
                    message,
                });
            }
            OutEvent::SecureListen { conn_id, .. } => {
                self.secure_setup(&me, conn_id, true, false);
            }
            OutEvent::SecureExpect { conn_id, .. } => {
                self.secure_setup(&me, conn_id, false, true);
            }
            OutEvent::QueryPeers { count } => {
                let mut peers = self.directory(idx);
                peers.truncate(count);
                self.schedule(idx, LATENCY, InEvent::PeersDiscovered { peers });
            }
            OutEvent::CheckPeer { endpoint } => {
                let peer = self
                    .by_endpoint
                    .get(&endpoint)
                    .filter(|other_idx| self.alive[**other_idx])
                    .map(|other_idx| self.agents[*other_idx].local_peer().clone());
                self.schedule(idx, LATENCY, InEvent::PeerCheckResult { endpoint, peer });
            }
            OutEvent::QueryOnlineStatus { endpoints } => {
                for endpoint in endpoints {
                    let online = self
                        .by_endpoint
                        .get(&endpoint)
                        .is_some_and(|other_idx| self.alive[*other_idx]);
                    if online {
                        self.schedule(idx, LATENCY, InEvent::RemoteAddressListening { endpoint });
                    }
                }
            }
            OutEvent::ScheduleTimer { delay, timer } => {
                self.schedule(idx, delay, InEvent::TimerExpired(timer));
            }
            OutEvent::EmitEvent(event) => {
                self.events.push((me, event));
            }
        }
    }

    fn deliver(
        &mut self,
        me: &Endpoint,
        conn_id: ConnId,
        build: impl FnOnce(ConnId) -> InEvent,
    ) {
        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        if conn.released || !conn.established {
            return;
        }
        let other = conn.other_side(me);
        if let Some(&other_idx) = self.by_endpoint.get(&other) {
            if self.alive[other_idx] {
                self.schedule(other_idx, LATENCY, build(conn_id));
            }
        }
    }

    fn secure_setup(&mut self, me: &Endpoint, conn_id: ConnId, listen: bool, expect: bool) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        let entry = conn.secure_setup.entry(me.clone()).or_insert((false, false));
        entry.0 |= listen;
        entry.1 |= expect;
        let both_sides_ready = [&conn.initiator, &conn.acceptor].iter().all(|side| {
            conn.secure_setup
                .get(*side)
                .is_some_and(|(listen, expect)| *listen && *expect)
        });
        if both_sides_ready && !conn.authenticated {
            conn.authenticated = true;
            let initiator = conn.initiator.clone();
            let acceptor = conn.acceptor.clone();
            for side in [initiator.clone(), acceptor.clone()] {
                let Some(&side_idx) = self.by_endpoint.get(&side) else {
                    continue;
                };
                for identity_of in [&initiator, &acceptor] {
                    self.schedule(
                        side_idx,
                        LATENCY,
                        InEvent::IdentityAuthenticated {
                            conn_id: conn_id.clone(),
                            identity_hash: identity_hash(identity_of),
                        },
                    );
                }
            }
        }
    }

    fn peers_of(&self, idx: usize) -> Vec<Endpoint> {
        self.agents[idx]
            .get_peers()
            .into_iter()
            .map(|p| p.endpoint)
            .collect()
    }

    fn ready_conns_of(&self, idx: usize) -> Vec<ConnId> {
        self.agents[idx]
            .get_state()
            .into_iter()
            .filter(|summary| summary.state == ConnectionState::Ready)
            .map(|summary| summary.conn_id)
            .collect()
    }

    fn lost_peers_seen_by(&self, endpoint: &str) -> Vec<Endpoint> {
        self.events
            .iter()
            .filter(|(at, _)| at.as_str() == endpoint)
            .filter_map(|(_, event)| match event {
                Event::LostPeer { peer } => Some(peer.endpoint.clone()),
                _ => None,
            })
            .collect()
    }

    fn send(&mut self, idx: usize, endpoint: &str, agent_id: &str, content: &[u8]) -> bool {
        let ok = self.agents[idx].send_to_peer(
            &endpoint.to_string(),
            agent_id,
            Bytes::copy_from_slice(content),
        );
        let outs: Vec<OutEvent> = self.agents[idx].drain().collect();
        for out in outs {
            self.process_out(idx, out);
        }
        ok
    }
}

#[test]
fn two_agents_find_each_other_and_detect_loss() {
    let config = test_config();
    let mut sim = Simulator::new(2, config.clone());

    // within a few tick cycles, each side sees the other exactly once
    sim.run_for(config.tick_interval * 3);
    assert_eq!(sim.peers_of(0), vec![endpoint(1)]);
    assert_eq!(sim.peers_of(1), vec![endpoint(0)]);

    sim.kill("peer-1");
    sim.run_for(config.peer_connection_timeout);
    assert_eq!(sim.lost_peers_seen_by("peer-0"), vec![endpoint(1)]);
    assert!(sim.peers_of(0).is_empty());
}

#[test]
fn simultaneous_connections_converge_on_the_smallest() {
    let config = test_config();
    let mut sim = Simulator::new(2, config.clone());

    // the setup is symmetric, so both sides dial each other simultaneously
    sim.run_for(config.tick_interval * 5);

    let ready0 = sim.ready_conns_of(0);
    let ready1 = sim.ready_conns_of(1);
    assert_eq!(ready0.len(), 1, "one ready connection at peer-0");
    assert_eq!(ready1, ready0, "both sides keep the same connection");

    // the survivor is the lexicographically smallest established one
    let smallest = sim
        .conns
        .iter()
        .filter(|(_, conn)| conn.established)
        .map(|(conn_id, _)| conn_id.clone())
        .min()
        .unwrap();
    assert_eq!(ready0[0], smallest);

    // and both sides saw each other exactly once
    assert_eq!(sim.peers_of(0), vec![endpoint(1)]);
    assert_eq!(sim.peers_of(1), vec![endpoint(0)]);
}

#[test]
fn mesh_respects_min_and_max_bounds() {
    let config = Config {
        min_peers: 2,
        max_peers: 3,
        ..test_config()
    };
    let count = 5;
    let mut sim = Simulator::new(count, config.clone());
    sim.run_for(Duration::from_secs(12));

    for idx in 0..count {
        let peers = sim.peers_of(idx);
        assert!(
            peers.len() <= config.max_peers,
            "peer-{idx} exceeded max: {peers:?}"
        );
        assert!(
            peers.len() >= config.min_peers.min(count - 1),
            "peer-{idx} below min: {peers:?}"
        );
    }
}

#[test]
fn peer_messages_reach_ready_peers() {
    let config = test_config();
    let mut sim = Simulator::new(2, config.clone());
    sim.run_for(config.tick_interval * 3);

    assert!(sim.send(0, "peer-1", "replication", b"state please"));
    sim.run_for(SIM_TICK * 5);

    let received: Vec<(String, Bytes)> = sim
        .events
        .iter()
        .filter(|(at, _)| at.as_str() == "peer-1")
        .filter_map(|(_, event)| match event {
            Event::PeerMessage {
                agent_id, content, ..
            } => Some((agent_id.clone(), content.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        received,
        vec![("replication".to_string(), Bytes::from_static(b"state please"))]
    );

    // sending to an endpoint with no ready connection reports failure
    assert!(!sim.send(0, "peer-9", "replication", b"nobody home"));
}

// direct state-machine tests for the offer validation and pinning rules

fn drive(
    state: &mut PeerGroupState,
    event: InEvent,
    now: Instant,
) -> Vec<OutEvent> {
    state.handle(event, now).collect()
}

fn known_remote(state: &mut PeerGroupState, remote: &PeerInfo, now: Instant) {
    let _ = drive(
        state,
        InEvent::PeersDiscovered {
            peers: vec![remote.clone()],
        },
        now,
    );
}

fn accepted_incoming(
    state: &mut PeerGroupState,
    conn_id: &ConnId,
    remote: &PeerInfo,
    now: Instant,
) {
    let outs = drive(
        state,
        InEvent::IncomingConnection {
            conn_id: conn_id.clone(),
            remote_endpoint: remote.endpoint.clone(),
            remote_instance: None,
        },
        now,
    );
    assert!(
        outs.iter()
            .any(|o| matches!(o, OutEvent::AcceptConnection { conn_id: c } if c == conn_id)),
        "incoming connection should be accepted, got {outs:?}"
    );
    let _ = drive(
        state,
        InEvent::ConnectionEstablished {
            conn_id: conn_id.clone(),
            remote_instance: None,
        },
        now,
    );
}

#[test]
fn offers_for_other_groups_or_identities_are_rejected() {
    setup_logging();
    let now = Instant::now();
    let group = PeerGroupId::from_name("group-a");
    let local = PeerInfo::new("local", identity_hash("local"));
    let remote = PeerInfo::new("remote", identity_hash("remote"));
    let mut state = PeerGroupState::new(group, local, "inst".to_string(), Config::default());
    let _ = state.start(now).count();
    known_remote(&mut state, &remote, now);

    // wrong group: no reply, connection torn down
    let conn = ConnId::from("conn/remote/local/0");
    accepted_incoming(&mut state, &conn, &remote, now);
    let outs = drive(
        &mut state,
        InEvent::MessageReceived {
            conn_id: conn.clone(),
            message: Message::PeeringOffer {
                peer_group_id: PeerGroupId::from_name("group-b"),
                local_identity_hash: remote.identity_hash,
            },
        },
        now,
    );
    assert!(outs
        .iter()
        .any(|o| matches!(o, OutEvent::ReleaseConnection { .. })));
    assert!(!outs
        .iter()
        .any(|o| matches!(o, OutEvent::SendMessage { .. })));

    // right group, wrong identity: rejection reply, then teardown
    let conn = ConnId::from("conn/remote/local/1");
    accepted_incoming(&mut state, &conn, &remote, now);
    let outs = drive(
        &mut state,
        InEvent::MessageReceived {
            conn_id: conn.clone(),
            message: Message::PeeringOffer {
                peer_group_id: group,
                local_identity_hash: identity_hash("impostor"),
            },
        },
        now,
    );
    let rejected = outs.iter().any(|o| {
        matches!(
            o,
            OutEvent::SendMessage {
                message: Message::PeeringOfferReply { accepted: false, .. },
                ..
            }
        )
    });
    assert!(rejected, "expected a rejection reply, got {outs:?}");
    assert!(outs
        .iter()
        .any(|o| matches!(o, OutEvent::ReleaseConnection { .. })));
}

#[test]
fn valid_offer_is_accepted_and_secured() {
    setup_logging();
    let now = Instant::now();
    let group = PeerGroupId::from_name("group-a");
    let local = PeerInfo::new("local", identity_hash("local"));
    let remote = PeerInfo::new("remote", identity_hash("remote"));
    let mut state = PeerGroupState::new(group, local.clone(), "inst".to_string(), Config::default());
    let _ = state.start(now).count();
    known_remote(&mut state, &remote, now);

    let conn = ConnId::from("conn/remote/local/0");
    accepted_incoming(&mut state, &conn, &remote, now);
    let outs = drive(
        &mut state,
        InEvent::MessageReceived {
            conn_id: conn.clone(),
            message: Message::PeeringOffer {
                peer_group_id: group,
                local_identity_hash: remote.identity_hash,
            },
        },
        now,
    );
    assert!(outs.iter().any(|o| matches!(
        o,
        OutEvent::SendMessage {
            message: Message::PeeringOfferReply { accepted: true, .. },
            ..
        }
    )));
    assert!(outs
        .iter()
        .any(|o| matches!(o, OutEvent::SecureListen { identity_hash, .. } if *identity_hash == local.identity_hash)));
    assert!(outs
        .iter()
        .any(|o| matches!(o, OutEvent::SecureExpect { identity_hash, .. } if *identity_hash == remote.identity_hash)));

    // authenticating both identities readies the peer
    let _ = drive(
        &mut state,
        InEvent::IdentityAuthenticated {
            conn_id: conn.clone(),
            identity_hash: local.identity_hash,
        },
        now,
    );
    let outs = drive(
        &mut state,
        InEvent::IdentityAuthenticated {
            conn_id: conn.clone(),
            identity_hash: remote.identity_hash,
        },
        now,
    );
    assert!(outs
        .iter()
        .any(|o| matches!(o, OutEvent::EmitEvent(Event::NewPeer { peer }) if peer.endpoint == "remote")));
    assert_eq!(state.get_peers().len(), 1);
}

#[test]
fn instance_pin_mismatch_refuses_the_connection() {
    setup_logging();
    let now = Instant::now();
    let group = PeerGroupId::from_name("group-a");
    let local = PeerInfo::new("local", identity_hash("local"));
    let remote = PeerInfo::new("remote", identity_hash("remote"));
    let mut state = PeerGroupState::new(group, local, "inst".to_string(), Config::default());
    let _ = state.start(now).count();
    known_remote(&mut state, &remote, now);

    // first connection pins the remote instance
    let conn = ConnId::from("conn/remote/local/0");
    let outs = drive(
        &mut state,
        InEvent::IncomingConnection {
            conn_id: conn.clone(),
            remote_endpoint: remote.endpoint.clone(),
            remote_instance: Some("tab-1".to_string()),
        },
        now,
    );
    assert!(outs
        .iter()
        .any(|o| matches!(o, OutEvent::AcceptConnection { .. })));

    // a different instance at the same endpoint is refused
    let conn2 = ConnId::from("conn/remote/local/1");
    let outs = drive(
        &mut state,
        InEvent::IncomingConnection {
            conn_id: conn2.clone(),
            remote_endpoint: remote.endpoint.clone(),
            remote_instance: Some("tab-2".to_string()),
        },
        now,
    );
    assert!(outs
        .iter()
        .any(|o| matches!(o, OutEvent::ReleaseConnection { conn_id: c } if *c == conn2)));
    assert!(!outs
        .iter()
        .any(|o| matches!(o, OutEvent::AcceptConnection { .. })));

    // an unreported instance matches the pin
    let conn3 = ConnId::from("conn/remote/local/2");
    let outs = drive(
        &mut state,
        InEvent::IncomingConnection {
            conn_id: conn3.clone(),
            remote_endpoint: remote.endpoint.clone(),
            remote_instance: None,
        },
        now,
    );
    assert!(outs
        .iter()
        .any(|o| matches!(o, OutEvent::AcceptConnection { conn_id: c } if *c == conn3)));
}

#[test]
fn non_ready_connections_time_out() {
    setup_logging();
    let now = Instant::now();
    let group = PeerGroupId::from_name("group-a");
    let local = PeerInfo::new("local", identity_hash("local"));
    let remote = PeerInfo::new("remote", identity_hash("remote"));
    let config = Config::default();
    let mut state = PeerGroupState::new(group, local, "inst".to_string(), config.clone());
    let _ = state.start(now).count();
    known_remote(&mut state, &remote, now);

    let conn = ConnId::from("conn/remote/local/0");
    accepted_incoming(&mut state, &conn, &remote, now);
    assert_eq!(state.get_state().len(), 1);

    // the offer never arrives; a tick past the timeout reaps the connection
    let later = now + config.peer_connection_timeout + Duration::from_secs(1);
    let outs = drive(&mut state, InEvent::TimerExpired(Timer::Tick), later);
    assert!(outs
        .iter()
        .any(|o| matches!(o, OutEvent::ReleaseConnection { conn_id: c } if *c == conn)));
    assert!(state.get_state().is_empty());
    assert_eq!(state.get_stats().timeouts, 1);
}
