//! Tokio driver for the peer-group state machine.
//!
//! The [`PeerGroupAgent`] owns a [`PeerGroupState`] on a single task and
//! translates between its events and the three collaborators: a
//! [`Transport`] (dialing, accepting, plain sends), a [`SecureChannel`]
//! (identity-authenticated sends) and a [`PeerSource`] (who belongs to the
//! group). Wire messages are postcard-encoded.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use weft_base::Hash;

use crate::proto::{
    Config, ConnId, ConnectionSummary, Endpoint, Event, InEvent, InstanceId, Message, OutEvent,
    PeerGroupId, PeerGroupState, PeerInfo, Stats, Timer,
};
use crate::stream::{BufferedStream, BufferingStreamSource};

/// Size of the event buffer handed to late-joining subscribers.
const EVENT_BUFFER_SIZE: usize = 64;

/// Transport collaborator: byte-duplex connections between endpoints.
///
/// Connection lifecycle notifications come back through the [`NetEvent`]
/// channel handed out by [`PeerGroupAgent::spawn`].
pub trait Transport: Send + Sync + 'static {
    /// Start listening at an endpoint.
    fn listen(&self, endpoint: &Endpoint, identity_hash: &Hash);
    /// Dial a remote endpoint under a caller-allocated connection id.
    fn connect(&self, conn_id: &ConnId, local: &Endpoint, remote: &Endpoint);
    /// Accept an incoming connection.
    fn accept(&self, conn_id: &ConnId);
    /// Release a connection.
    fn release(&self, conn_id: &ConnId);
    /// Whether a connection is currently alive.
    fn is_alive(&self, conn_id: &ConnId) -> bool;
    /// Whether everything queued on a connection has been flushed.
    fn send_buffer_empty(&self, conn_id: &ConnId) -> bool;
    /// Send bytes over a connection.
    fn send(&self, conn_id: &ConnId, payload: Bytes);
    /// Ask which of these endpoints are listening; answers arrive as
    /// [`NetEvent::RemoteAddressListening`].
    fn query_listening(&self, endpoints: &[Endpoint]);
}

/// Secure-channel collaborator: per-connection encryption bound to
/// identities.
pub trait SecureChannel: Send + Sync + 'static {
    /// Be ready to receive as the given identity on a connection.
    fn secure_for_receiving(&self, conn_id: &ConnId, identity_hash: &Hash);
    /// Be ready to send towards the given remote identity on a connection.
    fn secure_for_sending(&self, conn_id: &ConnId, identity_hash: &Hash);
    /// Send bytes addressed from one identity to another.
    fn send_securely(&self, conn_id: &ConnId, sender: &Hash, recipient: &Hash, payload: Bytes);
}

/// Peer-source collaborator: who belongs to the group.
pub trait PeerSource: Send + Sync + 'static {
    /// Up to `count` candidate peers.
    fn get_peers(&self, count: usize) -> Vec<PeerInfo>;
    /// The peer behind an endpoint, if it belongs to the group.
    fn get_peer_for_endpoint(&self, endpoint: &Endpoint) -> Option<PeerInfo>;
}

/// Network-side events the collaborators feed into the agent.
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// A dialed or accepted connection is up.
    ConnectionEstablished {
        /// The connection.
        conn_id: ConnId,
        /// Remote process instance, when reported.
        remote_instance: Option<InstanceId>,
    },
    /// A remote endpoint wants to connect.
    IncomingConnection {
        /// Connection id allocated by the initiator.
        conn_id: ConnId,
        /// The initiator's endpoint.
        remote_endpoint: Endpoint,
        /// Remote process instance, when reported.
        remote_instance: Option<InstanceId>,
    },
    /// A connection went away.
    ConnectionClosed {
        /// The connection.
        conn_id: ConnId,
    },
    /// Bytes arrived on the plain channel.
    MessageReceived {
        /// The connection.
        conn_id: ConnId,
        /// The raw payload.
        payload: Bytes,
    },
    /// Bytes arrived on the secure channel.
    SecureMessageReceived {
        /// The connection.
        conn_id: ConnId,
        /// Authenticated sender identity.
        sender: Hash,
        /// Recipient identity.
        recipient: Hash,
        /// The raw payload.
        payload: Bytes,
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
}

enum Command {
    SendToPeer {
        endpoint: Endpoint,
        agent_id: String,
        content: Bytes,
        reply: oneshot::Sender<bool>,
    },
    SendToAllPeers {
        agent_id: String,
        content: Bytes,
        reply: oneshot::Sender<usize>,
    },
    GetPeers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    GetStats {
        reply: oneshot::Sender<Stats>,
    },
    GetState {
        reply: oneshot::Sender<Vec<ConnectionSummary>>,
    },
    SendBufferEmpty {
        endpoint: Endpoint,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Handle to a running peer-group agent.
#[derive(Clone)]
pub struct PeerGroupAgent {
    commands: mpsc::Sender<Command>,
    events: BufferingStreamSource<Event>,
}

impl std::fmt::Debug for PeerGroupAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerGroupAgent")
    }
}

impl PeerGroupAgent {
    /// Spawn the agent task. Returns the handle plus the sender the
    /// collaborators use to feed network events in.
    pub fn spawn(
        group_id: PeerGroupId,
        local: PeerInfo,
        local_instance: InstanceId,
        config: Config,
        transport: Arc<dyn Transport>,
        secure: Arc<dyn SecureChannel>,
        peer_source: Arc<dyn PeerSource>,
    ) -> (Self, mpsc::Sender<NetEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (net_tx, net_rx) = mpsc::channel(256);
        let events = BufferingStreamSource::new(EVENT_BUFFER_SIZE);

        transport.listen(&local.endpoint, &local.identity_hash);
        let actor = Actor {
            state: PeerGroupState::new(group_id, local, local_instance, config),
            transport,
            secure,
            peer_source,
            commands: command_rx,
            net_events: net_rx,
            timers: Timers::new(),
            events: events.clone(),
        };
        tokio::spawn(actor.run());
        (
            PeerGroupAgent {
                commands: command_tx,
                events,
            },
            net_tx,
        )
    }

    /// Subscribe to peer events; late subscribers see recent history.
    pub fn events(&self) -> BufferedStream<Event> {
        self.events.subscribe()
    }

    /// Send a payload to an agent at a ready peer.
    pub async fn send_to_peer(
        &self,
        endpoint: &Endpoint,
        agent_id: &str,
        content: Bytes,
    ) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendToPeer {
            endpoint: endpoint.clone(),
            agent_id: agent_id.to_string(),
            content,
            reply,
        })
        .await?;
        Ok(rx.await?)
    }

    /// Send a payload to every ready peer; returns how many were reached.
    pub async fn send_to_all_peers(&self, agent_id: &str, content: Bytes) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendToAllPeers {
            agent_id: agent_id.to_string(),
            content,
            reply,
        })
        .await?;
        Ok(rx.await?)
    }

    /// The current ready peers.
    pub async fn get_peers(&self) -> Result<Vec<PeerInfo>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::GetPeers { reply }).await?;
        Ok(rx.await?)
    }

    /// Cumulative counters.
    pub async fn get_stats(&self) -> Result<Stats> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::GetStats { reply }).await?;
        Ok(rx.await?)
    }

    /// Connection snapshot.
    pub async fn get_state(&self) -> Result<Vec<ConnectionSummary>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::GetState { reply }).await?;
        Ok(rx.await?)
    }

    /// Whether everything queued towards a peer has been flushed.
    pub async fn peer_send_buffer_is_empty(&self, endpoint: &Endpoint) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendBufferEmpty {
            endpoint: endpoint.clone(),
            reply,
        })
        .await?;
        Ok(rx.await?)
    }

    /// Stop the agent, releasing every connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown).await
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("peer group agent is gone"))
    }
}

struct Actor {
    state: PeerGroupState,
    transport: Arc<dyn Transport>,
    secure: Arc<dyn SecureChannel>,
    peer_source: Arc<dyn PeerSource>,
    commands: mpsc::Receiver<Command>,
    net_events: mpsc::Receiver<NetEvent>,
    timers: Timers<Timer>,
    events: BufferingStreamSource<Event>,
}

impl Actor {
    async fn run(mut self) {
        let outs: Vec<OutEvent> = self.state.start(Instant::now()).collect();
        self.execute(outs);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => break,
                        Some(command) => self.on_command(command),
                    }
                }
                event = self.net_events.recv() => {
                    match event {
                        None => break,
                        Some(event) => self.on_net_event(event),
                    }
                }
                due = self.timers.wait_and_drain() => {
                    for timer in due {
                        self.apply(InEvent::TimerExpired(timer));
                    }
                }
            }
        }
        let outs: Vec<OutEvent> = self.state.shutdown().collect();
        self.execute(outs);
        self.events.end();
        debug!("peer group agent stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SendToPeer {
                endpoint,
                agent_id,
                content,
                reply,
            } => {
                let sent = self.state.send_to_peer(&endpoint, &agent_id, content);
                let outs: Vec<OutEvent> = self.state.drain().collect();
                self.execute(outs);
                reply.send(sent).ok();
            }
            Command::SendToAllPeers {
                agent_id,
                content,
                reply,
            } => {
                let sent = self.state.send_to_all_peers(&agent_id, content);
                let outs: Vec<OutEvent> = self.state.drain().collect();
                self.execute(outs);
                reply.send(sent).ok();
            }
            Command::GetPeers { reply } => {
                reply.send(self.state.get_peers()).ok();
            }
            Command::GetStats { reply } => {
                reply.send(self.state.get_stats().clone()).ok();
            }
            Command::GetState { reply } => {
                reply.send(self.state.get_state()).ok();
            }
            Command::SendBufferEmpty { endpoint, reply } => {
                let empty = self
                    .state
                    .ready_connection(&endpoint)
                    .map_or(true, |conn_id| self.transport.send_buffer_empty(&conn_id));
                reply.send(empty).ok();
            }
            Command::Shutdown => unreachable!("handled in the select loop"),
        }
    }

    fn on_net_event(&mut self, event: NetEvent) {
        let in_event = match event {
            NetEvent::ConnectionEstablished {
                conn_id,
                remote_instance,
            } => InEvent::ConnectionEstablished {
                conn_id,
                remote_instance,
            },
            NetEvent::IncomingConnection {
                conn_id,
                remote_endpoint,
                remote_instance,
            } => InEvent::IncomingConnection {
                conn_id,
                remote_endpoint,
                remote_instance,
            },
            NetEvent::ConnectionClosed { conn_id } => InEvent::ConnectionClosed { conn_id },
            NetEvent::MessageReceived { conn_id, payload } => match decode(&payload) {
                Some(message) => InEvent::MessageReceived { conn_id, message },
                None => return,
            },
            NetEvent::SecureMessageReceived {
                conn_id,
                sender,
                recipient,
                payload,
            } => match decode(&payload) {
                Some(message) => InEvent::SecureMessageReceived {
                    conn_id,
                    sender,
                    recipient,
                    message,
                },
                None => return,
            },
            NetEvent::IdentityAuthenticated {
                conn_id,
                identity_hash,
            } => InEvent::IdentityAuthenticated {
                conn_id,
                identity_hash,
            },
            NetEvent::RemoteAddressListening { endpoint } => {
                InEvent::RemoteAddressListening { endpoint }
            }
        };
        self.apply(in_event);
    }

    fn apply(&mut self, event: InEvent) {
        let outs: Vec<OutEvent> = self.state.handle(event, Instant::now()).collect();
        self.execute(outs);
    }

    /// Execute effects; answers the machine needs synchronously (liveness
    /// checks, peer source queries) are fed back in until quiescent.
    fn execute(&mut self, outs: Vec<OutEvent>) {
        let mut feedback: VecDeque<InEvent> = VecDeque::new();
        self.execute_once(outs, &mut feedback);
        while let Some(event) = feedback.pop_front() {
            let outs: Vec<OutEvent> = self.state.handle(event, Instant::now()).collect();
            self.execute_once(outs, &mut feedback);
        }
    }

    fn execute_once(&mut self, outs: Vec<OutEvent>, feedback: &mut VecDeque<InEvent>) {
        for out in outs {
            trace!(?out, "executing");
            match out {
                OutEvent::Connect {
                    conn_id,
                    local,
                    remote,
                } => self.transport.connect(&conn_id, &local, &remote),
                OutEvent::AcceptConnection { conn_id } => self.transport.accept(&conn_id),
                OutEvent::ReleaseConnection { conn_id } => self.transport.release(&conn_id),
                OutEvent::CheckConnection { conn_id } => {
                    if !self.transport.is_alive(&conn_id) {
                        feedback.push_back(InEvent::ConnectionClosed { conn_id });
                    }
                }
                OutEvent::SendMessage { conn_id, message } => match encode(&message) {
                    Some(payload) => self.transport.send(&conn_id, payload),
                    None => warn!(%conn_id, "failed to encode message"),
                },
                OutEvent::SecureListen {
                    conn_id,
                    identity_hash,
                } => self.secure.secure_for_receiving(&conn_id, &identity_hash),
                OutEvent::SecureExpect {
                    conn_id,
                    identity_hash,
                } => self.secure.secure_for_sending(&conn_id, &identity_hash),
                OutEvent::SecureSend {
                    conn_id,
                    sender,
                    recipient,
                    message,
                } => match encode(&message) {
                    Some(payload) => {
                        self.secure
                            .send_securely(&conn_id, &sender, &recipient, payload)
                    }
                    None => warn!(%conn_id, "failed to encode secure message"),
                },
                OutEvent::QueryPeers { count } => {
                    let peers = self.peer_source.get_peers(count);
                    feedback.push_back(InEvent::PeersDiscovered { peers });
                }
                OutEvent::CheckPeer { endpoint } => {
                    let peer = self.peer_source.get_peer_for_endpoint(&endpoint);
                    feedback.push_back(InEvent::PeerCheckResult { endpoint, peer });
                }
                OutEvent::QueryOnlineStatus { endpoints } => {
                    self.transport.query_listening(&endpoints)
                }
                OutEvent::ScheduleTimer { delay, timer } => {
                    self.timers.insert(Instant::now() + delay, timer);
                }
                OutEvent::EmitEvent(event) => self.events.ingest(event),
            }
        }
    }
}

fn encode(message: &Message) -> Option<Bytes> {
    postcard::to_allocvec(message).ok().map(Bytes::from)
}

fn decode(payload: &Bytes) -> Option<Message> {
    postcard::from_bytes(payload).ok()
}

/// A timer map with an async method to wait for the next expiration.
struct Timers<T> {
    map: BTreeMap<Instant, Vec<T>>,
}

impl<T> Timers<T> {
    fn new() -> Self {
        Timers {
            map: BTreeMap::new(),
        }
    }

    fn insert(&mut self, at: Instant, item: T) {
        self.map.entry(at).or_default().push(item);
    }

    /// Wait for the next timer to expire and return everything due. Pending
    /// forever while the map is empty.
    async fn wait_and_drain(&mut self) -> Vec<T> {
        match self.map.keys().next().copied() {
            Some(at) => {
                tokio::time::sleep_until(at.into()).await;
                let now = Instant::now();
                let later = self.map.split_off(&(now + Duration::from_nanos(1)));
                let due = std::mem::replace(&mut self.map, later);
                due.into_values().flatten().collect()
            }
            None => std::future::pending().await,
        }
    }
}
