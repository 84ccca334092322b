//! Protocol implementation, as a state machine without IO

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use weft_base::{base32, Hash};
use weft_data::Identity;

mod group;

#[cfg(test)]
mod tests;

pub use group::{
    Config, ConnectionState, ConnectionSummary, Event, InEvent, Message, OutEvent, PeerGroupState,
    Stats, Timer,
};

/// Identifies one peer group: a named set of replicas keeping a mesh.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerGroupId([u8; 32]);

impl PeerGroupId {
    /// Create from a byte array.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a group id from a human-readable name.
    pub fn from_name(name: &str) -> Self {
        Self(*Hash::new(name.as_bytes()).as_bytes())
    }

    /// Get as byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl<T: Into<[u8; 32]>> From<T> for PeerGroupId {
    fn from(value: T) -> Self {
        Self::from_bytes(value.into())
    }
}

impl fmt::Display for PeerGroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.0))
    }
}

impl fmt::Debug for PeerGroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeerGroupId({})", base32::fmt_short(self.0))
    }
}

/// A signaling-layer address at which a peer listens.
pub type Endpoint = String;

/// Identifies one process instance behind an endpoint, so several instances
/// sharing an identity (e.g. browser tabs) cannot confuse the mesh.
pub type InstanceId = String;

/// One replica in a peer group.
#[derive(Clone)]
pub struct PeerInfo {
    /// Where the peer listens.
    pub endpoint: Endpoint,
    /// Hash of the peer's identity.
    pub identity_hash: Hash,
    /// The identity object, when it travelled with the peer info.
    pub identity: Option<Arc<Identity>>,
}

impl PeerInfo {
    /// Peer info from an endpoint and identity hash.
    pub fn new(endpoint: impl Into<Endpoint>, identity_hash: Hash) -> Self {
        PeerInfo {
            endpoint: endpoint.into(),
            identity_hash,
            identity: None,
        }
    }

    /// Attach the identity object.
    pub fn with_identity(mut self, identity: Arc<Identity>) -> Self {
        self.identity_hash = identity.id_hash();
        self.identity = Some(identity);
        self
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint && self.identity_hash == other.identity_hash
    }
}

impl Eq for PeerInfo {}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerInfo({} @ {:?})", self.endpoint, self.identity_hash)
    }
}

/// Identifies one transport connection. Allocated by the initiating side
/// and shared by both ends, so the lexicographic order used to break
/// deduplication ties agrees everywhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnId(pub String);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnId {
    fn from(value: &str) -> Self {
        ConnId(value.to_string())
    }
}

/// The agent id peer-group control messages are addressed to.
pub fn agent_id(group: &PeerGroupId) -> String {
    format!("peer-control-for-{group}")
}
