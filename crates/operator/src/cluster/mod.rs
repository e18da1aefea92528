//! Cluster membership and state replication between dispatcher instances.
//!
//! The membership engine ([`Membership`]) owns peers and transport. Replicated
//! state lives behind a [`ClusterHandler`], which the engine calls for inbound
//! broadcasts, state snapshots and membership changes.

mod gossip;
mod message;
mod queue;

pub use gossip::GossipMembership;
pub use queue::{retransmit_limit, BroadcastQueue, PAYLOAD_OVERHEAD};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("message from cluster {got:?}, expected {expected:?}")]
    ClusterMismatch { expected: String, got: String },
    #[error("could not reach any of the seed nodes {seeds}")]
    JoinFailed { seeds: String },
    #[error("operation timed out")]
    Timeout,
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClusterError::Timeout
    }
}

/// A cluster member as seen by its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub addr: SocketAddr,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Peers from other clusters are rejected.
    pub cluster_name: String,
    pub node_name: String,
    pub bind_addr: SocketAddr,
    /// Address announced to peers. Defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,
    /// `host[:port]` entries resolved through DNS at join time.
    pub seeds: Vec<String>,
    pub gossip_interval: Duration,
    /// Peers contacted per gossip round.
    pub gossip_nodes: usize,
    pub push_pull_interval: Duration,
    pub retransmit_mult: usize,
    pub connect_timeout: Duration,
    pub leave_timeout: Duration,
    /// Consecutive failed exchanges before a peer is dropped.
    pub suspicion_threshold: u32,
    pub max_frame_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: "openfero".to_string(),
            node_name: default_node_name(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7946)),
            advertise_addr: None,
            seeds: Vec::new(),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            push_pull_interval: Duration::from_secs(30),
            retransmit_mult: 3,
            connect_timeout: Duration::from_secs(10),
            leave_timeout: Duration::from_secs(5),
            suspicion_threshold: 3,
            max_frame_size: 1 << 20,
        }
    }
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("openfero-{}", uuid::Uuid::new_v4().simple()))
}

/// Callbacks invoked by the membership engine. Implementations must apply the
/// same locking whether a call originates locally or from a peer.
#[async_trait]
pub trait ClusterHandler: Send + Sync {
    async fn on_peer_join(&self, node: &Node);

    async fn on_peer_leave(&self, node: &Node);

    /// A broadcast payload from a peer.
    async fn on_message(&self, payload: &[u8]);

    /// Full local state, sent to a peer during push/pull.
    async fn on_state_request(&self, join: bool) -> Vec<u8>;

    /// Full state received from a peer during push/pull.
    async fn on_state_merge(&self, state: &[u8], join: bool);

    /// Broadcast payloads to piggyback on the next message to one peer,
    /// totalling at most `limit` bytes.
    async fn pending_broadcasts(&self, num_nodes: usize, limit: usize) -> Vec<Bytes>;
}

#[async_trait]
pub trait Membership: Send + Sync {
    fn local_node(&self) -> &Node;

    /// Contact the seeds and exchange state. Returns how many peers were reached.
    async fn join(&self, seeds: &[String]) -> Result<usize, ClusterError>;

    /// Known peers, excluding the local node.
    async fn members(&self) -> Vec<Node>;

    /// Cluster size including the local node.
    async fn num_members(&self) -> usize {
        self.members().await.len() + 1
    }

    /// Announce departure and stop background work.
    async fn leave(&self, timeout: Duration) -> Result<(), ClusterError>;
}
