use async_trait::async_trait;
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::{self, Connection, Envelope};
use super::{ClusterConfig, ClusterError, ClusterHandler, Membership, Node};

#[derive(Debug)]
struct Member {
    node: Node,
    failures: u32,
}

/// Gossip membership over TCP.
///
/// Three background tasks run until [`Membership::leave`] or
/// [`GossipMembership::shutdown`]: the listener, the gossip round that pushes
/// pending broadcasts to random peers, and the periodic push/pull exchange
/// that reconciles full state with one random peer.
pub struct GossipMembership {
    config: ClusterConfig,
    local: Node,
    handler: Arc<dyn ClusterHandler>,
    members: RwLock<HashMap<String, Member>>,
    /// Recently departed peers, ignored when they show up in stale member lists.
    departed: RwLock<HashMap<String, Instant>>,
    shutdown: CancellationToken,
    left: AtomicBool,
}

impl GossipMembership {
    /// Bind the listener and start the background tasks.
    pub async fn create(
        config: ClusterConfig,
        handler: Arc<dyn ClusterHandler>,
    ) -> Result<Arc<Self>, ClusterError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let bound = listener.local_addr()?;
        let local = Node {
            name: config.node_name.clone(),
            addr: config.advertise_addr.unwrap_or(bound),
        };

        info!(node = %local, cluster = %config.cluster_name, "Gossip listener started");

        let membership = Arc::new(Self {
            config,
            local,
            handler,
            members: RwLock::new(HashMap::new()),
            departed: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            left: AtomicBool::new(false),
        });

        tokio::spawn(membership.clone().accept_loop(listener));
        tokio::spawn(membership.clone().gossip_loop());
        tokio::spawn(membership.clone().push_pull_loop());

        Ok(membership)
    }

    /// Stop background tasks without notifying peers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            let deadline = this.config.connect_timeout;
                            match timeout(deadline, this.handle_connection(stream, peer)).await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => debug!(%peer, "Gossip exchange failed: {}", e),
                                Err(_) => debug!(%peer, "Gossip exchange timed out"),
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept gossip connection: {}", e),
                },
            }
        }
        debug!(node = %self.local, "Gossip listener stopped");
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ClusterError> {
        let mut conn = message::connection(stream, self.config.max_frame_size);
        let (envelope, mut payloads) = message::recv(&mut conn).await?;
        envelope.check_cluster(&self.config.cluster_name)?;

        match envelope {
            Envelope::PushPull {
                from,
                join,
                members,
                ..
            } => {
                // Reply with our state before merging theirs so it is not echoed back.
                self.send_push_pull(&mut conn, join).await?;
                if from.name == self.local.name {
                    return Ok(());
                }

                let from = with_observed_ip(from, peer);
                self.mark_alive(&from.name).await;
                self.merge_members(from, members).await;
                if let Some(state) = payloads.pop() {
                    self.handler.on_state_merge(&state, join).await;
                }
            }
            Envelope::User { from, .. } => {
                for payload in &payloads {
                    self.handler.on_message(payload).await;
                }
                self.mark_alive(&from).await;
            }
            Envelope::Leave { node, .. } => {
                self.remove_member(&node.name, "left").await;
            }
        }
        Ok(())
    }

    async fn push_pull_envelope(&self, join: bool) -> Envelope {
        Envelope::PushPull {
            cluster: self.config.cluster_name.clone(),
            from: self.local.clone(),
            join,
            members: self.members().await,
        }
    }

    async fn send_push_pull(&self, conn: &mut Connection, join: bool) -> Result<(), ClusterError> {
        let envelope = self.push_pull_envelope(join).await;
        let state = Bytes::from(self.handler.on_state_request(join).await);
        message::send(conn, &envelope, &[state]).await
    }

    async fn connect(&self, addr: SocketAddr) -> Result<Connection, ClusterError> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr)).await??;
        Ok(message::connection(stream, self.config.max_frame_size))
    }

    /// Exchange full state with the node at `addr`. Returns false when `addr`
    /// turned out to be this node.
    async fn push_pull(&self, addr: SocketAddr, join: bool) -> Result<bool, ClusterError> {
        timeout(self.config.connect_timeout, self.push_pull_exchange(addr, join)).await?
    }

    async fn push_pull_exchange(&self, addr: SocketAddr, join: bool) -> Result<bool, ClusterError> {
        let mut conn = self.connect(addr).await?;
        self.send_push_pull(&mut conn, join).await?;

        let (reply, mut payloads) = message::recv(&mut conn).await?;
        reply.check_cluster(&self.config.cluster_name)?;
        match reply {
            Envelope::PushPull { from, .. } if from.name == self.local.name => Ok(false),
            Envelope::PushPull { from, members, .. } => {
                let from = with_observed_ip(from, addr);
                self.merge_members(from, members).await;
                if let Some(state) = payloads.pop() {
                    self.handler.on_state_merge(&state, join).await;
                }
                Ok(true)
            }
            other => Err(ClusterError::Protocol(format!(
                "expected push/pull reply, got {:?}",
                other
            ))),
        }
    }

    async fn send_user(&self, node: &Node, payloads: &[Bytes]) -> Result<(), ClusterError> {
        let envelope = Envelope::User {
            cluster: self.config.cluster_name.clone(),
            from: self.local.name.clone(),
            count: payloads.len(),
        };
        timeout(self.config.connect_timeout, self.send_to(node, &envelope, payloads)).await?
    }

    async fn send_to(&self, node: &Node, envelope: &Envelope, payloads: &[Bytes]) -> Result<(), ClusterError> {
        let mut conn = self.connect(node.addr).await?;
        message::send(&mut conn, envelope, payloads).await
    }

    async fn send_leave(&self, node: &Node) -> Result<(), ClusterError> {
        let envelope = Envelope::Leave {
            cluster: self.config.cluster_name.clone(),
            node: self.local.clone(),
        };
        self.send_to(node, &envelope, &[]).await
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.gossip_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.gossip().await,
            }
        }
    }

    /// One gossip round: piggyback pending broadcasts on a message to each of
    /// up to `gossip_nodes` random peers.
    async fn gossip(&self) {
        let members = self.members().await;
        if members.is_empty() {
            return;
        }
        let num_nodes = members.len() + 1;

        for peer in sample(&members, self.config.gossip_nodes) {
            let payloads = self
                .handler
                .pending_broadcasts(num_nodes, self.config.max_frame_size)
                .await;
            if payloads.is_empty() {
                break;
            }
            match self.send_user(&peer, &payloads).await {
                Ok(()) => self.mark_alive(&peer.name).await,
                Err(e) => {
                    debug!(node = %peer, "Failed to gossip to peer: {}", e);
                    self.record_failure(&peer.name).await;
                }
            }
        }
    }

    async fn push_pull_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.push_pull_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; join already exchanged state.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let members = self.members().await;
                    if let Some(peer) = sample(&members, 1).pop() {
                        match self.push_pull(peer.addr, false).await {
                            Ok(_) => self.mark_alive(&peer.name).await,
                            Err(e) => {
                                debug!(node = %peer, "Periodic state sync failed: {}", e);
                                self.record_failure(&peer.name).await;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn merge_members(&self, from: Node, members: Vec<Node>) {
        let tombstone_ttl = self.config.push_pull_interval * 2;
        let mut joined = Vec::new();
        {
            let mut departed = self.departed.write().await;
            departed.retain(|_, at| at.elapsed() < tombstone_ttl);
            // Direct contact overrides a tombstone.
            departed.remove(&from.name);

            let mut known = self.members.write().await;
            for node in std::iter::once(from).chain(members) {
                if node.name == self.local.name || departed.contains_key(&node.name) {
                    continue;
                }
                match known.get_mut(&node.name) {
                    Some(member) => member.node.addr = node.addr,
                    None => {
                        known.insert(
                            node.name.clone(),
                            Member {
                                node: node.clone(),
                                failures: 0,
                            },
                        );
                        joined.push(node);
                    }
                }
            }
        }

        for node in joined {
            self.handler.on_peer_join(&node).await;
        }
    }

    async fn mark_alive(&self, name: &str) {
        if let Some(member) = self.members.write().await.get_mut(name) {
            member.failures = 0;
        }
    }

    async fn record_failure(&self, name: &str) {
        let suspect = {
            let mut members = self.members.write().await;
            match members.get_mut(name) {
                Some(member) => {
                    member.failures += 1;
                    member.failures >= self.config.suspicion_threshold
                }
                None => false,
            }
        };
        if suspect {
            self.remove_member(name, "unreachable").await;
        }
    }

    async fn remove_member(&self, name: &str, reason: &str) {
        let removed = self.members.write().await.remove(name);
        if let Some(member) = removed {
            self.departed
                .write()
                .await
                .insert(name.to_string(), Instant::now());
            debug!(node = %member.node, reason, "Removed cluster member");
            self.handler.on_peer_leave(&member.node).await;
        }
    }

    async fn resolve(&self, seed: &str) -> Result<Vec<SocketAddr>, ClusterError> {
        let target = with_default_port(seed, self.config.bind_addr.port());
        let addrs = timeout(self.config.connect_timeout, lookup_host(target)).await??;
        Ok(addrs.collect())
    }
}

#[async_trait]
impl Membership for GossipMembership {
    fn local_node(&self) -> &Node {
        &self.local
    }

    async fn join(&self, seeds: &[String]) -> Result<usize, ClusterError> {
        let mut contacted = 0;
        for seed in seeds {
            let addrs = match self.resolve(seed).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    debug!(seed = %seed, "Failed to resolve seed: {}", e);
                    continue;
                }
            };
            for addr in addrs {
                if addr == self.local.addr {
                    continue;
                }
                match self.push_pull(addr, true).await {
                    Ok(true) => contacted += 1,
                    Ok(false) => debug!(seed = %seed, %addr, "Seed resolved to this node"),
                    Err(e) => debug!(seed = %seed, %addr, "Failed to contact seed: {}", e),
                }
            }
        }

        if contacted == 0 && !seeds.is_empty() {
            return Err(ClusterError::JoinFailed {
                seeds: seeds.join(","),
            });
        }
        Ok(contacted)
    }

    async fn members(&self) -> Vec<Node> {
        self.members
            .read()
            .await
            .values()
            .map(|member| member.node.clone())
            .collect()
    }

    async fn leave(&self, deadline: Duration) -> Result<(), ClusterError> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let members = self.members().await;
        info!(node = %self.local, peers = members.len(), "Leaving cluster");
        let notify = futures::future::join_all(members.iter().map(|node| async move {
            if let Err(e) = self.send_leave(node).await {
                debug!(node = %node, "Failed to announce leave: {}", e);
            }
        }));
        let result = timeout(deadline, notify).await;

        self.shutdown.cancel();
        result.map(|_| ()).map_err(ClusterError::from)
    }
}

fn sample(nodes: &[Node], amount: usize) -> Vec<Node> {
    let mut rng = rand::thread_rng();
    nodes.choose_multiple(&mut rng, amount).cloned().collect()
}

/// Peers bound to a wildcard address announce it verbatim; substitute the
/// address the connection actually came from.
fn with_observed_ip(mut node: Node, observed: SocketAddr) -> Node {
    if node.addr.ip().is_unspecified() {
        node.addr.set_ip(observed.ip());
    }
    node
}

fn with_default_port(seed: &str, port: u16) -> String {
    if seed.parse::<SocketAddr>().is_ok() {
        return seed.to_string();
    }
    match seed.rsplit_once(':') {
        Some((host, p)) if !host.is_empty() && !host.ends_with(':') && p.parse::<u16>().is_ok() => {
            seed.to_string()
        }
        _ => format!("{}:{}", seed, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("10.0.0.1:8000", 7946), "10.0.0.1:8000");
        assert_eq!(
            with_default_port("openfero-headless.default.svc.cluster.local", 7946),
            "openfero-headless.default.svc.cluster.local:7946"
        );
        assert_eq!(
            with_default_port("openfero-headless:7000", 7946),
            "openfero-headless:7000"
        );
        assert_eq!(with_default_port("[::1]:9000", 7946), "[::1]:9000");
    }

    #[test]
    fn test_with_observed_ip() {
        let node = Node {
            name: "b".into(),
            addr: "0.0.0.0:7946".parse().unwrap(),
        };
        let fixed = with_observed_ip(node, "10.1.2.3:53122".parse().unwrap());
        assert_eq!(fixed.addr, "10.1.2.3:7946".parse::<SocketAddr>().unwrap());

        let node = Node {
            name: "c".into(),
            addr: "10.9.9.9:7946".parse().unwrap(),
        };
        let kept = with_observed_ip(node, "10.1.2.3:53122".parse().unwrap());
        assert_eq!(kept.addr, "10.9.9.9:7946".parse::<SocketAddr>().unwrap());
    }

    struct NoopHandler;

    #[async_trait]
    impl ClusterHandler for NoopHandler {
        async fn on_peer_join(&self, _node: &Node) {}
        async fn on_peer_leave(&self, _node: &Node) {}
        async fn on_message(&self, _payload: &[u8]) {}
        async fn on_state_request(&self, _join: bool) -> Vec<u8> {
            Vec::new()
        }
        async fn on_state_merge(&self, _state: &[u8], _join: bool) {}
        async fn pending_broadcasts(&self, _num_nodes: usize, _limit: usize) -> Vec<Bytes> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_join_through_own_address_is_not_a_join() {
        // Bound to the wildcard, the node does not recognise its loopback address.
        let config = ClusterConfig {
            node_name: "solo".into(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            ..ClusterConfig::default()
        };
        let membership = GossipMembership::create(config, Arc::new(NoopHandler))
            .await
            .unwrap();
        let own = format!("127.0.0.1:{}", membership.local_node().addr.port());

        let result = membership.join(&[own]).await;
        assert!(matches!(result, Err(ClusterError::JoinFailed { .. })));
        assert_eq!(membership.num_members().await, 1);
        membership.shutdown();
    }

    #[test]
    fn test_sample_bounds() {
        let nodes: Vec<Node> = (0..5)
            .map(|i| Node {
                name: format!("n{}", i),
                addr: ([127, 0, 0, 1], 7000 + i).into(),
            })
            .collect();
        assert_eq!(sample(&nodes, 3).len(), 3);
        assert_eq!(sample(&nodes, 10).len(), 5);
        assert!(sample(&[], 3).is_empty());
    }
}
