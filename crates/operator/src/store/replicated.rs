use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cluster::{
    BroadcastQueue, ClusterConfig, ClusterHandler, GossipMembership, Membership, Node,
    PAYLOAD_OVERHEAD,
};
use crate::models::{Alert, AlertStatus};
use crate::store::{select_records, AlertRecord, AlertStore, JobInfo, StoreError};

/// Broadcasts kept before the oldest are dropped in favor of push/pull sync.
const BROADCAST_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPhase {
    Uninitialized,
    Joining,
    Active,
    Left,
}

/// Alert history shared with peer instances through gossip.
///
/// Records are kept newest-first. Local saves are broadcast to peers on a
/// best-effort basis; full snapshots are exchanged on join and periodically,
/// and merged by timestamp.
pub struct ReplicatedStore {
    config: ClusterConfig,
    replica: Arc<Replica>,
    membership: Mutex<Option<Arc<GossipMembership>>>,
    phase: RwLock<ClusterPhase>,
}

/// Record list plus the outgoing broadcast queue. This is the handler the
/// membership engine calls into.
struct Replica {
    records: RwLock<Vec<AlertRecord>>,
    capacity: usize,
    broadcasts: BroadcastQueue,
}

impl ReplicatedStore {
    pub fn new(config: ClusterConfig, capacity: usize) -> Self {
        let capacity = if capacity == 0 { 100 } else { capacity };
        let replica = Replica {
            records: RwLock::new(Vec::with_capacity(capacity)),
            capacity,
            broadcasts: BroadcastQueue::new(config.retransmit_mult, BROADCAST_QUEUE_SIZE),
        };
        Self {
            config,
            replica: Arc::new(replica),
            membership: Mutex::new(None),
            phase: RwLock::new(ClusterPhase::Uninitialized),
        }
    }

    pub async fn phase(&self) -> ClusterPhase {
        *self.phase.read().await
    }

    /// The local cluster node, once initialized.
    pub async fn local_node(&self) -> Option<Node> {
        self.membership
            .lock()
            .await
            .as_ref()
            .map(|m| m.local_node().clone())
    }

    /// Cluster size including this node; 1 before initialization.
    pub async fn num_members(&self) -> usize {
        let membership = self.membership.lock().await.clone();
        match membership {
            Some(m) => m.num_members().await,
            None => 1,
        }
    }

    /// The callbacks this store exposes to a membership engine.
    pub fn handler(&self) -> Arc<dyn ClusterHandler> {
        self.replica.clone()
    }
}

#[async_trait]
impl AlertStore for ReplicatedStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        {
            let mut phase = self.phase.write().await;
            match *phase {
                ClusterPhase::Uninitialized => *phase = ClusterPhase::Joining,
                ClusterPhase::Left => return Err(StoreError::Closed),
                ClusterPhase::Joining | ClusterPhase::Active => return Ok(()),
            }
        }

        let membership = match GossipMembership::create(self.config.clone(), self.handler()).await {
            Ok(m) => m,
            Err(e) => {
                *self.phase.write().await = ClusterPhase::Uninitialized;
                return Err(StoreError::Join(e));
            }
        };

        if self.config.seeds.is_empty() {
            info!("No seed nodes configured, starting a new cluster");
        } else {
            info!(seeds = ?self.config.seeds, "Trying to join memberlist cluster");
            match membership.join(&self.config.seeds).await {
                Ok(contacted) => info!(contacted, "Joined memberlist cluster"),
                // Others can still join this node later.
                Err(e) => warn!("Failed to join cluster, creating new cluster: {}", e),
            }
        }

        let members = membership.num_members().await;
        let mut phase = self.phase.write().await;
        if *phase == ClusterPhase::Left {
            // Closed while joining.
            drop(phase);
            if let Err(e) = membership.leave(self.config.leave_timeout).await {
                warn!("Failed to leave cluster after close: {}", e);
            }
            return Err(StoreError::Closed);
        }
        *self.membership.lock().await = Some(membership);
        *phase = ClusterPhase::Active;
        info!(members, "Memberlist store initialized");
        Ok(())
    }

    async fn save_alert_with_job_info(
        &self,
        alert: Alert,
        status: AlertStatus,
        job_info: Option<JobInfo>,
    ) -> Result<(), StoreError> {
        let phase = self.phase().await;
        if phase == ClusterPhase::Left {
            return Err(StoreError::Closed);
        }

        let record = AlertRecord::new(alert, status, job_info);
        let payload = serde_json::to_vec(&record);
        self.replica.insert_local(record).await;

        // The local append above is never rolled back; propagation is best-effort.
        match payload {
            Ok(bytes) if phase == ClusterPhase::Active => {
                self.replica.broadcasts.queue(Bytes::from(bytes)).await;
            }
            Ok(_) => {}
            Err(e) => error!(
                "Failed to marshal alert for broadcast, record kept locally only: {}",
                StoreError::Marshal(e)
            ),
        }
        Ok(())
    }

    async fn get_alerts(&self, query: &str, limit: usize) -> Result<Vec<AlertRecord>, StoreError> {
        let records = self.replica.records.read().await;
        Ok(select_records(records.iter(), query, limit))
    }

    async fn close(&self) -> Result<(), StoreError> {
        *self.phase.write().await = ClusterPhase::Left;

        let membership = self.membership.lock().await.take();
        if let Some(membership) = membership {
            membership
                .leave(self.config.leave_timeout)
                .await
                .map_err(StoreError::Leave)?;
            info!("Left memberlist cluster");
        }
        Ok(())
    }
}

impl Replica {
    async fn insert_local(&self, record: AlertRecord) {
        let mut records = self.records.write().await;
        self.insert_sorted(&mut records, record);
    }

    /// Insert keeping newest-first order, then evict the oldest past capacity.
    fn insert_sorted(&self, records: &mut Vec<AlertRecord>, record: AlertRecord) {
        let at = records.partition_point(|r| r.timestamp > record.timestamp);
        records.insert(at, record);
        records.truncate(self.capacity);
    }

    /// Insert a record received from a peer unless it is already present.
    async fn insert_remote(&self, record: AlertRecord) -> bool {
        let mut records = self.records.write().await;
        if records.iter().any(|existing| existing.same_identity(&record)) {
            return false;
        }
        self.insert_sorted(&mut records, record);
        true
    }

    /// Merge a peer snapshot. Snapshot entries arrive unordered relative to
    /// local ones, so the merged list is re-sorted newest-first before trimming.
    async fn merge(&self, remote: Vec<AlertRecord>) -> usize {
        let mut records = self.records.write().await;
        let mut added = 0;
        for record in remote {
            if !records.iter().any(|existing| existing.same_identity(&record)) {
                records.push(record);
                added += 1;
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(self.capacity);
        added
    }
}

#[async_trait]
impl ClusterHandler for Replica {
    async fn on_peer_join(&self, node: &Node) {
        info!(node = %node, "Node joined the cluster");
    }

    async fn on_peer_leave(&self, node: &Node) {
        info!(node = %node, "Node left the cluster");
    }

    async fn on_message(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        match serde_json::from_slice::<AlertRecord>(payload) {
            Ok(record) => {
                if !self.insert_remote(record).await {
                    debug!("Ignoring duplicate alert broadcast");
                }
            }
            Err(e) => error!("Failed to unmarshal alert: {}", StoreError::Unmarshal(e)),
        }
    }

    async fn on_state_request(&self, _join: bool) -> Vec<u8> {
        let records = self.records.read().await;
        serde_json::to_vec(&*records).unwrap_or_else(|e| {
            error!("Failed to marshal local state: {}", e);
            Vec::new()
        })
    }

    async fn on_state_merge(&self, state: &[u8], join: bool) {
        if state.is_empty() {
            return;
        }
        match serde_json::from_slice::<Vec<AlertRecord>>(state) {
            Ok(remote) => {
                let added = self.merge(remote).await;
                debug!(added, join, "Merged remote alert state");
            }
            Err(e) => error!("Failed to unmarshal remote state: {}", e),
        }
    }

    async fn pending_broadcasts(&self, num_nodes: usize, limit: usize) -> Vec<Bytes> {
        self.broadcasts
            .get_broadcasts(num_nodes, PAYLOAD_OVERHEAD, limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn store(capacity: usize) -> ReplicatedStore {
        ReplicatedStore::new(ClusterConfig::default(), capacity)
    }

    fn record(name: &str, offset_secs: i64) -> AlertRecord {
        AlertRecord {
            alert: Alert::new([("alertname", name)]),
            status: AlertStatus::Firing,
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            job_info: None,
        }
    }

    fn names(records: &[AlertRecord]) -> Vec<&str> {
        records.iter().map(|r| r.alert.name()).collect()
    }

    #[tokio::test]
    async fn test_local_saves_are_newest_first_and_bounded() {
        let store = store(3);
        for i in 0..5 {
            store
                .save_alert(Alert::new([("alertname", format!("alert{}", i))]), AlertStatus::Firing)
                .await
                .unwrap();
        }

        let records = store.get_alerts("", 0).await.unwrap();
        assert_eq!(names(&records), vec!["alert4", "alert3", "alert2"]);
        assert_eq!(store.get_alerts("", 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_duplicates_are_dropped() {
        let store = store(10);
        let handler = store.handler();
        let payload = serde_json::to_vec(&record("alert1", 0)).unwrap();

        handler.on_message(&payload).await;
        handler.on_message(&payload).await;

        assert_eq!(store.get_alerts("", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_respects_capacity() {
        let store = store(2);
        let handler = store.handler();
        for i in 0..4 {
            let payload = serde_json::to_vec(&record(&format!("alert{}", i), i)).unwrap();
            handler.on_message(&payload).await;
        }

        let records = store.get_alerts("", 0).await.unwrap();
        assert_eq!(names(&records), vec!["alert3", "alert2"]);
    }

    #[tokio::test]
    async fn test_late_broadcast_is_placed_by_timestamp() {
        let store = store(2);
        let handler = store.handler();
        for name in ["local-1", "local-2"] {
            store
                .save_alert(Alert::new([("alertname", name)]), AlertStatus::Firing)
                .await
                .unwrap();
        }

        // Older than both local saves, so it is evicted rather than local-1.
        let payload = serde_json::to_vec(&record("from-peer", -1)).unwrap();
        handler.on_message(&payload).await;
        let records = store.get_alerts("", 0).await.unwrap();
        assert_eq!(names(&records), vec!["local-2", "local-1"]);
    }

    #[tokio::test]
    async fn test_broadcasts_keep_newest_first_order() {
        let store = store(10);
        let handler = store.handler();
        for (name, offset) in [("newest", 0), ("oldest", -20), ("middle", -10)] {
            let payload = serde_json::to_vec(&record(name, offset)).unwrap();
            handler.on_message(&payload).await;
        }
        let records = store.get_alerts("", 0).await.unwrap();
        assert_eq!(names(&records), vec!["newest", "middle", "oldest"]);
    }

    #[tokio::test]
    async fn test_malformed_broadcast_is_ignored() {
        let store = store(10);
        store.handler().on_message(b"{not json").await;
        store.handler().on_message(b"").await;
        assert!(store.get_alerts("", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_merge_sorts_dedups_and_trims() {
        let store = store(4);
        let handler = store.handler();
        let shared = record("shared", -10);
        handler.on_message(&serde_json::to_vec(&record("local-new", 5)).unwrap()).await;
        handler.on_message(&serde_json::to_vec(&shared).unwrap()).await;

        let remote = vec![
            record("remote-oldest", -100),
            shared.clone(),
            record("remote-newest", 50),
            record("remote-mid", 0),
        ];
        handler
            .on_state_merge(&serde_json::to_vec(&remote).unwrap(), true)
            .await;

        let records = store.get_alerts("", 0).await.unwrap();
        assert_eq!(
            names(&records),
            vec!["remote-newest", "local-new", "remote-mid", "shared"]
        );
    }

    #[tokio::test]
    async fn test_state_request_round_trips() {
        let source = store(10);
        for i in 0..3 {
            source
                .save_alert(Alert::new([("alertname", format!("alert{}", i))]), AlertStatus::Resolved)
                .await
                .unwrap();
        }
        let snapshot = source.handler().on_state_request(true).await;

        let target = store(10);
        target.handler().on_state_merge(&snapshot, true).await;
        // Merging twice adds nothing.
        target.handler().on_state_merge(&snapshot, false).await;

        assert_eq!(
            target.get_alerts("", 0).await.unwrap(),
            source.get_alerts("", 0).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_query_on_replicated_store() {
        let store = store(10);
        for status in ["firing", "resolved", "FIRING", "RESOLVED"] {
            store
                .save_alert(Alert::new([("alertname", "TestAlert")]), status.parse().unwrap())
                .await
                .unwrap();
        }
        assert_eq!(store.get_alerts("firing", 100).await.unwrap().len(), 2);
        assert_eq!(store.get_alerts("testalert", 3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_saves_before_initialize_are_not_queued() {
        let store = store(10);
        store
            .save_alert(Alert::new([("alertname", "early")]), AlertStatus::Firing)
            .await
            .unwrap();
        assert!(store.replica.broadcasts.is_empty().await);
        assert_eq!(store.phase().await, ClusterPhase::Uninitialized);
    }

    #[tokio::test]
    async fn test_close_without_initialize() {
        let store = store(10);
        store.close().await.unwrap();
        assert_eq!(store.phase().await, ClusterPhase::Left);
        assert!(matches!(
            store
                .save_alert(Alert::new([("alertname", "late")]), AlertStatus::Firing)
                .await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.initialize().await, Err(StoreError::Closed)));
    }
}
