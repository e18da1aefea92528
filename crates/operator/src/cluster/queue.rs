use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Length prefix added to each payload frame on the wire.
pub const PAYLOAD_OVERHEAD: usize = 4;

/// How many times a broadcast is transmitted in a cluster of `num_nodes`.
pub fn retransmit_limit(retransmit_mult: usize, num_nodes: usize) -> usize {
    let node_scale = ((num_nodes + 1) as f64).log10().ceil() as usize;
    (retransmit_mult * node_scale).max(1)
}

#[derive(Debug)]
struct QueuedBroadcast {
    id: u64,
    transmits: usize,
    payload: Bytes,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: Vec<QueuedBroadcast>,
    next_id: u64,
}

/// Retransmit-limited broadcast queue. Broadcasts never invalidate each other;
/// each is handed out until it has been transmitted `retransmit_limit` times,
/// least-transmitted first.
#[derive(Debug)]
pub struct BroadcastQueue {
    retransmit_mult: usize,
    max_queued: usize,
    inner: Mutex<QueueInner>,
}

impl BroadcastQueue {
    pub fn new(retransmit_mult: usize, max_queued: usize) -> Self {
        Self {
            retransmit_mult,
            max_queued: max_queued.max(1),
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub async fn queue(&self, payload: Bytes) {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.push(QueuedBroadcast {
            id,
            transmits: 0,
            payload,
        });

        if inner.items.len() > self.max_queued {
            // Peers still receive dropped entries through push/pull.
            let overflow = inner.items.len() - self.max_queued;
            inner
                .items
                .sort_by(|a, b| b.transmits.cmp(&a.transmits).then(a.id.cmp(&b.id)));
            inner.items.drain(..overflow);
            debug!(dropped = overflow, "Broadcast queue full, dropped oldest broadcasts");
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Take broadcasts for one transmission, at most `limit` bytes including
    /// per-payload overhead.
    pub async fn get_broadcasts(&self, num_nodes: usize, overhead: usize, limit: usize) -> Vec<Bytes> {
        let transmit_limit = retransmit_limit(self.retransmit_mult, num_nodes);
        let mut inner = self.inner.lock().await;

        inner.items.retain(|item| {
            let fits = item.payload.len() + overhead <= limit;
            if !fits {
                warn!(size = item.payload.len(), limit, "Dropping broadcast larger than message limit");
            }
            fits
        });
        inner
            .items
            .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(b.id.cmp(&a.id)));

        let mut used = 0;
        let mut selected = Vec::new();
        for item in inner.items.iter_mut() {
            let cost = item.payload.len() + overhead;
            if used + cost > limit {
                continue;
            }
            used += cost;
            item.transmits += 1;
            selected.push(item.payload.clone());
        }

        inner.items.retain(|item| item.transmits < transmit_limit);
        selected
    }

    pub async fn reset(&self) {
        self.inner.lock().await.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmit_limit_scales_with_cluster_size() {
        assert_eq!(retransmit_limit(3, 1), 3);
        assert_eq!(retransmit_limit(3, 2), 3);
        assert_eq!(retransmit_limit(3, 9), 3);
        assert_eq!(retransmit_limit(3, 10), 6);
        assert_eq!(retransmit_limit(3, 150), 9);
        assert_eq!(retransmit_limit(3, 0), 1);
    }

    #[tokio::test]
    async fn test_broadcast_is_retransmitted_until_limit() {
        let queue = BroadcastQueue::new(3, 16);
        queue.queue(Bytes::from_static(b"record")).await;

        for _ in 0..3 {
            let out = queue.get_broadcasts(2, PAYLOAD_OVERHEAD, 1024).await;
            assert_eq!(out, vec![Bytes::from_static(b"record")]);
        }
        assert!(queue.get_broadcasts(2, PAYLOAD_OVERHEAD, 1024).await.is_empty());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_broadcasts_do_not_invalidate_each_other() {
        let queue = BroadcastQueue::new(3, 16);
        queue.queue(Bytes::from_static(b"one")).await;
        queue.queue(Bytes::from_static(b"one")).await;
        queue.queue(Bytes::from_static(b"two")).await;

        let out = queue.get_broadcasts(2, PAYLOAD_OVERHEAD, 1024).await;
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn test_byte_limit_prefers_least_transmitted() {
        let queue = BroadcastQueue::new(3, 16);
        queue.queue(Bytes::from(vec![b'a'; 60])).await;

        let out = queue.get_broadcasts(2, PAYLOAD_OVERHEAD, 100).await;
        assert_eq!(out.len(), 1);

        queue.queue(Bytes::from(vec![b'b'; 60])).await;
        // Only one fits; the fresh one goes first.
        let out = queue.get_broadcasts(2, PAYLOAD_OVERHEAD, 100).await;
        assert_eq!(out, vec![Bytes::from(vec![b'b'; 60])]);
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_oversized_broadcast_is_dropped() {
        let queue = BroadcastQueue::new(3, 16);
        queue.queue(Bytes::from(vec![0u8; 200])).await;
        assert!(queue.get_broadcasts(2, PAYLOAD_OVERHEAD, 100).await.is_empty());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_queue_bound_drops_oldest() {
        let queue = BroadcastQueue::new(3, 2);
        queue.queue(Bytes::from_static(b"1")).await;
        queue.queue(Bytes::from_static(b"2")).await;
        queue.queue(Bytes::from_static(b"3")).await;

        let mut out = queue.get_broadcasts(2, PAYLOAD_OVERHEAD, 1024).await;
        out.sort();
        assert_eq!(out, vec![Bytes::from_static(b"2"), Bytes::from_static(b"3")]);
    }
}
