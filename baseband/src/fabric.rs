//! Event/Task Queue Fabric
//!
//! Bounded lock-free queues carrying compact task descriptors between the
//! dispatcher and the worker pool, partitioned by (schedule-queue id x
//! event type), plus per-shard completion queues and one dedicated transmit
//! queue. FIFO order is guaranteed per producer within one partition only;
//! there is no ordering guarantee across partitions.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use tracing::warn;

use common::{EventData, EventType};

/// Spin retries before a non-critical enqueue gives up and drops.
const ENQUEUE_RETRY_LIMIT: usize = 64;

/// The queue fabric. Queues are the only synchronization primitive on the
/// hot path.
pub struct EventFabric {
    /// task_queues[shard][event type]
    task_queues: Vec<Vec<ArrayQueue<EventData>>>,
    /// Completion queues, one per shard, consumed by the dispatcher
    comp_queues: Vec<ArrayQueue<EventData>>,
    /// Dedicated transmit queue, sized generously; a drop here is fatal for
    /// air-interface timing and is decided by the caller
    tx_queue: ArrayQueue<EventData>,
    /// Drop counters per (shard, event type), non-critical statistics
    drops: Vec<Vec<CachePadded<AtomicU64>>>,
}

impl EventFabric {
    /// Build the fabric for `num_shards` schedule queues.
    pub fn new(num_shards: usize, queue_capacity: usize, comp_capacity: usize, tx_capacity: usize) -> Self {
        let task_queues = (0..num_shards)
            .map(|_| (0..EventType::COUNT).map(|_| ArrayQueue::new(queue_capacity)).collect())
            .collect();
        let comp_queues = (0..num_shards).map(|_| ArrayQueue::new(comp_capacity)).collect();
        let drops = (0..num_shards)
            .map(|_| (0..EventType::COUNT).map(|_| CachePadded::new(AtomicU64::new(0))).collect())
            .collect();
        Self { task_queues, comp_queues, tx_queue: ArrayQueue::new(tx_capacity), drops }
    }

    /// Number of schedule-queue shards
    pub fn num_shards(&self) -> usize {
        self.task_queues.len()
    }

    /// Non-blocking enqueue into a (shard, event type) partition. Returns
    /// false instead of blocking when the queue is full.
    pub fn try_enqueue(&self, qid: usize, event: EventData) -> bool {
        self.task_queues[qid][event.event_type as usize].push(event).is_ok()
    }

    /// Enqueue with bounded spin backoff, then drop-and-count. The policy
    /// for general compute queues: a dropped task is counted and the frame
    /// simply never completes that stage.
    pub fn enqueue_or_drop(&self, qid: usize, event: EventData) -> bool {
        for _ in 0..ENQUEUE_RETRY_LIMIT {
            if self.try_enqueue(qid, event) {
                return true;
            }
            std::hint::spin_loop();
        }
        let dropped =
            self.drops[qid][event.event_type as usize].fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            qid,
            event_type = ?event.event_type,
            dropped,
            "task queue full, dropping task"
        );
        false
    }

    /// Non-blocking dequeue from a (shard, event type) partition. Never
    /// blocks; workers poll and briefly yield on empty.
    pub fn try_dequeue(&self, qid: usize, event_type: EventType) -> Option<EventData> {
        self.task_queues[qid][event_type as usize].pop()
    }

    /// Enqueue onto the dedicated transmit queue. A false return is treated
    /// as fatal by the dispatcher.
    pub fn enqueue_tx(&self, event: EventData) -> bool {
        self.tx_queue.push(event).is_ok()
    }

    /// Dequeue from the dedicated transmit queue
    pub fn try_dequeue_tx(&self) -> Option<EventData> {
        self.tx_queue.pop()
    }

    /// Push a stage-completion event onto a shard's completion queue
    pub fn push_completion(&self, qid: usize, event: EventData) -> bool {
        self.comp_queues[qid].push(event).is_ok()
    }

    /// Pop one completion event from a shard's completion queue
    pub fn try_pop_completion(&self, qid: usize) -> Option<EventData> {
        self.comp_queues[qid].pop()
    }

    /// Dropped-task count of one (shard, event type) partition
    pub fn dropped(&self, qid: usize, event_type: EventType) -> u64 {
        self.drops[qid][event_type as usize].load(Ordering::Relaxed)
    }

    /// Total dropped tasks across all partitions
    pub fn total_dropped(&self) -> u64 {
        self.drops
            .iter()
            .flat_map(|shard| shard.iter())
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TaskTag;
    use std::sync::Arc;

    fn demul_event(index: u16) -> EventData {
        EventData::new(EventType::Demul, TaskTag::frame_symbol_index(0, 2, index))
    }

    #[test]
    fn test_enqueue_dequeue_round_trip() {
        let fabric = EventFabric::new(2, 8, 8, 8);
        assert!(fabric.try_enqueue(1, demul_event(48)));
        // Other partitions stay empty
        assert!(fabric.try_dequeue(0, EventType::Demul).is_none());
        assert!(fabric.try_dequeue(1, EventType::Fft).is_none());
        let ev = fabric.try_dequeue(1, EventType::Demul).unwrap();
        assert_eq!(ev.tag.index, 48);
        assert!(fabric.try_dequeue(1, EventType::Demul).is_none());
    }

    #[test]
    fn test_full_queue_returns_false() {
        let fabric = EventFabric::new(1, 2, 2, 2);
        assert!(fabric.try_enqueue(0, demul_event(0)));
        assert!(fabric.try_enqueue(0, demul_event(1)));
        assert!(!fabric.try_enqueue(0, demul_event(2)));
        assert_eq!(fabric.dropped(0, EventType::Demul), 0);
        assert!(!fabric.enqueue_or_drop(0, demul_event(2)));
        assert_eq!(fabric.dropped(0, EventType::Demul), 1);
    }

    #[test]
    fn test_partition_fifo_single_producer() {
        let fabric = EventFabric::new(1, 1024, 16, 16);
        for i in 0..1000u16 {
            assert!(fabric.try_enqueue(0, demul_event(i)));
        }
        for i in 0..1000u16 {
            assert_eq!(fabric.try_dequeue(0, EventType::Demul).unwrap().tag.index, i);
        }
    }

    #[test]
    fn test_partition_fifo_concurrent_producers() {
        // FIFO holds per producer within one partition: each producer's
        // items come out in its own enqueue order.
        let fabric = Arc::new(EventFabric::new(1, 4096, 16, 16));
        let per_producer = 500u16;
        let producers = 4u16;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let fabric = fabric.clone();
                std::thread::spawn(move || {
                    for i in 0..per_producer {
                        // symbol_id identifies the producer, index the order
                        let tag = TaskTag::frame_symbol_index(0, p as u8, i);
                        while !fabric.try_enqueue(0, EventData::new(EventType::Demul, tag)) {
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut next = vec![0u16; producers as usize];
        let mut total = 0;
        while let Some(ev) = fabric.try_dequeue(0, EventType::Demul) {
            let producer = ev.tag.symbol_id as usize;
            assert_eq!(ev.tag.index, next[producer]);
            next[producer] += 1;
            total += 1;
        }
        assert_eq!(total, (per_producer * producers) as usize);
    }

    #[test]
    fn test_tx_queue_is_independent() {
        let fabric = EventFabric::new(1, 1, 1, 4);
        // Fill the compute partition; the transmit queue is unaffected
        assert!(fabric.try_enqueue(0, demul_event(0)));
        assert!(!fabric.try_enqueue(0, demul_event(1)));
        let tx = EventData::new(EventType::PacketTx, TaskTag::frame_symbol(3, 4));
        assert!(fabric.enqueue_tx(tx));
        assert_eq!(fabric.try_dequeue_tx().unwrap(), tx);
    }
}
