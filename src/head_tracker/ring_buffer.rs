/// Bounded, lossy queue between the head subscription and the consumer
///
/// `push` never blocks: when full, the oldest queued head is overwritten so
/// the consumer always converges on the newest head.
use crate::types::Head;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

pub struct HeadRingBuffer {
    ring: ArrayQueue<Head>,
    closed: AtomicBool,
    available: Notify,
    dropped: AtomicU64,
}

impl HeadRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            available: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `head`; returns the head that was overwritten to make room, if any
    pub fn push(&self, head: Head) -> Option<Head> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let overwritten = self.ring.force_push(head);
        if overwritten.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        // Stores a permit when the consumer is not waiting yet
        self.available.notify_one();
        overwritten
    }

    /// Next head, waiting while empty; `None` once closed and drained
    pub async fn pop(&self) -> Option<Head> {
        loop {
            if let Some(head) = self.ring.pop() {
                return Some(head);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.available.notified().await;
        }
    }

    /// Stop accepting heads and wake the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_one();
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::H256;
    use std::sync::Arc;
    use std::time::Duration;

    fn head(number: u64) -> Head {
        Head::new(number, H256([number as u8; 32]), H256([0; 32]), 0)
    }

    #[tokio::test]
    async fn burst_keeps_only_newest() {
        let buffer = HeadRingBuffer::new(3);
        for number in 1..=10 {
            buffer.push(head(number));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.capacity(), 3);
        assert_eq!(buffer.dropped_count(), 7);

        let mut seen = Vec::new();
        while !buffer.is_empty() {
            seen.push(buffer.pop().await.unwrap().number);
        }
        assert_eq!(seen, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn single_slot_converges_on_newest() {
        let buffer = HeadRingBuffer::new(1);
        assert!(buffer.push(head(1)).is_none());
        assert_eq!(buffer.push(head(2)).unwrap().number, 1);
        buffer.push(head(3));
        assert_eq!(buffer.pop().await.unwrap().number, 3);
    }

    #[tokio::test]
    async fn consumer_wakes_on_push_and_close() {
        let buffer = Arc::new(HeadRingBuffer::new(2));
        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(head) = buffer.pop().await {
                    seen.push(head.number);
                }
                seen
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.push(head(4));
        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.close();
        assert!(buffer.push(head(5)).is_none());

        let seen = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, vec![4]);
    }
}
