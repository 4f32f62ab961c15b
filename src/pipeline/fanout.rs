//! Drop-oldest fan-out
//!
//! Every subscriber owns a bounded queue. Publishing never blocks: when a
//! queue is full its oldest item is evicted to make room. The distributor
//! keeps a second receiver on each queue for exactly that purpose.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::debug;

use crate::types::{Detection, Frame};

pub const DEFAULT_CAPACITY: usize = 100;

/// Attempts to make room in a full queue before the new item is dropped
/// instead. Only reachable when several publishers race on one queue.
const MAX_EVICT_ATTEMPTS: usize = 4;

/// One published frame as seen by consumers
#[derive(Debug, Clone)]
pub struct FanoutItem {
    pub source_id: Arc<str>,
    pub sequence: u64,
    pub frame: Frame,
    pub detections: Arc<Vec<Detection>>,
    pub captured_at: DateTime<Utc>,
}

struct Subscriber {
    id: u64,
    name: String,
    tx: Sender<FanoutItem>,
    evict: Receiver<FanoutItem>,
    dropped: Arc<AtomicU64>,
}

struct Inner {
    capacity: usize,
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    published: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Vec<Subscriber>> {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Subscriber>> {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: u64) -> bool {
        let mut subs = self.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }
}

/// Cheap to clone; all clones share the same subscriber set.
#[derive(Clone)]
pub struct FanoutDistributor {
    inner: Arc<Inner>,
}

impl Default for FanoutDistributor {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl FanoutDistributor {
    /// `capacity` is per subscriber and clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.read().len()
    }

    /// Items accepted by `publish` since creation
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Registers a new consumer with its own empty queue. After `close` the
    /// returned handle is already closed.
    pub fn subscribe(&self, name: impl Into<String>) -> ConsumerHandle {
        let name = name.into();
        let (tx, rx) = bounded(self.inner.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            // Checked under the lock so a racing `close` always sees the push
            let mut subs = self.inner.write();
            if !self.is_closed() {
                debug!(subscriber = %name, id, "fan-out subscriber added");
                subs.push(Subscriber {
                    id,
                    name: name.clone(),
                    tx,
                    evict: rx.clone(),
                    dropped: dropped.clone(),
                });
            }
        }

        ConsumerHandle {
            id,
            name,
            rx,
            dropped,
            distributor: Arc::downgrade(&self.inner),
        }
    }

    /// Removes the consumer. Publishes racing with this call are discarded.
    pub fn unsubscribe(&self, handle: ConsumerHandle) {
        drop(handle);
    }

    /// Delivers `item` to every subscriber without blocking. Returns the
    /// number of queues that accepted it.
    pub fn publish(&self, item: FanoutItem) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let subs = self.inner.read();
        let mut delivered = 0;
        for sub in subs.iter() {
            if offer(sub, item.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drops every queue sender. Consumers drain what is left, then see the
    /// stream end.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            let subs = std::mem::take(&mut *self.inner.write());
            debug!(subscribers = subs.len(), "fan-out closed");
        }
    }
}

fn offer(sub: &Subscriber, mut item: FanoutItem) -> bool {
    for _ in 0..MAX_EVICT_ATTEMPTS {
        match sub.tx.try_send(item) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                if sub.evict.try_recv().is_ok() {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                }
                item = back;
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
    sub.dropped.fetch_add(1, Ordering::Relaxed);
    debug!(subscriber = %sub.name, "queue contended, item dropped");
    false
}

/// Consumer end of one fan-out queue. Dropping it unsubscribes.
pub struct ConsumerHandle {
    id: u64,
    name: String,
    rx: Receiver<FanoutItem>,
    dropped: Arc<AtomicU64>,
    distributor: Weak<Inner>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Oldest queued item, without waiting
    pub fn next(&self) -> Option<FanoutItem> {
        self.rx.try_recv().ok()
    }

    /// Oldest queued item, waiting up to `timeout`
    pub fn next_timeout(&self, timeout: Duration) -> Option<FanoutItem> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Empties the queue and returns its contents, oldest first.
    pub fn drain(&self) -> Vec<FanoutItem> {
        self.rx.try_iter().collect()
    }

    /// Items evicted from this queue to make room for newer ones
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// True once the distributor is gone or closed and the queue is empty.
    pub fn is_closed(&self) -> bool {
        let gone = match self.distributor.upgrade() {
            Some(inner) => inner.closed.load(Ordering::Acquire),
            None => true,
        };
        gone && self.rx.is_empty()
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.distributor.upgrade() {
            if inner.remove(self.id) {
                debug!(subscriber = %self.name, id = self.id, "fan-out subscriber removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn item(seq: u64) -> FanoutItem {
        FanoutItem {
            source_id: Arc::from("cam"),
            sequence: seq,
            frame: Frame::solid(1, 1, [0, 0, 0, 255]),
            detections: Arc::default(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn every_subscriber_gets_every_item_when_keeping_up() {
        let fanout = FanoutDistributor::new(8);
        let a = fanout.subscribe("a");
        let b = fanout.subscribe("b");
        for seq in 1..=5 {
            assert_eq!(fanout.publish(item(seq)), 2);
        }
        let seqs = |h: &ConsumerHandle| h.drain().iter().map(|i| i.sequence).collect::<Vec<_>>();
        assert_eq!(seqs(&a), vec![1, 2, 3, 4, 5]);
        assert_eq!(seqs(&b), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let fanout = FanoutDistributor::new(3);
        let slow = fanout.subscribe("slow");
        for seq in 1..=10 {
            fanout.publish(item(seq));
        }
        assert_eq!(slow.len(), 3);
        assert_eq!(slow.dropped(), 7);
        let seqs: Vec<_> = slow.drain().iter().map(|i| i.sequence).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[test]
    fn slow_consumer_does_not_affect_fast_one() {
        let fanout = FanoutDistributor::new(2);
        let slow = fanout.subscribe("slow");
        let fast = fanout.subscribe("fast");
        for seq in 1..=6 {
            fanout.publish(item(seq));
            assert_eq!(fast.next().map(|i| i.sequence), Some(seq));
        }
        assert_eq!(fast.dropped(), 0);
        assert_eq!(slow.dropped(), 4);
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let fanout = FanoutDistributor::default();
        let h = fanout.subscribe("temp");
        assert_eq!(fanout.subscriber_count(), 1);
        fanout.unsubscribe(h);
        assert_eq!(fanout.subscriber_count(), 0);
        assert_eq!(fanout.publish(item(1)), 0);
    }

    #[test]
    fn unsubscribe_races_with_publish() {
        let fanout = FanoutDistributor::new(4);
        let publisher = {
            let fanout = fanout.clone();
            thread::spawn(move || {
                for seq in 0..5000 {
                    fanout.publish(item(seq));
                }
            })
        };
        for _ in 0..200 {
            let h = fanout.subscribe("churn");
            let _ = h.next();
            fanout.unsubscribe(h);
        }
        publisher.join().unwrap();
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn close_ends_stream_after_drain() {
        let fanout = FanoutDistributor::new(4);
        let h = fanout.subscribe("reader");
        fanout.publish(item(1));
        fanout.close();
        assert_eq!(fanout.publish(item(2)), 0);
        assert!(!h.is_closed());
        assert_eq!(h.next_timeout(Duration::from_millis(10)).map(|i| i.sequence), Some(1));
        assert!(h.next_timeout(Duration::from_millis(10)).is_none());
        assert!(h.is_closed());
    }

    #[test]
    fn subscribe_racing_close_never_outlives_it() {
        for _ in 0..50 {
            let fanout = FanoutDistributor::new(2);
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let subscriber = {
                let fanout = fanout.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    (0..20)
                        .map(|i| fanout.subscribe(format!("late-{i}")))
                        .collect::<Vec<_>>()
                })
            };
            barrier.wait();
            fanout.close();
            let handles = subscriber.join().unwrap();

            assert_eq!(fanout.subscriber_count(), 0);
            for h in &handles {
                let t = std::time::Instant::now();
                assert!(h.next_timeout(Duration::from_secs(2)).is_none());
                assert!(t.elapsed() < Duration::from_secs(1), "{:?}", t.elapsed());
                assert!(h.is_closed());
            }
        }
    }

    #[test]
    fn subscribe_after_close_is_closed() {
        let fanout = FanoutDistributor::new(4);
        fanout.close();
        let h = fanout.subscribe("late");
        assert!(h.is_closed());
        assert_eq!(fanout.subscriber_count(), 0);
    }
}
