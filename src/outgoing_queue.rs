use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::stats::EngineStats;

/// Domain equivalence identity of a queued message. Messages whose keys compare equal
///  and allow conflation supersede each other: only the latest buffer is worth sending.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConflationKey {
    pub id: Bytes,
    pub allow_conflation: bool,
}

impl ConflationKey {
    pub fn conflatable(id: impl Into<Bytes>) -> ConflationKey {
        ConflationKey { id: id.into(), allow_conflation: true }
    }

    pub fn non_conflatable(id: impl Into<Bytes>) -> ConflationKey {
        ConflationKey { id: id.into(), allow_conflation: false }
    }
}

/// A keyed queue slot. Conflation swaps the buffer inside the slot rather than moving
///  the slot, so the key keeps its first-insertion position in the FIFO. A slot whose
///  buffer is `None` is a straggler and is skipped on dequeue.
struct ConflatedSlot {
    key: Bytes,
    buffer: Mutex<Option<BytesMut>>,
}

enum QueueEntry {
    Plain(BytesMut),
    Keyed(Arc<ConflatedSlot>),
}

#[derive(Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    Queued,
    /// The pusher drained the queue and exited; an unforced caller should write directly.
    PusherIdle,
    /// Accepting the buffer would exceed the queue's byte ceiling; the caller must treat
    ///  the receiver as slow.
    Overflow,
    /// A slow-receiver disconnect is already underway; the message is dropped.
    DisconnectRequested,
}

struct QueueInner {
    entries: VecDeque<QueueEntry>,
    keyed: FxHashMap<Bytes, Arc<ConflatedSlot>>,
    queued_bytes: u64,
    async_queuing_in_progress: bool,
    disconnect_requested: bool,
}

/// The outbound queue of one connection. All mutation happens under one internal lock;
///  the pusher task and writer tasks coordinate through [`OutgoingQueue::try_start_pusher`] /
///  [`OutgoingQueue::take_from_queue`] and the drain notification.
pub struct OutgoingQueue {
    inner: Mutex<QueueInner>,
    drained: Notify,
    /// adjustable because the initiator adopts the acceptor's value from the handshake
    max_queue_bytes: AtomicU64,
    stats: Arc<EngineStats>,
}

impl OutgoingQueue {
    pub fn new(max_queue_bytes: u64, stats: Arc<EngineStats>) -> OutgoingQueue {
        OutgoingQueue {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                keyed: FxHashMap::default(),
                queued_bytes: 0,
                async_queuing_in_progress: false,
                disconnect_requested: false,
            }),
            drained: Notify::new(),
            max_queue_bytes: AtomicU64::new(max_queue_bytes),
            stats,
        }
    }

    pub fn set_max_queue_bytes(&self, max: u64) {
        self.max_queue_bytes.store(max, Ordering::Relaxed);
    }

    pub fn max_queue_bytes(&self) -> u64 {
        self.max_queue_bytes.load(Ordering::Relaxed)
    }

    /// Append a buffer, conflating against an earlier buffer with the same key where the
    ///  key allows it. With `force` false the call fails with `PusherIdle` when no pusher
    ///  run is active, so the caller falls back to the direct write path.
    pub fn add_to_queue(&self, buffer: &[u8], key: Option<&ConflationKey>, force: bool) -> EnqueueOutcome {
        let new_bytes = buffer.len() as u64;
        let max_queue_bytes = self.max_queue_bytes();
        let mut inner = self.inner.lock().unwrap();

        if inner.disconnect_requested {
            return EnqueueOutcome::DisconnectRequested;
        }
        if !force && !inner.async_queuing_in_progress {
            return EnqueueOutcome::PusherIdle;
        }

        // a live slot for a conflatable key means its bytes get superseded, not added
        let conflation_slot = match key {
            Some(key) if key.allow_conflation => {
                inner.keyed.get(&key.id)
                    .filter(|slot| slot.buffer.lock().unwrap().is_some())
                    .cloned()
            }
            _ => None,
        };
        let superseded_bytes = conflation_slot.as_ref()
            .map(|slot| slot.buffer.lock().unwrap().as_ref().unwrap().len() as u64)
            .unwrap_or(0);

        if inner.queued_bytes - superseded_bytes + new_bytes > max_queue_bytes {
            warn!("queued bytes {} would exceed max of {}",
                  inner.queued_bytes - superseded_bytes + new_bytes, max_queue_bytes);
            self.stats.inc_async_queue_size_exceeded();
            return EnqueueOutcome::Overflow;
        }

        match (key, conflation_slot) {
            (Some(_), Some(slot)) => {
                // supersede in place: the slot keeps its FIFO position, and its buffer
                //  is reused when the capacity suffices
                let mut slot_buffer = slot.buffer.lock().unwrap();
                let old = slot_buffer.as_mut().unwrap();
                old.clear();
                old.put_slice(buffer);
                inner.queued_bytes -= superseded_bytes;
                self.stats.add_async_queue_size(-(superseded_bytes as i64));
                self.stats.inc_async_conflated_msgs();
            }
            (Some(key), None) if key.allow_conflation => {
                let slot = Arc::new(ConflatedSlot {
                    key: key.id.clone(),
                    buffer: Mutex::new(Some(BytesMut::from(buffer))),
                });
                inner.keyed.insert(key.id.clone(), slot.clone());
                inner.entries.push_back(QueueEntry::Keyed(slot));
                self.stats.inc_async_queued_msgs();
            }
            (Some(key), None) => {
                // a non-conflatable update invalidates any pending conflation for its key
                inner.keyed.remove(&key.id);
                inner.entries.push_back(QueueEntry::Plain(BytesMut::from(buffer)));
                self.stats.inc_async_queued_msgs();
            }
            (None, _) => {
                inner.entries.push_back(QueueEntry::Plain(BytesMut::from(buffer)));
                self.stats.inc_async_queued_msgs();
            }
        }

        inner.queued_bytes += new_bytes;
        self.stats.add_async_queue_size(new_bytes as i64);
        EnqueueOutcome::Queued
    }

    /// Pop the next live buffer. Returns `None` when the queue is empty or a disconnect
    ///  is requested - in both cases the pusher run ends and drain waiters are woken.
    pub fn take_from_queue(&self) -> Option<BytesMut> {
        let mut inner = self.inner.lock().unwrap();

        if inner.disconnect_requested {
            inner.async_queuing_in_progress = false;
            self.drained.notify_waiters();
            return None;
        }

        while let Some(entry) = inner.entries.pop_front() {
            let buffer = match entry {
                QueueEntry::Plain(buffer) => Some(buffer),
                QueueEntry::Keyed(slot) => {
                    let buffer = slot.buffer.lock().unwrap().take();
                    if buffer.is_some() {
                        // drop the index entry, but only if it still points at this slot
                        if let Some(current) = inner.keyed.get(&slot.key) {
                            if Arc::ptr_eq(current, &slot) {
                                inner.keyed.remove(&slot.key);
                            }
                        }
                    }
                    buffer
                }
            };

            if let Some(buffer) = buffer {
                inner.queued_bytes -= buffer.len() as u64;
                self.stats.add_async_queue_size(-(buffer.len() as i64));
                self.stats.inc_async_dequeued_msgs();
                return Some(buffer);
            }
            debug!("skipping conflated straggler in outgoing queue");
        }

        inner.async_queuing_in_progress = false;
        self.drained.notify_waiters();
        None
    }

    /// Claim the pusher role. Returns true exactly once per drain cycle; the claimant
    ///  must run the pusher until [`OutgoingQueue::take_from_queue`] returns `None`.
    pub fn try_start_pusher(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.async_queuing_in_progress {
            return false;
        }
        inner.async_queuing_in_progress = true;
        true
    }

    /// End the current pusher run without draining, e.g. when the pusher hits an error
    ///  or the connection closes. Idempotent; wakes drain waiters.
    pub fn end_pusher_run(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.async_queuing_in_progress = false;
        self.drained.notify_waiters();
    }

    pub fn is_queuing_in_progress(&self) -> bool {
        self.inner.lock().unwrap().async_queuing_in_progress
    }

    pub fn queued_bytes(&self) -> u64 {
        self.inner.lock().unwrap().queued_bytes
    }

    pub fn is_disconnect_requested(&self) -> bool {
        self.inner.lock().unwrap().disconnect_requested
    }

    /// Latch the disconnect flag. Returns false if it was already set - only the first
    ///  caller escalates to the membership layer.
    pub fn request_disconnect(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.disconnect_requested {
            return false;
        }
        inner.disconnect_requested = true;
        self.drained.notify_waiters();
        true
    }

    /// Drop all queued buffers by accounting; used by the close cascade.
    pub fn drain_on_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        let dropped = inner.queued_bytes;
        inner.entries.clear();
        inner.keyed.clear();
        inner.queued_bytes = 0;
        self.stats.add_async_queue_size(-(dropped as i64));
        self.drained.notify_waiters();
    }

    /// Wait until no pusher run is active. The notification is armed before the state
    ///  check so a wakeup between the two cannot be lost.
    pub async fn wait_until_drained(&self) {
        loop {
            let mut notified = std::pin::pin!(self.drained.notified());
            notified.as_mut().enable();
            if !self.inner.lock().unwrap().async_queuing_in_progress {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn queue(max: u64) -> OutgoingQueue {
        OutgoingQueue::new(max, Arc::new(EngineStats::default()))
    }

    #[test]
    fn test_unforced_enqueue_requires_active_pusher() {
        let q = queue(1000);
        assert_eq!(q.add_to_queue(b"x", None, false), EnqueueOutcome::PusherIdle);

        assert!(q.try_start_pusher());
        assert_eq!(q.add_to_queue(b"x", None, false), EnqueueOutcome::Queued);
    }

    #[test]
    fn test_fifo_order_and_byte_accounting() {
        let q = queue(1000);
        assert!(q.try_start_pusher());
        q.add_to_queue(b"aaa", None, true);
        q.add_to_queue(b"bb", None, true);
        assert_eq!(q.queued_bytes(), 5);

        assert_eq!(q.take_from_queue().unwrap().as_ref(), b"aaa");
        assert_eq!(q.queued_bytes(), 2);
        assert_eq!(q.take_from_queue().unwrap().as_ref(), b"bb");
        assert_eq!(q.queued_bytes(), 0);
        assert!(q.take_from_queue().is_none());
        assert!(!q.is_queuing_in_progress());
    }

    #[test]
    fn test_conflation_replaces_in_place_and_keeps_position() {
        let stats = Arc::new(EngineStats::default());
        let q = OutgoingQueue::new(1000, stats.clone());
        assert!(q.try_start_pusher());

        let k = ConflationKey::conflatable(&b"K"[..]);
        let l = ConflationKey::conflatable(&b"L"[..]);
        q.add_to_queue(b"k-first", Some(&k), true);
        q.add_to_queue(b"l-value", Some(&l), true);
        for i in 0..9 {
            q.add_to_queue(format!("k-update-{}", i).as_bytes(), Some(&k), true);
        }

        assert_eq!(stats.async_conflated_msgs(), 9);
        assert_eq!(q.queued_bytes(), "k-update-8".len() as u64 + "l-value".len() as u64);

        // K keeps its first-insertion slot, ahead of L
        assert_eq!(q.take_from_queue().unwrap().as_ref(), b"k-update-8");
        assert_eq!(q.take_from_queue().unwrap().as_ref(), b"l-value");
        assert!(q.take_from_queue().is_none());
    }

    #[test]
    fn test_conflated_key_can_be_requeued_after_dequeue() {
        let q = queue(1000);
        assert!(q.try_start_pusher());

        let k = ConflationKey::conflatable(&b"K"[..]);
        q.add_to_queue(b"one", Some(&k), true);
        assert_eq!(q.take_from_queue().unwrap().as_ref(), b"one");

        assert_eq!(q.add_to_queue(b"two", Some(&k), true), EnqueueOutcome::Queued);
        assert_eq!(q.take_from_queue().unwrap().as_ref(), b"two");
    }

    #[test]
    fn test_non_conflatable_key_invalidates_pending_conflation() {
        let q = queue(1000);
        assert!(q.try_start_pusher());

        let id: Bytes = Bytes::from_static(b"K");
        q.add_to_queue(b"old", Some(&ConflationKey::conflatable(id.clone())), true);
        q.add_to_queue(b"barrier", Some(&ConflationKey::non_conflatable(id.clone())), true);
        // after the barrier, the same key starts a fresh slot instead of replacing "old"
        q.add_to_queue(b"new", Some(&ConflationKey::conflatable(id)), true);

        assert_eq!(q.take_from_queue().unwrap().as_ref(), b"old");
        assert_eq!(q.take_from_queue().unwrap().as_ref(), b"barrier");
        assert_eq!(q.take_from_queue().unwrap().as_ref(), b"new");
    }

    #[rstest]
    #[case::first_message_too_big(10, &[11], EnqueueOutcome::Overflow, 0)]
    #[case::second_message_overflows(10, &[6, 5], EnqueueOutcome::Overflow, 6)]
    #[case::exact_fit(10, &[6, 4], EnqueueOutcome::Queued, 10)]
    fn test_overflow(#[case] max: u64, #[case] sizes: &[usize], #[case] expected_last: EnqueueOutcome, #[case] expected_bytes: u64) {
        let q = queue(max);
        assert!(q.try_start_pusher());

        let mut last = EnqueueOutcome::Queued;
        for size in sizes {
            last = q.add_to_queue(vec![0u8; *size].as_slice(), None, true);
        }
        assert_eq!(last, expected_last);
        assert_eq!(q.queued_bytes(), expected_bytes);
    }

    #[test]
    fn test_disconnect_rejects_enqueues_and_ends_pusher_run() {
        let q = queue(1000);
        assert!(q.try_start_pusher());
        q.add_to_queue(b"pending", None, true);

        assert!(q.request_disconnect());
        assert!(!q.request_disconnect());

        assert_eq!(q.add_to_queue(b"late", None, true), EnqueueOutcome::DisconnectRequested);
        assert!(q.take_from_queue().is_none());
        assert!(!q.is_queuing_in_progress());
    }

    #[test]
    fn test_drain_on_close_zeroes_accounting() {
        let q = queue(1000);
        assert!(q.try_start_pusher());
        q.add_to_queue(b"abc", None, true);
        q.add_to_queue(b"defg", Some(&ConflationKey::conflatable(&b"K"[..])), true);

        q.drain_on_close();
        assert_eq!(q.queued_bytes(), 0);
        assert!(q.take_from_queue().is_none());
    }

    #[test]
    fn test_pusher_role_claimed_once_per_cycle() {
        let q = queue(1000);
        assert!(q.try_start_pusher());
        assert!(!q.try_start_pusher());

        // drain ends the cycle, the role becomes claimable again
        assert!(q.take_from_queue().is_none());
        assert!(q.try_start_pusher());
    }

    #[tokio::test]
    async fn test_wait_until_drained_wakes_on_empty_queue() {
        let q = Arc::new(queue(1000));
        assert!(q.try_start_pusher());
        q.add_to_queue(b"pending", None, true);

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait_until_drained().await })
        };

        tokio::task::yield_now().await;
        while q.take_from_queue().is_some() {}

        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("drain waiter should have been woken")
            .unwrap();
    }
}
