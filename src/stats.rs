use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters fed by the engine. All methods are cheap and callable from any task; a
///  metrics exporter polls the getters at its own pace.
#[derive(Default)]
pub struct EngineStats {
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
    received_messages: AtomicU64,
    received_bytes: AtomicU64,

    async_queued_msgs: AtomicU64,
    async_dequeued_msgs: AtomicU64,
    async_conflated_msgs: AtomicU64,
    /// live byte count, so it moves both ways
    async_queue_size: AtomicI64,
    async_queue_size_exceeded: AtomicU64,
    async_distribution_timeout_exceeded: AtomicU64,

    failed_connects: AtomicU64,
    reconnect_attempts: AtomicU64,
    thread_owned_receivers: AtomicU64,
}

impl EngineStats {
    pub fn inc_sent_messages(&self, bytes: u64) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn inc_received_messages(&self, bytes: u64) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_async_queued_msgs(&self) {
        self.async_queued_msgs.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_async_dequeued_msgs(&self) {
        self.async_dequeued_msgs.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_async_conflated_msgs(&self) {
        self.async_conflated_msgs.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_async_queue_size(&self, delta: i64) {
        self.async_queue_size.fetch_add(delta, Ordering::Relaxed);
    }
    pub fn inc_async_queue_size_exceeded(&self) {
        self.async_queue_size_exceeded.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_async_distribution_timeout_exceeded(&self) {
        self.async_distribution_timeout_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_connects(&self) {
        self.failed_connects.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_thread_owned_receivers(&self) {
        self.thread_owned_receivers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent_messages(&self) -> u64 {
        self.sent_messages.load(Ordering::Relaxed)
    }
    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }
    pub fn received_messages(&self) -> u64 {
        self.received_messages.load(Ordering::Relaxed)
    }
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }
    pub fn async_queued_msgs(&self) -> u64 {
        self.async_queued_msgs.load(Ordering::Relaxed)
    }
    pub fn async_dequeued_msgs(&self) -> u64 {
        self.async_dequeued_msgs.load(Ordering::Relaxed)
    }
    pub fn async_conflated_msgs(&self) -> u64 {
        self.async_conflated_msgs.load(Ordering::Relaxed)
    }
    pub fn async_queue_size(&self) -> i64 {
        self.async_queue_size.load(Ordering::Relaxed)
    }
    pub fn async_queue_size_exceeded(&self) -> u64 {
        self.async_queue_size_exceeded.load(Ordering::Relaxed)
    }
    pub fn async_distribution_timeout_exceeded(&self) -> u64 {
        self.async_distribution_timeout_exceeded.load(Ordering::Relaxed)
    }
    pub fn failed_connects(&self) -> u64 {
        self.failed_connects.load(Ordering::Relaxed)
    }
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }
    pub fn thread_owned_receivers(&self) -> u64 {
        self.thread_owned_receivers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_size_moves_both_ways() {
        let stats = EngineStats::default();
        stats.add_async_queue_size(1000);
        stats.add_async_queue_size(-400);
        assert_eq!(stats.async_queue_size(), 600);
    }

    #[test]
    fn test_message_counters_track_bytes() {
        let stats = EngineStats::default();
        stats.inc_sent_messages(100);
        stats.inc_sent_messages(50);
        stats.inc_received_messages(7);
        assert_eq!(stats.sent_messages(), 2);
        assert_eq!(stats.sent_bytes(), 150);
        assert_eq!(stats.received_messages(), 1);
        assert_eq!(stats.received_bytes(), 7);
    }
}
