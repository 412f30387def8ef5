use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;

use crate::io_filter::TlsContext;

/// Engine-wide configuration, fixed at construction time. There is deliberately no
///  process-wide mutable state in this crate - everything tunable travels in this record,
///  and test-only switches live in [`TestHooks`] so they cannot be mistaken for product
///  configuration.
pub struct EngineConfig {
    /// address the acceptor listens on; also the address part of the local member id
    pub bind_addr: SocketAddr,

    /// Default socket send/receive buffer size and the size of pooled input buffers.
    ///
    /// The side of a connection that mostly reads gets this as its receive buffer while
    ///  its send buffer is shrunk to [`EngineConfig::small_buffer_size`], and vice versa
    ///  for the sending side - acks are small, so the OS memory is better spent on the
    ///  dominant direction.
    pub tcp_buffer_size: usize,

    /// Receive-side send buffer / send-side receive buffer, see above.
    pub small_buffer_size: usize,

    /// Input buffers pooled at a given time; buffers in excess of this number are
    ///  discarded when they are returned.
    pub buffer_pool_size: usize,

    /// Baseline for failure detection; `connect_timeout` defaults to six times this.
    pub member_timeout: Duration,

    /// Bound on a single TCP connect attempt to a peer.
    pub connect_timeout: Duration,

    /// Bound on waiting for the peer's half of the handshake.
    pub handshake_timeout: Duration,

    /// Permits of the per-connection sender semaphore. Caps how many application tasks
    ///  can pile onto one socket's serialization path; reader tasks bypass the semaphore
    ///  so acks always make progress.
    pub max_connection_senders: usize,

    /// Maximum time a writer may spin on a non-draining socket before handing the
    ///  remainder to the background queue. Zero disables the async-queued mode entirely,
    ///  making every write synchronous.
    pub async_distribution_timeout: Duration,

    /// Maximum time the queue pusher may sit on an undrained queue before the receiver
    ///  is declared slow and handed to the membership layer for removal.
    pub async_queue_timeout: Duration,

    /// Backpressure ceiling for queued bytes, in MiB (scaled via [`EngineConfig::async_max_queue_bytes`]).
    pub async_max_queue_size_mib: u32,

    /// After this much time waiting for a direct ack the peer is suspected. Zero disables
    ///  ack monitoring.
    pub ack_wait_threshold: Duration,

    /// Additional time after `ack_wait_threshold` before the alert escalates to fatal.
    ///  Zero disables severe-alert processing (and with it the suspect call on plain
    ///  ack-wait expiry).
    pub ack_severe_alert_threshold: Duration,

    /// Connections unused for this long are closed for reconnect. Shared unordered
    ///  connections are exempt - they are the membership failure-detection channel and
    ///  quiescence is their normal state.
    pub idle_connection_timeout: Duration,

    /// Backoff between sender-side connect retries.
    pub reconnect_wait_time: Duration,

    /// When set, the acceptor withholds its handshake reply until the membership layer
    ///  confirms the remote has cleared the membership check.
    pub secure_handshake: bool,

    /// TLS configuration; `None` runs the plain filter.
    pub tls: Option<Arc<TlsContext>>,

    /// Ordinal of the product version spoken by this process, exchanged in the handshake.
    pub product_version_ordinal: u16,

    pub test_hooks: TestHooks,
}

/// Switches that only test code should ever flip.
#[derive(Clone, Copy, Default)]
pub struct TestHooks {
    /// Skip the direct-write attempt and enqueue immediately, as if the socket had
    ///  blocked past the distribution timeout.
    pub force_async_queue: bool,

    /// Close sockets inline instead of on a background task, so tests observe the close
    ///  synchronously ("sick" mode).
    pub inline_close: bool,
}

impl EngineConfig {
    pub fn new(bind_addr: SocketAddr) -> EngineConfig {
        let member_timeout = Duration::from_secs(5);

        EngineConfig {
            bind_addr,
            tcp_buffer_size: 32 * 1024,
            small_buffer_size: 4096,
            buffer_pool_size: 1024,
            member_timeout,
            connect_timeout: member_timeout * 6,
            handshake_timeout: Duration::from_millis(59_000),
            max_connection_senders: 8,
            async_distribution_timeout: Duration::ZERO,
            async_queue_timeout: Duration::from_secs(60),
            async_max_queue_size_mib: 8,
            ack_wait_threshold: Duration::ZERO,
            ack_severe_alert_threshold: Duration::ZERO,
            idle_connection_timeout: Duration::from_millis(59_000),
            reconnect_wait_time: Duration::from_millis(2000),
            secure_handshake: false,
            tls: None,
            product_version_ordinal: 1,
            test_hooks: TestHooks::default(),
        }
    }

    pub fn async_max_queue_bytes(&self) -> u64 {
        self.async_max_queue_size_mib as u64 * 1024 * 1024
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tcp_buffer_size < crate::frame::MSG_HEADER_BYTES {
            bail!("tcp buffer size must hold at least a message header");
        }
        if self.small_buffer_size == 0 {
            bail!("small buffer size must be positive");
        }
        if self.max_connection_senders == 0 {
            bail!("at least one sender permit is required");
        }
        if self.async_distribution_timeout > Duration::ZERO && self.async_max_queue_size_mib == 0 {
            bail!("async queueing requires a positive max queue size");
        }
        if self.idle_connection_timeout.is_zero() {
            bail!("idle connection timeout must be positive");
        }
        Ok(())
    }
}
