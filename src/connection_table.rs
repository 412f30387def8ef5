use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer_pool::BufferPool;
use crate::config::EngineConfig;
use crate::connection::{CloseCaller, CloseOptions, Connection, SenderContext};
use crate::dispatcher::MessageDispatcher;
use crate::error::Result;
use crate::io_filter::configure_acceptor_socket;
use crate::member::MemberId;
use crate::membership::Membership;
use crate::stats::EngineStats;

/// Owner of all connections of this process: it accepts and routes new sockets, hands
///  out (and deduplicates) shared outbound connections, runs the idle reaper, and is the
///  place where the close cascade unregisters connections.
pub struct ConnectionTable {
    config: Arc<EngineConfig>,
    local_member: Mutex<MemberId>,
    membership: Arc<dyn Membership>,
    dispatcher: Arc<dyn MessageDispatcher>,
    stats: Arc<EngineStats>,
    buffer_pool: Arc<BufferPool>,

    /// at most one live shared connection per (remote, preserve_order)
    shared: Mutex<FxHashMap<(MemberId, bool), Arc<Connection>>>,
    thread_owned: Mutex<Vec<Arc<Connection>>>,
    receivers: Mutex<Vec<Arc<Connection>>>,

    /// serializes the create-miss path of shared connections so two tasks dialing the
    ///  same peer cannot both win
    create_lock: AsyncMutex<()>,

    next_id: AtomicU64,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectionTable {
    pub fn new(
        config: EngineConfig,
        membership: Arc<dyn Membership>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Arc<ConnectionTable> {
        let config = Arc::new(config);
        let buffer_pool = Arc::new(BufferPool::new(config.tcp_buffer_size, config.buffer_pool_size));

        Arc::new(ConnectionTable {
            local_member: Mutex::new(MemberId::from(config.bind_addr)),
            membership,
            dispatcher,
            stats: Arc::new(EngineStats::default()),
            buffer_pool,
            shared: Mutex::new(FxHashMap::default()),
            thread_owned: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
            create_lock: AsyncMutex::new(()),
            next_id: AtomicU64::new(1),
            listener_task: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Bind the acceptor socket and start routing inbound connections. Returns the
    ///  actual bound address, which also becomes this member's identity address.
    pub async fn bind_and_listen(self: &Arc<Self>) -> anyhow::Result<SocketAddr> {
        self.config.validate()?;

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("bound p2p acceptor socket to {:?}", local_addr);
        self.local_member.lock().unwrap().socket_addr = local_addr;

        let table = self.clone();
        let handle = tokio::spawn(async move { table.accept_loop(listener).await });
        *self.listener_task.lock().unwrap() = Some(handle);

        Ok(local_addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.closed.load(Ordering::Acquire) {
                        return;
                    }
                    error!("error accepting connection: {}", e);
                    continue;
                }
            };
            if self.closed.load(Ordering::Acquire) {
                return;
            }

            debug!("accepted p2p socket from {:?}", peer_addr);
            if let Err(e) = configure_acceptor_socket(&stream, &self.config) {
                debug!("could not configure accepted socket from {:?}: {}", peer_addr, e);
            }

            let table = self.clone();
            tokio::spawn(async move {
                // the reader task created here keeps the connection alive; it registers
                //  itself as a receiver once the peer's handshake arrives
                if let Err(e) = Connection::create_acceptor(&table, stream).await {
                    debug!("failed to set up accepted connection from {:?}: {}", peer_addr, e);
                }
            });
        }
    }

    /// Get the shared connection for `(remote, preserve_order)`, dialing it if there is
    ///  none. The unordered family is what failure detection rides on; the ordered one
    ///  carries regular traffic.
    pub async fn get_connection(
        self: &Arc<Self>,
        remote: MemberId,
        preserve_order: bool,
        ctx: &SenderContext,
        ack_wait: Duration,
        ack_severe: Duration,
    ) -> Result<Arc<Connection>> {
        let key = (remote, preserve_order);

        if let Some(conn) = self.lookup_live_shared(&key) {
            return Ok(conn);
        }

        let _create_guard = self.create_lock.lock().await;
        if let Some(conn) = self.lookup_live_shared(&key) {
            return Ok(conn);
        }

        let conn = Connection::create_sender(self, remote, preserve_order, true, ctx, ack_wait, ack_severe).await?;
        Ok(conn)
    }

    fn lookup_live_shared(&self, key: &(MemberId, bool)) -> Option<Arc<Connection>> {
        let shared = self.shared.lock().unwrap();
        let conn = shared.get(key)?;
        if conn.is_closing() {
            return None;
        }
        conn.accessed();
        Some(conn.clone())
    }

    /// Dial a connection leased to the calling task, bypassing the shared maps. Used by
    ///  tasks that want to avoid serialization contention on the shared socket.
    pub async fn create_thread_owned_connection(
        self: &Arc<Self>,
        remote: MemberId,
        preserve_order: bool,
        ctx: &SenderContext,
        ack_wait: Duration,
        ack_severe: Duration,
    ) -> Result<Arc<Connection>> {
        Connection::create_sender(self, remote, preserve_order, false, ctx, ack_wait, ack_severe).await
    }

    /// A sender registers only after its handshake completed.
    pub(crate) fn register_sender(self: &Arc<Self>, conn: &Arc<Connection>) {
        if conn.shared_resource() {
            let remote = conn.remote_member()
                .expect("this is a bug: a sender connection must know its remote after the handshake");
            let old = self.shared.lock().unwrap().insert((remote, conn.preserve_order()), conn.clone());
            if let Some(old) = old {
                if !old.is_closing() {
                    warn!("replacing live shared connection {} to {:?}", old.conn_id(), remote);
                }
            }
        }
        else {
            self.thread_owned.lock().unwrap().push(conn.clone());
        }
        self.schedule_idle_task(conn);
    }

    /// A receiver registers before its reader dispatches the first message.
    pub(crate) fn register_receiver(self: &Arc<Self>, conn: &Arc<Connection>) {
        self.receivers.lock().unwrap().push(conn.clone());
        self.schedule_idle_task(conn);
    }

    /// Probe `accessed` once per idle window: a touched connection gets another window,
    ///  an untouched one is closed for reconnect. Shared unordered connections are the
    ///  membership failure-detection channel - they stay quiescent by design and are
    ///  exempt from reaping.
    fn schedule_idle_task(self: &Arc<Self>, conn: &Arc<Connection>) {
        if conn.shared_resource() && !conn.preserve_order() {
            return;
        }
        let idle_timeout = self.config.idle_connection_timeout;
        let conn_for_task = conn.clone();
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(idle_timeout);
            ticks.tick().await; // the first tick fires immediately
            loop {
                ticks.tick().await;
                if conn_for_task.is_closing() {
                    return;
                }
                if !conn_for_task.take_accessed() {
                    debug!("closing idle connection {} shared={} ordered={}",
                           conn_for_task.conn_id(), conn_for_task.shared_resource(), conn_for_task.preserve_order());
                    conn_for_task.close_for_reconnect("idle connection timed out").await;
                    return;
                }
            }
        });
        conn.set_idle_task(task);
    }

    /// Close and drop every connection to the member. `skip` excludes the caller of a
    ///  running close cascade so the cascade does not re-enter itself.
    pub(crate) async fn remove_endpoint(&self, member: &MemberId, reason: &str, skip: Option<&Arc<Connection>>) {
        let mut to_close = Vec::new();

        {
            let mut shared = self.shared.lock().unwrap();
            shared.retain(|(m, _), conn| {
                if m == member {
                    if skip.map(|s| !Arc::ptr_eq(s, conn)).unwrap_or(true) {
                        to_close.push(conn.clone());
                    }
                    false
                }
                else {
                    true
                }
            });
        }
        Self::drain_matching(&self.receivers, member, skip, &mut to_close);
        Self::drain_matching(&self.thread_owned, member, skip, &mut to_close);

        for conn in to_close {
            conn.close(reason, CloseOptions {
                cleanup_endpoint: false,
                remove_endpoint: false,
                being_sick: false,
                force_removal: false,
            }, CloseCaller::Other).await;
        }
    }

    fn drain_matching(
        list: &Mutex<Vec<Arc<Connection>>>,
        member: &MemberId,
        skip: Option<&Arc<Connection>>,
        to_close: &mut Vec<Arc<Connection>>,
    ) {
        list.lock().unwrap().retain(|conn| {
            if conn.remote_member().as_ref() == Some(member) {
                if skip.map(|s| !Arc::ptr_eq(s, conn)).unwrap_or(true) {
                    to_close.push(conn.clone());
                }
                false
            }
            else {
                true
            }
        });
    }

    /// Unregister a single connection from whatever map holds it.
    pub(crate) fn remove_connection(&self, conn: &Arc<Connection>) {
        self.shared.lock().unwrap().retain(|_, c| !Arc::ptr_eq(c, conn));
        self.receivers.lock().unwrap().retain(|c| !Arc::ptr_eq(c, conn));
        self.thread_owned.lock().unwrap().retain(|c| !Arc::ptr_eq(c, conn));
    }

    /// Stop accepting and close everything.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = self.listener_task.lock().unwrap().take() {
            listener.abort();
        }

        let mut all = Vec::new();
        all.extend(self.shared.lock().unwrap().values().cloned());
        all.extend(self.receivers.lock().unwrap().iter().cloned());
        all.extend(self.thread_owned.lock().unwrap().iter().cloned());

        for conn in all {
            conn.close("connection table is closing", CloseOptions {
                cleanup_endpoint: true,
                remove_endpoint: false,
                being_sick: false,
                force_removal: false,
            }, CloseCaller::Other).await;
        }
    }

    // ------------------------------------------------- accessors ------------------

    pub fn local_member(&self) -> MemberId {
        *self.local_member.lock().unwrap()
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.clone()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    pub(crate) fn membership(&self) -> Arc<dyn Membership> {
        self.membership.clone()
    }

    pub(crate) fn dispatcher(&self) -> Arc<dyn MessageDispatcher> {
        self.dispatcher.clone()
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.buffer_pool.clone()
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.lock().unwrap().len()
    }

    pub fn shared_connection_count(&self) -> usize {
        self.shared.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::error::ConnectionError;
    use crate::frame::{prepare_message, MsgType, NO_MSG_ID};
    use crate::membership::MockMembership;
    use crate::outgoing_queue::ConflationKey;
    use async_trait::async_trait;
    use bytes::{BufMut, Bytes, BytesMut};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    /// dispatcher that records every delivered message in order
    #[derive(Default)]
    struct RecordingDispatcher {
        messages: Mutex<Vec<(Bytes, usize, bool)>>,
    }

    impl RecordingDispatcher {
        fn count(&self) -> usize {
            self.messages.lock().unwrap().len()
        }
        fn payloads(&self) -> Vec<Bytes> {
            self.messages.lock().unwrap().iter().map(|(p, _, _)| p.clone()).collect()
        }
    }

    #[async_trait]
    impl MessageDispatcher for RecordingDispatcher {
        async fn message_received(&self, _connection: Arc<Connection>, payload: Bytes, bytes_read: usize, direct_ack: bool) {
            self.messages.lock().unwrap().push((payload, bytes_read, direct_ack));
        }

        fn accepts_direct_ack(&self, _sender: &MemberId) -> bool {
            true
        }
    }

    /// dispatcher that answers every direct-ack message inline on the same connection
    struct ReplyingDispatcher;

    #[async_trait]
    impl MessageDispatcher for ReplyingDispatcher {
        async fn message_received(&self, connection: Arc<Connection>, _payload: Bytes, _bytes_read: usize, direct_ack: bool) {
            if direct_ack {
                let reply = prepare_message(MsgType::Normal, false, NO_MSG_ID, b"ack!");
                connection.send_prepared(reply, None, &connection.reply_context()).await.unwrap();
            }
        }

        fn accepts_direct_ack(&self, _sender: &MemberId) -> bool {
            true
        }
    }

    fn permissive_membership() -> MockMembership {
        let mut membership = MockMembership::new();
        membership.expect_member_exists().return_const(true);
        membership.expect_is_shunned().return_const(false);
        membership.expect_shutdown_in_progress().return_const(false);
        membership.expect_add_surprise_member().return_const(());
        membership.expect_suspect_member().returning(|_, _| {});
        membership.expect_request_member_removal().returning(|_, _| {});
        membership.expect_wait_for_membership_check().returning(|_| true);
        membership
    }

    async fn start_node_with(
        configure: impl FnOnce(&mut EngineConfig),
        membership: MockMembership,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> (Arc<ConnectionTable>, MemberId) {
        let mut config = EngineConfig::new("127.0.0.1:0".parse().unwrap());
        configure(&mut config);
        let table = ConnectionTable::new(config, Arc::new(membership), dispatcher);
        table.bind_and_listen().await.unwrap();
        let member = table.local_member();
        (table, member)
    }

    async fn start_node(
        configure: impl FnOnce(&mut EngineConfig),
    ) -> (Arc<ConnectionTable>, Arc<RecordingDispatcher>, MemberId) {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let (table, member) = start_node_with(configure, permissive_membership(), dispatcher.clone()).await;
        (table, dispatcher, member)
    }

    async fn wait_for(what: &str, cond: impl Fn() -> bool) {
        timeout(Duration::from_secs(10), async {
            loop {
                if cond() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for: {}", what));
    }

    #[tokio::test]
    async fn test_happy_handshake() {
        let (table_b, _disp_b, member_b) = start_node(|c| {
            c.async_distribution_timeout = Duration::from_millis(20);
            c.async_queue_timeout = Duration::from_millis(60_000);
            c.async_max_queue_size_mib = 1;
        })
        .await;
        let (table_a, _disp_a, _member_a) = start_node(|_| {}).await;

        let conn = table_a
            .get_connection(member_b, true, &SenderContext::default(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        // the initiator adopted the acceptor's async parameters from the reply
        assert!(conn.is_handshake_read());
        assert_eq!(conn.async_distribution_timeout(), Duration::from_millis(20));
        assert_eq!(conn.async_queue_timeout(), Duration::from_millis(60_000));
        assert_eq!(conn.queue().max_queue_bytes(), 1024 * 1024);
        assert_eq!(table_a.shared_connection_count(), 1);

        // the acceptor registered a receiver carrying the negotiated flags
        wait_for("receiver registration", || table_b.receiver_count() == 1).await;

        // asking again yields the same shared connection
        let again = table_a
            .get_connection(member_b, true, &SenderContext::default(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&conn, &again));
    }

    #[tokio::test]
    async fn test_version_mismatch_closes_connection() {
        let (_table_b, disp_b, member_b) = start_node(|_| {}).await;

        let mut raw = TcpStream::connect(member_b.socket_addr).await.unwrap();
        let mut frame = BytesMut::new();
        frame.put_u32(6u32 << 24 | 10);
        frame.put_u8(0x4c);
        frame.put_u16(0);
        frame.put_slice(&[0u8; 10]);
        raw.write_all(&frame).await.unwrap();

        // the acceptor must drop the socket without dispatching anything
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(10), raw.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(read, 0);
        assert_eq!(disp_b.count(), 0);
    }

    #[tokio::test]
    async fn test_chunked_message_dispatches_once() {
        let (_table_b, disp_b, member_b) = start_node(|_| {}).await;
        let (table_a, _disp_a, _member_a) = start_node(|_| {}).await;

        let conn = table_a
            .get_connection(member_b, true, &SenderContext::default(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        let ctx = SenderContext::default();
        conn.send_prepared(prepare_message(MsgType::Chunk, false, 42, &[0xAB; 1000]), None, &ctx).await.unwrap();
        conn.send_prepared(prepare_message(MsgType::Chunk, false, 42, &[0xCD; 1000]), None, &ctx).await.unwrap();
        conn.send_prepared(prepare_message(MsgType::EndChunk, false, 42, &[0xEF; 500]), None, &ctx).await.unwrap();

        wait_for("chunked message assembly", || disp_b.count() == 1).await;

        let (payload, bytes_read, direct_ack) = disp_b.messages.lock().unwrap()[0].clone();
        assert_eq!(bytes_read, 2500);
        assert!(!direct_ack);
        assert_eq!(payload.len(), 2500);
        assert!(payload[..1000].iter().all(|b| *b == 0xAB));
        assert!(payload[1000..2000].iter().all(|b| *b == 0xCD));
        assert!(payload[2000..].iter().all(|b| *b == 0xEF));
    }

    #[tokio::test]
    async fn test_forced_queue_conflates_updates() {
        let (_table_b, disp_b, member_b) = start_node(|c| {
            c.async_distribution_timeout = Duration::from_millis(20);
        })
        .await;
        let (table_a, _disp_a, _member_a) = start_node(|c| {
            c.async_distribution_timeout = Duration::from_millis(20);
            c.test_hooks.force_async_queue = true;
        })
        .await;

        let conn = table_a
            .get_connection(member_b, true, &SenderContext::default(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        let ctx = SenderContext::default();
        let key_k = ConflationKey::conflatable(&b"K"[..]);
        let key_l = ConflationKey::conflatable(&b"L"[..]);

        // all sends land in the queue before the pusher gets to run, so the nine updates
        //  of K collapse onto its first-insertion slot
        for i in 0..10 {
            let framed = prepare_message(MsgType::Normal, false, 0, format!("k-update-{}", i).as_bytes());
            conn.send_prepared(framed, Some(&key_k), &ctx).await.unwrap();
        }
        conn.send_prepared(prepare_message(MsgType::Normal, false, 0, b"l-value"), Some(&key_l), &ctx).await.unwrap();

        assert_eq!(table_a.stats().async_conflated_msgs(), 9);

        wait_for("conflated transmission", || disp_b.count() == 2).await;
        let payloads = disp_b.payloads();
        assert_eq!(payloads[0].as_ref(), b"k-update-9");
        assert_eq!(payloads[1].as_ref(), b"l-value");
    }

    #[tokio::test]
    async fn test_slow_receiver_is_asked_to_disconnect() {
        let (_table_b, _disp_b, member_b) = start_node(|c| {
            c.async_distribution_timeout = Duration::from_millis(20);
            c.async_max_queue_size_mib = 1;
        })
        .await;

        let removal_requested = Arc::new(AtomicBool::new(false));
        let removal_reason = Arc::new(Mutex::new(None::<String>));

        let mut membership = MockMembership::new();
        {
            let removal_requested = removal_requested.clone();
            membership.expect_member_exists().returning(move |_| !removal_requested.load(Ordering::SeqCst));
        }
        membership.expect_is_shunned().return_const(false);
        membership.expect_shutdown_in_progress().return_const(false);
        membership.expect_add_surprise_member().return_const(());
        membership.expect_suspect_member().returning(|_, _| {});
        membership.expect_wait_for_membership_check().returning(|_| true);
        {
            let removal_requested = removal_requested.clone();
            let removal_reason = removal_reason.clone();
            membership.expect_request_member_removal().returning(move |_, reason| {
                *removal_reason.lock().unwrap() = Some(reason);
                removal_requested.store(true, Ordering::SeqCst);
            });
        }

        let (table_a, _member_a) = start_node_with(
            |c| {
                c.async_distribution_timeout = Duration::from_millis(20);
                c.test_hooks.force_async_queue = true;
            },
            membership,
            Arc::new(RecordingDispatcher::default()),
        )
        .await;

        let conn = table_a
            .get_connection(member_b, true, &SenderContext::default(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        let ctx = SenderContext::default();
        let mut overflow_error = None;
        for _ in 0..40 {
            let framed = prepare_message(MsgType::Normal, false, 0, &vec![0u8; 64 * 1024]);
            match conn.send_prepared(framed, None, &ctx).await {
                Ok(()) => {}
                Err(e) => {
                    overflow_error = Some(e);
                    break;
                }
            }
        }

        assert!(matches!(overflow_error, Some(ConnectionError::ForcedDisconnect(m)) if m == member_b));
        assert_eq!(removal_reason.lock().unwrap().as_deref(), Some("Disconnected as a slow-receiver"));
        wait_for("slow receiver close", || conn.is_closing()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ack_wait_and_severe_alert() {
        let (_table_b, _disp_b, member_b) = start_node(|_| {}).await;

        let suspect_count = Arc::new(AtomicUsize::new(0));
        let mut membership = MockMembership::new();
        membership.expect_member_exists().return_const(true);
        membership.expect_is_shunned().return_const(false);
        membership.expect_shutdown_in_progress().return_const(false);
        membership.expect_add_surprise_member().return_const(());
        membership.expect_request_member_removal().returning(|_, _| {});
        membership.expect_wait_for_membership_check().returning(|_| true);
        {
            let suspect_count = suspect_count.clone();
            membership.expect_suspect_member().returning(move |_, _| {
                suspect_count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (table_a, _member_a) = start_node_with(|_| {}, membership, Arc::new(RecordingDispatcher::default())).await;

        let conn1 = table_a
            .get_connection(member_b, true, &SenderContext::default(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();
        let conn2 = table_a
            .get_connection(member_b, false, &SenderContext::default(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        let ack_wait = Duration::from_millis(300);
        let ack_severe = Duration::from_millis(600);
        let group = vec![conn1.clone(), conn2.clone()];
        conn2.set_in_use(true, ack_wait, ack_severe, group.clone());
        conn1.set_in_use(true, ack_wait, ack_severe, group);

        // simulate a send whose reply never arrives
        conn1.set_state(ConnectionState::Sending);

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(suspect_count.load(Ordering::SeqCst), 1);
        assert!(conn1.ack_tracking().has_ack_timed_out());

        let sibling_start_before = conn2.ack_tracking().transmission_start();
        tokio::time::sleep(Duration::from_millis(900)).await;

        // the severe alert fired and pushed the sibling's clock forward so the group
        //  does not alert in lockstep
        assert_eq!(conn2.ack_tracking().transmission_start(), sibling_start_before + ack_severe);
        assert_eq!(suspect_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_direct_ack_round_trip() {
        let (_table_b, member_b) = start_node_with(|_| {}, permissive_membership(), Arc::new(ReplyingDispatcher)).await;
        let (table_a, _disp_a, _member_a) = start_node(|_| {}).await;

        let conn = table_a
            .get_connection(member_b, true, &SenderContext::default(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        conn.set_in_use(true, Duration::ZERO, Duration::ZERO, vec![]);
        let framed = prepare_message(MsgType::Normal, true, NO_MSG_ID, b"ping");
        conn.send_prepared(framed, None, &SenderContext::default()).await.unwrap();

        let ack = conn.read_ack(Duration::from_secs(10)).await.unwrap();
        assert_eq!(ack.as_ref(), b"ack!");
        assert_eq!(conn.state(), ConnectionState::ReceivedAck);

        conn.set_in_use(false, Duration::ZERO, Duration::ZERO, vec![]);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (_table_b, _disp_b, member_b) = start_node(|_| {}).await;
        let (table_a, _disp_a, _member_a) = start_node(|_| {}).await;

        let conn = table_a
            .get_connection(member_b, true, &SenderContext::default(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        conn.request_close("test shutdown").await;

        let err = conn
            .send_prepared(prepare_message(MsgType::Normal, false, 0, b"late"), None, &SenderContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Closing { .. }));
        assert_eq!(table_a.shared_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_connection_is_reaped() {
        let (_table_b, _disp_b, member_b) = start_node(|_| {}).await;
        let (table_a, _disp_a, _member_a) = start_node(|c| {
            c.idle_connection_timeout = Duration::from_millis(100);
        })
        .await;

        let conn = table_a
            .get_connection(member_b, true, &SenderContext::default(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        wait_for("idle reaping", || conn.is_closing()).await;
        assert_eq!(table_a.shared_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shared_unordered_connection_is_exempt_from_reaping() {
        let (_table_b, _disp_b, member_b) = start_node(|_| {}).await;
        let (table_a, _disp_a, _member_a) = start_node(|c| {
            c.idle_connection_timeout = Duration::from_millis(100);
        })
        .await;

        let conn = table_a
            .get_connection(member_b, false, &SenderContext::default(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!conn.is_closing());
    }
}
