use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::ack_monitor::{self, AckTracking};
use crate::config::EngineConfig;
use crate::connection_table::ConnectionTable;
use crate::dispatcher::MessageDispatcher;
use crate::error::{is_ignorable_io_error, ConnectionError, Result};
use crate::frame::{prepare_message, MsgType, NO_MSG_ID};
use crate::handshake::{HandshakeReply, HandshakeRequest};
use crate::io_filter::{configure_initiator_socket, FilterReader, FilterStream, FilterWriter};
use crate::member::MemberId;
use crate::membership::Membership;
use crate::outgoing_queue::{ConflationKey, EnqueueOutcome, OutgoingQueue};
use crate::reader::{self, MsgReader};
use crate::stats::EngineStats;

#[cfg(unix)]
type RawSocketFd = std::os::unix::io::RawFd;
#[cfg(not(unix))]
type RawSocketFd = i32;

fn raw_fd_of(stream: &TcpStream) -> RawSocketFd {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        stream.as_raw_fd()
    }
    #[cfg(not(unix))]
    {
        let _ = stream;
        -1
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionKind {
    /// dialed the peer; mostly writes, reads only the handshake reply and direct acks
    Initiator,
    /// accepted from the peer; mostly reads, writes only handshake and direct-ack replies
    Acceptor,
}

/// Guarded by `state` below. The reader toggles `Reading`/`Idle` around every read so a
///  close can tell whether it has to interrupt a blocked reader, and the ack monitor
///  only counts time spent in `Sending`/`ReadingAck` against the thresholds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Sending,
    PostSending,
    ReadingAck,
    ReceivedAck,
    Reading,
}

/// Context of the task entering the engine for a send. This replaces implicit
///  thread-local state: reader tasks mark themselves so acks bypass the sender
///  semaphore, and the domino count travels with the context into handshakes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderContext {
    pub is_reader: bool,
    pub domino_count: u32,
    /// set when the caller already holds a send permit on this connection (chained
    ///  sends); the semaphore is not acquired again
    pub holds_permit: bool,
}

impl SenderContext {
    pub fn reader(domino_count: u32) -> SenderContext {
        SenderContext { is_reader: true, domino_count, holds_permit: false }
    }

    /// The domino rule: a reader serving a thread-owned connection answers on
    ///  thread-owned sockets itself, but once the chain is two hops deep it reverts to
    ///  shared ones instead of fanning out further.
    pub fn prefers_thread_owned_sockets(&self) -> bool {
        self.is_reader && self.domino_count == 1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CloseOptions {
    /// remove this connection from the table's maps
    pub cleanup_endpoint: bool,
    /// also close sibling connections to the same member
    pub remove_endpoint: bool,
    /// close the socket inline instead of on a background task
    pub being_sick: bool,
    /// run the removal bookkeeping even if the connection is already closing
    pub force_removal: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum CloseCaller {
    Reader,
    Pusher,
    Other,
}

#[derive(Default)]
struct HandshakeProgress {
    read: bool,
    cancelled: bool,
}

struct AsyncParams {
    distribution_timeout: Duration,
    queue_timeout: Duration,
}

/// A socket holder that sends and receives framed messages. A Connection may be closed
///  to preserve system resources and is re-dialed by the table when needed again.
pub struct Connection {
    kind: ConnectionKind,
    conn_id: u64,
    local_member: MemberId,

    shared_resource: AtomicBool,
    preserve_order: AtomicBool,
    /// assigned by the initiator, learned from the handshake by the acceptor
    unique_id: AtomicU64,
    remote: Mutex<Option<MemberId>>,
    remote_version_ordinal: AtomicU16,
    domino_number: AtomicU32,

    config: Arc<EngineConfig>,
    stats: Arc<EngineStats>,
    membership: Arc<dyn Membership>,
    dispatcher: Arc<dyn MessageDispatcher>,
    table: Weak<ConnectionTable>,

    closing: AtomicBool,
    stopped: AtomicBool,
    connected: AtomicBool,
    /// woken on close so a reader blocked in a read can unwind
    close_signal: Notify,

    state: Mutex<ConnectionState>,

    handshake: Mutex<HandshakeProgress>,
    handshake_notify: Notify,

    async_params: Mutex<AsyncParams>,

    /// the out-lock: held for the entire serialize+write of one message, which is what
    ///  makes synchronous sends on an ordered connection serialized
    out_writer: AsyncMutex<Option<FilterWriter>>,
    send_permits: Arc<Semaphore>,

    reader_task: Mutex<Option<JoinHandle<()>>>,
    /// on an initiator, the read half comes back here when the handshake reader exits,
    ///  and direct-ack replies are read from it under this lock
    ack_reader: AsyncMutex<Option<MsgReader>>,

    outgoing_queue: OutgoingQueue,
    pusher_task: Mutex<Option<JoinHandle<()>>>,

    ack: AckTracking,

    accessed: AtomicBool,
    idle_task: Mutex<Option<JoinHandle<()>>>,

    raw_fd: RawSocketFd,
}

impl Connection {
    fn new(
        kind: ConnectionKind,
        table: &Arc<ConnectionTable>,
        remote: Option<MemberId>,
        preserve_order: bool,
        shared_resource: bool,
        write_half: FilterWriter,
        raw_fd: RawSocketFd,
    ) -> Connection {
        let config = table.config();
        Connection {
            kind,
            conn_id: table.next_connection_id(),
            local_member: table.local_member(),
            shared_resource: AtomicBool::new(shared_resource),
            preserve_order: AtomicBool::new(preserve_order),
            unique_id: AtomicU64::new(0),
            remote: Mutex::new(remote),
            remote_version_ordinal: AtomicU16::new(0),
            domino_number: AtomicU32::new(0),
            stats: table.stats(),
            membership: table.membership(),
            dispatcher: table.dispatcher(),
            table: Arc::downgrade(table),
            closing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            close_signal: Notify::new(),
            state: Mutex::new(ConnectionState::Idle),
            handshake: Mutex::new(HandshakeProgress::default()),
            handshake_notify: Notify::new(),
            async_params: Mutex::new(AsyncParams {
                distribution_timeout: config.async_distribution_timeout,
                queue_timeout: config.async_queue_timeout,
            }),
            out_writer: AsyncMutex::new(Some(write_half)),
            send_permits: Arc::new(Semaphore::new(config.max_connection_senders)),
            reader_task: Mutex::new(None),
            ack_reader: AsyncMutex::new(None),
            outgoing_queue: OutgoingQueue::new(config.async_max_queue_bytes(), table.stats()),
            pusher_task: Mutex::new(None),
            ack: AckTracking::default(),
            accessed: AtomicBool::new(true),
            idle_task: Mutex::new(None),
            raw_fd,
            config,
        }
    }

    /// Dial the peer once and spawn the handshake reader. The caller drives the
    ///  handshake afterwards; retrying across attempts is [`Connection::create_sender`]'s job.
    async fn connect(
        table: &Arc<ConnectionTable>,
        remote: MemberId,
        preserve_order: bool,
        shared_resource: bool,
    ) -> Result<Arc<Connection>> {
        let config = table.config();

        let stream = timeout(config.connect_timeout, TcpStream::connect(remote.socket_addr))
            .await
            .map_err(|_| ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {:?} timed out", remote))))??;
        configure_initiator_socket(&stream, &config)?;
        let raw_fd = raw_fd_of(&stream);

        let filter = FilterStream::wrap_initiator(stream, config.tls.as_deref(), remote.socket_addr.ip()).await?;
        let (read_half, write_half) = filter.split();

        let conn = Arc::new(Connection::new(
            ConnectionKind::Initiator,
            table,
            Some(remote),
            preserve_order,
            shared_resource,
            write_half,
            raw_fd,
        ));
        conn.unique_id.store(conn.conn_id, Ordering::Relaxed);
        conn.spawn_reader(read_half);
        Ok(conn)
    }

    /// Wrap an accepted socket. The connection starts out anonymous - identity, sharing
    ///  and ordering flags arrive with the peer's handshake, which the spawned reader
    ///  processes.
    pub(crate) async fn create_acceptor(table: &Arc<ConnectionTable>, stream: TcpStream) -> Result<Arc<Connection>> {
        let config = table.config();
        let raw_fd = raw_fd_of(&stream);

        let filter = FilterStream::wrap_acceptor(stream, config.tls.as_deref()).await?;
        let (read_half, write_half) = filter.split();

        let conn = Arc::new(Connection::new(
            ConnectionKind::Acceptor,
            table,
            None,
            true,
            true,
            write_half,
            raw_fd,
        ));
        conn.spawn_reader(read_half);
        Ok(conn)
    }

    /// Create a connection to a remote peer, retrying while the member is still in the
    ///  view. Mirrors the failure-detection behavior of a send: while connecting takes
    ///  longer than `ack_wait` the peer is suspected, and past `ack_wait + ack_severe` a
    ///  severe alert is logged. Handshake-level failures are surfaced to the caller
    ///  instead of being retried - the peer answered, so re-dialing cannot help.
    pub async fn create_sender(
        table: &Arc<ConnectionTable>,
        remote: MemberId,
        preserve_order: bool,
        shared_resource: bool,
        ctx: &SenderContext,
        ack_wait: Duration,
        ack_severe: Duration,
    ) -> Result<Arc<Connection>> {
        let membership = table.membership();
        let config = table.config();
        let start = Instant::now();

        let mut first_time = true;
        let mut suspected = false;
        let mut severe_alert_issued = false;
        let mut warning_printed = false;
        let mut connection_error_logged = false;

        loop {
            if membership.shutdown_in_progress() {
                return Err(ConnectionError::ShutdownInProgress);
            }

            if !severe_alert_issued && !ack_severe.is_zero() && !ack_wait.is_zero() && start.elapsed() > ack_wait {
                if start.elapsed() > ack_wait + ack_severe {
                    error!("unable to form a TCP/IP connection to {:?} in over {:?}", remote, ack_wait + ack_severe);
                    severe_alert_issued = true;
                }
                else if !suspected {
                    warn!("unable to form a TCP/IP connection to {:?} in over {:?}", remote, ack_wait);
                    membership.suspect_member(remote,
                        "unable to form a TCP/IP connection in a reasonable amount of time".to_string()).await;
                    suspected = true;
                }
            }
            else if !suspected && !ack_wait.is_zero() && start.elapsed() > ack_wait {
                membership.suspect_member(remote,
                    "unable to form a TCP/IP connection in a reasonable amount of time".to_string()).await;
                suspected = true;
            }

            if first_time {
                first_time = false;
                if give_up_on_member(membership.as_ref(), &remote) {
                    return Err(ConnectionError::MemberLeft(remote));
                }
            }
            else {
                tokio::time::sleep(config.reconnect_wait_time).await;
                if give_up_on_member(membership.as_ref(), &remote) {
                    return Err(ConnectionError::MemberLeft(remote));
                }
                if !warning_printed {
                    warning_printed = true;
                    warn!("attempting reconnect to peer {:?}", remote);
                }
                table.stats().inc_reconnect_attempts();
            }

            let conn = match Connection::connect(table, remote, preserve_order, shared_resource).await {
                Ok(conn) => conn,
                Err(e) => {
                    table.stats().inc_failed_connects();
                    if give_up_on_member(membership.as_ref(), &remote) {
                        return Err(e);
                    }
                    if !connection_error_logged {
                        connection_error_logged = true;
                        info!("connection: shared={} ordered={} failed to connect to peer {:?} because: {}",
                              shared_resource, preserve_order, remote, e);
                    }
                    continue;
                }
            };

            match conn.attempt_handshake(ctx).await {
                Ok(()) => {
                    table.register_sender(&conn);
                    return Ok(conn);
                }
                Err(e) => {
                    conn.request_close(&format!("handshake failed: {}", e)).await;
                    return Err(e);
                }
            }
        }
    }

    // ------------------------------------------------- handshake ------------------

    pub(crate) async fn attempt_handshake(self: &Arc<Self>, ctx: &SenderContext) -> Result<()> {
        debug!("starting peer-to-peer handshake on connection {}", self.conn_id);
        self.send_handshake_request(ctx).await?;
        self.wait_for_handshake().await
    }

    async fn send_handshake_request(&self, ctx: &SenderContext) -> Result<()> {
        let request = HandshakeRequest {
            member: self.local_member,
            shared_resource: self.shared_resource.load(Ordering::Relaxed),
            preserve_order: self.preserve_order.load(Ordering::Relaxed),
            unique_id: self.unique_id.load(Ordering::Relaxed),
            version_ordinal: self.config.product_version_ordinal,
            domino_count: ctx.domino_count + 1,
        };
        let mut payload = BytesMut::new();
        request.ser(&mut payload);

        let framed = prepare_message(MsgType::Normal, false, NO_MSG_ID, &payload);
        self.write_sync(&framed).await
    }

    pub(crate) async fn send_handshake_reply(&self) -> Result<()> {
        let reply = HandshakeReply::OkWithAsyncInfo {
            async_distribution_timeout_ms: self.config.async_distribution_timeout.as_millis() as u32,
            async_queue_timeout_ms: self.config.async_queue_timeout.as_millis() as u32,
            async_max_queue_size_mib: self.config.async_max_queue_size_mib,
            version_ordinal: self.config.product_version_ordinal,
        };
        let mut payload = BytesMut::new();
        reply.ser(&mut payload);

        let framed = prepare_message(MsgType::Normal, false, NO_MSG_ID, &payload);
        self.write_sync(&framed).await
    }

    async fn wait_for_handshake(self: &Arc<Self>) -> Result<()> {
        let wait = async {
            loop {
                // register with the notifier before checking state, otherwise a
                //  notification arriving in between is lost
                let mut notified = std::pin::pin!(self.handshake_notify.notified());
                notified.as_mut().enable();
                {
                    let hs = self.handshake.lock().unwrap();
                    if hs.read {
                        return Ok(());
                    }
                    if hs.cancelled {
                        return Err(ConnectionError::HandshakeCancelled(
                            "connection closed before the handshake completed".to_string()));
                    }
                }
                notified.await;
            }
        };

        match timeout(self.config.handshake_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(remote) = self.remote_member() {
                    self.membership.suspect_member(remote,
                        "peer did not answer the connection handshake".to_string()).await;
                }
                self.request_close("handshake timed out").await;
                Err(ConnectionError::HandshakeTimeout(self.config.handshake_timeout))
            }
        }
    }

    /// Wake the handshake waiter with the outcome. `read` and `cancelled` are mutually
    ///  exclusive: the first notification wins, later ones are ignored.
    pub(crate) fn notify_handshake_waiter(&self, success: bool) {
        {
            let mut hs = self.handshake.lock().unwrap();
            if hs.read || hs.cancelled {
                return;
            }
            if success {
                hs.read = true;
            }
            else {
                hs.cancelled = true;
            }
        }
        self.handshake_notify.notify_waiters();
    }

    pub fn is_handshake_read(&self) -> bool {
        self.handshake.lock().unwrap().read
    }

    /// Acceptor side: adopt identity and discipline flags from the peer's handshake.
    ///  Shared connections force the domino number to zero - domino propagation only
    ///  applies to thread-owned sockets.
    pub(crate) fn record_remote_handshake(&self, request: &HandshakeRequest) {
        *self.remote.lock().unwrap() = Some(request.member);
        self.shared_resource.store(request.shared_resource, Ordering::Relaxed);
        self.preserve_order.store(request.preserve_order, Ordering::Relaxed);
        self.unique_id.store(request.unique_id, Ordering::Relaxed);
        self.remote_version_ordinal.store(request.version_ordinal, Ordering::Relaxed);

        let domino = if request.shared_resource { 0 } else { request.domino_count };
        self.domino_number.store(domino, Ordering::Relaxed);

        if !request.shared_resource {
            self.stats.inc_thread_owned_receivers();
            // direct-ack replies on a thread-owned socket can be large
            self.grow_send_buffer();
            debug!("thread-owned receiver with domino count {} will prefer thread-owned sockets for replies", domino);
        }
    }

    /// Initiator side: adopt the receiver's async-queueing parameters from its reply.
    pub(crate) fn apply_async_info(&self, dist_ms: u32, queue_ms: u32, max_mib: u32, version_ordinal: u16) {
        {
            let mut params = self.async_params.lock().unwrap();
            params.distribution_timeout = Duration::from_millis(dist_ms as u64);
            params.queue_timeout = Duration::from_millis(queue_ms as u64);
        }
        self.outgoing_queue.set_max_queue_bytes(max_mib as u64 * 1024 * 1024);
        self.remote_version_ordinal.store(version_ordinal, Ordering::Relaxed);
    }

    fn grow_send_buffer(&self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::BorrowedFd;
            // the fd is owned by this connection's stream halves for as long as the
            //  connection lives, so the borrow is valid here
            let fd = unsafe { BorrowedFd::borrow_raw(self.raw_fd) };
            if let Err(e) = socket2::SockRef::from(&fd).set_send_buffer_size(self.config.tcp_buffer_size) {
                debug!("could not resize send buffer: {}", e);
            }
        }
        #[cfg(not(unix))]
        {
            trace!("send buffer resizing is not supported on this platform");
        }
    }

    // ------------------------------------------------- send paths -----------------

    /// Send a fully framed message buffer. Sync and async mode selection follows the
    ///  connection's discipline; when a pusher is already draining this connection the
    ///  buffer is appended to its queue instead.
    pub async fn send_prepared(self: &Arc<Self>, buffer: BytesMut, key: Option<&ConflationKey>, ctx: &SenderContext) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) || self.closing.load(Ordering::Acquire) {
            return Err(self.closing_error("connection is closing"));
        }

        let _permit = self.acquire_send_permission(ctx).await?;

        let track_state = self.ack.is_socket_in_use();
        if track_state {
            self.set_state(ConnectionState::Sending);
        }

        let len = buffer.len() as u64;
        let result = self.do_send(buffer, key).await;

        if track_state {
            self.set_state(ConnectionState::PostSending);
        }
        if result.is_ok() {
            self.stats.inc_sent_messages(len);
            self.accessed();
        }
        result
    }

    async fn do_send(self: &Arc<Self>, buffer: BytesMut, key: Option<&ConflationKey>) -> Result<()> {
        let force_async = self.config.test_hooks.force_async_queue;

        if self.outgoing_queue.is_queuing_in_progress() || force_async {
            match self.outgoing_queue.add_to_queue(&buffer, key, force_async) {
                EnqueueOutcome::Queued => {
                    self.ensure_pusher_running();
                    return Ok(());
                }
                EnqueueOutcome::PusherIdle => {
                    // the pusher drained the queue in the meantime; write directly
                }
                EnqueueOutcome::Overflow => {
                    self.disconnect_slow_receiver().await;
                    return Err(self.forced_disconnect_error());
                }
                EnqueueOutcome::DisconnectRequested => {
                    return Err(self.forced_disconnect_error());
                }
            }
        }

        let async_mode = self.kind == ConnectionKind::Initiator
            && self.preserve_order.load(Ordering::Relaxed)
            && !self.async_params.lock().unwrap().distribution_timeout.is_zero();

        if async_mode {
            self.write_async(buffer, key).await
        }
        else {
            self.write_sync(&buffer).await
        }
    }

    /// Blocking write under the out-lock: the whole message goes out before the lock is
    ///  released, so concurrent senders on an ordered connection serialize here.
    async fn write_sync(&self, buffer: &[u8]) -> Result<()> {
        let mut guard = self.out_writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closing_error("socket already closed"))?;
        writer.write_all(buffer).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Bounded-time write: each attempt is capped by an exponentially growing backoff
    ///  (1,2,4,..,32 ms); once the distribution timeout is crossed the remainder goes to
    ///  the queue and a pusher takes over. A partially written message must never be
    ///  conflated away - its remaining bytes are what keeps the stream parseable.
    async fn write_async(self: &Arc<Self>, buffer: BytesMut, key: Option<&ConflationKey>) -> Result<()> {
        let distribution_timeout = self.async_params.lock().unwrap().distribution_timeout;
        let start = Instant::now();
        let mut backoff = Duration::from_millis(1);
        let mut offset = 0usize;

        let mut guard = self.out_writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closing_error("socket already closed"))?;

        while offset < buffer.len() {
            match timeout(backoff, writer.write(&buffer[offset..])).await {
                Ok(Ok(0)) => {
                    return Err(ConnectionError::Io(std::io::ErrorKind::WriteZero.into()));
                }
                Ok(Ok(n)) => {
                    offset += n;
                    backoff = Duration::from_millis(1);
                }
                Ok(Err(e)) => {
                    return Err(e.into());
                }
                Err(_not_draining) => {
                    if start.elapsed() >= distribution_timeout {
                        self.stats.inc_async_distribution_timeout_exceeded();
                        debug!("socket for {:?} not draining, switching to queued mode", self.remote_member());
                        let remainder_key = if offset == 0 { key } else { None };
                        drop(guard);
                        return self.force_queuing(&buffer[offset..], remainder_key).await;
                    }
                    backoff = (backoff * 2).min(Duration::from_millis(32));
                }
            }
        }
        writer.flush().await?;
        Ok(())
    }

    async fn force_queuing(self: &Arc<Self>, remainder: &[u8], key: Option<&ConflationKey>) -> Result<()> {
        match self.outgoing_queue.add_to_queue(remainder, key, true) {
            EnqueueOutcome::Queued | EnqueueOutcome::PusherIdle => {
                self.ensure_pusher_running();
                Ok(())
            }
            EnqueueOutcome::Overflow => {
                self.disconnect_slow_receiver().await;
                Err(self.forced_disconnect_error())
            }
            EnqueueOutcome::DisconnectRequested => Err(self.forced_disconnect_error()),
        }
    }

    fn ensure_pusher_running(self: &Arc<Self>) {
        if self.outgoing_queue.try_start_pusher() {
            let conn = self.clone();
            let handle = tokio::spawn(async move { conn.run_pusher().await });
            *self.pusher_task.lock().unwrap() = Some(handle);
        }
    }

    /// One pusher per connection drains the queue in FIFO order, which is what preserves
    ///  per-connection ordering once queued mode is entered. A single write that does not
    ///  complete within the queue timeout means the receiver stopped draining for good.
    async fn run_pusher(self: Arc<Self>) {
        debug!("starting async pusher for {:?}", self.remote_member());
        loop {
            if self.membership.shutdown_in_progress() || self.is_closing() {
                break;
            }
            let queue_timeout = self.async_params.lock().unwrap().queue_timeout;

            let Some(buffer) = self.outgoing_queue.take_from_queue() else {
                trace!("pusher drained queue for {:?}", self.remote_member());
                return; // the empty take already ended the pusher run
            };

            match timeout(queue_timeout, self.write_sync(&buffer)).await {
                Ok(Ok(())) => {
                    self.accessed();
                }
                Ok(Err(e)) => {
                    match &e {
                        ConnectionError::Io(io_err) if is_ignorable_io_error(io_err) => {
                            debug!("pusher i/o error for {:?}: {}", self.remote_member(), e);
                        }
                        _ => {
                            warn!("pusher i/o error for {:?}: {}", self.remote_member(), e);
                        }
                    }
                    self.outgoing_queue.end_pusher_run();
                    self.close(&format!("pusher i/o error: {}", e), CloseOptions {
                        cleanup_endpoint: true,
                        remove_endpoint: false,
                        being_sick: false,
                        force_removal: false,
                    }, CloseCaller::Pusher).await;
                    return;
                }
                Err(_elapsed) => {
                    warn!("receiver {:?} has not drained its socket for {:?}", self.remote_member(), queue_timeout);
                    self.outgoing_queue.end_pusher_run();
                    self.disconnect_slow_receiver().await;
                    return;
                }
            }
        }
        self.outgoing_queue.end_pusher_run();
    }

    /// Give up on a receiver that cannot keep up: ask membership to remove it, give the
    ///  coordinator a moment to act, then force the endpoint out locally.
    pub(crate) async fn disconnect_slow_receiver(self: &Arc<Self>) {
        if !self.outgoing_queue.request_disconnect() {
            return; // only ask once
        }

        let Some(remote) = self.remote_member() else {
            self.request_close("slow receiver with unknown identity").await;
            return;
        };

        warn!("queued bytes for {:?} exceeded limits, asking the member to disconnect", remote);
        self.membership.request_member_removal(remote, "Disconnected as a slow-receiver".to_string()).await;

        let deadline = Instant::now() + Duration::from_secs(3);
        while self.membership.member_exists(&remote) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Some(table) = self.table.upgrade() {
            table.remove_endpoint(&remote, "forced disconnect of slow receiver", None).await;
        }
        else {
            self.request_close("forced disconnect of slow receiver").await;
        }
    }

    /// Admission control for application senders. Reader tasks bypass the semaphore so
    ///  ack traffic can always make progress, and a context already holding a permit
    ///  re-enters without acquiring.
    pub(crate) async fn acquire_send_permission(&self, ctx: &SenderContext) -> Result<Option<OwnedSemaphorePermit>> {
        if ctx.is_reader || ctx.holds_permit {
            return Ok(None);
        }
        match self.send_permits.clone().acquire_owned().await {
            Ok(permit) => Ok(Some(permit)),
            Err(_) => Err(self.closing_error("connection closed while waiting to send")),
        }
    }

    // ------------------------------------------------- direct ack -----------------

    /// Read one reply frame (or chunk sequence) off this initiator's socket. The reply
    ///  is handed straight back to the caller instead of the dispatch pipeline: the peer
    ///  already proved it is in the view when the exchange started, so the membership
    ///  and serialization checks of the general path are deliberately skipped.
    pub async fn read_ack(&self, ack_timeout: Duration) -> Result<Bytes> {
        if let Some(remote) = self.remote_member() {
            debug_assert!(self.membership.member_exists(&remote),
                          "direct-ack read from a member that is not in the view");
        }

        self.set_state(ConnectionState::ReadingAck);

        let mut guard = self.ack_reader.lock().await;
        let reader = guard.as_mut().ok_or_else(|| self.closing_error("no ack reader on this connection"))?;

        match timeout(ack_timeout, reader.read_message()).await {
            Err(_) => Err(ConnectionError::AckTimeout),
            Ok(Err(e)) => Err(e),
            Ok(Ok((payload, _direct_ack))) => {
                self.set_state(ConnectionState::ReceivedAck);
                self.accessed();
                self.stats.inc_received_messages(payload.len() as u64);
                Ok(payload)
            }
        }
    }

    /// Reserve or release the socket for a request/reply exchange. With a positive
    ///  ack-wait threshold this arms the ack monitor; releasing counts as activity for
    ///  the idle reaper.
    pub fn set_in_use(self: &Arc<Self>, in_use: bool, ack_wait: Duration, ack_severe: Duration, group: Vec<Arc<Connection>>) {
        if in_use && (!ack_wait.is_zero() || !ack_severe.is_zero()) {
            self.ack.arm(Instant::now(), ack_wait, ack_severe, group);
            ack_monitor::schedule_ack_timeouts(self);
        }
        else {
            self.ack.disarm();
            if in_use {
                self.ack.mark_in_use();
            }
        }
        self.set_state(ConnectionState::Idle);
        if !in_use {
            self.accessed();
        }
    }

    // ------------------------------------------------- close cascade --------------

    /// Full close: this connection goes away and so do its siblings to the same member.
    pub async fn request_close(self: &Arc<Self>, reason: &str) {
        self.close(reason, CloseOptions {
            cleanup_endpoint: true,
            remove_endpoint: true,
            being_sick: false,
            force_removal: false,
        }, CloseCaller::Other).await;
    }

    /// Close only this connection; the member stays valid and may be re-dialed.
    pub async fn close_for_reconnect(self: &Arc<Self>, reason: &str) {
        self.close(reason, CloseOptions {
            cleanup_endpoint: true,
            remove_endpoint: false,
            being_sick: false,
            force_removal: false,
        }, CloseCaller::Other).await;
    }

    /// The close cascade. Safe to call from any task including the reader and the pusher
    ///  themselves, and bounded: no step waits forever.
    pub(crate) async fn close(self: &Arc<Self>, reason: &str, opts: CloseOptions, caller: CloseCaller) {
        let first = self.closing.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok();
        if !first && !opts.force_removal {
            return;
        }

        if first {
            debug!("closing connection {} to {:?}: {}", self.conn_id, self.remote_member(), reason);
            self.stopped.store(true, Ordering::Release);

            if self.connected.swap(false, Ordering::AcqRel) {
                if caller != CloseCaller::Pusher && self.outgoing_queue.is_queuing_in_progress() {
                    // give an in-flight drain a moment, then drop the queue regardless
                    let _ = timeout(Duration::from_secs(1), self.outgoing_queue.wait_until_drained()).await;
                }
                self.send_permits.close();
            }

            // unblock a reader stuck in a read before closing the socket
            self.close_signal.notify_waiters();

            let inline_close = opts.being_sick || self.config.test_hooks.inline_close;
            if inline_close {
                if let Ok(mut guard) = self.out_writer.try_lock() {
                    if let Some(mut writer) = guard.take() {
                        let _ = writer.shutdown().await;
                    }
                }
            }
            else {
                let conn = self.clone();
                tokio::spawn(async move {
                    let mut guard = conn.out_writer.lock().await;
                    if let Some(mut writer) = guard.take() {
                        let _ = writer.shutdown().await;
                    }
                });
            }

            self.notify_handshake_waiter(false);
            self.outgoing_queue.drain_on_close();

            if caller != CloseCaller::Reader {
                let handle = self.reader_task.lock().unwrap().take();
                if let Some(mut handle) = handle {
                    if timeout(Duration::from_millis(500), &mut handle).await.is_err() {
                        self.close_signal.notify_waiters();
                        if timeout(Duration::from_millis(1500), &mut handle).await.is_err() {
                            warn!("reader of connection {} to {:?} did not terminate in time", self.conn_id, self.remote_member());
                        }
                    }
                }
            }

            // a parked ack reader holds a pooled buffer; hand it back
            if let Ok(mut guard) = self.ack_reader.try_lock() {
                if let Some(reader) = guard.take() {
                    if let Some(table) = self.table.upgrade() {
                        reader.release_to(&table.buffer_pool());
                    }
                }
            }
        }

        if let Some(table) = self.table.upgrade() {
            if opts.remove_endpoint {
                if let Some(remote) = self.remote_member() {
                    Box::pin(table.remove_endpoint(&remote, reason, Some(self))).await;
                }
            }
            if opts.cleanup_endpoint {
                table.remove_connection(self);
            }
        }

        if let Some(task) = self.idle_task.lock().unwrap().take() {
            task.abort();
        }
        self.ack.cancel_task();
    }

    // ------------------------------------------------- reader plumbing ------------

    pub(crate) fn spawn_reader(self: &Arc<Self>, read_half: FilterReader) {
        let conn = self.clone();
        let handle = tokio::spawn(async move { reader::run_reader(conn, read_half).await });
        *self.reader_task.lock().unwrap() = Some(handle);
    }

    /// The initiator's reader parks its read half here when it exits after the handshake;
    ///  `read_ack` picks it up from there.
    pub(crate) fn install_ack_reader(&self, reader: MsgReader) {
        match self.ack_reader.try_lock() {
            Ok(mut guard) => {
                *guard = Some(reader);
            }
            Err(_) => {
                // a close raced this install; the read half is no longer needed
                debug!("discarding ack reader of connection {}: connection is closing", self.conn_id);
            }
        }
    }

    // ------------------------------------------------- accessors ------------------

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id.load(Ordering::Relaxed)
    }

    pub fn is_receiver(&self) -> bool {
        self.kind == ConnectionKind::Acceptor
    }

    pub fn remote_member(&self) -> Option<MemberId> {
        *self.remote.lock().unwrap()
    }

    pub fn remote_version_ordinal(&self) -> u16 {
        self.remote_version_ordinal.load(Ordering::Relaxed)
    }

    pub fn preserve_order(&self) -> bool {
        self.preserve_order.load(Ordering::Relaxed)
    }

    pub fn shared_resource(&self) -> bool {
        self.shared_resource.load(Ordering::Relaxed)
    }

    pub fn domino_number(&self) -> u32 {
        self.domino_number.load(Ordering::Relaxed)
    }

    /// Context for sends performed on behalf of this connection's reader, e.g. replies
    ///  routed by the dispatcher. Carries the domino count learned in the handshake.
    pub fn reply_context(&self) -> SenderContext {
        SenderContext::reader(self.domino_number())
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn async_distribution_timeout(&self) -> Duration {
        self.async_params.lock().unwrap().distribution_timeout
    }

    pub fn async_queue_timeout(&self) -> Duration {
        self.async_params.lock().unwrap().queue_timeout
    }

    pub fn queued_bytes(&self) -> u64 {
        self.outgoing_queue.queued_bytes()
    }

    pub(crate) fn queue(&self) -> &OutgoingQueue {
        &self.outgoing_queue
    }

    pub(crate) fn ack_tracking(&self) -> &AckTracking {
        &self.ack
    }

    pub(crate) fn membership(&self) -> &Arc<dyn Membership> {
        &self.membership
    }

    pub(crate) fn dispatcher(&self) -> &Arc<dyn MessageDispatcher> {
        &self.dispatcher
    }

    pub(crate) fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub(crate) fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub(crate) fn table(&self) -> Option<Arc<ConnectionTable>> {
        self.table.upgrade()
    }

    pub(crate) fn close_signal(&self) -> &Notify {
        &self.close_signal
    }

    /// Mark the connection as recently used; the idle reaper clears and probes this.
    pub fn accessed(&self) {
        self.accessed.store(true, Ordering::Relaxed);
    }

    pub(crate) fn take_accessed(&self) -> bool {
        self.accessed.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn set_idle_task(&self, task: JoinHandle<()>) {
        let mut slot = self.idle_task.lock().unwrap();
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    fn closing_error(&self, reason: &str) -> ConnectionError {
        ConnectionError::Closing {
            remote: self.remote_member(),
            reason: reason.to_string(),
        }
    }

    fn forced_disconnect_error(&self) -> ConnectionError {
        match self.remote_member() {
            Some(remote) => ConnectionError::ForcedDisconnect(remote),
            None => self.closing_error("forced disconnect"),
        }
    }
}

fn give_up_on_member(membership: &dyn Membership, remote: &MemberId) -> bool {
    !membership.member_exists(remote) || membership.is_shunned(remote) || membership.shutdown_in_progress()
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.conn_id)
            .field("kind", &self.kind)
            .field("remote", &self.remote_member())
            .field("shared", &self.shared_resource())
            .field("ordered", &self.preserve_order())
            .field("closing", &self.is_closing())
            .finish()
    }
}
