use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tracing::{debug, trace, warn};

use crate::buffer_pool::BufferPool;
use crate::chunk::ChunkAssembler;
use crate::connection::{CloseCaller, CloseOptions, Connection, ConnectionKind, ConnectionState};
use crate::error::{is_ignorable_io_error, ConnectionError, Result};
use crate::frame::{MsgHeader, MsgType, MSG_HEADER_BYTES};
use crate::handshake::{HandshakeReply, HandshakeRequest};
use crate::io_filter::FilterReader;

/// Frame-at-a-time reader used for direct-ack replies: after an initiator's handshake
///  reader exits, its read half and input buffer park here and `Connection::read_ack`
///  pulls single messages through it.
pub(crate) struct MsgReader {
    read_half: FilterReader,
    input: BytesMut,
    assembler: ChunkAssembler,
}

impl MsgReader {
    pub(crate) fn new(read_half: FilterReader, input: BytesMut) -> MsgReader {
        MsgReader {
            read_half,
            input,
            assembler: ChunkAssembler::default(),
        }
    }

    pub(crate) fn release_to(self, pool: &BufferPool) {
        pool.return_to_pool(self.input);
    }

    async fn read_frame(&mut self) -> Result<(MsgHeader, Bytes)> {
        loop {
            if self.input.len() >= MSG_HEADER_BYTES {
                let mut peek = &self.input[..MSG_HEADER_BYTES];
                let header = MsgHeader::deser(&mut peek)?;
                let total = MSG_HEADER_BYTES + header.payload_len as usize;
                if self.input.len() >= total {
                    self.input.advance(MSG_HEADER_BYTES);
                    let payload = self.input.split_to(header.payload_len as usize).freeze();
                    return Ok((header, payload));
                }
                if self.input.capacity() < total {
                    self.input.reserve(total - self.input.len());
                }
            }

            let n = self.read_half.read_buf(&mut self.input).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    /// Read one logical message: a normal frame, or a chunk sequence drained to its
    ///  final chunk. Returns the payload and the frame's direct-ack flag.
    pub(crate) async fn read_message(&mut self) -> Result<(Bytes, bool)> {
        loop {
            let (header, payload) = self.read_frame().await?;
            match header.msg_type {
                MsgType::Normal => return Ok((payload, header.direct_ack)),
                MsgType::Chunk => self.assembler.append(header.msg_id, &payload),
                MsgType::EndChunk => {
                    return Ok((self.assembler.finish(header.msg_id, &payload), header.direct_ack));
                }
            }
        }
    }
}

struct ReaderState {
    read_half: FilterReader,
    input: BytesMut,
    /// decoded header of the frame whose payload has not fully arrived yet
    pending_header: Option<MsgHeader>,
    assembler: ChunkAssembler,
}

enum Outcome {
    /// initiator reader: handshake reply processed, the connection is write-only now
    HandshakeReader,
    Eof,
    Cancelled,
    Failed(ConnectionError),
}

enum ProcessResult {
    NeedMoreData,
    HandshakeReader,
}

/// Body of the per-connection reader task. Owns the pooled input buffer for the life of
///  the connection and returns it on every exit path.
pub(crate) async fn run_reader(conn: Arc<Connection>, read_half: FilterReader) {
    let Some(table) = conn.table() else {
        return;
    };
    let pool = table.buffer_pool();
    drop(table);

    let mut state = ReaderState {
        read_half,
        input: pool.get_from_pool(),
        pending_header: None,
        assembler: ChunkAssembler::default(),
    };

    let outcome = read_loop(&conn, &mut state).await;

    match outcome {
        Outcome::HandshakeReader => {
            trace!("handshake reader for connection {} exiting, parking read half for acks", conn.conn_id());
            // park the read half before releasing the handshake waiter, so a caller
            //  that immediately reads an ack finds it in place
            conn.install_ack_reader(MsgReader::new(state.read_half, state.input));
            conn.notify_handshake_waiter(true);
            return;
        }
        Outcome::Cancelled => {
            trace!("reader of connection {} unwinding for close", conn.conn_id());
        }
        Outcome::Eof => {
            debug!("peer closed connection {} to {:?}", conn.conn_id(), conn.remote_member());
            conn.close("EOF on socket read", CloseOptions {
                cleanup_endpoint: true,
                remove_endpoint: false,
                being_sick: false,
                force_removal: false,
            }, CloseCaller::Reader).await;
        }
        Outcome::Failed(e) => {
            let remove_endpoint = e.is_fatal_for_endpoint() || matches!(e, ConnectionError::MemberLeft(_));
            match &e {
                ConnectionError::Io(io_err) if is_ignorable_io_error(io_err) => {
                    debug!("reader of connection {} stopping: {}", conn.conn_id(), e);
                }
                ConnectionError::Protocol(_) => {
                    warn!("protocol error on connection {} from {:?}: {}", conn.conn_id(), conn.remote_member(), e);
                }
                _ => {
                    warn!("reader of connection {} stopping: {}", conn.conn_id(), e);
                }
            }
            conn.close(&e.to_string(), CloseOptions {
                cleanup_endpoint: true,
                remove_endpoint,
                being_sick: false,
                force_removal: false,
            }, CloseCaller::Reader).await;
        }
    }

    state.assembler.close();
    pool.return_to_pool(state.input);
}

async fn read_loop(conn: &Arc<Connection>, state: &mut ReaderState) -> Outcome {
    loop {
        match process_input_buffer(conn, state).await {
            Ok(ProcessResult::NeedMoreData) => {}
            Ok(ProcessResult::HandshakeReader) => return Outcome::HandshakeReader,
            Err(e) => return Outcome::Failed(e),
        }

        // toggle Reading around the blocking read so a close can see whether the reader
        //  needs to be interrupted
        conn.set_state(ConnectionState::Reading);
        let read_result = tokio::select! {
            _ = conn.close_signal().notified() => None,
            r = state.read_half.read_buf(&mut state.input) => Some(r),
        };
        conn.set_state(ConnectionState::Idle);

        match read_result {
            None => return Outcome::Cancelled,
            Some(Ok(0)) => return Outcome::Eof,
            Some(Ok(_)) => {}
            Some(Err(e)) => return Outcome::Failed(e.into()),
        }
        if conn.is_closing() {
            return Outcome::Cancelled;
        }
    }
}

/// Drain all complete frames out of the input buffer. Returns when more bytes are
///  needed, growing the buffer first if the pending message cannot fit as-is.
async fn process_input_buffer(conn: &Arc<Connection>, state: &mut ReaderState) -> Result<ProcessResult> {
    loop {
        if state.pending_header.is_none() {
            if state.input.len() < MSG_HEADER_BYTES {
                return Ok(ProcessResult::NeedMoreData);
            }
            let mut peek = &state.input[..MSG_HEADER_BYTES];
            state.pending_header = Some(MsgHeader::deser(&mut peek)?);
        }

        let header = state.pending_header.unwrap();
        let total = MSG_HEADER_BYTES + header.payload_len as usize;
        if state.input.len() < total {
            if state.input.capacity() < total {
                state.input.reserve(total - state.input.len());
            }
            return Ok(ProcessResult::NeedMoreData);
        }

        state.pending_header = None;
        state.input.advance(MSG_HEADER_BYTES);
        let payload = state.input.split_to(header.payload_len as usize).freeze();

        if !conn.is_handshake_read() {
            match conn.kind() {
                ConnectionKind::Initiator => {
                    read_handshake_for_initiator(conn, &payload)?;
                    return Ok(ProcessResult::HandshakeReader);
                }
                ConnectionKind::Acceptor => {
                    read_handshake_for_acceptor(conn, &payload).await?;
                    continue;
                }
            }
        }

        dispatch_frame(conn, state, header, payload).await?;
        conn.accessed();
    }
}

fn read_handshake_for_initiator(conn: &Arc<Connection>, payload: &Bytes) -> Result<()> {
    let reply = HandshakeReply::try_deser(&mut payload.as_ref())?;
    match reply {
        HandshakeReply::Ok => {}
        HandshakeReply::OkWithAsyncInfo {
            async_distribution_timeout_ms,
            async_queue_timeout_ms,
            async_max_queue_size_mib,
            version_ordinal,
        } => {
            conn.apply_async_info(
                async_distribution_timeout_ms,
                async_queue_timeout_ms,
                async_max_queue_size_mib,
                version_ordinal,
            );
        }
    }
    debug!("handshake reply received on connection {} from {:?}", conn.conn_id(), conn.remote_member());
    Ok(())
}

async fn read_handshake_for_acceptor(conn: &Arc<Connection>, payload: &Bytes) -> Result<()> {
    let request = HandshakeRequest::try_deser(&mut payload.as_ref())?;

    if conn.membership().is_shunned(&request.member) {
        debug!("refusing connection from shunned member {:?}", request.member);
        return Err(ConnectionError::MemberLeft(request.member));
    }

    conn.record_remote_handshake(&request);
    debug!("p2p handshake remote is {:?} shared={} ordered={}",
           request.member, request.shared_resource, request.preserve_order);

    if !conn.membership().member_exists(&request.member) {
        // the socket got here before the membership view did
        conn.membership().add_surprise_member(request.member);
    }

    if conn.config().secure_handshake
        && !conn.membership().wait_for_membership_check(&request.member).await
    {
        warn!("{:?} timed out during a membership check", request.member);
        return Err(ConnectionError::HandshakeCancelled(format!(
            "{:?} timed out during a membership check", request.member)));
    }

    // a receiver must be registered before its reader dispatches anything
    if let Some(table) = conn.table() {
        table.register_receiver(conn);
    }

    conn.send_handshake_reply().await?;
    conn.notify_handshake_waiter(true);
    Ok(())
}

async fn dispatch_frame(conn: &Arc<Connection>, state: &mut ReaderState, header: MsgHeader, payload: Bytes) -> Result<()> {
    match header.msg_type {
        MsgType::Normal => dispatch_message(conn, payload, header.direct_ack).await,
        MsgType::Chunk => {
            state.assembler.append(header.msg_id, &payload);
            Ok(())
        }
        MsgType::EndChunk => {
            let assembled = state.assembler.finish(header.msg_id, &payload);
            dispatch_message(conn, assembled, header.direct_ack).await
        }
    }
}

async fn dispatch_message(conn: &Arc<Connection>, payload: Bytes, direct_ack: bool) -> Result<()> {
    // the flag is cleared when the dispatcher refuses ack responsibility for the sender,
    //  so no reply is ever attempted towards e.g. a shunned member
    let direct_ack = direct_ack
        && match conn.remote_member() {
            Some(sender) => conn.dispatcher().accepts_direct_ack(&sender),
            None => false,
        };

    let bytes_read = payload.len();
    conn.stats().inc_received_messages(bytes_read as u64);
    conn.dispatcher().message_received(conn.clone(), payload, bytes_read, direct_ack).await;
    Ok(())
}
