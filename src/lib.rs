//! Peer-to-peer TCP connection engine for a distributed in-memory data grid.
//!
//! This crate multiplexes serialized messages between cluster members over long-lived,
//!  reusable TCP sockets, detects slow or dead peers, and coordinates with the membership
//!  layer to eject them. It deliberately does *not* interpret message payloads - the
//!  message codec and routing policy live with the caller, which hands the engine fully
//!  framed buffers and receives assembled payload bytes back.
//!
//! ## Design goals
//!
//! * Long-lived connections that are cheap to keep around and safe to close from any task
//!   * a connection may be closed to preserve resources and is re-dialed when needed
//! * Two parallel socket families per peer pair: `preserve-order` for regular traffic and
//!    `unordered` for fast, best-effort and failure-detection traffic
//! * Sharing disciplines: `shared` sockets usable by many tasks, and `thread-owned`
//!    sockets leased to a single sender to avoid serialization contention
//! * Backpressure that distinguishes "receiver busy" from "receiver dead":
//!   * a bounded-time direct write, falling back to a background-drained queue
//!   * queue overflow or a persistently idle drain escalates to membership-level removal
//! * Conflation: updates that supersede each other collapse to the latest value while
//!    keeping the first-insertion position in the queue
//! * Failure detection hooks: ack-wait / severe-alert timers around request/reply traffic
//!
//! ## Wire format
//!
//! Every frame starts with a 7-byte header - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0: (u32) (HANDSHAKE_VERSION << 24) | payload length
//!     * the top 8 bits carry the handshake/protocol version, currently 7
//!     * the maximum payload length is 16 MiB - 1
//! 4: (u8) message type:
//!     * 0x4c  normal - a complete logical message
//!     * 0x4d  chunk - one piece of a multi-frame logical message
//!     * 0x4e  final chunk - terminates a sequence of chunks
//!     * bit 0x20 is the direct-ack flag: the sender expects an inline reply on the
//!        same socket. It is masked off before the type is validated.
//! 5: (u16) message id, correlating the chunks of one logical message. The reserved
//!     id 0 (`NO_MSG_ID`) is used for handshake frames and single-shot replies.
//! ```
//!
//! ## Handshake
//!
//! The initiator opens with a normal-type frame carrying `NO_MSG_ID`:
//!
//! ```ascii
//! 0: (u8) reserved, always 0 - peers that send a nonzero byte here predate the
//!     current protocol and are rejected
//! 1: (u8) handshake version (7)
//! 2: serialized member id of the initiator
//! *: (u8) shared-resource flag
//! *: (u8) preserve-order flag
//! *: (u64) connection unique id
//! *: (u16) product version ordinal
//! *: (u32) domino count of the initiating task, plus one
//! ```
//!
//! The acceptor validates, then replies (same framing) with one of:
//!
//! ```ascii
//! 69: OK - single byte
//! 70: OK with async info - followed by three u32 values: async distribution
//!      timeout (ms), async queue timeout (ms), async max queue size (MiB, scaled
//!      to bytes by the initiator), and the acceptor's (u16) product version ordinal
//! ```
//!
//! Both sides wait for handshake completion under a bounded timeout; expiry suspects
//!  the peer with the membership layer and closes the socket.

pub mod ack_monitor;
pub mod buffer_pool;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod connection_table;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod io_filter;
pub mod member;
pub mod membership;
pub mod outgoing_queue;
pub mod reader;
pub mod safe_converter;
pub mod stats;

pub use config::EngineConfig;
pub use connection::Connection;
pub use connection_table::ConnectionTable;
pub use error::ConnectionError;
pub use member::MemberId;
