use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::connection::Connection;
use crate::member::MemberId;

/// Upstream sink for fully assembled inbound messages. The connection is passed along so
///  the dispatcher can route direct-ack replies back onto the same socket.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    /// `direct_ack` is true when the sender expects an inline reply on this connection;
    ///  the reader has already cleared it if ack responsibility was refused.
    async fn message_received(&self, connection: Arc<Connection>, payload: Bytes, bytes_read: usize, direct_ack: bool);

    /// Whether this process will take ack responsibility for a direct-ack message from
    ///  the given sender. When refused (e.g. the sender is shunned), the reader clears
    ///  the direct-ack flag so no reply is ever attempted.
    fn accepts_direct_ack(&self, sender: &MemberId) -> bool;
}
