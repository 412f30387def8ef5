use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Reassembles logical messages that arrive as a sequence of chunk frames terminated by
///  a final-chunk frame, correlated by the 16-bit message id. Several chunked messages
///  may be interleaved on one connection as long as their ids differ.
#[derive(Default)]
pub struct ChunkAssembler {
    in_progress: FxHashMap<u16, BytesMut>,
}

impl ChunkAssembler {
    pub fn append(&mut self, msg_id: u16, chunk: &[u8]) {
        self.in_progress
            .entry(msg_id)
            .or_default()
            .put_slice(chunk);
    }

    /// Complete the message with its final chunk and return the assembled payload.
    pub fn finish(&mut self, msg_id: u16, last_chunk: &[u8]) -> Bytes {
        let mut assembled = self.in_progress.remove(&msg_id).unwrap_or_default();
        assembled.put_slice(last_chunk);
        assembled.freeze()
    }

    pub fn open_count(&self) -> usize {
        self.in_progress.len()
    }

    /// Drop all partially assembled messages, e.g. when the connection closes mid-stream.
    pub fn close(&mut self) {
        if !self.in_progress.is_empty() {
            debug!("dropping {} partially assembled chunked messages", self.in_progress.len());
        }
        self.in_progress.clear();
    }
}
