//! Outbound gather queue.
//!
//! Byte spans are queued without copying when the caller already owns them
//! as [`Bytes`]; borrowed data is copied into blocks so a span never exceeds
//! the block size. The queue front is consumed by `shift` as the socket
//! confirms transmission.

use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{Buf, Bytes};

/// Copy granularity for borrowed data.
const BLOCK_SIZE: usize = 8 * 1024;

#[derive(Debug, Default)]
pub struct EgressBuffer {
    chunks: VecDeque<Bytes>,
    size: usize,
}

impl EgressBuffer {
    pub fn new() -> EgressBuffer {
        EgressBuffer::default()
    }

    /// Queue an owned span without copying.
    pub fn write(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }

        self.size += data.len();
        self.chunks.push_back(data);
    }

    /// Copy borrowed data in, split into blocks.
    pub fn write_copy(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = data.len().min(BLOCK_SIZE);
            self.write(Bytes::copy_from_slice(&data[..take]));
            data = &data[take..];
        }
    }

    /// Drop the first `n` bytes, freeing fully drained spans.
    pub fn shift(&mut self, mut n: usize) {
        debug_assert!(n <= self.size);
        n = n.min(self.size);
        self.size -= n;

        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };

            if n < front.len() {
                front.advance(n);
                break;
            }

            n -= front.len();
            self.chunks.pop_front();
        }
    }

    /// All queued spans, for a vectored write.
    pub fn slices(&self) -> Vec<IoSlice<'_>> {
        self.chunks.iter().map(|c| IoSlice::new(c)).collect()
    }

    /// Cheap clones of the queued spans.
    pub fn spans(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Drain everything into one contiguous buffer. Test support.
    #[cfg(test)]
    pub fn take_all(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        self.chunks.clear();
        self.size = 0;
        out
    }
}
