//! Bounded output backlog for detached sessions.
//!
//! While no channel is attached (inside the reconnect grace window) PTY
//! output is kept here and replayed to the next channel that attaches. Only
//! the most recent `capacity` bytes are retained.

use std::collections::VecDeque;

/// Byte-capped queue of output chunks, oldest first.
#[derive(Debug)]
pub struct Backlog {
    chunks: VecDeque<Vec<u8>>,
    capacity: usize,
    len: usize,
    /// Bytes discarded because the backlog was full.
    dropped: u64,
}

impl Backlog {
    /// Creates a backlog holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            capacity,
            len: 0,
            dropped: 0,
        }
    }

    /// Appends a chunk, discarding the oldest bytes if over capacity.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.capacity == 0 || chunk.is_empty() {
            self.dropped += chunk.len() as u64;
            return;
        }

        let chunk = if chunk.len() > self.capacity {
            let skip = chunk.len() - self.capacity;
            self.dropped += skip as u64;
            &chunk[skip..]
        } else {
            chunk
        };

        self.chunks.push_back(chunk.to_vec());
        self.len += chunk.len();

        while self.len > self.capacity {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let excess = self.len - self.capacity;
            if front.len() <= excess {
                self.len -= front.len();
                self.dropped += front.len() as u64;
                self.chunks.pop_front();
            } else {
                front.drain(..excess);
                self.len -= excess;
                self.dropped += excess as u64;
            }
        }
    }

    /// Removes and returns everything buffered, in order.
    pub fn take(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.len = 0;
        out
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total bytes discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
