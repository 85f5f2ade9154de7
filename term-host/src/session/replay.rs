// Bounded output replay for reattaching clients
//
// Holds exactly the byte range [output_seq - len, output_seq) of everything
// a session has ever emitted. Replays never start inside a UTF-8 sequence.

use std::collections::VecDeque;

/// Default per-session replay ceiling
pub const DEFAULT_REPLAY_CAP: usize = 256 * 1024;

/// A UTF-8 sequence carries at most three bytes after its lead byte
const MAX_CONTINUATION_BYTES: usize = 3;

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Result of a replay request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    pub data: Vec<u8>,
    /// Sequence number of the first byte in `data`
    pub base_seq: u64,
    /// Sequence number just past the last byte in `data`
    pub end_seq: u64,
    /// The requested offset was already evicted
    pub truncated: bool,
}

/// Chunked ring of recent output
#[derive(Debug)]
pub struct ReplayBuffer {
    chunks: VecDeque<Vec<u8>>,
    len: usize,
    cap: usize,
    output_seq: u64,
}

impl ReplayBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            cap: cap.max(1),
            output_seq: 0,
        }
    }

    /// Append a chunk, evicting the oldest bytes past the cap
    ///
    /// Returns the new `output_seq`.
    pub fn push(&mut self, bytes: &[u8]) -> u64 {
        if bytes.is_empty() {
            return self.output_seq;
        }
        self.output_seq += bytes.len() as u64;

        if bytes.len() >= self.cap {
            self.chunks.clear();
            self.chunks.push_back(bytes[bytes.len() - self.cap..].to_vec());
            self.len = self.cap;
            return self.output_seq;
        }

        self.chunks.push_back(bytes.to_vec());
        self.len += bytes.len();

        while self.len > self.cap {
            let excess = self.len - self.cap;
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= excess {
                self.len -= front.len();
                self.chunks.pop_front();
            } else {
                front.drain(..excess);
                self.len -= excess;
            }
        }

        self.output_seq
    }

    /// Total bytes ever pushed
    pub fn output_seq(&self) -> u64 {
        self.output_seq
    }

    /// Bytes currently retained
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First sequence number still retained
    pub fn start_seq(&self) -> u64 {
        self.output_seq - self.len as u64
    }

    /// Bytes from `since_seq` onward (everything retained when `None`)
    ///
    /// Eviction can cut a multi-byte character in half, so leading UTF-8
    /// continuation bytes are dropped and `base_seq` moves past them.
    pub fn since(&self, since_seq: Option<u64>) -> Replay {
        let start = self.start_seq();
        let requested = since_seq.unwrap_or(0).min(self.output_seq);
        let truncated = requested < start;
        let base_seq = requested.max(start);

        let mut skip = (base_seq - start) as usize;
        let mut data = Vec::with_capacity(self.len - skip);
        for chunk in &self.chunks {
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            data.extend_from_slice(&chunk[skip..]);
            skip = 0;
        }

        let orphaned = data
            .iter()
            .take(MAX_CONTINUATION_BYTES)
            .take_while(|b| is_continuation(**b))
            .count();
        data.drain(..orphaned);

        Replay {
            data,
            base_seq: base_seq + orphaned as u64,
            end_seq: self.output_seq,
            truncated,
        }
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAP)
    }
}
