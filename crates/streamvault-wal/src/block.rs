//! Write Block
//!
//! A block is the unit the sliding window hands to the I/O pool: a run of
//! record frames starting at a block-aligned offset, guaranteed never to
//! cross the ring-wrap seam. `limit` is the hard byte cap (bounded by the
//! seam and the window); `soft_limit` seals the block early to cap latency.

use crate::error::Result;
use bytes::Bytes;
use tokio::sync::oneshot;

/// Resolves with the WAL confirm offset once the record's block is durable.
pub(crate) type Completion = oneshot::Sender<Result<u64>>;

pub(crate) struct Block {
    start_offset: u64,
    limit: u64,
    soft_limit: u64,
    frames: Vec<Bytes>,
    size: u64,
    completions: Vec<Completion>,
}

impl Block {
    pub fn new(start_offset: u64, limit: u64, soft_limit: u64) -> Self {
        Self {
            start_offset,
            limit,
            soft_limit,
            frames: Vec::new(),
            size: 0,
            completions: Vec::new(),
        }
    }

    /// Whether a record of `record_size` bytes fits.
    ///
    /// The first record ignores the soft limit so oversized records are still
    /// writable as long as they fit the hard cap.
    pub fn has_room(&self, record_size: u64) -> bool {
        if self.size + record_size > self.limit {
            return false;
        }
        if !self.frames.is_empty() && self.size >= self.soft_limit {
            return false;
        }
        true
    }

    /// Offset the next record would be placed at.
    pub fn next_offset(&self) -> u64 {
        self.start_offset + self.size
    }

    /// Stage a frame; the caller has already checked `has_room`.
    pub fn add(&mut self, frame: Bytes, completion: Completion) -> u64 {
        let offset = self.next_offset();
        self.size += frame.len() as u64;
        self.frames.push(frame);
        self.completions.push(completion);
        offset
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn into_parts(self) -> (u64, u64, Vec<Bytes>, Vec<Completion>) {
        (self.start_offset, self.size, self.frames, self.completions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize) -> Bytes {
        Bytes::from(vec![0u8; len])
    }

    fn completion() -> Completion {
        oneshot::channel().0
    }

    #[test]
    fn test_add_assigns_sequential_offsets() {
        let mut block = Block::new(4096, 1 << 20, 1 << 17);
        assert_eq!(block.add(frame(100), completion()), 4096);
        assert_eq!(block.add(frame(50), completion()), 4196);
        assert_eq!(block.end_offset(), 4246);
    }

    #[test]
    fn test_hard_limit() {
        let block = Block::new(0, 128, 1 << 17);
        assert!(block.has_room(128));
        assert!(!block.has_room(129));
    }

    #[test]
    fn test_soft_limit_seals_after_crossing() {
        let mut block = Block::new(0, 1 << 20, 100);
        assert!(block.has_room(80));
        block.add(frame(80), completion());
        // Still under the soft limit.
        assert!(block.has_room(80));
        block.add(frame(80), completion());
        // Crossed it: sealed for further records.
        assert!(!block.has_room(1));
    }

    #[test]
    fn test_first_record_ignores_soft_limit() {
        let block = Block::new(0, 1 << 20, 100);
        assert!(block.has_room(5000));
    }

    #[test]
    fn test_empty_block() {
        let block = Block::new(8192, 4096, 4096);
        assert!(block.is_empty());
        assert_eq!(block.start_offset(), 8192);
        assert_eq!(block.end_offset(), 8192);
    }
}
