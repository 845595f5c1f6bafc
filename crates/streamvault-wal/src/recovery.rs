//! Recovery Iterator
//!
//! A stateless cursor over WAL records from the trim offset up to the
//! window's next-write offset. Decode failures - stale frames from an
//! earlier lap of the ring, torn writes, corruption - advance the cursor to
//! the next block boundary instead of ending iteration, so consumers see
//! every surviving record exactly once.

use crate::service::{read_record, BlockWal};
use crate::record::RECORD_HEADER_SIZE;
use bytes::Bytes;

/// One record surfaced by recovery.
#[derive(Debug, Clone)]
pub struct RecoverResult {
    /// The record body, CRC-verified
    pub record: Bytes,

    /// Logical offset the record was appended at
    pub record_offset: u64,
}

pub struct RecoverIterator<'a> {
    wal: &'a BlockWal,
    next_recover_offset: u64,
    /// The record at the trim boundary was already consumed by the caller;
    /// skip exactly that one.
    skip_record_at: Option<u64>,
    next: Option<RecoverResult>,
}

impl<'a> RecoverIterator<'a> {
    pub(crate) fn new(wal: &'a BlockWal, start_offset: u64, skip_record_at: Option<u64>) -> Self {
        Self {
            wal,
            next_recover_offset: start_offset,
            skip_record_at,
            next: None,
        }
    }

    /// Idempotent readahead; `next` is populated if and only if this
    /// returns true.
    fn try_read_next_record(&mut self) -> bool {
        if self.next.is_some() {
            return true;
        }
        let capacity = self.wal.record_section_capacity();
        let max_body = self.wal.max_body_length();
        while self.next_recover_offset < self.wal.next_write_offset() {
            let offset = self.next_recover_offset;
            match read_record(self.wal.channel(), capacity, offset, max_body) {
                Ok(record) => {
                    self.next_recover_offset =
                        offset + (RECORD_HEADER_SIZE + record.len()) as u64;
                    if self.skip_record_at == Some(offset) {
                        continue;
                    }
                    self.next = Some(RecoverResult {
                        record,
                        record_offset: offset,
                    });
                    return true;
                }
                Err(e) => {
                    tracing::debug!(
                        offset,
                        jump_to = e.jump_to,
                        reason = %e.reason,
                        "skipping unreadable WAL slot"
                    );
                    self.next_recover_offset = e.jump_to;
                }
            }
        }
        false
    }
}

impl Iterator for RecoverIterator<'_> {
    type Item = RecoverResult;

    fn next(&mut self) -> Option<RecoverResult> {
        if self.try_read_next_record() {
            self.next.take()
        } else {
            None
        }
    }
}
