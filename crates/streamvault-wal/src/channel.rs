//! Block Channel
//!
//! Aligned positional reads and writes against a raw block device or a
//! preallocated file.
//!
//! ## Alignment Rules
//!
//! Every position and every buffer length handed to the channel must be a
//! multiple of the device block size. With `direct_io` enabled the kernel
//! additionally requires the *memory* to be block-aligned, so the channel
//! stages direct I/O through a thread-local pool of preallocated aligned
//! buffers, grown on demand up to a fixed bound. Without `direct_io` the
//! caller's buffer is used as-is, but the position and length rules still
//! apply so both configurations behave identically.
//!
//! ## Partial Writes
//!
//! The OS may complete only part of a write. The channel rounds the completed
//! fraction down to a block multiple and re-issues the remainder at
//! `position + written`; a zero-byte return surfaces as
//! [`WalError::ShortWrite`]. Buffers are written and read back verbatim - the
//! channel never interprets their contents.
//!
//! ## Thread Safety
//!
//! Positional I/O (`read_at`/`write_at`) takes `&self`, so the channel is
//! safe for concurrent readers at disjoint positions and for writers that
//! higher layers serialize per region. Each thread stages through its own
//! aligned buffer. The device closes when the channel drops.

use crate::error::{Result, WalError};
use std::alloc::{alloc, dealloc, Layout};
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use tracing::info;

/// Initial size of a thread's staging buffer.
const STAGING_BUFFER_SIZE: usize = 2 << 20;

/// Hard bound on a staging buffer; covers the largest admissible record.
const STAGING_BUFFER_MAX_SIZE: usize = 128 << 20;

/// A heap buffer whose start address is aligned for direct I/O.
struct AlignedBuf {
    data: *mut u8,
    capacity: usize,
    layout: Layout,
}

// The raw pointer is uniquely owned by the buffer.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    fn new(capacity: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(capacity, align).expect("valid staging layout");
        let data = unsafe { alloc(layout) };
        assert!(!data.is_null(), "staging buffer allocation failed");
        Self {
            data,
            capacity,
            layout,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.capacity) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.data, self.layout) }
    }
}

thread_local! {
    static STAGING: RefCell<Option<AlignedBuf>> = const { RefCell::new(None) };
}

/// Run `f` over this thread's aligned staging buffer, growing it to at
/// least `len` bytes first.
fn with_staging<R>(
    len: usize,
    align: usize,
    f: impl FnOnce(&mut [u8]) -> Result<R>,
) -> Result<R> {
    if len > STAGING_BUFFER_MAX_SIZE {
        return Err(WalError::BodyTooLarge {
            size: len,
            limit: STAGING_BUFFER_MAX_SIZE,
        });
    }
    STAGING.with(|cell| {
        let mut slot = cell.borrow_mut();
        let grow = slot.as_ref().map(|b| b.capacity < len).unwrap_or(true);
        if grow {
            let capacity = len.max(STAGING_BUFFER_SIZE);
            *slot = Some(AlignedBuf::new(capacity, align));
        }
        let staging = slot.as_mut().expect("staging buffer present");
        f(&mut staging.as_mut_slice()[..len])
    })
}

pub struct BlockChannel {
    file: File,
    capacity: u64,
    block_size: u64,
    direct_io: bool,
}

impl BlockChannel {
    /// Open the device, growing a regular file to `capacity` if needed.
    pub fn open(path: &Path, capacity: u64, block_size: u64, direct_io: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        if direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(path)?;

        let len = file.metadata()?.len();
        if len < capacity {
            file.set_len(capacity)?;
        }

        info!(
            path = %path.display(),
            capacity,
            block_size,
            direct_io,
            "block channel opened"
        );

        Ok(Self {
            file,
            capacity,
            block_size,
            direct_io,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn check_aligned(&self, what: &'static str, value: u64) -> Result<()> {
        if value % self.block_size != 0 {
            return Err(WalError::Unaligned {
                what,
                value,
                block_size: self.block_size,
            });
        }
        Ok(())
    }

    /// Write `buf` at `position`, retrying partial writes.
    pub fn write(&self, buf: &[u8], position: u64) -> Result<()> {
        self.check_aligned("write position", position)?;
        self.check_aligned("write length", buf.len() as u64)?;
        if position + buf.len() as u64 > self.capacity {
            return Err(WalError::ShortWrite { position });
        }

        if self.direct_io {
            with_staging(buf.len(), self.block_size as usize, |staging| {
                staging.copy_from_slice(buf);
                self.write_all_at(staging, position)
            })
        } else {
            self.write_all_at(buf, position)
        }
    }

    fn write_all_at(&self, buf: &[u8], position: u64) -> Result<()> {
        let mut written = 0usize;
        while written < buf.len() {
            let remaining = &buf[written..];
            let n = self.file.write_at(remaining, position + written as u64)?;
            if n == remaining.len() {
                written += n;
                continue;
            }
            // Partial write: keep the block-aligned fraction, retry the rest.
            let n = n - n % self.block_size as usize;
            if n == 0 {
                return Err(WalError::ShortWrite {
                    position: position + written as u64,
                });
            }
            written += n;
        }
        Ok(())
    }

    /// Fill `buf` from `position`, returning the number of bytes fetched.
    ///
    /// A read past the end of the device returns fewer bytes than requested.
    pub fn read(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        self.check_aligned("read position", position)?;
        self.check_aligned("read length", buf.len() as u64)?;

        if self.direct_io {
            with_staging(buf.len(), self.block_size as usize, |staging| {
                let n = self.read_into(staging, position)?;
                buf[..n].copy_from_slice(&staging[..n]);
                Ok(n)
            })
        } else {
            self.read_into(buf, position)
        }
    }

    fn read_into(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        let mut read = 0usize;
        while read < buf.len() {
            let n = self.file.read_at(&mut buf[read..], position + read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    /// Flush written data to the device.
    pub fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
