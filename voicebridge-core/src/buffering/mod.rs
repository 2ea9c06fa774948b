//! Mutex-guarded byte ring buffer for the capture stream.
//!
//! One producer (the capture callback) and one consumer (the processing
//! worker) share the buffer; every operation takes the single internal
//! mutex, so `used_size`/`free_size` are advisory snapshots only valid at
//! call time. The buffer never retries on its own: a short write is
//! reported to the caller, whose policy decides whether the loss matters.

use parking_lot::Mutex;

use crate::error::{Result, VoiceError};

/// What `write` does when the buffer cannot take the whole slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Deny the write outright when it does not fit; the producer retries
    /// or drops upstream. The buffer itself never blocks the calling
    /// thread (the producer is typically a real-time audio callback).
    BlockProducer,
    /// Accept up to the free space and report a short write.
    DropAndStop,
}

struct RingInner {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    used: usize,
}

/// Fixed-capacity byte circular buffer with a configurable overflow policy.
///
/// Invariant: `used_size() + free_size() == capacity()` at all times, and
/// the read cursor never passes the write cursor.
pub struct RingBuffer {
    inner: Mutex<RingInner>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl RingBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read: 0,
                write: 0,
                used: 0,
            }),
            capacity,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Append bytes, returning how many were accepted.
    ///
    /// Under `BlockProducer` a slice that does not fit is denied whole with
    /// `VoiceError::BufferFull`. Under `DropAndStop` the free space is
    /// filled and the short count returned; deciding whether a short write
    /// is fatal is the caller's job.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        let free = self.capacity - inner.used;

        let n = match self.policy {
            OverflowPolicy::BlockProducer => {
                if free < bytes.len() {
                    return Err(VoiceError::BufferFull);
                }
                bytes.len()
            }
            OverflowPolicy::DropAndStop => free.min(bytes.len()),
        };
        if n == 0 {
            // Saturated (or zero-capacity) buffer: nothing to commit and
            // no cursor math to do.
            return Ok(0);
        }

        let write = inner.write;
        let first = n.min(self.capacity - write);
        inner.buf[write..write + first].copy_from_slice(&bytes[..first]);
        if first < n {
            inner.buf[..n - first].copy_from_slice(&bytes[first..n]);
        }
        inner.write = (write + n) % self.capacity;
        inner.used += n;
        Ok(n)
    }

    /// Read up to `out.len()` bytes, returning the achieved count.
    ///
    /// A short read returns the actual byte count; the tail of `out` is
    /// left untouched (no zero padding).
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.used.min(out.len());
        if n == 0 {
            return 0;
        }

        let read = inner.read;
        let first = n.min(self.capacity - read);
        out[..first].copy_from_slice(&inner.buf[read..read + first]);
        if first < n {
            out[first..n].copy_from_slice(&inner.buf[..n - first]);
        }
        inner.read = (read + n) % self.capacity;
        inner.used -= n;
        n
    }

    pub fn used_size(&self) -> usize {
        self.inner.lock().used
    }

    pub fn free_size(&self) -> usize {
        let inner = self.inner.lock();
        self.capacity - inner.used
    }

    /// Drop all buffered bytes and rewind both cursors.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.read = 0;
        inner.write = 0;
        inner.used = 0;
    }
}
