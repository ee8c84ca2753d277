//! Ring-buffered socket connection
//!
//! Each direction of a connection is a fixed-capacity circular buffer. The
//! buffers never grow: a message that does not fit is a caller bug, which
//! keeps framing simple and memory bounded.
//!
//! `service` performs at most one `readv` and one `writev`, each with a
//! two-segment I/O vector so a wrapped region moves in a single syscall.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::uio;
use tracing::{debug, trace};

use crate::error::{ConnectionError, RingError};
use crate::Readiness;

/// Capacity of each direction's ring, in bytes.
pub const RING_CAPACITY: usize = 4096;

/// Fixed-capacity circular byte buffer.
///
/// `head` is where the next byte is written, `tail` where the next byte is
/// read. Fullness is tracked by `len`, so `head == tail` is unambiguous.
#[derive(Debug)]
pub struct RingBuffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Append `bytes`, wrapping at the end of the storage.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), RingError> {
        if bytes.len() > self.free() {
            return Err(RingError::Overflow {
                requested: bytes.len(),
                free: self.free(),
            });
        }

        let cap = self.capacity();
        let first = bytes.len().min(cap - self.head);
        self.data[self.head..self.head + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.advance_head(bytes.len());
        Ok(())
    }

    /// Copy the next `dest.len()` bytes without consuming them.
    pub fn peek(&self, dest: &mut [u8]) -> Result<(), RingError> {
        if dest.len() > self.len {
            return Err(RingError::Underflow {
                requested: dest.len(),
                available: self.len,
            });
        }

        let cap = self.capacity();
        let first = dest.len().min(cap - self.tail);
        dest[..first].copy_from_slice(&self.data[self.tail..self.tail + first]);
        let rest = dest.len() - first;
        dest[first..].copy_from_slice(&self.data[..rest]);
        Ok(())
    }

    /// Drop the next `n` buffered bytes.
    pub fn consume(&mut self, n: usize) -> Result<(), RingError> {
        if n > self.len {
            return Err(RingError::Underflow {
                requested: n,
                available: self.len,
            });
        }
        self.tail = (self.tail + n) % self.capacity();
        self.len -= n;
        Ok(())
    }

    /// Writable region starting at `head`, split at the wrap point.
    fn vacant_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        if self.is_full() {
            return (&mut [], &mut []);
        }
        if self.head >= self.tail {
            let (front, back) = self.data.split_at_mut(self.head);
            (back, &mut front[..self.tail])
        } else {
            (&mut self.data[self.head..self.tail], &mut [])
        }
    }

    /// Buffered region starting at `tail`, split at the wrap point.
    fn occupied(&self) -> (&[u8], &[u8]) {
        if self.is_empty() {
            return (&[], &[]);
        }
        if self.tail < self.head {
            (&self.data[self.tail..self.head], &[])
        } else {
            (&self.data[self.tail..], &self.data[..self.head])
        }
    }

    fn advance_head(&mut self, n: usize) {
        self.head = (self.head + n) % self.capacity();
        self.len += n;
    }
}

/// Duplex ring-buffered connection over a Unix stream socket.
#[derive(Debug)]
pub struct RingConnection {
    stream: UnixStream,
    inbound: RingBuffer,
    outbound: RingBuffer,
    interest: Readiness,
    interest_changed: bool,
}

impl RingConnection {
    /// Wrap a connected socket. The initial interest is `READABLE` and is
    /// reported once through [`take_interest_change`](Self::take_interest_change).
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            inbound: RingBuffer::new(RING_CAPACITY),
            outbound: RingBuffer::new(RING_CAPACITY),
            interest: Readiness::READABLE,
            interest_changed: true,
        }
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Unconsumed inbound bytes
    pub fn available(&self) -> usize {
        self.inbound.len()
    }

    /// Outbound bytes not yet handed to the kernel
    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Readiness the owner should wait for on this connection's socket.
    pub fn interest(&self) -> Readiness {
        self.interest
    }

    /// Returns the new interest if it changed since the last call.
    pub fn take_interest_change(&mut self) -> Option<Readiness> {
        if std::mem::take(&mut self.interest_changed) {
            Some(self.interest)
        } else {
            None
        }
    }

    /// Queue bytes for sending.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), RingError> {
        let was_empty = self.outbound.is_empty();
        self.outbound.push(bytes)?;
        if was_empty && !bytes.is_empty() {
            self.set_interest(Readiness::READABLE | Readiness::WRITABLE);
        }
        Ok(())
    }

    /// Copy the next `dest.len()` inbound bytes without consuming them.
    pub fn copy(&self, dest: &mut [u8]) -> Result<(), RingError> {
        self.inbound.peek(dest)
    }

    pub fn consume(&mut self, n: usize) -> Result<(), RingError> {
        self.inbound.consume(n)
    }

    /// Move bytes between the rings and the socket as `mask` permits.
    ///
    /// Returns the number of unconsumed inbound bytes. End of stream and
    /// syscall errors other than `EAGAIN`/`EINTR` are failures.
    pub fn service(&mut self, mask: Readiness) -> Result<usize, ConnectionError> {
        if mask.contains(Readiness::READABLE) {
            self.fill()?;
        }
        if mask.contains(Readiness::WRITABLE) {
            self.drain()?;
        }
        Ok(self.inbound.len())
    }

    /// Write as much queued output as the socket accepts right now.
    pub fn flush(&mut self) -> Result<(), ConnectionError> {
        self.service(Readiness::WRITABLE).map(|_| ())
    }

    fn fill(&mut self) -> Result<(), ConnectionError> {
        let (first, second) = self.inbound.vacant_mut();
        if first.is_empty() {
            trace!("inbound ring full, skipping read");
            return Ok(());
        }

        let count = if second.is_empty() { 1 } else { 2 };
        let mut iov = [IoSliceMut::new(first), IoSliceMut::new(second)];
        match uio::readv(&self.stream, &mut iov[..count]) {
            Ok(0) => {
                debug!("end of stream on fd {}", self.stream.as_raw_fd());
                Err(ConnectionError::Closed)
            }
            Ok(n) => {
                self.inbound.advance_head(n);
                Ok(())
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(ConnectionError::Read(e)),
        }
    }

    fn drain(&mut self) -> Result<(), ConnectionError> {
        let (first, second) = self.outbound.occupied();
        if !first.is_empty() {
            let count = if second.is_empty() { 1 } else { 2 };
            let iov = [IoSlice::new(first), IoSlice::new(second)];
            match uio::writev(&self.stream, &iov[..count]) {
                Ok(n) => self.outbound.consume(n)?,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                Err(e) => return Err(ConnectionError::Write(e)),
            }
        }

        if self.outbound.is_empty() {
            self.set_interest(Readiness::READABLE);
        }
        Ok(())
    }

    fn set_interest(&mut self, interest: Readiness) {
        if self.interest != interest {
            self.interest = interest;
            self.interest_changed = true;
        }
    }
}

impl AsRawFd for RingConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
