//! Backing memory for the shared-memory backend

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::ftruncate;
use tracing::{debug, warn};

use crate::BackendError;

/// A contiguous byte region holding a formatted segment.
pub trait Segment {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// Process-private segment, for tests and headless runs.
#[derive(Debug, Clone)]
pub struct HeapSegment {
    bytes: Vec<u8>,
}

impl HeapSegment {
    pub fn new(len: usize) -> Self {
        Self { bytes: vec![0; len] }
    }
}

impl Segment for HeapSegment {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// A POSIX shared-memory object mapped read/write.
///
/// The creating side owns the name and unlinks it when dropped.
#[derive(Debug)]
pub struct MappedSegment {
    name: String,
    ptr: NonNull<c_void>,
    len: usize,
    owner: bool,
    _fd: OwnedFd,
}

impl MappedSegment {
    /// Create and map a new object of `len` bytes. Fails if `name` exists.
    pub fn create(name: &str, len: usize) -> Result<Self, BackendError> {
        let size = NonZeroUsize::new(len).ok_or(BackendError::InvalidSegmentSize(len))?;
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;

        let mapped = ftruncate(&fd, len as i64).and_then(|_| Self::map(&fd, size));
        match mapped {
            Ok(ptr) => {
                debug!("created shared segment {} ({} bytes)", name, len);
                Ok(Self { name: name.to_owned(), ptr, len, owner: true, _fd: fd })
            }
            Err(e) => {
                let _ = shm_unlink(name);
                Err(e.into())
            }
        }
    }

    /// Map an object created by another process.
    pub fn open(name: &str) -> Result<Self, BackendError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())?;
        let len = fstat(&fd)?.st_size as usize;
        let size = NonZeroUsize::new(len).ok_or(BackendError::InvalidSegmentSize(len))?;
        let ptr = Self::map(&fd, size)?;
        debug!("mapped shared segment {} ({} bytes)", name, len);
        Ok(Self { name: name.to_owned(), ptr, len, owner: false, _fd: fd })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn map(fd: &OwnedFd, size: NonZeroUsize) -> nix::Result<NonNull<c_void>> {
        // SAFETY: a fresh shared mapping of an object we hold open; nothing
        // else in this process aliases it.
        unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
    }
}

impl Segment for MappedSegment {
    fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is `len` bytes and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes the borrow unique in this process.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe the mapping created in `map`.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("failed to unmap segment {}: {}", self.name, e);
        }
        if self.owner {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                warn!("failed to unlink segment {}: {}", self.name, e);
            }
        }
    }
}
