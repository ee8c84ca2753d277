//! Strata Buffer Backends
//!
//! A backend hands out pixel buffers that both the server and its clients
//! can reach by handle. The only backend shipped is shared memory; the
//! server advertises its name and arguments so clients can open the same
//! backend on their side.

pub mod heap;
pub mod layout;
pub mod segment;
pub mod shm;

use thiserror::Error;

pub use segment::{HeapSegment, MappedSegment, Segment};
pub use shm::{ShmBackend, ShmConfig, DEFAULT_SEGMENT_NAME, SHM_BACKEND_NAME};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no free buffer handles")]
    Exhausted,

    #[error("not enough buffer memory for {requested} bytes")]
    OutOfSpace { requested: usize },

    #[error("buffer handle {0} is out of range")]
    InvalidHandle(u32),

    #[error("buffer handle {0} is not allocated")]
    UnusedSlot(u32),

    #[error("invalid buffer geometry {width}x{height} stride {stride}")]
    InvalidSize { width: u32, height: u32, stride: u32 },

    #[error("{requested} bytes requested from a {len} byte buffer")]
    TooLarge { requested: usize, len: usize },

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("invalid segment size {0}")]
    InvalidSegmentSize(usize),

    #[error("corrupt segment: {0}")]
    Corrupt(&'static str),

    #[error("segment error: {0}")]
    Segment(#[from] nix::Error),
}

impl BackendError {
    /// Resource exhaustion, as opposed to a bad request.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::Exhausted | Self::OutOfSpace { .. })
    }
}

/// A buffer reference. Valid only against the backend that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub handle: u32,
}

impl Buffer {
    pub fn size(&self) -> usize {
        self.height as usize * self.stride as usize
    }
}

pub trait Backend {
    /// Name clients use to pick the matching backend
    fn name(&self) -> &str;

    /// Backend-specific arguments clients need to open it
    fn args(&self) -> &str;

    fn allocate(&mut self, width: u32, height: u32, stride: u32) -> Result<Buffer, BackendError>;

    /// Take another reference to a buffer allocated elsewhere.
    fn open(&mut self, handle: u32, width: u32, height: u32, stride: u32) -> Result<Buffer, BackendError>;

    /// Drop one reference; the memory is released with the last one.
    fn destroy(&mut self, buffer: Buffer) -> Result<(), BackendError>;

    fn read(&self, buffer: &Buffer, dest: &mut [u8]) -> Result<(), BackendError>;

    fn write(&mut self, buffer: &Buffer, src: &[u8]) -> Result<(), BackendError>;

    /// Allocate a buffer and fill it with `data`.
    fn create_buffer_from_data(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        data: &[u8],
    ) -> Result<Buffer, BackendError> {
        let buffer = self.allocate(width, height, stride)?;
        if let Err(e) = self.write(&buffer, data) {
            self.destroy(buffer)?;
            return Err(e);
        }
        Ok(buffer)
    }
}

/// Which end of the connection is opening a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates and formats the backing storage
    Server(ShmConfig),
    /// Opens storage the server advertised
    Client,
}

/// Open a backend by its advertised name.
pub fn open_backend(name: &str, args: &str, role: Role) -> Result<Box<dyn Backend>, BackendError> {
    match (name, role) {
        (SHM_BACKEND_NAME, Role::Server(config)) => {
            let segment = if args.is_empty() { DEFAULT_SEGMENT_NAME } else { args };
            Ok(Box::new(ShmBackend::create(segment, config)?))
        }
        (SHM_BACKEND_NAME, Role::Client) => Ok(Box::new(ShmBackend::open_existing(args)?)),
        _ => Err(BackendError::UnknownBackend(name.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_backend() {
        let Err(err) = open_backend("gem", "", Role::Client) else {
            panic!("unknown backend name was accepted");
        };
        assert!(matches!(err, BackendError::UnknownBackend(name) if name == "gem"));
    }

    #[test]
    fn test_factory_roles() {
        let name = format!("/strata-factory-{}", std::process::id());
        let config = ShmConfig { slots: 2, data_size: 1024 };
        let mut server = open_backend(SHM_BACKEND_NAME, &name, Role::Server(config)).unwrap();
        let mut client = open_backend(server.name(), server.args(), Role::Client).unwrap();

        let buffer = client.allocate(2, 2, 8).unwrap();
        client.write(&buffer, &[5; 16]).unwrap();
        let opened = server.open(buffer.handle, 2, 2, 8).unwrap();
        let mut out = [0u8; 16];
        server.read(&opened, &mut out).unwrap();
        assert_eq!(out, [5; 16]);

        // A second server cannot claim the same name.
        assert!(open_backend(SHM_BACKEND_NAME, &name, Role::Server(config)).is_err());
    }

    #[test]
    fn test_exhaustion_classification() {
        assert!(BackendError::Exhausted.is_exhaustion());
        assert!(BackendError::OutOfSpace { requested: 1 }.is_exhaustion());
        assert!(!BackendError::UnusedSlot(3).is_exhaustion());
    }
}
