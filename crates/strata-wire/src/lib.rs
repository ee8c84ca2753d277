//! Strata Wire Protocol
//!
//! The protocol engine shared by the display server and its clients:
//! ring-buffered socket connections, the wire codec, interface tables,
//! the object registry with its dispatch table, and the event loop.

pub mod codec;
pub mod dispatch;
pub mod error;
pub mod event_loop;
pub mod handshake;
pub mod interface;
pub mod protocol;
pub mod registry;
pub mod ring;

use bitflags::bitflags;

pub use codec::{Arg, ArgCursor, ArgKind, MessageHeader, HEADER_SIZE, MAX_ARGS, MAX_MESSAGE_SIZE};
pub use dispatch::{DispatchTable, Handler, Resolved};
pub use error::{
    ConnectionError, DecodeError, EncodeError, FramingError, LoopError, RegistryError,
    RequestError, RingError,
};
pub use event_loop::{EventLoop, ShutdownToken, SourceId};
pub use handshake::{Global, Handshake};
pub use interface::{Interface, MessageDesc};
pub use registry::{Object, ObjectRegistry};
pub use ring::{RingBuffer, RingConnection, RING_CAPACITY};

/// Default abstract socket name
pub const SOCKET_NAME: &str = "wayland";

bitflags! {
    /// Socket readiness, used both as an interest mask and as a report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Readiness: u32 {
        const READABLE = 0x01;
        const WRITABLE = 0x02;
    }
}
