//! Error types for the protocol core
//!
//! Transport failures (`ConnectionError`) are fatal to one connection.
//! Everything else is local to a single message and recoverable.

use thiserror::Error;

/// Ring buffer misuse: the caller asked for more than fits or more than is buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring overflow: {requested} bytes requested, {free} free")]
    Overflow { requested: usize, free: usize },

    #[error("ring underflow: {requested} bytes requested, {available} buffered")]
    Underflow { requested: usize, available: usize },
}

/// A transport failure on a socket-backed connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("peer closed the connection")]
    Closed,

    #[error("read failed: {0}")]
    Read(#[source] nix::Error),

    #[error("write failed: {0}")]
    Write(#[source] nix::Error),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("socket setup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A message header the receiver cannot frame.
///
/// After one of these the byte stream can no longer be split into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("declared message size {0} is smaller than the header")]
    TooSmall(u16),

    #[error("declared message size {0} is not 4-byte aligned")]
    Misaligned(u16),

    #[error("declared message size {size} exceeds the {max} byte scratch buffer")]
    TooLarge { size: u16, max: usize },
}

/// Failure to serialize a request or event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("unknown type tag '{0}'")]
    UnknownTag(char),

    #[error("argument {index} does not match tag '{expected}' (got '{found}')")]
    SignatureMismatch { index: usize, expected: char, found: char },

    #[error("signature has {expected} arguments, {found} supplied")]
    ArgumentCount { expected: usize, found: usize },

    #[error("too many arguments ({0})")]
    TooManyArgs(usize),

    #[error("message of {0} bytes does not fit the wire format")]
    TooLarge(usize),

    #[error("unknown object {0}")]
    UnknownObject(u32),

    #[error("object {0} already exists")]
    DuplicateId(u32),

    #[error(transparent)]
    Ring(#[from] RingError),
}

/// Failure to decode a buffered message.
///
/// The message's bytes have always been consumed by the time one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown type tag '{0}'")]
    UnknownTag(char),

    #[error("too many arguments ({0})")]
    TooManyArgs(usize),

    #[error("payload truncated at argument {index}")]
    Truncated { index: usize },

    #[error("{0} trailing bytes after the last argument")]
    TrailingBytes(usize),

    #[error("string argument {index} is not valid UTF-8")]
    InvalidUtf8 { index: usize },

    #[error("unknown object {0}")]
    UnknownObject(u32),

    #[error("object {0} already exists")]
    DuplicateId(u32),

    #[error("argument {index} missing")]
    MissingArgument { index: usize },

    #[error("argument {index} has tag '{found}', expected '{expected}'")]
    ArgumentType { index: usize, expected: char, found: char },

    #[error(transparent)]
    Ring(#[from] RingError),
}

/// Object registry bookkeeping errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("object {0} already registered")]
    DuplicateId(u32),

    #[error("object {0} not registered")]
    NotFound(u32),

    #[error("interface {interface} declares {expected} requests, handler table has {found}")]
    HandlerCount {
        interface: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Outcome of a request that could not be carried out.
///
/// Each variant maps onto one of the display's error events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("invalid object {0}")]
    InvalidObject(u32),

    #[error("invalid opcode {opcode} for object {object}")]
    InvalidMethod { object: u32, opcode: u16 },

    #[error("out of memory")]
    NoMemory,

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Event loop failure.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("poll failed: {0}")]
    Poll(#[source] nix::Error),

    #[error("failed to create wake-up channel: {0}")]
    Wake(#[source] nix::Error),
}
